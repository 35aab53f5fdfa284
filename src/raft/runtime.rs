use std::future;
use std::time::Duration;

use ::log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};

use super::{RaftError, RaftNode, State};
use crate::membership::{Inbox, MembershipEvent};

pub(crate) type ShutdownRequest = oneshot::Sender<Result<(), RaftError>>;

enum Event {
    Message(Vec<u8>),
    Membership(MembershipEvent),
    Timeout,
    Tick,
    Retry,
    Shutdown(ShutdownRequest),
}

/// Event loop driving one [`RaftNode`]. Each state has its own handler; the
/// loop dispatches on the current state after every event.
pub(crate) struct Runtime {
    node: RaftNode,
    inbox: Inbox,
    shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    pending_shutdown: Option<ShutdownRequest>,
}

impl Runtime {
    pub fn new(node: RaftNode, inbox: Inbox, shutdown_rx: mpsc::Receiver<ShutdownRequest>) -> Self {
        Self {
            node,
            inbox,
            shutdown_rx,
            pending_shutdown: None,
        }
    }

    pub async fn run(mut self) {
        debug!("Event loop of {} started", self.node.id());
        loop {
            match self.node.state() {
                State::Bootstrap => self.run_bootstrap().await,
                State::Rejoin => self.run_rejoin().await,
                State::Follower | State::PreCandidate | State::Candidate | State::Leader => {
                    self.run_member().await
                }
                State::PreShutdown => self.node.run_pre_shutdown(),
                State::Shutdown => {
                    self.run_shutdown();
                    break;
                }
            }
        }
        debug!("Event loop of {} stopped", self.node.id());
    }

    async fn run_bootstrap(&mut self) {
        let retry = self.node.timing().bootstrap_retry;
        match self.next_event(Some(retry)).await {
            Event::Membership(event) => self.node.handle_membership_event(event),
            Event::Retry => self.node.on_bootstrap_retry(),
            Event::Message(bytes) => self.node.handle_bytes(&bytes),
            Event::Shutdown(request) => self.begin_shutdown(request),
            Event::Timeout | Event::Tick => {}
        }
    }

    async fn run_rejoin(&mut self) {
        let retry = self.node.timing().rejoin_retry;
        match self.next_event(Some(retry)).await {
            Event::Membership(event) => self.node.handle_membership_event(event),
            Event::Retry => self.node.on_rejoin_retry(),
            Event::Message(bytes) => self.node.handle_bytes(&bytes),
            Event::Shutdown(request) => self.begin_shutdown(request),
            Event::Timeout | Event::Tick => {}
        }
    }

    /// Follower, PreCandidate, Candidate and Leader share one loop; the node
    /// dispatches messages and timers by its state.
    async fn run_member(&mut self) {
        match self.next_event(None).await {
            Event::Message(bytes) => self.node.handle_bytes(&bytes),
            Event::Membership(event) => self.node.handle_membership_event(event),
            Event::Timeout => self.node.on_timeout(),
            Event::Tick => self.node.on_tick(),
            Event::Shutdown(request) => self.begin_shutdown(request),
            Event::Retry => {}
        }
    }

    fn begin_shutdown(&mut self, request: ShutdownRequest) {
        info!("Shutdown of {} requested", self.node.id());
        self.pending_shutdown = Some(request);
        self.node.to_pre_shutdown();
    }

    fn run_shutdown(&mut self) {
        let result = self.node.run_shutdown();
        match self.pending_shutdown.take() {
            Some(reply) => {
                if reply.send(result).is_err() {
                    warn!("Shutdown caller went away before completion");
                }
            }
            None => {
                if let Err(e) = result {
                    error!("{e}");
                }
            }
        }
    }

    async fn next_event(&mut self, retry: Option<Duration>) -> Event {
        let timeout = self.node.timeout_deadline();
        let tick = self.node.tick_deadline();

        tokio::select! {
            Some(request) = self.shutdown_rx.recv() => Event::Shutdown(request),
            Some(bytes) = self.inbox.messages.recv() => Event::Message(bytes),
            Some(event) = self.inbox.events.recv() => Event::Membership(event),
            _ = wait_until(timeout) => Event::Timeout,
            _ = wait_until(tick) => Event::Tick,
            _ = wait_for(retry) => Event::Retry,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn wait_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => future::pending().await,
    }
}
