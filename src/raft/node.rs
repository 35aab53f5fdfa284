use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ::log::{debug, error, info, warn};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use super::quorum::majority;
use super::{
    HeartbeatTracker, Quorum, RaftError, RaftMessage, State, Status, Timing, VoteTracker,
};
use crate::config::Config;
use crate::membership::{Membership, MembershipEvent};
use crate::storage::StateFile;

struct Ticker {
    period: Duration,
    next: Instant,
}

/// Election and lifecycle state machine of one node.
///
/// All methods run to completion without awaiting. The event loop in
/// `runtime` owns the node exclusively and feeds it one event at a time.
pub struct RaftNode {
    // Node identity
    id: String,
    config: Config,
    timing: Timing,

    // Election state
    state: State,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    quorum: Quorum,
    last_leader_contact: Option<Instant>,

    pre_votes: VoteTracker,
    votes: VoteTracker,
    heartbeats: HeartbeatTracker,

    // Timers
    timeout: Option<Instant>,
    ticker: Option<Ticker>,

    // Cluster
    membership: Arc<dyn Membership>,
    state_file: StateFile,
    peers: Vec<String>,
    rejoin_queue: VecDeque<String>,

    bootstrapped: Option<oneshot::Sender<()>>,
    status: watch::Sender<Status>,
}

impl RaftNode {
    /// Creates a node in the Bootstrap state with all timers stopped. The
    /// returned receiver resolves once bootstrap or rejoin has completed.
    pub fn new(
        config: Config,
        membership: Arc<dyn Membership>,
        state_file: StateFile,
    ) -> (Self, oneshot::Receiver<()>, watch::Receiver<Status>) {
        let (bootstrap_tx, bootstrap_rx) = oneshot::channel();
        // The first quorum comes from the number of nodes we expect to see.
        let quorum = Quorum::for_cluster_size(config.expect);
        let (status_tx, status_rx) = watch::channel(Status {
            state: State::Bootstrap,
            term: 0,
            leader: None,
            quorum: quorum.size(),
        });

        let node = Self {
            id: config.id.clone(),
            timing: Timing::from_config(&config),
            peers: config.peer_list.clone(),
            config,
            state: State::Bootstrap,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            quorum,
            last_leader_contact: None,
            pre_votes: VoteTracker::new(),
            votes: VoteTracker::new(),
            heartbeats: HeartbeatTracker::new(),
            timeout: None,
            ticker: None,
            membership,
            state_file,
            rejoin_queue: VecDeque::new(),
            bootstrapped: Some(bootstrap_tx),
            status: status_tx,
        };

        (node, bootstrap_rx, status_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn quorum(&self) -> usize {
        self.quorum.size()
    }

    pub fn pre_votes(&self) -> &VoteTracker {
        &self.pre_votes
    }

    pub fn votes(&self) -> &VoteTracker {
        &self.votes
    }

    pub fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.timeout
    }

    pub fn tick_deadline(&self) -> Option<Instant> {
        self.ticker.as_ref().map(|t| t.next)
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Waits for `expect` members before the first election. A node expected
    /// to run alone resolves immediately.
    pub fn to_bootstrap(&mut self) {
        self.state = State::Bootstrap;
        self.stop_timeout();
        self.stop_ticker();
        self.heartbeats.stop();
        self.publish();
        info!(
            "{}/{} nodes for bootstrap...",
            self.membership.members().len(),
            self.config.expect
        );

        if self.config.expect == 1 {
            info!("Successfully bootstrapped cluster");
            self.save_state();

            // Without peers nobody else can claim leadership. With peers, two
            // nodes leaping to leader at once would be possible, so go through
            // a regular election instead.
            if self.peers.is_empty() {
                self.to_leader();
            } else {
                info!(
                    "Expecting 1 node, but found {} peers. Going through full leader election cycle...",
                    self.peers.len()
                );
                self.to_follower(0);
                self.try_join();
            }

            self.print_members();
            self.signal_bootstrapped();
            return;
        }

        self.try_join();
    }

    /// Startup path after an unclean exit: rejoin through the members recorded
    /// in the persisted snapshot, one at a time.
    pub fn to_rejoin(&mut self, peers: Vec<String>) {
        self.state = State::Rejoin;
        self.stop_timeout();
        self.stop_ticker();
        self.publish();
        info!(
            "Found persisted state, rejoining via {} known members",
            peers.len()
        );

        if !peers.is_empty() {
            self.peers = peers.clone();
        }
        self.rejoin_queue = peers.into();
        self.try_next_rejoin_peer();
    }

    /// Calling this on a follower only resets its timeout.
    pub fn to_follower(&mut self, term: u64) {
        let term = term.max(self.current_term);
        info!("Entering follower state for term {term}");

        if self.state == State::Leader {
            self.heartbeats.stop();
        }
        self.reset_timeout();
        self.stop_ticker();

        if term != self.current_term || self.state != State::Follower {
            self.leader_id = None;
        }
        if term != self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = State::Follower;
        self.publish();
    }

    /// Canvasses the cluster for the next term without touching the current one.
    pub fn to_pre_candidate(&mut self) {
        info!(
            "Entering precandidate state for term {}",
            self.current_term + 1
        );
        self.state = State::PreCandidate;
        self.leader_id = None;
        self.pre_votes.begin_cycle(self.other_members());
        self.reset_timeout();
        self.start_ticker();
        self.publish();

        self.broadcast(&RaftMessage::PreVoteRequest {
            term: self.current_term + 1,
            candidate_id: self.id.clone(),
        });

        let live = self.live_members();
        if self.quorum_reached(self.pre_votes.granted_by(&live), live.len()) {
            self.pre_votes.reach();
            self.to_candidate();
        }
    }

    pub fn to_candidate(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.state = State::Candidate;
        info!("Entering candidate state for term {}", self.current_term);

        self.votes.begin_cycle(self.other_members());
        self.reset_timeout();
        self.start_ticker();
        self.publish();

        self.broadcast(&RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
        });

        let live = self.live_members();
        if self.quorum_reached(self.votes.granted_by(&live), live.len()) {
            self.votes.reach();
            self.to_leader();
        }
    }

    pub fn to_leader(&mut self) {
        info!("Entering leader state for term {}", self.current_term);
        self.state = State::Leader;
        self.leader_id = Some(self.id.clone());
        if self.voted_for.is_none() {
            self.voted_for = Some(self.id.clone());
        }
        self.stop_timeout();
        self.heartbeats.stop();
        self.start_ticker();
        self.publish();

        self.send_heartbeat();
    }

    pub fn to_pre_shutdown(&mut self) {
        info!("Preparing {} to leave the cluster", self.id);
        self.state = State::PreShutdown;
        self.stop_timeout();
        self.stop_ticker();
        self.heartbeats.stop();
        self.publish();
    }

    /// Persists the final member list and tells the others which quorum to
    /// use once this node is gone.
    pub fn run_pre_shutdown(&mut self) {
        self.save_state();

        let remaining = self.membership.members().len().saturating_sub(1);
        let quorum = majority(remaining);
        debug!("Announcing quorum {quorum} for {remaining} remaining members");
        self.broadcast(&RaftMessage::NewQuorum {
            sender_id: self.id.clone(),
            quorum,
        });

        self.to_shutdown();
    }

    fn to_shutdown(&mut self) {
        info!("Shutting down {}...", self.id);
        self.state = State::Shutdown;
        self.publish();
    }

    /// Leaves the cluster and releases the transport. Every step runs even if
    /// an earlier one failed; failures are reported together.
    pub fn run_shutdown(&mut self) -> Result<(), RaftError> {
        self.stop_timeout();
        self.stop_ticker();

        let mut errors = Vec::new();
        if let Err(e) = self.membership.leave(self.timing.leave_timeout) {
            errors.push(format!("leave: {e}"));
        }
        if let Err(e) = self.membership.shutdown_transport() {
            errors.push(format!("transport shutdown: {e}"));
        }
        if let Err(e) = self.state_file.delete() {
            errors.push(format!("state file: {e}"));
        }

        if !errors.is_empty() {
            error!("Found errors during shutdown: {}", errors.join("; "));
            return Err(RaftError::Shutdown(errors));
        }
        info!("Shutdown successful");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn handle_bytes(&mut self, bytes: &[u8]) {
        match RaftMessage::decode(bytes) {
            Ok(message) => self.handle_message(message),
            Err(e) => error!("Error while decoding message: {e}"),
        }
    }

    pub fn handle_message(&mut self, message: RaftMessage) {
        if !self.state.is_member() {
            debug!(
                "Discarding {} from {} while in {} state",
                message.kind(),
                message.sender(),
                self.state
            );
            return;
        }

        let Some(term) = message.term() else {
            if let RaftMessage::NewQuorum { sender_id, quorum } = message {
                info!("{sender_id} is leaving, adopting quorum {quorum}");
                self.quorum.set(quorum);
                self.publish();
            }
            return;
        };

        if term < self.current_term {
            warn!(
                "Discarding stale {} from {} (term {term} < {})",
                message.kind(),
                message.sender(),
                self.current_term
            );
            self.refuse_stale(&message);
            return;
        }

        if term > self.current_term && Self::carries_authority(&message) {
            info!(
                "Received {} from {} with higher term {term}",
                message.kind(),
                message.sender()
            );
            self.to_follower(term);
        }

        match self.state {
            State::Follower => self.follower_message(message),
            State::PreCandidate => self.pre_candidate_message(term, message),
            State::Candidate => self.candidate_message(term, message),
            State::Leader => self.leader_message(message),
            _ => {}
        }
    }

    pub fn handle_membership_event(&mut self, event: MembershipEvent) {
        debug!("Membership event in {} state: {:?}", self.state, event);
        match self.state {
            State::Bootstrap => {
                self.print_members();
                self.save_state();
                self.check_bootstrap();
            }
            State::Rejoin => {
                self.save_state();
                if self.membership.members().len() > 1 {
                    info!("Rejoin confirmed by {}", event.member().id);
                    self.complete_rejoin();
                }
            }
            State::PreShutdown | State::Shutdown => {}
            _ => self.save_state(),
        }
    }

    /// Randomized timeout elapsed.
    pub fn on_timeout(&mut self) {
        self.timeout = None;
        match self.state {
            State::Follower => {
                debug!("Heartbeat timeout elapsed");
                self.to_pre_candidate();
            }
            State::PreCandidate => {
                let missed = self.pre_votes.miss();
                info!(
                    "Prevote cycle for term {} ended without quorum ({missed} in a row)",
                    self.current_term + 1
                );
                self.to_follower(self.current_term);
            }
            State::Candidate => {
                let missed = self.votes.miss();
                info!(
                    "Election for term {} ended without quorum ({missed} in a row)",
                    self.current_term
                );
                self.to_follower(self.current_term);
            }
            _ => {}
        }
    }

    /// Periodic ticker fired.
    pub fn on_tick(&mut self) {
        match self.state {
            State::Leader => self.heartbeat_cycle(),
            State::PreCandidate => {
                let request = RaftMessage::PreVoteRequest {
                    term: self.current_term + 1,
                    candidate_id: self.id.clone(),
                };
                self.re_ask(self.pre_votes.pending().iter().cloned().collect(), &request);
            }
            State::Candidate => {
                let request = RaftMessage::VoteRequest {
                    term: self.current_term,
                    candidate_id: self.id.clone(),
                };
                self.re_ask(self.votes.pending().iter().cloned().collect(), &request);
            }
            _ => self.stop_ticker(),
        }

        let now = Instant::now();
        if let Some(ticker) = self.ticker.as_mut() {
            if ticker.next <= now {
                ticker.next = now + ticker.period;
            }
        }
    }

    /// Bootstrap made no progress for a while: knock on the peers again.
    pub fn on_bootstrap_retry(&mut self) {
        if self.state != State::Bootstrap {
            return;
        }
        self.try_join();
        self.check_bootstrap();
    }

    pub fn on_rejoin_retry(&mut self) {
        if self.state == State::Rejoin {
            self.try_next_rejoin_peer();
        }
    }

    // ---------------------------------------------------------------------
    // Per-state message handling
    // ---------------------------------------------------------------------

    fn follower_message(&mut self, message: RaftMessage) {
        match message {
            RaftMessage::Heartbeat {
                leader_id,
                heartbeat_id,
                ..
            } => self.accept_heartbeat(leader_id, heartbeat_id),
            RaftMessage::PreVoteRequest { term, candidate_id } => {
                self.answer_pre_vote(term, &candidate_id)
            }
            RaftMessage::VoteRequest { candidate_id, .. } => {
                self.answer_vote(&candidate_id);
            }
            other => debug!("Received {} as follower, discarding", other.kind()),
        }
    }

    fn pre_candidate_message(&mut self, term: u64, message: RaftMessage) {
        if matches!(message, RaftMessage::Heartbeat { .. }) {
            info!("A leader exists for term {term}, abandoning prevote");
            self.to_follower(term);
            return self.handle_message(message);
        }

        match message {
            RaftMessage::PreVoteResponse {
                voter_id, granted, ..
            } => self.tally_pre_vote(&voter_id, granted),
            RaftMessage::PreVoteRequest { term, candidate_id } => {
                self.answer_pre_vote(term, &candidate_id)
            }
            RaftMessage::VoteRequest { candidate_id, .. } => {
                if self.answer_vote(&candidate_id) {
                    self.to_follower(self.current_term);
                }
            }
            other => debug!("Received {} as precandidate, discarding", other.kind()),
        }
    }

    fn candidate_message(&mut self, term: u64, message: RaftMessage) {
        if matches!(message, RaftMessage::Heartbeat { .. }) {
            info!("Another node won the election for term {term}");
            self.to_follower(term);
            return self.handle_message(message);
        }

        match message {
            RaftMessage::VoteResponse {
                voter_id, granted, ..
            } => self.tally_vote(&voter_id, granted),
            RaftMessage::VoteRequest { candidate_id, .. } => {
                self.answer_vote(&candidate_id);
            }
            RaftMessage::PreVoteRequest { term, candidate_id } => {
                self.answer_pre_vote(term, &candidate_id)
            }
            other => debug!("Received {} as candidate, discarding", other.kind()),
        }
    }

    fn leader_message(&mut self, message: RaftMessage) {
        match message {
            RaftMessage::HeartbeatAck {
                follower_id,
                heartbeat_id,
                ..
            } => {
                if !self.heartbeats.record_ack(heartbeat_id, &follower_id) {
                    debug!("Ignoring ack {heartbeat_id} from {follower_id}");
                }
            }
            RaftMessage::Heartbeat { leader_id, .. } => warn!(
                "Received heartbeat from {leader_id} for our own term {}, ignoring",
                self.current_term
            ),
            RaftMessage::PreVoteRequest { term, candidate_id } => {
                self.answer_pre_vote(term, &candidate_id)
            }
            RaftMessage::VoteRequest { candidate_id, .. } => {
                self.answer_vote(&candidate_id);
            }
            other => debug!("Received {} as leader, discarding", other.kind()),
        }
    }

    // ---------------------------------------------------------------------
    // Protocol details
    // ---------------------------------------------------------------------

    /// Whether a higher term in this message proves a newer election happened.
    /// Prevote requests and granted prevotes only carry a proposed term.
    fn carries_authority(message: &RaftMessage) -> bool {
        match message {
            RaftMessage::PreVoteRequest { .. } => false,
            RaftMessage::PreVoteResponse { granted, .. } => !granted,
            _ => true,
        }
    }

    fn refuse_stale(&self, message: &RaftMessage) {
        let reply = match message {
            RaftMessage::PreVoteRequest { .. } => RaftMessage::PreVoteResponse {
                term: self.current_term,
                voter_id: self.id.clone(),
                granted: false,
            },
            RaftMessage::VoteRequest { .. } => RaftMessage::VoteResponse {
                term: self.current_term,
                voter_id: self.id.clone(),
                granted: false,
            },
            _ => return,
        };
        self.send(message.sender(), &reply);
    }

    fn accept_heartbeat(&mut self, leader_id: String, heartbeat_id: u64) {
        if self.leader_id.as_deref() != Some(leader_id.as_str()) {
            info!(
                "Following {leader_id} as leader for term {}",
                self.current_term
            );
            self.leader_id = Some(leader_id.clone());
            self.publish();
        }
        self.last_leader_contact = Some(Instant::now());
        self.reset_timeout();

        self.send(
            &leader_id,
            &RaftMessage::HeartbeatAck {
                term: self.current_term,
                follower_id: self.id.clone(),
                heartbeat_id,
            },
        );
    }

    fn can_vote_for(&self, candidate: &str) -> bool {
        self.voted_for.as_deref().map_or(true, |v| v == candidate)
    }

    /// Grants a prevote only for a term at least as new as ours, and only when
    /// no live leader has been heard from within the minimum timeout.
    fn answer_pre_vote(&self, term: u64, candidate: &str) {
        let leader_alive = self.state == State::Leader
            || self
                .last_leader_contact
                .is_some_and(|at| at.elapsed() < self.timing.leader_contact_window);
        let fresh = term > self.current_term
            || (term == self.current_term && self.can_vote_for(candidate));
        let granted = fresh && !leader_alive;

        debug!(
            "Prevote for {candidate} at term {term}: {}",
            if granted { "granted" } else { "refused" }
        );
        self.send(
            candidate,
            &RaftMessage::PreVoteResponse {
                term: if granted { term } else { self.current_term },
                voter_id: self.id.clone(),
                granted,
            },
        );
    }

    /// First come, first served: one vote per term.
    fn answer_vote(&mut self, candidate: &str) -> bool {
        let granted = self.can_vote_for(candidate);
        if granted {
            self.voted_for = Some(candidate.to_string());
            if self.state == State::Follower {
                self.reset_timeout();
            }
        }

        debug!(
            "Vote for {candidate} at term {}: {}",
            self.current_term,
            if granted { "granted" } else { "refused" }
        );
        self.send(
            candidate,
            &RaftMessage::VoteResponse {
                term: self.current_term,
                voter_id: self.id.clone(),
                granted,
            },
        );
        granted
    }

    fn tally_pre_vote(&mut self, voter: &str, granted: bool) {
        if !self.pre_votes.record(voter, granted) {
            return;
        }
        let live = self.live_members();
        if self.quorum_reached(self.pre_votes.granted_by(&live), live.len()) {
            self.pre_votes.reach();
            self.to_candidate();
        }
    }

    fn tally_vote(&mut self, voter: &str, granted: bool) {
        if !self.votes.record(voter, granted) {
            return;
        }
        let live = self.live_members();
        if self.quorum_reached(self.votes.granted_by(&live), live.len()) {
            self.votes.reach();
            self.to_leader();
        }
    }

    /// Evaluates the round that just ended, then opens the next one. Acks
    /// from members that dropped out of the view since the round opened do
    /// not count.
    fn heartbeat_cycle(&mut self) {
        if self.heartbeats.in_flight() {
            let live = self.live_members();
            let acks = self.heartbeats.close_round(&live);
            if self.quorum_reached(acks, live.len()) {
                self.heartbeats.reach();
            } else {
                let missed = self.heartbeats.miss();
                let tolerated = self.timing.max_sub_quorum_cycles;
                if missed > tolerated {
                    warn!("Heartbeat quorum missed {missed} cycles in a row, stepping down");
                    self.to_follower(self.current_term);
                    return;
                }
                warn!("Heartbeat quorum missed ({missed}/{tolerated} tolerated)");
            }
        }
        self.send_heartbeat();
    }

    fn send_heartbeat(&mut self) {
        let heartbeat_id = self.heartbeats.next_round();
        self.broadcast(&RaftMessage::Heartbeat {
            term: self.current_term,
            leader_id: self.id.clone(),
            heartbeat_id,
        });
    }

    fn re_ask(&self, pending: Vec<String>, request: &RaftMessage) {
        for member in pending {
            self.send(&member, request);
        }
    }

    /// Compares against the stored quorum and recomputes it from the live
    /// member count only on success.
    fn quorum_reached(&mut self, votes: usize, live: usize) -> bool {
        let what = match self.state {
            State::PreCandidate => "prevotes",
            State::Candidate => "votes",
            _ => "heartbeat responses",
        };
        let required = self.quorum.size();

        if !self.quorum.reached(votes, live) {
            debug!(
                "Couldn't reach {} quorum: not enough {what} ({votes}/{required})",
                self.state
            );
            return false;
        }
        debug!("{} quorum reached: ({votes}/{required})", self.state);
        self.publish();
        true
    }

    // ---------------------------------------------------------------------
    // Bootstrap and rejoin
    // ---------------------------------------------------------------------

    fn check_bootstrap(&mut self) {
        let members = self.membership.members().len();
        debug!("{members}/{} nodes for bootstrap...", self.config.expect);
        if members < self.config.expect {
            return;
        }

        info!("Successfully bootstrapped cluster");
        self.save_state();
        self.to_follower(0);
        self.print_members();
        self.signal_bootstrapped();
    }

    fn try_join(&self) {
        if self.peers.is_empty() {
            return;
        }
        debug!("Trying to join existing cluster via peers...");
        match self.membership.join(&self.peers) {
            Ok(n) => debug!("{n} peers are currently available"),
            Err(e) => error!("Failed to join cluster: {e}. Trying again..."),
        }
    }

    fn try_next_rejoin_peer(&mut self) {
        let Some(peer) = self.rejoin_queue.pop_front() else {
            warn!("Could not rejoin via any persisted member, falling back to bootstrap");
            self.to_bootstrap();
            return;
        };

        match self.membership.join(std::slice::from_ref(&peer)) {
            Ok(n) if n > 0 => {
                info!("Rejoined cluster via {peer}");
                self.complete_rejoin();
            }
            Ok(_) => debug!("{peer} did not answer the rejoin attempt"),
            Err(e) => warn!("Failed to rejoin via {peer}: {e}"),
        }
    }

    fn complete_rejoin(&mut self) {
        self.save_state();
        // Term 0: the cluster's real term arrives with the next heartbeat.
        self.to_follower(0);
        self.print_members();
        self.signal_bootstrapped();
    }

    fn signal_bootstrapped(&mut self) {
        if let Some(tx) = self.bootstrapped.take() {
            let _ = tx.send(());
        }
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    fn live_members(&self) -> BTreeSet<String> {
        self.membership
            .members()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    fn other_members(&self) -> Vec<String> {
        self.membership
            .members()
            .into_iter()
            .map(|m| m.id)
            .filter(|id| *id != self.id)
            .collect()
    }

    fn send(&self, to: &str, message: &RaftMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {}: {e}", message.kind());
                return;
            }
        };
        if let Err(e) = self.membership.send(to, bytes) {
            warn!("Failed to send {} to {to}: {e}", message.kind());
        }
    }

    fn broadcast(&self, message: &RaftMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {}: {e}", message.kind());
                return;
            }
        };
        if let Err(e) = self.membership.broadcast(bytes) {
            warn!("Failed to broadcast {}: {e}", message.kind());
        }
    }

    fn save_state(&self) {
        if let Err(e) = self.state_file.save(&self.membership.members()) {
            error!("Failed to persist membership: {e}");
        }
    }

    fn print_members(&self) {
        let members = self.membership.members();
        info!("The cluster has currently {} members:", members.len());
        for member in members {
            info!("- {} [{}]", member.id, member.address);
        }
    }

    fn reset_timeout(&mut self) {
        self.timeout = Some(Instant::now() + self.timing.random_timeout());
    }

    fn stop_timeout(&mut self) {
        self.timeout = None;
    }

    fn start_ticker(&mut self) {
        let period = self.timing.ticker_interval;
        self.ticker = Some(Ticker {
            period,
            next: Instant::now() + period,
        });
    }

    fn stop_ticker(&mut self) {
        self.ticker = None;
    }

    fn publish(&self) {
        self.status.send_replace(Status {
            state: self.state,
            term: self.current_term,
            leader: self.leader_id.clone(),
            quorum: self.quorum.size(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Member, MembershipError};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct MockMembership {
        id: String,
        members: Mutex<Vec<Member>>,
        sent: Mutex<Vec<(String, RaftMessage)>>,
        join_ok: bool,
    }

    impl Membership for MockMembership {
        fn local_id(&self) -> &str {
            &self.id
        }

        fn members(&self) -> Vec<Member> {
            self.members.lock().unwrap().clone()
        }

        fn join(&self, peers: &[String]) -> Result<usize, MembershipError> {
            if self.join_ok {
                Ok(peers.len())
            } else {
                Err(MembershipError::NoPeersReachable(peers.to_vec()))
            }
        }

        fn leave(&self, _timeout: Duration) -> Result<(), MembershipError> {
            Ok(())
        }

        fn shutdown_transport(&self) -> Result<(), MembershipError> {
            Ok(())
        }

        fn send(&self, member_id: &str, message: Vec<u8>) -> Result<(), MembershipError> {
            let msg = RaftMessage::decode(&message).expect("node sends valid messages");
            self.sent.lock().unwrap().push((member_id.to_string(), msg));
            Ok(())
        }

        fn health_score(&self) -> usize {
            0
        }
    }

    impl MockMembership {
        fn take_sent(&self) -> Vec<(String, RaftMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    struct Harness {
        node: RaftNode,
        net: Arc<MockMembership>,
        bootstrapped: oneshot::Receiver<()>,
        _status: watch::Receiver<Status>,
        dir: TempDir,
    }

    fn harness(ids: &[&str], expect: usize, peers: &[&str], join_ok: bool) -> Harness {
        let dir = tempdir().expect("tempdir");
        let mut config = Config::new("n1");
        config.expect = expect;
        config.peer_list = peers.iter().map(|p| p.to_string()).collect();

        let net = Arc::new(MockMembership {
            id: "n1".into(),
            members: Mutex::new(
                ids.iter()
                    .map(|id| Member::new(id, &format!("{id}:7946")))
                    .collect(),
            ),
            sent: Mutex::new(vec![]),
            join_ok,
        });
        let (node, bootstrapped, status) =
            RaftNode::new(config, net.clone(), StateFile::new(dir.path()));
        Harness {
            node,
            net,
            bootstrapped,
            _status: status,
            dir,
        }
    }

    fn three_node_follower() -> Harness {
        let mut h = harness(&["n1", "n2", "n3"], 3, &[], true);
        h.node.to_follower(0);
        h
    }

    fn make_leader(h: &mut Harness) {
        h.node.to_pre_candidate();
        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: h.node.current_term() + 1,
            voter_id: "n2".into(),
            granted: true,
        });
        h.node.handle_message(RaftMessage::VoteResponse {
            term: h.node.current_term(),
            voter_id: "n2".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Leader);
        h.net.take_sent();
    }

    #[test]
    fn single_node_bootstrap_is_leader_every_time() {
        let mut h = harness(&["n1"], 1, &[], true);
        h.node.to_bootstrap();
        assert_eq!(h.node.state(), State::Leader);
        assert!(h.bootstrapped.try_recv().is_ok());

        h.node.to_bootstrap();
        assert_eq!(h.node.state(), State::Leader);
        assert_eq!(h.node.leader(), Some("n1"));
        assert!(h.net.take_sent().is_empty(), "no messages needed");
        assert!(StateFile::new(h.dir.path()).exists());
    }

    #[test]
    fn single_node_bootstrap_with_peers_runs_an_election() {
        let mut h = harness(&["n1"], 1, &["n2:7946"], false);
        h.node.to_bootstrap();
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 0);
        assert!(h.node.timeout_deadline().is_some());
        assert!(h.bootstrapped.try_recv().is_ok());
    }

    #[test]
    fn bootstrap_waits_for_expected_members() {
        let mut h = harness(&["n1", "n2"], 3, &["n2:7946"], true);
        h.node.to_bootstrap();
        h.node.handle_membership_event(MembershipEvent::Join(Member::new("n2", "n2:7946")));
        assert_eq!(h.node.state(), State::Bootstrap);
        assert!(h.node.timeout_deadline().is_none());

        h.net
            .members
            .lock()
            .unwrap()
            .push(Member::new("n3", "n3:7946"));
        h.node.handle_membership_event(MembershipEvent::Join(Member::new("n3", "n3:7946")));
        assert_eq!(h.node.state(), State::Follower);
        assert!(h.bootstrapped.try_recv().is_ok());
        let saved = StateFile::new(h.dir.path()).load().unwrap().unwrap();
        assert_eq!(saved.members.len(), 3);
    }

    #[test]
    fn messages_are_ignored_during_bootstrap() {
        let mut h = harness(&["n1", "n2"], 3, &[], true);
        h.node.to_bootstrap();
        h.node.handle_message(RaftMessage::Heartbeat {
            term: 4,
            leader_id: "n2".into(),
            heartbeat_id: 1,
        });
        assert_eq!(h.node.state(), State::Bootstrap);
        assert_eq!(h.node.current_term(), 0);
    }

    #[test]
    fn follower_timeout_starts_prevote_without_burning_a_term() {
        let mut h = three_node_follower();
        h.node.on_timeout();

        assert_eq!(h.node.state(), State::PreCandidate);
        assert_eq!(h.node.current_term(), 0);
        assert_eq!(h.node.voted_for(), None);
        assert!(h.node.tick_deadline().is_some());

        let sent = h.net.take_sent();
        assert_eq!(sent.len(), 2);
        for (_, msg) in sent {
            assert_eq!(
                msg,
                RaftMessage::PreVoteRequest {
                    term: 1,
                    candidate_id: "n1".into()
                }
            );
        }
    }

    #[test]
    fn prevote_then_vote_quorum_elects_leader() {
        let mut h = three_node_follower();
        h.node.to_pre_candidate();
        h.net.take_sent();

        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n2".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Candidate);
        assert_eq!(h.node.current_term(), 1);
        assert_eq!(h.node.voted_for(), Some("n1"));
        let requests = h.net.take_sent();
        assert!(requests
            .iter()
            .all(|(_, m)| matches!(m, RaftMessage::VoteRequest { term: 1, .. })));

        h.node.handle_message(RaftMessage::VoteResponse {
            term: 1,
            voter_id: "n3".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Leader);
        assert!(h.node.timeout_deadline().is_none());
        let heartbeats = h.net.take_sent();
        assert_eq!(heartbeats.len(), 2);
        assert!(heartbeats
            .iter()
            .all(|(_, m)| matches!(m, RaftMessage::Heartbeat { term: 1, .. })));
    }

    #[test]
    fn prevote_timeout_reverts_to_follower_and_counts_miss() {
        let mut h = three_node_follower();
        h.node.to_pre_candidate();
        h.node.on_timeout();
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 0);
        assert_eq!(h.node.pre_votes().missed_cycles(), 1);
    }

    #[test]
    fn failed_quorum_checks_do_not_touch_quorum() {
        let mut h = harness(&["n1", "n2", "n3", "n4", "n5"], 5, &[], true);
        h.node.to_follower(0);
        h.node.to_pre_candidate();
        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n2".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::PreCandidate);
        assert_eq!(h.node.quorum(), 3);

        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n3".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Candidate);
    }

    #[test]
    fn higher_term_forces_follower_and_clears_vote() {
        let mut h = three_node_follower();
        make_leader(&mut h);

        h.node.handle_message(RaftMessage::Heartbeat {
            term: 5,
            leader_id: "n3".into(),
            heartbeat_id: 9,
        });
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 5);
        assert_eq!(h.node.voted_for(), None);
        assert_eq!(h.node.leader(), Some("n3"));
        assert_eq!(
            h.net.take_sent(),
            vec![(
                "n3".to_string(),
                RaftMessage::HeartbeatAck {
                    term: 5,
                    follower_id: "n1".into(),
                    heartbeat_id: 9
                }
            )]
        );
    }

    #[test]
    fn stale_heartbeat_is_discarded() {
        let mut h = three_node_follower();
        h.node.handle_message(RaftMessage::Heartbeat {
            term: 3,
            leader_id: "n2".into(),
            heartbeat_id: 1,
        });
        h.net.take_sent();

        h.node.handle_message(RaftMessage::Heartbeat {
            term: 2,
            leader_id: "n3".into(),
            heartbeat_id: 1,
        });
        assert_eq!(h.node.current_term(), 3);
        assert_eq!(h.node.leader(), Some("n2"));
        assert!(h.net.take_sent().is_empty());
    }

    #[test]
    fn stale_vote_request_is_refused() {
        let mut h = three_node_follower();
        h.node.handle_message(RaftMessage::VoteRequest {
            term: 4,
            candidate_id: "n2".into(),
        });
        h.net.take_sent();

        h.node.handle_message(RaftMessage::VoteRequest {
            term: 3,
            candidate_id: "n3".into(),
        });
        assert_eq!(
            h.net.take_sent(),
            vec![(
                "n3".to_string(),
                RaftMessage::VoteResponse {
                    term: 4,
                    voter_id: "n1".into(),
                    granted: false
                }
            )]
        );
    }

    #[test]
    fn one_vote_per_term() {
        let mut h = three_node_follower();
        h.node.handle_message(RaftMessage::VoteRequest {
            term: 1,
            candidate_id: "n2".into(),
        });
        h.node.handle_message(RaftMessage::VoteRequest {
            term: 1,
            candidate_id: "n3".into(),
        });
        assert_eq!(h.node.voted_for(), Some("n2"));

        let sent = h.net.take_sent();
        let grants: Vec<bool> = sent
            .iter()
            .map(|(_, m)| match m {
                RaftMessage::VoteResponse { granted, .. } => *granted,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(grants, vec![true, false]);

        // A new term frees the vote again.
        h.node.handle_message(RaftMessage::VoteRequest {
            term: 2,
            candidate_id: "n3".into(),
        });
        assert_eq!(h.node.voted_for(), Some("n3"));
    }

    #[test]
    fn prevote_refused_while_leader_is_alive() {
        let mut h = three_node_follower();
        h.node.handle_message(RaftMessage::Heartbeat {
            term: 1,
            leader_id: "n2".into(),
            heartbeat_id: 1,
        });
        h.net.take_sent();

        h.node.handle_message(RaftMessage::PreVoteRequest {
            term: 2,
            candidate_id: "n3".into(),
        });
        assert_eq!(h.node.current_term(), 1, "prevotes never move the term");
        assert_eq!(
            h.net.take_sent(),
            vec![(
                "n3".to_string(),
                RaftMessage::PreVoteResponse {
                    term: 1,
                    voter_id: "n1".into(),
                    granted: false
                }
            )]
        );
    }

    #[test]
    fn prevote_granted_without_leader_contact() {
        let mut h = three_node_follower();
        h.node.handle_message(RaftMessage::PreVoteRequest {
            term: 1,
            candidate_id: "n3".into(),
        });
        assert_eq!(h.node.current_term(), 0);
        assert_eq!(h.node.voted_for(), None);
        assert_eq!(
            h.net.take_sent(),
            vec![(
                "n3".to_string(),
                RaftMessage::PreVoteResponse {
                    term: 1,
                    voter_id: "n1".into(),
                    granted: true
                }
            )]
        );
    }

    #[test]
    fn candidate_yields_to_leader_of_same_term() {
        let mut h = three_node_follower();
        h.node.to_pre_candidate();
        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n2".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Candidate);

        h.node.handle_message(RaftMessage::Heartbeat {
            term: 1,
            leader_id: "n3".into(),
            heartbeat_id: 1,
        });
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 1);
        assert_eq!(h.node.voted_for(), Some("n1"), "vote stays within the term");
    }

    #[test]
    fn leader_tolerates_sub_quorum_cycles_then_steps_down() {
        let mut h = three_node_follower();
        make_leader(&mut h);
        let tolerated = h.node.timing().max_sub_quorum_cycles;

        for _ in 0..tolerated {
            h.node.on_tick();
            assert_eq!(h.node.state(), State::Leader);
        }
        h.node.on_tick();
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 1);
        assert!(h.node.tick_deadline().is_none());
    }

    #[test]
    fn acknowledged_heartbeats_keep_leadership() {
        let mut h = three_node_follower();
        make_leader(&mut h);

        for _ in 0..10 {
            let id = h.node.heartbeats().current_heartbeat_id();
            h.node.handle_message(RaftMessage::HeartbeatAck {
                term: 1,
                follower_id: "n2".into(),
                heartbeat_id: id,
            });
            h.node.on_tick();
        }
        assert_eq!(h.node.state(), State::Leader);
        assert_eq!(h.node.heartbeats().sub_quorum_cycles(), 0);
    }

    fn five_node_leader() -> Harness {
        let mut h = harness(&["n1", "n2", "n3", "n4", "n5"], 5, &[], true);
        h.node.to_follower(0);
        h.node.to_pre_candidate();
        for voter in ["n2", "n3"] {
            h.node.handle_message(RaftMessage::PreVoteResponse {
                term: 1,
                voter_id: voter.into(),
                granted: true,
            });
        }
        for voter in ["n2", "n3"] {
            h.node.handle_message(RaftMessage::VoteResponse {
                term: 1,
                voter_id: voter.into(),
                granted: true,
            });
        }
        assert_eq!(h.node.state(), State::Leader);
        assert_eq!(h.node.quorum(), 3);
        h.net.take_sent();
        h
    }

    fn keep_only(h: &Harness, ids: &[&str]) {
        h.net
            .members
            .lock()
            .unwrap()
            .retain(|m| ids.contains(&m.id.as_str()));
    }

    #[test]
    fn acks_from_members_lost_in_a_split_keep_the_quorum() {
        let mut h = five_node_leader();
        let tolerated = h.node.timing().max_sub_quorum_cycles;

        let id = h.node.heartbeats().current_heartbeat_id();
        for follower in ["n2", "n3", "n4", "n5"] {
            h.node.handle_message(RaftMessage::HeartbeatAck {
                term: 1,
                follower_id: follower.into(),
                heartbeat_id: id,
            });
        }
        keep_only(&h, &["n1", "n2"]);

        h.node.on_tick();
        assert_eq!(h.node.state(), State::Leader);
        assert_eq!(h.node.heartbeats().sub_quorum_cycles(), 1);
        assert_eq!(h.node.quorum(), 3, "quorum must not shrink to the minority");

        for _ in 1..tolerated {
            let id = h.node.heartbeats().current_heartbeat_id();
            h.node.handle_message(RaftMessage::HeartbeatAck {
                term: 1,
                follower_id: "n2".into(),
                heartbeat_id: id,
            });
            h.node.on_tick();
            assert_eq!(h.node.state(), State::Leader);
        }
        h.node.on_tick();
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.quorum(), 3);
    }

    #[test]
    fn grants_from_members_that_left_the_view_are_not_counted() {
        let mut h = harness(&["n1", "n2", "n3", "n4", "n5"], 5, &[], true);
        h.node.to_follower(0);
        h.node.to_pre_candidate();

        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n2".into(),
            granted: true,
        });
        keep_only(&h, &["n1", "n2", "n4", "n5"]);
        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n3".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::PreCandidate);
        assert_eq!(h.node.current_term(), 0);

        h.node.handle_message(RaftMessage::PreVoteResponse {
            term: 1,
            voter_id: "n4".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Candidate);
        assert_eq!(h.node.quorum(), 3, "majority of the four live members");

        h.node.handle_message(RaftMessage::VoteResponse {
            term: 1,
            voter_id: "n2".into(),
            granted: true,
        });
        keep_only(&h, &["n1", "n2"]);
        h.node.handle_message(RaftMessage::VoteResponse {
            term: 1,
            voter_id: "n4".into(),
            granted: true,
        });
        assert_eq!(h.node.state(), State::Candidate, "n4 is gone, two of three");
        assert_eq!(h.node.quorum(), 3);
    }

    #[test]
    fn new_quorum_is_adopted() {
        let mut h = harness(&["n1", "n2", "n3", "n4"], 4, &[], true);
        h.node.to_follower(0);
        assert_eq!(h.node.quorum(), 3);
        h.node.handle_message(RaftMessage::NewQuorum {
            sender_id: "n4".into(),
            quorum: 2,
        });
        assert_eq!(h.node.quorum(), 2);
    }

    #[test]
    fn shutdown_announces_reduced_quorum_and_removes_snapshot() {
        let mut h = three_node_follower();
        make_leader(&mut h);

        h.node.to_pre_shutdown();
        assert!(h.node.tick_deadline().is_none());
        h.node.run_pre_shutdown();
        assert_eq!(h.node.state(), State::Shutdown);
        assert!(StateFile::new(h.dir.path()).exists());

        let sent = h.net.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, RaftMessage::NewQuorum { quorum: 2, .. })));

        h.node.run_shutdown().expect("clean shutdown");
        assert!(!StateFile::new(h.dir.path()).exists());
    }

    #[test]
    fn rejoin_success_becomes_follower_at_term_zero() {
        let mut h = harness(&["n1", "n2"], 3, &[], true);
        h.node.to_rejoin(vec!["n2:7946".into()]);
        assert_eq!(h.node.state(), State::Follower);
        assert_eq!(h.node.current_term(), 0);
        assert!(h.bootstrapped.try_recv().is_ok());
    }

    #[test]
    fn rejoin_exhaustion_falls_back_to_bootstrap() {
        let mut h = harness(&["n1"], 3, &[], false);
        h.node.to_rejoin(vec!["n2:7946".into(), "n3:7946".into()]);
        assert_eq!(h.node.state(), State::Rejoin);

        h.node.on_rejoin_retry();
        assert_eq!(h.node.state(), State::Rejoin);
        h.node.on_rejoin_retry();
        assert_eq!(h.node.state(), State::Bootstrap);
        assert!(h.bootstrapped.try_recv().is_err(), "still waiting for members");
    }

    #[test]
    fn undecodable_bytes_are_dropped() {
        let mut h = three_node_follower();
        h.node.handle_bytes(&[0xff, 0x00, 0x13]);
        assert_eq!(h.node.state(), State::Follower);
        assert!(h.net.take_sent().is_empty());
    }
}
