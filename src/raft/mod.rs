mod config;
mod error;
mod message;
mod node;
mod quorum;
mod runtime;
mod state;
mod tracker;

pub use self::config::{Timing, TICKER_INTERVAL_MS};
pub use self::error::RaftError;
pub use self::message::RaftMessage;
pub use self::node::RaftNode;
pub use self::quorum::{majority, Quorum};
pub use self::state::{State, Status};
pub use self::tracker::{HeartbeatTracker, VoteTracker};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ::log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};

use self::runtime::{Runtime, ShutdownRequest};
use crate::config::Config;
use crate::membership::{self, Delegate, Membership, MembershipError};
use crate::storage::StateFile;

/// Handle to a running node.
///
/// Created by [`Raft::initialize`], which only returns once the node has
/// bootstrapped or rejoined a cluster. The election itself runs on a
/// background task until [`Raft::shutdown`] is called.
pub struct Raft {
    id: String,
    membership: Arc<dyn Membership>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
    status: watch::Receiver<Status>,
}

impl Raft {
    /// Loads `ballot.json` from `working_dir` and starts the node.
    pub async fn initialize<C>(working_dir: &Path, connect: C) -> Result<Self, RaftError>
    where
        C: FnOnce(&Config, Delegate) -> Result<Arc<dyn Membership>, MembershipError>,
    {
        let config = Config::load(working_dir)?;
        Self::initialize_with(config, working_dir, connect).await
    }

    /// Starts a node from an already loaded config. A `state.json` left in
    /// `working_dir` by an unclean exit makes the node rejoin through the
    /// recorded members instead of bootstrapping.
    pub async fn initialize_with<C>(
        mut config: Config,
        working_dir: &Path,
        connect: C,
    ) -> Result<Self, RaftError>
    where
        C: FnOnce(&Config, Delegate) -> Result<Arc<dyn Membership>, MembershipError>,
    {
        config.validate()?;
        info!("Starting ballot {} as {}", crate::VERSION, config.id);

        let state_file = StateFile::new(working_dir);
        let snapshot = state_file.load()?;
        let rejoin_peers = snapshot.map(|s| s.peer_addresses(&config.id));
        if let Some(peers) = &rejoin_peers {
            if !peers.is_empty() {
                debug!("Replacing peer list with {} persisted members", peers.len());
                config.peer_list = peers.clone();
            }
        }

        let (delegate, inbox) = membership::channel(config.max_nodes);
        let membership = connect(&config, delegate)?;
        info!("Listening on {}", config.bind_addr());

        let id = config.id.clone();
        let (mut node, bootstrapped, status) =
            RaftNode::new(config, membership.clone(), state_file);
        match rejoin_peers {
            Some(peers) => node.to_rejoin(peers),
            None => node.to_bootstrap(),
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(Runtime::new(node, inbox, shutdown_rx).run());

        bootstrapped.await.map_err(|_| RaftError::BootstrapAborted)?;
        info!("{id} is ready");

        Ok(Self {
            id,
            membership,
            shutdown_tx,
            status,
        })
    }

    /// Leaves the cluster gracefully and waits until the node has stopped.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shutdown_tx
            .send(reply_tx)
            .await
            .map_err(|_| RaftError::NotRunning)?;
        reply_rx.await.map_err(|_| RaftError::NotRunning)?
    }

    /// 0 is healthy. Grows while known members are unreachable.
    pub fn health_score(&self) -> usize {
        self.membership.health_score()
    }

    /// Current members as ID to address.
    pub fn members(&self) -> BTreeMap<String, String> {
        self.membership.members_map()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    pub fn term(&self) -> u64 {
        self.status.borrow().term
    }

    pub fn leader(&self) -> Option<String> {
        self.status.borrow().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == State::Leader
    }

    /// Receiver that is notified on every state, term, leader or quorum change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }
}
