//! Boundary to the gossip membership and transport layer.
//!
//! The election core never talks to sockets. It consumes a [`Membership`]
//! implementation for member lists, joins and outbound messages, and it
//! receives inbound traffic through the [`Inbox`] queues that the transport
//! fills via its [`Delegate`].

mod error;
pub mod local;

pub use self::error::MembershipError;
pub use self::local::{LocalMembership, LocalNetwork};

use std::collections::BTreeMap;
use std::time::Duration;

use ::log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    /// host:port the member's transport listens on.
    pub address: String,
}

impl Member {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(Member),
    Leave(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::Join(m) | MembershipEvent::Leave(m) => m,
        }
    }
}

/// Gossip membership plus message delivery, as seen by one node.
///
/// Calls are made from the node's event loop and must return promptly;
/// network round trips (join, leave) are bounded by the transport's own
/// timeouts.
pub trait Membership: Send + Sync {
    /// ID of the node this handle belongs to.
    fn local_id(&self) -> &str;

    /// Live member view, including the local node, ordered by ID.
    fn members(&self) -> Vec<Member>;

    /// Contacts the given addresses and merges their view into ours.
    /// Returns how many peers were successfully contacted.
    fn join(&self, peers: &[String]) -> Result<usize, MembershipError>;

    fn leave(&self, timeout: Duration) -> Result<(), MembershipError>;

    fn shutdown_transport(&self) -> Result<(), MembershipError>;

    fn send(&self, member_id: &str, message: Vec<u8>) -> Result<(), MembershipError>;

    /// 0 means fully healthy, higher is worse.
    fn health_score(&self) -> usize;

    /// Sends to every member except the local node.
    fn broadcast(&self, message: Vec<u8>) -> Result<(), MembershipError> {
        let targets: Vec<Member> = self
            .members()
            .into_iter()
            .filter(|m| m.id != self.local_id())
            .collect();

        let total = targets.len();
        let mut delivered = 0;
        for member in targets {
            match self.send(&member.id, message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Failed to send to {}: {e}", member.id),
            }
        }

        if delivered < total {
            return Err(MembershipError::Broadcast { delivered, total });
        }
        Ok(())
    }

    fn members_map(&self) -> BTreeMap<String, String> {
        self.members()
            .into_iter()
            .map(|m| (m.id, m.address))
            .collect()
    }
}

/// Transport-side producer for a node's inbox.
#[derive(Debug, Clone)]
pub struct Delegate {
    messages: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<MembershipEvent>,
}

/// Loop-side consumer of inbound messages and membership events.
#[derive(Debug)]
pub struct Inbox {
    pub messages: mpsc::Receiver<Vec<u8>>,
    pub events: mpsc::Receiver<MembershipEvent>,
}

/// Creates the bounded inbox queues for a cluster of at most `max_nodes` members.
///
/// Each member can have one heartbeat or vote exchange and one re-ask in
/// flight towards us, hence the doubled message capacity.
pub fn channel(max_nodes: usize) -> (Delegate, Inbox) {
    let max_nodes = max_nodes.max(1);
    let (msg_tx, msg_rx) = mpsc::channel(max_nodes * 2);
    let (event_tx, event_rx) = mpsc::channel(max_nodes);
    (
        Delegate {
            messages: msg_tx,
            events: event_tx,
        },
        Inbox {
            messages: msg_rx,
            events: event_rx,
        },
    )
}

impl Delegate {
    pub fn notify_msg(&self, message: Vec<u8>) {
        match self.messages.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Inbound message queue full, dropping message"),
            Err(TrySendError::Closed(_)) => debug!("Node loop has stopped, dropping message"),
        }
    }

    pub fn notify_join(&self, member: Member) {
        info!("->[] {} [{}] joined the cluster.", member.id, member.address);
        self.push_event(MembershipEvent::Join(member));
    }

    pub fn notify_leave(&self, member: Member) {
        info!("[]-> {} [{}] left the cluster.", member.id, member.address);
        self.push_event(MembershipEvent::Leave(member));
    }

    fn push_event(&self, event: MembershipEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                warn!("Membership event queue full, dropping {:?}", e.member().id)
            }
            Err(TrySendError::Closed(_)) => debug!("Node loop has stopped, dropping event"),
        }
    }
}
