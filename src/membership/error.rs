use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("No peers reachable via {0:?}")]
    NoPeersReachable(Vec<String>),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Member {0} is unreachable")]
    Unreachable(String),

    #[error("Broadcast reached {delivered}/{total} members")]
    Broadcast { delivered: usize, total: usize },

    #[error("Transport is not running")]
    NotRunning,

    #[error("Transport error: {0}")]
    Transport(String),
}
