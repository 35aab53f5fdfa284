use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Bootstrap,
    Rejoin,
    Follower,
    PreCandidate,
    Candidate,
    Leader,
    PreShutdown,
    Shutdown,
}

impl State {
    /// States in which the node takes part in elections and heartbeats.
    pub fn is_member(&self) -> bool {
        matches!(
            self,
            State::Follower | State::PreCandidate | State::Candidate | State::Leader
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Bootstrap => "bootstrap",
            State::Rejoin => "rejoin",
            State::Follower => "follower",
            State::PreCandidate => "precandidate",
            State::Candidate => "candidate",
            State::Leader => "leader",
            State::PreShutdown => "preshutdown",
            State::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Snapshot of a node's externally visible election state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub term: u64,
    pub leader: Option<String>,
    pub quorum: usize,
}
