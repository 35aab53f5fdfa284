//! Leader election for small clusters.
//!
//! A PreVote-augmented Raft election running on top of a gossip membership
//! layer. There is no replicated log: nodes only agree on who leads.

pub mod config;
pub mod membership;
pub mod raft;
pub mod storage;

pub use config::{Config, ConfigError};
pub use membership::{LocalNetwork, Member, Membership, MembershipError};
pub use raft::{Raft, RaftError, State, Status};
pub use storage::{StateFile, StorageError};

/// Crate version, logged when a node starts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
