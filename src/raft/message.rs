use serde::{Deserialize, Serialize};

use super::RaftError;

/// Every message exchanged between nodes. Decoded once when it leaves the
/// transport; handlers match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    Heartbeat {
        term: u64,
        leader_id: String,
        heartbeat_id: u64,
    },
    HeartbeatAck {
        term: u64,
        follower_id: String,
        heartbeat_id: u64,
    },
    /// `term` is the term the candidate would campaign for, not its current one.
    PreVoteRequest {
        term: u64,
        candidate_id: String,
    },
    /// A granted prevote echoes the requested term; a refusal carries the voter's term.
    PreVoteResponse {
        term: u64,
        voter_id: String,
        granted: bool,
    },
    VoteRequest {
        term: u64,
        candidate_id: String,
    },
    VoteResponse {
        term: u64,
        voter_id: String,
        granted: bool,
    },
    /// Quorum the remaining members should use after the sender leaves.
    NewQuorum {
        sender_id: String,
        quorum: usize,
    },
}

impl RaftMessage {
    /// `None` for messages that are not bound to a term.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::Heartbeat { term, .. }
            | RaftMessage::HeartbeatAck { term, .. }
            | RaftMessage::PreVoteRequest { term, .. }
            | RaftMessage::PreVoteResponse { term, .. }
            | RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. } => Some(*term),
            RaftMessage::NewQuorum { .. } => None,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            RaftMessage::Heartbeat { leader_id, .. } => leader_id,
            RaftMessage::HeartbeatAck { follower_id, .. } => follower_id,
            RaftMessage::PreVoteRequest { candidate_id, .. }
            | RaftMessage::VoteRequest { candidate_id, .. } => candidate_id,
            RaftMessage::PreVoteResponse { voter_id, .. }
            | RaftMessage::VoteResponse { voter_id, .. } => voter_id,
            RaftMessage::NewQuorum { sender_id, .. } => sender_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::Heartbeat { .. } => "heartbeat",
            RaftMessage::HeartbeatAck { .. } => "heartbeat ack",
            RaftMessage::PreVoteRequest { .. } => "prevote request",
            RaftMessage::PreVoteResponse { .. } => "prevote response",
            RaftMessage::VoteRequest { .. } => "vote request",
            RaftMessage::VoteResponse { .. } => "vote response",
            RaftMessage::NewQuorum { .. } => "new quorum",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        let (message, _): (RaftMessage, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| RaftError::SerializationError(e.to_string()))?;
        Ok(message)
    }
}
