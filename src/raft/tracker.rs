use std::collections::BTreeSet;

/// Tally of one PreVote or Vote cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTracker {
    received: usize,
    pending: BTreeSet<String>,
    granted: BTreeSet<String>,
    missed_cycles: u32,
}

impl VoteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh cycle. The local node's own vote is counted up front.
    pub fn begin_cycle<I: IntoIterator<Item = String>>(&mut self, pending: I) {
        self.received = 1;
        self.pending = pending.into_iter().collect();
        self.granted.clear();
    }

    /// Records a response. Only members still pending are counted, so
    /// duplicates and replies to an earlier cycle are ignored.
    pub fn record(&mut self, voter: &str, granted: bool) -> bool {
        if !self.pending.remove(voter) {
            return false;
        }
        if granted {
            self.received += 1;
            self.granted.insert(voter.to_string());
        }
        granted
    }

    /// Own vote plus the grants of voters that are still in `live`.
    pub fn granted_by(&self, live: &BTreeSet<String>) -> usize {
        1 + self.granted.intersection(live).count()
    }

    /// Cycle ended without quorum.
    pub fn miss(&mut self) -> u32 {
        self.missed_cycles += 1;
        self.missed_cycles
    }

    /// Cycle ended with quorum.
    pub fn reach(&mut self) {
        self.missed_cycles = 0;
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    pub fn missed_cycles(&self) -> u32 {
        self.missed_cycles
    }
}

/// Acknowledgements of the leader's heartbeat rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatTracker {
    current_heartbeat_id: u64,
    received: usize,
    pending: BTreeSet<u64>,
    acked: BTreeSet<String>,
    sub_quorum_cycles: u32,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the next round and returns its heartbeat ID. The leader counts
    /// as its own first acknowledgement.
    pub fn next_round(&mut self) -> u64 {
        self.current_heartbeat_id += 1;
        self.pending.clear();
        self.pending.insert(self.current_heartbeat_id);
        self.acked.clear();
        self.received = 1;
        self.current_heartbeat_id
    }

    pub fn in_flight(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Counts an ack if it answers the open round and `from` has not acked it yet.
    pub fn record_ack(&mut self, heartbeat_id: u64, from: &str) -> bool {
        if !self.pending.contains(&heartbeat_id) || !self.acked.insert(from.to_string()) {
            return false;
        }
        self.received += 1;
        true
    }

    /// Closes the open round. Returns the leader's own ack plus the acks of
    /// senders that are still in `live`.
    pub fn close_round(&mut self, live: &BTreeSet<String>) -> usize {
        self.pending.clear();
        1 + self.acked.intersection(live).count()
    }

    pub fn miss(&mut self) -> u32 {
        self.sub_quorum_cycles += 1;
        self.sub_quorum_cycles
    }

    pub fn reach(&mut self) {
        self.sub_quorum_cycles = 0;
    }

    /// Forgets everything but the ID counter, which keeps increasing across terms.
    pub fn stop(&mut self) {
        self.pending.clear();
        self.acked.clear();
        self.received = 0;
        self.sub_quorum_cycles = 0;
    }

    pub fn current_heartbeat_id(&self) -> u64 {
        self.current_heartbeat_id
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn pending(&self) -> &BTreeSet<u64> {
        &self.pending
    }

    pub fn sub_quorum_cycles(&self) -> u32 {
        self.sub_quorum_cycles
    }
}
