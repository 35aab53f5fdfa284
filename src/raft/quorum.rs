/// Majority threshold frozen at the cluster size seen at the last successful
/// quorum check.
///
/// A check only compares against the stored size. When it succeeds the
/// threshold is recomputed from the live member count, so after a partition
/// both sides still have to meet the old majority and only the larger one can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    size: usize,
}

impl Quorum {
    pub fn for_cluster_size(members: usize) -> Self {
        Self {
            size: majority(members),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Adopts a quorum announced by a departing member.
    pub fn set(&mut self, size: usize) {
        self.size = size.max(1);
    }

    /// `live_members` is only consulted when `votes` meets the stored threshold.
    pub fn reached(&mut self, votes: usize, live_members: usize) -> bool {
        if votes < self.size {
            return false;
        }
        self.size = majority(live_members);
        true
    }
}

pub fn majority(members: usize) -> usize {
    members / 2 + 1
}
