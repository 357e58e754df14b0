use crate::error::CheckpointError;
use crate::types::{Partition, SourcePosition};

/// Commits progress for a partition. `position` is the last message that is
/// fully handled, i.e. written to the sink or skipped as malformed.
pub trait Checkpointer: Send + Sync {
    fn checkpoint(&self, position: &SourcePosition) -> Result<(), CheckpointError>;
}

/// Monotonic high-water mark of handled offsets for one partition claim.
/// Older or repeated positions never move it backwards.
#[derive(Debug)]
pub struct OffsetCheckpoint {
    partition: Partition,
    committed: Option<i64>,
}

impl OffsetCheckpoint {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            committed: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Returns true if the offset moved the mark forward.
    pub fn advance(&mut self, offset: i64) -> bool {
        match self.committed {
            Some(committed) if offset <= committed => false,
            _ => {
                self.committed = Some(offset);
                true
            }
        }
    }

    /// Highest handled offset so far
    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Offset a restarted consumer would resume from
    pub fn next_offset(&self) -> Option<i64> {
        self.committed.map(|offset| offset + 1)
    }
}
