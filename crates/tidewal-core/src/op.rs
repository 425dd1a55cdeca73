//! # Operations and Stages
//!
//! Every write request is persisted through seven block-level operations,
//! grouped into three pipeline stages:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌────────────┐   ┌───────────────────┐
//! │ Metadata                     │   │ Commit     │   │ Checkpoint        │
//! │ data, txb, j-bitmap, j-inode │──>│ txe        │──>│ bitmap, inode     │
//! └──────────────────────────────┘   └────────────┘   └───────────────────┘
//! ```
//!
//! A stage may only advance once its *join condition* holds: every operation
//! it owns has completed for the current occupant of the slot. The join is an
//! [`OpSet`] mask, compared flag by flag, never a completion count.

use std::fmt;

/// Identifier of one logical write request, reused as a slot index.
pub type WriteId = usize;

/// A single block-level operation of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Write the data block in place.
    WriteData = 0,
    /// Journal transaction-begin block.
    JournalTxb = 1,
    /// Journal copy of the allocation bitmap.
    JournalBitmap = 2,
    /// Journal copy of the inode.
    JournalInode = 3,
    /// Journal transaction-end block; marks the transaction durable.
    JournalTxe = 4,
    /// Checkpoint the allocation bitmap to its home location.
    WriteBitmap = 5,
    /// Checkpoint the inode to its home location.
    WriteInode = 6,
}

impl Operation {
    /// All operations, in pipeline order.
    pub const ALL: [Operation; 7] = [
        Operation::WriteData,
        Operation::JournalTxb,
        Operation::JournalBitmap,
        Operation::JournalInode,
        Operation::JournalTxe,
        Operation::WriteBitmap,
        Operation::WriteInode,
    ];

    /// Returns the stage that issues this operation.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::WriteData | Self::JournalTxb | Self::JournalBitmap | Self::JournalInode => {
                Stage::Metadata
            }
            Self::JournalTxe => Stage::Commit,
            Self::WriteBitmap | Self::WriteInode => Stage::Checkpoint,
        }
    }

    /// Returns the completion flag bit for this operation.
    #[must_use]
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Returns a short human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WriteData => "write data",
            Self::JournalTxb => "journal txb",
            Self::JournalBitmap => "journal bitmap",
            Self::JournalInode => "journal inode",
            Self::JournalTxe => "journal txe",
            Self::WriteBitmap => "write bitmap",
            Self::WriteInode => "write inode",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Data write plus journal txb/bitmap/inode.
    Metadata,
    /// Journal txe (transaction commit).
    Commit,
    /// In-place bitmap and inode writes.
    Checkpoint,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Metadata, Stage::Commit, Stage::Checkpoint];

    /// Operations issued by this stage.
    #[must_use]
    pub const fn operations(self) -> &'static [Operation] {
        match self {
            Self::Metadata => &[
                Operation::WriteData,
                Operation::JournalTxb,
                Operation::JournalBitmap,
                Operation::JournalInode,
            ],
            Self::Commit => &[Operation::JournalTxe],
            Self::Checkpoint => &[Operation::WriteBitmap, Operation::WriteInode],
        }
    }

    /// The join condition: every flag that must be set before the stage advances.
    #[must_use]
    pub const fn join(self) -> OpSet {
        let ops = self.operations();
        let mut bits = 0u8;
        let mut i = 0;
        while i < ops.len() {
            bits |= ops[i].bit();
            i += 1;
        }
        OpSet(bits)
    }

    /// The stage that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Stage> {
        match self {
            Self::Metadata => Some(Self::Commit),
            Self::Commit => Some(Self::Checkpoint),
            Self::Checkpoint => None,
        }
    }

    /// Returns the stage name used in thread names and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Commit => "commit",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Index of the stage in [`Stage::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::Commit => 1,
            Self::Checkpoint => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of completed operations for one slot.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpSet(u8);

impl OpSet {
    /// The empty set.
    pub const EMPTY: OpSet = OpSet(0);

    /// Every operation of a write request.
    pub const ALL: OpSet = OpSet(0b0111_1111);

    /// Adds `op`; returns false if it was already present.
    pub fn insert(&mut self, op: Operation) -> bool {
        let was_set = self.contains(op);
        self.0 |= op.bit();
        !was_set
    }

    /// Returns true if `op` is in the set.
    #[must_use]
    pub const fn contains(self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }

    /// Returns true if every operation of `other` is in the set.
    #[must_use]
    pub const fn contains_all(self, other: OpSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Number of operations in the set.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the operations in the set, in pipeline order.
    pub fn iter(self) -> impl Iterator<Item = Operation> {
        Operation::ALL.into_iter().filter(move |op| self.contains(*op))
    }
}

impl fmt::Debug for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Operation> for OpSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        let mut set = OpSet::EMPTY;
        for op in iter {
            set.insert(op);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_joins_partition_all_operations() {
        let mut union = OpSet::EMPTY;
        for stage in Stage::ALL {
            let join = stage.join();
            assert_eq!(join.len(), stage.operations().len());
            for op in stage.operations() {
                assert_eq!(op.stage(), stage);
                assert!(union.insert(*op), "{op} owned by two stages");
            }
        }
        assert_eq!(union, OpSet::ALL);
    }

    #[test]
    fn test_join_sizes() {
        assert_eq!(Stage::Metadata.join().len(), 4);
        assert_eq!(Stage::Commit.join().len(), 1);
        assert_eq!(Stage::Checkpoint.join().len(), 2);
    }

    #[test]
    fn test_partial_set_does_not_satisfy_join() {
        let mut done = OpSet::EMPTY;
        done.insert(Operation::WriteData);
        done.insert(Operation::JournalTxb);
        done.insert(Operation::JournalBitmap);
        assert!(!done.contains_all(Stage::Metadata.join()));

        // Completions from a later stage never count toward an earlier join.
        done.insert(Operation::JournalTxe);
        assert!(!done.contains_all(Stage::Metadata.join()));

        done.insert(Operation::JournalInode);
        assert!(done.contains_all(Stage::Metadata.join()));
    }

    #[test]
    fn test_insert_reports_duplicates() {
        let mut set = OpSet::EMPTY;
        assert!(set.insert(Operation::JournalTxe));
        assert!(!set.insert(Operation::JournalTxe));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_stage_chain() {
        assert_eq!(Stage::Metadata.next(), Some(Stage::Commit));
        assert_eq!(Stage::Commit.next(), Some(Stage::Checkpoint));
        assert_eq!(Stage::Checkpoint.next(), None);
        assert_eq!(Stage::Checkpoint.to_string(), "checkpoint");
    }

    #[test]
    fn test_opset_iter_order() {
        let set: OpSet = [Operation::WriteInode, Operation::WriteData].into_iter().collect();
        let ops: Vec<_> = set.iter().collect();
        assert_eq!(ops, vec![Operation::WriteData, Operation::WriteInode]);
    }
}
