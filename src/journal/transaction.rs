use std::collections::{BTreeMap, BTreeSet};

/// Accumulator for one externally visible mutating operation.
///
/// `meta_writes` holds the final contents of every metadata block the
/// operation touched (superblock, bitmap blocks, inode-table blocks,
/// directory blocks, indirect index blocks). `ordered_data` holds the
/// physical numbers of data blocks whose dirty cache pages must reach the
/// device before the commit record does.
pub struct Transaction {
    tid: u64,
    meta_writes: BTreeMap<u32, Vec<u8>>,
    ordered_data: BTreeSet<u32>,
}

impl Transaction {
    pub fn new(tid: u64) -> Self {
        Transaction {
            tid,
            meta_writes: BTreeMap::new(),
            ordered_data: BTreeSet::new(),
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Stage the final contents of metadata block `bno`. Staging the same
    /// block again replaces the earlier copy; the log records only the last
    /// state.
    pub fn stage_meta(&mut self, bno: u32, buf: Vec<u8>) {
        self.meta_writes.insert(bno, buf);
    }

    pub fn add_ordered(&mut self, bno: u32) {
        self.ordered_data.insert(bno);
    }

    /// A data block that was staged as metadata in the same transaction is
    /// not ordered data (it reaches the disk through the log).
    pub fn meta_writes(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.meta_writes
    }

    pub fn ordered_data(&self) -> &BTreeSet<u32> {
        &self.ordered_data
    }

    pub fn is_empty(&self) -> bool {
        self.meta_writes.is_empty() && self.ordered_data.is_empty()
    }

    /// Every block this transaction touched, for the abort path.
    pub fn touched_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.meta_writes
            .keys()
            .copied()
            .chain(self.ordered_data.iter().copied())
    }
}
