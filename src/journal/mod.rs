//! Write-ahead journal in ordered mode.
//!
//! The journal region starts with a log superblock; the remaining blocks
//! form a ring holding descriptor blocks, raw metadata copies, and commit
//! records. Data blocks never enter the log: ordered-mode flushes them to
//! their home locations before the commit record becomes durable, so a
//! committed metadata pointer never exposes stale data.

mod transaction;

pub use transaction::Transaction;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::PageCache;
use crate::device::BlockDev;
use crate::error::{FsError, FsResult};
use crate::fs::SuperBlock;

const LOG_SB_MAGIC: u32 = 0x574a_5342; // "WJSB"
const DESCRIPTOR_MAGIC: u32 = 0x574a_4453; // "WJDS"
const COMMIT_MAGIC: u32 = 0x574a_434d; // "WJCM"

/// Journal offset 0: the anchor recovery scans from. `head` is a ring
/// index just past the last fully checkpointed transaction; `sequence` is
/// that transaction's id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LogSuperblock {
    magic: u32,
    head: u32,
    sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DescriptorHeader {
    magic: u32,
    tid: u64,
    count: u32,
}

/// One tag per metadata copy that follows the descriptor, recording the
/// home block the copy belongs to.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct DescriptorTag {
    home: u32,
    flags: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct CommitHeader {
    magic: u32,
    tid: u64,
    checksum: u64,
}

#[derive(Debug)]
pub struct Journal {
    /// journal region offset of the log superblock
    sb_block: u32,
    /// first ring block (log superblock + 1)
    ring_start: u32,
    ring_len: u32,
    block_size: u32,
    /// ring index just past the last checkpointed transaction
    head: u32,
    /// ring index where the next record is written
    tail: u32,
    /// id of the last fully checkpointed transaction
    sequence: u64,
    next_tid: u64,
    /// Failpoint: when set, `commit` stops after the commit record is
    /// durable, leaving the checkpoint to crash recovery.
    pub skip_checkpoint: bool,
}

impl Journal {
    /// Initialize an empty journal; called by the formatter.
    pub fn format(dev: &mut BlockDev, sb: &SuperBlock) -> FsResult<()> {
        let log_sb = LogSuperblock {
            magic: LOG_SB_MAGIC,
            head: 0,
            sequence: 0,
        };
        let block = encode_record(&log_sb, sb.block_size)?;
        dev.write_block(sb.journal_start, &block)?;
        Ok(())
    }

    /// Load the log superblock at mount. Recovery runs separately so the
    /// caller controls when replay happens.
    pub fn load(dev: &BlockDev, sb: &SuperBlock) -> FsResult<Self> {
        let raw = dev.read_block(sb.journal_start)?;
        let log_sb: LogSuperblock = decode_record(&raw)
            .map_err(|_| FsError::JournalCorrupt("unreadable log superblock".into()))?;
        if log_sb.magic != LOG_SB_MAGIC {
            return Err(FsError::JournalCorrupt("bad log superblock magic".into()));
        }
        let ring_len = sb.journal_blocks - 1;
        if log_sb.head >= ring_len {
            return Err(FsError::JournalCorrupt(format!(
                "head {} outside ring of {} blocks",
                log_sb.head, ring_len
            )));
        }
        Ok(Journal {
            sb_block: sb.journal_start,
            ring_start: sb.journal_start + 1,
            ring_len,
            block_size: sb.block_size,
            head: log_sb.head,
            tail: log_sb.head,
            sequence: log_sb.sequence,
            next_tid: log_sb.sequence + 1,
            skip_checkpoint: false,
        })
    }

    /// Open a transaction. The id is consumed only once the commit record
    /// is durable, so an aborted transaction leaves no gap in the tid
    /// chain recovery walks.
    pub fn begin(&mut self) -> Transaction {
        let tid = self.next_tid;
        debug!("txn {tid}: begin");
        Transaction::new(tid)
    }

    /// Commit protocol: ordered data flush, descriptor, metadata copies,
    /// commit record, checkpoint — a sync barrier after each phase. Any
    /// error aborts the transaction (staged cache pages are discarded) and
    /// the filesystem stays at the last durable commit.
    pub fn commit(
        &mut self,
        dev: &mut BlockDev,
        cache: &mut PageCache,
        tx: Transaction,
    ) -> FsResult<()> {
        if tx.is_empty() {
            debug!("txn {}: empty, nothing to commit", tx.tid());
            return Ok(());
        }
        match self.commit_inner(dev, cache, &tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("txn {}: commit failed: {e}", tx.tid());
                self.abort(cache, tx);
                Err(e)
            }
        }
    }

    fn commit_inner(
        &mut self,
        dev: &mut BlockDev,
        cache: &mut PageCache,
        tx: &Transaction,
    ) -> FsResult<()> {
        // strict: the tail must never catch the head, or a full ring would
        // read back as empty
        let needed = tx.meta_writes().len() as u32 + 2;
        if needed >= self.free_ring_blocks() {
            return Err(FsError::JournalCorrupt(format!(
                "transaction of {} blocks exceeds free journal space",
                needed
            )));
        }

        // 1. ordered data reaches its home location first
        cache.flush_set(dev, tx.ordered_data().iter().copied())?;
        dev.sync()?;

        // 2. descriptor block naming every home location
        let desc_block = self.encode_descriptor(tx)?;
        dev.write_block(self.ring_block(self.tail), &desc_block)?;
        dev.sync()?;

        // 3. raw metadata copies, in tag order
        for (i, buf) in tx.meta_writes().values().enumerate() {
            dev.write_block(self.ring_block(self.tail + 1 + i as u32), buf)?;
        }
        dev.sync()?;

        // 4. commit record; the transaction is durable once this is synced
        let checksum = transaction_checksum(&desc_block, tx.meta_writes().values());
        let commit = CommitHeader {
            magic: COMMIT_MAGIC,
            tid: tx.tid(),
            checksum,
        };
        let commit_block = encode_record(&commit, self.block_size)?;
        dev.write_block(self.ring_block(self.tail + 1 + tx.meta_writes().len() as u32), &commit_block)?;
        dev.sync()?;
        // durable now: the tid is spent and the log space is occupied
        self.next_tid = tx.tid() + 1;
        self.tail = (self.tail + needed) % self.ring_len;
        debug!(
            "txn {}: committed ({} metadata blocks, {} ordered)",
            tx.tid(),
            tx.meta_writes().len(),
            tx.ordered_data().len()
        );

        if self.skip_checkpoint {
            // failpoint: behave as if we crashed here; recovery will replay
            return Ok(());
        }
        self.checkpoint(dev, cache, tx)
    }

    /// 5. write every metadata block home and reclaim the log space.
    fn checkpoint(
        &mut self,
        dev: &mut BlockDev,
        cache: &mut PageCache,
        tx: &Transaction,
    ) -> FsResult<()> {
        for (bno, buf) in tx.meta_writes() {
            cache.install(*bno, buf.clone());
            cache.flush(dev, *bno)?;
        }
        dev.sync()?;

        self.head = self.tail;
        self.sequence = tx.tid();
        self.write_log_sb(dev)?;
        dev.sync()?;
        debug!("txn {}: checkpointed, head advanced to {}", tx.tid(), self.head);
        Ok(())
    }

    /// Deliberate rollback: drop every cache page the transaction touched
    /// so the next access reloads the committed bytes.
    pub fn abort(&self, cache: &mut PageCache, tx: Transaction) {
        debug!("txn {}: abort", tx.tid());
        for bno in tx.touched_blocks() {
            cache.discard(bno);
        }
    }

    /// Scan forward from the head, replaying every transaction whose commit
    /// record validates; stop at the first gap. Runs at mount, before any
    /// cache exists, so replay writes straight to the device.
    pub fn recover(&mut self, dev: &mut BlockDev) -> FsResult<u32> {
        let mut pos = self.head;
        let mut expected_tid = self.sequence + 1;
        let mut replayed = 0u32;

        loop {
            let desc_raw = dev.read_block(self.ring_block(pos))?;
            let desc: DescriptorHeader = match decode_record(&desc_raw) {
                Ok(d) => d,
                Err(_) => break,
            };
            if desc.magic != DESCRIPTOR_MAGIC || desc.tid != expected_tid {
                break;
            }
            if desc.count + 2 > self.ring_len {
                break;
            }
            let tags = match decode_descriptor_tags(&desc_raw, desc.count) {
                Ok(t) => t,
                Err(_) => break,
            };
            if tags.iter().any(|t| t.home >= dev.total_blocks()) {
                break;
            }

            let mut metas = Vec::with_capacity(tags.len());
            for i in 0..desc.count {
                metas.push(dev.read_block(self.ring_block(pos + 1 + i))?);
            }
            let commit_raw = dev.read_block(self.ring_block(pos + 1 + desc.count))?;
            let commit: CommitHeader = match decode_record(&commit_raw) {
                Ok(c) => c,
                Err(_) => break,
            };
            if commit.magic != COMMIT_MAGIC || commit.tid != desc.tid {
                break;
            }
            if commit.checksum != transaction_checksum(&desc_raw, metas.iter()) {
                // partial write of the transaction; it was never durable
                break;
            }

            info!("replaying txn {} ({} metadata blocks)", desc.tid, desc.count);
            for (tag, buf) in tags.iter().zip(metas.iter()) {
                dev.write_block(tag.home, buf)?;
            }
            replayed += 1;
            pos = (pos + desc.count + 2) % self.ring_len;
            self.sequence = expected_tid;
            expected_tid += 1;
        }

        if replayed > 0 {
            dev.sync()?;
        }
        self.head = pos;
        self.tail = pos;
        self.next_tid = self.sequence + 1;
        self.write_log_sb(dev)?;
        dev.sync()?;
        if replayed > 0 {
            info!("journal recovery replayed {replayed} transaction(s)");
        } else {
            debug!("journal clean, no recovery needed");
        }
        Ok(replayed)
    }

    fn ring_block(&self, idx: u32) -> u32 {
        self.ring_start + idx % self.ring_len
    }

    fn free_ring_blocks(&self) -> u32 {
        self.ring_len - (self.tail + self.ring_len - self.head) % self.ring_len
    }

    fn write_log_sb(&self, dev: &mut BlockDev) -> FsResult<()> {
        let log_sb = LogSuperblock {
            magic: LOG_SB_MAGIC,
            head: self.head,
            sequence: self.sequence,
        };
        let block = encode_record(&log_sb, self.block_size)?;
        dev.write_block(self.sb_block, &block)
    }

    fn encode_descriptor(&self, tx: &Transaction) -> FsResult<Vec<u8>> {
        let header = DescriptorHeader {
            magic: DESCRIPTOR_MAGIC,
            tid: tx.tid(),
            count: tx.meta_writes().len() as u32,
        };
        let config = bincode::config::legacy();
        let mut raw = bincode::serde::encode_to_vec(&header, config)
            .map_err(|e| FsError::JournalCorrupt(format!("descriptor encode: {e}")))?;
        for home in tx.meta_writes().keys() {
            let tag = DescriptorTag {
                home: *home,
                flags: 0,
            };
            let tag_raw = bincode::serde::encode_to_vec(&tag, config)
                .map_err(|e| FsError::JournalCorrupt(format!("descriptor encode: {e}")))?;
            raw.extend_from_slice(&tag_raw);
        }
        if raw.len() > self.block_size as usize {
            return Err(FsError::JournalCorrupt(
                "descriptor does not fit in one block".into(),
            ));
        }
        raw.resize(self.block_size as usize, 0);
        Ok(raw)
    }
}

fn encode_record<T: Serialize>(record: &T, block_size: u32) -> FsResult<Vec<u8>> {
    let config = bincode::config::legacy();
    let mut raw = bincode::serde::encode_to_vec(record, config)
        .map_err(|e| FsError::JournalCorrupt(format!("record encode: {e}")))?;
    raw.resize(block_size as usize, 0);
    Ok(raw)
}

fn decode_record<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> FsResult<T> {
    let config = bincode::config::legacy();
    let (record, _len) = bincode::serde::decode_from_slice(raw, config)
        .map_err(|e| FsError::JournalCorrupt(format!("record decode: {e}")))?;
    Ok(record)
}

fn decode_descriptor_tags(raw: &[u8], count: u32) -> FsResult<Vec<DescriptorTag>> {
    let config = bincode::config::legacy();
    let header_len = 4 + 8 + 4;
    let mut tags = Vec::with_capacity(count as usize);
    let mut off = header_len;
    for _ in 0..count {
        if off + 8 > raw.len() {
            return Err(FsError::JournalCorrupt("descriptor tags truncated".into()));
        }
        let (tag, read): (DescriptorTag, usize) =
            bincode::serde::decode_from_slice(&raw[off..], config)
                .map_err(|e| FsError::JournalCorrupt(format!("descriptor tag: {e}")))?;
        off += read;
        tags.push(tag);
    }
    Ok(tags)
}

/// First eight bytes of a blake3 hash over the descriptor block and every
/// metadata payload, in log order.
fn transaction_checksum<'a, I>(descriptor: &[u8], metas: I) -> u64
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(descriptor);
    for buf in metas {
        hasher.update(buf);
    }
    let hash = hasher.finalize();
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DEFAULT_BLOCK_SIZE;
    use std::io::Write;

    const JOURNAL_START: u32 = 2;
    const JOURNAL_BLOCKS: u32 = 8;

    /// A toy geometry: block 0 superblock-ish, block 1 a metadata target,
    /// blocks 2..10 the journal, the rest data.
    fn scratch_sb() -> SuperBlock {
        let mut sb = SuperBlock::default();
        sb.block_size = DEFAULT_BLOCK_SIZE;
        sb.total_blocks = 16;
        sb.journal_start = JOURNAL_START;
        sb.journal_blocks = JOURNAL_BLOCKS;
        sb
    }

    fn scratch() -> (tempfile::NamedTempFile, BlockDev) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (16 * DEFAULT_BLOCK_SIZE) as usize])
            .unwrap();
        f.flush().unwrap();
        let dev = BlockDev::open(f.path()).unwrap();
        (f, dev)
    }

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; DEFAULT_BLOCK_SIZE as usize]
    }

    #[test]
    fn test_fresh_journal_recovers_clean() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 0);
    }

    #[test]
    fn test_commit_then_clean_recovery() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();

        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0xAA));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        // checkpoint completed: home location updated, log reclaimed
        assert_eq!(dev.read_block(1).unwrap()[0], 0xAA);
        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 0);
    }

    #[test]
    fn test_crash_before_checkpoint_replays() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();
        journal.skip_checkpoint = true;

        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0xBB));
        tx.stage_meta(12, block_of(0xCC));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        // commit record durable, home locations untouched
        assert_eq!(dev.read_block(1).unwrap()[0], 0x00);

        // "remount": replay installs both home blocks
        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 1);
        assert_eq!(dev.read_block(1).unwrap()[0], 0xBB);
        assert_eq!(dev.read_block(12).unwrap()[0], 0xCC);

        // recovery is idempotent: a second remount finds a clean log
        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 0);
        assert_eq!(dev.read_block(1).unwrap()[0], 0xBB);
    }

    #[test]
    fn test_torn_commit_record_is_discarded() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();
        journal.skip_checkpoint = true;

        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0xDD));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        // corrupt one byte of the logged metadata copy: checksum must fail
        let meta_log_block = JOURNAL_START + 1 + 1;
        let mut raw = dev.read_block(meta_log_block).unwrap();
        raw[100] ^= 0xFF;
        dev.write_block(meta_log_block, &raw).unwrap();

        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 0);
        // home location never written
        assert_eq!(dev.read_block(1).unwrap()[0], 0x00);
    }

    #[test]
    fn test_stale_records_past_head_are_ignored() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();

        // a fully checkpointed transaction leaves its records in the ring
        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0x11));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        // head advanced past them: nothing replays, contents stay
        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 0);
        assert_eq!(dev.read_block(1).unwrap()[0], 0x11);
    }

    #[test]
    fn test_consecutive_uncheckpointed_commits_all_replay() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();
        journal.skip_checkpoint = true;

        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0x21));
        journal.commit(&mut dev, &mut cache, tx).unwrap();
        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0x22));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 2);
        // the later transaction wins
        assert_eq!(dev.read_block(1).unwrap()[0], 0x22);
    }

    #[test]
    fn test_abort_leaves_no_tid_gap() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();
        journal.skip_checkpoint = true;

        // an aborted transaction must not burn its id, or the recovery
        // scan's sequential tid check would reject the next commit
        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0x66));
        journal.abort(&mut cache, tx);

        let mut tx = journal.begin();
        tx.stage_meta(1, block_of(0x77));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        let mut journal = Journal::load(&dev, &sb).unwrap();
        assert_eq!(journal.recover(&mut dev).unwrap(), 1);
        assert_eq!(dev.read_block(1).unwrap()[0], 0x77);
    }

    #[test]
    fn test_oversized_transaction_rejected() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();

        let mut tx = journal.begin();
        // ring holds 7 blocks; 6 metadata copies + descriptor + commit = 8
        for bno in 10..16 {
            tx.stage_meta(bno, block_of(bno as u8));
        }
        assert!(journal.commit(&mut dev, &mut cache, tx).is_err());
    }

    #[test]
    fn test_ordered_data_flushed_before_commit() {
        let (_img, mut dev) = scratch();
        let sb = scratch_sb();
        Journal::format(&mut dev, &sb).unwrap();
        let mut journal = Journal::load(&dev, &sb).unwrap();
        let mut cache = PageCache::new();
        journal.skip_checkpoint = true;

        // dirty data page + metadata pointing at it
        cache.install(12, block_of(0x99));
        let mut tx = journal.begin();
        tx.add_ordered(12);
        tx.stage_meta(1, block_of(0x42));
        journal.commit(&mut dev, &mut cache, tx).unwrap();

        // even though the checkpoint never ran, the data block is home
        assert_eq!(dev.read_block(12).unwrap()[0], 0x99);
        let mut journal = Journal::load(&dev, &sb).unwrap();
        journal.recover(&mut dev).unwrap();
        assert_eq!(dev.read_block(1).unwrap()[0], 0x42);
        assert_eq!(dev.read_block(12).unwrap()[0], 0x99);
    }
}
