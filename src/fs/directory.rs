//! Directory entry codec. A directory's data blocks each hold a chain of
//! variable-length records covering the whole block:
//!
//! `ino: u32 | rec_len: u16 | name_len: u16 | kind: u8 | name | pad to 4`
//!
//! `ino == 0` marks a free record. Records never cross block boundaries.
//! Insertion is first-fit, splitting a free record when the remainder can
//! still hold an empty one; removal just frees the record in place.

use crate::error::{FsError, FsResult};
use crate::journal::Transaction;

use super::filekind::FileKind;
use super::fs_layout::WayneFS;
use super::inode::Inode;

pub(crate) const DIRENT_HEADER: usize = 9;
/// smallest record: an aligned empty header
pub(crate) const DIRENT_MIN: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u32,
    pub kind: FileKind,
}

pub(crate) fn record_size(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 3) & !3
}

#[derive(Debug, Clone, Copy)]
struct RawRecord {
    off: usize,
    ino: u32,
    rec_len: usize,
    name_len: usize,
    kind: u8,
}

fn read_record(buf: &[u8], off: usize) -> FsResult<RawRecord> {
    if off + DIRENT_HEADER > buf.len() {
        return Err(FsError::Corrupt("directory record past block end".into()));
    }
    let ino = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    let rec_len = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap()) as usize;
    let name_len = u16::from_le_bytes(buf[off + 6..off + 8].try_into().unwrap()) as usize;
    let kind = buf[off + 8];
    if rec_len < DIRENT_MIN
        || rec_len % 4 != 0
        || off + rec_len > buf.len()
        || DIRENT_HEADER + name_len > rec_len
    {
        return Err(FsError::Corrupt(format!(
            "bad directory record at offset {off}"
        )));
    }
    Ok(RawRecord {
        off,
        ino,
        rec_len,
        name_len,
        kind,
    })
}

fn write_record(buf: &mut [u8], off: usize, ino: u32, rec_len: usize, name: &[u8], kind: u8) {
    buf[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    buf[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    buf[off + 6..off + 8].copy_from_slice(&(name.len() as u16).to_le_bytes());
    buf[off + 8] = kind;
    let name_start = off + DIRENT_HEADER;
    buf[name_start..name_start + name.len()].copy_from_slice(name);
    // zero the padding so reserved bytes stay clean
    buf[name_start + name.len()..off + rec_len].fill(0);
}

fn walk_block(buf: &[u8]) -> FsResult<Vec<RawRecord>> {
    let mut records = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let rec = read_record(buf, off)?;
        off += rec.rec_len;
        records.push(rec);
    }
    Ok(records)
}

/// A fresh directory block: one free record spanning it.
pub(crate) fn init_dir_block(buf: &mut [u8]) {
    let len = buf.len();
    buf.fill(0);
    write_record(buf, 0, 0, len, b"", 0);
}

/// First-fit insertion; `false` when the block has no room.
pub(crate) fn insert_in_block(buf: &mut [u8], name: &[u8], ino: u32, kind: u8) -> FsResult<bool> {
    let need = record_size(name.len());
    for rec in walk_block(buf)? {
        if rec.ino != 0 || rec.rec_len < need {
            continue;
        }
        if rec.rec_len - need >= DIRENT_MIN {
            // split: claim the front, leave the tail free
            write_record(buf, rec.off, ino, need, name, kind);
            write_record(buf, rec.off + need, 0, rec.rec_len - need, b"", 0);
        } else {
            // absorb the remainder into this record
            write_record(buf, rec.off, ino, rec.rec_len, name, kind);
        }
        return Ok(true);
    }
    Ok(false)
}

fn find_in_block(buf: &[u8], name: &[u8]) -> FsResult<Option<(u32, u8)>> {
    for rec in walk_block(buf)? {
        if rec.ino != 0 && entry_name(buf, &rec) == name {
            return Ok(Some((rec.ino, rec.kind)));
        }
    }
    Ok(None)
}

/// Free the matching record in place, leaving a hole insertion may fill.
fn remove_from_block(buf: &mut [u8], name: &[u8]) -> FsResult<Option<(u32, u8)>> {
    for rec in walk_block(buf)? {
        if rec.ino != 0 && entry_name(buf, &rec) == name {
            let found = (rec.ino, rec.kind);
            write_record(buf, rec.off, 0, rec.rec_len, b"", 0);
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn entry_name<'a>(buf: &'a [u8], rec: &RawRecord) -> &'a [u8] {
    &buf[rec.off + DIRENT_HEADER..rec.off + DIRENT_HEADER + rec.name_len]
}

fn block_entries(buf: &[u8]) -> FsResult<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for rec in walk_block(buf)? {
        if rec.ino == 0 {
            continue;
        }
        let name = String::from_utf8_lossy(entry_name(buf, &rec)).into_owned();
        entries.push(DirEntry {
            name,
            ino: rec.ino,
            kind: FileKind::from_disk(rec.kind)?,
        });
    }
    Ok(entries)
}

impl WayneFS {
    fn dir_block_count(&self, inode: &Inode) -> u64 {
        inode.size / self.sb.block_size as u64
    }

    /// All entries including `.` and `..`, in block order.
    pub(crate) fn dir_entries(&mut self, inode: &Inode) -> FsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for lbi in 0..self.dir_block_count(inode) {
            let pbno = self
                .lookup_block(inode, lbi)?
                .ok_or_else(|| FsError::Corrupt("hole in directory".into()))?;
            let buf = self.cache.get(&self.dev, pbno)?;
            entries.extend(block_entries(buf)?);
        }
        Ok(entries)
    }

    pub(crate) fn dir_lookup(
        &mut self,
        inode: &Inode,
        name: &str,
    ) -> FsResult<Option<(u32, FileKind)>> {
        for lbi in 0..self.dir_block_count(inode) {
            let pbno = self
                .lookup_block(inode, lbi)?
                .ok_or_else(|| FsError::Corrupt("hole in directory".into()))?;
            let buf = self.cache.get(&self.dev, pbno)?;
            if let Some((ino, kind)) = find_in_block(buf, name.as_bytes())? {
                return Ok(Some((ino, FileKind::from_disk(kind)?)));
            }
        }
        Ok(None)
    }

    /// Holds only `.` and `..`?
    pub(crate) fn dir_is_empty(&mut self, inode: &Inode) -> FsResult<bool> {
        Ok(self
            .dir_entries(inode)?
            .iter()
            .all(|e| e.name == "." || e.name == ".."))
    }

    /// Insert `name -> ino`, extending the directory by one block when no
    /// existing block has room. Fails with `Exists` on a duplicate name.
    pub(crate) fn dir_insert(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        name: &str,
        ino: u32,
        kind: FileKind,
    ) -> FsResult<()> {
        if self.dir_lookup(inode, name)?.is_some() {
            return Err(FsError::Exists);
        }
        let blocks = self.dir_block_count(inode);
        for lbi in 0..blocks {
            let pbno = self
                .lookup_block(inode, lbi)?
                .ok_or_else(|| FsError::Corrupt("hole in directory".into()))?;
            let buf = self.cache.get_mut(&self.dev, pbno)?;
            if insert_in_block(buf, name.as_bytes(), ino, kind as u8)? {
                let staged = buf.clone();
                self.cache.mark_dirty(pbno);
                tx.stage_meta(pbno, staged);
                return Ok(());
            }
        }
        // no room anywhere: grow by one block
        let pbno = self.resolve_block(tx, inode, blocks)?;
        let buf = self.cache.get_mut(&self.dev, pbno)?;
        init_dir_block(buf);
        insert_in_block(buf, name.as_bytes(), ino, kind as u8)?;
        let staged = buf.clone();
        self.cache.mark_dirty(pbno);
        tx.stage_meta(pbno, staged);
        inode.size += self.sb.block_size as u64;
        Ok(())
    }

    /// Remove `name`, returning the entry it pointed at.
    pub(crate) fn dir_remove(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        name: &str,
    ) -> FsResult<(u32, FileKind)> {
        for lbi in 0..self.dir_block_count(inode) {
            let pbno = self
                .lookup_block(inode, lbi)?
                .ok_or_else(|| FsError::Corrupt("hole in directory".into()))?;
            let buf = self.cache.get_mut(&self.dev, pbno)?;
            if let Some((ino, kind)) = remove_from_block(buf, name.as_bytes())? {
                let staged = buf.clone();
                self.cache.mark_dirty(pbno);
                tx.stage_meta(pbno, staged);
                return Ok((ino, FileKind::from_disk(kind)?));
            }
        }
        Err(FsError::NotFound)
    }

    /// Repoint an existing entry (used to rewrite `..` after a
    /// cross-directory rename).
    pub(crate) fn dir_set_entry(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        name: &str,
        new_ino: u32,
    ) -> FsResult<()> {
        for lbi in 0..self.dir_block_count(inode) {
            let pbno = self
                .lookup_block(inode, lbi)?
                .ok_or_else(|| FsError::Corrupt("hole in directory".into()))?;
            let buf = self.cache.get_mut(&self.dev, pbno)?;
            let mut hit = false;
            for rec in walk_block(buf)? {
                if rec.ino != 0 && entry_name(buf, &rec) == name.as_bytes() {
                    buf[rec.off..rec.off + 4].copy_from_slice(&new_ino.to_le_bytes());
                    hit = true;
                    break;
                }
            }
            if hit {
                let staged = buf.clone();
                self.cache.mark_dirty(pbno);
                tx.stage_meta(pbno, staged);
                return Ok(());
            }
        }
        Err(FsError::NotFound)
    }

    /// First block of a fresh directory: `.` then `..`.
    pub(crate) fn dir_init(
        &mut self,
        tx: &mut Transaction,
        dir_ino: u32,
        parent_ino: u32,
        inode: &mut Inode,
    ) -> FsResult<()> {
        let pbno = self.resolve_block(tx, inode, 0)?;
        let buf = self.cache.get_mut(&self.dev, pbno)?;
        init_dir_block(buf);
        insert_in_block(buf, b".", dir_ino, FileKind::Directory as u8)?;
        insert_in_block(buf, b"..", parent_ino, FileKind::Directory as u8)?;
        let staged = buf.clone();
        self.cache.mark_dirty(pbno);
        tx.stage_meta(pbno, staged);
        inode.size = self.sb.block_size as u64;
        Ok(())
    }
}
