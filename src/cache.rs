//! Write-back page cache: physical block number -> in-memory buffer with a
//! dirty flag. While mounted this is the single coherent view of block
//! contents; metadata reads consult it before the device.

use std::collections::HashMap;

use crate::device::BlockDev;
use crate::error::FsResult;

#[derive(Debug)]
struct Page {
    buf: Vec<u8>,
    dirty: bool,
}

#[derive(Default, Debug)]
pub struct PageCache {
    pages: HashMap<u32, Page>,
}

impl PageCache {
    pub fn new() -> Self {
        PageCache {
            pages: HashMap::new(),
        }
    }

    /// Cached buffer for `bno`, loading from the device on a miss.
    pub fn get(&mut self, dev: &BlockDev, bno: u32) -> FsResult<&[u8]> {
        self.load(dev, bno)?;
        Ok(&self.pages[&bno].buf)
    }

    /// Mutable view of the cached buffer. The caller marks the page dirty
    /// once it has actually changed the bytes.
    pub fn get_mut(&mut self, dev: &BlockDev, bno: u32) -> FsResult<&mut Vec<u8>> {
        self.load(dev, bno)?;
        Ok(&mut self.pages.get_mut(&bno).unwrap().buf)
    }

    fn load(&mut self, dev: &BlockDev, bno: u32) -> FsResult<()> {
        if !self.pages.contains_key(&bno) {
            let buf = dev.read_block(bno)?;
            self.pages.insert(bno, Page { buf, dirty: false });
        }
        Ok(())
    }

    /// Install `buf` as the cached contents of `bno` without reading the
    /// device, marking the page dirty. Used for freshly allocated blocks so
    /// stale disk bytes are never observed.
    pub fn install(&mut self, bno: u32, buf: Vec<u8>) {
        self.pages.insert(bno, Page { buf, dirty: true });
    }

    pub fn mark_dirty(&mut self, bno: u32) {
        if let Some(page) = self.pages.get_mut(&bno) {
            page.dirty = true;
        }
    }

    pub fn is_dirty(&self, bno: u32) -> bool {
        self.pages.get(&bno).map(|p| p.dirty).unwrap_or(false)
    }

    /// Write the buffer back if dirty and clear the flag.
    pub fn flush(&mut self, dev: &mut BlockDev, bno: u32) -> FsResult<()> {
        if let Some(page) = self.pages.get_mut(&bno) {
            if page.dirty {
                dev.write_block(bno, &page.buf)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush a set of blocks; the journal uses this for ordered data ahead
    /// of a commit.
    pub fn flush_set<I>(&mut self, dev: &mut BlockDev, blocks: I) -> FsResult<()>
    where
        I: IntoIterator<Item = u32>,
    {
        for bno in blocks {
            self.flush(dev, bno)?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self, dev: &mut BlockDev) -> FsResult<()> {
        let dirty: Vec<u32> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(bno, _)| *bno)
            .collect();
        self.flush_set(dev, dirty)
    }

    /// Drop the entry after writing back any dirty contents. Used when a
    /// block is freed and its number may be reallocated.
    pub fn invalidate(&mut self, dev: &mut BlockDev, bno: u32) -> FsResult<()> {
        self.flush(dev, bno)?;
        self.pages.remove(&bno);
        Ok(())
    }

    /// Drop the entry unconditionally, dirty or not. This is the transaction
    /// abort path: staged contents are discarded so the next access reloads
    /// the committed bytes from the device.
    pub fn discard(&mut self, bno: u32) {
        self.pages.remove(&bno);
    }
}
