//! Owns the file descriptor, the memory mappings over it, and the set of
//! pending page writes (`updates`) produced by the current transaction.
//! Nothing above this layer ever calls `pwrite`/`mmap` directly.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use log::{debug, trace};
use memmap::{Mmap, MmapOptions};

use crate::free_list::{FreeList, FreeListPager, PageNo};
use crate::page::PAGE_SIZE;

/// First mmap chunk is 64 MiB; each subsequent extension doubles it.
const INITIAL_MMAP_CHUNK: u64 = 64 * 1024 * 1024;

struct MmapChunk {
    /// Page number the chunk's first byte corresponds to.
    start_page: u64,
    mmap: Mmap,
}

pub struct Pager {
    file: File,
    chunks: Vec<MmapChunk>,
    /// Total bytes covered by `chunks`, from page 0.
    mapped_bytes: u64,
    /// Page count as of the last successful commit.
    pub flushed: u64,
    /// Pending writes for the in-flight transaction: `Some(buf)` for a
    /// written page, `None` for one that was freed.
    pub updates: HashMap<PageNo, Option<Vec<u8>>>,
    /// Pages newly appended (never existed on disk before) this transaction.
    pub nappend: u64,
    /// Free-list items consumed by `page_new` this transaction.
    pub nfree: u64,
    pub free_list: FreeList,
}

impl Pager {
    pub fn new(file: File, flushed: u64, free_list: FreeList) -> io::Result<Pager> {
        let mut pager = Pager {
            file,
            chunks: Vec::new(),
            mapped_bytes: 0,
            flushed,
            updates: HashMap::new(),
            nappend: 0,
            nfree: 0,
            free_list,
        };
        pager.extend_mmap(flushed * PAGE_SIZE as u64)?;
        Ok(pager)
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Ensures at least `required_bytes` of the file are memory-mapped.
    /// Growth happens by appending a fresh, non-overlapping chunk rather
    /// than remapping the whole file, since existing chunks may still be
    /// borrowed (in spirit, even though this implementation hands back
    /// owned copies -- see `get`).
    pub fn extend_mmap(&mut self, required_bytes: u64) -> io::Result<()> {
        if self.mapped_bytes >= required_bytes || required_bytes == 0 {
            return Ok(());
        }
        let mut chunk_len = INITIAL_MMAP_CHUNK;
        while self.mapped_bytes + chunk_len < required_bytes {
            chunk_len *= 2;
        }
        let start_page = self.mapped_bytes / PAGE_SIZE as u64;
        // Pre-extend the file so every byte in the new mapping is backed by
        // real (zero-filled) file content; mapping past the current end of
        // file would otherwise fault on first touch.
        let new_len = self.mapped_bytes + chunk_len;
        if self.file.metadata()?.len() < new_len {
            self.file.set_len(new_len)?;
        }
        let mmap = unsafe {
            MmapOptions::new()
                .offset(self.mapped_bytes)
                .len(chunk_len as usize)
                .map(&self.file)?
        };
        debug!(
            "pager: mapped {} bytes at page {} (total mapped now {} bytes)",
            chunk_len,
            start_page,
            self.mapped_bytes + chunk_len
        );
        self.chunks.push(MmapChunk { start_page, mmap });
        self.mapped_bytes += chunk_len;
        Ok(())
    }

    fn mapped_slice(&self, ptr: PageNo) -> &[u8] {
        for chunk in self.chunks.iter().rev() {
            if ptr >= chunk.start_page {
                let byte_off = ((ptr - chunk.start_page) as usize) * PAGE_SIZE;
                if byte_off + PAGE_SIZE <= chunk.mmap.len() {
                    return &chunk.mmap[byte_off..byte_off + PAGE_SIZE];
                }
            }
        }
        panic!("pager: page {} is not covered by any mmap chunk", ptr);
    }

    /// Returns the current content of page `ptr`: the pending write if one
    /// exists for this transaction, else the committed, mapped content.
    pub fn get(&self, ptr: PageNo) -> Vec<u8> {
        assert!(ptr != 0, "pager: page 0 is the null sentinel / meta page");
        if let Some(pending) = self.updates.get(&ptr) {
            return pending
                .clone()
                .expect("pager: read of a page freed earlier in this transaction");
        }
        self.mapped_slice(ptr).to_vec()
    }

    /// Allocates a page number for a newly written node, preferring a
    /// recycled free-list entry over extending the file.
    pub fn page_new(&mut self, buf: Vec<u8>) -> PageNo {
        let free = self.free_list;
        let ptr = if self.nfree < free.available() {
            let p = free.get(self, self.nfree);
            self.nfree += 1;
            trace!("pager: page_new recycled free-list page {}", p);
            p
        } else {
            let p = self.flushed + self.nappend;
            self.nappend += 1;
            trace!("pager: page_new appended new page {}", p);
            p
        };
        self.updates.insert(ptr, Some(buf));
        ptr
    }

    /// Marks a page as freed; it will be handed to the free list at commit.
    pub fn page_del(&mut self, ptr: PageNo) {
        trace!("pager: page_del {}", ptr);
        self.updates.insert(ptr, None);
    }

    /// Always appends a brand new page, bypassing free-list recycling. Used
    /// only by the free list itself, to avoid recursively consuming its own
    /// pointers while constructing its own chain.
    pub fn page_append(&mut self, buf: Vec<u8>) -> PageNo {
        let p = self.flushed + self.nappend;
        self.nappend += 1;
        self.updates.insert(p, Some(buf));
        p
    }

    /// Every page with a pending non-null buffer, for the write phase of
    /// commit.
    pub fn pending_writes(&self) -> impl Iterator<Item = (PageNo, &[u8])> {
        self.updates
            .iter()
            .filter_map(|(p, v)| v.as_ref().map(|b| (*p, b.as_slice())))
    }

    /// Every page freed (not written) this transaction.
    pub fn freed_pages(&self) -> Vec<PageNo> {
        self.updates
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn write_pending(&self) -> io::Result<()> {
        for (ptr, buf) in self.pending_writes() {
            self.file.write_all_at(buf, ptr * PAGE_SIZE as u64)?;
        }
        Ok(())
    }

    pub fn fsync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Clears per-transaction bookkeeping after a successful commit.
    pub fn finish_commit(&mut self) {
        self.flushed += self.nappend;
        self.updates.clear();
        self.nappend = 0;
        self.nfree = 0;
        self.free_list.set_max_seq();
    }

    /// Discards a failed transaction's pending writes without advancing
    /// `flushed` or the free list.
    pub fn abort_commit(&mut self) {
        self.updates.clear();
        self.nappend = 0;
        self.nfree = 0;
    }
}

impl FreeListPager for Pager {
    fn read_page(&self, ptr: PageNo) -> Vec<u8> {
        self.get(ptr)
    }
    fn append_page(&mut self, buf: Vec<u8>) -> PageNo {
        self.page_append(buf)
    }
    fn reuse_page(&mut self, ptr: PageNo, buf: Vec<u8>) {
        self.updates.insert(ptr, Some(buf));
    }
}
