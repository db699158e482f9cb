//! Top-level store: opens a single file, holds the in-memory tree root and
//! free list, and drives the commit sequence that makes a mutation durable.
//!
//! Every `set`/`del` is its own transaction: mutate the in-memory tree and
//! pager, then commit immediately. There is no explicit `begin`/`rollback`
//! surface because nothing above this layer needs one; should a commit fail
//! partway through, the mutation is unwound and the error is handed back to
//! the caller.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::free_list::FreeList;
use crate::page::{BTREE_MAX_KEY_SIZE, BTREE_MAX_VAL_SIZE, PAGE_SIZE};
use crate::pager::Pager;

const META_SIG: &[u8; 16] = b"BuildingDB\0\0\0\0\0\0";
const META_ROOT: usize = 16;
const META_PAGE_COUNT: usize = 24;
const META_FREE_HEAD: usize = 32;
const META_FREE_HEAD_SEQ: usize = 40;
const META_FREE_TAIL: usize = 48;
const META_FREE_TAIL_SEQ: usize = 56;

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::KeyEmpty);
    }
    if key.len() > BTREE_MAX_KEY_SIZE {
        return Err(Error::KeyTooLong);
    }
    Ok(())
}

fn validate_val(val: &[u8]) -> Result<()> {
    if val.len() > BTREE_MAX_VAL_SIZE {
        return Err(Error::ValTooLong);
    }
    Ok(())
}

/// Fsyncs the directory a freshly created file lives in, so the directory
/// entry itself survives a crash immediately after creation (a data fsync
/// alone does not guarantee the entry is durable).
fn fsync_parent_dir(path: &Path) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}

/// An embedded, single-file, crash-tolerant ordered key-value store.
pub struct KV {
    #[allow(dead_code)]
    path: PathBuf,
    pager: Pager,
    tree: BTree,
    /// The meta page bytes as of the last successful commit, kept around so
    /// a failed meta write can be retried before any new work proceeds.
    last_meta: Vec<u8>,
    /// Set when a commit failed after pages were durably written but before
    /// the meta page was durably updated to point at them. Must be cleared
    /// by rewriting `last_meta` before any further operation is allowed.
    failed: bool,
}

impl KV {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<KV> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if !existed {
            fsync_parent_dir(&path)?;
        }
        let len = file.metadata()?.len();
        let kv = if len == 0 {
            Self::create_new(path, file)?
        } else {
            Self::load_existing(path, file)?
        };
        Ok(kv)
    }

    fn create_new(path: PathBuf, file: File) -> Result<KV> {
        debug!("kv: creating new database at {:?}", path);
        // Page 0 is reserved for the meta page, so the pager's page numbering
        // starts at 1 even before anything has actually been written there.
        let mut pager = Pager::new(file, 1, FreeList::default())?;
        let free_list = FreeList::create(&mut pager);
        pager.free_list = free_list;

        let mut kv = KV {
            path,
            pager,
            tree: BTree::new(0),
            last_meta: vec![0u8; PAGE_SIZE],
            failed: false,
        };
        kv.commit()?;
        Ok(kv)
    }

    fn load_existing(path: PathBuf, file: File) -> Result<KV> {
        debug!("kv: opening existing database at {:?}", path);
        let mut meta = vec![0u8; PAGE_SIZE];
        file.read_exact_at(&mut meta, 0)?;
        if &meta[0..16] != META_SIG.as_slice() {
            return Err(Error::Corruption("meta page signature mismatch".into()));
        }
        let root_page = LittleEndian::read_u64(&meta[META_ROOT..META_ROOT + 8]);
        let page_count = LittleEndian::read_u64(&meta[META_PAGE_COUNT..META_PAGE_COUNT + 8]);
        let free_head = LittleEndian::read_u64(&meta[META_FREE_HEAD..META_FREE_HEAD + 8]);
        let free_head_seq = LittleEndian::read_u64(&meta[META_FREE_HEAD_SEQ..META_FREE_HEAD_SEQ + 8]);
        let free_tail = LittleEndian::read_u64(&meta[META_FREE_TAIL..META_FREE_TAIL + 8]);
        let free_tail_seq = LittleEndian::read_u64(&meta[META_FREE_TAIL_SEQ..META_FREE_TAIL_SEQ + 8]);

        // Nothing is in flight on a fresh open, so every pointer the on-disk
        // chain has ever accumulated is eligible for reuse immediately.
        let free_list = FreeList {
            head: free_head,
            head_seq: free_head_seq,
            tail: free_tail,
            tail_seq: free_tail_seq,
            max_seq: free_tail_seq,
        };
        let pager = Pager::new(file, page_count, free_list)?;

        Ok(KV {
            path,
            pager,
            tree: BTree::new(root_page),
            last_meta: meta,
            failed: false,
        })
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.tree.get(&self.pager, key))
    }

    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        validate_key(key)?;
        validate_val(val)?;
        self.recover_if_failed()?;

        let saved_root = self.tree.root;
        self.tree.insert(&mut self.pager, key, val);
        if let Err(e) = self.commit() {
            self.tree.root = saved_root;
            self.pager.abort_commit();
            return Err(e);
        }
        Ok(())
    }

    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        self.recover_if_failed()?;

        let saved_root = self.tree.root;
        if !self.tree.delete(&mut self.pager, key) {
            return Ok(false);
        }
        if let Err(e) = self.commit() {
            self.tree.root = saved_root;
            self.pager.abort_commit();
            return Err(e);
        }
        Ok(true)
    }

    fn recover_if_failed(&mut self) -> Result<()> {
        if !self.failed {
            return Ok(());
        }
        error!("kv: retrying meta page write left over from a previous failed commit");
        self.write_meta_page(&self.last_meta.clone())?;
        self.pager.file().sync_all()?;
        self.failed = false;
        Ok(())
    }

    /// The durability controller: free-list bookkeeping, extend the mapping
    /// to cover any newly appended pages, write and fsync the pages
    /// themselves, then write and fsync the meta page that makes them
    /// reachable. Only after both fsyncs does in-memory state advance.
    fn commit(&mut self) -> Result<()> {
        debug!("kv: commit starting (root page {})", self.tree.root);

        let free_list_snapshot = self.pager.free_list;
        let popn = self.pager.nfree;
        let freed = self.pager.freed_pages();
        let mut free_list = self.pager.free_list;
        free_list.update(&mut self.pager, popn, &freed);
        self.pager.free_list = free_list;

        let required = (self.pager.flushed + self.pager.nappend) * PAGE_SIZE as u64;
        if let Err(e) = self.pager.extend_mmap(required) {
            warn!("kv: commit aborted while extending the mapping: {}", e);
            self.pager.free_list = free_list_snapshot;
            self.pager.abort_commit();
            return Err(e.into());
        }

        if let Err(e) = self.pager.write_pending() {
            warn!("kv: commit aborted while writing pages: {}", e);
            self.pager.free_list = free_list_snapshot;
            self.pager.abort_commit();
            return Err(e.into());
        }
        if let Err(e) = self.pager.fsync() {
            warn!("kv: commit aborted while syncing pages: {}", e);
            self.pager.free_list = free_list_snapshot;
            self.pager.abort_commit();
            return Err(e.into());
        }

        let meta = self.encode_meta();
        if let Err(e) = self.write_meta_page(&meta) {
            error!(
                "kv: commit failed writing the meta page, recovery required before next op: {}",
                e
            );
            self.failed = true;
            return Err(e.into());
        }
        if let Err(e) = self.pager.file().sync_all() {
            error!(
                "kv: commit failed syncing the meta page, recovery required before next op: {}",
                e
            );
            self.failed = true;
            return Err(e.into());
        }

        self.last_meta = meta;
        self.pager.finish_commit();
        Ok(())
    }

    fn encode_meta(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[0..16].copy_from_slice(META_SIG.as_slice());
        LittleEndian::write_u64(&mut buf[META_ROOT..META_ROOT + 8], self.tree.root);
        LittleEndian::write_u64(
            &mut buf[META_PAGE_COUNT..META_PAGE_COUNT + 8],
            self.pager.flushed + self.pager.nappend,
        );
        LittleEndian::write_u64(&mut buf[META_FREE_HEAD..META_FREE_HEAD + 8], self.pager.free_list.head);
        LittleEndian::write_u64(
            &mut buf[META_FREE_HEAD_SEQ..META_FREE_HEAD_SEQ + 8],
            self.pager.free_list.head_seq,
        );
        LittleEndian::write_u64(&mut buf[META_FREE_TAIL..META_FREE_TAIL + 8], self.pager.free_list.tail);
        LittleEndian::write_u64(
            &mut buf[META_FREE_TAIL_SEQ..META_FREE_TAIL_SEQ + 8],
            self.pager.free_list.tail_seq,
        );
        buf
    }

    fn write_meta_page(&self, meta: &[u8]) -> io::Result<()> {
        self.pager.file().write_all_at(meta, 0)
    }
}
