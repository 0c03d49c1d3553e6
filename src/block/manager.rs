//! # Block Manager
//!
//! Owns the traffic between in-memory block buffers and the store, and
//! enforces the copy-on-write discipline the tree depends on:
//!
//! - **Clean blocks are immutable.** A block whose `seq` is below the
//!   current dirty sequence is never written through; dirtying it allocates
//!   a fresh block number, copies the contents, stamps the new header, and
//!   rewrites the caller's reference. Readers holding the old buffer keep a
//!   consistent view.
//! - **Dirty blocks are stable.** A block dirtied in the current transaction
//!   keeps its number, so repeated dirtying of the same path costs nothing
//!   after the first pass. This is what makes `dirty` + `update` a
//!   cannot-fail pair: once the path is dirtied, a later walk over it only
//!   takes cache hits.
//! - **Freed numbers wait for commit.** Block numbers released by merges,
//!   collapses, or copy-on-write go on a pending list and only become
//!   allocatable after the superblock that stops referencing them is on
//!   disk. Reusing them earlier would let a torn commit corrupt the
//!   previous tree.
//!
//! Commit writes every dirty block, flushes, writes the superblock (root
//! record, advanced sequence, free list), flushes again, and only then
//! recycles pending block numbers and advances the in-memory sequence.
//!
//! The cache is a flat map of block number to buffer cell. Pins are `Arc`
//! clones, so removing a cell from the map never invalidates an outstanding
//! handle or cursor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::block::store::{BlockStore, SuperBlock};
use crate::block::{BlockBuf, BlockCell, BlockHandle, BlockRef, RootRecord};
use crate::config::{SUPER_BLKNO, SUPER_FREE_CAP};
use crate::error::{Error, Result};

struct AllocState {
    free: Vec<u64>,
    pending_free: Vec<u64>,
    next_blkno: u64,
}

pub struct BlockManager {
    store: Mutex<BlockStore>,
    cache: Mutex<HashMap<u64, BlockCell>>,
    alloc: Mutex<AllocState>,
    dirty: Mutex<HashSet<u64>>,
    seq: AtomicU64,
}

impl BlockManager {
    /// Creates a new store at `path` and returns the manager plus the empty
    /// root record.
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> Result<(Self, RootRecord)> {
        let mut store = BlockStore::create(path, 1)?;
        let root = RootRecord::empty();

        let sb = SuperBlock::new(&root, 1, 1, &[]);
        store.write_super(&sb)?;
        store.sync()?;

        let mgr = Self {
            store: Mutex::new(store),
            cache: Mutex::new(HashMap::new()),
            alloc: Mutex::new(AllocState {
                free: Vec::new(),
                pending_free: Vec::new(),
                next_blkno: 1,
            }),
            dirty: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(1),
        };
        Ok((mgr, root))
    }

    /// Opens an existing store and returns the manager plus the committed
    /// root record.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<(Self, RootRecord)> {
        let store = BlockStore::open(path)?;
        let sb = store.read_super()?;
        let root = sb.root();

        let mgr = Self {
            store: Mutex::new(store),
            cache: Mutex::new(HashMap::new()),
            alloc: Mutex::new(AllocState {
                free: sb.free_list(),
                pending_free: Vec::new(),
                next_blkno: sb.total_blocks(),
            }),
            dirty: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(sb.next_seq()),
        };
        Ok((mgr, root))
    }

    /// The current dirty sequence; stamped into every block and item
    /// modified before the next commit.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Allocates a zeroed block, dirty at the current sequence. The caller
    /// links it into the tree and initializes its contents.
    pub fn alloc_dirty(&self) -> Result<BlockHandle> {
        let seq = self.seq();
        let blkno = self.alloc_blkno();

        let mut buf = BlockBuf::zeroed();
        buf.hdr_mut().set_blkno(blkno);
        buf.hdr_mut().set_seq(seq);

        let cell: BlockCell = Arc::new(RwLock::new(buf));
        self.cache.lock().insert(blkno, cell.clone());
        self.dirty.lock().insert(blkno);

        trace!(blkno, seq, "allocated dirty block");
        Ok(BlockHandle::from_cell(cell))
    }

    /// Fetches the block a reference points at, shared. The stored header
    /// must agree with the reference; anything else means the reference is
    /// stale or the store handed back the wrong block.
    pub fn read_ref(&self, r: &BlockRef) -> Result<BlockHandle> {
        let cell = self.lookup_cell(r.blkno())?;
        {
            let buf = cell.read();
            let hdr = buf.hdr();
            if hdr.blkno() != r.blkno() || hdr.seq() != r.seq() {
                return Err(Error::integrity(format!(
                    "stale reference: want block {} seq {}, found block {} seq {}",
                    r.blkno(),
                    r.seq(),
                    hdr.blkno(),
                    hdr.seq()
                )));
            }
        }
        Ok(BlockHandle::from_cell(cell))
    }

    /// Fetches the block a reference points at in writable form, copying on
    /// write if it is clean. The reference is rewritten in place to the
    /// block's current `(blkno, seq)` before this returns, so the caller can
    /// store it back into the parent while still holding the parent's lock.
    pub fn dirty_ref(&self, r: &mut BlockRef) -> Result<BlockHandle> {
        let seq = self.seq();
        let handle = self.read_ref(r)?;

        let block_seq = handle.cell().read().hdr().seq();
        if block_seq == seq {
            return Ok(handle);
        }

        let old_blkno = r.blkno();
        let new_blkno = self.alloc_blkno();

        let mut buf = BlockBuf::zeroed();
        {
            let old = handle.cell().read();
            buf.bytes_mut().copy_from_slice(old.bytes());
        }
        buf.hdr_mut().set_blkno(new_blkno);
        buf.hdr_mut().set_seq(seq);

        let cell: BlockCell = Arc::new(RwLock::new(buf));
        self.cache.lock().insert(new_blkno, cell.clone());
        self.dirty.lock().insert(new_blkno);
        self.alloc.lock().pending_free.push(old_blkno);

        *r = BlockRef::new(new_blkno, seq);
        trace!(old_blkno, new_blkno, seq, "copied block for write");
        Ok(BlockHandle::from_cell(cell))
    }

    /// Returns a block number to the allocator. The number becomes reusable
    /// only after the next commit; until then the old superblock may still
    /// reference it.
    pub fn free(&self, blkno: u64) {
        self.cache.lock().remove(&blkno);
        self.dirty.lock().remove(&blkno);
        self.alloc.lock().pending_free.push(blkno);
        trace!(blkno, "freed block");
    }

    /// Writes all dirty blocks, then the superblock carrying `root`, then
    /// advances the dirty sequence. On return the transaction is durable and
    /// every block it touched is clean.
    pub fn commit(&self, root: &RootRecord) -> Result<()> {
        let seq = self.seq();

        let dirty: Vec<u64> = self.dirty.lock().iter().copied().collect();
        let cells: Vec<(u64, BlockCell)> = {
            let cache = self.cache.lock();
            let mut cells = Vec::with_capacity(dirty.len());
            for &blkno in &dirty {
                match cache.get(&blkno) {
                    Some(cell) => cells.push((blkno, cell.clone())),
                    None => {
                        return Err(Error::integrity(format!(
                            "dirty block {blkno} missing from cache"
                        )))
                    }
                }
            }
            cells
        };

        let (total_blocks, free_all) = {
            let alloc = self.alloc.lock();
            let mut free_all = alloc.free.clone();
            free_all.extend_from_slice(&alloc.pending_free);
            (alloc.next_blkno, free_all)
        };

        if free_all.len() > SUPER_FREE_CAP {
            warn!(
                dropped = free_all.len() - SUPER_FREE_CAP,
                "free list overflows the superblock; leaking block numbers"
            );
        }
        let free_persisted = &free_all[..free_all.len().min(SUPER_FREE_CAP)];

        {
            let mut store = self.store.lock();
            store.grow(total_blocks)?;
            for (blkno, cell) in &cells {
                let buf = cell.read();
                store.block_mut(*blkno)?.copy_from_slice(buf.bytes());
            }
            store.sync()?;

            let sb = SuperBlock::new(root, seq + 1, total_blocks, free_persisted);
            store.write_super(&sb)?;
            store.sync()?;
        }

        self.dirty.lock().clear();
        let pending: Vec<u64> = {
            let mut alloc = self.alloc.lock();
            let pending = std::mem::take(&mut alloc.pending_free);
            alloc.free.extend_from_slice(&pending);
            pending
        };
        {
            let mut cache = self.cache.lock();
            for blkno in pending {
                cache.remove(&blkno);
            }
        }
        self.seq.store(seq + 1, Ordering::Release);

        debug!(seq, blocks = cells.len(), "committed transaction");
        Ok(())
    }

    fn alloc_blkno(&self) -> u64 {
        let mut alloc = self.alloc.lock();
        alloc.free.pop().unwrap_or_else(|| {
            let blkno = alloc.next_blkno;
            alloc.next_blkno += 1;
            blkno
        })
    }

    /// Cache hit or load from the store. Never returns the superblock.
    fn lookup_cell(&self, blkno: u64) -> Result<BlockCell> {
        if blkno == SUPER_BLKNO {
            return Err(Error::integrity("reference to the superblock"));
        }

        let mut cache = self.cache.lock();
        if let Some(cell) = cache.get(&blkno) {
            return Ok(cell.clone());
        }

        let store = self.store.lock();
        let mut buf = BlockBuf::zeroed();
        buf.bytes_mut().copy_from_slice(store.block(blkno)?);
        drop(store);

        let cell: BlockCell = Arc::new(RwLock::new(buf));
        cache.insert(blkno, cell.clone());
        Ok(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, BlockManager, RootRecord) {
        let dir = tempdir().unwrap();
        let (mgr, root) = BlockManager::create(dir.path().join("t.db")).unwrap();
        (dir, mgr, root)
    }

    #[test]
    fn alloc_stamps_blkno_and_current_seq() {
        let (_dir, mgr, _root) = manager();

        let h = mgr.alloc_dirty().unwrap();
        let g = h.lock_read();
        assert_eq!(g.hdr().blkno(), 1);
        assert_eq!(g.hdr().seq(), 1);
    }

    #[test]
    fn read_ref_rejects_stale_seq() {
        let (_dir, mgr, _root) = manager();

        let h = mgr.alloc_dirty().unwrap();
        let r = h.lock_read().self_ref();

        let stale = BlockRef::new(r.blkno(), r.seq() + 7);
        assert!(matches!(mgr.read_ref(&stale), Err(Error::Integrity(_))));
        assert!(mgr.read_ref(&r).is_ok());
    }

    #[test]
    fn dirty_ref_is_a_no_op_within_one_transaction() {
        let (_dir, mgr, _root) = manager();

        let h = mgr.alloc_dirty().unwrap();
        let mut r = h.lock_read().self_ref();
        let before = r;

        mgr.dirty_ref(&mut r).unwrap();
        assert_eq!(r, before);
    }

    #[test]
    fn dirty_ref_copies_clean_blocks_to_a_new_blkno() {
        let (dir, mgr, root) = manager();
        let _ = dir;

        let h = mgr.alloc_dirty().unwrap();
        h.lock_write().block_mut().bytes_mut()[100] = 0x5a;
        let mut r = h.lock_read().self_ref();
        mgr.commit(&root).unwrap();

        let old = r;
        let h2 = mgr.dirty_ref(&mut r).unwrap();
        assert_ne!(r.blkno(), old.blkno());
        assert_eq!(r.seq(), 2);

        let g = h2.lock_read();
        assert_eq!(g.bytes()[100], 0x5a);
        assert_eq!(g.hdr().blkno(), r.blkno());

        // the clean original is untouched
        let g_old = mgr.read_ref(&old).unwrap().lock_read();
        assert_eq!(g_old.hdr().seq(), 1);
    }

    #[test]
    fn freed_blocks_are_reused_only_after_commit() {
        let (_dir, mgr, root) = manager();

        let h = mgr.alloc_dirty().unwrap();
        let blkno = h.lock_read().hdr().blkno();
        drop(h);
        mgr.free(blkno);

        let h2 = mgr.alloc_dirty().unwrap();
        assert_ne!(h2.lock_read().hdr().blkno(), blkno);

        mgr.commit(&root).unwrap();
        let h3 = mgr.alloc_dirty().unwrap();
        assert_eq!(h3.lock_read().hdr().blkno(), blkno);
    }

    #[test]
    fn commit_persists_blocks_and_reopen_sees_them() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let r = {
            let (mgr, root) = BlockManager::create(&path).unwrap();
            let h = mgr.alloc_dirty().unwrap();
            h.lock_write().block_mut().bytes_mut()[200] = 0x77;
            let r = h.lock_read().self_ref();
            mgr.commit(&root).unwrap();
            r
        };

        let (mgr, _root) = BlockManager::open(&path).unwrap();
        assert_eq!(mgr.seq(), 2);
        let g = mgr.read_ref(&r).unwrap().lock_read();
        assert_eq!(g.bytes()[200], 0x77);
    }

    #[test]
    fn uncommitted_blocks_do_not_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let r = {
            let (mgr, _root) = BlockManager::create(&path).unwrap();
            let h = mgr.alloc_dirty().unwrap();
            h.lock_read().self_ref()
        };

        let (mgr, _root) = BlockManager::open(&path).unwrap();
        assert!(mgr.read_ref(&r).is_err());
    }
}
