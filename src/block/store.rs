//! # Memory-Mapped Block Store
//!
//! The persistent side of the block layer: one file of `BLOCK_SIZE` blocks
//! accessed through a mutable memory map. Block 0 is the superblock; tree
//! blocks start at 1.
//!
//! The store is deliberately dumb. It knows nothing about dirtiness,
//! copy-on-write, or the tree; it hands out block-sized byte slices, grows
//! the file, and flushes the map. The block manager drives it only at
//! transaction commit, writing every dirty block and then the superblock, so
//! a torn commit leaves the previous superblock pointing at blocks that were
//! never overwritten.
//!
//! ## File format
//!
//! ```text
//! Offset 0:      Superblock (block 0)
//! Offset 4096:   Block 1
//! Offset 8192:   Block 2
//! ...
//! ```
//!
//! The file size is always a multiple of `BLOCK_SIZE`.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::block::{BlockHeader, RootRecord};
use crate::config::{
    BLOCK_SIZE, FORMAT_VERSION, SUPER_BLKNO, SUPER_FREE_CAP, SUPER_MAGIC,
};
use crate::error::{Error, Result};
use crate::zerocopy_accessors;

/// The superblock: root record, dirty-sequence cursor, allocation state.
/// Rewritten atomically (data blocks first, then this) at every commit.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SuperBlock {
    hdr: BlockHeader,
    magic: U64,
    version: U32,
    _pad: U32,
    total_blocks: U64,
    next_seq: U64,
    root: RootRecord,
    nr_free: U16,
    _pad2: [u8; 6],
    free: [U64; SUPER_FREE_CAP],
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() <= BLOCK_SIZE);

impl SuperBlock {
    pub fn new(root: &RootRecord, next_seq: u64, total_blocks: u64, free: &[u64]) -> Self {
        debug_assert!(free.len() <= SUPER_FREE_CAP);
        let mut sb = Self {
            hdr: BlockHeader::new(SUPER_BLKNO, next_seq),
            magic: U64::new(SUPER_MAGIC),
            version: U32::new(FORMAT_VERSION),
            _pad: U32::new(0),
            total_blocks: U64::new(total_blocks),
            next_seq: U64::new(next_seq),
            root: *root,
            nr_free: U16::new(free.len() as u16),
            _pad2: [0; 6],
            free: [U64::new(0); SUPER_FREE_CAP],
        };
        for (slot, &blkno) in sb.free.iter_mut().zip(free) {
            *slot = U64::new(blkno);
        }
        sb
    }

    pub fn root(&self) -> RootRecord {
        self.root
    }

    pub fn free_list(&self) -> Vec<u64> {
        self.free[..self.nr_free.get() as usize]
            .iter()
            .map(|v| v.get())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic.get() != SUPER_MAGIC {
            return Err(Error::integrity(format!(
                "bad superblock magic {:#018x}",
                self.magic.get()
            )));
        }
        if self.version.get() != FORMAT_VERSION {
            return Err(Error::integrity(format!(
                "unsupported format version {}",
                self.version.get()
            )));
        }
        if self.total_blocks.get() == 0 {
            return Err(Error::integrity("superblock claims zero blocks"));
        }
        Ok(())
    }

    zerocopy_accessors! {
        total_blocks: u64,
        next_seq: u64,
    }
}

/// A file of `BLOCK_SIZE` blocks behind a mutable memory map.
#[derive(Debug)]
pub struct BlockStore {
    file: std::fs::File,
    mmap: MmapMut,
    block_count: u64,
}

impl BlockStore {
    pub fn create<P: AsRef<Path>>(path: P, initial_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let initial_blocks = initial_blocks.max(1);
        file.set_len(initial_blocks * BLOCK_SIZE as u64)?;

        // SAFETY: the file was just created with exclusive access and sized
        // to a whole number of blocks; the map's lifetime is tied to this
        // struct and every access is bounds-checked against block_count.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            block_count: initial_blocks,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        if len == 0 || len % BLOCK_SIZE as u64 != 0 {
            return Err(Error::integrity(format!(
                "store size {len} is not a positive multiple of the block size"
            )));
        }

        // SAFETY: same reasoning as create(); the store assumes no external
        // process mutates the file while it is mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            block_count: len / BLOCK_SIZE as u64,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn block(&self, blkno: u64) -> Result<&[u8]> {
        self.check_bounds(blkno)?;
        let off = blkno as usize * BLOCK_SIZE;
        Ok(&self.mmap[off..off + BLOCK_SIZE])
    }

    pub fn block_mut(&mut self, blkno: u64) -> Result<&mut [u8]> {
        self.check_bounds(blkno)?;
        let off = blkno as usize * BLOCK_SIZE;
        Ok(&mut self.mmap[off..off + BLOCK_SIZE])
    }

    /// Extends the file to hold at least `new_count` blocks and remaps.
    pub fn grow(&mut self, new_count: u64) -> Result<()> {
        if new_count <= self.block_count {
            return Ok(());
        }

        self.mmap.flush()?;
        self.file.set_len(new_count * BLOCK_SIZE as u64)?;

        // SAFETY: grow takes &mut self so no block slices are outstanding;
        // the old map was flushed and the file extended before remapping.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.block_count = new_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    pub fn read_super(&self) -> Result<SuperBlock> {
        let bytes = self.block(SUPER_BLKNO)?;
        // INVARIANT: SuperBlock fits in one block (compile-time assertion)
        let sb = SuperBlock::read_from_bytes(&bytes[..std::mem::size_of::<SuperBlock>()]).unwrap();
        sb.validate()?;
        Ok(sb)
    }

    pub fn write_super(&mut self, sb: &SuperBlock) -> Result<()> {
        let bytes = self.block_mut(SUPER_BLKNO)?;
        bytes[..std::mem::size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
        Ok(())
    }

    fn check_bounds(&self, blkno: u64) -> Result<()> {
        if blkno >= self.block_count {
            return Err(Error::integrity(format!(
                "block {blkno} beyond store end ({} blocks)",
                self.block_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_round_trips_the_superblock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let mut store = BlockStore::create(&path, 1).unwrap();
            let sb = SuperBlock::new(&RootRecord::empty(), 1, 1, &[]);
            store.write_super(&sb).unwrap();
            store.sync().unwrap();
        }

        let store = BlockStore::open(&path).unwrap();
        let sb = store.read_super().unwrap();
        assert_eq!(sb.next_seq(), 1);
        assert_eq!(sb.total_blocks(), 1);
        assert_eq!(sb.root().height, 0);
    }

    #[test]
    fn open_rejects_truncated_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE / 2]).unwrap();

        let err = BlockStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn read_super_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE]).unwrap();

        let store = BlockStore::open(&path).unwrap();
        assert!(matches!(store.read_super(), Err(Error::Integrity(_))));
    }

    #[test]
    fn grow_preserves_block_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let mut store = BlockStore::create(&path, 2).unwrap();
        store.block_mut(1).unwrap().fill(0xab);
        store.grow(8).unwrap();

        assert_eq!(store.block_count(), 8);
        assert!(store.block(1).unwrap().iter().all(|&b| b == 0xab));
        assert!(store.block(7).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn superblock_free_list_round_trips() {
        let sb = SuperBlock::new(&RootRecord::empty(), 3, 10, &[4, 7, 9]);
        assert_eq!(sb.free_list(), vec![4, 7, 9]);
    }
}
