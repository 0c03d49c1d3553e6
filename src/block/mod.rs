//! # Block Layer
//!
//! Fixed-size, self-describing blocks and the machinery to pin and lock
//! them. Every block starts with a common header carrying its own block
//! number and the sequence number of the transaction that last modified it:
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  -------------------------------------------
//! 0       8     blkno   Block number, little-endian
//! 8       8     seq     Dirty sequence stamped on last modification
//! ```
//!
//! ## References
//!
//! A [`BlockRef`] is the `(blkno, seq)` pair a parent item stores to address
//! a child. The embedded sequence serves two purposes: it detects stale or
//! misdirected references on read, and it lets sequence-filtered iteration
//! prune an entire subtree whose reference is older than the caller's floor.
//!
//! ## Pinning and locking
//!
//! Loaded blocks live in heap buffers behind `Arc<RwLock<..>>` cells. A
//! [`BlockHandle`] clone is a pin; a [`BlockGuard`] is a pin plus a held
//! lock. Guards are the owned (`Arc`-based) parking_lot variants, so a
//! cursor can carry its leaf's lock out of the walker and release both lock
//! and pin in one drop. Error paths unwind by dropping guards; nothing needs
//! manual unlock bookkeeping.

mod manager;
mod store;

pub use manager::BlockManager;
pub use store::BlockStore;

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOCK_HEADER_SIZE, BLOCK_SIZE};
use crate::zerocopy_accessors;

/// Common header at the front of every block.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    blkno: U64,
    seq: U64,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    pub fn new(blkno: u64, seq: u64) -> Self {
        Self {
            blkno: U64::new(blkno),
            seq: U64::new(seq),
        }
    }

    zerocopy_accessors! {
        blkno: u64,
        seq: u64,
    }
}

/// A reference to a block: its number plus the sequence observed when the
/// reference was written. Stored verbatim as the value of parent items.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct BlockRef {
    blkno: U64,
    seq: U64,
}

impl BlockRef {
    pub fn new(blkno: u64, seq: u64) -> Self {
        Self {
            blkno: U64::new(blkno),
            seq: U64::new(seq),
        }
    }

    pub fn null() -> Self {
        Self::new(0, 0)
    }

    pub fn is_null(&self) -> bool {
        self.blkno.get() == 0
    }

    zerocopy_accessors! {
        blkno: u64,
        seq: u64,
    }
}

/// The root record: tree height plus the reference to the top block.
/// `height == 0` means the tree is empty. Persisted in the superblock.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RootRecord {
    pub height: u8,
    _pad: [u8; 7],
    pub blkref: BlockRef,
}

impl RootRecord {
    pub fn empty() -> Self {
        Self {
            height: 0,
            _pad: [0; 7],
            blkref: BlockRef::null(),
        }
    }
}

/// An in-memory block buffer. Exactly one exists per live block number; the
/// block manager hands out shared handles to it.
pub struct BlockBuf {
    data: Box<[u8; BLOCK_SIZE]>,
}

impl BlockBuf {
    pub(crate) fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn hdr(&self) -> &BlockHeader {
        // INVARIANT: the buffer is always BLOCK_SIZE bytes
        BlockHeader::ref_from_bytes(&self.data[..BLOCK_HEADER_SIZE]).unwrap()
    }

    pub fn hdr_mut(&mut self) -> &mut BlockHeader {
        // INVARIANT: the buffer is always BLOCK_SIZE bytes
        BlockHeader::mut_from_bytes(&mut self.data[..BLOCK_HEADER_SIZE]).unwrap()
    }

    /// The reference other blocks should store to point at this block as it
    /// currently stands.
    pub fn self_ref(&self) -> BlockRef {
        BlockRef::new(self.hdr().blkno(), self.hdr().seq())
    }
}

pub(crate) type BlockCell = Arc<RwLock<BlockBuf>>;

/// A pinned block. Cloning the handle clones the pin; the buffer is not
/// reclaimed while any handle or guard is alive.
#[derive(Clone)]
pub struct BlockHandle {
    cell: BlockCell,
}

impl BlockHandle {
    pub(crate) fn from_cell(cell: BlockCell) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &BlockCell {
        &self.cell
    }

    pub fn lock_read(&self) -> BlockGuard {
        BlockGuard::Read(self.cell.read_arc())
    }

    pub fn lock_write(&self) -> BlockGuard {
        BlockGuard::Write(self.cell.write_arc())
    }
}

/// A pinned and locked block. Read guards are shared, write guards
/// exclusive; the walker couples these down the tree and hands the leaf's
/// guard to the cursor.
pub enum BlockGuard {
    Read(ArcRwLockReadGuard<RawRwLock, BlockBuf>),
    Write(ArcRwLockWriteGuard<RawRwLock, BlockBuf>),
}

impl BlockGuard {
    pub fn is_write(&self) -> bool {
        matches!(self, BlockGuard::Write(_))
    }

    pub(crate) fn block_mut(&mut self) -> &mut BlockBuf {
        match self {
            BlockGuard::Write(g) => &mut *g,
            // INVARIANT: dirty walks lock every block exclusively
            BlockGuard::Read(_) => unreachable!("mutable access through a shared block guard"),
        }
    }
}

impl Deref for BlockGuard {
    type Target = BlockBuf;

    fn deref(&self) -> &BlockBuf {
        match self {
            BlockGuard::Read(g) => g,
            BlockGuard::Write(g) => g,
        }
    }
}
