//! # Configuration Constants
//!
//! Centralizes the on-disk layout constants and structural tunables. Values
//! that derive from each other are co-located so a change to one is checked
//! against its dependents by the compile-time assertions below.
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> BLOCK_HEADER_SIZE (16 bytes: blkno + seq)
//!       │
//!       ├─> NODE_HEADER_SIZE (BLOCK_HEADER_SIZE + nr_items/free_end/free_reclaim)
//!       │     The offset array begins here; items pack downward from
//!       │     BLOCK_SIZE toward it.
//!       │
//!       ├─> MAX_VAL_LEN (largest value a single item can carry)
//!       │
//!       └─> FREE_LIMIT (merge threshold, must stay well below half the
//!             payload capacity or split and merge oscillate)
//! ```

/// Size of each tree block in bytes. This is the unit of allocation, I/O,
/// and copy-on-write.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the common block header (`blkno` + `seq`) at the front of every
/// block, including the superblock.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of the B-tree region header that follows the common header:
/// `nr_items`, `free_end`, and `free_reclaim`, two bytes each.
pub const NODE_HEADER_SIZE: usize = BLOCK_HEADER_SIZE + 6;

/// Size of one entry in the item offset array.
pub const OFFSET_SLOT_SIZE: usize = 2;

/// Size of a fixed tree key in bytes.
pub const KEY_SIZE: usize = 16;

/// Size of the per-item header: key, sequence number, value length.
pub const ITEM_HEADER_SIZE: usize = KEY_SIZE + 8 + 2;

/// Size of a block reference (`blkno` + `seq`), the value payload of every
/// parent item.
pub const BLOCK_REF_SIZE: usize = 16;

/// Largest value payload a single item can carry. Bounded at a quarter of
/// the block payload so that splitting a full block always leaves the
/// chosen side with room for one more maximal item.
pub const MAX_VAL_LEN: usize =
    (BLOCK_SIZE - NODE_HEADER_SIZE) / 4 - OFFSET_SLOT_SIZE - ITEM_HEADER_SIZE;

/// Upper bound on items per block, reached when every value is empty. Sizes
/// the compaction scratch array.
pub const MAX_BLOCK_ITEMS: usize =
    (BLOCK_SIZE - NODE_HEADER_SIZE) / (OFFSET_SLOT_SIZE + ITEM_HEADER_SIZE);

/// Reclaimable-free threshold above which a block descended through for
/// deletion tries to merge with a sibling.
pub const FREE_LIMIT: usize = BLOCK_SIZE / 8;

/// Block number of the superblock.
pub const SUPER_BLKNO: u64 = 0;

/// Magic stamped into the superblock: "seqtree\0" as a little-endian u64.
pub const SUPER_MAGIC: u64 = u64::from_le_bytes(*b"seqtree\0");

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Capacity of the free-list array persisted in the superblock.
pub const SUPER_FREE_CAP: usize = 500;

const _: () = assert!(
    FREE_LIMIT < (BLOCK_SIZE - NODE_HEADER_SIZE) / 2,
    "FREE_LIMIT must stay below half the payload capacity to keep split and merge from oscillating"
);

const _: () = assert!(
    MAX_VAL_LEN <= u16::MAX as usize,
    "value lengths are stored in a u16 item header field"
);

const _: () = assert!(
    BLOCK_SIZE <= u16::MAX as usize,
    "item offsets and free_end are stored as u16"
);
