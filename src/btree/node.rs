//! # Intra-Block Item Layout
//!
//! Parent and leaf blocks share one format. After the common block header
//! comes the node header and a dense array of item offsets kept sorted by
//! key; item bytes pack downward from the end of the block:
//!
//! ```text
//! Offset      Content
//! ------      -------------------------------------------
//! 0           Block header (blkno, seq)
//! 16          nr_items: u16
//! 18          free_end: u16
//! 20          free_reclaim: u16
//! 22          item_offs[nr_items]: u16   (sorted by key)
//! ...         contiguous free space
//! free_end    items (header + value), packed toward BLOCK_SIZE
//! ```
//!
//! An item is a small header (key, sequence, value length) immediately
//! followed by its value bytes. A parent item's value is exactly one block
//! reference; a leaf item's value is caller payload.
//!
//! ## Space accounting
//!
//! Deleting an item shifts its offset slot out of the array and counts the
//! item's bytes in `free_reclaim` rather than moving anything. Insertion
//! needs contiguous room between the offset array and `free_end`; when
//! fragmentation is the only thing standing in the way, [`compact_items`]
//! repacks every item against the end of the block and zeroes
//! `free_reclaim`. The walker prefers compaction over splitting whenever it
//! suffices.
//!
//! Compaction moves item bytes, so it is legal only while no cursor refers
//! to items in the block; the walker guarantees this by compacting before
//! the block is ever exposed through a cursor.

use smallvec::SmallVec;
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::block::{BlockBuf, BlockRef};
use crate::config::{
    BLOCK_HEADER_SIZE, BLOCK_REF_SIZE, BLOCK_SIZE, ITEM_HEADER_SIZE, MAX_BLOCK_ITEMS,
    NODE_HEADER_SIZE, OFFSET_SLOT_SIZE,
};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::zerocopy_accessors;

/// Scratch array for the compaction sort; holds every offset slot inline.
type OffsetScratch = SmallVec<[u16; 256]>;

const _: () = assert!(MAX_BLOCK_ITEMS <= 256, "compaction scratch must hold a full block");

/// Node header fields that follow the common block header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    nr_items: U16,
    free_end: U16,
    free_reclaim: U16,
}

const _: () = assert!(BLOCK_HEADER_SIZE + std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    zerocopy_accessors! {
        nr_items: u16,
        free_end: u16,
        free_reclaim: u16,
    }
}

/// Per-item header stored at the item's offset, followed by the value.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct ItemHeader {
    pub key: Key,
    seq: U64,
    val_len: U16,
}

const _: () = assert!(std::mem::size_of::<ItemHeader>() == ITEM_HEADER_SIZE);

impl ItemHeader {
    zerocopy_accessors! {
        seq: u64,
        val_len: u16,
    }
}

/// Outcome of a key search within one block: the position holding the key,
/// or the position where it would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    /// The position regardless of whether the key was present. May equal
    /// `nr_items`; callers must bounds-check before dereferencing.
    pub fn pos(&self) -> usize {
        match *self {
            SearchResult::Found(pos) | SearchResult::NotFound(pos) => pos,
        }
    }
}

/// Contiguous bytes used by an item header and a value of the given length.
pub(crate) fn val_bytes(val_len: usize) -> usize {
    ITEM_HEADER_SIZE + val_len
}

/// Total bytes consumed by an item of the given value length: offset slot,
/// header, value.
pub(crate) fn all_val_bytes(val_len: usize) -> usize {
    OFFSET_SLOT_SIZE + val_bytes(val_len)
}

fn node_hdr(bt: &BlockBuf) -> &NodeHeader {
    let range = BLOCK_HEADER_SIZE..NODE_HEADER_SIZE;
    // INVARIANT: the buffer is always BLOCK_SIZE bytes
    NodeHeader::ref_from_bytes(&bt.bytes()[range]).unwrap()
}

fn node_hdr_mut(bt: &mut BlockBuf) -> &mut NodeHeader {
    let range = BLOCK_HEADER_SIZE..NODE_HEADER_SIZE;
    // INVARIANT: the buffer is always BLOCK_SIZE bytes
    NodeHeader::mut_from_bytes(&mut bt.bytes_mut()[range]).unwrap()
}

/// Initializes the node region of a freshly allocated block.
pub(crate) fn init_block(bt: &mut BlockBuf) {
    let hdr = node_hdr_mut(bt);
    hdr.set_nr_items(0);
    hdr.set_free_end(BLOCK_SIZE as u16);
    hdr.set_free_reclaim(0);
}

pub(crate) fn nr_items(bt: &BlockBuf) -> usize {
    node_hdr(bt).nr_items() as usize
}

pub(crate) fn free_end(bt: &BlockBuf) -> usize {
    node_hdr(bt).free_end() as usize
}

pub(crate) fn free_reclaim(bt: &BlockBuf) -> usize {
    node_hdr(bt).free_reclaim() as usize
}

/// Contiguous free bytes between the offset array and the lowest item.
pub(crate) fn contig_free(bt: &BlockBuf) -> usize {
    free_end(bt) - (NODE_HEADER_SIZE + nr_items(bt) * OFFSET_SLOT_SIZE)
}

/// Free bytes available after compaction.
pub(crate) fn reclaimable_free(bt: &BlockBuf) -> usize {
    contig_free(bt) + free_reclaim(bt)
}

/// Bytes consumed by item offsets, headers, and values.
pub(crate) fn used_total(bt: &BlockBuf) -> usize {
    BLOCK_SIZE - NODE_HEADER_SIZE - reclaimable_free(bt)
}

fn offs_slot_range(pos: usize) -> std::ops::Range<usize> {
    let start = NODE_HEADER_SIZE + pos * OFFSET_SLOT_SIZE;
    start..start + OFFSET_SLOT_SIZE
}

pub(crate) fn item_off(bt: &BlockBuf, pos: usize) -> usize {
    debug_assert!(pos < nr_items(bt));
    let bytes = &bt.bytes()[offs_slot_range(pos)];
    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
}

fn set_item_off(bt: &mut BlockBuf, pos: usize, off: usize) {
    let range = offs_slot_range(pos);
    bt.bytes_mut()[range].copy_from_slice(&(off as u16).to_le_bytes());
}

fn item_hdr_at(bt: &BlockBuf, off: usize) -> &ItemHeader {
    // INVARIANT: item offsets always leave room for a header before BLOCK_SIZE
    ItemHeader::ref_from_bytes(&bt.bytes()[off..off + ITEM_HEADER_SIZE]).unwrap()
}

pub(crate) fn item_hdr(bt: &BlockBuf, pos: usize) -> &ItemHeader {
    item_hdr_at(bt, item_off(bt, pos))
}

fn item_hdr_mut(bt: &mut BlockBuf, pos: usize) -> &mut ItemHeader {
    let off = item_off(bt, pos);
    // INVARIANT: item offsets always leave room for a header before BLOCK_SIZE
    ItemHeader::mut_from_bytes(&mut bt.bytes_mut()[off..off + ITEM_HEADER_SIZE]).unwrap()
}

/// Contiguous bytes used by the item at `pos`: header plus current value.
pub(crate) fn item_bytes(bt: &BlockBuf, pos: usize) -> usize {
    val_bytes(item_hdr(bt, pos).val_len() as usize)
}

pub(crate) fn item_key(bt: &BlockBuf, pos: usize) -> &Key {
    &item_hdr(bt, pos).key
}

pub(crate) fn item_seq(bt: &BlockBuf, pos: usize) -> u64 {
    item_hdr(bt, pos).seq()
}

pub(crate) fn set_item_seq(bt: &mut BlockBuf, pos: usize, seq: u64) {
    item_hdr_mut(bt, pos).set_seq(seq);
}

pub(crate) fn set_item_key(bt: &mut BlockBuf, pos: usize, key: &Key) {
    item_hdr_mut(bt, pos).key = *key;
}

pub(crate) fn item_val(bt: &BlockBuf, pos: usize) -> &[u8] {
    let off = item_off(bt, pos);
    let len = item_hdr(bt, pos).val_len() as usize;
    &bt.bytes()[off + ITEM_HEADER_SIZE..off + ITEM_HEADER_SIZE + len]
}

pub(crate) fn item_val_mut(bt: &mut BlockBuf, pos: usize) -> &mut [u8] {
    let off = item_off(bt, pos);
    let len = item_hdr(bt, pos).val_len() as usize;
    &mut bt.bytes_mut()[off + ITEM_HEADER_SIZE..off + ITEM_HEADER_SIZE + len]
}

/// Reads the block reference stored as a parent item's value.
pub(crate) fn item_ref(bt: &BlockBuf, pos: usize) -> Result<BlockRef> {
    let val = item_val(bt, pos);
    if val.len() != BLOCK_REF_SIZE {
        return Err(Error::integrity(format!(
            "parent item value is {} bytes, expected a block reference",
            val.len()
        )));
    }
    // INVARIANT: length checked above
    Ok(BlockRef::read_from_bytes(val).unwrap())
}

pub(crate) fn set_item_ref(bt: &mut BlockBuf, pos: usize, r: &BlockRef) {
    debug_assert_eq!(item_hdr(bt, pos).val_len() as usize, BLOCK_REF_SIZE);
    item_val_mut(bt, pos).copy_from_slice(r.as_bytes());
}

/// The sequence of the block reference in a parent item, without the length
/// round trip of [`item_ref`].
pub(crate) fn item_ref_seq(bt: &BlockBuf, pos: usize) -> u64 {
    debug_assert_eq!(item_hdr(bt, pos).val_len() as usize, BLOCK_REF_SIZE);
    let val = item_val(bt, pos);
    let mut le = [0u8; 8];
    le.copy_from_slice(&val[8..16]);
    u64::from_le_bytes(le)
}

/// The greatest key stored in the block.
pub(crate) fn greatest_key(bt: &BlockBuf) -> Key {
    debug_assert!(nr_items(bt) > 0);
    *item_key(bt, nr_items(bt) - 1)
}

/// Binary search over the sorted offset array.
pub(crate) fn find_pos(bt: &BlockBuf, key: &Key) -> SearchResult {
    let mut start = 0;
    let mut end = nr_items(bt);

    while start < end {
        let mid = start + (end - start) / 2;
        match key.cmp(item_key(bt, mid)) {
            std::cmp::Ordering::Less => end = mid,
            std::cmp::Ordering::Greater => start = mid + 1,
            std::cmp::Ordering::Equal => return SearchResult::Found(mid),
        }
    }

    SearchResult::NotFound(start)
}

/// Allocates and inserts a new item. The caller has verified there is
/// contiguous room; the value bytes are left for the caller to fill. The
/// item's sequence is stamped from the block header.
pub(crate) fn create_item(bt: &mut BlockBuf, pos: usize, key: &Key, val_len: usize) {
    let nr = nr_items(bt);
    debug_assert!(pos <= nr);
    debug_assert!(contig_free(bt) >= all_val_bytes(val_len));

    if pos < nr {
        let src = NODE_HEADER_SIZE + pos * OFFSET_SLOT_SIZE;
        let end = NODE_HEADER_SIZE + nr * OFFSET_SLOT_SIZE;
        bt.bytes_mut().copy_within(src..end, src + OFFSET_SLOT_SIZE);
    }

    let new_end = free_end(bt) - val_bytes(val_len);
    let seq = bt.hdr().seq();

    let hdr = node_hdr_mut(bt);
    hdr.set_free_end(new_end as u16);
    hdr.set_nr_items((nr + 1) as u16);
    set_item_off(bt, pos, new_end);

    let item = item_hdr_mut(bt, pos);
    item.key = *key;
    item.set_seq(seq);
    item.set_val_len(val_len as u16);
}

/// Deletes the item at `pos`, recording its bytes as reclaimable and wiping
/// them so deleted values never leak to disk.
pub(crate) fn delete_item(bt: &mut BlockBuf, pos: usize) {
    let nr = nr_items(bt);
    debug_assert!(pos < nr);

    let off = item_off(bt, pos);
    let bytes = item_bytes(bt, pos);

    if pos < nr - 1 {
        let start = NODE_HEADER_SIZE + (pos + 1) * OFFSET_SLOT_SIZE;
        let end = NODE_HEADER_SIZE + nr * OFFSET_SLOT_SIZE;
        bt.bytes_mut().copy_within(start..end, start - OFFSET_SLOT_SIZE);
    }

    let reclaim = free_reclaim(bt) + bytes;
    let hdr = node_hdr_mut(bt);
    hdr.set_free_reclaim(reclaim as u16);
    hdr.set_nr_items((nr - 1) as u16);

    bt.bytes_mut()[off..off + bytes].fill(0);
}

/// Repacks every item against the end of the block, folding `free_reclaim`
/// back into contiguous free space.
///
/// The offset array doubles as the work list: a scratch copy is sorted by
/// offset so items can be walked highest-first and slid up over the gaps,
/// then re-sorted by key and written back.
pub(crate) fn compact_items(bt: &mut BlockBuf) {
    let nr = nr_items(bt);
    let mut offs: OffsetScratch = (0..nr).map(|pos| item_off(bt, pos) as u16).collect();

    offs.sort_unstable();

    let mut end = BLOCK_SIZE;
    for i in (0..nr).rev() {
        let off = offs[i] as usize;
        let bytes = val_bytes(item_hdr_at(bt, off).val_len() as usize);
        end -= bytes;
        if off != end {
            bt.bytes_mut().copy_within(off..off + bytes, end);
        }
        offs[i] = end as u16;
    }

    let hdr = node_hdr_mut(bt);
    hdr.set_free_end(end as u16);
    hdr.set_free_reclaim(0);

    offs.sort_unstable_by(|&a, &b| {
        item_hdr_at(bt, a as usize)
            .key
            .cmp(&item_hdr_at(bt, b as usize).key)
    });
    for (pos, &off) in offs.iter().enumerate() {
        set_item_off(bt, pos, off as usize);
    }
}

/// Migrates items between sibling blocks until `to_move` bytes (counting
/// offset slots) have moved or the source empties. `move_right` takes from
/// the source's tail into the destination's head; otherwise from the
/// source's head onto the destination's tail. Item headers are copied
/// verbatim, preserving each item's original sequence.
pub(crate) fn move_items(dst: &mut BlockBuf, src: &mut BlockBuf, move_right: bool, to_move: usize) {
    let mut budget = to_move as isize;

    while nr_items(src) > 0 && budget > 0 {
        let from = if move_right { nr_items(src) - 1 } else { 0 };
        let to = if move_right { 0 } else { nr_items(dst) };

        let src_off = item_off(src, from);
        let hdr = *item_hdr(src, from);
        let val_len = hdr.val_len() as usize;
        let bytes = val_bytes(val_len);

        // the budget may overshoot by one item; never overfill the destination
        if contig_free(dst) < all_val_bytes(val_len) {
            break;
        }

        create_item(dst, to, &hdr.key, val_len);
        let dst_off = item_off(dst, to);
        let (dst_bytes, src_bytes) = (dst.bytes_mut(), src.bytes());
        dst_bytes[dst_off..dst_off + bytes].copy_from_slice(&src_bytes[src_off..src_off + bytes]);

        budget -= all_val_bytes(val_len) as isize;
        delete_item(src, from);
    }
}
