//! # Tree Walker
//!
//! One pass from the root to the leaf that should contain a key, with lock
//! coupling: each block is locked before its parent is released, and only
//! one parent lock is held at a time. Structural maintenance happens on the
//! way down — insertion splits (or compacts) any block that could not absorb
//! the pending item, deletion merges any block that has drifted below the
//! free-space threshold — so by the time the leaf is reached, the in-leaf
//! operation cannot be derailed by a full or starving ancestor.
//!
//! The root lock stands in as "the parent of the root": shared for read
//! operations, exclusive for dirty ones, and held until the walk completes.
//! Dirty walks fetch every block through the block manager's copy-on-write
//! path and patch the parent's child reference in place while the parent is
//! still locked, which keeps invariant 6 (the whole modified path carries
//! the current dirty sequence) without a second pass.
//!
//! ## Splitting left
//!
//! A full block splits by moving its *lower* half into a freshly allocated
//! left sibling. The block keeps its greatest key, so its own parent item
//! never changes and no ancestor update can cascade. The right spine keeps
//! the maximum-key sentinel for the same reason: inserts of ever-larger keys
//! land in the rightmost block without touching separators. When the root
//! itself splits, the tree grows by one level and the new root's first item
//! references the old root under the sentinel.
//!
//! ## Merging
//!
//! Deletion descending through a parent pulls items into the fetched block
//! from a sibling (the left one when it exists) until the block is back
//! under the threshold, folding the sibling in entirely when it fits and
//! freeing it. A parent left with a single child collapses: the root drops a
//! level and the parent block is freed. `FREE_LIMIT` sits well below half a
//! block so a merge never immediately re-triggers a split.
//!
//! ## Sequence pruning
//!
//! `NextSeq` walks skip parent items whose child reference carries a
//! sequence below the caller's floor — an entire unmodified subtree costs
//! one comparison. A walk that prunes everything at some level reports
//! not-found; iteration resumes past the pruned subtree using the next-key
//! hint recorded from the parent separator.

use tracing::trace;
use zerocopy::IntoBytes;

use crate::block::{BlockBuf, BlockGuard, BlockManager, BlockRef, RootRecord};
use crate::btree::node;
use crate::config::{BLOCK_REF_SIZE, FREE_LIMIT};
use crate::error::{Error, Result};
use crate::key::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkOp {
    Lookup,
    Insert,
    Delete,
    Dirty,
    Next,
    NextSeq,
}

impl WalkOp {
    pub(crate) fn is_dirty(self) -> bool {
        matches!(self, WalkOp::Insert | WalkOp::Delete | WalkOp::Dirty)
    }
}

/// The walker's view of the root record: shared for read operations,
/// exclusive for dirty ones. The caller holds the corresponding root lock
/// for the duration of the walk.
pub(crate) enum RootAccess<'a> {
    Shared(&'a RootRecord),
    Excl(&'a mut RootRecord),
}

impl RootAccess<'_> {
    fn get(&self) -> &RootRecord {
        match self {
            RootAccess::Shared(r) => r,
            RootAccess::Excl(r) => r,
        }
    }

    fn get_mut(&mut self) -> &mut RootRecord {
        match self {
            // INVARIANT: only dirty walks mutate the root, and they hold it exclusively
            RootAccess::Shared(_) => unreachable!("root mutation during a shared walk"),
            RootAccess::Excl(r) => r,
        }
    }
}

/// True if iteration by sequence should skip the item at `pos`: a parent
/// item whose child reference is older than `seq`, or a leaf item older
/// than `seq`. `level` is the level of the block holding the item.
pub(crate) fn skip_pos_seq(bt: &BlockBuf, pos: usize, level: u8, seq: u64, op: WalkOp) -> bool {
    if op != WalkOp::NextSeq || pos >= node::nr_items(bt) {
        return false;
    }

    if level > 0 {
        node::item_ref_seq(bt, pos) < seq
    } else {
        node::item_seq(bt, pos) < seq
    }
}

/// The next sorted position, skipping stale items under `NextSeq`.
pub(crate) fn next_pos_seq(
    bt: &BlockBuf,
    mut pos: usize,
    level: u8,
    seq: u64,
    op: WalkOp,
) -> usize {
    loop {
        pos += 1;
        if !skip_pos_seq(bt, pos, level, seq, op) {
            return pos;
        }
    }
}

/// The first position at or after `key`, skipping stale items under
/// `NextSeq`. May return `nr_items`.
pub(crate) fn find_pos_after_seq(
    bt: &BlockBuf,
    key: &Key,
    level: u8,
    seq: u64,
    op: WalkOp,
) -> usize {
    let pos = node::find_pos(bt, key).pos();
    if skip_pos_seq(bt, pos, level, seq, op) {
        next_pos_seq(bt, pos, level, seq, op)
    } else {
        pos
    }
}

/// Allocates a block and initializes its node region. The caller links it
/// into the tree.
fn alloc_tree_block(mgr: &BlockManager) -> Result<BlockGuard> {
    let handle = mgr.alloc_dirty()?;
    let mut guard = handle.lock_write();
    node::init_block(guard.block_mut());
    Ok(guard)
}

/// Allocates a new block and points the root at it, growing the tree by one
/// level. The caller fills in the new block's items.
fn grow_tree(mgr: &BlockManager, root: &mut RootRecord) -> Result<BlockGuard> {
    let guard = alloc_tree_block(mgr)?;
    root.height += 1;
    root.blkref = guard.self_ref();
    trace!(height = root.height, blkno = root.blkref.blkno(), "grew tree");
    Ok(guard)
}

/// Creates an item in `parent` at `pos` referencing `child`, keyed by the
/// greatest key reachable under it.
fn create_parent_item(parent: &mut BlockBuf, pos: usize, child_ref: BlockRef, key: &Key) {
    node::create_item(parent, pos, key, BLOCK_REF_SIZE);
    node::item_val_mut(parent, pos).copy_from_slice(child_ref.as_bytes());
}

/// Makes room in the fetched block for an insertion of `val_len` bytes,
/// splitting into a new left sibling when compaction cannot help. Returns
/// the block the search key now belongs in.
///
/// At parent levels the reservation is for a child reference, so a lower
/// split can always link its new sibling without failing upward.
fn try_split(
    mgr: &BlockManager,
    root: &mut RootAccess<'_>,
    level: u8,
    key: &Key,
    val_len: usize,
    parent: Option<(&mut BlockGuard, usize)>,
    mut right: BlockGuard,
) -> Result<BlockGuard> {
    let val_len = if level > 0 { BLOCK_REF_SIZE } else { val_len };
    let need = node::all_val_bytes(val_len);

    if node::contig_free(&right) >= need {
        return Ok(right);
    }

    if node::reclaimable_free(&right) >= need {
        trace!(blkno = right.hdr().blkno(), "compacting instead of splitting");
        node::compact_items(right.block_mut());
        return Ok(right);
    }

    let mut left = alloc_tree_block(mgr)?;
    trace!(
        right = right.hdr().blkno(),
        left = left.hdr().blkno(),
        level,
        "splitting block"
    );

    let mut grown: Option<BlockGuard> = None;
    let (parent, parent_pos) = match parent {
        Some((guard, pos)) => (guard, pos),
        None => {
            // the root itself is splitting; grow a parent above it first
            let mut par = match grow_tree(mgr, root.get_mut()) {
                Ok(par) => par,
                Err(err) => {
                    let left_blkno = left.hdr().blkno();
                    drop(left);
                    mgr.free(left_blkno);
                    return Err(err);
                }
            };
            create_parent_item(par.block_mut(), 0, right.self_ref(), &Key::MAX);
            grown = Some(par);
            // INVARIANT: assigned on the line above
            (grown.as_mut().unwrap(), 0)
        }
    };

    let half = node::used_total(&right) / 2;
    node::move_items(left.block_mut(), right.block_mut(), false, half);
    let left_greatest = node::greatest_key(&left);
    create_parent_item(parent.block_mut(), parent_pos, left.self_ref(), &left_greatest);

    if *key <= left_greatest {
        Ok(left)
    } else {
        drop(left);
        if node::contig_free(&right) < need {
            node::compact_items(right.block_mut());
        }
        Ok(right)
    }
}

/// Pulls items from a sibling into the fetched block when its reclaimable
/// free space exceeds `FREE_LIMIT`, deleting the sibling once drained and
/// collapsing the root when the parent is down to one child. The sibling
/// and parent are already dirty before any item moves, so migration itself
/// cannot fail.
fn try_merge(
    mgr: &BlockManager,
    root: &mut RootAccess<'_>,
    parent: &mut BlockGuard,
    pos: usize,
    mut bt: BlockGuard,
) -> Result<BlockGuard> {
    if node::reclaimable_free(&bt) <= FREE_LIMIT {
        return Ok(bt);
    }

    // prefer pulling from a left sibling when one exists
    let (sib_pos, move_right) = if pos > 0 {
        (pos - 1, true)
    } else {
        (pos + 1, false)
    };
    debug_assert!(sib_pos < node::nr_items(parent));

    let mut sib_ref = node::item_ref(parent, sib_pos)?;
    let sib_handle = mgr.dirty_ref(&mut sib_ref)?;
    node::set_item_ref(parent.block_mut(), sib_pos, &sib_ref);
    let mut sib = sib_handle.lock_write();

    let to_move = if node::used_total(&sib) <= node::reclaimable_free(&bt) {
        node::used_total(&sib)
    } else {
        node::reclaimable_free(&bt) - FREE_LIMIT
    };

    if node::contig_free(&bt) < to_move {
        node::compact_items(bt.block_mut());
    }

    trace!(
        blkno = bt.hdr().blkno(),
        sibling = sib.hdr().blkno(),
        move_right,
        to_move,
        "merging from sibling"
    );
    node::move_items(bt.block_mut(), sib.block_mut(), move_right, to_move);
    let sib_drained = node::nr_items(&sib) == 0;

    // taking from the right sibling raised our separator: to our new
    // greatest key, or to the sibling's whole separator once it drained
    // (which keeps the right-spine sentinel in place)
    if !move_right {
        let separator = if sib_drained {
            *node::item_key(parent, sib_pos)
        } else {
            node::greatest_key(&bt)
        };
        node::set_item_key(parent.block_mut(), pos, &separator);
    }

    if sib_drained {
        let sib_blkno = sib.hdr().blkno();
        node::delete_item(parent.block_mut(), sib_pos);
        drop(sib);
        mgr.free(sib_blkno);
    } else if move_right {
        let greatest = node::greatest_key(&sib);
        node::set_item_key(parent.block_mut(), sib_pos, &greatest);
    }

    // a parent down to one child can only be the root; shrink the tree
    if node::nr_items(parent) == 1 {
        let record = root.get_mut();
        record.height -= 1;
        record.blkref = bt.self_ref();
        let parent_blkno = parent.hdr().blkno();
        mgr.free(parent_blkno);
        trace!(height = record.height, "collapsed root");
    }

    Ok(bt)
}

/// Descends to the leaf that should contain `key` and returns it locked —
/// exclusively for dirty operations, shared otherwise.
///
/// `next_key` (when given) receives the successor of the leaf's parent
/// separator: the first key that could live in the next leaf to the right.
/// Iteration uses it to resume past a leaf even when every item in the leaf
/// was filtered out.
pub(crate) fn walk(
    mgr: &BlockManager,
    root: &mut RootAccess<'_>,
    key: &Key,
    mut next_key: Option<&mut Key>,
    val_len: usize,
    seq: u64,
    op: WalkOp,
) -> Result<BlockGuard> {
    let dirty = op.is_dirty();

    // without parent blocks there are no sibling blocks to resume into
    if let Some(nk) = next_key.as_deref_mut() {
        *nk = Key::MAX;
    }

    if root.get().height == 0 {
        if op == WalkOp::Insert {
            return grow_tree(mgr, root.get_mut());
        }
        return Err(Error::NotFound);
    }

    // skip the whole tree if the root reference's seq is old
    if op == WalkOp::NextSeq && root.get().blkref.seq() < seq {
        return Err(Error::NotFound);
    }

    let mut level = root.get().height;
    let mut parent: Option<BlockGuard> = None;
    let mut pos: usize = 0;

    loop {
        level -= 1;

        let handle = if dirty {
            let mut child_ref = match &parent {
                None => root.get().blkref,
                Some(p) => node::item_ref(p, pos)?,
            };
            let handle = mgr.dirty_ref(&mut child_ref)?;
            match parent.as_mut() {
                None => root.get_mut().blkref = child_ref,
                Some(p) => node::set_item_ref(p.block_mut(), pos, &child_ref),
            }
            handle
        } else {
            let child_ref = match &parent {
                None => root.get().blkref,
                Some(p) => node::item_ref(p, pos)?,
            };
            mgr.read_ref(&child_ref)?
        };

        let mut guard = if dirty {
            handle.lock_write()
        } else {
            handle.lock_read()
        };

        if op == WalkOp::Insert {
            let par = parent.as_mut().map(|p| (p, pos));
            guard = try_split(mgr, root, level, key, val_len, par, guard)?;
        }
        if op == WalkOp::Delete {
            if let Some(p) = parent.as_mut() {
                guard = try_merge(mgr, root, p, pos, guard)?;
            }
        }

        if level == 0 {
            return Ok(guard);
        }

        // lock the child, then release the previous parent
        parent = Some(guard);
        // INVARIANT: assigned on the line above
        let p = parent.as_ref().unwrap();

        // find the parent item referencing the next child to search; under
        // NextSeq every remaining child may have been pruned
        pos = find_pos_after_seq(p, key, level, seq, op);
        if pos >= node::nr_items(p) {
            return Err(match op {
                WalkOp::NextSeq => Error::NotFound,
                _ => Error::integrity("descent found no child item covering the key"),
            });
        }

        if let Some(nk) = next_key.as_deref_mut() {
            *nk = node::item_key(p, pos).successor();
        }
    }
}
