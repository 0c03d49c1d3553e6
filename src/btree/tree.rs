//! # Public Tree Operations
//!
//! The operation surface over the walker: point lookup, insertion,
//! deletion, in-place update, path pre-dirtying, ordered iteration,
//! sequence-filtered iteration, and hole discovery.
//!
//! Every operation is one walk to a leaf followed by an in-leaf action.
//! Iteration re-enters the walker from a resume key instead of maintaining
//! a path stack: when a leaf is exhausted the next search starts at the
//! successor of the leaf's parent separator, which guarantees forward
//! progress even when an entire leaf is filtered out by a sequence floor.
//!
//! Mutating operations happen inside the current transaction: they dirty
//! (copy-on-write) every block on their path, stamp it with the current
//! dirty sequence, and become durable at the next [`Tree::commit`]. A call
//! to [`Tree::dirty`] pins a key's whole path dirty so that a later
//! [`Tree::update`] in the same transaction cannot fail for allocation or
//! I/O reasons.
//!
//! ## Cursors and locking
//!
//! Operations that produce a cursor hand it the leaf still locked (shared
//! for `lookup` and iteration, exclusive for `insert` and `update`) and
//! pinned. Hold at most one cursor per thread and release it before the
//! next mutating call or commit; a thread that re-enters the tree while
//! holding a write cursor on the same leaf would deadlock against itself.

use std::path::Path;

use parking_lot::RwLock;
use tracing::debug;

use crate::block::{BlockManager, BlockRef, RootRecord};
use crate::btree::cursor::Cursor;
use crate::btree::node::{self, SearchResult};
use crate::btree::walk::{self, RootAccess, WalkOp};
use crate::config::MAX_VAL_LEN;
use crate::error::{Error, Result};
use crate::key::Key;

/// A persistent, copy-on-write B-tree of fixed-size keys and variable
/// length values. Parallel readers are safe; writers must be externally
/// serialized (one writer at a time).
pub struct Tree {
    mgr: BlockManager,
    root: RwLock<RootRecord>,
}

impl Tree {
    /// Creates a new tree backed by a new store file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (mgr, root) = BlockManager::create(path)?;
        Ok(Self {
            mgr,
            root: RwLock::new(root),
        })
    }

    /// Opens the tree committed to the store file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (mgr, root) = BlockManager::open(path)?;
        Ok(Self {
            mgr,
            root: RwLock::new(root),
        })
    }

    /// Makes everything modified since the previous commit durable and
    /// advances the dirty sequence. All cursors must be released first.
    pub fn commit(&self) -> Result<()> {
        let root = self.root.read();
        self.mgr.commit(&root)
    }

    /// The current dirty sequence, stamped into modified blocks and items
    /// until the next commit.
    pub fn seq(&self) -> u64 {
        self.mgr.seq()
    }

    /// The tree height: 0 when empty, 1 when the root is a leaf.
    pub fn height(&self) -> u8 {
        self.root.read().height
    }

    /// Points the cursor at the item with the given key. The cursor is
    /// read-only.
    ///
    /// # Panics
    /// Panics if the cursor already holds a block.
    pub fn lookup(&self, key: &Key, curs: &mut Cursor) -> Result<()> {
        assert!(!curs.is_seated(), "cursor already holds a block");

        let root = self.root.read();
        let mut acc = RootAccess::Shared(&root);
        let leaf = walk::walk(&self.mgr, &mut acc, key, None, 0, 0, WalkOp::Lookup)?;

        match node::find_pos(&leaf, key) {
            SearchResult::Found(pos) => {
                curs.seat(leaf, pos);
                Ok(())
            }
            SearchResult::NotFound(_) => Err(Error::NotFound),
        }
    }

    /// Inserts a new item and points the cursor at it. The value bytes are
    /// uninitialized; the caller fills them through the cursor before
    /// releasing it.
    ///
    /// # Panics
    /// Panics if the cursor already holds a block.
    pub fn insert(&self, key: &Key, val_len: usize, curs: &mut Cursor) -> Result<()> {
        assert!(!curs.is_seated(), "cursor already holds a block");

        if key.is_max() {
            return Err(Error::integrity("the maximum key is reserved"));
        }
        if val_len > MAX_VAL_LEN {
            return Err(Error::integrity(format!(
                "value length {val_len} exceeds the {MAX_VAL_LEN} byte block payload limit"
            )));
        }

        let mut root = self.root.write();
        let mut acc = RootAccess::Excl(&mut root);
        let mut leaf = walk::walk(&self.mgr, &mut acc, key, None, val_len, 0, WalkOp::Insert)?;

        match node::find_pos(&leaf, key) {
            SearchResult::Found(_) => Err(Error::Exists),
            SearchResult::NotFound(pos) => {
                node::create_item(leaf.block_mut(), pos, key, val_len);
                curs.seat(leaf, pos);
                Ok(())
            }
        }
    }

    /// Deletes the item with the given key. When the last item in the tree
    /// goes, the root is cleared and the final block freed.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let mut root = self.root.write();
        let mut leaf = {
            let mut acc = RootAccess::Excl(&mut root);
            walk::walk(&self.mgr, &mut acc, key, None, 0, 0, WalkOp::Delete)?
        };

        match node::find_pos(&leaf, key) {
            SearchResult::NotFound(_) => Err(Error::NotFound),
            SearchResult::Found(pos) => {
                node::delete_item(leaf.block_mut(), pos);

                if node::nr_items(&leaf) == 0 && root.height == 1 {
                    let blkno = leaf.hdr().blkno();
                    root.height = 0;
                    root.blkref = BlockRef::null();
                    drop(leaf);
                    self.mgr.free(blkno);
                    debug!(blkno, "deleted last item, tree is empty");
                }
                Ok(())
            }
        }
    }

    /// Re-dirties the item with the given key, stamps it with the current
    /// dirty sequence, and points the cursor at it for writing. Guaranteed
    /// not to fail for I/O or allocation reasons if [`Tree::dirty`] on the
    /// same key succeeded within the current transaction.
    ///
    /// # Panics
    /// Panics if the cursor already holds a block.
    pub fn update(&self, key: &Key, curs: &mut Cursor) -> Result<()> {
        assert!(!curs.is_seated(), "cursor already holds a block");

        let mut root = self.root.write();
        let mut acc = RootAccess::Excl(&mut root);
        let mut leaf = walk::walk(&self.mgr, &mut acc, key, None, 0, 0, WalkOp::Dirty)?;

        match node::find_pos(&leaf, key) {
            SearchResult::NotFound(_) => Err(Error::NotFound),
            SearchResult::Found(pos) => {
                let seq = leaf.hdr().seq();
                node::set_item_seq(leaf.block_mut(), pos, seq);
                curs.seat(leaf, pos);
                Ok(())
            }
        }
    }

    /// Dirties every block from the root to the item with the given key.
    /// The enclosing transaction pins those blocks, so a later
    /// [`Tree::update`] of the key cannot fail.
    pub fn dirty(&self, key: &Key) -> Result<()> {
        let mut root = self.root.write();
        let mut acc = RootAccess::Excl(&mut root);
        let leaf = walk::walk(&self.mgr, &mut acc, key, None, 0, 0, WalkOp::Dirty)?;

        match node::find_pos(&leaf, key) {
            SearchResult::Found(_) => Ok(()),
            SearchResult::NotFound(_) => Err(Error::NotFound),
        }
    }

    /// Advances the cursor to the next item in `[first, last]`, in
    /// ascending key order. Seats the cursor and returns `true` while items
    /// remain; releases it and returns `false` once the range is exhausted.
    pub fn next(&self, first: &Key, last: &Key, curs: &mut Cursor) -> Result<bool> {
        self.next_inner(first, last, 0, WalkOp::Next, curs)
    }

    /// Like [`Tree::next`], but only visits items whose sequence is at
    /// least `seq`, pruning unmodified subtrees without descending into
    /// them.
    pub fn since(&self, first: &Key, last: &Key, seq: u64, curs: &mut Cursor) -> Result<bool> {
        self.next_inner(first, last, seq, WalkOp::NextSeq, curs)
    }

    /// Finds the smallest key in `[first, last]` with no item, or
    /// [`Error::NoSpace`] when every key in the range is taken.
    pub fn hole(&self, first: &Key, last: &Key) -> Result<Key> {
        let mut curs = Cursor::new();
        let mut hole = *first;

        while self.next(first, last, &mut curs)? {
            // the walk skipped past our candidate, so nothing holds it
            if hole < *curs.key() {
                break;
            }
            hole = curs.key().successor();
        }
        curs.release();

        if hole <= *last {
            Ok(hole)
        } else {
            Err(Error::NoSpace)
        }
    }

    fn next_inner(
        &self,
        first: &Key,
        last: &Key,
        seq: u64,
        op: WalkOp,
        curs: &mut Cursor,
    ) -> Result<bool> {
        if first > last {
            return Ok(false);
        }

        let mut key = *first;

        // advance within the held leaf, releasing it when exhausted
        if curs.is_seated() {
            key = curs.key().successor();
            let pos = walk::next_pos_seq(curs.block(), curs.pos(), 0, seq, op);
            if pos < node::nr_items(curs.block()) {
                curs.set_pos(pos);
            } else {
                curs.release();
            }
        }

        // walk to the leaf that covers the resume key, retrying from the
        // next-key hint until one holds an in-range item
        while !curs.is_seated() && key <= *last {
            let mut next_key = Key::MAX;
            let walked = {
                let root = self.root.read();
                let mut acc = RootAccess::Shared(&root);
                walk::walk(&self.mgr, &mut acc, &key, Some(&mut next_key), 0, seq, op)
            };

            let leaf = match walked {
                // sequence walks can terminate inside parents whose
                // remaining children are all old
                Err(Error::NotFound) if op == WalkOp::NextSeq => {
                    if next_key <= key {
                        break;
                    }
                    key = next_key;
                    continue;
                }
                Err(Error::NotFound) => break,
                Err(err) => return Err(err),
                Ok(leaf) => leaf,
            };

            let pos = walk::find_pos_after_seq(&leaf, &key, 0, seq, op);
            if pos >= node::nr_items(&leaf) {
                if next_key <= key {
                    break;
                }
                key = next_key;
                continue;
            }

            curs.seat(leaf, pos);
        }

        if curs.is_seated() && curs.key() <= last {
            Ok(true)
        } else {
            curs.release();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BLOCK_SIZE, FREE_LIMIT};
    use tempfile::tempdir;

    fn tree() -> (tempfile::TempDir, Tree) {
        let dir = tempdir().unwrap();
        let tree = Tree::create(dir.path().join("meta.db")).unwrap();
        (dir, tree)
    }

    fn put(tree: &Tree, k: u64, val: &[u8]) {
        let mut curs = Cursor::new();
        tree.insert(&Key::from_u64(k), val.len(), &mut curs).unwrap();
        curs.val_mut().copy_from_slice(val);
        curs.release();
    }

    fn get(tree: &Tree, k: u64) -> Option<Vec<u8>> {
        let mut curs = Cursor::new();
        match tree.lookup(&Key::from_u64(k), &mut curs) {
            Ok(()) => {
                let val = curs.val().to_vec();
                curs.release();
                Some(val)
            }
            Err(Error::NotFound) => None,
            Err(err) => panic!("lookup failed: {err}"),
        }
    }

    fn scan(tree: &Tree, first: u64, last: u64) -> Vec<u64> {
        let mut curs = Cursor::new();
        let mut keys = Vec::new();
        while tree
            .next(&Key::from_u64(first), &Key::from_u64(last), &mut curs)
            .unwrap()
        {
            keys.push(curs.key().to_u64());
        }
        keys
    }

    #[test]
    fn insert_then_lookup_returns_the_value() {
        let (_dir, tree) = tree();
        put(&tree, 1, b"alpha");

        assert_eq!(get(&tree, 1).as_deref(), Some(&b"alpha"[..]));
        assert_eq!(get(&tree, 2), None);
    }

    #[test]
    fn first_insert_grows_and_last_delete_collapses() {
        let (_dir, tree) = tree();
        assert_eq!(tree.height(), 0);

        put(&tree, 1, b"a");
        assert_eq!(tree.height(), 1);

        tree.delete(&Key::from_u64(1)).unwrap();
        assert_eq!(tree.height(), 0);
        assert_eq!(get(&tree, 1), None);
    }

    #[test]
    fn duplicate_insert_reports_exists() {
        let (_dir, tree) = tree();
        put(&tree, 7, b"v");

        let mut curs = Cursor::new();
        let err = tree.insert(&Key::from_u64(7), 1, &mut curs).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }

    #[test]
    fn delete_of_missing_key_reports_not_found() {
        let (_dir, tree) = tree();
        put(&tree, 1, b"v");
        assert!(matches!(
            tree.delete(&Key::from_u64(9)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn split_moves_the_low_half_left_and_keeps_the_sentinel_right() {
        let (_dir, tree) = tree();
        let val = [0x11u8; 200];
        for k in 1..=18u64 {
            put(&tree, k, &val);
        }
        assert_eq!(tree.height(), 2);

        // inspect the root block: two children, the right one under the
        // maximum-key sentinel, the left keyed by its greatest key
        let root = tree.root.read();
        let parent = tree.mgr.read_ref(&root.blkref).unwrap().lock_read();
        assert_eq!(node::nr_items(&parent), 2);
        assert!(node::item_key(&parent, 1).is_max());

        let left_ref = node::item_ref(&parent, 0).unwrap();
        let left = tree.mgr.read_ref(&left_ref).unwrap().lock_read();
        assert_eq!(
            *node::item_key(&parent, 0),
            node::greatest_key(&left)
        );
        assert!(node::greatest_key(&left) < Key::from_u64(18));

        // all items survived the split
        drop(parent);
        drop(left);
        drop(root);
        assert_eq!(scan(&tree, 1, 18), (1..=18).collect::<Vec<_>>());
        for k in 1..=18u64 {
            assert_eq!(get(&tree, k).as_deref(), Some(&val[..]));
        }
    }

    #[test]
    fn insertion_compacts_instead_of_splitting_when_it_can() {
        let (_dir, tree) = tree();
        // thirteen 280-byte values leave less contiguous room than one more
        // item needs; deleting one makes that room reclaimable
        for k in 1..=13u64 {
            put(&tree, k, &[k as u8; 280]);
        }
        assert_eq!(tree.height(), 1);
        tree.delete(&Key::from_u64(1)).unwrap();

        put(&tree, 99, &[0x42; 100]);
        assert_eq!(tree.height(), 1);

        {
            let root = tree.root.read();
            let leaf = tree.mgr.read_ref(&root.blkref).unwrap().lock_read();
            assert_eq!(node::free_reclaim(&leaf), 0);
        }

        for k in 2..=13u64 {
            assert_eq!(get(&tree, k).as_deref(), Some(&[k as u8; 280][..]));
        }
        assert_eq!(get(&tree, 99).as_deref(), Some(&[0x42; 100][..]));
    }

    #[test]
    fn deletions_merge_back_down_to_a_single_leaf_and_then_empty() {
        let (_dir, tree) = tree();
        for k in 1..=18u64 {
            put(&tree, k, &[0x22; 200]);
        }
        assert_eq!(tree.height(), 2);

        for k in 1..=17u64 {
            tree.delete(&Key::from_u64(k)).unwrap();
        }
        assert_eq!(tree.height(), 1);
        assert_eq!(scan(&tree, 1, 100), vec![18]);

        tree.delete(&Key::from_u64(18)).unwrap();
        assert_eq!(tree.height(), 0);
        assert_eq!(scan(&tree, 1, 100), Vec::<u64>::new());
    }

    #[test]
    fn merge_threshold_is_sane_for_the_block_size() {
        assert!(FREE_LIMIT < BLOCK_SIZE / 2);
    }

    #[test]
    fn next_walks_the_range_in_order() {
        let (_dir, tree) = tree();
        for k in [40u64, 10, 30, 50, 20] {
            put(&tree, k, b"v");
        }

        assert_eq!(scan(&tree, 1, 100), vec![10, 20, 30, 40, 50]);
        assert_eq!(scan(&tree, 15, 45), vec![20, 30, 40]);
        assert_eq!(scan(&tree, 41, 49), Vec::<u64>::new());
    }

    #[test]
    fn next_spans_leaves_after_splits() {
        let (_dir, tree) = tree();
        for k in 1..=60u64 {
            put(&tree, k, &[0x33; 120]);
        }
        assert!(tree.height() >= 2);
        assert_eq!(scan(&tree, 1, 60), (1..=60).collect::<Vec<_>>());
    }

    #[test]
    fn update_stamps_the_current_sequence() {
        let (_dir, tree) = tree();
        put(&tree, 5, b"before");
        tree.commit().unwrap();
        assert_eq!(tree.seq(), 2);

        let mut curs = Cursor::new();
        tree.update(&Key::from_u64(5), &mut curs).unwrap();
        assert_eq!(curs.seq(), 2);
        curs.val_mut().copy_from_slice(b"after!");
        curs.release();

        assert_eq!(get(&tree, 5).as_deref(), Some(&b"after!"[..]));
    }

    #[test]
    fn dirty_then_update_succeeds() {
        let (_dir, tree) = tree();
        put(&tree, 9, b"v");
        tree.commit().unwrap();

        tree.dirty(&Key::from_u64(9)).unwrap();
        let mut curs = Cursor::new();
        tree.update(&Key::from_u64(9), &mut curs).unwrap();
        curs.release();
    }

    #[test]
    fn dirty_of_missing_key_reports_not_found() {
        let (_dir, tree) = tree();
        put(&tree, 1, b"v");
        assert!(matches!(
            tree.dirty(&Key::from_u64(2)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn since_sees_only_items_at_or_above_the_floor() {
        let (_dir, tree) = tree();
        for k in 1..=100u64 {
            put(&tree, k, b"v");
        }
        tree.commit().unwrap();

        for k in [10u64, 20, 30] {
            let mut curs = Cursor::new();
            tree.update(&Key::from_u64(k), &mut curs).unwrap();
            curs.release();
        }

        let mut curs = Cursor::new();
        let mut seen = Vec::new();
        while tree
            .since(&Key::from_u64(1), &Key::from_u64(100), 2, &mut curs)
            .unwrap()
        {
            seen.push(curs.key().to_u64());
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn since_prunes_subtrees_through_parent_refs() {
        let (_dir, tree) = tree();
        for k in 1..=600u64 {
            put(&tree, k, &[0x44; 56]);
        }
        assert!(tree.height() >= 2);
        tree.commit().unwrap();

        for k in [5u64, 300, 599] {
            let mut curs = Cursor::new();
            tree.update(&Key::from_u64(k), &mut curs).unwrap();
            curs.release();
        }

        let mut curs = Cursor::new();
        let mut seen = Vec::new();
        while tree
            .since(&Key::from_u64(1), &Key::from_u64(600), 2, &mut curs)
            .unwrap()
        {
            seen.push(curs.key().to_u64());
        }
        assert_eq!(seen, vec![5, 300, 599]);
    }

    #[test]
    fn since_with_a_future_floor_sees_nothing() {
        let (_dir, tree) = tree();
        for k in 1..=10u64 {
            put(&tree, k, b"v");
        }
        tree.commit().unwrap();

        let mut curs = Cursor::new();
        assert!(!tree
            .since(&Key::from_u64(1), &Key::from_u64(10), 99, &mut curs)
            .unwrap());
    }

    #[test]
    fn hole_finds_the_first_gap() {
        let (_dir, tree) = tree();
        for k in [2u64, 3, 5, 6] {
            put(&tree, k, b"v");
        }

        assert_eq!(
            tree.hole(&Key::from_u64(1), &Key::from_u64(10)).unwrap(),
            Key::from_u64(1)
        );
        assert_eq!(
            tree.hole(&Key::from_u64(2), &Key::from_u64(10)).unwrap(),
            Key::from_u64(4)
        );

        for k in [4u64, 7, 8, 9, 10] {
            put(&tree, k, b"v");
        }
        assert!(matches!(
            tree.hole(&Key::from_u64(2), &Key::from_u64(10)),
            Err(Error::NoSpace)
        ));
    }

    #[test]
    fn oversized_values_are_rejected() {
        let (_dir, tree) = tree();
        let mut curs = Cursor::new();
        let err = tree
            .insert(&Key::from_u64(1), MAX_VAL_LEN + 1, &mut curs)
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn the_sentinel_key_cannot_be_inserted() {
        let (_dir, tree) = tree();
        let mut curs = Cursor::new();
        assert!(tree.insert(&Key::MAX, 1, &mut curs).is_err());
    }
}
