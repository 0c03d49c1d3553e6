//! # seqtree — a copy-on-write metadata B-tree
//!
//! seqtree stores filesystem metadata as fixed-size keys mapped to
//! variable-length values, packed into fixed-size blocks. It is built for
//! the access patterns a filesystem throws at its metadata index: point
//! lookups, ordered range scans, "what changed since sequence N"
//! incremental scans, and free-key discovery over a range.
//!
//! ## Layout
//!
//! Items live inside 4KB blocks behind a dense, key-sorted array of item
//! offsets; item bytes grow from the back of the block toward the front.
//! Parent blocks use the same format with block references as values: each
//! parent item's key is the greatest key reachable in the child below it,
//! and the right spine carries a maximum-key sentinel so inserting
//! ever-larger keys never rewrites ancestor separators.
//!
//! ```text
//! root record { height, (blkno, seq) }
//!        │
//!   [ 9→blk4 │ MAX→blk2 ]          parent level
//!    /                \
//! [1..9 items]   [10.. items]      leaf level
//! ```
//!
//! ## Copy-on-write and sequences
//!
//! Every block, block reference, and item carries the sequence number of
//! the transaction that last modified it. Mutations copy clean blocks to
//! fresh block numbers, stamp the current dirty sequence down the whole
//! path, and become durable when [`Tree::commit`] writes the dirty blocks
//! and flips the superblock. The stamped sequences make [`Tree::since`]
//! cheap: any subtree whose reference predates the caller's floor is
//! skipped without being read.
//!
//! ## One-pass operations
//!
//! All operations descend once, root to leaf, with lock coupling. Splits
//! and merges happen during the descent, so no path stack is kept and no
//! operation ever retries. Iteration resumes across leaves from the
//! successor of the parent separator recorded on the way down.
//!
//! ## Example
//!
//! ```no_run
//! use seqtree::{Cursor, Key, Tree};
//!
//! # fn main() -> seqtree::Result<()> {
//! let tree = Tree::create("meta.db")?;
//!
//! let mut curs = Cursor::new();
//! tree.insert(&Key::from_u64(1), 5, &mut curs)?;
//! curs.val_mut().copy_from_slice(b"inode");
//! curs.release();
//!
//! tree.commit()?;
//!
//! tree.lookup(&Key::from_u64(1), &mut curs)?;
//! assert_eq!(curs.val(), b"inode");
//! curs.release();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`block`]: block buffers, references, pin/lock guards, the
//!   memory-mapped store, and the copy-on-write block manager
//! - [`btree`]: item layout, walker, cursor, and the operation surface
//! - [`key`]: fixed-size keys with sentinel and successor
//! - [`config`]: layout constants and tunables
//! - [`error`]: the error taxonomy

#[macro_use]
mod macros;

pub mod block;
pub mod btree;
pub mod config;
pub mod error;
pub mod key;

pub use btree::{Cursor, Tree};
pub use error::{Error, Result};
pub use key::Key;
