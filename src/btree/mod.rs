//! # B-Tree Core
//!
//! The tree proper: intra-block item layout (`node`), the one-pass walker
//! with split/merge on the way down (`walk`), the pinned-leaf cursor
//! (`cursor`), and the public operation surface (`tree`).

mod cursor;
mod node;
mod tree;
mod walk;

pub use cursor::Cursor;
pub use tree::Tree;
