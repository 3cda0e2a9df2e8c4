//! # Copy-on-Write B+ Tree
//!
//! The index engine: an immutable-page B+ tree whose writes copy every
//! touched page and hand the replaced page numbers to a free-page
//! tracker. Two trees with different roots over the same file are
//! independent snapshots; cloning a [`Tree`] is O(1).
//!
//! ## Module organization
//!
//! - `tree`: descent with path capture, COW propagation, split handling
//! - `cursor`: stack-based iteration (`seek`, `range`, `next`, `prev`)
//!
//! ## Why stack-based iteration
//!
//! Leaf headers carry `prev`/`next` fields, but following them from an
//! old root would require mutating committed neighbors on every split.
//! Cursors instead remember the branch path they descended and re-ascend
//! at leaf boundaries, so every page stays immutable after its single
//! write and range scans are correct for *every* historical root.

mod cursor;
mod tree;

pub use cursor::Cursor;
pub use tree::Tree;

use std::cmp::Ordering;

/// Key comparison for one index. Plain function pointers keep [`Tree`]
/// `Copy`-cheap to clone per snapshot.
pub type KeyCmp = fn(&[u8], &[u8]) -> Ordering;

/// Bytewise comparator for indexes whose keys are pure big-endian data.
pub fn cmp_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}
