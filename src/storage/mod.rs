//! # Storage Module
//!
//! The foundational storage layer: a single database file of fixed-size
//! pages, memory-mapped for zero-copy reads, written through positioned
//! writes, and committed through a dual meta-page handoff.
//!
//! ## File layout
//!
//! ```text
//! Offset 0:             Meta slot 0
//! Offset page_size:     Meta slot 1
//! Offset 2*page_size:   Data pages (leaf / branch / overflow / free)
//! ...
//! ```
//!
//! Pages are written exactly once and never mutated afterwards; a
//! transaction replaces pages by writing copies and flipping the root
//! pointers in a meta slot. Readers hold an `Arc` to the mmap region of
//! their snapshot, so remapping for new pages never invalidates a live
//! snapshot's slices.
//!
//! ## Module organization
//!
//! - `page`: slotted leaf/branch layout, overflow chains, free pages
//! - `meta`: dual-slot meta page with CRC-32 validation
//! - `pager`: mmap read view, positioned writes, page allocation and reuse
//! - `freelist`: per-tx orphan tracking and the persistent FreeDB

mod freelist;
mod meta;
mod page;
mod pager;

pub use freelist::{FreeDb, FreePageTracker, MAX_TRACKED_PAGES};
pub use meta::{select_active_slot, MetaPage, META_MAGIC, META_PAGE_LEN, META_VERSION};
pub use page::{
    init_free, BranchPage, BranchPageMut, LeafPage, LeafPageMut, OverflowPage, OverflowPageMut,
    PageInsert, PageType, Route, BRANCH_HEADER_SIZE, LEAF_HEADER_SIZE, OVERFLOW_HEADER_SIZE,
    SLOT_SIZE,
};
pub use pager::Pager;

use eyre::Result;

/// Page number within the database file. Pages 0 and 1 are meta slots;
/// 0 doubles as "no page" in tree roots and sibling pointers.
pub type PageId = u64;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

/// First page number available to trees; 0 and 1 hold the meta slots.
pub const FIRST_DATA_PAGE: PageId = 2;

/// Read-only access to pages at some snapshot of the file.
///
/// Implemented by [`Pager`] (the writer's current view) and by
/// `Snapshot` (a reader's pinned view). Returned slices borrow from the
/// implementor and stay valid for the borrow's lifetime.
pub trait PageSource {
    fn page(&self, id: PageId) -> Result<&[u8]>;
    fn page_size(&self) -> usize;
}
