//! # Slotted Page Layout
//!
//! Every data page starts with a small header followed by a slot array
//! that grows downward from the header, while entry bodies grow upward
//! from the end of the page. The gap between them is the page's free
//! space. Page size is fixed per database file and every buffer handed to
//! this module is exactly one page long.
//!
//! ```text
//! +---------------------------+
//! | Header (16 or 24 bytes)   |
//! +---------------------------+
//! | Slot array (2B offsets)   |  <- grows downward
//! +---------------------------+
//! | Free space                |
//! +---------------------------+
//! | Entry bodies              |  <- grows upward from page end
//! +---------------------------+
//! ```
//!
//! ## Headers (all fields big-endian)
//!
//! ```text
//! Leaf (24B):    type(1) | index_id(1) | num_entries(2) | reserved(4)
//!                | prev_leaf(8) | next_leaf(8)
//! Branch (16B):  type(1) | index_id(1) | num_entries(2) | reserved(4)
//!                | right_child(8)
//! Overflow (20B): type(1) | index_id(1) | reserved(2) | next(8)
//!                | data_len(4) | reserved(4)
//! ```
//!
//! ## Entry bodies
//!
//! ```text
//! Leaf:   [key_len:2][key bytes][val_len:2][val bytes]
//! Branch: [child:8][key_len:2][key bytes]
//! ```
//!
//! A branch page with separators `s_0 .. s_{n-1}` routes a search key to
//! the child of the first separator strictly greater than the key, or to
//! `right_child` when no separator is greater. Keys equal to a separator
//! therefore route to the child right of that separator.
//!
//! ## Immutability contract
//!
//! The copy-on-write tree only ever calls the `*Mut` writers on scratch
//! buffers that have not yet been assigned a page number. Once a buffer is
//! written to the file it is never modified, so mmap'd page slices are
//! stable for the lifetime of any snapshot that can reach them.
//!
//! Insertion never mutates a page it cannot fit into: the space check
//! happens before the first byte is written, and a full page reports
//! [`PageInsert::Full`] so the tree can split instead.

use eyre::{ensure, Result};
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use std::cmp::Ordering;

use super::PageId;
use crate::btree::KeyCmp;

pub const LEAF_HEADER_SIZE: usize = 24;
pub const BRANCH_HEADER_SIZE: usize = 16;
pub const OVERFLOW_HEADER_SIZE: usize = 20;
pub const SLOT_SIZE: usize = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Branch = 0x01,
    Leaf = 0x02,
    Overflow = 0x03,
    Free = 0x04,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Branch,
            0x02 => PageType::Leaf,
            0x03 => PageType::Overflow,
            0x04 => PageType::Free,
            _ => PageType::Unknown,
        }
    }

    pub fn of_page(data: &[u8]) -> Self {
        data.first().map_or(PageType::Unknown, |b| Self::from_byte(*b))
    }
}

/// Outcome of a page-level insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInsert {
    Done,
    Full,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LeafHeader {
    page_type: u8,
    index_id: u8,
    num_entries: U16,
    reserved: [u8; 4],
    prev_leaf: U64,
    next_leaf: U64,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BranchHeader {
    page_type: u8,
    index_id: u8,
    num_entries: U16,
    reserved: [u8; 4],
    right_child: U64,
}

const _: () = assert!(std::mem::size_of::<BranchHeader>() == BRANCH_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct OverflowHeader {
    page_type: u8,
    index_id: u8,
    reserved: [u8; 2],
    next: U64,
    data_len: U32,
    reserved2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<OverflowHeader>() == OVERFLOW_HEADER_SIZE);

fn header<'a, H: FromBytes + KnownLayout + Immutable + Unaligned>(data: &'a [u8]) -> Result<&'a H> {
    let size = std::mem::size_of::<H>();
    ensure!(data.len() >= size, "page too small for header");
    H::ref_from_bytes(&data[..size]).map_err(|e| eyre::eyre!("failed to read page header: {e:?}"))
}

fn header_mut<'a, H: FromBytes + IntoBytes + KnownLayout + Unaligned>(
    data: &'a mut [u8],
) -> Result<&'a mut H> {
    let size = std::mem::size_of::<H>();
    ensure!(data.len() >= size, "page too small for header");
    H::mut_from_bytes(&mut data[..size])
        .map_err(|e| eyre::eyre!("failed to read page header: {e:?}"))
}

fn read_u16(data: &[u8], at: usize) -> usize {
    u16::from_be_bytes([data[at], data[at + 1]]) as usize
}

fn write_u16(data: &mut [u8], at: usize, v: usize) {
    data[at..at + 2].copy_from_slice(&(v as u16).to_be_bytes());
}

// ---------------------------------------------------------------------------
// Leaf pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct LeafPage<'a> {
    data: &'a [u8],
}

pub struct LeafPageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafPage<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            PageType::of_page(data) == PageType::Leaf,
            "expected leaf page, got {:?}",
            PageType::of_page(data)
        );
        header::<LeafHeader>(data)?;
        Ok(Self { data })
    }

    fn hdr(&self) -> &LeafHeader {
        // INVARIANT: header validated in from_page
        header::<LeafHeader>(self.data).unwrap()
    }

    pub fn entry_count(&self) -> usize {
        self.hdr().num_entries.get() as usize
    }

    pub fn index_id(&self) -> u8 {
        self.hdr().index_id
    }

    pub fn prev_leaf(&self) -> PageId {
        self.hdr().prev_leaf.get()
    }

    pub fn next_leaf(&self) -> PageId {
        self.hdr().next_leaf.get()
    }

    fn slot(&self, idx: usize) -> usize {
        read_u16(self.data, LEAF_HEADER_SIZE + idx * SLOT_SIZE)
    }

    pub fn key_at(&self, idx: usize) -> Result<&'a [u8]> {
        ensure!(
            idx < self.entry_count(),
            "leaf slot {} out of bounds (entry_count={})",
            idx,
            self.entry_count()
        );
        let off = self.slot(idx);
        ensure!(off + 2 <= self.data.len(), "leaf entry offset out of page");
        let key_len = read_u16(self.data, off);
        ensure!(
            off + 2 + key_len <= self.data.len(),
            "leaf key extends beyond page"
        );
        Ok(&self.data[off + 2..off + 2 + key_len])
    }

    pub fn value_at(&self, idx: usize) -> Result<&'a [u8]> {
        let key = self.key_at(idx)?;
        let val_at = self.slot(idx) + 2 + key.len();
        ensure!(val_at + 2 <= self.data.len(), "leaf value offset out of page");
        let val_len = read_u16(self.data, val_at);
        ensure!(
            val_at + 2 + val_len <= self.data.len(),
            "leaf value extends beyond page"
        );
        Ok(&self.data[val_at + 2..val_at + 2 + val_len])
    }

    /// Lower bound: index of the first entry whose key is `>= key`.
    pub fn search_point(&self, key: &[u8], cmp: KeyCmp) -> Result<usize> {
        let mut lo = 0;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key_at(mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn find_key(&self, key: &[u8], cmp: KeyCmp) -> Result<Option<usize>> {
        let idx = self.search_point(key, cmp)?;
        if idx < self.entry_count() && cmp(self.key_at(idx)?, key) == Ordering::Equal {
            Ok(Some(idx))
        } else {
            Ok(None)
        }
    }

    /// Lowest entry-body offset, i.e. where free space ends.
    fn data_start(&self) -> usize {
        let mut start = self.data.len();
        for idx in 0..self.entry_count() {
            start = start.min(self.slot(idx));
        }
        start
    }

    pub fn free_space(&self) -> usize {
        let slots_end = LEAF_HEADER_SIZE + self.entry_count() * SLOT_SIZE;
        self.data_start().saturating_sub(slots_end)
    }

    pub fn entry_space(key: &[u8], value: &[u8]) -> usize {
        4 + key.len() + value.len() + SLOT_SIZE
    }
}

impl<'a> LeafPageMut<'a> {
    pub fn init(data: &'a mut [u8], index_id: u8) -> Result<Self> {
        ensure!(
            data.len() >= LEAF_HEADER_SIZE + SLOT_SIZE,
            "page too small for a leaf"
        );
        data.fill(0);
        let hdr = header_mut::<LeafHeader>(data)?;
        hdr.page_type = PageType::Leaf as u8;
        hdr.index_id = index_id;
        Ok(Self { data })
    }

    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            PageType::of_page(data) == PageType::Leaf,
            "expected leaf page, got {:?}",
            PageType::of_page(data)
        );
        header::<LeafHeader>(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> LeafPage<'_> {
        LeafPage { data: self.data }
    }

    pub fn entry_count(&self) -> usize {
        self.as_ref().entry_count()
    }

    pub fn set_prev_leaf(&mut self, id: PageId) {
        // INVARIANT: header validated in init/from_page
        header_mut::<LeafHeader>(self.data).unwrap().prev_leaf = U64::new(id);
    }

    pub fn set_next_leaf(&mut self, id: PageId) {
        header_mut::<LeafHeader>(self.data).unwrap().next_leaf = U64::new(id);
    }

    /// Inserts `(key, value)` at slot `idx`, shifting later slots right.
    /// Reports [`PageInsert::Full`] without touching the page if the entry
    /// does not fit.
    pub fn insert_entry(&mut self, idx: usize, key: &[u8], value: &[u8]) -> Result<PageInsert> {
        let count = self.entry_count();
        ensure!(
            idx <= count,
            "leaf insert index {} out of bounds (entry_count={})",
            idx,
            count
        );

        let body_len = 4 + key.len() + value.len();
        if self.as_ref().free_space() < body_len + SLOT_SIZE {
            return Ok(PageInsert::Full);
        }

        let body_at = self.as_ref().data_start() - body_len;
        write_u16(self.data, body_at, key.len());
        self.data[body_at + 2..body_at + 2 + key.len()].copy_from_slice(key);
        let val_at = body_at + 2 + key.len();
        write_u16(self.data, val_at, value.len());
        self.data[val_at + 2..val_at + 2 + value.len()].copy_from_slice(value);

        let slots = LEAF_HEADER_SIZE;
        self.data.copy_within(
            slots + idx * SLOT_SIZE..slots + count * SLOT_SIZE,
            slots + (idx + 1) * SLOT_SIZE,
        );
        write_u16(self.data, slots + idx * SLOT_SIZE, body_at);

        header_mut::<LeafHeader>(self.data).unwrap().num_entries = U16::new(count as u16 + 1);
        Ok(PageInsert::Done)
    }

    /// Removes the slot at `idx`. The entry body becomes dead space; pages
    /// are never compacted in place.
    pub fn delete_entry(&mut self, idx: usize) -> Result<()> {
        let count = self.entry_count();
        ensure!(
            idx < count,
            "leaf delete index {} out of bounds (entry_count={})",
            idx,
            count
        );

        let slots = LEAF_HEADER_SIZE;
        self.data.copy_within(
            slots + (idx + 1) * SLOT_SIZE..slots + count * SLOT_SIZE,
            slots + idx * SLOT_SIZE,
        );
        header_mut::<LeafHeader>(self.data).unwrap().num_entries = U16::new(count as u16 - 1);
        Ok(())
    }

    /// Splits roughly 50/50: the upper half moves into `right`, this page
    /// is rebuilt in place with the lower half, and the separator (the
    /// first key of `right`) is returned. The pair inherits this page's
    /// outer `prev`/`next`; the caller links the pair to each other once
    /// page numbers are known.
    pub fn split_into(&mut self, right: &mut [u8]) -> Result<Vec<u8>> {
        let snapshot = self.as_ref();
        let count = snapshot.entry_count();
        ensure!(count >= 2, "cannot split a leaf with {count} entries");

        let mut entries = Vec::with_capacity(count);
        for idx in 0..count {
            entries.push((
                snapshot.key_at(idx)?.to_vec(),
                snapshot.value_at(idx)?.to_vec(),
            ));
        }
        let index_id = snapshot.index_id();
        let (outer_prev, outer_next) = (snapshot.prev_leaf(), snapshot.next_leaf());

        let mid = count / 2;
        let separator = entries[mid].0.clone();

        let mut right_page = LeafPageMut::init(right, index_id)?;
        for (pos, (key, value)) in entries[mid..].iter().enumerate() {
            ensure!(
                right_page.insert_entry(pos, key, value)? == PageInsert::Done,
                "leaf split overflowed the right page"
            );
        }
        right_page.set_next_leaf(outer_next);

        let mut left_page = LeafPageMut::init(self.data, index_id)?;
        for (pos, (key, value)) in entries[..mid].iter().enumerate() {
            ensure!(
                left_page.insert_entry(pos, key, value)? == PageInsert::Done,
                "leaf split overflowed the left page"
            );
        }
        left_page.set_prev_leaf(outer_prev);

        Ok(separator)
    }
}

// ---------------------------------------------------------------------------
// Branch pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BranchPage<'a> {
    data: &'a [u8],
}

pub struct BranchPageMut<'a> {
    data: &'a mut [u8],
}

/// Where a branch routed a key: the slot followed, or the right child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Slot(usize),
    RightChild,
}

impl<'a> BranchPage<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            PageType::of_page(data) == PageType::Branch,
            "expected branch page, got {:?}",
            PageType::of_page(data)
        );
        header::<BranchHeader>(data)?;
        Ok(Self { data })
    }

    fn hdr(&self) -> &BranchHeader {
        // INVARIANT: header validated in from_page
        header::<BranchHeader>(self.data).unwrap()
    }

    pub fn entry_count(&self) -> usize {
        self.hdr().num_entries.get() as usize
    }

    pub fn index_id(&self) -> u8 {
        self.hdr().index_id
    }

    pub fn right_child(&self) -> PageId {
        self.hdr().right_child.get()
    }

    fn slot(&self, idx: usize) -> usize {
        read_u16(self.data, BRANCH_HEADER_SIZE + idx * SLOT_SIZE)
    }

    pub fn child_at(&self, idx: usize) -> Result<PageId> {
        ensure!(
            idx < self.entry_count(),
            "branch slot {} out of bounds (entry_count={})",
            idx,
            self.entry_count()
        );
        let off = self.slot(idx);
        ensure!(off + 8 <= self.data.len(), "branch child out of page");
        Ok(u64::from_be_bytes(self.data[off..off + 8].try_into().unwrap()))
    }

    pub fn key_at(&self, idx: usize) -> Result<&'a [u8]> {
        ensure!(
            idx < self.entry_count(),
            "branch slot {} out of bounds (entry_count={})",
            idx,
            self.entry_count()
        );
        let off = self.slot(idx);
        ensure!(off + 10 <= self.data.len(), "branch entry out of page");
        let key_len = read_u16(self.data, off + 8);
        ensure!(
            off + 10 + key_len <= self.data.len(),
            "branch key extends beyond page"
        );
        Ok(&self.data[off + 10..off + 10 + key_len])
    }

    /// Index of the first separator strictly greater than `key`, or
    /// `entry_count()` when no separator is greater.
    pub fn upper_bound(&self, key: &[u8], cmp: KeyCmp) -> Result<usize> {
        let mut lo = 0;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key_at(mid)?, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Routes `key` to the child of the first separator strictly greater
    /// than it, or to `right_child` when no separator is greater. A key
    /// equal to a separator therefore goes right of that separator.
    pub fn route(&self, key: &[u8], cmp: KeyCmp) -> Result<(Route, PageId)> {
        let idx = self.upper_bound(key, cmp)?;
        if idx < self.entry_count() {
            Ok((Route::Slot(idx), self.child_at(idx)?))
        } else {
            Ok((Route::RightChild, self.right_child()))
        }
    }

    fn data_start(&self) -> usize {
        let mut start = self.data.len();
        for idx in 0..self.entry_count() {
            start = start.min(self.slot(idx));
        }
        start
    }

    pub fn free_space(&self) -> usize {
        let slots_end = BRANCH_HEADER_SIZE + self.entry_count() * SLOT_SIZE;
        self.data_start().saturating_sub(slots_end)
    }
}

impl<'a> BranchPageMut<'a> {
    pub fn init(data: &'a mut [u8], index_id: u8, right_child: PageId) -> Result<Self> {
        ensure!(
            data.len() >= BRANCH_HEADER_SIZE + SLOT_SIZE,
            "page too small for a branch"
        );
        data.fill(0);
        let hdr = header_mut::<BranchHeader>(data)?;
        hdr.page_type = PageType::Branch as u8;
        hdr.index_id = index_id;
        hdr.right_child = U64::new(right_child);
        Ok(Self { data })
    }

    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            PageType::of_page(data) == PageType::Branch,
            "expected branch page, got {:?}",
            PageType::of_page(data)
        );
        header::<BranchHeader>(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> BranchPage<'_> {
        BranchPage { data: self.data }
    }

    pub fn entry_count(&self) -> usize {
        self.as_ref().entry_count()
    }

    pub fn set_right_child(&mut self, id: PageId) {
        // INVARIANT: header validated in init/from_page
        header_mut::<BranchHeader>(self.data).unwrap().right_child = U64::new(id);
    }

    pub fn set_child_at(&mut self, idx: usize, id: PageId) -> Result<()> {
        ensure!(
            idx < self.entry_count(),
            "branch slot {} out of bounds (entry_count={})",
            idx,
            self.entry_count()
        );
        let off = self.as_ref().slot(idx);
        self.data[off..off + 8].copy_from_slice(&id.to_be_bytes());
        Ok(())
    }

    /// Inserts `(child, separator)` at slot `idx`, shifting later slots
    /// right. Reports [`PageInsert::Full`] without touching the page when
    /// the entry does not fit.
    pub fn insert_entry(&mut self, idx: usize, child: PageId, key: &[u8]) -> Result<PageInsert> {
        let count = self.entry_count();
        ensure!(
            idx <= count,
            "branch insert index {} out of bounds (entry_count={})",
            idx,
            count
        );

        let body_len = 8 + 2 + key.len();
        if self.as_ref().free_space() < body_len + SLOT_SIZE {
            return Ok(PageInsert::Full);
        }

        let body_at = self.as_ref().data_start() - body_len;
        self.data[body_at..body_at + 8].copy_from_slice(&child.to_be_bytes());
        write_u16(self.data, body_at + 8, key.len());
        self.data[body_at + 10..body_at + 10 + key.len()].copy_from_slice(key);

        let slots = BRANCH_HEADER_SIZE;
        self.data.copy_within(
            slots + idx * SLOT_SIZE..slots + count * SLOT_SIZE,
            slots + (idx + 1) * SLOT_SIZE,
        );
        write_u16(self.data, slots + idx * SLOT_SIZE, body_at);

        header_mut::<BranchHeader>(self.data).unwrap().num_entries = U16::new(count as u16 + 1);
        Ok(PageInsert::Done)
    }

    /// Splits the branch, promoting the middle separator. The middle
    /// entry's child becomes this page's new `right_child`; the old
    /// `right_child` moves to the new right page. Returns the promoted
    /// separator, which the caller inserts into the parent.
    pub fn split_into(&mut self, right: &mut [u8]) -> Result<Vec<u8>> {
        let snapshot = self.as_ref();
        let count = snapshot.entry_count();
        ensure!(count >= 3, "cannot split a branch with {count} entries");

        let mut entries = Vec::with_capacity(count);
        for idx in 0..count {
            entries.push((snapshot.child_at(idx)?, snapshot.key_at(idx)?.to_vec()));
        }
        let index_id = snapshot.index_id();
        let old_right = snapshot.right_child();

        let mid = count / 2;
        let promoted = entries[mid].1.clone();
        let mid_child = entries[mid].0;

        let mut right_page = BranchPageMut::init(right, index_id, old_right)?;
        for (pos, (child, key)) in entries[mid + 1..].iter().enumerate() {
            ensure!(
                right_page.insert_entry(pos, *child, key)? == PageInsert::Done,
                "branch split overflowed the right page"
            );
        }

        let mut left_page = BranchPageMut::init(self.data, index_id, mid_child)?;
        for (pos, (child, key)) in entries[..mid].iter().enumerate() {
            ensure!(
                left_page.insert_entry(pos, *child, key)? == PageInsert::Done,
                "branch split overflowed the left page"
            );
        }

        Ok(promoted)
    }
}

// ---------------------------------------------------------------------------
// Overflow and free pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct OverflowPage<'a> {
    data: &'a [u8],
}

pub struct OverflowPageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> OverflowPage<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            PageType::of_page(data) == PageType::Overflow,
            "expected overflow page, got {:?}",
            PageType::of_page(data)
        );
        header::<OverflowHeader>(data)?;
        Ok(Self { data })
    }

    fn hdr(&self) -> &OverflowHeader {
        // INVARIANT: header validated in from_page
        header::<OverflowHeader>(self.data).unwrap()
    }

    pub fn next(&self) -> PageId {
        self.hdr().next.get()
    }

    pub fn chunk(&self) -> Result<&'a [u8]> {
        let len = self.hdr().data_len.get() as usize;
        ensure!(
            OVERFLOW_HEADER_SIZE + len <= self.data.len(),
            "overflow chunk extends beyond page"
        );
        Ok(&self.data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + len])
    }

    pub fn capacity(page_size: usize) -> usize {
        page_size - OVERFLOW_HEADER_SIZE
    }
}

impl<'a> OverflowPageMut<'a> {
    pub fn init(data: &'a mut [u8], index_id: u8, chunk: &[u8], next: PageId) -> Result<Self> {
        ensure!(
            chunk.len() <= OverflowPage::capacity(data.len()),
            "overflow chunk of {} bytes exceeds page capacity {}",
            chunk.len(),
            OverflowPage::capacity(data.len())
        );
        data.fill(0);
        let hdr = header_mut::<OverflowHeader>(data)?;
        hdr.page_type = PageType::Overflow as u8;
        hdr.index_id = index_id;
        hdr.next = U64::new(next);
        hdr.data_len = U32::new(chunk.len() as u32);
        data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        Ok(Self { data })
    }
}

/// Marks a page buffer as free. The contents are zeroed; free pages carry
/// no payload and exist only so page scans can classify them.
pub fn init_free(data: &mut [u8]) {
    data.fill(0);
    data[0] = PageType::Free as u8;
}
