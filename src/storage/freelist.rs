//! # Free-Page Tracking and the FreeDB
//!
//! Copy-on-write never reuses a page in place, so every write orphans the
//! pages it replaced. Two structures manage their afterlife:
//!
//! - [`FreePageTracker`]: an in-memory list of page ids orphaned during
//!   the current transaction. Inline capacity matches the expected COW
//!   path length; oversized transactions spill to the heap.
//! - [`FreeDb`]: a persistent B+ tree, rooted in the meta page, mapping
//!   `tx_id -> [page_id]`. Entries become reclaimable only once every
//!   active reader's snapshot is at least as new as the freeing tx.
//!
//! ## The self-reference problem
//!
//! Persisting the freed list mutates the FreeDB, which itself orphans
//! pages. Those orphans cannot go into the entry being written, so each
//! commit captures them in a *carry-forward* tracker that is merged into
//! the next transaction's freed list. The recursion terminates because a
//! page lives at a single id for its lifetime and cannot be freed twice;
//! an empty carry-forward ends the chain.
//!
//! Reclamation deletes consumed FreeDB entries and routes the deletion's
//! own orphans through the same carry-forward, so the scheme is closed
//! under both directions of FreeDB traffic.
//!
//! ## Oversized freed lists
//!
//! A freed list that exceeds the tree's inline value cap is spilled to an
//! overflow-page chain; the entry value then holds a sentinel, the chain
//! head, and the byte length. Chain pages consumed during reclamation are
//! themselves routed through the carry-forward, because a live reader's
//! snapshot may still reference them through its `free_root`.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use super::page::{OverflowPage, OverflowPageMut};
use super::{PageId, PageSource, Pager};
use crate::btree::{cmp_bytes, Tree};

/// Inline tracker capacity; beyond this the tracker spills to the heap.
pub const MAX_TRACKED_PAGES: usize = 256;

/// Index-id tag stamped into FreeDB and overflow pages.
const FREE_INDEX_ID: u8 = 4;

/// Sentinel count marking a spilled (overflow-chain) freed list.
const SPILLED: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct FreePageTracker {
    pages: SmallVec<[PageId; MAX_TRACKED_PAGES]>,
}

impl FreePageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: PageId) {
        self.pages.push(id);
    }

    pub fn merge(&mut self, mut other: FreePageTracker) {
        self.pages.append(&mut other.pages);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn as_slice(&self) -> &[PageId] {
        &self.pages
    }

    pub fn take(&mut self) -> SmallVec<[PageId; MAX_TRACKED_PAGES]> {
        std::mem::take(&mut self.pages)
    }
}

/// The persistent freed-page tree. Keys are big-endian tx ids, so plain
/// byte comparison scans in commit order.
#[derive(Debug, Clone)]
pub struct FreeDb {
    tree: Tree,
}

impl FreeDb {
    pub fn new(root: PageId) -> Self {
        Self {
            tree: Tree::new(root, FREE_INDEX_ID, cmp_bytes),
        }
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Persists the pages freed by `tx_id` and returns the carry-forward
    /// tracker holding the orphans of this very insert.
    pub fn commit_freed(
        &mut self,
        pager: &mut Pager,
        tx_id: u64,
        freed: &[PageId],
    ) -> Result<FreePageTracker> {
        let mut carry = FreePageTracker::new();
        if freed.is_empty() {
            return Ok(carry);
        }

        let encoded = encode_freed(freed);
        let inline_limit = pager.page_size() / 8;

        if encoded.len() <= inline_limit {
            self.tree
                .insert(pager, &mut carry, &tx_id.to_be_bytes(), &encoded)?;
        } else {
            let head = write_chain(pager, &encoded)?;
            let mut marker = Vec::with_capacity(16);
            marker.extend_from_slice(&SPILLED.to_be_bytes());
            marker.extend_from_slice(&head.to_be_bytes());
            marker.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            self.tree
                .insert(pager, &mut carry, &tx_id.to_be_bytes(), &marker)?;
        }

        debug!(tx_id, freed = freed.len(), carry = carry.len(), "freed pages persisted");
        Ok(carry)
    }

    /// Moves every entry with `tx_id <= oldest_reader_tx` into the
    /// pager's reuse list. Orphans of the deletions (and consumed
    /// overflow-chain pages) land in `carry`. Returns the number of
    /// pages made reusable.
    pub fn reclaim(
        &mut self,
        pager: &mut Pager,
        oldest_reader_tx: u64,
        carry: &mut FreePageTracker,
    ) -> Result<usize> {
        if self.tree.is_empty() {
            return Ok(0);
        }

        // collect first: the cursor borrows the pager immutably
        let mut consumed: Vec<(u64, Vec<u8>)> = Vec::new();
        {
            let mut cursor = self.tree.cursor(pager);
            cursor.seek_first()?;
            while let Some((key, value)) = cursor.next()? {
                ensure!(key.len() == 8, "malformed FreeDB key of {} bytes", key.len());
                let tx = u64::from_be_bytes(key.try_into().unwrap());
                if tx > oldest_reader_tx {
                    break;
                }
                consumed.push((tx, value.to_vec()));
            }
        }

        let mut reclaimed = 0usize;
        for (tx, value) in consumed {
            let pages = match decode_freed(&value)? {
                FreedList::Inline(pages) => pages,
                FreedList::Spilled { head, len } => {
                    let (data, chain) = read_chain(pager, head, len)?;
                    for chain_page in chain {
                        carry.track(chain_page);
                    }
                    match decode_freed(&data)? {
                        FreedList::Inline(pages) => pages,
                        FreedList::Spilled { .. } => {
                            eyre::bail!("nested spill marker in FreeDB entry for tx {tx}")
                        }
                    }
                }
            };

            reclaimed += pages.len();
            pager.push_reusable(pages);
            self.tree.delete(pager, carry, &tx.to_be_bytes())?;
        }

        if reclaimed > 0 {
            debug!(oldest_reader_tx, reclaimed, "reclaimed freed pages");
        }
        Ok(reclaimed)
    }
}

enum FreedList {
    Inline(Vec<PageId>),
    Spilled { head: PageId, len: usize },
}

fn encode_freed(pages: &[PageId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + pages.len() * 8);
    out.extend_from_slice(&(pages.len() as u32).to_be_bytes());
    for page in pages {
        out.extend_from_slice(&page.to_be_bytes());
    }
    out
}

fn decode_freed(value: &[u8]) -> Result<FreedList> {
    ensure!(value.len() >= 4, "truncated FreeDB value");
    let count = u32::from_be_bytes(value[..4].try_into().unwrap());

    if count == SPILLED {
        ensure!(value.len() == 16, "malformed FreeDB spill marker");
        let head = u64::from_be_bytes(value[4..12].try_into().unwrap());
        let len = u32::from_be_bytes(value[12..16].try_into().unwrap()) as usize;
        return Ok(FreedList::Spilled { head, len });
    }

    let count = count as usize;
    ensure!(
        value.len() == 4 + count * 8,
        "FreeDB value length {} does not match count {}",
        value.len(),
        count
    );
    let pages = value[4..]
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Ok(FreedList::Inline(pages))
}

/// Writes `data` as a forward-linked overflow chain, returning the head.
/// Chunks are written back to front so each page knows its successor.
fn write_chain(pager: &mut Pager, data: &[u8]) -> Result<PageId> {
    let capacity = OverflowPage::capacity(pager.page_size());
    let mut next: PageId = 0;
    let chunks: Vec<&[u8]> = data.chunks(capacity).collect();
    for chunk in chunks.into_iter().rev() {
        let mut buf = vec![0u8; pager.page_size()];
        OverflowPageMut::init(&mut buf, FREE_INDEX_ID, chunk, next)?;
        let id = pager.alloc_page();
        pager.write_page(id, &buf)?;
        next = id;
    }
    pager.remap()?;
    Ok(next)
}

/// Reads an overflow chain back into memory, returning the data and the
/// chain's page ids (for the caller to free).
fn read_chain(view: &impl PageSource, head: PageId, expected_len: usize) -> Result<(Vec<u8>, Vec<PageId>)> {
    let mut data = Vec::with_capacity(expected_len);
    let mut chain = Vec::new();
    let mut current = head;
    while current != 0 {
        ensure!(
            data.len() <= expected_len,
            "overflow chain exceeds its recorded length"
        );
        let page = OverflowPage::from_page(view.page(current)?)?;
        data.extend_from_slice(page.chunk()?);
        chain.push(current);
        current = page.next();
    }
    ensure!(
        data.len() == expected_len,
        "overflow chain holds {} bytes, expected {}",
        data.len(),
        expected_len
    );
    Ok((data, chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn test_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("f.db"), PS).unwrap();
        (dir, pager)
    }

    #[test]
    fn tracker_records_and_takes() {
        let mut tracker = FreePageTracker::new();
        assert!(tracker.is_empty());

        tracker.track(10);
        tracker.track(11);
        assert_eq!(tracker.as_slice(), &[10, 11]);

        let mut other = FreePageTracker::new();
        other.track(12);
        tracker.merge(other);
        assert_eq!(tracker.len(), 3);

        let taken = tracker.take();
        assert_eq!(&taken[..], &[10, 11, 12]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_spills_past_inline_capacity() {
        let mut tracker = FreePageTracker::new();
        for id in 0..(MAX_TRACKED_PAGES as u64 + 50) {
            tracker.track(id);
        }
        assert_eq!(tracker.len(), MAX_TRACKED_PAGES + 50);
    }

    #[test]
    fn commit_then_reclaim_round_trips_page_ids() {
        let (_dir, mut pager) = test_pager();
        let mut freedb = FreeDb::new(0);

        let carry = freedb.commit_freed(&mut pager, 1, &[100, 101, 102]).unwrap();
        // first insert into an empty tree orphans nothing
        assert!(carry.is_empty());

        let mut carry = FreePageTracker::new();
        let reclaimed = freedb.reclaim(&mut pager, 1, &mut carry).unwrap();

        assert_eq!(reclaimed, 3);
        // the entry delete's own COW pops one reclaimed page right back
        assert_eq!(pager.reusable_count(), 2);
        // the consumed entry's COW delete orphaned the old FreeDB page
        assert!(!carry.is_empty());
    }

    #[test]
    fn reclaim_respects_the_reader_gate() {
        let (_dir, mut pager) = test_pager();
        let mut freedb = FreeDb::new(0);

        freedb.commit_freed(&mut pager, 1, &[100]).unwrap();
        freedb.commit_freed(&mut pager, 2, &[200]).unwrap();
        freedb.commit_freed(&mut pager, 3, &[300]).unwrap();

        let mut carry = FreePageTracker::new();
        let reclaimed = freedb.reclaim(&mut pager, 2, &mut carry).unwrap();
        assert_eq!(reclaimed, 2);

        // tx 3 is still gated; a later pass picks it up
        let reclaimed = freedb.reclaim(&mut pager, 3, &mut carry).unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[test]
    fn empty_freed_list_writes_nothing() {
        let (_dir, mut pager) = test_pager();
        let mut freedb = FreeDb::new(0);

        let carry = freedb.commit_freed(&mut pager, 5, &[]).unwrap();

        assert!(carry.is_empty());
        assert_eq!(freedb.root(), 0);
    }

    #[test]
    fn second_commit_produces_carry_forward() {
        let (_dir, mut pager) = test_pager();
        let mut freedb = FreeDb::new(0);

        let carry1 = freedb.commit_freed(&mut pager, 1, &[100]).unwrap();
        assert!(carry1.is_empty());

        // the second insert COWs the FreeDB root written by the first
        let carry2 = freedb.commit_freed(&mut pager, 2, &[200]).unwrap();
        assert_eq!(carry2.len(), 1);
    }

    #[test]
    fn large_freed_list_spills_to_an_overflow_chain() {
        let (_dir, mut pager) = test_pager();
        let mut freedb = FreeDb::new(0);

        // 300 ids = 2404 encoded bytes, far beyond the inline cap for a
        // 512-byte page
        let pages: Vec<PageId> = (1000..1300).collect();
        let before = pager.next_page();
        freedb.commit_freed(&mut pager, 1, &pages).unwrap();
        assert!(pager.next_page() > before + 2, "no chain pages were written");

        let mut carry = FreePageTracker::new();
        let reclaimed = freedb.reclaim(&mut pager, 1, &mut carry).unwrap();

        assert_eq!(reclaimed, 300);
        // all but the pages consumed by the entry delete's COW are reusable
        assert!(pager.reusable_count() >= 298);
        // consumed chain pages are carried forward, not reused in place
        assert!(carry.len() >= 5);
    }

    #[test]
    fn overflow_chain_round_trips_bytes() {
        let (_dir, mut pager) = test_pager();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        let head = write_chain(&mut pager, &data).unwrap();
        let (back, chain) = read_chain(&pager, head, data.len()).unwrap();

        assert_eq!(back, data);
        assert_eq!(chain.len(), data.len().div_ceil(OverflowPage::capacity(PS)));
    }
}
