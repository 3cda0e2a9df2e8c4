//! # COW B+ Tree Writes and Point Reads
//!
//! A [`Tree`] is a root page number plus a key comparator; the file
//! manager is passed into every operation so that any number of trees can
//! share one pager. Writes copy the descent path:
//!
//! ```text
//! 1. Descend from the root, recording (branch page, route taken).
//! 2. Copy the leaf into a scratch buffer and apply the change.
//! 3. Write the scratch as a fresh page; the old page is orphaned.
//! 4. Walk the recorded path upward, copying each branch with its child
//!    pointer redirected (or a separator inserted after a split).
//! 5. The last copy becomes the new root; remap makes it readable.
//! ```
//!
//! A failed write leaves `root` untouched, so the caller can abort its
//! transaction without unwinding anything.
//!
//! ## Splits
//!
//! A full leaf splits roughly 50/50 and hands the parent a separator. An
//! insert whose key sorts after everything in its leaf instead splits
//! 90/10: the old content stays put and the new entry gets a page of its
//! own, which keeps pages ~90% full under monotonically increasing keys
//! (exactly the shape of tx-log and entity-id ordered keys). Branch
//! splits promote the middle separator; when the root itself splits, a
//! new root branch is allocated and the tree grows one level.
//!
//! ## Update semantics
//!
//! Inserting an existing key replaces its value. Because the COW copy is
//! rebuilt compactly when space runs out, dead bodies left by in-scratch
//! deletions never force a split on their own.
//!
//! ## Key and value limits
//!
//! Keys are capped at `page_size / 4` and values at `page_size / 8` so a
//! split half always has room for the pending entry. Oversized input is
//! rejected with the typed `ValueTooLarge` error before anything is
//! written.

use eyre::{bail, ensure, Result};

use super::{Cursor, KeyCmp};
use crate::error::ZatError;
use crate::storage::{
    BranchPage, BranchPageMut, FreePageTracker, LeafPage, LeafPageMut, PageId, PageInsert,
    PageSource, PageType, Pager, Route,
};

use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Tree {
    root: PageId,
    index_id: u8,
    cmp: KeyCmp,
}

/// State propagated up the descent path after a leaf-level change.
enum Propagate {
    Cow(PageId),
    Split {
        separator: Vec<u8>,
        left: PageId,
        right: PageId,
    },
}

impl Tree {
    pub fn new(root: PageId, index_id: u8, cmp: KeyCmp) -> Self {
        Self {
            root,
            index_id,
            cmp,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn index_id(&self) -> u8 {
        self.index_id
    }

    pub fn cmp(&self) -> KeyCmp {
        self.cmp
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Point lookup. The returned value borrows from the view's mmap
    /// region and lives as long as the view borrow.
    pub fn lookup<'v, V: PageSource>(&self, view: &'v V, key: &[u8]) -> Result<Option<&'v [u8]>> {
        if self.root == 0 {
            return Ok(None);
        }

        let mut current = self.root;
        loop {
            let page = view.page(current)?;
            match PageType::of_page(page) {
                PageType::Leaf => {
                    let leaf = LeafPage::from_page(page)?;
                    return match leaf.find_key(key, self.cmp)? {
                        Some(idx) => Ok(Some(leaf.value_at(idx)?)),
                        None => Ok(None),
                    };
                }
                PageType::Branch => {
                    let branch = BranchPage::from_page(page)?;
                    let (_, child) = branch.route(key, self.cmp)?;
                    current = child;
                }
                other => bail!("unexpected {:?} page {} during lookup", other, current),
            }
        }
    }

    pub fn contains<V: PageSource>(&self, view: &V, key: &[u8]) -> Result<bool> {
        Ok(self.lookup(view, key)?.is_some())
    }

    /// Unpositioned cursor over this root; call one of the `seek`
    /// methods before iterating.
    pub fn cursor<'v, V: PageSource>(&self, view: &'v V) -> Cursor<'v, V> {
        Cursor::new(view, self.root, self.cmp)
    }

    /// Inserts or replaces `(key, value)`. Returns `true` when the key
    /// was not present before (the datom-count bookkeeping needs this).
    pub fn insert(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        check_entry_limits(pager.page_size(), key, value)?;

        if self.root == 0 {
            let mut buf = vec![0u8; pager.page_size()];
            let mut leaf = LeafPageMut::init(&mut buf, self.index_id)?;
            ensure!(
                leaf.insert_entry(0, key, value)? == PageInsert::Done,
                "first entry does not fit an empty leaf"
            );
            let id = pager.alloc_page();
            pager.write_page(id, &buf)?;
            pager.remap()?;
            self.root = id;
            return Ok(true);
        }

        let (leaf_id, path) = self.descend(pager, key)?;

        let mut scratch = pager.page(leaf_id)?.to_vec();
        let mut leaf = LeafPageMut::from_page(&mut scratch)?;
        let mut was_new = true;
        if let Some(idx) = leaf.as_ref().find_key(key, self.cmp)? {
            leaf.delete_entry(idx)?;
            was_new = false;
        }

        let idx = leaf.as_ref().search_point(key, self.cmp)?;
        let mut state = match leaf.insert_entry(idx, key, value)? {
            PageInsert::Done => {
                let id = pager.alloc_page();
                pager.write_page(id, &scratch)?;
                tracker.track(leaf_id);
                Propagate::Cow(id)
            }
            PageInsert::Full => {
                // dead bodies from in-scratch replacement may fake
                // fullness; rebuild compactly before committing to a split
                scratch = compact_leaf(&scratch, self.index_id)?;
                let mut leaf = LeafPageMut::from_page(&mut scratch)?;
                let idx = leaf.as_ref().search_point(key, self.cmp)?;
                match leaf.insert_entry(idx, key, value)? {
                    PageInsert::Done => {
                        let id = pager.alloc_page();
                        pager.write_page(id, &scratch)?;
                        tracker.track(leaf_id);
                        Propagate::Cow(id)
                    }
                    PageInsert::Full => {
                        self.split_leaf(pager, tracker, leaf_id, scratch, key, value)?
                    }
                }
            }
        };

        for (branch_id, route) in path.into_iter().rev() {
            state = self.apply_to_branch(pager, tracker, branch_id, route, state)?;
        }

        let new_root = match state {
            Propagate::Cow(id) => id,
            Propagate::Split {
                separator,
                left,
                right,
            } => {
                // the tree grows one level
                let mut buf = vec![0u8; pager.page_size()];
                let mut root = BranchPageMut::init(&mut buf, self.index_id, right)?;
                ensure!(
                    root.insert_entry(0, left, &separator)? == PageInsert::Done,
                    "root separator does not fit an empty branch"
                );
                let id = pager.alloc_page();
                pager.write_page(id, &buf)?;
                id
            }
        };

        pager.remap()?;
        self.root = new_root;
        Ok(was_new)
    }

    /// Removes `key`. An absent key returns `Ok(false)` without touching
    /// the file or the root. Pages are never merged on underflow; a leaf
    /// may become empty and stay in the tree.
    pub fn delete(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        key: &[u8],
    ) -> Result<bool> {
        if self.root == 0 {
            return Ok(false);
        }

        let (leaf_id, path) = self.descend(pager, key)?;

        let mut scratch = pager.page(leaf_id)?.to_vec();
        let mut leaf = LeafPageMut::from_page(&mut scratch)?;
        let Some(idx) = leaf.as_ref().find_key(key, self.cmp)? else {
            return Ok(false);
        };
        leaf.delete_entry(idx)?;

        let id = pager.alloc_page();
        pager.write_page(id, &scratch)?;
        tracker.track(leaf_id);
        let mut state = Propagate::Cow(id);

        for (branch_id, route) in path.into_iter().rev() {
            state = self.apply_to_branch(pager, tracker, branch_id, route, state)?;
        }

        let Propagate::Cow(new_root) = state else {
            bail!("delete produced a split");
        };

        pager.remap()?;
        self.root = new_root;
        Ok(true)
    }

    /// Root-to-leaf descent recording the route taken at every branch.
    fn descend(&self, pager: &Pager, key: &[u8]) -> Result<(PageId, Vec<(PageId, Route)>)> {
        let mut path = Vec::new();
        let mut current = self.root;
        loop {
            let page = pager.page(current)?;
            match PageType::of_page(page) {
                PageType::Leaf => return Ok((current, path)),
                PageType::Branch => {
                    let branch = BranchPage::from_page(page)?;
                    let (route, child) = branch.route(key, self.cmp)?;
                    path.push((current, route));
                    current = child;
                }
                other => bail!("unexpected {:?} page {} during descent", other, current),
            }
        }
    }

    fn split_leaf(
        &self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        old_id: PageId,
        mut scratch: Vec<u8>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Propagate> {
        let left_id = pager.alloc_page();
        let right_id = pager.alloc_page();
        let page_size = pager.page_size();
        let mut right_buf = vec![0u8; page_size];

        let view = LeafPage::from_page(&scratch)?;
        let count = view.entry_count();
        let last_key = view.key_at(count - 1)?;
        let outer_next = view.next_leaf();

        let separator = if (self.cmp)(key, last_key) == Ordering::Greater {
            // append-order: the old content stays put, the new entry gets
            // a page of its own
            let mut right = LeafPageMut::init(&mut right_buf, self.index_id)?;
            ensure!(
                right.insert_entry(0, key, value)? == PageInsert::Done,
                "append split entry does not fit an empty leaf"
            );
            right.set_prev_leaf(left_id);
            right.set_next_leaf(outer_next);

            let mut left = LeafPageMut::from_page(&mut scratch)?;
            left.set_next_leaf(right_id);
            key.to_vec()
        } else {
            let mut left = LeafPageMut::from_page(&mut scratch)?;
            let separator = left.split_into(&mut right_buf)?;

            let target = if (self.cmp)(key, &separator) == Ordering::Less {
                &mut scratch
            } else {
                &mut right_buf
            };
            let mut half = LeafPageMut::from_page(target)?;
            let idx = half.as_ref().search_point(key, self.cmp)?;
            ensure!(
                half.insert_entry(idx, key, value)? == PageInsert::Done,
                "split half cannot hold the pending entry"
            );

            let mut left = LeafPageMut::from_page(&mut scratch)?;
            left.set_next_leaf(right_id);
            let mut right = LeafPageMut::from_page(&mut right_buf)?;
            right.set_prev_leaf(left_id);
            separator
        };

        pager.write_page(left_id, &scratch)?;
        pager.write_page(right_id, &right_buf)?;
        tracker.track(old_id);

        Ok(Propagate::Split {
            separator,
            left: left_id,
            right: right_id,
        })
    }

    fn apply_to_branch(
        &self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        branch_id: PageId,
        route: Route,
        state: Propagate,
    ) -> Result<Propagate> {
        let mut scratch = pager.page(branch_id)?.to_vec();
        let mut branch = BranchPageMut::from_page(&mut scratch)?;

        match state {
            Propagate::Cow(new_child) => {
                match route {
                    Route::Slot(idx) => branch.set_child_at(idx, new_child)?,
                    Route::RightChild => branch.set_right_child(new_child),
                }
                let id = pager.alloc_page();
                pager.write_page(id, &scratch)?;
                tracker.track(branch_id);
                Ok(Propagate::Cow(id))
            }
            Propagate::Split {
                separator,
                left,
                right,
            } => {
                // redirect the followed pointer to the right half first;
                // inserting (left, separator) at that slot then shifts the
                // redirected entry to sit immediately after the separator
                let insert_at = match route {
                    Route::Slot(idx) => {
                        branch.set_child_at(idx, right)?;
                        idx
                    }
                    Route::RightChild => {
                        branch.set_right_child(right);
                        branch.entry_count()
                    }
                };

                if branch.insert_entry(insert_at, left, &separator)? == PageInsert::Done {
                    let id = pager.alloc_page();
                    pager.write_page(id, &scratch)?;
                    tracker.track(branch_id);
                    return Ok(Propagate::Cow(id));
                }

                scratch = compact_branch(&scratch, self.index_id)?;
                let mut branch = BranchPageMut::from_page(&mut scratch)?;
                if branch.insert_entry(insert_at, left, &separator)? == PageInsert::Done {
                    let id = pager.alloc_page();
                    pager.write_page(id, &scratch)?;
                    tracker.track(branch_id);
                    return Ok(Propagate::Cow(id));
                }

                self.split_branch(pager, tracker, branch_id, scratch, left, &separator)
            }
        }
    }

    fn split_branch(
        &self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        old_id: PageId,
        mut scratch: Vec<u8>,
        pending_child: PageId,
        pending_sep: &[u8],
    ) -> Result<Propagate> {
        let left_id = pager.alloc_page();
        let right_id = pager.alloc_page();
        let mut right_buf = vec![0u8; pager.page_size()];

        let mut left = BranchPageMut::from_page(&mut scratch)?;
        let promoted = left.split_into(&mut right_buf)?;

        // unique separators: the pending one is never equal to the promoted
        let target = if (self.cmp)(pending_sep, &promoted) == Ordering::Less {
            &mut scratch
        } else {
            &mut right_buf
        };
        let mut half = BranchPageMut::from_page(target)?;
        let idx = half.as_ref().upper_bound(pending_sep, self.cmp)?;
        ensure!(
            half.insert_entry(idx, pending_child, pending_sep)? == PageInsert::Done,
            "branch split half cannot hold the pending separator"
        );

        pager.write_page(left_id, &scratch)?;
        pager.write_page(right_id, &right_buf)?;
        tracker.track(old_id);

        Ok(Propagate::Split {
            separator: promoted,
            left: left_id,
            right: right_id,
        })
    }
}

fn check_entry_limits(page_size: usize, key: &[u8], value: &[u8]) -> Result<()> {
    let key_limit = page_size / 4;
    if key.len() > key_limit {
        bail!(ZatError::ValueTooLarge {
            len: key.len(),
            limit: key_limit,
        });
    }
    let value_limit = page_size / 8;
    if value.len() > value_limit {
        bail!(ZatError::ValueTooLarge {
            len: value.len(),
            limit: value_limit,
        });
    }
    Ok(())
}

/// Rebuilds a leaf scratch buffer without the dead bodies left by
/// in-scratch deletions. Only ever runs on unwritten copies.
fn compact_leaf(scratch: &[u8], index_id: u8) -> Result<Vec<u8>> {
    let view = LeafPage::from_page(scratch)?;
    let mut fresh = vec![0u8; scratch.len()];
    let mut leaf = LeafPageMut::init(&mut fresh, index_id)?;
    for idx in 0..view.entry_count() {
        ensure!(
            leaf.insert_entry(idx, view.key_at(idx)?, view.value_at(idx)?)? == PageInsert::Done,
            "compacted leaf cannot hold its own entries"
        );
    }
    leaf.set_prev_leaf(view.prev_leaf());
    leaf.set_next_leaf(view.next_leaf());
    Ok(fresh)
}

fn compact_branch(scratch: &[u8], index_id: u8) -> Result<Vec<u8>> {
    let view = BranchPage::from_page(scratch)?;
    let mut fresh = vec![0u8; scratch.len()];
    let mut branch = BranchPageMut::init(&mut fresh, index_id, view.right_child())?;
    for idx in 0..view.entry_count() {
        ensure!(
            branch.insert_entry(idx, view.child_at(idx)?, view.key_at(idx)?)? == PageInsert::Done,
            "compacted branch cannot hold its own entries"
        );
    }
    Ok(fresh)
}
