//! # Stack-Based Tree Cursor
//!
//! Cursors iterate a snapshot of one tree root in key order. Instead of
//! chasing leaf sibling pointers (which would only be reliable for the
//! newest root), the cursor keeps the branch path it descended; crossing
//! a leaf boundary pops the path until a branch has an unvisited child
//! and re-descends. Every historical root scans correctly because the
//! cursor only reads pages reachable from its own root.
//!
//! ## Position model
//!
//! A cursor sits between entries: `next()` yields the entry at the
//! current position and moves forward, `prev()` moves backward and
//! yields the entry it lands on. After forward iteration exhausts the
//! range, `prev()` still works and yields the last entry — `prev` never
//! consults the exhausted flag.
//!
//! ## Bounds
//!
//! `seek` positions at the first key `>=` the target (chasing into the
//! next leaf when the target falls past a leaf's end). `range` adds a
//! half-open upper bound checked on every `next()`. `prev()` is not
//! bounded; reverse scans stop wherever the caller decides.
//!
//! ## Lifetimes
//!
//! Yielded key/value slices borrow from the view's mmap region; they are
//! valid for the lifetime of the view borrow, i.e. the snapshot.

use eyre::{bail, Result};

use super::KeyCmp;
use crate::storage::{BranchPage, LeafPage, PageId, PageSource, PageType};

use std::cmp::Ordering;

pub struct Cursor<'v, V: PageSource> {
    view: &'v V,
    root: PageId,
    cmp: KeyCmp,
    /// Branch pages on the path to the current leaf and the child index
    /// taken at each (`entry_count()` means the right child).
    stack: Vec<(PageId, usize)>,
    leaf: PageId,
    slot: usize,
    end_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl<'v, V: PageSource> Cursor<'v, V> {
    pub(crate) fn new(view: &'v V, root: PageId, cmp: KeyCmp) -> Self {
        Self {
            view,
            root,
            cmp,
            stack: Vec::new(),
            leaf: 0,
            slot: 0,
            end_key: None,
            exhausted: false,
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.leaf = 0;
        self.slot = 0;
        self.end_key = None;
        self.exhausted = false;
    }

    /// Positions before the smallest key.
    pub fn seek_first(&mut self) -> Result<()> {
        self.reset();
        if self.root != 0 {
            self.descend_edge(self.root, Edge::Leftmost)?;
            self.slot = 0;
        }
        Ok(())
    }

    /// Positions after the largest key, for reverse iteration via
    /// [`Cursor::prev`].
    pub fn seek_last(&mut self) -> Result<()> {
        self.reset();
        if self.root != 0 {
            self.descend_edge(self.root, Edge::Rightmost)?;
            let leaf = LeafPage::from_page(self.view.page(self.leaf)?)?;
            self.slot = leaf.entry_count();
        }
        Ok(())
    }

    /// Positions at the first key `>= key`, chasing into the following
    /// leaf when the target falls past the located leaf's entries.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.reset();
        if self.root == 0 {
            return Ok(());
        }

        let mut current = self.root;
        loop {
            let page = self.view.page(current)?;
            match PageType::of_page(page) {
                PageType::Leaf => break,
                PageType::Branch => {
                    let branch = BranchPage::from_page(page)?;
                    let idx = branch.upper_bound(key, self.cmp)?;
                    self.stack.push((current, idx));
                    current = if idx < branch.entry_count() {
                        branch.child_at(idx)?
                    } else {
                        branch.right_child()
                    };
                }
                other => bail!("unexpected {:?} page {} during seek", other, current),
            }
        }

        self.leaf = current;
        let leaf = LeafPage::from_page(self.view.page(current)?)?;
        self.slot = leaf.search_point(key, self.cmp)?;
        Ok(())
    }

    /// Half-open scan `[start, end)`.
    pub fn seek_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.seek(start)?;
        self.end_key = Some(end.to_vec());
        Ok(())
    }

    /// Yields the entry at the current position and moves forward.
    pub fn next(&mut self) -> Result<Option<(&'v [u8], &'v [u8])>> {
        if self.exhausted || self.leaf == 0 {
            return Ok(None);
        }

        loop {
            let leaf = LeafPage::from_page(self.view.page(self.leaf)?)?;
            if self.slot < leaf.entry_count() {
                let key = leaf.key_at(self.slot)?;
                if let Some(end) = &self.end_key {
                    if (self.cmp)(key, end) != Ordering::Less {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
                let value = leaf.value_at(self.slot)?;
                self.slot += 1;
                return Ok(Some((key, value)));
            }
            if !self.advance_leaf()? {
                self.exhausted = true;
                return Ok(None);
            }
        }
    }

    /// Moves backward and yields the entry it lands on. Works after
    /// forward exhaustion; the upper range bound does not apply.
    pub fn prev(&mut self) -> Result<Option<(&'v [u8], &'v [u8])>> {
        if self.leaf == 0 {
            return Ok(None);
        }
        self.exhausted = false;

        loop {
            if self.slot > 0 {
                self.slot -= 1;
                let leaf = LeafPage::from_page(self.view.page(self.leaf)?)?;
                let key = leaf.key_at(self.slot)?;
                let value = leaf.value_at(self.slot)?;
                return Ok(Some((key, value)));
            }
            if !self.retreat_leaf()? {
                return Ok(None);
            }
        }
    }

    /// Re-ascends the recorded path to the next unvisited child and
    /// descends to its leftmost leaf.
    fn advance_leaf(&mut self) -> Result<bool> {
        while let Some((branch_id, idx)) = self.stack.pop() {
            let branch = BranchPage::from_page(self.view.page(branch_id)?)?;
            if idx < branch.entry_count() {
                let next_idx = idx + 1;
                self.stack.push((branch_id, next_idx));
                let child = if next_idx < branch.entry_count() {
                    branch.child_at(next_idx)?
                } else {
                    branch.right_child()
                };
                self.descend_edge(child, Edge::Leftmost)?;
                self.slot = 0;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn retreat_leaf(&mut self) -> Result<bool> {
        while let Some((branch_id, idx)) = self.stack.pop() {
            if idx > 0 {
                let branch = BranchPage::from_page(self.view.page(branch_id)?)?;
                let prev_idx = idx - 1;
                self.stack.push((branch_id, prev_idx));
                let child = branch.child_at(prev_idx)?;
                self.descend_edge(child, Edge::Rightmost)?;
                let leaf = LeafPage::from_page(self.view.page(self.leaf)?)?;
                self.slot = leaf.entry_count();
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn descend_edge(&mut self, from: PageId, edge: Edge) -> Result<()> {
        let mut current = from;
        loop {
            let page = self.view.page(current)?;
            match PageType::of_page(page) {
                PageType::Leaf => {
                    self.leaf = current;
                    return Ok(());
                }
                PageType::Branch => {
                    let branch = BranchPage::from_page(page)?;
                    let count = branch.entry_count();
                    let (idx, child) = match edge {
                        Edge::Leftmost if count > 0 => (0, branch.child_at(0)?),
                        _ => (count, branch.right_child()),
                    };
                    self.stack.push((current, idx));
                    current = child;
                }
                other => bail!("unexpected {:?} page {} during edge descent", other, current),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Leftmost,
    Rightmost,
}
