//! # The Datom Index Family
//!
//! Four independent COW B+ trees cover every access path the query
//! layers need:
//!
//! | Index | Key | Populated for | Serves |
//! |-------|-----|---------------|--------|
//! | EAV   | `[E][A][V]` | every datom | entity lookup, existence |
//! | AVE   | `[A][V][E]` | indexed / unique attributes | value lookup, uniqueness probes |
//! | VAE   | `[V][A][E]` | ref-typed attributes | reverse-ref traversal |
//! | TxLog | `[Tx][E][A][V][Op]` | every datom | history, time travel |
//!
//! All tree values are empty; the key carries the whole datom. Explicit
//! retractions delete from EAV/AVE/VAE but only ever *add* records to the
//! TxLog, so history is append-only.

pub mod keys;

use eyre::Result;

use crate::btree::{cmp_bytes, KeyCmp, Tree};
use crate::storage::{FreePageTracker, PageId, Pager};
use crate::types::Datom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Eav,
    Ave,
    Vae,
    TxLog,
}

impl IndexKind {
    pub fn id(self) -> u8 {
        match self {
            IndexKind::Eav => 0,
            IndexKind::Ave => 1,
            IndexKind::Vae => 2,
            IndexKind::TxLog => 3,
        }
    }

    pub fn cmp(self) -> KeyCmp {
        match self {
            IndexKind::Eav => keys::cmp_eav,
            IndexKind::Ave => keys::cmp_ave,
            IndexKind::Vae => cmp_bytes,
            IndexKind::TxLog => keys::cmp_txlog,
        }
    }
}

/// The root tuple persisted in every meta page; one of these plus a tx id
/// is a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRoots {
    pub eav: PageId,
    pub ave: PageId,
    pub vae: PageId,
    pub txlog: PageId,
}

impl IndexRoots {
    pub fn root_of(&self, kind: IndexKind) -> PageId {
        match kind {
            IndexKind::Eav => self.eav,
            IndexKind::Ave => self.ave,
            IndexKind::Vae => self.vae,
            IndexKind::TxLog => self.txlog,
        }
    }

    pub fn open_tree(&self, kind: IndexKind) -> Tree {
        Tree::new(self.root_of(kind), kind.id(), kind.cmp())
    }
}

/// Which side indexes a datom touches besides EAV and TxLog. Derived from
/// the attribute's schema entry by the transaction pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexTargets {
    pub ave: bool,
    pub vae: bool,
}

/// The writer's working set of all four trees. Cloning is O(1), which is
/// how a transaction stages root changes it may still abandon.
#[derive(Debug, Clone)]
pub struct Indexes {
    pub eav: Tree,
    pub ave: Tree,
    pub vae: Tree,
    pub txlog: Tree,
}

impl Indexes {
    pub fn from_roots(roots: IndexRoots) -> Self {
        Self {
            eav: roots.open_tree(IndexKind::Eav),
            ave: roots.open_tree(IndexKind::Ave),
            vae: roots.open_tree(IndexKind::Vae),
            txlog: roots.open_tree(IndexKind::TxLog),
        }
    }

    pub fn roots(&self) -> IndexRoots {
        IndexRoots {
            eav: self.eav.root(),
            ave: self.ave.root(),
            vae: self.vae.root(),
            txlog: self.txlog.root(),
        }
    }

    /// Routes an assertion into EAV and TxLog unconditionally, plus AVE
    /// and VAE per `targets`. Returns whether EAV gained a new key (a
    /// re-assertion of an identical datom updates in place and does not
    /// change the datom count).
    pub fn insert_datom(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        d: &Datom<'_>,
        targets: IndexTargets,
    ) -> Result<bool> {
        let was_new = self
            .eav
            .insert(pager, tracker, &keys::encode_eav(d.e, d.a, &d.v), &[])?;
        self.txlog.insert(
            pager,
            tracker,
            &keys::encode_txlog(d.tx, d.e, d.a, &d.v, true),
            &[],
        )?;
        if targets.ave {
            self.ave
                .insert(pager, tracker, &keys::encode_ave(d.a, &d.v, d.e), &[])?;
        }
        if targets.vae {
            if let Some(v_ref) = d.v.as_ref_id() {
                self.vae
                    .insert(pager, tracker, &keys::encode_vae(v_ref, d.a, d.e), &[])?;
            }
        }
        Ok(was_new)
    }

    /// Removes a datom from EAV/AVE/VAE and appends the retraction record
    /// to the TxLog. The originating assertion stays in the TxLog.
    pub fn retract_datom(
        &mut self,
        pager: &mut Pager,
        tracker: &mut FreePageTracker,
        d: &Datom<'_>,
        targets: IndexTargets,
    ) -> Result<bool> {
        let existed = self
            .eav
            .delete(pager, tracker, &keys::encode_eav(d.e, d.a, &d.v))?;
        if !existed {
            return Ok(false);
        }
        self.txlog.insert(
            pager,
            tracker,
            &keys::encode_txlog(d.tx, d.e, d.a, &d.v, false),
            &[],
        )?;
        if targets.ave {
            self.ave
                .delete(pager, tracker, &keys::encode_ave(d.a, &d.v, d.e))?;
        }
        if targets.vae {
            if let Some(v_ref) = d.v.as_ref_id() {
                self.vae
                    .delete(pager, tracker, &keys::encode_vae(v_ref, d.a, d.e))?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn datom(e: u64, a: u64, v: Value<'static>, tx: u64) -> Datom<'static> {
        Datom {
            e,
            a,
            v,
            tx,
            added: true,
        }
    }

    fn setup() -> (tempfile::TempDir, Pager, Indexes, FreePageTracker) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("i.db"), PS).unwrap();
        let indexes = Indexes::from_roots(IndexRoots::default());
        (dir, pager, indexes, FreePageTracker::new())
    }

    #[test]
    fn plain_datom_touches_only_eav_and_txlog() {
        let (_dir, mut pager, mut indexes, mut tracker) = setup();

        let d = datom(100, 7, Value::string("alice"), 1);
        let was_new = indexes
            .insert_datom(&mut pager, &mut tracker, &d, IndexTargets::default())
            .unwrap();

        assert!(was_new);
        let roots = indexes.roots();
        assert_ne!(roots.eav, 0);
        assert_ne!(roots.txlog, 0);
        assert_eq!(roots.ave, 0);
        assert_eq!(roots.vae, 0);
    }

    #[test]
    fn indexed_ref_datom_populates_all_four() {
        let (_dir, mut pager, mut indexes, mut tracker) = setup();

        let d = datom(100, 7, Value::Ref(200), 1);
        indexes
            .insert_datom(
                &mut pager,
                &mut tracker,
                &d,
                IndexTargets { ave: true, vae: true },
            )
            .unwrap();

        let roots = indexes.roots();
        assert_ne!(roots.eav, 0);
        assert_ne!(roots.ave, 0);
        assert_ne!(roots.vae, 0);
        assert_ne!(roots.txlog, 0);

        assert!(indexes
            .eav
            .contains(&pager, &keys::encode_eav(100, 7, &Value::Ref(200)))
            .unwrap());
        assert!(indexes
            .ave
            .contains(&pager, &keys::encode_ave(7, &Value::Ref(200), 100))
            .unwrap());
        assert!(indexes
            .vae
            .contains(&pager, &keys::encode_vae(200, 7, 100))
            .unwrap());
    }

    #[test]
    fn identical_reassertion_is_not_new() {
        let (_dir, mut pager, mut indexes, mut tracker) = setup();

        let d = datom(100, 7, Value::Int(1), 1);
        assert!(indexes
            .insert_datom(&mut pager, &mut tracker, &d, IndexTargets::default())
            .unwrap());

        let again = datom(100, 7, Value::Int(1), 2);
        assert!(!indexes
            .insert_datom(&mut pager, &mut tracker, &again, IndexTargets::default())
            .unwrap());
    }

    #[test]
    fn retraction_clears_side_indexes_but_extends_txlog() {
        let (_dir, mut pager, mut indexes, mut tracker) = setup();
        let targets = IndexTargets { ave: true, vae: true };

        let d = datom(100, 7, Value::Ref(200), 1);
        indexes
            .insert_datom(&mut pager, &mut tracker, &d, targets)
            .unwrap();

        let r = Datom { tx: 2, added: false, ..d.clone() };
        assert!(indexes
            .retract_datom(&mut pager, &mut tracker, &r, targets)
            .unwrap());

        assert!(!indexes
            .eav
            .contains(&pager, &keys::encode_eav(100, 7, &Value::Ref(200)))
            .unwrap());
        assert!(!indexes
            .ave
            .contains(&pager, &keys::encode_ave(7, &Value::Ref(200), 100))
            .unwrap());
        assert!(!indexes
            .vae
            .contains(&pager, &keys::encode_vae(200, 7, 100))
            .unwrap());
        // both the assertion and the retraction remain in history
        assert!(indexes
            .txlog
            .contains(&pager, &keys::encode_txlog(1, 100, 7, &Value::Ref(200), true))
            .unwrap());
        assert!(indexes
            .txlog
            .contains(&pager, &keys::encode_txlog(2, 100, 7, &Value::Ref(200), false))
            .unwrap());
    }

    #[test]
    fn retracting_an_absent_datom_is_a_no_op() {
        let (_dir, mut pager, mut indexes, mut tracker) = setup();

        let r = Datom {
            e: 1,
            a: 2,
            v: Value::Int(3),
            tx: 1,
            added: false,
        };
        let existed = indexes
            .retract_datom(&mut pager, &mut tracker, &r, IndexTargets::default())
            .unwrap();

        assert!(!existed);
        assert_eq!(indexes.roots(), IndexRoots::default());
    }
}
