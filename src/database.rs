//! # Database Handle
//!
//! `Database` owns one single-file fact store: the pager, the four datom
//! indexes, the FreeDB, the schema cache, and the dual-meta commit state.
//! It supports exactly one writer at a time (a process-local mutex) and
//! up to `max_readers` concurrent read snapshots.
//!
//! ## Writers
//!
//! [`Database::transact`] stages clones of every tree (O(1) — a tree is a
//! root plus a comparator), runs the transaction pipeline against the
//! staged set, and only adopts the staged roots after the new meta page
//! is durably on disk. Any failure before the meta write leaves both the
//! in-memory state and the file's reachable pages exactly as they were;
//! the allocator state is rolled back so dead page numbers are reissued.
//!
//! ## Readers
//!
//! [`Database::snapshot`] pins the current root tuple, the tx id, and an
//! `Arc` of the current mmap region, and occupies a reader slot. While
//! the slot is live, no page its snapshot can reach is reclaimed: the
//! FreeDB gate only releases entries whose freeing tx is at or below the
//! oldest live reader. Dropping the snapshot releases the slot.
//!
//! ## Commit protocol
//!
//! ```text
//! write data pages -> fsync -> write inactive meta slot -> fsync -> remap
//! ```
//!
//! The meta-slot write is the linearization point; see `storage::meta`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::btree::Cursor;
use crate::error::ZatError;
use crate::index::{keys, IndexKind, IndexRoots, Indexes};
use crate::schema::{bootstrap, SchemaCache, FIRST_FREE_ENTITY};
use crate::storage::{
    FreeDb, FreePageTracker, MetaPage, PageId, PageSource, Pager, DEFAULT_PAGE_SIZE,
};
use crate::txn::{self, TxOp, TxReport};
use crate::types::{Datom, EntityId};

/// Default and hard cap on concurrent reader snapshots.
pub const MAX_READERS: usize = 126;
const READERS_CAP: usize = 1024;

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    path: PathBuf,
    page_size: usize,
    create: bool,
    max_readers: usize,
}

impl DatabaseOptions {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
            create: true,
            max_readers: MAX_READERS,
        }
    }

    /// Page size for a newly created file; ignored when opening an
    /// existing database, whose meta records the size it was created
    /// with.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// When false, opening a missing file fails instead of creating it.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn max_readers(mut self, max_readers: usize) -> Self {
        self.max_readers = max_readers.clamp(1, READERS_CAP);
        self
    }

    pub fn open(self) -> Result<Database> {
        Database::open_with(self)
    }
}

/// Counters reported by [`Database::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub tx_id: u64,
    pub datom_count: u64,
    pub next_entity: u64,
    pub page_size: usize,
    pub next_page: PageId,
    pub reusable_pages: usize,
}

pub struct Database {
    inner: Mutex<DbInner>,
    readers: Arc<ReaderTable>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

struct DbInner {
    pager: Pager,
    indexes: Indexes,
    freedb: FreeDb,
    schema: SchemaCache,
    tx_id: u64,
    next_entity: u64,
    datom_count: u64,
    active_slot: usize,
    carry_forward: Vec<PageId>,
}

impl Database {
    /// Opens `path`, creating a fresh database when the file is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        DatabaseOptions::new(path).open()
    }

    fn open_with(options: DatabaseOptions) -> Result<Self> {
        let readers = Arc::new(ReaderTable::new(options.max_readers));

        let inner = if options.path.exists() {
            DbInner::open_existing(&options.path)?
        } else {
            ensure!(
                options.create,
                "database '{}' does not exist",
                options.path.display()
            );
            DbInner::create(&options.path, options.page_size)?
        };

        Ok(Self {
            inner: Mutex::new(inner),
            readers,
        })
    }

    /// Runs one transaction to durability. Single-writer: concurrent
    /// callers serialize on the handle's mutex.
    pub fn transact(&self, ops: &[TxOp]) -> Result<TxReport> {
        self.inner.lock().transact(ops, &self.readers)
    }

    /// Pins the current committed state for reading. Fails with
    /// `ReadersExhausted` when every reader slot is occupied.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let inner = self.inner.lock();
        let slot = self.readers.acquire(inner.tx_id)?;
        Ok(Snapshot {
            map: inner.pager.map_arc(),
            page_size: inner.pager.page_size(),
            roots: inner.indexes.roots(),
            tx_id: inner.tx_id,
            datom_count: inner.datom_count,
            slot,
            readers: Arc::clone(&self.readers),
        })
    }

    /// Read-only access to the schema cache.
    pub fn with_schema<R>(&self, f: impl FnOnce(&SchemaCache) -> R) -> R {
        f(&self.inner.lock().schema)
    }

    pub fn resolve_ident(&self, keyword: &str) -> Option<EntityId> {
        self.with_schema(|s| s.resolve_ident(keyword))
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock();
        Stats {
            tx_id: inner.tx_id,
            datom_count: inner.datom_count,
            next_entity: inner.next_entity,
            page_size: inner.pager.page_size(),
            next_page: inner.pager.next_page(),
            reusable_pages: inner.pager.reusable_count(),
        }
    }
}

impl DbInner {
    fn create(path: &Path, page_size: usize) -> Result<Self> {
        let mut pager = Pager::create(path, page_size)?;
        let mut indexes = Indexes::from_roots(IndexRoots::default());
        let mut tracker = FreePageTracker::new();

        let datom_count = bootstrap(&mut pager, &mut indexes, &mut tracker)?;

        let roots = indexes.roots();
        let mut meta = MetaPage::new(page_size as u32);
        meta.set_tx_id(0);
        meta.set_eav_root(roots.eav);
        meta.set_ave_root(roots.ave);
        meta.set_vae_root(roots.vae);
        meta.set_txlog_root(roots.txlog);
        meta.set_free_root(0);
        meta.set_next_entity(FIRST_FREE_ENTITY);
        meta.set_next_page(pager.next_page());
        meta.set_datom_count(datom_count);
        meta.seal();

        pager.sync()?;
        pager.write_meta_slot(0, &meta)?;
        pager.sync()?;
        pager.remap()?;

        let schema = SchemaCache::load(&pager, &indexes.eav)?;
        info!(path = %path.display(), "bootstrapped new database");

        Ok(Self {
            pager,
            indexes,
            freedb: FreeDb::new(0),
            schema,
            tx_id: 0,
            next_entity: FIRST_FREE_ENTITY,
            datom_count,
            active_slot: 0,
            // pages the bootstrap itself replaced; tx 1 records them as
            // freed
            carry_forward: tracker.as_slice().to_vec(),
        })
    }

    fn open_existing(path: &Path) -> Result<Self> {
        let (pager, meta, active_slot) = Pager::open(path)?;

        let indexes = Indexes::from_roots(IndexRoots {
            eav: meta.eav_root(),
            ave: meta.ave_root(),
            vae: meta.vae_root(),
            txlog: meta.txlog_root(),
        });
        let schema = SchemaCache::load(&pager, &indexes.eav)
            .wrap_err("failed to rebuild the schema cache")?;

        Ok(Self {
            pager,
            indexes,
            freedb: FreeDb::new(meta.free_root()),
            schema,
            tx_id: meta.tx_id(),
            next_entity: meta.next_entity(),
            datom_count: meta.datom_count(),
            active_slot,
            carry_forward: Vec::new(),
        })
    }

    fn transact(&mut self, ops: &[TxOp], readers: &ReaderTable) -> Result<TxReport> {
        let saved_alloc = self.pager.alloc_state();

        match self.transact_staged(ops, readers) {
            Ok(report) => Ok(report),
            Err(err) => {
                // nothing durable changed; reissue the dead page numbers
                self.pager.restore_alloc_state(saved_alloc);
                Err(err)
            }
        }
    }

    fn transact_staged(&mut self, ops: &[TxOp], readers: &ReaderTable) -> Result<TxReport> {
        // stage O(1) clones; the durable fields are only adopted after
        // the meta slot is on disk
        let mut indexes = self.indexes.clone();
        let mut freedb = self.freedb.clone();
        let mut next_entity = self.next_entity;
        let mut datom_count = self.datom_count;

        let mut tracker = FreePageTracker::new();
        for id in &self.carry_forward {
            tracker.track(*id);
        }

        // reclamation runs before this tx allocates anything
        let oldest = readers.oldest_tx().unwrap_or(self.tx_id);
        freedb.reclaim(&mut self.pager, oldest, &mut tracker)?;

        let new_tx_id = self.tx_id + 1;
        let outcome = txn::process(
            ops,
            &self.schema,
            &mut self.pager,
            &mut indexes,
            &mut tracker,
            new_tx_id,
            &mut next_entity,
            &mut datom_count,
            now_micros()?,
        )?;

        // persist this tx's freed pages; the insert's own orphans carry
        // forward into the next tx
        let freed = tracker.take();
        let carry = freedb.commit_freed(&mut self.pager, new_tx_id, &freed)?;

        let roots = indexes.roots();
        let mut meta = MetaPage::new(self.pager.page_size() as u32);
        meta.set_tx_id(new_tx_id);
        meta.set_eav_root(roots.eav);
        meta.set_ave_root(roots.ave);
        meta.set_vae_root(roots.vae);
        meta.set_txlog_root(roots.txlog);
        meta.set_free_root(freedb.root());
        meta.set_next_entity(next_entity);
        meta.set_next_page(self.pager.next_page());
        meta.set_datom_count(datom_count);
        meta.seal();

        let target_slot = 1 - self.active_slot;
        self.pager.sync()?;
        self.pager.write_meta_slot(target_slot, &meta)?;
        self.pager.sync()?;
        self.pager.remap()?;

        // the handoff is durable; adopt the staged state
        self.indexes = indexes;
        self.freedb = freedb;
        self.tx_id = new_tx_id;
        self.next_entity = next_entity;
        self.datom_count = datom_count;
        self.active_slot = target_slot;
        self.carry_forward = carry.as_slice().to_vec();

        if outcome.touched_db_partition {
            self.schema = SchemaCache::load(&self.pager, &self.indexes.eav)
                .wrap_err("failed to reload the schema cache")?;
            debug!(tx_id = new_tx_id, "schema cache reloaded");
        }

        debug!(
            tx_id = new_tx_id,
            datoms = outcome.report.datom_count,
            slot = target_slot,
            "transaction committed"
        );
        Ok(outcome.report)
    }
}

fn now_micros() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .wrap_err("system clock is before the epoch")?;
    Ok(elapsed.as_micros() as i64)
}

// ---------------------------------------------------------------------------
// Reader slots
// ---------------------------------------------------------------------------

/// Fixed table of reader slots. A slot stores `tx_id + 1` while live and
/// 0 while free, so the oldest active snapshot is one atomic scan away.
struct ReaderTable {
    slots: Box<[AtomicU64]>,
}

impl ReaderTable {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self { slots }
    }

    fn acquire(&self, tx_id: u64) -> Result<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, tx_id + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(idx);
            }
        }
        Err(eyre::Report::new(ZatError::ReadersExhausted {
            limit: self.slots.len(),
        }))
    }

    fn release(&self, idx: usize) {
        self.slots[idx].store(0, Ordering::Release);
    }

    /// Tx id of the oldest live snapshot, or `None` with no readers.
    fn oldest_tx(&self) -> Option<u64> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|v| *v != 0)
            .min()
            .map(|v| v - 1)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A pinned, immutable view of one committed transaction. Holds its own
/// `Arc` of the mmap region, so the writer remapping for new pages never
/// invalidates slices handed out here. Dropping the snapshot frees its
/// reader slot and lifts the reclamation gate.
pub struct Snapshot {
    map: Arc<Mmap>,
    page_size: usize,
    roots: IndexRoots,
    tx_id: u64,
    datom_count: u64,
    slot: usize,
    readers: Arc<ReaderTable>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").finish_non_exhaustive()
    }
}

impl Snapshot {
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub fn datom_count(&self) -> u64 {
        self.datom_count
    }

    /// The root tuple this snapshot reads from.
    pub fn roots(&self) -> IndexRoots {
        self.roots
    }

    /// Raw tree access for the query layers.
    pub fn tree(&self, kind: IndexKind) -> crate::btree::Tree {
        self.roots.open_tree(kind)
    }

    /// All datoms of one index in key order.
    pub fn datoms(&self, kind: IndexKind) -> Result<DatomIter<'_>> {
        let mut cursor = self.tree(kind).cursor(self);
        cursor.seek_first()?;
        Ok(DatomIter { cursor, kind })
    }

    /// Datoms of one index within `[lo, hi)` in encoded-key space.
    pub fn datoms_range(&self, kind: IndexKind, lo: &[u8], hi: &[u8]) -> Result<DatomIter<'_>> {
        let mut cursor = self.tree(kind).cursor(self);
        cursor.seek_range(lo, hi)?;
        Ok(DatomIter { cursor, kind })
    }

    /// Every `(attribute, value)` currently asserted on an entity.
    pub fn entity(&self, e: EntityId) -> Result<DatomIter<'_>> {
        let lo = keys::eav_prefix_e(e);
        let hi = keys::eav_prefix_e(e + 1);
        self.datoms_range(IndexKind::Eav, &lo, &hi)
    }
}

impl PageSource for Snapshot {
    fn page(&self, id: PageId) -> Result<&[u8]> {
        let mapped = self.map.len() / self.page_size;
        ensure!(
            (id as usize) < mapped,
            "page {} out of snapshot bounds ({} pages)",
            id,
            mapped
        );
        let offset = id as usize * self.page_size;
        Ok(&self.map[offset..offset + self.page_size])
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.readers.release(self.slot);
    }
}

/// Streams decoded datoms out of one index. For EAV/AVE/VAE the key does
/// not carry the asserting tx, so `tx` is reported as 0 and `added` as
/// true; TxLog datoms are complete.
pub struct DatomIter<'s> {
    cursor: Cursor<'s, Snapshot>,
    kind: IndexKind,
}

impl<'s> DatomIter<'s> {
    pub fn next(&mut self) -> Result<Option<Datom<'s>>> {
        let Some((key, _)) = self.cursor.next()? else {
            return Ok(None);
        };
        let datom = match self.kind {
            IndexKind::Eav => {
                let (e, a, v) = keys::decode_eav(key)?;
                Datom {
                    e,
                    a,
                    v,
                    tx: 0,
                    added: true,
                }
            }
            IndexKind::Ave => {
                let (a, v, e) = keys::decode_ave(key)?;
                Datom {
                    e,
                    a,
                    v,
                    tx: 0,
                    added: true,
                }
            }
            IndexKind::Vae => {
                let (v, a, e) = keys::decode_vae(key)?;
                Datom {
                    e,
                    a,
                    v: crate::types::Value::Ref(v),
                    tx: 0,
                    added: true,
                }
            }
            IndexKind::TxLog => keys::decode_txlog(key)?,
        };
        Ok(Some(datom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;
    use crate::types::Value;
    use tempfile::tempdir;

    fn name_schema() -> Vec<TxOp> {
        vec![
            TxOp::assert("a", ":db/ident", Value::keyword(":user/name")),
            TxOp::assert("a", ":db/valueType", Value::keyword(":db.type/string")),
            TxOp::assert("a", ":db/cardinality", Value::keyword(":db.cardinality/one")),
        ]
    }

    #[test]
    fn fresh_database_starts_past_the_bootstrap() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("z.db")).unwrap();

        let stats = db.stats();
        assert_eq!(stats.tx_id, 0);
        assert_eq!(stats.next_entity, FIRST_FREE_ENTITY);
        assert!(stats.datom_count > 0);
        assert_eq!(db.resolve_ident(":db/ident"), Some(1));
    }

    #[test]
    fn reopen_restores_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.db");
        let (tx_id, entity);
        {
            let db = Database::open(&path).unwrap();
            db.transact(&name_schema()).unwrap();
            let report = db
                .transact(&[TxOp::assert("p", ":user/name", Value::string("Ada"))])
                .unwrap();
            tx_id = report.tx_id;
            entity = report.tempids["p"];
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().tx_id, tx_id);
        // the schema tempid took the first free db-partition sequence
        assert_eq!(db.resolve_ident(":user/name"), Some(9));

        let snap = db.snapshot().unwrap();
        let mut iter = snap.entity(entity).unwrap();
        let d = iter.next().unwrap().unwrap();
        assert_eq!(d.v, Value::string("Ada"));
    }

    #[test]
    fn snapshot_is_isolated_from_later_transactions() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("z.db")).unwrap();
        db.transact(&name_schema()).unwrap();
        let e = db
            .transact(&[TxOp::assert("p", ":user/name", Value::string("Ada"))])
            .unwrap()
            .tempids["p"];

        let snap = db.snapshot().unwrap();
        db.transact(&[TxOp::assert(e, ":user/name", Value::string("Grace"))])
            .unwrap();

        // the old snapshot still reads the old value
        let mut iter = snap.entity(e).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().v, Value::string("Ada"));

        // a new snapshot reads the new one
        let snap2 = db.snapshot().unwrap();
        let mut iter = snap2.entity(e).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().v, Value::string("Grace"));
        assert!(snap2.tx_id() > snap.tx_id());
    }

    #[test]
    fn reader_slots_are_bounded_and_reusable() {
        let dir = tempdir().unwrap();
        let db = DatabaseOptions::new(dir.path().join("z.db"))
            .max_readers(2)
            .open()
            .unwrap();

        let s1 = db.snapshot().unwrap();
        let _s2 = db.snapshot().unwrap();

        let err = db.snapshot().unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(ZatError::ReadersExhausted { limit: 2 })
        ));

        drop(s1);
        assert!(db.snapshot().is_ok());
    }

    #[test]
    fn failed_transaction_leaves_counters_untouched() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("z.db")).unwrap();
        db.transact(&name_schema()).unwrap();
        let before = db.stats();

        let err = db
            .transact(&[TxOp::assert("p", ":user/name", Value::Int(5))])
            .unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(ZatError::TypeMismatch { .. })
        ));

        let after = db.stats();
        assert_eq!(before.tx_id, after.tx_id);
        assert_eq!(before.datom_count, after.datom_count);
        assert_eq!(before.next_entity, after.next_entity);
        assert_eq!(before.next_page, after.next_page);
    }

    #[test]
    fn open_without_create_fails_on_missing_file() {
        let dir = tempdir().unwrap();

        let result = DatabaseOptions::new(dir.path().join("missing.db"))
            .create(false)
            .open();

        assert!(result.is_err());
    }

    #[test]
    fn txlog_iteration_yields_complete_datoms() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("z.db")).unwrap();
        db.transact(&name_schema()).unwrap();
        let report = db
            .transact(&[TxOp::assert("p", ":user/name", Value::string("Ada"))])
            .unwrap();

        let snap = db.snapshot().unwrap();
        let lo = keys::txlog_prefix_tx(report.tx_id);
        let hi = keys::txlog_prefix_tx(report.tx_id + 1);
        let mut iter = snap.datoms_range(IndexKind::TxLog, &lo, &hi).unwrap();

        let mut seen = Vec::new();
        while let Some(d) = iter.next().unwrap() {
            assert_eq!(d.tx, report.tx_id);
            seen.push((d.a, d.added));
        }
        // the name assertion plus the tx-instant datom
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, added)| *added));
    }
}
