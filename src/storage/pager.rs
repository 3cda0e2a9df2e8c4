//! # File Manager
//!
//! `Pager` owns the database file: a read-only memory map for zero-copy
//! page reads, a positioned-write path for new pages, and the page
//! allocator with its reuse list.
//!
//! ## Read path
//!
//! Reads return `&[u8]` slices directly into the mmap region. The map is
//! shared as an `Arc`, so a snapshot can clone the handle and keep its
//! view alive while the writer remaps; nothing a reader can reach is ever
//! rewritten, because pages are written exactly once.
//!
//! ## Write path
//!
//! Writes bypass the map entirely and go through `pwrite`, growing the
//! file as needed. A freshly written page is *not* visible through
//! [`Pager::page`] until [`Pager::remap`] swaps in a map that covers it.
//! The copy-on-write tree never re-reads a page it wrote in the same
//! operation, so each tree write remaps once, at the end.
//!
//! ## Allocation
//!
//! `alloc_page` hands out monotonically increasing page numbers unless
//! the reuse list is non-empty, in which case reclaimed page numbers are
//! popped first. The reuse list is fed by the FreeDB once the oldest
//! active reader has advanced past the transaction that freed the pages.
//!
//! ## Open-time meta discovery
//!
//! The page size lives in the meta pages themselves. Slot 0 is at offset
//! 0; when it parses, its `page_size` field locates slot 1. When slot 0
//! is torn, the standard power-of-two sizes are probed for a valid slot 1
//! whose recorded page size matches the probe. Only when neither slot
//! validates anywhere does open fail with `CorruptDatabase`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use tracing::info;

use super::meta::{select_active_slot, MetaPage, META_PAGE_LEN};
use super::{PageId, FIRST_DATA_PAGE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::ZatError;

const PROBE_SIZES: [usize; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

#[derive(Debug)]
pub struct Pager {
    file: File,
    path: PathBuf,
    map: Arc<Mmap>,
    page_size: usize,
    file_len: u64,
    next_page: PageId,
    reuse: Vec<PageId>,
}

impl Pager {
    /// Creates a fresh database file holding only the two (still invalid)
    /// meta slots. The caller bootstraps content and writes the first meta.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two(),
            "page size {} must be a power of two between {} and {}",
            page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_len = 2 * page_size as u64;
        file.set_len(file_len)
            .wrap_err("failed to reserve meta slots")?;

        let map = Arc::new(map_file(&file)?);
        info!(path = %path.display(), page_size, "created database file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
            page_size,
            file_len,
            next_page: FIRST_DATA_PAGE,
            reuse: Vec::new(),
        })
    }

    /// Opens an existing database file, recovering the active meta slot.
    /// Returns the pager positioned on that meta plus the slot index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, MetaPage, usize)> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        let (slot, meta) = discover_meta(&file, file_len).ok_or_else(|| {
            eyre::Report::new(ZatError::CorruptDatabase {
                reason: format!("no valid meta slot in '{}'", path.display()),
            })
        })?;

        let page_size = meta.page_size() as usize;
        let map = Arc::new(map_file(&file)?);
        info!(
            path = %path.display(),
            tx_id = meta.tx_id(),
            slot,
            "opened database"
        );

        let pager = Self {
            file,
            path: path.to_path_buf(),
            map,
            page_size,
            file_len,
            next_page: meta.next_page(),
            reuse: Vec::new(),
        };
        Ok((pager, meta, slot))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages visible through the current map.
    pub fn mapped_pages(&self) -> u64 {
        self.map.len() as u64 / self.page_size as u64
    }

    pub fn next_page(&self) -> PageId {
        self.next_page
    }

    /// Zero-copy read from the current map. Valid until the pager is
    /// dropped or remapped; snapshots clone [`Pager::map_arc`] instead.
    pub fn page(&self, id: PageId) -> Result<&[u8]> {
        ensure!(
            id < self.mapped_pages(),
            "page {} out of mapped bounds ({} pages)",
            id,
            self.mapped_pages()
        );
        let offset = id as usize * self.page_size;
        Ok(&self.map[offset..offset + self.page_size])
    }

    /// Shares the current map with a snapshot.
    pub fn map_arc(&self) -> Arc<Mmap> {
        Arc::clone(&self.map)
    }

    /// Positioned write of one full page, growing the file if needed. Not
    /// visible through [`Pager::page`] until the next [`Pager::remap`].
    pub fn write_page(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.page_size,
            "page write of {} bytes, expected {}",
            data.len(),
            self.page_size
        );

        let offset = id * self.page_size as u64;
        let end = offset + self.page_size as u64;
        if end > self.file_len {
            self.file
                .set_len(end)
                .wrap_err_with(|| format!("failed to grow file to {end} bytes"))?;
            self.file_len = end;
        }

        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write page {id}"))
    }

    /// Next page number: pops the reuse list first, otherwise extends the
    /// high-water mark.
    pub fn alloc_page(&mut self) -> PageId {
        match self.reuse.pop() {
            Some(id) => id,
            None => {
                let id = self.next_page;
                self.next_page += 1;
                id
            }
        }
    }

    /// Feeds reclaimed page numbers back to the allocator.
    pub fn push_reusable(&mut self, ids: impl IntoIterator<Item = PageId>) {
        self.reuse.extend(ids);
    }

    pub fn reusable_count(&self) -> usize {
        self.reuse.len()
    }

    /// Allocator state for transaction rollback: an aborted transaction
    /// restores this so page numbers consumed by dead writes are handed
    /// out again.
    pub fn alloc_state(&self) -> (PageId, Vec<PageId>) {
        (self.next_page, self.reuse.clone())
    }

    pub fn restore_alloc_state(&mut self, state: (PageId, Vec<PageId>)) {
        self.next_page = state.0;
        self.reuse = state.1;
    }

    /// Unmaps and re-maps the file so pages written since the last remap
    /// become readable. Outstanding snapshot `Arc`s keep the old map alive.
    pub fn remap(&mut self) -> Result<()> {
        let needed = self.next_page * self.page_size as u64;
        if needed > self.file_len {
            self.file
                .set_len(needed)
                .wrap_err("failed to grow file before remap")?;
            self.file_len = needed;
        }
        self.map = Arc::new(map_file(&self.file)?);
        Ok(())
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("fsync failed for '{}'", self.path.display()))
    }

    /// Seals and writes one meta slot (page 0 or 1).
    pub fn write_meta_slot(&mut self, slot: usize, meta: &MetaPage) -> Result<()> {
        ensure!(slot < 2, "meta slot {slot} out of range");
        let mut buf = vec![0u8; self.page_size];
        meta.write_into(&mut buf)?;
        self.write_page(slot as PageId, &buf)
    }
}

impl super::PageSource for Pager {
    fn page(&self, id: PageId) -> Result<&[u8]> {
        Pager::page(self, id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

fn map_file(file: &File) -> Result<Mmap> {
    // SAFETY: Mmap::map is unsafe because the underlying file could be
    // truncated or rewritten externally. This is safe because:
    // 1. The database file is exclusively owned by this process (v1 has
    //    no cross-process readers).
    // 2. Committed pages are write-once; the writer only appends new
    //    pages and overwrites the two meta slots, which the read path
    //    accesses only through freshly parsed copies.
    // 3. The map is held behind Arc, so remapping cannot free a region a
    //    snapshot still references.
    unsafe { Mmap::map(file).wrap_err("failed to memory-map database file") }
}

fn read_slot(file: &File, offset: u64, file_len: u64) -> Option<MetaPage> {
    if offset + META_PAGE_LEN as u64 > file_len {
        return None;
    }
    let mut buf = [0u8; META_PAGE_LEN];
    file.read_exact_at(&mut buf, offset).ok()?;
    MetaPage::parse(&buf)
}

fn discover_meta(file: &File, file_len: u64) -> Option<(usize, MetaPage)> {
    let slot0 = read_slot(file, 0, file_len);

    if let Some(m0) = slot0 {
        let page_size = m0.page_size() as u64;
        let slot1 = read_slot(file, page_size, file_len)
            .filter(|m| m.page_size() == m0.page_size());
        return select_active_slot(Some(m0), slot1);
    }

    // slot 0 is torn; probe the standard sizes for a matching slot 1
    for probe in PROBE_SIZES {
        if let Some(m1) = read_slot(file, probe as u64, file_len) {
            if m1.page_size() as usize == probe {
                info!(page_size = probe, "recovered meta from slot 1");
                return Some((1, m1));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn sealed_meta(tx: u64, next_page: PageId) -> MetaPage {
        let mut meta = MetaPage::new(PS as u32);
        meta.set_tx_id(tx);
        meta.set_next_page(next_page);
        meta.seal();
        meta
    }

    #[test]
    fn create_reserves_two_meta_pages() {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("z.db"), PS).unwrap();

        assert_eq!(pager.mapped_pages(), 2);
        assert_eq!(pager.next_page(), FIRST_DATA_PAGE);
    }

    #[test]
    fn create_rejects_bad_page_size() {
        let dir = tempdir().unwrap();

        assert!(Pager::create(dir.path().join("a.db"), 1000).is_err());
        assert!(Pager::create(dir.path().join("b.db"), 256).is_err());
        assert!(Pager::create(dir.path().join("c.db"), MAX_PAGE_SIZE * 2).is_err());
    }

    #[test]
    fn written_page_becomes_visible_after_remap() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("z.db"), PS).unwrap();

        let id = pager.alloc_page();
        let data = vec![0x42u8; PS];
        pager.write_page(id, &data).unwrap();

        // not mapped yet
        assert!(pager.page(id).is_err());

        pager.remap().unwrap();
        assert_eq!(pager.page(id).unwrap(), &data[..]);
    }

    #[test]
    fn alloc_is_monotonic_until_reuse_arrives() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("z.db"), PS).unwrap();

        assert_eq!(pager.alloc_page(), 2);
        assert_eq!(pager.alloc_page(), 3);

        pager.push_reusable([7, 5]);
        assert_eq!(pager.alloc_page(), 5);
        assert_eq!(pager.alloc_page(), 7);
        assert_eq!(pager.alloc_page(), 4);
    }

    #[test]
    fn alloc_state_round_trips_for_rollback() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("z.db"), PS).unwrap();
        pager.push_reusable([9]);

        let saved = pager.alloc_state();
        let a = pager.alloc_page();
        let b = pager.alloc_page();
        assert_eq!((a, b), (9, 2));

        pager.restore_alloc_state(saved);
        assert_eq!(pager.alloc_page(), 9);
        assert_eq!(pager.alloc_page(), 2);
    }

    #[test]
    fn open_selects_the_higher_valid_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.db");
        {
            let mut pager = Pager::create(&path, PS).unwrap();
            pager.write_meta_slot(0, &sealed_meta(4, 2)).unwrap();
            pager.write_meta_slot(1, &sealed_meta(5, 2)).unwrap();
            pager.sync().unwrap();
        }

        let (_, meta, slot) = Pager::open(&path).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(meta.tx_id(), 5);
    }

    #[test]
    fn open_recovers_from_a_torn_slot_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.db");
        {
            let mut pager = Pager::create(&path, PS).unwrap();
            pager.write_meta_slot(0, &sealed_meta(4, 2)).unwrap();
            pager.write_meta_slot(1, &sealed_meta(3, 2)).unwrap();
            pager.sync().unwrap();
        }

        // scribble over slot 0, simulating a torn meta write
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xDE; 64], 0).unwrap();
        file.sync_data().unwrap();

        let (_, meta, slot) = Pager::open(&path).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(meta.tx_id(), 3);
    }

    #[test]
    fn open_fails_typed_when_both_slots_are_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.db");
        Pager::create(&path, PS).unwrap();

        let err = Pager::open(&path).unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(ZatError::CorruptDatabase { .. })
        ));
    }

    #[test]
    fn next_page_is_restored_from_meta_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("z.db");
        {
            let mut pager = Pager::create(&path, PS).unwrap();
            let data = vec![1u8; PS];
            for _ in 0..6 {
                let id = pager.alloc_page();
                pager.write_page(id, &data).unwrap();
            }
            pager.write_meta_slot(0, &sealed_meta(1, 8)).unwrap();
            pager.sync().unwrap();
        }

        let (pager, _, _) = Pager::open(&path).unwrap();
        assert_eq!(pager.next_page(), 8);
    }
}
