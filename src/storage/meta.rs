//! # Dual Meta-Page Commit Protocol
//!
//! Pages 0 and 1 each hold a meta page: the root pointers of all five
//! trees plus the counters that define a committed snapshot. A commit
//! writes every new data page, syncs, then overwrites exactly one meta
//! slot and syncs again. The single meta-slot write is the linearization
//! point; there is no write-ahead log.
//!
//! ## Layout (92 bytes, zero-padded to the page size, big-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "ZATD" (0x5A415444)
//! 4       4     format version
//! 8       4     page_size
//! 12      4     flags
//! 16      8     tx_id
//! 24      8     eav_root
//! 32      8     ave_root
//! 40      8     vae_root
//! 48      8     txlog_root
//! 56      8     free_root
//! 64      8     next_entity
//! 72      8     next_page
//! 80      8     datom_count
//! 88      4     crc32 over bytes 0..88
//! ```
//!
//! ## Crash recovery
//!
//! On open both slots are read; a slot is valid iff magic, version, and
//! checksum verify. The valid slot with the higher `tx_id` is active. A
//! crash before the meta write leaves the previous slot intact and the
//! new data pages unreferenced; a torn meta write fails its checksum and
//! the other slot remains authoritative. Both slots never carry the same
//! `tx_id`, so the choice is unambiguous.
//!
//! ## Commit target
//!
//! A commit overwrites the slot whose last-written `tx_id` is lower (or
//! whichever slot is invalid), so the most recent good meta is never
//! touched while the new one lands.

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageId, FIRST_DATA_PAGE};

pub const META_MAGIC: u32 = 0x5A41_5444; // "ZATD"
pub const META_VERSION: u32 = 1;
pub const META_PAGE_LEN: usize = 92;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC_OFFSET: usize = META_PAGE_LEN - 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaPage {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    tx_id: U64,
    eav_root: U64,
    ave_root: U64,
    vae_root: U64,
    txlog_root: U64,
    free_root: U64,
    next_entity: U64,
    next_page: U64,
    datom_count: U64,
    crc32: U32,
}

const _: () = assert!(std::mem::size_of::<MetaPage>() == META_PAGE_LEN);

impl MetaPage {
    /// A fresh meta for a new database: tx 0, empty roots, entity ids
    /// starting above the bootstrap range.
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: U32::new(META_MAGIC),
            version: U32::new(META_VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            tx_id: U64::new(0),
            eav_root: U64::new(0),
            ave_root: U64::new(0),
            vae_root: U64::new(0),
            txlog_root: U64::new(0),
            free_root: U64::new(0),
            next_entity: U64::new(1),
            next_page: U64::new(FIRST_DATA_PAGE),
            datom_count: U64::new(0),
            crc32: U32::new(0),
        }
    }

    /// Parses a meta slot. Returns `None` when the slot does not hold a
    /// valid sealed meta (bad magic, version, or checksum).
    pub fn parse(buf: &[u8]) -> Option<MetaPage> {
        let meta = MetaPage::read_from_bytes(buf.get(..META_PAGE_LEN)?).ok()?;
        if meta.magic.get() != META_MAGIC || meta.version.get() != META_VERSION {
            return None;
        }
        let expect = CRC32.checksum(&meta.as_bytes()[..CRC_OFFSET]);
        (meta.crc32.get() == expect).then_some(meta)
    }

    /// Computes the checksum over the current contents. Must be the last
    /// mutation before the slot is written.
    pub fn seal(&mut self) {
        self.crc32 = U32::new(0);
        let sum = CRC32.checksum(&self.as_bytes()[..CRC_OFFSET]);
        self.crc32 = U32::new(sum);
    }

    /// Serializes into a page buffer, zero-padding the remainder.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() >= META_PAGE_LEN,
            "meta buffer too small: {} < {}",
            buf.len(),
            META_PAGE_LEN
        );
        buf.fill(0);
        buf[..META_PAGE_LEN].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn tx_id(&self) -> u64 {
        self.tx_id.get()
    }

    pub fn set_tx_id(&mut self, tx: u64) {
        self.tx_id = U64::new(tx);
    }

    pub fn eav_root(&self) -> PageId {
        self.eav_root.get()
    }

    pub fn set_eav_root(&mut self, id: PageId) {
        self.eav_root = U64::new(id);
    }

    pub fn ave_root(&self) -> PageId {
        self.ave_root.get()
    }

    pub fn set_ave_root(&mut self, id: PageId) {
        self.ave_root = U64::new(id);
    }

    pub fn vae_root(&self) -> PageId {
        self.vae_root.get()
    }

    pub fn set_vae_root(&mut self, id: PageId) {
        self.vae_root = U64::new(id);
    }

    pub fn txlog_root(&self) -> PageId {
        self.txlog_root.get()
    }

    pub fn set_txlog_root(&mut self, id: PageId) {
        self.txlog_root = U64::new(id);
    }

    pub fn free_root(&self) -> PageId {
        self.free_root.get()
    }

    pub fn set_free_root(&mut self, id: PageId) {
        self.free_root = U64::new(id);
    }

    pub fn next_entity(&self) -> u64 {
        self.next_entity.get()
    }

    pub fn set_next_entity(&mut self, id: u64) {
        self.next_entity = U64::new(id);
    }

    pub fn next_page(&self) -> PageId {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, id: PageId) {
        self.next_page = U64::new(id);
    }

    pub fn datom_count(&self) -> u64 {
        self.datom_count.get()
    }

    pub fn set_datom_count(&mut self, count: u64) {
        self.datom_count = U64::new(count);
    }
}

/// Picks the active meta: the valid slot with the highest `tx_id`.
/// Returns `(slot_index, meta)`, or `None` when neither slot is valid.
pub fn select_active_slot(
    slot0: Option<MetaPage>,
    slot1: Option<MetaPage>,
) -> Option<(usize, MetaPage)> {
    match (slot0, slot1) {
        (Some(a), Some(b)) => {
            if a.tx_id() >= b.tx_id() {
                Some((0, a))
            } else {
                Some((1, b))
            }
        }
        (Some(a), None) => Some((0, a)),
        (None, Some(b)) => Some((1, b)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(tx: u64) -> MetaPage {
        let mut meta = MetaPage::new(4096);
        meta.set_tx_id(tx);
        meta.set_eav_root(10);
        meta.seal();
        meta
    }

    #[test]
    fn sealed_meta_round_trips_through_a_page() {
        let meta = sealed(5);
        let mut page = vec![0xFFu8; 4096];
        meta.write_into(&mut page).unwrap();

        let parsed = MetaPage::parse(&page).unwrap();
        assert_eq!(parsed.tx_id(), 5);
        assert_eq!(parsed.eav_root(), 10);
        assert_eq!(parsed.page_size(), 4096);
        // padding is zeroed
        assert!(page[META_PAGE_LEN..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let meta = sealed(1);
        let mut page = vec![0u8; 4096];
        meta.write_into(&mut page).unwrap();
        page[0] ^= 0xFF;

        assert!(MetaPage::parse(&page).is_none());
    }

    #[test]
    fn parse_rejects_corrupted_body() {
        let meta = sealed(1);
        let mut page = vec![0u8; 4096];
        meta.write_into(&mut page).unwrap();
        // flip a bit inside tx_id; the checksum must catch it
        page[20] ^= 0x01;

        assert!(MetaPage::parse(&page).is_none());
    }

    #[test]
    fn parse_rejects_torn_write() {
        let meta = sealed(9);
        let mut page = vec![0u8; 4096];
        meta.write_into(&mut page).unwrap();
        // simulate a torn write: the tail of the meta never hit disk
        for b in &mut page[40..META_PAGE_LEN] {
            *b = 0;
        }

        assert!(MetaPage::parse(&page).is_none());
    }

    #[test]
    fn active_slot_is_highest_valid_tx() {
        assert_eq!(
            select_active_slot(Some(sealed(3)), Some(sealed(4))).map(|(i, m)| (i, m.tx_id())),
            Some((1, 4))
        );
        assert_eq!(
            select_active_slot(Some(sealed(7)), Some(sealed(2))).map(|(i, m)| (i, m.tx_id())),
            Some((0, 7))
        );
        assert_eq!(
            select_active_slot(None, Some(sealed(2))).map(|(i, m)| (i, m.tx_id())),
            Some((1, 2))
        );
        assert!(select_active_slot(None, None).is_none());
    }

    #[test]
    fn reseal_after_mutation_changes_checksum() {
        let mut meta = sealed(1);
        let before = meta.as_bytes().to_vec();

        meta.set_datom_count(99);
        meta.seal();

        assert_ne!(meta.as_bytes(), &before[..]);
        let mut page = vec![0u8; 4096];
        meta.write_into(&mut page).unwrap();
        assert_eq!(MetaPage::parse(&page).unwrap().datom_count(), 99);
    }
}
