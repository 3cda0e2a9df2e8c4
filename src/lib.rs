//! # ZatDB - Embedded Datomic-Style Fact Store
//!
//! ZatDB is an embedded, single-file database of immutable facts
//! (datoms) built on a copy-on-write B+ tree engine. This crate is the
//! storage core: the query, pull, and time-travel layers are external
//! collaborators that read through snapshots and write through
//! [`Database::transact`].
//!
//! - **Crash safety without a WAL**: two alternating meta pages; the
//!   single meta-slot write is the commit point
//! - **Zero-copy reads**: values are slices into the mmap'd file, valid
//!   for the lifetime of the snapshot that produced them
//! - **MVCC**: one writer, many reader snapshots; old pages are
//!   reclaimed only after every reader has moved past the freeing tx
//!
//! ## Quick Start
//!
//! ```ignore
//! use zatdb::{Database, TxOp, Value};
//!
//! let db = Database::open("./app.zatdb")?;
//!
//! db.transact(&[
//!     TxOp::assert("attr", ":db/ident", Value::keyword(":user/name")),
//!     TxOp::assert("attr", ":db/valueType", Value::keyword(":db.type/string")),
//!     TxOp::assert("attr", ":db/cardinality", Value::keyword(":db.cardinality/one")),
//! ])?;
//!
//! let report = db.transact(&[
//!     TxOp::assert("ada", ":user/name", Value::string("Ada")),
//! ])?;
//!
//! let snap = db.snapshot()?;
//! let mut datoms = snap.entity(report.tempids["ada"])?;
//! while let Some(d) = datoms.next()? {
//!     println!("{:?}", d);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |           Database (transact / snapshot)         |
//! +--------------------------------------------------+
//! |  Transaction pipeline  |  Schema cache           |
//! +--------------------------------------------------+
//! |     Index family (EAV / AVE / VAE / TxLog)       |
//! +--------------------------------------------------+
//! |            Copy-on-write B+ tree                 |
//! +--------------------------------------------------+
//! |  Slotted pages | FreeDB | dual meta | value codec|
//! +--------------------------------------------------+
//! |       Pager (mmap reads, positioned writes)      |
//! +--------------------------------------------------+
//! ```
//!
//! ## File Format
//!
//! A single file of fixed-size pages, big-endian throughout. Pages 0 and
//! 1 are the meta slots; pages 2+ hold tree, overflow, and free pages.
//! Committed pages are written exactly once and never mutated, which is
//! what makes snapshots free.
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, slotted pages, dual meta pages, free-page
//!   tracking
//! - [`btree`]: copy-on-write tree and stack-based cursors
//! - [`encoding`]: order-preserving value codec
//! - [`index`]: the four datom index keyings and their comparators
//! - [`schema`]: meta-schema bootstrap and the in-memory cache
//! - [`txn`]: transaction pipeline (validation, tempids, upsert,
//!   cardinality, uniqueness)

pub mod btree;
pub mod database;
pub mod encoding;
pub mod error;
pub mod index;
pub mod schema;
pub mod storage;
pub mod txn;
pub mod types;

pub use database::{Database, DatabaseOptions, DatomIter, Snapshot, Stats, MAX_READERS};
pub use error::{error_kind, ZatError};
pub use index::{IndexKind, IndexRoots};
pub use schema::SchemaCache;
pub use txn::{EntityRef, Op, TxOp, TxReport};
pub use types::{Datom, EntityId, OwnedValue, Partition, Value, ValueTag};
