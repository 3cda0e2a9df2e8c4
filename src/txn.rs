//! # Transaction Processing
//!
//! A transaction is a list of `(op, entity, attribute, value)` tuples.
//! The pipeline validates every op against the schema cache, resolves
//! tempids (upserting through unique-identity attributes), enforces
//! cardinality and uniqueness, and routes the surviving datoms into the
//! index family. The caller (`Database::transact`) wraps this with the
//! free-page bookkeeping and the atomic meta handoff.
//!
//! ## Pipeline
//!
//! ```text
//! 1. validate      unknown attributes, value/type mismatches
//! 2. tempids       fresh entity ids; db partition when the tempid is
//!                  the subject of a bootstrap attribute, else user
//! 3. upsert        unique-identity asserts on tempids probe AVE and
//!                  remap the tempid onto the existing holder
//! 4. write         per-op cardinality and uniqueness rules (below)
//! 5. tx entity     (tx, :db/txInstant, now) closes the transaction
//! ```
//!
//! ## Write rules
//!
//! - `assert`, cardinality one: an existing `(E, A, old)` with the same
//!   value is a no-op; a different value is retracted (a retraction
//!   record lands in the TxLog) before the new assertion is inserted.
//! - `assert`, cardinality many: plain insert; identical datoms are
//!   idempotent because the EAV key already exists.
//! - `assert` on a unique attribute: another entity already holding the
//!   value fails the whole transaction with `UniqueValueConflict`;
//!   re-asserting onto the same entity is allowed.
//! - `retract`: removes `(E, A, V)` from EAV/AVE/VAE when present and
//!   appends the retraction to the TxLog; retracting an absent datom is
//!   a no-op.
//!
//! Every error leaves the staged trees with the caller; nothing here
//! touches the durable meta state.

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::btree::Tree;
use crate::error::ZatError;
use crate::index::{keys, IndexTargets, Indexes};
use crate::schema::{AttrInfo, Cardinality, SchemaCache, Uniqueness, ATTR_TX_INSTANT, LAST_BOOTSTRAP_ATTR};
use crate::storage::{FreePageTracker, PageSource, Pager};
use crate::types::{
    is_db_partition, make_entity, sequence_of, Datom, EntityId, OwnedValue, Partition, Value,
};

/// Caps on in-process transaction state; exceeding either aborts with a
/// typed overflow error before anything is written.
pub const MAX_TEMPIDS_PER_TX: usize = 4096;
pub const MAX_DATOMS_PER_TX: usize = 32768;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Known(EntityId),
    Tempid(String),
    TxEntity,
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        EntityRef::Known(id)
    }
}

impl From<&str> for EntityRef {
    fn from(name: &str) -> Self {
        EntityRef::Tempid(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Assert,
    Retract,
}

#[derive(Debug, Clone)]
pub struct TxOp {
    pub op: Op,
    pub e: EntityRef,
    pub a: String,
    pub v: OwnedValue,
}

impl TxOp {
    pub fn assert(e: impl Into<EntityRef>, attr: &str, v: OwnedValue) -> Self {
        Self {
            op: Op::Assert,
            e: e.into(),
            a: attr.to_string(),
            v,
        }
    }

    pub fn retract(e: impl Into<EntityRef>, attr: &str, v: OwnedValue) -> Self {
        Self {
            op: Op::Retract,
            e: e.into(),
            a: attr.to_string(),
            v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxReport {
    pub tx_id: u64,
    pub tempids: HashMap<String, EntityId>,
    /// Datom records written by this transaction (assertions plus
    /// retraction records, including the tx-instant datom).
    pub datom_count: u64,
}

#[derive(Debug)]
pub(crate) struct TxOutcome {
    pub report: TxReport,
    /// A `db`-partition entity was written; the schema cache must reload.
    pub touched_db_partition: bool,
}

/// Runs pipeline steps 1..5 against staged trees. `next_entity` and
/// `datom_count` are staged copies the caller only adopts on commit.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process(
    ops: &[TxOp],
    schema: &SchemaCache,
    pager: &mut Pager,
    indexes: &mut Indexes,
    tracker: &mut FreePageTracker,
    new_tx_id: u64,
    next_entity: &mut u64,
    datom_count: &mut u64,
    now_micros: i64,
) -> Result<TxOutcome> {
    if ops.len() > MAX_DATOMS_PER_TX {
        bail!(ZatError::DatomOverflow {
            limit: MAX_DATOMS_PER_TX
        });
    }

    // 1. validate every op against the schema cache
    let attrs = validate(ops, schema)?;

    // 2. allocate tempids
    let mut tempids = allocate_tempids(ops, &attrs, next_entity)?;

    // 3. unique-identity upsert remaps tempids onto existing holders
    upsert_tempids(ops, &attrs, &mut tempids, pager, &indexes.ave)?;

    // 4. write datoms in op order
    let tx_entity = make_entity(Partition::Tx, sequence_of(new_tx_id));
    let mut written = 0u64;
    let mut touched_db = false;

    for (op, attr) in ops.iter().zip(attrs.iter().copied()) {
        let e = match &op.e {
            EntityRef::Known(id) => *id,
            EntityRef::Tempid(name) => tempids[name.as_str()],
            EntityRef::TxEntity => tx_entity,
        };
        touched_db |= is_db_partition(e);
        let targets = attr.index_targets();

        match op.op {
            Op::Assert => {
                written += apply_assert(
                    pager, indexes, tracker, attr, e, &op.v, new_tx_id, targets,
                )?;
            }
            Op::Retract => {
                let d = Datom {
                    e,
                    a: attr.id,
                    v: op.v.clone(),
                    tx: new_tx_id,
                    added: false,
                };
                if indexes.retract_datom(pager, tracker, &d, targets)? {
                    written += 1;
                }
            }
        }
    }

    // 5. the tx entity timestamps the transaction
    let tx_instant = schema
        .attr(ATTR_TX_INSTANT)
        .map(AttrInfo::index_targets)
        .unwrap_or_default();
    let d = Datom {
        e: tx_entity,
        a: ATTR_TX_INSTANT,
        v: Value::Instant(now_micros),
        tx: new_tx_id,
        added: true,
    };
    if indexes.insert_datom(pager, tracker, &d, tx_instant)? {
        written += 1;
    }

    *datom_count += written;

    Ok(TxOutcome {
        report: TxReport {
            tx_id: new_tx_id,
            tempids,
            datom_count: written,
        },
        touched_db_partition: touched_db,
    })
}

fn validate<'s>(ops: &[TxOp], schema: &'s SchemaCache) -> Result<Vec<&'s AttrInfo>> {
    let mut attrs = Vec::with_capacity(ops.len());
    for op in ops {
        let Some(attr) = schema.attr_by_ident(&op.a) else {
            bail!(ZatError::UnknownAttribute {
                ident: op.a.clone()
            });
        };
        if op.v.tag() != attr.value_type {
            bail!(ZatError::TypeMismatch {
                ident: op.a.clone(),
                expected: attr.value_type.name(),
                actual: op.v.tag().name(),
            });
        }
        attrs.push(attr);
    }
    Ok(attrs)
}

fn allocate_tempids(
    ops: &[TxOp],
    attrs: &[&AttrInfo],
    next_entity: &mut u64,
) -> Result<HashMap<String, EntityId>> {
    // a tempid that is the subject of any bootstrap attribute describes
    // schema and allocates in the db partition
    let mut wants_db: HashMap<&str, bool> = HashMap::new();
    for (op, attr) in ops.iter().zip(attrs) {
        if let EntityRef::Tempid(name) = &op.e {
            let entry = wants_db.entry(name.as_str()).or_insert(false);
            *entry |= attr.id <= LAST_BOOTSTRAP_ATTR;
        }
    }

    if wants_db.len() > MAX_TEMPIDS_PER_TX {
        bail!(ZatError::TempidOverflow {
            limit: MAX_TEMPIDS_PER_TX
        });
    }

    let mut tempids = HashMap::with_capacity(wants_db.len());
    for op in ops {
        if let EntityRef::Tempid(name) = &op.e {
            if !tempids.contains_key(name.as_str()) {
                let partition = if wants_db[name.as_str()] {
                    Partition::Db
                } else {
                    Partition::User
                };
                let id = make_entity(partition, *next_entity);
                *next_entity += 1;
                tempids.insert(name.clone(), id);
            }
        }
    }
    Ok(tempids)
}

fn upsert_tempids(
    ops: &[TxOp],
    attrs: &[&AttrInfo],
    tempids: &mut HashMap<String, EntityId>,
    pager: &Pager,
    ave: &Tree,
) -> Result<()> {
    // a tempid may be remapped at most once; two unique-identity asserts
    // resolving to different existing entities cannot both hold
    let mut remapped: HashMap<&str, EntityId> = HashMap::new();

    for (op, attr) in ops.iter().zip(attrs) {
        if op.op != Op::Assert || attr.unique != Uniqueness::Identity {
            continue;
        }
        let EntityRef::Tempid(name) = &op.e else {
            continue;
        };
        let Some(holder) = ave_holder(pager, ave, attr.id, &op.v)? else {
            continue;
        };

        if let Some(prev) = remapped.get(name.as_str()) {
            if *prev != holder {
                bail!(ZatError::UniqueValueConflict {
                    ident: attr.ident.clone(),
                    holder,
                });
            }
        } else {
            remapped.insert(name.as_str(), holder);
            tempids.insert(name.clone(), holder);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_assert(
    pager: &mut Pager,
    indexes: &mut Indexes,
    tracker: &mut FreePageTracker,
    attr: &AttrInfo,
    e: EntityId,
    v: &OwnedValue,
    tx: u64,
    targets: IndexTargets,
) -> Result<u64> {
    // uniqueness: another entity holding this value fails the tx;
    // re-asserting onto the holder itself is fine
    if attr.unique != Uniqueness::None {
        if let Some(holder) = ave_holder(pager, &indexes.ave, attr.id, v)? {
            if holder != e {
                bail!(ZatError::UniqueValueConflict {
                    ident: attr.ident.clone(),
                    holder,
                });
            }
        }
    }

    let mut written = 0u64;

    if attr.cardinality == Cardinality::One {
        if let Some(old) = first_eav_value(pager, &indexes.eav, e, attr.id)? {
            if old.cmp_sem(v) == std::cmp::Ordering::Equal {
                // idempotent re-assertion
                return Ok(0);
            }
            let retraction = Datom {
                e,
                a: attr.id,
                v: old,
                tx,
                added: false,
            };
            if indexes.retract_datom(pager, tracker, &retraction, targets)? {
                written += 1;
            }
        }
    }

    let d = Datom {
        e,
        a: attr.id,
        v: v.clone(),
        tx,
        added: true,
    };
    if indexes.insert_datom(pager, tracker, &d, targets)? {
        written += 1;
    }
    Ok(written)
}

/// The entity currently holding `(attr, value)` in AVE, if any.
fn ave_holder(
    view: &impl PageSource,
    ave: &Tree,
    attr: EntityId,
    value: &Value<'_>,
) -> Result<Option<EntityId>> {
    let mut cursor = ave.cursor(view);
    cursor.seek(&keys::ave_prefix_av(attr, value))?;
    if let Some((key, _)) = cursor.next()? {
        let (a, v, e) = keys::decode_ave(key)?;
        if a == attr && v.cmp_sem(value) == std::cmp::Ordering::Equal {
            return Ok(Some(e));
        }
    }
    Ok(None)
}

/// The current value of a cardinality-one attribute on `e`, if any.
fn first_eav_value(
    view: &impl PageSource,
    eav: &Tree,
    e: EntityId,
    attr: EntityId,
) -> Result<Option<OwnedValue>> {
    let mut cursor = eav.cursor(view);
    cursor.seek(&keys::eav_prefix_ea(e, attr))?;
    if let Some((key, _)) = cursor.next()? {
        let (ke, ka, kv) = keys::decode_eav(key)?;
        if ke == e && ka == attr {
            return Ok(Some(kv.into_owned()));
        }
    }
    Ok(None)
}
