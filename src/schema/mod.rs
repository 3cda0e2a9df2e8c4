//! # Meta-Schema and Bootstrap
//!
//! Attributes are ordinary entities in the `db` partition, described by
//! eight reserved meta-attributes (entity ids 1..8) that describe
//! themselves. A fresh database installs their self-describing datoms as
//! transaction 0, after which the schema cache can always rebuild itself
//! from the primary index alone.
//!
//! | Id | Ident | Type |
//! |----|-------|------|
//! | 1 | `:db/ident` | keyword, unique-identity, indexed |
//! | 2 | `:db/valueType` | keyword |
//! | 3 | `:db/cardinality` | keyword |
//! | 4 | `:db/unique` | keyword |
//! | 5 | `:db/index` | boolean |
//! | 6 | `:db/isComponent` | boolean |
//! | 7 | `:db/doc` | string |
//! | 8 | `:db/txInstant` | instant (reserved for tx entities) |

mod cache;

pub use cache::{AttrInfo, Cardinality, SchemaCache, Uniqueness};

use eyre::Result;

use crate::index::{IndexTargets, Indexes};
use crate::storage::{FreePageTracker, Pager};
use crate::types::{Datom, EntityId, Value, ValueTag};

pub const ATTR_IDENT: EntityId = 1;
pub const ATTR_VALUE_TYPE: EntityId = 2;
pub const ATTR_CARDINALITY: EntityId = 3;
pub const ATTR_UNIQUE: EntityId = 4;
pub const ATTR_INDEX: EntityId = 5;
pub const ATTR_IS_COMPONENT: EntityId = 6;
pub const ATTR_DOC: EntityId = 7;
pub const ATTR_TX_INSTANT: EntityId = 8;

/// Entity ids at or below this are bootstrap attributes; a tempid that is
/// the subject of one of them allocates in the `db` partition.
pub const LAST_BOOTSTRAP_ATTR: EntityId = 8;

/// First sequence number handed to user-defined entities.
pub const FIRST_FREE_ENTITY: u64 = 9;

pub const KW_IDENT: &str = ":db/ident";
pub const KW_VALUE_TYPE: &str = ":db/valueType";
pub const KW_CARDINALITY: &str = ":db/cardinality";
pub const KW_UNIQUE: &str = ":db/unique";
pub const KW_INDEX: &str = ":db/index";
pub const KW_IS_COMPONENT: &str = ":db/isComponent";
pub const KW_DOC: &str = ":db/doc";
pub const KW_TX_INSTANT: &str = ":db/txInstant";

pub const KW_CARDINALITY_ONE: &str = ":db.cardinality/one";
pub const KW_CARDINALITY_MANY: &str = ":db.cardinality/many";
pub const KW_UNIQUE_VALUE: &str = ":db.unique/value";
pub const KW_UNIQUE_IDENTITY: &str = ":db.unique/identity";

pub fn parse_value_type(kw: &str) -> Option<ValueTag> {
    match kw {
        ":db.type/boolean" => Some(ValueTag::Bool),
        ":db.type/long" => Some(ValueTag::Int),
        ":db.type/double" => Some(ValueTag::Float),
        ":db.type/string" => Some(ValueTag::String),
        ":db.type/keyword" => Some(ValueTag::Keyword),
        ":db.type/ref" => Some(ValueTag::Ref),
        ":db.type/instant" => Some(ValueTag::Instant),
        ":db.type/uuid" => Some(ValueTag::Uuid),
        ":db.type/bytes" => Some(ValueTag::Bytes),
        _ => None,
    }
}

pub fn value_type_keyword(tag: ValueTag) -> Option<&'static str> {
    match tag {
        ValueTag::Bool => Some(":db.type/boolean"),
        ValueTag::Int => Some(":db.type/long"),
        ValueTag::Float => Some(":db.type/double"),
        ValueTag::String => Some(":db.type/string"),
        ValueTag::Keyword => Some(":db.type/keyword"),
        ValueTag::Ref => Some(":db.type/ref"),
        ValueTag::Instant => Some(":db.type/instant"),
        ValueTag::Uuid => Some(":db.type/uuid"),
        ValueTag::Bytes => Some(":db.type/bytes"),
        ValueTag::Nil => None,
    }
}

pub fn parse_cardinality(kw: &str) -> Option<Cardinality> {
    match kw {
        KW_CARDINALITY_ONE => Some(Cardinality::One),
        KW_CARDINALITY_MANY => Some(Cardinality::Many),
        _ => None,
    }
}

pub fn parse_uniqueness(kw: &str) -> Option<Uniqueness> {
    match kw {
        KW_UNIQUE_VALUE => Some(Uniqueness::Value),
        KW_UNIQUE_IDENTITY => Some(Uniqueness::Identity),
        _ => None,
    }
}

/// The self-describing datoms installed as transaction 0.
pub fn bootstrap_datoms() -> Vec<Datom<'static>> {
    fn attr(
        out: &mut Vec<Datom<'static>>,
        id: EntityId,
        ident: &str,
        value_type: &str,
    ) {
        out.push(datom(id, ATTR_IDENT, Value::keyword(ident)));
        out.push(datom(id, ATTR_VALUE_TYPE, Value::keyword(value_type)));
        out.push(datom(id, ATTR_CARDINALITY, Value::keyword(KW_CARDINALITY_ONE)));
    }

    fn datom(e: EntityId, a: EntityId, v: Value<'static>) -> Datom<'static> {
        Datom {
            e,
            a,
            v,
            tx: 0,
            added: true,
        }
    }

    let mut out = Vec::with_capacity(26);
    attr(&mut out, ATTR_IDENT, KW_IDENT, ":db.type/keyword");
    out.push(datom(
        ATTR_IDENT,
        ATTR_UNIQUE,
        Value::keyword(KW_UNIQUE_IDENTITY),
    ));
    out.push(datom(ATTR_IDENT, ATTR_INDEX, Value::Bool(true)));
    attr(&mut out, ATTR_VALUE_TYPE, KW_VALUE_TYPE, ":db.type/keyword");
    attr(&mut out, ATTR_CARDINALITY, KW_CARDINALITY, ":db.type/keyword");
    attr(&mut out, ATTR_UNIQUE, KW_UNIQUE, ":db.type/keyword");
    attr(&mut out, ATTR_INDEX, KW_INDEX, ":db.type/boolean");
    attr(&mut out, ATTR_IS_COMPONENT, KW_IS_COMPONENT, ":db.type/boolean");
    attr(&mut out, ATTR_DOC, KW_DOC, ":db.type/string");
    attr(&mut out, ATTR_TX_INSTANT, KW_TX_INSTANT, ":db.type/instant");
    out
}

/// Installs the meta-schema into fresh indexes. Returns the number of
/// datoms written. `:db/ident` is unique-identity, so its datoms also
/// populate AVE; nothing in the bootstrap is ref-typed.
pub fn bootstrap(
    pager: &mut Pager,
    indexes: &mut Indexes,
    tracker: &mut FreePageTracker,
) -> Result<u64> {
    let mut count = 0u64;
    for d in bootstrap_datoms() {
        let targets = IndexTargets {
            ave: d.a == ATTR_IDENT,
            vae: false,
        };
        if indexes.insert_datom(pager, tracker, &d, targets)? {
            count += 1;
        }
    }
    Ok(count)
}
