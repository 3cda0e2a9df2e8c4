//! # In-Memory Schema Cache
//!
//! The cache is a read-only snapshot of every `db`-partition entity,
//! rebuilt by scanning the EAV index in key order. Because entity ids
//! sort by partition tag first, the scan stops at the first key past the
//! `db` partition. The transaction pipeline reloads the cache after any
//! commit that touched a `db`-partition entity.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use tracing::debug;

use super::{
    parse_cardinality, parse_uniqueness, parse_value_type, ATTR_CARDINALITY, ATTR_DOC, ATTR_IDENT,
    ATTR_INDEX, ATTR_IS_COMPONENT, ATTR_UNIQUE, ATTR_VALUE_TYPE,
};
use crate::btree::Tree;
use crate::index::{keys, IndexTargets};
use crate::storage::PageSource;
use crate::types::{EntityId, Partition, Value, ValueTag, SEQ_BITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uniqueness {
    None,
    Value,
    Identity,
}

/// Cached schema state for one attribute entity.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub id: EntityId,
    pub ident: String,
    pub value_type: ValueTag,
    pub cardinality: Cardinality,
    pub unique: Uniqueness,
    pub indexed: bool,
    pub is_component: bool,
    pub doc: Option<String>,
}

impl AttrInfo {
    pub fn is_ref(&self) -> bool {
        self.value_type == ValueTag::Ref
    }

    /// AVE is maintained for indexed or unique attributes; VAE for refs.
    pub fn needs_ave(&self) -> bool {
        self.indexed || self.unique != Uniqueness::None
    }

    pub fn index_targets(&self) -> IndexTargets {
        IndexTargets {
            ave: self.needs_ave(),
            vae: self.is_ref(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SchemaCache {
    by_ident: HashMap<String, EntityId>,
    attrs: HashMap<EntityId, AttrInfo>,
}

#[derive(Default)]
struct PendingAttr {
    ident: Option<String>,
    value_type: Option<ValueTag>,
    cardinality: Option<Cardinality>,
    unique: Option<Uniqueness>,
    indexed: bool,
    is_component: bool,
    doc: Option<String>,
}

impl SchemaCache {
    /// Rebuilds the cache from the EAV index at `eav`'s root.
    pub fn load<V: PageSource>(view: &V, eav: &Tree) -> Result<Self> {
        let db_partition_end: EntityId = (Partition::Db as u64 + 1) << SEQ_BITS;
        let mut pending: HashMap<EntityId, PendingAttr> = HashMap::new();

        let mut cursor = eav.cursor(view);
        cursor.seek_first()?;
        while let Some((key, _)) = cursor.next()? {
            let (e, a, v) = keys::decode_eav(key)?;
            if e >= db_partition_end {
                break;
            }
            let entry = pending.entry(e).or_default();
            apply_meta_attr(entry, e, a, &v)?;
        }

        let mut cache = SchemaCache::default();
        for (id, p) in pending {
            if let Some(ident) = &p.ident {
                cache.by_ident.insert(ident.clone(), id);
            }
            // only entities carrying the full attribute triple act as
            // attributes; other db-partition entities are plain idents
            if let (Some(ident), Some(value_type), Some(cardinality)) =
                (p.ident, p.value_type, p.cardinality)
            {
                cache.attrs.insert(
                    id,
                    AttrInfo {
                        id,
                        ident,
                        value_type,
                        cardinality,
                        unique: p.unique.unwrap_or(Uniqueness::None),
                        indexed: p.indexed,
                        is_component: p.is_component,
                        doc: p.doc,
                    },
                );
            }
        }

        debug!(
            attrs = cache.attrs.len(),
            idents = cache.by_ident.len(),
            "schema cache loaded"
        );
        Ok(cache)
    }

    pub fn resolve_ident(&self, keyword: &str) -> Option<EntityId> {
        self.by_ident.get(keyword).copied()
    }

    pub fn attr(&self, id: EntityId) -> Option<&AttrInfo> {
        self.attrs.get(&id)
    }

    pub fn attr_by_ident(&self, keyword: &str) -> Option<&AttrInfo> {
        self.resolve_ident(keyword).and_then(|id| self.attr(id))
    }

    /// True when `id` is a known attribute and the value carries its
    /// declared type.
    pub fn validate_type(&self, id: EntityId, value: &Value<'_>) -> bool {
        self.attr(id)
            .is_some_and(|attr| attr.value_type == value.tag())
    }

    pub fn is_indexed(&self, id: EntityId) -> bool {
        self.attr(id).is_some_and(AttrInfo::needs_ave)
    }

    pub fn is_ref(&self, id: EntityId) -> bool {
        self.attr(id).is_some_and(AttrInfo::is_ref)
    }

    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }
}

fn apply_meta_attr(entry: &mut PendingAttr, e: EntityId, a: EntityId, v: &Value<'_>) -> Result<()> {
    match a {
        ATTR_IDENT => {
            let kw = expect_keyword(e, "ident", v)?;
            entry.ident = Some(kw.to_string());
        }
        ATTR_VALUE_TYPE => {
            let kw = expect_keyword(e, "value type", v)?;
            entry.value_type = Some(
                parse_value_type(kw)
                    .ok_or_else(|| eyre::eyre!("entity {e} has unknown value type {kw}"))?,
            );
        }
        ATTR_CARDINALITY => {
            let kw = expect_keyword(e, "cardinality", v)?;
            entry.cardinality = Some(
                parse_cardinality(kw)
                    .ok_or_else(|| eyre::eyre!("entity {e} has unknown cardinality {kw}"))?,
            );
        }
        ATTR_UNIQUE => {
            let kw = expect_keyword(e, "uniqueness", v)?;
            entry.unique = Some(
                parse_uniqueness(kw)
                    .ok_or_else(|| eyre::eyre!("entity {e} has unknown uniqueness {kw}"))?,
            );
        }
        ATTR_INDEX => {
            if let Value::Bool(b) = v {
                entry.indexed = *b;
            }
        }
        ATTR_IS_COMPONENT => {
            if let Value::Bool(b) = v {
                entry.is_component = *b;
            }
        }
        ATTR_DOC => {
            if let Value::String(s) = v {
                entry.doc = Some(s.to_string());
            }
        }
        _ => {}
    }
    Ok(())
}

fn expect_keyword<'v>(e: EntityId, what: &str, v: &'v Value<'_>) -> Result<&'v str> {
    ensure!(
        matches!(v, Value::Keyword(_)),
        "entity {e} has a non-keyword {what}"
    );
    Ok(v.as_keyword().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexRoots, Indexes};
    use crate::schema::{bootstrap, KW_CARDINALITY, KW_IDENT, KW_TX_INSTANT};
    use crate::storage::{FreePageTracker, Pager};
    use tempfile::tempdir;

    fn bootstrapped() -> (tempfile::TempDir, Pager, Indexes) {
        let dir = tempdir().unwrap();
        let mut pager = Pager::create(dir.path().join("s.db"), 512).unwrap();
        let mut indexes = Indexes::from_roots(IndexRoots::default());
        let mut tracker = FreePageTracker::new();
        bootstrap(&mut pager, &mut indexes, &mut tracker).unwrap();
        (dir, pager, indexes)
    }

    #[test]
    fn cache_self_bootstraps_from_eav() {
        let (_dir, pager, indexes) = bootstrapped();

        let cache = SchemaCache::load(&pager, &indexes.eav).unwrap();

        assert_eq!(cache.attr_count(), 8);
        assert_eq!(cache.resolve_ident(KW_IDENT), Some(ATTR_IDENT));
        assert_eq!(cache.resolve_ident(KW_CARDINALITY), Some(ATTR_CARDINALITY));
        assert_eq!(cache.resolve_ident(KW_TX_INSTANT), Some(super::super::ATTR_TX_INSTANT));
        assert_eq!(cache.resolve_ident(":no/such"), None);
    }

    #[test]
    fn ident_attribute_is_unique_identity_and_indexed() {
        let (_dir, pager, indexes) = bootstrapped();
        let cache = SchemaCache::load(&pager, &indexes.eav).unwrap();

        let ident = cache.attr(ATTR_IDENT).unwrap();
        assert_eq!(ident.value_type, ValueTag::Keyword);
        assert_eq!(ident.unique, Uniqueness::Identity);
        assert!(ident.indexed);
        assert!(ident.needs_ave());
        assert!(!ident.is_ref());
    }

    #[test]
    fn validate_type_checks_declared_tags() {
        let (_dir, pager, indexes) = bootstrapped();
        let cache = SchemaCache::load(&pager, &indexes.eav).unwrap();

        assert!(cache.validate_type(ATTR_IDENT, &Value::keyword(":x/y")));
        assert!(!cache.validate_type(ATTR_IDENT, &Value::string("not a keyword")));
        assert!(!cache.validate_type(ATTR_IDENT, &Value::Nil));
        assert!(!cache.validate_type(9999, &Value::Int(1)));
    }

    #[test]
    fn tx_instant_expects_instants() {
        let (_dir, pager, indexes) = bootstrapped();
        let cache = SchemaCache::load(&pager, &indexes.eav).unwrap();

        assert!(cache.validate_type(super::super::ATTR_TX_INSTANT, &Value::Instant(0)));
        assert!(!cache.validate_type(super::super::ATTR_TX_INSTANT, &Value::Int(0)));
    }

    #[test]
    fn empty_tree_yields_an_empty_cache() {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("e.db"), 512).unwrap();
        let indexes = Indexes::from_roots(IndexRoots::default());

        let cache = SchemaCache::load(&pager, &indexes.eav).unwrap();

        assert_eq!(cache.attr_count(), 0);
        assert_eq!(cache.resolve_ident(KW_IDENT), None);
    }
}
