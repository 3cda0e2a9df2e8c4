//! # Index Key Codecs and Comparators
//!
//! Composite keys concatenate big-endian fixed fields with the
//! order-preserving value encoding:
//!
//! ```text
//! EAV:   [E:8][A:8][encoded V]
//! AVE:   [A:8][encoded V][E:8]
//! VAE:   [V(ref):8][A:8][E:8]
//! TxLog: [Tx:8][E:8][A:8][encoded V][Op:1]
//! ```
//!
//! Fixed fields compare correctly with plain byte order, but an encoded
//! value embeds a length prefix that must be skipped, so every index with
//! a value segment gets its own comparator built from
//! [`compare_encoded`]. VAE is pure fixed-width data and uses raw byte
//! comparison.
//!
//! Comparators accept component-aligned prefixes (e.g. `[E]` or `[E][A]`
//! for EAV); a shorter key that matches so far sorts first, which makes
//! prefix seeks land on the first full key of the group.

use eyre::{ensure, Result};

use crate::encoding::{compare_encoded, decode, encode_into, encoded_len};
use crate::types::{Datom, EntityId, Value};

use std::cmp::Ordering;

pub fn encode_eav(e: EntityId, a: EntityId, v: &Value<'_>) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + 24);
    key.extend_from_slice(&e.to_be_bytes());
    key.extend_from_slice(&a.to_be_bytes());
    encode_into(v, &mut key);
    key
}

pub fn encode_ave(a: EntityId, v: &Value<'_>, e: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + 24);
    key.extend_from_slice(&a.to_be_bytes());
    encode_into(v, &mut key);
    key.extend_from_slice(&e.to_be_bytes());
    key
}

pub fn encode_vae(v_ref: EntityId, a: EntityId, e: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&v_ref.to_be_bytes());
    key.extend_from_slice(&a.to_be_bytes());
    key.extend_from_slice(&e.to_be_bytes());
    key
}

pub fn encode_txlog(tx: u64, e: EntityId, a: EntityId, v: &Value<'_>, added: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(24 + 24 + 1);
    key.extend_from_slice(&tx.to_be_bytes());
    key.extend_from_slice(&e.to_be_bytes());
    key.extend_from_slice(&a.to_be_bytes());
    encode_into(v, &mut key);
    key.push(added as u8);
    key
}

pub fn eav_prefix_e(e: EntityId) -> Vec<u8> {
    e.to_be_bytes().to_vec()
}

pub fn eav_prefix_ea(e: EntityId, a: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&e.to_be_bytes());
    key.extend_from_slice(&a.to_be_bytes());
    key
}

pub fn ave_prefix_av(a: EntityId, v: &Value<'_>) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 24);
    key.extend_from_slice(&a.to_be_bytes());
    encode_into(v, &mut key);
    key
}

pub fn txlog_prefix_tx(tx: u64) -> Vec<u8> {
    tx.to_be_bytes().to_vec()
}

pub fn decode_eav<'k>(key: &'k [u8]) -> Result<(EntityId, EntityId, Value<'k>)> {
    ensure!(key.len() > 16, "EAV key too short: {} bytes", key.len());
    let e = u64::from_be_bytes(key[..8].try_into().unwrap());
    let a = u64::from_be_bytes(key[8..16].try_into().unwrap());
    let (v, _) = decode(&key[16..])?;
    Ok((e, a, v))
}

pub fn decode_ave<'k>(key: &'k [u8]) -> Result<(EntityId, Value<'k>, EntityId)> {
    ensure!(key.len() > 16, "AVE key too short: {} bytes", key.len());
    let a = u64::from_be_bytes(key[..8].try_into().unwrap());
    let (v, vlen) = decode(&key[8..])?;
    ensure!(
        key.len() == 8 + vlen + 8,
        "AVE key length {} does not match its value encoding",
        key.len()
    );
    let e = u64::from_be_bytes(key[8 + vlen..].try_into().unwrap());
    Ok((a, v, e))
}

pub fn decode_vae(key: &[u8]) -> Result<(EntityId, EntityId, EntityId)> {
    ensure!(key.len() == 24, "VAE key must be 24 bytes, got {}", key.len());
    let v = u64::from_be_bytes(key[..8].try_into().unwrap());
    let a = u64::from_be_bytes(key[8..16].try_into().unwrap());
    let e = u64::from_be_bytes(key[16..24].try_into().unwrap());
    Ok((v, a, e))
}

pub fn decode_txlog<'k>(key: &'k [u8]) -> Result<Datom<'k>> {
    ensure!(key.len() > 25, "TxLog key too short: {} bytes", key.len());
    let tx = u64::from_be_bytes(key[..8].try_into().unwrap());
    let e = u64::from_be_bytes(key[8..16].try_into().unwrap());
    let a = u64::from_be_bytes(key[16..24].try_into().unwrap());
    let (v, vlen) = decode(&key[24..])?;
    ensure!(
        key.len() == 24 + vlen + 1,
        "TxLog key length {} does not match its value encoding",
        key.len()
    );
    let added = key[24 + vlen] != 0;
    Ok(Datom { e, a, v, tx, added })
}

/// Compares a fixed-width head with prefix semantics: a shorter key that
/// matches so far sorts first. Returns `None` when the heads decide.
fn cmp_head(a: &[u8], b: &[u8], width: usize) -> Option<Ordering> {
    let ha = &a[..a.len().min(width)];
    let hb = &b[..b.len().min(width)];
    match ha.cmp(hb) {
        Ordering::Equal if a.len() > width || b.len() > width => None,
        ord => Some(ord),
    }
}

/// Compares the encoded-value segment, then hands back the tails. Falls
/// back to raw order for non-component-aligned input, which cannot occur
/// for keys built by this module.
fn cmp_value_then_tail(a: &[u8], b: &[u8]) -> Ordering {
    if a.is_empty() || b.is_empty() {
        return a.len().cmp(&b.len());
    }
    match compare_encoded(a, b) {
        Ordering::Equal => {}
        ord => return ord,
    }
    let la = encoded_len(a).unwrap_or(a.len());
    let lb = encoded_len(b).unwrap_or(b.len());
    a[la.min(a.len())..].cmp(&b[lb.min(b.len())..])
}

pub fn cmp_eav(a: &[u8], b: &[u8]) -> Ordering {
    match cmp_head(a, b, 16) {
        Some(ord) => ord,
        None => cmp_value_then_tail(&a[16..], &b[16..]),
    }
}

pub fn cmp_ave(a: &[u8], b: &[u8]) -> Ordering {
    match cmp_head(a, b, 8) {
        Some(ord) => ord,
        None => cmp_value_then_tail(&a[8..], &b[8..]),
    }
}

pub fn cmp_txlog(a: &[u8], b: &[u8]) -> Ordering {
    match cmp_head(a, b, 24) {
        Some(ord) => ord,
        None => cmp_value_then_tail(&a[24..], &b[24..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn eav_key_round_trips() {
        let key = encode_eav(100, 7, &Value::string("alice"));
        let (e, a, v) = decode_eav(&key).unwrap();

        assert_eq!(e, 100);
        assert_eq!(a, 7);
        assert_eq!(v, Value::string("alice"));
    }

    #[test]
    fn ave_key_round_trips_with_trailing_entity() {
        let key = encode_ave(7, &Value::string("a@b.com"), 100);
        let (a, v, e) = decode_ave(&key).unwrap();

        assert_eq!(a, 7);
        assert_eq!(v, Value::string("a@b.com"));
        assert_eq!(e, 100);
    }

    #[test]
    fn vae_key_round_trips() {
        let key = encode_vae(55, 7, 100);
        assert_eq!(decode_vae(&key).unwrap(), (55, 7, 100));
    }

    #[test]
    fn txlog_key_round_trips_both_polarities() {
        for added in [true, false] {
            let key = encode_txlog(3, 100, 7, &Value::Int(42), added);
            let d = decode_txlog(&key).unwrap();

            assert_eq!(d.tx, 3);
            assert_eq!(d.e, 100);
            assert_eq!(d.a, 7);
            assert_eq!(d.v, Value::Int(42));
            assert_eq!(d.added, added);
        }
    }

    #[test]
    fn eav_orders_by_entity_then_attribute_then_value() {
        let keys = [
            encode_eav(1, 1, &Value::Int(5)),
            encode_eav(1, 1, &Value::Int(9)),
            encode_eav(1, 2, &Value::Int(0)),
            encode_eav(2, 1, &Value::Int(0)),
        ];
        for pair in keys.windows(2) {
            assert_eq!(cmp_eav(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn ave_length_prefix_does_not_distort_order() {
        // same attribute; "ab" < "b" semantically even though "b" has the
        // smaller length prefix
        let short = encode_ave(1, &Value::string("b"), 10);
        let long = encode_ave(1, &Value::string("ab"), 10);

        assert_eq!(cmp_ave(&long, &short), Ordering::Less);
    }

    #[test]
    fn ave_breaks_value_ties_by_entity() {
        let a = encode_ave(1, &Value::string("same"), 10);
        let b = encode_ave(1, &Value::string("same"), 11);

        assert_eq!(cmp_ave(&a, &b), Ordering::Less);
        assert_eq!(cmp_ave(&b, &a), Ordering::Greater);
        assert_eq!(cmp_ave(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prefixes_sort_before_their_group() {
        let prefix = eav_prefix_ea(1, 1);
        let full = encode_eav(1, 1, &Value::Int(i64::MIN));

        assert_eq!(cmp_eav(&prefix, &full), Ordering::Less);
        assert_eq!(cmp_eav(&full, &prefix), Ordering::Greater);

        let e_prefix = eav_prefix_e(1);
        assert_eq!(cmp_eav(&e_prefix, &prefix), Ordering::Less);
        // prefix of a later entity still sorts after earlier full keys
        let later = eav_prefix_e(2);
        assert_eq!(cmp_eav(&full, &later), Ordering::Less);
    }

    #[test]
    fn txlog_orders_by_tx_first_and_retract_before_assert() {
        let early = encode_txlog(1, 9, 9, &Value::Int(9), true);
        let late = encode_txlog(2, 1, 1, &Value::Int(1), true);
        assert_eq!(cmp_txlog(&early, &late), Ordering::Less);

        let retract = encode_txlog(2, 1, 1, &Value::Int(1), false);
        let assert_ = encode_txlog(2, 1, 1, &Value::Int(1), true);
        assert_eq!(cmp_txlog(&retract, &assert_), Ordering::Less);
    }
}
