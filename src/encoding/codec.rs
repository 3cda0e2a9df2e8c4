//! # Bytewise-Sortable Value Codec
//!
//! Encodes a [`Value`] as one tag byte followed by a type-specific payload,
//! chosen so that comparing two encodings with [`compare_encoded`] reproduces
//! the semantic order of the values. Composite index keys concatenate
//! encodings and compare them segment by segment.
//!
//! ## Payload layouts
//!
//! ```text
//! Tag   Type      Payload
//! 0x00  nil       (none)
//! 0x01  bool      1 byte, 0x00 = false / 0x01 = true
//! 0x02  int       8 bytes big-endian, sign bit flipped
//! 0x03  float     8 bytes big-endian, order-mapped IEEE 754 bits
//! 0x04  string    u32 big-endian byte length, then UTF-8 bytes
//! 0x05  keyword   u32 big-endian byte length, then UTF-8 bytes
//! 0x06  ref       8 bytes big-endian entity id
//! 0x07  instant   8 bytes big-endian, sign bit flipped (microseconds)
//! 0x08  uuid      16 raw bytes
//! 0x09  bytes     u32 big-endian byte length, then raw bytes
//! ```
//!
//! ## Ordering tricks
//!
//! - Signed integers and instants flip the sign bit so two's complement
//!   order becomes unsigned byte order.
//! - Floats flip the sign bit when non-negative and invert every bit when
//!   negative, mapping IEEE 754 order onto unsigned byte order. `-0.0` is
//!   normalized to `+0.0` and every NaN to the single canonical quiet-NaN
//!   pattern, which sorts after `+∞`.
//! - Variable-length payloads carry a length prefix for parsing, but
//!   [`compare_encoded`] compares payload bytes only; including the prefix
//!   would order `"b"` before `"ab"` by length alone.
//!
//! ## Zero-copy
//!
//! [`decode`] borrows variable-length payloads from the input slice. When
//! the input is an mmap'd page, the returned `Value` is valid only for the
//! lifetime of the snapshot that produced the page.

use std::borrow::Cow;
use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::types::{Value, ValueTag};

const SIGN: u64 = 1 << 63;
const LEN_PREFIX: usize = 4;

/// Number of bytes [`encode`] will write for this value.
pub fn encoded_size(v: &Value<'_>) -> usize {
    1 + match v {
        Value::Nil => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) | Value::Ref(_) | Value::Instant(_) => 8,
        Value::Uuid(_) => 16,
        Value::String(s) => LEN_PREFIX + s.len(),
        Value::Keyword(s) => LEN_PREFIX + s.len(),
        Value::Bytes(b) => LEN_PREFIX + b.len(),
    }
}

/// Serializes `v` into a caller-provided region of at least
/// [`encoded_size`] bytes. Returns the number of bytes written.
pub fn encode(v: &Value<'_>, out: &mut [u8]) -> Result<usize> {
    let need = encoded_size(v);
    ensure!(
        out.len() >= need,
        "encode buffer too small: {} < {}",
        out.len(),
        need
    );

    out[0] = v.tag() as u8;
    match v {
        Value::Nil => {}
        Value::Bool(b) => out[1] = *b as u8,
        Value::Int(i) => out[1..9].copy_from_slice(&order_i64(*i).to_be_bytes()),
        Value::Float(f) => out[1..9].copy_from_slice(&order_f64(*f).to_be_bytes()),
        Value::Ref(e) => out[1..9].copy_from_slice(&e.to_be_bytes()),
        Value::Instant(t) => out[1..9].copy_from_slice(&order_i64(*t).to_be_bytes()),
        Value::Uuid(u) => out[1..17].copy_from_slice(u),
        Value::String(s) => encode_var(s.as_bytes(), &mut out[1..]),
        Value::Keyword(s) => encode_var(s.as_bytes(), &mut out[1..]),
        Value::Bytes(b) => encode_var(b, &mut out[1..]),
    }
    Ok(need)
}

/// Appends the encoding of `v` to `buf`; used by the composite key builders.
pub fn encode_into(v: &Value<'_>, buf: &mut Vec<u8>) -> usize {
    let need = encoded_size(v);
    let start = buf.len();
    buf.resize(start + need, 0);
    // the buffer was just sized to fit
    encode(v, &mut buf[start..]).expect("sized buffer");
    need
}

fn encode_var(payload: &[u8], out: &mut [u8]) {
    out[..LEN_PREFIX].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    out[LEN_PREFIX..LEN_PREFIX + payload.len()].copy_from_slice(payload);
}

/// Decodes one value from the front of `bytes`, borrowing variable-length
/// payloads. Returns the value and its encoded length.
pub fn decode(bytes: &[u8]) -> Result<(Value<'_>, usize)> {
    ensure!(!bytes.is_empty(), "cannot decode an empty value");

    let tag = ValueTag::from_byte(bytes[0])
        .ok_or_else(|| eyre::eyre!("invalid value tag 0x{:02x}", bytes[0]))?;
    let body = &bytes[1..];

    let (value, body_len) = match tag {
        ValueTag::Nil => (Value::Nil, 0),
        ValueTag::Bool => {
            ensure!(!body.is_empty(), "truncated bool value");
            (Value::Bool(body[0] != 0), 1)
        }
        ValueTag::Int => (Value::Int(unorder_i64(read_u64(body)?)), 8),
        ValueTag::Float => (Value::Float(unorder_f64(read_u64(body)?)), 8),
        ValueTag::Ref => (Value::Ref(read_u64(body)?), 8),
        ValueTag::Instant => (Value::Instant(unorder_i64(read_u64(body)?)), 8),
        ValueTag::Uuid => {
            ensure!(body.len() >= 16, "truncated uuid value");
            let mut u = [0u8; 16];
            u.copy_from_slice(&body[..16]);
            (Value::Uuid(u), 16)
        }
        ValueTag::String | ValueTag::Keyword => {
            let payload = read_var(body)?;
            let text = std::str::from_utf8(payload)
                .map_err(|e| eyre::eyre!("invalid UTF-8 in encoded text: {e}"))?;
            let v = if tag == ValueTag::String {
                Value::String(Cow::Borrowed(text))
            } else {
                Value::Keyword(Cow::Borrowed(text))
            };
            (v, LEN_PREFIX + payload.len())
        }
        ValueTag::Bytes => {
            let payload = read_var(body)?;
            (
                Value::Bytes(Cow::Borrowed(payload)),
                LEN_PREFIX + payload.len(),
            )
        }
    };

    Ok((value, 1 + body_len))
}

/// Length of the single encoded value at the front of `bytes`, without
/// materializing it. Required to parse concatenated composite keys.
pub fn encoded_len(bytes: &[u8]) -> Result<usize> {
    ensure!(!bytes.is_empty(), "cannot size an empty value");

    let tag = ValueTag::from_byte(bytes[0])
        .ok_or_else(|| eyre::eyre!("invalid value tag 0x{:02x}", bytes[0]))?;

    let body_len = match tag {
        ValueTag::Nil => 0,
        ValueTag::Bool => 1,
        ValueTag::Int | ValueTag::Float | ValueTag::Ref | ValueTag::Instant => 8,
        ValueTag::Uuid => 16,
        ValueTag::String | ValueTag::Keyword | ValueTag::Bytes => {
            LEN_PREFIX + read_var(&bytes[1..])?.len()
        }
    };

    let total = 1 + body_len;
    ensure!(
        bytes.len() >= total,
        "truncated value: need {} bytes, have {}",
        total,
        bytes.len()
    );
    Ok(total)
}

/// Compares the single encoded value at the front of each slice,
/// reproducing semantic value order.
///
/// An empty slice sorts before anything, which gives composite-key prefixes
/// their natural lower-bound behavior. Payload extents are clamped to the
/// slice, so a truncated value compares as a prefix of the full one.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    match a[0].cmp(&b[0]) {
        Ordering::Equal => {}
        other => return other,
    }

    match ValueTag::from_byte(a[0]) {
        Some(tag) if tag.is_variable_length() => payload_clamped(a).cmp(payload_clamped(b)),
        Some(tag) => {
            // fixed-width payloads are order-mapped; raw byte order is
            // value order, clamped so trailing composite-key bytes are
            // never compared
            let w = fixed_width(tag);
            let pa = &a[1..(1 + w).min(a.len())];
            let pb = &b[1..(1 + w).min(b.len())];
            pa.cmp(pb)
        }
        None => a[1..].cmp(&b[1..]),
    }
}

fn fixed_width(tag: ValueTag) -> usize {
    match tag {
        ValueTag::Nil => 0,
        ValueTag::Bool => 1,
        ValueTag::Int | ValueTag::Float | ValueTag::Ref | ValueTag::Instant => 8,
        ValueTag::Uuid => 16,
        ValueTag::String | ValueTag::Keyword | ValueTag::Bytes => 0,
    }
}

fn payload_clamped(encoded: &[u8]) -> &[u8] {
    let body = &encoded[1..];
    if body.len() < LEN_PREFIX {
        return &[];
    }
    let len = u32::from_be_bytes(body[..LEN_PREFIX].try_into().unwrap()) as usize;
    let end = LEN_PREFIX + len.min(body.len() - LEN_PREFIX);
    &body[LEN_PREFIX..end]
}

fn read_u64(body: &[u8]) -> Result<u64> {
    ensure!(body.len() >= 8, "truncated 8-byte value payload");
    Ok(u64::from_be_bytes(body[..8].try_into().unwrap()))
}

fn read_var(body: &[u8]) -> Result<&[u8]> {
    ensure!(body.len() >= LEN_PREFIX, "truncated length prefix");
    let len = u32::from_be_bytes(body[..LEN_PREFIX].try_into().unwrap()) as usize;
    if body.len() < LEN_PREFIX + len {
        bail!(
            "truncated variable payload: length {} exceeds remaining {}",
            len,
            body.len() - LEN_PREFIX
        );
    }
    Ok(&body[LEN_PREFIX..LEN_PREFIX + len])
}

fn order_i64(v: i64) -> u64 {
    (v as u64) ^ SIGN
}

fn unorder_i64(bits: u64) -> i64 {
    (bits ^ SIGN) as i64
}

fn order_f64(v: f64) -> u64 {
    // single canonical NaN and zero so encoding is deterministic and
    // compare_encoded agrees with cmp_sem
    let v = if v.is_nan() {
        f64::NAN
    } else if v == 0.0 {
        0.0
    } else {
        v
    };
    let bits = v.to_bits();
    if bits & SIGN == 0 {
        bits ^ SIGN
    } else {
        !bits
    }
}

fn unorder_f64(bits: u64) -> f64 {
    if bits & SIGN != 0 {
        f64::from_bits(bits ^ SIGN)
    } else {
        f64::from_bits(!bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OwnedValue;

    fn enc(v: &Value<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_into(v, &mut buf);
        buf
    }

    fn sample_values() -> Vec<OwnedValue> {
        vec![
            Value::Nil,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::Int(-1),
            Value::Int(0),
            Value::Int(1),
            Value::Int(i64::MAX),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(-1.0),
            Value::Float(0.0),
            Value::Float(1.0),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NAN),
            Value::string(""),
            Value::string("a"),
            Value::string("ab"),
            Value::string("b"),
            Value::keyword(":db/ident"),
            Value::Ref(7),
            Value::Instant(-1),
            Value::Instant(1_700_000_000_000_000),
            Value::Uuid([0xAB; 16]),
            Value::bytes(vec![0x00, 0xFF]),
        ]
    }

    #[test]
    fn every_value_round_trips() {
        for v in sample_values() {
            let bytes = enc(&v);
            let (decoded, len) = decode(&bytes).unwrap();

            assert_eq!(len, bytes.len(), "length mismatch for {v:?}");
            assert_eq!(decoded.cmp_sem(&v), Ordering::Equal, "round trip of {v:?}");
        }
    }

    #[test]
    fn compare_encoded_matches_semantic_order() {
        let values = sample_values();
        for a in &values {
            for b in &values {
                assert_eq!(
                    compare_encoded(&enc(a), &enc(b)),
                    a.cmp_sem(b),
                    "order mismatch for {a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn int_order_is_preserved_across_the_full_range() {
        let ints = [
            i64::MIN,
            i64::MIN + 1,
            -1_000_000,
            -1,
            0,
            1,
            42,
            1_000_000,
            i64::MAX - 1,
            i64::MAX,
        ];
        for w in ints.windows(2) {
            assert_eq!(
                compare_encoded(&enc(&Value::Int(w[0])), &enc(&Value::Int(w[1]))),
                Ordering::Less
            );
        }
    }

    #[test]
    fn float_order_chain() {
        let floats = [
            f64::NEG_INFINITY,
            -1e300,
            -1.0,
            -f64::MIN_POSITIVE,
            0.0,
            f64::MIN_POSITIVE,
            1.0,
            1e300,
            f64::INFINITY,
            f64::NAN,
        ];
        for w in floats.windows(2) {
            assert_eq!(
                compare_encoded(&enc(&Value::Float(w[0])), &enc(&Value::Float(w[1]))),
                Ordering::Less,
                "{} !< {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn negative_zero_encodes_as_positive_zero() {
        assert_eq!(enc(&Value::Float(-0.0)), enc(&Value::Float(0.0)));
    }

    #[test]
    fn nan_is_self_equal_and_round_trips() {
        let bytes = enc(&Value::Float(f64::NAN));

        assert_eq!(compare_encoded(&bytes, &bytes), Ordering::Equal);
        let (decoded, _) = decode(&bytes).unwrap();
        match decoded {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn length_prefix_does_not_leak_into_comparison() {
        // with the prefix in the compare key, "b" (len 1) would sort
        // before "ab" (len 2)
        assert_eq!(
            compare_encoded(&enc(&Value::string("ab")), &enc(&Value::string("b"))),
            Ordering::Less
        );
        assert_eq!(
            compare_encoded(&enc(&Value::string("a")), &enc(&Value::string("ab"))),
            Ordering::Less
        );
    }

    #[test]
    fn encoded_len_walks_concatenated_values() {
        let mut buf = Vec::new();
        let values = [Value::Int(3), Value::string("hello"), Value::Bool(true)];
        let mut lens = Vec::new();
        for v in &values {
            lens.push(encode_into(v, &mut buf));
        }

        let mut offset = 0;
        for len in lens {
            assert_eq!(encoded_len(&buf[offset..]).unwrap(), len);
            offset += len;
        }
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn decode_is_zero_copy_for_text() {
        let bytes = enc(&Value::string("zero-copy"));
        let (decoded, _) = decode(&bytes).unwrap();

        match decoded {
            Value::String(Cow::Borrowed(s)) => {
                let p = s.as_ptr() as usize;
                let lo = bytes.as_ptr() as usize;
                assert!(p >= lo && p < lo + bytes.len());
            }
            other => panic!("expected borrowed string, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let bytes = enc(&Value::string("hello"));

        assert!(decode(&bytes[..3]).is_err());
        assert!(encoded_len(&bytes[..3]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn empty_slice_sorts_first() {
        assert_eq!(compare_encoded(&[], &enc(&Value::Nil)), Ordering::Less);
        assert_eq!(compare_encoded(&[], &[]), Ordering::Equal);
    }
}
