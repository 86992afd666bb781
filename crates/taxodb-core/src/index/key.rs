//! Order-preserving posting key encoding.
//!
//! Posting keys sort byte-wise in (class id, segment values, record id)
//! order so equality and range scans over one class's membership are plain
//! prefix scans on the postings tree.
//!
//! Key format: `[class_id:4 BE][seg_value…][0x00] … [record_id:8 BE]`, one
//! tagged segment per index property of the class.

use taxodb_proto::{RecordId, Value};

use crate::class::ClassId;

/// Upper bound padding for open-ended range scans.
const MAX_PAD: [u8; 64] = [0xFF; 64];

/// Build the key prefix selecting one class's postings.
pub fn class_prefix(class: ClassId) -> Vec<u8> {
    class.to_be_bytes().to_vec()
}

/// Encode a value in a sortable format, reusing the provided buffer.
///
/// The format preserves sort order under byte comparison:
/// - Integers: big-endian with sign bit flipped so negatives sort first
/// - Floats: IEEE 754 bits, negative values fully inverted
/// - Strings/bytes: raw bytes (lexicographic order)
/// Each encoding starts with a type tag so mixed-type segments group by
/// type rather than interleaving.
pub fn encode_value_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => {
            buf.push(0x00); // null sorts first
        }
        Value::Bool(b) => {
            buf.push(0x01);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::Int32(n) => {
            buf.push(0x02);
            let sortable = (*n as u32) ^ 0x8000_0000;
            buf.extend_from_slice(&sortable.to_be_bytes());
        }
        Value::Int64(n) => {
            buf.push(0x03);
            let sortable = (*n as u64) ^ 0x8000_0000_0000_0000;
            buf.extend_from_slice(&sortable.to_be_bytes());
        }
        Value::Float32(n) => {
            buf.push(0x04);
            let bits = n.to_bits();
            let sortable = if (bits & 0x8000_0000) != 0 {
                !bits
            } else {
                bits ^ 0x8000_0000
            };
            buf.extend_from_slice(&sortable.to_be_bytes());
        }
        Value::Float64(n) => {
            buf.push(0x05);
            let bits = n.to_bits();
            let sortable = if (bits & 0x8000_0000_0000_0000) != 0 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            buf.extend_from_slice(&sortable.to_be_bytes());
        }
        Value::String(s) => {
            buf.push(0x06);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Uuid(id) => {
            buf.push(0x07);
            buf.extend_from_slice(id);
        }
        Value::Timestamp(ts) => {
            buf.push(0x08);
            let sortable = (*ts as u64) ^ 0x8000_0000_0000_0000;
            buf.extend_from_slice(&sortable.to_be_bytes());
        }
        Value::Bytes(b) => {
            buf.push(0x09);
            buf.extend_from_slice(b);
        }
    }
}

/// Build the search prefix for specific segment values (excluding the
/// record id tail).
pub fn search_prefix(class: ClassId, segments: &[&Value]) -> Vec<u8> {
    let mut key = class_prefix(class);
    for value in segments {
        encode_value_into(value, &mut key);
        key.push(0x00);
    }
    key
}

/// Build the full posting key for a record's segment values.
pub fn posting_key(class: ClassId, segments: &[&Value], record: RecordId) -> Vec<u8> {
    let mut key = search_prefix(class, segments);
    key.extend_from_slice(&record.to_be_bytes());
    key
}

/// Lowest key under a prefix (the prefix itself).
pub fn range_min(prefix: &[u8]) -> Vec<u8> {
    prefix.to_vec()
}

/// A key greater than every key under the prefix.
pub fn range_max(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&MAX_PAD);
    key
}

/// Extract the record id from a posting key tail.
pub fn record_id_of(key: &[u8]) -> Option<RecordId> {
    if key.len() < 12 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    Some(RecordId::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_value_into(value, &mut buf);
        buf
    }

    #[test]
    fn test_int_sort_order() {
        let neg = encoded(&Value::Int32(-10));
        let zero = encoded(&Value::Int32(0));
        let pos = encoded(&Value::Int32(10));
        assert!(neg < zero);
        assert!(zero < pos);

        let neg64 = encoded(&Value::Int64(-1));
        let pos64 = encoded(&Value::Int64(1));
        assert!(neg64 < pos64);
    }

    #[test]
    fn test_float_sort_order() {
        let neg = encoded(&Value::Float64(-2.5));
        let zero = encoded(&Value::Float64(0.0));
        let pos = encoded(&Value::Float64(2.5));
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn test_timestamp_sort_order() {
        let early = encoded(&Value::Timestamp(-5));
        let late = encoded(&Value::Timestamp(100));
        assert!(early < late);
    }

    #[test]
    fn test_posting_key_layout() {
        let v = Value::Int32(7);
        let key = posting_key(3, &[&v], 0xABCD);
        assert_eq!(&key[..4], &3u32.to_be_bytes());
        assert_eq!(record_id_of(&key), Some(0xABCD));

        // Same segment values, different records: adjacent under one prefix.
        let other = posting_key(3, &[&v], 0xABCE);
        let prefix = search_prefix(3, &[&v]);
        assert!(key.starts_with(&prefix));
        assert!(other.starts_with(&prefix));
        assert!(key < other);
    }

    #[test]
    fn test_class_prefix_separates_classes() {
        let v = Value::Int32(7);
        let a = posting_key(1, &[&v], 5);
        let b = posting_key(2, &[&v], 5);
        assert!(a < b);
        assert!(!b.starts_with(&class_prefix(1)));
    }

    #[test]
    fn test_range_bounds_cover_prefix() {
        let v = Value::String("m".into());
        let prefix = search_prefix(9, &[&v]);
        let key = posting_key(9, &[&v], u64::MAX);
        assert!(range_min(&prefix) <= key);
        assert!(key < range_max(&prefix));
    }

    #[test]
    fn test_record_id_of_short_key() {
        assert_eq!(record_id_of(&[1, 2, 3]), None);
    }
}
