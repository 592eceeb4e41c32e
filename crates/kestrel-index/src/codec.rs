//! Row record format.
//!
//! Record layout on disk:
//! - column_count: 2 bytes
//! - per column: type tag (1 byte) + payload
//! - node_count: 1 byte
//! - per node record (25 bytes): left u64, right u64, parent u64, balance i8
//!
//! The encoding is internal and stable within a process run; cross-version
//! file compatibility is not a goal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{
    IndexId, KestrelError, Result, Row, RowPos, TableId, Value, NODE_RECORD_SIZE,
};

/// Maximum columns in one row record.
pub const MAX_COLUMNS: usize = u16::MAX as usize;
/// Maximum indexes (node slots) per table.
pub const MAX_INDEXES: usize = u8::MAX as usize;

/// Encodes rows to their on-disk record form and back.
///
/// Stateless; the row's own position and table id are supplied by the
/// caller at decode time (positions are the file addresses themselves and
/// are never stored inside the record).
#[derive(Debug, Clone, Copy, Default)]
pub struct RowCodec;

impl RowCodec {
    pub fn new() -> Self {
        Self
    }

    /// Size of the encoded record for the given tuple and index count.
    ///
    /// Value wire sizes coincide with [`Value::storage_size`], so this is
    /// also what the cache accounts per value.
    pub fn encoded_size(data: &[Value], index_count: usize) -> usize {
        let values: usize = data.iter().map(Value::storage_size).sum();
        2 + values + 1 + index_count * NODE_RECORD_SIZE
    }

    /// Serializes a row, including the current state of its node links.
    pub fn encode(&self, row: &Row) -> Result<Bytes> {
        if row.data().len() > MAX_COLUMNS {
            return Err(KestrelError::Codec(format!(
                "too many columns: {}",
                row.data().len()
            )));
        }
        if row.node_count() > MAX_INDEXES {
            return Err(KestrelError::Codec(format!(
                "too many index slots: {}",
                row.node_count()
            )));
        }

        let mut buf = BytesMut::with_capacity(Self::encoded_size(row.data(), row.node_count()));

        buf.put_u16_le(row.data().len() as u16);
        for value in row.data() {
            encode_value(&mut buf, value);
        }

        buf.put_u8(row.node_count() as u8);
        for slot in 0..row.node_count() {
            // Slot presence is guaranteed by the loop bound.
            let links = row.node(IndexId(slot)).ok_or_else(|| {
                KestrelError::Codec(format!("missing node slot {}", slot))
            })?;
            buf.put_u64_le(links.left().0);
            buf.put_u64_le(links.right().0);
            buf.put_u64_le(links.parent().0);
            buf.put_i8(links.balance());
        }

        Ok(buf.freeze())
    }

    /// Deserializes a row record read from `pos`.
    pub fn decode(&self, table: TableId, pos: RowPos, mut data: &[u8]) -> Result<Row> {
        if data.remaining() < 2 {
            return Err(KestrelError::Codec("record too short".to_string()));
        }
        let column_count = data.get_u16_le() as usize;

        let mut values = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            values.push(decode_value(&mut data)?);
        }

        if data.remaining() < 1 {
            return Err(KestrelError::Codec("missing node count".to_string()));
        }
        let node_count = data.get_u8() as usize;
        if data.remaining() < node_count * NODE_RECORD_SIZE {
            return Err(KestrelError::Codec("truncated node records".to_string()));
        }

        let row = Row::new(table, pos, values, node_count);
        for slot in 0..node_count {
            let links = row
                .node(IndexId(slot))
                .ok_or_else(|| KestrelError::Codec(format!("missing node slot {}", slot)))?;
            links.set_left(RowPos(data.get_u64_le()));
            links.set_right(RowPos(data.get_u64_le()));
            links.set_parent(RowPos(data.get_u64_le()));
            links.set_balance(data.get_i8());
        }

        Ok(row)
    }
}

fn encode_value(buf: &mut BytesMut, value: &Value) {
    buf.put_u8(value.type_tag());
    match value {
        Value::Null => {}
        Value::Boolean(v) => buf.put_u8(*v as u8),
        Value::Integer(v) => buf.put_i64_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::Text(s) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
    }
}

fn decode_value(data: &mut &[u8]) -> Result<Value> {
    if data.remaining() < 1 {
        return Err(KestrelError::Codec("truncated value tag".to_string()));
    }
    let tag = data.get_u8();
    let value = match tag {
        0 => Value::Null,
        1 => {
            check_remaining(data, 1)?;
            Value::Boolean(data.get_u8() != 0)
        }
        2 => {
            check_remaining(data, 8)?;
            Value::Integer(data.get_i64_le())
        }
        3 => {
            check_remaining(data, 8)?;
            Value::Double(data.get_f64_le())
        }
        4 => {
            let len = decode_len(data)?;
            let bytes = data.copy_to_bytes(len);
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|e| KestrelError::Codec(format!("invalid utf-8 text: {}", e)))?;
            Value::Text(text)
        }
        5 => {
            let len = decode_len(data)?;
            Value::Binary(data.copy_to_bytes(len).to_vec())
        }
        _ => return Err(KestrelError::Codec(format!("invalid value tag: {}", tag))),
    };
    Ok(value)
}

fn decode_len(data: &mut &[u8]) -> Result<usize> {
    check_remaining(data, 4)?;
    let len = data.get_u32_le() as usize;
    check_remaining(data, len)?;
    Ok(len)
}

fn check_remaining(data: &&[u8], needed: usize) -> Result<()> {
    if data.remaining() < needed {
        return Err(KestrelError::Codec("truncated record".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        Row::new(
            TableId(3),
            RowPos(128),
            vec![
                Value::Integer(-42),
                Value::Text("kestrel".to_string()),
                Value::Null,
                Value::Double(2.5),
                Value::Boolean(true),
                Value::Binary(vec![0xde, 0xad]),
            ],
            2,
        )
    }

    #[test]
    fn test_codec_roundtrip_values() {
        let codec = RowCodec::new();
        let row = sample_row();

        let bytes = codec.encode(&row).unwrap();
        assert_eq!(bytes.len(), RowCodec::encoded_size(row.data(), 2));

        let decoded = codec.decode(TableId(3), RowPos(128), &bytes).unwrap();
        assert_eq!(decoded.data(), row.data());
        assert_eq!(decoded.pos(), RowPos(128));
        assert_eq!(decoded.node_count(), 2);
    }

    #[test]
    fn test_codec_roundtrip_node_links() {
        let codec = RowCodec::new();
        let row = sample_row();
        let links = row.node(IndexId(1)).unwrap();
        links.set_left(RowPos(7));
        links.set_right(RowPos::NO_POS);
        links.set_parent(RowPos(99));
        links.set_balance(-1);

        let bytes = codec.encode(&row).unwrap();
        let decoded = codec.decode(TableId(3), RowPos(128), &bytes).unwrap();

        let out = decoded.node(IndexId(1)).unwrap();
        assert_eq!(out.left(), RowPos(7));
        assert!(!out.right().is_valid());
        assert_eq!(out.parent(), RowPos(99));
        assert_eq!(out.balance(), -1);
        // Slot 0 stays detached.
        assert!(decoded.node(IndexId(0)).unwrap().is_detached());
    }

    #[test]
    fn test_codec_rejects_truncated_record() {
        let codec = RowCodec::new();
        let bytes = codec.encode(&sample_row()).unwrap();

        for cut in [0, 1, 5, bytes.len() - 1] {
            let err = codec
                .decode(TableId(3), RowPos(128), &bytes[..cut])
                .unwrap_err();
            assert!(matches!(err, KestrelError::Codec(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_codec_rejects_bad_tag() {
        let codec = RowCodec::new();
        // column_count = 1, then an unknown tag.
        let raw = [1u8, 0, 200];
        let err = codec.decode(TableId(1), RowPos(0), &raw).unwrap_err();
        assert!(matches!(err, KestrelError::Codec(_)));
    }

    #[test]
    fn test_codec_empty_row() {
        let codec = RowCodec::new();
        let row = Row::new(TableId(1), RowPos(0), vec![], 0);

        let bytes = codec.encode(&row).unwrap();
        assert_eq!(bytes.len(), 3);

        let decoded = codec.decode(TableId(1), RowPos(0), &bytes).unwrap();
        assert!(decoded.data().is_empty());
        assert_eq!(decoded.node_count(), 0);
    }
}
