//! Row payload encoding.
//!
//! A [`SatOpRow`] is a null bitmask plus one byte string per relation
//! column, in column declaration order. Bit `i` of the mask (`0x80 >> (i % 8)`
//! of byte `i / 8`) is set when column `i` is null; null columns carry an
//! empty value.
//!
//! How a non-null value becomes bytes is up to the [`ValueCodec`].
//! [`TextCodec`] is the default and matches what the server speaks.

use crate::error::{ErrorCode, Result, SyncError};
use crate::protocol::messages::SatOpRow;
use crate::types::{Record, Relation, SqlValue};

/// Storage class a column type name maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Text,
    Bool,
    Blob,
}

impl ColumnKind {
    pub fn from_type_name(type_name: &str) -> Result<Self> {
        let kind = match type_name.to_ascii_uppercase().as_str() {
            "INT" | "INT2" | "INT4" | "INT8" | "INTEGER" => Self::Integer,
            "FLOAT4" | "FLOAT8" | "REAL" => Self::Float,
            "TEXT" | "VARCHAR" | "CHAR" | "UUID" | "DATE" | "TIME" | "TIMESTAMP"
            | "TIMESTAMPTZ" | "JSON" | "JSONB" => Self::Text,
            "BOOL" | "BOOLEAN" => Self::Bool,
            // BLOB is the SQLite spelling seen on locally inferred relations.
            "BYTEA" | "BLOB" => Self::Blob,
            other => {
                return Err(SyncError::new(
                    ErrorCode::UnknownDataType,
                    format!("can't handle column type {other}"),
                ))
            }
        };
        Ok(kind)
    }
}

/// Encoder/decoder pair for non-null column values.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &SqlValue, kind: ColumnKind) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8], kind: ColumnKind) -> Result<SqlValue>;
}

/// Textual value codec.
///
/// Values captured by the triggers arrive in a few shapes (floats cast to
/// text, blobs hex-encoded, booleans as integers); `encode` normalizes them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

fn bad_value(value: &SqlValue, kind: ColumnKind) -> SyncError {
    SyncError::new(
        ErrorCode::UnknownDataType,
        format!("value {value:?} does not fit a {kind:?} column"),
    )
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        (if f > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        f.to_string()
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" | "Inf" => Some(f64::INFINITY),
        "-Infinity" | "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok().filter(|f| f.is_finite()),
    }
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| SyncError::protocol_violation(format!("column value is not UTF-8: {e}")))
}

impl ValueCodec for TextCodec {
    fn encode(&self, value: &SqlValue, kind: ColumnKind) -> Result<Vec<u8>> {
        let encoded = match (kind, value) {
            (ColumnKind::Integer, SqlValue::Integer(i)) => i.to_string().into_bytes(),
            (ColumnKind::Integer, SqlValue::Real(f)) if f.fract() == 0.0 && f.is_finite() => {
                (*f as i64).to_string().into_bytes()
            }
            (ColumnKind::Integer, SqlValue::Text(s)) if s.parse::<i64>().is_ok() => {
                s.clone().into_bytes()
            }
            (ColumnKind::Integer, SqlValue::Bool(b)) => i64::from(*b).to_string().into_bytes(),

            (ColumnKind::Float, SqlValue::Real(f)) => format_float(*f).into_bytes(),
            (ColumnKind::Float, SqlValue::Integer(i)) => format_float(*i as f64).into_bytes(),
            (ColumnKind::Float, SqlValue::Text(s)) => match parse_float(s) {
                Some(f) => format_float(f).into_bytes(),
                None => return Err(bad_value(value, kind)),
            },

            (ColumnKind::Bool, SqlValue::Bool(b)) => (if *b { b"t" } else { b"f" }).to_vec(),
            (ColumnKind::Bool, SqlValue::Integer(i)) => (if *i != 0 { b"t" } else { b"f" }).to_vec(),

            (ColumnKind::Blob, SqlValue::Blob(b)) => b.clone(),
            (ColumnKind::Blob, SqlValue::Text(h)) => {
                hex::decode(h).map_err(|_| bad_value(value, kind))?
            }

            (ColumnKind::Text, SqlValue::Text(s)) => s.clone().into_bytes(),
            (ColumnKind::Text, SqlValue::Integer(i)) => i.to_string().into_bytes(),
            (ColumnKind::Text, SqlValue::Real(f)) => format_float(*f).into_bytes(),
            (ColumnKind::Text, SqlValue::Bool(b)) => b.to_string().into_bytes(),

            _ => return Err(bad_value(value, kind)),
        };
        Ok(encoded)
    }

    fn decode(&self, bytes: &[u8], kind: ColumnKind) -> Result<SqlValue> {
        let value = match kind {
            ColumnKind::Integer => {
                let s = text(bytes)?;
                SqlValue::Integer(s.parse().map_err(|_| {
                    SyncError::protocol_violation(format!("invalid integer value {s:?}"))
                })?)
            }
            ColumnKind::Float => {
                let s = text(bytes)?;
                SqlValue::Real(parse_float(s).ok_or_else(|| {
                    SyncError::protocol_violation(format!("invalid float value {s:?}"))
                })?)
            }
            ColumnKind::Bool => match bytes {
                b"t" => SqlValue::Bool(true),
                b"f" => SqlValue::Bool(false),
                other => {
                    return Err(SyncError::protocol_violation(format!(
                        "invalid boolean value {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            ColumnKind::Text => SqlValue::Text(text(bytes)?.to_string()),
            ColumnKind::Blob => SqlValue::Blob(bytes.to_vec()),
        };
        Ok(value)
    }
}

// =============================================================================
// Null bitmask
// =============================================================================

pub fn encode_nulls(nulls: &[bool]) -> Vec<u8> {
    let mut mask = vec![0u8; nulls.len().div_ceil(8)];
    for (i, _) in nulls.iter().enumerate().filter(|(_, null)| **null) {
        mask[i / 8] |= 0x80 >> (i % 8);
    }
    mask
}

pub fn is_null(mask: &[u8], index: usize) -> bool {
    mask.get(index / 8)
        .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
}

// =============================================================================
// Rows
// =============================================================================

/// Encode `record` in the column order of `relation`. Missing columns are
/// sent as null.
pub fn serialize_row(record: &Record, relation: &Relation, codec: &dyn ValueCodec) -> Result<SatOpRow> {
    let mut nulls = Vec::with_capacity(relation.columns.len());
    let mut values = Vec::with_capacity(relation.columns.len());

    for column in &relation.columns {
        match record.get(&column.name) {
            None | Some(SqlValue::Null) => {
                nulls.push(true);
                values.push(Vec::new());
            }
            Some(value) => {
                let kind = ColumnKind::from_type_name(&column.type_name)?;
                nulls.push(false);
                values.push(codec.encode(value, kind)?);
            }
        }
    }

    Ok(SatOpRow {
        nulls_bitmask: encode_nulls(&nulls),
        values,
    })
}

/// Decode a row sent for `relation`.
pub fn deserialize_row(row: &SatOpRow, relation: &Relation, codec: &dyn ValueCodec) -> Result<Record> {
    if row.values.len() != relation.columns.len() {
        return Err(SyncError::protocol_violation(format!(
            "row for {} has {} values, relation has {} columns",
            relation.table,
            row.values.len(),
            relation.columns.len()
        )));
    }
    if row.nulls_bitmask.len() < relation.columns.len().div_ceil(8) {
        return Err(SyncError::protocol_violation("null bitmask shorter than the column list"));
    }

    relation
        .columns
        .iter()
        .zip(&row.values)
        .enumerate()
        .map(|(i, (column, bytes))| {
            let value = if is_null(&row.nulls_bitmask, i) {
                SqlValue::Null
            } else {
                codec.decode(bytes, ColumnKind::from_type_name(&column.type_name)?)?
            };
            Ok((column.name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{RelationColumn, TableType};

    pub(crate) fn relation() -> Relation {
        let col = |name: &str, ty: &str, pk: Option<u32>| RelationColumn {
            name: name.into(),
            type_name: ty.into(),
            is_nullable: pk.is_none(),
            primary_key: pk,
        };
        Relation {
            id: 1,
            schema: "public".into(),
            table: "items".into(),
            table_type: TableType::Table,
            columns: vec![
                col("id", "TEXT", Some(1)),
                col("count", "INT8", None),
                col("ratio", "FLOAT8", None),
                col("flag", "BOOL", None),
                col("data", "BYTEA", None),
                col("note", "VARCHAR", None),
            ],
        }
    }

    fn record(values: Vec<(&str, SqlValue)>) -> Record {
        values.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_roundtrip_edge_values() {
        let rel = relation();
        for ratio in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.1, -2.5e-300] {
            let rec = record(vec![
                ("id", "a".into()),
                ("count", SqlValue::Integer(i64::MAX)),
                ("ratio", SqlValue::Real(ratio)),
                ("flag", SqlValue::Bool(true)),
                ("data", SqlValue::Blob(vec![0, 1, 254])),
                ("note", SqlValue::Null),
            ]);
            let row = serialize_row(&rec, &rel, &TextCodec).unwrap();
            let back = deserialize_row(&row, &rel, &TextCodec).unwrap();
            for (k, v) in &rec {
                assert!(back[k].same_as(v), "{k}: {v:?} vs {:?}", back[k]);
            }
        }
    }

    #[test]
    fn test_null_bitmask_bit_order() {
        let rel = relation();
        let rec = record(vec![
            ("id", "a".into()),
            ("count", SqlValue::Null),
            ("ratio", SqlValue::Real(1.0)),
            ("flag", SqlValue::Null),
            ("data", SqlValue::Blob(vec![])),
        ]);
        let row = serialize_row(&rec, &rel, &TextCodec).unwrap();
        // count, flag and the missing note are null.
        assert_eq!(format!("{:08b}", row.nulls_bitmask[0]), "01010100");
        assert!(row.values[1].is_empty());
    }

    #[test]
    fn test_bitmask_spans_bytes() {
        let mut nulls = vec![false; 10];
        nulls[0] = true;
        nulls[9] = true;
        assert_eq!(encode_nulls(&nulls), vec![0b1000_0000, 0b0100_0000]);
        assert!(is_null(&[0, 0b0100_0000], 9));
        assert!(!is_null(&[], 3));
    }

    #[test]
    fn test_all_null_row_roundtrip() {
        let mut rel = relation();
        rel.columns = (0..8)
            .map(|i| RelationColumn {
                name: format!("c{i}"),
                type_name: "TEXT".into(),
                is_nullable: true,
                primary_key: None,
            })
            .collect();
        let rec: Record = (0..8).map(|i| (format!("c{i}"), SqlValue::Null)).collect();

        let row = serialize_row(&rec, &rel, &TextCodec).unwrap();
        assert_eq!(row.nulls_bitmask, vec![0xff]);
        assert!(row.values.iter().all(|v| v.is_empty()));

        let back = deserialize_row(&row, &rel, &TextCodec).unwrap();
        assert_eq!(back.len(), 8);
        assert!(back.values().all(|v| v.same_as(&SqlValue::Null)));
    }

    #[test]
    fn test_trigger_shaped_values_are_normalized() {
        let rel = relation();
        let rec = record(vec![
            ("id", "a".into()),
            ("ratio", SqlValue::Text("Inf".into())),
            ("flag", SqlValue::Integer(0)),
            ("data", SqlValue::Text("00ff".into())),
        ]);
        let row = serialize_row(&rec, &rel, &TextCodec).unwrap();
        assert_eq!(row.values[2], b"Infinity".to_vec());
        assert_eq!(row.values[3], b"f".to_vec());
        assert_eq!(row.values[4], vec![0x00, 0xff]);
    }

    #[test]
    fn test_unknown_column_type() {
        let mut rel = relation();
        rel.columns[5].type_name = "GEOMETRY".into();
        let rec = record(vec![("id", "a".into()), ("note", "x".into())]);
        let err = serialize_row(&rec, &rel, &TextCodec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownDataType);
    }

    #[test]
    fn test_value_count_mismatch() {
        let row = SatOpRow {
            nulls_bitmask: vec![0],
            values: vec![b"a".to_vec()],
        };
        let err = deserialize_row(&row, &relation(), &TextCodec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_invalid_integer_text() {
        let err = TextCodec.decode(b"12x", ColumnKind::Integer).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }
}
