// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model shared by the oplog, the protocol client and the applier.
//!
//! # Values
//!
//! [`SqlValue`] is the column value carried everywhere: decoded from wire
//! rows, stored as JSON in the oplog, bound into SQLite statements. Its JSON
//! form is exact: non-finite floats and blobs use small tagged objects so a
//! value survives the oplog round trip unchanged.
//!
//! # LSN
//!
//! [`Lsn`] is an opaque byte string. The client only needs to persist it
//! (base64) and compare it numerically for "already sent" checks.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Result, SyncError};

/// Causality marker, formatted `origin@unix_millis`.
pub type Tag = String;

/// A row keyed by column name. Sorted so serialization is canonical.
pub type Record = BTreeMap<String, SqlValue>;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// JSON rendering used in the oplog and shape state.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::from(*i),
            Self::Real(f) if f.is_finite() => Value::from(*f),
            Self::Real(f) => {
                let repr = if f.is_nan() {
                    "NaN"
                } else if f.is_sign_positive() {
                    "Infinity"
                } else {
                    "-Infinity"
                };
                serde_json::json!({ "$real": repr })
            }
            Self::Text(s) => Value::String(s.clone()),
            Self::Blob(b) => serde_json::json!({ "$blob": hex::encode(b) }),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    /// Inverse of [`to_json`](Self::to_json). Unknown JSON structures are
    /// kept as their text rendering.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(repr)) = map.get("$real") {
                        match repr.as_str() {
                            "NaN" => return Self::Real(f64::NAN),
                            "Infinity" => return Self::Real(f64::INFINITY),
                            "-Infinity" => return Self::Real(f64::NEG_INFINITY),
                            _ => {}
                        }
                    }
                    if let Some(Value::String(h)) = map.get("$blob") {
                        if let Ok(bytes) = hex::decode(h) {
                            return Self::Blob(bytes);
                        }
                    }
                }
                Self::Text(Value::Object(map).to_string())
            }
            other @ Value::Array(_) => Self::Text(other.to_string()),
        }
    }

    /// Equality used for change detection. NaN equals NaN here so that an
    /// unchanged NaN column is not reported as modified.
    pub fn same_as(&self, other: &SqlValue) -> bool {
        match (self, other) {
            (Self::Real(a), Self::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self == other,
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(value))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Parse a JSON object into a [`Record`].
pub fn record_from_json_str(json: &str) -> Result<Record> {
    Ok(serde_json::from_str(json)?)
}

/// Table name qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTablename {
    pub namespace: String,
    pub tablename: String,
}

impl QualifiedTablename {
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }
}

impl fmt::Display for QualifiedTablename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.namespace, self.tablename)
    }
}

// =============================================================================
// LSN
// =============================================================================

/// Opaque replication position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn(pub Vec<u8>);

impl Lsn {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode an oplog row id as 8 big-endian bytes.
    pub fn from_rowid(rowid: i64) -> Self {
        Self(rowid.to_be_bytes().to_vec())
    }

    /// Numeric value, folding the bytes big-endian. Longer inputs wrap.
    pub fn as_number(&self) -> u128 {
        self.0
            .iter()
            .fold(0u128, |acc, b| acc.wrapping_shl(8) | u128::from(*b))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|e| SyncError::new(crate::error::ErrorCode::MalformedLsn, e.to_string()))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// =============================================================================
// Relations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub is_nullable: bool,
    /// 1-based position in the primary key, if part of it.
    pub primary_key: Option<u32>,
}

/// Schema descriptor for one table.
///
/// `id` is assigned per connection and must never be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub table_type: TableType,
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    /// Primary key column names in key order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        let mut pk: Vec<(u32, &str)> = self
            .columns
            .iter()
            .filter_map(|c| c.primary_key.map(|pos| (pos, c.name.as_str())))
            .collect();
        pk.sort_by_key(|(pos, _)| *pos);
        pk.into_iter().map(|(_, name)| name).collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn qualified(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.schema.clone(), self.table.clone())
    }
}

/// Relations keyed by table name.
pub type RelationsCache = HashMap<String, Relation>;

// =============================================================================
// Changes and transactions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataChangeType {
    Insert,
    Update,
    Delete,
    Gone,
}

impl DataChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Gone => "GONE",
        }
    }
}

/// One row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub relation: Relation,
    pub change_type: DataChangeType,
    pub record: Option<Record>,
    pub old_record: Option<Record>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationType {
    CreateTable,
    CreateIndex,
    AlterAddColumn,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationColumn {
    pub name: String,
    pub sqlite_type: String,
    pub pg_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub fk_cols: Vec<String>,
    pub pk_table: String,
    pub pk_cols: Vec<String>,
}

/// Table shape after a migration, used to (re)generate capture triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTable {
    pub name: String,
    pub columns: Vec<MigrationColumn>,
    pub fks: Vec<ForeignKey>,
    pub pks: Vec<String>,
}

/// One DDL statement delivered inside a migration transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub table: MigrationTable,
    pub migration_type: MigrationType,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Data(DataChange),
    Schema(SchemaChange),
}

impl Change {
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// An incoming transaction, possibly carrying a migration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transaction {
    /// Commit time, unix millis.
    pub commit_timestamp: i64,
    pub lsn: Lsn,
    pub changes: Vec<Change>,
    pub origin: Option<String>,
    pub migration_version: Option<String>,
    /// Server transaction id, used for acknowledgements.
    pub id: Option<u64>,
    pub additional_data_ref: Option<u64>,
}

/// A transaction with only data changes, the outbound direction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTransaction {
    pub commit_timestamp: i64,
    pub lsn: Lsn,
    pub changes: Vec<DataChange>,
    pub origin: Option<String>,
    pub id: Option<u64>,
}

/// Insert-only batch delivered out of band, keyed by a reference id.
#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalData {
    pub reference: u64,
    pub changes: Vec<DataChange>,
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Initial,
}

impl ChangeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Initial => "initial",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    pub table: QualifiedTablename,
    /// Local oplog row ids, when known.
    pub rowids: Vec<i64>,
    /// Number of row operations on this table.
    pub record_changes: usize,
}

/// Emitted after a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub db_name: String,
    pub changes: Vec<TableChange>,
    pub origin: ChangeOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_json_exact() {
        for value in [
            SqlValue::Null,
            SqlValue::Integer(i64::MAX),
            SqlValue::Integer(i64::MIN),
            SqlValue::Real(1.5),
            SqlValue::Real(f64::INFINITY),
            SqlValue::Real(f64::NEG_INFINITY),
            SqlValue::Text("hello".into()),
            SqlValue::Blob(vec![0, 255, 7]),
            SqlValue::Bool(true),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: SqlValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value, "{json}");
        }

        let nan: SqlValue = serde_json::from_str(r#"{"$real":"NaN"}"#).unwrap();
        assert!(nan.same_as(&SqlValue::Real(f64::NAN)));
    }

    #[test]
    fn test_record_serializes_sorted_and_compact() {
        let mut record = Record::new();
        record.insert("b".into(), SqlValue::Integer(2));
        record.insert("a".into(), SqlValue::Text("x".into()));
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"a":"x","b":2}"#);
    }

    #[test]
    fn test_nested_json_kept_as_text() {
        let v = SqlValue::from_json(serde_json::json!({"k": [1, 2]}));
        assert_eq!(v, SqlValue::Text(r#"{"k":[1,2]}"#.into()));
    }

    #[test]
    fn test_lsn_base64_roundtrip() {
        let lsn = Lsn::new(vec![1, 2, 3]);
        let encoded = lsn.to_base64();
        assert_eq!(encoded, "AQID");
        assert_eq!(Lsn::from_base64(&encoded).unwrap(), lsn);
    }

    #[test]
    fn test_lsn_from_base64_malformed() {
        let err = Lsn::from_base64("!!!").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::MalformedLsn);
    }

    #[test]
    fn test_lsn_rowid_numeric() {
        let lsn = Lsn::from_rowid(258);
        assert_eq!(lsn.as_bytes().len(), 8);
        assert_eq!(lsn.as_number(), 258);
        assert!(Lsn::from_rowid(3).as_number() < Lsn::from_rowid(300).as_number());
        assert_eq!(Lsn::default().as_number(), 0);
    }

    #[test]
    fn test_relation_primary_key_order() {
        let rel = Relation {
            id: 1,
            schema: "public".into(),
            table: "items".into(),
            table_type: TableType::Table,
            columns: vec![
                RelationColumn {
                    name: "value".into(),
                    type_name: "TEXT".into(),
                    is_nullable: true,
                    primary_key: None,
                },
                RelationColumn {
                    name: "b".into(),
                    type_name: "TEXT".into(),
                    is_nullable: false,
                    primary_key: Some(2),
                },
                RelationColumn {
                    name: "a".into(),
                    type_name: "TEXT".into(),
                    is_nullable: false,
                    primary_key: Some(1),
                },
            ],
        };
        assert_eq!(rel.primary_key_columns(), vec!["a", "b"]);
        assert_eq!(rel.column_names(), vec!["value", "b", "a"]);
    }

    #[test]
    fn test_qualified_tablename_display() {
        let t = QualifiedTablename::new("main", "items");
        assert_eq!(t.to_string(), r#""main"."items""#);
    }
}
