// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog and shadow row model.
//!
//! Local writes are captured by triggers into the oplog table with a `NULL`
//! timestamp. A snapshot stamps them; from then on they are
//! [`OplogEntry`]s with a timestamp, ready to be merged against incoming
//! changes or shipped to the server.
//!
//! ```text
//! trigger ──► oplog row (timestamp NULL)
//!               │ snapshot
//!               ▼
//!             oplog row (timestamp T, clearTags)
//!               │                    │
//!     local_operations_to_table_changes   to_transactions
//!               ▼                    ▼
//!            merge               outbound queue
//! ```
//!
//! The shadow table holds, per row, the set of tags that currently "keep it
//! alive". A row with no shadow entry is deleted for causality purposes.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, SyncError};
use crate::types::{
    DataChange, DataChangeType, DataTransaction, Lsn, QualifiedTablename, Record,
    RelationsCache, SqlValue, Tag, Transaction,
};

/// Default value of `clearTags` and of an empty shadow tag set.
pub const SHADOW_TAGS_DEFAULT: &str = "[]";

/// Operation recorded in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Gone,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Gone => "GONE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "GONE" => Ok(Self::Gone),
            other => Err(SyncError::internal(format!("unexpected opType string: {other}"))),
        }
    }
}

impl From<DataChangeType> for OpType {
    fn from(t: DataChangeType) -> Self {
        match t {
            DataChangeType::Insert => Self::Insert,
            DataChangeType::Update => Self::Update,
            DataChangeType::Delete => Self::Delete,
            DataChangeType::Gone => Self::Gone,
        }
    }
}

/// Operation after grouping several oplog entries for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangesOpType {
    Delete,
    Upsert,
    Gone,
}

/// One row of the oplog table.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub namespace: String,
    pub tablename: String,
    /// JSON object of primary key columns.
    pub primary_key: String,
    pub rowid: i64,
    pub optype: OpType,
    /// RFC 3339 timestamp, `None` until a snapshot stamps the row.
    pub timestamp: Option<String>,
    pub new_row: Option<String>,
    pub old_row: Option<String>,
    /// JSON array of tags.
    pub clear_tags: String,
}

impl OplogEntry {
    /// Build from a row returned by `SELECT * FROM oplog`.
    pub fn from_row(row: &Record) -> Result<Self> {
        let text = |col: &str| -> Result<String> {
            match row.get(col) {
                Some(SqlValue::Text(s)) => Ok(s.clone()),
                other => Err(SyncError::internal(format!(
                    "oplog column {col} has unexpected value {other:?}"
                ))),
            }
        };
        let opt_text = |col: &str| -> Option<String> {
            match row.get(col) {
                Some(SqlValue::Text(s)) => Some(s.clone()),
                _ => None,
            }
        };
        let rowid = match row.get("rowid") {
            Some(SqlValue::Integer(i)) => *i,
            other => {
                return Err(SyncError::internal(format!(
                    "oplog rowid has unexpected value {other:?}"
                )))
            }
        };

        Ok(Self {
            namespace: text("namespace")?,
            tablename: text("tablename")?,
            primary_key: text("primaryKey")?,
            rowid,
            optype: OpType::parse(&text("optype")?)?,
            timestamp: opt_text("timestamp"),
            new_row: opt_text("newRow"),
            old_row: opt_text("oldRow"),
            clear_tags: opt_text("clearTags").unwrap_or_else(|| SHADOW_TAGS_DEFAULT.to_string()),
        })
    }

    pub fn qualified_tablename(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    /// Timestamp in unix millis, or an error if the entry was never stamped.
    pub fn timestamp_millis(&self) -> Result<i64> {
        let ts = self
            .timestamp
            .as_deref()
            .ok_or_else(|| SyncError::internal(format!("oplog entry {} has no timestamp", self.rowid)))?;
        parse_timestamp_millis(ts)
    }
}

/// One row of the shadow table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub namespace: String,
    pub tablename: String,
    pub primary_key: String,
    /// JSON array of tags.
    pub tags: String,
}

impl ShadowEntry {
    /// Empty shadow entry for the row an oplog entry touches.
    pub fn for_entry(entry: &OplogEntry) -> Result<Self> {
        Ok(Self {
            namespace: entry.namespace.clone(),
            tablename: entry.tablename.clone(),
            primary_key: canonical_primary_key(&entry.primary_key)?,
            tags: SHADOW_TAGS_DEFAULT.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OplogColumnChange {
    pub value: SqlValue,
    /// Unix millis.
    pub timestamp: i64,
}

pub type OplogColumnChanges = BTreeMap<String, OplogColumnChange>;

/// Grouped local changes for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntryChanges {
    pub namespace: String,
    pub tablename: String,
    pub primary_key_cols: Record,
    pub optype: ChangesOpType,
    pub changes: OplogColumnChanges,
    /// Tag of the last write, `None` for a delete.
    pub tag: Option<Tag>,
    pub clear_tags: Vec<Tag>,
}

/// Grouped remote changes for one row, with the complete resulting row.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowEntryChanges {
    pub namespace: String,
    pub tablename: String,
    pub primary_key_cols: Record,
    pub optype: ChangesOpType,
    pub changes: OplogColumnChanges,
    pub full_row: Record,
    pub tags: Vec<Tag>,
}

/// `{qualified table: {primary key: (timestamp, changes)}}`
pub type OplogTableChanges = HashMap<String, HashMap<String, (String, OplogEntryChanges)>>;

/// `{qualified table: {primary key: changes}}`
pub type PendingChanges = HashMap<String, HashMap<String, ShadowEntryChanges>>;

// =============================================================================
// Tags and keys
// =============================================================================

pub fn generate_tag(origin: &str, timestamp_millis: i64) -> Tag {
    format!("{origin}@{timestamp_millis}")
}

pub fn encode_tags(tags: &[Tag]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| SHADOW_TAGS_DEFAULT.to_string())
}

pub fn decode_tags(tags: &str) -> Result<Vec<Tag>> {
    Ok(serde_json::from_str(tags)?)
}

/// Compact JSON rendering of a record with sorted keys.
pub fn record_to_json(record: &Record) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

/// Canonical primary key string: keys sorted, compact JSON.
pub fn primary_key_to_str(primary_key: &Record) -> String {
    record_to_json(primary_key)
}

/// Re-encode a JSON primary key in canonical form.
pub fn canonical_primary_key(json: &str) -> Result<String> {
    let record: Record = serde_json::from_str(json)?;
    Ok(primary_key_to_str(&record))
}

/// Format unix millis as an RFC 3339 UTC timestamp with milliseconds.
pub fn format_timestamp(millis: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp_millis(ts: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SyncError::internal(format!("invalid oplog timestamp {ts:?}: {e}")))
}

fn parse_row(json: Option<&str>) -> Result<Record> {
    match json {
        Some(s) if !s.is_empty() && s != "null" => Ok(serde_json::from_str(s)?),
        _ => Ok(Record::new()),
    }
}

fn diff_columns(old_row: &Record, new_row: &Record, timestamp: i64) -> OplogColumnChanges {
    new_row
        .iter()
        .filter(|(key, value)| old_row.get(*key).map_or(true, |old| !old.same_as(value)))
        .map(|(key, value)| {
            (
                key.clone(),
                OplogColumnChange {
                    value: value.clone(),
                    timestamp,
                },
            )
        })
        .collect()
}

fn union(a: &[Tag], b: &[Tag]) -> Vec<Tag> {
    let mut out = a.to_vec();
    for t in b {
        if !out.contains(t) {
            out.push(t.clone());
        }
    }
    out
}

// =============================================================================
// Entry → changes
// =============================================================================

/// Column-level view of a local entry. Only columns whose value changed are
/// included, each stamped with the entry's timestamp.
pub fn local_entry_to_changes(entry: &OplogEntry, tag: Tag) -> Result<OplogEntryChanges> {
    let timestamp = entry.timestamp_millis()?;
    let old_row = parse_row(entry.old_row.as_deref())?;
    let new_row = parse_row(entry.new_row.as_deref())?;
    let is_delete = entry.optype == OpType::Delete;

    Ok(OplogEntryChanges {
        namespace: entry.namespace.clone(),
        tablename: entry.tablename.clone(),
        primary_key_cols: serde_json::from_str(&entry.primary_key)?,
        optype: if is_delete {
            ChangesOpType::Delete
        } else {
            ChangesOpType::Upsert
        },
        changes: diff_columns(&old_row, &new_row, timestamp),
        tag: if is_delete { None } else { Some(tag) },
        clear_tags: decode_tags(&entry.clear_tags)?,
    })
}

/// Column-level view of a remote entry, keeping the full new row.
pub fn remote_entry_to_changes(entry: &OplogEntry) -> Result<ShadowEntryChanges> {
    let timestamp = entry.timestamp_millis()?;
    let old_row = parse_row(entry.old_row.as_deref())?;
    let new_row = parse_row(entry.new_row.as_deref())?;

    Ok(ShadowEntryChanges {
        namespace: entry.namespace.clone(),
        tablename: entry.tablename.clone(),
        primary_key_cols: serde_json::from_str(&entry.primary_key)?,
        optype: match entry.optype {
            OpType::Delete => ChangesOpType::Delete,
            OpType::Gone => ChangesOpType::Gone,
            OpType::Insert | OpType::Update => ChangesOpType::Upsert,
        },
        changes: diff_columns(&old_row, &new_row, timestamp),
        full_row: new_row,
        tags: decode_tags(&entry.clear_tags)?,
    })
}

/// Group local entries per table and primary key.
///
/// The latest entry's optype wins and its column values overwrite earlier
/// ones. `clearTags` are replaced when two entries share a timestamp (same
/// snapshot) and unioned otherwise.
pub fn local_operations_to_table_changes(
    operations: &[OplogEntry],
    gen_tag: impl Fn(i64) -> Tag,
) -> Result<OplogTableChanges> {
    let mut acc: OplogTableChanges = HashMap::new();

    for entry in operations {
        let ts = entry.timestamp.clone().unwrap_or_default();
        let tag = gen_tag(entry.timestamp_millis()?);
        let entry_changes = local_entry_to_changes(entry, tag.clone())?;

        let pk = primary_key_to_str(&entry_changes.primary_key_cols);
        let table = entry.qualified_tablename().to_string();
        let rows = acc.entry(table).or_default();

        match rows.get_mut(&pk) {
            None => {
                rows.insert(pk, (ts, entry_changes));
            }
            Some((existing_ts, existing)) => {
                existing.optype = entry_changes.optype;
                existing.changes.extend(entry_changes.changes);
                existing.tag = match entry_changes.optype {
                    ChangesOpType::Delete => None,
                    _ => Some(tag),
                };
                if *existing_ts == ts {
                    existing.clear_tags = entry_changes.clear_tags;
                } else {
                    existing.clear_tags = union(&entry_changes.clear_tags, &existing.clear_tags);
                }
            }
        }
    }

    Ok(acc)
}

/// Group remote entries per table and primary key. Later entries overwrite
/// optype, columns, full row values and tags.
pub fn remote_operations_to_table_changes(operations: &[OplogEntry]) -> Result<PendingChanges> {
    let mut acc: PendingChanges = HashMap::new();

    for entry in operations {
        let entry_changes = remote_entry_to_changes(entry)?;
        let pk = primary_key_to_str(&entry_changes.primary_key_cols);
        let rows = acc.entry(entry.qualified_tablename().to_string()).or_default();

        match rows.get_mut(&pk) {
            None => {
                rows.insert(pk, entry_changes);
            }
            Some(existing) => {
                existing.optype = entry_changes.optype;
                existing.changes.extend(entry_changes.changes);
                existing.full_row.extend(entry_changes.full_row);
                existing.tags = entry_changes.tags;
            }
        }
    }

    Ok(acc)
}

// =============================================================================
// Transactions ↔ oplog entries
// =============================================================================

/// Convert an incoming transaction's data changes into oplog-shaped entries.
///
/// Schema changes are skipped. The primary key is taken from the record,
/// or from the old record for deletes.
pub fn from_transaction(
    transaction: &Transaction,
    relations: &RelationsCache,
    namespace: &str,
) -> Result<Vec<OplogEntry>> {
    let timestamp = format_timestamp(transaction.commit_timestamp);

    transaction
        .changes
        .iter()
        .filter_map(|c| match c {
            crate::types::Change::Data(dc) => Some(dc),
            crate::types::Change::Schema(_) => None,
        })
        .map(|change| {
            let relation = relations.get(&change.relation.table).ok_or_else(|| {
                SyncError::protocol_violation(format!(
                    "missing relation for table {}",
                    change.relation.table
                ))
            })?;
            let values = change
                .record
                .as_ref()
                .or(change.old_record.as_ref())
                .ok_or_else(|| SyncError::protocol_violation("change carries no record"))?;

            let pk: Record = relation
                .primary_key_columns()
                .into_iter()
                .map(|col| {
                    (
                        col.to_string(),
                        values.get(col).cloned().unwrap_or(SqlValue::Null),
                    )
                })
                .collect();

            Ok(OplogEntry {
                namespace: namespace.to_string(),
                tablename: change.relation.table.clone(),
                primary_key: primary_key_to_str(&pk),
                rowid: -1,
                optype: change.change_type.into(),
                timestamp: Some(timestamp.clone()),
                new_row: change.record.as_ref().map(record_to_json),
                old_row: change.old_record.as_ref().map(record_to_json),
                clear_tags: encode_tags(&change.tags),
            })
        })
        .collect()
}

/// Group timestamped local entries into outgoing transactions.
///
/// Consecutive entries sharing a timestamp form one transaction whose LSN is
/// the row id of its last entry. Updates are sent as inserts carrying the
/// whole new row.
pub fn to_transactions(
    entries: &[OplogEntry],
    relations: &RelationsCache,
) -> Result<Vec<DataTransaction>> {
    let mut out: Vec<DataTransaction> = Vec::new();
    let mut current_ts: Option<i64> = None;

    for entry in entries {
        let ts = entry.timestamp_millis()?;
        if current_ts != Some(ts) {
            out.push(DataTransaction {
                commit_timestamp: ts,
                lsn: Lsn::from_rowid(entry.rowid),
                ..Default::default()
            });
            current_ts = Some(ts);
        }

        let relation = relations.get(&entry.tablename).ok_or_else(|| {
            SyncError::internal(format!("no relation known for table {}", entry.tablename))
        })?;

        let record = match entry.new_row.as_deref() {
            Some(s) if s != "null" => Some(serde_json::from_str(s)?),
            _ => None,
        };
        let old_record = match entry.old_row.as_deref() {
            Some(s) if s != "null" => Some(serde_json::from_str(s)?),
            _ => None,
        };

        let change = DataChange {
            relation: relation.clone(),
            change_type: if entry.optype == OpType::Delete {
                DataChangeType::Delete
            } else {
                DataChangeType::Insert
            },
            record,
            old_record,
            tags: decode_tags(&entry.clear_tags)?,
        };

        if let Some(tx) = out.last_mut() {
            tx.changes.push(change);
            tx.lsn = Lsn::from_rowid(entry.rowid);
        }
    }

    Ok(out)
}
