// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshots: turning captured local writes into timestamped oplog entries.
//!
//! Triggers append oplog rows with a `NULL` timestamp. A snapshot, in one
//! transaction:
//!
//! 1. stamps every unstamped row with the snapshot time (oldest first),
//! 2. gives every row seen for the first time an empty shadow row,
//! 3. prepends the snapshot tag to each row's `clearTags`, seeded from the
//!    row's current shadow tags,
//! 4. sets the shadow tags of every touched row to `[tag]`, unless the last
//!    operation on that row was a `DELETE`,
//! 5. removes the shadow row of rows whose last operation was a `DELETE`.
//!
//! ```text
//!   q1 UPDATE oplog SET timestamp = T WHERE timestamp IS NULL RETURNING *
//!    │ rows?
//!    ├─ none ──► COMMIT
//!    └─ some ──► q2 shadow seed ─► q3 clearTags ─► q4 shadow upsert ─► q5 shadow delete ─► COMMIT
//! ```
//!
//! Only one snapshot runs at a time; [`Snapshotter::perform_snapshot`] holds
//! an async mutex for the whole transaction. Callers coalesce triggers with
//! a [`Throttle`](crate::resilience::Throttle).
//!
//! The queries rely on SQLite's bare-column behaviour for aggregates: with
//! `HAVING rowid = max(rowid)` the bare columns come from the last row of
//! each group.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, instrument};

use crate::adapter::{DatabaseAdapter, Statement};
use crate::config::InternalTables;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::oplog::{encode_tags, format_timestamp, generate_tag, OplogEntry};
use crate::types::{ChangeOrigin, QualifiedTablename, SqlValue, TableChange};

/// Outcome of one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotResult {
    /// Snapshot time, unix millis.
    pub timestamp: i64,
    /// Entries stamped by this snapshot, in row id order.
    pub entries: Vec<OplogEntry>,
}

pub struct Snapshotter {
    adapter: Arc<dyn DatabaseAdapter>,
    tables: InternalTables,
    lock: Mutex<()>,
    last_timestamp: AtomicI64,
}

impl Snapshotter {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, tables: InternalTables) -> Self {
        Self {
            adapter,
            tables,
            lock: Mutex::new(()),
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Snapshot times strictly increase, so two snapshots never share a
    /// timestamp even within one millisecond.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn statements(&self, tag: &str, timestamp: &str) -> Vec<Statement> {
        let oplog = self.tables.oplog_table();
        let shadow = self.tables.shadow_table();
        let ts = || SqlValue::Text(timestamp.to_string());

        vec![
            // Rows seen for the first time start with no tags.
            Statement::with_args(
                format!(
                    "INSERT INTO {shadow} (namespace, tablename, primaryKey, tags) \
                     SELECT DISTINCT namespace, tablename, primaryKey, '[]' FROM {oplog} \
                     WHERE timestamp = ? \
                     ON CONFLICT DO NOTHING"
                ),
                vec![ts()],
            ),
            Statement::with_args(
                format!(
                    "UPDATE {oplog} \
                     SET clearTags = CASE WHEN shadow.tags = '[]' OR shadow.tags = '' \
                       THEN '[\"' || ? || '\"]' \
                       ELSE '[\"' || ? || '\",' || substring(shadow.tags, 2) END \
                     FROM {shadow} AS shadow \
                     WHERE {oplog}.namespace = shadow.namespace \
                       AND {oplog}.tablename = shadow.tablename \
                       AND {oplog}.primaryKey = shadow.primaryKey \
                       AND {oplog}.timestamp = ?"
                ),
                vec![SqlValue::Text(tag.into()), SqlValue::Text(tag.into()), ts()],
            ),
            Statement::with_args(
                format!(
                    "INSERT OR REPLACE INTO {shadow} (namespace, tablename, primaryKey, tags) \
                     SELECT namespace, tablename, primaryKey, ? FROM {oplog} \
                     WHERE timestamp = ? \
                     GROUP BY namespace, tablename, primaryKey \
                     HAVING rowid = max(rowid) AND optype != 'DELETE'"
                ),
                vec![SqlValue::Text(encode_tags(&[tag.to_string()])), ts()],
            ),
            Statement::with_args(
                format!(
                    "DELETE FROM {shadow} WHERE EXISTS (\
                       SELECT 1 FROM {oplog} AS op \
                       WHERE op.namespace = {shadow}.namespace \
                         AND op.tablename = {shadow}.tablename \
                         AND op.primaryKey = {shadow}.primaryKey \
                       GROUP BY op.namespace, op.tablename, op.primaryKey \
                       HAVING op.rowid = max(op.rowid) AND op.optype = 'DELETE' AND op.timestamp = ?)"
                ),
                vec![ts()],
            ),
        ]
    }

    /// Run one snapshot for the replica `origin`.
    pub async fn perform_snapshot(&self, origin: &str) -> Result<SnapshotResult> {
        let guard = self.lock.lock().await;
        self.perform_snapshot_held(&guard, origin).await
    }

    /// Run one snapshot while the caller already holds [`Self::exclusive`].
    #[instrument(skip_all)]
    pub async fn perform_snapshot_held(&self, _held: &MutexGuard<'_, ()>, origin: &str) -> Result<SnapshotResult> {
        let started = Instant::now();

        let millis = self.next_timestamp();
        let timestamp = format_timestamp(millis);
        let tag = generate_tag(origin, millis);
        let dependent = self.statements(&tag, &timestamp);

        let stamp = Statement::with_args(
            format!(
                "UPDATE {oplog} SET timestamp = ? WHERE rowid IN (\
                   SELECT rowid FROM {oplog} WHERE timestamp IS NULL ORDER BY rowid ASC) \
                 RETURNING *",
                oplog = self.tables.oplog_table()
            ),
            vec![SqlValue::Text(timestamp.clone())],
        );

        let rows = self
            .adapter
            .transaction_with_query(
                Vec::new(),
                stamp,
                Box::new(move |rows| {
                    if rows.is_empty() {
                        Ok(Vec::new())
                    } else {
                        Ok(dependent.clone())
                    }
                }),
            )
            .await
            .map_err(|e| {
                error!(error = %e, "error performing snapshot");
                crate::metrics::record_snapshot_failure();
                e
            })?;

        let mut entries = rows.iter().map(OplogEntry::from_row).collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.rowid);

        debug!(entries = entries.len(), timestamp = %timestamp, "snapshot done");
        crate::metrics::record_snapshot(entries.len(), started.elapsed());
        Ok(SnapshotResult {
            timestamp: millis,
            entries,
        })
    }

    /// Hold off snapshots while incoming changes are merged and applied.
    /// Pending captures can still be stamped with
    /// [`Self::perform_snapshot_held`].
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Wait for any in-flight snapshot to finish.
    pub async fn wait_idle(&self) {
        drop(self.lock.lock().await);
    }

    /// Stamped entries with a row id above `since` (all when `None`).
    pub async fn get_entries(&self, since: Option<i64>) -> Result<Vec<OplogEntry>> {
        let rows = self
            .adapter
            .query(Statement::with_args(
                format!(
                    "SELECT * FROM {} WHERE timestamp IS NOT NULL AND rowid > ? ORDER BY rowid ASC",
                    self.tables.oplog_table()
                ),
                vec![SqlValue::Integer(since.unwrap_or(-1))],
            ))
            .await?;
        rows.iter().map(OplogEntry::from_row).collect()
    }

    /// Statement deleting the entries of the snapshot taken at `timestamp`.
    pub fn garbage_collect_statement(&self, timestamp: i64) -> Statement {
        Statement::with_args(
            format!("DELETE FROM {} WHERE timestamp = ?", self.tables.oplog_table()),
            vec![SqlValue::Text(format_timestamp(timestamp))],
        )
    }

    /// Drop oplog entries confirmed by the server.
    pub async fn garbage_collect(&self, timestamp: i64) -> Result<u64> {
        let res = self.adapter.run(self.garbage_collect_statement(timestamp)).await?;
        crate::metrics::record_oplog_gc(res.rows_affected);
        Ok(res.rows_affected)
    }
}

/// Per-table change summary for a notifier.
pub fn table_changes(entries: &[OplogEntry]) -> Vec<TableChange> {
    let mut acc: BTreeMap<(String, String), TableChange> = BTreeMap::new();
    for entry in entries {
        let change = acc
            .entry((entry.namespace.clone(), entry.tablename.clone()))
            .or_insert_with(|| TableChange {
                table: QualifiedTablename::new(entry.namespace.clone(), entry.tablename.clone()),
                rowids: Vec::new(),
                record_changes: 0,
            });
        change.rowids.push(entry.rowid);
        change.record_changes += 1;
    }
    acc.into_values().collect()
}

/// Emit a local change notification for freshly stamped entries.
pub fn notify_local_changes(notifier: &dyn Notifier, entries: &[OplogEntry]) {
    if !entries.is_empty() {
        notifier.actually_changed(table_changes(entries), ChangeOrigin::Local);
    }
}
