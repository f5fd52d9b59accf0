// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Writing incoming data into the local database.
//!
//! Every apply runs as one SQLite transaction with capture triggers switched
//! off for the tables it touches, so remote writes never land in the oplog:
//!
//! ```text
//!   PRAGMA defer_foreign_keys = ON
//!   flag = 0 for touched tables
//!   ── shadow + row statements, DDL, trigger regeneration ──
//!   flag = 1 for touched tables
//!   meta writes (lsn, seen lists)
//! ```
//!
//! Transactions are merged against the local oplog first (see
//! [`merge_entries`](crate::merge::merge_entries)). Captures no snapshot has
//! stamped yet are stamped beforehand, under the same snapshot lock, so
//! every pending local write takes part in the merge. Subscription data,
//! additional data and gone batches bypass the merge: they carry the
//! server's view of rows the client either does not have or must drop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use crate::adapter::{DatabaseAdapter, Statement};
use crate::config::InternalTables;
use crate::error::{Result, SyncError};
use crate::merge::merge_entries;
use crate::meta::{MetaKey, MetaStore};
use crate::migrator::{Migration, Migrator};
use crate::notifier::Notifier;
use crate::oplog::{encode_tags, from_transaction, primary_key_to_str, ChangesOpType, OplogEntry, ShadowEntryChanges};
use crate::shapes::{InitialDataChange, SubscriptionData};
use crate::snapshot::Snapshotter;
use crate::triggers::{infer_relation, list_user_tables, set_triggers_flag, TriggerGenerator};
use crate::types::{
    AdditionalData, Change, ChangeOrigin, DataChange, Lsn, MigrationType, QualifiedTablename, Record,
    Relation, RelationsCache, SqlValue, TableChange, Transaction,
};

/// Everything needed to write incoming data locally.
pub(crate) struct Applier {
    pub(crate) adapter: Arc<dyn DatabaseAdapter>,
    pub(crate) migrator: Arc<dyn Migrator>,
    pub(crate) triggers: Arc<dyn TriggerGenerator>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) snapshotter: Arc<Snapshotter>,
    pub(crate) tables: InternalTables,
    pub(crate) relations: RwLock<RelationsCache>,
    pub(crate) max_sql_parameters: usize,
}

/// Per-table notification counts collected while building statements.
#[derive(Default)]
struct Touched {
    tables: BTreeSet<String>,
    counts: BTreeMap<String, usize>,
}

impl Touched {
    fn row(&mut self, table: &str) {
        self.tables.insert(table.to_string());
        *self.counts.entry(table.to_string()).or_default() += 1;
    }

    fn changes(&self, namespace: &str) -> Vec<TableChange> {
        self.counts
            .iter()
            .map(|(table, n)| TableChange {
                table: QualifiedTablename::new(namespace, table.clone()),
                rowids: Vec::new(),
                record_changes: *n,
            })
            .collect()
    }
}

impl Applier {
    // =========================================================================
    // Relations
    // =========================================================================

    pub(crate) fn relations(&self) -> RelationsCache {
        self.relations.read().clone()
    }

    /// Record a relation by table name. A table seen for the first time gets
    /// the next free id, a known table keeps its id.
    pub(crate) fn update_relation(&self, relation: Relation) {
        let mut relations = self.relations.write();
        let id = match relations.get(&relation.table) {
            Some(existing) => existing.id,
            None => relations.values().map(|r| r.id).max().unwrap_or(0) + 1,
        };
        relations.insert(
            relation.table.clone(),
            Relation {
                id,
                schema: self.tables.namespace.clone(),
                ..relation
            },
        );
    }

    /// Re-read the local schema of `tables`.
    pub(crate) async fn refresh_relations(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            let relation = infer_relation(self.adapter.as_ref(), &self.tables.namespace, table, 0).await?;
            if relation.columns.is_empty() {
                continue;
            }
            self.update_relation(relation);
        }
        Ok(())
    }

    /// Build the relation cache from every user table.
    pub(crate) async fn load_relations(&self) -> Result<usize> {
        let tables = list_user_tables(self.adapter.as_ref(), &self.tables).await?;
        self.relations.write().clear();
        self.refresh_relations(&tables).await?;
        Ok(tables.len())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Merge and apply one incoming transaction.
    ///
    /// A transaction that originated here acknowledges the local snapshot
    /// taken at its commit time, so those oplog entries are dropped first.
    ///
    /// Returns the local entries stamped on the way in; the caller notifies
    /// and pushes them like any other snapshot.
    #[instrument(skip_all, fields(lsn = %transaction.lsn, changes = transaction.changes.len()))]
    pub(crate) async fn apply_transaction(
        &self,
        client_id: &str,
        transaction: &Transaction,
    ) -> Result<Vec<OplogEntry>> {
        let started = Instant::now();
        let origin = transaction.origin.clone().unwrap_or_default();

        let snapshots = self.snapshotter.exclusive().await;
        if origin == client_id {
            let removed = self.snapshotter.garbage_collect(transaction.commit_timestamp).await?;
            debug!(removed, "dropped acknowledged oplog entries");
        }
        let stamped = if transaction.changes.iter().any(|c| matches!(c, Change::Data(_))) {
            self.snapshotter.perform_snapshot_held(&snapshots, client_id).await?.entries
        } else {
            Vec::new()
        };
        let local = self.snapshotter.get_entries(None).await?;

        let mut touched = Touched::default();
        let mut new_tables: BTreeSet<String> = BTreeSet::new();
        let mut ddl_tables: Vec<String> = Vec::new();
        let mut body: Vec<Statement> = Vec::new();
        let mut run: Vec<&DataChange> = Vec::new();

        for change in &transaction.changes {
            match change {
                Change::Data(dc) => run.push(dc),
                Change::Schema(schema) => {
                    if !run.is_empty() {
                        body.extend(self.data_statements(
                            client_id,
                            &origin,
                            &local,
                            transaction,
                            std::mem::take(&mut run),
                            &mut touched,
                        )?);
                    }
                    body.push(Statement::new(schema.sql.clone()));

                    let table = schema.table.name.clone();
                    if matches!(
                        schema.migration_type,
                        MigrationType::CreateTable | MigrationType::AlterAddColumn
                    ) {
                        body.extend(self.triggers.generate_triggers_for_table(&schema.table)?);
                        if schema.migration_type == MigrationType::CreateTable
                            && !touched.tables.contains(&table)
                        {
                            body.extend(set_triggers_flag(&self.tables, std::slice::from_ref(&table), false));
                            new_tables.insert(table.clone());
                        }
                        if !ddl_tables.contains(&table) {
                            ddl_tables.push(table);
                        }
                    }
                }
            }
        }
        if !run.is_empty() {
            body.extend(self.data_statements(client_id, &origin, &local, transaction, run, &mut touched)?);
        }

        let existing: Vec<String> = touched
            .tables
            .iter()
            .chain(ddl_tables.iter())
            .filter(|t| !new_tables.contains(*t))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let all: Vec<String> = existing.iter().chain(new_tables.iter()).cloned().collect();

        let mut stmts = vec![Statement::new("PRAGMA defer_foreign_keys = ON")];
        stmts.extend(set_triggers_flag(&self.tables, &existing, false));
        stmts.extend(body);
        stmts.extend(set_triggers_flag(&self.tables, &all, true));
        stmts.push(self.meta.lsn_statement(&transaction.lsn));
        stmts.push(self.meta.set_statement(MetaKey::SeenAdditionalData, ""));
        stmts.push(self.meta.set_statement(MetaKey::SeenGoneBatch, ""));

        match &transaction.migration_version {
            Some(version) => {
                let applied = self
                    .migrator
                    .apply_if_not_already(Migration::new(version.clone(), stmts))
                    .await?;
                if !applied {
                    return Ok(stamped);
                }
                info!(version = %version, tables = ?ddl_tables, "applied migration transaction");
            }
            None => {
                self.adapter.run_in_transaction(stmts).await?;
            }
        }

        self.meta.commit(MetaKey::Lsn, transaction.lsn.to_base64()).await;
        self.meta.commit(MetaKey::SeenAdditionalData, "").await;
        self.meta.commit(MetaKey::SeenGoneBatch, "").await;

        if !ddl_tables.is_empty() {
            self.refresh_relations(&ddl_tables).await?;
        }

        let changes = touched.changes(&self.tables.namespace);
        let rows: usize = changes.iter().map(|c| c.record_changes).sum();
        if !changes.is_empty() {
            self.notifier.actually_changed(changes, ChangeOrigin::Remote);
        }
        crate::metrics::record_transaction_applied(
            if origin == client_id { "own" } else { "remote" },
            rows,
            started.elapsed(),
        );
        Ok(stamped)
    }

    /// Statements for a run of data changes, merged with local history.
    fn data_statements(
        &self,
        client_id: &str,
        origin: &str,
        local: &[OplogEntry],
        transaction: &Transaction,
        run: Vec<&DataChange>,
        touched: &mut Touched,
    ) -> Result<Vec<Statement>> {
        let relations: RelationsCache = run
            .iter()
            .map(|c| (c.relation.table.clone(), c.relation.clone()))
            .collect();
        let partial = Transaction {
            commit_timestamp: transaction.commit_timestamp,
            lsn: transaction.lsn.clone(),
            changes: run.into_iter().cloned().map(Change::Data).collect(),
            origin: transaction.origin.clone(),
            ..Default::default()
        };
        let incoming = from_transaction(&partial, &relations, &self.tables.namespace)?;
        let merged = merge_entries(client_id, local, origin, &incoming)?;

        let mut rows: Vec<(&String, &ShadowEntryChanges)> =
            merged.values().flat_map(|table| table.iter()).collect();
        rows.sort_by(|a, b| (&a.1.tablename, a.0).cmp(&(&b.1.tablename, b.0)));

        let mut stmts = Vec::new();
        for (primary_key, row) in rows {
            touched.row(&row.tablename);
            match row.optype {
                ChangesOpType::Delete | ChangesOpType::Gone => {
                    stmts.push(self.delete_shadow_statement(&row.tablename, primary_key));
                    stmts.push(delete_row_statement(
                        &self.tables.namespace,
                        &row.tablename,
                        &row.primary_key_cols,
                    ));
                }
                ChangesOpType::Upsert => {
                    stmts.push(self.upsert_shadow_statement(&row.tablename, primary_key, &encode_tags(&row.tags)));
                    let mut full = row.full_row.clone();
                    full.extend(row.primary_key_cols.clone());
                    stmts.push(upsert_row_statement(
                        &self.tables.namespace,
                        &row.tablename,
                        &full,
                        &row.primary_key_cols,
                    ));
                }
            }
        }
        Ok(stmts)
    }

    fn upsert_shadow_statement(&self, table: &str, primary_key: &str, tags: &str) -> Statement {
        Statement::with_args(
            format!(
                "INSERT OR REPLACE INTO {} (namespace, tablename, primaryKey, tags) VALUES (?, ?, ?, ?)",
                self.tables.shadow_table()
            ),
            vec![
                SqlValue::Text(self.tables.namespace.clone()),
                SqlValue::Text(table.to_string()),
                SqlValue::Text(primary_key.to_string()),
                SqlValue::Text(tags.to_string()),
            ],
        )
    }

    fn delete_shadow_statement(&self, table: &str, primary_key: &str) -> Statement {
        Statement::with_args(
            format!(
                "DELETE FROM {} WHERE namespace = ? AND tablename = ? AND primaryKey = ?",
                self.tables.shadow_table()
            ),
            vec![
                SqlValue::Text(self.tables.namespace.clone()),
                SqlValue::Text(table.to_string()),
                SqlValue::Text(primary_key.to_string()),
            ],
        )
    }

    // =========================================================================
    // Subscription and additional data
    // =========================================================================

    /// Insert the rows of a delivered subscription.
    #[instrument(skip_all, fields(subscription_id = %data.subscription_id, rows = data.data.len()))]
    pub(crate) async fn apply_subscription_data(&self, data: &SubscriptionData) -> Result<()> {
        let current = self.meta.lsn().await?;
        let advance = !data.lsn.is_empty() && data.lsn.as_number() > current.as_number();

        let (mut stmts, touched) = self.initial_data_statements(&data.data)?;
        if advance {
            stmts.push(self.meta.lsn_statement(&data.lsn));
        }
        self.adapter.run_in_transaction(stmts).await?;
        if advance {
            self.meta.commit(MetaKey::Lsn, data.lsn.to_base64()).await;
        }

        for row in &data.data {
            if !self.relations.read().contains_key(&row.relation.table) {
                self.update_relation(row.relation.clone());
            }
        }

        let changes = touched.changes(&self.tables.namespace);
        if !changes.is_empty() {
            self.notifier.actually_changed(changes, ChangeOrigin::Initial);
        }
        crate::metrics::record_subscription_delivered(data.shape_req_to_uuid.len(), data.data.len());
        Ok(())
    }

    /// Insert rows the server sent as a follow-up to a local transaction.
    /// The reference is remembered until the next acknowledged transaction.
    #[instrument(skip_all, fields(reference = data.reference, rows = data.changes.len()))]
    pub(crate) async fn apply_additional_data(&self, data: &AdditionalData) -> Result<()> {
        let rows: Vec<InitialDataChange> = data
            .changes
            .iter()
            .filter_map(|c| {
                c.record.clone().map(|record| InitialDataChange {
                    relation: c.relation.clone(),
                    record,
                    tags: c.tags.clone(),
                })
            })
            .collect();

        let (mut stmts, touched) = self.initial_data_statements(&rows)?;
        let (seen, value) = self
            .meta
            .append_statement(MetaKey::SeenAdditionalData, &[data.reference])
            .await?;
        stmts.push(seen);
        self.adapter.run_in_transaction(stmts).await?;
        self.meta.commit(MetaKey::SeenAdditionalData, value).await;

        let changes = touched.changes(&self.tables.namespace);
        if !changes.is_empty() {
            self.notifier.actually_changed(changes, ChangeOrigin::Remote);
        }
        Ok(())
    }

    fn initial_data_statements(&self, rows: &[InitialDataChange]) -> Result<(Vec<Statement>, Touched)> {
        let mut by_table: BTreeMap<&str, (&Relation, Vec<&InitialDataChange>)> = BTreeMap::new();
        for row in rows {
            by_table
                .entry(row.relation.table.as_str())
                .or_insert_with(|| (&row.relation, Vec::new()))
                .1
                .push(row);
        }

        let mut touched = Touched::default();
        let mut body = Vec::new();
        let mut shadow_rows = Vec::new();
        let ns = &self.tables.namespace;

        for (table, (relation, rows)) in &by_table {
            let pk_cols = relation.primary_key_columns();
            if pk_cols.is_empty() {
                return Err(SyncError::protocol_violation(format!(
                    "relation for table {table} has no primary key"
                )));
            }
            let columns: Vec<String> = relation.column_names().into_iter().map(String::from).collect();
            let mut values = Vec::with_capacity(rows.len());

            for row in rows {
                touched.row(table);
                values.push(
                    columns
                        .iter()
                        .map(|c| row.record.get(c).cloned().unwrap_or(SqlValue::Null))
                        .collect::<Vec<_>>(),
                );
                let pk: Record = pk_cols
                    .iter()
                    .map(|c| (c.to_string(), row.record.get(*c).cloned().unwrap_or(SqlValue::Null)))
                    .collect();
                shadow_rows.push(vec![
                    SqlValue::Text(ns.clone()),
                    SqlValue::Text(table.to_string()),
                    SqlValue::Text(primary_key_to_str(&pk)),
                    SqlValue::Text(encode_tags(&row.tags)),
                ]);
            }

            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !pk_cols.contains(&c.as_str()))
                .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
                .collect();
            let conflict = if updates.is_empty() {
                " ON CONFLICT DO NOTHING".to_string()
            } else {
                format!(" ON CONFLICT DO UPDATE SET {}", updates.join(", "))
            };
            body.extend(batch_statements(
                &format!("INSERT INTO \"{ns}\".\"{table}\" ({}) VALUES ", quote_columns(&columns)),
                &placeholders(columns.len()),
                ", ",
                &conflict,
                values,
                self.max_sql_parameters,
            )?);
        }

        body.extend(batch_statements(
            &format!(
                "INSERT OR REPLACE INTO {} (namespace, tablename, primaryKey, tags) VALUES ",
                self.tables.shadow_table()
            ),
            &placeholders(4),
            ", ",
            "",
            shadow_rows,
            self.max_sql_parameters,
        )?);

        Ok((self.with_triggers_off(&touched.tables, body), touched))
    }

    // =========================================================================
    // Gone batches
    // =========================================================================

    /// Delete rows that left the client's shapes after an unsubscribe.
    #[instrument(skip_all, fields(lsn = %lsn, rows = changes.len()))]
    pub(crate) async fn apply_gone_batch(
        &self,
        lsn: &Lsn,
        subscription_ids: &[String],
        changes: &[DataChange],
    ) -> Result<()> {
        let ns = &self.tables.namespace;
        let mut touched = Touched::default();
        let mut shadow_keys = Vec::new();
        let mut by_table: BTreeMap<&str, (Vec<String>, Vec<Vec<SqlValue>>)> = BTreeMap::new();

        for change in changes {
            let relation = &change.relation;
            let pk_cols: Vec<String> = relation.primary_key_columns().into_iter().map(String::from).collect();
            let record = change
                .record
                .as_ref()
                .or(change.old_record.as_ref())
                .ok_or_else(|| SyncError::protocol_violation("gone change carries no record"))?;
            let pk: Record = pk_cols
                .iter()
                .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(SqlValue::Null)))
                .collect();

            touched.row(&relation.table);
            shadow_keys.push(vec![
                SqlValue::Text(ns.clone()),
                SqlValue::Text(relation.table.clone()),
                SqlValue::Text(primary_key_to_str(&pk)),
            ]);
            let entry = by_table
                .entry(relation.table.as_str())
                .or_insert_with(|| (pk_cols.clone(), Vec::new()));
            entry.1.push(pk.into_values().collect());
        }

        let mut body = batch_statements(
            &format!("DELETE FROM {} WHERE ", self.tables.shadow_table()),
            "(namespace = ? AND tablename = ? AND primaryKey = ?)",
            " OR ",
            "",
            shadow_keys,
            self.max_sql_parameters,
        )?;
        for (table, (pk_cols, keys)) in by_table {
            // Record keys iterate in column name order.
            let mut sorted = pk_cols.clone();
            sorted.sort();
            let clause = sorted
                .iter()
                .map(|c| format!("\"{c}\" = ?"))
                .collect::<Vec<_>>()
                .join(" AND ");
            body.extend(batch_statements(
                &format!("DELETE FROM \"{ns}\".\"{table}\" WHERE "),
                &format!("({clause})"),
                " OR ",
                "",
                keys,
                self.max_sql_parameters,
            )?);
        }

        let mut stmts = self.with_triggers_off(&touched.tables, body);
        stmts.push(self.meta.lsn_statement(lsn));
        let (seen, value) = self.meta.append_statement(MetaKey::SeenGoneBatch, subscription_ids).await?;
        stmts.push(seen);
        self.adapter.run_in_transaction(stmts).await?;

        self.meta.commit(MetaKey::Lsn, lsn.to_base64()).await;
        self.meta.commit(MetaKey::SeenGoneBatch, value).await;

        let changes = touched.changes(ns);
        if !changes.is_empty() {
            self.notifier.actually_changed(changes, ChangeOrigin::Remote);
        }
        Ok(())
    }

    // =========================================================================
    // Local clearing
    // =========================================================================

    /// Empty `tables` and their shadow rows without capturing the deletes,
    /// running `extra` in the same transaction.
    #[instrument(skip_all, fields(tables = tables.len()))]
    pub(crate) async fn clear_tables(&self, tables: &[String], extra: Vec<Statement>) -> Result<()> {
        let ns = &self.tables.namespace;
        let mut body = Vec::new();
        for table in tables {
            body.push(Statement::new(format!("DELETE FROM \"{ns}\".\"{table}\"")));
            body.push(Statement::with_args(
                format!(
                    "DELETE FROM {} WHERE namespace = ? AND tablename = ?",
                    self.tables.shadow_table()
                ),
                vec![SqlValue::Text(ns.clone()), SqlValue::Text(table.clone())],
            ));
        }
        let set: BTreeSet<String> = tables.iter().cloned().collect();
        let mut stmts = self.with_triggers_off(&set, body);
        stmts.extend(extra);
        self.adapter.run_in_transaction(stmts).await?;
        if !tables.is_empty() {
            self.notifier.potentially_changed();
        }
        Ok(())
    }

    fn with_triggers_off(&self, tables: &BTreeSet<String>, body: Vec<Statement>) -> Vec<Statement> {
        let tables: Vec<String> = tables.iter().cloned().collect();
        let mut stmts = vec![Statement::new("PRAGMA defer_foreign_keys = ON")];
        stmts.extend(set_triggers_flag(&self.tables, &tables, false));
        stmts.extend(body);
        stmts.extend(set_triggers_flag(&self.tables, &tables, true));
        stmts
    }
}

// =============================================================================
// SQL building
// =============================================================================

fn quote_columns(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    format!("({})", vec!["?"; n].join(", "))
}

/// Split `rows` into statements of the form `head item sep item ... tail`,
/// each binding at most `max_params` values.
pub(crate) fn batch_statements(
    head: &str,
    item: &str,
    sep: &str,
    tail: &str,
    rows: Vec<Vec<SqlValue>>,
    max_params: usize,
) -> Result<Vec<Statement>> {
    let Some(width) = rows.first().map(Vec::len) else {
        return Ok(Vec::new());
    };
    if width > max_params {
        return Err(SyncError::Config(format!(
            "a row binds {width} values but statements are limited to {max_params}"
        )));
    }
    let per_statement = (max_params / width.max(1)).max(1);

    Ok(rows
        .chunks(per_statement)
        .map(|chunk| {
            let sql = format!("{head}{}{tail}", vec![item; chunk.len()].join(sep));
            Statement::with_args(sql, chunk.iter().flatten().cloned().collect())
        })
        .collect())
}

fn upsert_row_statement(namespace: &str, table: &str, row: &Record, primary_key: &Record) -> Statement {
    let columns: Vec<String> = row.keys().cloned().collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !primary_key.contains_key(*c))
        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    Statement::with_args(
        format!(
            "INSERT INTO \"{namespace}\".\"{table}\" ({}) VALUES {} ON CONFLICT {conflict}",
            quote_columns(&columns),
            placeholders(columns.len())
        ),
        row.values().cloned().collect(),
    )
}

fn delete_row_statement(namespace: &str, table: &str, primary_key: &Record) -> Statement {
    let clause = primary_key
        .keys()
        .map(|c| format!("\"{c}\" = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    Statement::with_args(
        format!("DELETE FROM \"{namespace}\".\"{table}\" WHERE {clause}"),
        primary_key.values().cloned().collect(),
    )
}
