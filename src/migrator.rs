//! Schema migrations.
//!
//! The [`SqliteMigrator`] owns the internal bookkeeping schema (oplog, meta,
//! shadow, trigger settings) as migration `"0"` and applies any migrations
//! supplied by the embedder after it. Migrations delivered over the
//! replication stream go through [`Migrator::apply_if_not_already`], so a
//! re-delivered migration is a no-op.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::adapter::{BoxFuture, DatabaseAdapter, Statement};
use crate::config::InternalTables;
use crate::error::{Result, SyncError};
use crate::types::SqlValue;

/// Version of the bundled internal schema migration.
pub const INTERNAL_SCHEMA_VERSION: &str = "0";

#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub version: String,
    pub statements: Vec<Statement>,
}

impl Migration {
    pub fn new(version: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            version: version.into(),
            statements,
        }
    }
}

pub trait Migrator: Send + Sync {
    /// Apply all bundled migrations that are not applied yet. Returns how
    /// many were applied.
    fn up(&self) -> BoxFuture<'_, usize>;

    /// Apply `migration` unless its version is already recorded. Returns
    /// whether it was applied.
    fn apply_if_not_already(&self, migration: Migration) -> BoxFuture<'_, bool>;

    /// Latest applied version, if any.
    fn query_schema_version(&self) -> BoxFuture<'_, Option<String>>;
}

/// Versions are digits and underscores only, so they sort and compare as
/// plain strings.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '_')
}

/// Statements creating the internal tables and meta defaults.
pub fn internal_schema(tables: &InternalTables) -> Vec<Statement> {
    let ns = &tables.namespace;
    let oplog = tables.oplog_table();
    let meta = tables.meta_table();
    let shadow = tables.shadow_table();
    let triggers = tables.triggers_table();

    vec![
        Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {oplog} (\
               rowid INTEGER PRIMARY KEY AUTOINCREMENT, \
               namespace TEXT NOT NULL, \
               tablename TEXT NOT NULL, \
               optype TEXT NOT NULL, \
               primaryKey TEXT NOT NULL, \
               newRow TEXT, \
               oldRow TEXT, \
               timestamp TEXT, \
               clearTags TEXT DEFAULT '[]' NOT NULL)"
        )),
        Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {meta} (key TEXT PRIMARY KEY, value BLOB)"
        )),
        Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {shadow} (\
               namespace TEXT NOT NULL, \
               tablename TEXT NOT NULL, \
               primaryKey TEXT NOT NULL, \
               tags TEXT NOT NULL, \
               PRIMARY KEY (namespace, tablename, primaryKey))"
        )),
        Statement::new(format!(
            "CREATE INDEX IF NOT EXISTS {ns}._electric_table_pk_reference ON {} (namespace, tablename, primaryKey)",
            tables.oplog
        )),
        Statement::new(format!(
            "CREATE INDEX IF NOT EXISTS {ns}._electric_timestamp ON {} (timestamp)",
            tables.oplog
        )),
        Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {triggers} (\
               namespace TEXT, tablename TEXT, flag INTEGER, \
               PRIMARY KEY (namespace, tablename))"
        )),
        Statement::new(format!(
            "INSERT OR IGNORE INTO {meta} (key, value) VALUES \
               ('compensations', 0), ('lsn', ''), ('clientId', ''), \
               ('subscriptions', ''), ('seenAdditionalData', ''), ('seenGoneBatch', '')"
        )),
    ]
}

/// Migrator over a [`DatabaseAdapter`].
pub struct SqliteMigrator {
    adapter: Arc<dyn DatabaseAdapter>,
    migrations: Vec<Migration>,
    table: String,
    table_name: String,
}

impl SqliteMigrator {
    /// Create a migrator running the internal schema followed by `migrations`.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, tables: &InternalTables, migrations: Vec<Migration>) -> Self {
        let mut all = vec![Migration::new(INTERNAL_SCHEMA_VERSION, internal_schema(tables))];
        all.extend(migrations);
        Self {
            adapter,
            migrations: all,
            table: tables.migrations_table(),
            table_name: tables.migrations.clone(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.adapter
            .run(Statement::new(format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                   id INTEGER PRIMARY KEY AUTOINCREMENT, \
                   version TEXT NOT NULL UNIQUE, \
                   applied_at TEXT NOT NULL)",
                self.table
            )))
            .await?;
        Ok(())
    }

    async fn query_applied(&self) -> Result<Vec<String>> {
        let exists = self
            .adapter
            .query(Statement::with_args(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![SqlValue::Text(self.table_name.clone())],
            ))
            .await?;
        if exists.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .adapter
            .query(Statement::new(format!("SELECT version FROM {} ORDER BY id ASC", self.table)))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| match r.get("version") {
                Some(SqlValue::Text(v)) => Some(v.clone()),
                _ => None,
            })
            .collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        if !is_valid_version(&migration.version) {
            return Err(SyncError::Config(format!(
                "Invalid migration version {:?}, must match ^[0-9_]+$",
                migration.version
            )));
        }

        let mut stmts = migration.statements.clone();
        stmts.push(Statement::with_args(
            format!("INSERT INTO {} (version, applied_at) VALUES (?, ?)", self.table),
            vec![
                SqlValue::Text(migration.version.clone()),
                SqlValue::Text(Utc::now().to_rfc3339()),
            ],
        ));
        self.adapter.run_in_transaction(stmts).await?;
        Ok(())
    }
}

impl Migrator for SqliteMigrator {
    fn up(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let existing = self.query_applied().await?;
            self.ensure_table().await?;

            for (i, version) in existing.iter().enumerate() {
                match self.migrations.get(i) {
                    Some(m) if &m.version == version => {}
                    _ => {
                        return Err(SyncError::Config(format!(
                            "Migrations cannot be altered once applied: expecting {version} at index {i}"
                        )))
                    }
                }
            }

            let unapplied = &self.migrations[existing.len().min(self.migrations.len())..];
            for migration in unapplied {
                info!(version = %migration.version, "applying migration");
                self.apply(migration).await?;
            }
            Ok(unapplied.len())
        })
    }

    fn apply_if_not_already(&self, migration: Migration) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.ensure_table().await?;
            let rows = self
                .adapter
                .query(Statement::with_args(
                    format!("SELECT 1 FROM {} WHERE version = ?", self.table),
                    vec![SqlValue::Text(migration.version.clone())],
                ))
                .await?;

            if !rows.is_empty() {
                info!(version = %migration.version, "migration already applied, skipping");
                return Ok(false);
            }
            self.apply(&migration).await?;
            Ok(true)
        })
    }

    fn query_schema_version(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            let applied = self.query_applied().await?;
            Ok(applied.into_iter().last())
        })
    }
}
