// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database adapter.
//!
//! The sync process never talks to SQLite directly. Everything goes through
//! [`DatabaseAdapter`], which executes [`Statement`]s and returns rows as
//! [`Record`]s. [`SqliteAdapter`] is the sqlx-backed implementation.
//!
//! # Transactions with a dependent second phase
//!
//! The snapshot needs to read rows inside a transaction and decide what to
//! write next based on them, without releasing the transaction in between.
//! [`DatabaseAdapter::transaction_with_query`] covers that:
//!
//! ```text
//! BEGIN
//!   run `first` statements
//!   rows = query
//!   run then(rows)          (skipped when `then` returns nothing)
//! COMMIT
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff, the whole
//! transaction being replayed on each attempt.

use crate::config::StorageConfig;
use crate::error::{Result, SyncError};
use crate::types::{Record, SqlValue};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Second phase of [`DatabaseAdapter::transaction_with_query`].
pub type DependentStatements<'a> = Box<dyn Fn(&[Record]) -> Result<Vec<Statement>> + Send + Sync + 'a>;

/// SQL text with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    pub rows_affected: u64,
}

/// SQL execution interface used by the sync process.
pub trait DatabaseAdapter: Send + Sync {
    /// Execute one statement.
    fn run(&self, stmt: Statement) -> BoxFuture<'_, RunResult>;

    /// Execute statements in order inside one transaction.
    fn run_in_transaction(&self, stmts: Vec<Statement>) -> BoxFuture<'_, RunResult>;

    /// Run a query and return its rows.
    fn query(&self, stmt: Statement) -> BoxFuture<'_, Vec<Record>>;

    /// Run `first`, then `query`, then whatever `then` derives from the
    /// query rows, all in one transaction. Returns the query rows.
    fn transaction_with_query<'a>(
        &'a self,
        first: Vec<Statement>,
        query: Statement,
        then: DependentStatements<'a>,
    ) -> BoxFuture<'a, Vec<Record>>;
}

// =============================================================================
// SQLite busy retry
// =============================================================================

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(SyncError::Storage(e))
                if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS =>
            {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_db_busy_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Row conversion
// =============================================================================

fn bind_statement(stmt: &Statement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    let mut query = sqlx::query(&stmt.sql);
    for arg in &stmt.args {
        query = match arg {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Blob(b) => query.bind(b.clone()),
            SqlValue::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn row_to_record(row: &SqliteRow) -> Result<Record> {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let storage_class = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match storage_class.as_deref() {
            None => SqlValue::Null,
            Some("INTEGER") => SqlValue::Integer(row.try_get(i)?),
            Some("REAL") => SqlValue::Real(row.try_get(i)?),
            Some("BLOB") => SqlValue::Blob(row.try_get(i)?),
            Some(_) => SqlValue::Text(row.try_get(i)?),
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

// =============================================================================
// SqliteAdapter
// =============================================================================

/// [`DatabaseAdapter`] over a sqlx SQLite pool.
#[derive(Clone)]
pub struct SqliteAdapter {
    pool: SqlitePool,
    path: String,
}

impl SqliteAdapter {
    /// Open (creating if missing) the database described by `config`.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening local database");

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .foreign_keys(true)
            .create_if_missing(true);

        if config.wal_mode && !config.is_in_memory() {
            options = options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if config.is_in_memory() {
            // Every connection would see its own empty database otherwise.
            pool_options = pool_options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool, path })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            path: String::from("<pool>"),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Highest number of bound parameters a statement may carry.
    ///
    /// SQLite raised the limit from 999 to 32766 in 3.32.
    pub async fn max_sql_parameters(&self) -> Result<usize> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(max_parameters_for_version(&version))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn max_parameters_for_version(version: &str) -> usize {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    if (major, minor) >= (3, 32) {
        32766
    } else {
        999
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn run(&self, stmt: Statement) -> BoxFuture<'_, RunResult> {
        Box::pin(async move {
            let pool = &self.pool;
            let stmt = &stmt;
            execute_with_retry("run", move || async move {
                let done = bind_statement(stmt).execute(pool).await?;
                Ok(RunResult {
                    rows_affected: done.rows_affected(),
                })
            })
            .await
        })
    }

    fn run_in_transaction(&self, stmts: Vec<Statement>) -> BoxFuture<'_, RunResult> {
        Box::pin(async move {
            let pool = &self.pool;
            let stmts = &stmts;
            execute_with_retry("run_in_transaction", move || async move {
                let mut tx = pool.begin().await?;
                let mut rows_affected = 0;
                for stmt in stmts {
                    rows_affected += bind_statement(stmt).execute(&mut *tx).await?.rows_affected();
                }
                tx.commit().await?;
                Ok(RunResult { rows_affected })
            })
            .await
        })
    }

    fn query(&self, stmt: Statement) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(async move {
            let pool = &self.pool;
            let stmt = &stmt;
            execute_with_retry("query", move || async move {
                let rows = bind_statement(stmt).fetch_all(pool).await?;
                rows.iter().map(row_to_record).collect()
            })
            .await
        })
    }

    fn transaction_with_query<'a>(
        &'a self,
        first: Vec<Statement>,
        query: Statement,
        then: DependentStatements<'a>,
    ) -> BoxFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let pool = &self.pool;
            let first = &first;
            let query = &query;
            let then = &then;
            execute_with_retry("transaction_with_query", move || async move {
                let mut tx = pool.begin().await?;
                for stmt in first {
                    bind_statement(stmt).execute(&mut *tx).await?;
                }
                let rows = bind_statement(query)
                    .fetch_all(&mut *tx)
                    .await?
                    .iter()
                    .map(row_to_record)
                    .collect::<Result<Vec<_>>>()?;
                for stmt in then(&rows)? {
                    bind_statement(&stmt).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                Ok(rows)
            })
            .await
        })
    }
}
