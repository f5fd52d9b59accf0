//! Persisted client metadata.
//!
//! The meta table is a small key/value store holding everything the client
//! needs to resume after a restart:
//!
//! | key                  | value                                   |
//! |----------------------|-----------------------------------------|
//! | `clientId`           | stable UUID, generated on first start   |
//! | `lsn`                | last applied LSN, base64                |
//! | `subscriptions`      | serialized shape manager state (JSON)   |
//! | `seenAdditionalData` | comma-joined additional data ref ids    |
//! | `seenGoneBatch`      | comma-joined subscription ids gone      |
//! | `compensations`      | count of compensating actions           |
//!
//! Reads go through an in-memory cache. Writes either go straight to disk
//! ([`MetaStore::set`]) or are returned as a [`Statement`] so they commit
//! together with the data they describe ([`MetaStore::set_statement`]);
//! [`MetaStore::commit`] then updates the cache once that transaction is
//! through.
//!
//! ```text
//! apply tx ──► [DML..., set_statement(lsn)] ──► run_in_transaction ──► commit(lsn)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{DatabaseAdapter, Statement};
use crate::config::InternalTables;
use crate::error::Result;
use crate::types::{Lsn, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    ClientId,
    Lsn,
    Subscriptions,
    SeenAdditionalData,
    SeenGoneBatch,
    Compensations,
}

impl MetaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientId => "clientId",
            Self::Lsn => "lsn",
            Self::Subscriptions => "subscriptions",
            Self::SeenAdditionalData => "seenAdditionalData",
            Self::SeenGoneBatch => "seenGoneBatch",
            Self::Compensations => "compensations",
        }
    }
}

/// Cached view over the meta table.
pub struct MetaStore {
    adapter: Arc<dyn DatabaseAdapter>,
    table: String,
    cache: RwLock<HashMap<MetaKey, String>>,
}

impl MetaStore {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, tables: &InternalTables) -> Self {
        Self {
            adapter,
            table: tables.meta_table(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Read a value, hitting the database on a cache miss.
    /// Missing keys read as the empty string.
    pub async fn get(&self, key: MetaKey) -> Result<String> {
        if let Some(v) = self.cache.read().await.get(&key) {
            return Ok(v.clone());
        }

        let rows = self
            .adapter
            .query(Statement::with_args(
                format!("SELECT value FROM {} WHERE key = ?", self.table),
                vec![SqlValue::Text(key.as_str().to_string())],
            ))
            .await?;
        let value = match rows.first().and_then(|r| r.get("value")) {
            Some(SqlValue::Text(s)) => s.clone(),
            Some(SqlValue::Integer(i)) => i.to_string(),
            Some(SqlValue::Blob(b)) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        };
        self.cache.write().await.insert(key, value.clone());
        Ok(value)
    }

    /// Statement writing `value`, for inclusion in a larger transaction.
    pub fn set_statement(&self, key: MetaKey, value: impl Into<String>) -> Statement {
        Statement::with_args(
            format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)", self.table),
            vec![
                SqlValue::Text(key.as_str().to_string()),
                SqlValue::Text(value.into()),
            ],
        )
    }

    /// Update the cache after a transaction containing
    /// [`set_statement`](Self::set_statement) committed.
    pub async fn commit(&self, key: MetaKey, value: impl Into<String>) {
        self.cache.write().await.insert(key, value.into());
    }

    /// Drop cached values, e.g. after a client reset touched the table.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    /// Write a value now.
    pub async fn set(&self, key: MetaKey, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.adapter.run(self.set_statement(key, value.clone())).await?;
        self.commit(key, value).await;
        Ok(())
    }

    /// The client id, generating and persisting one on first use.
    pub async fn client_id(&self) -> Result<String> {
        let existing = self.get(MetaKey::ClientId).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        info!(client_id = %id, "generated new client id");
        self.set(MetaKey::ClientId, id.clone()).await?;
        Ok(id)
    }

    pub async fn lsn(&self) -> Result<Lsn> {
        let encoded = self.get(MetaKey::Lsn).await?;
        if encoded.is_empty() {
            return Ok(Lsn::default());
        }
        Lsn::from_base64(&encoded)
    }

    pub fn lsn_statement(&self, lsn: &Lsn) -> Statement {
        self.set_statement(MetaKey::Lsn, lsn.to_base64())
    }

    /// Additional data reference ids applied since the last acknowledgement.
    pub async fn seen_additional_data(&self) -> Result<Vec<u64>> {
        Ok(parse_id_list(&self.get(MetaKey::SeenAdditionalData).await?))
    }

    pub async fn seen_gone_batch(&self) -> Result<Vec<String>> {
        let raw = self.get(MetaKey::SeenGoneBatch).await?;
        Ok(raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }

    /// Statement and new value appending `ids` to a comma-joined list.
    pub async fn append_statement<T: ToString>(&self, key: MetaKey, ids: &[T]) -> Result<(Statement, String)> {
        let mut current = self.get(key).await?;
        for id in ids {
            if !current.is_empty() {
                current.push(',');
            }
            current.push_str(&id.to_string());
        }
        debug!(key = key.as_str(), value = %current, "appending to meta list");
        Ok((self.set_statement(key, current.clone()), current))
    }

    pub async fn compensations(&self) -> Result<i64> {
        Ok(self.get(MetaKey::Compensations).await?.parse().unwrap_or(0))
    }
}

fn parse_id_list(raw: &str) -> Vec<u64> {
    raw.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
