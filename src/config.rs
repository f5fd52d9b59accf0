//! Configuration for the sync client.
//!
//! All configuration types needed to run a [`Satellite`](crate::Satellite)
//! process. Configuration can be constructed programmatically or
//! deserialized from JSON/YAML; loading it from disk is the embedder's job.
//!
//! # Quick Start
//!
//! ```rust
//! use satellite_sync::config::{SyncConfig, ClientConfig};
//!
//! let config = SyncConfig {
//!     db_name: "app.db".into(),
//!     client: ClientConfig {
//!         host: "sync.example.com".into(),
//!         port: 443,
//!         ssl: true,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.client.max_unacked_txs, 30);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── db_name: String              # Name reported in change notifications
//! ├── client: ClientConfig         # Server address, RPC timeout, ack window
//! ├── process: ProcessConfig       # Snapshot cadence, reconnect backoff
//! ├── tables: InternalTables       # Names of the oplog/meta/shadow tables
//! └── storage: StorageConfig       # SQLite file settings
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "db_name": "app.db",
//!   "client": { "host": "127.0.0.1", "port": 5133, "timeout": "3s", "ack_period": "60s" },
//!   "process": { "polling_interval": "2s", "min_snapshot_window": "40ms" },
//!   "storage": { "sqlite_path": "/var/lib/app/app.db" }
//! }
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Satellite::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Logical database name, echoed in notifier events.
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Replication protocol client settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Snapshot and reconnect settings.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Internal table names.
    #[serde(default)]
    pub tables: InternalTables,

    /// SQLite storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_db_name() -> String {
    "satellite.db".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_name: default_db_name(),
            client: ClientConfig::default(),
            process: ProcessConfig::default(),
            tables: InternalTables::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a config with short timers and an in-memory database.
    pub fn for_testing(db_name: &str) -> Self {
        Self {
            db_name: db_name.to_string(),
            client: ClientConfig::for_testing(),
            process: ProcessConfig::for_testing(),
            tables: InternalTables::default(),
            storage: StorageConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClientConfig: replication protocol client
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication protocol client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Sync server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Sync server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS for the transport.
    #[serde(default)]
    pub ssl: bool,

    /// RPC call timeout (e.g. "3s").
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Disable RPC timeouts entirely (useful under a debugger).
    #[serde(default)]
    pub disable_rpc_timeouts: bool,

    /// Minimum spacing between outbound transaction pushes.
    #[serde(default = "default_push_period")]
    pub push_period: String,

    /// Idle time after which pending acknowledgements are flushed.
    #[serde(default = "default_ack_period")]
    pub ack_period: String,

    /// Unacknowledged transaction window used until the server supplies one.
    #[serde(default = "default_max_unacked_txs")]
    pub max_unacked_txs: u32,

    /// Percentage of the window at which an ack is sent eagerly.
    #[serde(default = "default_ack_threshold_percent")]
    pub ack_threshold_percent: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5133
}

fn default_timeout() -> String {
    "3s".to_string()
}

fn default_push_period() -> String {
    "500ms".to_string()
}

fn default_ack_period() -> String {
    "60s".to_string()
}

fn default_max_unacked_txs() -> u32 {
    30
}

fn default_ack_threshold_percent() -> u32 {
    70
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl: false,
            timeout: default_timeout(),
            disable_rpc_timeouts: false,
            push_period: default_push_period(),
            ack_period: default_ack_period(),
            max_unacked_txs: default_max_unacked_txs(),
            ack_threshold_percent: default_ack_threshold_percent(),
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            timeout: "500ms".to_string(),
            push_period: "10ms".to_string(),
            ack_period: "200ms".to_string(),
            ..Default::default()
        }
    }

    /// Transport URL for the configured server.
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.host, self.port)
    }

    /// RPC timeout, or `None` when timeouts are disabled.
    pub fn rpc_timeout(&self) -> Option<Duration> {
        if self.disable_rpc_timeouts {
            None
        } else {
            Some(humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(3)))
        }
    }

    pub fn push_period_duration(&self) -> Duration {
        humantime::parse_duration(&self.push_period).unwrap_or(Duration::from_millis(500))
    }

    pub fn ack_period_duration(&self) -> Duration {
        humantime::parse_duration(&self.ack_period).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessConfig: snapshot cadence and reconnect backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// How often a snapshot is requested even without change notifications.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: String,

    /// Minimum spacing between two snapshots (throttle window).
    #[serde(default = "default_min_snapshot_window")]
    pub min_snapshot_window: String,

    /// Reset local state (keeping fulfilled shapes) when the server
    /// reports the client is behind its replication window.
    #[serde(default = "default_true")]
    pub clear_on_behind_window: bool,

    /// Initial reconnect delay.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: String,

    /// Reconnect delay ceiling.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Reconnect attempts before giving up.
    #[serde(default = "default_backoff_attempts")]
    pub backoff_max_attempts: u32,

    /// Delay multiplier between reconnect attempts.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Timeout for a single connect + authenticate + start attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Override for the per-statement bound parameter limit.
    /// Detected from the SQLite version when unset.
    #[serde(default)]
    pub max_sql_parameters: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_polling_interval() -> String {
    "2s".to_string()
}

fn default_min_snapshot_window() -> String {
    "40ms".to_string()
}

fn default_backoff_initial() -> String {
    "1s".to_string()
}

fn default_backoff_max() -> String {
    "10s".to_string()
}

fn default_backoff_attempts() -> u32 {
    50
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            min_snapshot_window: default_min_snapshot_window(),
            clear_on_behind_window: true,
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            backoff_max_attempts: default_backoff_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
            connect_timeout: default_connect_timeout(),
            max_sql_parameters: None,
        }
    }
}

impl ProcessConfig {
    pub fn for_testing() -> Self {
        Self {
            polling_interval: "200ms".to_string(),
            min_snapshot_window: "5ms".to_string(),
            backoff_initial: "10ms".to_string(),
            backoff_max: "50ms".to_string(),
            backoff_max_attempts: 3,
            ..Default::default()
        }
    }

    pub fn polling_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.polling_interval).unwrap_or(Duration::from_secs(2))
    }

    pub fn min_snapshot_window_duration(&self) -> Duration {
        humantime::parse_duration(&self.min_snapshot_window).unwrap_or(Duration::from_millis(40))
    }

    /// Reconnect backoff policy.
    pub fn connection_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.backoff_max_attempts.max(1) as usize,
            initial_delay: humantime::parse_duration(&self.backoff_initial)
                .unwrap_or(Duration::from_secs(1)),
            max_delay: humantime::parse_duration(&self.backoff_max)
                .unwrap_or(Duration::from_secs(10)),
            backoff_factor: self.backoff_multiplier,
            connection_timeout: humantime::parse_duration(&self.connect_timeout)
                .unwrap_or(Duration::from_secs(10)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InternalTables: bookkeeping table names
// ═══════════════════════════════════════════════════════════════════════════════

/// Names of the internal bookkeeping tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternalTables {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_oplog")]
    pub oplog: String,
    #[serde(default = "default_meta")]
    pub meta: String,
    #[serde(default = "default_shadow")]
    pub shadow: String,
    #[serde(default = "default_triggers")]
    pub triggers: String,
    #[serde(default = "default_migrations")]
    pub migrations: String,
}

fn default_namespace() -> String {
    "main".to_string()
}

fn default_oplog() -> String {
    "_electric_oplog".to_string()
}

fn default_meta() -> String {
    "_electric_meta".to_string()
}

fn default_shadow() -> String {
    "_electric_shadow".to_string()
}

fn default_triggers() -> String {
    "_electric_trigger_settings".to_string()
}

fn default_migrations() -> String {
    "_electric_migrations".to_string()
}

impl Default for InternalTables {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            oplog: default_oplog(),
            meta: default_meta(),
            shadow: default_shadow(),
            triggers: default_triggers(),
            migrations: default_migrations(),
        }
    }
}

impl InternalTables {
    fn qualify(&self, table: &str) -> String {
        format!("{}.{}", self.namespace, table)
    }

    pub fn oplog_table(&self) -> String {
        self.qualify(&self.oplog)
    }

    pub fn meta_table(&self) -> String {
        self.qualify(&self.meta)
    }

    pub fn shadow_table(&self) -> String {
        self.qualify(&self.shadow)
    }

    pub fn triggers_table(&self) -> String {
        self.qualify(&self.triggers)
    }

    pub fn migrations_table(&self) -> String {
        self.qualify(&self.migrations)
    }

    /// True for tables the sync machinery owns (never replicated).
    pub fn is_internal(&self, table: &str) -> bool {
        table.starts_with("_electric_")
            || [&self.oplog, &self.meta, &self.shadow, &self.triggers, &self.migrations]
                .iter()
                .any(|t| t.as_str() == table)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig: SQLite file settings
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Connection pool size for file databases.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "satellite.db".to_string(),
            wal_mode: true,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5133);
        assert!(!config.ssl);
        assert_eq!(config.rpc_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.ack_period_duration(), Duration::from_secs(60));
        assert_eq!(config.max_unacked_txs, 30);
        assert_eq!(config.ack_threshold_percent, 70);
    }

    #[test]
    fn test_client_url() {
        let mut config = ClientConfig::default();
        assert_eq!(config.url(), "ws://127.0.0.1:5133/ws");
        config.ssl = true;
        config.host = "sync.example.com".into();
        config.port = 443;
        assert_eq!(config.url(), "wss://sync.example.com:443/ws");
    }

    #[test]
    fn test_rpc_timeout_disabled() {
        let config = ClientConfig {
            disable_rpc_timeouts: true,
            ..Default::default()
        };
        assert_eq!(config.rpc_timeout(), None);
    }

    #[test]
    fn test_duration_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = ClientConfig {
                push_period: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.push_period_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = ProcessConfig {
            polling_interval: "invalid".to_string(),
            min_snapshot_window: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.polling_interval_duration(), Duration::from_secs(2));
        assert_eq!(config.min_snapshot_window_duration(), Duration::from_millis(40));
    }

    #[test]
    fn test_connection_retry_from_process_config() {
        let retry = ProcessConfig::default().connection_retry();
        assert_eq!(retry.max_attempts, 50);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
        assert_eq!(retry.backoff_factor, 2.0);
        assert_eq!(retry.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_connection_retry_never_zero_attempts() {
        let config = ProcessConfig {
            backoff_max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.connection_retry().max_attempts, 1);
    }

    #[test]
    fn test_internal_tables_qualified() {
        let tables = InternalTables::default();
        assert_eq!(tables.oplog_table(), "main._electric_oplog");
        assert_eq!(tables.meta_table(), "main._electric_meta");
        assert_eq!(tables.shadow_table(), "main._electric_shadow");
        assert_eq!(tables.triggers_table(), "main._electric_trigger_settings");
        assert!(tables.is_internal("_electric_oplog"));
        assert!(!tables.is_internal("items"));
    }

    #[test]
    fn test_storage_config_in_memory() {
        let config = StorageConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert_eq!(config.max_connections, 1);
        assert!(!StorageConfig::default().is_in_memory());
    }

    #[test]
    fn test_for_testing_config() {
        let config = SyncConfig::for_testing("test.db");
        assert_eq!(config.db_name, "test.db");
        assert!(config.storage.is_in_memory());
        assert_eq!(config.client.rpc_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.process.connection_retry().max_attempts, 3);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = SyncConfig {
            db_name: "roundtrip.db".to_string(),
            client: ClientConfig {
                host: "10.0.0.1".into(),
                max_unacked_txs: 12,
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.db_name, "roundtrip.db");
        assert_eq!(parsed.client.host, "10.0.0.1");
        assert_eq!(parsed.client.max_unacked_txs, 12);
        assert_eq!(parsed.tables, InternalTables::default());
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let parsed: SyncConfig =
            serde_json::from_str(r#"{"client": {"port": 80}, "storage": {"sqlite_path": "x.db"}}"#)
                .unwrap();
        assert_eq!(parsed.client.port, 80);
        assert_eq!(parsed.client.timeout, "3s");
        assert!(parsed.process.clear_on_behind_window);
        assert_eq!(parsed.storage.max_connections, 2);
        assert!(parsed.storage.wal_mode);
    }
}
