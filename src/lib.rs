//! # Satellite Sync
//!
//! The client-side core of a local-first sync engine. A local SQLite
//! database is kept in sync with a replication server: local writes are
//! captured by triggers, stamped into an oplog and streamed out, while
//! remote transactions and shape subscriptions are merged in with
//! tag-based last-writer-wins semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               Satellite                                  │
//! │                                                                          │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────┐   ┌──────────────────┐   │
//! │  │ triggers  │──►│ oplog table │──►│ snapshot │──►│ SatelliteClient  │──►│── server
//! │  │ (capture) │   │             │   │ (stamp)  │   │ (outbound)       │   │
//! │  └───────────┘   └─────────────┘   └──────────┘   └──────────────────┘   │
//! │                                                                          │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────┐   ┌──────────────────┐   │
//! │  │  SQLite   │◄──│   Applier   │◄──│  merge   │◄──│ SatelliteClient  │◄──│── server
//! │  │  tables   │   │ (shadow +   │   │ (LWW +   │   │ (inbound, shapes)│   │
//! │  └───────────┘   │  meta)      │   │  tags)   │   └──────────────────┘   │
//! │                  └─────────────┘   └──────────┘                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use satellite_sync::{Satellite, SyncConfig, Shape};
//! # async fn run(transport: Arc<dyn satellite_sync::protocol::Transport>) -> satellite_sync::Result<()> {
//! let config = SyncConfig::for_testing("app.db");
//! let satellite = Satellite::open(config, transport, vec![]).await?;
//! satellite.start("auth-token").await?;
//!
//! let subscription = satellite.subscribe(vec![Shape::table("items")]).await?;
//! subscription.synced().await?;
//!
//! satellite.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod meta;
pub mod metrics;
pub mod migrator;
pub mod notifier;
pub mod oplog;
pub mod protocol;
pub mod resilience;
pub mod shapes;
pub mod snapshot;
pub mod triggers;
pub mod types;

pub use adapter::{DatabaseAdapter, SqliteAdapter, Statement};
pub use config::{ClientConfig, InternalTables, ProcessConfig, StorageConfig, SyncConfig};
pub use coordinator::{ConnectivityState, ProcessState, Satellite, ShapeSubscription};
pub use error::{ErrorCode, Result, SyncError};
pub use migrator::Migration;
pub use notifier::{EventNotifier, Notifier, NotifierEvent};
pub use shapes::{Shape, ShapeDefinition, SyncStatus};
pub use types::{Lsn, Record, SqlValue};
