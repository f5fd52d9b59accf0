// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync process coordinator.
//!
//! The main orchestrator that ties together:
//! - Local capture via [`crate::snapshot::Snapshotter`]
//! - The replication connection via [`crate::protocol::SatelliteClient`]
//! - Shape subscriptions via [`crate::shapes::ShapeManager`]
//! - Writing incoming data via the applier in [`apply`]
//!
//! # Architecture
//!
//! ```text
//!            potentially_changed / polling timer
//!                          │
//!                          ▼
//!   local writes ──► Throttle ──► snapshot ──► enqueue ──► SatelliteClient ──► server
//!                                                              │
//!   server ──► SatelliteClient ──► ClientEvent stream ──► event loop ──► Applier ──► SQLite
//!                                                              │
//!                                                      ack / subscription done
//! ```
//!
//! The process:
//! 1. Runs the migrator and loads the client id, relations and persisted
//!    subscriptions
//! 2. Starts snapshot polling
//! 3. Connects with backoff: connect, authenticate, start replication
//! 4. Applies client events one at a time, in arrival order
//! 5. On a transient failure disconnects and reconnects in the background

pub(crate) mod apply;
mod types;

pub use types::{ConnectivityState, ProcessState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::adapter::{BoxFuture, DatabaseAdapter, SqliteAdapter};
use crate::config::SyncConfig;
use crate::error::{ErrorCode, Result, SyncError};
use crate::meta::{MetaKey, MetaStore};
use crate::metrics;
use crate::migrator::{Migration, Migrator, SqliteMigrator};
use crate::notifier::{EventNotifier, Notifier, NotifierEvent};
use crate::oplog::to_transactions;
use crate::protocol::{ClientEvent, ReplicationStatus, SatelliteClient, TextCodec, Transport};
use crate::resilience::{retry_with_backoff, Throttle};
use crate::shapes::{
    tables_for_shapes, DuplicateSubscription, GarbageCollectShapeHandler, Shape, ShapeDefinition, ShapeManager,
    ShapeRequest, SyncStatus,
};
use crate::snapshot::{notify_local_changes, Snapshotter};
use crate::triggers::{SqliteTriggerGenerator, TriggerGenerator};
use crate::types::Lsn;

use apply::Applier;

/// Bound parameters per statement when the configuration does not say.
pub const DEFAULT_MAX_SQL_PARAMETERS: usize = 999;

/// How long `stop()` waits for the active snapshot and each task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a requested subscription.
#[derive(Debug)]
pub struct ShapeSubscription {
    pub id: String,
    synced: oneshot::Receiver<Result<()>>,
}

impl ShapeSubscription {
    /// Wait until the subscription's data has been applied locally.
    pub async fn synced(self) -> Result<()> {
        self.synced.await.unwrap_or(Err(SyncError::Shutdown))
    }
}

struct SatelliteInner {
    config: SyncConfig,
    applier: Arc<Applier>,
    client: SatelliteClient,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    shapes: tokio::sync::Mutex<ShapeManager>,
    /// Serializes reading the enqueued LSN and enqueueing past it.
    push_lock: tokio::sync::Mutex<()>,
    /// Subscription id to callers waiting for its data.
    waiters: DashMap<String, Vec<oneshot::Sender<Result<()>>>>,
    /// Shapes kept across a client reset, resubscribed after reconnecting.
    resubscribe: Mutex<Vec<ShapeDefinition>>,
    client_id: RwLock<String>,
    auth_token: RwLock<String>,
    state_tx: watch::Sender<ProcessState>,
    state_rx: watch::Receiver<ProcessState>,
    connectivity: Mutex<ConnectivityState>,
    reconnecting: AtomicBool,
    last_error: Mutex<Option<String>>,
    throttle: Mutex<Option<Throttle>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A sync process for one local database. Cheap to clone.
#[derive(Clone)]
pub struct Satellite {
    inner: Arc<SatelliteInner>,
}

impl Satellite {
    /// Open the SQLite database named by `config.storage` and build a
    /// process around it. The parameter limit is detected from the SQLite
    /// version unless configured.
    pub async fn open(config: SyncConfig, transport: Arc<dyn Transport>, migrations: Vec<Migration>) -> Result<Self> {
        let adapter = SqliteAdapter::open(&config.storage).await?;
        let mut config = config;
        if config.process.max_sql_parameters.is_none() {
            config.process.max_sql_parameters = Some(adapter.max_sql_parameters().await?);
        }
        let notifier = Arc::new(EventNotifier::new(config.db_name.clone()));
        Ok(Self::new(config, Arc::new(adapter), transport, notifier, migrations))
    }

    /// Create a process over existing collaborators.
    ///
    /// The process starts in `Created` state. Call [`start()`](Self::start)
    /// to prepare the database and connect.
    pub fn new(
        config: SyncConfig,
        adapter: Arc<dyn DatabaseAdapter>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        migrations: Vec<Migration>,
    ) -> Self {
        let tables = config.tables.clone();
        let migrator: Arc<dyn Migrator> = Arc::new(SqliteMigrator::new(adapter.clone(), &tables, migrations));
        let triggers: Arc<dyn TriggerGenerator> = Arc::new(SqliteTriggerGenerator::new(tables.clone()));

        let applier = Arc::new(Applier {
            meta: Arc::new(MetaStore::new(adapter.clone(), &tables)),
            snapshotter: Arc::new(Snapshotter::new(adapter.clone(), tables.clone())),
            adapter,
            migrator,
            triggers,
            notifier,
            tables,
            relations: RwLock::new(Default::default()),
            max_sql_parameters: config
                .process
                .max_sql_parameters
                .unwrap_or(DEFAULT_MAX_SQL_PARAMETERS),
        });

        let gc_applier = Arc::clone(&applier);
        let gc: GarbageCollectShapeHandler = Arc::new(move |shapes: Vec<ShapeDefinition>| -> BoxFuture<'static, ()> {
            let applier = Arc::clone(&gc_applier);
            Box::pin(async move {
                let definitions: Vec<Shape> = shapes.into_iter().map(|d| d.definition).collect();
                let tables = tables_for_shapes(&definitions);
                debug!(tables = ?tables, "clearing data of dropped shapes");
                applier.clear_tables(&tables, Vec::new()).await
            })
        });

        let (client, events) = SatelliteClient::new(transport, config.client.clone(), Arc::new(TextCodec));
        let (state_tx, state_rx) = watch::channel(ProcessState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(SatelliteInner {
                config,
                applier,
                client,
                events: Mutex::new(Some(events)),
                shapes: tokio::sync::Mutex::new(ShapeManager::new(Some(gc))),
                push_lock: tokio::sync::Mutex::new(()),
                waiters: DashMap::new(),
                resubscribe: Mutex::new(Vec::new()),
                client_id: RwLock::new(String::new()),
                auth_token: RwLock::new(String::new()),
                state_tx,
                state_rx,
                connectivity: Mutex::new(ConnectivityState::Disconnected),
                reconnecting: AtomicBool::new(false),
                last_error: Mutex::new(None),
                throttle: Mutex::new(None),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ─── accessors ──────────────────────────────────────────────────────────

    pub fn state(&self) -> ProcessState {
        *self.inner.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ProcessState::Running)
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        *self.inner.connectivity.lock()
    }

    /// Empty until [`start()`](Self::start) loaded or generated it.
    pub fn client_id(&self) -> String {
        self.inner.client_id.read().clone()
    }

    pub fn client(&self) -> &SatelliteClient {
        &self.inner.client
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.inner.applier.adapter
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.applier.notifier
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.inner.applier.meta
    }

    /// The error that moved the process to `Failed`, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub async fn sync_status(&self, subscription_id: &str) -> SyncStatus {
        self.inner.shapes.lock().await.status(subscription_id)
    }

    pub async fn fulfilled_shapes(&self) -> Vec<ShapeDefinition> {
        self.inner.shapes.lock().await.fulfilled_shapes()
    }

    // ─── lifecycle ──────────────────────────────────────────────────────────

    /// Start the process.
    ///
    /// 1. Creates the internal tables and applies bundled migrations
    /// 2. Loads or generates the client id
    /// 3. Infers relations for every user table
    /// 4. Restores persisted subscriptions
    /// 5. Starts snapshot polling and the event loop
    /// 6. Connects with backoff
    pub async fn start(&self, auth_token: &str) -> Result<()> {
        if self.state() != ProcessState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        let inner = &self.inner;
        inner.set_state(ProcessState::Starting);
        *inner.auth_token.write() = auth_token.to_string();

        if let Err(e) = inner.prepare().await {
            error!(error = %e, "failed to prepare local database");
            inner.fail(&e);
            return Err(e);
        }

        inner.spawn_event_loop();
        inner.spawn_snapshot_polling();
        inner.set_state(ProcessState::Running);

        match Arc::clone(inner).connect_with_backoff().await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.fail(&e);
                Err(e)
            }
        }
    }

    /// Retry connect, authenticate and start replication until it works
    /// or the error is not retryable.
    pub async fn connect_with_backoff(&self) -> Result<()> {
        Arc::clone(&self.inner).connect_with_backoff().await
    }

    /// Stop replication and background work.
    ///
    /// Waits for an active snapshot to finish first, so the database is
    /// never left mid-write.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if matches!(self.state(), ProcessState::Stopped) {
            return Ok(());
        }
        info!("stopping sync process");
        inner.set_state(ProcessState::ShuttingDown);
        let _ = inner.shutdown_tx.send(true);

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, inner.applier.snapshotter.wait_idle())
            .await
            .is_err()
        {
            warn!("snapshot still running at shutdown");
        }
        let throttle = inner.throttle.lock().take();
        drop(throttle);

        if inner.client.inbound_status() == ReplicationStatus::Active {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, inner.client.stop_replication()).await {
                Ok(Err(e)) => debug!(error = %e, "stop replication failed"),
                Err(_) => debug!("stop replication timed out"),
                Ok(Ok(())) => {}
            }
        }
        if let Err(e) = inner.client.close().await {
            debug!(error = %e, "error closing connection");
        }
        inner.set_connectivity(ConnectivityState::Disconnected);
        inner.cancel_waiters();

        let handles: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "task completed"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "task timed out during shutdown"),
            }
        }

        inner.set_state(ProcessState::Stopped);
        info!("sync process stopped");
        Ok(())
    }

    // ─── local changes ──────────────────────────────────────────────────────

    /// Request a snapshot, coalescing with any in flight.
    pub fn potentially_changed(&self) {
        self.inner.trigger_snapshot();
    }

    /// Snapshot now and push the new entries if the server is pulling.
    /// Returns the number of entries stamped.
    pub async fn perform_snapshot(&self) -> Result<usize> {
        self.inner.snapshot().await
    }

    // ─── subscriptions ──────────────────────────────────────────────────────

    /// Subscribe to `shapes`. Shapes identical to an existing subscription
    /// reuse it.
    pub async fn subscribe(&self, shapes: Vec<Shape>) -> Result<ShapeSubscription> {
        self.inner.subscribe(shapes).await
    }

    pub async fn unsubscribe(&self, subscription_ids: Vec<String>) -> Result<()> {
        self.inner.unsubscribe(subscription_ids).await
    }

    /// Clear every subscribed table, the LSN and the subscription state in
    /// one transaction. With `keep_subscribed_shapes` the fulfilled shapes
    /// are requested again after the next successful connect.
    pub async fn reset_client_state(&self, keep_subscribed_shapes: bool) -> Result<Vec<ShapeDefinition>> {
        self.inner.reset_client_state(keep_subscribed_shapes).await
    }
}

impl SatelliteInner {
    fn set_state(&self, state: ProcessState) {
        let _ = self.state_tx.send(state);
        metrics::set_process_state(&state.to_string());
    }

    fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    fn shutting_down(&self) -> bool {
        matches!(self.state(), ProcessState::ShuttingDown | ProcessState::Stopped)
    }

    fn fail(&self, e: &SyncError) {
        error!(code = %e.code(), error = %e, "sync process failed");
        *self.last_error.lock() = Some(e.to_string());
        self.set_state(ProcessState::Failed);
    }

    fn set_connectivity(&self, state: ConnectivityState) {
        {
            let mut current = self.connectivity.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        info!(%state, "connectivity changed");
        metrics::set_connectivity(state.as_str());
        self.applier.notifier.connectivity_state_changed(state);
    }

    fn client_id(&self) -> String {
        self.client_id.read().clone()
    }

    #[instrument(skip_all)]
    async fn prepare(&self) -> Result<()> {
        let applied = self.applier.migrator.up().await?;
        let client_id = self.applier.meta.client_id().await?;
        let tables = self.applier.load_relations().await?;

        let state = self.applier.meta.get(MetaKey::Subscriptions).await?;
        let mut shapes = self.shapes.lock().await;
        shapes.set_state(&state)?;

        info!(
            client_id = %client_id,
            migrations = applied,
            tables,
            subscriptions = shapes.fulfilled_subscriptions().len(),
            "local database ready"
        );
        *self.client_id.write() = client_id;
        Ok(())
    }

    // ─── background tasks ───────────────────────────────────────────────────

    fn spawn_event_loop(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().take() else {
            warn!("event loop already running");
            return;
        };
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let span = tracing::info_span!("satellite", client_id = %self.client_id());

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        event = events.recv() => {
                            let Some(event) = event else { break };
                            let Some(inner) = weak.upgrade() else { break };
                            inner.handle_event(event).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("event loop stopping");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        self.tasks.lock().push(handle);
    }

    fn spawn_snapshot_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let throttle = Throttle::new(self.config.process.min_snapshot_window_duration(), move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = inner.snapshot().await {
                    warn!(error = %e, "snapshot failed");
                }
            })
        });
        *self.throttle.lock() = Some(throttle);

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut changes = self.applier.notifier.subscribe();
        let period = self.config.process.polling_interval_duration();

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        event = changes.recv() => match event {
                            Ok(NotifierEvent::PotentiallyChanged { .. }) => {}
                            Ok(_) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    inner.trigger_snapshot();
                }
            }
            .instrument(tracing::debug_span!("snapshot_polling")),
        );
        self.tasks.lock().push(handle);
    }

    fn trigger_snapshot(&self) {
        if let Some(throttle) = self.throttle.lock().as_ref() {
            throttle.trigger();
        }
    }

    // ─── snapshots and outbound ─────────────────────────────────────────────

    async fn snapshot(&self) -> Result<usize> {
        let result = self.applier.snapshotter.perform_snapshot(&self.client_id()).await?;
        notify_local_changes(self.applier.notifier.as_ref(), &result.entries);
        if self.client.outbound_status() == ReplicationStatus::Active {
            self.push_pending().await?;
        }
        Ok(result.entries.len())
    }

    /// Enqueue every stamped entry past the client's enqueued LSN.
    async fn push_pending(&self) -> Result<()> {
        let _push = self.push_lock.lock().await;
        let enqueued = self.client.enqueued_lsn();
        let since = lsn_to_rowid(&enqueued);
        let entries = self.applier.snapshotter.get_entries(since).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let transactions = to_transactions(&entries, &self.applier.relations())?;
        let count = transactions.len();
        for transaction in transactions {
            self.client.enqueue_transaction(transaction)?;
        }
        debug!(transactions = count, entries = entries.len(), "enqueued local transactions");
        metrics::record_transactions_enqueued(count);
        Ok(())
    }

    // ─── connection ─────────────────────────────────────────────────────────

    async fn connect_with_backoff(self: Arc<Self>) -> Result<()> {
        let retry = self.config.process.connection_retry();
        let inner = Arc::clone(&self);
        let result = retry_with_backoff(&retry, "connect", SyncError::is_retryable, |attempt| {
            let inner = Arc::clone(&inner);
            async move { inner.connect_once(attempt).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.after_connect().await;
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(SyncError::new(
                ErrorCode::ConnectionFailedAfterRetry,
                format!("could not connect after {} attempts: {e}", retry.max_attempts),
            )),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn connect_once(&self, attempt: usize) -> Result<()> {
        if self.shutting_down() {
            return Err(SyncError::Shutdown);
        }
        let outcome = self.handshake().await;
        metrics::record_connection_attempt(outcome.is_ok());
        match outcome {
            Ok(()) => {
                self.set_connectivity(ConnectivityState::Connected);
                Ok(())
            }
            Err(e) => {
                if let Err(close) = self.client.close().await {
                    debug!(error = %close, "error closing failed connection");
                }
                if e.is_out_of_sync() {
                    if !self.config.process.clear_on_behind_window {
                        return Err(e.wrap_fatal());
                    }
                    warn!(code = %e.code(), "client is out of sync, resetting local state");
                    self.reset_client_state(true).await?;
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        self.client.connect().await?;
        let token = self.auth_token.read().clone();
        self.client.authenticate(&self.client_id(), &token).await?;

        let lsn = self.applier.meta.lsn().await?;
        let schema_version = self.applier.migrator.query_schema_version().await?;
        let mut subscriptions = self.shapes.lock().await.fulfilled_subscriptions();
        if lsn.is_empty() && !subscriptions.is_empty() {
            warn!(count = subscriptions.len(), "no LSN to resume subscriptions from");
            subscriptions.clear();
        }
        let seen = self.applier.meta.seen_additional_data().await?;
        self.client
            .start_replication(lsn, schema_version, subscriptions, seen)
            .await
    }

    /// Follow-up work once replication is running again.
    async fn after_connect(&self) {
        // The server forgets unsubscribes that were not completed before
        // the connection dropped.
        {
            let mut shapes = self.shapes.lock().await;
            let incomplete = shapes.incomplete_unsubscribes();
            if !incomplete.is_empty() {
                shapes.gone_batch_delivered(&incomplete);
                if let Err(e) = self.persist_shapes(&shapes).await {
                    warn!(error = %e, "failed to persist subscription state");
                }
            }
        }

        let shapes: Vec<ShapeDefinition> = std::mem::take(&mut *self.resubscribe.lock());
        if !shapes.is_empty() {
            info!(shapes = shapes.len(), "resubscribing shapes kept across reset");
            let definitions = shapes.into_iter().map(|d| d.definition).collect();
            if let Err(e) = self.subscribe(definitions).await {
                warn!(error = %e, "failed to resubscribe kept shapes");
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.shutting_down() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(
            async move {
                if let Err(e) = inner.client.close().await {
                    debug!(error = %e, "error closing connection");
                }
                let result = Arc::clone(&inner).connect_with_backoff().await;
                inner.reconnecting.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    if !matches!(e, SyncError::Shutdown) {
                        inner.fail(&e);
                    }
                }
            }
            .instrument(tracing::info_span!("reconnect")),
        );
        self.tasks.lock().push(handle);
    }

    // ─── events ─────────────────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, event: ClientEvent) {
        let result = match event {
            ClientEvent::Transaction(transaction) => self.on_transaction(transaction).await,
            ClientEvent::AdditionalData(data) => {
                let reference = data.reference;
                match self.applier.apply_additional_data(&data).await {
                    Ok(()) => self.client.additional_data_applied(reference).await,
                    Err(e) => Err(e),
                }
            }
            ClientEvent::GoneBatch {
                lsn,
                subscription_ids,
                changes,
            } => self.on_gone_batch(lsn, subscription_ids, changes).await,
            ClientEvent::Relation(relation) => {
                debug!(table = %relation.table, "relation received");
                self.applier.update_relation(relation);
                Ok(())
            }
            ClientEvent::SubscriptionDelivered(data) => self.on_subscription_delivered(data).await,
            ClientEvent::SubscriptionError { subscription_id, error } => {
                self.on_subscription_error(subscription_id, error).await;
                Ok(())
            }
            ClientEvent::OutboundStarted => {
                self.trigger_snapshot();
                self.push_pending().await
            }
            ClientEvent::Error(e) => Err(e),
            ClientEvent::Disconnected => {
                if !self.shutting_down() {
                    info!("connection lost");
                    self.connection_lost();
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            self.handle_error(e);
        }
    }

    async fn on_transaction(&self, transaction: crate::types::Transaction) -> Result<()> {
        let stamped = self
            .applier
            .apply_transaction(&self.client_id(), &transaction)
            .await?;
        if !stamped.is_empty() {
            notify_local_changes(self.applier.notifier.as_ref(), &stamped);
            if self.client.outbound_status() == ReplicationStatus::Active {
                self.push_pending().await?;
            }
        }
        self.client
            .transaction_applied(transaction.lsn, transaction.id)
            .await
    }

    async fn on_gone_batch(
        &self,
        lsn: Lsn,
        subscription_ids: Vec<String>,
        changes: Vec<crate::types::DataChange>,
    ) -> Result<()> {
        self.applier.apply_gone_batch(&lsn, &subscription_ids, &changes).await?;
        {
            let mut shapes = self.shapes.lock().await;
            shapes.gone_batch_delivered(&subscription_ids);
            self.persist_shapes(&shapes).await?;
        }
        self.client.gone_batch_applied(subscription_ids).await
    }

    async fn on_subscription_delivered(&self, data: crate::shapes::SubscriptionData) -> Result<()> {
        if let Err(e) = self.applier.apply_subscription_data(&data).await {
            self.resolve_waiters(&data.subscription_id, Err(&e));
            self.shapes.lock().await.subscription_cancelled(&data.subscription_id);
            return Err(e);
        }
        {
            let mut shapes = self.shapes.lock().await;
            shapes.subscription_delivered(&data);
            self.persist_shapes(&shapes).await?;
        }
        self.resolve_waiters(&data.subscription_id, Ok(()));
        self.client
            .subscription_applied(&data.subscription_id, data.lsn)
            .await
    }

    async fn on_subscription_error(&self, subscription_id: Option<String>, error: SyncError) {
        metrics::record_subscription_error(error.code().as_str());
        match subscription_id {
            Some(id) => {
                warn!(subscription_id = %id, error = %error, "subscription failed");
                self.shapes.lock().await.subscription_cancelled(&id);
                self.resolve_waiters(&id, Err(&error));
            }
            None => warn!(error = %error, "subscription error without subscription id"),
        }
    }

    fn handle_error(self: &Arc<Self>, e: SyncError) {
        metrics::record_error(e.code().as_str());
        if matches!(e, SyncError::Shutdown) || self.shutting_down() {
            return;
        }
        if e.is_fatal() {
            let wrapped = e.wrap_fatal();
            self.fail(&wrapped);
            self.connection_closed_for_good();
        } else if e.is_retryable() {
            warn!(code = %e.code(), error = %e, "connection error, reconnecting");
            self.connection_lost();
        } else {
            self.fail(&e);
            self.connection_closed_for_good();
        }
    }

    fn connection_lost(self: &Arc<Self>) {
        self.set_connectivity(ConnectivityState::Disconnected);
        self.cancel_waiters();
        self.spawn_reconnect();
    }

    fn connection_closed_for_good(self: &Arc<Self>) {
        self.set_connectivity(ConnectivityState::Disconnected);
        self.cancel_waiters();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.close().await {
                debug!(error = %e, "error closing connection");
            }
        });
    }

    // ─── subscriptions ──────────────────────────────────────────────────────

    fn resolve_waiters(&self, subscription_id: &str, result: std::result::Result<(), &SyncError>) {
        let Some((_, waiters)) = self.waiters.remove(subscription_id) else {
            return;
        };
        for waiter in waiters {
            let outcome = match result {
                Ok(()) => Ok(()),
                Err(e) => Err(SyncError::new(e.code(), e.to_string())),
            };
            let _ = waiter.send(outcome);
        }
    }

    /// In-flight subscriptions do not survive the connection.
    fn cancel_waiters(&self) {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        let error = SyncError::new(
            ErrorCode::ConnectionCancelledByDisconnect,
            "connection closed before the subscription was delivered",
        );
        for id in &ids {
            self.resolve_waiters(id, Err(&error));
        }
        if let Ok(mut shapes) = self.shapes.try_lock() {
            for id in &ids {
                shapes.subscription_cancelled(id);
            }
        }
    }

    fn add_waiter(&self, subscription_id: &str) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(subscription_id.to_string()).or_default().push(tx);
        rx
    }

    async fn subscribe(&self, shapes: Vec<Shape>) -> Result<ShapeSubscription> {
        let subscription_id = Uuid::new_v4().to_string();
        let requests: Vec<ShapeRequest> = shapes
            .into_iter()
            .map(|definition| ShapeRequest {
                request_id: Uuid::new_v4().to_string(),
                definition,
            })
            .collect();
        let definitions: Vec<Shape> = requests.iter().map(|r| r.definition.clone()).collect();

        let synced = {
            let mut manager = self.shapes.lock().await;
            match manager.get_duplicating_subscription(&definitions) {
                Some(DuplicateSubscription::Fulfilled(id)) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = tx.send(Ok(()));
                    return Ok(ShapeSubscription { id, synced: rx });
                }
                Some(DuplicateSubscription::InFlight(id)) => {
                    let synced = self.add_waiter(&id);
                    return Ok(ShapeSubscription { id, synced });
                }
                None => {}
            }
            manager.subscription_requested(&subscription_id, requests.clone())?;
            self.add_waiter(&subscription_id)
        };

        info!(subscription_id = %subscription_id, shapes = requests.len(), "subscribing");
        if let Err(e) = self.client.subscribe(&subscription_id, &requests).await {
            self.shapes.lock().await.subscription_cancelled(&subscription_id);
            self.waiters.remove(&subscription_id);
            return Err(e);
        }
        Ok(ShapeSubscription {
            id: subscription_id,
            synced,
        })
    }

    async fn unsubscribe(&self, subscription_ids: Vec<String>) -> Result<()> {
        self.client.unsubscribe(subscription_ids.clone()).await?;
        let mut shapes = self.shapes.lock().await;
        shapes.unsubscribe(&subscription_ids).await?;
        self.persist_shapes(&shapes).await
    }

    async fn persist_shapes(&self, shapes: &ShapeManager) -> Result<()> {
        self.applier.meta.set(MetaKey::Subscriptions, shapes.serialize()?).await
    }

    #[instrument(skip(self))]
    async fn reset_client_state(&self, keep_subscribed_shapes: bool) -> Result<Vec<ShapeDefinition>> {
        let mut shapes = self.shapes.lock().await;
        let tables = shapes.subscribed_tables();
        let kept = shapes.reset();

        let meta = &self.applier.meta;
        let extra = vec![
            meta.set_statement(MetaKey::Lsn, ""),
            meta.set_statement(MetaKey::Subscriptions, shapes.serialize()?),
            meta.set_statement(MetaKey::SeenAdditionalData, ""),
            meta.set_statement(MetaKey::SeenGoneBatch, ""),
        ];
        self.applier.clear_tables(&tables, extra).await?;
        meta.invalidate().await;

        info!(tables = ?tables, shapes = kept.len(), keep_subscribed_shapes, "client state reset");
        if keep_subscribed_shapes {
            self.resubscribe.lock().extend(kept.iter().cloned());
        }
        Ok(kept)
    }
}

/// Oplog row id encoded in an outbound LSN.
fn lsn_to_rowid(lsn: &Lsn) -> Option<i64> {
    if lsn.is_empty() {
        None
    } else {
        Some(i64::try_from(lsn.as_number()).unwrap_or(i64::MAX))
    }
}
