// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication protocol client.
//!
//! One [`SatelliteClient`] owns one transport connection and runs the two
//! replication directions over it:
//!
//! ```text
//! inbound   STOPPED ─start_replication()─► STARTING ─ok─► ACTIVE ─stop_replication()─► STOPPING ─ok─► STOPPED
//! outbound  STOPPED ─server startReplication─► ACTIVE ─server stopReplication / disconnect─► STOPPED
//! ```
//!
//! # Tasks
//!
//! `connect()` spawns three tasks:
//! - **reader**: decodes frames; RPC responses are routed straight to the
//!   pending call, everything else is queued in arrival order
//! - **handler**: processes queued messages one at a time under the
//!   incoming-message lock
//! - **ack timer**: flushes pending acknowledgements every `ack_period`
//!
//! Because RPC responses bypass the handler, an exclusive call (currently
//! `subscribe`) can hold the incoming lock while it waits for its response
//! without stalling its own reply.
//!
//! Everything the coordinator must act on is delivered as a [`ClientEvent`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::ack::AckWindow;
use super::codec;
use super::messages::*;
use super::row::{deserialize_row, serialize_row, ValueCodec};
use super::rpc::{methods, LoggedRpc, RpcClient, RpcService};
use super::transport::{Transport, TransportEvent};
use crate::config::ClientConfig;
use crate::error::{ErrorCode, Result, SyncError};
use crate::resilience::Throttle;
use crate::shapes::{ShapeRequest, SubscriptionData, SubscriptionDataCache};
use crate::types::{
    AdditionalData, Change, DataChange, DataChangeType, DataTransaction, ForeignKey, Lsn,
    MigrationColumn, MigrationTable, MigrationType, Record, Relation, RelationColumn,
    SchemaChange, TableType, Transaction,
};

/// Incoming message queue depth between the reader and the handler.
const INCOMING_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Stopped,
    Starting,
    Active,
    Stopping,
}

impl ReplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client hands to the coordinator.
#[derive(Debug)]
pub enum ClientEvent {
    Transaction(Transaction),
    AdditionalData(AdditionalData),
    /// Rows of unsubscribed shapes the server no longer sends.
    GoneBatch {
        lsn: Lsn,
        subscription_ids: Vec<String>,
        changes: Vec<DataChange>,
    },
    Relation(Relation),
    SubscriptionDelivered(SubscriptionData),
    SubscriptionError {
        subscription_id: Option<String>,
        error: SyncError,
    },
    /// The server started pulling our transactions.
    OutboundStarted,
    Error(SyncError),
    Disconnected,
}

#[derive(Debug)]
struct Inbound {
    status: ReplicationStatus,
    relations: HashMap<u32, Relation>,
    incomplete: Option<Transaction>,
    additional: Option<AdditionalData>,
    last_acked_lsn: Lsn,
}

impl Inbound {
    fn new() -> Self {
        Self {
            status: ReplicationStatus::Stopped,
            relations: HashMap::new(),
            incomplete: None,
            additional: None,
            last_acked_lsn: Lsn::default(),
        }
    }

    /// The server did not confirm the stop, so the stream is still running.
    /// A disconnect in the meantime already moved us to `Stopped`.
    fn restore_active_after_failed_stop(&mut self) {
        if self.status == ReplicationStatus::Stopping {
            self.status = ReplicationStatus::Active;
        }
    }
}

struct Outbound {
    status: ReplicationStatus,
    enqueued_lsn: Lsn,
    /// Relation id to the shape last announced for it.
    relations_sent: HashMap<u32, Relation>,
    queue: VecDeque<DataTransaction>,
    throttle: Option<Throttle>,
}

impl Outbound {
    fn stop(&mut self) {
        self.status = ReplicationStatus::Stopped;
        self.relations_sent.clear();
        self.queue.clear();
        if let Some(throttle) = self.throttle.take() {
            throttle.cancel();
        }
    }
}

struct ClientInner {
    self_ref: Weak<ClientInner>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    codec: Arc<dyn ValueCodec>,
    rpc: LoggedRpc<RpcClient>,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    subscriptions: Mutex<SubscriptionDataCache>,
    ack: Mutex<AckWindow>,
    /// Held while a message is handled, and by exclusive calls.
    incoming_lock: tokio::sync::Mutex<()>,
    /// Ids passed to `unsubscribe` whose rows have not been reported gone.
    pending_gone: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the replication connection. Cheap to clone.
#[derive(Clone)]
pub struct SatelliteClient {
    inner: Arc<ClientInner>,
}

fn relation_from_wire(rel: SatRelation) -> Relation {
    Relation {
        id: rel.relation_id,
        schema: rel.schema_name,
        table: rel.table_name,
        table_type: TableType::Table,
        columns: rel
            .columns
            .into_iter()
            .map(|c| RelationColumn {
                name: c.name,
                type_name: c.type_name,
                is_nullable: c.is_nullable,
                primary_key: c.primary_key,
            })
            .collect(),
    }
}

fn relation_to_wire(rel: &Relation) -> SatRelation {
    SatRelation {
        schema_name: rel.schema.clone(),
        table_name: rel.table.clone(),
        relation_id: rel.id,
        columns: rel
            .columns
            .iter()
            .map(|c| SatRelationColumn {
                name: c.name.clone(),
                type_name: c.type_name.clone(),
                primary_key: c.primary_key,
                is_nullable: c.is_nullable,
            })
            .collect(),
    }
}

fn migration_table_from_wire(table: SatMigrationTable) -> MigrationTable {
    MigrationTable {
        name: table.name,
        columns: table
            .columns
            .into_iter()
            .map(|c| MigrationColumn {
                name: c.name,
                sqlite_type: c.sqlite_type,
                pg_type: c.pg_type,
            })
            .collect(),
        fks: table
            .fks
            .into_iter()
            .map(|fk| ForeignKey {
                fk_cols: fk.fk_cols,
                pk_table: fk.pk_table,
                pk_cols: fk.pk_cols,
            })
            .collect(),
        pks: table.pks,
    }
}

fn migration_type(op: MigrationOpType) -> MigrationType {
    match op {
        MigrationOpType::CreateTable => MigrationType::CreateTable,
        MigrationOpType::CreateIndex => MigrationType::CreateIndex,
        MigrationOpType::AlterAddColumn => MigrationType::AlterAddColumn,
    }
}

fn unexpected_response(method: &str, got: &SatMessage) -> SyncError {
    SyncError::new(
        ErrorCode::UnexpectedMessageType,
        format!("unexpected {} in response to {method}", got.name()),
    )
}

fn not_started(what: &str) -> SyncError {
    SyncError::new(
        ErrorCode::ReplicationNotStarted,
        format!("cannot {what}: replication is not active"),
    )
}

impl SatelliteClient {
    /// Create a client and the stream its events arrive on.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        codec: Arc<dyn ValueCodec>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let rpc = LoggedRpc::new(RpcClient::new(Arc::clone(&transport), config.rpc_timeout()));
        let ack = AckWindow::new(config.max_unacked_txs, config.ack_threshold_percent);

        let inner = Arc::new_cyclic(|self_ref| ClientInner {
            self_ref: self_ref.clone(),
            transport,
            config,
            codec,
            rpc,
            inbound: Mutex::new(Inbound::new()),
            outbound: Mutex::new(Outbound {
                status: ReplicationStatus::Stopped,
                enqueued_lsn: Lsn::default(),
                relations_sent: HashMap::new(),
                queue: VecDeque::new(),
                throttle: None,
            }),
            subscriptions: Mutex::new(SubscriptionDataCache::new()),
            ack: Mutex::new(ack),
            incoming_lock: tokio::sync::Mutex::new(()),
            pending_gone: Mutex::new(Vec::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        (Self { inner }, events_rx)
    }

    // ─── connection ─────────────────────────────────────────────────────────

    /// Open the transport and start the background tasks.
    pub async fn connect(&self) -> Result<()> {
        let url = self.inner.config.url();
        info!(%url, "connecting to sync server");
        let stale: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in stale {
            task.abort();
        }
        let transport_rx = self.inner.transport.connect(&url).await?;

        let (msg_tx, msg_rx) = mpsc::channel(INCOMING_QUEUE);
        let reader = tokio::spawn(
            Arc::clone(&self.inner)
                .read_loop(transport_rx, msg_tx)
                .instrument(tracing::info_span!("satellite_reader")),
        );
        let handler = tokio::spawn(
            Arc::clone(&self.inner)
                .handle_loop(msg_rx)
                .instrument(tracing::info_span!("satellite_handler")),
        );
        let ack_timer = tokio::spawn(ack_timer_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.ack_period_duration(),
        ));

        let mut tasks = self.inner.tasks.lock();
        tasks.extend([reader, handler, ack_timer]);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Close the connection and reset both directions. The outbound
    /// enqueued LSN survives so a reconnect resumes where it left off.
    pub async fn close(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let result = self.inner.transport.close().await;
        self.inner.reset_connection_state();
        result
    }

    // ─── RPC calls ──────────────────────────────────────────────────────────

    pub async fn authenticate(&self, client_id: &str, token: &str) -> Result<SatAuthResp> {
        let request = SatMessage::AuthReq(SatAuthReq {
            id: client_id.to_string(),
            token: token.to_string(),
            headers: Vec::new(),
        });
        match self.inner.rpc.request(methods::AUTHENTICATE, request).await? {
            SatMessage::AuthResp(resp) => {
                info!(server_id = %resp.id, "authenticated");
                Ok(resp)
            }
            other => Err(unexpected_response(methods::AUTHENTICATE, &other)),
        }
    }

    /// Ask the server to stream transactions after `lsn`.
    pub async fn start_replication(
        &self,
        lsn: Lsn,
        schema_version: Option<String>,
        subscription_ids: Vec<String>,
        observed_additional_data: Vec<u64>,
    ) -> Result<()> {
        {
            let mut inbound = self.inner.inbound.lock();
            if inbound.status != ReplicationStatus::Stopped {
                return Err(SyncError::new(
                    ErrorCode::ReplicationAlreadyStarted,
                    format!("replication is {}", inbound.status),
                ));
            }
            if lsn.is_empty() && !subscription_ids.is_empty() {
                return Err(SyncError::new(
                    ErrorCode::UnexpectedSubscriptionState,
                    "cannot resume subscriptions without an LSN",
                ));
            }
            inbound.status = ReplicationStatus::Starting;
        }

        info!(lsn = %lsn.to_base64(), subscriptions = subscription_ids.len(), "starting replication");
        let request = SatMessage::InStartReplicationReq(SatInStartReplicationReq {
            lsn: lsn.as_bytes().to_vec(),
            subscription_ids,
            schema_version,
            observed_transaction_data: observed_additional_data,
        });
        let response = self.inner.rpc.request(methods::START_REPLICATION, request).await;

        let mut inbound = self.inner.inbound.lock();
        let resp = match response {
            Ok(SatMessage::InStartReplicationResp(resp)) => resp,
            Ok(other) => {
                inbound.status = ReplicationStatus::Stopped;
                return Err(unexpected_response(methods::START_REPLICATION, &other));
            }
            Err(e) => {
                inbound.status = ReplicationStatus::Stopped;
                return Err(e);
            }
        };
        if inbound.status != ReplicationStatus::Starting {
            return Err(SyncError::new(
                ErrorCode::UnexpectedState,
                format!("start replication response while {}", inbound.status),
            ));
        }
        if let Some(err) = resp.err {
            inbound.status = ReplicationStatus::Stopped;
            return Err(err.into_error());
        }

        inbound.status = ReplicationStatus::Active;
        inbound.last_acked_lsn = lsn;
        if let Some(window) = resp.unacked_window_size.filter(|w| *w > 0) {
            self.inner.ack.lock().set_max_unacked(window);
        }
        info!("inbound replication active");
        Ok(())
    }

    pub async fn stop_replication(&self) -> Result<()> {
        {
            let mut inbound = self.inner.inbound.lock();
            if inbound.status != ReplicationStatus::Active {
                return Err(not_started("stop replication"));
            }
            inbound.status = ReplicationStatus::Stopping;
        }

        let response = self
            .inner
            .rpc
            .request(methods::STOP_REPLICATION, SatMessage::InStopReplicationReq)
            .await;

        let mut inbound = self.inner.inbound.lock();
        match response {
            Ok(SatMessage::InStopReplicationResp) => {
                if inbound.status != ReplicationStatus::Stopping {
                    return Err(SyncError::new(
                        ErrorCode::UnexpectedState,
                        format!("stop replication response while {}", inbound.status),
                    ));
                }
                inbound.status = ReplicationStatus::Stopped;
                info!("inbound replication stopped");
                Ok(())
            }
            Ok(other) => {
                inbound.restore_active_after_failed_stop();
                Err(unexpected_response(methods::STOP_REPLICATION, &other))
            }
            Err(e) => {
                inbound.restore_active_after_failed_stop();
                Err(e)
            }
        }
    }

    /// Request shapes. Returns once the server accepted the request; the
    /// data follows as [`ClientEvent::SubscriptionDelivered`].
    pub async fn subscribe(&self, subscription_id: &str, requests: &[ShapeRequest]) -> Result<String> {
        if self.inbound_status() != ReplicationStatus::Active {
            return Err(not_started("subscribe"));
        }

        let request = SatSubsReq {
            subscription_id: subscription_id.to_string(),
            shape_requests: requests.iter().map(ShapeRequest::to_wire).collect(),
        };

        // Exclusive: no other incoming message is handled until the
        // response is registered with the delivery cache.
        let _guard = self.inner.incoming_lock.lock().await;
        self.inner.subscriptions.lock().subscription_request(&request);

        let response = self
            .inner
            .rpc
            .request(methods::SUBSCRIBE, SatMessage::SubsReq(request))
            .await;

        let mut cache = self.inner.subscriptions.lock();
        match response {
            Ok(SatMessage::SubsResp(resp)) => {
                if let Some(err) = resp.err {
                    cache.reset(subscription_id);
                    return Err(err.into_error());
                }
                cache.subscription_response(&resp)?;
                debug!(subscription_id, "subscription accepted");
                Ok(resp.subscription_id)
            }
            Ok(other) => {
                cache.reset(subscription_id);
                Err(unexpected_response(methods::SUBSCRIBE, &other))
            }
            Err(e) => {
                cache.reset(subscription_id);
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&self, subscription_ids: Vec<String>) -> Result<()> {
        if self.inbound_status() != ReplicationStatus::Active {
            return Err(not_started("unsubscribe"));
        }
        let request = SatMessage::UnsubsReq(SatUnsubsReq {
            subscription_ids: subscription_ids.clone(),
        });
        match self.inner.rpc.request(methods::UNSUBSCRIBE, request).await? {
            SatMessage::UnsubsResp => {
                self.inner.pending_gone.lock().extend(subscription_ids);
                Ok(())
            }
            other => Err(unexpected_response(methods::UNSUBSCRIBE, &other)),
        }
    }

    // ─── outbound ───────────────────────────────────────────────────────────

    /// Queue a local transaction for the server.
    pub fn enqueue_transaction(&self, transaction: DataTransaction) -> Result<()> {
        let mut outbound = self.inner.outbound.lock();
        if outbound.status != ReplicationStatus::Active {
            return Err(not_started("enqueue transaction"));
        }
        outbound.enqueued_lsn = transaction.lsn.clone();
        outbound.queue.push_back(transaction);
        if let Some(throttle) = &outbound.throttle {
            throttle.trigger();
        }
        Ok(())
    }

    /// LSN of the last transaction handed to the outbound queue.
    pub fn enqueued_lsn(&self) -> Lsn {
        self.inner.outbound.lock().enqueued_lsn.clone()
    }

    pub fn inbound_status(&self) -> ReplicationStatus {
        self.inner.inbound.lock().status
    }

    pub fn outbound_status(&self) -> ReplicationStatus {
        self.inner.outbound.lock().status
    }

    /// Relations announced by the server on this connection.
    pub fn relations(&self) -> Vec<Relation> {
        let mut relations: Vec<Relation> = self.inner.inbound.lock().relations.values().cloned().collect();
        relations.sort_by_key(|r| r.id);
        relations
    }

    // ─── apply feedback ─────────────────────────────────────────────────────

    pub async fn transaction_applied(&self, lsn: Lsn, transaction_id: Option<u64>) -> Result<()> {
        let ack = self.inner.ack.lock().transaction_applied(lsn, transaction_id);
        self.inner.send_ack(ack, "window").await
    }

    pub async fn additional_data_applied(&self, reference: u64) -> Result<()> {
        let ack = self.inner.ack.lock().additional_data_applied(reference);
        self.inner.send_ack(ack, "additional_data").await
    }

    pub async fn subscription_applied(&self, subscription_id: &str, lsn: Lsn) -> Result<()> {
        let ack = self
            .inner
            .ack
            .lock()
            .subscription_data_applied(subscription_id.to_string(), lsn);
        self.inner.send_ack(ack, "subscription").await
    }

    pub async fn gone_batch_applied(&self, subscription_ids: Vec<String>) -> Result<()> {
        let ack = self.inner.ack.lock().gone_batch_applied(subscription_ids);
        self.inner.send_ack(ack, "gone_batch").await
    }
}

async fn ack_timer_loop(client: Weak<ClientInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = client.upgrade() else { break };
        let active = inner.inbound.lock().status == ReplicationStatus::Active;
        if !active {
            continue;
        }
        let ack = inner.ack.lock().timer_fired();
        if let Err(e) = inner.send_ack(ack, "timer").await {
            warn!(error = %e, "failed to send ack");
        }
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("client event dropped, no listener");
        }
    }

    async fn send(&self, message: &SatMessage) -> Result<()> {
        debug!(message = message.name(), "sending");
        self.transport.send(codec::encode(message)).await
    }

    async fn send_ack(&self, ack: Option<SatOpLogAck>, reason: &str) -> Result<()> {
        let Some(ack) = ack else { return Ok(()) };
        if !self.transport.is_connected() {
            debug!(reason, "not connected, ack dropped");
            return Ok(());
        }
        let lsn = Lsn::new(ack.lsn.clone());
        debug!(reason, transaction_id = ack.transaction_id, "sending ack");
        self.send(&SatMessage::OpLogAck(ack)).await?;
        self.inbound.lock().last_acked_lsn = lsn;
        crate::metrics::record_ack_sent(reason);
        Ok(())
    }

    fn reset_connection_state(&self) {
        self.rpc.inner().cancel_all();
        {
            let mut inbound = self.inbound.lock();
            let last_acked = std::mem::take(&mut inbound.last_acked_lsn);
            *inbound = Inbound::new();
            inbound.last_acked_lsn = last_acked;
        }
        self.outbound.lock().stop();
        *self.subscriptions.lock() = SubscriptionDataCache::new();
        self.ack.lock().reset();
    }

    // ─── tasks ──────────────────────────────────────────────────────────────

    async fn read_loop(
        self: Arc<Self>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        msg_tx: mpsc::Sender<SatMessage>,
    ) {
        loop {
            let event = transport_rx.recv().await;
            match event {
                Some(TransportEvent::Message(frame)) => match codec::decode(&frame) {
                    Ok(SatMessage::RpcResponse(resp)) => self.rpc.inner().handle_response(resp),
                    Ok(message) => {
                        if msg_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable frame");
                        crate::metrics::record_error(e.code().as_str());
                        self.emit(ClientEvent::Error(e));
                    }
                },
                Some(TransportEvent::Error(e)) => {
                    warn!(error = %e, "transport error");
                    self.on_disconnect(Some(e));
                    break;
                }
                Some(TransportEvent::Closed) | None => {
                    info!("transport closed");
                    self.on_disconnect(None);
                    break;
                }
            }
        }
    }

    fn on_disconnect(&self, error: Option<SyncError>) {
        self.reset_connection_state();
        if let Some(e) = error {
            self.emit(ClientEvent::Error(SyncError::new(ErrorCode::SocketError, e.to_string())));
        }
        self.emit(ClientEvent::Disconnected);
    }

    async fn handle_loop(self: Arc<Self>, mut msg_rx: mpsc::Receiver<SatMessage>) {
        while let Some(message) = msg_rx.recv().await {
            let _guard = self.incoming_lock.lock().await;
            self.handle_message(message).await;
        }
    }

    async fn handle_message(&self, message: SatMessage) {
        debug!(message = message.name(), "received");
        match message {
            SatMessage::ErrorResp(err) => self.emit(ClientEvent::Error(err.into_error())),
            SatMessage::PingReq => {
                let lsn = self.inbound.lock().last_acked_lsn.clone();
                let resp = SatPingResp {
                    lsn: (!lsn.is_empty()).then(|| lsn.as_bytes().to_vec()),
                };
                if let Err(e) = self.send(&SatMessage::PingResp(resp)).await {
                    warn!(error = %e, "failed to answer ping");
                }
            }
            SatMessage::PingResp(_) => debug!("pong"),
            SatMessage::Relation(rel) => self.handle_relation(rel),
            SatMessage::OpLog(oplog) => self.handle_oplog(oplog.ops),
            SatMessage::MigrationNotification(n) => info!(
                from = %n.old_schema_version,
                to = %n.new_schema_version,
                "server schema migrated"
            ),
            SatMessage::SubsDataBegin(begin) => {
                let result = self.subscriptions.lock().subscription_data_begin(&begin);
                if let Err(e) = result {
                    self.subscription_failed(Some(begin.subscription_id), e);
                }
            }
            SatMessage::ShapeDataBegin(begin) => self.delivery_step(|c| c.shape_data_begin(&begin)),
            SatMessage::ShapeDataEnd => self.delivery_step(SubscriptionDataCache::shape_data_end),
            SatMessage::SubsDataEnd => {
                let relations = self.inbound.lock().relations.clone();
                let (delivering, result) = {
                    let mut cache = self.subscriptions.lock();
                    let delivering = cache.delivering_subscription().map(str::to_string);
                    (delivering, cache.subscription_data_end(&relations, self.codec.as_ref()))
                };
                match result {
                    Ok(data) => {
                        info!(subscription_id = %data.subscription_id, rows = data.data.len(), "subscription delivered");
                        self.emit(ClientEvent::SubscriptionDelivered(data));
                    }
                    Err(e) => self.subscription_failed(delivering, e),
                }
            }
            SatMessage::SubsDataError(err) => {
                let subscription_id = err.subscription_id.clone();
                let error = self.subscriptions.lock().subscription_data_error(err);
                self.subscription_failed(Some(subscription_id), error);
            }
            SatMessage::RpcRequest(request) => self.handle_server_rpc(request).await,
            other => {
                let e = SyncError::new(
                    ErrorCode::UnexpectedMessageType,
                    format!("unexpected {} outside of a call", other.name()),
                );
                warn!(error = %e, "dropping message");
                self.emit(ClientEvent::Error(e));
            }
        }
    }

    fn delivery_step(&self, step: impl FnOnce(&mut SubscriptionDataCache) -> Result<()>) {
        let (delivering, result) = {
            let mut cache = self.subscriptions.lock();
            let delivering = cache.delivering_subscription().map(str::to_string);
            (delivering, step(&mut cache))
        };
        if let Err(e) = result {
            self.subscription_failed(delivering, e);
        }
    }

    fn subscription_failed(&self, subscription_id: Option<String>, error: SyncError) {
        warn!(subscription_id = ?subscription_id, error = %error, "subscription failed");
        self.emit(ClientEvent::SubscriptionError { subscription_id, error });
    }

    fn handle_relation(&self, rel: SatRelation) {
        let mut inbound = self.inbound.lock();
        if inbound.status != ReplicationStatus::Active {
            drop(inbound);
            self.emit(ClientEvent::Error(SyncError::new(
                ErrorCode::UnexpectedState,
                format!("relation {} received while inbound replication is not active", rel.table_name),
            )));
            return;
        }
        let relation = relation_from_wire(rel);
        debug!(id = relation.id, table = %relation.table, "relation");
        inbound.relations.insert(relation.id, relation.clone());
        drop(inbound);
        self.emit(ClientEvent::Relation(relation));
    }

    // ─── inbound transactions ───────────────────────────────────────────────

    fn handle_oplog(&self, ops: Vec<SatTransOp>) {
        {
            let mut cache = self.subscriptions.lock();
            if cache.is_delivering() {
                let id = cache.delivering_subscription().map(str::to_string);
                let result = cache.transaction(ops);
                drop(cache);
                if let Err(e) = result {
                    self.subscription_failed(id, e);
                }
                return;
            }
        }

        let mut inbound = self.inbound.lock();
        let mut events = Vec::new();
        let result = ops
            .into_iter()
            .try_for_each(|op| self.process_op(&mut inbound, op, &mut events));
        if result.is_err() {
            inbound.incomplete = None;
            inbound.additional = None;
        }
        drop(inbound);

        for event in events {
            self.emit(event);
        }
        if let Err(e) = result {
            warn!(error = %e, "invalid transaction stream");
            crate::metrics::record_error(e.code().as_str());
            self.emit(ClientEvent::Error(e));
        }
    }

    fn relation<'a>(inbound: &'a Inbound, relation_id: u32) -> Result<&'a Relation> {
        inbound.relations.get(&relation_id).ok_or_else(|| {
            SyncError::protocol_violation(format!("operation references unknown relation id {relation_id}"))
        })
    }

    fn decode_row(&self, row: &SatOpRow, relation: &Relation) -> Result<Record> {
        deserialize_row(row, relation, self.codec.as_ref())
    }

    fn process_op(&self, inbound: &mut Inbound, op: SatTransOp, events: &mut Vec<ClientEvent>) -> Result<()> {
        let change = match op {
            SatTransOp::Begin(begin) => {
                if inbound.incomplete.is_some() {
                    return Err(SyncError::protocol_violation("begin inside an open transaction"));
                }
                inbound.incomplete = Some(Transaction {
                    commit_timestamp: begin.commit_timestamp,
                    lsn: Lsn::new(begin.lsn),
                    origin: begin.origin,
                    id: begin.transaction_id,
                    ..Default::default()
                });
                return Ok(());
            }
            SatTransOp::Commit(_) => {
                let tx = inbound
                    .incomplete
                    .take()
                    .ok_or_else(|| SyncError::protocol_violation("commit without begin"))?;
                events.push(self.finish_transaction(tx));
                return Ok(());
            }
            SatTransOp::AdditionalBegin { reference } => {
                if inbound.additional.is_some() {
                    return Err(SyncError::protocol_violation("nested additional data"));
                }
                inbound.additional = Some(AdditionalData {
                    reference,
                    changes: Vec::new(),
                });
                return Ok(());
            }
            SatTransOp::AdditionalCommit { reference } => {
                let data = inbound
                    .additional
                    .take()
                    .ok_or_else(|| SyncError::protocol_violation("additional commit without begin"))?;
                if data.reference != reference {
                    return Err(SyncError::protocol_violation(format!(
                        "additional commit {reference} closes batch {}",
                        data.reference
                    )));
                }
                events.push(ClientEvent::AdditionalData(data));
                return Ok(());
            }
            SatTransOp::Migrate(migrate) => {
                let tx = inbound
                    .incomplete
                    .as_mut()
                    .ok_or_else(|| SyncError::protocol_violation("migration outside a transaction"))?;
                let table = migrate.table.ok_or_else(|| {
                    SyncError::protocol_violation(format!("migration {} carries no table", migrate.version))
                })?;
                let table = migration_table_from_wire(table);
                for stmt in migrate.stmts {
                    tx.changes.push(Change::Schema(SchemaChange {
                        table: table.clone(),
                        migration_type: migration_type(stmt.op_type),
                        sql: stmt.sql,
                    }));
                }
                tx.migration_version = Some(migrate.version);
                return Ok(());
            }
            SatTransOp::Insert(insert) => {
                let relation = Self::relation(inbound, insert.relation_id)?;
                DataChange {
                    relation: relation.clone(),
                    change_type: DataChangeType::Insert,
                    record: Some(self.decode_row(&insert.row_data, relation)?),
                    old_record: None,
                    tags: insert.tags,
                }
            }
            SatTransOp::Update(update) => {
                let relation = Self::relation(inbound, update.relation_id)?;
                DataChange {
                    relation: relation.clone(),
                    change_type: DataChangeType::Update,
                    record: Some(self.decode_row(&update.row_data, relation)?),
                    old_record: update
                        .old_row_data
                        .as_ref()
                        .map(|row| self.decode_row(row, relation))
                        .transpose()?,
                    tags: update.tags,
                }
            }
            SatTransOp::Delete(delete) => {
                let relation = Self::relation(inbound, delete.relation_id)?;
                DataChange {
                    relation: relation.clone(),
                    change_type: DataChangeType::Delete,
                    record: None,
                    old_record: delete
                        .old_row_data
                        .as_ref()
                        .map(|row| self.decode_row(row, relation))
                        .transpose()?,
                    tags: delete.tags,
                }
            }
            SatTransOp::Gone(gone) => {
                let relation = Self::relation(inbound, gone.relation_id)?;
                let full = self.decode_row(&gone.pk_data, relation)?;
                let pk = relation.primary_key_columns();
                let record: Record = full
                    .into_iter()
                    .filter(|(column, _)| pk.contains(&column.as_str()))
                    .collect();
                DataChange {
                    relation: relation.clone(),
                    change_type: DataChangeType::Gone,
                    record: Some(record),
                    old_record: None,
                    tags: Vec::new(),
                }
            }
        };

        if let Some(tx) = inbound.incomplete.as_mut() {
            tx.changes.push(Change::Data(change));
            Ok(())
        } else if let Some(data) = inbound.additional.as_mut() {
            if change.change_type != DataChangeType::Insert {
                return Err(SyncError::new(
                    ErrorCode::UnexpectedMessageType,
                    format!("{} inside additional data", change.change_type.as_str()),
                ));
            }
            data.changes.push(change);
            Ok(())
        } else {
            Err(SyncError::protocol_violation("row operation outside a transaction"))
        }
    }

    fn finish_transaction(&self, tx: Transaction) -> ClientEvent {
        let gone_only = !tx.changes.is_empty()
            && tx
                .changes
                .iter()
                .all(|c| matches!(c, Change::Data(d) if d.change_type == DataChangeType::Gone));
        if !gone_only {
            debug!(lsn = %tx.lsn.to_base64(), changes = tx.changes.len(), "transaction received");
            return ClientEvent::Transaction(tx);
        }

        let subscription_ids = std::mem::take(&mut *self.pending_gone.lock());
        let changes = tx
            .changes
            .into_iter()
            .filter_map(|c| match c {
                Change::Data(d) => Some(d),
                Change::Schema(_) => None,
            })
            .collect();
        ClientEvent::GoneBatch {
            lsn: tx.lsn,
            subscription_ids,
            changes,
        }
    }

    // ─── server-initiated calls ─────────────────────────────────────────────

    async fn handle_server_rpc(&self, request: SatRpcRequest) {
        let result = match request.method.as_str() {
            methods::START_REPLICATION => self.handle_outbound_start(&request).await,
            methods::STOP_REPLICATION => self.handle_outbound_stop(&request).await,
            other => {
                warn!(method = other, "unknown server RPC method");
                self.rpc
                    .inner()
                    .respond_error(
                        &request,
                        SatErrorResp::new(ErrorRespCode::InvalidRequest, format!("unknown method {other}")),
                    )
                    .await
            }
        };
        if let Err(e) = result {
            warn!(method = %request.method, error = %e, "failed to answer server call");
        }
    }

    async fn handle_outbound_start(&self, request: &SatRpcRequest) -> Result<()> {
        let lsn = match codec::decode(&request.message)? {
            SatMessage::InStartReplicationReq(req) => Lsn::new(req.lsn),
            other => return Err(unexpected_response(methods::START_REPLICATION, &other)),
        };

        let started = {
            let mut outbound = self.outbound.lock();
            if outbound.status == ReplicationStatus::Stopped {
                outbound.status = ReplicationStatus::Active;
                outbound.enqueued_lsn = lsn.clone();
                outbound.throttle = Some(self.push_throttle());
                true
            } else {
                false
            }
        };

        if !started {
            return self
                .rpc
                .inner()
                .respond_error(
                    request,
                    SatErrorResp::new(ErrorRespCode::ReplicationFailed, "outbound replication already active"),
                )
                .await;
        }

        info!(lsn = %lsn.to_base64(), "outbound replication started by server");
        let resp = SatMessage::InStartReplicationResp(SatInStartReplicationResp::default());
        self.rpc
            .inner()
            .respond(request, RpcResult::Message(codec::encode(&resp).to_vec()))
            .await?;
        self.emit(ClientEvent::OutboundStarted);
        Ok(())
    }

    async fn handle_outbound_stop(&self, request: &SatRpcRequest) -> Result<()> {
        let stopped = {
            let mut outbound = self.outbound.lock();
            if outbound.status == ReplicationStatus::Active {
                outbound.stop();
                true
            } else {
                false
            }
        };
        if !stopped {
            return self
                .rpc
                .inner()
                .respond_error(
                    request,
                    SatErrorResp::new(ErrorRespCode::ReplicationFailed, "outbound replication not active"),
                )
                .await;
        }
        info!("outbound replication stopped by server");
        let resp = codec::encode(&SatMessage::InStopReplicationResp).to_vec();
        self.rpc.inner().respond(request, RpcResult::Message(resp)).await
    }

    // ─── outbound push ──────────────────────────────────────────────────────

    fn push_throttle(&self) -> Throttle {
        let weak = self.weak_self();
        Throttle::new(self.config.push_period_duration(), move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.push_transactions().await;
                }
            })
        })
    }

    /// The throttle is owned by the client, so it only holds a weak
    /// reference back.
    fn weak_self(&self) -> Weak<ClientInner> {
        self.self_ref.clone()
    }

    async fn push_transactions(&self) {
        loop {
            let next = {
                let mut outbound = self.outbound.lock();
                if outbound.status != ReplicationStatus::Active {
                    return;
                }
                outbound.queue.pop_front()
            };
            let Some(tx) = next else { return };
            if let Err(e) = self.push_transaction(&tx).await {
                warn!(error = %e, lsn = %tx.lsn.to_base64(), "failed to push transaction");
                self.emit(ClientEvent::Error(e));
                return;
            }
        }
    }

    async fn push_transaction(&self, tx: &DataTransaction) -> Result<()> {
        let mut announce = Vec::new();
        let mut ops = Vec::with_capacity(tx.changes.len() + 2);
        ops.push(SatTransOp::Begin(SatOpBegin {
            commit_timestamp: tx.commit_timestamp,
            lsn: tx.lsn.as_bytes().to_vec(),
            origin: tx.origin.clone(),
            is_migration: false,
            transaction_id: None,
        }));

        {
            let mut outbound = self.outbound.lock();
            for change in &tx.changes {
                let relation = &change.relation;
                if outbound.relations_sent.get(&relation.id) != Some(relation) {
                    outbound.relations_sent.insert(relation.id, relation.clone());
                    announce.push(relation_to_wire(relation));
                }
            }
        }

        let codec = self.codec.as_ref();
        let row = |record: &Record, relation: &Relation| serialize_row(record, relation, codec);
        for change in &tx.changes {
            let relation = &change.relation;
            let op = match change.change_type {
                DataChangeType::Insert => SatTransOp::Insert(SatOpInsert {
                    relation_id: relation.id,
                    row_data: row(change.record.as_ref().unwrap_or(&Record::new()), relation)?,
                    tags: change.tags.clone(),
                }),
                DataChangeType::Update => SatTransOp::Update(SatOpUpdate {
                    relation_id: relation.id,
                    row_data: row(change.record.as_ref().unwrap_or(&Record::new()), relation)?,
                    old_row_data: change.old_record.as_ref().map(|r| row(r, relation)).transpose()?,
                    tags: change.tags.clone(),
                }),
                DataChangeType::Delete => SatTransOp::Delete(SatOpDelete {
                    relation_id: relation.id,
                    old_row_data: change.old_record.as_ref().map(|r| row(r, relation)).transpose()?,
                    tags: change.tags.clone(),
                }),
                DataChangeType::Gone => continue,
            };
            ops.push(op);
        }
        ops.push(SatTransOp::Commit(SatOpCommit {
            commit_timestamp: tx.commit_timestamp,
            lsn: tx.lsn.as_bytes().to_vec(),
            transaction_id: None,
        }));

        for relation in announce {
            self.send(&SatMessage::Relation(relation)).await?;
        }
        let op_count = ops.len();
        self.send(&SatMessage::OpLog(SatOpLog { ops })).await?;
        crate::metrics::record_transaction_pushed(op_count);
        Ok(())
    }
}
