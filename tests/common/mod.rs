//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - [`FakeServer`]: an in-process [`Transport`] that records every frame
//!   the client sends and answers client RPC calls like a sync server
//! - Builders for relations, rows and transactions of an `items` table
//! - A bundled migration creating `items` with its capture triggers

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use satellite_sync::adapter::{BoxFuture, Statement};
use satellite_sync::error::{ErrorCode, SyncError};
use satellite_sync::migrator::Migration;
use satellite_sync::protocol::messages::*;
use satellite_sync::protocol::{decode, encode, serialize_row, TextCodec, Transport, TransportEvent};
use satellite_sync::triggers::{SqliteTriggerGenerator, TriggerGenerator};
use satellite_sync::types::{MigrationColumn, MigrationTable, Record, Relation, RelationColumn, SqlValue, TableType};
use tokio::sync::{mpsc, RwLock};

/// How long `wait_for` polls before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(3);

/// In-process sync server.
///
/// Client RPC calls are answered immediately:
/// - `authenticate` with an `AuthResp`
/// - `startReplication` with success, or the error set by
///   [`fail_next_start`](Self::fail_next_start)
/// - `stopReplication`, `subscribe` and `unsubscribe` with success
///
/// Everything else the client sends is only recorded.
///
/// # Example
/// ```rust,ignore
/// let server = Arc::new(FakeServer::new());
/// let (client, events) = SatelliteClient::new(server.clone(), config, Arc::new(TextCodec));
/// client.connect().await?;
/// server.push(SatMessage::Relation(items_relation_wire())).await;
/// assert_eq!(server.acks().await.len(), 1);
/// ```
pub struct FakeServer {
    /// Decoded frames sent by the client
    sent: RwLock<Vec<SatMessage>>,
    /// Sender half of the current connection's event stream
    incoming: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connected: AtomicBool,
    /// Refuse every connection attempt
    refuse: AtomicBool,
    connects: AtomicUsize,
    /// Error returned by the next `startReplication`
    start_error: Mutex<Option<StartReplicationError>>,
    /// Reject the next `subscribe` call
    subscribe_error: Mutex<Option<SubsRespError>>,
    /// Answer the next `stopReplication` with the wrong message
    garble_stop: AtomicBool,
    next_request_id: AtomicUsize,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
            incoming: Mutex::new(None),
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            start_error: Mutex::new(None),
            subscribe_error: Mutex::new(None),
            garble_stop: AtomicBool::new(false),
            next_request_id: AtomicUsize::new(1),
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self, code: StartReplicationErrorCode, message: &str) {
        *self.start_error.lock() = Some(StartReplicationError {
            code,
            message: message.to_string(),
        });
    }

    pub fn fail_next_subscribe(&self, code: SubsRespErrorCode, message: &str) {
        *self.subscribe_error.lock() = Some(SubsRespError {
            code,
            message: message.to_string(),
            shape_request_errors: Vec::new(),
        });
    }

    pub fn garble_next_stop(&self) {
        self.garble_stop.store(true, Ordering::SeqCst);
    }

    // ─── server → client ────────────────────────────────────────────────────

    /// Deliver a message to the client.
    pub async fn push(&self, message: SatMessage) {
        self.push_frame(encode(&message)).await;
    }

    /// Deliver a raw frame to the client.
    pub async fn push_frame(&self, frame: Bytes) {
        let tx = self.incoming.lock().clone();
        if let Some(tx) = tx {
            tx.send(TransportEvent::Message(frame)).await.unwrap();
        }
    }

    /// Call a method on the client. Returns the request id.
    pub async fn call(&self, method: &str, message: SatMessage) -> u32 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) as u32;
        self.push(SatMessage::RpcRequest(SatRpcRequest {
            method: method.to_string(),
            request_id,
            message: encode(&message).to_vec(),
        }))
        .await;
        request_id
    }

    /// Ask the client to start streaming its transactions after `lsn`.
    pub async fn start_outbound(&self, lsn: Vec<u8>) -> u32 {
        self.call(
            "startReplication",
            SatMessage::InStartReplicationReq(SatInStartReplicationReq {
                lsn,
                ..Default::default()
            }),
        )
        .await
    }

    /// Drop the connection as if the socket closed.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tx = self.incoming.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Closed).await;
        }
    }

    // ─── recorded client traffic ────────────────────────────────────────────

    pub async fn sent(&self) -> Vec<SatMessage> {
        self.sent.read().await.clone()
    }

    /// Inner messages of the client's calls to `method`.
    pub async fn requests(&self, method: &str) -> Vec<SatMessage> {
        self.sent
            .read()
            .await
            .iter()
            .filter_map(|m| match m {
                SatMessage::RpcRequest(req) if req.method == method => decode(&req.message).ok(),
                _ => None,
            })
            .collect()
    }

    pub async fn oplogs(&self) -> Vec<SatOpLog> {
        self.sent
            .read()
            .await
            .iter()
            .filter_map(|m| match m {
                SatMessage::OpLog(log) => Some(log.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn acks(&self) -> Vec<SatOpLogAck> {
        self.sent
            .read()
            .await
            .iter()
            .filter_map(|m| match m {
                SatMessage::OpLogAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    /// The client's answer to the server call with `request_id`.
    pub async fn response_to(&self, request_id: u32) -> Option<SatRpcResponse> {
        self.sent.read().await.iter().find_map(|m| match m {
            SatMessage::RpcResponse(resp) if resp.request_id == request_id => Some(resp.clone()),
            _ => None,
        })
    }

    /// Poll the recorded traffic until `check` holds.
    pub async fn wait_for<F>(&self, check: F) -> bool
    where
        F: Fn(&[SatMessage]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if check(&self.sent.read().await) {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ─── request handling ───────────────────────────────────────────────────

    fn answer(&self, request: &SatRpcRequest) -> Option<SatMessage> {
        let inner = decode(&request.message).ok()?;
        let response = match (request.method.as_str(), inner) {
            ("authenticate", SatMessage::AuthReq(_)) => SatMessage::AuthResp(SatAuthResp {
                id: "fake-server".to_string(),
                headers: Vec::new(),
            }),
            ("startReplication", SatMessage::InStartReplicationReq(_)) => {
                SatMessage::InStartReplicationResp(SatInStartReplicationResp {
                    err: self.start_error.lock().take(),
                    unacked_window_size: None,
                })
            }
            ("stopReplication", _) if self.garble_stop.swap(false, Ordering::SeqCst) => SatMessage::UnsubsResp,
            ("stopReplication", _) => SatMessage::InStopReplicationResp,
            ("subscribe", SatMessage::SubsReq(req)) => SatMessage::SubsResp(SatSubsResp {
                subscription_id: req.subscription_id,
                err: self.subscribe_error.lock().take(),
            }),
            ("unsubscribe", _) => SatMessage::UnsubsResp,
            _ => return None,
        };
        Some(SatMessage::RpcResponse(SatRpcResponse {
            method: request.method.clone(),
            request_id: request.request_id,
            result: Some(RpcResult::Message(encode(&response).to_vec())),
        }))
    }
}

impl Transport for FakeServer {
    fn connect(&self, _url: &str) -> BoxFuture<'_, mpsc::Receiver<TransportEvent>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SyncError::new(ErrorCode::SocketError, "connection refused"));
            }
            let (tx, rx) = mpsc::channel(1024);
            *self.incoming.lock() = Some(tx);
            self.connected.store(true, Ordering::SeqCst);
            Ok(rx)
        })
    }

    fn send(&self, frame: Bytes) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(SyncError::new(ErrorCode::SocketError, "not connected"));
            }
            let message = decode(&frame)?;
            let reply = match &message {
                SatMessage::RpcRequest(request) => self.answer(request),
                _ => None,
            };
            self.sent.write().await.push(message);
            if let Some(reply) = reply {
                let tx = self.incoming.lock().clone();
                if let Some(tx) = tx {
                    let _ = tx.try_send(TransportEvent::Message(encode(&reply)));
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            self.incoming.lock().take();
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// =============================================================================
// items table
// =============================================================================

pub const ITEMS_RELATION_ID: u32 = 1;

/// `items (id TEXT PRIMARY KEY, value TEXT)` as the server describes it.
pub fn items_relation() -> Relation {
    Relation {
        id: ITEMS_RELATION_ID,
        schema: "public".to_string(),
        table: "items".to_string(),
        table_type: TableType::Table,
        columns: vec![
            RelationColumn {
                name: "id".to_string(),
                type_name: "TEXT".to_string(),
                is_nullable: false,
                primary_key: Some(1),
            },
            RelationColumn {
                name: "value".to_string(),
                type_name: "TEXT".to_string(),
                is_nullable: true,
                primary_key: None,
            },
        ],
    }
}

pub fn items_relation_wire() -> SatRelation {
    let relation = items_relation();
    SatRelation {
        schema_name: relation.schema,
        table_name: relation.table,
        relation_id: relation.id,
        columns: relation
            .columns
            .into_iter()
            .map(|c| SatRelationColumn {
                name: c.name,
                type_name: c.type_name,
                primary_key: c.primary_key,
                is_nullable: c.is_nullable,
            })
            .collect(),
    }
}

pub fn item(id: &str, value: Option<&str>) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), SqlValue::Text(id.to_string()));
    record.insert(
        "value".to_string(),
        value.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string())),
    );
    record
}

pub fn item_row(id: &str, value: Option<&str>) -> SatOpRow {
    serialize_row(&item(id, value), &items_relation(), &TextCodec).unwrap()
}

pub fn begin(lsn: &[u8], commit_timestamp: i64, origin: Option<&str>, transaction_id: u64) -> SatTransOp {
    SatTransOp::Begin(SatOpBegin {
        commit_timestamp,
        lsn: lsn.to_vec(),
        origin: origin.map(str::to_string),
        is_migration: false,
        transaction_id: Some(transaction_id),
    })
}

pub fn commit(lsn: &[u8], commit_timestamp: i64, transaction_id: u64) -> SatTransOp {
    SatTransOp::Commit(SatOpCommit {
        commit_timestamp,
        lsn: lsn.to_vec(),
        transaction_id: Some(transaction_id),
    })
}

pub fn insert(id: &str, value: Option<&str>, tags: &[&str]) -> SatTransOp {
    SatTransOp::Insert(SatOpInsert {
        relation_id: ITEMS_RELATION_ID,
        row_data: item_row(id, value),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    })
}

/// One remote transaction inserting `(id, value)`.
pub fn insert_transaction(lsn: &[u8], transaction_id: u64, id: &str, value: &str) -> SatMessage {
    SatMessage::OpLog(SatOpLog {
        ops: vec![
            begin(lsn, 1_700_000_000_000, Some("remote"), transaction_id),
            insert(id, Some(value), &["remote@1700000000000"]),
            commit(lsn, 1_700_000_000_000, transaction_id),
        ],
    })
}

/// Migration creating `items` together with its capture triggers.
pub fn items_migration() -> Migration {
    let table = MigrationTable {
        name: "items".to_string(),
        columns: vec![
            MigrationColumn {
                name: "id".to_string(),
                sqlite_type: "TEXT".to_string(),
                pg_type: "TEXT".to_string(),
            },
            MigrationColumn {
                name: "value".to_string(),
                sqlite_type: "TEXT".to_string(),
                pg_type: "TEXT".to_string(),
            },
        ],
        fks: Vec::new(),
        pks: vec!["id".to_string()],
    };
    let mut statements = vec![Statement::new(
        "CREATE TABLE items (id TEXT PRIMARY KEY NOT NULL, value TEXT)",
    )];
    statements.extend(
        SqliteTriggerGenerator::new(Default::default())
            .generate_triggers_for_table(&table)
            .unwrap(),
    );
    Migration::new("20240101", statements)
}

/// Install a tracing subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
