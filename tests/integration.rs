// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the replication client and the sync process.
//!
//! Every test runs against [`common::FakeServer`], an in-process transport,
//! and an in-memory SQLite database. No external services are needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # With logs
//! RUST_LOG=satellite_sync=debug cargo test --test integration -- --nocapture
//! ```
//!
//! # Test Organization
//! - `client_*` - protocol client against the fake server
//! - `subscription_*` - shape delivery through the client
//! - `satellite_*` - the full process: local database, apply, push, reconnect

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use satellite_sync::adapter::{DatabaseAdapter, SqliteAdapter, Statement};
use satellite_sync::config::{ClientConfig, StorageConfig, SyncConfig};
use satellite_sync::error::ErrorCode;
use satellite_sync::notifier::EventNotifier;
use satellite_sync::protocol::messages::*;
use satellite_sync::protocol::{ClientEvent, ReplicationStatus, SatelliteClient, TextCodec};
use satellite_sync::shapes::{Shape, ShapeRequest, SyncStatus};
use satellite_sync::types::{DataChange, DataChangeType, DataTransaction, Lsn, SqlValue};
use satellite_sync::{ConnectivityState, ProcessState, Satellite};
use tokio::sync::mpsc::UnboundedReceiver;

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event<F>(events: &mut UnboundedReceiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// A connected, authenticated client with inbound replication running.
async fn started_client() -> (Arc<FakeServer>, SatelliteClient, UnboundedReceiver<ClientEvent>) {
    init_tracing();
    let server = Arc::new(FakeServer::new());
    let (client, events) = SatelliteClient::new(server.clone(), ClientConfig::for_testing(), Arc::new(TextCodec));
    client.connect().await.unwrap();
    client.authenticate("client-1", "token").await.unwrap();
    client
        .start_replication(Lsn::default(), None, vec![], vec![])
        .await
        .unwrap();
    (server, client, events)
}

/// Run a full shape delivery for `subscription_id` with one `items` row.
async fn deliver_items(server: &FakeServer, subscription_id: &str, request_id: &str, rows: &[(&str, &str)]) {
    server
        .push(SatMessage::SubsDataBegin(SatSubsDataBegin {
            subscription_id: subscription_id.to_string(),
            lsn: vec![0, 0, 0, 5],
        }))
        .await;
    server
        .push(SatMessage::ShapeDataBegin(SatShapeDataBegin {
            request_id: request_id.to_string(),
            uuid: format!("uuid-{request_id}"),
        }))
        .await;
    server
        .push(SatMessage::OpLog(SatOpLog {
            ops: rows.iter().map(|(id, value)| insert(id, Some(value), &["remote@1"])).collect(),
        }))
        .await;
    server.push(SatMessage::ShapeDataEnd).await;
    server.push(SatMessage::SubsDataEnd).await;
}

// =============================================================================
// Client Tests
// =============================================================================

#[tokio::test]
async fn client_starts_and_stops_replication() {
    let (server, client, _events) = started_client().await;
    assert_eq!(client.inbound_status(), ReplicationStatus::Active);

    let auth = server.requests("authenticate").await;
    assert!(matches!(&auth[..], [SatMessage::AuthReq(req)] if req.id == "client-1" && req.token == "token"));

    match &server.requests("startReplication").await[..] {
        [SatMessage::InStartReplicationReq(req)] => assert!(req.lsn.is_empty()),
        other => panic!("unexpected start requests: {other:?}"),
    }

    client.stop_replication().await.unwrap();
    assert_eq!(client.inbound_status(), ReplicationStatus::Stopped);
}

#[tokio::test]
async fn client_failed_stop_keeps_replication_active() {
    let (server, client, _events) = started_client().await;
    server.garble_next_stop();

    assert!(client.stop_replication().await.is_err());
    assert_eq!(client.inbound_status(), ReplicationStatus::Active);

    // Stopping again works once the server answers properly.
    client.stop_replication().await.unwrap();
    assert_eq!(client.inbound_status(), ReplicationStatus::Stopped);
}

#[tokio::test]
async fn client_start_replication_error_is_returned() {
    init_tracing();
    let server = Arc::new(FakeServer::new());
    let (client, _events) = SatelliteClient::new(server.clone(), ClientConfig::for_testing(), Arc::new(TextCodec));
    client.connect().await.unwrap();
    server.fail_next_start(StartReplicationErrorCode::BehindWindow, "too far behind");

    let err = client
        .start_replication(Lsn::new(vec![1]), None, vec![], vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BehindWindow);
    assert!(err.is_out_of_sync());
    assert_eq!(client.inbound_status(), ReplicationStatus::Stopped);
}

#[tokio::test]
async fn client_refuses_subscriptions_without_lsn() {
    init_tracing();
    let server = Arc::new(FakeServer::new());
    let (client, _events) = SatelliteClient::new(server.clone(), ClientConfig::for_testing(), Arc::new(TextCodec));
    client.connect().await.unwrap();

    let err = client
        .start_replication(Lsn::default(), None, vec!["sub".to_string()], vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    assert!(server.requests("startReplication").await.is_empty());
}

#[tokio::test]
async fn client_emits_incoming_transaction() {
    let (server, _client, mut events) = started_client().await;
    server.push(SatMessage::Relation(items_relation_wire())).await;
    server.push(insert_transaction(&[0, 0, 0, 1], 7, "a", "hello")).await;

    let relation = expect_event(&mut events, |e| matches!(e, ClientEvent::Relation(_))).await;
    assert!(matches!(relation, ClientEvent::Relation(r) if r.table == "items"));

    match expect_event(&mut events, |e| matches!(e, ClientEvent::Transaction(_))).await {
        ClientEvent::Transaction(tx) => {
            assert_eq!(tx.lsn, Lsn::new(vec![0, 0, 0, 1]));
            assert_eq!(tx.id, Some(7));
            assert_eq!(tx.origin.as_deref(), Some("remote"));
            assert_eq!(tx.changes.len(), 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn client_reports_unknown_relation() {
    let (server, _client, mut events) = started_client().await;
    server.push(insert_transaction(&[0, 0, 0, 1], 1, "a", "hello")).await;

    match expect_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await {
        ClientEvent::Error(e) => assert_eq!(e.code(), ErrorCode::ProtocolViolation),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn client_acknowledges_applied_transactions() {
    let (server, client, mut events) = started_client().await;
    server.push(SatMessage::Relation(items_relation_wire())).await;
    server.push(insert_transaction(&[0, 0, 0, 9], 3, "a", "hello")).await;

    if let ClientEvent::Transaction(tx) =
        expect_event(&mut events, |e| matches!(e, ClientEvent::Transaction(_))).await
    {
        client.transaction_applied(tx.lsn, tx.id).await.unwrap();
    }

    // The ack timer flushes what the window has not sent yet.
    assert!(server.wait_for(|sent| sent.iter().any(|m| matches!(m, SatMessage::OpLogAck(_)))).await);
    let acks = server.acks().await;
    assert_eq!(acks.last().map(|a| a.transaction_id), Some(3));
    assert_eq!(acks.last().map(|a| a.lsn.clone()), Some(vec![0, 0, 0, 9]));
}

#[tokio::test]
async fn client_pushes_relation_before_transaction() {
    let (server, client, mut events) = started_client().await;
    let request_id = server.start_outbound(Vec::new()).await;
    expect_event(&mut events, |e| matches!(e, ClientEvent::OutboundStarted)).await;
    assert_eq!(client.outbound_status(), ReplicationStatus::Active);
    assert!(server.response_to(request_id).await.is_some());

    client
        .enqueue_transaction(DataTransaction {
            commit_timestamp: 1_700_000_000_000,
            lsn: Lsn::from_rowid(4),
            changes: vec![DataChange {
                relation: items_relation(),
                change_type: DataChangeType::Insert,
                record: Some(item("a", Some("local"))),
                old_record: None,
                tags: vec![],
            }],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(client.enqueued_lsn(), Lsn::from_rowid(4));

    assert!(server.wait_for(|sent| sent.iter().any(|m| matches!(m, SatMessage::OpLog(_)))).await);
    let sent = server.sent().await;
    let relation_at = sent.iter().position(|m| matches!(m, SatMessage::Relation(_))).unwrap();
    let oplog_at = sent.iter().position(|m| matches!(m, SatMessage::OpLog(_))).unwrap();
    assert!(relation_at < oplog_at);

    let ops = &server.oplogs().await[0].ops;
    assert!(matches!(ops.first(), Some(SatTransOp::Begin(_))));
    assert!(matches!(ops.get(1), Some(SatTransOp::Insert(i)) if i.relation_id == ITEMS_RELATION_ID));
    assert!(matches!(ops.last(), Some(SatTransOp::Commit(_))));
}

#[tokio::test]
async fn client_rejects_enqueue_before_outbound_start() {
    let (_server, client, _events) = started_client().await;
    let err = client.enqueue_transaction(DataTransaction::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplicationNotStarted);
}

#[tokio::test]
async fn client_answers_unknown_rpc_with_invalid_request() {
    let (server, _client, _events) = started_client().await;
    let request_id = server.call("frobnicate", SatMessage::PingReq).await;

    assert!(
        server
            .wait_for(|sent| sent
                .iter()
                .any(|m| matches!(m, SatMessage::RpcResponse(r) if r.request_id == request_id)))
            .await
    );
    let response = server.response_to(request_id).await.unwrap();
    match response.result {
        Some(RpcResult::Error(err)) => assert_eq!(err.error_type, ErrorRespCode::InvalidRequest),
        other => panic!("expected an error response, got {other:?}"),
    }
}

#[tokio::test]
async fn client_answers_ping() {
    let (server, _client, _events) = started_client().await;
    server.push(SatMessage::PingReq).await;
    assert!(server.wait_for(|sent| sent.iter().any(|m| matches!(m, SatMessage::PingResp(_)))).await);
}

#[tokio::test]
async fn client_reports_disconnect() {
    let (server, client, mut events) = started_client().await;
    server.disconnect().await;

    expect_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    assert_eq!(client.inbound_status(), ReplicationStatus::Stopped);
}

// =============================================================================
// Subscription Tests
// =============================================================================

#[tokio::test]
async fn subscription_is_delivered() {
    let (server, client, mut events) = started_client().await;
    server.push(SatMessage::Relation(items_relation_wire())).await;
    expect_event(&mut events, |e| matches!(e, ClientEvent::Relation(_))).await;

    let request = ShapeRequest {
        request_id: "r1".to_string(),
        definition: Shape::table("items"),
    };
    let id = client.subscribe("sub1", &[request]).await.unwrap();
    assert_eq!(id, "sub1");

    deliver_items(&server, "sub1", "r1", &[("a", "one"), ("b", "two")]).await;

    match expect_event(&mut events, |e| matches!(e, ClientEvent::SubscriptionDelivered(_))).await {
        ClientEvent::SubscriptionDelivered(data) => {
            assert_eq!(data.subscription_id, "sub1");
            assert_eq!(data.lsn, Lsn::new(vec![0, 0, 0, 5]));
            assert_eq!(data.data.len(), 2);
            assert_eq!(data.shape_req_to_uuid.get("r1").map(String::as_str), Some("uuid-r1"));
            assert_eq!(data.data[0].record, item("a", Some("one")));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn subscription_rejected_by_server() {
    let (server, client, _events) = started_client().await;
    server.fail_next_subscribe(SubsRespErrorCode::SubscriptionIdAlreadyExists, "taken");

    let request = ShapeRequest {
        request_id: "r1".to_string(),
        definition: Shape::table("items"),
    };
    let err = client.subscribe("sub1", &[request]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SubscriptionIdAlreadyExists);
}

#[tokio::test]
async fn subscription_data_error_is_reported() {
    let (server, client, mut events) = started_client().await;
    let request = ShapeRequest {
        request_id: "r1".to_string(),
        definition: Shape::table("items"),
    };
    client.subscribe("sub1", &[request]).await.unwrap();

    server
        .push(SatMessage::SubsDataBegin(SatSubsDataBegin {
            subscription_id: "sub1".to_string(),
            lsn: vec![1],
        }))
        .await;
    server
        .push(SatMessage::SubsDataError(SatSubsDataError {
            code: SubsDataErrorCode::ShapeDeliveryError,
            message: "shape too large".to_string(),
            subscription_id: "sub1".to_string(),
            shape_request_errors: vec![],
        }))
        .await;

    match expect_event(&mut events, |e| matches!(e, ClientEvent::SubscriptionError { .. })).await {
        ClientEvent::SubscriptionError { subscription_id, error } => {
            assert_eq!(subscription_id.as_deref(), Some("sub1"));
            assert!(error.is_subscription_error());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn subscription_gone_batch_after_unsubscribe() {
    let (server, client, mut events) = started_client().await;
    server.push(SatMessage::Relation(items_relation_wire())).await;
    let request = ShapeRequest {
        request_id: "r1".to_string(),
        definition: Shape::table("items"),
    };
    client.subscribe("sub1", &[request]).await.unwrap();
    deliver_items(&server, "sub1", "r1", &[("a", "one")]).await;
    expect_event(&mut events, |e| matches!(e, ClientEvent::SubscriptionDelivered(_))).await;

    client.unsubscribe(vec!["sub1".to_string()]).await.unwrap();
    server
        .push(SatMessage::OpLog(SatOpLog {
            ops: vec![
                begin(&[0, 0, 0, 6], 1_700_000_000_000, None, 11),
                SatTransOp::Gone(SatOpGone {
                    relation_id: ITEMS_RELATION_ID,
                    pk_data: item_row("a", None),
                }),
                commit(&[0, 0, 0, 6], 1_700_000_000_000, 11),
            ],
        }))
        .await;

    match expect_event(&mut events, |e| matches!(e, ClientEvent::GoneBatch { .. })).await {
        ClientEvent::GoneBatch {
            lsn,
            subscription_ids,
            changes,
        } => {
            assert_eq!(lsn, Lsn::new(vec![0, 0, 0, 6]));
            assert_eq!(subscription_ids, vec!["sub1".to_string()]);
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].change_type, DataChangeType::Gone);
            // Only the primary key survives.
            let record = changes[0].record.as_ref().unwrap();
            assert_eq!(record.len(), 1);
            assert_eq!(record.get("id"), Some(&SqlValue::Text("a".to_string())));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// =============================================================================
// Satellite Tests
// =============================================================================

async fn satellite(server: &Arc<FakeServer>) -> Satellite {
    init_tracing();
    let config = SyncConfig::for_testing("test.db");
    let adapter: Arc<dyn DatabaseAdapter> = Arc::new(SqliteAdapter::open(&StorageConfig::in_memory()).await.unwrap());
    let notifier = Arc::new(EventNotifier::new("test.db"));
    Satellite::new(config, adapter, server.clone(), notifier, vec![items_migration()])
}

async fn item_value(satellite: &Satellite, id: &str) -> Option<SqlValue> {
    let rows = satellite
        .adapter()
        .query(Statement::with_args(
            "SELECT value FROM items WHERE id = ?",
            vec![SqlValue::Text(id.to_string())],
        ))
        .await
        .unwrap();
    rows.into_iter().next().and_then(|mut r| r.remove("value"))
}

/// Poll until `id` holds `value` locally.
async fn wait_for_item(satellite: &Satellite, id: &str, value: Option<&str>) -> bool {
    let expected = value.map(|v| SqlValue::Text(v.to_string()));
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if item_value(satellite, id).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn satellite_starts_and_stops() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;

    satellite.start("secret").await.unwrap();
    assert_eq!(satellite.state(), ProcessState::Running);
    assert_eq!(satellite.connectivity_state(), ConnectivityState::Connected);

    let auth = server.requests("authenticate").await;
    assert!(matches!(&auth[..], [SatMessage::AuthReq(req)] if req.token == "secret" && req.id == satellite.client_id()));
    match &server.requests("startReplication").await[..] {
        [SatMessage::InStartReplicationReq(req)] => {
            assert!(req.lsn.is_empty());
            assert_eq!(req.schema_version.as_deref(), Some("20240101"));
        }
        other => panic!("unexpected start requests: {other:?}"),
    }

    satellite.stop().await.unwrap();
    assert_eq!(satellite.state(), ProcessState::Stopped);
    assert_eq!(satellite.connectivity_state(), ConnectivityState::Disconnected);
    assert_eq!(server.requests("stopReplication").await.len(), 1);
}

#[tokio::test]
async fn satellite_start_fails_when_server_unreachable() {
    let server = Arc::new(FakeServer::new());
    server.refuse_connections(true);
    let satellite = satellite(&server).await;

    let err = satellite.start("token").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailedAfterRetry);
    assert_eq!(satellite.state(), ProcessState::Failed);
    assert_eq!(server.connect_count(), 3);
}

#[tokio::test]
async fn satellite_applies_remote_transaction() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;
    satellite.start("token").await.unwrap();

    server.push(SatMessage::Relation(items_relation_wire())).await;
    server.push(insert_transaction(&[0, 0, 0, 1], 1, "a", "remote")).await;

    assert!(wait_for_item(&satellite, "a", Some("remote")).await);
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while satellite.meta().lsn().await.unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(satellite.meta().lsn().await.unwrap(), Lsn::new(vec![0, 0, 0, 1]));

    // Applying a remote write must not be captured as a local change.
    assert_eq!(satellite.perform_snapshot().await.unwrap(), 0);
    satellite.stop().await.unwrap();
}

#[tokio::test]
async fn satellite_pushes_local_writes() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;
    satellite.start("token").await.unwrap();

    satellite
        .adapter()
        .run(Statement::new("INSERT INTO items (id, value) VALUES ('local', 'x')"))
        .await
        .unwrap();
    server.start_outbound(Vec::new()).await;
    satellite.potentially_changed();

    assert!(server.wait_for(|sent| sent.iter().any(|m| matches!(m, SatMessage::OpLog(_)))).await);
    let oplogs = server.oplogs().await;
    let inserts: Vec<&SatOpInsert> = oplogs
        .iter()
        .flat_map(|log| log.ops.iter())
        .filter_map(|op| match op {
            SatTransOp::Insert(insert) => Some(insert),
            _ => None,
        })
        .collect();
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].tags.len(), 1);
    assert!(inserts[0].tags[0].starts_with(&satellite.client_id()));
    satellite.stop().await.unwrap();
}

#[tokio::test]
async fn satellite_subscription_syncs_rows() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;
    satellite.start("token").await.unwrap();
    server.push(SatMessage::Relation(items_relation_wire())).await;

    let subscription = satellite.subscribe(vec![Shape::table("items")]).await.unwrap();
    let id = subscription.id.clone();
    assert_eq!(satellite.sync_status(&id).await, SyncStatus::Establishing);

    let request_id = match &server.requests("subscribe").await[..] {
        [SatMessage::SubsReq(req)] => {
            assert_eq!(req.subscription_id, id);
            req.shape_requests[0].request_id.clone()
        }
        other => panic!("unexpected subscribe requests: {other:?}"),
    };
    deliver_items(&server, &id, &request_id, &[("a", "one"), ("b", "two")]).await;

    tokio::time::timeout(EVENT_TIMEOUT, subscription.synced())
        .await
        .expect("subscription not synced in time")
        .unwrap();
    assert_eq!(item_value(&satellite, "a").await, Some(SqlValue::Text("one".to_string())));
    assert_eq!(item_value(&satellite, "b").await, Some(SqlValue::Text("two".to_string())));
    assert_eq!(satellite.sync_status(&id).await, SyncStatus::Active);
    assert_eq!(satellite.fulfilled_shapes().await.len(), 1);

    // The same shape again reuses the fulfilled subscription.
    let again = satellite.subscribe(vec![Shape::table("items")]).await.unwrap();
    assert_eq!(again.id, id);
    again.synced().await.unwrap();
    assert_eq!(server.requests("subscribe").await.len(), 1);

    satellite.stop().await.unwrap();
}

#[tokio::test]
async fn satellite_unsubscribe_clears_rows() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;
    satellite.start("token").await.unwrap();
    server.push(SatMessage::Relation(items_relation_wire())).await;

    let subscription = satellite.subscribe(vec![Shape::table("items")]).await.unwrap();
    let id = subscription.id.clone();
    let request_id = match &server.requests("subscribe").await[..] {
        [SatMessage::SubsReq(req)] => req.shape_requests[0].request_id.clone(),
        other => panic!("unexpected subscribe requests: {other:?}"),
    };
    deliver_items(&server, &id, &request_id, &[("a", "one")]).await;
    tokio::time::timeout(EVENT_TIMEOUT, subscription.synced()).await.unwrap().unwrap();

    satellite.unsubscribe(vec![id.clone()]).await.unwrap();
    assert_eq!(item_value(&satellite, "a").await, None);
    assert_eq!(satellite.sync_status(&id).await, SyncStatus::Cancelling);
    assert_eq!(server.requests("unsubscribe").await.len(), 1);
    satellite.stop().await.unwrap();
}

#[tokio::test]
async fn satellite_reconnects_after_disconnect() {
    let server = Arc::new(FakeServer::new());
    let satellite = satellite(&server).await;
    satellite.start("token").await.unwrap();
    assert_eq!(server.connect_count(), 1);

    server.disconnect().await;

    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while (server.connect_count() < 2 || satellite.connectivity_state() != ConnectivityState::Connected)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.connect_count() >= 2);
    assert_eq!(satellite.connectivity_state(), ConnectivityState::Connected);
    assert_eq!(satellite.state(), ProcessState::Running);
    satellite.stop().await.unwrap();
}

#[tokio::test]
async fn satellite_behind_window_resets_and_retries() {
    let server = Arc::new(FakeServer::new());
    server.fail_next_start(StartReplicationErrorCode::BehindWindow, "too far behind");
    let satellite = satellite(&server).await;

    satellite.start("token").await.unwrap();
    assert_eq!(server.requests("startReplication").await.len(), 2);
    assert!(satellite.meta().lsn().await.unwrap().is_empty());
    satellite.stop().await.unwrap();
}
