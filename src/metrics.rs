//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Snapshot throughput and latency
//! - Transactions applied, enqueued and pushed
//! - Ack window occupancy
//! - RPC calls and timeouts
//! - Subscription deliveries and failures
//! - Connection attempts and process state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use satellite_sync::metrics;
//! use std::time::Duration;
//!
//! // After a snapshot commits
//! metrics::record_snapshot(12, Duration::from_millis(3));
//!
//! // After an incoming transaction is written
//! metrics::record_transaction_applied("remote", 4, Duration::from_millis(7));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed snapshot and how many oplog entries it promoted.
pub fn record_snapshot(entries: usize, duration: Duration) {
    counter!("sync_snapshots_total").increment(1);
    counter!("sync_oplog_entries_promoted_total").increment(entries as u64);
    histogram!("sync_snapshot_duration_seconds").record(duration.as_secs_f64());
}

/// Record a snapshot that failed and was rolled back.
pub fn record_snapshot_failure() {
    counter!("sync_snapshot_failures_total").increment(1);
}

/// Record oplog entries removed after the server confirmed them.
pub fn record_oplog_gc(rows: u64) {
    counter!("sync_oplog_gc_rows_total").increment(rows);
}

/// Record an incoming transaction written to the local database.
pub fn record_transaction_applied(origin: &str, changes: usize, duration: Duration) {
    counter!("sync_transactions_applied_total", "origin" => origin.to_string()).increment(1);
    counter!("sync_changes_applied_total", "origin" => origin.to_string()).increment(changes as u64);
    histogram!("sync_transaction_apply_duration_seconds").record(duration.as_secs_f64());
}

/// Record local transactions handed to the outbound queue.
pub fn record_transactions_enqueued(count: usize) {
    counter!("sync_transactions_enqueued_total").increment(count as u64);
}

/// Record a transaction written to the transport.
pub fn record_transaction_pushed(ops: usize) {
    counter!("sync_transactions_pushed_total").increment(1);
    histogram!("sync_transaction_ops").record(ops as f64);
}

/// Record an acknowledgement sent to the server.
pub fn record_ack_sent(reason: &str) {
    counter!("sync_acks_sent_total", "reason" => reason.to_string()).increment(1);
}

/// Current number of received but unacknowledged transactions.
pub fn set_unacked_transactions(count: u32) {
    gauge!("sync_unacked_transactions").set(count as f64);
}

/// Record an RPC call outcome (`ok`, `error`, `timeout`).
pub fn record_rpc_call(method: &str, outcome: &str, duration: Duration) {
    counter!(
        "sync_rpc_calls_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("sync_rpc_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a response that arrived after its call timed out.
pub fn record_rpc_late_response(method: &str) {
    counter!("sync_rpc_late_responses_total", "method" => method.to_string()).increment(1);
}

/// Record a fully delivered subscription.
pub fn record_subscription_delivered(shapes: usize, rows: usize) {
    counter!("sync_subscriptions_delivered_total").increment(1);
    counter!("sync_subscription_rows_total").increment(rows as u64);
    histogram!("sync_subscription_shapes").record(shapes as f64);
}

/// Record a failed subscription by error code.
pub fn record_subscription_error(code: &str) {
    counter!("sync_subscription_errors_total", "code" => code.to_string()).increment(1);
}

/// Record a connection attempt.
pub fn record_connection_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("sync_connection_attempts_total", "status" => status).increment(1);
}

/// Record errors by code.
pub fn record_error(code: &str) {
    counter!("sync_errors_total", "code" => code.to_string()).increment(1);
}

/// Gauge for the process state.
pub fn set_process_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("sync_process_state").set(value);
}

/// Gauge for connectivity (0=disconnected, 1=connected).
pub fn set_connectivity(state: &str) {
    let value = match state {
        "disconnected" => 0.0,
        "connected" => 1.0,
        _ => -1.0,
    };
    gauge!("sync_connectivity_state").set(value);
}

/// Record a SQLite busy retry in the adapter.
pub fn record_db_busy_retry(operation: &str) {
    counter!("sync_db_busy_retries_total", "operation" => operation.to_string()).increment(1);
}
