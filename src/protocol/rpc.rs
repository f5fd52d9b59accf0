// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request/response over the replication socket.
//!
//! Every client-initiated call is wrapped in a [`SatRpcRequest`] carrying a
//! per-connection request id (starting at 1). Pending calls are keyed by
//! `method/request_id`. A call that times out is moved to a timed-out set
//! so that its eventual response is logged instead of being reported as
//! unexpected. Entries older than a few timeouts are pruned from that set.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::codec;
use super::messages::{RpcResult, SatErrorResp, SatMessage, SatRpcRequest, SatRpcResponse};
use super::transport::Transport;
use crate::adapter::BoxFuture;
use crate::error::{ErrorCode, Result, SyncError};

/// Method names understood by the server.
pub mod methods {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const START_REPLICATION: &str = "startReplication";
    pub const STOP_REPLICATION: &str = "stopReplication";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
}

/// Something that can perform a remote call.
pub trait RpcService: Send + Sync {
    fn request<'a>(&'a self, method: &'a str, message: SatMessage) -> BoxFuture<'a, SatMessage>;
}

type PendingCall = oneshot::Sender<Result<Vec<u8>>>;

/// Timed-out calls are remembered for this many timeouts.
const TIMED_OUT_RETENTION: u32 = 4;

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicU32,
    pending: DashMap<String, PendingCall>,
    timed_out: DashMap<String, tokio::time::Instant>,
    timeout: Option<Duration>,
}

fn call_key(method: &str, request_id: u32) -> String {
    format!("{method}/{request_id}")
}

impl RpcClient {
    /// `timeout` of `None` waits for responses indefinitely.
    pub fn new(transport: Arc<dyn Transport>, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
            timed_out: DashMap::new(),
            timeout,
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    async fn call(&self, method: &str, message: SatMessage) -> Result<SatMessage> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = call_key(method, request_id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let frame = codec::encode(&SatMessage::RpcRequest(SatRpcRequest {
            method: method.to_string(),
            request_id,
            message: codec::encode(&message).to_vec(),
        }));
        if let Err(e) = self.transport.send(frame).await {
            self.pending.remove(&key);
            return Err(e);
        }

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&key);
                    self.remember_timed_out(key, limit);
                    return Err(SyncError::new(
                        ErrorCode::Timeout,
                        format!("{method} timed out after {limit:?}"),
                    ));
                }
            },
            None => rx.await,
        };

        match response {
            Ok(Ok(bytes)) => codec::decode(&bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::new(
                ErrorCode::ConnectionCancelledByDisconnect,
                format!("connection closed while waiting for {method}"),
            )),
        }
    }

    fn remember_timed_out(&self, key: String, limit: Duration) {
        let now = tokio::time::Instant::now();
        let keep = limit * TIMED_OUT_RETENTION;
        self.timed_out.retain(|_, at| now.duration_since(*at) < keep);
        self.timed_out.insert(key, now);
    }

    /// Route a response to its waiting call.
    pub fn handle_response(&self, response: SatRpcResponse) {
        let key = call_key(&response.method, response.request_id);

        if let Some((_, tx)) = self.pending.remove(&key) {
            let outcome = match response.result {
                Some(RpcResult::Message(bytes)) => Ok(bytes),
                Some(RpcResult::Error(err)) => {
                    warn!(method = %response.method, request_id = response.request_id, error = ?err, "RPC call failed");
                    Err(err.into_error())
                }
                None => Err(SyncError::protocol_violation(format!(
                    "empty response to {}",
                    response.method
                ))),
            };
            // The caller may have gone away; nothing to do then.
            let _ = tx.send(outcome);
        } else if let Some((_, at)) = self.timed_out.remove(&key) {
            debug!(
                method = %response.method,
                request_id = response.request_id,
                late_by_ms = at.elapsed().as_millis() as u64,
                "response to a timed-out call"
            );
            crate::metrics::record_rpc_late_response(&response.method);
        } else {
            warn!(method = %response.method, request_id = response.request_id, "unexpected RPC response");
        }
    }

    /// Answer a server-initiated call.
    pub async fn respond(&self, request: &SatRpcRequest, result: RpcResult) -> Result<()> {
        let frame = codec::encode(&SatMessage::RpcResponse(SatRpcResponse {
            method: request.method.clone(),
            request_id: request.request_id,
            result: Some(result),
        }));
        self.transport.send(frame).await
    }

    pub async fn respond_error(&self, request: &SatRpcRequest, error: SatErrorResp) -> Result<()> {
        self.respond(request, RpcResult::Error(error)).await
    }

    /// Fail every pending call. Used when the connection drops.
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(SyncError::new(
                    ErrorCode::ConnectionCancelledByDisconnect,
                    format!("{key} cancelled by disconnect"),
                )));
            }
        }
        self.timed_out.clear();
        self.next_id.store(1, Ordering::Relaxed);
    }
}

impl RpcService for RpcClient {
    fn request<'a>(&'a self, method: &'a str, message: SatMessage) -> BoxFuture<'a, SatMessage> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.call(method, message).await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) if e.code() == ErrorCode::Timeout => "timeout",
                Err(_) => "error",
            };
            crate::metrics::record_rpc_call(method, outcome, started.elapsed());
            result
        })
    }
}

/// Debug logging around every call.
pub struct LoggedRpc<S> {
    inner: S,
}

impl<S> LoggedRpc<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: RpcService> RpcService for LoggedRpc<S> {
    fn request<'a>(&'a self, method: &'a str, message: SatMessage) -> BoxFuture<'a, SatMessage> {
        Box::pin(async move {
            debug!(method, request = message.name(), "sending RPC request");
            let result = self.inner.request(method, message).await;
            match &result {
                Ok(response) => debug!(method, response = response.name(), "received RPC response"),
                Err(e) => debug!(method, error = %e, "RPC request failed"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ErrorRespCode, SatInStartReplicationResp};
    use crate::protocol::transport::TransportEvent;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Bytes>>,
    }

    impl Transport for RecordingTransport {
        fn connect(&self, _url: &str) -> BoxFuture<'_, mpsc::Receiver<TransportEvent>> {
            Box::pin(async {
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            })
        }

        fn send(&self, frame: Bytes) -> BoxFuture<'_, ()> {
            self.sent.lock().push(frame);
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    async fn next_request(transport: &RecordingTransport) -> SatRpcRequest {
        loop {
            if let Some(frame) = transport.sent.lock().pop() {
                match codec::decode(&frame).unwrap() {
                    SatMessage::RpcRequest(req) => return req,
                    other => panic!("expected an RPC request, got {other:?}"),
                }
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = Arc::new(RpcClient::new(transport.clone(), Some(Duration::from_secs(5))));

        let caller = rpc.clone();
        let call = tokio::spawn(async move {
            caller
                .request(methods::STOP_REPLICATION, SatMessage::InStopReplicationReq)
                .await
        });

        let req = next_request(&transport).await;
        assert_eq!(req.method, "stopReplication");
        assert_eq!(req.request_id, 1);
        assert_eq!(codec::decode(&req.message).unwrap(), SatMessage::InStopReplicationReq);

        rpc.handle_response(SatRpcResponse {
            method: req.method,
            request_id: req.request_id,
            result: Some(RpcResult::Message(codec::encode(&SatMessage::InStopReplicationResp).to_vec())),
        });
        assert_eq!(call.await.unwrap().unwrap(), SatMessage::InStopReplicationResp);
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_call() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = Arc::new(RpcClient::new(transport.clone(), None));

        let caller = rpc.clone();
        let call = tokio::spawn(async move {
            caller
                .request(methods::START_REPLICATION, SatMessage::InStartReplicationResp(SatInStartReplicationResp::default()))
                .await
        });

        let req = next_request(&transport).await;
        rpc.handle_response(SatRpcResponse {
            method: req.method,
            request_id: req.request_id,
            result: Some(RpcResult::Error(SatErrorResp::new(ErrorRespCode::AuthRequired, "log in"))),
        });
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthRequired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = RpcClient::new(transport.clone(), Some(Duration::from_millis(100)));

        let err = rpc
            .request(methods::SUBSCRIBE, SatMessage::PingReq)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(rpc.pending_calls(), 0);

        // Logged and dropped.
        rpc.handle_response(SatRpcResponse {
            method: "subscribe".into(),
            request_id: 1,
            result: Some(RpcResult::Message(vec![])),
        });
        assert!(rpc.timed_out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_timed_out_calls_are_pruned() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = RpcClient::new(transport.clone(), Some(Duration::from_millis(100)));

        for i in 0..3 {
            if i > 0 {
                tokio::time::advance(Duration::from_secs(1)).await;
            }
            let err = rpc
                .request(methods::SUBSCRIBE, SatMessage::PingReq)
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::Timeout);
        }
        assert_eq!(rpc.timed_out.len(), 1);
        assert!(rpc.timed_out.contains_key("subscribe/3"));

        // Recent ones are kept.
        rpc.request(methods::SUBSCRIBE, SatMessage::PingReq).await.unwrap_err();
        assert_eq!(rpc.timed_out.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_on_disconnect() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = Arc::new(RpcClient::new(transport.clone(), None));

        let caller = rpc.clone();
        let call = tokio::spawn(async move { caller.request(methods::UNSUBSCRIBE, SatMessage::PingReq).await });
        next_request(&transport).await;

        rpc.cancel_all();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionCancelledByDisconnect);
    }

    #[tokio::test]
    async fn test_request_ids_increment() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = Arc::new(RpcClient::new(transport.clone(), None));

        for expected in 1..=3u32 {
            let caller = rpc.clone();
            tokio::spawn(async move { caller.request(methods::SUBSCRIBE, SatMessage::PingReq).await });
            assert_eq!(next_request(&transport).await.request_id, expected);
        }
        assert_eq!(rpc.pending_calls(), 3);
    }

    #[tokio::test]
    async fn test_logged_rpc_passes_through() {
        let transport = Arc::new(RecordingTransport::default());
        let rpc = Arc::new(LoggedRpc::new(RpcClient::new(transport.clone(), None)));

        let caller = rpc.clone();
        let call = tokio::spawn(async move { caller.request(methods::UNSUBSCRIBE, SatMessage::PingReq).await });
        let req = next_request(&transport).await;
        rpc.inner().handle_response(SatRpcResponse {
            method: req.method,
            request_id: req.request_id,
            result: Some(RpcResult::Message(codec::encode(&SatMessage::UnsubsResp).to_vec())),
        });
        assert_eq!(call.await.unwrap().unwrap(), SatMessage::UnsubsResp);
    }
}
