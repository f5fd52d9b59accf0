//! Socket abstraction.
//!
//! The replication client only needs a framed, ordered, bidirectional
//! byte channel. Implementations deliver every received frame as a
//! [`TransportEvent::Message`] on the receiver returned by
//! [`Transport::connect`], followed by exactly one `Closed` or `Error`
//! when the connection ends.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::adapter::BoxFuture;
use crate::error::SyncError;

#[derive(Debug)]
pub enum TransportEvent {
    Message(Bytes),
    Closed,
    Error(SyncError),
}

pub trait Transport: Send + Sync {
    /// Open the connection and return the stream of incoming events.
    fn connect(&self, url: &str) -> BoxFuture<'_, mpsc::Receiver<TransportEvent>>;

    /// Send one complete frame.
    fn send(&self, frame: Bytes) -> BoxFuture<'_, ()>;

    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_connected(&self) -> bool;
}
