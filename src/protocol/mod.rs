//! Replication wire protocol: messages, framing, row encoding, RPC
//! correlation, acknowledgements and the client state machine.

pub mod ack;
pub mod client;
pub mod codec;
pub mod messages;
pub mod row;
pub mod rpc;
pub mod transport;

pub use ack::AckWindow;
pub use client::{ClientEvent, ReplicationStatus, SatelliteClient};
pub use codec::{decode, encode};
pub use messages::{MessageType, SatMessage};
pub use row::{deserialize_row, serialize_row, ColumnKind, TextCodec, ValueCodec};
pub use rpc::{LoggedRpc, RpcClient, RpcService};
pub use transport::{Transport, TransportEvent};
