//! Partial replication: shape definitions, the subscription lifecycle and
//! the shape data delivery validator.

pub mod cache;
pub mod manager;
pub mod types;

pub use cache::SubscriptionDataCache;
pub use manager::{DuplicateSubscription, GarbageCollectShapeHandler, ShapeManager, SyncStatus};
pub use types::{
    hash_shapes, tables_for_shapes, InitialDataChange, Shape, ShapeDefinition, ShapeRequest,
    SubscriptionData,
};
