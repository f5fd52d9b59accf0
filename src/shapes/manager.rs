// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription lifecycle.
//!
//! ```text
//!  subscription_requested          subscription_delivered
//! ─────────────────────► in flight ──────────────────────► fulfilled
//!                            │                                 │ unsubscribe
//!       subscription_cancelled                                 ▼
//!                            ▼                       cancelling (until the
//!                          gone                       gone batch arrives)
//! ```
//!
//! Two subscriptions may never share an id, nor a shape hash: a caller
//! asking for shapes that are already in flight or fulfilled should reuse
//! that subscription ([`ShapeManager::get_duplicating_subscription`]).
//!
//! Fulfilled subscriptions survive restarts through
//! [`serialize`](ShapeManager::serialize) and
//! [`set_state`](ShapeManager::set_state).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::BoxFuture;
use crate::error::{ErrorCode, Result, SyncError};
use crate::shapes::types::{
    hash_shapes, tables_for_shapes, Shape, ShapeDefinition, ShapeRequest, SubscriptionData,
};

/// Called with the shapes being dropped so their rows can be purged.
pub type GarbageCollectShapeHandler =
    Arc<dyn Fn(Vec<ShapeDefinition>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Existing subscription covering the same shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateSubscription {
    InFlight(String),
    Fulfilled(String),
}

impl DuplicateSubscription {
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::InFlight(id) | Self::Fulfilled(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Requested, data not delivered yet.
    Establishing,
    /// Data delivered and applied.
    Active,
    /// Unsubscribed, waiting for the server to confirm the rows are gone.
    Cancelling,
    /// Unknown subscription.
    None,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    fulfilled: BTreeMap<String, Vec<ShapeDefinition>>,
    #[serde(default)]
    unsubscribes: Vec<String>,
}

/// Tracks requested, in-flight and fulfilled subscriptions.
pub struct ShapeManager {
    in_flight: HashMap<String, Vec<ShapeRequest>>,
    fulfilled: BTreeMap<String, Vec<ShapeDefinition>>,
    /// Shape hash to subscription id.
    by_hash: HashMap<String, String>,
    incomplete_unsubscribes: HashSet<String>,
    gc_handler: Option<GarbageCollectShapeHandler>,
}

impl std::fmt::Debug for ShapeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeManager")
            .field("in_flight", &self.in_flight.keys().collect::<Vec<_>>())
            .field("fulfilled", &self.fulfilled.keys().collect::<Vec<_>>())
            .field("incomplete_unsubscribes", &self.incomplete_unsubscribes)
            .finish()
    }
}

fn requests_hash(requests: &[ShapeRequest]) -> String {
    let shapes: Vec<Shape> = requests.iter().map(|r| r.definition.clone()).collect();
    hash_shapes(&shapes)
}

fn definitions_hash(definitions: &[ShapeDefinition]) -> String {
    let shapes: Vec<Shape> = definitions.iter().map(|d| d.definition.clone()).collect();
    hash_shapes(&shapes)
}

impl ShapeManager {
    pub fn new(gc_handler: Option<GarbageCollectShapeHandler>) -> Self {
        Self {
            in_flight: HashMap::new(),
            fulfilled: BTreeMap::new(),
            by_hash: HashMap::new(),
            incomplete_unsubscribes: HashSet::new(),
            gc_handler,
        }
    }

    /// Register a subscription about to be sent.
    pub fn subscription_requested(&mut self, subscription_id: &str, requests: Vec<ShapeRequest>) -> Result<()> {
        if self.in_flight.contains_key(subscription_id) || self.fulfilled.contains_key(subscription_id) {
            return Err(SyncError::new(
                ErrorCode::SubscriptionAlreadyExists,
                format!("a subscription with id {subscription_id} already exists"),
            ));
        }

        let hash = requests_hash(&requests);
        if let Some(existing) = self.by_hash.get(&hash) {
            return Err(SyncError::new(
                ErrorCode::SubscriptionAlreadyExists,
                format!(
                    "subscription {existing} has exactly the same shape requests; \
                     use get_duplicating_subscription to reuse it"
                ),
            ));
        }

        debug!(subscription_id, shapes = requests.len(), "subscription requested");
        self.in_flight.insert(subscription_id.to_string(), requests);
        self.by_hash.insert(hash, subscription_id.to_string());
        Ok(())
    }

    /// The request failed or was abandoned before delivery.
    pub fn subscription_cancelled(&mut self, subscription_id: &str) {
        if self.in_flight.remove(subscription_id).is_some() {
            debug!(subscription_id, "subscription cancelled");
        }
        self.remove_from_hash(subscription_id);
    }

    /// Data for an in-flight subscription was applied. Unknown or already
    /// unsubscribed ids are ignored.
    pub fn subscription_delivered(&mut self, data: &SubscriptionData) {
        let Some(requests) = self.in_flight.remove(&data.subscription_id) else {
            debug!(subscription_id = %data.subscription_id, "delivery for unknown subscription ignored");
            return;
        };

        let definitions: Vec<ShapeDefinition> = requests
            .into_iter()
            .map(|req| ShapeDefinition {
                uuid: data
                    .shape_req_to_uuid
                    .get(&req.request_id)
                    .cloned()
                    .unwrap_or_default(),
                definition: req.definition,
            })
            .collect();
        info!(subscription_id = %data.subscription_id, shapes = definitions.len(), "subscription fulfilled");
        self.fulfilled.insert(data.subscription_id.clone(), definitions);
    }

    pub fn shapes_for_active_subscription(&self, subscription_id: &str) -> Option<&[ShapeDefinition]> {
        self.fulfilled.get(subscription_id).map(Vec::as_slice)
    }

    pub fn fulfilled_subscriptions(&self) -> Vec<String> {
        self.fulfilled.keys().cloned().collect()
    }

    /// All shapes of fulfilled subscriptions.
    pub fn fulfilled_shapes(&self) -> Vec<ShapeDefinition> {
        self.fulfilled.values().flatten().cloned().collect()
    }

    pub fn get_duplicating_subscription(&self, shapes: &[Shape]) -> Option<DuplicateSubscription> {
        let id = self.by_hash.get(&hash_shapes(shapes))?;
        if self.in_flight.contains_key(id) {
            Some(DuplicateSubscription::InFlight(id.clone()))
        } else {
            Some(DuplicateSubscription::Fulfilled(id.clone()))
        }
    }

    pub fn status(&self, subscription_id: &str) -> SyncStatus {
        if self.incomplete_unsubscribes.contains(subscription_id) {
            SyncStatus::Cancelling
        } else if self.in_flight.contains_key(subscription_id) {
            SyncStatus::Establishing
        } else if self.fulfilled.contains_key(subscription_id) {
            SyncStatus::Active
        } else {
            SyncStatus::None
        }
    }

    /// Drop subscriptions. The garbage collection handler sees the dropped
    /// shapes before any bookkeeping is cleared.
    pub async fn unsubscribe(&mut self, subscription_ids: &[String]) -> Result<Vec<String>> {
        let shapes: Vec<ShapeDefinition> = subscription_ids
            .iter()
            .filter_map(|id| self.fulfilled.get(id))
            .flatten()
            .cloned()
            .collect();

        if let Some(gc) = &self.gc_handler {
            gc(shapes).await?;
        }

        for id in subscription_ids {
            self.in_flight.remove(id);
            if self.fulfilled.remove(id).is_some() {
                self.incomplete_unsubscribes.insert(id.clone());
            }
            self.remove_from_hash(id);
        }
        info!(subscriptions = ?subscription_ids, "unsubscribed");
        Ok(subscription_ids.to_vec())
    }

    pub async fn unsubscribe_all(&mut self) -> Result<Vec<String>> {
        let ids = self.fulfilled_subscriptions();
        self.unsubscribe(&ids).await
    }

    /// Subscriptions the server still has to confirm as gone.
    pub fn incomplete_unsubscribes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.incomplete_unsubscribes.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// The server removed the rows of these subscriptions.
    pub fn gone_batch_delivered(&mut self, subscription_ids: &[String]) {
        for id in subscription_ids {
            self.incomplete_unsubscribes.remove(id);
        }
    }

    /// Tables covered by fulfilled subscriptions.
    pub fn subscribed_tables(&self) -> Vec<String> {
        let shapes: Vec<Shape> = self
            .fulfilled
            .values()
            .flatten()
            .map(|d| d.definition.clone())
            .collect();
        tables_for_shapes(&shapes)
    }

    /// Forget everything, returning the shapes that were fulfilled.
    pub fn reset(&mut self) -> Vec<ShapeDefinition> {
        let shapes = self.fulfilled_shapes();
        self.in_flight.clear();
        self.fulfilled.clear();
        self.by_hash.clear();
        self.incomplete_unsubscribes.clear();
        shapes
    }

    pub fn serialize(&self) -> Result<String> {
        let mut unsubscribes = self.incomplete_unsubscribes();
        unsubscribes.sort();
        Ok(serde_json::to_string(&PersistedState {
            fulfilled: self.fulfilled.clone(),
            unsubscribes,
        })?)
    }

    /// Restore fulfilled subscriptions. In-flight ones are not persisted.
    pub fn set_state(&mut self, serialized: &str) -> Result<()> {
        let state: PersistedState = if serialized.trim().is_empty() {
            PersistedState::default()
        } else {
            serde_json::from_str(serialized)?
        };

        self.in_flight.clear();
        self.by_hash = state
            .fulfilled
            .iter()
            .map(|(id, defs)| (definitions_hash(defs), id.clone()))
            .collect();
        self.fulfilled = state.fulfilled;
        self.incomplete_unsubscribes = state.unsubscribes.into_iter().collect();
        Ok(())
    }

    fn remove_from_hash(&mut self, subscription_id: &str) {
        self.by_hash.retain(|_, id| id != subscription_id);
    }
}
