// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription data delivery validator.
//!
//! Shape data arrives as a strict message sequence:
//!
//! ```text
//! SubsResp
//!   └─► SubsDataBegin
//!         ├─► ShapeDataBegin ─► OpLog(insert)* ─► ShapeDataEnd   (once per shape)
//!         └─► SubsDataEnd  ──► SubscriptionData
//! ```
//!
//! Any deviation resets the cache and fails the subscription. A delivery is
//! only handed out once `SubsDataEnd` arrives, so partial data never leaks.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{ErrorCode, Result, SyncError};
use crate::protocol::messages::{
    SatShapeDataBegin, SatSubsDataBegin, SatSubsDataError, SatSubsReq, SatSubsResp, SatTransOp,
};
use crate::protocol::row::{deserialize_row, ValueCodec};
use crate::shapes::types::{InitialDataChange, SubscriptionData};
use crate::types::{Lsn, Relation};

#[derive(Debug)]
struct Delivery {
    subscription_id: String,
    lsn: Lsn,
    ops: Vec<SatTransOp>,
    shape_req_to_uuid: HashMap<String, String>,
}

/// Accumulates shape data for the subscription being delivered.
#[derive(Debug, Default)]
pub struct SubscriptionDataCache {
    /// Subscription id to the shape request ids it asked for.
    requested: HashMap<String, HashSet<String>>,
    remaining_shapes: HashSet<String>,
    current_shape_request_id: Option<String>,
    in_delivery: Option<Delivery>,
}

fn unexpected(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::UnexpectedSubscriptionState, message)
}

impl SubscriptionDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between `SubsDataBegin` and `SubsDataEnd`.
    pub fn is_delivering(&self) -> bool {
        self.in_delivery.is_some()
    }

    pub fn delivering_subscription(&self) -> Option<&str> {
        self.in_delivery.as_ref().map(|d| d.subscription_id.as_str())
    }

    pub fn subscription_request(&mut self, request: &SatSubsReq) {
        let ids = request
            .shape_requests
            .iter()
            .map(|r| r.request_id.clone())
            .collect();
        self.requested.insert(request.subscription_id.clone(), ids);
    }

    pub fn subscription_response(&mut self, response: &SatSubsResp) -> Result<()> {
        if !self.requested.contains_key(&response.subscription_id) {
            return Err(self.internal_error(unexpected(format!(
                "Received subscribe response for unknown subscription {}",
                response.subscription_id
            ))));
        }
        Ok(())
    }

    pub fn subscription_data_begin(&mut self, begin: &SatSubsDataBegin) -> Result<()> {
        let Some(shapes) = self.requested.get(&begin.subscription_id).cloned() else {
            return Err(self.internal_error(unexpected(format!(
                "Received SatSubsDataBegin for subscription {} which was not requested",
                begin.subscription_id
            ))));
        };
        if let Some(current) = &self.in_delivery {
            let message = format!(
                "Received SatSubsDataBegin for subscription {} while delivery of {} is in progress",
                begin.subscription_id, current.subscription_id
            );
            return Err(self.internal_error(unexpected(message)));
        }

        self.remaining_shapes = shapes;
        self.current_shape_request_id = None;
        self.in_delivery = Some(Delivery {
            subscription_id: begin.subscription_id.clone(),
            lsn: Lsn::new(begin.lsn.clone()),
            ops: Vec::new(),
            shape_req_to_uuid: HashMap::new(),
        });
        debug!(subscription_id = %begin.subscription_id, "subscription data delivery started");
        Ok(())
    }

    pub fn shape_data_begin(&mut self, begin: &SatShapeDataBegin) -> Result<()> {
        let problem = match &self.in_delivery {
            None => Some("Received SatShapeDataBegin but no subscription is being delivered".to_string()),
            Some(_) if self.remaining_shapes.is_empty() => Some(
                "Received SatShapeDataBegin but all shapes have already been delivered".to_string(),
            ),
            Some(_) if self.current_shape_request_id.is_some() => Some(
                "Received SatShapeDataBegin while another shape is being delivered".to_string(),
            ),
            Some(d) if d.shape_req_to_uuid.contains_key(&begin.request_id) => Some(format!(
                "Received SatShapeDataBegin for shape {} which was already delivered",
                begin.request_id
            )),
            Some(_) if !self.remaining_shapes.contains(&begin.request_id) => Some(format!(
                "Received SatShapeDataBegin for shape {} which was not requested",
                begin.request_id
            )),
            Some(_) => None,
        };
        if let Some(message) = problem {
            return Err(self.internal_error(unexpected(message)));
        }

        if let Some(d) = self.in_delivery.as_mut() {
            d.shape_req_to_uuid
                .insert(begin.request_id.clone(), begin.uuid.clone());
        }
        self.current_shape_request_id = Some(begin.request_id.clone());
        Ok(())
    }

    pub fn shape_data_end(&mut self) -> Result<()> {
        if self.in_delivery.is_none() {
            return Err(self.internal_error(unexpected(
                "Received SatShapeDataEnd but no subscription is being delivered",
            )));
        }
        let Some(current) = self.current_shape_request_id.take() else {
            return Err(self.internal_error(unexpected(
                "Received SatShapeDataEnd but no shape is being delivered",
            )));
        };
        self.remaining_shapes.remove(&current);
        Ok(())
    }

    /// Buffer a batch of shape rows. Only inserts are legal here.
    pub fn transaction(&mut self, ops: Vec<SatTransOp>) -> Result<()> {
        if self.current_shape_request_id.is_none() {
            return Err(self.internal_error(unexpected(
                "Received SatOpLog during subscription delivery outside of a shape",
            )));
        }
        if let Some(op) = ops.iter().find(|op| !matches!(op, SatTransOp::Insert(_))) {
            let kind = op.kind();
            return Err(self.internal_error(SyncError::new(
                ErrorCode::UnexpectedMessageType,
                format!("Received {kind} operation inside shape data, only inserts are allowed"),
            )));
        }
        if let Some(d) = self.in_delivery.as_mut() {
            d.ops.extend(ops);
        }
        Ok(())
    }

    /// Close the delivery and materialize its rows.
    pub fn subscription_data_end(
        &mut self,
        relations: &HashMap<u32, Relation>,
        codec: &dyn ValueCodec,
    ) -> Result<SubscriptionData> {
        if self.in_delivery.is_none() {
            return Err(self.internal_error(unexpected(
                "Received SatSubsDataEnd but no subscription is being delivered",
            )));
        }
        if !self.remaining_shapes.is_empty() || self.current_shape_request_id.is_some() {
            let message = format!(
                "Received SatSubsDataEnd with {} shapes still undelivered",
                self.remaining_shapes.len()
            );
            return Err(self.internal_error(unexpected(message)));
        }

        let Some(delivery) = self.in_delivery.take() else {
            return Err(self.internal_error(unexpected("delivery vanished")));
        };
        let data = match materialize(&delivery.ops, relations, codec) {
            Ok(data) => data,
            Err(e) => return Err(self.internal_error(e)),
        };

        self.reset(&delivery.subscription_id);
        crate::metrics::record_subscription_delivered(delivery.shape_req_to_uuid.len(), data.len());
        Ok(SubscriptionData {
            subscription_id: delivery.subscription_id,
            lsn: delivery.lsn,
            data,
            shape_req_to_uuid: delivery.shape_req_to_uuid,
        })
    }

    /// The server reported the subscription as failed.
    pub fn subscription_error(&mut self, subscription_id: &str) -> Result<()> {
        if !self.requested.contains_key(subscription_id) {
            return Err(self.internal_error(SyncError::new(
                ErrorCode::SubscriptionNotFound,
                format!("Received subscription error for unknown subscription {subscription_id}"),
            )));
        }
        self.reset(subscription_id);
        Ok(())
    }

    /// The server failed delivering shape data. Always yields an error.
    pub fn subscription_data_error(&mut self, error: SatSubsDataError) -> SyncError {
        if self.in_delivery.is_none() {
            let message = format!(
                "Received subscription data error for {} but no subscription is being delivered: {}",
                error.subscription_id, error.message
            );
            return self.internal_error(unexpected(message));
        }
        let subscription_id = error.subscription_id.clone();
        self.reset(&subscription_id);
        error.into_error()
    }

    /// Forget `subscription_id`. Clears the delivery only if it is the one
    /// in progress.
    pub fn reset(&mut self, subscription_id: &str) {
        self.requested.remove(subscription_id);
        if self.delivering_subscription() == Some(subscription_id) {
            self.in_delivery = None;
            self.remaining_shapes.clear();
            self.current_shape_request_id = None;
        }
    }

    /// Reset everything for the subscription in delivery and hand back the
    /// error.
    fn internal_error(&mut self, error: SyncError) -> SyncError {
        warn!(error = %error, "subscription delivery aborted");
        crate::metrics::record_subscription_error(error.code().as_str());
        if let Some(id) = self.delivering_subscription().map(str::to_string) {
            self.reset(&id);
        }
        self.in_delivery = None;
        self.remaining_shapes.clear();
        self.current_shape_request_id = None;
        error
    }
}

fn materialize(
    ops: &[SatTransOp],
    relations: &HashMap<u32, Relation>,
    codec: &dyn ValueCodec,
) -> Result<Vec<InitialDataChange>> {
    ops.iter()
        .filter_map(|op| match op {
            SatTransOp::Insert(insert) => Some(insert),
            _ => None,
        })
        .map(|insert| {
            let relation = relations.get(&insert.relation_id).ok_or_else(|| {
                SyncError::protocol_violation(format!(
                    "subscription data references unknown relation {}",
                    insert.relation_id
                ))
            })?;
            Ok(InitialDataChange {
                relation: relation.clone(),
                record: deserialize_row(&insert.row_data, relation, codec)?,
                tags: insert.tags.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        SatOpBegin, SatOpInsert, SatShapeRequest, SatShapeSelect, ShapeDataError,
        ShapeDataErrorCode, SubsDataErrorCode,
    };
    use crate::protocol::row::tests::relation;
    use crate::protocol::row::{serialize_row, TextCodec};
    use crate::types::{Record, SqlValue};

    fn request(sub: &str, shapes: &[&str]) -> SatSubsReq {
        SatSubsReq {
            subscription_id: sub.into(),
            shape_requests: shapes
                .iter()
                .map(|id| SatShapeRequest {
                    request_id: id.to_string(),
                    selects: vec![SatShapeSelect {
                        tablename: "items".into(),
                        where_clause: None,
                        include: vec![],
                    }],
                })
                .collect(),
        }
    }

    fn relations() -> HashMap<u32, Relation> {
        HashMap::from([(1, relation())])
    }

    fn insert(id: &str) -> SatTransOp {
        let record: Record = [("id".to_string(), SqlValue::Text(id.into()))].into();
        SatTransOp::Insert(SatOpInsert {
            relation_id: 1,
            row_data: serialize_row(&record, &relation(), &TextCodec).unwrap(),
            tags: vec!["server@1".into()],
        })
    }

    fn begin(sub: &str) -> SatSubsDataBegin {
        SatSubsDataBegin {
            subscription_id: sub.into(),
            lsn: vec![7],
        }
    }

    fn shape(req: &str) -> SatShapeDataBegin {
        SatShapeDataBegin {
            request_id: req.into(),
            uuid: format!("uuid-{req}"),
        }
    }

    fn accepted(sub: &str, shapes: &[&str]) -> SubscriptionDataCache {
        let mut cache = SubscriptionDataCache::new();
        cache.subscription_request(&request(sub, shapes));
        cache
            .subscription_response(&SatSubsResp {
                subscription_id: sub.into(),
                err: None,
            })
            .unwrap();
        cache
    }

    #[test]
    fn test_well_formed_delivery() {
        let mut cache = accepted("sub", &["r1", "r2"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        assert!(cache.is_delivering());

        cache.shape_data_begin(&shape("r1")).unwrap();
        cache.transaction(vec![insert("a"), insert("b")]).unwrap();
        cache.shape_data_end().unwrap();
        cache.shape_data_begin(&shape("r2")).unwrap();
        cache.transaction(vec![insert("c")]).unwrap();
        cache.shape_data_end().unwrap();

        let data = cache.subscription_data_end(&relations(), &TextCodec).unwrap();
        assert_eq!(data.subscription_id, "sub");
        assert_eq!(data.lsn, Lsn::new(vec![7]));
        assert_eq!(data.data.len(), 3);
        assert_eq!(data.data[2].record["id"], SqlValue::Text("c".into()));
        assert_eq!(data.shape_req_to_uuid["r2"], "uuid-r2");
        assert!(!cache.is_delivering());
    }

    #[test]
    fn test_response_for_unknown_subscription() {
        let mut cache = SubscriptionDataCache::new();
        let err = cache
            .subscription_response(&SatSubsResp {
                subscription_id: "nope".into(),
                err: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    }

    #[test]
    fn test_second_begin_while_delivering() {
        let mut cache = accepted("a", &["r1"]);
        cache.subscription_request(&request("b", &["r2"]));
        cache.subscription_data_begin(&begin("a")).unwrap();
        let err = cache.subscription_data_begin(&begin("b")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
        assert!(!cache.is_delivering());
    }

    #[test]
    fn test_shape_begin_without_delivery() {
        let mut cache = accepted("sub", &["r1"]);
        let err = cache.shape_data_begin(&shape("r1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    }

    #[test]
    fn test_shape_delivered_twice() {
        let mut cache = accepted("sub", &["r1", "r2"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        cache.shape_data_begin(&shape("r1")).unwrap();
        cache.shape_data_end().unwrap();
        let err = cache.shape_data_begin(&shape("r1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
        // Reset: the subscription is forgotten.
        assert!(cache.subscription_data_begin(&begin("sub")).is_err());
    }

    #[test]
    fn test_nested_shape_begin() {
        let mut cache = accepted("sub", &["r1", "r2"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        cache.shape_data_begin(&shape("r1")).unwrap();
        assert!(cache.shape_data_begin(&shape("r2")).is_err());
    }

    #[test]
    fn test_non_insert_op_in_shape() {
        let mut cache = accepted("sub", &["r1"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        cache.shape_data_begin(&shape("r1")).unwrap();
        let err = cache
            .transaction(vec![SatTransOp::Begin(SatOpBegin {
                commit_timestamp: 0,
                lsn: vec![],
                origin: None,
                is_migration: false,
                transaction_id: None,
            })])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedMessageType);
        assert!(!cache.is_delivering());
    }

    #[test]
    fn test_rows_outside_shape() {
        let mut cache = accepted("sub", &["r1"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        let err = cache.transaction(vec![insert("a")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    }

    #[test]
    fn test_end_with_missing_shapes() {
        let mut cache = accepted("sub", &["r1", "r2"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        cache.shape_data_begin(&shape("r1")).unwrap();
        cache.shape_data_end().unwrap();
        let err = cache.subscription_data_end(&relations(), &TextCodec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    }

    #[test]
    fn test_unknown_relation_in_rows() {
        let mut cache = accepted("sub", &["r1"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        cache.shape_data_begin(&shape("r1")).unwrap();
        cache.transaction(vec![insert("a")]).unwrap();
        cache.shape_data_end().unwrap();
        let err = cache.subscription_data_end(&HashMap::new(), &TextCodec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_subscription_error_unknown_id() {
        let mut cache = SubscriptionDataCache::new();
        let err = cache.subscription_error("ghost").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubscriptionNotFound);
    }

    #[test]
    fn test_data_error_resets_delivery() {
        let mut cache = accepted("sub", &["r1"]);
        cache.subscription_data_begin(&begin("sub")).unwrap();
        let err = cache.subscription_data_error(SatSubsDataError {
            code: SubsDataErrorCode::ShapeDeliveryError,
            message: "too big".into(),
            subscription_id: "sub".into(),
            shape_request_errors: vec![ShapeDataError {
                code: ShapeDataErrorCode::ShapeSizeLimitExceeded,
                message: "limit".into(),
                request_id: "r1".into(),
            }],
        });
        assert_eq!(err.code(), ErrorCode::ShapeDeliveryError);
        assert!(err.is_subscription_error());
        assert!(!cache.is_delivering());
    }

    #[test]
    fn test_data_error_without_delivery() {
        let mut cache = SubscriptionDataCache::new();
        let err = cache.subscription_data_error(SatSubsDataError {
            code: SubsDataErrorCode::ShapeDeliveryError,
            message: "x".into(),
            subscription_id: "sub".into(),
            shape_request_errors: vec![],
        });
        assert_eq!(err.code(), ErrorCode::UnexpectedSubscriptionState);
    }

    #[test]
    fn test_reset_other_subscription_keeps_delivery() {
        let mut cache = accepted("a", &["r1"]);
        cache.subscription_request(&request("b", &["r2"]));
        cache.subscription_data_begin(&begin("a")).unwrap();
        cache.reset("b");
        assert_eq!(cache.delivering_subscription(), Some("a"));
    }
}
