//! Shape and subscription data types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::messages::{SatChildRelation, SatShapeRequest, SatShapeSelect};
use crate::types::{Lsn, Record, Relation, Tag};

/// A table select, optionally filtered and following foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub tablename: String,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<IncludeRelation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeRelation {
    #[serde(rename = "foreignKey")]
    pub foreign_key: Vec<String>,
    pub select: Shape,
}

impl Shape {
    pub fn table(tablename: impl Into<String>) -> Self {
        Self {
            tablename: tablename.into(),
            where_clause: None,
            include: Vec::new(),
        }
    }

    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_include(mut self, foreign_key: Vec<String>, select: Shape) -> Self {
        self.include.push(IncludeRelation { foreign_key, select });
        self
    }

    /// Copy with include lists sorted, so equal shapes hash equally.
    fn normalized(&self) -> Shape {
        let mut include: Vec<IncludeRelation> = self
            .include
            .iter()
            .map(|rel| IncludeRelation {
                foreign_key: rel.foreign_key.clone(),
                select: rel.select.normalized(),
            })
            .collect();
        include.sort_by(|a, b| {
            (&a.select.tablename, &a.foreign_key).cmp(&(&b.select.tablename, &b.foreign_key))
        });
        Shape {
            tablename: self.tablename.clone(),
            where_clause: self.where_clause.clone(),
            include,
        }
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        if !out.contains(&self.tablename) {
            out.push(self.tablename.clone());
        }
        for rel in &self.include {
            rel.select.collect_tables(out);
        }
    }

    pub fn to_wire(&self) -> SatShapeSelect {
        SatShapeSelect {
            tablename: self.tablename.clone(),
            where_clause: self.where_clause.clone(),
            include: self
                .include
                .iter()
                .map(|rel| SatChildRelation {
                    foreign_key: rel.foreign_key.clone(),
                    select: rel.select.to_wire(),
                })
                .collect(),
        }
    }
}

/// Identity of a list of shapes: SHA-256 over their normalized JSON.
pub fn hash_shapes(shapes: &[Shape]) -> String {
    let normalized: Vec<Shape> = shapes.iter().map(Shape::normalized).collect();
    // Serializing plain strings and vectors cannot fail.
    let json = serde_json::to_vec(&normalized).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

/// Every table a list of shapes touches, includes followed, deduplicated.
pub fn tables_for_shapes(shapes: &[Shape]) -> Vec<String> {
    let mut out = Vec::new();
    for shape in shapes {
        shape.collect_tables(&mut out);
    }
    out
}

/// A shape as sent in a subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub definition: Shape,
}

impl ShapeRequest {
    pub fn to_wire(&self) -> SatShapeRequest {
        SatShapeRequest {
            request_id: self.request_id.clone(),
            selects: vec![self.definition.to_wire()],
        }
    }
}

/// A delivered shape, resolved to the server's shape uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDefinition {
    pub uuid: String,
    pub definition: Shape,
}

/// One row of initial subscription data.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialDataChange {
    pub relation: Relation,
    pub record: Record,
    pub tags: Vec<Tag>,
}

/// A completely delivered subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionData {
    pub subscription_id: String,
    /// Position at which the subscription became valid.
    pub lsn: Lsn,
    pub data: Vec<InitialDataChange>,
    /// Shape request id to server shape uuid.
    pub shape_req_to_uuid: HashMap<String, String>,
}
