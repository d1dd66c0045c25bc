//! Query trees and their execution plan
//!
//! Leaves are term matches (stored / context fields, equality) or
//! vector queries (indexed tensor fields, the late-interaction
//! pipeline). Boolean combinators intersect or union result sets by doc
//! id and re-combine scores by sum.

use crate::index::{stored, TrainedState};
use crate::retriever::{CancelFn, Retriever, ScoredDoc, SearchOptions};
use crate::schema::Schema;
use crate::storage::Snapshot;
use crate::types::{DocId, FieldValue, TenantId, Tensor};
use crate::{LateError, Result};
use std::collections::BTreeMap;

/// One node of a query tree
#[derive(Debug, Clone)]
pub enum QueryNode {
    /// Equality match on a stored or context field, score 0
    Term { field: String, value: FieldValue },
    /// Late-interaction retrieval over an indexed tensor field
    Vector { field: String, tensor: Tensor },
    /// Intersection by doc id, scores summed
    And(Vec<QueryNode>),
    /// Union by doc id, scores summed
    Or(Vec<QueryNode>),
}

impl QueryNode {
    pub fn term(field: impl Into<String>, value: FieldValue) -> Self {
        QueryNode::Term {
            field: field.into(),
            value,
        }
    }

    pub fn vector(field: impl Into<String>, tensor: Tensor) -> Self {
        QueryNode::Vector {
            field: field.into(),
            tensor,
        }
    }
}

/// A compiled-and-ready query
#[derive(Debug, Clone)]
pub struct Query {
    pub root: QueryNode,
}

impl Query {
    pub fn new(root: QueryNode) -> Self {
        Self { root }
    }
}

/// Execute a node, returning doc -> score
pub(crate) fn execute_node(
    snap: &Snapshot,
    schema: &Schema,
    trained: &TrainedState,
    tenant: TenantId,
    node: &QueryNode,
    k: usize,
    opts: &SearchOptions,
    cancel: Option<&CancelFn>,
) -> Result<BTreeMap<DocId, f32>> {
    match node {
        QueryNode::Vector { field, tensor } => {
            let (field_id, decl) = schema
                .field(field)
                .ok_or_else(|| LateError::UnknownField(field.clone()))?;
            if !decl.is_indexed_tensor() {
                return Err(LateError::InvalidSchema(format!(
                    "field '{}' is not an indexed tensor field",
                    field
                )));
            }
            let retriever = Retriever::new(snap, trained);
            let hits = retriever.search(tenant, field_id, tensor, k, opts, cancel)?;
            Ok(hits
                .into_iter()
                .map(|ScoredDoc { doc_id, score }| (doc_id, score))
                .collect())
        }
        QueryNode::Term { field, value } => {
            let (field_id, decl) = schema
                .field(field)
                .ok_or_else(|| LateError::UnknownField(field.clone()))?;
            if !(decl.is_stored() || decl.is_context()) {
                return Err(LateError::InvalidSchema(format!(
                    "field '{}' is not stored, term match is impossible",
                    field
                )));
            }
            let mut out = BTreeMap::new();
            stored::scan_field(snap, tenant, field_id, |doc, stored_value| {
                if stored_value == *value {
                    out.insert(doc, 0.0f32);
                }
                Ok(())
            })?;
            Ok(out)
        }
        QueryNode::And(children) => {
            let mut iter = children.iter();
            let first = match iter.next() {
                Some(node) => {
                    execute_node(snap, schema, trained, tenant, node, k, opts, cancel)?
                }
                None => return Ok(BTreeMap::new()),
            };
            let mut acc = first;
            for node in iter {
                let next = execute_node(snap, schema, trained, tenant, node, k, opts, cancel)?;
                acc = acc
                    .into_iter()
                    .filter_map(|(doc, score)| {
                        next.get(&doc).map(|s| (doc, score + s))
                    })
                    .collect();
                if acc.is_empty() {
                    break;
                }
            }
            Ok(acc)
        }
        QueryNode::Or(children) => {
            let mut acc: BTreeMap<DocId, f32> = BTreeMap::new();
            for node in children {
                let next = execute_node(snap, schema, trained, tenant, node, k, opts, cancel)?;
                for (doc, score) in next {
                    *acc.entry(doc).or_insert(0.0) += score;
                }
            }
            Ok(acc)
        }
    }
}

/// Rank a score map: descending score, ties by ascending doc id
pub(crate) fn rank(scores: BTreeMap<DocId, f32>, k: usize) -> Vec<(DocId, f32)> {
    let mut ranked: Vec<(DocId, f32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}
