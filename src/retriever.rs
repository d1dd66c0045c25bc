//! Two-stage late-interaction retrieval (PLAID style)
//!
//! Stage 0 scores the query tensor against every centroid. Stage 1
//! gathers candidate documents from the posting lists of each query
//! row's top centroids. Stage 2 ranks candidates by an approximate
//! score built only from centroid scores and keeps a second-pass set.
//! Stage 3 reconstructs the survivors' token vectors from centroid +
//! decoded residual and computes exact MaxSim. Hydration of stored
//! fields happens in the query layer.
//!
//! Every search runs against one storage snapshot; concurrent writer
//! commits are invisible. Results are deterministic for a fixed index:
//! parallel partial results land in position-indexed slots and ties
//! break by ascending doc id.

use crate::distance::maxsim;
use crate::index::{forward, inverted, CoarseQuantizer, TrainedState};
use crate::storage::Snapshot;
use crate::types::{CentroidId, DocId, FieldId, TenantId, Tensor};
use crate::{LateError, Result};
use ahash::AHashMap;
use rayon::prelude::*;
use roaring::RoaringTreemap;

/// Retrieval options; defaults follow the engine's tuned values
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Nearest centroids probed per query token
    pub n_probe: usize,
    /// Per query token, centroid scores kept for the pre-filter
    pub k_top_centroids: usize,
    /// Minimum centroid score for a token-centroid pair to contribute
    /// to the pre-filter score
    pub centroid_score_threshold: f32,
    /// Candidates retained after the pre-filter;
    /// `None` resolves to `max(32 * k, 1024)`
    pub num_second_pass: Option<usize>,
    /// Per query token, stop probing once this many new candidates were
    /// materialized from its posting lists
    pub nearest_tokens_to_fetch: usize,
    /// Diagnostic only: trace where this doc drops out of the pipeline
    pub expected_id: Option<DocId>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            n_probe: 32,
            k_top_centroids: 2,
            centroid_score_threshold: 0.45,
            num_second_pass: None,
            nearest_tokens_to_fetch: 100,
            expected_id: None,
        }
    }
}

impl SearchOptions {
    fn second_pass(&self, k: usize) -> usize {
        self.num_second_pass.unwrap_or_else(|| (32 * k).max(1024))
    }
}

/// Cooperative cancellation, checked between stages
pub type CancelFn = dyn Fn() -> bool + Send + Sync;

/// A ranked document before hydration
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub doc_id: DocId,
    pub score: f32,
}

pub struct Retriever<'a> {
    snap: &'a Snapshot,
    trained: &'a TrainedState,
}

impl<'a> Retriever<'a> {
    pub fn new(snap: &'a Snapshot, trained: &'a TrainedState) -> Self {
        Self { snap, trained }
    }

    /// Run the full pipeline for one indexed tensor field
    pub fn search(
        &self,
        tenant: TenantId,
        field_id: FieldId,
        query: &Tensor,
        k: usize,
        opts: &SearchOptions,
        cancel: Option<&CancelFn>,
    ) -> Result<Vec<ScoredDoc>> {
        let tables = self
            .trained
            .field(field_id)
            .ok_or(LateError::IndexUntrained)?;
        let dim = tables.coarse.dim();
        if query.dim() != dim {
            return Err(LateError::DimensionMismatch {
                expected: dim,
                got: query.dim(),
            });
        }
        if k == 0 || query.num_tokens() == 0 {
            return Ok(Vec::new());
        }
        let query = query.normalized();
        let num_centroids = tables.coarse.num_centroids();
        let tq = query.num_tokens();

        check_cancel(cancel)?;

        // stage 0: centroid scores, Tq x K
        let scores = tables.coarse.score_tensor(&query)?;

        check_cancel(cancel)?;

        // stage 1: candidate gathering over posting lists
        let mut candidates = RoaringTreemap::new();
        for row in 0..tq {
            let row_scores = &scores[row * num_centroids..(row + 1) * num_centroids];
            let mut fetched = 0usize;
            for (centroid, _) in CoarseQuantizer::top_n(row_scores, opts.n_probe) {
                if fetched >= opts.nearest_tokens_to_fetch {
                    break;
                }
                inverted::scan_posting(self.snap, tenant, centroid, |doc, _| {
                    if candidates.insert(doc) {
                        fetched += 1;
                    }
                    Ok(())
                })?;
            }
        }
        if let Some(expected) = opts.expected_id {
            if !candidates.contains(expected) {
                tracing::debug!(expected, "expected doc missing from candidate set");
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        check_cancel(cancel)?;

        // stage 2: centroid-score pre-filter
        let row_maps = pruned_row_scores(&scores, num_centroids, tq, opts);
        let candidate_ids: Vec<DocId> = candidates.iter().collect();
        let approx: Vec<(DocId, f32)> = candidate_ids
            .par_iter()
            .map(|&doc| {
                let centroids = inverted::doc_centroids(self.snap, tenant, doc)?;
                let mut total = 0.0f32;
                for map in &row_maps {
                    let mut best = 0.0f32;
                    for (centroid, _) in &centroids {
                        if let Some(&s) = map.get(centroid) {
                            if s > best {
                                best = s;
                            }
                        }
                    }
                    total += best;
                }
                Ok((doc, total))
            })
            .collect::<Result<Vec<_>>>()?;

        let second_pass = opts.second_pass(k);
        let survivors = top_docs(approx, second_pass);
        if let Some(expected) = opts.expected_id {
            if !survivors.iter().any(|(d, _)| *d == expected) {
                tracing::debug!(expected, "expected doc pruned by pre-filter");
            }
        }

        check_cancel(cancel)?;

        // stage 3: exact MaxSim over reconstructed token vectors
        let code_len = tables.codec.code_len();
        let exact: Vec<(DocId, f32)> = survivors
            .par_iter()
            .map(|&(doc, _)| {
                let record = match forward::read_forward(self.snap, tenant, doc, field_id)? {
                    Some(r) => r,
                    None => {
                        tracing::warn!(doc, "posting without forward record");
                        return Ok((doc, f32::NEG_INFINITY));
                    }
                };
                let td = record.token_count();
                let mut doc_vectors = vec![0.0f32; td * dim];
                let mut residual = vec![0.0f32; dim];
                for t in 0..td {
                    tables
                        .codec
                        .decode_into(record.token_code(t, code_len), &mut residual)?;
                    let centroid = tables.coarse.centroid(record.centroid_ids[t]);
                    let out = &mut doc_vectors[t * dim..(t + 1) * dim];
                    for ((o, &c), &r) in out.iter_mut().zip(centroid).zip(&residual) {
                        *o = c + r;
                    }
                }
                Ok((doc, maxsim(query.as_slice(), &doc_vectors, dim)))
            })
            .collect::<Result<Vec<_>>>()?;

        check_cancel(cancel)?;

        let ranked = top_docs(
            exact.into_iter().filter(|(_, s)| s.is_finite()).collect(),
            k,
        );
        if let Some(expected) = opts.expected_id {
            match ranked.iter().position(|(d, _)| *d == expected) {
                Some(rank) => {
                    tracing::debug!(expected, rank, score = ranked[rank].1, "expected doc ranked")
                }
                None => tracing::debug!(expected, "expected doc dropped by final ranking"),
            }
        }

        Ok(ranked
            .into_iter()
            .map(|(doc_id, score)| ScoredDoc { doc_id, score })
            .collect())
    }
}

/// Per query row: centroid -> score, restricted to the row's top
/// `k_top_centroids` scores at or above the threshold
fn pruned_row_scores(
    scores: &[f32],
    num_centroids: usize,
    tq: usize,
    opts: &SearchOptions,
) -> Vec<AHashMap<CentroidId, f32>> {
    (0..tq)
        .map(|row| {
            let row_scores = &scores[row * num_centroids..(row + 1) * num_centroids];
            CoarseQuantizer::top_n(row_scores, opts.k_top_centroids)
                .into_iter()
                .filter(|&(_, s)| s >= opts.centroid_score_threshold)
                .collect()
        })
        .collect()
}

/// Top `n` by descending score, ties by ascending doc id
fn top_docs(mut docs: Vec<(DocId, f32)>, n: usize) -> Vec<(DocId, f32)> {
    let by_rank = |a: &(DocId, f32), b: &(DocId, f32)| {
        b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
    };
    let n = n.min(docs.len());
    if n < docs.len() {
        docs.select_nth_unstable_by(n, by_rank);
        docs.truncate(n);
    }
    docs.sort_by(by_rank);
    docs
}

fn check_cancel(cancel: Option<&CancelFn>) -> Result<()> {
    if let Some(f) = cancel {
        if f() {
            return Err(LateError::Cancelled);
        }
    }
    Ok(())
}
