//! Unit-vector protocol and similarity search.
//!
//! Every stored embedding is L2-normalized once, at write time, so similarity
//! at query time is a plain dot product. [`UnitVector`] is the only way to
//! get a vector into the store, which keeps the invariant in the type.
//!
//! Search is an exhaustive scan over every stored embedding. That is the
//! intended scale: a documentation corpus of thousands of nodes, not an ANN
//! index.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::ContextSource;
use crate::store::NodeEdgeStore;

/// Edge type written by orphan rescue.
pub const RELATED_TO: &str = "RELATED_TO";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    #[error("vector has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector is empty")]
    Empty,

    #[error("vector contains a non-finite component")]
    NonFinite,

    #[error("vector has zero magnitude")]
    ZeroMagnitude,

    #[error("embedding blob of {0} bytes is not a whole number of f32 values")]
    MalformedBlob(usize),
}

/// An L2-normalized embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitVector(Vec<f32>);

impl UnitVector {
    /// Normalize `raw` to unit length.
    ///
    /// Fails when `raw` does not have `dims` components, is empty, contains
    /// NaN or infinity, or has zero magnitude.
    pub fn normalize(raw: &[f32], dims: usize) -> std::result::Result<Self, VectorError> {
        if raw.is_empty() {
            return Err(VectorError::Empty);
        }
        if raw.len() != dims {
            return Err(VectorError::DimensionMismatch {
                expected: dims,
                actual: raw.len(),
            });
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(VectorError::NonFinite);
        }

        // Accumulate in f64 so large components do not overflow.
        let magnitude = raw
            .iter()
            .map(|&x| (x as f64) * (x as f64))
            .sum::<f64>()
            .sqrt();
        if magnitude < f64::EPSILON {
            return Err(VectorError::ZeroMagnitude);
        }

        Ok(Self(
            raw.iter().map(|&x| ((x as f64) / magnitude) as f32).collect(),
        ))
    }

    /// Decode packed little-endian f32 values written by [`to_blob`](Self::to_blob).
    pub fn from_blob(blob: &[u8]) -> std::result::Result<Self, VectorError> {
        if blob.is_empty() {
            return Err(VectorError::Empty);
        }
        if blob.len() % 4 != 0 {
            return Err(VectorError::MalformedBlob(blob.len()));
        }
        Ok(Self(
            blob.chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        ))
    }

    /// Encode as packed little-endian f32 (`dims × 4` bytes).
    pub fn to_blob(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for &v in &self.0 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Cosine similarity, clamped to `[-1, 1]`. Zero for mismatched lengths.
    pub fn dot(&self, other: &UnitVector) -> f32 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        dot.clamp(-1.0, 1.0)
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// One similarity search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub title: String,
    pub score: f32,
}

/// Similarity search over the embeddings in a [`NodeEdgeStore`].
pub struct VectorEngine {
    store: NodeEdgeStore,
    embedder: Arc<dyn Embedder>,
}

impl VectorEngine {
    pub fn new(store: NodeEdgeStore, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Embed `query` and return the `limit` most similar nodes.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<VectorHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self.embedder.embed(query).await?;
        let query = UnitVector::normalize(&raw, self.embedder.dims())?;
        self.search_by_vector(&query, limit).await
    }

    /// Rank every stored embedding against `query`.
    ///
    /// Sorted by descending score, ties broken by ascending id. A store
    /// without embeddings yields no hits; a query whose dimension differs
    /// from the store's is [`Error::DimensionMismatch`].
    pub async fn search_by_vector(&self, query: &UnitVector, limit: usize) -> Result<Vec<VectorHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stored = self.store.embeddings().await?;
        if stored.is_empty() {
            return Ok(Vec::new());
        }
        let expected = match self.store.embedding_dims().await? {
            Some(dims) => dims,
            None => stored[0].2.dims(),
        };
        if expected != query.dims() {
            return Err(Error::DimensionMismatch {
                expected,
                actual: query.dims(),
            });
        }

        let mut skipped = 0usize;
        let mut hits: Vec<VectorHit> = stored
            .into_iter()
            .filter_map(|(id, title, vector)| {
                if vector.dims() != query.dims() {
                    skipped += 1;
                    return None;
                }
                Some(VectorHit {
                    score: query.dot(&vector),
                    id,
                    title,
                })
            })
            .collect();

        if skipped > 0 {
            warn!(skipped, dims = expected, "Skipped stored embeddings with a stray dimension");
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Nodes most similar to `id`, excluding itself. Empty when `id` has no embedding.
    pub async fn similar_to(&self, id: &str, limit: usize) -> Result<Vec<VectorHit>> {
        let Some(node) = self.store.get_node(id).await? else {
            return Ok(Vec::new());
        };
        let Some(vector) = node.embedding else {
            return Ok(Vec::new());
        };

        let mut hits = self.search_by_vector(&vector, limit.saturating_add(1)).await?;
        hits.retain(|h| h.id != id);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Link each edge-less embedded node to its nearest neighbour.
    ///
    /// A `RELATED_TO` edge with `semantic_match` provenance and
    /// `confidence = score` is written when the best score is at least
    /// `threshold`. When two orphans are each other's best match only the
    /// first, in id order, is linked. Returns the number of edges written.
    pub async fn rescue_orphans(&self, threshold: f32) -> Result<usize> {
        let stored = self.store.embeddings().await?;
        if stored.len() < 2 {
            return Ok(0);
        }

        let mut degree: HashMap<String, usize> = HashMap::new();
        for edge in self.store.list_edges().await? {
            *degree.entry(edge.source).or_default() += 1;
            *degree.entry(edge.target).or_default() += 1;
        }

        let mut links = Vec::new();
        let mut queued: HashSet<(String, String)> = HashSet::new();
        for (id, _, vector) in &stored {
            if degree.get(id).copied().unwrap_or(0) > 0 {
                continue;
            }

            let best = stored
                .iter()
                .filter(|(other, _, v)| other != id && v.dims() == vector.dims())
                .map(|(other, _, v)| (other, vector.dot(v)))
                .max_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| b.0.cmp(a.0))
                });

            if let Some((target, score)) = best {
                if score >= threshold && !queued.contains(&(target.clone(), id.clone())) {
                    queued.insert((id.clone(), target.clone()));
                    links.push((id.clone(), target.clone(), score));
                }
            }
        }

        if links.is_empty() {
            debug!(threshold, "No orphans above rescue threshold");
            return Ok(0);
        }

        let mut batch = self.store.begin_batch(0).await?;
        for (source, target, score) in &links {
            batch
                .insert_edge_if_absent(
                    source,
                    target,
                    RELATED_TO,
                    *score as f64,
                    1.0,
                    ContextSource::SemanticMatch,
                )
                .await?;
        }
        batch.commit().await?;

        info!(rescued = links.len(), threshold, "Rescued orphan nodes");
        Ok(links.len())
    }
}

fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use crate::models::Node;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Embeds every query as the same raw vector.
    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dims(&self) -> usize {
            self.0.len()
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(self.0.clone())
        }
    }

    async fn open_temp() -> (TempDir, NodeEdgeStore) {
        let tmp = TempDir::new().unwrap();
        let store = NodeEdgeStore::open_at(&tmp.path().join("store.db"))
            .await
            .unwrap();
        (tmp, store)
    }

    async fn put(store: &NodeEdgeStore, id: &str, raw: &[f32]) {
        let mut node = Node::new(id, id.to_uppercase());
        node.embedding = Some(UnitVector::normalize(raw, raw.len()).unwrap());
        store.upsert_node(&node).await.unwrap();
    }

    fn engine(store: &NodeEdgeStore, query: &[f32]) -> VectorEngine {
        VectorEngine::new(store.clone(), Arc::new(FixedEmbedder(query.to_vec())))
    }

    fn ids(hits: &[VectorHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    fn norm(v: &UnitVector) -> f32 {
        v.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_normalize_yields_unit_length() {
        let v = UnitVector::normalize(&[3.0, 4.0], 2).unwrap();
        assert!((norm(&v) - 1.0).abs() < 1e-6);
        assert!((v.as_slice()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_large_components() {
        let v = UnitVector::normalize(&[3.0e30, 4.0e30], 2).unwrap();
        assert!((norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        assert_eq!(UnitVector::normalize(&[], 0), Err(VectorError::Empty));
        assert_eq!(
            UnitVector::normalize(&[1.0, 2.0], 3),
            Err(VectorError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(
            UnitVector::normalize(&[f32::NAN, 1.0], 2),
            Err(VectorError::NonFinite)
        );
        assert_eq!(
            UnitVector::normalize(&[0.0, 0.0], 2),
            Err(VectorError::ZeroMagnitude)
        );
    }

    #[test]
    fn test_blob_roundtrip_preserves_components() {
        let v = UnitVector::normalize(&[1.0, -2.5, 3.125], 3).unwrap();
        let blob = v.to_blob();
        assert_eq!(blob.len(), 12);
        assert_eq!(UnitVector::from_blob(&blob).unwrap(), v);
    }

    #[test]
    fn test_from_blob_rejects_ragged_length() {
        assert_eq!(
            UnitVector::from_blob(&[0, 0, 128]),
            Err(VectorError::MalformedBlob(3))
        );
    }

    #[test]
    fn test_dot_is_clamped() {
        let a = UnitVector::normalize(&[1.0, 1.0, 1.0], 3).unwrap();
        let score = a.dot(&a);
        assert!(score <= 1.0);
        assert!((score - 1.0).abs() < 1e-6);

        let b = UnitVector::normalize(&[-1.0, -1.0, -1.0], 3).unwrap();
        assert!(a.dot(&b) >= -1.0);
    }

    #[test]
    fn test_sort_breaks_ties_by_id() {
        let mut hits = vec![
            VectorHit { id: "b".into(), title: "B".into(), score: 0.5 },
            VectorHit { id: "c".into(), title: "C".into(), score: 0.9 },
            VectorHit { id: "a".into(), title: "A".into(), score: 0.5 },
        ];
        sort_hits(&mut hits);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_search_without_embeddings_is_empty() {
        let (_tmp, store) = open_temp().await;
        let engine = engine(&store, &[1.0, 0.0, 0.0]);
        assert!(engine.search("anything", 5).await.unwrap().is_empty());

        store.upsert_node(&Node::new("plain", "Plain")).await.unwrap();
        assert!(engine.search("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_query_of_other_dimension() {
        let (_tmp, store) = open_temp().await;
        put(&store, "a", &[1.0, 0.0, 0.0]).await;

        let result = engine(&store, &[1.0, 0.0]).search("anything", 5).await;
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let (_tmp, store) = open_temp().await;
        put(&store, "c", &[0.0, 0.0, 1.0]).await;
        put(&store, "b", &[0.8, 0.6, 0.0]).await;
        put(&store, "a", &[1.0, 0.0, 0.0]).await;

        let hits = engine(&store, &[2.0, 0.0, 0.0]).search("q", 10).await.unwrap();
        assert_eq!(ids(&hits), vec!["a", "b", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.8).abs() < 1e-6);
        assert_eq!(hits[0].title, "A");

        let top = engine(&store, &[1.0, 0.0, 0.0]).search("q", 1).await.unwrap();
        assert_eq!(ids(&top), vec!["a"]);
    }

    #[tokio::test]
    async fn test_similar_to_excludes_self() {
        let (_tmp, store) = open_temp().await;
        put(&store, "a", &[1.0, 0.0, 0.0]).await;
        put(&store, "b", &[0.8, 0.6, 0.0]).await;
        put(&store, "c", &[0.0, 0.0, 1.0]).await;
        store.upsert_node(&Node::new("plain", "Plain")).await.unwrap();
        let engine = engine(&store, &[1.0, 0.0, 0.0]);

        assert_eq!(ids(&engine.similar_to("a", 2).await.unwrap()), vec!["b", "c"]);
        assert_eq!(ids(&engine.similar_to("a", 1).await.unwrap()), vec!["b"]);
        assert!(engine.similar_to("plain", 5).await.unwrap().is_empty());
        assert!(engine.similar_to("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rescue_links_mutual_orphans_once() {
        let (_tmp, store) = open_temp().await;
        put(&store, "a", &[1.0, 0.0, 0.0]).await;
        put(&store, "b", &[0.9, 0.1, 0.0]).await;
        put(&store, "c", &[0.0, 0.0, 1.0]).await;
        let engine = engine(&store, &[1.0, 0.0, 0.0]);

        assert_eq!(engine.rescue_orphans(0.5).await.unwrap(), 1);
        let edges = store.list_edges().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].source.as_str(), edges[0].target.as_str()), ("a", "b"));
        assert_eq!(edges[0].edge_type, RELATED_TO);
        assert_eq!(edges[0].context_source, Some(ContextSource::SemanticMatch));
        assert!(edges[0].confidence > 0.9);

        // a and b are linked now; c has no match above the threshold.
        assert_eq!(engine.rescue_orphans(0.5).await.unwrap(), 0);
        assert_eq!(store.list_edges().await.unwrap().len(), 1);
    }
}
