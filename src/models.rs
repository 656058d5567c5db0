//! Core data models used throughout the engine.
//!
//! These types represent the nodes, edges, and snapshots that flow between
//! the store, the analytics layers, and the ingestion pipeline.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::vector::UnitVector;

/// A hollow document node: metadata, hash, and embedding, but no body text.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub node_type: String,
    pub title: String,
    pub domain: String,
    pub layer: String,
    pub embedding: Option<UnitVector>,
    /// SHA-256 hex of the normalized source text.
    pub hash: Option<String>,
    /// Frontmatter plus extracted signals; always carries `source`.
    pub meta: Map<String, Value>,
    pub date: Option<String>,
    pub summary: Option<String>,
}

impl Node {
    /// A `document` node in the `knowledge` domain with empty metadata.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: "document".to_string(),
            title: title.into(),
            domain: "knowledge".to_string(),
            layer: "document".to_string(),
            embedding: None,
            hash: None,
            meta: Map::new(),
            date: None,
            summary: None,
        }
    }

    /// Root-relative path of the file this node was derived from.
    pub fn source(&self) -> Option<&str> {
        self.meta.get("source").and_then(Value::as_str)
    }

    /// `meta.aliases`, accepting either a list or a single string.
    pub fn aliases(&self) -> Vec<String> {
        aliases_from_meta(&self.meta)
    }
}

pub(crate) fn aliases_from_meta(meta: &Map<String, Value>) -> Vec<String> {
    match meta.get("aliases") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Provenance of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    ManualTag,
    ExplicitTag,
    TitleMatch,
    AliasMatch,
    KeywordMatch,
    SemanticMatch,
    WikiLink,
    Timeline,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::ManualTag => "manual_tag",
            ContextSource::ExplicitTag => "explicit_tag",
            ContextSource::TitleMatch => "title_match",
            ContextSource::AliasMatch => "alias_match",
            ContextSource::KeywordMatch => "keyword_match",
            ContextSource::SemanticMatch => "semantic_match",
            ContextSource::WikiLink => "wiki_link",
            ContextSource::Timeline => "timeline",
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual_tag" => Ok(ContextSource::ManualTag),
            "explicit_tag" => Ok(ContextSource::ExplicitTag),
            "title_match" => Ok(ContextSource::TitleMatch),
            "alias_match" => Ok(ContextSource::AliasMatch),
            "keyword_match" => Ok(ContextSource::KeywordMatch),
            "semantic_match" => Ok(ContextSource::SemanticMatch),
            "wiki_link" => Ok(ContextSource::WikiLink),
            "timeline" => Ok(ContextSource::Timeline),
            other => Err(format!("unknown context source: {}", other)),
        }
    }
}

/// A typed, directed edge. Identity is `(source, target, edge_type)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub edge_type: String,
    pub confidence: f64,
    pub veracity: f64,
    pub context_source: Option<ContextSource>,
}

/// Query filter for [`NodeEdgeStore::list_nodes`](crate::store::NodeEdgeStore::list_nodes).
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub node_type: Option<String>,
    pub domain: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Skip loading the embedding column.
    pub exclude_large: bool,
}

/// Row counts for the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub edges: usize,
    pub nodes_with_embedding: usize,
    pub embedding_dims: Option<usize>,
}

/// One linkable entity in the weaver's lexicon snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexiconEntry {
    pub id: String,
    pub title: String,
    pub aliases: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_source_roundtrips_through_str() {
        for cs in [
            ContextSource::ManualTag,
            ContextSource::ExplicitTag,
            ContextSource::TitleMatch,
            ContextSource::AliasMatch,
            ContextSource::KeywordMatch,
            ContextSource::SemanticMatch,
            ContextSource::WikiLink,
            ContextSource::Timeline,
        ] {
            assert_eq!(cs.as_str().parse::<ContextSource>().unwrap(), cs);
        }
        assert!("guess".parse::<ContextSource>().is_err());
    }

    #[test]
    fn test_aliases_accepts_string_or_list() {
        let mut node = Node::new("a", "A");
        node.meta.insert("aliases".into(), Value::String("Alpha".into()));
        assert_eq!(node.aliases(), vec!["Alpha".to_string()]);

        node.meta.insert("aliases".into(), serde_json::json!(["One", "Two", 3]));
        assert_eq!(node.aliases(), vec!["One".to_string(), "Two".to_string()]);
    }
}
