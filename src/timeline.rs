//! Chronological chaining of dated nodes.
//!
//! After each run the [`TimelineWeaver`] orders every node of one type
//! (`debrief` by default) by date, newest first, and links each node to the
//! one before it in time with a `SUCCEEDS` edge. A node's date is its `date`
//! field, or a `YYYY-MM-DD` prefix on its source file name. Undated nodes
//! stay out of the chain.
//!
//! The chain is reconciled rather than appended: edges it wrote on an
//! earlier run that no longer fit the order are removed, so a debrief added
//! between two existing ones splices in cleanly and a rerun over an
//! unchanged store writes nothing.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{ContextSource, Node, NodeFilter};
use crate::store::NodeEdgeStore;

pub const SUCCEEDS: &str = "SUCCEEDS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimelineStats {
    /// Dated nodes in the chain.
    pub nodes: usize,
    pub linked: usize,
    pub removed: usize,
}

pub struct TimelineWeaver {
    node_type: String,
}

impl TimelineWeaver {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
        }
    }

    pub async fn weave(&self, store: &NodeEdgeStore) -> Result<TimelineStats> {
        let filter = NodeFilter {
            node_type: Some(self.node_type.clone()),
            exclude_large: true,
            ..NodeFilter::default()
        };
        let mut dated: Vec<(NaiveDate, String)> = store
            .list_nodes(&filter)
            .await?
            .iter()
            .filter_map(|node| node_date(node).map(|date| (date, node.id.clone())))
            .collect();
        // Newest first; same-day nodes by id.
        dated.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let wanted: BTreeSet<(String, String)> = dated
            .windows(2)
            .map(|pair| (pair[0].1.clone(), pair[1].1.clone()))
            .collect();
        let existing: BTreeSet<(String, String)> = store
            .list_edges()
            .await?
            .into_iter()
            .filter(|e| e.edge_type == SUCCEEDS && e.context_source == Some(ContextSource::Timeline))
            .map(|e| (e.source, e.target))
            .collect();

        let mut stats = TimelineStats {
            nodes: dated.len(),
            ..TimelineStats::default()
        };
        if wanted == existing {
            debug!(node_type = %self.node_type, nodes = stats.nodes, "Timeline unchanged");
            return Ok(stats);
        }

        let mut batch = store.begin_batch(0).await?;
        for (source, target) in existing.difference(&wanted) {
            if batch.delete_edge(source, target, SUCCEEDS).await? {
                stats.removed += 1;
            }
        }
        for (source, target) in wanted.difference(&existing) {
            let written = batch
                .insert_edge_if_absent(source, target, SUCCEEDS, 1.0, 1.0, ContextSource::Timeline)
                .await?;
            if written {
                stats.linked += 1;
            }
        }
        batch.commit().await?;

        info!(
            node_type = %self.node_type,
            nodes = stats.nodes,
            linked = stats.linked,
            removed = stats.removed,
            "Timeline woven"
        );
        Ok(stats)
    }
}

fn node_date(node: &Node) -> Option<NaiveDate> {
    node.date.as_deref().and_then(leading_date).or_else(|| {
        let source = node.source()?;
        let name = source.rsplit('/').next()?;
        leading_date(name)
    })
}

/// `2024-05-01`, `2024-05-01T09:30:00Z`, and `2024-05-01-notes.md` all parse.
fn leading_date(s: &str) -> Option<NaiveDate> {
    let prefix = s.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, NodeEdgeStore) {
        let tmp = TempDir::new().unwrap();
        let store = NodeEdgeStore::open_at(&tmp.path().join("store.db"))
            .await
            .unwrap();
        (tmp, store)
    }

    async fn debrief(store: &NodeEdgeStore, id: &str, date: Option<&str>, source: &str) {
        let mut node = Node::new(id, id);
        node.node_type = "debrief".into();
        node.date = date.map(str::to_string);
        node.meta
            .insert("source".into(), Value::String(source.to_string()));
        store.upsert_node(&node).await.unwrap();
    }

    async fn chain(store: &NodeEdgeStore) -> Vec<(String, String)> {
        store
            .list_edges()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.edge_type == SUCCEEDS)
            .map(|e| (e.source, e.target))
            .collect()
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(s, t)| (s.to_string(), t.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_newer_succeeds_older() {
        let (_tmp, store) = open_temp().await;
        debrief(&store, "d-march", Some("2024-03-01"), "debriefs/march.md").await;
        debrief(&store, "d-jan", Some("2024-01-15T10:00:00Z"), "debriefs/jan.md").await;
        debrief(&store, "d-feb", None, "debriefs/2024-02-10-feb.md").await;
        debrief(&store, "d-undated", None, "debriefs/misc.md").await;
        store.upsert_node(&Node::new("doc", "Not a debrief")).await.unwrap();

        let stats = TimelineWeaver::new("debrief").weave(&store).await.unwrap();
        assert_eq!(stats, TimelineStats { nodes: 3, linked: 2, removed: 0 });
        assert_eq!(
            chain(&store).await,
            pairs(&[("d-feb", "d-jan"), ("d-march", "d-feb")])
        );
        let edge = &store.edges_of("d-march").await.unwrap()[0];
        assert_eq!(edge.context_source, Some(ContextSource::Timeline));

        let again = TimelineWeaver::new("debrief").weave(&store).await.unwrap();
        assert_eq!(again.linked + again.removed, 0);
    }

    #[tokio::test]
    async fn test_new_entry_splices_into_chain() {
        let (_tmp, store) = open_temp().await;
        debrief(&store, "d-jan", Some("2024-01-01"), "debriefs/jan.md").await;
        debrief(&store, "d-mar", Some("2024-03-01"), "debriefs/mar.md").await;
        let weaver = TimelineWeaver::new("debrief");
        weaver.weave(&store).await.unwrap();
        assert_eq!(chain(&store).await, pairs(&[("d-mar", "d-jan")]));

        debrief(&store, "d-feb", Some("2024-02-01"), "debriefs/feb.md").await;
        let stats = weaver.weave(&store).await.unwrap();
        assert_eq!(stats.linked, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(
            chain(&store).await,
            pairs(&[("d-feb", "d-jan"), ("d-mar", "d-feb")])
        );
    }

    #[tokio::test]
    async fn test_hand_written_succeeds_edges_are_kept() {
        let (_tmp, store) = open_temp().await;
        store
            .upsert_edge("x", "y", SUCCEEDS, 1.0, 1.0, ContextSource::ExplicitTag)
            .await
            .unwrap();
        debrief(&store, "d-one", Some("2024-01-01"), "debriefs/one.md").await;

        let stats = TimelineWeaver::new("debrief").weave(&store).await.unwrap();
        assert_eq!(stats, TimelineStats { nodes: 1, linked: 0, removed: 0 });
        assert_eq!(chain(&store).await, pairs(&[("x", "y")]));
    }

    #[test]
    fn test_leading_date() {
        assert_eq!(leading_date("2024-05-01"), NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(leading_date("2024-05-01-notes.md"), NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(leading_date("2024-13-01"), None);
        assert_eq!(leading_date("notes.md"), None);
        assert_eq!(leading_date("2024"), None);
    }
}
