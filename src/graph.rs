//! In-memory graph analytics.
//!
//! [`GraphEngine`] is an explicit snapshot of the store's nodes and edges.
//! It does not observe later writes; call [`GraphEngine::reload`] after an
//! ingestion run to pick them up.
//!
//! Nodes live in an arena sorted by id, so every algorithm iterates in id
//! order and produces identical output for identical input.
//!
//! | Operation | Algorithm |
//! |-----------|-----------|
//! | [`centrality`](GraphEngine::centrality) | PageRank, damping 0.85, uniform dangling mass |
//! | [`detect_communities`](GraphEngine::detect_communities) | multi-level Louvain on the undirected projection |
//! | [`betweenness`](GraphEngine::betweenness) | Brandes, directed, unweighted |
//! | [`shortest_path`](GraphEngine::shortest_path) | directed BFS |
//! | [`components`](GraphEngine::components) | weakly connected components |

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{Edge, NodeFilter};
use crate::store::NodeEdgeStore;

const DAMPING: f64 = 0.85;
const PAGERANK_TOLERANCE: f64 = 1e-6;
const PAGERANK_MAX_ITERATIONS: usize = 100;

const LOUVAIN_MAX_LEVELS: usize = 32;
const LOUVAIN_MAX_PASSES: usize = 100;
const LOUVAIN_MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone)]
struct GraphEdge {
    source: usize,
    target: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub density: f64,
}

/// Directed multigraph snapshot.
#[derive(Debug, Clone, Default)]
pub struct GraphEngine {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<GraphEdge>,
    /// Edge indices leaving each node.
    out_edges: Vec<Vec<usize>>,
    /// Edge indices entering each node.
    in_edges: Vec<Vec<usize>>,
}

impl GraphEngine {
    /// An empty graph. Every query returns an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: &NodeEdgeStore) -> Result<Self> {
        let mut graph = Self::new();
        graph.reload(store).await?;
        Ok(graph)
    }

    /// Replace the snapshot with the store's current contents.
    pub async fn reload(&mut self, store: &NodeEdgeStore) -> Result<()> {
        let filter = NodeFilter {
            exclude_large: true,
            ..NodeFilter::default()
        };
        let ids: Vec<String> = store
            .list_nodes(&filter)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let edges = store.list_edges().await?;

        *self = Self::from_parts(ids, &edges);
        info!(
            nodes = self.ids.len(),
            edges = self.edges.len(),
            "Graph snapshot loaded"
        );
        Ok(())
    }

    /// Build a snapshot from node ids and edges. Edges with an unknown endpoint are dropped.
    pub fn from_parts(mut ids: Vec<String>, edges: &[Edge]) -> Self {
        ids.sort();
        ids.dedup();

        let index: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut graph = Self {
            out_edges: vec![Vec::new(); ids.len()],
            in_edges: vec![Vec::new(); ids.len()],
            ids,
            index,
            edges: Vec::with_capacity(edges.len()),
        };

        let mut dangling = 0usize;
        for edge in edges {
            let (Some(&source), Some(&target)) =
                (graph.index.get(&edge.source), graph.index.get(&edge.target))
            else {
                dangling += 1;
                continue;
            };
            let idx = graph.edges.len();
            graph.edges.push(GraphEdge { source, target });
            graph.out_edges[source].push(idx);
            graph.in_edges[target].push(idx);
        }
        if dangling > 0 {
            debug!(dangling, "Skipped edges with a missing endpoint");
        }

        graph
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes adjacent to `id` in either direction, excluding `id`, sorted.
    pub fn neighbors(&self, id: &str) -> Vec<String> {
        let Some(&i) = self.index.get(id) else {
            return Vec::new();
        };
        let mut adjacent: Vec<usize> = self.out_edges[i]
            .iter()
            .map(|&e| self.edges[e].target)
            .chain(self.in_edges[i].iter().map(|&e| self.edges[e].source))
            .filter(|&j| j != i)
            .collect();
        adjacent.sort_unstable();
        adjacent.dedup();
        adjacent.into_iter().map(|j| self.ids[j].clone()).collect()
    }

    /// Incident edges in both directions. Zero means orphan.
    pub fn degree(&self, id: &str) -> usize {
        self.index
            .get(id)
            .map(|&i| self.in_edges[i].len() + self.out_edges[i].len())
            .unwrap_or(0)
    }

    pub fn orphans(&self) -> Vec<String> {
        (0..self.ids.len())
            .filter(|&i| self.in_edges[i].is_empty() && self.out_edges[i].is_empty())
            .map(|i| self.ids[i].clone())
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let n = self.ids.len();
        let density = if n > 1 {
            self.edges.len() as f64 / (n as f64 * (n as f64 - 1.0))
        } else {
            0.0
        };
        GraphStats {
            nodes: n,
            edges: self.edges.len(),
            density,
        }
    }

    /// PageRank per node. Scores sum to 1.
    pub fn centrality(&self) -> HashMap<String, f64> {
        let n = self.ids.len();
        if n == 0 {
            return HashMap::new();
        }

        let out_weight: Vec<f64> = self.out_edges.iter().map(|e| e.len() as f64).collect();
        let base = (1.0 - DAMPING) / n as f64;
        let mut rank = vec![1.0 / n as f64; n];

        for iteration in 0..PAGERANK_MAX_ITERATIONS {
            let dangling: f64 = (0..n)
                .filter(|&i| out_weight[i] == 0.0)
                .map(|i| rank[i])
                .sum();

            let mut next = vec![base + DAMPING * dangling / n as f64; n];
            for edge in &self.edges {
                next[edge.target] += DAMPING * rank[edge.source] / out_weight[edge.source];
            }

            let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
            rank = next;
            if delta < PAGERANK_TOLERANCE {
                debug!(iterations = iteration + 1, "PageRank converged");
                break;
            }
        }

        self.ids.iter().cloned().zip(rank).collect()
    }

    /// Community label per node, numbered from 0 in order of first appearance by id.
    pub fn detect_communities(&self) -> HashMap<String, usize> {
        if self.ids.is_empty() {
            return HashMap::new();
        }

        let membership = louvain(self.projection());
        let labels = renumber(&membership).0;
        self.ids.iter().cloned().zip(labels).collect()
    }

    /// Newman modularity of `labels` on the undirected projection.
    ///
    /// Nodes missing from `labels` count as singleton communities.
    pub fn modularity(&self, labels: &HashMap<String, usize>) -> f64 {
        let proj = self.projection();
        let degrees = proj.degrees();
        let m2: f64 = degrees.iter().sum();
        if m2 <= 0.0 {
            return 0.0;
        }

        // Singletons get labels past every real one.
        let offset = labels.values().max().map(|m| m + 1).unwrap_or(0);
        let community: Vec<usize> = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| labels.get(id).copied().unwrap_or(offset + i))
            .collect();

        let mut internal: HashMap<usize, f64> = HashMap::new();
        let mut total: HashMap<usize, f64> = HashMap::new();
        for i in 0..community.len() {
            let c = community[i];
            *total.entry(c).or_default() += degrees[i];
            *internal.entry(c).or_default() += 2.0 * proj.loops[i];
            for &(j, w) in &proj.adj[i] {
                if community[j] == c {
                    *internal.entry(c).or_default() += w;
                }
            }
        }

        total
            .iter()
            .map(|(c, tot)| {
                let inside = internal.get(c).copied().unwrap_or(0.0);
                inside / m2 - (tot / m2).powi(2)
            })
            .sum()
    }

    /// Brandes betweenness over directed, deduplicated edges. Unnormalized.
    pub fn betweenness(&self) -> HashMap<String, f64> {
        let n = self.ids.len();
        let succ = self.successors();
        let mut score = vec![0.0f64; n];

        for s in 0..n {
            let mut stack = Vec::with_capacity(n);
            let mut pred: Vec<Vec<usize>> = vec![Vec::new(); n];
            let mut sigma = vec![0.0f64; n];
            let mut dist: Vec<Option<usize>> = vec![None; n];
            sigma[s] = 1.0;
            dist[s] = Some(0);

            let mut queue = VecDeque::from([s]);
            while let Some(v) = queue.pop_front() {
                stack.push(v);
                let dv = dist[v].unwrap_or(0);
                for &w in &succ[v] {
                    if dist[w].is_none() {
                        dist[w] = Some(dv + 1);
                        queue.push_back(w);
                    }
                    if dist[w] == Some(dv + 1) {
                        sigma[w] += sigma[v];
                        pred[w].push(v);
                    }
                }
            }

            let mut delta = vec![0.0f64; n];
            while let Some(w) = stack.pop() {
                for &v in &pred[w] {
                    delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
                }
                if w != s {
                    score[w] += delta[w];
                }
            }
        }

        self.ids.iter().cloned().zip(score).collect()
    }

    /// Fewest-hop directed path from `from` to `to`, both included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let (&start, &goal) = (self.index.get(from)?, self.index.get(to)?);
        if start == goal {
            return Some(vec![self.ids[start].clone()]);
        }

        let succ = self.successors();
        let mut parent: Vec<Option<usize>> = vec![None; self.ids.len()];
        let mut seen = vec![false; self.ids.len()];
        seen[start] = true;

        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for &w in &succ[v] {
                if seen[w] {
                    continue;
                }
                seen[w] = true;
                parent[w] = Some(v);
                if w == goal {
                    let mut path = vec![w];
                    let mut cur = w;
                    while let Some(p) = parent[cur] {
                        path.push(p);
                        cur = p;
                    }
                    path.reverse();
                    return Some(path.into_iter().map(|i| self.ids[i].clone()).collect());
                }
                queue.push_back(w);
            }
        }
        None
    }

    /// Weakly connected components, largest first, each sorted by id.
    pub fn components(&self) -> Vec<Vec<String>> {
        let n = self.ids.len();
        let mut component = vec![usize::MAX; n];
        let mut groups: Vec<Vec<usize>> = Vec::new();

        for root in 0..n {
            if component[root] != usize::MAX {
                continue;
            }
            let label = groups.len();
            let mut members = Vec::new();
            let mut queue = VecDeque::from([root]);
            component[root] = label;
            while let Some(v) = queue.pop_front() {
                members.push(v);
                let adjacent = self.out_edges[v]
                    .iter()
                    .map(|&e| self.edges[e].target)
                    .chain(self.in_edges[v].iter().map(|&e| self.edges[e].source));
                for w in adjacent {
                    if component[w] == usize::MAX {
                        component[w] = label;
                        queue.push_back(w);
                    }
                }
            }
            members.sort_unstable();
            groups.push(members);
        }

        groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));
        groups
            .into_iter()
            .map(|g| g.into_iter().map(|i| self.ids[i].clone()).collect())
            .collect()
    }

    /// Sorted, deduplicated out-neighbours without self-loops.
    fn successors(&self) -> Vec<Vec<usize>> {
        self.out_edges
            .iter()
            .enumerate()
            .map(|(i, out)| {
                let mut next: Vec<usize> = out
                    .iter()
                    .map(|&e| self.edges[e].target)
                    .filter(|&t| t != i)
                    .collect();
                next.sort_unstable();
                next.dedup();
                next
            })
            .collect()
    }

    /// Undirected projection: each directed edge adds weight 1 to its pair.
    fn projection(&self) -> Projection {
        let n = self.ids.len();
        let mut pairs: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        let mut loops = vec![0.0; n];
        for edge in &self.edges {
            if edge.source == edge.target {
                loops[edge.source] += 1.0;
                continue;
            }
            let key = (edge.source.min(edge.target), edge.source.max(edge.target));
            *pairs.entry(key).or_default() += 1.0;
        }

        let mut adj = vec![Vec::new(); n];
        for ((a, b), w) in pairs {
            adj[a].push((b, w));
            adj[b].push((a, w));
        }
        Projection { adj, loops }
    }
}

/// Weighted undirected graph with self-loops kept apart from adjacency.
struct Projection {
    /// Symmetric; `(neighbour, weight)` sorted by neighbour.
    adj: Vec<Vec<(usize, f64)>>,
    loops: Vec<f64>,
}

impl Projection {
    fn degrees(&self) -> Vec<f64> {
        self.adj
            .iter()
            .zip(&self.loops)
            .map(|(edges, l)| edges.iter().map(|(_, w)| w).sum::<f64>() + 2.0 * l)
            .collect()
    }
}

/// Multi-level Louvain. Returns the final community of every level-0 node.
fn louvain(mut proj: Projection) -> Vec<usize> {
    let mut membership: Vec<usize> = (0..proj.adj.len()).collect();

    for level in 0..LOUVAIN_MAX_LEVELS {
        let (community, moved) = local_moving(&proj);
        if !moved {
            break;
        }
        let (community, count) = renumber(&community);
        for m in membership.iter_mut() {
            *m = community[*m];
        }
        debug!(level, communities = count, "Louvain level complete");
        if count == proj.adj.len() {
            break;
        }
        proj = aggregate(&proj, &community, count);
    }

    membership
}

/// Greedy modularity moves until no node changes community.
fn local_moving(proj: &Projection) -> (Vec<usize>, bool) {
    let n = proj.adj.len();
    let degree = proj.degrees();
    let m2: f64 = degree.iter().sum();
    let mut community: Vec<usize> = (0..n).collect();
    if m2 <= 0.0 {
        return (community, false);
    }

    let mut total = degree.clone();
    let mut moved_any = false;

    for _ in 0..LOUVAIN_MAX_PASSES {
        let mut moved = false;
        for i in 0..n {
            let current = community[i];

            // Weight from i into each neighbouring community, in first-seen order.
            let mut links: Vec<(usize, f64)> = Vec::new();
            for &(j, w) in &proj.adj[i] {
                let c = community[j];
                match links.iter_mut().find(|(lc, _)| *lc == c) {
                    Some(entry) => entry.1 += w,
                    None => links.push((c, w)),
                }
            }

            total[current] -= degree[i];
            let own = links
                .iter()
                .find(|(c, _)| *c == current)
                .map(|(_, w)| *w)
                .unwrap_or(0.0);

            let mut best = current;
            let mut best_gain = own - total[current] * degree[i] / m2;
            for &(c, w) in &links {
                if c == current {
                    continue;
                }
                let gain = w - total[c] * degree[i] / m2;
                if gain > best_gain + LOUVAIN_MIN_GAIN {
                    best = c;
                    best_gain = gain;
                }
            }

            total[best] += degree[i];
            if best != current {
                community[i] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
        moved_any = true;
    }

    (community, moved_any)
}

/// Relabel to `0..k` in order of first appearance. Returns the labels and `k`.
fn renumber(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let relabeled = labels
        .iter()
        .map(|l| {
            let next = mapping.len();
            *mapping.entry(*l).or_insert(next)
        })
        .collect();
    (relabeled, mapping.len())
}

/// Collapse each community into a single node.
fn aggregate(proj: &Projection, community: &[usize], count: usize) -> Projection {
    let mut weights: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); count];
    let mut loops = vec![0.0; count];

    for (i, neighbours) in proj.adj.iter().enumerate() {
        let ci = community[i];
        loops[ci] += proj.loops[i];
        for &(j, w) in neighbours {
            if j <= i {
                continue;
            }
            let cj = community[j];
            if ci == cj {
                loops[ci] += w;
            } else {
                *weights[ci].entry(cj).or_default() += w;
                *weights[cj].entry(ci).or_default() += w;
            }
        }
    }

    Projection {
        adj: weights
            .into_iter()
            .map(|m| m.into_iter().collect())
            .collect(),
        loops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextSource;

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.into(),
            target: target.into(),
            edge_type: "MENTIONS".into(),
            confidence: 1.0,
            veracity: 1.0,
            context_source: Some(ContextSource::ManualTag),
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Two triangles joined by a single bridge c → d.
    fn two_triangles() -> GraphEngine {
        GraphEngine::from_parts(
            ids(&["a", "b", "c", "d", "e", "f"]),
            &[
                edge("a", "b"),
                edge("b", "c"),
                edge("c", "a"),
                edge("d", "e"),
                edge("e", "f"),
                edge("f", "d"),
                edge("c", "d"),
            ],
        )
    }

    #[test]
    fn test_empty_graph_is_safe() {
        let g = GraphEngine::new();
        assert!(g.centrality().is_empty());
        assert!(g.detect_communities().is_empty());
        assert!(g.neighbors("x").is_empty());
        assert_eq!(g.degree("x"), 0);
        assert!(g.components().is_empty());
        assert_eq!(g.shortest_path("x", "y"), None);
        assert_eq!(g.stats(), GraphStats::default());
    }

    #[test]
    fn test_neighbors_union_without_self() {
        let g = GraphEngine::from_parts(
            ids(&["a", "b", "c"]),
            &[edge("a", "b"), edge("c", "a"), edge("a", "a"), edge("b", "a")],
        );
        assert_eq!(g.neighbors("a"), vec!["b".to_string(), "c".to_string()]);
        // a→b, c→a, a→a (twice), b→a
        assert_eq!(g.degree("a"), 5);
    }

    #[test]
    fn test_dangling_edges_dropped() {
        let g = GraphEngine::from_parts(ids(&["a"]), &[edge("a", "ghost")]);
        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.orphans(), vec!["a".to_string()]);
    }

    #[test]
    fn test_pagerank_sums_to_one() {
        let g = two_triangles();
        let pr = g.centrality();
        let total: f64 = pr.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        // d receives from both f and the bridge.
        assert!(pr["d"] > pr["e"]);
    }

    #[test]
    fn test_pagerank_handles_dangling_nodes() {
        let g = GraphEngine::from_parts(ids(&["a", "b", "sink"]), &[edge("a", "sink"), edge("b", "sink")]);
        let pr = g.centrality();
        assert!((pr.values().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(pr["sink"] > pr["a"]);
    }

    #[test]
    fn test_louvain_splits_triangles() {
        let g = two_triangles();
        let labels = g.detect_communities();
        assert_eq!(labels["a"], 0);
        assert_eq!(labels["a"], labels["b"]);
        assert_eq!(labels["b"], labels["c"]);
        assert_eq!(labels["d"], labels["e"]);
        assert_eq!(labels["e"], labels["f"]);
        assert_ne!(labels["a"], labels["d"]);
        assert!(g.modularity(&labels) > 0.3);
    }

    #[test]
    fn test_louvain_is_stable_across_runs_and_edge_order() {
        let g = two_triangles();
        let first = g.detect_communities();
        for _ in 0..5 {
            assert_eq!(g.detect_communities(), first);
        }

        let mut reversed_edges: Vec<Edge> = vec![
            edge("a", "b"),
            edge("b", "c"),
            edge("c", "a"),
            edge("d", "e"),
            edge("e", "f"),
            edge("f", "d"),
            edge("c", "d"),
        ];
        reversed_edges.reverse();
        let g2 = GraphEngine::from_parts(ids(&["f", "e", "d", "c", "b", "a"]), &reversed_edges);
        assert_eq!(g2.detect_communities(), first);
    }

    #[test]
    fn test_isolated_nodes_get_own_communities() {
        let g = GraphEngine::from_parts(ids(&["x", "y"]), &[]);
        let labels = g.detect_communities();
        assert_eq!(labels["x"], 0);
        assert_eq!(labels["y"], 1);
        assert_eq!(g.modularity(&labels), 0.0);
    }

    #[test]
    fn test_betweenness_of_chain() {
        let g = GraphEngine::from_parts(ids(&["a", "b", "c"]), &[edge("a", "b"), edge("b", "c")]);
        let bc = g.betweenness();
        assert_eq!(bc["a"], 0.0);
        assert_eq!(bc["b"], 1.0);
        assert_eq!(bc["c"], 0.0);
    }

    #[test]
    fn test_shortest_path_is_directed() {
        let g = two_triangles();
        assert_eq!(
            g.shortest_path("a", "e"),
            Some(ids(&["a", "b", "c", "d", "e"]))
        );
        assert_eq!(g.shortest_path("d", "a"), None);
        assert_eq!(g.shortest_path("a", "a"), Some(ids(&["a"])));
    }

    #[test]
    fn test_components_and_stats() {
        let g = GraphEngine::from_parts(
            ids(&["a", "b", "c", "lonely"]),
            &[edge("a", "b"), edge("c", "b")],
        );
        assert_eq!(
            g.components(),
            vec![ids(&["a", "b", "c"]), ids(&["lonely"])]
        );
        let stats = g.stats();
        assert_eq!(stats.nodes, 4);
        assert_eq!(stats.edges, 2);
        assert!((stats.density - 2.0 / 12.0).abs() < 1e-12);
    }
}
