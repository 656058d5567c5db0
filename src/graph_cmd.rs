//! `resonance graph` subcommands.

use anyhow::{bail, Result};

use resonance::config::Config;
use resonance::graph::GraphEngine;
use resonance::store::NodeEdgeStore;

pub async fn run_overview(config: &Config, top: usize) -> Result<()> {
    let store = NodeEdgeStore::open(config).await?;
    let graph = GraphEngine::load(&store).await?;
    store.close().await;

    let stats = graph.stats();
    println!("nodes: {}", stats.nodes);
    println!("edges: {}", stats.edges);
    println!("density: {:.4}", stats.density);

    let communities = graph.detect_communities();
    let count = communities.values().copied().max().map_or(0, |max| max + 1);
    println!("communities: {}", count);
    println!("modularity: {:.4}", graph.modularity(&communities));
    println!("components: {}", graph.components().len());
    println!("orphans: {}", graph.orphans().len());

    let mut ranked: Vec<(String, f64)> = graph.centrality().into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    if !ranked.is_empty() {
        println!();
        println!("top by pagerank:");
        for (i, (id, score)) in ranked.iter().take(top).enumerate() {
            println!(
                "{:>3}. [{:.4}] {}  (degree {}, community {})",
                i + 1,
                score,
                id,
                graph.degree(id),
                communities.get(id).copied().unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub async fn run_neighbors(config: &Config, id: &str) -> Result<()> {
    let store = NodeEdgeStore::open(config).await?;
    let graph = GraphEngine::load(&store).await?;
    store.close().await;

    if !graph.contains(id) {
        bail!("Node not found: {}", id);
    }
    let neighbors = graph.neighbors(id);
    println!("{} (degree {})", id, graph.degree(id));
    if neighbors.is_empty() {
        println!("  no neighbors");
    }
    for neighbor in neighbors {
        println!("  {}", neighbor);
    }
    Ok(())
}

pub async fn run_path(config: &Config, from: &str, to: &str) -> Result<()> {
    let store = NodeEdgeStore::open(config).await?;
    let graph = GraphEngine::load(&store).await?;
    store.close().await;

    match graph.shortest_path(from, to) {
        Some(path) => println!("{}", path.join(" -> ")),
        None => println!("No path."),
    }
    Ok(())
}
