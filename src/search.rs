use anyhow::{bail, Result};

use resonance::config::Config;
use resonance::embedding::create_embedder;
use resonance::store::NodeEdgeStore;
use resonance::survey::ExactMatchSurveyor;
use resonance::vector::VectorEngine;

/// Semantic search: embed `query` and rank stored nodes by similarity.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Semantic search requires embeddings. Set [embedding] provider in config.");
    }

    let store = NodeEdgeStore::open(config).await?;
    let engine = VectorEngine::new(store.clone(), create_embedder(&config.embedding)?);
    let hits = engine
        .search(query, limit.unwrap_or(config.search.default_limit))
        .await?;

    if hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, hit.score, hit.title);
        println!("    id: {}", hit.id);
        println!();
    }

    store.close().await;
    Ok(())
}

/// Literal search over the corpus files, resolved to nodes.
pub async fn run_grep(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    let store = NodeEdgeStore::open(config).await?;
    let surveyor = ExactMatchSurveyor::new(store.clone(), config)?;
    let hits = surveyor
        .search(query, limit.unwrap_or(config.search.default_limit))
        .await;

    if hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. {}:{}", i + 1, hit.path, hit.line);
        println!("    excerpt: \"{}\"", hit.content);
        println!("    id: {}", hit.id);
        println!();
    }

    store.close().await;
    Ok(())
}
