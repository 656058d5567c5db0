//! Store statistics and health overview.
//!
//! Provides a quick summary of what's indexed: node and edge counts,
//! embedding coverage, and per-type and per-domain breakdowns. Used by
//! `resonance stats` to confirm that ingestion is doing what it should.

use anyhow::Result;
use sqlx::Row;

use resonance::config::Config;
use resonance::graph::GraphEngine;
use resonance::migrate;
use resonance::store::NodeEdgeStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = NodeEdgeStore::open(config).await?;
    let totals = store.stats().await?;
    let version = migrate::current_version(store.pool()).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Resonance store stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Schema:      v{}", version);
    println!();
    println!("  Nodes:       {}", totals.nodes);
    println!("  Edges:       {}", totals.edges);
    println!(
        "  Embedded:    {} / {} ({}%)",
        totals.nodes_with_embedding,
        totals.nodes,
        if totals.nodes > 0 {
            (totals.nodes_with_embedding * 100) / totals.nodes
        } else {
            0
        }
    );
    if let Some(dims) = totals.embedding_dims {
        println!("  Dimensions:  {}", dims);
    }

    let graph = GraphEngine::load(&store).await?;
    let graph_stats = graph.stats();
    println!("  Orphans:     {}", graph.orphans().len());
    println!("  Components:  {}", graph.components().len());
    println!("  Density:     {:.4}", graph_stats.density);

    for (label, column) in [("type", "type"), ("domain", "domain")] {
        let rows = sqlx::query(&format!(
            r#"
            SELECT
                COALESCE({column}, '') AS label,
                COUNT(*) AS node_count,
                SUM(CASE WHEN embedding IS NOT NULL THEN 1 ELSE 0 END) AS embedded_count
            FROM nodes
            GROUP BY {column}
            ORDER BY node_count DESC, label
            "#
        ))
        .fetch_all(store.pool())
        .await?;

        if rows.is_empty() {
            continue;
        }
        println!();
        println!("  By {}:", label);
        println!("  {:<24} {:>6} {:>10}", label.to_uppercase(), "NODES", "EMBEDDED");
        println!("  {}", "-".repeat(42));
        for row in &rows {
            let name: String = row.get("label");
            let nodes: i64 = row.get("node_count");
            let embedded: i64 = row.get("embedded_count");
            println!("  {:<24} {:>6} {:>10}", name, nodes, embedded);
        }
    }

    let edge_rows = sqlx::query(
        "SELECT type, COUNT(*) AS edge_count FROM edges GROUP BY type ORDER BY edge_count DESC, type",
    )
    .fetch_all(store.pool())
    .await?;
    if !edge_rows.is_empty() {
        println!();
        println!("  Edges by type:");
        for row in &edge_rows {
            let edge_type: String = row.get("type");
            let count: i64 = row.get("edge_count");
            println!("  {:<24} {:>6}", edge_type, count);
        }
    }

    println!();

    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
