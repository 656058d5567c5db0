//! Persistent node/edge store.
//!
//! One SQLite file holds hollow nodes (metadata, content hash, embedding;
//! never the body text) and typed, confidence-scored edges. Writes go either
//! straight through the pool or through a [`Batch`], an explicit transaction
//! that the ingestion pipeline uses as its unit of atomicity.
//!
//! # Write modes
//!
//! | Operation | On conflict |
//! |-----------|-------------|
//! | [`NodeEdgeStore::upsert_node`] | full overwrite, skipped when the hash is unchanged |
//! | [`NodeEdgeStore::merge_node`] | updates only `summary` and `date` |
//! | [`NodeEdgeStore::upsert_edge`] | overwrites confidence, veracity, provenance |
//! | [`NodeEdgeStore::insert_edge_if_absent`] | keeps the existing edge |
//!
//! The first embedding written fixes the store-wide dimension (recorded in
//! `store_meta`). Writing an embedding of any other dimension fails with
//! [`Error::DimensionMismatch`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{aliases_from_meta, ContextSource, Edge, LexiconEntry, Node, NodeFilter, StoreStats};
use crate::vector::UnitVector;

const DIMS_KEY: &str = "embedding_dims";

const NODE_COLUMNS: &str =
    "id, type, title, domain, layer, embedding, hash, meta, date, summary";
const NODE_COLUMNS_LIGHT: &str =
    "id, type, title, domain, layer, NULL AS embedding, hash, meta, date, summary";

/// Handle to an open store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct NodeEdgeStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl NodeEdgeStore {
    /// Open the store configured at `db.path`.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.db.path).await
    }

    /// Open (creating if needed) the store at `path` and run pending migrations.
    pub async fn open_at(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        if let Err(e) = migrate::run_migrations(&pool).await {
            pool.close().await;
            return Err(e);
        }
        info!(path = %path.display(), "Store opened");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Start an explicit transaction. Dropping it uncommitted rolls back.
    pub async fn begin_batch(&self, index: usize) -> Result<Batch> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::from(e).in_batch(index))?;
        debug!(batch = index, "Batch opened");
        Ok(Batch { tx, index })
    }

    /// Insert or fully overwrite `node`.
    ///
    /// Returns `false` without writing when the stored hash equals `node.hash`.
    pub async fn upsert_node(&self, node: &Node) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let written = upsert_node(&mut tx, node).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Insert `node`, or on conflict update only its `summary` and `date`.
    pub async fn merge_node(&self, node: &Node) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        merge_node(&mut tx, node).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Stored content hash for `id`, or `None` if the node does not exist.
    pub async fn get_hash(&self, id: &str) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        get_hash(&mut conn, id).await
    }

    /// Nodes matching `filter`, ordered by id.
    pub async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let columns = if filter.exclude_large {
            NODE_COLUMNS_LIGHT
        } else {
            NODE_COLUMNS
        };
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM nodes
            WHERE (?1 IS NULL OR type = ?1)
              AND (?2 IS NULL OR domain = ?2)
            ORDER BY id
            LIMIT ?3 OFFSET ?4
            "#,
            columns
        ))
        .bind(&filter.node_type)
        .bind(&filter.domain)
        .bind(limit)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Insert or overwrite the edge `(source, target, edge_type)`.
    ///
    /// `confidence` and `veracity` are clamped to `[0, 1]`.
    pub async fn upsert_edge(
        &self,
        source: &str,
        target: &str,
        edge_type: &str,
        confidence: f64,
        veracity: f64,
        context_source: ContextSource,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_edge(
            &mut conn,
            source,
            target,
            edge_type,
            confidence,
            veracity,
            context_source,
        )
        .await
    }

    /// Insert the edge unless it already exists. Returns whether a row was written.
    pub async fn insert_edge_if_absent(
        &self,
        source: &str,
        target: &str,
        edge_type: &str,
        confidence: f64,
        veracity: f64,
        context_source: ContextSource,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        insert_edge_if_absent(
            &mut conn,
            source,
            target,
            edge_type,
            confidence,
            veracity,
            context_source,
        )
        .await
    }

    /// Every edge, ordered by `(source, target, type)`.
    pub async fn list_edges(&self) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT source, target, type, confidence, veracity, context_source
            FROM edges
            ORDER BY source, target, type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(edge_from_row).collect()
    }

    /// Edges with `id` as source or target.
    pub async fn edges_of(&self, id: &str) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT source, target, type, confidence, veracity, context_source
            FROM edges
            WHERE source = ?1 OR target = ?1
            ORDER BY source, target, type
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(edge_from_row).collect()
    }

    /// Delete a node and every edge touching it. Returns whether the node existed.
    pub async fn delete_node(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM edges WHERE source = ?1 OR target = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// `(id, title, vector)` for every node with an embedding, ordered by id.
    ///
    /// Blobs that fail to decode are logged and skipped.
    pub async fn embeddings(&self) -> Result<Vec<(String, String, UnitVector)>> {
        let rows = sqlx::query(
            "SELECT id, title, embedding FROM nodes WHERE embedding IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let title: Option<String> = row.try_get("title")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            match UnitVector::from_blob(&blob) {
                Ok(vector) => out.push((id.clone(), title.unwrap_or(id), vector)),
                Err(e) => warn!(id = %id, error = %e, "Skipping undecodable embedding"),
            }
        }
        Ok(out)
    }

    /// Store-wide embedding dimension, once any embedding has been written.
    pub async fn embedding_dims(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
                .bind(DIMS_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// `(id, title, aliases)` for every node, ordered by id.
    ///
    /// A node without a title is listed under its id.
    pub async fn lexicon(&self) -> Result<Vec<LexiconEntry>> {
        let rows = sqlx::query("SELECT id, title, meta FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let title: Option<String> = row.try_get("title")?;
            let meta = parse_meta(row.try_get("meta")?)?;
            let title = title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| id.clone());
            entries.push(LexiconEntry {
                id,
                title,
                aliases: aliases_from_meta(&meta),
            });
        }
        Ok(entries)
    }

    /// Map of stored `meta.source` to node id.
    pub async fn source_index(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT id, json_extract(meta, '$.source') AS source
            FROM nodes
            WHERE json_extract(meta, '$.source') IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut index = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let source: String = row.try_get("source")?;
            index.insert(source, id);
        }
        Ok(index)
    }

    /// Resolve root-relative source paths to node ids. Unknown paths are absent.
    pub async fn resolve_sources(&self, paths: &[String]) -> Result<HashMap<String, String>> {
        let wanted: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let mut index = self.source_index().await?;
        index.retain(|source, _| wanted.contains(source.as_str()));
        Ok(index)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        let with_embedding: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            nodes: nodes as usize,
            edges: edges as usize,
            nodes_with_embedding: with_embedding as usize,
            embedding_dims: self.embedding_dims().await?,
        })
    }

    /// Fold the WAL back into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

/// An open write transaction.
///
/// Errors from the storage layer come back wrapped in
/// [`Error::StorageTransaction`] carrying the batch index, except
/// [`Error::DimensionMismatch`], which is detected before anything is
/// written and leaves the transaction usable.
pub struct Batch {
    tx: Transaction<'static, Sqlite>,
    index: usize,
}

impl Batch {
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn upsert_node(&mut self, node: &Node) -> Result<bool> {
        upsert_node(&mut self.tx, node)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    pub async fn merge_node(&mut self, node: &Node) -> Result<()> {
        merge_node(&mut self.tx, node)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    pub async fn get_hash(&mut self, id: &str) -> Result<Option<String>> {
        get_hash(&mut self.tx, id)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    pub async fn upsert_edge(
        &mut self,
        source: &str,
        target: &str,
        edge_type: &str,
        confidence: f64,
        veracity: f64,
        context_source: ContextSource,
    ) -> Result<()> {
        upsert_edge(
            &mut self.tx,
            source,
            target,
            edge_type,
            confidence,
            veracity,
            context_source,
        )
        .await
        .map_err(|e| wrap(e, self.index))
    }

    pub async fn insert_edge_if_absent(
        &mut self,
        source: &str,
        target: &str,
        edge_type: &str,
        confidence: f64,
        veracity: f64,
        context_source: ContextSource,
    ) -> Result<bool> {
        insert_edge_if_absent(
            &mut self.tx,
            source,
            target,
            edge_type,
            confidence,
            veracity,
            context_source,
        )
        .await
        .map_err(|e| wrap(e, self.index))
    }

    /// Edges touching `id`, counting those written earlier in this batch.
    pub async fn degree(&mut self, id: &str) -> Result<usize> {
        degree(&mut self.tx, id)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    pub async fn edge_exists(&mut self, source: &str, target: &str, edge_type: &str) -> Result<bool> {
        edge_exists(&mut self.tx, source, target, edge_type)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    /// Remove one edge. Returns whether it existed.
    pub async fn delete_edge(&mut self, source: &str, target: &str, edge_type: &str) -> Result<bool> {
        delete_edge(&mut self.tx, source, target, edge_type)
            .await
            .map_err(|e| wrap(e, self.index))
    }

    pub async fn commit(self) -> Result<()> {
        let index = self.index;
        self.tx.commit().await.map_err(|e| Error::from(e).in_batch(index))?;
        debug!(batch = index, "Batch committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let index = self.index;
        self.tx
            .rollback()
            .await
            .map_err(|e| Error::from(e).in_batch(index))?;
        debug!(batch = index, "Batch rolled back");
        Ok(())
    }
}

fn wrap(err: Error, batch: usize) -> Error {
    match err {
        Error::DimensionMismatch { .. } => err,
        other => other.in_batch(batch),
    }
}

// ============ Statement helpers ============

async fn upsert_node(conn: &mut SqliteConnection, node: &Node) -> Result<bool> {
    if let Some(hash) = &node.hash {
        if get_hash(conn, &node.id).await?.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }
    }
    if let Some(embedding) = &node.embedding {
        check_dims(conn, embedding.dims()).await?;
    }

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO nodes (id, type, title, domain, layer, embedding, hash, meta, date, summary)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&node.id)
    .bind(&node.node_type)
    .bind(&node.title)
    .bind(&node.domain)
    .bind(&node.layer)
    .bind(node.embedding.as_ref().map(UnitVector::to_blob))
    .bind(&node.hash)
    .bind(serde_json::to_string(&node.meta)?)
    .bind(&node.date)
    .bind(&node.summary)
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

async fn merge_node(conn: &mut SqliteConnection, node: &Node) -> Result<()> {
    if let Some(embedding) = &node.embedding {
        check_dims(conn, embedding.dims()).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO nodes (id, type, title, domain, layer, embedding, hash, meta, date, summary)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            summary = excluded.summary,
            date = excluded.date
        "#,
    )
    .bind(&node.id)
    .bind(&node.node_type)
    .bind(&node.title)
    .bind(&node.domain)
    .bind(&node.layer)
    .bind(node.embedding.as_ref().map(UnitVector::to_blob))
    .bind(&node.hash)
    .bind(serde_json::to_string(&node.meta)?)
    .bind(&node.date)
    .bind(&node.summary)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn get_hash(conn: &mut SqliteConnection, id: &str) -> Result<Option<String>> {
    let hash: Option<Option<String>> = sqlx::query_scalar("SELECT hash FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(hash.flatten())
}

async fn upsert_edge(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
    confidence: f64,
    veracity: f64,
    context_source: ContextSource,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO edges (source, target, type, confidence, veracity, context_source)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, target, type) DO UPDATE SET
            confidence = excluded.confidence,
            veracity = excluded.veracity,
            context_source = excluded.context_source
        "#,
    )
    .bind(source)
    .bind(target)
    .bind(edge_type)
    .bind(clamp_unit(confidence))
    .bind(clamp_unit(veracity))
    .bind(context_source.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_edge_if_absent(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
    confidence: f64,
    veracity: f64,
    context_source: ContextSource,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO edges (source, target, type, confidence, veracity, context_source)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source)
    .bind(target)
    .bind(edge_type)
    .bind(clamp_unit(confidence))
    .bind(clamp_unit(veracity))
    .bind(context_source.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn degree(conn: &mut SqliteConnection, id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE source = ?1 OR target = ?1")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as usize)
}

async fn edge_exists(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM edges WHERE source = ? AND target = ? AND type = ?")
            .bind(source)
            .bind(target)
            .bind(edge_type)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

async fn delete_edge(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM edges WHERE source = ? AND target = ? AND type = ?")
        .bind(source)
        .bind(target)
        .bind(edge_type)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn check_dims(conn: &mut SqliteConnection, dims: usize) -> Result<()> {
    let stored: Option<String> = sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
        .bind(DIMS_KEY)
        .fetch_optional(&mut *conn)
        .await?;

    match stored.and_then(|v| v.parse::<usize>().ok()) {
        Some(expected) if expected != dims => Err(Error::DimensionMismatch {
            expected,
            actual: dims,
        }),
        Some(_) => Ok(()),
        None => {
            sqlx::query("INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)")
                .bind(DIMS_KEY)
                .bind(dims.to_string())
                .execute(&mut *conn)
                .await?;
            info!(dims, "Store embedding dimension fixed");
            Ok(())
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ============ Row mapping ============

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    let embedding = blob.map(|b| UnitVector::from_blob(&b)).transpose()?;

    let id: String = row.try_get("id")?;
    let title: Option<String> = row.try_get("title")?;

    Ok(Node {
        title: title.unwrap_or_else(|| id.clone()),
        id,
        node_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
        domain: row.try_get::<Option<String>, _>("domain")?.unwrap_or_default(),
        layer: row.try_get::<Option<String>, _>("layer")?.unwrap_or_default(),
        embedding,
        hash: row.try_get("hash")?,
        meta: parse_meta(row.try_get("meta")?)?,
        date: row.try_get("date")?,
        summary: row.try_get("summary")?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge> {
    let context_source: Option<String> = row.try_get("context_source")?;
    Ok(Edge {
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        edge_type: row.try_get("type")?,
        confidence: row.try_get::<Option<f64>, _>("confidence")?.unwrap_or(1.0),
        veracity: row.try_get::<Option<f64>, _>("veracity")?.unwrap_or(1.0),
        context_source: context_source.and_then(|s| s.parse().ok()),
    })
}

fn parse_meta(raw: Option<String>) -> Result<Map<String, Value>> {
    match raw {
        Some(s) if !s.trim().is_empty() => match serde_json::from_str::<Value>(&s)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        },
        _ => Ok(Map::new()),
    }
}

// ============ Identity ============

/// Stable node id for a root-relative path.
///
/// ```
/// use resonance::store::deterministic_id;
///
/// assert_eq!(deterministic_id("./docs/Guides/Set Up.md"), "docs-guides-set-up");
/// ```
pub fn deterministic_id(path: &str) -> String {
    let mut rest = path;

    // Leading run of dots followed by a slash ("./", "../").
    let dots = rest.len() - rest.trim_start_matches('.').len();
    if rest[dots..].starts_with('/') {
        rest = &rest[dots + 1..];
    }

    for ext in [".md", ".ts", ".js", ".json"] {
        if let Some(stripped) = rest.strip_suffix(ext) {
            rest = stripped;
            break;
        }
    }

    let mut id = String::with_capacity(rest.len());
    for c in rest.to_lowercase().chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        };
        if mapped == '-' && id.ends_with('-') {
            continue;
        }
        id.push(mapped);
    }

    id.trim_matches('-').to_string()
}

/// SHA-256 hex of `text` after CRLF → LF and trimming.
pub fn content_hash(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}
