//! Ingestion pipeline orchestration.
//!
//! Drives one run through a fixed sequence of states:
//!
//! ```text
//! Idle → Validating → Discovering → Processing{batch}… → Committing → Done
//!            │                            │
//!            └→ Blocked                   └→ Failed
//! ```
//!
//! - **Validating**: the [`CorpusValidator`] report is written; any
//!   error-level issue blocks the run before the store is touched.
//! - **Discovering**: source files are collected in sorted order.
//! - **Processing**: files are handled in batches of `ingest.batch_size`,
//!   one transaction per batch. A file whose normalized-content hash matches
//!   the stored one is skipped outright. Otherwise its frontmatter is parsed,
//!   the body is embedded (when long enough) and tokenized, the node is
//!   upserted, and the weaver links it to the lexicon snapshot. Two files
//!   that map to the same id in one run do not overwrite each other: the
//!   first in path order wins and the second is recorded as a failure.
//! - **Committing**: optional pruning, the timeline chain, optional orphan
//!   rescue, then a WAL checkpoint.
//!
//! Per-file problems are recorded as [`FileFailure`]s and the run moves on.
//! A storage failure rolls back the current batch and fails the run; earlier
//! batches stay committed. Repeated systemic embedding failures trip a
//! circuit breaker that commits the current batch and halts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discover::discover;
use crate::embedding::Embedder;
use crate::error::{Error, Result, Stage};
use crate::frontmatter::{self, get_string};
use crate::models::Node;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::store::{content_hash, deterministic_id, Batch, NodeEdgeStore};
use crate::tokenizer::{Tokenizer, VocabularyTokenizer};
use crate::validate::{CorpusValidator, PreflightReport, Severity};
use crate::timeline::TimelineWeaver;
use crate::vector::{UnitVector, VectorEngine};
use crate::weaver::{GateStats, LexiconWeaver};

static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Validating,
    Discovering,
    Processing { batch: usize },
    Committing,
    Done,
    Blocked,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Blocked | PipelineState::Failed
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Validating => f.write_str("validating"),
            PipelineState::Discovering => f.write_str("discovering"),
            PipelineState::Processing { batch } => write!(f, "processing(batch {})", batch),
            PipelineState::Committing => f.write_str("committing"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Blocked => f.write_str("blocked"),
            PipelineState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionStats {
    /// Files discovered (or passed to [`IngestionPipeline::ingest_files`]).
    pub files: usize,
    /// Store totals after the run.
    pub nodes: usize,
    pub edges: usize,
    pub vectors: usize,
    pub duration_sec: f64,
    /// Files written to the store.
    pub processed: usize,
    /// Files skipped because their content hash was unchanged.
    pub skipped: usize,
    pub failed: usize,
    /// Files that received a new embedding.
    pub embedded: usize,
    pub pruned: usize,
    pub rescued: usize,
    /// `SUCCEEDS` edges added by the timeline chain.
    pub timeline_linked: usize,
    pub super_node_gate: GateStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub success: bool,
    pub state: PipelineState,
    pub stats: IngestionStats,
    pub failures: Vec<FileFailure>,
    /// Absent for [`IngestionPipeline::ingest_files`], which skips validation.
    pub preflight: Option<PreflightReport>,
    /// Cause of a `failed` run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum FileOutcome {
    Unchanged,
    Written { embedded: bool, gate: GateStats },
}

enum FileError {
    /// Record the failure and move on to the next file.
    Skip {
        stage: Stage,
        message: String,
        systemic: bool,
    },
    /// Roll back the batch and fail the run.
    Fatal(Error),
}

impl FileError {
    fn skip(stage: Stage, message: impl fmt::Display) -> Self {
        FileError::Skip {
            stage,
            message: message.to_string(),
            systemic: false,
        }
    }
}

enum RunEnd {
    Completed,
    /// Circuit breaker tripped.
    Halted,
}

#[derive(Default)]
struct Run {
    stats: IngestionStats,
    failures: Vec<FileFailure>,
}

pub struct IngestionPipeline {
    store: NodeEdgeStore,
    embedder: Arc<dyn Embedder>,
    config: Config,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    progress: Box<dyn ProgressReporter>,
    state: PipelineState,
}

impl IngestionPipeline {
    pub fn new(store: NodeEdgeStore, embedder: Arc<dyn Embedder>, config: &Config) -> Self {
        Self {
            store,
            embedder,
            config: config.clone(),
            tokenizer: None,
            progress: Box::new(NoProgress),
            state: PipelineState::Idle,
        }
    }

    /// Use `tokenizer` instead of one built from the lexicon snapshot.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn store(&self) -> &NodeEdgeStore {
        &self.store
    }

    /// Validate, discover, and ingest the whole corpus.
    pub async fn ingest(&mut self) -> IngestionReport {
        let start = Instant::now();
        let mut run = Run::default();

        self.transition(PipelineState::Validating);
        self.progress.report(ProgressEvent::Validating);
        let validator = match CorpusValidator::new(&self.config) {
            Ok(validator) => validator,
            Err(e) => return self.finish(run, None, Err(e), None, start).await,
        };
        let preflight = validator.analyze();
        if let Err(e) = validator.write_report(&preflight) {
            warn!(
                path = %self.config.ingest.report_path.display(),
                error = %e,
                "Failed to write pre-flight report"
            );
        }

        if !preflight.passed() {
            warn!(
                errors = preflight.count(Severity::Error),
                report = %self.config.ingest.report_path.display(),
                "Pre-flight validation failed; ingestion blocked"
            );
            self.transition(PipelineState::Blocked);
            run.stats.duration_sec = start.elapsed().as_secs_f64();
            return IngestionReport {
                success: false,
                state: self.state,
                stats: run.stats,
                failures: run.failures,
                preflight: Some(preflight),
                error: None,
            };
        }

        self.transition(PipelineState::Discovering);
        self.progress.report(ProgressEvent::Discovering);
        let files = match discover(&self.config) {
            Ok(files) => files,
            Err(e) => return self.finish(run, Some(preflight), Err(e), None, start).await,
        };

        run.stats.files = files.len();
        let outcome = self.process(&files, &mut run).await;
        self.finish(run, Some(preflight), outcome, Some(files.as_slice()), start)
            .await
    }

    /// Ingest exactly `paths`, skipping validation and pruning.
    ///
    /// Relative paths are taken against the corpus root. Hash gating and
    /// weaving behave as in [`ingest`](Self::ingest).
    pub async fn ingest_files(&mut self, paths: &[PathBuf]) -> IngestionReport {
        let start = Instant::now();
        let mut run = Run::default();

        self.transition(PipelineState::Discovering);
        let mut files: Vec<PathBuf> = paths
            .iter()
            .map(|p| {
                if p.is_relative() {
                    self.config.corpus.root.join(p)
                } else {
                    p.clone()
                }
            })
            .collect();
        files.sort();
        files.dedup();

        run.stats.files = files.len();
        let outcome = self.process(&files, &mut run).await;
        self.finish(run, None, outcome, None, start).await
    }

    fn transition(&mut self, next: PipelineState) {
        info!(from = %self.state, to = %next, "Pipeline state");
        self.state = next;
    }

    async fn process(&mut self, files: &[PathBuf], run: &mut Run) -> Result<RunEnd> {
        let lexicon = self.store.lexicon().await?;
        let weaver = LexiconWeaver::new(lexicon.clone())
            .with_super_node_threshold(self.config.ingest.super_node_threshold);
        let tokenizer: Arc<dyn Tokenizer> = match &self.tokenizer {
            Some(tokenizer) => tokenizer.clone(),
            None => Arc::new(VocabularyTokenizer::from_lexicon(&lexicon)),
        };
        debug!(entities = weaver.len(), "Lexicon snapshot loaded");

        let total = files.len() as u64;
        let batch_size = self.config.ingest.batch_size.max(1);
        let breaker_threshold = self.config.embedding.circuit_breaker_threshold.max(1);
        let mut consecutive_systemic = 0;
        let mut handled = 0u64;
        // id -> source path that claimed it in this run
        let mut claimed: HashMap<String, String> = HashMap::new();

        for (index, chunk) in files.chunks(batch_size).enumerate() {
            self.transition(PipelineState::Processing { batch: index });
            let mut batch = self.store.begin_batch(index).await?;
            let mut tripped = false;

            for path in chunk {
                let result = self
                    .process_file(&mut batch, path, &mut claimed, &weaver, tokenizer.as_ref())
                    .await;
                handled += 1;
                self.progress.report(ProgressEvent::Processing { n: handled, total });

                match result {
                    Ok(FileOutcome::Unchanged) => run.stats.skipped += 1,
                    Ok(FileOutcome::Written { embedded, gate }) => {
                        run.stats.processed += 1;
                        run.stats.super_node_gate.add(gate);
                        if embedded {
                            run.stats.embedded += 1;
                            consecutive_systemic = 0;
                        }
                    }
                    Err(FileError::Skip {
                        stage,
                        message,
                        systemic,
                    }) => {
                        let rel = self.config.relative_source(path);
                        warn!(path = %rel, stage = %stage, error = %message, "Skipping file");
                        run.stats.failed += 1;
                        run.failures.push(FileFailure {
                            path: rel,
                            stage,
                            message,
                        });

                        if systemic {
                            consecutive_systemic += 1;
                        } else if stage == Stage::Embed {
                            consecutive_systemic = 0;
                        }
                        if consecutive_systemic >= breaker_threshold {
                            error!(
                                failures = consecutive_systemic,
                                "Embedding provider keeps failing; halting after this batch"
                            );
                            tripped = true;
                            break;
                        }
                    }
                    Err(FileError::Fatal(e)) => {
                        error!(batch = index, error = %e, "Storage failure; rolling back batch");
                        if let Err(rollback) = batch.rollback().await {
                            warn!(batch = index, error = %rollback, "Rollback failed");
                        }
                        return Err(e);
                    }
                }
            }

            batch.commit().await?;
            if tripped {
                return Ok(RunEnd::Halted);
            }
        }

        let gate = run.stats.super_node_gate;
        if gate.rejected > 0 {
            info!(
                checked = gate.checked,
                rejected = gate.rejected,
                threshold = self.config.ingest.super_node_threshold,
                "Super-node gate filtered edges"
            );
        }
        Ok(RunEnd::Completed)
    }

    async fn process_file(
        &self,
        batch: &mut Batch,
        path: &Path,
        claimed: &mut HashMap<String, String>,
        weaver: &LexiconWeaver,
        tokenizer: &dyn Tokenizer,
    ) -> std::result::Result<FileOutcome, FileError> {
        let rel = self.config.relative_source(path);
        let id = deterministic_id(&rel);
        let owner = claimed.entry(id.clone()).or_insert_with(|| rel.clone());
        if *owner != rel {
            return Err(FileError::skip(
                Stage::Store,
                format!("id collision with {} (both map to {})", owner, id),
            ));
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FileError::skip(Stage::Read, e))?;

        let hash = content_hash(&text);
        let stored = batch.get_hash(&id).await.map_err(FileError::Fatal)?;
        if stored.as_deref() == Some(hash.as_str()) {
            debug!(path = %rel, "Unchanged; skipping");
            return Ok(FileOutcome::Unchanged);
        }

        let parsed = frontmatter::parse(&text).map_err(|e| FileError::skip(Stage::Parse, e))?;
        let mut node = derive_node(&id, &rel, path, &parsed.frontmatter, parsed.body);
        node.hash = Some(hash);

        let body = parsed.body.trim();
        let dims = self.embedder.dims();
        if dims > 0 && body.chars().count() > self.config.ingest.min_embed_chars {
            let raw = self.embedder.embed(body).await.map_err(|e| FileError::Skip {
                stage: Stage::Embed,
                systemic: e.is_systemic(),
                message: e.to_string(),
            })?;
            let vector =
                UnitVector::normalize(&raw, dims).map_err(|e| FileError::skip(Stage::Embed, e))?;
            node.embedding = Some(vector);
        }

        let tokens = tokenizer.extract(parsed.body);
        node.meta.insert(
            "semantic_tokens".to_string(),
            Value::Array(tokens.into_iter().map(Value::String).collect()),
        );

        match batch.upsert_node(&node).await {
            Ok(_) => {}
            Err(e @ Error::DimensionMismatch { .. }) => {
                return Err(FileError::skip(Stage::Store, e));
            }
            Err(e) => return Err(FileError::Fatal(e)),
        }

        let woven = weaver
            .weave_into(batch, &id, parsed.body)
            .await
            .map_err(FileError::Fatal)?;

        debug!(
            path = %rel,
            id = %id,
            edges = woven.written,
            embedded = node.embedding.is_some(),
            "Node written"
        );
        Ok(FileOutcome::Written {
            embedded: node.embedding.is_some(),
            gate: woven.gate,
        })
    }

    async fn finish(
        &mut self,
        mut run: Run,
        preflight: Option<PreflightReport>,
        outcome: Result<RunEnd>,
        discovered: Option<&[PathBuf]>,
        start: Instant,
    ) -> IngestionReport {
        let outcome = match outcome {
            Ok(RunEnd::Completed) => {
                self.transition(PipelineState::Committing);
                self.progress.report(ProgressEvent::Committing);
                self.post_process(&mut run, discovered).await
            }
            other => other,
        };

        let error = match outcome {
            Ok(RunEnd::Completed) => {
                self.transition(PipelineState::Done);
                None
            }
            Ok(RunEnd::Halted) => {
                self.transition(PipelineState::Failed);
                Some("embedding circuit breaker tripped".to_string())
            }
            Err(e) => {
                error!(error = %e, "Ingestion failed");
                self.transition(PipelineState::Failed);
                Some(e.to_string())
            }
        };

        if let Err(e) = self.store.checkpoint().await {
            warn!(error = %e, "WAL checkpoint failed");
        }
        match self.store.stats().await {
            Ok(totals) => {
                run.stats.nodes = totals.nodes;
                run.stats.edges = totals.edges;
                run.stats.vectors = totals.nodes_with_embedding;
            }
            Err(e) => warn!(error = %e, "Failed to read store totals"),
        }
        run.stats.duration_sec = start.elapsed().as_secs_f64();

        info!(
            state = %self.state,
            files = run.stats.files,
            processed = run.stats.processed,
            skipped = run.stats.skipped,
            failed = run.stats.failed,
            embedded = run.stats.embedded,
            nodes = run.stats.nodes,
            edges = run.stats.edges,
            duration_sec = run.stats.duration_sec,
            "Ingestion finished"
        );

        IngestionReport {
            success: self.state == PipelineState::Done,
            state: self.state,
            stats: run.stats,
            failures: run.failures,
            preflight,
            error,
        }
    }

    async fn post_process(&self, run: &mut Run, discovered: Option<&[PathBuf]>) -> Result<RunEnd> {
        if let Some(discovered) = discovered.filter(|_| self.config.ingest.prune_missing) {
            run.stats.pruned = self.prune(discovered).await?;
        }
        if self.config.ingest.weave_timeline {
            let timeline = TimelineWeaver::new(&self.config.ingest.timeline_node_type);
            run.stats.timeline_linked = timeline.weave(&self.store).await?.linked;
        }
        if self.config.ingest.rescue_orphans && self.embedder.dims() > 0 {
            let engine = VectorEngine::new(self.store.clone(), self.embedder.clone());
            run.stats.rescued = engine
                .rescue_orphans(self.config.ingest.orphan_threshold)
                .await?;
        }
        Ok(RunEnd::Completed)
    }

    /// Delete nodes whose source lies under a configured source but was not discovered.
    async fn prune(&self, discovered: &[PathBuf]) -> Result<usize> {
        let present: HashSet<String> = discovered
            .iter()
            .map(|p| self.config.relative_source(p))
            .collect();
        let prefixes: Vec<String> = self
            .config
            .corpus
            .sources
            .iter()
            .map(|s| normalize_source(&s.to_string_lossy()))
            .collect();

        let mut stale: Vec<(String, String)> = self
            .store
            .source_index()
            .await?
            .into_iter()
            .filter(|(source, _)| !present.contains(source))
            .filter(|(source, _)| prefixes.iter().any(|p| is_under(source, p)))
            .collect();
        stale.sort();

        let mut pruned = 0;
        for (source, id) in stale {
            if self.store.delete_node(&id).await? {
                info!(id = %id, source = %source, "Pruned node for missing file");
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

/// Build the node for a changed file.
///
/// Title: frontmatter `title`, first `# ` heading, file stem. Date:
/// frontmatter `date`, `YYYY-MM-DD` file name prefix.
fn derive_node(id: &str, rel: &str, path: &Path, fm: &Map<String, Value>, body: &str) -> Node {
    let title = get_string(fm, "title")
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| file_stem(path));

    let mut node = Node::new(id, title);
    if let Some(node_type) = get_string(fm, "type") {
        node.node_type = node_type;
    }
    if let Some(domain) = get_string(fm, "domain") {
        node.domain = domain;
    }
    if let Some(layer) = get_string(fm, "layer") {
        node.layer = layer;
    }
    node.date = get_string(fm, "date").or_else(|| date_prefix(path));
    node.summary = get_string(fm, "summary").or_else(|| get_string(fm, "description"));
    node.meta = fm.clone();
    node.meta
        .insert("source".to_string(), Value::String(rel.to_string()));
    node
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.trim_start().strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn date_prefix(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let date = DATE_PREFIX.captures(name)?.get(1)?.as_str();
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.to_string())
}

/// `./docs/` → `docs`, `.` → empty (the whole root).
fn normalize_source(source: &str) -> String {
    let mut s = source.trim();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    let s = s.trim_end_matches('/');
    if s == "." {
        String::new()
    } else {
        s.to_string()
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fm(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_title_fallbacks() {
        let path = Path::new("/corpus/docs/2024-05-01-release-notes.md");

        let node = derive_node("x", "docs/a.md", path, &fm(json!({"title": "From FM"})), "# Heading");
        assert_eq!(node.title, "From FM");

        let node = derive_node("x", "docs/a.md", path, &Map::new(), "intro\n## Sub\n# Heading \n");
        assert_eq!(node.title, "Heading");

        let node = derive_node("x", "docs/a.md", path, &Map::new(), "no headings");
        assert_eq!(node.title, "2024-05-01-release-notes");
    }

    #[test]
    fn test_node_fields_from_frontmatter() {
        let path = Path::new("docs/2024-05-01-notes.md");
        let node = derive_node(
            "docs-notes",
            "docs/2024-05-01-notes.md",
            path,
            &fm(json!({"type": "playbook", "domain": "ops", "tags": ["a"]})),
            "body",
        );
        assert_eq!(node.node_type, "playbook");
        assert_eq!(node.domain, "ops");
        assert_eq!(node.layer, "document");
        assert_eq!(node.date.as_deref(), Some("2024-05-01"));
        assert_eq!(node.source(), Some("docs/2024-05-01-notes.md"));
        assert_eq!(node.meta["tags"], json!(["a"]));

        let node = derive_node("x", "x.md", path, &fm(json!({"date": "2023-01-02"})), "");
        assert_eq!(node.date.as_deref(), Some("2023-01-02"));
    }

    #[test]
    fn test_date_prefix_must_be_a_real_date() {
        assert_eq!(date_prefix(Path::new("2024-13-40-x.md")), None);
        assert_eq!(date_prefix(Path::new("notes.md")), None);
        assert_eq!(
            date_prefix(Path::new("2024-02-29.md")).as_deref(),
            Some("2024-02-29")
        );
    }

    #[test]
    fn test_source_prefixes() {
        assert_eq!(normalize_source("./docs/"), "docs");
        assert_eq!(normalize_source("."), "");
        assert!(is_under("docs/a.md", "docs"));
        assert!(!is_under("docsx/a.md", "docs"));
        assert!(is_under("anything.md", ""));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Processing { batch: 2 }.to_string(), "processing(batch 2)");
        assert!(PipelineState::Blocked.is_terminal());
        assert!(!PipelineState::Committing.is_terminal());
    }
}
