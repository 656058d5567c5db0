//! TOML configuration.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration that ingests `./docs/**/*.md` into
//! `./.resonance/resonance.db` with embeddings disabled.
//!
//! Relative paths resolve against `corpus.root`; a relative `corpus.root`
//! resolves against the directory holding the config file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".resonance/resonance.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Project root. Node ids derive from paths relative to it.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_sources")]
    pub sources: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            sources: default_sources(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_sources() -> Vec<PathBuf> {
    vec![PathBuf::from("docs")]
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Files per explicit transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bodies at or below this many characters are stored without an embedding.
    #[serde(default = "default_min_embed_chars")]
    pub min_embed_chars: usize,
    /// Delete nodes whose source file disappeared from a configured source.
    #[serde(default)]
    pub prune_missing: bool,
    /// Link edge-less nodes to their nearest semantic neighbour after a run.
    #[serde(default)]
    pub rescue_orphans: bool,
    #[serde(default = "default_orphan_threshold")]
    pub orphan_threshold: f32,
    /// Weaver edges into a node with more incident edges than this are rejected. `0` disables.
    #[serde(default = "default_super_node_threshold")]
    pub super_node_threshold: usize,
    /// Chain dated nodes of `timeline_node_type` with `SUCCEEDS` edges after a run.
    #[serde(default = "default_true")]
    pub weave_timeline: bool,
    #[serde(default = "default_timeline_node_type")]
    pub timeline_node_type: String,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_embed_chars: default_min_embed_chars(),
            prune_missing: false,
            rescue_orphans: false,
            orphan_threshold: default_orphan_threshold(),
            super_node_threshold: default_super_node_threshold(),
            weave_timeline: true,
            timeline_node_type: default_timeline_node_type(),
            report_path: default_report_path(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_min_embed_chars() -> usize {
    50
}
fn default_orphan_threshold() -> f32 {
    0.85
}
fn default_super_node_threshold() -> usize {
    crate::weaver::DEFAULT_SUPER_NODE_THRESHOLD
}
fn default_true() -> bool {
    true
}
fn default_timeline_node_type() -> String {
    "debrief".to_string()
}
fn default_report_path() -> PathBuf {
    PathBuf::from(".resonance/pre-flight.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_min_file_size_bytes")]
    pub min_file_size_bytes: u64,
    #[serde(default = "default_max_symlink_depth")]
    pub max_symlink_depth: usize,
    #[serde(default = "default_warn_total_files")]
    pub warn_total_files: usize,
    #[serde(default = "default_warn_total_size_mb")]
    pub warn_total_size_mb: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            min_file_size_bytes: default_min_file_size_bytes(),
            max_symlink_depth: default_max_symlink_depth(),
            warn_total_files: default_warn_total_files(),
            warn_total_size_mb: default_warn_total_size_mb(),
        }
    }
}

impl ValidationConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn warn_total_size_bytes(&self) -> u64 {
        self.warn_total_size_mb * 1024 * 1024
    }
}

fn default_max_file_size_mb() -> u64 {
    10
}
fn default_min_file_size_bytes() -> u64 {
    50
}
fn default_max_symlink_depth() -> usize {
    3
}
fn default_warn_total_files() -> usize {
    1000
}
fn default_warn_total_size_mb() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive systemic provider failures that halt an ingestion run.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_circuit_breaker_threshold() -> usize {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_min_query_len")]
    pub min_exact_query_len: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_exact_query_len: default_min_query_len(),
            default_limit: default_limit(),
        }
    }
}

fn default_min_query_len() -> usize {
    3
}
fn default_limit() -> usize {
    10
}

impl Config {
    /// Default configuration rooted at `root`, with paths already resolved.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.corpus.root = root.into();
        config.resolve_paths();
        config
    }

    /// Absolute source directories.
    pub fn source_dirs(&self) -> Vec<PathBuf> {
        self.corpus
            .sources
            .iter()
            .map(|s| self.corpus.root.join(s))
            .collect()
    }

    /// Directory holding the store file; excluded from discovery and surveys.
    pub fn store_dir(&self) -> Option<&Path> {
        self.db.path.parent()
    }

    /// Path of `path` relative to the corpus root, with `/` separators.
    ///
    /// This is the canonical form stored in `meta.source` and fed to
    /// [`deterministic_id`](crate::store::deterministic_id).
    pub fn relative_source(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.corpus.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn resolve_paths(&mut self) {
        let root = self.corpus.root.clone();
        if self.db.path.is_relative() {
            self.db.path = root.join(&self.db.path);
        }
        if self.ingest.report_path.is_relative() {
            self.ingest.report_path = root.join(&self.ingest.report_path);
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.corpus.root.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.corpus.root = base.join(&config.corpus.root);
    }
    config.resolve_paths();

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.corpus.sources.is_empty() {
        bail!("corpus.sources must name at least one directory");
    }

    if config.ingest.batch_size == 0 {
        bail!("ingest.batch_size must be > 0");
    }

    if !(0.0..=1.0).contains(&config.ingest.orphan_threshold) {
        bail!("ingest.orphan_threshold must be in [0.0, 1.0]");
    }

    if config.validation.max_file_size_mb == 0 {
        bail!("validation.max_file_size_mb must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resonance.toml");
        std::fs::write(&path, "").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.ingest.min_embed_chars, 50);
        assert_eq!(config.ingest.super_node_threshold, 50);
        assert!(config.ingest.weave_timeline);
        assert_eq!(config.ingest.timeline_node_type, "debrief");
        assert_eq!(config.validation.max_file_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.corpus.include_globs, vec!["**/*.md".to_string()]);
        assert!(config.db.path.starts_with(tmp.path()));
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_enabled_provider_requires_dims() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resonance.toml");
        std::fs::write(&path, "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic\"\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resonance.toml");
        std::fs::write(&path, "[embedding]\nprovider = \"magic\"\n").unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_relative_source_uses_forward_slashes() {
        let config = Config::for_root("/project");
        let rel = config.relative_source(Path::new("/project/docs/guides/setup.md"));
        assert_eq!(rel, "docs/guides/setup.md");
    }
}
