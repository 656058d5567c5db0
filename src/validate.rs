//! Pre-ingestion corpus validation.
//!
//! The validator walks the configured sources the same way discovery does
//! and checks every candidate file before anything touches the store:
//!
//! | Check | Severity | Valid? |
//! |-------|----------|--------|
//! | symlink chain deeper than `max_symlink_depth` | warning | no |
//! | symlink loop, dangling link, or target already linked | error | no |
//! | 0 bytes | info | no |
//! | smaller than `min_file_size_bytes` | warning | yes |
//! | larger than `max_file_size_mb` | error | no |
//! | cannot be opened | error | no |
//!
//! Corpus-wide checks then warn on very large corpora and fail when no valid
//! file is left. Any error-level issue blocks ingestion. The report is also
//! written as JSON to `ingest.report_path` so it can be inspected after a
//! blocked run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::discover::{walk, Filter};
use crate::error::Result;

/// Links followed before a chain is treated as a loop.
const MAX_HOPS: usize = 40;

/// Path used for corpus-wide issues.
pub const CORPUS_PATH: &str = "(corpus)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    TooLarge,
    TooSmall,
    Empty,
    SymlinkDepth,
    CircularRef,
    Unreadable,
    MissingSource,
    TooManyFiles,
    TotalSize,
    NoValidFiles,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::TooLarge => "too_large",
            IssueCode::TooSmall => "too_small",
            IssueCode::Empty => "empty",
            IssueCode::SymlinkDepth => "symlink_depth",
            IssueCode::CircularRef => "circular_ref",
            IssueCode::Unreadable => "unreadable",
            IssueCode::MissingSource => "missing_source",
            IssueCode::TooManyFiles => "too_many_files",
            IssueCode::TotalSize => "total_size",
            IssueCode::NoValidFiles => "no_valid_files",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Root-relative path, or [`CORPUS_PATH`] for corpus-wide findings.
    pub path: String,
    pub code: IssueCode,
    pub severity: Severity,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub total_files: usize,
    pub valid_files: usize,
    pub skipped_files: usize,
    /// Combined size of the valid files.
    pub total_size_bytes: u64,
    pub estimated_nodes: usize,
    pub issues: Vec<Issue>,
    pub has_errors: bool,
    pub has_warnings: bool,
    /// RFC 3339.
    pub timestamp: String,
}

impl PreflightReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// Ingestion may proceed.
    pub fn passed(&self) -> bool {
        !self.has_errors
    }
}

enum Chain {
    Resolved { depth: usize, real: PathBuf },
    Loop,
    Dangling,
}

/// Follow a symlink chain hop by hop.
fn follow_chain(path: &Path) -> Chain {
    let mut current = path.to_path_buf();
    let mut visited = HashSet::new();
    let mut depth = 0;
    loop {
        let Ok(meta) = std::fs::symlink_metadata(&current) else {
            return Chain::Dangling;
        };
        if !meta.file_type().is_symlink() {
            return match std::fs::canonicalize(&current) {
                Ok(real) => Chain::Resolved { depth, real },
                Err(_) => Chain::Dangling,
            };
        }
        if depth >= MAX_HOPS || !visited.insert(current.clone()) {
            return Chain::Loop;
        }
        let Ok(target) = std::fs::read_link(&current) else {
            return Chain::Dangling;
        };
        current = match current.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        depth += 1;
    }
}

pub struct CorpusValidator {
    config: Config,
    filter: Filter,
}

impl CorpusValidator {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            filter: Filter::from_config(config)?,
            config: config.clone(),
        })
    }

    /// Validate the corpus without writing anything.
    pub fn analyze(&self) -> PreflightReport {
        let limits = &self.config.validation;
        let mut issues = Vec::new();
        let mut candidates = Vec::new();

        for (source, dir) in self.config.corpus.sources.iter().zip(self.config.source_dirs()) {
            if !dir.is_dir() {
                issues.push(Issue {
                    path: source.display().to_string(),
                    code: IssueCode::MissingSource,
                    severity: Severity::Warning,
                    details: format!("Source directory not found: {}", dir.display()),
                    recommendation: Some(format!(
                        "Create the directory: mkdir -p {}",
                        source.display()
                    )),
                });
                continue;
            }
            for entry in walk(&dir, self.config.store_dir()) {
                if self.filter.accepts(&self.config.relative_source(entry.path())) {
                    candidates.push((entry.path().to_path_buf(), entry.path_is_symlink()));
                }
            }
        }
        candidates.sort();

        let mut linked = HashSet::new();
        let mut valid_files = 0;
        let mut total_size_bytes = 0u64;
        for (path, is_symlink) in &candidates {
            if let Some(size) = self.check_file(path, *is_symlink, &mut linked, &mut issues) {
                valid_files += 1;
                total_size_bytes += size;
            }
        }

        let total_files = candidates.len();
        if total_files > limits.warn_total_files {
            issues.push(Issue {
                path: CORPUS_PATH.into(),
                code: IssueCode::TooManyFiles,
                severity: Severity::Warning,
                details: format!("Large corpus: {} files", total_files),
                recommendation: Some("Use more specific source directories or exclude globs".into()),
            });
        }
        if total_size_bytes > limits.warn_total_size_bytes() {
            issues.push(Issue {
                path: CORPUS_PATH.into(),
                code: IssueCode::TotalSize,
                severity: Severity::Warning,
                details: format!("Large total size: {}", format_mb(total_size_bytes)),
                recommendation: Some("Split the corpus or remove large files".into()),
            });
        }
        if valid_files == 0 {
            issues.push(Issue {
                path: CORPUS_PATH.into(),
                code: IssueCode::NoValidFiles,
                severity: Severity::Error,
                details: "No valid files found in the source directories".into(),
                recommendation: Some("Check [corpus] sources and include_globs".into()),
            });
        }

        let report = PreflightReport {
            total_files,
            valid_files,
            skipped_files: total_files - valid_files,
            total_size_bytes,
            estimated_nodes: valid_files,
            has_errors: issues.iter().any(|i| i.severity == Severity::Error),
            has_warnings: issues.iter().any(|i| i.severity == Severity::Warning),
            issues,
            timestamp: Utc::now().to_rfc3339(),
        };

        info!(
            total = report.total_files,
            valid = report.valid_files,
            errors = report.count(Severity::Error),
            warnings = report.count(Severity::Warning),
            "Pre-flight validation complete"
        );
        report
    }

    /// Validate and persist the report.
    pub fn run(&self) -> Result<PreflightReport> {
        let report = self.analyze();
        self.write_report(&report)?;
        Ok(report)
    }

    pub fn write_report(&self, report: &PreflightReport) -> Result<()> {
        let path = &self.config.ingest.report_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(report)?)?;
        Ok(())
    }

    /// Size of the file when it is valid.
    fn check_file(
        &self,
        path: &Path,
        is_symlink: bool,
        linked: &mut HashSet<PathBuf>,
        issues: &mut Vec<Issue>,
    ) -> Option<u64> {
        let limits = &self.config.validation;
        let rel = self.config.relative_source(path);
        let mut issue = |code: IssueCode, severity: Severity, details: String, recommendation: Option<&str>| {
            if severity == Severity::Error {
                warn!(path = %rel, code = %code, "{}", details);
            }
            issues.push(Issue {
                path: rel.clone(),
                code,
                severity,
                details,
                recommendation: recommendation.map(str::to_string),
            });
        };

        if is_symlink {
            match follow_chain(path) {
                Chain::Loop => {
                    issue(
                        IssueCode::CircularRef,
                        Severity::Error,
                        "Symlink chain loops back on itself".into(),
                        Some("Remove the circular symlink"),
                    );
                    return None;
                }
                Chain::Dangling => {
                    issue(
                        IssueCode::CircularRef,
                        Severity::Error,
                        "Symlink cannot be resolved".into(),
                        Some("Remove or repair the symlink"),
                    );
                    return None;
                }
                Chain::Resolved { depth, .. } if depth > limits.max_symlink_depth => {
                    issue(
                        IssueCode::SymlinkDepth,
                        Severity::Warning,
                        format!("Symlink depth {} exceeds maximum {}", depth, limits.max_symlink_depth),
                        Some("Link to the file directly or copy it"),
                    );
                    return None;
                }
                Chain::Resolved { real, .. } => {
                    if !linked.insert(real) {
                        issue(
                            IssueCode::CircularRef,
                            Severity::Error,
                            "Symlink target is already reachable through another link".into(),
                            Some("Remove the duplicate symlink"),
                        );
                        return None;
                    }
                }
            }
        }

        let size = match std::fs::metadata(path).and_then(|m| {
            std::fs::File::open(path)?;
            Ok(m.len())
        }) {
            Ok(size) => size,
            Err(e) => {
                issue(IssueCode::Unreadable, Severity::Error, format!("Failed to read file: {}", e), None);
                return None;
            }
        };

        if size == 0 {
            issue(
                IssueCode::Empty,
                Severity::Info,
                "Empty file (0 bytes)".into(),
                Some("Add content or remove the file"),
            );
            return None;
        }
        if size < limits.min_file_size_bytes {
            issue(
                IssueCode::TooSmall,
                Severity::Warning,
                format!("Very small file ({} bytes)", size),
                None,
            );
        }
        if size > limits.max_file_size_bytes() {
            issue(
                IssueCode::TooLarge,
                Severity::Error,
                format!("File too large ({} > {} MB)", format_mb(size), limits.max_file_size_mb),
                Some("Split into smaller files"),
            );
            return None;
        }
        Some(size)
    }
}

fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x".repeat(len)).unwrap();
    }

    fn codes(report: &PreflightReport) -> Vec<IssueCode> {
        report.issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_oversized_file_blocks() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "docs/a.md", 2048);
        write(tmp.path(), "docs/b.md", 2048);
        write(tmp.path(), "docs/c.md", 11 * 1024 * 1024);

        let validator = CorpusValidator::new(&Config::for_root(tmp.path())).unwrap();
        let report = validator.analyze();

        assert_eq!(report.total_files, 3);
        assert_eq!(report.valid_files, 2);
        assert_eq!(report.skipped_files, 1);
        assert_eq!(report.total_size_bytes, 4096);
        assert_eq!(report.count(Severity::Error), 1);
        assert_eq!(report.issues[0].path, "docs/c.md");
        assert_eq!(report.issues[0].code, IssueCode::TooLarge);
        assert!(!report.passed());
    }

    #[test]
    fn test_small_and_empty_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "docs/empty.md", 0);
        write(tmp.path(), "docs/tiny.md", 10);
        write(tmp.path(), "docs/ok.md", 500);

        let report = CorpusValidator::new(&Config::for_root(tmp.path())).unwrap().analyze();
        assert_eq!(codes(&report), vec![IssueCode::Empty, IssueCode::TooSmall]);
        assert_eq!(report.valid_files, 2);
        assert!(report.passed());
        assert!(report.has_warnings);
    }

    #[test]
    fn test_missing_source_and_no_files() {
        let tmp = TempDir::new().unwrap();
        let report = CorpusValidator::new(&Config::for_root(tmp.path())).unwrap().analyze();
        assert_eq!(codes(&report), vec![IssueCode::MissingSource, IssueCode::NoValidFiles]);
        assert_eq!(report.issues[0].severity, Severity::Warning);
        assert_eq!(report.issues[0].path, "docs");
        assert!(report.issues[0]
            .recommendation
            .as_deref()
            .is_some_and(|r| r.ends_with("mkdir -p docs")));
        assert!(report.has_errors);
    }

    #[test]
    fn test_corpus_warnings() {
        let tmp = TempDir::new().unwrap();
        for i in 0..3 {
            write(tmp.path(), &format!("docs/{}.md", i), 100);
        }
        let mut config = Config::for_root(tmp.path());
        config.validation.warn_total_files = 2;

        let report = CorpusValidator::new(&config).unwrap().analyze();
        assert_eq!(codes(&report), vec![IssueCode::TooManyFiles]);
        assert!(report.passed());
    }

    #[test]
    fn test_report_is_persisted() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "docs/a.md", 100);
        let config = Config::for_root(tmp.path());

        let report = CorpusValidator::new(&config).unwrap().run().unwrap();
        let saved: PreflightReport =
            serde_json::from_str(&std::fs::read_to_string(&config.ingest.report_path).unwrap()).unwrap();
        assert_eq!(saved, report);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_checks() {
        use std::os::unix::fs::symlink;

        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        write(tmp.path(), "docs/real.md", 100);
        write(tmp.path(), "shared/target.md", 100);

        symlink(tmp.path().join("shared/target.md"), docs.join("link1.md")).unwrap();
        symlink(tmp.path().join("shared/target.md"), docs.join("link2.md")).unwrap();
        symlink(docs.join("loop_b.md"), docs.join("loop_a.md")).unwrap();
        symlink(docs.join("loop_a.md"), docs.join("loop_b.md")).unwrap();
        symlink(docs.join("missing.txt"), docs.join("dangling.md")).unwrap();
        // deep.md -> h3 -> h2 -> h1 -> real.md
        symlink(docs.join("real.md"), docs.join("h1.lnk")).unwrap();
        symlink(docs.join("h1.lnk"), docs.join("h2.lnk")).unwrap();
        symlink(docs.join("h2.lnk"), docs.join("h3.lnk")).unwrap();
        symlink(docs.join("h3.lnk"), docs.join("deep.md")).unwrap();

        let report = CorpusValidator::new(&Config::for_root(tmp.path())).unwrap().analyze();
        let by_path = |p: &str| report.issues.iter().find(|i| i.path == p).map(|i| i.code);

        assert_eq!(by_path("docs/dangling.md"), Some(IssueCode::CircularRef));
        assert_eq!(by_path("docs/deep.md"), Some(IssueCode::SymlinkDepth));
        assert_eq!(by_path("docs/link1.md"), None);
        assert_eq!(by_path("docs/link2.md"), Some(IssueCode::CircularRef));
        assert_eq!(by_path("docs/loop_a.md"), Some(IssueCode::CircularRef));
        assert_eq!(by_path("docs/loop_b.md"), Some(IssueCode::CircularRef));
        assert_eq!(report.valid_files, 2);
        assert!(report.has_errors);
    }
}
