//! Literal text search over the corpus on disk.
//!
//! Vector search misses exact identifiers, error strings, and config keys.
//! The surveyor finds them with whatever search tool the host has, in order
//! of preference:
//!
//! 1. `rg` (fixed string, case-insensitive, first match per file)
//! 2. `grep -r -F -i -m 1`
//! 3. a built-in scanner over `walkdir`
//!
//! Matching files are joined back to nodes through the `meta.source` path
//! recorded at ingestion. Files that were never ingested are dropped. A
//! failed search is logged and yields no hits; it is never an error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Instant;

use globset::GlobSet;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::discover::build_globset;
use crate::store::NodeEdgeStore;

/// Maximum characters of matched line kept per hit.
const MAX_COLUMNS: usize = 200;

/// Directories never searched.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target"];

static OUTPUT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):(\d+):(.*)$").expect("valid regex"));

/// One literal match, resolved to the node ingested from its file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExactHit {
    pub id: String,
    /// Root-relative path with `/` separators.
    pub path: String,
    pub line: usize,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchTool {
    Ripgrep,
    Grep,
    Builtin,
}

impl SearchTool {
    fn name(self) -> &'static str {
        match self {
            SearchTool::Ripgrep => "rg",
            SearchTool::Grep => "grep",
            SearchTool::Builtin => "builtin",
        }
    }

    fn fallback(self) -> Option<SearchTool> {
        match self {
            SearchTool::Ripgrep => Some(SearchTool::Grep),
            SearchTool::Grep => Some(SearchTool::Builtin),
            SearchTool::Builtin => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RawHit {
    path: String,
    line: usize,
    content: String,
}

pub struct ExactMatchSurveyor {
    store: NodeEdgeStore,
    root: PathBuf,
    /// Store directory name relative to the root, when it lies inside it.
    store_dir: Option<String>,
    excludes: GlobSet,
    min_query_len: usize,
    tool: OnceCell<SearchTool>,
}

impl ExactMatchSurveyor {
    pub fn new(store: NodeEdgeStore, config: &Config) -> crate::error::Result<Self> {
        let root = config.corpus.root.clone();
        let store_dir = config
            .store_dir()
            .filter(|dir| dir.starts_with(&root))
            .map(|dir| config.relative_source(dir))
            .filter(|rel| !rel.is_empty());

        Ok(Self {
            store,
            excludes: build_globset(&config.corpus.exclude_globs)?,
            store_dir,
            root,
            min_query_len: config.search.min_exact_query_len,
            tool: OnceCell::new(),
        })
    }

    /// Force a specific tool, skipping detection.
    #[cfg(test)]
    fn with_tool(self, tool: SearchTool) -> Self {
        Self {
            tool: OnceCell::new_with(Some(tool)),
            ..self
        }
    }

    /// Files under the root containing `query`, one hit per file, at most `limit`.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<ExactHit> {
        let query = query.trim();
        if query.chars().count() < self.min_query_len || limit == 0 {
            return Vec::new();
        }

        let start = Instant::now();
        let mut tool = Some(*self.tool.get_or_init(detect_tool).await);
        let mut raw = Vec::new();
        let mut used = "none";

        while let Some(current) = tool {
            match self.run(current, query).await {
                Ok(hits) => {
                    raw = hits;
                    used = current.name();
                    break;
                }
                Err(e) => {
                    warn!(tool = current.name(), error = %e, "Search tool failed, falling back");
                    tool = current.fallback();
                }
            }
        }

        raw.retain(|hit| !self.excludes.is_match(&hit.path));
        raw.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<String> = raw.iter().map(|h| h.path.clone()).collect();
        let resolved = match self.store.resolve_sources(&paths).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "Failed to resolve survey hits to nodes");
                return Vec::new();
            }
        };

        let hits: Vec<ExactHit> = raw
            .into_iter()
            .filter_map(|hit| {
                let id = resolved.get(&hit.path)?.clone();
                Some(ExactHit {
                    id,
                    path: hit.path,
                    line: hit.line,
                    content: hit.content,
                    score: 1.0,
                })
            })
            .take(limit)
            .collect();

        info!(
            query,
            tool = used,
            found = hits.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Exact search complete"
        );
        hits
    }

    async fn run(&self, tool: SearchTool, query: &str) -> Result<Vec<RawHit>, String> {
        match tool {
            SearchTool::Ripgrep => {
                let mut args: Vec<String> = [
                    "-F",
                    "-i",
                    "-n",
                    "--max-count=1",
                    "--max-columns=200",
                    "--no-heading",
                    "--with-filename",
                    "--color=never",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                for dir in SKIP_DIRS.iter().copied().chain(self.store_dir.as_deref()) {
                    args.push("-g".into());
                    args.push(format!("!**/{}/**", dir));
                }
                args.push("--".into());
                args.push(query.to_string());
                args.push(".".into());
                self.run_command("rg", &args).await
            }
            SearchTool::Grep => {
                let mut args: Vec<String> = ["-r", "-F", "-i", "-n", "-I", "-m", "1"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                for dir in SKIP_DIRS.iter().copied().chain(self.store_dir.as_deref()) {
                    args.push(format!("--exclude-dir={}", dir));
                }
                args.push("--".into());
                args.push(query.to_string());
                args.push(".".into());
                self.run_command("grep", &args).await
            }
            SearchTool::Builtin => {
                let root = self.root.clone();
                let store_dir = self.store_dir.clone();
                let query = query.to_lowercase();
                tokio::task::spawn_blocking(move || scan(&root, store_dir.as_deref(), &query))
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<Vec<RawHit>, String> {
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", program, e))?;

        // Exit 1 means no match. Exit 2 with output means partial results.
        let stdout = String::from_utf8_lossy(&output.stdout);
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ if !stdout.trim().is_empty() => {
                debug!(program, status = ?output.status, "Search exited with errors; using partial output");
            }
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()));
            }
        }

        Ok(stdout.lines().filter_map(parse_line).collect())
    }
}

async fn detect_tool() -> SearchTool {
    for (program, tool) in [("rg", SearchTool::Ripgrep), ("grep", SearchTool::Grep)] {
        let available = Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if available {
            debug!(tool = program, "Search tool detected");
            return tool;
        }
    }
    debug!("No external search tool, using built-in scanner");
    SearchTool::Builtin
}

/// Parse `path:line:content` as printed by `rg` and `grep`.
fn parse_line(line: &str) -> Option<RawHit> {
    let caps = OUTPUT_LINE.captures(line)?;
    let path = caps.get(1)?.as_str();
    let path = path.strip_prefix("./").unwrap_or(path).replace('\\', "/");
    Some(RawHit {
        path,
        line: caps.get(2)?.as_str().parse().ok()?,
        content: truncate(caps.get(3)?.as_str().trim()),
    })
}

fn truncate(content: &str) -> String {
    content.chars().take(MAX_COLUMNS).collect()
}

/// Built-in scanner: first case-insensitive match per readable UTF-8 file.
fn scan(root: &Path, store_dir: Option<&str>, query_lower: &str) -> Vec<RawHit> {
    let store_dir = store_dir.map(|d| root.join(d));
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        if !e.file_type().is_dir() || e.depth() == 0 {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !SKIP_DIRS.contains(&name.as_ref()) && store_dir.as_deref() != Some(e.path())
    });

    let mut hits = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let found = text
            .lines()
            .enumerate()
            .find(|(_, line)| line.to_lowercase().contains(query_lower));
        if let Some((idx, line)) = found {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            hits.push(RawHit {
                path,
                line: idx + 1,
                content: truncate(line.trim()),
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_parse_line() {
        let hit = parse_line("./docs/guide.md:12:  set MAX_RETRIES: 5").unwrap();
        assert_eq!(hit.path, "docs/guide.md");
        assert_eq!(hit.line, 12);
        assert_eq!(hit.content, "set MAX_RETRIES: 5");
        assert!(parse_line("no separators here").is_none());
    }

    #[test]
    fn test_truncate_counts_chars() {
        let long = "é".repeat(300);
        assert_eq!(truncate(&long).chars().count(), MAX_COLUMNS);
    }

    async fn fixture() -> (TempDir, ExactMatchSurveyor) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("docs/a.md"), "intro\nUse the ZEBRA_TOKEN here\n").unwrap();
        std::fs::write(root.join("docs/b.md"), "nothing to see\n").unwrap();
        std::fs::write(root.join("docs/loose.md"), "zebra_token but never ingested\n").unwrap();
        std::fs::write(root.join("node_modules/pkg/x.md"), "ZEBRA_TOKEN\n").unwrap();

        let config = Config::for_root(root);
        let store = NodeEdgeStore::open(&config).await.unwrap();
        for (id, source) in [("docs-a", "docs/a.md"), ("docs-b", "docs/b.md")] {
            let mut node = Node::new(id, id);
            node.meta.insert("source".into(), Value::String(source.into()));
            store.upsert_node(&node).await.unwrap();
        }

        let surveyor = ExactMatchSurveyor::new(store, &config).unwrap();
        (tmp, surveyor)
    }

    #[tokio::test]
    async fn test_builtin_scanner_resolves_to_nodes() {
        let (_tmp, surveyor) = fixture().await;
        let surveyor = surveyor.with_tool(SearchTool::Builtin);

        let hits = surveyor.search("zebra_token", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "docs-a");
        assert_eq!(hits[0].path, "docs/a.md");
        assert_eq!(hits[0].line, 2);
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_detected_tool_agrees_with_builtin() {
        let (_tmp, surveyor) = fixture().await;
        let hits = surveyor.search("ZEBRA_TOKEN", 10).await;
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["docs-a"]);
    }

    #[tokio::test]
    async fn test_short_query_returns_nothing() {
        let (_tmp, surveyor) = fixture().await;
        assert!(surveyor.search("ze", 10).await.is_empty());
        assert!(surveyor.search("zebra", 0).await.is_empty());
    }
}
