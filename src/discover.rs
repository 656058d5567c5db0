//! Corpus file discovery.
//!
//! Walks each configured source directory and yields the files that pass the
//! include and exclude globs. Hidden entries, the store directory, and the
//! usual build and VCS directories are never visited. Output is sorted so
//! that batches and ids are assigned the same way on every run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::Config;
use crate::error::Result;

/// Excluded regardless of configuration.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Compiled include and exclude globs, matched against root-relative paths.
#[derive(Debug, Clone)]
pub struct Filter {
    include: GlobSet,
    exclude: GlobSet,
}

impl Filter {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.corpus.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&config.corpus.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn accepts(&self, relative: &str) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Walk `dir` without following symlinked directories, pruning hidden
/// entries and `store_dir`.
///
/// Entries come in file-name order within each directory. Yields files and
/// symlinks alike; callers decide what a symlink means.
pub fn walk<'a>(dir: &Path, store_dir: Option<&'a Path>) -> impl Iterator<Item = DirEntry> + 'a {
    WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| {
            if e.depth() == 0 {
                return true;
            }
            if is_hidden(e) {
                return false;
            }
            !(e.file_type().is_dir() && store_dir.is_some_and(|s| e.path() == s))
        })
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry");
                None
            }
        })
        .filter(|e| !e.file_type().is_dir())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// All ingestible files under the configured sources, sorted by path.
///
/// Symlinks are included when they resolve to a regular file. A file
/// reachable through several paths is returned once, under its real path
/// when that is among them, else under the first link in path order.
pub fn discover(config: &Config) -> Result<Vec<PathBuf>> {
    let filter = Filter::from_config(config)?;
    let store_dir = config.store_dir();

    let mut candidates = Vec::new();
    for dir in config.source_dirs() {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Source directory missing; nothing to discover");
            continue;
        }
        for entry in walk(&dir, store_dir) {
            let path = entry.path();
            if !filter.accepts(&config.relative_source(path)) {
                continue;
            }
            let is_link = entry.path_is_symlink();
            if is_link && !path.is_file() {
                continue;
            }
            candidates.push((is_link, path.to_path_buf()));
        }
    }
    candidates.sort();

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for (_, path) in candidates {
        let real = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if seen.insert(real) {
            files.push(path);
        }
    }
    files.sort();
    debug!(files = files.len(), "Discovery complete");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "content").unwrap();
    }

    #[test]
    fn test_discover_applies_globs_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "docs/b.md");
        touch(root, "docs/a.md");
        touch(root, "docs/nested/c.md");
        touch(root, "docs/notes.txt");
        touch(root, "docs/.hidden/d.md");
        touch(root, "docs/node_modules/e.md");
        touch(root, "docs/draft/f.md");
        touch(root, "other/g.md");

        let mut config = Config::for_root(root);
        config.corpus.exclude_globs = vec!["docs/draft/**".into()];

        let found: Vec<String> = discover(&config)
            .unwrap()
            .iter()
            .map(|p| config.relative_source(p))
            .collect();
        assert_eq!(found, vec!["docs/a.md", "docs/b.md", "docs/nested/c.md"]);
    }

    #[test]
    fn test_missing_source_is_empty() {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_root(tmp.path());
        assert!(discover(&config).unwrap().is_empty());
    }

    #[test]
    fn test_store_dir_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "docs/a.md");
        touch(root, "docs/store/cache.md");

        let mut config = Config::for_root(root);
        config.db.path = root.join("docs/store/resonance.db");

        let found = discover(&config).unwrap();
        assert_eq!(found, vec![root.join("docs/a.md")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_real_file_wins_over_link() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "docs/zeta/real.md");
        std::os::unix::fs::symlink(root.join("docs/zeta/real.md"), root.join("docs/alias.md"))
            .unwrap();
        touch(root, "docs/other.md");
        std::os::unix::fs::symlink(root.join("docs/other.md"), root.join("docs/link-b.md"))
            .unwrap();
        std::os::unix::fs::symlink(root.join("docs/other.md"), root.join("docs/link-a.md"))
            .unwrap();

        let config = Config::for_root(root);
        let found: Vec<String> = discover(&config)
            .unwrap()
            .iter()
            .map(|p| config.relative_source(p))
            .collect();
        assert_eq!(found, vec!["docs/other.md", "docs/zeta/real.md"]);
    }

    #[test]
    fn test_walk_is_sorted_by_name() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for name in ["c.md", "a.md", "b/x.md", "b.md"] {
            touch(root, &format!("docs/{}", name));
        }
        let names: Vec<String> = walk(&root.join("docs"), None)
            .map(|e| e.path().strip_prefix(root).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["docs/a.md", "docs/b/x.md", "docs/b.md", "docs/c.md"]);
    }

    #[test]
    fn test_invalid_glob_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_root(tmp.path());
        config.corpus.include_globs = vec!["[".into()];
        assert!(matches!(discover(&config), Err(crate::Error::Glob(_))));
    }
}
