//! Project tree traversal with exclusion rules.
//!
//! Walks the project root, pruning the fixed deny-list of directories
//! before descending, then applies configured exclude globs and the
//! include globs to project-relative paths. Output is sorted by relative
//! path so indexing order is deterministic.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ProjectConfig;
use inkwell_rag_core::models::normalize_source_path;

/// Directory names never indexed, wherever they appear in the tree.
pub const DENY_DIRS: &[&str] = &[
    ".git",
    ".inkwell_rag",
    ".debug",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "target",
];

/// A candidate source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Project-relative path with `/` separators.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
}

/// Compiled exclusion and inclusion rules for one project.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    include: GlobSet,
    exclude: GlobSet,
    exclude_patterns: Vec<String>,
    follow_symlinks: bool,
}

impl ExclusionRules {
    pub fn new(include_globs: &[String], exclude_globs: &[String], follow_symlinks: bool) -> Result<Self> {
        Ok(Self {
            include: build_globset(include_globs).context("invalid include glob")?,
            exclude: build_globset(exclude_globs).context("invalid exclude glob")?,
            exclude_patterns: exclude_globs.to_vec(),
            follow_symlinks,
        })
    }

    pub fn from_config(config: &ProjectConfig) -> Result<Self> {
        Self::new(
            &config.include_globs,
            &config.exclude_globs,
            config.follow_symlinks,
        )
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }

    /// Whether `relative_path` falls under the deny-list or an exclude glob.
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let path = normalize_source_path(relative_path);
        let mut components: Vec<&str> = path.split('/').collect();
        components.pop();
        components.iter().any(|c| DENY_DIRS.contains(c)) || self.exclude.is_match(&path)
    }

    /// Whether the walker would index `relative_path`.
    pub fn is_eligible(&self, relative_path: &str) -> bool {
        let path = normalize_source_path(relative_path);
        !self.is_excluded(&path) && self.include.is_match(&path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Modification time of `path` in milliseconds since the epoch.
pub fn mtime_millis(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(millis(&meta))
}

/// [`mtime_millis`] on tokio's blocking pool, for use from async code.
pub async fn stat_mtime(path: &Path) -> Result<i64> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(millis(&meta))
}

fn millis(meta: &std::fs::Metadata) -> i64 {
    let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    DateTime::<Utc>::from(modified).timestamp_millis()
}

/// List eligible files under `root`, sorted by relative path.
///
/// Unreadable directory entries are logged and skipped.
pub fn walk_project(root: &Path, rules: &ExclusionRules) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Project root does not exist or is not a directory: {}", root.display());
    }

    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(rules.follow_symlinks)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && DENY_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = normalize_source_path(&relative.to_string_lossy());

        if !rules.is_eligible(&rel_str) {
            continue;
        }

        let mtime = match mtime_millis(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "skipping file without mtime");
                continue;
            }
        };

        files.push(SourceFile {
            relative_path: rel_str,
            absolute_path: path.to_path_buf(),
            mtime,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn rules(exclude: &[&str]) -> ExclusionRules {
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        ExclusionRules::new(
            &["**/*.md".to_string(), "**/*.txt".to_string()],
            &exclude,
            false,
        )
        .unwrap()
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "content").unwrap();
    }

    #[test]
    fn test_walk_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        for rel in [
            "b.md",
            "a/z.txt",
            "a/img.png",
            ".debug/dump.md",
            ".inkwell_rag/state.md",
            "nested/node_modules/pkg/readme.md",
            "drafts/old.md",
        ] {
            touch(dir.path(), rel);
        }

        let files = walk_project(dir.path(), &rules(&["drafts/**"])).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a/z.txt", "b.md"]);
        assert!(files.iter().all(|f| f.mtime > 0));
    }

    #[test]
    fn test_is_excluded() {
        let r = rules(&["Archive/**"]);
        assert!(r.is_excluded(".debug/session.md"));
        assert!(r.is_excluded("deep/.git/HEAD.md"));
        assert!(r.is_excluded("Archive/old.md"));
        assert!(!r.is_excluded("Characters/Chime.md"));
        // A file merely named like a deny-listed directory is not excluded.
        assert!(!r.is_excluded("target"));
    }

    #[test]
    fn test_invalid_glob_fails() {
        assert!(ExclusionRules::new(&["[".to_string()], &[], false).is_err());
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        assert!(walk_project(&dir.path().join("nope"), &rules(&[])).is_err());
    }

    #[tokio::test]
    async fn test_stat_mtime_matches_sync() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.md");
        let path = dir.path().join("a.md");
        assert_eq!(stat_mtime(&path).await.unwrap(), mtime_millis(&path).unwrap());
        assert!(stat_mtime(&dir.path().join("gone.md")).await.is_err());
    }
}
