//! Proposed file edits and their application.
//!
//! An [`EditBatch`] groups the [`FileEdit`]s proposed together (typically
//! by one chat response). Each edit can be toggled before the batch is
//! applied. Applying writes enabled edits under the project root and tells
//! the engine which files changed.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::engine::RagEngine;
use inkwell_rag_core::models::normalize_source_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditType {
    Update,
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub edit_id: String,
    /// Project-relative path.
    pub file_path: String,
    /// Current content; `None` for new files.
    pub old_content: Option<String>,
    pub new_content: String,
    pub edit_type: EditType,
    pub enabled: bool,
}

/// Line counts of a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub added: usize,
    pub deleted: usize,
}

impl FileEdit {
    pub fn new(
        file_path: impl Into<String>,
        old_content: Option<String>,
        new_content: impl Into<String>,
        edit_type: EditType,
    ) -> Self {
        Self {
            edit_id: Uuid::new_v4().to_string(),
            file_path: normalize_source_path(&file_path.into()),
            old_content,
            new_content: new_content.into(),
            edit_type,
            enabled: true,
        }
    }

    /// Whether applying the edit would change anything.
    pub fn has_changes(&self) -> bool {
        match self.edit_type {
            EditType::Create => !self.new_content.trim().is_empty(),
            EditType::Delete => true,
            EditType::Update => self.old_content.as_deref() != Some(self.new_content.as_str()),
        }
    }

    pub fn diff_stats(&self) -> DiffStats {
        let old = self.old_content.as_deref().unwrap_or("");
        match self.edit_type {
            EditType::Delete => DiffStats {
                added: 0,
                deleted: old.lines().count(),
            },
            _ => line_diff(old, &self.new_content),
        }
    }

    /// `"+12 / -5"`.
    pub fn summary(&self) -> String {
        let stats = self.diff_stats();
        format!("+{} / -{}", stats.added, stats.deleted)
    }
}

/// Added/deleted line counts from the longest common subsequence of lines.
fn line_diff(old: &str, new: &str) -> DiffStats {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let common = lcs_len(&a, &b);
    DiffStats {
        added: b.len() - common,
        deleted: a.len() - common,
    }
}

/// Length of the longest common subsequence, keeping two rows of the table.
fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    // Row over the shorter side.
    let (outer, inner) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; inner.len() + 1];
    let mut cur = vec![0usize; inner.len() + 1];
    for x in outer {
        for (j, y) in inner.iter().enumerate() {
            cur[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[inner.len()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditBatch {
    pub batch_id: String,
    pub edits: Vec<FileEdit>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`EditBatch::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    /// Enabled edits that would not change anything.
    pub unchanged: usize,
    pub disabled: usize,
}

impl EditBatch {
    pub fn new(edits: Vec<FileEdit>, summary: Option<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            edits,
            summary,
            created_at: Utc::now(),
        }
    }

    pub fn enabled_edits(&self) -> impl Iterator<Item = &FileEdit> {
        self.edits.iter().filter(|e| e.enabled)
    }

    pub fn has_enabled_edits(&self) -> bool {
        self.edits.iter().any(|e| e.enabled)
    }

    pub fn enable_all(&mut self) {
        self.edits.iter_mut().for_each(|e| e.enabled = true);
    }

    pub fn disable_all(&mut self) {
        self.edits.iter_mut().for_each(|e| e.enabled = false);
    }

    /// Toggle one edit. Returns false if the id is unknown.
    pub fn set_enabled(&mut self, edit_id: &str, enabled: bool) -> bool {
        match self.edits.iter_mut().find(|e| e.edit_id == edit_id) {
            Some(edit) => {
                edit.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn edits_for_file(&self, file_path: &str) -> Vec<&FileEdit> {
        let path = normalize_source_path(file_path);
        self.edits.iter().filter(|e| e.file_path == path).collect()
    }

    pub fn files_affected(&self) -> usize {
        self.edits.iter().map(|e| &e.file_path).collect::<HashSet<_>>().len()
    }

    pub fn enabled_files_affected(&self) -> usize {
        self.enabled_edits()
            .map(|e| &e.file_path)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Combined stats over enabled edits.
    pub fn cumulative_stats(&self) -> DiffStats {
        self.enabled_edits().fold(DiffStats::default(), |acc, e| {
            let s = e.diff_stats();
            DiffStats {
                added: acc.added + s.added,
                deleted: acc.deleted + s.deleted,
            }
        })
    }

    /// Write enabled edits under the engine's project root.
    ///
    /// Updated and created files are flagged `needs_reindex`; deleted files
    /// are dropped from the index. Paths escaping the root are rejected
    /// before anything is written.
    pub async fn apply(&self, engine: &RagEngine) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        let mut planned = Vec::new();
        for edit in &self.edits {
            if !edit.enabled {
                report.disabled += 1;
                continue;
            }
            let target = resolve_target(engine.root(), &edit.file_path)?;
            planned.push((edit, target));
        }

        for (edit, target) in planned {
            if !edit.has_changes() {
                report.unchanged += 1;
                continue;
            }
            match edit.edit_type {
                EditType::Update | EditType::Create => {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("Failed to create {}", parent.display()))?;
                    }
                    tokio::fs::write(&target, &edit.new_content)
                        .await
                        .with_context(|| format!("Failed to write {}", edit.file_path))?;
                    engine.mark_needs_reindex(&edit.file_path).await;
                    report.written.push(edit.file_path.clone());
                }
                EditType::Delete => {
                    match tokio::fs::remove_file(&target).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| format!("Failed to delete {}", edit.file_path))
                        }
                    }
                    engine.remove_file(&edit.file_path).await;
                    report.deleted.push(edit.file_path.clone());
                }
            }
        }

        tracing::info!(
            batch = %self.batch_id,
            written = report.written.len(),
            deleted = report.deleted.len(),
            "applied edit batch"
        );
        Ok(report)
    }
}

fn resolve_target(root: &Path, file_path: &str) -> Result<PathBuf> {
    let rel = Path::new(file_path);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("edit path must stay inside the project: {}", file_path);
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_changes() {
        let same = FileEdit::new("a.md", Some("x".into()), "x", EditType::Update);
        assert!(!same.has_changes());
        let blank = FileEdit::new("b.md", None, "  \n", EditType::Create);
        assert!(!blank.has_changes());
        let del = FileEdit::new("c.md", Some("x".into()), "", EditType::Delete);
        assert!(del.has_changes());
    }

    #[test]
    fn test_diff_stats() {
        let edit = FileEdit::new(
            "a.md",
            Some("one\ntwo\nthree\n".into()),
            "one\n2\nthree\nfour\n",
            EditType::Update,
        );
        assert_eq!(edit.diff_stats(), DiffStats { added: 2, deleted: 1 });
        assert_eq!(edit.summary(), "+2 / -1");

        let created = FileEdit::new("n.md", None, "a\nb", EditType::Create);
        assert_eq!(created.diff_stats(), DiffStats { added: 2, deleted: 0 });
    }

    #[test]
    fn test_lcs_len_either_side_longer() {
        assert_eq!(lcs_len(&["a", "b", "c", "d"], &["b", "d"]), 2);
        assert_eq!(lcs_len(&["b", "d"], &["a", "b", "c", "d"]), 2);
        assert_eq!(lcs_len(&[], &["a"]), 0);
    }

    #[test]
    fn test_diff_stats_long_manuscript() {
        let old: String = (0..3_000).map(|i| format!("line {}\n", i)).collect();
        let new = old.replace("line 1500\n", "line fifteen hundred\n");
        let edit = FileEdit::new("big.md", Some(old), new, EditType::Update);
        assert_eq!(edit.diff_stats(), DiffStats { added: 1, deleted: 1 });
    }

    #[test]
    fn test_batch_toggles_and_counts() {
        let mut batch = EditBatch::new(
            vec![
                FileEdit::new("a.md", Some("1".into()), "2", EditType::Update),
                FileEdit::new(".\\a.md", Some("2".into()), "3", EditType::Update),
                FileEdit::new("b.md", None, "new", EditType::Create),
            ],
            Some("rename".into()),
        );
        assert_eq!(batch.files_affected(), 2);
        assert_eq!(batch.edits_for_file("a.md").len(), 2);

        batch.disable_all();
        assert!(!batch.has_enabled_edits());
        let id = batch.edits[2].edit_id.clone();
        assert!(batch.set_enabled(&id, true));
        assert!(!batch.set_enabled("nope", true));
        assert_eq!(batch.enabled_files_affected(), 1);
        assert_eq!(batch.cumulative_stats().added, 1);

        batch.enable_all();
        assert_eq!(batch.enabled_edits().count(), 3);
    }

    #[test]
    fn test_resolve_target_rejects_escape() {
        let root = Path::new("/project");
        assert!(resolve_target(root, "../etc/passwd").is_err());
        assert!(resolve_target(root, "/etc/passwd").is_err());
        assert_eq!(
            resolve_target(root, "Characters/Chime.md").unwrap(),
            PathBuf::from("/project/Characters/Chime.md")
        );
    }
}
