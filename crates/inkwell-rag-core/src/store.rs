//! Per-project metadata store.
//!
//! Holds the [`IndexEntry`] of every known file, the live [`Chunk`]s, and the
//! BM25 [`KeywordIndex`] over them. A file's chunk set is only ever changed
//! as a whole by [`MetadataStore::replace_file`] or
//! [`MetadataStore::remove_file`], so readers never observe a mix of old and
//! new chunks for one file.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::keyword::KeywordIndex;
use crate::models::{Chunk, IndexEntry, IndexStatus, Scope};

/// Chunk ids dropped and added by a [`MetadataStore::replace_file`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: BTreeMap<String, IndexEntry>,
    chunks: HashMap<String, Chunk>,
    keyword: KeywordIndex,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, source_path: &str) -> Option<&IndexEntry> {
        self.entries.get(source_path)
    }

    /// Entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.chunks.get(chunk_id)
    }

    /// Live chunks of one file in document order.
    pub fn chunks_for(&self, source_path: &str) -> Vec<&Chunk> {
        self.entries
            .get(source_path)
            .map(|e| e.chunk_ids.iter().filter_map(|id| self.chunks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Status of `source_path`; unknown files are `NotIndexed`.
    pub fn status(&self, source_path: &str) -> IndexStatus {
        self.entries
            .get(source_path)
            .map(|e| e.status)
            .unwrap_or(IndexStatus::NotIndexed)
    }

    /// Swap in a freshly chunked file and mark it indexed.
    pub fn replace_file(
        &mut self,
        source_path: &str,
        mtime: i64,
        content_hash: String,
        chunks: Vec<Chunk>,
    ) -> ReplaceOutcome {
        let new_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let keep: HashSet<&str> = new_ids.iter().map(String::as_str).collect();

        let mut outcome = ReplaceOutcome::default();
        if let Some(old) = self.entries.get(source_path) {
            for id in &old.chunk_ids {
                if !keep.contains(id.as_str()) {
                    outcome.removed.push(id.clone());
                }
            }
        }
        for id in &outcome.removed {
            self.chunks.remove(id);
            self.keyword.remove(id);
        }

        for chunk in chunks {
            if !self.keyword.contains(&chunk.id) {
                outcome.added.push(chunk.id.clone());
            }
            // Re-add unconditionally: overlap text may differ for the same id.
            self.keyword.add_chunk(&chunk);
            self.chunks.insert(chunk.id.clone(), chunk);
        }

        self.entries.insert(
            source_path.to_string(),
            IndexEntry {
                source_path: source_path.to_string(),
                last_indexed_mtime: mtime,
                content_hash,
                chunk_ids: new_ids,
                status: IndexStatus::Indexed,
                vectors_pending: false,
            },
        );
        outcome
    }

    /// Accept a new mtime for unchanged content. Returns false for unknown files.
    pub fn refresh_mtime(&mut self, source_path: &str, mtime: i64) -> bool {
        match self.entries.get_mut(source_path) {
            Some(entry) => {
                entry.last_indexed_mtime = mtime;
                entry.status = IndexStatus::Indexed;
                true
            }
            None => false,
        }
    }

    /// Record whether `source_path`'s chunks still lack vectors.
    pub fn set_vectors_pending(&mut self, source_path: &str, pending: bool) -> bool {
        match self.entries.get_mut(source_path) {
            Some(entry) => {
                entry.vectors_pending = pending;
                true
            }
            None => false,
        }
    }

    /// Flag an indexed file as stale. Returns whether the status changed.
    pub fn mark_needs_reindex(&mut self, source_path: &str) -> bool {
        match self.entries.get_mut(source_path) {
            Some(entry) if entry.status == IndexStatus::Indexed => {
                entry.status = IndexStatus::NeedsReindex;
                true
            }
            _ => false,
        }
    }

    /// Record that `source_path` could not be indexed.
    ///
    /// A previously indexed file keeps its chunks and becomes stale; an
    /// unknown file is tracked as `NotIndexed`.
    pub fn record_failure(&mut self, source_path: &str) {
        match self.entries.get_mut(source_path) {
            Some(entry) => {
                if entry.status == IndexStatus::Indexed {
                    entry.status = IndexStatus::NeedsReindex;
                }
            }
            None => {
                self.entries.insert(
                    source_path.to_string(),
                    IndexEntry {
                        source_path: source_path.to_string(),
                        last_indexed_mtime: 0,
                        content_hash: String::new(),
                        chunk_ids: Vec::new(),
                        status: IndexStatus::NotIndexed,
                        vectors_pending: false,
                    },
                );
            }
        }
    }

    /// Drop a file with all of its chunks. Returns the removed entry.
    pub fn remove_file(&mut self, source_path: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(source_path)?;
        for id in &entry.chunk_ids {
            self.chunks.remove(id);
            self.keyword.remove(id);
        }
        Some(entry)
    }

    /// Entries whose files fall within `scope`.
    pub fn entries_in_scope<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a IndexEntry> {
        self.entries.values().filter(move |e| scope.contains(&e.source_path))
    }

    /// Live chunk ids of every file in `scope`.
    pub fn chunk_ids_in_scope(&self, scope: &Scope) -> HashSet<String> {
        self.entries_in_scope(scope)
            .flat_map(|e| e.chunk_ids.iter().cloned())
            .collect()
    }

    /// BM25 scores restricted to `candidates`.
    pub fn keyword_scores(&self, query: &str, candidates: &HashSet<String>) -> HashMap<String, f64> {
        self.keyword.score(query, |id| candidates.contains(id))
    }

    /// Indexed mtime of the file that owns `chunk_id`.
    pub fn source_mtime(&self, chunk_id: &str) -> Option<i64> {
        let chunk = self.chunks.get(chunk_id)?;
        self.entries
            .get(&chunk.source_path)
            .map(|e| e.last_indexed_mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkingParams, MarkdownChunker};

    fn chunks(path: &str, text: &str) -> Vec<Chunk> {
        MarkdownChunker::new(ChunkingParams {
            min_tokens: 1,
            max_tokens: 1500,
            overlap_tokens: 0,
        })
        .chunk(path, text)
    }

    #[test]
    fn test_replace_swaps_whole_chunk_set() {
        let mut store = MetadataStore::new();
        store.replace_file("a.md", 1, "h1".into(), chunks("a.md", "# A\n\nold words"));
        let first_ids = store.entry("a.md").unwrap().chunk_ids.clone();

        let outcome = store.replace_file("a.md", 2, "h2".into(), chunks("a.md", "# A\n\nnew words"));
        assert_eq!(outcome.removed, first_ids);
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(store.chunk_count(), 1);
        assert!(store.keyword_scores("old", &store.chunk_ids_in_scope(&Scope::Project)).is_empty());
        assert_eq!(store.keyword_scores("new", &store.chunk_ids_in_scope(&Scope::Project)).len(), 1);
        assert_eq!(store.entry("a.md").unwrap().last_indexed_mtime, 2);
    }

    #[test]
    fn test_unchanged_chunks_keep_ids() {
        let mut store = MetadataStore::new();
        let text = "# A\n\nfirst\n\n# B\n\nsecond";
        store.replace_file("a.md", 1, "h".into(), chunks("a.md", text));
        let outcome = store.replace_file(
            "a.md",
            2,
            "h2".into(),
            chunks("a.md", "# A\n\nfirst\n\n# B\n\nchanged"),
        );
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.added.len(), 1);
    }

    #[test]
    fn test_status_lifecycle() {
        let mut store = MetadataStore::new();
        assert_eq!(store.status("a.md"), IndexStatus::NotIndexed);
        store.replace_file("a.md", 1, "h".into(), chunks("a.md", "text"));
        assert_eq!(store.status("a.md"), IndexStatus::Indexed);
        assert!(store.mark_needs_reindex("a.md"));
        assert!(!store.mark_needs_reindex("a.md"));
        assert!(store.refresh_mtime("a.md", 5));
        assert_eq!(store.status("a.md"), IndexStatus::Indexed);
    }

    #[test]
    fn test_vectors_pending_cleared_by_replace() {
        let mut store = MetadataStore::new();
        assert!(!store.set_vectors_pending("a.md", true));
        store.replace_file("a.md", 1, "h".into(), chunks("a.md", "text"));
        assert!(store.set_vectors_pending("a.md", true));
        assert!(store.entry("a.md").unwrap().vectors_pending);

        store.replace_file("a.md", 2, "h2".into(), chunks("a.md", "other"));
        assert!(!store.entry("a.md").unwrap().vectors_pending);
    }

    #[test]
    fn test_record_failure() {
        let mut store = MetadataStore::new();
        store.record_failure("new.md");
        assert_eq!(store.status("new.md"), IndexStatus::NotIndexed);

        store.replace_file("a.md", 1, "h".into(), chunks("a.md", "text"));
        store.record_failure("a.md");
        assert_eq!(store.status("a.md"), IndexStatus::NeedsReindex);
        assert_eq!(store.chunks_for("a.md").len(), 1);
    }

    #[test]
    fn test_remove_file_and_scope() {
        let mut store = MetadataStore::new();
        store.replace_file("a.md", 1, "h".into(), chunks("a.md", "alpha"));
        store.replace_file("b.md", 9, "h".into(), chunks("b.md", "alpha"));

        let scope = Scope::Files(vec!["b.md".to_string()]);
        let ids = store.chunk_ids_in_scope(&scope);
        assert_eq!(ids.len(), 1);
        let scores = store.keyword_scores("alpha", &ids);
        let id = scores.keys().next().unwrap();
        assert_eq!(store.source_mtime(id), Some(9));

        assert!(store.remove_file("a.md").is_some());
        assert!(store.remove_file("a.md").is_none());
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.chunk_count(), 1);
    }
}
