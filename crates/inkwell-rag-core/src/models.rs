//! Core data models shared by the chunker, the index, and retrieval.
//!
//! A [`Chunk`] is the unit of retrieval. An [`IndexEntry`] tracks one source
//! file and the chunk set currently live for it. [`Retrieval`] is what the
//! chat pipeline receives: chunk text plus [`Citation`]s, never raw ids.

use serde::Serialize;
use std::fmt;

/// Approximate chars-per-token ratio used for budget accounting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Heuristic token count: one token per four characters, at least one.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Normalize a project-relative path to forward slashes.
pub fn normalize_source_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// What a chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Text,
    Code,
    Frontmatter,
}

/// A contiguous, bounded span of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// `"{source_path}#{ordinal}-{hash prefix}"`, stable for unchanged content.
    pub id: String,
    /// Project-relative path with `/` separators.
    pub source_path: String,
    /// Enclosing heading titles, outermost first.
    pub heading_path: Vec<String>,
    /// Byte offset of the chunk's own content (overlap excluded).
    pub start_offset: usize,
    /// Byte offset one past the end of the chunk's own content.
    pub end_offset: usize,
    /// 1-based first line of the own content.
    pub start_line: usize,
    /// 1-based last line of the own content (inclusive).
    pub end_line: usize,
    /// Stored text: overlap prefix followed by the own content.
    pub text: String,
    /// Byte length of the overlap prefix inside `text`.
    pub overlap_len: usize,
    /// SHA-256 of the own content only.
    pub content_hash: String,
    /// Token estimate of `text` (overlap included).
    pub token_estimate: usize,
    pub kind: ChunkKind,
}

impl Chunk {
    /// The chunk's text without the overlap borrowed from its predecessor.
    pub fn own_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

/// Index state of one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Indexed,
    NeedsReindex,
    NotIndexed,
    Excluded,
}

impl IndexStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed. Removal is not a status
    /// and is handled by dropping the entry.
    pub fn can_transition_to(self, next: IndexStatus) -> bool {
        use IndexStatus::*;
        self == next
            || matches!(
                (self, next),
                (NotIndexed, Indexed) | (Indexed, NeedsReindex) | (NeedsReindex, Indexed)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexStatus::Indexed => "indexed",
            IndexStatus::NeedsReindex => "needs_reindex",
            IndexStatus::NotIndexed => "not_indexed",
            IndexStatus::Excluded => "excluded",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file record kept by the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub source_path: String,
    /// Modification time (ms since the Unix epoch) the live chunks reflect.
    pub last_indexed_mtime: i64,
    /// SHA-256 of the whitespace-normalized file text.
    pub content_hash: String,
    /// Live chunk ids in document order.
    pub chunk_ids: Vec<String>,
    pub status: IndexStatus,
    /// The last vector push for these chunks failed; semantic search cannot
    /// see them until a later run pushes again.
    pub vectors_pending: bool,
}

/// The set of source files eligible for a retrieval request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// Every indexed file in the project.
    #[default]
    Project,
    /// Only these project-relative files (e.g. the open tabs).
    Files(Vec<String>),
}

impl Scope {
    pub fn contains(&self, source_path: &str) -> bool {
        match self {
            Scope::Project => true,
            Scope::Files(files) => files
                .iter()
                .any(|f| normalize_source_path(f) == source_path),
        }
    }
}

/// Where a piece of context came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub source_path: String,
    pub heading_path: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
    /// The source changed on disk after this chunk was indexed.
    pub possibly_stale: bool,
}

impl Citation {
    /// `"Characters/Chime.md > Key Conflict"`, or `"... > Root"` without headings.
    pub fn label(&self) -> String {
        if self.heading_path.is_empty() {
            format!("{} > Root", self.source_path)
        } else {
            format!("{} > {}", self.source_path, self.heading_path.join(" > "))
        }
    }
}

/// One chunk of context handed to the chat pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub text: String,
    pub token_estimate: usize,
    pub score: f64,
    pub citation: Citation,
}

/// Result of a retrieval request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieval {
    /// Chunks in descending score order.
    pub chunks: Vec<ContextChunk>,
    /// Semantic search was unavailable; results are keyword-only.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub cache_hit: bool,
    /// Sum of `token_estimate` over `chunks`.
    pub used_tokens: usize,
    /// Ranked chunks left out by the token budget or chunk limit.
    pub dropped: usize,
}

impl Retrieval {
    /// Render the chunks as a prompt block, one cited section per chunk.
    pub fn to_prompt_context(&self) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str("[Source: ");
            out.push_str(&chunk.citation.label());
            if chunk.citation.possibly_stale {
                out.push_str(" (may be outdated)");
            }
            out.push_str("]\n");
            out.push_str(&chunk.text);
        }
        out
    }

    pub fn citations(&self) -> impl Iterator<Item = &Citation> {
        self.chunks.iter().map(|c| &c.citation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_floor_and_minimum() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_status_transitions() {
        use IndexStatus::*;
        assert!(NotIndexed.can_transition_to(Indexed));
        assert!(Indexed.can_transition_to(NeedsReindex));
        assert!(NeedsReindex.can_transition_to(Indexed));
        assert!(!Indexed.can_transition_to(NotIndexed));
        assert!(!NotIndexed.can_transition_to(NeedsReindex));
        assert!(!Excluded.can_transition_to(Indexed));
    }

    #[test]
    fn test_scope_contains_normalizes_separators() {
        let scope = Scope::Files(vec!["Characters\\Chime.md".to_string()]);
        assert!(scope.contains("Characters/Chime.md"));
        assert!(!scope.contains("Characters/Other.md"));
        assert!(Scope::Project.contains("anything.md"));
    }

    #[test]
    fn test_citation_label() {
        let mut c = Citation {
            source_path: "a.md".to_string(),
            heading_path: vec![],
            start_line: 1,
            end_line: 2,
            possibly_stale: false,
        };
        assert_eq!(c.label(), "a.md > Root");
        c.heading_path = vec!["Intro".to_string(), "Scope".to_string()];
        assert_eq!(c.label(), "a.md > Intro > Scope");
    }
}
