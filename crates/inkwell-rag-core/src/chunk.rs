//! Markdown-aware chunker.
//!
//! Splits a document into [`Chunk`]s along its structure: frontmatter gets
//! its own chunk, headings open sections, and sections are filled with whole
//! paragraphs and fenced code blocks up to `max_tokens`. A short trailing
//! piece of a section is merged into its predecessor instead of being
//! emitted on its own. Fenced code blocks are never split.
//!
//! Every chunk after the first carries a short overlap prefix taken from the
//! tail of the previous chunk. The overlap is stored in `text` but excluded
//! from `content_hash`, so edits to one chunk do not change the hash of its
//! neighbour. Chunk ids are derived from path, ordinal and hash prefix, so
//! re-chunking unchanged text yields identical ids.

use sha2::{Digest, Sha256};

use crate::models::{estimate_tokens, normalize_source_path, Chunk, ChunkKind, CHARS_PER_TOKEN};

/// Size window for chunks, in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Trailing pieces smaller than this are merged into the previous chunk.
    pub min_tokens: usize,
    /// Upper bound for a chunk's own content (code blocks excepted).
    pub max_tokens: usize,
    /// Approximate size of the overlap prefix.
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            min_tokens: 50,
            max_tokens: 1500,
            overlap_tokens: 50,
        }
    }
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a file's text with trailing whitespace on each line and trailing
/// blank lines ignored. Whitespace-only edits keep the same hash.
pub fn normalized_hash(text: &str) -> String {
    let normalized = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    hash_text(normalized.trim_end())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Heading,
    Paragraph,
    Code,
}

#[derive(Debug, Clone)]
struct Block {
    start: usize,
    end: usize,
    kind: BlockKind,
    heading: Option<(usize, String)>,
}

#[derive(Debug, Clone)]
struct Section {
    heading_path: Vec<String>,
    blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
struct Piece {
    start: usize,
    end: usize,
    heading_path: Vec<String>,
    kind: ChunkKind,
    heading_only: bool,
}

/// Structure-aware chunker for Markdown and plain text.
#[derive(Debug, Clone, Default)]
pub struct MarkdownChunker {
    params: ChunkingParams,
}

impl MarkdownChunker {
    pub fn new(params: ChunkingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChunkingParams {
        &self.params
    }

    /// Chunk `text` from `file_path` into ordered chunks.
    ///
    /// Empty or whitespace-only text yields no chunks.
    pub fn chunk(&self, file_path: &str, text: &str) -> Vec<Chunk> {
        let source_path = normalize_source_path(file_path);
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        let mut body_start = 0;

        if let Some((fm_start, fm_end, rest)) = split_frontmatter(text) {
            let fm_end = fm_start + text[fm_start..fm_end].trim_end().len();
            if fm_end > fm_start {
                pieces.push(Piece {
                    start: fm_start,
                    end: fm_end,
                    heading_path: vec!["Frontmatter".to_string()],
                    kind: ChunkKind::Frontmatter,
                    heading_only: false,
                });
            }
            body_start = rest;
        }

        let blocks = scan_blocks(text, body_start);
        for section in group_sections(blocks) {
            pieces.extend(self.section_pieces(text, section));
        }

        let line_starts = line_starts(text);
        let mut chunks: Vec<Chunk> = Vec::with_capacity(pieces.len());

        for (ordinal, piece) in pieces.iter().enumerate() {
            let own = &text[piece.start..piece.end];
            let content_hash = hash_text(own);

            let overlap = match (ordinal.checked_sub(1).map(|i| &pieces[i]), chunks.last()) {
                (Some(prev), Some(prev_chunk)) if prev.kind != ChunkKind::Frontmatter => {
                    overlap_tail(prev_chunk.own_text(), self.params.overlap_tokens)
                }
                _ => "",
            };

            let (stored, overlap_len) = if overlap.is_empty() {
                (own.to_string(), 0)
            } else {
                (format!("{}\n{}", overlap, own), overlap.len() + 1)
            };

            chunks.push(Chunk {
                id: format!("{}#{}-{}", source_path, ordinal, &content_hash[..12]),
                source_path: source_path.clone(),
                heading_path: piece.heading_path.clone(),
                start_offset: piece.start,
                end_offset: piece.end,
                start_line: line_of(&line_starts, piece.start),
                end_line: line_of(&line_starts, piece.end.saturating_sub(1).max(piece.start)),
                token_estimate: estimate_tokens(&stored),
                text: stored,
                overlap_len,
                content_hash,
                kind: piece.kind,
            });
        }

        tracing::debug!(
            source = %source_path,
            chunks = chunks.len(),
            "chunked document"
        );

        chunks
    }

    /// Pack one section's blocks into pieces within the size window.
    fn section_pieces(&self, text: &str, section: Section) -> Vec<Piece> {
        let max = self.params.max_tokens.max(1);
        let mut pieces: Vec<Piece> = Vec::new();
        let mut current: Option<Piece> = None;

        for block in &section.blocks {
            let tokens = estimate_tokens(&text[block.start..block.end]);

            if tokens > max && block.kind != BlockKind::Heading {
                // A lone heading stays glued to the oversized block after it.
                let start = match current.take() {
                    Some(cur) if cur.heading_only => cur.start,
                    Some(cur) => {
                        pieces.push(cur);
                        block.start
                    }
                    None => block.start,
                };

                if block.kind == BlockKind::Code {
                    pieces.push(Piece {
                        start,
                        end: block.end,
                        heading_path: section.heading_path.clone(),
                        kind: ChunkKind::Code,
                        heading_only: false,
                    });
                } else {
                    for (s, e) in split_oversized(text, start, block.end, max * CHARS_PER_TOKEN) {
                        pieces.push(Piece {
                            start: s,
                            end: e,
                            heading_path: section.heading_path.clone(),
                            kind: ChunkKind::Text,
                            heading_only: false,
                        });
                    }
                }
                continue;
            }

            let block_kind = match block.kind {
                BlockKind::Code => ChunkKind::Code,
                _ => ChunkKind::Text,
            };

            current = match current.take() {
                None => Some(Piece {
                    start: block.start,
                    end: block.end,
                    heading_path: section.heading_path.clone(),
                    kind: block_kind,
                    heading_only: block.kind == BlockKind::Heading,
                }),
                Some(mut cur) => {
                    if estimate_tokens(&text[cur.start..block.end]) > max {
                        pieces.push(cur);
                        Some(Piece {
                            start: block.start,
                            end: block.end,
                            heading_path: section.heading_path.clone(),
                            kind: block_kind,
                            heading_only: block.kind == BlockKind::Heading,
                        })
                    } else {
                        cur.kind = merge_kind(&cur, block.kind);
                        cur.end = block.end;
                        cur.heading_only = false;
                        Some(cur)
                    }
                }
            };
        }

        if let Some(cur) = current {
            pieces.push(cur);
        }

        if pieces.len() >= 2 {
            let last = &pieces[pieces.len() - 1];
            if estimate_tokens(&text[last.start..last.end]) < self.params.min_tokens {
                if let Some(last) = pieces.pop() {
                    if let Some(prev) = pieces.last_mut() {
                        if last.kind != prev.kind {
                            prev.kind = ChunkKind::Text;
                        }
                        prev.end = last.end;
                    }
                }
            }
        }

        pieces
    }
}

fn merge_kind(current: &Piece, next: BlockKind) -> ChunkKind {
    if current.heading_only {
        return match next {
            BlockKind::Code => ChunkKind::Code,
            _ => ChunkKind::Text,
        };
    }
    match (current.kind, next) {
        (ChunkKind::Code, BlockKind::Code) => ChunkKind::Code,
        _ => ChunkKind::Text,
    }
}

/// Locate YAML (`---`) or TOML (`+++`) frontmatter.
///
/// Returns `(body_start, body_end, rest_start)` byte offsets.
fn split_frontmatter(text: &str) -> Option<(usize, usize, usize)> {
    let delim = if text.starts_with("---\n") {
        "---"
    } else if text.starts_with("+++\n") {
        "+++"
    } else {
        return None;
    };

    let body_start = delim.len() + 1;
    let mut pos = body_start;
    for line in text[body_start..].split_inclusive('\n') {
        if line.trim_end() == delim {
            return Some((body_start, pos, pos + line.len()));
        }
        pos += line.len();
    }
    None
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let line = line.trim_end();
    let level = line.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Split the body into heading, paragraph, and fenced-code blocks.
fn scan_blocks(text: &str, from: usize) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut pos = from;
    let mut paragraph: Option<(usize, usize)> = None;
    let mut code: Option<(usize, &'static str)> = None;

    fn push_trimmed(blocks: &mut Vec<Block>, text: &str, start: usize, end: usize, kind: BlockKind) {
        let end = start + text[start..end].trim_end().len();
        if end > start {
            blocks.push(Block {
                start,
                end,
                kind,
                heading: None,
            });
        }
    }

    for line in text[from..].split_inclusive('\n') {
        let line_start = pos;
        let line_end = pos + line.len();
        pos = line_end;

        if let Some((code_start, marker)) = code {
            if line.trim_start().starts_with(marker) {
                push_trimmed(&mut blocks, text, code_start, line_end, BlockKind::Code);
                code = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            if let Some((s, e)) = paragraph.take() {
                push_trimmed(&mut blocks, text, s, e, BlockKind::Paragraph);
            }
            code = Some((line_start, marker));
            continue;
        }

        if let Some(heading) = parse_heading(line) {
            if let Some((s, e)) = paragraph.take() {
                push_trimmed(&mut blocks, text, s, e, BlockKind::Paragraph);
            }
            let end = line_start + line.trim_end().len();
            blocks.push(Block {
                start: line_start,
                end,
                kind: BlockKind::Heading,
                heading: Some(heading),
            });
            continue;
        }

        if line.trim().is_empty() {
            if let Some((s, e)) = paragraph.take() {
                push_trimmed(&mut blocks, text, s, e, BlockKind::Paragraph);
            }
            continue;
        }

        paragraph = match paragraph {
            Some((s, _)) => Some((s, line_end)),
            None => Some((line_start, line_end)),
        };
    }

    if let Some((code_start, _)) = code {
        push_trimmed(&mut blocks, text, code_start, text.len(), BlockKind::Code);
    }
    if let Some((s, e)) = paragraph {
        push_trimmed(&mut blocks, text, s, e, BlockKind::Paragraph);
    }

    blocks
}

/// Group blocks into sections, each opened by a heading.
fn group_sections(blocks: Vec<Block>) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();

    for block in blocks {
        if let Some((level, title)) = &block.heading {
            while stack.last().is_some_and(|(l, _)| *l >= *level) {
                stack.pop();
            }
            stack.push((*level, title.clone()));
            sections.push(Section {
                heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
                blocks: vec![block],
            });
            continue;
        }

        match sections.last_mut() {
            Some(section) => section.blocks.push(block),
            None => sections.push(Section {
                heading_path: Vec::new(),
                blocks: vec![block],
            }),
        }
    }

    sections
}

/// Hard-split an oversized prose range at line, then word boundaries.
fn split_oversized(text: &str, start: usize, end: usize, max_bytes: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut cursor = start;
    let max_bytes = max_bytes.max(CHARS_PER_TOKEN);

    while cursor < end {
        let skipped = text[cursor..end].len() - text[cursor..end].trim_start().len();
        cursor += skipped;
        if cursor >= end {
            break;
        }

        if end - cursor <= max_bytes {
            out.push((cursor, end));
            break;
        }

        let mut limit = cursor + max_bytes;
        while !text.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit <= cursor {
            limit = cursor + 1;
            while !text.is_char_boundary(limit) {
                limit += 1;
            }
        }

        let window = &text[cursor..limit];
        let cut = window
            .rfind('\n')
            .filter(|p| *p > 0)
            .or_else(|| window.rfind(' ').filter(|p| *p > 0))
            .map(|p| cursor + p)
            .unwrap_or(limit);

        let piece_end = cursor + text[cursor..cut].trim_end().len();
        if piece_end > cursor {
            out.push((cursor, piece_end));
        }
        cursor = cut;
    }

    out
}

/// The last ~`overlap_tokens` tokens of `text`, starting on a word boundary.
fn overlap_tail(text: &str, overlap_tokens: usize) -> &str {
    if overlap_tokens == 0 {
        return "";
    }
    let max_chars = overlap_tokens * CHARS_PER_TOKEN;
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.trim();
    }

    let skip = char_count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail = &text[start..];

    // Drop the partial word at the front when there is a later boundary.
    match tail.find(char::is_whitespace) {
        Some(ws) if ws + 1 < tail.len() => tail[ws..].trim(),
        _ => tail.trim(),
    }
}

fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// 1-based line number containing byte `offset`.
fn line_of(line_starts: &[usize], offset: usize) -> usize {
    line_starts.partition_point(|s| *s <= offset).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min: usize, max: usize, overlap: usize) -> MarkdownChunker {
        MarkdownChunker::new(ChunkingParams {
            min_tokens: min,
            max_tokens: max,
            overlap_tokens: overlap,
        })
    }

    const CHIME: &str = "# Chime\n\n## Role\n\nChime is the ship's navigator and keeps the old charts.\n\n## Key Conflict\n\nChime hears a resonance in the hull that nobody else can hear.\n";

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(MarkdownChunker::default().chunk("a.md", "").is_empty());
        assert!(MarkdownChunker::default().chunk("a.md", "  \n\n ").is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = MarkdownChunker::default().chunk("notes.txt", "Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert!(chunks[0].heading_path.is_empty());
        assert_eq!(chunks[0].kind, ChunkKind::Text);
        assert_eq!(chunks[0].start_line, 1);
    }

    #[test]
    fn test_headings_open_sections() {
        let chunks = chunker(1, 1500, 0).chunk("Characters/Chime.md", CHIME);
        let paths: Vec<Vec<String>> = chunks.iter().map(|c| c.heading_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["Chime".to_string()],
                vec!["Chime".to_string(), "Role".to_string()],
                vec!["Chime".to_string(), "Key Conflict".to_string()],
            ]
        );
        let conflict = &chunks[2];
        assert!(conflict.text.starts_with("## Key Conflict"));
        assert!(conflict.text.contains("resonance"));
    }

    #[test]
    fn test_heading_stack_pops_to_level() {
        let text = "# A\n\none\n\n## B\n\ntwo\n\n### C\n\nthree\n\n## D\n\nfour\n";
        let chunks = chunker(1, 1500, 0).chunk("x.md", text);
        let last = chunks.last().unwrap();
        assert_eq!(last.heading_path, vec!["A".to_string(), "D".to_string()]);
    }

    #[test]
    fn test_heading_stays_with_paragraph_when_it_fits() {
        // max 30 tokens = 120 chars; each paragraph ~70 chars.
        let para = "word ".repeat(14);
        let text = format!("## Title\n\n{}\n\n{}\n", para.trim(), para.trim());
        let chunks = chunker(1, 30, 0).chunk("x.md", &text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.starts_with("## Title\n\nword"));
    }

    #[test]
    fn test_paragraph_split_respects_max() {
        let paragraphs: Vec<String> = (0..20)
            .map(|i| format!("Paragraph number {} has a few words in it.", i))
            .collect();
        let text = paragraphs.join("\n\n");
        let chunks = chunker(1, 30, 0).chunk("x.md", &text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_estimate <= 30, "chunk too large: {}", c.token_estimate);
        }
    }

    #[test]
    fn test_oversized_paragraph_is_hard_split() {
        let text = "lorem ipsum ".repeat(200);
        let chunks = chunker(1, 50, 0).chunk("x.md", &text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_estimate <= 50);
            assert_eq!(&text[c.start_offset..c.end_offset], c.own_text());
        }
    }

    #[test]
    fn test_code_block_never_split() {
        let code_body = (0..100)
            .map(|i| format!("let value_{} = compute({});", i, i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = format!("# Code\n\nIntro text.\n\n```rust\n{}\n```\n\nAfter the code.\n", code_body);
        let chunks = chunker(1, 60, 0).chunk("x.md", &text);
        let code_chunks: Vec<&Chunk> = chunks.iter().filter(|c| c.text.contains("```rust")).collect();
        assert_eq!(code_chunks.len(), 1);
        let code = code_chunks[0];
        assert!(code.text.contains("let value_0"));
        assert!(code.text.contains("let value_99"));
        assert!(code.token_estimate > 60);
    }

    #[test]
    fn test_hash_inside_code_fence_is_not_heading() {
        let text = "# Real\n\n```sh\n# not a heading\necho hi\n```\n";
        let chunks = chunker(1, 1500, 0).chunk("x.md", text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, vec!["Real".to_string()]);
    }

    #[test]
    fn test_short_trailing_piece_is_merged() {
        let long = "alpha beta gamma delta ".repeat(5);
        let text = format!("{}\n\n{}\n\nTiny end.", long.trim(), long.trim());
        // Each long paragraph is 28 tokens; the tail does not fit after the
        // second one and is below min, so it merges.
        let chunks = chunker(10, 30, 0).chunk("x.md", &text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.ends_with("Tiny end."));
    }

    #[test]
    fn test_overlap_prefix_excluded_from_hash() {
        let first = "The lighthouse keeper counted ships every evening without fail.";
        let second = "Storms came from the west and broke upon the rocks below.";
        let text = format!("# One\n\n{}\n\n# Two\n\n{}\n", first, second);
        let chunks = chunker(1, 1500, 5).chunk("x.md", &text);
        assert_eq!(chunks.len(), 2);
        let two = &chunks[1];
        assert!(two.overlap_len > 0);
        assert!(two.text.starts_with(&two.text[..two.overlap_len]));
        assert_eq!(two.own_text(), &text[two.start_offset..two.end_offset]);
        assert_eq!(two.content_hash, hash_text(two.own_text()));

        // Changing the first section changes the overlap but not the second hash.
        let edited = text.replace("every evening without fail", "each night at dusk");
        let edited_chunks = chunker(1, 1500, 5).chunk("x.md", &edited);
        assert_ne!(edited_chunks[1].text, two.text);
        assert_eq!(edited_chunks[1].content_hash, two.content_hash);
        assert_eq!(edited_chunks[1].id, two.id);
    }

    #[test]
    fn test_frontmatter_chunk() {
        let text = "---\ntitle: Chime\ntags: [crew]\n---\n# Chime\n\nNavigator.\n";
        let chunks = chunker(1, 1500, 10).chunk("x.md", text);
        assert_eq!(chunks[0].kind, ChunkKind::Frontmatter);
        assert_eq!(chunks[0].heading_path, vec!["Frontmatter".to_string()]);
        assert_eq!(chunks[0].text, "title: Chime\ntags: [crew]");
        assert_eq!(chunks[1].overlap_len, 0);
        assert_eq!(chunks[1].heading_path, vec!["Chime".to_string()]);
    }

    #[test]
    fn test_deterministic_ids_and_boundaries() {
        let c = chunker(5, 20, 3);
        let text = "# A\n\nAlpha text here.\n\nBeta text here too.\n\n# B\n\nGamma.\n\nDelta and more.";
        let first = c.chunk("dir\\doc.md", text);
        let second = c.chunk("dir\\doc.md", text);
        assert_eq!(first, second);
        for (i, chunk) in first.iter().enumerate() {
            assert_eq!(chunk.source_path, "dir/doc.md");
            let prefix = format!("dir/doc.md#{}-", i);
            assert!(chunk.id.starts_with(&prefix), "bad id {}", chunk.id);
            assert!(chunk.id.ends_with(&chunk.content_hash[..12]));
        }
    }

    #[test]
    fn test_line_ranges() {
        let chunks = chunker(1, 1500, 0).chunk("c.md", CHIME);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[1].start_line, 3);
        assert_eq!(chunks[2].start_line, 7);
        assert_eq!(chunks[2].end_line, 9);
    }

    #[test]
    fn test_normalized_hash_ignores_trailing_whitespace() {
        assert_eq!(normalized_hash("a  \nb\n\n\n"), normalized_hash("a\nb"));
        assert_ne!(normalized_hash("a\nb"), normalized_hash("a\nc"));
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(900);
        let chunks = chunker(1, 40, 0).chunk("x.md", &text);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert_eq!(&text[c.start_offset..c.end_offset], c.own_text());
        }
    }
}
