//! BM25 keyword scoring over an incrementally maintained corpus.
//!
//! Term statistics (document frequency, document length) are updated as
//! chunk sets are added and removed, so a query never re-tokenizes the
//! corpus. IDF uses the non-negative variant
//! `ln((N - df + 0.5) / (df + 0.5) + 1)` over the whole indexed corpus;
//! a scope filter only decides which chunks receive a score.

use std::collections::{HashMap, HashSet};

use crate::models::Chunk;

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "in", "to", "of", "for", "on", "with", "at", "by",
];

/// Lowercase, split on non-alphanumerics, drop stopwords and one-char tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[derive(Debug, Clone, Default)]
struct DocStats {
    len: usize,
    tf: HashMap<String, u32>,
}

/// Incremental BM25 index keyed by chunk id.
#[derive(Debug, Clone)]
pub struct KeywordIndex {
    k1: f64,
    b: f64,
    docs: HashMap<String, DocStats>,
    df: HashMap<String, usize>,
    total_len: usize,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::with_params(DEFAULT_K1, DEFAULT_B)
    }
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(k1: f64, b: f64) -> Self {
        Self {
            k1,
            b,
            docs: HashMap::new(),
            df: HashMap::new(),
            total_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.docs.contains_key(chunk_id)
    }

    /// Index a chunk's heading path and own content.
    pub fn add_chunk(&mut self, chunk: &Chunk) {
        let mut text = chunk.heading_path.join(" ");
        text.push('\n');
        text.push_str(chunk.own_text());
        self.add(&chunk.id, &text);
    }

    /// Index `text` under `chunk_id`, replacing any previous document.
    pub fn add(&mut self, chunk_id: &str, text: &str) {
        self.remove(chunk_id);

        let tokens = tokenize(text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_default() += 1;
        }
        for term in tf.keys() {
            *self.df.entry(term.clone()).or_default() += 1;
        }
        self.total_len += tokens.len();
        self.docs.insert(
            chunk_id.to_string(),
            DocStats {
                len: tokens.len(),
                tf,
            },
        );
    }

    /// Drop a document. Unknown ids are ignored.
    pub fn remove(&mut self, chunk_id: &str) {
        let Some(doc) = self.docs.remove(chunk_id) else {
            return;
        };
        self.total_len -= doc.len;
        for term in doc.tf.keys() {
            if let Some(count) = self.df.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.df.remove(term);
                }
            }
        }
    }

    fn avg_doc_len(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.docs.len() as f64
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 scores of the chunks accepted by `filter`.
    ///
    /// Only chunks with a positive score appear. An empty or all-stopword
    /// query yields an empty map.
    pub fn score<F>(&self, query: &str, filter: F) -> HashMap<String, f64>
    where
        F: Fn(&str) -> bool,
    {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        let mut scores = HashMap::new();
        if terms.is_empty() || self.docs.is_empty() {
            return scores;
        }

        let weighted: Vec<(&String, f64)> = terms
            .iter()
            .filter(|t| self.df.contains_key(t.as_str()))
            .map(|t| (t, self.idf(t)))
            .collect();
        if weighted.is_empty() {
            return scores;
        }

        let avg_len = self.avg_doc_len().max(f64::EPSILON);
        for (id, doc) in &self.docs {
            if !filter(id) {
                continue;
            }
            let norm = self.k1 * (1.0 - self.b + self.b * doc.len as f64 / avg_len);
            let mut score = 0.0;
            for (term, idf) in &weighted {
                if let Some(&tf) = doc.tf.get(term.as_str()) {
                    let tf = tf as f64;
                    score += idf * (tf * (self.k1 + 1.0)) / (tf + norm);
                }
            }
            if score > 0.0 {
                scores.insert(id.clone(), score);
            }
        }

        scores
    }
}
