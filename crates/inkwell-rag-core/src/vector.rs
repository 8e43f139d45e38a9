//! Vector-index abstraction and an in-memory implementation.
//!
//! The engine talks to semantic search only through [`VectorIndex`], so the
//! backend (in-memory, SQLite, a remote service) can be swapped freely.
//! Implementations must be idempotent: pushing a record twice, or removing
//! an id that is not present, is not an error.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::{cosine_similarity, Embedder};
use crate::models::Chunk;

/// What the engine pushes to a vector index for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub source_path: String,
    /// Hash of the chunk's own content; unchanged hashes need no re-embedding.
    pub content_hash: String,
    /// Text to embed.
    pub text: String,
}

impl VectorRecord {
    /// Embed the heading path together with the chunk's own content.
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let text = if chunk.heading_path.is_empty() {
            chunk.own_text().to_string()
        } else {
            format!("{}\n{}", chunk.heading_path.join(" > "), chunk.own_text())
        };
        Self {
            chunk_id: chunk.id.clone(),
            source_path: chunk.source_path.clone(),
            content_hash: chunk.content_hash.clone(),
            text,
        }
    }
}

/// Semantic search backend.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend label used in logs and degradation reasons.
    fn name(&self) -> &str;

    /// Whether this backend can answer queries at all. A disabled backend
    /// is skipped instead of queried.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Store or refresh vectors for `records`.
    async fn push(&self, records: &[VectorRecord]) -> Result<()>;

    /// Top `k` chunk ids by similarity to `text`, restricted to `candidate_ids`.
    async fn query(
        &self,
        text: &str,
        candidate_ids: &HashSet<String>,
        k: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Drop vectors for these chunk ids.
    async fn remove(&self, chunk_ids: &[String]) -> Result<()>;

    /// Drop every vector belonging to `source_path`.
    async fn remove_source(&self, source_path: &str) -> Result<()>;

    /// Distinct source paths that currently have vectors.
    async fn sources(&self) -> Result<Vec<String>>;

    /// Chunk ids stored for `source_path`, sorted.
    async fn ids_for_source(&self, source_path: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct StoredVector {
    source_path: String,
    content_hash: String,
    vector: Vec<f32>,
}

/// Brute-force cosine index held in memory.
pub struct MemoryVectorIndex<E> {
    embedder: E,
    rows: RwLock<HashMap<String, StoredVector>>,
}

impl<E: Embedder> MemoryVectorIndex<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.rows
            .read()
            .map(|r| r.contains_key(chunk_id))
            .unwrap_or(false)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("vector index lock poisoned")
}

#[async_trait]
impl<E: Embedder> VectorIndex for MemoryVectorIndex<E> {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, records: &[VectorRecord]) -> Result<()> {
        let pending: Vec<&VectorRecord> = {
            let rows = self.rows.read().map_err(poisoned)?;
            records
                .iter()
                .filter(|r| {
                    rows.get(&r.chunk_id)
                        .map_or(true, |row| row.content_hash != r.content_hash)
                })
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|r| r.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != pending.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                pending.len()
            );
        }

        let mut rows = self.rows.write().map_err(poisoned)?;
        for (record, vector) in pending.into_iter().zip(vectors) {
            rows.insert(
                record.chunk_id.clone(),
                StoredVector {
                    source_path: record.source_path.clone(),
                    content_hash: record.content_hash.clone(),
                    vector,
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        text: &str,
        candidate_ids: &HashSet<String>,
        k: usize,
    ) -> Result<Vec<(String, f64)>> {
        if candidate_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedder returned no vector for the query"))?;

        let rows = self.rows.read().map_err(poisoned)?;
        let mut scored: Vec<(String, f64)> = rows
            .iter()
            .filter(|(id, _)| candidate_ids.contains(id.as_str()))
            .map(|(id, row)| (id.clone(), cosine_similarity(&query_vec, &row.vector) as f64))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        for id in chunk_ids {
            rows.remove(id);
        }
        Ok(())
    }

    async fn remove_source(&self, source_path: &str) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.retain(|_, row| row.source_path != source_path);
        Ok(())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut sources: Vec<String> = rows
            .values()
            .map(|r| r.source_path.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sources.sort();
        Ok(sources)
    }

    async fn ids_for_source(&self, source_path: &str) -> Result<Vec<String>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut ids: Vec<String> = rows
            .iter()
            .filter(|(_, row)| row.source_path == source_path)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
