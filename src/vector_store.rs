//! Persistent vector index on SQLite.
//!
//! Embeddings live in `<project>/.inkwell_rag/vectors.sqlite`, one row per
//! chunk, tagged with the chunk's content hash and the embedding model. A
//! push only embeds chunks whose hash (or model) differs from the stored
//! row, so reindexing an unchanged project makes no embedding calls.
//! Similarity is brute-force cosine over the candidate rows.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use inkwell_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use inkwell_rag_core::vector::{VectorIndex, VectorRecord};

/// Per-project state directory, always on the walker's deny-list.
pub const STATE_DIR: &str = ".inkwell_rag";

pub fn vector_db_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join("vectors.sqlite")
}

/// Open the vector index configured for a project.
///
/// A disabled provider yields [`DisabledVectorIndex`]; retrieval then skips
/// semantic search and reports keyword-only results.
pub async fn open_vector_index(
    config: &EmbeddingConfig,
    project_root: &Path,
) -> Result<Arc<dyn VectorIndex>> {
    match create_embedder(config)? {
        None => Ok(Arc::new(DisabledVectorIndex)),
        Some(embedder) => {
            let index = SqliteVectorIndex::open(&vector_db_path(project_root), embedder).await?;
            Ok(Arc::new(index))
        }
    }
}

/// Stand-in used when no embedding provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledVectorIndex;

#[async_trait]
impl VectorIndex for DisabledVectorIndex {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn push(&self, _records: &[VectorRecord]) -> Result<()> {
        Ok(())
    }

    async fn query(
        &self,
        _text: &str,
        _candidate_ids: &HashSet<String>,
        _k: usize,
    ) -> Result<Vec<(String, f64)>> {
        bail!("semantic search is disabled (embedding.provider = \"disabled\")")
    }

    async fn remove(&self, _chunk_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn remove_source(&self, _source_path: &str) -> Result<()> {
        Ok(())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn ids_for_source(&self, _source_path: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteVectorIndex {
    pub async fn open(db_path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool, embedder })
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Records whose stored vector is missing or stale.
    async fn pending<'a>(&self, records: &'a [VectorRecord]) -> Result<Vec<&'a VectorRecord>> {
        let model = self.embedder.model_name();
        let mut pending = Vec::new();
        for record in records {
            let row = sqlx::query("SELECT content_hash, model FROM chunk_vectors WHERE chunk_id = ?")
                .bind(&record.chunk_id)
                .fetch_optional(&self.pool)
                .await?;
            let fresh = row.is_some_and(|r| {
                r.get::<String, _>("content_hash") == record.content_hash
                    && r.get::<String, _>("model") == model
            });
            if !fresh {
                pending.push(record);
            }
        }
        Ok(pending)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn push(&self, records: &[VectorRecord]) -> Result<()> {
        let pending = self.pending(records).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|r| r.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != pending.len() {
            bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                pending.len()
            );
        }

        let now = chrono::Utc::now().timestamp();
        let model = self.embedder.model_name();
        let dims = self.embedder.dims() as i64;

        let mut tx = self.pool.begin().await?;
        for (record, vector) in pending.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, source_path, content_hash, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    source_path = excluded.source_path,
                    content_hash = excluded.content_hash,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.source_path)
            .bind(&record.content_hash)
            .bind(model)
            .bind(dims)
            .bind(vec_to_blob(vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(embedded = pending.len(), "pushed vectors");
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

        let query_vec = match self.embedder.embed(&[text.to_string()]).await?.into_iter().next() {
            Some(v) => v,
            None => bail!("embedder returned no vector for the query"),
        };

        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors WHERE model = ?")
            .bind(self.embedder.model_name())
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(String, f64)> = rows
            .iter()
            .filter_map(|row| {
                let id: String = row.get("chunk_id");
                if !candidate_ids.contains(&id) {
                    return None;
                }
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
                Some((id, sim))
            })
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
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in chunk_ids {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_source(&self, source_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE source_path = ?")
            .bind(source_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT source_path FROM chunk_vectors ORDER BY source_path")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn ids_for_source(&self, source_path: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT chunk_id FROM chunk_vectors WHERE source_path = ? ORDER BY chunk_id",
        )
        .bind(source_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_rag_core::embedding::HashingEmbedder;
    use tempfile::TempDir;

    fn record(id: &str, path: &str, hash: &str, text: &str) -> VectorRecord {
        VectorRecord {
            chunk_id: id.to_string(),
            source_path: path.to_string(),
            content_hash: hash.to_string(),
            text: text.to_string(),
        }
    }

    async fn open(dir: &TempDir) -> SqliteVectorIndex {
        SqliteVectorIndex::open(
            &vector_db_path(dir.path()),
            Arc::new(HashingEmbedder::new(64)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_query_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let idx = open(&dir).await;
            idx.push(&[
                record("a#0", "a.md", "h1", "resonance in the hull"),
                record("b#0", "b.md", "h2", "old star charts"),
            ])
            .await
            .unwrap();
            assert_eq!(idx.count().await.unwrap(), 2);
        }

        let idx = open(&dir).await;
        let candidates: HashSet<String> = ["a#0", "b#0"].iter().map(|s| s.to_string()).collect();
        let hits = idx.query("hull resonance", &candidates, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a#0");
        assert!(dir.path().join(STATE_DIR).join("vectors.sqlite").exists());
    }

    #[tokio::test]
    async fn test_remove_and_sources() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir).await;
        idx.push(&[
            record("a#0", "a.md", "1", "one"),
            record("d#0", ".debug/x.md", "2", "two"),
        ])
        .await
        .unwrap();
        assert_eq!(idx.sources().await.unwrap(), vec![".debug/x.md", "a.md"]);

        idx.remove_source(".debug/x.md").await.unwrap();
        idx.remove(&["missing".to_string()]).await.unwrap();
        assert_eq!(idx.sources().await.unwrap(), vec!["a.md"]);
        assert_eq!(idx.ids_for_source("a.md").await.unwrap(), vec!["a#0"]);
        idx.remove(&["a#0".to_string()]).await.unwrap();
        assert_eq!(idx.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_index_fails_queries() {
        let idx = DisabledVectorIndex;
        assert!(!idx.is_enabled());
        assert!(idx.push(&[record("a", "a.md", "h", "t")]).await.is_ok());
        assert!(idx.query("q", &HashSet::from(["a".to_string()]), 3).await.is_err());
        assert!(idx.sources().await.unwrap().is_empty());
        assert!(idx.ids_for_source("a.md").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rows_survive_reopen_until_removed() {
        let dir = TempDir::new().unwrap();
        {
            let idx = open(&dir).await;
            idx.push(&[
                record("a#0", "a.md", "1", "first"),
                record("b#0", "b.md", "2", "second"),
                record("b#1", "b.md", "3", "third"),
            ])
            .await
            .unwrap();
        }

        let idx = open(&dir).await;
        assert_eq!(idx.ids_for_source("b.md").await.unwrap(), vec!["b#0", "b#1"]);
        idx.remove_source("a.md").await.unwrap();
        idx.remove(&["b#0".to_string()]).await.unwrap();
        assert_eq!(idx.sources().await.unwrap(), vec!["b.md"]);
        assert_eq!(idx.count().await.unwrap(), 1);
    }
}
