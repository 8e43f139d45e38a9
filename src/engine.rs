//! Project engine: incremental indexing and context retrieval.
//!
//! One [`RagEngine`] serves one project directory. Indexing walks the
//! project, re-chunks files whose content changed, pushes vectors, and
//! swaps each file's chunk set into the metadata store. Retrieval refreshes
//! the staleness of in-scope files, consults the query cache, and otherwise
//! blends BM25 with semantic search before trimming to a token budget.
//!
//! # Locking
//!
//! - `index_gate` serializes indexing runs, exclusion changes and cleanup.
//! - `state` (metadata store) is a `tokio::sync::RwLock`. File reads,
//!   chunking and vector pushes happen with no lock held; only the swap of a
//!   finished chunk set takes the write lock.
//! - Retrievals take the read lock for in-memory scoring only, never across
//!   the semantic query.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::progress::IndexEvent;
use crate::vector_store::open_vector_index;
use crate::walker::{stat_mtime, walk_project, ExclusionRules, SourceFile};
use inkwell_rag_core::cache::{CacheStats, QueryCache, ScopeFingerprint};
use inkwell_rag_core::chunk::{normalized_hash, MarkdownChunker};
use inkwell_rag_core::models::{
    normalize_source_path, Citation, ContextChunk, IndexEntry, IndexStatus, Retrieval, Scope,
};
use inkwell_rag_core::rank::{merge, truncate_to_budget, RankWeights, RankedChunk};
use inkwell_rag_core::store::MetadataStore;
use inkwell_rag_core::vector::{VectorIndex, VectorRecord};

/// What happened to one file during indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Content changed; chunks were rebuilt and swapped in.
    Indexed { chunks: usize, vectors_ok: bool },
    /// mtime and content unchanged.
    Unchanged,
    /// mtime advanced but normalized content is identical.
    Refreshed,
    /// Content unchanged; vectors missing after an earlier failed push were
    /// pushed again.
    Repushed { vectors_ok: bool },
    /// Cancelled after chunking; nothing was swapped in.
    Discarded,
}

/// Summary of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub files_seen: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub refreshed: usize,
    pub repushed: usize,
    pub removed: usize,
    pub skipped: usize,
    pub chunks_written: usize,
    pub vector_failures: usize,
    /// Vector rows dropped because no live chunk owns them.
    pub vectors_pruned: usize,
    pub cancelled: bool,
}

impl IndexReport {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Indexed { chunks, vectors_ok } => {
                self.indexed += 1;
                self.chunks_written += chunks;
                if !vectors_ok {
                    self.vector_failures += 1;
                }
            }
            FileOutcome::Unchanged => self.unchanged += 1,
            FileOutcome::Refreshed => self.refreshed += 1,
            FileOutcome::Repushed { vectors_ok } => {
                self.repushed += 1;
                if !vectors_ok {
                    self.vector_failures += 1;
                }
            }
            FileOutcome::Discarded => {}
        }
    }
}

/// Summary of [`RagEngine::clean_excluded`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub entries_removed: usize,
    pub vector_sources_removed: usize,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub files: usize,
    pub chunks: usize,
    pub indexed: usize,
    pub needs_reindex: usize,
    pub not_indexed: usize,
    /// Indexed files whose vectors still need to be pushed.
    pub vectors_pending: usize,
    /// BM25 passes run by retrievals; cache hits do not run one.
    pub keyword_searches: usize,
    pub cache: CacheStats,
    pub vector_backend: String,
}

/// A background indexing run started by [`RagEngine::spawn_index`].
pub struct IndexHandle {
    pub events: mpsc::UnboundedReceiver<IndexEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<IndexReport>>,
}

type EventSender<'a> = Option<&'a mpsc::UnboundedSender<IndexEvent>>;

fn emit(events: EventSender<'_>, event: IndexEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is watching.
        let _ = tx.send(event);
    }
}

pub struct RagEngine {
    root: PathBuf,
    config: Config,
    chunker: MarkdownChunker,
    rules: RwLock<ExclusionRules>,
    state: RwLock<MetadataStore>,
    cache: Mutex<QueryCache>,
    vectors: Arc<dyn VectorIndex>,
    index_gate: Mutex<()>,
    keyword_searches: AtomicUsize,
}

impl RagEngine {
    /// Open a project with the vector index configured in `config`.
    ///
    /// Fails if `root` is not a directory or the configuration is invalid.
    /// Stale entries under exclusion rules are cleaned on open.
    pub async fn open(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        let root = canonical_root(root.as_ref())?;
        let vectors = open_vector_index(&config.embedding, &root).await?;
        Self::build(root, config, vectors).await
    }

    /// Open a project with a caller-supplied vector index.
    pub async fn with_vector_index(
        root: impl AsRef<Path>,
        config: Config,
        vectors: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        let root = canonical_root(root.as_ref())?;
        Self::build(root, config, vectors).await
    }

    async fn build(root: PathBuf, config: Config, vectors: Arc<dyn VectorIndex>) -> Result<Self> {
        config.validate()?;
        let rules = ExclusionRules::from_config(&config.project)?;
        let engine = Self {
            chunker: MarkdownChunker::new(config.chunking.params()),
            cache: Mutex::new(QueryCache::new(config.cache.ttl(), config.cache.max_entries)),
            rules: RwLock::new(rules),
            state: RwLock::new(MetadataStore::new()),
            vectors,
            index_gate: Mutex::new(()),
            keyword_searches: AtomicUsize::new(0),
            root,
            config,
        };
        let cleaned = engine.clean_excluded().await?;
        if cleaned.vector_sources_removed > 0 {
            tracing::info!(
                sources = cleaned.vector_sources_removed,
                "removed vectors for excluded files"
            );
        }
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ============ Indexing ============

    pub async fn index_project(&self) -> Result<IndexReport> {
        self.index_project_with(&CancellationToken::new(), None).await
    }

    /// Index the project, publishing events and honouring `cancel` between files.
    pub async fn index_project_with(
        &self,
        cancel: &CancellationToken,
        events: EventSender<'_>,
    ) -> Result<IndexReport> {
        let _gate = self.index_gate.lock().await;
        let rules = self.rules.read().await.clone();
        let files = walk_project(&self.root, &rules)?;

        let mut report = IndexReport {
            files_seen: files.len(),
            ..IndexReport::default()
        };
        emit(events, IndexEvent::Started { total: files.len() });

        let present: HashSet<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        let vanished: Vec<String> = {
            let state = self.state.read().await;
            state
                .entries()
                .filter(|e| !present.contains(e.source_path.as_str()))
                .map(|e| e.source_path.clone())
                .collect()
        };
        for path in vanished {
            if self.remove_file(&path).await {
                report.removed += 1;
            }
        }

        for (n, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                emit(
                    events,
                    IndexEvent::Cancelled {
                        processed: n,
                        total: files.len(),
                    },
                );
                break;
            }

            match self.index_source(file, cancel).await {
                Ok(outcome) => {
                    report.record(outcome);
                    emit(
                        events,
                        IndexEvent::File {
                            path: file.relative_path.clone(),
                            n: n + 1,
                            total: files.len(),
                            outcome,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %file.relative_path, error = %e, "skipping file");
                    self.state.write().await.record_failure(&file.relative_path);
                    report.skipped += 1;
                    emit(
                        events,
                        IndexEvent::Skipped {
                            path: file.relative_path.clone(),
                            reason: format!("{:#}", e),
                        },
                    );
                }
            }
        }

        if !report.cancelled {
            report.vectors_pruned = self.prune_orphan_vectors().await;
        }

        tracing::info!(
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "index run finished"
        );
        emit(events, IndexEvent::Finished(report.clone()));
        Ok(report)
    }

    /// Run [`index_project_with`](Self::index_project_with) on a tokio task.
    pub fn spawn_index(self: &Arc<Self>) -> IndexHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { engine.index_project_with(&token, Some(&tx)).await });
        IndexHandle {
            events: rx,
            cancel,
            join,
        }
    }

    /// Index one file now, regardless of its mtime.
    pub async fn index_file(&self, path: &str) -> Result<FileOutcome> {
        let rel = self.relative_path(path)?;
        let _gate = self.index_gate.lock().await;
        if self.rules.read().await.is_excluded(&rel) {
            bail!("{} is excluded from indexing", rel);
        }

        let absolute = self.root.join(&rel);
        let file = SourceFile {
            mtime: stat_mtime(&absolute).await?,
            absolute_path: absolute,
            relative_path: rel.clone(),
        };

        self.mark_needs_reindex(&rel).await;
        match self.index_source(&file, &CancellationToken::new()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state.write().await.record_failure(&rel);
                Err(e)
            }
        }
    }

    async fn index_source(&self, file: &SourceFile, cancel: &CancellationToken) -> Result<FileOutcome> {
        let path = file.relative_path.as_str();
        let existing: Option<IndexEntry> = self.state.read().await.entry(path).cloned();

        if let Some(entry) = &existing {
            if entry.status == IndexStatus::Indexed && entry.last_indexed_mtime == file.mtime {
                if entry.vectors_pending {
                    let vectors_ok = self.repush_vectors(path).await;
                    return Ok(FileOutcome::Repushed { vectors_ok });
                }
                return Ok(FileOutcome::Unchanged);
            }
        }

        let bytes = tokio::fs::read(&file.absolute_path)
            .await
            .with_context(|| format!("Failed to read {}", path))?;
        let text = String::from_utf8(bytes).map_err(|_| anyhow!("{} is not valid UTF-8", path))?;
        let content_hash = normalized_hash(&text);

        if let Some(entry) = &existing {
            if entry.content_hash == content_hash {
                self.state.write().await.refresh_mtime(path, file.mtime);
                self.cache.lock().await.invalidate(path);
                tracing::debug!(path, "content unchanged, refreshed mtime");
                if entry.vectors_pending {
                    let vectors_ok = self.repush_vectors(path).await;
                    return Ok(FileOutcome::Repushed { vectors_ok });
                }
                return Ok(FileOutcome::Refreshed);
            }
        }

        let chunks = self.chunker.chunk(path, &text);
        let records: Vec<VectorRecord> = chunks.iter().map(VectorRecord::from_chunk).collect();

        let vectors_ok = match self.vectors.push(&records).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path, backend = self.vectors.name(), error = %e, "vector push failed");
                false
            }
        };

        if cancel.is_cancelled() {
            if vectors_ok {
                let old: HashSet<&str> = existing
                    .as_ref()
                    .map(|e| e.chunk_ids.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                let fresh: Vec<String> = records
                    .iter()
                    .filter(|r| !old.contains(r.chunk_id.as_str()))
                    .map(|r| r.chunk_id.clone())
                    .collect();
                if let Err(e) = self.vectors.remove(&fresh).await {
                    tracing::warn!(path, error = %e, "failed to roll back vectors");
                }
            }
            return Ok(FileOutcome::Discarded);
        }

        let count = chunks.len();
        let outcome = {
            let mut state = self.state.write().await;
            let outcome = state.replace_file(path, file.mtime, content_hash, chunks);
            state.set_vectors_pending(path, !vectors_ok);
            outcome
        };
        if !outcome.removed.is_empty() {
            if let Err(e) = self.vectors.remove(&outcome.removed).await {
                tracing::warn!(path, error = %e, "failed to remove stale vectors");
            }
        }
        self.cache.lock().await.invalidate(path);

        tracing::debug!(path, chunks = count, "indexed");
        Ok(FileOutcome::Indexed {
            chunks: count,
            vectors_ok,
        })
    }

    /// Push the stored chunks of `path` again after an earlier push failed.
    async fn repush_vectors(&self, path: &str) -> bool {
        let records: Vec<VectorRecord> = self
            .state
            .read()
            .await
            .chunks_for(path)
            .into_iter()
            .map(VectorRecord::from_chunk)
            .collect();
        if let Err(e) = self.vectors.push(&records).await {
            tracing::warn!(path, backend = self.vectors.name(), error = %e, "vector push failed again");
            return false;
        }
        self.state.write().await.set_vectors_pending(path, false);
        self.cache.lock().await.invalidate(path);
        tracing::debug!(path, chunks = records.len(), "pushed missing vectors");
        true
    }

    /// Drop vector rows no live chunk owns, such as rows for files deleted
    /// or rewritten while no engine had the project open.
    ///
    /// Callers hold `index_gate`.
    async fn prune_orphan_vectors(&self) -> usize {
        let sources = match self.vectors.sources().await {
            Ok(sources) => sources,
            Err(e) => {
                tracing::warn!(backend = self.vectors.name(), error = %e, "could not list vector sources");
                return 0;
            }
        };

        let mut pruned = 0;
        for source in sources {
            let live: Option<HashSet<String>> = self
                .state
                .read()
                .await
                .entry(&source)
                .map(|e| e.chunk_ids.iter().cloned().collect());
            let stored = match self.vectors.ids_for_source(&source).await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "could not list vectors");
                    continue;
                }
            };

            let result = match &live {
                None => self.vectors.remove_source(&source).await.map(|()| stored.len()),
                Some(live) => {
                    let orphans: Vec<String> =
                        stored.into_iter().filter(|id| !live.contains(id)).collect();
                    if orphans.is_empty() {
                        continue;
                    }
                    self.vectors.remove(&orphans).await.map(|()| orphans.len())
                }
            };
            match result {
                Ok(n) => pruned += n,
                Err(e) => tracing::warn!(source = %source, error = %e, "failed to prune vectors"),
            }
        }

        if pruned > 0 {
            tracing::info!(rows = pruned, "pruned orphaned vectors");
        }
        pruned
    }

    // ============ Project tooling hooks ============

    /// Flag a file as changed. Returns whether its status changed.
    pub async fn mark_needs_reindex(&self, path: &str) -> bool {
        let path = normalize_source_path(path);
        let changed = self.state.write().await.mark_needs_reindex(&path);
        self.cache.lock().await.invalidate(&path);
        changed
    }

    /// Forget a file: entry, chunks, vectors and cached queries.
    pub async fn remove_file(&self, path: &str) -> bool {
        let path = normalize_source_path(path);
        let removed = self.state.write().await.remove_file(&path).is_some();
        if let Err(e) = self.vectors.remove_source(&path).await {
            tracing::warn!(path = %path, error = %e, "failed to remove vectors");
        }
        self.cache.lock().await.invalidate(&path);
        removed
    }

    pub async fn file_status(&self, path: &str) -> IndexStatus {
        let path = normalize_source_path(path);
        if self.rules.read().await.is_excluded(&path) {
            return IndexStatus::Excluded;
        }
        self.state.read().await.status(&path)
    }

    /// All tracked entries in path order.
    pub async fn entries(&self) -> Vec<IndexEntry> {
        self.state.read().await.entries().cloned().collect()
    }

    /// Replace the configured exclude globs and purge newly excluded files.
    ///
    /// Waits for a running index pass so it cannot re-add purged files.
    pub async fn set_exclude_globs(&self, globs: Vec<String>) -> Result<CleanReport> {
        let rules = ExclusionRules::new(
            &self.config.project.include_globs,
            &globs,
            self.config.project.follow_symlinks,
        )?;
        let _gate = self.index_gate.lock().await;
        *self.rules.write().await = rules;
        self.clean_excluded_locked().await
    }

    /// Remove entries, chunks and vectors of files under exclusion rules.
    ///
    /// Idempotent; runs on every open.
    pub async fn clean_excluded(&self) -> Result<CleanReport> {
        let _gate = self.index_gate.lock().await;
        self.clean_excluded_locked().await
    }

    async fn clean_excluded_locked(&self) -> Result<CleanReport> {
        let rules = self.rules.read().await.clone();
        let mut report = CleanReport::default();

        let doomed: Vec<String> = {
            let state = self.state.read().await;
            state
                .entries()
                .filter(|e| rules.is_excluded(&e.source_path))
                .map(|e| e.source_path.clone())
                .collect()
        };
        for path in doomed {
            if self.remove_file(&path).await {
                report.entries_removed += 1;
            }
        }

        match self.vectors.sources().await {
            Ok(sources) => {
                for source in sources.iter().filter(|s| rules.is_excluded(s)) {
                    self.vectors.remove_source(source).await?;
                    report.vector_sources_removed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(backend = self.vectors.name(), error = %e, "could not list vector sources");
            }
        }

        Ok(report)
    }

    pub async fn stats(&self) -> EngineStats {
        let (files, chunks, indexed, needs_reindex, not_indexed, vectors_pending) = {
            let state = self.state.read().await;
            let count = |s: IndexStatus| state.entries().filter(|e| e.status == s).count();
            (
                state.file_count(),
                state.chunk_count(),
                count(IndexStatus::Indexed),
                count(IndexStatus::NeedsReindex),
                count(IndexStatus::NotIndexed),
                state.entries().filter(|e| e.vectors_pending).count(),
            )
        };
        EngineStats {
            files,
            chunks,
            indexed,
            needs_reindex,
            not_indexed,
            vectors_pending,
            keyword_searches: self.keyword_searches.load(Ordering::Relaxed),
            cache: self.cache.lock().await.stats(),
            vector_backend: self.vectors.name().to_string(),
        }
    }

    // ============ Retrieval ============

    /// Retrieve ranked context for `query` within `scope`, at most `token_budget` tokens.
    ///
    /// Results are keyword-only (and flagged degraded) when the vector
    /// backend is disabled or fails, or when in-scope files are missing
    /// vectors after a failed push.
    pub async fn retrieve(&self, query: &str, scope: &Scope, token_budget: usize) -> Result<Retrieval> {
        let mut degraded_reason = (!self.vectors.is_enabled())
            .then(|| "semantic search is disabled (no embedding provider)".to_string());
        if query.trim().is_empty() {
            return Ok(Retrieval {
                degraded: degraded_reason.is_some(),
                degraded_reason,
                ..Retrieval::default()
            });
        }

        self.refresh_scope(scope).await;

        let (fingerprint, missing_vectors) = {
            let state = self.state.read().await;
            let fingerprint = ScopeFingerprint::new(
                state
                    .entries_in_scope(scope)
                    .map(|e| (e.source_path.clone(), e.last_indexed_mtime)),
            );
            let missing = state.entries_in_scope(scope).filter(|e| e.vectors_pending).count();
            (fingerprint, missing)
        };
        let cached = self.cache.lock().await.get(query, &fingerprint);
        let cache_hit = cached.is_some();

        let ranked = match cached {
            Some(ranked) => ranked,
            None => {
                let (candidates, keyword) = {
                    let state = self.state.read().await;
                    let candidates = state.chunk_ids_in_scope(scope);
                    let scores = state.keyword_scores(query, &candidates);
                    (candidates, sorted_scores(scores, self.config.retrieval.candidate_k))
                };
                self.keyword_searches.fetch_add(1, Ordering::Relaxed);

                let mut cacheable = true;
                let semantic = if degraded_reason.is_some() {
                    Vec::new()
                } else {
                    match self
                        .vectors
                        .query(query, &candidates, self.config.retrieval.candidate_k)
                        .await
                    {
                        Ok(hits) => hits,
                        Err(e) => {
                            tracing::warn!(backend = self.vectors.name(), error = %e, "semantic search unavailable");
                            degraded_reason = Some(format!("{:#}", e));
                            cacheable = false;
                            Vec::new()
                        }
                    }
                };

                let weights = if degraded_reason.is_some() || missing_vectors > 0 {
                    RankWeights {
                        keyword: 1.0,
                        semantic: 0.0,
                    }
                } else {
                    self.config.retrieval.weights()
                };
                let ranked = {
                    let state = self.state.read().await;
                    merge(&keyword, &semantic, weights, |id| state.source_mtime(id))
                };
                // Transient failures are not cached so the next query retries.
                if cacheable {
                    self.cache.lock().await.put(query, &fingerprint, ranked.clone());
                }
                ranked
            }
        };
        if degraded_reason.is_none() && missing_vectors > 0 {
            degraded_reason = Some(format!(
                "{} file(s) in scope have no vectors yet; re-index to retry",
                missing_vectors
            ));
        }

        let chunks = self.build_context(&ranked).await;
        let truncated = truncate_to_budget(chunks, token_budget, |c| c.token_estimate);
        let mut kept = truncated.kept;
        let mut dropped = truncated.dropped;
        let max_chunks = self.config.retrieval.max_chunks;
        if kept.len() > max_chunks {
            dropped += kept.len() - max_chunks;
            kept.truncate(max_chunks);
        }

        Ok(Retrieval {
            used_tokens: kept.iter().map(|c| c.token_estimate).sum(),
            chunks: kept,
            degraded: degraded_reason.is_some(),
            degraded_reason,
            cache_hit,
            dropped,
        })
    }

    /// Like [`retrieve`](Self::retrieve), returning `None` if `cancel` fires first.
    pub async fn retrieve_cancellable(
        &self,
        query: &str,
        scope: &Scope,
        token_budget: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Retrieval>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = self.retrieve(query, scope, token_budget) => result.map(Some),
        }
    }

    /// Stat in-scope indexed files and flag any whose mtime advanced.
    async fn refresh_scope(&self, scope: &Scope) {
        let tracked: Vec<(String, i64)> = {
            let state = self.state.read().await;
            state
                .entries_in_scope(scope)
                .filter(|e| e.status == IndexStatus::Indexed)
                .map(|e| (e.source_path.clone(), e.last_indexed_mtime))
                .collect()
        };

        let mut stale: Vec<String> = Vec::new();
        for (path, indexed_at) in tracked {
            let changed = match stat_mtime(&self.root.join(&path)).await {
                Ok(mtime) => mtime > indexed_at,
                Err(_) => true,
            };
            if changed {
                stale.push(path);
            }
        }

        if stale.is_empty() {
            return;
        }
        {
            let mut state = self.state.write().await;
            for path in &stale {
                state.mark_needs_reindex(path);
            }
        }
        let mut cache = self.cache.lock().await;
        for path in &stale {
            cache.invalidate(path);
        }
        tracing::debug!(count = stale.len(), "files changed since indexing");
    }

    async fn build_context(&self, ranked: &[RankedChunk]) -> Vec<ContextChunk> {
        let state = self.state.read().await;
        ranked
            .iter()
            .filter(|r| r.score > 0.0)
            .filter_map(|r| {
                let chunk = state.chunk(&r.chunk_id)?;
                let stale = state.status(&chunk.source_path) == IndexStatus::NeedsReindex;
                Some(ContextChunk {
                    text: chunk.text.clone(),
                    token_estimate: chunk.token_estimate,
                    score: r.score,
                    citation: Citation {
                        source_path: chunk.source_path.clone(),
                        heading_path: chunk.heading_path.clone(),
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        possibly_stale: stale,
                    },
                })
            })
            .collect()
    }

    /// Normalize `path` to a project-relative path, rejecting escapes.
    fn relative_path(&self, path: &str) -> Result<String> {
        let p = Path::new(path);
        let rel = if p.is_absolute() {
            p.strip_prefix(&self.root)
                .map_err(|_| anyhow!("{} is outside the project", path))?
        } else {
            p
        };
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("{} escapes the project root", path);
        }
        Ok(normalize_source_path(&rel.to_string_lossy()))
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        bail!("Project root does not exist or is not a directory: {}", root.display());
    }
    root.canonicalize()
        .with_context(|| format!("Failed to resolve project root: {}", root.display()))
}

/// Scores in descending order (ties by id), capped at `k`.
fn sorted_scores(scores: HashMap<String, f64>, k: usize) -> Vec<(String, f64)> {
    let mut sorted: Vec<(String, f64)> = scores.into_iter().collect();
    sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    sorted.truncate(k);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_scores_deterministic() {
        let scores: HashMap<String, f64> = [("b", 1.0), ("a", 1.0), ("c", 2.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let sorted = sorted_scores(scores, 2);
        assert_eq!(sorted, vec![("c".to_string(), 2.0), ("a".to_string(), 1.0)]);
    }

    #[test]
    fn test_report_records_outcomes() {
        let mut report = IndexReport::default();
        report.record(FileOutcome::Indexed {
            chunks: 3,
            vectors_ok: false,
        });
        report.record(FileOutcome::Unchanged);
        report.record(FileOutcome::Refreshed);
        report.record(FileOutcome::Repushed { vectors_ok: true });
        report.record(FileOutcome::Repushed { vectors_ok: false });
        assert_eq!(report.indexed, 1);
        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.repushed, 2);
        assert_eq!(report.vector_failures, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.refreshed, 1);
    }
}
