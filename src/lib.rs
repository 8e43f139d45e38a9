//! # Inkwell RAG
//!
//! Project-scoped retrieval for a writing assistant. Markdown and text files
//! are chunked along their heading structure, indexed for BM25 and
//! (optionally) embedded, then blended into a ranked, cited context block
//! that fits a token budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────────┐
//! │  walker  │──▶│ engine index │──▶│ metadata store  │  (inkwell-rag-core)
//! │ globs +  │   │ chunk, hash, │   │ + BM25 index    │
//! │ deny-list│   │ push vectors │──▶│ vector index    │  (SQLite / memory)
//! └──────────┘   └──────────────┘   └────────┬────────┘
//!                                            │
//!                    query cache ◀── retrieve ┘ ── hybrid rank ── budget
//! ```
//!
//! The pure pieces (chunker, BM25, ranker, cache, store) live in the
//! `inkwell-rag-core` crate; this crate adds the file system, SQLite,
//! HTTP embedding providers, and the `inkrag` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`walker`] | Project walk and exclusion rules |
//! | [`embedding`] | Ollama / OpenAI embedding providers |
//! | [`vector_store`] | SQLite vector index |
//! | [`engine`] | Indexing and retrieval |
//! | [`progress`] | Index progress events |
//! | [`edits`] | Proposed edit batches |
//! | [`registry`] | Open projects by root |

pub mod config;
pub mod db;
pub mod edits;
pub mod embedding;
pub mod engine;
pub mod migrate;
pub mod progress;
pub mod registry;
pub mod vector_store;
pub mod walker;

pub use inkwell_rag_core as core;
