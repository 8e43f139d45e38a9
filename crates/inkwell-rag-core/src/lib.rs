//! # Inkwell RAG Core
//!
//! Pure retrieval logic for Inkwell RAG: chunk and index-entry models,
//! Markdown-aware chunking, BM25 keyword scoring, hybrid ranking with token
//! budget truncation, the query cache, the per-project metadata store, and
//! the vector-index trait with an in-memory implementation.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The calling
//! application reads files, owns the locks, and talks to the embedding
//! service.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod keyword;
pub mod models;
pub mod rank;
pub mod store;
pub mod vector;
