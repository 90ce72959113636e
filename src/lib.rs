//! # Knowledge Harness
//!
//! A local-first document knowledge base. Uploaded files in many formats are
//! turned into plain text, split into overlapping chunks, embedded, and made
//! searchable by semantic similarity, with optional reranking and answer
//! generation on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────────┐   ┌──────────┐
//! │  Upload  │──▶│ Ingestor                          │──▶│  SQLite  │
//! │ CLI/HTTP │   │ extract → chunk → embed → persist │   │ docs+vec │
//! └──────────┘   └───────────────────────────────────┘   └────┬─────┘
//!      │                                                      │
//!      ▼                                                      ▼
//! ┌──────────┐                                          ┌──────────┐
//! │ Objects  │                                          │Retriever │
//! │  fs/S3   │                                          │ rerank+gen│
//! └──────────┘                                          └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, chunks and retrieval results |
//! | [`error`] | Ingestion error taxonomy |
//! | [`encoding`] | Candidate-list text decoding |
//! | [`extract`] | Format-aware text extraction with fallback |
//! | [`chunk`] | Fixed-size overlapping chunking |
//! | [`ingest`] | Ingestion orchestration and status lifecycle |
//! | [`store`] | Metadata, vector and object store seams |
//! | [`embedding`] | Embedding providers |
//! | [`rerank`] | Optional reranking |
//! | [`generate`] | Answer generation |
//! | [`query`] | Retrieval and question answering |
//! | [`server`] | HTTP upload surface |
//! | [`commands`] | CLI entry points |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod generate;
mod http;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod rerank;
pub mod server;
pub mod store;
