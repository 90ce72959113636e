//! Storage seams for the ingestion and query pipeline.
//!
//! Three independent collaborators, each an async trait so backends can be
//! swapped and tests can inject in-memory doubles:
//!
//! | Trait | Holds | Backends |
//! |-------|-------|----------|
//! | [`MetadataStore`] | documents, status, chunks | [`SqliteStore`], [`InMemoryStore`] |
//! | [`VectorStore`] | one embedding per chunk | [`SqliteStore`], [`InMemoryStore`] |
//! | [`ObjectStore`] | raw uploaded bytes | [`FsObjectStore`], [`S3ObjectStore`], [`MemoryObjectStore`] |
//!
//! Status transitions are conditional updates: [`MetadataStore::claim_document`]
//! succeeds for exactly one caller when several race on the same pending
//! document.

pub mod memory;
pub mod objects;
pub mod s3;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Finish, SourceDocument};

pub use memory::InMemoryStore;
pub use objects::{FsObjectStore, MemoryObjectStore};
pub use s3::S3ObjectStore;
pub use sqlite::SqliteStore;

/// One vector to persist, keyed by chunk.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub filename: String,
    pub vector: Vec<f32>,
}

/// A vector-recall result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    /// Cosine similarity with the query vector.
    pub score: f32,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_document(&self, doc: &SourceDocument) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>>;

    /// Page through documents ordered by creation time.
    async fn list_documents(
        &self,
        limit: i64,
        offset: i64,
        newest_first: bool,
    ) -> Result<Vec<SourceDocument>>;

    /// Atomically move `pending → processing`. Returns `false` when the
    /// document is missing or in any other state.
    async fn claim_document(&self, id: &str) -> Result<bool>;

    /// Move `failed | completed → pending` so the document can be claimed again.
    async fn requeue_document(&self, id: &str) -> Result<bool>;

    /// Atomically move `pending | failed | completed → processing` ahead of a
    /// delete. Returns `false` when the document is missing or already
    /// processing.
    async fn claim_for_delete(&self, id: &str) -> Result<bool>;

    /// Operator repair: move a stuck `processing → pending`.
    async fn reset_stale(&self, id: &str) -> Result<bool>;

    /// Write the terminal status and bookkeeping of a job.
    async fn finish_document(&self, id: &str, finish: &Finish) -> Result<()>;

    /// Delete every chunk of `doc_id`, then insert `chunks`, atomically.
    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn delete_chunks(&self, doc_id: &str) -> Result<()>;

    /// Chunks of a document ordered by `chunk_index`.
    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    /// Chunks for the given ids. Order is unspecified; unknown ids are omitted.
    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Remove the document row and its chunks. Returns `false` if absent.
    async fn delete_document(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite vectors, keyed by chunk id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Top `k` chunks by cosine similarity, best first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// Remove every vector belonging to `doc_id`.
    async fn delete_document(&self, doc_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, returning the location to read it back from.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    async fn get(&self, location: &str) -> Result<Vec<u8>>;

    async fn delete(&self, location: &str) -> Result<()>;
}

/// Sort hits best first (ties by chunk id) and keep `k`.
pub(crate) fn top_k(mut hits: Vec<VectorHit>, k: usize) -> Vec<VectorHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}
