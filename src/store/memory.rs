//! In-memory [`MetadataStore`] and [`VectorStore`] for tests and embedding.
//!
//! Plain `HashMap`s behind `std::sync::RwLock`. Status transitions take the
//! write lock, so a claim is atomic with respect to every other caller.
//! Vector search is brute-force cosine similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, DocumentStatus, Finish, SourceDocument};

use super::{top_k, MetadataStore, VectorHit, VectorRecord, VectorStore};

#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, SourceDocument>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
    vectors: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored vectors, across all documents.
    pub fn vector_count(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    fn transition(&self, id: &str, from: &[DocumentStatus], to: DocumentStatus) -> Result<bool> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        match docs.get_mut(id) {
            Some(doc) if from.contains(&doc.status) => {
                doc.status = to;
                doc.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn insert_document(&self, doc: &SourceDocument) -> Result<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        if docs.contains_key(&doc.id) {
            return Err(anyhow!("document {} already exists", doc.id));
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.get(id).cloned())
    }

    async fn list_documents(
        &self,
        limit: i64,
        offset: i64,
        newest_first: bool,
    ) -> Result<Vec<SourceDocument>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut all: Vec<SourceDocument> = docs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if newest_first {
            all.reverse();
        }
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_document(&self, id: &str) -> Result<bool> {
        self.transition(id, &[DocumentStatus::Pending], DocumentStatus::Processing)
    }

    async fn requeue_document(&self, id: &str) -> Result<bool> {
        self.transition(
            id,
            &[DocumentStatus::Failed, DocumentStatus::Completed],
            DocumentStatus::Pending,
        )
    }

    async fn claim_for_delete(&self, id: &str) -> Result<bool> {
        self.transition(
            id,
            &[
                DocumentStatus::Pending,
                DocumentStatus::Failed,
                DocumentStatus::Completed,
            ],
            DocumentStatus::Processing,
        )
    }

    async fn reset_stale(&self, id: &str) -> Result<bool> {
        self.transition(id, &[DocumentStatus::Processing], DocumentStatus::Pending)
    }

    async fn finish_document(&self, id: &str, finish: &Finish) -> Result<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| anyhow!("document {} not found", id))?;
        let now = chrono::Utc::now().timestamp();
        doc.status = finish.status;
        doc.error_message = finish.error_message.clone();
        doc.number_of_chunks = finish.number_of_chunks;
        doc.encoding = finish.encoding.clone();
        doc.diagnostics = finish.diagnostics.clone();
        doc.updated_at = now;
        doc.processed_at = Some(now);
        Ok(())
    }

    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        stored.insert(doc_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn delete_chunks(&self, doc_id: &str) -> Result<()> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        stored.remove(doc_id);
        Ok(())
    }

    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let stored = self.chunks.read().map_err(poisoned)?;
        let mut chunks = stored.get(doc_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let stored = self.chunks.read().map_err(poisoned)?;
        Ok(stored
            .values()
            .flatten()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        self.chunks.write().map_err(poisoned)?.remove(id);
        let removed = self.docs.write().map_err(poisoned)?.remove(id);
        Ok(removed.is_some())
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut vectors = self.vectors.write().map_err(poisoned)?;
        for r in records {
            vectors.insert(r.chunk_id.clone(), r.clone());
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let vectors = self.vectors.read().map_err(poisoned)?;
        let hits = vectors
            .values()
            .map(|r| VectorHit {
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                score: cosine_similarity(vector, &r.vector),
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let mut vectors = self.vectors.write().map_err(poisoned)?;
        vectors.retain(|_, r| r.document_id != doc_id);
        Ok(())
    }
}
