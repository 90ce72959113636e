//! Ingestion pipeline orchestration.
//!
//! Drives one document from stored bytes to indexed chunks:
//! claim → validate → fetch → extract → chunk → persist chunks → embed →
//! persist vectors → finish.
//!
//! # Status lifecycle
//!
//! ```text
//! upload ──► pending ──claim──► processing ──► completed
//!               ▲                   │    └───► failed
//!               │                   │
//!               └──── requeue ◄─────┴─ (completed | failed)
//!               └──── reset_stale ◄─── (stuck processing)
//! ```
//!
//! A run never returns an error to its caller: every failure is recorded on
//! the document as `failed` with a `"<Kind>: <detail>"` message and shows up
//! in the [`IngestReport`]. Each run fully replaces the chunks and vectors of
//! earlier attempts, and a failed run leaves none behind.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_text, ChunkParams};
use crate::embedding::EmbeddingProvider;
use crate::error::{IngestError, UploadError};
use crate::extract::{content_type_for, extension_of, Extractor, FileKind};
use crate::models::{Chunk, DocumentStatus, Finish, SourceDocument};
use crate::store::{MetadataStore, ObjectStore, VectorRecord, VectorStore};

/// Result of one ingestion attempt.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Completed {
        chunks: usize,
        encoding: Option<String>,
        notes: Vec<String>,
    },
    Failed {
        kind: String,
        message: String,
    },
    /// The document was not claimable (missing, already running, or finished).
    Skipped {
        reason: String,
    },
}

impl IngestReport {
    fn skipped(id: &str, reason: impl Into<String>) -> Self {
        Self {
            document_id: id.to_string(),
            outcome: Outcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
    /// A run holds the document; deleting now would race with it.
    Busy,
}

/// Successful pipeline output before the terminal status is written.
struct Processed {
    chunks: usize,
    encoding: Option<String>,
}

#[derive(Clone)]
pub struct Ingestor {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<Extractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: ChunkParams,
    embed_batch_size: usize,
    max_file_bytes: u64,
}

impl Ingestor {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<Extractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: ChunkParams,
    ) -> Self {
        Self {
            metadata,
            vectors,
            objects,
            extractor,
            embedder,
            params,
            embed_batch_size: 64,
            max_file_bytes: u64::MAX,
        }
    }

    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }

    pub fn with_max_file_bytes(mut self, max: u64) -> Self {
        self.max_file_bytes = max;
        self
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Store the raw bytes and register a `pending` document.
    ///
    /// The format is not checked here; an unsupported extension is reported
    /// by the first ingestion run.
    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Result<SourceDocument, UploadError> {
        let base = base_name(filename);
        if base.is_empty() {
            return Err(UploadError::MissingFilename);
        }
        let size = bytes.len() as u64;
        if size > self.max_file_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_file_bytes,
            });
        }

        let id = Uuid::new_v4().to_string();
        let extension = extension_of(base);
        let key = format!("{}/{}", id, sanitize_filename(base));
        let location = self
            .objects
            .put(&key, bytes)
            .await
            .map_err(UploadError::Store)?;

        let now = chrono::Utc::now().timestamp();
        let doc = SourceDocument {
            id: id.clone(),
            original_filename: base.to_string(),
            content_type: content_type_for(&extension).to_string(),
            extension,
            size: size as i64,
            object_key: location,
            status: DocumentStatus::Pending,
            error_message: None,
            number_of_chunks: None,
            encoding: None,
            diagnostics: Vec::new(),
            created_at: now,
            updated_at: now,
            processed_at: None,
        };

        if let Err(e) = self.metadata.insert_document(&doc).await {
            if let Err(cleanup) = self.objects.delete(&doc.object_key).await {
                warn!(key = %doc.object_key, error = %cleanup, "failed to remove orphaned upload");
            }
            return Err(UploadError::Store(e));
        }

        info!(document_id = %doc.id, filename = %doc.original_filename, size, "document uploaded");
        Ok(doc)
    }

    /// Run the pipeline for one `pending` document.
    pub async fn ingest(&self, id: &str) -> IngestReport {
        match self.metadata.claim_document(id).await {
            Ok(true) => {}
            Ok(false) => return IngestReport::skipped(id, self.skip_reason(id).await),
            Err(e) => {
                error!(document_id = id, error = %e, "failed to claim document");
                return IngestReport::skipped(id, format!("could not claim document: {:#}", e));
            }
        }

        let doc = match self.metadata.get_document(id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return IngestReport::skipped(id, "document disappeared after claim"),
            Err(e) => {
                let err = IngestError::StorageReadFailed(format!("{:#}", e));
                return self.fail(id, err, Vec::new()).await;
            }
        };

        info!(document_id = id, filename = %doc.original_filename, "ingestion started");
        let mut notes = Vec::new();
        match self.process(&doc, &mut notes).await {
            Ok(done) => {
                let finish = Finish::completed(done.chunks, done.encoding.clone(), notes.clone());
                if let Err(e) = self.metadata.finish_document(id, &finish).await {
                    let err = IngestError::StorageWriteFailed(format!(
                        "failed to record completion: {:#}",
                        e
                    ));
                    return self.fail(id, err, notes).await;
                }
                info!(document_id = id, chunks = done.chunks, "ingestion completed");
                IngestReport {
                    document_id: id.to_string(),
                    outcome: Outcome::Completed {
                        chunks: done.chunks,
                        encoding: done.encoding,
                        notes,
                    },
                }
            }
            Err(err) => self.fail(id, err, notes).await,
        }
    }

    /// Move a finished document back to `pending` and ingest it again.
    pub async fn reingest(&self, id: &str) -> IngestReport {
        match self.metadata.requeue_document(id).await {
            Ok(_) => self.ingest(id).await,
            Err(e) => IngestReport::skipped(id, format!("could not requeue document: {:#}", e)),
        }
    }

    /// Ingest many documents with at most `workers` running at once.
    ///
    /// Reports come back in the order of `ids`. One document's failure never
    /// affects another.
    pub async fn ingest_many(&self, ids: &[String], workers: usize) -> Vec<IngestReport> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();

        for (idx, id) in ids.iter().enumerate() {
            let this = self.clone();
            let id = id.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (idx, this.ingest(&id).await)
            });
        }

        let mut reports: Vec<Option<IngestReport>> = vec![None; ids.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, report)) => reports[idx] = Some(report),
                Err(e) => error!(error = %e, "ingestion task aborted"),
            }
        }

        reports
            .into_iter()
            .zip(ids)
            .map(|(report, id)| {
                report.unwrap_or_else(|| IngestReport {
                    document_id: id.clone(),
                    outcome: Outcome::Failed {
                        kind: "Internal".to_string(),
                        message: "ingestion task aborted".to_string(),
                    },
                })
            })
            .collect()
    }

    /// Operator repair for a document stuck in `processing`.
    pub async fn reset_stale(&self, id: &str) -> Result<bool> {
        let reset = self.metadata.reset_stale(id).await?;
        if reset {
            warn!(document_id = id, "stale processing status reset to pending");
        }
        Ok(reset)
    }

    /// Remove vectors, chunks, stored bytes and the document row.
    ///
    /// The document is first moved to `processing`, so no ingestion job can
    /// claim it while it is being torn down.
    pub async fn delete(&self, id: &str) -> Result<DeleteResult> {
        if !self.metadata.claim_for_delete(id).await? {
            return Ok(match self.metadata.get_document(id).await? {
                Some(_) => DeleteResult::Busy,
                None => DeleteResult::NotFound,
            });
        }
        let Some(doc) = self.metadata.get_document(id).await? else {
            return Ok(DeleteResult::NotFound);
        };

        if let Err(e) = self.remove_derived(&doc).await {
            if let Err(reset) = self.metadata.reset_stale(id).await {
                error!(document_id = id, error = %reset, "failed to release document after failed delete");
            }
            return Err(e);
        }
        info!(document_id = id, "document deleted");
        Ok(DeleteResult::Deleted)
    }

    async fn remove_derived(&self, doc: &SourceDocument) -> Result<()> {
        self.vectors.delete_document(&doc.id).await?;
        self.metadata.delete_chunks(&doc.id).await?;
        if let Err(e) = self.objects.delete(&doc.object_key).await {
            warn!(document_id = %doc.id, error = %e, "failed to delete stored object");
        }
        self.metadata.delete_document(&doc.id).await?;
        Ok(())
    }

    /// The stored document together with its original bytes.
    pub async fn original(&self, id: &str) -> Result<Option<(SourceDocument, Vec<u8>)>> {
        let Some(doc) = self.metadata.get_document(id).await? else {
            return Ok(None);
        };
        let bytes = self.objects.get(&doc.object_key).await?;
        Ok(Some((doc, bytes)))
    }

    async fn process(
        &self,
        doc: &SourceDocument,
        notes: &mut Vec<String>,
    ) -> Result<Processed, IngestError> {
        FileKind::from_extension(&doc.extension)?;

        let bytes = self
            .objects
            .get(&doc.object_key)
            .await
            .map_err(|e| IngestError::StorageReadFailed(format!("{:#}", e)))?;

        let extraction = self.extractor.extract(&bytes, &doc.original_filename).await?;
        notes.extend(extraction.notes.iter().cloned());
        debug!(
            document_id = %doc.id,
            kind = %extraction.kind,
            chars = extraction.text.chars().count(),
            "text extracted"
        );

        let chunks = chunk_text(&doc.id, &extraction.text, &self.params);

        self.metadata
            .replace_chunks(&doc.id, &chunks)
            .await
            .map_err(|e| IngestError::StorageWriteFailed(format!("{:#}", e)))?;

        if self.embedder.is_enabled() {
            self.embed_chunks(doc, &chunks).await?;
        } else {
            notes.push("embedding disabled; chunks stored without vectors".to_string());
        }

        Ok(Processed {
            chunks: chunks.len(),
            encoding: extraction.encoding,
        })
    }

    async fn embed_chunks(&self, doc: &SourceDocument, chunks: &[Chunk]) -> Result<(), IngestError> {
        self.vectors
            .delete_document(&doc.id)
            .await
            .map_err(|e| IngestError::StorageWriteFailed(format!("{:#}", e)))?;

        for batch in chunks.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| IngestError::EmbeddingFailed(format!("{:#}", e)))?;
            if vectors.len() != batch.len() {
                return Err(IngestError::EmbeddingFailed(format!(
                    "sent {} texts, received {} vectors",
                    batch.len(),
                    vectors.len()
                )));
            }

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRecord {
                    chunk_id: chunk.id.clone(),
                    document_id: doc.id.clone(),
                    chunk_index: chunk.chunk_index,
                    filename: doc.original_filename.clone(),
                    vector,
                })
                .collect();
            self.vectors
                .upsert(&records)
                .await
                .map_err(|e| IngestError::StorageWriteFailed(format!("{:#}", e)))?;
        }
        Ok(())
    }

    async fn fail(&self, id: &str, err: IngestError, notes: Vec<String>) -> IngestReport {
        error!(document_id = id, kind = err.kind(), error = %err, "ingestion failed");

        if let Err(e) = self.metadata.delete_chunks(id).await {
            warn!(document_id = id, error = %e, "failed to clean up chunks");
        }
        if let Err(e) = self.vectors.delete_document(id).await {
            warn!(document_id = id, error = %e, "failed to clean up vectors");
        }

        let message = err.diagnostic();
        let finish = Finish::failed(message.clone(), notes);
        if let Err(e) = self.metadata.finish_document(id, &finish).await {
            error!(document_id = id, error = %e, "failed to record failure status");
        }

        IngestReport {
            document_id: id.to_string(),
            outcome: Outcome::Failed {
                kind: err.kind().to_string(),
                message,
            },
        }
    }

    async fn skip_reason(&self, id: &str) -> String {
        match self.metadata.get_document(id).await {
            Ok(None) => "document not found".to_string(),
            Ok(Some(doc)) => match doc.status {
                DocumentStatus::Processing => "document is already being processed".to_string(),
                status => format!("document is {}", status),
            },
            Err(e) => format!("could not load document: {:#}", e),
        }
    }
}

/// Last path component of an uploaded filename.
fn base_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename).trim()
}

/// Object-key-safe version of a filename: letters, digits, `.`, `-` and `_`
/// are kept, anything else becomes `_`.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
