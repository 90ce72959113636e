//! Ingestion error taxonomy.
//!
//! Every failure a single document can hit on its way from upload to
//! indexed chunks is one of these variants. The orchestrator converts them
//! into a terminal `failed` status; the stored message is prefixed with
//! [`IngestError::kind`] so callers polling a document can tell the
//! categories apart without parsing free text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("document yielded no text")]
    EmptyDocument,

    #[error("no candidate encoding could decode the input (tried {0})")]
    EncodingExhausted(String),

    #[error("invalid chunking parameters: size={size}, overlap={overlap} (need size > 0 and overlap < size)")]
    ChunkingInvalidParameters { size: usize, overlap: usize },

    #[error("failed to read stored object: {0}")]
    StorageReadFailed(String),

    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
}

impl IngestError {
    /// Stable, machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::UnsupportedFormat(_) => "UnsupportedFormat",
            IngestError::ExtractionFailed(_) => "ExtractionFailed",
            IngestError::EmptyDocument => "EmptyDocument",
            IngestError::EncodingExhausted(_) => "EncodingExhausted",
            IngestError::ChunkingInvalidParameters { .. } => "ChunkingInvalidParameters",
            IngestError::StorageReadFailed(_) => "StorageReadFailed",
            IngestError::StorageWriteFailed(_) => "StorageWriteFailed",
            IngestError::EmbeddingFailed(_) => "EmbeddingFailed",
        }
    }

    /// Message persisted on a failed document: `"<Kind>: <detail>"`.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// Rejection of an upload before anything is stored.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file is {size} bytes, larger than the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("upload has no filename")]
    MissingFilename,

    #[error("failed to store upload: {0:#}")]
    Store(anyhow::Error),
}
