//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the uploaded documents, their chunks, and the
//! retrieval results that flow through the ingestion and query pipeline.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Serialize;

/// Processing status of a [`SourceDocument`].
///
/// `processing` doubles as the per-document mutual-exclusion flag: a job
/// must move the document `pending → processing` atomically before it
/// starts, and no job may start while the status is `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => bail!("unknown document status: '{}'", other),
        }
    }
}

/// One uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub id: String,
    pub original_filename: String,
    /// Lowercased extension without the dot; empty when the name has none.
    pub extension: String,
    pub content_type: String,
    pub size: i64,
    /// Location inside the object store.
    pub object_key: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub number_of_chunks: Option<i64>,
    /// Encoding used to decode plain-text uploads.
    pub encoding: Option<String>,
    /// Extraction notes from the last run (fallbacks taken, soft failures).
    pub diagnostics: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

/// A fixed-size, possibly overlapping slice of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// 0-based, contiguous ordinal; defines reconstruction order.
    pub chunk_index: i64,
    /// Offset of the first character within the extracted text, in chars.
    pub start_offset: i64,
    /// Length of `text` in chars.
    pub char_len: i64,
    pub text: String,
    pub hash: String,
}

/// Terminal bookkeeping written by the orchestrator when a job ends.
#[derive(Debug, Clone)]
pub struct Finish {
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub number_of_chunks: Option<i64>,
    pub encoding: Option<String>,
    pub diagnostics: Vec<String>,
}

impl Finish {
    pub fn completed(chunks: usize, encoding: Option<String>, diagnostics: Vec<String>) -> Self {
        Self {
            status: DocumentStatus::Completed,
            error_message: None,
            number_of_chunks: Some(chunks as i64),
            encoding,
            diagnostics,
        }
    }

    pub fn failed(message: String, diagnostics: Vec<String>) -> Self {
        Self {
            status: DocumentStatus::Failed,
            error_message: Some(message),
            number_of_chunks: Some(0),
            encoding: None,
            diagnostics,
        }
    }
}

/// A chunk returned by the query pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Cosine similarity from vector recall.
    pub score: f32,
    /// Relevance score from the reranker, when one ran.
    pub rerank_score: Option<f32>,
}
