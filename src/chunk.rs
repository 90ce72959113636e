//! Fixed-size overlapping text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `size`
//! characters, with consecutive chunks sharing `overlap` characters.
//! Sizes and offsets count Unicode scalar values, never bytes, so a chunk
//! boundary can not split a multi-byte character.
//!
//! # Algorithm
//!
//! 1. If the text has at most `size` characters, return it as one chunk.
//! 2. Otherwise chunk *i* starts at `i × (size − overlap)` and spans
//!    `min(size, len − start)` characters.
//! 3. Stop once the next start would be at or past the end of the text.
//!
//! For 2,500 characters with `size = 1000, overlap = 200` this yields
//! offsets `0, 800, 1600, 2400` and lengths `1000, 1000, 900, 100`.
//!
//! Each chunk gets a deterministic UUID derived from its document ID and
//! ordinal, so re-ingesting a document produces the same chunk ids, plus a
//! SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use knowledge_harness::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams::new(1000, 200).unwrap();
//! let chunks = chunk_text("doc-123", "Hello world.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello world.");
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::Chunk;

/// Validated chunk window: `size > 0` and `overlap < size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    size: usize,
    overlap: usize,
}

impl ChunkParams {
    pub fn new(size: usize, overlap: usize) -> Result<Self, IngestError> {
        if size == 0 || overlap >= size {
            return Err(IngestError::ChunkingInvalidParameters { size, overlap });
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn step(&self) -> usize {
        self.size - self.overlap
    }
}

/// Split `text` into overlapping fixed-size chunks.
///
/// Always returns at least one chunk; indices are contiguous from 0.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    // Byte offset of every char, plus the end of the string.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let len = bounds.len();
    bounds.push(text.len());

    if len <= params.size {
        return vec![make_chunk(document_id, 0, 0, len, text)];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < len {
        let end = (start + params.size).min(len);
        let slice = &text[bounds[start]..bounds[end]];
        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            start,
            end - start,
            slice,
        ));
        start += params.step();
    }

    chunks
}

/// Rebuild the original text from chunks, dropping the overlapping spans.
///
/// Chunks are ordered by `chunk_index`; for each one only the characters
/// past the end of what earlier chunks already covered are appended.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);

    let mut out = String::new();
    let mut covered: i64 = 0;
    for chunk in ordered {
        let chunk_end = chunk.start_offset + chunk.char_len;
        if chunk_end <= covered {
            continue;
        }
        let skip = (covered - chunk.start_offset).max(0) as usize;
        out.extend(chunk.text.chars().skip(skip));
        covered = chunk_end;
    }
    out
}

/// Deterministic chunk id: stable across re-ingestion of the same document.
pub fn chunk_id(document_id: &str, index: i64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, index).as_bytes(),
    )
    .to_string()
}

fn make_chunk(document_id: &str, index: i64, start: usize, char_len: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        start_offset: start as i64,
        char_len: char_len as i64,
        text: text.to_string(),
        hash,
    }
}
