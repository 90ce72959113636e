//! Multi-format text extraction.
//!
//! Maps `(file bytes, filename)` to plain UTF-8 text, choosing a strategy by
//! extension:
//!
//! | Kind | Extensions | Strategy |
//! |------|------------|----------|
//! | Text | `txt` | [`EncodingResolver`] |
//! | Markdown | `md`, `markdown` | [`EncodingResolver`] |
//! | PDF | `pdf` | primary parser, then local `pdf-extract` |
//! | Word / PowerPoint / Excel | `docx`, `pptx`, `xlsx` | primary parser, then local OOXML reader |
//! | Email | `eml` | primary parser, then local MIME reader |
//! | Legacy Office | `doc`, `ppt`, `xls` | primary parser only |
//! | Image | `png`, `jpg`, `jpeg`, `tif`, `tiff`, `bmp` | primary parser only |
//!
//! Anything else fails fast with [`IngestError::UnsupportedFormat`] rather
//! than pushing undecodable binary into the index.
//!
//! The primary parser is an injected [`DocumentParser`] (normally the
//! Unstructured HTTP API, see [`unstructured`]) bounded by
//! `extract.parser_timeout_secs`. Every fallback taken is recorded in
//! [`Extraction::notes`].

mod email;
mod local;
pub mod unstructured;

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::encoding::EncodingResolver;
use crate::error::IngestError;

pub use local::{LocalParser, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Text,
    Markdown,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    LegacyOffice,
    Email,
    Image,
}

impl FileKind {
    /// Resolve a kind from a bare extension (no dot), case-insensitive.
    pub fn from_extension(ext: &str) -> Result<Self, IngestError> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "text" => Ok(FileKind::Text),
            "md" | "markdown" => Ok(FileKind::Markdown),
            "pdf" => Ok(FileKind::Pdf),
            "docx" => Ok(FileKind::Docx),
            "pptx" => Ok(FileKind::Pptx),
            "xlsx" => Ok(FileKind::Xlsx),
            "doc" | "ppt" | "xls" => Ok(FileKind::LegacyOffice),
            "eml" => Ok(FileKind::Email),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" => Ok(FileKind::Image),
            "" => Err(IngestError::UnsupportedFormat(
                "file has no extension".to_string(),
            )),
            other => Err(IngestError::UnsupportedFormat(format!(".{}", other))),
        }
    }

    pub fn from_filename(filename: &str) -> Result<Self, IngestError> {
        Self::from_extension(&extension_of(filename))
    }

    /// Whether the bundled [`LocalParser`] can handle this kind.
    pub fn has_local_parser(&self) -> bool {
        matches!(
            self,
            FileKind::Pdf | FileKind::Docx | FileKind::Pptx | FileKind::Xlsx | FileKind::Email
        )
    }

    fn is_plain_text(&self) -> bool {
        matches!(self, FileKind::Text | FileKind::Markdown)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Text => "text",
            FileKind::Markdown => "markdown",
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Pptx => "pptx",
            FileKind::Xlsx => "xlsx",
            FileKind::LegacyOffice => "legacy-office",
            FileKind::Email => "email",
            FileKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// Lowercased extension of `filename` without the dot (`""` if none).
pub fn extension_of(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// MIME type for an extension, `application/octet-stream` when unknown.
pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "doc" => "application/msword",
        "ppt" => "application/vnd.ms-powerpoint",
        "xls" => "application/vnd.ms-excel",
        "eml" => "message/rfc822",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// An external, format-aware document parser.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Short identifier used in notes and logs.
    fn name(&self) -> &str;

    async fn parse(&self, bytes: &[u8], kind: FileKind, filename: &str) -> Result<String>;
}

/// Which strategy produced the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Decoded,
    Primary(String),
    Local,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub kind: FileKind,
    pub strategy: Strategy,
    /// Encoding name for plain-text kinds.
    pub encoding: Option<String>,
    pub notes: Vec<String>,
}

pub struct Extractor {
    resolver: EncodingResolver,
    primary: Option<Arc<dyn DocumentParser>>,
    local: LocalParser,
    parser_timeout: Duration,
}

impl Extractor {
    pub fn new(resolver: EncodingResolver, parser_timeout: Duration) -> Self {
        Self {
            resolver,
            primary: None,
            local: LocalParser::default(),
            parser_timeout,
        }
    }

    pub fn with_primary(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.primary = Some(parser);
        self
    }

    pub fn with_local(mut self, local: LocalParser) -> Self {
        self.local = local;
        self
    }

    pub async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, IngestError> {
        let kind = FileKind::from_filename(filename)?;
        let mut notes = Vec::new();

        let (raw, strategy, encoding) = if kind.is_plain_text() {
            let decoded = self.resolver.resolve(bytes)?;
            if decoded.fallback {
                warn!(
                    file = filename,
                    encoding = decoded.encoding,
                    "decoded with fallback encoding"
                );
                notes.push(format!(
                    "decoded with fallback encoding {}",
                    decoded.encoding
                ));
            }
            if let Some(guess) = decoded.detected {
                warn!(
                    file = filename,
                    encoding = decoded.encoding,
                    detected = guess,
                    "decoded encoding differs from detector guess"
                );
                notes.push(format!(
                    "decoded as {} although the detector suggested {}",
                    decoded.encoding, guess
                ));
            }
            (
                decoded.text,
                Strategy::Decoded,
                Some(decoded.encoding.to_string()),
            )
        } else {
            let (text, strategy) = self
                .extract_structured(bytes, kind, filename, &mut notes)
                .await?;
            (text, strategy, None)
        };

        let text = normalize_whitespace(&raw);
        debug!(
            file = filename,
            raw_len = raw.len(),
            normalized_len = text.len(),
            "text extracted"
        );
        if text.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        Ok(Extraction {
            text,
            kind,
            strategy,
            encoding,
            notes,
        })
    }

    async fn extract_structured(
        &self,
        bytes: &[u8],
        kind: FileKind,
        filename: &str,
        notes: &mut Vec<String>,
    ) -> Result<(String, Strategy), IngestError> {
        let mut failures: Vec<String> = Vec::new();

        if let Some(primary) = &self.primary {
            let name = primary.name().to_string();
            match tokio::time::timeout(self.parser_timeout, primary.parse(bytes, kind, filename))
                .await
            {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    return Ok((text, Strategy::Primary(name)));
                }
                Ok(Ok(_)) => failures.push(format!("{} returned no text", name)),
                Ok(Err(e)) => failures.push(format!("{} failed: {:#}", name, e)),
                Err(_) => failures.push(format!(
                    "{} timed out after {}s",
                    name,
                    self.parser_timeout.as_secs()
                )),
            }
            warn!(file = filename, reason = %failures[failures.len() - 1], "primary parser failed");
        }

        if !kind.has_local_parser() {
            failures.push(format!("no local parser for {}", kind));
            return Err(IngestError::ExtractionFailed(failures.join("; ")));
        }

        let local = self.local.clone();
        let owned = bytes.to_vec();
        let outcome = tokio::task::spawn_blocking(move || local.parse(&owned, kind)).await;

        match outcome {
            Ok(Ok(text)) => {
                notes.extend(failures.into_iter().map(|f| format!("fell back to local parser: {}", f)));
                Ok((text, Strategy::Local))
            }
            Ok(Err(e)) => {
                failures.push(format!("local parser failed: {}", e));
                Err(IngestError::ExtractionFailed(failures.join("; ")))
            }
            Err(e) => {
                // pdf-extract panics on some malformed inputs.
                failures.push(format!("local parser aborted: {}", e));
                Err(IngestError::ExtractionFailed(failures.join("; ")))
            }
        }
    }
}

static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());
static NEWLINE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

/// Normalize extracted text for indexing.
///
/// Removes NUL and zero-width-space characters, collapses blank-line runs
/// to a single blank line and space runs to one space, then trims.
pub fn normalize_whitespace(text: &str) -> String {
    let cleaned: String = text
        .replace("\r\n", "\n")
        .chars()
        .filter(|c| *c != '\0' && *c != '\u{200b}')
        .collect();
    let cleaned = BLANK_RUN.replace_all(&cleaned, "\n\n");
    let cleaned = NEWLINE_RUN.replace_all(&cleaned, "\n\n");
    let cleaned = SPACE_RUN.replace_all(&cleaned, " ");
    cleaned.trim().to_string()
}
