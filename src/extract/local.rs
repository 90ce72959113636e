//! In-process parsers for PDF, OOXML and email.
//!
//! Used when the primary parser is not configured, fails, or times out.
//! The OOXML readers walk the document XML with `quick-xml` and keep block
//! structure: one line per Word paragraph, a blank line between slides,
//! and tab-separated cells per spreadsheet row.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use super::{email, FileKind};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("email extraction failed: {0}")]
    Email(String),
    #[error("no local parser for {0}")]
    Unsupported(FileKind),
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

#[derive(Debug, Clone)]
pub struct LocalParser {
    max_entry_bytes: u64,
    max_sheets: usize,
    max_cells_per_sheet: usize,
}

impl Default for LocalParser {
    fn default() -> Self {
        Self {
            max_entry_bytes: MAX_XML_ENTRY_BYTES,
            max_sheets: XLSX_MAX_SHEETS,
            max_cells_per_sheet: XLSX_MAX_CELLS_PER_SHEET,
        }
    }
}

impl LocalParser {
    pub fn with_max_entry_bytes(mut self, max: u64) -> Self {
        self.max_entry_bytes = max;
        self
    }

    pub fn parse(&self, bytes: &[u8], kind: FileKind) -> Result<String, ParseError> {
        match kind {
            FileKind::Pdf => {
                pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))
            }
            FileKind::Docx => self.docx(bytes),
            FileKind::Pptx => self.pptx(bytes),
            FileKind::Xlsx => self.xlsx(bytes),
            FileKind::Email => email::extract(bytes),
            other => Err(ParseError::Unsupported(other)),
        }
    }

    fn docx(&self, bytes: &[u8]) -> Result<String, ParseError> {
        let mut archive = open_archive(bytes)?;
        let xml = self.read_entry(&mut archive, "word/document.xml")?;
        collect_text(&xml, b"t", b"p")
    }

    fn pptx(&self, bytes: &[u8]) -> Result<String, ParseError> {
        let mut archive = open_archive(bytes)?;
        let slides = numbered_entries(&archive, "ppt/slides/slide");
        let mut out = String::new();
        for name in slides {
            let xml = self.read_entry(&mut archive, &name)?;
            let text = collect_text(&xml, b"t", b"p")?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(text);
        }
        Ok(out)
    }

    fn xlsx(&self, bytes: &[u8]) -> Result<String, ParseError> {
        let mut archive = open_archive(bytes)?;
        let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
            let xml = self.read_entry(&mut archive, "xl/sharedStrings.xml")?;
            shared_strings(&xml)?
        } else {
            Vec::new()
        };

        let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
        let mut out = String::new();
        for name in sheets.into_iter().take(self.max_sheets) {
            let xml = self.read_entry(&mut archive, &name)?;
            let text = sheet_text(&xml, &shared, self.max_cells_per_sheet)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(text);
        }
        Ok(out)
    }

    fn read_entry(&self, archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ParseError> {
        let entry = archive
            .by_name(name)
            .map_err(|e| ParseError::Ooxml(format!("{}: {}", name, e)))?;
        let mut out = Vec::new();
        entry
            .take(self.max_entry_bytes)
            .read_to_end(&mut out)
            .map_err(|e| ParseError::Ooxml(e.to_string()))?;
        if out.len() as u64 >= self.max_entry_bytes {
            return Err(ParseError::Ooxml(format!(
                "ZIP entry {} exceeds size limit ({} bytes)",
                name, self.max_entry_bytes
            )));
        }
        Ok(out)
    }
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ParseError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParseError::Ooxml(e.to_string()))
}

/// Entries named `<prefix><n>.xml`, sorted by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .filter(|n| !n[prefix.len()..].contains('/'))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name[prefix.len()..]
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `text_tag` element, ending a line at each
/// closing `block_tag`. Tags match on local name, so namespace prefixes
/// (`w:`, `a:`) are ignored.
fn collect_text(xml: &[u8], text_tag: &[u8], block_tag: &[u8]) -> Result<String, ParseError> {
    let mut out = String::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == block_tag {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ParseError> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    let text = te.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(s);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellType {
    Shared,
    Inline,
    Value,
}

fn sheet_text(xml: &[u8], shared: &[String], max_cells: usize) -> Result<String, ParseError> {
    let mut out = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_type = CellType::Value;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= max_cells {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type = CellType::Value;
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"t" {
                            cell_type = match attr.value.as_ref() {
                                b"s" => CellType::Shared,
                                b"inlineStr" => CellType::Inline,
                                _ => CellType::Value,
                            };
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if cell_type == CellType::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                let raw = raw.trim();
                let value = match cell_type {
                    CellType::Shared => raw
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned()),
                    _ => Some(raw.to_string()),
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" => {
                    if !row.is_empty() {
                        out.push_str(&row.join("\t"));
                        out.push('\n');
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    Ok(out)
}
