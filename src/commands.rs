//! CLI entry points for the `kb` binary.
//!
//! Each `run_*` function performs one command against an [`App`] and prints
//! human-readable output to stdout. Per-document ingestion outcomes are
//! printed, not returned as errors.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::app::App;
use crate::ingest::{DeleteResult, IngestReport, Outcome};
use crate::models::SourceDocument;

/// Upload files (directories are walked recursively) and ingest them.
pub async fn run_upload(app: &App, paths: &[PathBuf], no_ingest: bool) -> Result<()> {
    let files = collect_files(paths)?;
    if files.is_empty() {
        bail!("no files found under the given paths");
    }

    let mut ids = Vec::with_capacity(files.len());
    let mut rejected = 0usize;
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match app.ingestor.upload(&filename, &bytes).await {
            Ok(doc) => {
                println!("uploaded  {}  {}", doc.id, path.display());
                ids.push(doc.id);
            }
            Err(e) => {
                rejected += 1;
                println!("rejected  {}: {}", path.display(), e);
            }
        }
    }

    if !no_ingest && !ids.is_empty() {
        let reports = app.ingestor.ingest_many(&ids, app.config.ingest.workers).await;
        println!();
        print_reports(&reports);
    }

    if rejected > 0 {
        println!("{} file(s) rejected", rejected);
    }
    Ok(())
}

pub async fn run_ingest(app: &App, ids: &[String]) -> Result<()> {
    let reports = app.ingestor.ingest_many(ids, app.config.ingest.workers).await;
    print_reports(&reports);
    Ok(())
}

pub async fn run_reingest(app: &App, id: &str) -> Result<()> {
    let report = app.ingestor.reingest(id).await;
    print_reports(std::slice::from_ref(&report));
    Ok(())
}

pub async fn run_reset(app: &App, id: &str) -> Result<()> {
    if app.ingestor.reset_stale(id).await? {
        println!("{} reset to pending", id);
    } else {
        println!("{} is not processing; nothing to reset", id);
    }
    Ok(())
}

pub async fn run_list(app: &App, limit: i64, offset: i64) -> Result<()> {
    let docs = app.ingestor.metadata().list_documents(limit, offset, true).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in &docs {
        let chunks = doc
            .number_of_chunks
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<10}  {:>6} chunks  {}",
            doc.id, doc.status, chunks, doc.original_filename
        );
    }
    Ok(())
}

pub async fn run_get(app: &App, id: &str) -> Result<()> {
    let doc = require_document(app, id).await?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("filename:     {}", doc.original_filename);
    println!("content_type: {}", doc.content_type);
    println!("size:         {}", doc.size);
    println!("status:       {}", doc.status);
    if let Some(n) = doc.number_of_chunks {
        println!("chunks:       {}", n);
    }
    if let Some(ref enc) = doc.encoding {
        println!("encoding:     {}", enc);
    }
    if let Some(ref msg) = doc.error_message {
        println!("error:        {}", msg);
    }
    println!("created_at:   {}", format_ts_iso(doc.created_at));
    println!("updated_at:   {}", format_ts_iso(doc.updated_at));
    if let Some(ts) = doc.processed_at {
        println!("processed_at: {}", format_ts_iso(ts));
    }
    for note in &doc.diagnostics {
        println!("note:         {}", note);
    }
    Ok(())
}

pub async fn run_chunks(app: &App, id: &str) -> Result<()> {
    require_document(app, id).await?;
    let chunks = app.ingestor.metadata().get_chunks(id).await?;

    println!("--- Chunks ({}) ---", chunks.len());
    for chunk in &chunks {
        println!("[chunk {} @ {}]", chunk.chunk_index, chunk.start_offset);
        println!("{}", chunk.text);
        println!();
    }
    Ok(())
}

pub async fn run_delete(app: &App, id: &str) -> Result<()> {
    match app.ingestor.delete(id).await? {
        DeleteResult::Deleted => println!("{} deleted", id),
        DeleteResult::NotFound => bail!("document not found: {}", id),
        DeleteResult::Busy => bail!("document {} is being processed; try again later", id),
    }
    Ok(())
}

pub async fn run_query(app: &App, query: &str, top_k: Option<usize>, answer: bool) -> Result<()> {
    if answer {
        let answer = app.retriever.ask(query, top_k).await?;
        println!("{}", answer.answer);
        println!();
        println!("--- Sources ({}) ---", answer.sources.len());
        for (i, source) in answer.sources.iter().enumerate() {
            println!("[{}] {} #{}", i + 1, source.document_id, source.chunk_index);
        }
        return Ok(());
    }

    let chunks = app.retriever.retrieve(query, top_k).await?;
    if chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let rerank = chunk
            .rerank_score
            .map(|s| format!("  rerank: {:.3}", s))
            .unwrap_or_default();
        println!("{}. [{:.3}{}] {} #{}", i + 1, chunk.score, rerank, chunk.document_id, chunk.chunk_index);
        println!("    {}", preview(&chunk.text, 200));
        println!();
    }
    Ok(())
}

fn print_reports(reports: &[IngestReport]) {
    let mut completed = 0usize;
    let mut failed = 0usize;
    for report in reports {
        match &report.outcome {
            Outcome::Completed { chunks, notes, .. } => {
                completed += 1;
                println!("completed {}  {} chunks", report.document_id, chunks);
                for note in notes {
                    println!("          note: {}", note);
                }
            }
            Outcome::Failed { message, .. } => {
                failed += 1;
                println!("failed    {}  {}", report.document_id, message);
            }
            Outcome::Skipped { reason } => {
                println!("skipped   {}  {}", report.document_id, reason);
            }
        }
    }
    println!(
        "{} completed, {} failed, {} skipped",
        completed,
        failed,
        reports.len() - completed - failed
    );
}

async fn require_document(app: &App, id: &str) -> Result<SourceDocument> {
    match app.ingestor.metadata().get_document(id).await? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {}", id),
    }
}

/// Regular files under `paths`, in walk order with hidden entries skipped.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in paths {
        if !root.exists() {
            bail!("path does not exist: {}", root.display());
        }
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
        {
            let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut)
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
