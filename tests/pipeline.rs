//! End-to-end ingestion and retrieval over the in-memory stores.
//!
//! A deterministic hashing embedder stands in for a real model, so these
//! tests need no network and no database.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use knowledge_harness::chunk::{reassemble, ChunkParams};
use knowledge_harness::config::RetrievalConfig;
use knowledge_harness::embedding::{DisabledProvider, EmbeddingProvider};
use knowledge_harness::encoding::EncodingResolver;
use knowledge_harness::error::UploadError;
use knowledge_harness::extract::{DocumentParser, Extractor, FileKind, LocalParser};
use knowledge_harness::generate::Generator;
use knowledge_harness::ingest::{DeleteResult, Ingestor, Outcome};
use knowledge_harness::models::{Chunk, DocumentStatus, Finish, SourceDocument};
use knowledge_harness::query::{Retriever, NO_CONTEXT_ANSWER};
use knowledge_harness::store::{InMemoryStore, MemoryObjectStore, MetadataStore, ObjectStore};

const DIMS: usize = 32;

/// Bag-of-words vectors: each lowercase word bumps one hashed dimension.
struct HashEmbedder {
    calls: AtomicUsize,
}

impl HashEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

fn hash_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let h = word
            .to_lowercase()
            .bytes()
            .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        v[(h as usize) % DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("model server unavailable")
    }
}

/// Echoes the prompt so tests can inspect what the generator saw.
struct EchoGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(prompt.to_string())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    objects: Arc<MemoryObjectStore>,
    ingestor: Ingestor,
}

fn harness_with(embedder: Arc<dyn EmbeddingProvider>, size: usize, overlap: usize) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let extractor = Extractor::new(EncodingResolver::default(), Duration::from_secs(60))
        .with_local(LocalParser::default());
    let ingestor = Ingestor::new(
        store.clone(),
        store.clone(),
        objects.clone(),
        Arc::new(extractor),
        embedder,
        ChunkParams::new(size, overlap).unwrap(),
    )
    .with_embed_batch_size(2)
    .with_max_file_bytes(1024 * 1024);
    Harness {
        store,
        objects,
        ingestor,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(HashEmbedder::new()), 40, 10)
}

fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

#[tokio::test]
async fn text_upload_is_chunked_embedded_and_completed() {
    let h = harness();
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
    let doc = h.ingestor.upload("fox.txt", text.as_bytes()).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert_eq!(doc.extension, "txt");
    assert!(doc.object_key.ends_with("/fox.txt"));
    assert!(h.objects.contains(&doc.object_key));

    let report = h.ingestor.ingest(&doc.id).await;
    let Outcome::Completed { chunks, encoding, .. } = &report.outcome else {
        panic!("expected completed, got {:?}", report.outcome);
    };
    assert!(*chunks > 1);
    assert_eq!(encoding.as_deref(), Some("UTF-8"));

    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Completed);
    assert_eq!(stored.number_of_chunks, Some(*chunks as i64));
    assert!(stored.error_message.is_none());
    assert!(stored.processed_at.is_some());

    let stored_chunks = h.store.get_chunks(&doc.id).await.unwrap();
    assert_eq!(stored_chunks.len(), *chunks);
    assert_eq!(reassemble(&stored_chunks), text.trim());
    assert_eq!(h.store.vector_count(), *chunks);
}

#[tokio::test]
async fn short_text_yields_single_chunk() {
    let h = harness();
    let doc = h.ingestor.upload("short.md", b"# Title\n\nbody").await.unwrap();
    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(report.outcome, Outcome::Completed { chunks: 1, .. }));
    let chunks = h.store.get_chunks(&doc.id).await.unwrap();
    assert_eq!(chunks[0].text, "# Title\n\nbody");
}

#[tokio::test]
async fn gbk_text_is_decoded_and_recorded() {
    let h = harness();
    let (bytes, _, _) = encoding_rs::GBK.encode("知识库文档测试，这份简体中文文件会被正确读取。");
    let doc = h.ingestor.upload("中文.txt", &bytes).await.unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(report.is_completed(), "{:?}", report.outcome);

    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.encoding.as_deref(), Some("GBK"));
    let chunks = h.store.get_chunks(&doc.id).await.unwrap();
    assert_eq!(
        reassemble(&chunks),
        "知识库文档测试，这份简体中文文件会被正确读取。"
    );
}

#[tokio::test]
async fn docx_goes_through_local_parser() {
    let h = harness();
    let bytes = docx(&["Quarterly revenue grew.", "Costs were flat."]);
    let doc = h.ingestor.upload("report.docx", &bytes).await.unwrap();
    assert_eq!(
        doc.content_type,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(report.is_completed(), "{:?}", report.outcome);
    let text = reassemble(&h.store.get_chunks(&doc.id).await.unwrap());
    assert_eq!(text, "Quarterly revenue grew.\nCosts were flat.");
}

#[tokio::test]
async fn unsupported_extension_is_accepted_then_fails() {
    let h = harness();
    let doc = h.ingestor.upload("archive.xyz", b"whatever").await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "UnsupportedFormat"
    ));

    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Failed);
    let msg = stored.error_message.unwrap();
    assert!(msg.starts_with("UnsupportedFormat: "), "{}", msg);
    assert_eq!(stored.number_of_chunks, Some(0));
    assert!(h.store.get_chunks(&doc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn whitespace_only_document_fails_empty() {
    let h = harness();
    let doc = h.ingestor.upload("blank.txt", b" \n\n\t \r\n").await.unwrap();
    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "EmptyDocument"
    ));
}

#[tokio::test]
async fn missing_object_fails_with_storage_read() {
    let h = harness();
    let doc = h.ingestor.upload("gone.txt", b"some text").await.unwrap();
    h.objects.delete(&doc.object_key).await.unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "StorageReadFailed"
    ));
    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert!(stored
        .error_message
        .unwrap()
        .starts_with("StorageReadFailed: "));
}

#[tokio::test]
async fn embedding_failure_leaves_no_chunks_or_vectors() {
    let h = harness_with(Arc::new(BrokenEmbedder), 40, 10);
    let doc = h.ingestor.upload("notes.txt", b"alpha beta gamma").await.unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "EmbeddingFailed"
    ));
    assert!(h.store.get_chunks(&doc.id).await.unwrap().is_empty());
    assert_eq!(h.store.vector_count(), 0);
}

#[tokio::test]
async fn disabled_embedding_still_stores_chunks() {
    let h = harness_with(Arc::new(DisabledProvider), 40, 10);
    let doc = h.ingestor.upload("notes.txt", b"alpha beta gamma").await.unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    let Outcome::Completed { chunks, notes, .. } = &report.outcome else {
        panic!("expected completed, got {:?}", report.outcome);
    };
    assert_eq!(*chunks, 1);
    assert!(notes.iter().any(|n| n.contains("embedding disabled")));
    assert_eq!(h.store.vector_count(), 0);
}

#[tokio::test]
async fn second_ingest_of_completed_document_is_skipped() {
    let h = harness();
    let doc = h.ingestor.upload("a.txt", b"hello world").await.unwrap();
    assert!(h.ingestor.ingest(&doc.id).await.is_completed());

    let again = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(again.outcome, Outcome::Skipped { .. }));

    let missing = h.ingestor.ingest("no-such-id").await;
    assert!(matches!(
        &missing.outcome,
        Outcome::Skipped { reason } if reason.contains("not found")
    ));
}

#[tokio::test]
async fn processing_document_is_not_claimed_twice() {
    let h = harness();
    let doc = h.ingestor.upload("a.txt", b"hello world").await.unwrap();
    assert!(h.store.claim_document(&doc.id).await.unwrap());

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Skipped { reason } if reason.contains("already being processed")
    ));

    assert!(h.ingestor.reset_stale(&doc.id).await.unwrap());
    assert!(h.ingestor.ingest(&doc.id).await.is_completed());
}

#[tokio::test]
async fn reingest_replaces_chunks_and_vectors() {
    let h = harness();
    let text = "one two three four five six seven eight nine ten ".repeat(4);
    let doc = h.ingestor.upload("count.txt", text.as_bytes()).await.unwrap();
    let first = h.ingestor.ingest(&doc.id).await;
    let Outcome::Completed { chunks: first_count, .. } = first.outcome else {
        panic!("first run should complete");
    };
    let first_ids: Vec<String> = h
        .store
        .get_chunks(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();

    let second = h.ingestor.reingest(&doc.id).await;
    let Outcome::Completed { chunks: second_count, .. } = second.outcome else {
        panic!("reingest should complete");
    };
    assert_eq!(first_count, second_count);

    let second_ids: Vec<String> = h
        .store
        .get_chunks(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(h.store.vector_count(), second_count);
}

#[tokio::test]
async fn failed_document_can_be_reingested() {
    let h = harness();
    let doc = h.ingestor.upload("a.txt", b"recoverable").await.unwrap();
    let key = doc.object_key.clone();
    h.objects.delete(&key).await.unwrap();
    assert!(matches!(
        h.ingestor.ingest(&doc.id).await.outcome,
        Outcome::Failed { .. }
    ));

    h.objects.put(&key, b"recoverable").await.unwrap();
    let report = h.ingestor.reingest(&doc.id).await;
    assert!(report.is_completed(), "{:?}", report.outcome);
    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn ingest_many_isolates_failures_and_keeps_order() {
    let h = harness();
    let good = h.ingestor.upload("good.txt", b"good text").await.unwrap();
    let bad = h.ingestor.upload("bad.xyz", b"bad").await.unwrap();
    let also_good = h.ingestor.upload("fine.md", b"fine text").await.unwrap();

    let ids = vec![good.id.clone(), bad.id.clone(), also_good.id.clone()];
    let reports = h.ingestor.ingest_many(&ids, 2).await;

    assert_eq!(reports.len(), 3);
    let got: Vec<&str> = reports.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(got, ids.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(reports[0].is_completed());
    assert!(matches!(reports[1].outcome, Outcome::Failed { .. }));
    assert!(reports[2].is_completed());
}

#[tokio::test]
async fn concurrent_ingest_of_same_document_runs_once() {
    let embedder = Arc::new(HashEmbedder::new());
    let h = harness_with(embedder.clone(), 1000, 0);
    let doc = h.ingestor.upload("a.txt", b"single chunk").await.unwrap();

    let ids = vec![doc.id.clone(); 4];
    let reports = h.ingestor.ingest_many(&ids, 4).await;
    let completed = reports.iter().filter(|r| r.is_completed()).count();
    let skipped = reports
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(skipped, 3);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upload_rejects_oversize_and_nameless_files() {
    let h = harness();
    let big = vec![b'a'; 1024 * 1024 + 1];
    assert!(matches!(
        h.ingestor.upload("big.txt", &big).await,
        Err(UploadError::TooLarge { .. })
    ));
    assert!(matches!(
        h.ingestor.upload("", b"x").await,
        Err(UploadError::MissingFilename)
    ));
}

#[tokio::test]
async fn delete_removes_everything_and_refuses_busy() {
    let h = harness();
    let doc = h.ingestor.upload("a.txt", b"to be deleted").await.unwrap();
    assert!(h.ingestor.ingest(&doc.id).await.is_completed());

    assert_eq!(h.ingestor.delete(&doc.id).await.unwrap(), DeleteResult::Deleted);
    assert!(h.store.get_document(&doc.id).await.unwrap().is_none());
    assert!(h.store.get_chunks(&doc.id).await.unwrap().is_empty());
    assert!(!h.objects.contains(&doc.object_key));
    assert_eq!(h.store.vector_count(), 0);
    assert_eq!(h.ingestor.delete(&doc.id).await.unwrap(), DeleteResult::NotFound);

    let busy = h.ingestor.upload("b.txt", b"busy").await.unwrap();
    h.store.claim_document(&busy.id).await.unwrap();
    assert_eq!(h.ingestor.delete(&busy.id).await.unwrap(), DeleteResult::Busy);
}

#[tokio::test]
async fn original_bytes_are_returned() {
    let h = harness();
    let doc = h.ingestor.upload("raw.txt", b"raw bytes").await.unwrap();
    let (found, bytes) = h.ingestor.original(&doc.id).await.unwrap().unwrap();
    assert_eq!(found.id, doc.id);
    assert_eq!(bytes, b"raw bytes");
    assert!(h.ingestor.original("missing").await.unwrap().is_none());
}

fn retriever(h: &Harness, generator: Option<Arc<dyn Generator>>) -> Retriever {
    Retriever::new(
        h.store.clone(),
        h.store.clone(),
        Arc::new(HashEmbedder::new()),
        RetrievalConfig {
            initial_top_k: 10,
            final_top_k: 2,
        },
    )
    .with_generator(generator, "Answer briefly.")
}

#[tokio::test]
async fn retrieve_ranks_matching_chunk_first() {
    let h = harness_with(Arc::new(HashEmbedder::new()), 1000, 0);
    for (name, text) in [
        ("cats.txt", "cats purr and sleep all day"),
        ("rust.txt", "rust borrow checker ownership lifetimes"),
        ("soup.txt", "tomato soup recipe with basil"),
    ] {
        let doc = h.ingestor.upload(name, text.as_bytes()).await.unwrap();
        assert!(h.ingestor.ingest(&doc.id).await.is_completed());
    }

    let r = retriever(&h, None);
    let results = r.retrieve("ownership and the borrow checker", None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].text.contains("borrow checker"));
    assert!(results[0].score >= results[1].score);

    let one = r.retrieve("tomato basil", Some(1)).await.unwrap();
    assert_eq!(one.len(), 1);
    assert!(one[0].text.contains("tomato"));

    assert!(r.retrieve("   ", None).await.is_err());
}

#[tokio::test]
async fn ask_uses_context_and_short_circuits_without_hits() {
    let h = harness_with(Arc::new(HashEmbedder::new()), 1000, 0);
    let generator = Arc::new(EchoGenerator {
        calls: AtomicUsize::new(0),
    });
    let r = retriever(&h, Some(generator.clone()));

    let empty = r.ask("anything at all", None).await.unwrap();
    assert_eq!(empty.answer, NO_CONTEXT_ANSWER);
    assert!(empty.sources.is_empty());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

    let doc = h
        .ingestor
        .upload("sky.txt", b"the sky is blue on clear days")
        .await
        .unwrap();
    assert!(h.ingestor.ingest(&doc.id).await.is_completed());

    let answer = r.ask("what colour is the sky", None).await.unwrap();
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert!(answer.answer.contains("[1] the sky is blue on clear days"));
    assert!(answer.answer.contains("Question: what colour is the sky"));
    assert_eq!(answer.sources.len(), 1);
}

#[tokio::test]
async fn ask_without_generator_is_an_error() {
    let h = harness();
    let r = retriever(&h, None);
    let err = r.ask("question", None).await.unwrap_err();
    assert!(err.to_string().contains("disabled"));
}

/// Primary parser that is always down.
struct FailingParser;

#[async_trait]
impl DocumentParser for FailingParser {
    fn name(&self) -> &str {
        "remote"
    }
    async fn parse(&self, _bytes: &[u8], _kind: FileKind, _filename: &str) -> Result<String> {
        bail!("connection refused")
    }
}

fn harness_with_failing_primary() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let extractor = Extractor::new(EncodingResolver::default(), Duration::from_secs(60))
        .with_primary(Arc::new(FailingParser))
        .with_local(LocalParser::default());
    let ingestor = Ingestor::new(
        store.clone(),
        store.clone(),
        objects.clone(),
        Arc::new(extractor),
        Arc::new(HashEmbedder::new()),
        ChunkParams::new(40, 10).unwrap(),
    );
    Harness {
        store,
        objects,
        ingestor,
    }
}

#[tokio::test]
async fn primary_parser_failure_falls_back_and_completes() {
    let h = harness_with_failing_primary();
    let bytes = docx(&["Local parsing still works."]);
    let doc = h.ingestor.upload("fallback.docx", &bytes).await.unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    let Outcome::Completed { notes, .. } = &report.outcome else {
        panic!("expected completed, got {:?}", report.outcome);
    };
    assert!(
        notes
            .iter()
            .any(|n| n.starts_with("fell back to local parser: remote failed")),
        "{:?}",
        notes
    );

    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Completed);
    assert_eq!(&stored.diagnostics, notes);
    let text = reassemble(&h.store.get_chunks(&doc.id).await.unwrap());
    assert_eq!(text, "Local parsing still works.");
}

#[tokio::test]
async fn primary_and_local_failure_marks_extraction_failed() {
    let h = harness_with_failing_primary();
    let doc = h
        .ingestor
        .upload("corrupt.docx", b"this is not a zip archive")
        .await
        .unwrap();

    let report = h.ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "ExtractionFailed"
    ));

    let stored = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Failed);
    let msg = stored.error_message.unwrap();
    assert!(msg.starts_with("ExtractionFailed: "), "{}", msg);
    assert!(msg.contains("remote failed: connection refused"), "{}", msg);
    assert!(msg.contains("local parser failed"), "{}", msg);
    assert!(h.store.get_chunks(&doc.id).await.unwrap().is_empty());
}

/// Forwards to an [`InMemoryStore`], with switchable faults.
struct FaultyStore {
    inner: Arc<InMemoryStore>,
    fail_next_completion: AtomicBool,
    claim_during_delete: Mutex<Option<bool>>,
}

impl FaultyStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_next_completion: AtomicBool::new(false),
            claim_during_delete: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MetadataStore for FaultyStore {
    async fn insert_document(&self, doc: &SourceDocument) -> Result<()> {
        self.inner.insert_document(doc).await
    }
    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        self.inner.get_document(id).await
    }
    async fn list_documents(
        &self,
        limit: i64,
        offset: i64,
        newest_first: bool,
    ) -> Result<Vec<SourceDocument>> {
        self.inner.list_documents(limit, offset, newest_first).await
    }
    async fn claim_document(&self, id: &str) -> Result<bool> {
        self.inner.claim_document(id).await
    }
    async fn requeue_document(&self, id: &str) -> Result<bool> {
        self.inner.requeue_document(id).await
    }
    async fn claim_for_delete(&self, id: &str) -> Result<bool> {
        self.inner.claim_for_delete(id).await
    }
    async fn reset_stale(&self, id: &str) -> Result<bool> {
        self.inner.reset_stale(id).await
    }
    async fn finish_document(&self, id: &str, finish: &Finish) -> Result<()> {
        if finish.status == DocumentStatus::Completed
            && self.fail_next_completion.swap(false, Ordering::SeqCst)
        {
            bail!("disk full");
        }
        self.inner.finish_document(id, finish).await
    }
    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.inner.replace_chunks(doc_id, chunks).await
    }
    async fn delete_chunks(&self, doc_id: &str) -> Result<()> {
        // A worker claiming the document mid-delete.
        let claimed = self.inner.claim_document(doc_id).await?;
        *self.claim_during_delete.lock().unwrap() = Some(claimed);
        self.inner.delete_chunks(doc_id).await
    }
    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        self.inner.get_chunks(doc_id).await
    }
    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        self.inner.get_chunks_by_ids(ids).await
    }
    async fn delete_document(&self, id: &str) -> Result<bool> {
        self.inner.delete_document(id).await
    }
}

fn faulty_ingestor(faulty: Arc<FaultyStore>) -> Ingestor {
    let extractor = Extractor::new(EncodingResolver::default(), Duration::from_secs(60))
        .with_local(LocalParser::default());
    Ingestor::new(
        faulty.clone(),
        faulty.inner.clone(),
        Arc::new(MemoryObjectStore::new()),
        Arc::new(extractor),
        Arc::new(HashEmbedder::new()),
        ChunkParams::new(40, 10).unwrap(),
    )
}

#[tokio::test]
async fn failed_completion_write_marks_document_failed() {
    let inner = Arc::new(InMemoryStore::new());
    let faulty = Arc::new(FaultyStore::new(inner.clone()));
    let ingestor = faulty_ingestor(faulty.clone());

    let text = "Chunks are written before the status is. ".repeat(4);
    let doc = ingestor.upload("status.txt", text.as_bytes()).await.unwrap();
    faulty.fail_next_completion.store(true, Ordering::SeqCst);

    let report = ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Failed { kind, .. } if kind == "StorageWriteFailed"
    ));

    let stored = inner.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Failed);
    let msg = stored.error_message.unwrap();
    assert!(msg.starts_with("StorageWriteFailed: "), "{}", msg);
    assert!(msg.contains("disk full"), "{}", msg);
    assert!(inner.get_chunks(&doc.id).await.unwrap().is_empty());
    assert_eq!(inner.vector_count(), 0);

    // The document is terminal again, so it can be re-run.
    assert!(ingestor.reingest(&doc.id).await.is_completed());
}

#[tokio::test]
async fn delete_holds_the_document_against_concurrent_claims() {
    let inner = Arc::new(InMemoryStore::new());
    let faulty = Arc::new(FaultyStore::new(inner.clone()));
    let ingestor = faulty_ingestor(faulty.clone());

    let doc = ingestor.upload("pending.txt", b"never ingested").await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    assert_eq!(ingestor.delete(&doc.id).await.unwrap(), DeleteResult::Deleted);
    assert_eq!(*faulty.claim_during_delete.lock().unwrap(), Some(false));
    assert!(inner.get_document(&doc.id).await.unwrap().is_none());

    let report = ingestor.ingest(&doc.id).await;
    assert!(matches!(
        &report.outcome,
        Outcome::Skipped { reason } if reason == "document not found"
    ));
}
