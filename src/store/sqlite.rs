//! SQLite-backed [`MetadataStore`] and [`VectorStore`].
//!
//! Documents and chunks live in the `documents` and `chunks` tables (chunks
//! cascade-delete with their document). Vectors live in `chunk_vectors` as
//! little-endian `f32` BLOBs and are searched by brute-force cosine
//! similarity, which is adequate for a single-node knowledge base.
//!
//! Status transitions are single conditional `UPDATE`s; SQLite serializes
//! writers, so exactly one concurrent claim can see a row still `pending`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{Chunk, DocumentStatus, Finish, SourceDocument};

use super::{top_k, MetadataStore, VectorHit, VectorRecord, VectorStore};

/// Bound parameters per `IN (...)` query, under SQLite's variable limit.
const IDS_PER_QUERY: usize = 500;

const DOCUMENT_COLUMNS: &str = "id, original_filename, extension, content_type, size, object_key, \
     status, error_message, number_of_chunks, encoding, diagnostics_json, created_at, updated_at, \
     processed_at";

const CHUNK_COLUMNS: &str = "id, document_id, chunk_index, start_offset, char_len, text, hash";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn transition(&self, id: &str, from: &[DocumentStatus], to: DocumentStatus) -> Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE documents SET status = ");
        qb.push_bind(to.as_str());
        qb.push(", updated_at = ");
        qb.push_bind(chrono::Utc::now().timestamp());
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.push(" AND status IN (");
        let mut sep = qb.separated(", ");
        for status in from {
            sep.push_bind(status.as_str());
        }
        sep.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

fn row_to_document(row: &SqliteRow) -> Result<SourceDocument> {
    let status: String = row.get("status");
    let diagnostics_json: String = row.get("diagnostics_json");
    let diagnostics: Vec<String> =
        serde_json::from_str(&diagnostics_json).context("corrupt diagnostics_json column")?;

    Ok(SourceDocument {
        id: row.get("id"),
        original_filename: row.get("original_filename"),
        extension: row.get("extension"),
        content_type: row.get("content_type"),
        size: row.get("size"),
        object_key: row.get("object_key"),
        status: status.parse()?,
        error_message: row.get("error_message"),
        number_of_chunks: row.get("number_of_chunks"),
        encoding: row.get("encoding"),
        diagnostics,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get("processed_at"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        start_offset: row.get("start_offset"),
        char_len: row.get("char_len"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn insert_document(&self, doc: &SourceDocument) -> Result<()> {
        let diagnostics = serde_json::to_string(&doc.diagnostics)?;
        sqlx::query(&format!(
            "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.id)
        .bind(&doc.original_filename)
        .bind(&doc.extension)
        .bind(&doc.content_type)
        .bind(doc.size)
        .bind(&doc.object_key)
        .bind(doc.status.as_str())
        .bind(&doc.error_message)
        .bind(doc.number_of_chunks)
        .bind(&doc.encoding)
        .bind(diagnostics)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .bind(doc.processed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert document {}", doc.id))?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(
        &self,
        limit: i64,
        offset: i64,
        newest_first: bool,
    ) -> Result<Vec<SourceDocument>> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY created_at {order}, id {order} LIMIT ? OFFSET ?",
            DOCUMENT_COLUMNS
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn claim_document(&self, id: &str) -> Result<bool> {
        self.transition(id, &[DocumentStatus::Pending], DocumentStatus::Processing)
            .await
    }

    async fn requeue_document(&self, id: &str) -> Result<bool> {
        self.transition(
            id,
            &[DocumentStatus::Failed, DocumentStatus::Completed],
            DocumentStatus::Pending,
        )
        .await
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
        .await
    }

    async fn reset_stale(&self, id: &str) -> Result<bool> {
        self.transition(id, &[DocumentStatus::Processing], DocumentStatus::Pending)
            .await
    }

    async fn finish_document(&self, id: &str, finish: &Finish) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let diagnostics = serde_json::to_string(&finish.diagnostics)?;
        let result = sqlx::query(
            "UPDATE documents SET status = ?, error_message = ?, number_of_chunks = ?, \
             encoding = ?, diagnostics_json = ?, updated_at = ?, processed_at = ? WHERE id = ?",
        )
        .bind(finish.status.as_str())
        .bind(&finish.error_message)
        .bind(finish.number_of_chunks)
        .bind(&finish.encoding)
        .bind(diagnostics)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("document {} not found", id);
        }
        Ok(())
    }

    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                CHUNK_COLUMNS
            ))
            .bind(&chunk.id)
            .bind(doc_id)
            .bind(chunk.chunk_index)
            .bind(chunk.start_offset)
            .bind(chunk.char_len)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(ids.len());
        for batch in ids.chunks(IDS_PER_QUERY) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM chunks WHERE id IN (",
                CHUNK_COLUMNS
            ));
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id.as_str());
            }
            sep.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await?;
            chunks.extend(rows.iter().map(row_to_chunk));
        }
        Ok(chunks)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, filename, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    filename = excluded.filename,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&r.chunk_id)
            .bind(&r.document_id)
            .bind(r.chunk_index)
            .bind(&r.filename)
            .bind(r.vector.len() as i64)
            .bind(vec_to_blob(&r.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query("SELECT chunk_id, document_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                VectorHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkParams};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("data/kb.sqlite"))
            .await
            .unwrap();
        (dir, store)
    }

    fn doc(id: &str) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            original_filename: "notes.md".to_string(),
            extension: "md".to_string(),
            content_type: "text/markdown".to_string(),
            size: 42,
            object_key: format!("{}/notes.md", id),
            status: DocumentStatus::Pending,
            error_message: None,
            number_of_chunks: None,
            encoding: None,
            diagnostics: Vec::new(),
            created_at: 100,
            updated_at: 100,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn document_round_trip_and_transitions() {
        let (_dir, store) = store().await;
        store.insert_document(&doc("d1")).await.unwrap();

        assert!(store.claim_document("d1").await.unwrap());
        assert!(!store.claim_document("d1").await.unwrap());

        let finish = Finish::completed(3, Some("GBK".into()), vec!["note".into()]);
        store.finish_document("d1", &finish).await.unwrap();

        let d = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(d.status, DocumentStatus::Completed);
        assert_eq!(d.number_of_chunks, Some(3));
        assert_eq!(d.encoding.as_deref(), Some("GBK"));
        assert_eq!(d.diagnostics, vec!["note".to_string()]);
        assert!(d.processed_at.is_some());

        assert!(store.requeue_document("d1").await.unwrap());
        assert!(!store.reset_stale("d1").await.unwrap());
        assert!(store.get_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_claim_excludes_ingestion() {
        let (_dir, store) = store().await;
        store.insert_document(&doc("d1")).await.unwrap();

        assert!(store.claim_for_delete("d1").await.unwrap());
        assert!(!store.claim_document("d1").await.unwrap());
        assert!(!store.claim_for_delete("d1").await.unwrap());
        assert!(!store.claim_for_delete("nope").await.unwrap());

        store.reset_stale("d1").await.unwrap();
        store.finish_document("d1", &Finish::failed("x".into(), Vec::new())).await.unwrap();
        assert!(store.claim_for_delete("d1").await.unwrap());
    }

    #[tokio::test]
    async fn chunks_replace_and_cascade() {
        let (_dir, store) = store().await;
        store.insert_document(&doc("d1")).await.unwrap();
        let params = ChunkParams::new(20, 5).unwrap();

        let first = chunk_text("d1", &"x".repeat(100), &params);
        store.replace_chunks("d1", &first).await.unwrap();
        assert_eq!(store.get_chunks("d1").await.unwrap().len(), first.len());

        let second = chunk_text("d1", "tiny", &params);
        store.replace_chunks("d1", &second).await.unwrap();
        let stored = store.get_chunks("d1").await.unwrap();
        assert_eq!(stored, second);

        let by_id = store
            .get_chunks_by_ids(&[second[0].id.clone(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);

        assert!(MetadataStore::delete_document(&store, "d1").await.unwrap());
        assert!(store.get_chunks("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vectors_upsert_query_delete() {
        let (_dir, store) = store().await;
        let rec = |id: &str, doc: &str, v: Vec<f32>| VectorRecord {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            chunk_index: 0,
            filename: "a.txt".to_string(),
            vector: v,
        };
        store
            .upsert(&[rec("c1", "d1", vec![1.0, 0.0, 0.0]), rec("c2", "d2", vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();
        // Overwrite c2 so it now matches the query best.
        store
            .upsert(&[rec("c2", "d2", vec![0.0, 0.0, 1.0])])
            .await
            .unwrap();

        let hits = store.query(&[0.0, 0.1, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c2");
        assert!(hits[0].score > 0.9);

        VectorStore::delete_document(&store, "d2").await.unwrap();
        let hits = store.query(&[0.0, 0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn list_documents_pages() {
        let (_dir, store) = store().await;
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut d = doc(id);
            d.created_at = i as i64;
            store.insert_document(&d).await.unwrap();
        }
        let page = store.list_documents(2, 0, true).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);
        let rest = store.list_documents(2, 2, true).await.unwrap();
        assert_eq!(rest.len(), 1);
    }
}
