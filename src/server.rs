//! HTTP upload surface.
//!
//! Thin JSON API over [`Ingestor`](crate::ingest::Ingestor) and
//! [`Retriever`](crate::query::Retriever). Uploads return as soon as the
//! bytes are stored; ingestion runs on a background task and callers poll
//! `GET /documents/{id}` for the terminal status.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Multipart upload (field `file`), 201 + pending document |
//! | `GET`  | `/documents` | List documents (`limit`, `offset`, `order=asc\|desc`) |
//! | `GET`  | `/documents/{id}` | Document with status and error message |
//! | `GET`  | `/documents/{id}/chunks` | Chunks in ordinal order |
//! | `GET`  | `/documents/{id}/download` | Original bytes |
//! | `DELETE` | `/documents/{id}` | Delete document, chunks, vectors and bytes |
//! | `POST` | `/documents/{id}/ingest` | Re-run ingestion, returns the report |
//! | `POST` | `/documents/{id}/reset` | Reset a stale `processing` status |
//! | `POST` | `/query/retrieve-chunks` | `{query, top_k}` → ranked chunks |
//! | `POST` | `/query/ask` | `{query, top_k}` → answer with sources |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::App;
use crate::error::UploadError;
use crate::ingest::{DeleteResult, IngestReport};
use crate::models::{Chunk, SourceDocument};
use crate::query::Answer;

/// Multipart framing allowance on top of the configured file size limit.
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

/// Build the router with all routes and layers.
pub fn router(app: App) -> Router {
    let body_limit = usize::try_from(app.config.extract.max_file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_HEADROOM);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_upload).get(handle_list))
        .route("/documents/{id}", get(handle_get).delete(handle_delete))
        .route("/documents/{id}/chunks", get(handle_chunks))
        .route("/documents/{id}/download", get(handle_download))
        .route("/documents/{id}/ingest", post(handle_ingest))
        .route("/documents/{id}/reset", post(handle_reset))
        .route("/query/retrieve-chunks", post(handle_retrieve))
        .route("/query/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("Knowledge base listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

/// Validation and configuration problems with a query are the caller's to fix.
fn classify_query_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("must not be empty")
        || msg.contains("must be >=")
        || msg.contains("disabled")
        || msg.contains("requires an embedding provider")
    {
        bad_request(msg)
    } else {
        internal(err)
    }
}

async fn load_document(app: &App, id: &str) -> Result<SourceDocument, AppError> {
    app.ingestor
        .metadata()
        .get_document(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

// ============ Documents ============

async fn handle_upload(
    State(app): State<App>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SourceDocument>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;

        let doc = app
            .ingestor
            .upload(&filename, &bytes)
            .await
            .map_err(|e| match e {
                UploadError::Store(inner) => internal(inner),
                other => bad_request(other.to_string()),
            })?;

        let ingestor = app.ingestor.clone();
        let id = doc.id.clone();
        tokio::spawn(async move {
            ingestor.ingest(&id).await;
        });

        return Ok((StatusCode::CREATED, Json(doc)));
    }
    Err(bad_request("multipart field 'file' is required"))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
    order: Option<String>,
}

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<SourceDocument>,
}

async fn handle_list(
    State(app): State<App>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, AppError> {
    let newest_first = match params.order.as_deref() {
        None | Some("desc") => true,
        Some("asc") => false,
        Some(other) => return Err(bad_request(format!("order must be asc or desc, got '{}'", other))),
    };
    let documents = app
        .ingestor
        .metadata()
        .list_documents(params.limit.unwrap_or(50), params.offset.unwrap_or(0), newest_first)
        .await
        .map_err(internal)?;
    Ok(Json(ListResponse { documents }))
}

async fn handle_get(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<SourceDocument>, AppError> {
    Ok(Json(load_document(&app, &id).await?))
}

#[derive(Serialize)]
struct ChunksResponse {
    document_id: String,
    chunks: Vec<Chunk>,
}

async fn handle_chunks(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<ChunksResponse>, AppError> {
    load_document(&app, &id).await?;
    let chunks = app
        .ingestor
        .metadata()
        .get_chunks(&id)
        .await
        .map_err(internal)?;
    Ok(Json(ChunksResponse {
        document_id: id,
        chunks,
    }))
}

async fn handle_download(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (doc, bytes) = app
        .ingestor
        .original(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        doc.original_filename.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, doc.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn handle_delete(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    match app.ingestor.delete(&id).await.map_err(internal)? {
        DeleteResult::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteResult::NotFound => Err(not_found(format!("document not found: {}", id))),
        DeleteResult::Busy => Err(conflict("document is being processed")),
    }
}

async fn handle_ingest(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<IngestReport>, AppError> {
    load_document(&app, &id).await?;
    Ok(Json(app.ingestor.reingest(&id).await))
}

#[derive(Serialize)]
struct ResetResponse {
    document_id: String,
    reset: bool,
}

async fn handle_reset(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<ResetResponse>, AppError> {
    load_document(&app, &id).await?;
    if !app.ingestor.reset_stale(&id).await.map_err(internal)? {
        return Err(conflict("document is not processing"));
    }
    Ok(Json(ResetResponse {
        document_id: id,
        reset: true,
    }))
}

// ============ Query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct RetrieveResponse {
    query: String,
    chunks: Vec<crate::models::RetrievedChunk>,
}

async fn handle_retrieve(
    State(app): State<App>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let chunks = app
        .retriever
        .retrieve(&req.query, req.top_k)
        .await
        .map_err(classify_query_error)?;
    Ok(Json(RetrieveResponse {
        query: req.query,
        chunks,
    }))
}

async fn handle_ask(
    State(app): State<App>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, AppError> {
    let answer = app
        .retriever
        .ask(&req.query, req.top_k)
        .await
        .map_err(classify_query_error)?;
    Ok(Json(answer))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
