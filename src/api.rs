use crate::blob_store::{is_valid_blob_name, BlobStore, BlobStoreError};
use crate::config::{Config, IngestConfig};
use crate::ingest::{IngestError, Ingestor};
use crate::metadata_store::{MetadataStore, MetadataStoreError, Palette, Record};
use crate::rate_limit::{Admission, AdmissionGuard};
use crate::validator::UploadFile;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// Cache directive for served blobs; blobs are immutable once written
const BLOB_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub admission: Arc<AdmissionGuard>,
    /// Base address prepended to blob URLs; empty for relative URLs
    pub public_base_url: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Successful upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: Uuid,
}

/// Resolved tree response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeResponse {
    pub id: Uuid,
    pub colors: Palette,
    pub image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

fn bad_request(code: &str, message: impl Into<String>) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

fn not_found(code: &str, message: impl Into<String>) -> ApiError {
    error_response(StatusCode::NOT_FOUND, code, message)
}

/// Body limit for the upload route: the whole batch plus form overhead
fn upload_body_limit(config: &IngestConfig) -> usize {
    config.max_file_bytes * config.max_files + 64 * 1024
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    let cors = if config.http.cors_enabled {
        if config.http.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .http
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // The admission guard fronts the ingestion path only; retrieval
    // routes are never rate limited.
    let upload = Router::new()
        .route("/api/upload", post(upload_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ))
        .layer(DefaultBodyLimit::max(upload_body_limit(&config.ingest)));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/tree/:id", get(resolve_tree))
        .route("/api/image/:name", get(stream_blob))
        .merge(upload)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Client address from connection info; defaults to loopback when the
/// transport provides none (in-process tests)
fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let source = client_ip(&request);

    match state.admission.check(source) {
        Admission::Admitted => next.run(request).await,
        Admission::Rejected { retry_after_secs } => {
            metrics::counter!("ingest.requests.throttled").increment(1);
            warn!(source = %source, retry_after_secs, "Upload rejected by admission guard");

            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                format!("Too many uploads, retry in {retry_after_secs}s"),
            )
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "treehouse"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "metadata_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "metadata_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a multipart upload batch and return the new record id
#[instrument(skip(state, multipart))]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut files = Vec::new();
    let mut primary = None;
    let mut accent = None;
    let mut light = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request("MALFORMED_MULTIPART", e.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "primary" => {
                primary = Some(field.text().await.map_err(|e| {
                    bad_request("MALFORMED_MULTIPART", e.to_string())
                })?);
            }
            "accent" => {
                accent = Some(field.text().await.map_err(|e| {
                    bad_request("MALFORMED_MULTIPART", e.to_string())
                })?);
            }
            "light" => {
                light = Some(field.text().await.map_err(|e| {
                    bad_request("MALFORMED_MULTIPART", e.to_string())
                })?);
            }
            _ => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request("MALFORMED_MULTIPART", e.to_string()))?;
                files.push(UploadFile {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
        }
    }

    let palette = Palette {
        primary: primary.unwrap_or_default(),
        accent: accent.unwrap_or_default(),
        light: light.unwrap_or_default(),
    };

    let id = state
        .ingestor
        .ingest(files, palette)
        .await
        .map_err(ingest_error_response)?;

    Ok(Json(UploadResponse { id }))
}

fn ingest_error_response(err: IngestError) -> ApiError {
    match &err {
        IngestError::Validation(e) => bad_request("VALIDATION_FAILED", e.to_string()),
        IngestError::Transcode(e) => bad_request("TRANSCODE_FAILED", e.to_string()),
        IngestError::BlobStore(_)
        | IngestError::Metadata(_)
        | IngestError::Timeout(_)
        | IngestError::Internal(_) => {
            error!(error = %err, "Upload failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Upload failed",
            )
        }
    }
}

/// Canonical 8-4-4-4-12 hyphenated hexadecimal record id
fn is_canonical_record_id(id: &str) -> bool {
    id.len() == 36
        && id.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Resolve a record id to its palette and ordered blob URLs
#[instrument(skip(state))]
async fn resolve_tree(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TreeResponse>, ApiError> {
    // Shape check before any storage access
    if !is_canonical_record_id(&id) {
        return Err(bad_request(
            "MALFORMED_ID",
            format!("'{id}' is not a valid record id"),
        ));
    }
    let id = Uuid::parse_str(&id)
        .map_err(|_| bad_request("MALFORMED_ID", format!("'{id}' is not a valid record id")))?;

    match state.metadata_store.get(id).await {
        Ok(record) => Ok(Json(tree_response(record, &state.public_base_url))),
        Err(MetadataStoreError::NotFound(_)) => {
            Err(not_found("RECORD_NOT_FOUND", format!("No record for '{id}'")))
        }
        Err(e) => {
            error!(error = %e, "Failed to resolve record");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Failed to resolve record",
            ))
        }
    }
}

fn tree_response(record: Record, base_url: &str) -> TreeResponse {
    let image_urls = record
        .blob_names
        .iter()
        .map(|name| format!("{base_url}/api/image/{name}"))
        .collect();

    TreeResponse {
        id: record.id,
        colors: record.palette,
        image_urls,
        created_at: record.created_at,
    }
}

/// Serve one blob's bytes by name
#[instrument(skip(state))]
async fn stream_blob(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    // Traversal sequences are refused outright, before shape checks
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        warn!(name = %name, "Blob name rejected as traversal attempt");
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "FORBIDDEN_NAME",
            "Invalid blob name",
        ));
    }
    if !is_valid_blob_name(&name) {
        return Err(bad_request(
            "MALFORMED_NAME",
            format!("'{name}' is not a valid blob name"),
        ));
    }

    match state.blob_store.get(&name).await {
        Ok(bytes) => {
            metrics::counter!("retrieve.blobs.served").increment(1);
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "image/jpeg"),
                    (header::CACHE_CONTROL, BLOB_CACHE_CONTROL),
                ],
                bytes,
            )
                .into_response())
        }
        Err(BlobStoreError::NotFound(_)) => {
            Err(not_found("BLOB_NOT_FOUND", format!("No blob '{name}'")))
        }
        Err(e) => {
            error!(error = %e, "Failed to read blob");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Failed to read blob",
            ))
        }
    }
}
