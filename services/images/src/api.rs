use crate::config::ApiConfig;
use crate::error::ImageError;
use crate::metadata_store::{ImageRecord, ImageRecordStore};
use crate::service::{DiscoveryImages, ImageOrder};
use crate::upload::ImagePayload;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub images: Arc<DiscoveryImages>,
    pub records: Arc<dyn ImageRecordStore>,
    pub signed_url_ttl: Duration,
}

/// One image in an upload request
#[derive(Debug, Deserialize)]
pub struct UploadImage {
    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
    pub content_type: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub exif: Option<serde_json::Value>,
}

impl From<UploadImage> for ImagePayload {
    fn from(image: UploadImage) -> Self {
        ImagePayload {
            bytes: image.data.into(),
            content_type: image.content_type,
            file_name: image.file_name,
            exif: image.exif,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub images: Vec<UploadImage>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub images: Vec<ImageOrder>,
}

/// Image as returned to clients. `url` is absent and `error` set when the
/// image could not be resolved.
#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub id: Uuid,
    pub order: Option<i32>,
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub exif: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ImageResponse {
    fn from_record(record: ImageRecord, ttl: Duration) -> Self {
        let expires_at = record.image_url.as_ref().and_then(|_| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| record.url_reference_time() + ttl)
        });
        Self {
            id: record.id,
            order: Some(record.image_order),
            url: record.image_url,
            expires_at,
            exif: record.exif_data,
            created_at: Some(record.created_at),
            error: None,
        }
    }

    fn failed(id: Uuid, error: &ImageError) -> Self {
        Self {
            id,
            order: None,
            url: None,
            expires_at: None,
            exif: None,
            created_at: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub discovery_id: Uuid,
    pub images: Vec<ImageResponse>,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct RemoveAllResponse {
    pub discovery_id: Uuid,
    pub removed: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn status_for(err: &ImageError) -> StatusCode {
    match err {
        ImageError::InvalidImage { .. } | ImageError::InvalidOrder { .. } => StatusCode::BAD_REQUEST,
        ImageError::ImageNotFound(_) | ImageError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
        ImageError::OrderExhausted { .. } => StatusCode::CONFLICT,
        ImageError::StorageUnavailable(_) => StatusCode::BAD_GATEWAY,
        ImageError::MetadataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ImageError::MetadataWriteFailed(_) | ImageError::PartialBatchFailure { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: ImageError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, code = err.code(), "Request failed");
    } else {
        warn!(error = %err, code = err.code(), "Request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
}

/// Malformed bodies get the same `{ error, code }` shape as domain errors
fn rejected_body(rejection: JsonRejection) -> ApiError {
    let status = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    let error = rejection.body_text();
    warn!(error = %error, status = %status, "Request body rejected");
    (
        status,
        Json(ErrorResponse {
            error,
            code: "INVALID_REQUEST".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
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

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/v1/users/:owner_id/discoveries/:discovery_id/images",
            post(upload_images),
        )
        .route(
            "/api/v1/discoveries/:discovery_id/images",
            get(list_images).delete(remove_all_images),
        )
        .route(
            "/api/v1/discoveries/:discovery_id/images/order",
            put(reorder_images),
        )
        .route("/api/v1/images/:image_id", delete(remove_image))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "image-service"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state, body))]
async fn upload_images(
    State(state): State<AppState>,
    Path((owner_id, discovery_id)): Path<(Uuid, Uuid)>,
    body: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ImageListResponse>), ApiError> {
    let Json(request) = body.map_err(rejected_body)?;
    let payloads = request.images.into_iter().map(ImagePayload::from).collect();

    let records = state
        .images
        .create_with_images(owner_id, discovery_id, payloads)
        .await
        .map_err(api_error)?;

    let images = records
        .into_iter()
        .map(|r| ImageResponse::from_record(r, state.signed_url_ttl))
        .collect();

    Ok((
        StatusCode::CREATED,
        Json(ImageListResponse {
            discovery_id,
            images,
            failed: 0,
        }),
    ))
}

async fn list_images(
    State(state): State<AppState>,
    Path(discovery_id): Path<Uuid>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let outcome = state
        .images
        .list_with_images(discovery_id)
        .await
        .map_err(api_error)?;

    let failed = outcome.failures().count();
    let images = outcome
        .into_iter()
        .map(|item| match item {
            Ok(record) => ImageResponse::from_record(record, state.signed_url_ttl),
            Err(failure) => ImageResponse::failed(failure.id, &failure.error),
        })
        .collect();

    Ok(Json(ImageListResponse {
        discovery_id,
        images,
        failed,
    }))
}

async fn reorder_images(
    State(state): State<AppState>,
    Path(discovery_id): Path<Uuid>,
    body: Result<Json<ReorderRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = body.map_err(rejected_body)?;
    state
        .images
        .reorder_images(discovery_id, request.images)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.images.remove_image(image_id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_all_images(
    State(state): State<AppState>,
    Path(discovery_id): Path<Uuid>,
) -> Result<Json<RemoveAllResponse>, ApiError> {
    let removed = state
        .images
        .delete_all_images(discovery_id)
        .await
        .map_err(api_error)?;
    Ok(Json(RemoveAllResponse {
        discovery_id,
        removed,
    }))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
