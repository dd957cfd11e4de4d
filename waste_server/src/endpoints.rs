//! Endpoints of HTTP server.
//!
use std::convert::Infallible;

use anyhow::Error;
use axum::{
    body::{Bytes, StreamBody},
    extract::{
        multipart::{MultipartError, MultipartRejection}, DefaultBodyLimit, Multipart,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use common::protocol::{Classification, ErrorBody};
use futures::StreamExt;

use crate::{
    meter::METER, state::AppState, stream::spawn_frame_stream, upload::classify_upload,
    MJPEG_CONTENT_TYPE,
};

/// Multipart field carrying the uploaded image.
pub const FILE_FIELD: &str = "file";

/// Build the HTTP router.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/healthcheck", get(healthcheck))
        .route("/classifywaste", post(classify_waste))
        .route("/live_video", get(live_video))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(state))
}

/// Errors returned to clients as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Rejected(StatusCode, String),
    Internal(Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => {
                log::warn!("Rejected request: {message}");
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::Rejected(status, message) => {
                log::warn!("Rejected upload with {status}: {message}");
                (status, message)
            }
            ApiError::Internal(e) => {
                log::error!("Request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        };

        (status, Json(ErrorBody::new(message))).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        // Carries 413 when the upload exceeds the body limit
        let status = e.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::Rejected(status, "upload is too large".into())
        } else {
            ApiError::Rejected(status, format!("malformed upload: {}", e.body_text()))
        }
    }
}

/// Home page.
pub async fn home() -> Html<&'static str> {
    Html(include_str!("../static/home.html"))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Classify an image uploaded as multipart field `file`.
pub async fn classify_waste(
    Extension(state): Extension<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Classification>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let (filename, data) = read_file_field(&mut multipart).await?;
    log::info!("Classifying upload {:?} ({} bytes)", &filename, data.len());

    match classify_upload(&state.uploads, state.classifier.clone(), &filename, &data).await {
        Ok(classification) => {
            METER.tick_classified();
            Ok(Json(classification))
        }
        Err(e) => {
            METER.tick_failed();
            Err(ApiError::Internal(e))
        }
    }
}

/// Find the file field and read its name and content.
async fn read_file_field(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_owned();
        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(ApiError::BadRequest("uploaded file is empty".into()));
        }

        return Ok((filename, data));
    }

    Err(ApiError::BadRequest(format!(
        "missing multipart field {FILE_FIELD:?}"
    )))
}

/// Live webcam feed with detection overlays.
pub async fn live_video(Extension(state): Extension<AppState>) -> impl IntoResponse {
    log::info!("Live video requested");

    let stream = spawn_frame_stream(
        state.camera.clone(),
        state.annotator.clone(),
        state.jpeg_quality,
    )
    .map(|chunk| {
        METER.tick_frame();
        Ok::<_, Infallible>(chunk)
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    (headers, body)
}
