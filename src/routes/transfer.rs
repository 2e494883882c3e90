//! The `/transfer/*` surface: token-authenticated entry points into the
//! transfer engine (C6), plus the progress WebSocket (C7).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures_util::StreamExt;
use serde_json::json;

use crate::error::AppError;
use crate::jobs::engine;
use crate::state::AppState;
use crate::token::{self, TransferClaims};
use crate::ws;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start", get(start_handler).post(start_handler))
        .route("/upload", post(upload_handler))
        .route("/repack", post(repack_handler))
        .route("/move", post(move_handler))
        .route("/ws/{job_id}", get(ws::ws_handler))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Json<serde_json::Value>, AppError> {
    let form = if request.method() == axum::http::Method::POST {
        read_form_best_effort(request).await
    } else {
        HashMap::new()
    };

    let raw_token = query
        .get("token")
        .or_else(|| form.get("token"))
        .ok_or(AppError::TokenMissing)?;

    let claims = decode(&state, raw_token)?;
    let meta = engine::start_download(state, &claims).await?;

    Ok(Json(json!({
        "job_id": meta.job_id,
        "status": meta.status.as_str(),
        "ws_url": format!("/transfer/ws/{}?token={}", meta.job_id, raw_token),
    })))
}

async fn read_form_best_effort(request: Request) -> HashMap<String, String> {
    let is_form = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if !is_form {
        return HashMap::new();
    }

    match axum::body::to_bytes(request.into_body(), 64 * 1024).await {
        Ok(bytes) => serde_urlencoded::from_bytes(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<serde_json::Value>, AppError> {
    reject_multipart(&headers)?;

    let raw_token = query
        .get("token")
        .cloned()
        .or_else(|| bearer_token(&headers))
        .ok_or(AppError::TokenMissing)?;
    let claims = decode(&state, &raw_token)?;

    let filename_hint = query
        .get("filename")
        .cloned()
        .or_else(|| headers.get("x-file-name").and_then(|v| v.to_str().ok()).map(|s| s.to_string()));

    let body = request.into_body().into_data_stream().map(|r| r.map_err(|e| e.to_string()));
    let meta = engine::run_upload(state, &claims, filename_hint, body).await?;

    Ok(Json(json!({
        "job_id": meta.job_id,
        "bytes": meta.bytes_transferred,
        "total": meta.total_bytes,
    })))
}

async fn repack_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize_static(&state, &form)?;

    let job_id = form.get("job_id").ok_or_else(|| AppError::BadRequest("job_id is required".into()))?;
    let format = form.get("format").map(String::as_str).unwrap_or("zip");
    let level: i64 = form.get("compression_level").and_then(|v| v.parse().ok()).unwrap_or(3);

    let meta = engine::repack_endpoint(&state, job_id, format, level).await?;

    Ok(Json(json!({
        "job_id": meta.job_id,
        "packed_bytes": meta.packed_bytes,
        "packed_path": meta.packed_path,
    })))
}

async fn move_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize_static(&state, &form)?;

    let job_id = form.get("job_id").ok_or_else(|| AppError::BadRequest("job_id is required".into()))?;
    let type_name = form.get("type").ok_or_else(|| AppError::BadRequest("type is required".into()))?;
    let path = form.get("path").ok_or_else(|| AppError::BadRequest("path is required".into()))?;

    let (final_path, final_bytes) = engine::move_job(&state, job_id, type_name, path).await?;

    Ok(Json(json!({
        "job_id": job_id,
        "final_path": final_path,
        "final_bytes": final_bytes,
    })))
}

/// `/transfer/upload` ingests the raw request body as the archive/image
/// payload (§4.6.2); multipart was an earlier revision's approach and is
/// explicitly rejected rather than silently accepted and misread.
fn reject_multipart(headers: &HeaderMap) -> Result<(), AppError> {
    let is_multipart = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false);

    if is_multipart {
        Err(AppError::UnsupportedMediaType("multipart uploads are not supported".into()))
    } else {
        Ok(())
    }
}

fn decode(state: &AppState, raw_token: &str) -> Result<TransferClaims, AppError> {
    token::decode_transfer_token(raw_token, token::AUD_STORAGE, state.config.transfer_jwt_secret.as_deref())
}

fn authorize_static(state: &AppState, form: &HashMap<String, String>) -> Result<(), AppError> {
    let presented = form.get("token").ok_or(AppError::TokenMissing)?;
    token::check_static_token(&state.config.static_tokens, "storage_manage_token", presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_content_type_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "multipart/form-data; boundary=----abc".parse().unwrap(),
        );
        assert!(matches!(reject_multipart(&headers), Err(AppError::UnsupportedMediaType(_))));
    }

    #[test]
    fn raw_binary_content_type_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/octet-stream".parse().unwrap());
        assert!(reject_multipart(&headers).is_ok());

        assert!(reject_multipart(&HeaderMap::new()).is_ok());
    }
}
