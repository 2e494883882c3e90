use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The full reason-code taxonomy surfaced to both HTTP responses and
/// job `error_reason` / callback payloads.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("transfer token missing")]
    TokenMissing,

    #[error("transfer token invalid: {0}")]
    TokenInvalid(String),

    #[error("unsafe path: {0}")]
    UnsafePath(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("invalid download url: {0}")]
    InvalidDownloadUrl(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("size limit exceeded")]
    SizeLimit,

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("archive is encrypted")]
    EncryptedZip,

    #[error("not a valid image")]
    NotImage,

    #[error("image preparation failed: {0}")]
    ImagePrepareFailed(String),

    #[error("repack failed: {0}")]
    RepackFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// The stable reason code used in `meta.json` and callback payloads (§7).
    pub fn reason_code(&self) -> String {
        match self {
            AppError::UnsupportedMediaType(_) => "unsupported_media_type".into(),
            AppError::TokenMissing => "token_missing".into(),
            AppError::TokenInvalid(_) => "token_invalid".into(),
            AppError::UnsafePath(_) => "unsafe_path".into(),
            AppError::InvalidJobId(_) => "invalid_job_id".into(),
            AppError::InvalidDownloadUrl(_) => "invalid_download_url".into(),
            AppError::UnsupportedFormat(_) => "unsupported_format".into(),
            AppError::UnsupportedKind(_) => "unsupported_kind".into(),
            AppError::SizeLimit => "size_limit".into(),
            AppError::UpstreamStatus(code) => format!("status:{code}"),
            AppError::EncryptedZip => "encrypted_zip".into(),
            AppError::NotImage => "not_image".into(),
            AppError::ImagePrepareFailed(_) => "image_prepare_failed".into(),
            AppError::RepackFailed(_) => "repack_failed".into(),
            AppError::Timeout => "timeout".into(),
            AppError::NotFound(_) | AppError::BadRequest(_) => "exception".into(),
            AppError::Internal(_) => "exception".into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::TokenMissing => StatusCode::UNAUTHORIZED,
            AppError::TokenInvalid(_) => StatusCode::FORBIDDEN,
            AppError::UnsafePath(_) => StatusCode::from_u16(423).unwrap(),
            AppError::InvalidJobId(_)
            | AppError::InvalidDownloadUrl(_)
            | AppError::UnsupportedFormat(_)
            | AppError::UnsupportedKind(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::SizeLimit => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UpstreamStatus(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::EncryptedZip | AppError::NotImage => StatusCode::BAD_REQUEST,
            AppError::ImagePrepareFailed(_) | AppError::RepackFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(json!({ "error": message, "reason": self.reason_code() })),
        )
            .into_response()
    }
}
