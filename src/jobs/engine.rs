//! The transfer state machine: download-from-URL OR receive-upload →
//! validate → repack → wait for move. Drives the archive/image toolkits and
//! the job registry, emits progress, and invokes the callback dispatcher on
//! terminal transitions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::archive::{self, ArchiveKind};
use crate::error::AppError;
use crate::guard;
use crate::image_toolkit;
use crate::jobs::callback;
use crate::jobs::model::{JobMeta, Mode, Stage};
use crate::jobs::{cleanup_job_dir, persist_meta};
use crate::state::AppState;
use crate::token::TransferClaims;

const CHUNK_BROADCAST_INTERVAL: Duration = Duration::from_millis(250);
const LOG_STEP_PERCENT: u64 = 10;
const LOG_STEP_BYTES_UNKNOWN_TOTAL: u64 = 50 * 1024 * 1024;
const WRITE_CHUNK_BYTES: usize = 256 * 1024;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn job_dir(state: &AppState, job_id: &str) -> Result<std::path::PathBuf, AppError> {
    guard::safe_join(&state.config.storage_root, &format!("temp/{job_id}"))
}

async fn persist(state: &AppState, job_id: &str) {
    if let Some(meta) = state.registry.snapshot(job_id).await {
        persist_meta(&state.config, &meta).await;
    }
}

/// Entry point for `/transfer/start` (§4.6.1).
pub async fn start_download(state: Arc<AppState>, claims: &TransferClaims) -> Result<JobMeta, AppError> {
    let job_id = claims.job_id.clone();
    if !guard::is_safe_job_id(&job_id) {
        return Err(AppError::InvalidJobId(job_id));
    }

    let url = claims
        .get_str("download_url")
        .ok_or_else(|| AppError::InvalidDownloadUrl("missing".into()))?;
    let parsed = reqwest::Url::parse(url).map_err(|_| AppError::InvalidDownloadUrl(url.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AppError::InvalidDownloadUrl(url.to_string()));
    }

    let filename = guard::sanitize_filename(claims.get_str("filename").unwrap_or(""), "download.bin");
    let pack_format = claims.get_str("pack_format").unwrap_or("zip").to_string();
    if pack_format != "zip" {
        return Err(AppError::UnsupportedFormat(pack_format));
    }
    let pack_level = claims.get_i64("pack_level").unwrap_or(3).clamp(0, 9);
    let max_bytes = claims
        .get_i64("max_bytes")
        .map(|v| if v <= 0 { 0 } else { v as u64 })
        .unwrap_or(state.config.max_bytes_default);
    let callback_context = claims.extra.get("callback_context").cloned().unwrap_or(Value::Null);
    let mod_id = claims.get_str("mod_id").map(|s| s.to_string());

    let url_owned = url.to_string();
    let (meta, created) = state
        .registry
        .get_or_create(&job_id, || JobMeta {
            job_id: job_id.clone(),
            mode: Mode::DownloadUrl,
            mod_id: mod_id.clone(),
            transfer_kind: Some("archive".into()),
            storage_type: None,
            file_kind: None,
            download_url: Some(url_owned.clone()),
            filename: filename.clone(),
            download_path: None,
            pack_format: pack_format.clone(),
            pack_level,
            max_bytes: max_bytes as i64,
            status: Stage::Pending,
            stage: Stage::Pending,
            error: None,
            error_reason: None,
            packed_path: None,
            packed_bytes: None,
            packed_format: None,
            final_path: None,
            final_bytes: None,
            bytes_transferred: 0,
            total_bytes: None,
            callback_context: callback_context.clone(),
            created_at: now(),
            download_started_at: None,
            download_completed_at: None,
            upload_completed_at: None,
            moved_at: None,
        })
        .await;

    if created {
        tokio::spawn(download_task(state.clone(), job_id.clone()));
    }

    Ok(meta)
}

#[tracing::instrument(skip(state), fields(mode = %Mode::DownloadUrl))]
async fn download_task(state: Arc<AppState>, job_id: String) {
    let meta = match state.registry.snapshot(&job_id).await {
        Some(m) => m,
        None => return,
    };

    state
        .registry
        .update(&job_id, |m| {
            m.transition(Stage::Downloading);
            m.download_started_at = Some(now());
        })
        .await;
    persist(&state, &job_id).await;

    let dir = match job_dir(&state, &job_id) {
        Ok(d) => d,
        Err(e) => {
            terminal_fail(&state, &job_id, &e.reason_code()).await;
            return;
        }
    };
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        terminal_fail(&state, &job_id, &format!("exception:{e}")).await;
        return;
    }

    let url = meta.download_url.clone().unwrap_or_default();
    let response = match state.http.get(url.as_str()).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            terminal_fail(&state, &job_id, "timeout").await;
            return;
        }
        Err(_) => {
            terminal_fail(&state, &job_id, "exception").await;
            return;
        }
    };

    if !response.status().is_success() {
        terminal_fail(&state, &job_id, &format!("status:{}", response.status().as_u16())).await;
        return;
    }

    let content_length = response.content_length();
    if meta.max_bytes > 0 {
        if let Some(total) = content_length {
            if total > meta.max_bytes as u64 {
                terminal_fail(&state, &job_id, "size_limit").await;
                return;
            }
        }
    }

    state.registry.update(&job_id, |m| m.total_bytes = content_length).await;

    let dest = dir.join(&meta.filename);
    let stream = response.bytes_stream();
    let max_bytes = meta.max_bytes.max(0) as u64;

    let written = match stream_to_file(&state, &job_id, &dest, stream, max_bytes, content_length).await {
        Ok(w) => w,
        Err(e) => {
            let _ = tokio::fs::remove_file(&dest).await;
            terminal_fail(&state, &job_id, &e.reason_code()).await;
            return;
        }
    };

    state
        .registry
        .update(&job_id, |m| {
            m.bytes_transferred = written;
            m.download_path = Some(meta.filename.clone());
            m.transition(Stage::Downloaded);
            m.download_completed_at = Some(now());
        })
        .await;
    persist(&state, &job_id).await;

    finish_archive(&state, &job_id).await;
}

/// Entry point for `/transfer/upload` (§4.6.2). Runs on the request task —
/// the streaming body is the data source, not an HTTP client — and returns
/// the final job state (or the terminal `AppError` the handler maps to an
/// HTTP status).
#[tracing::instrument(skip(state, claims, filename_hint, body), fields(job_id = %claims.job_id))]
pub async fn run_upload<S, E>(
    state: Arc<AppState>,
    claims: &TransferClaims,
    filename_hint: Option<String>,
    body: S,
) -> Result<JobMeta, AppError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let job_id = claims.job_id.clone();
    if !guard::is_safe_job_id(&job_id) {
        return Err(AppError::InvalidJobId(job_id));
    }

    let transfer_kind = claims
        .get_str("transfer_kind")
        .ok_or_else(|| AppError::UnsupportedKind("missing transfer_kind".into()))?
        .to_string();

    let (mode, pack_format, storage_type, file_kind) = match transfer_kind.as_str() {
        "archive" => {
            let pack_format = claims.get_str("pack_format").unwrap_or("zip").to_string();
            if pack_format != "zip" {
                return Err(AppError::UnsupportedFormat(pack_format));
            }
            (Mode::UploadArchive, pack_format, None, None)
        }
        "img" => {
            let storage_type = claims
                .get_str("storage_type")
                .ok_or_else(|| AppError::UnsupportedKind("missing storage_type".into()))?
                .to_string();
            let file_kind = claims.get_str("file_kind").unwrap_or("");
            if file_kind != "img" {
                return Err(AppError::UnsupportedKind(file_kind.to_string()));
            }
            (Mode::UploadImage, "zip".to_string(), Some(storage_type), Some("img".to_string()))
        }
        other => return Err(AppError::UnsupportedKind(other.to_string())),
    };

    let pack_level = claims.get_i64("pack_level").unwrap_or(3).clamp(0, 9);
    let max_bytes = claims
        .get_i64("max_bytes")
        .map(|v| if v <= 0 { 0 } else { v as u64 })
        .unwrap_or(state.config.max_bytes_default);
    let filename = guard::sanitize_filename(
        filename_hint.as_deref().or_else(|| claims.get_str("filename")).unwrap_or(""),
        "upload.bin",
    );
    let callback_context = claims.extra.get("callback_context").cloned().unwrap_or(Value::Null);
    let mod_id = claims.get_str("mod_id").map(|s| s.to_string());

    let (meta, created) = state
        .registry
        .get_or_create(&job_id, || JobMeta {
            job_id: job_id.clone(),
            mode,
            mod_id: mod_id.clone(),
            transfer_kind: Some(transfer_kind.clone()),
            storage_type: storage_type.clone(),
            file_kind: file_kind.clone(),
            download_url: None,
            filename: filename.clone(),
            download_path: None,
            pack_format: pack_format.clone(),
            pack_level,
            max_bytes: max_bytes as i64,
            status: Stage::Pending,
            stage: Stage::Pending,
            error: None,
            error_reason: None,
            packed_path: None,
            packed_bytes: None,
            packed_format: None,
            final_path: None,
            final_bytes: None,
            bytes_transferred: 0,
            total_bytes: None,
            callback_context: callback_context.clone(),
            created_at: now(),
            download_started_at: None,
            download_completed_at: None,
            upload_completed_at: None,
            moved_at: None,
        })
        .await;

    if !created {
        return Ok(meta);
    }

    state.registry.update(&job_id, |m| m.transition(Stage::Uploading)).await;
    persist(&state, &job_id).await;

    let dir = job_dir(&state, &job_id)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
    let dest = dir.join(&filename);

    let written = match stream_to_file(&state, &job_id, &dest, body, max_bytes, None).await {
        Ok(w) => w,
        Err(e) => {
            let _ = tokio::fs::remove_file(&dest).await;
            terminal_fail(&state, &job_id, &e.reason_code()).await;
            return Err(e);
        }
    };

    state
        .registry
        .update(&job_id, |m| {
            m.bytes_transferred = written;
            m.total_bytes = Some(written);
            m.download_path = Some(filename.clone());
            m.transition(Stage::Uploaded);
            m.upload_completed_at = Some(now());
        })
        .await;
    persist(&state, &job_id).await;

    match transfer_kind.as_str() {
        "archive" => {
            finish_archive(&state, &job_id).await;
        }
        "img" => {
            finish_image(&state, &job_id, &dir, &dest).await;
        }
        _ => unreachable!("transfer_kind already validated"),
    }

    state
        .registry
        .snapshot(&job_id)
        .await
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("job vanished after completion")))
}

/// Stream `src` into `dest` in 256 KiB chunks, broadcasting progress at most
/// every 250ms and logging at 10% steps (or 50 MiB steps when the total is
/// unknown). Enforces `max_bytes` if nonzero.
async fn stream_to_file<S, E>(
    state: &AppState,
    job_id: &str,
    dest: &Path,
    mut stream: S,
    max_bytes: u64,
    total_hint: Option<u64>,
) -> Result<u64, AppError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("create failed: {e}")))?;

    let mut written: u64 = 0;
    let mut last_broadcast = tokio::time::Instant::now();
    let mut last_log_bucket: u64 = 0;
    let mut pending: Vec<u8> = Vec::with_capacity(WRITE_CHUNK_BYTES);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::Internal(anyhow::anyhow!("stream read failed: {e}")))?;
        pending.extend_from_slice(&chunk);

        while pending.len() >= WRITE_CHUNK_BYTES {
            let rest = pending.split_off(WRITE_CHUNK_BYTES);
            flush_pending(&mut file, &mut pending, &mut written).await?;
            pending = rest;

            if max_bytes > 0 && written > max_bytes {
                return Err(AppError::SizeLimit);
            }

            if last_broadcast.elapsed() >= CHUNK_BROADCAST_INTERVAL {
                state.registry.update(job_id, |m| m.bytes_transferred = written).await;
                last_broadcast = tokio::time::Instant::now();
            }
            log_progress_if_due(job_id, written, total_hint, &mut last_log_bucket);
        }

        if max_bytes > 0 && written + pending.len() as u64 > max_bytes {
            flush_pending(&mut file, &mut pending, &mut written).await?;
            return Err(AppError::SizeLimit);
        }
    }

    flush_pending(&mut file, &mut pending, &mut written).await?;
    if max_bytes > 0 && written > max_bytes {
        return Err(AppError::SizeLimit);
    }

    file.flush().await.map_err(|e| AppError::Internal(anyhow::anyhow!("flush failed: {e}")))?;
    state.registry.update(job_id, |m| m.bytes_transferred = written).await;
    log_progress_if_due(job_id, written, total_hint, &mut last_log_bucket);

    Ok(written)
}

/// Write out whatever has accumulated in `pending` and fold its length into
/// `written`, regardless of whether it reached a full `WRITE_CHUNK_BYTES`
/// unit (the final chunk of a stream is usually smaller).
async fn flush_pending(file: &mut tokio::fs::File, pending: &mut Vec<u8>, written: &mut u64) -> Result<(), AppError> {
    if pending.is_empty() {
        return Ok(());
    }
    file.write_all(pending)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("write failed: {e}")))?;
    *written += pending.len() as u64;
    pending.clear();
    Ok(())
}

fn log_progress_if_due(job_id: &str, written: u64, total_hint: Option<u64>, last_bucket: &mut u64) {
    match total_hint {
        Some(total) if total > 0 => {
            let percent = (written * 100) / total;
            let bucket = percent / LOG_STEP_PERCENT;
            if bucket > *last_bucket {
                *last_bucket = bucket;
                tracing::debug!(job_id, bytes = written, total, percent, "transfer progress");
            }
        }
        _ => {
            let bucket = written / LOG_STEP_BYTES_UNKNOWN_TOTAL;
            if bucket > *last_bucket {
                *last_bucket = bucket;
                tracing::debug!(job_id, bytes = written, "transfer progress");
            }
        }
    }
}

async fn finish_archive(state: &AppState, job_id: &str) {
    match repack_job(state, job_id).await {
        Ok(()) => complete_job(state, job_id).await,
        Err(_) => fail_and_notify(state, job_id).await,
    }
}

async fn finish_image(state: &AppState, job_id: &str, dir: &Path, source: &Path) {
    state.registry.update(job_id, |m| m.transition(Stage::Processing)).await;
    persist(state, job_id).await;

    let dest = dir.join("packed.webp");
    match image_toolkit::file_to_webp(source, &dest).await {
        Ok(size) => {
            let _ = tokio::fs::remove_file(source).await;
            state
                .registry
                .update(job_id, |m| {
                    m.packed_path = Some("packed.webp".into());
                    m.packed_bytes = Some(size);
                    m.packed_format = Some("webp".into());
                    m.transition(Stage::Packed);
                })
                .await;
            persist(state, job_id).await;
            complete_job(state, job_id).await;
        }
        Err(AppError::NotImage) => {
            let _ = tokio::fs::remove_file(source).await;
            let _ = tokio::fs::remove_file(dest).await;
            terminal_fail(state, job_id, "not_image").await;
        }
        Err(_) => {
            let _ = tokio::fs::remove_file(source).await;
            let _ = tokio::fs::remove_file(dest).await;
            terminal_fail(state, job_id, "image_prepare_failed").await;
        }
    }
}

/// Re-pack the job's source file into canonical ZIP form (§4.6.3). On
/// success the job is left at `Packed`; on failure it is left at `Error`
/// with `error_reason = "repack_failed"` (or `"encrypted_zip"`), matching
/// the caller's responsibility to notify and drain subscribers either way.
#[tracing::instrument(skip(state))]
pub async fn repack_job(state: &AppState, job_id: &str) -> Result<(), AppError> {
    let meta = state
        .registry
        .snapshot(job_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;

    let dir = job_dir(state, job_id)?;
    let source_name = meta
        .download_path
        .clone()
        .unwrap_or_else(|| meta.filename.clone());
    let source_path = dir.join(&source_name);

    state.registry.update(job_id, |m| m.transition(Stage::Repacking)).await;
    persist(state, job_id).await;

    let probed = archive::probe(&source_path, &state.config.archiver_bin).await?;

    if probed.encrypted {
        let _ = tokio::fs::remove_file(&source_path).await;
        if let Some(m) = state.registry.update(job_id, |m| m.fail("encrypted_zip")).await {
            persist_meta(&state.config, &m).await;
        }
        return Err(AppError::EncryptedZip);
    }

    if probed.kind == Some(ArchiveKind::Zip) && archive::is_canonical_zip(&probed.entries) {
        let size = tokio::fs::metadata(&source_path).await.map(|m| m.len()).unwrap_or(0);
        if let Some(m) = state
            .registry
            .update(job_id, |m| {
                m.packed_path = Some(source_name.clone());
                m.packed_bytes = Some(size);
                m.packed_format = Some("zip".into());
                m.transition(Stage::Packed);
            })
            .await
        {
            persist_meta(&state.config, &m).await;
        }
        return Ok(());
    }

    let repack_dir = dir.join("repack");
    let extracted: Result<(), AppError> = match probed.kind {
        Some(ArchiveKind::Zip) => archive::extract_zip(&source_path, &repack_dir).await,
        Some(kind @ (ArchiveKind::TarGz | ArchiveKind::TarBz2)) => {
            archive::extract_tar(&source_path, &repack_dir, kind).await
        }
        Some(ArchiveKind::Other) => {
            archive::extract_external(&source_path, &repack_dir, &state.config.archiver_bin).await
        }
        None => {
            let result: Result<(), AppError> = async {
                tokio::fs::create_dir_all(&repack_dir)
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
                tokio::fs::rename(&source_path, repack_dir.join(&source_name))
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("move failed: {e}")))?;
                Ok(())
            }
            .await;
            result
        }
    };

    if let Err(e) = extracted {
        if let Some(m) = state.registry.update(job_id, |m| m.fail("repack_failed")).await {
            persist_meta(&state.config, &m).await;
        }
        return Err(AppError::RepackFailed(e.to_string()));
    }

    let packed_path = dir.join("packed.zip");
    match archive::zip_dir(&repack_dir, &packed_path, meta.pack_level).await {
        Ok(size) => {
            if let Some(m) = state
                .registry
                .update(job_id, |m| {
                    m.packed_path = Some("packed.zip".into());
                    m.packed_bytes = Some(size);
                    m.packed_format = Some("zip".into());
                    m.transition(Stage::Packed);
                })
                .await
            {
                persist_meta(&state.config, &m).await;
            }
            Ok(())
        }
        Err(e) => {
            if let Some(m) = state.registry.update(job_id, |m| m.fail("repack_failed")).await {
                persist_meta(&state.config, &m).await;
            }
            Err(AppError::RepackFailed(e.to_string()))
        }
    }
}

/// Operator-triggered re-pack (`/transfer/repack`), overriding the job's
/// pack level before re-running the same repack sub-procedure.
pub async fn repack_endpoint(state: &AppState, job_id: &str, format: &str, level: i64) -> Result<JobMeta, AppError> {
    if format != "zip" {
        return Err(AppError::UnsupportedFormat(format.to_string()));
    }
    let level = level.clamp(0, 9);

    if state.registry.update(job_id, |m| m.pack_level = level).await.is_none() {
        return Err(AppError::NotFound(format!("job {job_id}")));
    }

    repack_job(state, job_id).await?;

    state
        .registry
        .snapshot(job_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
}

/// Promote a job's packed artifact to permanent storage (§4.6.4).
#[tracing::instrument(skip(state))]
pub async fn move_job(state: &AppState, job_id: &str, type_name: &str, rel_path: &str) -> Result<(String, u64), AppError> {
    if !state.config.allowed_types.iter().any(|t| t == type_name) {
        return Err(AppError::UnsupportedKind(type_name.to_string()));
    }

    let meta = state
        .registry
        .snapshot(job_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
    let packed_rel = meta
        .packed_path
        .clone()
        .ok_or_else(|| AppError::NotFound("no packed artifact for job".into()))?;

    let dir = job_dir(state, job_id)?;
    let packed_abs = dir.join(&packed_rel);

    let type_root = state.config.type_root(type_name);
    tokio::fs::create_dir_all(&type_root)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
    let dest_abs = guard::safe_join(&type_root, rel_path)?;
    if let Some(parent) = dest_abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;
    }

    tokio::fs::rename(&packed_abs, &dest_abs)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("move failed: {e}")))?;

    let final_bytes = tokio::fs::metadata(&dest_abs).await.map(|m| m.len()).unwrap_or(0);
    let final_path = format!("{}/{}", type_name, rel_path.trim_start_matches('/'));

    if let Some(m) = state
        .registry
        .update(job_id, |m| {
            m.final_path = Some(final_path.clone());
            m.final_bytes = Some(final_bytes);
            m.moved_at = Some(now());
            m.transition(Stage::Moved);
        })
        .await
    {
        persist_meta(&state.config, &m).await;
    }

    cleanup_job_dir(&dir).await;
    state.registry.drain_subscribers(job_id).await;

    Ok((final_path, final_bytes))
}

async fn complete_job(state: &AppState, job_id: &str) {
    if let Some(meta) = state.registry.snapshot(job_id).await {
        callback::dispatch(&state.config, &meta, "success").await;
    }
    state.registry.drain_subscribers(job_id).await;
}

async fn fail_and_notify(state: &AppState, job_id: &str) {
    if let Some(meta) = state.registry.snapshot(job_id).await {
        callback::dispatch(&state.config, &meta, "error").await;
    }
    state.registry.drain_subscribers(job_id).await;
}

async fn terminal_fail(state: &AppState, job_id: &str, reason: &str) {
    state.registry.update(job_id, |m| m.fail(reason)).await;
    persist(state, job_id).await;
    if let Ok(dir) = job_dir(state, job_id) {
        cleanup_job_dir(&dir).await;
    }
    fail_and_notify(state, job_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use futures_util::stream;
    use image::{ImageBuffer, Rgb};
    use serde_json::Value;

    use crate::config::AppConfig;
    use crate::token::{TransferClaims, AUD_STORAGE};

    fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            storage_root: root.to_path_buf(),
            transfer_jwt_secret: Some("test-secret".into()),
            callback_ttl_seconds: 600,
            max_bytes_default: 0,
            manager_callback_url: None,
            archiver_bin: "7z".into(),
            allowed_types: vec!["archive".into(), "img".into()],
            download_idle_timeout_seconds: 60,
            static_tokens: HashMap::new(),
            log_level: "error".into(),
        }
    }

    fn test_state(root: &Path) -> Arc<AppState> {
        std::fs::create_dir_all(root.join("temp")).unwrap();
        std::fs::create_dir_all(root.join("archive")).unwrap();
        std::fs::create_dir_all(root.join("img")).unwrap();
        Arc::new(AppState::new(test_config(root)))
    }

    fn test_claims(job_id: &str, extra: HashMap<String, Value>) -> TransferClaims {
        TransferClaims {
            job_id: job_id.to_string(),
            aud: AUD_STORAGE.to_string(),
            iss: None,
            iat: 0,
            exp: i64::MAX,
            extra,
        }
    }

    fn sample_meta(job_id: &str, filename: &str) -> JobMeta {
        JobMeta {
            job_id: job_id.to_string(),
            mode: Mode::DownloadUrl,
            mod_id: None,
            transfer_kind: Some("archive".into()),
            storage_type: None,
            file_kind: None,
            download_url: None,
            filename: filename.to_string(),
            download_path: Some(filename.to_string()),
            pack_format: "zip".into(),
            pack_level: 3,
            max_bytes: 0,
            status: Stage::Downloaded,
            stage: Stage::Downloaded,
            error: None,
            error_reason: None,
            packed_path: None,
            packed_bytes: None,
            packed_format: None,
            final_path: None,
            final_bytes: None,
            bytes_transferred: 0,
            total_bytes: None,
            callback_context: Value::Null,
            created_at: 0,
            download_started_at: None,
            download_completed_at: None,
            upload_completed_at: None,
            moved_at: None,
        }
    }

    fn sample_png() -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(4, 4, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn repack_turns_plain_file_into_canonical_zip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_repacktest";

        let job_dir = dir.path().join("temp").join(job_id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("payload.bin"), b"hello world").unwrap();

        state.registry.get_or_create(job_id, || sample_meta(job_id, "payload.bin")).await;
        repack_job(&state, job_id).await.unwrap();

        let meta = state.registry.snapshot(job_id).await.unwrap();
        assert_eq!(meta.stage, Stage::Packed);
        assert_eq!(meta.packed_path.as_deref(), Some("packed.zip"));
        assert!(meta.packed_bytes.unwrap() > 0);

        let probed = archive::probe(&job_dir.join("packed.zip"), "7z").await.unwrap();
        assert!(archive::is_canonical_zip(&probed.entries));
    }

    #[tokio::test]
    async fn repack_is_a_no_op_for_an_already_canonical_zip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_canonicalzip";

        let job_dir = dir.path().join("temp").join(job_id);
        std::fs::create_dir_all(&job_dir).unwrap();

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.txt"), b"hello").unwrap();
        let zip_path = job_dir.join("source.zip");
        archive::zip_dir(src_dir.path(), &zip_path, 6).await.unwrap();
        let original_bytes = std::fs::read(&zip_path).unwrap();

        state.registry.get_or_create(job_id, || sample_meta(job_id, "source.zip")).await;
        repack_job(&state, job_id).await.unwrap();

        let meta = state.registry.snapshot(job_id).await.unwrap();
        assert_eq!(meta.packed_path.as_deref(), Some("source.zip"));
        assert_eq!(std::fs::read(&zip_path).unwrap(), original_bytes);
    }

    #[tokio::test]
    async fn upload_archive_mode_wraps_single_file_into_canonical_zip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_uploadarchive";

        let mut extra = HashMap::new();
        extra.insert("transfer_kind".into(), Value::String("archive".into()));
        extra.insert("pack_format".into(), Value::String("zip".into()));
        extra.insert("filename".into(), Value::String("mod.bin".into()));
        let claims = test_claims(job_id, extra);

        let body = stream::iter(vec![Ok::<Bytes, String>(Bytes::from_static(b"mod payload bytes"))]);
        let meta = run_upload(state.clone(), &claims, None, body).await.unwrap();

        assert_eq!(meta.stage, Stage::Packed);
        assert_eq!(meta.packed_format.as_deref(), Some("zip"));

        let packed_path = dir.path().join("temp").join(job_id).join(meta.packed_path.unwrap());
        let probed = archive::probe(&packed_path, "7z").await.unwrap();
        assert!(archive::is_canonical_zip(&probed.entries));
    }

    #[tokio::test]
    async fn upload_image_mode_converts_to_webp_and_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_uploadimage";

        let mut extra = HashMap::new();
        extra.insert("transfer_kind".into(), Value::String("img".into()));
        extra.insert("storage_type".into(), Value::String("avatar".into()));
        extra.insert("file_kind".into(), Value::String("img".into()));
        extra.insert("filename".into(), Value::String("pic.png".into()));
        let claims = test_claims(job_id, extra);

        let body = stream::iter(vec![Ok::<Bytes, String>(Bytes::from(sample_png()))]);
        let meta = run_upload(state.clone(), &claims, None, body).await.unwrap();

        assert_eq!(meta.stage, Stage::Packed);
        assert_eq!(meta.packed_format.as_deref(), Some("webp"));

        let job_dir = dir.path().join("temp").join(job_id);
        assert!(job_dir.join("packed.webp").exists());
        assert!(!job_dir.join("pic.png").exists());
    }

    #[tokio::test]
    async fn upload_enforces_size_limit_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_sizelimit";

        let mut extra = HashMap::new();
        extra.insert("transfer_kind".into(), Value::String("archive".into()));
        extra.insert("pack_format".into(), Value::String("zip".into()));
        extra.insert("filename".into(), Value::String("big.bin".into()));
        extra.insert("max_bytes".into(), Value::from(10u64));
        let claims = test_claims(job_id, extra);

        let body = stream::iter(vec![
            Ok::<Bytes, String>(Bytes::from_static(b"0123456789")),
            Ok::<Bytes, String>(Bytes::from_static(b"more-bytes-that-overflow")),
        ]);

        let result = run_upload(state.clone(), &claims, None, body).await;
        assert!(matches!(result, Err(AppError::SizeLimit)));

        let meta = state.registry.snapshot(job_id).await.unwrap();
        assert_eq!(meta.error_reason.as_deref(), Some("size_limit"));

        let job_dir = dir.path().join("temp").join(job_id);
        assert!(!job_dir.join("big.bin").exists());
    }

    #[tokio::test]
    async fn move_promotes_packed_artifact_and_cleans_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_movetest";

        let job_dir = dir.path().join("temp").join(job_id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("packed.zip"), b"zip-bytes").unwrap();

        state
            .registry
            .get_or_create(job_id, || {
                let mut m = sample_meta(job_id, "source.zip");
                m.packed_path = Some("packed.zip".into());
                m.transition(Stage::Packed);
                m
            })
            .await;

        let (final_path, final_bytes) = move_job(&state, job_id, "archive", "mods/demo.zip").await.unwrap();
        assert_eq!(final_path, "archive/mods/demo.zip");
        assert_eq!(final_bytes, 9);
        assert!(!job_dir.exists());
        assert!(dir.path().join("archive/mods/demo.zip").exists());
    }

    #[tokio::test]
    async fn move_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let job_id = "job_traversal";

        let job_dir = dir.path().join("temp").join(job_id);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("packed.zip"), b"zip-bytes").unwrap();

        state
            .registry
            .get_or_create(job_id, || {
                let mut m = sample_meta(job_id, "source.zip");
                m.packed_path = Some("packed.zip".into());
                m.transition(Stage::Packed);
                m
            })
            .await;

        let result = move_job(&state, job_id, "archive", "../../evil.zip").await;
        assert!(matches!(result, Err(AppError::UnsafePath(_))));
        assert!(job_dir.join("packed.zip").exists());
    }
}
