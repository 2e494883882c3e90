pub mod callback;
pub mod engine;
pub mod model;
pub mod registry;

use std::path::Path;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::guard;
use model::JobMeta;

/// Rewrite `<root>/temp/<job_id>/meta.json` atomically: write to a sibling
/// temp file, then rename over the target. Best-effort — a write failure is
/// logged but does not fail the calling operation, since the in-memory
/// registry stays authoritative for the run (§4.5).
pub async fn persist_meta(config: &AppConfig, meta: &JobMeta) {
    if let Err(e) = persist_meta_inner(config, meta).await {
        tracing::warn!(job_id = %meta.job_id, error = %e, "failed to persist meta.json");
    }
}

async fn persist_meta_inner(config: &AppConfig, meta: &JobMeta) -> Result<(), AppError> {
    let job_dir_rel = format!("temp/{}", meta.job_id);
    let job_dir = guard::safe_join(&config.storage_root, &job_dir_rel)?;
    tokio::fs::create_dir_all(&job_dir)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("mkdir failed: {e}")))?;

    let body = serde_json::to_vec_pretty(meta)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("meta serialize failed: {e}")))?;

    let tmp_path = job_dir.join("meta.json.tmp");
    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("meta write failed: {e}")))?;
    tokio::fs::rename(&tmp_path, job_dir.join("meta.json"))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("meta rename failed: {e}")))?;

    Ok(())
}

/// Best-effort removal of a job's temp directory contents, used on failure
/// cleanup paths (§7's propagation policy).
pub async fn cleanup_job_dir(job_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(job_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %job_dir.display(), error = %e, "failed to clean up job directory");
        }
    }
}
