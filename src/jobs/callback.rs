//! Signs a result token and POSTs a completion notice to the Manager on
//! every terminal transition. Fire-and-forget: non-2xx responses are logged,
//! never retried — the Manager is expected to reconcile on its own.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::AppConfig;
use crate::jobs::model::JobMeta;
use crate::token;

pub async fn dispatch(config: &AppConfig, meta: &JobMeta, status: &str) {
    let Some(secret) = config.transfer_jwt_secret.as_deref() else {
        tracing::warn!(job_id = %meta.job_id, "callback skipped: TRANSFER_JWT_SECRET unset");
        return;
    };

    let Some(url) = config.manager_callback_url.as_deref() else {
        tracing::warn!(job_id = %meta.job_id, "callback skipped: no manager callback url configured");
        return;
    };

    let mut claims: HashMap<String, Value> = HashMap::new();
    claims.insert("status".into(), Value::String(status.to_string()));
    claims.insert("callback_context".into(), meta.callback_context.clone());
    claims.insert("bytes".into(), Value::from(meta.bytes_transferred));
    if let Some(total) = meta.total_bytes {
        claims.insert("total".into(), Value::from(total));
    }
    if let Some(reason) = &meta.error_reason {
        claims.insert("reason".into(), Value::String(reason.clone()));
    }
    if let Some(format) = &meta.packed_format {
        claims.insert("packed_format".into(), Value::String(format.clone()));
    }
    if let Some(mod_id) = &meta.mod_id {
        claims.insert("mod_id".into(), Value::String(mod_id.clone()));
    }
    if let Some(storage_type) = &meta.storage_type {
        claims.insert("storage_type".into(), Value::String(storage_type.clone()));
    }
    if let Some(file_kind) = &meta.file_kind {
        claims.insert("file_kind".into(), Value::String(file_kind.clone()));
    }
    if let Some(transfer_kind) = &meta.transfer_kind {
        claims.insert("transfer_kind".into(), Value::String(transfer_kind.clone()));
    }

    let token = match token::encode_transfer_token(
        &meta.job_id,
        token::AUD_MANAGER,
        Some("storage"),
        config.callback_ttl_seconds,
        claims,
        secret,
    ) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(job_id = %meta.job_id, error = %e, "failed to sign callback token");
            return;
        }
    };

    let client = reqwest::Client::new();
    match client.post(url).bearer_auth(token).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(job_id = %meta.job_id, status, "callback delivered");
        }
        Ok(resp) => {
            tracing::warn!(job_id = %meta.job_id, status = %resp.status(), "callback rejected by manager, not retrying");
        }
        Err(e) => {
            tracing::warn!(job_id = %meta.job_id, error = %e, "callback request failed, not retrying");
        }
    }
}
