use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The coarse phase of a job. `status` in `meta.json` and `stage` are the
/// same underlying value projected twice (see SPEC_FULL.md §9's open
/// question) — this type backs both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Downloading,
    Uploading,
    Downloaded,
    Uploaded,
    Processing,
    Repacking,
    Packed,
    Moved,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Downloading => "downloading",
            Stage::Uploading => "uploading",
            Stage::Downloaded => "downloaded",
            Stage::Uploaded => "uploaded",
            Stage::Processing => "processing",
            Stage::Repacking => "repacking",
            Stage::Packed => "packed",
            Stage::Moved => "moved",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DownloadUrl,
    UploadArchive,
    UploadImage,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::DownloadUrl => "download_url",
            Mode::UploadArchive => "upload_archive",
            Mode::UploadImage => "upload_image",
        };
        f.write_str(s)
    }
}

/// Durable projection of a job, rewritten atomically to `meta.json` on every
/// stage change. `callback_context` is preserved as opaque JSON since it
/// must be returned to the Manager verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_id: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    pub pack_format: String,
    pub pack_level: i64,
    pub max_bytes: i64,

    pub status: Stage,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_bytes: Option<u64>,

    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,

    #[serde(default)]
    pub callback_context: Value,

    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_at: Option<i64>,
}

impl JobMeta {
    pub fn transition(&mut self, stage: Stage) {
        self.stage = stage;
        self.status = stage;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.error = Some(reason.clone());
        self.error_reason = Some(reason);
        self.transition(Stage::Error);
    }
}

/// Events pushed to WS subscribers (§4.7). `Stage` is the lightweight event
/// for a bare transition (no byte-count change); `Progress` carries the
/// running byte counters (and, for the initial snapshot sent on connect,
/// `status` alongside `stage` per spec.md's literal wire contract).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProgressEvent {
    Stage {
        stage: &'static str,
    },
    Progress {
        bytes: u64,
        total: Option<u64>,
        stage: &'static str,
        status: &'static str,
    },
    Complete {
        bytes: u64,
        total: Option<u64>,
        stage: &'static str,
    },
    Error {
        message: String,
    },
}

impl JobMeta {
    /// The event for the initial snapshot sent to a WS subscriber on
    /// connect: always `progress`-tagged, regardless of the job's current
    /// stage (§4.7: "send one initial snapshot `{event: "progress", bytes,
    /// total, status, stage}`").
    pub fn initial_snapshot_event(&self) -> ProgressEvent {
        ProgressEvent::Progress {
            bytes: self.bytes_transferred,
            total: self.total_bytes,
            stage: self.stage.as_str(),
            status: self.status.as_str(),
        }
    }

    /// The event to broadcast after a registry `update()` that moved the job
    /// from `old_stage` to its current `self.stage`. Terminal stages always
    /// win (`error`/`complete`); a stage that actually changed gets the
    /// lightweight `stage` event ahead of any byte-count update folded into
    /// the same patch; otherwise it's a plain byte-count `progress` event.
    pub fn transition_event(&self, old_stage: Stage) -> ProgressEvent {
        match self.stage {
            Stage::Error => ProgressEvent::Error {
                message: self.error.clone().unwrap_or_else(|| "unknown error".into()),
            },
            Stage::Moved | Stage::Packed => ProgressEvent::Complete {
                bytes: self.bytes_transferred,
                total: self.total_bytes,
                stage: self.stage.as_str(),
            },
            stage if stage != old_stage => ProgressEvent::Stage { stage: stage.as_str() },
            _ => ProgressEvent::Progress {
                bytes: self.bytes_transferred,
                total: self.total_bytes,
                stage: self.stage.as_str(),
                status: self.status.as_str(),
            },
        }
    }
}
