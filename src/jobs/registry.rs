//! In-memory job registry: one coarse mutex over a map, exactly the shape
//! the reference agent used for its own job tracker, generalized from
//! abort-handle tracking to full job state plus a subscriber set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use super::model::{JobMeta, ProgressEvent};

const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

struct JobState {
    meta: JobMeta,
    subscribers: Vec<Subscriber>,
}

#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, JobState>>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns `(meta, created)`. If the job already existed, `meta` is its
    /// current state unchanged and `created` is false (§4.6.1's idempotence
    /// requirement).
    pub async fn get_or_create(&self, job_id: &str, build: impl FnOnce() -> JobMeta) -> (JobMeta, bool) {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(job_id) {
            (existing.meta.clone(), false)
        } else {
            let meta = build();
            jobs.insert(
                job_id.to_string(),
                JobState { meta: meta.clone(), subscribers: Vec::new() },
            );
            (meta, true)
        }
    }

    pub async fn snapshot(&self, job_id: &str) -> Option<JobMeta> {
        self.jobs.read().await.get(job_id).map(|s| s.meta.clone())
    }

    /// Apply `patch` under the registry's single lock, then broadcast the
    /// resulting transition event to every live subscriber. The critical
    /// section never performs I/O — callers persist `meta.json` separately.
    pub async fn update(&self, job_id: &str, patch: impl FnOnce(&mut JobMeta)) -> Option<JobMeta> {
        let mut jobs = self.jobs.write().await;
        let state = jobs.get_mut(job_id)?;
        let old_stage = state.meta.stage;
        patch(&mut state.meta);
        let event = state.meta.transition_event(old_stage);
        let meta = state.meta.clone();

        state.subscribers.retain(|sub| sub.tx.try_send(event.clone()).is_ok());

        Some(meta)
    }

    /// Register a new subscriber, returning its id (for later removal) and
    /// the current snapshot to send as the initial event.
    pub async fn add_subscriber(&self, job_id: &str, tx: mpsc::Sender<ProgressEvent>) -> Option<(u64, JobMeta)> {
        let mut jobs = self.jobs.write().await;
        let state = jobs.get_mut(job_id)?;
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        state.subscribers.push(Subscriber { id, tx });
        Some((id, state.meta.clone()))
    }

    pub async fn remove_subscriber(&self, job_id: &str, subscriber_id: u64) {
        if let Some(state) = self.jobs.write().await.get_mut(job_id) {
            state.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Close every subscriber's channel (dropping the sender ends its WS
    /// loop) and clear the set. Called at terminal transitions.
    pub async fn drain_subscribers(&self, job_id: &str) {
        if let Some(state) = self.jobs.write().await.get_mut(job_id) {
            state.subscribers.clear();
        }
    }
}

impl Clone for ProgressEvent {
    fn clone(&self) -> Self {
        match self {
            ProgressEvent::Stage { stage } => ProgressEvent::Stage { stage },
            ProgressEvent::Progress { bytes, total, stage, status } => {
                ProgressEvent::Progress { bytes: *bytes, total: *total, stage, status }
            }
            ProgressEvent::Complete { bytes, total, stage } => {
                ProgressEvent::Complete { bytes: *bytes, total: *total, stage }
            }
            ProgressEvent::Error { message } => ProgressEvent::Error { message: message.clone() },
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{Mode, Stage};

    fn sample_meta(job_id: &str) -> JobMeta {
        JobMeta {
            job_id: job_id.to_string(),
            mode: Mode::DownloadUrl,
            mod_id: None,
            transfer_kind: None,
            storage_type: None,
            file_kind: None,
            download_url: Some("http://host/a.zip".into()),
            filename: "a.zip".into(),
            download_path: None,
            pack_format: "zip".into(),
            pack_level: 3,
            max_bytes: 0,
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
            callback_context: serde_json::Value::Null,
            created_at: 0,
            download_started_at: None,
            download_completed_at: None,
            upload_completed_at: None,
            moved_at: None,
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = JobRegistry::new();
        let (_, created_first) = registry.get_or_create("job_abcdef01", || sample_meta("job_abcdef01")).await;
        assert!(created_first);

        registry
            .update("job_abcdef01", |m| m.transition(Stage::Downloading))
            .await;

        let (meta, created_second) = registry.get_or_create("job_abcdef01", || sample_meta("job_abcdef01")).await;
        assert!(!created_second);
        assert_eq!(meta.stage, Stage::Downloading);
    }

    #[tokio::test]
    async fn subscriber_receives_updates_then_is_drained() {
        let registry = JobRegistry::new();
        registry.get_or_create("job_abcdef01", || sample_meta("job_abcdef01")).await;

        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let (_id, initial) = registry.add_subscriber("job_abcdef01", tx).await.unwrap();
        assert_eq!(initial.stage, Stage::Pending);

        registry
            .update("job_abcdef01", |m| {
                m.bytes_transferred = 100;
                m.transition(Stage::Downloading);
            })
            .await;

        let stage_event = rx.recv().await.unwrap();
        assert!(matches!(stage_event, ProgressEvent::Stage { stage: "downloading" }));

        registry.update("job_abcdef01", |m| m.bytes_transferred = 200).await;

        let progress_event = rx.recv().await.unwrap();
        assert!(matches!(progress_event, ProgressEvent::Progress { bytes: 200, .. }));

        registry.drain_subscribers("job_abcdef01").await;
        assert!(rx.recv().await.is_none());
    }
}
