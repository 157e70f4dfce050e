//! Job tracking for pipeline runs.
//!
//! Jobs live in an in-memory index backed by a [`DurableStore`]. Writes go
//! through memory first and then to disk; reads fall back to disk on a
//! memory miss and rehydrate the index, so status queries survive a process
//! restart. The sweep only evicts memory entries, never disk records.

use crate::error::{ErrorKind, GenerationError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Storyboard,
    Preview,
    Keyframes,
    Regenerate,
    SegmentRetry,
}

/// A tracked pipeline job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Pending,
            result: None,
            error: None,
            error_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn result_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn mark_processing(&mut self, partial: Option<Value>) {
        self.status = JobStatus::Processing;
        if partial.is_some() {
            self.result = partial;
        }
    }

    pub fn mark_completed(&mut self, result: Value) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.error_kind = None;
    }

    pub fn mark_failed(&mut self, err: &GenerationError, partial: Option<Value>) {
        self.status = JobStatus::Failed;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        if partial.is_some() {
            self.result = partial;
        }
    }
}

/// Key -> JSON blob persistence.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn write(&self, key: &str, blob: &Value) -> Result<(), StoreError>;
}

/// One `<key>.json` file per record under `root`.
pub struct FsDurableStore {
    root: PathBuf,
}

impl FsDurableStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Backend(format!("invalid store key '{key}'")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl DurableStore for FsDurableStore {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, blob: &Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).await?;
        // Whole-record replacement: a torn write never clobbers the old file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(blob)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory durable store for tests; writes can be made to fail.
#[derive(Default)]
pub struct MemoryDurableStore {
    records: RwLock<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(records.get(key).cloned())
    }

    async fn write(&self, key: &str, blob: &Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated write failure".to_string()));
        }
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        records.insert(key.to_string(), blob.clone());
        Ok(())
    }
}

pub struct JobStore {
    memory: RwLock<HashMap<String, GenerationJob>>,
    disk: Arc<dyn DurableStore>,
    retention: Duration,
}

impl JobStore {
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

    pub fn new(disk: Arc<dyn DurableStore>) -> Self {
        Self::with_retention(disk, Self::DEFAULT_RETENTION)
    }

    pub fn with_retention(disk: Arc<dyn DurableStore>, retention: Duration) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            disk,
            retention,
        }
    }

    /// Memory first; on a miss read the disk record and rehydrate the index.
    pub async fn get(&self, job_id: &str) -> Result<Option<GenerationJob>, StoreError> {
        if let Some(job) = self.memory_get(job_id) {
            return Ok(Some(job));
        }

        let Some(blob) = self.disk.read(job_id).await? else {
            return Ok(None);
        };
        let job: GenerationJob = serde_json::from_value(blob)?;
        tracing::debug!(job_id, status = ?job.status, "job rehydrated from disk");
        self.memory
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .insert(job_id.to_string(), job.clone());
        Ok(Some(job))
    }

    /// Write-through. A failed disk write is logged and the memory update
    /// stays in place.
    pub async fn put(&self, job: &GenerationJob) {
        match self.memory.write() {
            Ok(mut memory) => {
                memory.insert(job.id.clone(), job.clone());
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "job index poisoned"),
        }

        let persisted = match serde_json::to_value(job) {
            Ok(blob) => self.disk.write(&job.id, &blob).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            tracing::warn!(job_id = %job.id, status = ?job.status, error = %e, "job checkpoint not persisted");
        }
    }

    /// Load, mutate and write back a job, bumping `updated_at`.
    pub async fn update<F>(&self, job_id: &str, mutate: F) -> Result<GenerationJob, GenerationError>
    where
        F: FnOnce(&mut GenerationJob),
    {
        let mut job = self
            .get(job_id)
            .await?
            .ok_or_else(|| GenerationError::JobNotFound(job_id.to_string()))?;
        mutate(&mut job);
        job.updated_at = Utc::now();
        self.put(&job).await;
        Ok(job)
    }

    /// Evict memory entries created before `now - retention`.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - retention;
        let Ok(mut memory) = self.memory.write() else {
            return 0;
        };
        let before = memory.len();
        memory.retain(|_, job| job.created_at >= cutoff);
        let evicted = before - memory.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = memory.len(), "swept job index");
        }
        evicted
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep(Utc::now());
                    }
                }
            }
        })
    }

    /// Drop the whole memory index, as a process restart would.
    pub fn clear_memory(&self) {
        if let Ok(mut memory) = self.memory.write() {
            memory.clear();
        }
    }

    pub fn memory_len(&self) -> usize {
        self.memory.read().map(|m| m.len()).unwrap_or(0)
    }

    fn memory_get(&self, job_id: &str) -> Option<GenerationJob> {
        self.memory.read().ok()?.get(job_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_rehydrates_after_restart() {
        let disk = Arc::new(MemoryDurableStore::new());
        let store = JobStore::new(disk.clone());

        let mut job = GenerationJob::new(JobKind::Storyboard);
        job.mark_completed(json!({"segments": 3}));
        store.put(&job).await;

        store.clear_memory();
        assert_eq!(store.memory_len(), 0);

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.result, job.result);
        assert_eq!(store.memory_len(), 1);
    }

    #[tokio::test]
    async fn failed_disk_write_keeps_memory_update() {
        let disk = Arc::new(MemoryDurableStore::new());
        let store = JobStore::new(disk.clone());

        let job = GenerationJob::new(JobKind::Keyframes);
        store.put(&job).await;

        disk.set_fail_writes(true);
        let updated = store
            .update(&job.id, |j| j.mark_processing(None))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(
            store.get(&job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        // the older disk record is intact
        store.clear_memory();
        assert_eq!(
            store.get(&job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn sweep_evicts_memory_only() {
        let disk = Arc::new(MemoryDurableStore::new());
        let store = JobStore::with_retention(disk.clone(), Duration::from_secs(600));

        let mut old = GenerationJob::new(JobKind::Storyboard);
        old.created_at = Utc::now() - chrono::Duration::minutes(11);
        let fresh = GenerationJob::new(JobKind::Storyboard);
        store.put(&old).await;
        store.put(&fresh).await;

        assert_eq!(store.sweep(Utc::now()), 1);
        assert_eq!(store.memory_len(), 1);
        assert_eq!(disk.len(), 2);
        assert!(store.get(&old.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let store = JobStore::new(Arc::new(MemoryDurableStore::new()));
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(matches!(
            store.update("missing", |_| {}).await,
            Err(GenerationError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_store_roundtrip_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let job = {
            let store = JobStore::new(Arc::new(FsDurableStore::new(dir.path())));
            let mut job = GenerationJob::new(JobKind::Preview);
            job.mark_failed(
                &GenerationError::TimedOut {
                    id: "p-1".into(),
                    ticks: 90,
                },
                None,
            );
            store.put(&job).await;
            job
        };

        let reopened = JobStore::new(Arc::new(FsDurableStore::new(dir.path())));
        let loaded = reopened.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(loaded.error, job.error);
        assert!(dir.path().join(format!("{}.json", job.id)).exists());
    }

    #[tokio::test]
    async fn fs_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FsDurableStore::new(dir.path());
        assert!(disk.read("../etc/passwd").await.is_err());
        assert!(disk.read("not-there").await.unwrap().is_none());
    }
}
