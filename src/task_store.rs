//! Task results, kept in memory and mirrored to a persistence backend
//!
//! The in-memory map is authoritative while the process runs. After every
//! mutation the whole map is written to the backend; a failed write is
//! logged and otherwise ignored. At startup the map is reloaded, and an
//! unreadable record starts the store empty.
//!
//! The persisted form maps each task id either to the `"CAPTCHA_NOT_READY"`
//! sentinel or to `{"value": ..., "elapsed_time": ...}`:
//!
//! ```json
//! {
//!   "0b9c...": "CAPTCHA_NOT_READY",
//!   "5f1e...": { "value": "0.AbC...", "elapsed_time": 7.412 },
//!   "9d7a...": { "value": "CAPTCHA_FAIL", "elapsed_time": 51.003 }
//! }
//! ```

use crate::SolverError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Stored for a task until its solver finishes
pub const NOT_READY: &str = "CAPTCHA_NOT_READY";
/// Stored as the value of a task whose solver gave up
pub const FAIL_VALUE: &str = "CAPTCHA_FAIL";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Random v4 UUID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Solved,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskRecord {
    Pending,
    Solved { value: String, elapsed_seconds: f64 },
    Failed { elapsed_seconds: f64 },
}

impl TaskRecord {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskRecord::Pending => TaskStatus::Pending,
            TaskRecord::Solved { .. } => TaskStatus::Solved,
            TaskRecord::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// The value reported to pollers, including the sentinels
    pub fn value(&self) -> &str {
        match self {
            TaskRecord::Pending => NOT_READY,
            TaskRecord::Solved { value, .. } => value,
            TaskRecord::Failed { .. } => FAIL_VALUE,
        }
    }

    pub fn elapsed_seconds(&self) -> Option<f64> {
        match self {
            TaskRecord::Pending => None,
            TaskRecord::Solved { elapsed_seconds, .. } | TaskRecord::Failed { elapsed_seconds } => {
                Some(*elapsed_seconds)
            }
        }
    }

    pub fn to_entry(&self) -> ResultEntry {
        match self.elapsed_seconds() {
            None => ResultEntry::Sentinel(NOT_READY.to_string()),
            Some(elapsed_time) => ResultEntry::Outcome {
                value: self.value().to_string(),
                elapsed_time,
            },
        }
    }

    fn from_entry(entry: ResultEntry) -> Option<Self> {
        match entry {
            ResultEntry::Sentinel(s) if s == NOT_READY => Some(TaskRecord::Pending),
            ResultEntry::Sentinel(_) => None,
            ResultEntry::Outcome {
                value,
                elapsed_time,
            } if value == FAIL_VALUE => Some(TaskRecord::Failed {
                elapsed_seconds: elapsed_time,
            }),
            ResultEntry::Outcome {
                value,
                elapsed_time,
            } => Some(TaskRecord::Solved {
                value,
                elapsed_seconds: elapsed_time,
            }),
        }
    }
}

/// A task result as persisted and as returned by the poll endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultEntry {
    Sentinel(String),
    Outcome { value: String, elapsed_time: f64 },
}

/// Final result handed to [`TaskStore::complete`]
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Solved { value: String, elapsed: Duration },
    Failed { elapsed: Duration },
}

impl TaskOutcome {
    fn into_record(self) -> TaskRecord {
        match self {
            TaskOutcome::Solved { value, elapsed } => TaskRecord::Solved {
                value,
                elapsed_seconds: round_millis(elapsed),
            },
            TaskOutcome::Failed { elapsed } => TaskRecord::Failed {
                elapsed_seconds: round_millis(elapsed),
            },
        }
    }
}

/// Seconds rounded to three decimals
fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, ResultEntry>, SolverError>;

    async fn save(&self, entries: &BTreeMap<String, ResultEntry>) -> Result<(), SolverError>;

    fn describe(&self) -> String;
}

/// Keeps the serialized map in memory; clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    saved: Arc<Mutex<Option<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw(&self) -> Option<String> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn load(&self) -> Result<HashMap<String, ResultEntry>, SolverError> {
        match self.saved.lock().await.as_deref() {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(HashMap::new()),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, ResultEntry>) -> Result<(), SolverError> {
        let raw = serde_json::to_string(entries)?;
        *self.saved.lock().await = Some(raw);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Pretty-printed JSON file, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultBackend for JsonFileBackend {
    async fn load(&self) -> Result<HashMap<String, ResultEntry>, SolverError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, entries: &BTreeMap<String, ResultEntry>) -> Result<(), SolverError> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub solved: usize,
    pub failed: usize,
}

pub struct TaskStore {
    tasks: DashMap<TaskId, TaskRecord>,
    backend: Arc<dyn ResultBackend>,
    // Serializes snapshot + write so the backend never goes back in time
    persist_lock: Mutex<()>,
}

impl TaskStore {
    /// Empty store that has not read from `backend`
    pub fn new(backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            tasks: DashMap::new(),
            backend,
            persist_lock: Mutex::new(()),
        }
    }

    /// Store seeded from whatever `backend` holds.
    pub async fn load(backend: Arc<dyn ResultBackend>) -> Self {
        let store = Self::new(backend);
        match store.backend.load().await {
            Ok(entries) => {
                for (id, entry) in entries {
                    match TaskRecord::from_entry(entry) {
                        Some(record) => {
                            store.tasks.insert(TaskId::from(id), record);
                        }
                        None => warn!("Skipping unrecognised result for task {}", id),
                    }
                }
                info!(
                    "Loaded {} results from {}",
                    store.tasks.len(),
                    store.backend.describe()
                );
            }
            Err(e) => {
                warn!(
                    "Error loading results from {}: {}. Starting with an empty results map.",
                    store.backend.describe(),
                    e
                );
            }
        }
        store
    }

    /// Register a new task as not ready.
    pub async fn create(&self, id: &TaskId) {
        self.tasks.insert(id.clone(), TaskRecord::Pending);
        debug!("Task {} created", id);
        self.persist_logged().await;
    }

    /// Record the final result of a task, replacing whatever was stored.
    pub async fn complete(&self, id: &TaskId, outcome: TaskOutcome) {
        self.tasks.insert(id.clone(), outcome.into_record());
        self.persist_logged().await;
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(id).map(|record| record.value().clone())
    }

    /// Whether the stored value for `id` is still the not-ready sentinel
    pub fn is_pending(&self, id: &TaskId) -> bool {
        matches!(self.get(id), Some(TaskRecord::Pending))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for entry in self.tasks.iter() {
            match entry.value().status() {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Solved => counts.solved += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Write the full map to the backend.
    pub async fn persist(&self) -> Result<(), SolverError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, ResultEntry> = self
            .tasks
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().to_entry()))
            .collect();
        self.backend.save(&snapshot).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            crate::metrics::record_persistence_error();
            error!("Error saving results to {}: {}", self.backend.describe(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct BrokenBackend;

    #[async_trait]
    impl ResultBackend for BrokenBackend {
        async fn load(&self) -> Result<HashMap<String, ResultEntry>, SolverError> {
            Err(SolverError::Persistence("unreadable".to_string()))
        }

        async fn save(&self, _entries: &BTreeMap<String, ResultEntry>) -> Result<(), SolverError> {
            Err(SolverError::Persistence("read-only".to_string()))
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[tokio::test]
    async fn test_create_then_complete() {
        let store = TaskStore::new(Arc::new(MemoryBackend::new()));
        let id = TaskId::generate();

        store.create(&id).await;
        assert!(store.is_pending(&id));
        assert_eq!(store.get(&id).unwrap().value(), NOT_READY);

        store
            .complete(
                &id,
                TaskOutcome::Solved {
                    value: "0.token".to_string(),
                    elapsed: Duration::from_millis(7412),
                },
            )
            .await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.status(), TaskStatus::Solved);
        assert_eq!(record.value(), "0.token");
        assert_eq!(record.elapsed_seconds(), Some(7.412));
        assert!(!store.is_pending(&id));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = TaskStore::new(Arc::new(MemoryBackend::new()));
        assert!(store.get(&TaskId::from("missing")).is_none());
        assert!(!store.is_pending(&TaskId::from("missing")));
    }

    #[tokio::test]
    async fn test_complete_overwrites() {
        let store = TaskStore::new(Arc::new(MemoryBackend::new()));
        let id = TaskId::generate();
        store.create(&id).await;
        store
            .complete(&id, TaskOutcome::Failed { elapsed: Duration::from_secs(3) })
            .await;
        store
            .complete(&id, TaskOutcome::Failed { elapsed: Duration::from_secs(3) })
            .await;

        assert_eq!(
            store.get(&id),
            Some(TaskRecord::Failed { elapsed_seconds: 3.0 })
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_results_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(JsonFileBackend::new(dir.path().join("results.json")));

        let solved = TaskId::generate();
        let failed = TaskId::generate();
        let pending = TaskId::generate();
        {
            let store = TaskStore::load(backend.clone()).await;
            for id in [&solved, &failed, &pending] {
                store.create(id).await;
            }
            store
                .complete(
                    &solved,
                    TaskOutcome::Solved {
                        value: "XXXX.DUMMY.TOKEN".to_string(),
                        elapsed: Duration::from_micros(1_234_567),
                    },
                )
                .await;
            store
                .complete(&failed, TaskOutcome::Failed { elapsed: Duration::from_secs(50) })
                .await;
        }

        let reloaded = TaskStore::load(backend).await;
        assert_eq!(reloaded.len(), 3);
        assert_eq!(
            reloaded.get(&solved),
            Some(TaskRecord::Solved {
                value: "XXXX.DUMMY.TOKEN".to_string(),
                elapsed_seconds: 1.235,
            })
        );
        assert_eq!(
            reloaded.get(&failed),
            Some(TaskRecord::Failed { elapsed_seconds: 50.0 })
        );
        assert!(reloaded.is_pending(&pending));
    }

    #[tokio::test]
    async fn test_persisted_format() {
        let backend = MemoryBackend::new();
        let store = TaskStore::new(Arc::new(backend.clone()));
        let pending = TaskId::from("a");
        let failed = TaskId::from("b");
        store.create(&pending).await;
        store
            .complete(&failed, TaskOutcome::Failed { elapsed: Duration::from_millis(1500) })
            .await;

        let raw: serde_json::Value = serde_json::from_str(&backend.raw().await.unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({
                "a": "CAPTCHA_NOT_READY",
                "b": { "value": "CAPTCHA_FAIL", "elapsed_time": 1.5 }
            })
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = TaskStore::load(Arc::new(JsonFileBackend::new(&path))).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(Arc::new(JsonFileBackend::new(dir.path().join("none.json")))).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_memory_state() {
        let store = TaskStore::load(Arc::new(BrokenBackend)).await;
        let id = TaskId::generate();
        store.create(&id).await;
        store
            .complete(
                &id,
                TaskOutcome::Solved {
                    value: "tok".to_string(),
                    elapsed: Duration::from_secs(1),
                },
            )
            .await;

        assert_eq!(store.get(&id).unwrap().value(), "tok");
        assert!(store.persist().await.is_err());
    }

    #[tokio::test]
    async fn test_counts() {
        let store = TaskStore::new(Arc::new(MemoryBackend::new()));
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::generate()).collect();
        for id in &ids {
            store.create(id).await;
        }
        store
            .complete(
                &ids[0],
                TaskOutcome::Solved { value: "t".to_string(), elapsed: Duration::ZERO },
            )
            .await;
        store
            .complete(&ids[1], TaskOutcome::Failed { elapsed: Duration::ZERO })
            .await;

        assert_eq!(
            store.counts(),
            TaskCounts { pending: 2, solved: 1, failed: 1 }
        );
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(tokio::spawn(async {
                (0..250).map(|_| TaskId::generate()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
