//! Durable storage for topology records and migration tasks.
//!
//! The topology is written with compare-and-swap on its generation; task
//! records are plain upserts keyed by task id. Two implementations:
//!
//! - [`InMemoryPersistence`]: for tests and embedding, with an availability
//!   switch to simulate an unreachable store.
//! - [`FilePersistence`]: bincode files written to a temporary path, synced
//!   and renamed into place.

use super::model::Topology;
use crate::error::{Error, Result};
use crate::rebalancing::MigrationTask;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Backing store for the topology and migration task records.
#[async_trait]
pub trait TopologyPersistence: Send + Sync + std::fmt::Debug {
    /// Load the latest persisted topology, if any.
    async fn load(&self) -> Result<Option<Topology>>;

    /// Persist `topology` if the stored generation equals `expected_generation`.
    ///
    /// An empty store has generation 0. On mismatch returns
    /// `Error::StaleGeneration` carrying the stored generation.
    async fn compare_and_swap(&self, expected_generation: u64, topology: &Topology) -> Result<()>;

    /// Insert or replace a migration task record.
    async fn save_task(&self, task: &MigrationTask) -> Result<()>;

    /// Load every stored migration task.
    async fn load_tasks(&self) -> Result<Vec<MigrationTask>>;

    /// Delete a migration task record.
    async fn remove_task(&self, id: Uuid) -> Result<()>;
}

/// In-memory persistence.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    topology: Mutex<Option<Topology>>,
    tasks: RwLock<HashMap<Uuid, MigrationTask>>,
    unavailable: AtomicBool,
    /// Delay added to every load.
    latency: Mutex<Option<Duration>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::TopologyUnavailable(
                "in-memory store switched off".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of stored task records.
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }
}

#[async_trait]
impl TopologyPersistence for InMemoryPersistence {
    async fn load(&self) -> Result<Option<Topology>> {
        self.check_available()?;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.topology.lock().clone())
    }

    async fn compare_and_swap(&self, expected_generation: u64, topology: &Topology) -> Result<()> {
        self.check_available()?;
        let mut stored = self.topology.lock();
        let actual = stored.as_ref().map(|t| t.generation).unwrap_or(0);
        if actual != expected_generation {
            return Err(Error::StaleGeneration {
                expected: expected_generation,
                actual,
            });
        }
        *stored = Some(topology.clone());
        Ok(())
    }

    async fn save_task(&self, task: &MigrationTask) -> Result<()> {
        self.check_available()?;
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<MigrationTask>> {
        self.check_available()?;
        Ok(self.tasks.read().values().cloned().collect())
    }

    async fn remove_task(&self, id: Uuid) -> Result<()> {
        self.check_available()?;
        self.tasks.write().remove(&id);
        Ok(())
    }
}

/// File-based persistence.
///
/// Layout under the base directory:
///
/// ```text
/// <base>/topology.bin
/// <base>/tasks/<task-id>.bin
/// ```
#[derive(Debug)]
pub struct FilePersistence {
    base_dir: PathBuf,
    /// Serializes read-compare-write of the topology file.
    cas_lock: tokio::sync::Mutex<()>,
}

impl FilePersistence {
    /// Open (and create if needed) a persistence directory.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(base_dir.join("tasks")).await?;
        Ok(Self {
            base_dir,
            cas_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn topology_path(&self) -> PathBuf {
        self.base_dir.join("topology.bin")
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.base_dir.join("tasks").join(format!("{}.bin", id))
    }

    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let mut file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        Ok(Some(content))
    }
}

#[async_trait]
impl TopologyPersistence for FilePersistence {
    async fn load(&self) -> Result<Option<Topology>> {
        match self.read_optional(&self.topology_path()).await? {
            Some(bytes) => Ok(Some(Topology::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, expected_generation: u64, topology: &Topology) -> Result<()> {
        let _guard = self.cas_lock.lock().await;
        let actual = self.load().await?.map(|t| t.generation).unwrap_or(0);
        if actual != expected_generation {
            return Err(Error::StaleGeneration {
                expected: expected_generation,
                actual,
            });
        }
        let bytes = topology.to_bytes()?;
        self.atomic_write(&self.topology_path(), &bytes).await?;

        tracing::debug!(
            generation = topology.generation,
            path = %self.topology_path().display(),
            "Persisted topology"
        );
        Ok(())
    }

    async fn save_task(&self, task: &MigrationTask) -> Result<()> {
        let bytes = bincode::serialize(task)?;
        self.atomic_write(&self.task_path(task.id), &bytes).await?;

        tracing::debug!(task = %task.id, status = %task.status, "Persisted migration task");
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<MigrationTask>> {
        let mut tasks = Vec::new();
        let mut entries = fs::read_dir(self.base_dir.join("tasks")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Some(bytes) = self.read_optional(&path).await? else {
                continue;
            };
            match bincode::deserialize::<MigrationTask>(&bytes) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task record");
                }
            }
        }

        Ok(tasks)
    }

    async fn remove_task(&self, id: Uuid) -> Result<()> {
        match fs::remove_file(self.task_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::StrategyKind;
    use crate::rebalancing::{MigrationReason, MigrationStatus};
    use crate::types::Span;
    use tempfile::TempDir;

    fn topology() -> Topology {
        Topology::bootstrap(StrategyKind::hash(), &["mem://a".to_string(), "mem://b".to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_cas() {
        let store = InMemoryPersistence::new();
        assert!(store.load().await.unwrap().is_none());

        let topo = topology();
        store.compare_and_swap(0, &topo).await.unwrap();
        let err = store.compare_and_swap(0, &topo).await.unwrap_err();
        assert!(matches!(err, Error::StaleGeneration { expected: 0, actual: 1 }));
        assert_eq!(store.load().await.unwrap().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_in_memory_unavailable() {
        let store = InMemoryPersistence::new();
        store.set_available(false);
        assert!(matches!(store.load().await, Err(Error::TopologyUnavailable(_))));
        store.set_available(true);
        assert!(store.load().await.is_ok());
    }

    #[tokio::test]
    async fn test_file_topology_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::open(temp_dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        let topo = topology();
        store.compare_and_swap(0, &topo).await.unwrap();
        assert!(store.compare_and_swap(0, &topo).await.is_err());

        let reopened = FilePersistence::open(temp_dir.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(topo));
    }

    #[tokio::test]
    async fn test_file_task_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::open(temp_dir.path()).await.unwrap();

        let mut task = MigrationTask::moving(Span::DirectoryDefault, 0, 1, MigrationReason::Manual);
        store.save_task(&task).await.unwrap();
        task.status = MigrationStatus::Copying;
        store.save_task(&task).await.unwrap();

        let tasks = store.load_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, MigrationStatus::Copying);

        store.remove_task(task.id).await.unwrap();
        store.remove_task(task.id).await.unwrap();
        assert!(store.load_tasks().await.unwrap().is_empty());
    }
}
