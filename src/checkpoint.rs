//! Checkpoint storage
//!
//! Persists partial assigner state across worker invocations. Keys are a
//! stable hash of the queue's identity, so a redelivered copy of the same
//! work item resumes the existing state instead of forking a parallel one.
//!
//! The contract is deliberately thin: last-write-wins per key, no ordering or
//! transactional guarantees. The worker-claim convention (one `Processing`
//! holder per queue) makes the assigner the sole writer for its key.

use crate::assigner::AssignerCheckpoint;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Stable identity of a queue for checkpoint keying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointKey {
    pub queue_id: u64,
    pub group_id: u64,
    pub sequence_id: u64,
}

impl CheckpointKey {
    pub fn new(queue_id: u64, group_id: u64, sequence_id: u64) -> Self {
        Self {
            queue_id,
            group_id,
            sequence_id,
        }
    }

    /// FNV-1a over the identity triple. Stable across processes and
    /// versions, unlike the std hasher.
    pub fn stable_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut hash = FNV_OFFSET;
        for id in [self.queue_id, self.group_id, self.sequence_id] {
            for byte in id.to_le_bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }

    fn as_string(&self) -> String {
        format!("{:016x}", self.stable_hash())
    }
}

/// Cross-invocation persistence of partial assigner state
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist state under the key (last-write-wins)
    async fn save(&self, key: CheckpointKey, state: &AssignerCheckpoint) -> Result<()>;

    /// Load state, `None` if absent
    async fn load(&self, key: CheckpointKey) -> Result<Option<AssignerCheckpoint>>;

    /// Remove state; absent keys are not an error
    async fn delete(&self, key: CheckpointKey) -> Result<()>;
}

/// In-memory checkpoint store for tests and single-process runs
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, key: CheckpointKey, state: &AssignerCheckpoint) -> Result<()> {
        let blob = serde_json::to_vec(state)?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| EngineError::checkpoint("checkpoint store lock poisoned"))?;
        blobs.insert(key.stable_hash(), blob);
        Ok(())
    }

    async fn load(&self, key: CheckpointKey) -> Result<Option<AssignerCheckpoint>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| EngineError::checkpoint("checkpoint store lock poisoned"))?;
        match blobs.get(&key.stable_hash()) {
            Some(blob) => Ok(Some(serde_json::from_slice(blob)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: CheckpointKey) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| EngineError::checkpoint("checkpoint store lock poisoned"))?;
        blobs.remove(&key.stable_hash());
        Ok(())
    }
}

/// File-backed checkpoint store: one JSON blob per key under a directory
pub struct FileCheckpointStore {
    dir: PathBuf,
    prefix: String,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir` (created on first save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "checkpoint".to_string(),
        }
    }

    /// Set the filename prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn path(&self, key: CheckpointKey) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", self.prefix, key.as_string()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, key: CheckpointKey, state: &AssignerCheckpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let blob = serde_json::to_vec(state)?;

        // Write-then-rename so a crash never leaves a half-written blob
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &blob).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            queue_id = key.queue_id,
            bytes = blob.len(),
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, key: CheckpointKey) -> Result<Option<AssignerCheckpoint>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(blob) => {
                debug!(queue_id = key.queue_id, path = %path.display(), "checkpoint loaded");
                Ok(Some(serde_json::from_slice(&blob)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    async fn delete(&self, key: CheckpointKey) -> Result<()> {
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::CHECKPOINT_VERSION;

    fn state(queue_id: u64) -> AssignerCheckpoint {
        AssignerCheckpoint {
            version: CHECKPOINT_VERSION,
            queue_id,
            strategy_index: 2,
            remaining_device_ids: vec![5, 6, 7],
            partitions: Vec::new(),
            partial_assignments: Vec::new(),
            partial_cost: 12.5,
            best: None,
        }
    }

    #[test]
    fn test_stable_hash_is_stable_and_distinct() {
        let a = CheckpointKey::new(1, 2, 3);
        let b = CheckpointKey::new(1, 2, 3);
        let c = CheckpointKey::new(1, 2, 4);

        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_ne!(a.stable_hash(), c.stable_hash());
        // Field order matters: (1,2,3) and (3,2,1) are different queues
        assert_ne!(a.stable_hash(), CheckpointKey::new(3, 2, 1).stable_hash());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        let key = CheckpointKey::new(1, 2, 3);

        assert!(store.load(key).await.unwrap().is_none());

        store.save(key, &state(1)).await.unwrap();
        let loaded = store.load(key).await.unwrap().unwrap();
        assert_eq!(loaded.strategy_index, 2);
        assert_eq!(loaded.remaining_device_ids, vec![5, 6, 7]);

        store.delete(key).await.unwrap();
        assert!(store.load(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let store = MemoryCheckpointStore::new();
        let key = CheckpointKey::new(1, 2, 3);

        store.save(key, &state(1)).await.unwrap();
        let mut newer = state(1);
        newer.strategy_index = 3;
        store.save(key, &newer).await.unwrap();

        assert_eq!(store.load(key).await.unwrap().unwrap().strategy_index, 3);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("ratewise-test-{}", uuid::Uuid::new_v4()));
        let store = FileCheckpointStore::new(&dir);
        let key = CheckpointKey::new(7, 8, 9);

        assert!(store.load(key).await.unwrap().is_none());

        store.save(key, &state(7)).await.unwrap();
        let loaded = store.load(key).await.unwrap().unwrap();
        assert_eq!(loaded.queue_id, 7);
        assert!((loaded.partial_cost - 12.5).abs() < 1e-9);

        store.delete(key).await.unwrap();
        assert!(store.load(key).await.unwrap().is_none());
        // Deleting an absent key is a no-op
        store.delete(key).await.unwrap();

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
