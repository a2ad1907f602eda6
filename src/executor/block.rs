//! Local block store
//!
//! Results too large to send inline are written here under a task-scoped
//! block id and fetched by the coordinator later.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::BlockStoreId;

/// Where a block is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    MemoryOnly,
    DiskOnly,
    MemoryAndDisk,
}

impl StorageLevel {
    pub fn use_memory(&self) -> bool {
        matches!(self, StorageLevel::MemoryOnly | StorageLevel::MemoryAndDisk)
    }

    pub fn use_disk(&self) -> bool {
        matches!(self, StorageLevel::DiskOnly | StorageLevel::MemoryAndDisk)
    }
}

/// Block id under which a task's oversized result is stored
pub fn task_result_block_id(task_id: i64) -> String {
    format!("taskresult_{}", task_id)
}

/// Storage for serialized blocks, addressable by the coordinator
pub trait BlockStore: Send + Sync {
    /// Identity reported in registration and heartbeats
    fn id(&self) -> &BlockStoreId;

    fn put(&self, block_id: &str, bytes: Vec<u8>, level: StorageLevel) -> Result<()>;

    fn get(&self, block_id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a block. Returns whether it existed.
    fn remove(&self, block_id: &str) -> Result<bool>;
}

/// In-process block store with an optional disk tier
pub struct LocalBlockStore {
    id: BlockStoreId,
    memory: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    disk_dir: Option<PathBuf>,
}

impl LocalBlockStore {
    /// Memory-only store; disk-level puts keep the block in memory
    pub fn in_memory(id: BlockStoreId) -> Self {
        Self {
            id,
            memory: RwLock::new(HashMap::new()),
            disk_dir: None,
        }
    }

    /// Store that spills disk-level blocks under `dir`
    pub fn with_disk(id: BlockStoreId, dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| Error::IoWrite {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            id,
            memory: RwLock::new(HashMap::new()),
            disk_dir: Some(dir),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn block_path(&self, block_id: &str) -> Result<Option<PathBuf>> {
        let valid = !block_id.is_empty()
            && block_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !block_id.starts_with('.');
        if !valid {
            return Err(Error::block_store(block_id, "invalid block id"));
        }
        Ok(self.disk_dir.as_ref().map(|dir| dir.join(block_id)))
    }
}

impl BlockStore for LocalBlockStore {
    fn id(&self) -> &BlockStoreId {
        &self.id
    }

    fn put(&self, block_id: &str, bytes: Vec<u8>, level: StorageLevel) -> Result<()> {
        let path = self.block_path(block_id)?;

        let on_disk = match (level.use_disk(), path) {
            (true, Some(path)) => {
                fs::write(&path, &bytes).map_err(|e| Error::block_store(block_id, e))?;
                true
            }
            _ => false,
        };

        // Without a disk tier every level falls back to memory
        if level.use_memory() || !on_disk {
            self.memory
                .write()
                .insert(block_id.to_string(), Arc::new(bytes));
        }

        debug!(block_id = %block_id, ?level, on_disk, "Stored block");
        Ok(())
    }

    fn get(&self, block_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.memory.read().get(block_id) {
            return Ok(Some(bytes.as_ref().clone()));
        }

        match self.block_path(block_id)? {
            Some(path) if path.exists() => fs::read(&path)
                .map(Some)
                .map_err(|e| Error::block_store(block_id, e)),
            _ => Ok(None),
        }
    }

    fn remove(&self, block_id: &str) -> Result<bool> {
        let mut existed = self.memory.write().remove(block_id).is_some();

        if let Some(path) = self.block_path(block_id)? {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| Error::block_store(block_id, e))?;
                existed = true;
            }
        }

        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_id() -> BlockStoreId {
        BlockStoreId {
            executor_id: "exec-1".to_string(),
            host: "localhost".to_string(),
        }
    }

    #[test]
    fn test_result_block_id() {
        assert_eq!(task_result_block_id(42), "taskresult_42");
    }

    #[test]
    fn test_memory_put_get_remove() {
        let store = LocalBlockStore::in_memory(store_id());
        store
            .put("taskresult_1", vec![1, 2, 3], StorageLevel::MemoryAndDisk)
            .unwrap();

        assert_eq!(store.get("taskresult_1").unwrap(), Some(vec![1, 2, 3]));
        assert!(store.remove("taskresult_1").unwrap());
        assert!(!store.remove("taskresult_1").unwrap());
        assert_eq!(store.get("taskresult_1").unwrap(), None);
    }

    #[test]
    fn test_disk_only_block_survives_in_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlockStore::with_disk(store_id(), temp_dir.path().to_path_buf()).unwrap();

        store
            .put("taskresult_9", b"payload".to_vec(), StorageLevel::DiskOnly)
            .unwrap();

        assert!(store.is_empty());
        assert!(temp_dir.path().join("taskresult_9").exists());
        assert_eq!(store.get("taskresult_9").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_rejects_path_like_block_ids() {
        let store = LocalBlockStore::in_memory(store_id());
        assert!(store.put("../escape", vec![], StorageLevel::MemoryOnly).is_err());
        assert!(store.put("", vec![], StorageLevel::MemoryOnly).is_err());
    }
}
