use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BlobStore, StorageError};

/// Map-backed store with the same rename contract as the real thing.
/// Single lock around the whole map, so rename checks and applies in
/// one critical section.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn norm(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, path: &str, body: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(norm(path), body.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(&norm(path))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = format!("{}/", norm(prefix));
        let names = self
            .lock()
            .keys()
            .filter_map(|key| key.strip_prefix(&dir))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.lock().remove(&norm(path));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from_key = norm(from);
        let to_key = norm(to);
        let mut blobs = self.lock();
        if blobs.contains_key(&to_key) {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        let body = blobs
            .remove(&from_key)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        blobs.insert(to_key, body);
        Ok(())
    }
}
