//! Trust-store implementations: in-memory (tests, ephemeral deployments) and
//! a JSON file written atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::fs_utils::write_atomic;

use super::{HostKeyStore, TrustedHostKey};

type Key = (String, u16);

fn key_of(host: &str, port: u16) -> Key {
    (host.to_string(), port)
}

/// Volatile store; trust decisions do not survive a restart.
#[derive(Default)]
pub struct MemoryHostKeyStore {
    records: RwLock<HashMap<Key, TrustedHostKey>>,
}

impl MemoryHostKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostKeyStore for MemoryHostKeyStore {
    fn find(&self, host: &str, port: u16) -> Result<Option<TrustedHostKey>, StoreError> {
        Ok(self.records.read().get(&key_of(host, port)).cloned())
    }

    fn upsert(&self, record: TrustedHostKey) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(key_of(&record.host, record.port), record);
        Ok(())
    }

    fn remove(&self, host: &str, port: u16) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&key_of(host, port)).is_some())
    }

    fn list(&self) -> Result<Vec<TrustedHostKey>, StoreError> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        Ok(records)
    }
}

/// JSON-file-backed store. The full record set is cached in memory and the
/// file is rewritten atomically on every mutation; host-key churn is rare
/// enough that rewrite cost is irrelevant.
pub struct FileHostKeyStore {
    path: PathBuf,
    records: RwLock<HashMap<Key, TrustedHostKey>>,
}

impl FileHostKeyStore {
    /// Open (or create) the store at `path`. A missing file is an empty
    /// store; a corrupt file is an error rather than silent data loss.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
            let list: Vec<TrustedHostKey> = serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
            list.into_iter()
                .map(|r| (key_of(&r.host, r.port), r))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &HashMap<Key, TrustedHostKey>) -> Result<(), StoreError> {
        let mut list: Vec<_> = records.values().cloned().collect();
        list.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));

        let content = serde_json::to_string_pretty(&list)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&self.path, &content).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl HostKeyStore for FileHostKeyStore {
    fn find(&self, host: &str, port: u16) -> Result<Option<TrustedHostKey>, StoreError> {
        Ok(self.records.read().get(&key_of(host, port)).cloned())
    }

    fn upsert(&self, record: TrustedHostKey) -> Result<(), StoreError> {
        let mut records = self.records.write();
        records.insert(key_of(&record.host, record.port), record);
        self.persist(&records)
    }

    fn remove(&self, host: &str, port: u16) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        let removed = records.remove(&key_of(host, port)).is_some();
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<TrustedHostKey>, StoreError> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        Ok(records)
    }
}
