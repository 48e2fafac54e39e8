use super::{check_precondition, StoreBackend, WriteBatch, WriteOp};
use crate::{BoxOfficeError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-process backend. One lock over the whole map keeps batches atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BoxOfficeError::StorageUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl StoreBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        Ok(self.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.ensure_available()?;
        Ok(self
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_available()?;
        let mut data = self.write();

        for precondition in &batch.preconditions {
            check_precondition(
                precondition,
                data.get(precondition.key()).map(Vec::as_slice),
            )?;
        }

        for WriteOp::Put { key, value } in batch.writes {
            data.insert(key, value);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
