use super::{check_precondition, StoreBackend, WriteBatch, WriteOp};
use crate::Result;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// RocksDB-based store for persistent state
pub struct RocksDBStore {
    db: DB,
    // Serializes precondition checks with the batch write
    commit_lock: Mutex<()>,
}

impl RocksDBStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(1024);
        opts.set_use_fsync(false);
        opts.set_bytes_per_sync(1 << 20);
        opts.set_max_write_buffer_number(4);
        opts.set_write_buffer_size(64 << 20);
        opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            commit_lock: Mutex::new(()),
        })
    }
}

impl StoreBackend for RocksDBStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.into_vec()));
        }
        Ok(entries)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.commit_lock.lock().unwrap_or_else(|p| p.into_inner());

        for precondition in &batch.preconditions {
            let current = self.db.get(precondition.key())?;
            check_precondition(precondition, current.as_deref())?;
        }

        let mut write_batch = rocksdb::WriteBatch::default();
        for WriteOp::Put { key, value } in &batch.writes {
            write_batch.put(key, value);
        }
        self.db.write(write_batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "rocksdb"
    }
}

impl Drop for RocksDBStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!("Failed to flush RocksDB on drop: {}", e);
        }
    }
}
