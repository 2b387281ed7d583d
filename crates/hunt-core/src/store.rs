//! Shared redb database backing every durable component.
//!
//! One `state.redb` file holds four tables:
//!
//! ```text
//! processed    "service\x1finstance\x1fid"  -> JSON ProcessedRecord
//! hourly_caps  "service"                    -> JSON HourlyCapCounter
//! stats        "service\x1fkind"            -> u64
//! history      [ts_ms BE | uuid]            -> JSON HistoryEntry
//! ```
//!
//! redb serializes write transactions, so every read-modify-write done
//! inside a single write transaction is atomic with respect to other
//! writers in this process.

use std::path::Path;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use redb::{Database, ReadTransaction, TableDefinition, WriteTransaction};

use crate::error::{HuntError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

pub(crate) const PROCESSED: TableDefinition<&str, &[u8]> = TableDefinition::new("processed");
pub(crate) const HOURLY_CAPS: TableDefinition<&str, &[u8]> = TableDefinition::new("hourly_caps");
pub(crate) const STATS: TableDefinition<&str, u64> = TableDefinition::new("stats");
pub(crate) const HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("history");

/// Separator for composite string keys. Never appears in service slugs and
/// is not something a remote service puts in an id.
pub(crate) const KEY_SEP: char = '\u{1f}';

pub(crate) fn composite_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(part);
    }
    key
}

// ---------------------------------------------------------------------------
// StateDb
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle on the process-wide state database.
#[derive(Clone)]
pub struct StateDb {
    db: Arc<Database>,
    #[cfg(test)]
    offline: Arc<AtomicBool>,
}

impl StateDb {
    /// Open or create the database at `path`, creating parent directories
    /// and every table so later read transactions never see a missing table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(HuntError::store)?;
        let wt = db.begin_write().map_err(HuntError::store)?;
        wt.open_table(PROCESSED).map_err(HuntError::store)?;
        wt.open_table(HOURLY_CAPS).map_err(HuntError::store)?;
        wt.open_table(STATS).map_err(HuntError::store)?;
        wt.open_table(HISTORY).map_err(HuntError::store)?;
        wt.commit().map_err(HuntError::store)?;
        Ok(Self {
            db: Arc::new(db),
            #[cfg(test)]
            offline: Arc::default(),
        })
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction> {
        self.ensure_online()?;
        self.db.begin_read().map_err(HuntError::store)
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        self.ensure_online()?;
        self.db.begin_write().map_err(HuntError::store)
    }

    #[cfg(not(test))]
    fn ensure_online(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HuntError::StoreUnavailable("database offline".to_string()));
        }
        Ok(())
    }

    /// Make every clone of this handle fail new transactions until reset.
    #[cfg(test)]
    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

/// Run a synchronous store call on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HuntError::store(format!("store task join error: {e}")))?
}

#[cfg(test)]
pub(crate) fn open_tmp() -> (tempfile::TempDir, StateDb) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = StateDb::open(&dir.path().join(".hunt/state.redb")).unwrap();
    (dir, db)
}
