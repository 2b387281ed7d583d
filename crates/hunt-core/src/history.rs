//! Durable audit log of actions taken against remote services.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::adapter::{HistorySink, HuntMode};
use crate::error::{HuntError, Result};
use crate::store::{StateDb, HISTORY};

pub const DEFAULT_MAX_ENTRIES: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub service: String,
    pub instance: String,
    pub media_label: String,
    pub external_id: String,
    pub action: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        service: &str,
        instance: &str,
        media_label: &str,
        external_id: &str,
        mode: HuntMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: service.to_string(),
            instance: instance.to_string(),
            media_label: media_label.to_string(),
            external_id: external_id.to_string(),
            action: mode.history_action().to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Key layout: `[timestamp_ms BE (8) | uuid (16)]`, so byte order is time order.
fn entry_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

pub struct HistoryLog {
    db: StateDb,
    max_entries: u64,
}

impl HistoryLog {
    pub fn new(db: StateDb) -> Self {
        Self::with_max_entries(db, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(db: StateDb, max_entries: u64) -> Self {
        Self {
            db,
            max_entries: max_entries.max(1),
        }
    }

    /// Append `entry`, pruning the oldest entries beyond the size limit.
    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let key = entry_key(entry.recorded_at, entry.id);
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write()?;
        {
            let mut table = wt.open_table(HISTORY).map_err(HuntError::store)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(HuntError::store)?;

            let len = table.len().map_err(HuntError::store)?;
            if len > self.max_entries {
                let excess = (len - self.max_entries) as usize;
                let mut oldest = Vec::with_capacity(excess);
                for item in table.iter().map_err(HuntError::store)?.take(excess) {
                    let (k, _) = item.map_err(HuntError::store)?;
                    oldest.push(k.value().to_vec());
                }
                for k in &oldest {
                    table.remove(k.as_slice()).map_err(HuntError::store)?;
                }
            }
        }
        wt.commit().map_err(HuntError::store)?;
        Ok(())
    }

    /// Newest first, optionally restricted to one service.
    pub fn recent(&self, limit: usize, service: Option<&str>) -> Result<Vec<HistoryEntry>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(HISTORY).map_err(HuntError::store)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(HuntError::store)?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, v) = item.map_err(HuntError::store)?;
            let entry: HistoryEntry = serde_json::from_slice(v.value())?;
            if service.is_some_and(|s| s != entry.service) {
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<u64> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(HISTORY).map_err(HuntError::store)?;
        table.len().map_err(HuntError::store)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl HistorySink for HistoryLog {
    fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.append(&entry) {
            warn!(
                service = %entry.service,
                instance = %entry.instance,
                error = %e,
                "failed to record history entry"
            );
        }
    }
}
