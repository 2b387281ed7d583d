//! Durable "already acted on" records per (service, instance), with expiry.

use std::collections::HashSet;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HuntError, Result};
use crate::store::{composite_key, StateDb, KEY_SEP, PROCESSED};

/// One item that must not be acted on again until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub service: String,
    pub instance: String,
    pub external_id: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn record_key(service: &str, instance: &str, external_id: &str) -> String {
    composite_key(&[service, instance, external_id])
}

fn instance_prefix(service: &str, instance: &str) -> String {
    let mut prefix = composite_key(&[service, instance]);
    prefix.push(KEY_SEP);
    prefix
}

// ---------------------------------------------------------------------------
// DedupStore
// ---------------------------------------------------------------------------

pub struct DedupStore {
    db: StateDb,
    retention: RwLock<Duration>,
}

impl DedupStore {
    pub fn new(db: StateDb, retention_hours: u32) -> Self {
        Self {
            db,
            retention: RwLock::new(Duration::hours(i64::from(retention_hours.max(1)))),
        }
    }

    /// Default TTL applied by [`DedupStore::mark_processed`].
    pub fn retention(&self) -> Duration {
        *self
            .retention
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Change the TTL for records created from now on. Existing records keep
    /// their expiry.
    pub fn set_retention(&self, hours: u32) {
        let hours = hours.max(1);
        info!(hours, "dedup retention updated");
        *self
            .retention
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Duration::hours(i64::from(hours));
    }

    pub fn is_processed(&self, service: &str, instance: &str, external_id: &str) -> Result<bool> {
        self.is_processed_at(service, instance, external_id, Utc::now())
    }

    pub fn is_processed_at(
        &self,
        service: &str,
        instance: &str,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = record_key(service, instance, external_id);
        let rt = self.db.begin_read()?;
        let table = rt.open_table(PROCESSED).map_err(HuntError::store)?;
        let Some(raw) = table.get(key.as_str()).map_err(HuntError::store)? else {
            return Ok(false);
        };
        let record: ProcessedRecord = serde_json::from_slice(raw.value())?;
        Ok(!record.is_expired(now))
    }

    /// The subset of `ids` with a live record, read in one transaction.
    pub fn processed_among(
        &self,
        service: &str,
        instance: &str,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(PROCESSED).map_err(HuntError::store)?;
        let mut live = HashSet::new();
        for id in ids {
            let key = record_key(service, instance, id);
            let Some(raw) = table.get(key.as_str()).map_err(HuntError::store)? else {
                continue;
            };
            let record: ProcessedRecord = serde_json::from_slice(raw.value())?;
            if !record.is_expired(now) {
                live.insert(id.clone());
            }
        }
        Ok(live)
    }

    pub fn mark_processed(
        &self,
        service: &str,
        instance: &str,
        external_id: &str,
    ) -> Result<ProcessedRecord> {
        self.mark_processed_at(service, instance, external_id, self.retention(), Utc::now())
    }

    /// Record `external_id` as processed for `ttl`.
    ///
    /// Re-marking a live record keeps its original `processed_at` and only
    /// ever moves `expires_at` later. An expired record is replaced outright.
    pub fn mark_processed_at(
        &self,
        service: &str,
        instance: &str,
        external_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessedRecord> {
        let key = record_key(service, instance, external_id);
        let wt = self.db.begin_write()?;
        let record = {
            let mut table = wt.open_table(PROCESSED).map_err(HuntError::store)?;
            let existing: Option<ProcessedRecord> = match table
                .get(key.as_str())
                .map_err(HuntError::store)?
            {
                Some(raw) => Some(serde_json::from_slice(raw.value())?),
                None => None,
            };

            let expires_at = now + ttl;
            let record = match existing {
                Some(prev) if !prev.is_expired(now) => ProcessedRecord {
                    expires_at: prev.expires_at.max(expires_at),
                    ..prev
                },
                _ => ProcessedRecord {
                    service: service.to_string(),
                    instance: instance.to_string(),
                    external_id: external_id.to_string(),
                    processed_at: now,
                    expires_at,
                },
            };
            let value = serde_json::to_vec(&record)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(HuntError::store)?;
            record
        };
        wt.commit().map_err(HuntError::store)?;
        debug!(service, instance, external_id, expires_at = %record.expires_at, "marked processed");
        Ok(record)
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    /// Delete every record whose expiry has passed. Returns how many went.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let wt = self.db.begin_write()?;
        let removed = {
            let mut table = wt.open_table(PROCESSED).map_err(HuntError::store)?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(HuntError::store)? {
                let (k, v) = entry.map_err(HuntError::store)?;
                let record: ProcessedRecord = serde_json::from_slice(v.value())?;
                if record.is_expired(now) {
                    expired.push(k.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(HuntError::store)?;
            }
            expired.len()
        };
        wt.commit().map_err(HuntError::store)?;
        if removed > 0 {
            info!(removed, "swept expired dedup records");
        }
        Ok(removed)
    }

    /// Forget everything processed for one instance.
    pub fn clear_instance(&self, service: &str, instance: &str) -> Result<usize> {
        let prefix = instance_prefix(service, instance);
        let wt = self.db.begin_write()?;
        let removed = {
            let mut table = wt.open_table(PROCESSED).map_err(HuntError::store)?;
            let mut keys = Vec::new();
            for entry in table
                .range(prefix.as_str()..)
                .map_err(HuntError::store)?
            {
                let (k, _) = entry.map_err(HuntError::store)?;
                let key = k.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key.to_string());
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(HuntError::store)?;
            }
            keys.len()
        };
        wt.commit().map_err(HuntError::store)?;
        info!(service, instance, removed, "cleared processed ids");
        Ok(removed)
    }

    /// Live (unexpired) records, optionally narrowed to a service and
    /// instance, ordered by key.
    pub fn list_active(
        &self,
        service: Option<&str>,
        instance: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedRecord>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(PROCESSED).map_err(HuntError::store)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(HuntError::store)? {
            let (_, v) = entry.map_err(HuntError::store)?;
            let record: ProcessedRecord = serde_json::from_slice(v.value())?;
            if record.is_expired(now) {
                continue;
            }
            if service.is_some_and(|s| s != record.service) {
                continue;
            }
            if instance.is_some_and(|i| i != record.instance) {
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    pub fn count_active(&self, service: &str, instance: &str) -> Result<usize> {
        Ok(self
            .list_active(Some(service), Some(instance), Utc::now())?
            .len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
