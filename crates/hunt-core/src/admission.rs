//! Per-service hourly request budget plus business counters.
//!
//! The budget is keyed by service only, so every instance of a service
//! draws from the same bucket. A bucket is the UTC clock hour; a counter
//! whose bucket is not the current hour reads as zero and is overwritten on
//! the next increment.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, DurationRound, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HuntError, Result};
use crate::store::{composite_key, StateDb, HOURLY_CAPS, KEY_SEP, STATS};

pub const DEFAULT_HOURLY_CAP: u32 = 20;

/// Start of the UTC clock hour containing `now`.
pub fn hour_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HourlyCapCounter {
    hour_bucket: DateTime<Utc>,
    count: u32,
}

/// Current-hour usage of one service's budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapUsage {
    pub service: String,
    pub hour_bucket: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

impl CapUsage {
    pub fn exceeded(&self) -> bool {
        self.count >= self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

// ---------------------------------------------------------------------------
// AdmissionController
// ---------------------------------------------------------------------------

pub struct AdmissionController {
    db: StateDb,
    limits: RwLock<HashMap<String, u32>>,
    default_limit: u32,
    /// Held around every counter read-modify-write so concurrent workers of
    /// one service overshoot by at most one increment each.
    gate: Mutex<()>,
}

impl AdmissionController {
    pub fn new(db: StateDb) -> Self {
        Self {
            db,
            limits: RwLock::new(HashMap::new()),
            default_limit: DEFAULT_HOURLY_CAP,
            gate: Mutex::new(()),
        }
    }

    pub fn with_limits(db: StateDb, limits: impl IntoIterator<Item = (String, u32)>) -> Self {
        let controller = Self::new(db);
        for (service, limit) in limits {
            controller.set_limit(&service, limit);
        }
        controller
    }

    pub fn set_limit(&self, service: &str, limit: u32) {
        self.limits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), limit);
    }

    pub fn limit(&self, service: &str) -> u32 {
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn current_count(&self, service: &str, now: DateTime<Utc>) -> Result<u32> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(HOURLY_CAPS).map_err(HuntError::store)?;
        let Some(raw) = table.get(service).map_err(HuntError::store)? else {
            return Ok(0);
        };
        let counter: HourlyCapCounter = serde_json::from_slice(raw.value())?;
        if counter.hour_bucket == hour_bucket(now) {
            Ok(counter.count)
        } else {
            Ok(0)
        }
    }

    pub fn check_exceeded(&self, service: &str) -> Result<bool> {
        self.check_exceeded_at(service, Utc::now())
    }

    /// True only when the current bucket's count has reached the limit.
    pub fn check_exceeded_at(&self, service: &str, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let count = self.current_count(service, now)?;
        let limit = self.limit(service);
        if count >= limit {
            debug!(service, count, limit, "hourly cap reached");
        }
        Ok(count >= limit)
    }

    pub fn increment(&self, service: &str) -> Result<u32> {
        self.increment_at(service, Utc::now())
    }

    /// Add one to the current bucket, starting it at zero if the stored
    /// counter belongs to an older hour. Returns the new count.
    pub fn increment_at(&self, service: &str, now: DateTime<Utc>) -> Result<u32> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = hour_bucket(now);
        let wt = self.db.begin_write()?;
        let count = {
            let mut table = wt.open_table(HOURLY_CAPS).map_err(HuntError::store)?;
            let previous: Option<HourlyCapCounter> =
                match table.get(service).map_err(HuntError::store)? {
                    Some(raw) => Some(serde_json::from_slice(raw.value())?),
                    None => None,
                };
            let count = match previous {
                Some(c) if c.hour_bucket == bucket => c.count.saturating_add(1),
                _ => 1,
            };
            let value = serde_json::to_vec(&HourlyCapCounter {
                hour_bucket: bucket,
                count,
            })?;
            table
                .insert(service, value.as_slice())
                .map_err(HuntError::store)?;
            count
        };
        wt.commit().map_err(HuntError::store)?;
        let limit = self.limit(service);
        if count > limit {
            warn!(service, count, limit, "hourly cap overshot by a concurrent action");
        }
        Ok(count)
    }

    /// Bump a reporting counter such as "upgraded". Never throttles.
    pub fn increment_stat_only(&self, service: &str, kind: &str) -> Result<u64> {
        let key = composite_key(&[service, kind]);
        let wt = self.db.begin_write()?;
        let value = {
            let mut table = wt.open_table(STATS).map_err(HuntError::store)?;
            let current = table
                .get(key.as_str())
                .map_err(HuntError::store)?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = current.saturating_add(1);
            table.insert(key.as_str(), next).map_err(HuntError::store)?;
            next
        };
        wt.commit().map_err(HuntError::store)?;
        Ok(value)
    }

    pub fn usage(&self, service: &str) -> Result<CapUsage> {
        self.usage_at(service, Utc::now())
    }

    pub fn usage_at(&self, service: &str, now: DateTime<Utc>) -> Result<CapUsage> {
        Ok(CapUsage {
            service: service.to_string(),
            hour_bucket: hour_bucket(now),
            count: self.current_count(service, now)?,
            limit: self.limit(service),
        })
    }

    /// Usage for every service with a configured limit or a stored counter.
    pub fn usage_all(&self) -> Result<Vec<CapUsage>> {
        let now = Utc::now();
        let mut services: Vec<String> = self
            .limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        {
            let rt = self.db.begin_read()?;
            let table = rt.open_table(HOURLY_CAPS).map_err(HuntError::store)?;
            for entry in table.iter().map_err(HuntError::store)? {
                let (k, _) = entry.map_err(HuntError::store)?;
                services.push(k.value().to_string());
            }
        }
        services.sort();
        services.dedup();
        services
            .iter()
            .map(|s| self.usage_at(s, now))
            .collect()
    }

    /// Drop counters left over from past hours.
    pub fn discard_stale_buckets(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = hour_bucket(now);
        let wt = self.db.begin_write()?;
        let removed = {
            let mut table = wt.open_table(HOURLY_CAPS).map_err(HuntError::store)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(HuntError::store)? {
                let (k, v) = entry.map_err(HuntError::store)?;
                let counter: HourlyCapCounter = serde_json::from_slice(v.value())?;
                if counter.hour_bucket != bucket {
                    stale.push(k.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(HuntError::store)?;
            }
            stale.len()
        };
        wt.commit().map_err(HuntError::store)?;
        Ok(removed)
    }

    /// Business counters as `service -> kind -> count`.
    pub fn stats(&self) -> Result<BTreeMap<String, BTreeMap<String, u64>>> {
        let rt = self.db.begin_read()?;
        let table = rt.open_table(STATS).map_err(HuntError::store)?;
        let mut out: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for entry in table.iter().map_err(HuntError::store)? {
            let (k, v) = entry.map_err(HuntError::store)?;
            let key = k.value();
            let Some((service, kind)) = key.split_once(KEY_SEP) else {
                continue;
            };
            out.entry(service.to_string())
                .or_default()
                .insert(kind.to_string(), v.value());
        }
        Ok(out)
    }

    /// Zero the business counters of one service, or of all services.
    pub fn reset_stats(&self, service: Option<&str>) -> Result<usize> {
        let wt = self.db.begin_write()?;
        let removed = {
            let mut table = wt.open_table(STATS).map_err(HuntError::store)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(HuntError::store)? {
                let (k, _) = entry.map_err(HuntError::store)?;
                let key = k.value();
                let matches = match service {
                    Some(s) => key.split_once(KEY_SEP).is_some_and(|(svc, _)| svc == s),
                    None => true,
                };
                if matches {
                    keys.push(key.to_string());
                }
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(HuntError::store)?;
            }
            keys.len()
        };
        wt.commit().map_err(HuntError::store)?;
        info!(service = service.unwrap_or("*"), removed, "stats reset");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
