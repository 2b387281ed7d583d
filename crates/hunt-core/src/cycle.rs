//! Per-instance run state.
//!
//! Workers drive `Idle -> Running -> Idle`. An operator reset can mark any
//! instance `ResetPending`; the flag is consumed at the next `begin_cycle`
//! and also wakes the worker's inter-cycle sleep.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

use crate::error::{HuntError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Idle,
    Running,
    ResetPending,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleStatus::Idle => "idle",
            CycleStatus::Running => "running",
            CycleStatus::ResetPending => "reset_pending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleState {
    pub service: String,
    pub instance: String,
    pub status: CycleStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
}

impl CycleState {
    fn new(service: &str, instance: &str) -> Self {
        Self {
            service: service.to_string(),
            instance: instance.to_string(),
            status: CycleStatus::Idle,
            started_at: None,
            last_completed_at: None,
            next_cycle_at: None,
            cycles_completed: 0,
        }
    }
}

/// Answer to a status query: one instance, or every instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CycleStatusView {
    Instance(CycleState),
    Service(BTreeMap<String, CycleState>),
}

struct Entry {
    state: CycleState,
    wake: Arc<Notify>,
}

type Key = (String, String);

fn key(service: &str, instance: &str) -> Key {
    (service.to_string(), instance.to_string())
}

#[derive(Default)]
pub struct CycleTracker {
    entries: RwLock<HashMap<Key, Entry>>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an instance. Re-registering keeps the existing state.
    pub fn register(&self, service: &str, instance: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key(service, instance)).or_insert_with(|| Entry {
            state: CycleState::new(service, instance),
            wake: Arc::new(Notify::new()),
        });
    }

    pub fn unregister(&self, service: &str, instance: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(service, instance))
            .is_some()
    }

    pub fn get(&self, service: &str, instance: &str) -> Option<CycleState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(service, instance))
            .map(|e| e.state.clone())
    }

    /// Single state when `instance` is given, otherwise every instance of
    /// `service` keyed by instance name (empty for an unknown service).
    pub fn status(&self, service: &str, instance: Option<&str>) -> Option<CycleStatusView> {
        match instance {
            Some(i) => self.get(service, i).map(CycleStatusView::Instance),
            None => {
                let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
                let map = entries
                    .iter()
                    .filter(|((s, _), _)| s == service)
                    .map(|((_, i), e)| (i.clone(), e.state.clone()))
                    .collect();
                Some(CycleStatusView::Service(map))
            }
        }
    }

    pub fn all(&self) -> Vec<CycleState> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<CycleState> = entries.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| (&a.service, &a.instance).cmp(&(&b.service, &b.instance)));
        states
    }

    /// Flag the instance for reset and wake its worker if it is sleeping.
    pub fn request_reset(&self, service: &str, instance: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(&key(service, instance))
            .ok_or_else(|| HuntError::NotConfigured {
                service: service.to_string(),
                instance: instance.to_string(),
            })?;
        entry.state.status = CycleStatus::ResetPending;
        entry.wake.notify_one();
        info!(service, instance, "cycle reset requested");
        Ok(())
    }

    /// Mark the instance running. Returns whether a pending reset was consumed.
    pub fn begin_cycle(&self, service: &str, instance: &str) -> Result<bool> {
        self.begin_cycle_at(service, instance, Utc::now())
    }

    pub fn begin_cycle_at(&self, service: &str, instance: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(&key(service, instance))
            .ok_or_else(|| HuntError::NotConfigured {
                service: service.to_string(),
                instance: instance.to_string(),
            })?;
        let consumed = entry.state.status == CycleStatus::ResetPending;
        entry.state.status = CycleStatus::Running;
        entry.state.started_at = Some(now);
        entry.state.next_cycle_at = None;
        Ok(consumed)
    }

    /// Return to idle. A reset requested while the cycle ran survives.
    pub fn end_cycle(&self, service: &str, instance: &str, next_cycle_at: Option<DateTime<Utc>>) {
        self.end_cycle_at(service, instance, next_cycle_at, Utc::now());
    }

    pub fn end_cycle_at(
        &self,
        service: &str,
        instance: &str,
        next_cycle_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&key(service, instance)) {
            if entry.state.status == CycleStatus::Running {
                entry.state.status = CycleStatus::Idle;
            }
            entry.state.last_completed_at = Some(now);
            entry.state.next_cycle_at = next_cycle_at;
            entry.state.cycles_completed += 1;
        }
    }

    /// Notifier fired by `request_reset`, for the worker's sleep.
    pub fn wake_handle(&self, service: &str, instance: &str) -> Option<Arc<Notify>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(service, instance))
            .map(|e| e.wake.clone())
    }
}
