//! In-memory collaborators for engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::adapter::{FetchFilters, HistorySink, HuntMode, MediaAdapter};
use crate::config::{Config, GeneralConfig, InstanceConfig, InstanceSettings};
use crate::error::{HuntError, Result};
use crate::history::HistoryEntry;
use crate::selection::Candidate;
use crate::services::HuntServices;
use crate::store::open_tmp;

#[derive(Default)]
pub(crate) struct MockAdapter {
    pub candidates: Mutex<Vec<Candidate>>,
    pub fail_fetch: AtomicBool,
    pub fail_tag: AtomicBool,
    pub failing_ids: Mutex<HashSet<String>>,
    pub declined_ids: Mutex<HashSet<String>>,
    pub acted: Mutex<Vec<String>>,
    pub tagged: Mutex<Vec<(String, String)>>,
    pub fetches: AtomicUsize,
    /// Milliseconds every `act` call waits before answering.
    pub act_delay_ms: AtomicU64,
}

impl MockAdapter {
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Self::default()
        }
    }

    pub fn acted(&self) -> Vec<String> {
        self.acted.lock().unwrap().clone()
    }

    pub fn act_count(&self) -> usize {
        self.acted.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaAdapter for MockAdapter {
    async fn fetch_eligible(
        &self,
        _settings: &InstanceSettings,
        filters: &FetchFilters,
    ) -> Result<Vec<Candidate>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(HuntError::FetchFailed("connection refused".to_string()));
        }
        let all = self.candidates.lock().unwrap().clone();
        Ok(all
            .into_iter()
            .filter(|c| !filters.monitored_only || c.monitored)
            .collect())
    }

    async fn act(&self, _settings: &InstanceSettings, _mode: HuntMode, id: &str) -> Result<bool> {
        let delay = self.act_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_ids.lock().unwrap().contains(id) {
            return Err(HuntError::ActionFailed {
                id: id.to_string(),
                reason: "HTTP 500".to_string(),
            });
        }
        if self.declined_ids.lock().unwrap().contains(id) {
            return Ok(false);
        }
        self.acted.lock().unwrap().push(id.to_string());
        Ok(true)
    }

    async fn tag(&self, _settings: &InstanceSettings, id: &str, label: &str) -> Result<()> {
        if self.fail_tag.load(Ordering::SeqCst) {
            return Err(HuntError::ActionFailed {
                id: id.to_string(),
                reason: "tag endpoint missing".to_string(),
            });
        }
        self.tagged
            .lock()
            .unwrap()
            .push((id.to_string(), label.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingHistory {
    pub entries: Mutex<Vec<HistoryEntry>>,
}

impl RecordingHistory {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl HistorySink for RecordingHistory {
    fn record(&self, entry: HistoryEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

/// Candidates `0..n`, all released a month ago.
pub(crate) fn released(n: usize) -> Vec<Candidate> {
    let date = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
    (0..n)
        .map(|i| Candidate::new(i.to_string(), format!("Movie {i}")).with_release_date(date.clone()))
        .collect()
}

pub(crate) fn settings(service: &str, instance: &str, upgrade_count: i64) -> InstanceSettings {
    let mut inst = InstanceConfig::new(instance, "localhost:7878", "secret");
    inst.hunt_upgrade_items = upgrade_count;
    inst.hunt_missing_items = 0;
    inst.resolve(service, &GeneralConfig::default()).unwrap()
}

pub(crate) fn services_tmp(config: &Config) -> (TempDir, HuntServices, Arc<RecordingHistory>) {
    let (dir, db) = open_tmp();
    let history = Arc::new(RecordingHistory::default());
    let services = HuntServices::from_db(db, config).with_history(history.clone());
    (dir, services, history)
}
