use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::HistorySink;
use crate::admission::{AdmissionController, CapUsage};
use crate::config::{Config, GeneralConfig};
use crate::cycle::CycleTracker;
use crate::dedup::DedupStore;
use crate::error::Result;
use crate::history::HistoryLog;
use crate::paths;
use crate::stats_cache::{CacheSnapshot, StatsCache};
use crate::store::StateDb;

const USAGE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Process-wide shared state handed to every worker by `Arc`.
pub struct HuntServices {
    pub db: StateDb,
    pub dedup: Arc<DedupStore>,
    pub admission: Arc<AdmissionController>,
    pub tracker: Arc<CycleTracker>,
    pub history: Arc<dyn HistorySink>,
    pub general: GeneralConfig,
    usage_cache: StatsCache<Vec<CapUsage>>,
}

impl HuntServices {
    /// Open `<root>/.hunt/state.redb` and build services for `config`.
    pub fn open(root: &Path, config: &Config) -> Result<Self> {
        let db = StateDb::open(&paths::state_db_path(root))?;
        Ok(Self::from_db(db, config))
    }

    /// History goes to the durable [`HistoryLog`] in the same database.
    pub fn from_db(db: StateDb, config: &Config) -> Self {
        let history: Arc<dyn HistorySink> = Arc::new(HistoryLog::new(db.clone()));
        Self {
            dedup: Arc::new(DedupStore::new(
                db.clone(),
                config.general.stateful_management_hours,
            )),
            admission: Arc::new(AdmissionController::with_limits(
                db.clone(),
                config.hourly_caps(),
            )),
            tracker: Arc::new(CycleTracker::new()),
            history,
            general: config.general.clone(),
            usage_cache: StatsCache::new(USAGE_CACHE_TTL),
            db,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    /// Cached budget usage for every service; refreshed in the background.
    pub fn usage_summary(&self) -> CacheSnapshot<Vec<CapUsage>> {
        let admission = self.admission.clone();
        self.usage_cache.get_or_refresh(move || admission.usage_all())
    }
}
