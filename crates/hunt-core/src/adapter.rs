//! Seams to the remote media-management services.
//!
//! Concrete HTTP clients live outside this crate; they implement
//! [`MediaAdapter`] and are registered by service name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::InstanceSettings;
use crate::error::Result;
use crate::history::HistoryEntry;
use crate::selection::Candidate;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// What a cycle is hunting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HuntMode {
    /// Items with no file at all.
    Missing,
    /// Items whose file is below the quality cutoff.
    Upgrade,
}

impl HuntMode {
    pub const ALL: [HuntMode; 2] = [HuntMode::Missing, HuntMode::Upgrade];

    pub fn as_str(self) -> &'static str {
        match self {
            HuntMode::Missing => "missing",
            HuntMode::Upgrade => "upgrade",
        }
    }

    /// Business counter bumped for every successful action.
    pub fn stat_kind(self) -> &'static str {
        match self {
            HuntMode::Missing => "hunted",
            HuntMode::Upgrade => "upgraded",
        }
    }

    pub fn history_action(self) -> &'static str {
        self.as_str()
    }

    pub fn hunt_count(self, settings: &InstanceSettings) -> i64 {
        match self {
            HuntMode::Missing => settings.hunt_missing_items,
            HuntMode::Upgrade => settings.hunt_upgrade_items,
        }
    }

    pub fn tag_label(self, settings: &InstanceSettings) -> &str {
        match self {
            HuntMode::Missing => &settings.missing_tag,
            HuntMode::Upgrade => &settings.upgrade_tag,
        }
    }
}

impl std::fmt::Display for HuntMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFilters {
    pub mode: HuntMode,
    pub monitored_only: bool,
    pub page_size: usize,
}

impl FetchFilters {
    pub fn new(settings: &InstanceSettings, mode: HuntMode) -> Self {
        Self {
            mode,
            monitored_only: settings.monitored_only,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One remote service's candidate source, action invoker and tagger.
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// A bounded page of items eligible for the filter's mode.
    /// Failures should be reported as `HuntError::FetchFailed`.
    async fn fetch_eligible(
        &self,
        settings: &InstanceSettings,
        filters: &FetchFilters,
    ) -> Result<Vec<Candidate>>;

    /// Trigger the remote side effect. `Ok(false)` means the service
    /// declined the request.
    async fn act(&self, settings: &InstanceSettings, mode: HuntMode, id: &str) -> Result<bool>;

    async fn tag(&self, _settings: &InstanceSettings, _id: &str, _label: &str) -> Result<()> {
        Ok(())
    }
}

/// Append-only audit log. Recording never fails from the caller's view.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: HistoryEntry);
}

/// Adapters keyed by service name.
pub type AdapterRegistry = HashMap<String, Arc<dyn MediaAdapter>>;
