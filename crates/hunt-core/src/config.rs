use crate::error::{HuntError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Dedup window: how long a processed item stays ineligible.
    #[serde(default = "default_retention_hours")]
    pub stateful_management_hours: u32,
    /// Pause between two cycles of the same instance.
    #[serde(default = "default_sleep_secs")]
    pub sleep_duration_secs: u64,
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

fn default_retention_hours() -> u32 {
    168
}

fn default_sleep_secs() -> u64 {
    900
}

fn default_api_timeout() -> u64 {
    120
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            stateful_management_hours: default_retention_hours(),
            sleep_duration_secs: default_sleep_secs(),
            api_timeout_secs: default_api_timeout(),
        }
    }
}

impl GeneralConfig {
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_duration_secs)
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig / InstanceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Outbound actions allowed per clock hour, shared by every instance.
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,
    #[serde(default = "default_true")]
    pub counts_against_budget: bool,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_hourly_cap() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            hourly_cap: default_hourly_cap(),
            counts_against_budget: true,
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `general.api_timeout_secs` for this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub monitored_only: bool,
    #[serde(default = "default_true")]
    pub skip_future_releases: bool,
    #[serde(default)]
    pub process_no_release_dates: bool,
    #[serde(default)]
    pub release_date_delay_days: i64,
    #[serde(default)]
    pub hunt_upgrade_items: i64,
    #[serde(default = "default_hunt_missing")]
    pub hunt_missing_items: i64,
    #[serde(default = "default_true")]
    pub tag_processed_items: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_tag: Option<String>,
}

fn default_instance_name() -> String {
    "Default".to_string()
}

fn default_hunt_missing() -> i64 {
    1
}

/// Longest post-release wait an instance may ask for (about 100 years).
pub const MAX_RELEASE_DELAY_DAYS: i64 = 36_500;

pub const DEFAULT_UPGRADE_TAG: &str = "huntarr-upgraded";
pub const DEFAULT_MISSING_TAG: &str = "huntarr-missing";

impl InstanceConfig {
    pub fn new(name: impl Into<String>, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            enabled: true,
            api_timeout_secs: None,
            monitored_only: true,
            skip_future_releases: true,
            process_no_release_dates: false,
            release_date_delay_days: 0,
            hunt_upgrade_items: 0,
            hunt_missing_items: default_hunt_missing(),
            tag_processed_items: true,
            upgrade_tag: None,
            missing_tag: None,
        }
    }

    /// Validate this entry and produce the read-only snapshot a worker runs on.
    ///
    /// A URL without a scheme is assumed to be plain `http://`.
    pub fn resolve(&self, service: &str, general: &GeneralConfig) -> Result<InstanceSettings> {
        paths::validate_service_name(service)?;
        let scope = format!("{service}/{}", self.name);

        let name = self.name.trim();
        if name.is_empty() {
            return Err(HuntError::invalid_config(scope, "instance name is empty"));
        }
        let mut api_url = self.api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            return Err(HuntError::invalid_config(scope, "api_url is empty"));
        }
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            api_url = format!("http://{api_url}");
        }
        let api_key = self.api_key.trim();
        if api_key.is_empty() {
            return Err(HuntError::invalid_config(scope, "api_key is empty"));
        }
        if self.release_date_delay_days > MAX_RELEASE_DELAY_DAYS {
            return Err(HuntError::invalid_config(
                scope,
                format!("release_date_delay_days must be at most {MAX_RELEASE_DELAY_DAYS}"),
            ));
        }
        let timeout = self.api_timeout_secs.unwrap_or(general.api_timeout_secs);
        if timeout == 0 {
            return Err(HuntError::invalid_config(scope, "api timeout must be positive"));
        }

        Ok(InstanceSettings {
            service: service.to_string(),
            instance_name: name.to_string(),
            api_url,
            api_key: api_key.to_string(),
            api_timeout: Duration::from_secs(timeout),
            monitored_only: self.monitored_only,
            skip_future_releases: self.skip_future_releases,
            process_no_release_dates: self.process_no_release_dates,
            release_date_delay_days: self.release_date_delay_days,
            hunt_upgrade_items: self.hunt_upgrade_items,
            hunt_missing_items: self.hunt_missing_items,
            tag_processed_items: self.tag_processed_items,
            counts_against_budget: true,
            upgrade_tag: self
                .upgrade_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_UPGRADE_TAG.to_string()),
            missing_tag: self
                .missing_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_MISSING_TAG.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// InstanceSettings
// ---------------------------------------------------------------------------

/// Validated, read-only per-instance snapshot handed to adapters and the
/// processing loop.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSettings {
    pub service: String,
    pub instance_name: String,
    pub api_url: String,
    pub api_key: String,
    pub api_timeout: Duration,
    pub monitored_only: bool,
    pub skip_future_releases: bool,
    pub process_no_release_dates: bool,
    pub release_date_delay_days: i64,
    pub hunt_upgrade_items: i64,
    pub hunt_missing_items: i64,
    pub tag_processed_items: bool,
    /// Whether a successful action consumes the service's hourly budget.
    pub counts_against_budget: bool,
    pub upgrade_tag: String,
    pub missing_tag: String,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            general: GeneralConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(HuntError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Every `(service, instance)` pair, enabled or not.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &ServiceConfig, &InstanceConfig)> {
        self.services.iter().flat_map(|(name, svc)| {
            svc.instances
                .iter()
                .map(move |inst| (name.as_str(), svc, inst))
        })
    }

    pub fn find_instance(&self, service: &str, instance: &str) -> Option<&InstanceConfig> {
        self.services
            .get(service)?
            .instances
            .iter()
            .find(|i| i.name.trim() == instance.trim())
    }

    /// Resolve every enabled instance. Disabled instances are skipped; invalid
    /// ones are returned as errors next to their names so one bad entry never
    /// blocks the others.
    pub fn resolve_enabled(&self) -> Vec<(String, String, Result<InstanceSettings>)> {
        self.instances()
            .filter(|(_, _, inst)| inst.enabled)
            .map(|(service, svc, inst)| {
                let resolved = inst.resolve(service, &self.general).map(|mut s| {
                    s.counts_against_budget = svc.counts_against_budget;
                    s
                });
                (service.to_string(), inst.name.clone(), resolved)
            })
            .collect()
    }

    pub fn hourly_caps(&self) -> BTreeMap<String, u32> {
        self.services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.hourly_cap))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.general.stateful_management_hours == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "general.stateful_management_hours must be at least 1".to_string(),
            });
        }
        if self.general.sleep_duration_secs < 60 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "general.sleep_duration_secs={} (<60 hammers the remote services)",
                    self.general.sleep_duration_secs
                ),
            });
        }

        for (service, svc) in &self.services {
            if paths::validate_service_name(service).is_err() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("service name '{service}' is not a lowercase slug"),
                });
            }
            if svc.hourly_cap == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("service '{service}' has hourly_cap=0 and will never act"),
                });
            }

            // Instance names key the dedup table; duplicates would share state.
            let mut seen = HashSet::new();
            for inst in &svc.instances {
                if !seen.insert(inst.name.trim()) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "service '{service}' has duplicate instance name '{}'",
                            inst.name
                        ),
                    });
                }
                if !inst.enabled {
                    continue;
                }
                if let Err(e) = inst.resolve(service, &self.general) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: e.to_string(),
                    });
                }
                if inst.hunt_upgrade_items <= 0 && inst.hunt_missing_items <= 0 {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!(
                            "instance '{service}/{}' hunts nothing (both hunt counts are 0)",
                            inst.name
                        ),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
