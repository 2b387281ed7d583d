use crate::error::{HuntError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const HUNT_DIR: &str = ".hunt";
pub const CONFIG_FILE: &str = ".hunt/config.yaml";
pub const STATE_DB_FILE: &str = ".hunt/state.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn state_db_path(root: &Path) -> PathBuf {
    root.join(STATE_DB_FILE)
}

// ---------------------------------------------------------------------------
// Service name validation
// ---------------------------------------------------------------------------

static SERVICE_RE: OnceLock<Regex> = OnceLock::new();

fn service_re() -> &'static Regex {
    SERVICE_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Service names key the dedup and cap tables, so they stay lowercase slugs
/// ("radarr", "sonarr", "whisparr-v3").
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 32 || !service_re().is_match(name) {
        return Err(HuntError::InvalidName(name.to_string()));
    }
    Ok(())
}
