use thiserror::Error;

#[derive(Debug, Error)]
pub enum HuntError {
    #[error("not initialized: run 'hunt config init'")]
    NotInitialized,

    #[error("instance not configured: {service}/{instance}")]
    NotConfigured { service: String, instance: String },

    #[error("worker already running for {service}/{instance}")]
    AlreadyRunning { service: String, instance: String },

    #[error("invalid configuration for {scope}: {reason}")]
    InvalidConfig { scope: String, reason: String },

    #[error("invalid service name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidName(String),

    #[error("candidate fetch failed: {0}")]
    FetchFailed(String),

    #[error("action failed for item {id}: {reason}")]
    ActionFailed { id: String, reason: String },

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HuntError {
    pub(crate) fn store(e: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(e.to_string())
    }

    pub(crate) fn invalid_config(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HuntError>;
