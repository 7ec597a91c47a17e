use crate::types::ProjectId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Unsupported management service URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("Duplicate subscribed project id: {0}")]
    DuplicateProject(ProjectId),
}

/// Admin listener
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ManagementService {
    /// Base URL of the management API, e.g. `http://xp-management/v1`
    pub url: Url,
    /// Bound on every management request, including on-demand project
    /// settings fetches on the serving path.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for 429 and 5xx responses.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ManagementService {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

/// Periodic full reload, reconciling anything the update feed missed.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Poller {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
}

impl Default for Poller {
    fn default() -> Self {
        Poller {
            enabled: false,
            interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct UpdateFeed {
    #[serde(default = "default_teardown_timeout_secs")]
    pub teardown_timeout_secs: u64,
}

impl Default for UpdateFeed {
    fn default() -> Self {
        UpdateFeed {
            teardown_timeout_secs: default_teardown_timeout_secs(),
        }
    }
}

fn default_teardown_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DebugOutput {
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

impl Default for DebugOutput {
    fn default() -> Self {
        DebugOutput {
            output_path: default_output_path(),
        }
    }
}

fn default_output_path() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Per-segmenter transform settings.
#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct SegmenterRunner {
    /// Request field to read the raw value from. Defaults to the segmenter
    /// name.
    pub source: Option<String>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    /// Projects served by this instance. Empty means every project.
    #[serde(default)]
    pub project_ids: Vec<ProjectId>,
    pub management_service: ManagementService,
    #[serde(default)]
    pub poller: Poller,
    #[serde(default)]
    pub update_feed: UpdateFeed,
    #[serde(default)]
    pub debug: DebugOutput,
    #[serde(default)]
    pub segmenters: HashMap<String, SegmenterRunner>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        let scheme = self.management_service.url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ValidationError::UnsupportedScheme(scheme.to_string()));
        }

        if self.management_service.timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("management_service.timeout_secs"));
        }
        if self.poller.enabled && self.poller.interval_secs == 0 {
            return Err(ValidationError::ZeroDuration("poller.interval_secs"));
        }
        if self.update_feed.teardown_timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration(
                "update_feed.teardown_timeout_secs",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for project_id in &self.project_ids {
            if !seen.insert(project_id) {
                return Err(ValidationError::DuplicateProject(*project_id));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poller
            .enabled
            .then(|| Duration::from_secs(self.poller.interval_secs))
    }

    /// Turns the poller on, returning whether it was off. Without an update
    /// feed, polling is the only way experiment changes reach the store.
    pub fn ensure_polling(&mut self) -> bool {
        if self.poller.enabled {
            return false;
        }

        self.poller.enabled = true;
        if self.poller.interval_secs == 0 {
            self.poller.interval_secs = default_poll_interval_secs();
        }
        true
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.update_feed.teardown_timeout_secs)
    }
}
