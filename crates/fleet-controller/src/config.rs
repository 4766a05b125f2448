//! Controller configuration.
//!
//! Secrets come from the environment (or CLI flags that fall back to it)
//! and are validated into [`Credentials`]. Loop tuning lives in an
//! optional TOML file parsed into [`ControllerConfig`]; every field has a
//! default so an empty file is valid.
//!
//! ```toml
//! tick_interval = "2s"
//! deregister_timeout = "60s"
//! delete_timeout = "2m"
//! provisioning_timeout = "5m"
//! scrape_timeout = "5s"
//! markers = ["self-hosted"]
//! container = "github-runner"
//! rollback_after_misses = 1
//! broker_capacity = 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_metrics::CollectorConfig;

use crate::error::{ControllerError, ControllerResult};
use crate::registry::Timeouts;

/// Validated secrets and endpoints the controller needs at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub owner: String,
    pub repo: String,
    pub github_pat: String,
    pub api_key: String,
    pub backend_url: String,
}

impl Credentials {
    /// Validate raw values. `repo` must be `owner/repo`.
    pub fn new(
        repo: &str,
        github_pat: impl Into<String>,
        api_key: impl Into<String>,
        backend_url: &str,
    ) -> ControllerResult<Self> {
        let (owner, name) = repo
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| {
                ControllerError::Credentials(format!("repo {repo:?} is not in owner/repo form"))
            })?;

        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ControllerError::Credentials("API key is empty".to_string()));
        }
        let backend_url = backend_url.trim_end_matches('/');
        if backend_url.is_empty() {
            return Err(ControllerError::Credentials("backend URL is empty".to_string()));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: name.to_string(),
            github_pat: github_pat.into(),
            api_key,
            backend_url: backend_url.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("backend_url", &self.backend_url)
            .finish_non_exhaustive()
    }
}

/// Loop tuning read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval: String,
    pub deregister_timeout: String,
    pub delete_timeout: String,
    pub provisioning_timeout: String,
    pub scrape_timeout: String,
    /// Job labels that request a runner from this controller.
    pub markers: Vec<String>,
    /// `container` label of the workload's metric series.
    pub container: String,
    pub metrics_port: u16,
    /// Consecutive scrape timeouts before a busy runner rolls back to ready.
    pub rollback_after_misses: u32,
    /// Per-subscriber broker buffer.
    pub broker_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "2s".to_string(),
            deregister_timeout: "60s".to_string(),
            delete_timeout: "2m".to_string(),
            provisioning_timeout: "5m".to_string(),
            scrape_timeout: "5s".to_string(),
            markers: vec!["self-hosted".to_string()],
            container: "github-runner".to_string(),
            metrics_port: 9779,
            rollback_after_misses: 1,
            broker_capacity: 64,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> ControllerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ControllerResult<Self> {
        let config: ControllerConfig =
            toml::from_str(content).map_err(|e| ControllerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ControllerResult<()> {
        for (field, value) in [
            ("tick_interval", &self.tick_interval),
            ("deregister_timeout", &self.deregister_timeout),
            ("delete_timeout", &self.delete_timeout),
            ("provisioning_timeout", &self.provisioning_timeout),
            ("scrape_timeout", &self.scrape_timeout),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(ControllerError::Config(format!(
                        "{field}: {value:?} is not a positive duration"
                    )));
                }
            }
        }
        if self.broker_capacity == 0 {
            return Err(ControllerError::Config("broker_capacity must be at least 1".into()));
        }
        if self.rollback_after_misses == 0 {
            return Err(ControllerError::Config(
                "rollback_after_misses must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(2))
    }

    pub fn timeouts(&self) -> Timeouts {
        let defaults = Timeouts::default();
        Timeouts {
            deregister: parse_duration(&self.deregister_timeout).unwrap_or(defaults.deregister),
            delete: parse_duration(&self.delete_timeout).unwrap_or(defaults.delete),
            provisioning: parse_duration(&self.provisioning_timeout)
                .unwrap_or(defaults.provisioning),
        }
    }

    pub fn collector(&self) -> CollectorConfig {
        let defaults = CollectorConfig::default();
        CollectorConfig {
            port: self.metrics_port,
            timeout: parse_duration(&self.scrape_timeout).unwrap_or(defaults.timeout),
            container: self.container.clone(),
            ..defaults
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
