//! Metrics collector — concurrent scrape fan-out across runners.
//!
//! Each runner is scraped on its own task with its own deadline and all
//! tasks are joined before returning, so one dead runner costs at most one
//! timeout and never delays its siblings.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fleet_state::{MetricSample, epoch_secs};

use crate::error::MetricsError;
use crate::exposition;
use crate::scrape::{ScrapeFailure, scrape};

/// Scrape parameters shared by every runner.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Port the runner's exporter listens on.
    pub port: u16,
    /// HTTP path of the exposition endpoint.
    pub path: String,
    /// Deadline per scrape.
    pub timeout: Duration,
    /// Value of the `container` label identifying the workload's series.
    pub container: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            port: 9779,
            path: "/metrics".to_string(),
            timeout: Duration::from_secs(5),
            container: "github-runner".to_string(),
        }
    }
}

/// Result of one collection cycle, keyed by runner name.
#[derive(Debug, Default)]
pub struct Collection {
    /// Parsed samples for runners that answered.
    pub samples: HashMap<String, MetricSample>,
    /// Classified failures for runners that did not.
    pub failures: HashMap<String, ScrapeFailure>,
}

/// Scrapes runner exporters and reduces their payloads to samples.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    config: CollectorConfig,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Scrape every target concurrently.
    ///
    /// `targets` maps runner name to address. An address without a port
    /// gets the configured exporter port. Per-runner transport failures are
    /// reported in [`Collection::failures`]; a payload that cannot be
    /// tokenized fails the whole cycle.
    pub async fn collect(
        &self,
        targets: HashMap<String, String>,
    ) -> Result<Collection, MetricsError> {
        let mut tasks = JoinSet::new();
        for (name, address) in targets {
            let endpoint = self.endpoint(&address);
            let path = self.config.path.clone();
            let timeout = self.config.timeout;
            tasks.spawn(async move {
                debug!(runner = %name, %endpoint, "scraping runner metrics");
                let result = scrape(&endpoint, &path, timeout).await;
                (name, result)
            });
        }

        let mut bodies = Vec::new();
        let mut collection = Collection::default();
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = joined?;
            match result {
                Ok(body) => bodies.push((name, body)),
                Err(failure) => {
                    log_failure(&name, &failure);
                    collection.failures.insert(name, failure);
                }
            }
        }

        let timestamp = epoch_secs();
        for (name, body) in bodies {
            let families = exposition::parse(&body).map_err(|source| MetricsError::Exposition {
                runner: name.clone(),
                source,
            })?;
            let sample = exposition::reduce(&families, &self.config.container, timestamp);
            collection.samples.insert(name, sample);
        }

        debug!(
            samples = collection.samples.len(),
            failures = collection.failures.len(),
            "metrics collection finished"
        );
        Ok(collection)
    }

    fn endpoint(&self, address: &str) -> String {
        if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{}", self.config.port)
        }
    }
}

fn log_failure(name: &str, failure: &ScrapeFailure) {
    match failure {
        ScrapeFailure::Timeout => info!(runner = %name, "metrics request timed out"),
        ScrapeFailure::Refused => debug!(runner = %name, "runner not listening yet"),
        ScrapeFailure::Unreachable => info!(runner = %name, "runner host unreachable"),
        ScrapeFailure::Other(e) => warn!(runner = %name, error = %e, "metrics request failed"),
    }
}
