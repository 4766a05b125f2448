//! fleet-metrics — telemetry collection for the runner fleet.
//!
//! Scrapes each runner's exposition endpoint concurrently, classifies
//! transport failures per endpoint, and reduces successful payloads to one
//! typed `MetricSample` per runner.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector::collect(name → address)
//!   ├── one task per runner: scrape() → text | ScrapeFailure
//!   │     Timeout | Refused | Unreachable | Other
//!   ├── exposition::parse() → [MetricFamily]
//!   └── exposition::reduce() → MetricSample (container label filter)
//!
//! exposition::render() → text/plain for the controller's own /metrics
//! ```
//!
//! A slow runner is bounded by its own timeout and never delays the
//! others. Text that cannot be tokenized fails the whole collection so the
//! caller can retry on its next tick.

pub mod collector;
pub mod error;
pub mod exposition;
pub mod scrape;

pub use collector::{Collection, CollectorConfig, MetricsCollector};
pub use error::{ExpositionError, MetricsError};
pub use exposition::{MetricFamily, MetricType, Series, parse, reduce, render};
pub use scrape::{ScrapeFailure, scrape};
