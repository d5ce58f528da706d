//! Externally polled signals.
//!
//! One [`SignalCache`] per configured gate or scorer; sources own an injected
//! `reqwest::Client` whose timeout comes from configuration.

pub mod alerts;
pub mod cache;
pub mod prometheus;

pub use alerts::{matching_labels, workflow_identifiers, Alert, AlertMatch, AlertmanagerSource};
pub use cache::{SignalCache, SignalSource, FAILED_REFRESH_RETRY_DELAY};
pub use prometheus::{PrometheusVectorSource, VectorRow};
