//! Alertmanager alert source and label matching.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

use super::cache::SignalSource;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub silenced_by: Vec<String>,
    #[serde(default)]
    pub inhibited_by: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Receiver {
    Name(String),
    Named { name: String },
}

/// One alert as reported by `GET /api/v1/alerts`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    #[serde(default)]
    pub receivers: Vec<Receiver>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: AlertStatus,
}

#[derive(Deserialize)]
struct AlertResponse {
    status: String,
    #[serde(default)]
    data: Vec<Alert>,
    #[serde(default)]
    error: Option<String>,
}

/// Polls `<base>/api/v1/alerts`.
pub struct AlertmanagerSource {
    client: Client,
    endpoint: Url,
}

impl AlertmanagerSource {
    pub fn new(client: Client, base: &Url) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: api_endpoint(base, &["api", "v1", "alerts"])?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SignalSource for AlertmanagerSource {
    type Value = Vec<Alert>;

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }

    async fn fetch(&self) -> Result<Vec<Alert>> {
        let response: AlertResponse = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .context("Failed to fetch alerts")?
            .error_for_status()
            .context("Alertmanager rejected the request")?
            .json()
            .await
            .context("Failed to parse alert response")?;

        if response.status != "success" {
            bail!(
                "Alertmanager returned status '{}': {}",
                response.status,
                response.error.unwrap_or_default()
            );
        }
        Ok(response.data)
    }
}

/// Append API path segments to a configured base URL.
pub(crate) fn api_endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut endpoint = base.clone();
    endpoint
        .path_segments_mut()
        .map_err(|_| anyhow!("'{base}' cannot be used as a base URL"))?
        .pop_if_empty()
        .extend(segments);
    Ok(endpoint)
}

/// Identifiers a workflow is known by in alert labels: its name, and
/// `name_version` with every `.` in the version replaced by `_`.
pub fn workflow_identifiers(name: &str, version: &str) -> [String; 2] {
    [name.to_string(), format!("{name}_{}", version.replace('.', "_"))]
}

/// A label on a live alert whose value matched one of the values of interest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AlertMatch {
    pub label: String,
    /// The value of interest that matched, as configured.
    pub identifier: String,
}

/// Alerts named `alert_name` in `environment` carrying any of `labels` with a
/// value in `values`. Values compare case-insensitively; an alert without an
/// `environment` label applies to every environment.
pub fn matching_labels(
    alerts: &[Alert],
    alert_name: &str,
    environment: &str,
    labels: &[String],
    values: &[String],
) -> Vec<AlertMatch> {
    let values: Vec<(String, &String)> = values.iter().map(|v| (v.to_lowercase(), v)).collect();
    let mut matches = Vec::new();
    for alert in alerts {
        if alert.labels.get("alertname").map(String::as_str) != Some(alert_name) {
            continue;
        }
        if alert
            .labels
            .get("environment")
            .is_some_and(|env| env != environment)
        {
            continue;
        }
        for label in labels {
            let Some(actual) = alert.labels.get(label) else {
                continue;
            };
            let actual = actual.to_lowercase();
            for (lowered, original) in &values {
                if *lowered == actual {
                    matches.push(AlertMatch {
                        label: label.clone(),
                        identifier: (*original).clone(),
                    });
                }
            }
        }
    }
    matches
}
