//! Prometheus instant-vector source.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

use super::alerts::api_endpoint;
use super::cache::SignalSource;

/// One row of an instant vector: label set plus `[timestamp, "value"]`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct VectorRow {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: (f64, String),
}

impl VectorRow {
    /// The sample value, if it parses as a finite number.
    pub fn numeric(&self) -> Option<f64> {
        self.value.1.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Vec<VectorRow>,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs one fixed query against `<base>/api/v1/query`.
pub struct PrometheusVectorSource {
    client: Client,
    endpoint: Url,
    query: String,
}

impl PrometheusVectorSource {
    pub fn new(client: Client, base: &Url, query: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: api_endpoint(base, &["api", "v1", "query"])?,
            query: query.into(),
        })
    }
}

#[async_trait]
impl SignalSource for PrometheusVectorSource {
    type Value = Vec<VectorRow>;

    fn describe(&self) -> String {
        format!("{} ({})", self.endpoint, self.query)
    }

    async fn fetch(&self) -> Result<Vec<VectorRow>> {
        let response: QueryResponse = self
            .client
            .post(self.endpoint.clone())
            .form(&[("query", self.query.as_str())])
            .send()
            .await
            .context("Failed to query Prometheus")?
            .error_for_status()
            .context("Prometheus rejected the query")?
            .json()
            .await
            .context("Failed to parse Prometheus response")?;

        if response.status != "success" {
            bail!(
                "Prometheus returned status '{}': {}",
                response.status,
                response.error.unwrap_or_default()
            );
        }
        let Some(data) = response.data else {
            bail!("Prometheus response has no data");
        };
        if data.result_type != "vector" {
            bail!("Expected an instant vector but got '{}'", data.result_type);
        }
        Ok(data.result)
    }
}
