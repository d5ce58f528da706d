//! Priority scorers.
//!
//! A score only orders admitted runs; computing it must never block or fail a
//! submission, so every failure path degrades to a default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::signal::{PrometheusVectorSource, SignalCache, SignalSource, VectorRow};

/// Priority used when a target has no scorer.
pub const DEFAULT_PRIORITY: i64 = 0;

#[async_trait]
pub trait PriorityScorer: Send + Sync {
    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn score(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        created: DateTime<Utc>,
        input: Option<&Value>,
    ) -> i64;
}

/// Same priority for every run.
#[derive(Clone, Debug)]
pub struct ConstantPriority(pub i64);

#[async_trait]
impl PriorityScorer for ConstantPriority {
    async fn score(&self, _: &str, _: &str, _: DateTime<Utc>, _: Option<&Value>) -> i64 {
        self.0
    }
}

/// Reads the priority from the first matching row of a Prometheus query.
pub struct PrometheusPriority<S = PrometheusVectorSource>
where
    S: SignalSource<Value = Vec<VectorRow>>,
{
    rows: SignalCache<S>,
    default_priority: i64,
    workflow_name_label: Option<String>,
    workflow_version_label: Option<String>,
}

impl<S> PrometheusPriority<S>
where
    S: SignalSource<Value = Vec<VectorRow>>,
{
    pub fn new(
        rows: SignalCache<S>,
        default_priority: i64,
        workflow_name_label: Option<String>,
        workflow_version_label: Option<String>,
    ) -> Self {
        Self {
            rows,
            default_priority,
            workflow_name_label,
            workflow_version_label,
        }
    }
}

#[async_trait]
impl<S> PriorityScorer for PrometheusPriority<S>
where
    S: SignalSource<Value = Vec<VectorRow>>,
{
    async fn score(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        _created: DateTime<Utc>,
        input: Option<&Value>,
    ) -> i64 {
        let mut required: BTreeMap<String, String> = input
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(label) = &self.workflow_name_label {
            required.insert(label.clone(), workflow_name.to_string());
        }
        if let Some(label) = &self.workflow_version_label {
            required.insert(label.clone(), workflow_version.to_string());
        }

        let rows = self.rows.get().await;
        let priority = select_priority(&rows, &required, self.default_priority);
        debug!(workflow = workflow_name, priority, "Scored run");
        priority
    }
}

/// Value of the first row whose labels include every `required` pair,
/// truncated; `default` when none survives or its value is not a finite number.
pub fn select_priority(rows: &[VectorRow], required: &BTreeMap<String, String>, default: i64) -> i64 {
    rows.iter()
        .find(|row| {
            required
                .iter()
                .all(|(label, value)| row.metric.get(label) == Some(value))
        })
        .and_then(VectorRow::numeric)
        .map(|value| value.trunc() as i64)
        .unwrap_or(default)
}
