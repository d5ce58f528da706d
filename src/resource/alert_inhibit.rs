use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::info;

use super::{ConsumableResource, ResourceResponse};
use crate::signal::{
    matching_labels, workflow_identifiers, Alert, AlertmanagerSource, SignalCache, SignalSource,
};

/// What a denial reports for each matching alert label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InhibitReport {
    /// The name of the label that matched.
    Label,
    /// The workflow identifier or configured value that matched.
    Target,
}

/// Denies runs while a named alert is firing for the workflow.
pub struct AlertInhibitor<S = AlertmanagerSource>
where
    S: SignalSource<Value = Vec<Alert>>,
{
    alerts: SignalCache<S>,
    alert_name: String,
    environment: String,
    labels: Vec<String>,
    values: Vec<String>,
    report: InhibitReport,
}

impl<S> AlertInhibitor<S>
where
    S: SignalSource<Value = Vec<Alert>>,
{
    pub fn new(
        alerts: SignalCache<S>,
        alert_name: impl Into<String>,
        environment: impl Into<String>,
        labels: Vec<String>,
        values: Vec<String>,
        report: InhibitReport,
    ) -> Self {
        Self {
            alerts,
            alert_name: alert_name.into(),
            environment: environment.into(),
            labels,
            values,
            report,
        }
    }
}

#[async_trait]
impl<S> ConsumableResource for AlertInhibitor<S>
where
    S: SignalSource<Value = Vec<Alert>>,
{
    async fn request(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        run_id: &str,
        _input: Option<&Value>,
    ) -> ResourceResponse {
        let alerts = self.alerts.get().await;
        let mut values = self.values.clone();
        values.extend(workflow_identifiers(workflow_name, workflow_version));

        let reasons: BTreeSet<String> =
            matching_labels(&alerts, &self.alert_name, &self.environment, &self.labels, &values)
                .into_iter()
                .map(|m| match self.report {
                    InhibitReport::Label => m.label,
                    InhibitReport::Target => m.identifier,
                })
                .collect();

        if reasons.is_empty() {
            ResourceResponse::Available
        } else {
            info!(
                run_id,
                workflow = workflow_name,
                alert = %self.alert_name,
                ?reasons,
                "Run inhibited by alert"
            );
            ResourceResponse::Denied(reasons.into_iter().collect())
        }
    }
}
