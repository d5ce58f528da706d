//! Configuration beans and file loading.
//!
//! Every pluggable capability is a closed set of variants selected by a `type`
//! field. Files ending in `.json` are read as JSON, anything else as YAML.

use anyhow::Context;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::engine::ShellEngine;
use crate::priority::{ConstantPriority, PriorityScorer, PrometheusPriority};
use crate::provision::{ManualOutputProvisioner, RawInputProvisioner};
use crate::resource::{AlertInhibitor, ConsumableResource, InhibitReport, MaxInFlight};
use crate::signal::{AlertmanagerSource, PrometheusVectorSource, SignalCache};
use crate::target::{Target, TargetBuilder};
use crate::types::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid workflow in {}: {}", .path.display(), .problems.join("; "))]
    InvalidWorkflow {
        path: PathBuf,
        problems: Vec<String>,
    },
}

/// Read one configuration document.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Load a workflow definition, rejecting structurally invalid ones.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition, ConfigError> {
    let workflow: WorkflowDefinition = load_document(path)?;
    let problems = workflow.problems();
    if !problems.is_empty() {
        return Err(ConfigError::InvalidWorkflow {
            path: path.to_path_buf(),
            problems,
        });
    }
    info!(workflow = %workflow.name, version = %workflow.version, "Loaded workflow from {}", path.display());
    Ok(workflow)
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_ttl_seconds() -> u64 {
    60
}

fn default_request_timeout_seconds() -> u64 {
    30
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineConfig {
    Shell {
        #[serde(default = "default_shell")]
        shell: String,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Shell {
            shell: default_shell(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InputProvisionerConfig {
    Raw,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputProvisionerConfig {
    Manual,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertInhibitConfig {
    pub alertmanager_url: Url,
    pub alert_name: String,
    pub environment: String,
    /// Alert labels whose values are compared against the workflow.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Extra values that always match, in addition to the workflow identifiers.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ResourceConfig {
    AlertLabelInhibit(AlertInhibitConfig),
    AlertTargetInhibit(AlertInhibitConfig),
    MaxInFlight { limit: usize },
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusPriorityConfig {
    pub prometheus_url: Url,
    pub query: String,
    #[serde(default)]
    pub default_priority: i64,
    #[serde(default)]
    pub workflow_name_label: Option<String>,
    #[serde(default)]
    pub workflow_version_label: Option<String>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PriorityConfig {
    Constant { value: i64 },
    Prometheus(PrometheusPriorityConfig),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Bound on every signal fetch, including the refresh path of every cache.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

fn default_inputs() -> Vec<InputProvisionerConfig> {
    vec![InputProvisionerConfig::Raw]
}

fn default_outputs() -> Vec<OutputProvisionerConfig> {
    vec![OutputProvisionerConfig::Manual]
}

/// Everything needed to build a [`Target`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_inputs")]
    pub input_provisioners: Vec<InputProvisionerConfig>,
    #[serde(default = "default_outputs")]
    pub output_provisioners: Vec<OutputProvisionerConfig>,
    #[serde(default)]
    pub consumable_resources: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub priority: Option<PriorityConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

impl TargetConfig {
    /// Build the target. One HTTP client is created here and shared by every
    /// signal source.
    pub async fn build(&self) -> anyhow::Result<Target> {
        let timeout = Duration::from_secs(self.http.request_timeout_seconds);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let engine = match &self.engine {
            EngineConfig::Shell { shell } => Arc::new(ShellEngine::new(shell.clone())),
        };
        let mut builder = TargetBuilder::new(engine);
        for input in &self.input_provisioners {
            builder = match input {
                InputProvisionerConfig::Raw => builder.input_provisioner(Arc::new(RawInputProvisioner)),
            };
        }
        for output in &self.output_provisioners {
            builder = match output {
                OutputProvisionerConfig::Manual => {
                    builder.output_provisioner(Arc::new(ManualOutputProvisioner))
                }
            };
        }
        for (name, resource) in &self.consumable_resources {
            let built = resource
                .build(&client, timeout)
                .with_context(|| format!("Invalid consumable resource '{name}'"))?;
            builder = builder.resource(name.clone(), built);
        }
        if let Some(priority) = &self.priority {
            builder = builder.priority(priority.build(&client, timeout)?);
        }
        builder.build().await
    }
}

impl ResourceConfig {
    fn build(&self, client: &Client, timeout: Duration) -> anyhow::Result<Arc<dyn ConsumableResource>> {
        let (config, report) = match self {
            ResourceConfig::MaxInFlight { limit } => return Ok(Arc::new(MaxInFlight::new(*limit))),
            ResourceConfig::AlertLabelInhibit(config) => (config, InhibitReport::Label),
            ResourceConfig::AlertTargetInhibit(config) => (config, InhibitReport::Target),
        };
        let source = AlertmanagerSource::new(client.clone(), &config.alertmanager_url)?;
        Ok(Arc::new(AlertInhibitor::new(
            SignalCache::new(source, Duration::from_secs(config.ttl_seconds), timeout),
            config.alert_name.clone(),
            config.environment.clone(),
            config.labels.clone(),
            config.values.clone(),
            report,
        )))
    }
}

impl PriorityConfig {
    fn build(&self, client: &Client, timeout: Duration) -> anyhow::Result<Arc<dyn PriorityScorer>> {
        let scorer: Arc<dyn PriorityScorer> = match self {
            PriorityConfig::Constant { value } => Arc::new(ConstantPriority(*value)),
            PriorityConfig::Prometheus(config) => {
                let source = PrometheusVectorSource::new(
                    client.clone(),
                    &config.prometheus_url,
                    config.query.clone(),
                )?;
                Arc::new(PrometheusPriority::new(
                    SignalCache::new(source, Duration::from_secs(config.ttl_seconds), timeout),
                    config.default_priority,
                    config.workflow_name_label.clone(),
                    config.workflow_version_label.clone(),
                ))
            }
        };
        Ok(scorer)
    }
}
