//! The execution environment runs are submitted against.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use crate::engine::WorkflowEngine;
use crate::priority::PriorityScorer;
use crate::provision::{InputProvisioner, OutputProvisioner, RuntimeProvisioner};
use crate::resource::ConsumableResource;
use crate::types::{InputFormat, OutputFormat};

/// Immutable composition of one engine, provisioners by format, runtime
/// provisioners, named consumable resources and an optional priority scorer.
///
/// Built once by [`TargetBuilder`]; shared read-only by every run.
pub struct Target {
    engine: Arc<dyn WorkflowEngine>,
    inputs: HashMap<InputFormat, Arc<dyn InputProvisioner>>,
    outputs: HashMap<OutputFormat, Arc<dyn OutputProvisioner>>,
    runtimes: Vec<Arc<dyn RuntimeProvisioner>>,
    resources: BTreeMap<String, Arc<dyn ConsumableResource>>,
    priority: Option<Arc<dyn PriorityScorer>>,
}

impl Target {
    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }

    pub fn input_provisioner(&self, format: InputFormat) -> Option<&Arc<dyn InputProvisioner>> {
        self.inputs.get(&format)
    }

    pub fn output_provisioner(&self, format: OutputFormat) -> Option<&Arc<dyn OutputProvisioner>> {
        self.outputs.get(&format)
    }

    pub fn runtime_provisioners(&self) -> &[Arc<dyn RuntimeProvisioner>] {
        &self.runtimes
    }

    pub fn resources(&self) -> &BTreeMap<String, Arc<dyn ConsumableResource>> {
        &self.resources
    }

    pub fn priority_scorer(&self) -> Option<&Arc<dyn PriorityScorer>> {
        self.priority.as_ref()
    }
}

pub struct TargetBuilder {
    engine: Arc<dyn WorkflowEngine>,
    inputs: Vec<Arc<dyn InputProvisioner>>,
    outputs: Vec<Arc<dyn OutputProvisioner>>,
    runtimes: Vec<Arc<dyn RuntimeProvisioner>>,
    resources: Vec<(String, Arc<dyn ConsumableResource>)>,
    priority: Option<Arc<dyn PriorityScorer>>,
}

impl TargetBuilder {
    pub fn new(engine: Arc<dyn WorkflowEngine>) -> Self {
        Self {
            engine,
            inputs: Vec::new(),
            outputs: Vec::new(),
            runtimes: Vec::new(),
            resources: Vec::new(),
            priority: None,
        }
    }

    pub fn input_provisioner(mut self, provisioner: Arc<dyn InputProvisioner>) -> Self {
        self.inputs.push(provisioner);
        self
    }

    pub fn output_provisioner(mut self, provisioner: Arc<dyn OutputProvisioner>) -> Self {
        self.outputs.push(provisioner);
        self
    }

    pub fn runtime_provisioner(mut self, provisioner: Arc<dyn RuntimeProvisioner>) -> Self {
        self.runtimes.push(provisioner);
        self
    }

    pub fn resource(mut self, name: impl Into<String>, resource: Arc<dyn ConsumableResource>) -> Self {
        self.resources.push((name.into(), resource));
        self
    }

    pub fn priority(mut self, scorer: Arc<dyn PriorityScorer>) -> Self {
        self.priority = Some(scorer);
        self
    }

    /// Start every component exactly once and assemble the lookups.
    ///
    /// Two provisioners claiming the same format, or two resources sharing a
    /// name, are configuration errors.
    pub async fn build(self) -> Result<Target> {
        self.engine
            .startup()
            .await
            .with_context(|| format!("Failed to start engine '{}'", self.engine.name()))?;

        let mut inputs: HashMap<InputFormat, Arc<dyn InputProvisioner>> = HashMap::new();
        for provisioner in self.inputs {
            provisioner
                .startup()
                .await
                .with_context(|| format!("Failed to start input provisioner '{}'", provisioner.name()))?;
            for format in provisioner.formats() {
                if let Some(existing) = inputs.get(&format) {
                    bail!(
                        "Input format '{format}' is claimed by both '{}' and '{}'",
                        existing.name(),
                        provisioner.name()
                    );
                }
                inputs.insert(format, provisioner.clone());
            }
        }

        let mut outputs: HashMap<OutputFormat, Arc<dyn OutputProvisioner>> = HashMap::new();
        for provisioner in self.outputs {
            provisioner
                .startup()
                .await
                .with_context(|| format!("Failed to start output provisioner '{}'", provisioner.name()))?;
            for format in provisioner.formats() {
                if let Some(existing) = outputs.get(&format) {
                    bail!(
                        "Output format '{format}' is claimed by both '{}' and '{}'",
                        existing.name(),
                        provisioner.name()
                    );
                }
                outputs.insert(format, provisioner.clone());
            }
        }

        for provisioner in &self.runtimes {
            provisioner
                .startup()
                .await
                .with_context(|| format!("Failed to start runtime provisioner '{}'", provisioner.name()))?;
        }

        let mut resources = BTreeMap::new();
        for (name, resource) in self.resources {
            resource
                .startup(&name)
                .await
                .with_context(|| format!("Failed to start consumable resource '{name}'"))?;
            if resources.insert(name.clone(), resource).is_some() {
                bail!("Consumable resource '{name}' is configured twice");
            }
        }

        if let Some(scorer) = &self.priority {
            scorer.startup().await.context("Failed to start priority scorer")?;
        }

        info!(
            engine = self.engine.name(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            runtimes = self.runtimes.len(),
            resources = resources.len(),
            "Target ready"
        );

        Ok(Target {
            engine: self.engine,
            inputs,
            outputs,
            runtimes: self.runtimes,
            resources,
            priority: self.priority,
        })
    }
}
