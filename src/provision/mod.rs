//! Provisioner capabilities.
//!
//! Input provisioners make caller files available to the engine, output
//! provisioners turn raw engine outputs into [`ProvisionedOutput`] records, and
//! runtime provisioners record facts about the run itself.

pub mod manual;
pub mod raw;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::engine::OperationMonitor;
use crate::types::{
    ExternalFile, ExternalId, InputFormat, OutputFormat, ProvisionedOutput, WorkflowDefinition,
};

pub use manual::ManualOutputProvisioner;
pub use raw::RawInputProvisioner;

#[async_trait]
pub trait InputProvisioner: Send + Sync {
    fn name(&self) -> &str;

    fn formats(&self) -> Vec<InputFormat>;

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Cheap feasibility check run during PREFLIGHT.
    async fn preflight(&self, format: InputFormat, file: &ExternalFile) -> bool {
        let _ = (format, file);
        true
    }

    /// Make `file` available and return the value the engine receives in its place.
    async fn provision(
        &self,
        format: InputFormat,
        file: &ExternalFile,
        monitor: &dyn OperationMonitor,
    ) -> Result<Value>;
}

/// One declared output to provision.
#[derive(Clone, Debug)]
pub struct OutputRequest {
    pub run_id: String,
    pub output: String,
    pub format: OutputFormat,
    /// What the engine produced for this output.
    pub value: Value,
    /// Caller-supplied metadata for this output.
    pub metadata: Value,
    /// External identifiers required by the run's inputs.
    pub external_ids: BTreeSet<ExternalId>,
}

#[async_trait]
pub trait OutputProvisioner: Send + Sync {
    fn name(&self) -> &str;

    fn formats(&self) -> Vec<OutputFormat>;

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Violations in the caller's metadata for an output of `format`.
    fn check_metadata(&self, format: OutputFormat, metadata: &Value) -> Vec<String>;

    async fn preflight(&self, format: OutputFormat, metadata: &Value) -> bool {
        let _ = (format, metadata);
        true
    }

    async fn provision(
        &self,
        request: OutputRequest,
        monitor: &dyn OperationMonitor,
    ) -> Result<Vec<ProvisionedOutput>>;
}

/// Facts about a finished run, handed to every runtime provisioner.
#[derive(Clone, Debug)]
pub struct RuntimeRequest {
    pub run_id: String,
    pub workflow: Arc<WorkflowDefinition>,
    pub run_url: Option<String>,
    pub external_ids: BTreeSet<ExternalId>,
}

#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    fn name(&self) -> &str;

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    async fn provision(
        &self,
        request: RuntimeRequest,
        monitor: &dyn OperationMonitor,
    ) -> Result<Vec<ProvisionedOutput>>;
}
