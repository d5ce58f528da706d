//! Workflow engine capability.
//!
//! The engine executes the workflow body; the processor only sees recovery
//! state, status updates and the final [`EngineOutput`].

pub mod shell;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::types::{OperationStatus, Parameter, WorkflowDefinition};

pub use shell::ShellEngine;

/// Everything an engine needs to execute one run.
#[derive(Clone, Debug)]
pub struct EngineRequest {
    pub run_id: String,
    pub workflow: Arc<WorkflowDefinition>,
    /// Arguments with every file/directory reference replaced by its provisioned value.
    pub real_input: Value,
    pub engine_arguments: Value,
}

/// Result of a successful engine operation; stored as the operation's recovery state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOutput {
    /// Raw value per declared output name.
    pub outputs: Map<String, Value>,
    /// Present when the engine left something that must be cleaned up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<Value>,
}

/// Callback surface handed to engines and provisioners while an operation runs.
///
/// Implementations persist each call in its own transaction; failures are
/// logged, never returned, so a flaky store cannot abort a running step.
#[async_trait]
pub trait OperationMonitor: Send + Sync {
    async fn store_recovery_state(&self, state: Value);

    /// Report an in-progress status. Terminal statuses are owned by the processor.
    async fn set_status(&self, status: OperationStatus);

    async fn set_run_url(&self, url: String);

    async fn debug_info(&self, info: Value);
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports_language(&self, language: &str) -> bool;

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Declared engine parameters. An engine that declares none accepts no
    /// engine arguments.
    fn engine_parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }

    /// Engine-specific checks beyond the declared parameter types.
    fn check_engine_arguments(&self, arguments: &Value) -> Vec<String> {
        let _ = arguments;
        Vec::new()
    }

    async fn run(
        &self,
        request: &EngineRequest,
        monitor: &dyn OperationMonitor,
    ) -> Result<EngineOutput>;

    /// Re-attach to an execution that was live when the driver stopped.
    ///
    /// Engines that cannot re-attach simply run again.
    async fn recover(
        &self,
        request: &EngineRequest,
        state: Value,
        monitor: &dyn OperationMonitor,
    ) -> Result<EngineOutput> {
        let _ = state;
        self.run(request, monitor).await
    }

    async fn cleanup(&self, cleanup: Value, monitor: &dyn OperationMonitor) -> Result<()> {
        let _ = (cleanup, monitor);
        Ok(())
    }
}
