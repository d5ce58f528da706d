//! Fakes shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runwarden::engine::{EngineOutput, EngineRequest, OperationMonitor, WorkflowEngine};
use runwarden::provision::{
    InputProvisioner, ManualOutputProvisioner, OutputProvisioner, OutputRequest, RuntimeProvisioner,
    RuntimeRequest,
};
use runwarden::{
    ExternalFile, InputFormat, OperationStatus, OutputFormat, ProvisionedOutput, TargetBuilder,
    WorkflowDefinition,
};

pub fn workflow(definition: Value) -> Arc<WorkflowDefinition> {
    Arc::new(serde_json::from_value(definition).expect("valid workflow"))
}

/// Produces a fixed set of outputs and records everything it is asked to do.
#[derive(Default)]
pub struct FakeEngine {
    outputs: Map<String, Value>,
    cleanup: Option<Value>,
    run_url: Option<String>,
    delay: Duration,
    fail: bool,
    panic: bool,
    pub runs: AtomicUsize,
    pub inputs: Mutex<Vec<Value>>,
    pub recovered: Mutex<Vec<Value>>,
    pub cleanups: Mutex<Vec<Value>>,
}

impl FakeEngine {
    pub fn producing(outputs: Value) -> Self {
        Self {
            outputs: outputs.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn with_cleanup(mut self, cleanup: Value) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_run_url(mut self, url: &str) -> Self {
        self.run_url = Some(url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn output(&self) -> EngineOutput {
        EngineOutput {
            outputs: self.outputs.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

#[async_trait]
impl WorkflowEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn supports_language(&self, language: &str) -> bool {
        language == "shell"
    }

    async fn run(&self, request: &EngineRequest, monitor: &dyn OperationMonitor) -> Result<EngineOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(request.real_input.clone());
        monitor.set_status(OperationStatus::Running).await;
        if let Some(url) = &self.run_url {
            monitor.set_run_url(url.clone()).await;
        }
        tokio::time::sleep(self.delay).await;
        if self.panic {
            panic!("engine bug");
        }
        if self.fail {
            bail!("step exited with status 3");
        }
        Ok(self.output())
    }

    async fn recover(
        &self,
        _request: &EngineRequest,
        state: Value,
        _monitor: &dyn OperationMonitor,
    ) -> Result<EngineOutput> {
        self.recovered.lock().unwrap().push(state);
        Ok(self.output())
    }

    async fn cleanup(&self, cleanup: Value, _monitor: &dyn OperationMonitor) -> Result<()> {
        self.cleanups.lock().unwrap().push(cleanup);
        Ok(())
    }
}

/// Stages files under `/staged`; anything under `/missing` fails preflight.
pub struct StagingInputProvisioner;

#[async_trait]
impl InputProvisioner for StagingInputProvisioner {
    fn name(&self) -> &str {
        "staging"
    }

    fn formats(&self) -> Vec<InputFormat> {
        vec![InputFormat::File, InputFormat::Directory]
    }

    async fn preflight(&self, _format: InputFormat, file: &ExternalFile) -> bool {
        !file.path.starts_with("/missing")
    }

    async fn provision(
        &self,
        _format: InputFormat,
        file: &ExternalFile,
        _monitor: &dyn OperationMonitor,
    ) -> Result<Value> {
        Ok(Value::String(format!("/staged{}", file.path)))
    }
}

/// URL outputs that take a configured time each and may fail.
#[derive(Default)]
pub struct SlowUrlProvisioner {
    delays: BTreeMap<String, Duration>,
    failing: BTreeSet<String>,
    pub finished: Mutex<Vec<String>>,
}

impl SlowUrlProvisioner {
    pub fn delay(mut self, output: &str, delay: Duration) -> Self {
        self.delays.insert(output.to_string(), delay);
        self
    }

    pub fn fail(mut self, output: &str) -> Self {
        self.failing.insert(output.to_string());
        self
    }
}

#[async_trait]
impl OutputProvisioner for SlowUrlProvisioner {
    fn name(&self) -> &str {
        "slow"
    }

    fn formats(&self) -> Vec<OutputFormat> {
        vec![OutputFormat::Url]
    }

    fn check_metadata(&self, _format: OutputFormat, _metadata: &Value) -> Vec<String> {
        Vec::new()
    }

    async fn provision(
        &self,
        request: OutputRequest,
        _monitor: &dyn OperationMonitor,
    ) -> Result<Vec<ProvisionedOutput>> {
        let delay = self.delays.get(&request.output).copied().unwrap_or_default();
        tokio::time::sleep(delay).await;
        self.finished.lock().unwrap().push(request.output.clone());
        if self.failing.contains(&request.output) {
            bail!("upload of '{}' was rejected", request.output);
        }
        Ok(vec![ProvisionedOutput::Url {
            external_ids: request.external_ids,
            url: request.value.as_str().unwrap_or_default().to_string(),
            labels: BTreeMap::new(),
        }])
    }
}

/// Publishes a link to the engine's view of the run.
pub struct RunLinkProvisioner;

#[async_trait]
impl RuntimeProvisioner for RunLinkProvisioner {
    fn name(&self) -> &str {
        "run-link"
    }

    async fn provision(
        &self,
        request: RuntimeRequest,
        _monitor: &dyn OperationMonitor,
    ) -> Result<Vec<ProvisionedOutput>> {
        let Some(url) = request.run_url else {
            bail!("run {} has no URL", request.run_id);
        };
        Ok(vec![ProvisionedOutput::Url {
            external_ids: request.external_ids,
            url,
            labels: BTreeMap::from([("kind".to_string(), "run-link".to_string())]),
        }])
    }
}

/// Fake engine plus the staging input and manual output provisioners.
pub fn builder(engine: Arc<FakeEngine>) -> TargetBuilder {
    TargetBuilder::new(engine)
        .input_provisioner(Arc::new(StagingInputProvisioner))
        .output_provisioner(Arc::new(ManualOutputProvisioner))
}
