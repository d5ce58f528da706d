use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{EngineOutput, EngineRequest, OperationMonitor, WorkflowEngine};
use crate::types::{InputType, OperationStatus, Parameter};

/// Runs the workflow source with a local shell.
///
/// The real input is written to stdin as JSON and the script must print a JSON
/// object mapping output names to values on stdout. The optional `cleanup`
/// engine argument is a command run during the CLEANUP phase.
#[derive(Clone, Debug)]
pub struct ShellEngine {
    shell: String,
}

impl ShellEngine {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn execute(&self, script: &str, stdin: &[u8], run_id: &str) -> Result<std::process::Output> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .env("RUNWARDEN_RUN_ID", run_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.shell))?;

        // Feed stdin while stdout drains, or a chatty script fills its pipe and stalls.
        let pipe = child.stdin.take();
        let feed = async move {
            if let Some(mut input) = pipe {
                // Scripts that never read their input may exit before it is written.
                if let Err(e) = input.write_all(stdin).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e).context("Failed to write workflow input");
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        output.context("Failed to collect workflow output")
    }
}

impl Default for ShellEngine {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl WorkflowEngine for ShellEngine {
    fn name(&self) -> &str {
        "shell"
    }

    fn supports_language(&self, language: &str) -> bool {
        language == "shell"
    }

    fn check_engine_arguments(&self, arguments: &Value) -> Vec<String> {
        match arguments.get("timeoutSeconds").and_then(Value::as_i64) {
            Some(seconds) if seconds <= 0 => vec![format!(
                "Engine parameter 'timeoutSeconds' must be positive but got {seconds}"
            )],
            _ => Vec::new(),
        }
    }

    fn engine_parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter {
                name: "timeoutSeconds".to_string(),
                kind: InputType::Integer,
                optional: true,
            },
            Parameter {
                name: "cleanup".to_string(),
                kind: InputType::String,
                optional: true,
            },
        ]
    }

    async fn run(
        &self,
        request: &EngineRequest,
        monitor: &dyn OperationMonitor,
    ) -> Result<EngineOutput> {
        let stdin = serde_json::to_vec(&request.real_input)?;
        monitor.set_status(OperationStatus::Running).await;
        info!(run_id = %request.run_id, workflow = %request.workflow.name, "Starting shell workflow");

        let execution = self.execute(&request.workflow.source, &stdin, &request.run_id);
        let output = match request
            .engine_arguments
            .get("timeoutSeconds")
            .and_then(Value::as_u64)
        {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), execution)
                .await
                .map_err(|_| anyhow::anyhow!("Workflow timed out after {seconds}s"))??,
            None => execution.await?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stderr.is_empty() {
            monitor.debug_info(json!({ "stderr": stderr })).await;
        }
        if !output.status.success() {
            bail!(
                "Workflow exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.lines().last().unwrap_or("no diagnostics")
            );
        }

        let outputs: Map<String, Value> = serde_json::from_slice(&output.stdout)
            .context("Workflow must print a JSON object of outputs on stdout")?;
        debug!(run_id = %request.run_id, count = outputs.len(), "Shell workflow finished");

        let cleanup = request
            .engine_arguments
            .get("cleanup")
            .and_then(Value::as_str)
            .map(|command| json!({ "command": command, "runId": request.run_id }));
        Ok(EngineOutput { outputs, cleanup })
    }

    async fn cleanup(&self, cleanup: Value, monitor: &dyn OperationMonitor) -> Result<()> {
        let command = cleanup
            .get("command")
            .and_then(Value::as_str)
            .context("Cleanup state has no command")?;
        let run_id = cleanup.get("runId").and_then(Value::as_str).unwrap_or_default();

        monitor.set_status(OperationStatus::Running).await;
        let output = self.execute(command, b"", run_id).await?;
        if !output.status.success() {
            bail!(
                "Cleanup exited with status {}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}
