//! Orchestration driver.
//!
//! Walks a run through its phases against any [`RunStore`]:
//!
//! ```text
//! INITIALIZING  resolve file references into input/external identifiers
//! PREFLIGHT     cheap provisioner checks; failure trips preflight_failed
//! PROVISION_IN  one operation per file/directory argument
//! RUNNING       one engine operation
//! PROVISION_OUT one operation per declared output and per runtime provisioner
//! CLEANUP       one operation, only if the engine left cleanup state
//! SUCCEEDED
//! ```
//!
//! Operations of one generation run concurrently. Each completion is applied
//! in its own transaction; the run's own lock serializes them.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{EngineOutput, EngineRequest, OperationMonitor};
use crate::error::SubmitError;
use crate::lifecycle::{
    terminal_signal, ActiveOperation, ActiveRun, NewRun, RunStore, Terminal, TerminalWaiter,
};
use crate::priority::DEFAULT_PRIORITY;
use crate::provision::{OutputRequest, RuntimeRequest};
use crate::resource::ResourceResponse;
use crate::target::Target;
use crate::typecheck;
use crate::types::{
    ExternalFile, InputFormat, InputType, OperationStatus, OutputFormat, Phase, ProvisionedOutput,
    RunRequest, WorkflowDefinition,
};

// ─── Operation state ──────────────────────────────────────────

/// Recovery-state document of every operation the processor spawns.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationState {
    /// What the operation was spawned to do.
    slot: Value,
    /// Last progress checkpoint reported by the engine or provisioner.
    #[serde(default)]
    progress: Value,
    /// Present once the operation has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl OperationState {
    fn initial(slot: impl Serialize) -> Result<Value> {
        Ok(serde_json::to_value(OperationState {
            slot: serde_json::to_value(slot)?,
            ..Default::default()
        })?)
    }
}

/// A file or directory argument awaiting provisioning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputSlot {
    /// JSON pointer to the argument within the run's arguments.
    pointer: String,
    format: InputFormat,
    file: ExternalFile,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum OutputSlot {
    Output {
        name: String,
        format: OutputFormat,
        value: Value,
        metadata: Value,
    },
    Runtime {
        index: usize,
        name: String,
    },
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn collect_slots(kind: &InputType, value: &Value, pointer: String, slots: &mut Vec<InputSlot>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    if let InputType::List { of } = kind {
        for (i, item) in value.as_array().into_iter().flatten().enumerate() {
            collect_slots(of, item, format!("{pointer}/{i}"), slots)?;
        }
    } else if let Some(format) = kind.provision_format() {
        let file: ExternalFile = serde_json::from_value(value.clone())
            .with_context(|| format!("Argument at '{pointer}' is not a file reference"))?;
        slots.push(InputSlot {
            pointer,
            format,
            file,
        });
    }
    Ok(())
}

/// Every file/directory reference in `arguments`, in parameter order.
fn input_slots(workflow: &WorkflowDefinition, arguments: &Value) -> Result<Vec<InputSlot>> {
    let mut slots = Vec::new();
    for parameter in &workflow.parameters {
        if let Some(value) = arguments.get(&parameter.name) {
            collect_slots(
                &parameter.kind,
                value,
                format!("/{}", escape_pointer(&parameter.name)),
                &mut slots,
            )?;
        }
    }
    Ok(slots)
}

/// Run `apply` inside one transaction; nothing is committed if it fails.
async fn transact<S, T, F>(store: &S, apply: F) -> Result<T>
where
    S: RunStore,
    T: Send,
    F: FnOnce(&mut S::Tx) -> Result<T> + Send,
{
    let mut tx = store.begin().await.context("Failed to begin transaction")?;
    let value = apply(&mut tx)?;
    store.commit(tx).await.context("Failed to commit transaction")?;
    Ok(value)
}

// ─── Monitor ──────────────────────────────────────────────────

type OperationOf<S> = <<S as RunStore>::Run as ActiveRun>::Operation;

/// Persists engine/provisioner callbacks for one operation.
struct StoreMonitor<S: RunStore> {
    store: Arc<S>,
    run: Arc<S::Run>,
    operation: OperationOf<S>,
}

impl<S: RunStore> StoreMonitor<S> {
    async fn apply<F>(&self, what: &str, apply: F)
    where
        F: FnOnce(&mut S::Tx) -> Result<()> + Send,
    {
        if let Err(e) = transact(self.store.as_ref(), apply).await {
            warn!(
                run_id = %self.run.id(),
                operation = self.operation.index(),
                "Failed to record {what}: {e:#}"
            );
        }
    }
}

#[async_trait]
impl<S: RunStore> OperationMonitor for StoreMonitor<S> {
    async fn store_recovery_state(&self, progress: Value) {
        let operation = &self.operation;
        self.apply("recovery state", |tx| {
            let mut state: OperationState = serde_json::from_value(operation.recovery_state())?;
            state.progress = progress;
            operation.set_recovery_state(serde_json::to_value(state)?, tx)?;
            Ok(())
        })
        .await;
    }

    async fn set_status(&self, status: OperationStatus) {
        if status.is_terminal() {
            debug!(status = ?status, "Ignoring terminal status reported by a step");
            return;
        }
        let operation = &self.operation;
        self.apply("status", |tx| Ok(operation.set_status(status, tx)?))
            .await;
    }

    async fn set_run_url(&self, url: String) {
        let run = &self.run;
        self.apply("run URL", |tx| {
            run.set_run_url(url, tx);
            Ok(())
        })
        .await;
    }

    async fn debug_info(&self, info: Value) {
        let operation = &self.operation;
        self.apply("debug info", |tx| {
            operation.debug_info(info, tx);
            Ok(())
        })
        .await;
    }
}

// ─── Handle ───────────────────────────────────────────────────

/// A submitted run and the task driving it.
pub struct RunHandle<R: ActiveRun> {
    run: Arc<R>,
    waiter: TerminalWaiter,
    driver: JoinHandle<()>,
}

impl<R: ActiveRun> RunHandle<R> {
    pub fn run(&self) -> &Arc<R> {
        &self.run
    }

    /// Block until the run is terminal.
    pub async fn wait(self) -> Terminal {
        if let Err(e) = self.driver.await {
            error!(run_id = %self.run.id(), "Run driver did not finish: {e}");
        }
        self.waiter.try_take().unwrap_or_else(|| {
            Terminal::Fault("driver stopped before the run reached a terminal phase".to_string())
        })
    }
}

// ─── Processor ────────────────────────────────────────────────

pub struct Processor<S: RunStore> {
    target: Arc<Target>,
    store: Arc<S>,
}

impl<S: RunStore> Clone for Processor<S> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: RunStore> Processor<S> {
    pub fn new(target: Arc<Target>, store: Arc<S>) -> Self {
        Self { target, store }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Validate, admit, score and create a run, then start driving it.
    ///
    /// Rejected requests never create a run or open a transaction.
    pub async fn submit(
        &self,
        workflow: Arc<WorkflowDefinition>,
        request: RunRequest,
    ) -> Result<RunHandle<S::Run>, SubmitError> {
        let violations = typecheck::check_request(&self.target, &workflow, &request);
        if !violations.is_empty() {
            warn!(workflow = %workflow.name, count = violations.len(), "Rejected invalid request");
            return Err(SubmitError::BadArguments(violations));
        }

        let run_id = Uuid::now_v7().to_string();
        self.admit(&workflow, &run_id, &request).await?;

        let created = Utc::now();
        let priority = match self.target.priority_scorer() {
            Some(scorer) => {
                scorer
                    .score(
                        &workflow.name,
                        &workflow.version,
                        created,
                        request.priority_input.as_ref(),
                    )
                    .await
            }
            None => DEFAULT_PRIORITY,
        };

        let (signal, waiter) = terminal_signal();
        let new_run = NewRun {
            id: run_id.clone(),
            workflow: workflow.clone(),
            request,
            created,
            priority,
        };
        let creator = self.store.clone();
        let created_run = transact(self.store.as_ref(), move |tx| {
            creator.create_run(new_run, signal, tx)
        })
        .await;
        let run = match created_run {
            Ok(run) => run,
            Err(e) => {
                self.release(&workflow, &run_id).await;
                return Err(SubmitError::Internal(e.context("Failed to create run")));
            }
        };

        info!(run_id = %run_id, workflow = %workflow.name, version = %workflow.version, priority, "Run accepted");
        let driver = tokio::spawn(self.clone().drive_to_terminal(run.clone()));
        Ok(RunHandle {
            run,
            waiter,
            driver,
        })
    }

    /// Submit and block until the run is terminal.
    pub async fn run(
        &self,
        workflow: Arc<WorkflowDefinition>,
        request: RunRequest,
    ) -> Result<Terminal, SubmitError> {
        Ok(self.submit(workflow, request).await?.wait().await)
    }

    /// Re-drive a non-terminal run from its current phase.
    ///
    /// Resources are told the run already holds them. Live engine operations
    /// are re-attached, other unfinished operations relaunched, and succeeded
    /// ones contribute their stored results.
    pub async fn resume(&self, run: Arc<S::Run>, waiter: TerminalWaiter) -> RunHandle<S::Run> {
        let workflow = run.workflow();
        let run_id = run.id();
        for resource in self.target.resources().values() {
            resource.recover(&workflow.name, &workflow.version, &run_id).await;
        }
        info!(run_id = %run_id, phase = %run.phase(), "Resuming run");
        let driver = tokio::spawn(self.clone().drive_to_terminal(run.clone()));
        RunHandle {
            run,
            waiter,
            driver,
        }
    }

    /// Ask every resource, union all denial reasons, and roll back grants on denial.
    async fn admit(
        &self,
        workflow: &WorkflowDefinition,
        run_id: &str,
        request: &RunRequest,
    ) -> Result<(), SubmitError> {
        let resources = self.target.resources();
        let responses = join_all(resources.iter().map(|(name, resource)| async move {
            let input = request.consumable_resources.get(name);
            let response = resource
                .request(&workflow.name, &workflow.version, run_id, input)
                .await;
            (name, response)
        }))
        .await;

        let mut reasons: Vec<String> = Vec::new();
        let mut granted = Vec::new();
        for (name, response) in responses {
            match response {
                ResourceResponse::Available => granted.push(name),
                ResourceResponse::Denied(denials) => {
                    debug!(resource = %name, ?denials, "Resource denied run");
                    for reason in denials {
                        if !reasons.contains(&reason) {
                            reasons.push(reason);
                        }
                    }
                }
            }
        }
        if reasons.is_empty() {
            return Ok(());
        }

        for name in granted {
            resources[name]
                .release(&workflow.name, &workflow.version, run_id)
                .await;
        }
        info!(workflow = %workflow.name, ?reasons, "Run denied by consumable resources");
        Err(SubmitError::Denied(reasons))
    }

    async fn release(&self, workflow: &WorkflowDefinition, run_id: &str) {
        for resource in self.target.resources().values() {
            resource.release(&workflow.name, &workflow.version, run_id).await;
        }
    }

    async fn drive_to_terminal(self, run: Arc<S::Run>) {
        let run_id = run.id();
        let fault = match AssertUnwindSafe(self.drive(&run)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some("run driver panicked".to_string()),
        };

        if let Some(reason) = fault {
            error!(run_id = %run_id, "Run faulted: {reason}");
            let faulting = run.clone();
            if let Err(e) = transact(self.store.as_ref(), move |tx| Ok(faulting.fault(&reason, tx))).await {
                error!(run_id = %run_id, "Failed to record fault: {e:#}");
            }
        }

        info!(run_id = %run_id, phase = %run.phase(), "Run finished");
        self.release(&run.workflow(), &run_id).await;
    }

    async fn drive(&self, run: &Arc<S::Run>) -> Result<()> {
        loop {
            let phase = run.phase();
            debug!(run_id = %run.id(), phase = %phase, "Driving run");
            match phase {
                Phase::Initializing => self.resolve_inputs(run).await?,
                Phase::Preflight => self.preflight(run).await?,
                Phase::ProvisionIn | Phase::Running | Phase::ProvisionOut | Phase::Cleanup => {
                    match self.complete_operations(run, phase).await? {
                        Some(results) => self.advance(run, phase, results).await?,
                        None => return Ok(()),
                    }
                }
                Phase::Succeeded | Phase::Failed => return Ok(()),
            }
        }
    }

    // ── Phase steps ──

    async fn resolve_inputs(&self, run: &Arc<S::Run>) -> Result<()> {
        let slots = input_slots(&run.workflow(), &run.arguments())?;
        let external_ids: BTreeSet<_> = slots
            .iter()
            .flat_map(|slot| slot.file.external_ids.iter().cloned())
            .collect();
        let input_ids: BTreeSet<String> = slots.iter().map(|slot| slot.file.path.clone()).collect();
        debug!(run_id = %run.id(), inputs = input_ids.len(), external_ids = external_ids.len(), "Resolved inputs");

        transact(self.store.as_ref(), |tx| {
            run.set_input_ids(external_ids, input_ids, tx)?;
            run.transition(Phase::Preflight, Vec::new(), tx)?;
            Ok(())
        })
        .await
    }

    async fn preflight(&self, run: &Arc<S::Run>) -> Result<()> {
        let workflow = run.workflow();
        let slots = input_slots(&workflow, &run.arguments())?;
        let metadata = run.metadata();
        let absent = Value::Null;

        let mut checks = Vec::new();
        for slot in &slots {
            let provisioner = self
                .target
                .input_provisioner(slot.format)
                .with_context(|| format!("No input provisioner for format '{}'", slot.format))?;
            checks.push(provisioner.preflight(slot.format, &slot.file));
        }
        for output in &workflow.outputs {
            let provisioner = self
                .target
                .output_provisioner(output.format)
                .with_context(|| format!("No output provisioner for format '{}'", output.format))?;
            let entry = metadata.get(&output.name).unwrap_or(&absent);
            checks.push(provisioner.preflight(output.format, entry));
        }
        let passed = join_all(checks).await.into_iter().all(|ok| ok);

        if !passed {
            warn!(run_id = %run.id(), "Preflight failed");
            return transact(self.store.as_ref(), |tx| {
                run.preflight_failed(tx);
                run.transition(Phase::Failed, Vec::new(), tx)?;
                Ok(())
            })
            .await;
        }

        let states = slots
            .into_iter()
            .map(OperationState::initial)
            .collect::<Result<Vec<_>>>()?;
        transact(self.store.as_ref(), |tx| {
            run.transition(Phase::ProvisionIn, states, tx)?;
            Ok(())
        })
        .await
    }

    /// Run every unfinished operation of the current generation.
    ///
    /// Returns the results in operation order, or `None` if the run left
    /// `phase` (an operation failed).
    async fn complete_operations(&self, run: &Arc<S::Run>, phase: Phase) -> Result<Option<Vec<Value>>> {
        let mut results: Vec<Option<Value>> = Vec::new();
        let mut pending = Vec::new();
        for operation in run.operations() {
            let state: OperationState = serde_json::from_value(operation.recovery_state())
                .with_context(|| format!("Operation {} has unreadable state", operation.index()))?;
            match (operation.status(), state.result) {
                (OperationStatus::Succeeded, result) => results.push(Some(result.unwrap_or(Value::Null))),
                (OperationStatus::Failed, _) => return Ok(None),
                (_, _) => {
                    let position = results.len();
                    results.push(None);
                    let processor = self.clone();
                    let run = run.clone();
                    pending.push(tokio::spawn(async move {
                        (position, processor.launch(run, operation, phase).await)
                    }));
                }
            }
        }

        for joined in join_all(pending).await {
            let (position, outcome) = joined.map_err(|e| anyhow!("Operation task failed: {e}"))?;
            results[position] = outcome?;
        }

        if run.phase() != phase {
            return Ok(None);
        }
        results
            .into_iter()
            .map(|result| result.context("Operation finished without a result"))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Execute one operation and record its outcome. `Ok(None)` means it failed.
    async fn launch(&self, run: Arc<S::Run>, operation: OperationOf<S>, phase: Phase) -> Result<Option<Value>> {
        let live = operation.is_live();
        let state: OperationState = serde_json::from_value(operation.recovery_state())?;
        let op_type = self.operation_type(phase, &state.slot)?;

        transact(self.store.as_ref(), |tx| {
            if operation.op_type().is_none() {
                operation.set_type(&op_type, tx)?;
            }
            operation.set_status(OperationStatus::Waiting, tx)?;
            Ok(())
        })
        .await?;

        let monitor = StoreMonitor::<S> {
            store: self.store.clone(),
            run: run.clone(),
            operation: operation.clone(),
        };
        match self.step(&run, phase, &state, live, &monitor).await {
            Ok(result) => {
                let stored = result.clone();
                transact(self.store.as_ref(), |tx| {
                    let mut state: OperationState = serde_json::from_value(operation.recovery_state())?;
                    state.result = Some(stored);
                    operation.set_recovery_state(serde_json::to_value(state)?, tx)?;
                    operation.set_status(OperationStatus::Succeeded, tx)?;
                    Ok(())
                })
                .await?;
                debug!(run_id = %run.id(), operation = operation.index(), op_type = %op_type, "Operation succeeded");
                Ok(Some(result))
            }
            Err(e) => {
                warn!(run_id = %run.id(), operation = operation.index(), op_type = %op_type, "Operation failed: {e:#}");
                let message = format!("{e:#}");
                transact(self.store.as_ref(), |tx| {
                    operation.debug_info(json!({ "error": message }), tx);
                    operation.set_status(OperationStatus::Failed, tx)?;
                    Ok(())
                })
                .await?;
                Ok(None)
            }
        }
    }

    fn operation_type(&self, phase: Phase, slot: &Value) -> Result<String> {
        Ok(match phase {
            Phase::ProvisionIn => {
                let slot: InputSlot = serde_json::from_value(slot.clone())?;
                let provisioner = self
                    .target
                    .input_provisioner(slot.format)
                    .with_context(|| format!("No input provisioner for format '{}'", slot.format))?;
                format!("provision-in:{}", provisioner.name())
            }
            Phase::Running => format!("engine:{}", self.target.engine().name()),
            Phase::ProvisionOut => match serde_json::from_value(slot.clone())? {
                OutputSlot::Output { name, .. } => format!("provision-out:{name}"),
                OutputSlot::Runtime { name, .. } => format!("runtime:{name}"),
            },
            Phase::Cleanup => format!("cleanup:{}", self.target.engine().name()),
            other => bail!("Phase {other} has no operations"),
        })
    }

    async fn step(
        &self,
        run: &Arc<S::Run>,
        phase: Phase,
        state: &OperationState,
        live: bool,
        monitor: &StoreMonitor<S>,
    ) -> Result<Value> {
        match phase {
            Phase::ProvisionIn => {
                let slot: InputSlot = serde_json::from_value(state.slot.clone())?;
                let provisioner = self
                    .target
                    .input_provisioner(slot.format)
                    .with_context(|| format!("No input provisioner for format '{}'", slot.format))?;
                let value = provisioner
                    .provision(slot.format, &slot.file, monitor)
                    .await
                    .with_context(|| format!("Failed to provision '{}'", slot.file.path))?;
                Ok(json!({ "pointer": slot.pointer, "value": value }))
            }
            Phase::Running => {
                let workflow = run.workflow();
                let request = EngineRequest {
                    run_id: run.id(),
                    workflow: workflow.clone(),
                    real_input: run.real_input().context("Real input has not been set")?,
                    engine_arguments: run.engine_arguments(),
                };
                let engine = self.target.engine();
                let output = if live {
                    info!(run_id = %request.run_id, "Re-attaching to live engine operation");
                    engine.recover(&request, state.progress.clone(), monitor).await?
                } else {
                    engine.run(&request, monitor).await?
                };
                for declared in &workflow.outputs {
                    if !output.outputs.contains_key(&declared.name) {
                        bail!("Engine did not produce output '{}'", declared.name);
                    }
                }
                Ok(serde_json::to_value(output)?)
            }
            Phase::ProvisionOut => {
                let records = match serde_json::from_value(state.slot.clone())? {
                    OutputSlot::Output {
                        name,
                        format,
                        value,
                        metadata,
                    } => {
                        let provisioner = self
                            .target
                            .output_provisioner(format)
                            .with_context(|| format!("No output provisioner for format '{format}'"))?;
                        provisioner
                            .provision(
                                OutputRequest {
                                    run_id: run.id(),
                                    output: name.clone(),
                                    format,
                                    value,
                                    metadata,
                                    external_ids: run.required_external_ids().unwrap_or_default(),
                                },
                                monitor,
                            )
                            .await
                            .with_context(|| format!("Failed to provision output '{name}'"))?
                    }
                    OutputSlot::Runtime { index, name } => {
                        let provisioner = self
                            .target
                            .runtime_provisioners()
                            .get(index)
                            .with_context(|| format!("Runtime provisioner '{name}' is not configured"))?;
                        provisioner
                            .provision(
                                RuntimeRequest {
                                    run_id: run.id(),
                                    workflow: run.workflow(),
                                    run_url: run.run_url(),
                                    external_ids: run.required_external_ids().unwrap_or_default(),
                                },
                                monitor,
                            )
                            .await
                            .with_context(|| format!("Runtime provisioner '{name}' failed"))?
                    }
                };
                Ok(serde_json::to_value(records)?)
            }
            Phase::Cleanup => {
                self.target
                    .engine()
                    .cleanup(state.slot.clone(), monitor)
                    .await
                    .context("Cleanup failed")?;
                Ok(Value::Null)
            }
            other => bail!("Phase {other} has no operations"),
        }
    }

    /// Apply a finished generation's results and move to the next phase.
    async fn advance(&self, run: &Arc<S::Run>, phase: Phase, results: Vec<Value>) -> Result<()> {
        let store = self.store.as_ref();
        match phase {
            Phase::ProvisionIn => {
                let mut real_input = match run.arguments() {
                    Value::Null => Value::Object(Map::new()),
                    arguments => arguments,
                };
                for result in results {
                    let pointer = result
                        .get("pointer")
                        .and_then(Value::as_str)
                        .context("Provisioned input has no pointer")?;
                    let slot = real_input
                        .pointer_mut(pointer)
                        .with_context(|| format!("Argument '{pointer}' disappeared"))?;
                    *slot = result.get("value").cloned().unwrap_or(Value::Null);
                }
                let states = vec![OperationState::initial(Value::Null)?];
                transact(store, |tx| {
                    run.set_real_input(real_input, tx)?;
                    run.set_extra_input_ids_handled(tx);
                    run.transition(Phase::Running, states, tx)?;
                    Ok(())
                })
                .await
            }
            Phase::Running => {
                let output: EngineOutput = match results.into_iter().next() {
                    Some(result) => serde_json::from_value(result)?,
                    None => bail!("Running phase finished without an engine operation"),
                };
                if run.real_input().is_none() || !run.extra_input_ids_handled() {
                    bail!("Output provisioning requires resolved inputs");
                }

                let workflow = run.workflow();
                let metadata = run.metadata();
                let mut slots = Vec::new();
                for declared in &workflow.outputs {
                    slots.push(OutputSlot::Output {
                        name: declared.name.clone(),
                        format: declared.format,
                        value: output.outputs.get(&declared.name).cloned().unwrap_or(Value::Null),
                        metadata: metadata.get(&declared.name).cloned().unwrap_or(Value::Null),
                    });
                }
                for (index, provisioner) in self.target.runtime_provisioners().iter().enumerate() {
                    slots.push(OutputSlot::Runtime {
                        index,
                        name: provisioner.name().to_string(),
                    });
                }
                let states = slots
                    .into_iter()
                    .map(OperationState::initial)
                    .collect::<Result<Vec<_>>>()?;

                transact(store, |tx| {
                    if let Some(cleanup) = output.cleanup {
                        run.set_cleanup_state(cleanup, tx);
                    }
                    run.transition(Phase::ProvisionOut, states, tx)?;
                    Ok(())
                })
                .await
            }
            Phase::ProvisionOut => {
                let mut records = Vec::new();
                for result in results {
                    let batch: Vec<ProvisionedOutput> = serde_json::from_value(result)?;
                    records.extend(batch);
                }
                let cleanup = run.cleanup_state();
                transact(store, |tx| {
                    for record in &records {
                        match record {
                            ProvisionedOutput::File {
                                external_ids,
                                storage_path,
                                checksum,
                                metatype,
                                labels,
                            } => run.provision_file(external_ids, storage_path, checksum, metatype, labels, tx),
                            ProvisionedOutput::Url {
                                external_ids,
                                url,
                                labels,
                            } => run.provision_url(external_ids, url, labels, tx),
                        }
                    }
                    match cleanup {
                        Some(cleanup) => {
                            run.transition(Phase::Cleanup, vec![OperationState::initial(cleanup)?], tx)?;
                        }
                        None => run.succeeded(tx)?,
                    }
                    Ok(())
                })
                .await
            }
            Phase::Cleanup => {
                transact(store, |tx| {
                    run.succeeded(tx)?;
                    Ok(())
                })
                .await
            }
            other => bail!("Phase {other} has no operations"),
        }
    }
}
