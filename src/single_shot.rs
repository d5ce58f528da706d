//! Single-shot driver.
//!
//! Keeps one run in memory and forwards provisioning callbacks to an injected
//! handler. It has no persistence, so its transaction type is a no-op token,
//! but it honors the same contract a persistent driver would.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::error::{LifecycleError, RunFailure};
use crate::lifecycle::{
    ActiveOperation, ActiveRun, CompositeHandler, NewRun, OutputCollector,
    OutputProvisioningHandler, RunState, RunStore, Terminal, TerminalSignal,
};
use crate::processor::Processor;
use crate::target::Target;
use crate::types::{
    ExternalId, OperationStatus, Phase, ProvisionedOutput, RunRequest, WorkflowDefinition,
};

/// Transaction token of a driver without persistence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoTransaction;

type Shared = Arc<Mutex<RunState>>;

fn lock(state: &Shared) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SingleShotStore {
    handler: Arc<dyn OutputProvisioningHandler<NoTransaction>>,
}

impl SingleShotStore {
    pub fn new(handler: Arc<dyn OutputProvisioningHandler<NoTransaction>>) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl RunStore for SingleShotStore {
    type Tx = NoTransaction;
    type Run = SingleShotRun;

    async fn begin(&self) -> anyhow::Result<NoTransaction> {
        Ok(NoTransaction)
    }

    async fn commit(&self, _tx: NoTransaction) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_run(
        &self,
        run: NewRun,
        signal: TerminalSignal,
        _tx: &mut NoTransaction,
    ) -> anyhow::Result<Arc<SingleShotRun>> {
        Ok(Arc::new(SingleShotRun {
            state: Arc::new(Mutex::new(RunState::new(run, signal))),
            handler: self.handler.clone(),
        }))
    }
}

pub struct SingleShotRun {
    state: Shared,
    handler: Arc<dyn OutputProvisioningHandler<NoTransaction>>,
}

#[derive(Clone)]
pub struct SingleShotOperation {
    state: Shared,
    index: usize,
}

impl ActiveOperation for SingleShotOperation {
    type Tx = NoTransaction;

    fn index(&self) -> usize {
        self.index
    }

    fn op_type(&self) -> Option<String> {
        lock(&self.state)
            .operation(self.index)
            .ok()
            .and_then(|op| op.op_type.clone())
    }

    fn set_type(&self, op_type: &str, _tx: &mut NoTransaction) -> Result<(), LifecycleError> {
        lock(&self.state).set_operation_type(self.index, op_type)
    }

    fn recovery_state(&self) -> Value {
        lock(&self.state)
            .operation(self.index)
            .map(|op| op.recovery_state.clone())
            .unwrap_or_default()
    }

    fn set_recovery_state(&self, state: Value, _tx: &mut NoTransaction) -> Result<(), LifecycleError> {
        lock(&self.state).set_recovery_state(self.index, state)
    }

    fn status(&self) -> OperationStatus {
        lock(&self.state)
            .operation(self.index)
            .map(|op| op.status)
            .unwrap_or(OperationStatus::Failed)
    }

    fn set_status(&self, status: OperationStatus, _tx: &mut NoTransaction) -> Result<(), LifecycleError> {
        lock(&self.state).set_operation_status(self.index, status)
    }

    fn is_live(&self) -> bool {
        self.status().is_in_progress()
    }

    fn debug_info(&self, info: Value, _tx: &mut NoTransaction) {
        // Diagnostics only; an unknown index is not worth failing over.
        let _ = lock(&self.state).add_debug_info(self.index, info);
    }
}

impl SingleShotRun {
    fn operation(&self, index: usize) -> SingleShotOperation {
        SingleShotOperation {
            state: self.state.clone(),
            index,
        }
    }

    /// Diagnostics recorded against one operation.
    pub fn debug_log(&self, index: usize) -> Vec<Value> {
        lock(&self.state)
            .operation(index)
            .map(|op| op.debug.clone())
            .unwrap_or_default()
    }
}

impl ActiveRun for SingleShotRun {
    type Tx = NoTransaction;
    type Operation = SingleShotOperation;

    fn id(&self) -> String {
        lock(&self.state).id().to_string()
    }

    fn workflow(&self) -> Arc<WorkflowDefinition> {
        lock(&self.state).workflow().clone()
    }

    fn request(&self) -> RunRequest {
        lock(&self.state).request().clone()
    }

    fn created(&self) -> DateTime<Utc> {
        lock(&self.state).created()
    }

    fn priority(&self) -> i64 {
        lock(&self.state).priority()
    }

    fn phase(&self) -> Phase {
        lock(&self.state).phase()
    }

    fn transition(
        &self,
        next: Phase,
        initial_states: Vec<Value>,
        _tx: &mut NoTransaction,
    ) -> Result<Vec<SingleShotOperation>, LifecycleError> {
        let indices = lock(&self.state).transition(next, initial_states)?;
        Ok(indices.into_iter().map(|i| self.operation(i)).collect())
    }

    fn operations(&self) -> Vec<SingleShotOperation> {
        let indices = lock(&self.state).current_operations();
        indices.into_iter().map(|i| self.operation(i)).collect()
    }

    fn succeeded(&self, _tx: &mut NoTransaction) -> Result<(), LifecycleError> {
        lock(&self.state).succeeded()
    }

    fn fault(&self, reason: &str, _tx: &mut NoTransaction) -> bool {
        lock(&self.state).fault(reason)
    }

    fn real_input(&self) -> Option<Value> {
        lock(&self.state).real_input().cloned()
    }

    fn set_real_input(&self, real_input: Value, _tx: &mut NoTransaction) -> Result<(), LifecycleError> {
        lock(&self.state).set_real_input(real_input)
    }

    fn required_external_ids(&self) -> Option<BTreeSet<ExternalId>> {
        lock(&self.state).required_external_ids().cloned()
    }

    fn input_ids(&self) -> Option<BTreeSet<String>> {
        lock(&self.state).input_ids().cloned()
    }

    fn set_input_ids(
        &self,
        external_ids: BTreeSet<ExternalId>,
        input_ids: BTreeSet<String>,
        _tx: &mut NoTransaction,
    ) -> Result<(), LifecycleError> {
        lock(&self.state).set_input_ids(external_ids, input_ids)
    }

    fn is_preflight_okay(&self) -> bool {
        lock(&self.state).is_preflight_okay()
    }

    fn preflight_failed(&self, _tx: &mut NoTransaction) {
        lock(&self.state).preflight_failed();
    }

    fn extra_input_ids_handled(&self) -> bool {
        lock(&self.state).extra_input_ids_handled()
    }

    fn set_extra_input_ids_handled(&self, _tx: &mut NoTransaction) {
        lock(&self.state).set_extra_input_ids_handled();
    }

    fn cleanup_state(&self) -> Option<Value> {
        lock(&self.state).cleanup_state().cloned()
    }

    fn set_cleanup_state(&self, cleanup: Value, _tx: &mut NoTransaction) {
        lock(&self.state).set_cleanup_state(cleanup);
    }

    fn run_url(&self) -> Option<String> {
        lock(&self.state).run_url().map(str::to_string)
    }

    fn set_run_url(&self, url: String, _tx: &mut NoTransaction) {
        lock(&self.state).set_run_url(url);
    }

    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut NoTransaction,
    ) {
        self.handler
            .provision_file(external_ids, storage_path, checksum, metatype, labels, tx);
    }

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut NoTransaction,
    ) {
        self.handler.provision_url(external_ids, url, labels, tx);
    }
}

/// Run one workflow to completion and return its provisioned outputs in order.
pub async fn run_once(
    target: Arc<Target>,
    workflow: Arc<WorkflowDefinition>,
    request: RunRequest,
) -> Result<Vec<ProvisionedOutput>, RunFailure> {
    run_with_handlers(target, workflow, request, Vec::new()).await
}

/// [`run_once`], additionally forwarding every provisioned output to `handlers`.
pub async fn run_with_handlers(
    target: Arc<Target>,
    workflow: Arc<WorkflowDefinition>,
    request: RunRequest,
    handlers: Vec<Arc<dyn OutputProvisioningHandler<NoTransaction>>>,
) -> Result<Vec<ProvisionedOutput>, RunFailure> {
    let collector = Arc::new(OutputCollector::new());
    let mut composite = CompositeHandler::<NoTransaction>::new().with(collector.clone());
    for handler in handlers {
        composite = composite.with(handler);
    }

    let processor = Processor::new(target, Arc::new(SingleShotStore::new(Arc::new(composite))));
    let name = workflow.name.clone();
    match processor.run(workflow, request).await? {
        Terminal::Succeeded => {
            let records = collector.take();
            info!(workflow = %name, outputs = records.len(), "Workflow succeeded");
            Ok(records)
        }
        Terminal::Failed => Err(RunFailure::Failed),
        Terminal::Fault(reason) => Err(RunFailure::InternalFault(reason)),
    }
}
