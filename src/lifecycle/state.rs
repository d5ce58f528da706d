//! In-memory run state with the lifecycle invariants enforced in one place.
//!
//! Drivers embed a [`RunState`] behind their own lock and layer persistence on
//! top; every mutator here is pure bookkeeping and never blocks.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::terminal::{Terminal, TerminalSignal};
use crate::error::LifecycleError;
use crate::types::{ExternalId, OperationStatus, Phase, RunRequest, WorkflowDefinition};

/// Everything the processor knows about a run at the moment it is created.
#[derive(Clone, Debug)]
pub struct NewRun {
    pub id: String,
    pub workflow: Arc<WorkflowDefinition>,
    pub request: RunRequest,
    pub created: DateTime<Utc>,
    pub priority: i64,
}

#[derive(Clone, Debug)]
pub struct OperationRecord {
    /// Phase generation that spawned this operation.
    pub generation: u32,
    pub op_type: Option<String>,
    pub recovery_state: Value,
    pub status: OperationStatus,
    /// Diagnostics only.
    pub debug: Vec<Value>,
}

#[derive(Debug)]
pub struct RunState {
    id: String,
    workflow: Arc<WorkflowDefinition>,
    request: RunRequest,
    created: DateTime<Utc>,
    priority: i64,

    phase: Phase,
    generation: u32,
    operations: Vec<OperationRecord>,

    real_input: Option<Value>,
    external_ids: Option<BTreeSet<ExternalId>>,
    input_ids: Option<BTreeSet<String>>,
    preflight_okay: bool,
    extra_input_ids_handled: bool,
    cleanup: Option<Value>,
    run_url: Option<String>,

    signal: TerminalSignal,
}

impl RunState {
    pub fn new(run: NewRun, signal: TerminalSignal) -> Self {
        Self {
            id: run.id,
            workflow: run.workflow,
            request: run.request,
            created: run.created,
            priority: run.priority,
            phase: Phase::Initializing,
            generation: 0,
            operations: Vec::new(),
            real_input: None,
            external_ids: None,
            input_ids: None,
            preflight_okay: true,
            extra_input_ids_handled: false,
            cleanup: None,
            run_url: None,
            signal,
        }
    }

    // ── Identity ──

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow(&self) -> &Arc<WorkflowDefinition> {
        &self.workflow
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    // ── Phase ──

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Move to `next`, spawning one operation per initial recovery state.
    ///
    /// Returns the indices of the new operations. Moving to FAILED spawns
    /// nothing and releases the terminal signal.
    pub fn transition(
        &mut self,
        next: Phase,
        initial_states: Vec<Value>,
    ) -> Result<Vec<usize>, LifecycleError> {
        self.ensure_live()?;
        if next == Phase::Succeeded || !self.phase.can_advance_to(next) {
            return Err(LifecycleError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.phase,
                to: next,
            });
        }

        self.phase = next;
        self.generation += 1;
        if next == Phase::Failed {
            self.signal.resolve(Terminal::Failed);
            return Ok(Vec::new());
        }

        let first = self.operations.len();
        for state in initial_states {
            self.operations.push(OperationRecord {
                generation: self.generation,
                op_type: None,
                recovery_state: state,
                status: OperationStatus::Initializing,
                debug: Vec::new(),
            });
        }
        Ok((first..self.operations.len()).collect())
    }

    pub fn succeeded(&mut self) -> Result<(), LifecycleError> {
        self.ensure_live()?;
        self.phase = Phase::Succeeded;
        self.signal.resolve(Terminal::Succeeded);
        Ok(())
    }

    /// Record an orchestrator fault. No effect (returns `false`) on terminal runs.
    pub fn fault(&mut self, reason: &str) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = Phase::Failed;
        self.generation += 1;
        self.signal.resolve(Terminal::Fault(reason.to_string()))
    }

    pub fn is_signal_resolved(&self) -> bool {
        self.signal.is_resolved()
    }

    fn ensure_live(&self) -> Result<(), LifecycleError> {
        if self.phase.is_terminal() {
            Err(LifecycleError::Terminal {
                run_id: self.id.clone(),
                phase: self.phase,
            })
        } else {
            Ok(())
        }
    }

    // ── Inputs ──

    pub fn real_input(&self) -> Option<&Value> {
        self.real_input.as_ref()
    }

    pub fn set_real_input(&mut self, real_input: Value) -> Result<(), LifecycleError> {
        if self.real_input.is_some() {
            return Err(self.already_set("realInput"));
        }
        self.real_input = Some(real_input);
        Ok(())
    }

    pub fn required_external_ids(&self) -> Option<&BTreeSet<ExternalId>> {
        self.external_ids.as_ref()
    }

    pub fn input_ids(&self) -> Option<&BTreeSet<String>> {
        self.input_ids.as_ref()
    }

    /// Written once during input resolution; read many times afterwards.
    pub fn set_input_ids(
        &mut self,
        external_ids: BTreeSet<ExternalId>,
        input_ids: BTreeSet<String>,
    ) -> Result<(), LifecycleError> {
        if self.external_ids.is_some() || self.input_ids.is_some() {
            return Err(self.already_set("input identifiers"));
        }
        self.external_ids = Some(external_ids);
        self.input_ids = Some(input_ids);
        Ok(())
    }

    pub fn is_preflight_okay(&self) -> bool {
        self.preflight_okay
    }

    pub fn preflight_failed(&mut self) {
        self.preflight_okay = false;
    }

    pub fn extra_input_ids_handled(&self) -> bool {
        self.extra_input_ids_handled
    }

    pub fn set_extra_input_ids_handled(&mut self) {
        self.extra_input_ids_handled = true;
    }

    // ── Engine bookkeeping ──

    pub fn cleanup_state(&self) -> Option<&Value> {
        self.cleanup.as_ref()
    }

    pub fn set_cleanup_state(&mut self, cleanup: Value) {
        self.cleanup = Some(cleanup);
    }

    pub fn run_url(&self) -> Option<&str> {
        self.run_url.as_deref()
    }

    pub fn set_run_url(&mut self, url: String) {
        self.run_url = Some(url);
    }

    fn already_set(&self, field: &'static str) -> LifecycleError {
        LifecycleError::AlreadySet {
            run_id: self.id.clone(),
            field,
        }
    }

    // ── Operations ──

    /// Indices of the operations belonging to the current phase generation.
    pub fn current_operations(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.generation == self.generation)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn operation(&self, index: usize) -> Result<&OperationRecord, LifecycleError> {
        self.operations
            .get(index)
            .ok_or_else(|| LifecycleError::UnknownOperation {
                run_id: self.id.clone(),
                index,
            })
    }

    fn operation_mut(&mut self, index: usize) -> Result<&mut OperationRecord, LifecycleError> {
        let run_id = &self.id;
        self.operations
            .get_mut(index)
            .ok_or_else(|| LifecycleError::UnknownOperation {
                run_id: run_id.clone(),
                index,
            })
    }

    pub fn set_operation_type(&mut self, index: usize, op_type: &str) -> Result<(), LifecycleError> {
        let operation = self.operation_mut(index)?;
        if let Some(existing) = &operation.op_type {
            return Err(LifecycleError::TypeAlreadySet {
                index,
                existing: existing.clone(),
            });
        }
        operation.op_type = Some(op_type.to_string());
        Ok(())
    }

    pub fn set_recovery_state(&mut self, index: usize, state: Value) -> Result<(), LifecycleError> {
        self.operation_mut(index)?.recovery_state = state;
        Ok(())
    }

    /// Update an operation's status. FAILED propagates to the run.
    pub fn set_operation_status(
        &mut self,
        index: usize,
        status: OperationStatus,
    ) -> Result<(), LifecycleError> {
        self.operation_mut(index)?.status = status;
        if status == OperationStatus::Failed && !self.phase.is_terminal() {
            self.phase = Phase::Failed;
            self.generation += 1;
            self.signal.resolve(Terminal::Failed);
        }
        Ok(())
    }

    pub fn add_debug_info(&mut self, index: usize, info: Value) -> Result<(), LifecycleError> {
        self.operation_mut(index)?.debug.push(info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::terminal::terminal_signal;
    use serde_json::json;

    fn new_state() -> (RunState, crate::lifecycle::TerminalWaiter) {
        let (signal, waiter) = terminal_signal();
        let run = NewRun {
            id: "run-1".into(),
            workflow: Arc::new(WorkflowDefinition {
                name: "w".into(),
                version: "1.0".into(),
                language: "shell".into(),
                source: String::new(),
                parameters: vec![],
                outputs: vec![],
            }),
            request: RunRequest::default(),
            created: Utc::now(),
            priority: 0,
        };
        (RunState::new(run, signal), waiter)
    }

    #[test]
    fn test_transition_spawns_one_operation_per_state() {
        let (mut state, _waiter) = new_state();
        let ops = state
            .transition(Phase::ProvisionIn, vec![json!({"a": 1}), json!({"b": 2})])
            .unwrap();
        assert_eq!(ops, vec![0, 1]);
        assert_eq!(state.current_operations(), vec![0, 1]);

        let ops = state.transition(Phase::Running, vec![json!(null)]).unwrap();
        assert_eq!(ops, vec![2]);
        assert_eq!(state.current_operations(), vec![2]);
        assert_eq!(
            state.operation(0).unwrap().status,
            OperationStatus::Initializing
        );
    }

    #[test]
    fn test_backwards_transition_is_rejected() {
        let (mut state, _waiter) = new_state();
        state.transition(Phase::Running, vec![]).unwrap();
        let error = state.transition(Phase::Preflight, vec![]).unwrap_err();
        assert!(matches!(error, LifecycleError::InvalidTransition { .. }));
        assert_eq!(state.phase(), Phase::Running);
    }

    #[test]
    fn test_succeeded_is_only_reachable_through_succeeded() {
        let (mut state, _waiter) = new_state();
        assert!(state.transition(Phase::Succeeded, vec![]).is_err());
        state.succeeded().unwrap();
        assert_eq!(state.phase(), Phase::Succeeded);
        assert!(state.transition(Phase::Failed, vec![]).is_err());
    }

    #[tokio::test]
    async fn test_failed_phase_spawns_nothing_and_is_terminal() {
        let (mut state, waiter) = new_state();
        let ops = state.transition(Phase::Failed, vec![json!({})]).unwrap();
        assert!(ops.is_empty());
        assert!(matches!(
            state.transition(Phase::Running, vec![json!({})]),
            Err(LifecycleError::Terminal { .. })
        ));
        assert!(state.succeeded().is_err());
        assert!(!state.fault("late"));
        assert_eq!(waiter.wait().await, Terminal::Failed);
    }

    #[tokio::test]
    async fn test_failed_operation_fails_run() {
        let (mut state, waiter) = new_state();
        state
            .transition(Phase::Running, vec![json!(null), json!(null)])
            .unwrap();
        state
            .set_operation_status(0, OperationStatus::Succeeded)
            .unwrap();
        assert_eq!(state.phase(), Phase::Running);
        state.set_operation_status(1, OperationStatus::Failed).unwrap();
        assert_eq!(state.phase(), Phase::Failed);
        assert!(state.current_operations().is_empty());
        assert_eq!(waiter.wait().await, Terminal::Failed);
    }

    #[test]
    fn test_preflight_failure_is_sticky() {
        let (mut state, _waiter) = new_state();
        assert!(state.is_preflight_okay());
        state.preflight_failed();
        state.transition(Phase::Preflight, vec![]).unwrap();
        assert!(!state.is_preflight_okay());
    }

    #[test]
    fn test_write_once_fields() {
        let (mut state, _waiter) = new_state();
        state
            .set_input_ids(BTreeSet::new(), BTreeSet::from(["/a".to_string()]))
            .unwrap();
        assert!(matches!(
            state.set_input_ids(BTreeSet::new(), BTreeSet::new()),
            Err(LifecycleError::AlreadySet { .. })
        ));
        state.set_real_input(json!({})).unwrap();
        assert!(state.set_real_input(json!({})).is_err());
    }

    #[test]
    fn test_operation_type_is_set_once() {
        let (mut state, _waiter) = new_state();
        state.transition(Phase::Running, vec![json!(null)]).unwrap();
        state.set_operation_type(0, "engine:shell").unwrap();
        assert_eq!(
            state.set_operation_type(0, "engine:other"),
            Err(LifecycleError::TypeAlreadySet {
                index: 0,
                existing: "engine:shell".into()
            })
        );
        assert!(state.set_operation_type(7, "x").is_err());
    }

    #[tokio::test]
    async fn test_fault_is_distinct_from_failure() {
        let (mut state, waiter) = new_state();
        assert!(state.fault("store offline"));
        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(waiter.wait().await, Terminal::Fault("store offline".into()));
    }
}
