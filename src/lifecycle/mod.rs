//! Phase/Operation/Transaction contract.
//!
//! Every orchestration driver implements these traits. The [`Processor`]
//! requests phase transitions and reports operation results; it never touches
//! driver state directly. Every mutator takes the driver's transaction token
//! so a persistent driver can make one phase step atomic.
//!
//! [`Processor`]: crate::processor::Processor

pub mod handler;
pub mod state;
pub mod terminal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::LifecycleError;
use crate::types::{ExternalId, OperationStatus, Phase, RunRequest, WorkflowDefinition};

pub use handler::{CompositeHandler, OutputCollector};
pub use state::{NewRun, OperationRecord, RunState};
pub use terminal::{terminal_signal, Terminal, TerminalSignal, TerminalWaiter};

/// One unit of work spawned for a phase generation.
pub trait ActiveOperation: Clone + Send + Sync + 'static {
    type Tx: Send + 'static;

    /// Stable position of this operation within its run.
    fn index(&self) -> usize;

    fn op_type(&self) -> Option<String>;

    /// Tag the operation; fails if a tag is already present.
    fn set_type(&self, op_type: &str, tx: &mut Self::Tx) -> Result<(), LifecycleError>;

    fn recovery_state(&self) -> Value;

    fn set_recovery_state(&self, state: Value, tx: &mut Self::Tx) -> Result<(), LifecycleError>;

    fn status(&self) -> OperationStatus;

    /// Setting FAILED also fails the owning run.
    fn set_status(&self, status: OperationStatus, tx: &mut Self::Tx)
        -> Result<(), LifecycleError>;

    /// Whether the underlying execution unit is still running; a recovering
    /// driver re-attaches to live operations and relaunches the rest.
    fn is_live(&self) -> bool;

    /// Attach diagnostics. Never consulted for control flow.
    fn debug_info(&self, info: Value, tx: &mut Self::Tx);
}

/// A run under orchestration.
pub trait ActiveRun: Send + Sync + 'static {
    type Tx: Send + 'static;
    type Operation: ActiveOperation<Tx = Self::Tx>;

    // ── Identity ──

    fn id(&self) -> String;
    fn workflow(&self) -> Arc<WorkflowDefinition>;
    fn request(&self) -> RunRequest;
    fn created(&self) -> DateTime<Utc>;
    fn priority(&self) -> i64;

    fn arguments(&self) -> Value {
        self.request().arguments
    }

    fn metadata(&self) -> Value {
        self.request().metadata
    }

    fn engine_arguments(&self) -> Value {
        self.request().engine_arguments
    }

    // ── Phase ──

    fn phase(&self) -> Phase;

    /// Move to `next` and spawn one operation per initial recovery state.
    ///
    /// Returns no operations when `next` is FAILED. SUCCEEDED is only reachable
    /// through [`ActiveRun::succeeded`].
    fn transition(
        &self,
        next: Phase,
        initial_states: Vec<Value>,
        tx: &mut Self::Tx,
    ) -> Result<Vec<Self::Operation>, LifecycleError>;

    /// Operations of the current phase generation.
    fn operations(&self) -> Vec<Self::Operation>;

    fn succeeded(&self, tx: &mut Self::Tx) -> Result<(), LifecycleError>;

    /// Mark the run as broken by the orchestrator itself. Returns `false` when
    /// the run was already terminal.
    fn fault(&self, reason: &str, tx: &mut Self::Tx) -> bool;

    // ── Inputs ──

    fn real_input(&self) -> Option<Value>;
    fn set_real_input(&self, real_input: Value, tx: &mut Self::Tx) -> Result<(), LifecycleError>;

    fn required_external_ids(&self) -> Option<BTreeSet<ExternalId>>;
    fn input_ids(&self) -> Option<BTreeSet<String>>;
    fn set_input_ids(
        &self,
        external_ids: BTreeSet<ExternalId>,
        input_ids: BTreeSet<String>,
        tx: &mut Self::Tx,
    ) -> Result<(), LifecycleError>;

    fn is_preflight_okay(&self) -> bool;
    /// One-way: once called, [`ActiveRun::is_preflight_okay`] stays false.
    fn preflight_failed(&self, tx: &mut Self::Tx);

    fn extra_input_ids_handled(&self) -> bool;
    fn set_extra_input_ids_handled(&self, tx: &mut Self::Tx);

    // ── Engine bookkeeping ──

    fn cleanup_state(&self) -> Option<Value>;
    fn set_cleanup_state(&self, cleanup: Value, tx: &mut Self::Tx);

    fn run_url(&self) -> Option<String>;
    fn set_run_url(&self, url: String, tx: &mut Self::Tx);

    // ── Provisioning callbacks ──

    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Self::Tx,
    );

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Self::Tx,
    );
}

/// Receiver of finalized output artifacts, once per artifact.
pub trait OutputProvisioningHandler<Tx>: Send + Sync {
    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Tx,
    );

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        tx: &mut Tx,
    );
}

/// Creates runs and scopes mutations into transactions.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    type Tx: Send + 'static;
    type Run: ActiveRun<Tx = Self::Tx>;

    async fn begin(&self) -> anyhow::Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()>;

    /// Construct a run in INITIALIZING. `signal` must be resolved exactly once
    /// when the run reaches a terminal phase.
    fn create_run(
        &self,
        run: NewRun,
        signal: TerminalSignal,
        tx: &mut Self::Tx,
    ) -> anyhow::Result<Arc<Self::Run>>;
}
