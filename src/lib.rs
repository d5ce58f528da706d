//! runwarden
//!
//! Drives workflow runs through a forward-only phase lifecycle (input
//! resolution, preflight, input provisioning, execution, output provisioning,
//! cleanup) and gates/ranks them using signals polled from alerting and
//! metrics systems.
//!
//! ## Layout
//!
//! - [`lifecycle`]: the Phase/Operation/Transaction contract every driver implements
//! - [`processor`]: the orchestration driver that walks a run through its phases
//! - [`target`]: immutable composition of engine, provisioners, gates and scorer
//! - [`signal`]: TTL-bounded caches of Alertmanager / Prometheus data
//! - [`resource`]: consumable-resource admission gates
//! - [`priority`]: priority scorers
//! - [`single_shot`]: in-memory reference driver and batch entry point
//! - [`suite`]: test-suite entry point with output validators

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod priority;
pub mod processor;
pub mod provision;
pub mod resource;
pub mod signal;
pub mod single_shot;
pub mod suite;
pub mod target;
pub mod typecheck;
pub mod types;

pub use error::{LifecycleError, RunFailure, SubmitError, SuiteError};
pub use lifecycle::{ActiveOperation, ActiveRun, OutputProvisioningHandler, RunStore, Terminal};
pub use processor::{Processor, RunHandle};
pub use single_shot::{run_once, run_with_handlers, NoTransaction, SingleShotStore};
pub use suite::{run_suite, SuiteReport, TestCase};
pub use target::{Target, TargetBuilder};
pub use types::*;
