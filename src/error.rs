//! Error taxonomy.
//!
//! ```text
//! BadArguments   → caller input failed declared-type validation (no run exists)
//! Denied         → a consumable resource refused admission     (no run exists)
//! Failed         → an operation failed; the run ended FAILED
//! InternalFault  → the orchestrator itself broke
//! ```
//!
//! Signal-source failures never appear here: they are contained by
//! [`crate::signal::SignalCache`].

use serde::Serialize;

use crate::types::Phase;

/// Violations of the Phase/Operation lifecycle invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Run {run_id} is already terminal ({phase})")]
    Terminal { run_id: String, phase: Phase },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: Phase,
        to: Phase,
    },

    #[error("{field} has already been set on run {run_id}")]
    AlreadySet {
        run_id: String,
        field: &'static str,
    },

    #[error("Operation {index} already has type '{existing}'")]
    TypeAlreadySet { index: usize, existing: String },

    #[error("Operation {index} does not exist on run {run_id}")]
    UnknownOperation { run_id: String, index: usize },
}

/// Why a submission was turned away before (or while) a run was created.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {}", .0.join("; "))]
    BadArguments(Vec<String>),

    #[error("Consumable resources unavailable: {}", .0.join("; "))]
    Denied(Vec<String>),

    #[error("Internal fault: {0:#}")]
    Internal(#[from] anyhow::Error),
}

/// Non-success outcome of a single-shot run, with a distinct process exit code each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "outcome", content = "details", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunFailure {
    #[error("Workflow run failed")]
    Failed,

    #[error("Invalid request: {}", .0.join("; "))]
    BadArguments(Vec<String>),

    #[error("Consumable resources unavailable: {}", .0.join("; "))]
    Denied(Vec<String>),

    #[error("Internal fault: {0}")]
    InternalFault(String),
}

impl RunFailure {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunFailure::Failed => 1,
            RunFailure::BadArguments(_) => 2,
            RunFailure::Denied(_) => 3,
            RunFailure::InternalFault(_) => 4,
        }
    }
}

impl From<SubmitError> for RunFailure {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::BadArguments(violations) => RunFailure::BadArguments(violations),
            SubmitError::Denied(reasons) => RunFailure::Denied(reasons),
            SubmitError::Internal(error) => RunFailure::InternalFault(format!("{error:#}")),
        }
    }
}

/// Why a test suite was rejected before any case ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuiteError {
    #[error("Duplicate test case ids: {}", describe_duplicates(.0))]
    DuplicateIds(Vec<(String, usize)>),

    #[error("Invalid test cases: {}", describe_invalid(.0))]
    InvalidCases(Vec<(String, Vec<String>)>),
}

fn describe_duplicates(duplicates: &[(String, usize)]) -> String {
    duplicates
        .iter()
        .map(|(id, count)| format!("'{id}' x{count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_invalid(cases: &[(String, Vec<String>)]) -> String {
    cases
        .iter()
        .map(|(id, violations)| format!("'{id}': {}", violations.join("; ")))
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes: BTreeSet<u8> = [
            RunFailure::Failed,
            RunFailure::BadArguments(vec![]),
            RunFailure::Denied(vec![]),
            RunFailure::InternalFault(String::new()),
        ]
        .iter()
        .map(RunFailure::exit_code)
        .collect();
        assert_eq!(codes.len(), 4);
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_submit_error_maps_to_run_failure() {
        let failure: RunFailure =
            SubmitError::BadArguments(vec!["Missing required parameter 'name'".into()]).into();
        assert_eq!(
            failure,
            RunFailure::BadArguments(vec!["Missing required parameter 'name'".into()])
        );

        let failure: RunFailure = SubmitError::Internal(anyhow::anyhow!("store offline")).into();
        assert_eq!(failure, RunFailure::InternalFault("store offline".into()));
    }

    #[test]
    fn test_suite_error_lists_every_duplicate() {
        let error = SuiteError::DuplicateIds(vec![("t1".into(), 2), ("t4".into(), 3)]);
        assert_eq!(error.to_string(), "Duplicate test case ids: 't1' x2, 't4' x3");
    }
}
