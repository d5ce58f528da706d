//! Test-suite entry point.
//!
//! A suite is a list of cases run against one workflow and target. Cases are
//! checked up front: duplicate ids or an invalid request abort the suite before
//! any case runs. Every case then runs to completion and reports pass/fail.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::error::SuiteError;
use crate::lifecycle::OutputProvisioningHandler;
use crate::single_shot::{run_with_handlers, NoTransaction};
use crate::target::Target;
use crate::typecheck::check_request;
use crate::types::{ExternalId, ProvisionedOutput, RunRequest, WorkflowDefinition};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub engine_arguments: Value,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
}

impl TestCase {
    pub fn request(&self) -> RunRequest {
        RunRequest::new(
            self.arguments.clone(),
            self.metadata.clone(),
            self.engine_arguments.clone(),
        )
    }
}

/// Assertions on the outputs a case provisions.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ValidatorConfig {
    OutputCount { expected: usize },
    /// Some file output of `metatype` carries `checksum` (hex, case-insensitive).
    FileChecksum { metatype: String, checksum: String },
    /// Every output carries all of `labels`.
    Labels { labels: BTreeMap<String, String> },
}

impl ValidatorConfig {
    fn check(&self, records: &[ProvisionedOutput]) -> Option<String> {
        match self {
            ValidatorConfig::OutputCount { expected } => (records.len() != *expected)
                .then(|| format!("Expected {expected} outputs but got {}", records.len())),
            ValidatorConfig::FileChecksum { metatype, checksum } => {
                let found: Vec<&str> = records
                    .iter()
                    .filter_map(|record| match record {
                        ProvisionedOutput::File {
                            metatype: m,
                            checksum,
                            ..
                        } if m == metatype => Some(checksum.as_str()),
                        _ => None,
                    })
                    .collect();
                if found.is_empty() {
                    Some(format!("No file output with metatype '{metatype}'"))
                } else if found.iter().any(|c| c.eq_ignore_ascii_case(checksum)) {
                    None
                } else {
                    Some(format!(
                        "File output '{metatype}' has checksum {} but expected {checksum}",
                        found.join(", ")
                    ))
                }
            }
            ValidatorConfig::Labels { labels } => {
                if records.is_empty() {
                    return Some("No outputs to check labels on".to_string());
                }
                let missing: BTreeSet<String> = records
                    .iter()
                    .flat_map(|record| {
                        labels
                            .iter()
                            .filter(|(k, v)| record.labels().get(*k) != Some(*v))
                            .map(|(k, v)| format!("{k}={v}"))
                    })
                    .collect();
                (!missing.is_empty()).then(|| {
                    format!(
                        "Outputs missing labels: {}",
                        missing.into_iter().collect::<Vec<_>>().join(", ")
                    )
                })
            }
        }
    }
}

/// Intercepts provisioning callbacks of one case and judges them afterwards.
pub struct Validator {
    checks: Vec<ValidatorConfig>,
    seen: Mutex<Vec<ProvisionedOutput>>,
}

impl Validator {
    pub fn new(checks: Vec<ValidatorConfig>) -> Self {
        Self {
            checks,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, output: ProvisionedOutput) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    /// Every failed check; empty when the case passed validation.
    pub fn verdict(&self) -> Vec<String> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        self.checks.iter().filter_map(|check| check.check(&seen)).collect()
    }
}

impl OutputProvisioningHandler<NoTransaction> for Validator {
    fn provision_file(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        storage_path: &str,
        checksum: &str,
        metatype: &str,
        labels: &BTreeMap<String, String>,
        _tx: &mut NoTransaction,
    ) {
        self.record(ProvisionedOutput::File {
            external_ids: external_ids.clone(),
            storage_path: storage_path.to_string(),
            checksum: checksum.to_string(),
            metatype: metatype.to_string(),
            labels: labels.clone(),
        });
    }

    fn provision_url(
        &self,
        external_ids: &BTreeSet<ExternalId>,
        url: &str,
        labels: &BTreeMap<String, String>,
        _tx: &mut NoTransaction,
    ) {
        self.record(ProvisionedOutput::Url {
            external_ids: external_ids.clone(),
            url: url.to_string(),
            labels: labels.clone(),
        });
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CaseReport {
    pub id: String,
    pub description: String,
    pub passed: bool,
    pub problems: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SuiteReport {
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(|case| case.passed)
    }

    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

fn duplicate_ids(cases: &[TestCase]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for case in cases {
        *counts.entry(case.id.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, count)| (id.to_string(), count))
        .collect()
}

pub async fn run_suite(
    target: Arc<Target>,
    workflow: Arc<WorkflowDefinition>,
    cases: Vec<TestCase>,
) -> Result<SuiteReport, SuiteError> {
    let duplicates = duplicate_ids(&cases);
    if !duplicates.is_empty() {
        return Err(SuiteError::DuplicateIds(duplicates));
    }

    let invalid: Vec<(String, Vec<String>)> = cases
        .iter()
        .filter_map(|case| {
            let violations = check_request(&target, &workflow, &case.request());
            (!violations.is_empty()).then(|| (case.id.clone(), violations))
        })
        .collect();
    if !invalid.is_empty() {
        return Err(SuiteError::InvalidCases(invalid));
    }

    info!(workflow = %workflow.name, cases = cases.len(), "Running test suite");
    let mut report = SuiteReport::default();
    for case in cases {
        let validator = Arc::new(Validator::new(case.validators.clone()));
        let handler: Arc<dyn OutputProvisioningHandler<NoTransaction>> = validator.clone();
        let outcome =
            run_with_handlers(target.clone(), workflow.clone(), case.request(), vec![handler])
                .await;

        let problems = match outcome {
            Ok(_) => validator.verdict(),
            Err(failure) => vec![failure.to_string()],
        };
        let passed = problems.is_empty();
        if passed {
            info!(case = %case.id, "Test case passed");
        } else {
            warn!(case = %case.id, problems = ?problems, "Test case failed");
        }
        report.cases.push(CaseReport {
            id: case.id,
            description: case.description,
            passed,
            problems,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOutput, EngineRequest, OperationMonitor, WorkflowEngine};
    use crate::provision::ManualOutputProvisioner;
    use crate::target::TargetBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns the `result` argument as the `result` output.
    #[derive(Default)]
    struct EchoEngine {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        fn supports_language(&self, _: &str) -> bool {
            true
        }

        async fn run(
            &self,
            request: &EngineRequest,
            _: &dyn OperationMonitor,
        ) -> anyhow::Result<EngineOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut outputs = serde_json::Map::new();
            outputs.insert("result".into(), request.real_input["result"].clone());
            Ok(EngineOutput {
                outputs,
                cleanup: None,
            })
        }
    }

    async fn target(engine: Arc<EchoEngine>) -> Arc<Target> {
        Arc::new(
            TargetBuilder::new(engine)
                .output_provisioner(Arc::new(ManualOutputProvisioner))
                .build()
                .await
                .unwrap(),
        )
    }

    fn workflow() -> Arc<WorkflowDefinition> {
        Arc::new(
            serde_json::from_value(json!({
                "name": "publish",
                "version": "1",
                "parameters": [{"name": "result", "type": "string"}],
                "outputs": [{"name": "result", "type": "url"}]
            }))
            .unwrap(),
        )
    }

    fn case(id: &str, result: Value, validators: Value) -> TestCase {
        serde_json::from_value(json!({
            "id": id,
            "arguments": {"result": result},
            "metadata": {"result": {"labels": {"stage": "qa"}}},
            "validators": validators
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_ids_abort_before_running() {
        let engine = Arc::new(EchoEngine::default());
        let cases = vec![
            case("t1", json!("https://example.org/a"), json!([])),
            case("t2", json!("https://example.org/b"), json!([])),
            case("t1", json!("https://example.org/c"), json!([])),
        ];
        let error = run_suite(target(engine.clone()).await, workflow(), cases)
            .await
            .unwrap_err();
        assert_eq!(error, SuiteError::DuplicateIds(vec![("t1".into(), 2)]));
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_case_aborts_before_running() {
        let engine = Arc::new(EchoEngine::default());
        let cases = vec![
            case("good", json!("https://example.org/a"), json!([])),
            case("bad", json!(7), json!([])),
        ];
        let error = run_suite(target(engine.clone()).await, workflow(), cases)
            .await
            .unwrap_err();
        match error {
            SuiteError::InvalidCases(invalid) => {
                assert_eq!(invalid.len(), 1);
                assert_eq!(invalid[0].0, "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_case_runs_and_reports() {
        let engine = Arc::new(EchoEngine::default());
        let cases = vec![
            case(
                "counted",
                json!("https://example.org/a"),
                json!([{"type": "output-count", "expected": 1}, {"type": "labels", "labels": {"stage": "qa"}}]),
            ),
            case(
                "miscounted",
                json!("https://example.org/b"),
                json!([{"type": "output-count", "expected": 2}]),
            ),
            case("broken", json!("not a url"), json!([])),
        ];
        let report = run_suite(target(engine.clone()).await, workflow(), cases)
            .await
            .unwrap();

        assert_eq!(engine.runs.load(Ordering::SeqCst), 3);
        let passed: Vec<(&str, bool)> = report
            .cases
            .iter()
            .map(|case| (case.id.as_str(), case.passed))
            .collect();
        assert_eq!(
            passed,
            vec![("counted", true), ("miscounted", false), ("broken", false)]
        );
        assert_eq!(
            report.cases[1].problems,
            vec!["Expected 2 outputs but got 1".to_string()]
        );
        assert_eq!(report.cases[2].problems, vec!["Workflow run failed".to_string()]);
        assert!(!report.passed());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_file_checksum_validator() {
        let record = ProvisionedOutput::File {
            external_ids: BTreeSet::new(),
            storage_path: "/out/a.txt".into(),
            checksum: "ABCD".into(),
            metatype: "text/plain".into(),
            labels: BTreeMap::new(),
        };
        let check = |metatype: &str, checksum: &str| {
            ValidatorConfig::FileChecksum {
                metatype: metatype.into(),
                checksum: checksum.into(),
            }
            .check(std::slice::from_ref(&record))
        };
        assert_eq!(check("text/plain", "abcd"), None);
        assert!(check("text/plain", "ffff").is_some());
        assert_eq!(
            check("image/png", "abcd"),
            Some("No file output with metatype 'image/png'".to_string())
        );
    }
}
