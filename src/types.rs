use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ─── Parameter and output types ───────────────────────────────

/// Declared type of a workflow (or engine) parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputType {
    String,
    Integer,
    Floating,
    Boolean,
    /// Any JSON document.
    Json,
    /// A file that must be provisioned before the engine can use it.
    File,
    /// A directory that must be provisioned before the engine can use it.
    Directory,
    List {
        of: Box<InputType>,
    },
}

impl InputType {
    /// The provisioning format required for values of this type, if any.
    pub fn provision_format(&self) -> Option<InputFormat> {
        match self {
            InputType::File => Some(InputFormat::File),
            InputType::Directory => Some(InputFormat::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::String => write!(f, "string"),
            InputType::Integer => write!(f, "integer"),
            InputType::Floating => write!(f, "floating"),
            InputType::Boolean => write!(f, "boolean"),
            InputType::Json => write!(f, "json"),
            InputType::File => write!(f, "file"),
            InputType::Directory => write!(f, "directory"),
            InputType::List { of } => write!(f, "list of {of}"),
        }
    }
}

/// Input provisioning formats; the target maps each to one input provisioner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    File,
    Directory,
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::File => write!(f, "file"),
            InputFormat::Directory => write!(f, "directory"),
        }
    }
}

/// Output provisioning formats; doubles as the declared type of a workflow output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    File,
    Url,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::File => write!(f, "file"),
            OutputFormat::Url => write!(f, "url"),
        }
    }
}

// ─── Workflow definition ──────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Flattened so the parameter reads `{"name": "x", "type": "list", "of": {...}}`.
    #[serde(flatten)]
    pub kind: InputType,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    #[serde(rename = "type")]
    pub format: OutputFormat,
}

fn default_language() -> String {
    "shell".to_string()
}

/// A declared workflow: ordered typed parameters and outputs.
///
/// Immutable once loaded and shared read-only (behind an `Arc`) by every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Workflow body handed to the engine.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl WorkflowDefinition {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Structural problems with the definition itself (duplicate names, blank identity).
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("Workflow name is empty".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("Workflow version is empty".to_string());
        }
        let mut seen = BTreeSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                problems.push(format!("Duplicate parameter '{}'", parameter.name));
            }
        }
        let mut seen = BTreeSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                problems.push(format!("Duplicate output '{}'", output.name));
            }
        }
        problems
    }
}

// ─── External identifiers and file references ─────────────────

/// An identifier in an external system that outputs are associated with.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub provider: String,
    pub id: String,
}

impl ExternalId {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// Caller-supplied value for a `file` or `directory` parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalFile {
    pub external_ids: BTreeSet<ExternalId>,
    pub path: String,
}

// ─── Run request ──────────────────────────────────────────────

/// Everything a caller supplies to start a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub engine_arguments: Value,
    /// Input for each named consumable resource that declares one.
    #[serde(default)]
    pub consumable_resources: BTreeMap<String, Value>,
    /// Label/value pairs handed to the priority scorer.
    #[serde(default)]
    pub priority_input: Option<Value>,
}

impl RunRequest {
    pub fn new(arguments: Value, metadata: Value, engine_arguments: Value) -> Self {
        Self {
            arguments,
            metadata,
            engine_arguments,
            ..Default::default()
        }
    }
}

// ─── Lifecycle enums ──────────────────────────────────────────

/// Forward-only stage of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Initializing,
    Preflight,
    ProvisionIn,
    Running,
    ProvisionOut,
    Cleanup,
    Succeeded,
    Failed,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Initializing => 0,
            Phase::Preflight => 1,
            Phase::ProvisionIn => 2,
            Phase::Running => 3,
            Phase::ProvisionOut => 4,
            Phase::Cleanup => 5,
            Phase::Succeeded => 6,
            Phase::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    /// Whether a run in `self` may move to `next`.
    ///
    /// Phases may be skipped but never revisited; FAILED is reachable from any
    /// non-terminal phase.
    pub fn can_advance_to(self, next: Phase) -> bool {
        !self.is_terminal() && (next == Phase::Failed || next.rank() > self.rank())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "INITIALIZING",
            Phase::Preflight => "PREFLIGHT",
            Phase::ProvisionIn => "PROVISION_IN",
            Phase::Running => "RUNNING",
            Phase::ProvisionOut => "PROVISION_OUT",
            Phase::Cleanup => "CLEANUP",
            Phase::Succeeded => "SUCCEEDED",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Initializing,
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, OperationStatus::Waiting | OperationStatus::Running)
    }
}

// ─── Provisioned outputs ──────────────────────────────────────

/// One finalized output artifact, as reported through the provisioning callbacks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ProvisionedOutput {
    File {
        external_ids: BTreeSet<ExternalId>,
        storage_path: String,
        checksum: String,
        metatype: String,
        labels: BTreeMap<String, String>,
    },
    Url {
        external_ids: BTreeSet<ExternalId>,
        url: String,
        labels: BTreeMap<String, String>,
    },
}

impl ProvisionedOutput {
    pub fn external_ids(&self) -> &BTreeSet<ExternalId> {
        match self {
            ProvisionedOutput::File { external_ids, .. }
            | ProvisionedOutput::Url { external_ids, .. } => external_ids,
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            ProvisionedOutput::File { labels, .. } | ProvisionedOutput::Url { labels, .. } => {
                labels
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionedOutput::File { .. } => "file",
            ProvisionedOutput::Url { .. } => "url",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_only_moves_forward() {
        assert!(Phase::Initializing.can_advance_to(Phase::Preflight));
        assert!(Phase::ProvisionOut.can_advance_to(Phase::Succeeded));
        assert!(Phase::Running.can_advance_to(Phase::Failed));
        assert!(!Phase::Running.can_advance_to(Phase::ProvisionIn));
        assert!(!Phase::Running.can_advance_to(Phase::Running));
        assert!(!Phase::Failed.can_advance_to(Phase::Failed));
        assert!(!Phase::Succeeded.can_advance_to(Phase::Failed));
    }

    #[test]
    fn test_workflow_definition_parses_nested_types() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "align",
            "version": "2.1",
            "parameters": [
                {"name": "sample", "type": "string"},
                {"name": "reads", "type": "list", "of": {"type": "file"}},
                {"name": "threads", "type": "integer", "optional": true}
            ],
            "outputs": [{"name": "bam", "type": "file"}]
        }))
        .unwrap();

        assert_eq!(definition.language, "shell");
        assert_eq!(
            definition.parameter("reads").unwrap().kind,
            InputType::List {
                of: Box::new(InputType::File)
            }
        );
        assert!(definition.parameter("threads").unwrap().optional);
        assert!(definition.problems().is_empty());
    }

    #[test]
    fn test_duplicate_names_are_problems() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "w",
            "version": "1",
            "parameters": [
                {"name": "a", "type": "string"},
                {"name": "a", "type": "integer"}
            ],
            "outputs": [
                {"name": "o", "type": "url"},
                {"name": "o", "type": "file"}
            ]
        }))
        .unwrap();

        let problems = definition.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("'a'"));
        assert!(problems[1].contains("'o'"));
    }

    #[test]
    fn test_provisioned_output_wire_shape() {
        let record = ProvisionedOutput::Url {
            external_ids: BTreeSet::from([ExternalId::new("lims", "1")]),
            url: "https://example.com/r".into(),
            labels: BTreeMap::new(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "url");
        assert_eq!(value["externalIds"][0]["provider"], "lims");
    }
}
