//! Request validation against declared shapes.
//!
//! Every check collects all violations instead of stopping at the first, so a
//! caller can fix a bad request in one round trip.

use serde_json::{Map, Value};

use crate::target::Target;
use crate::types::{ExternalFile, InputType, Parameter, RunRequest, WorkflowDefinition};

/// Every violation in `request`, or an empty list when it may be submitted.
pub fn check_request(target: &Target, workflow: &WorkflowDefinition, request: &RunRequest) -> Vec<String> {
    let mut violations = Vec::new();

    let engine = target.engine();
    if !engine.supports_language(&workflow.language) {
        violations.push(format!(
            "Engine '{}' does not support language '{}'",
            engine.name(),
            workflow.language
        ));
    }

    check_parameters(
        target,
        "Parameter",
        &workflow.parameters,
        &request.arguments,
        &mut violations,
    );
    check_metadata(target, workflow, &request.metadata, &mut violations);
    check_parameters(
        target,
        "Engine parameter",
        &engine.engine_parameters(),
        &request.engine_arguments,
        &mut violations,
    );
    violations.extend(engine.check_engine_arguments(&request.engine_arguments));
    check_resources(target, request, &mut violations);
    check_priority_input(request.priority_input.as_ref(), &mut violations);

    violations
}

/// Treat an absent document as an empty object.
fn as_object<'a>(
    label: &str,
    document: &'a Value,
    empty: &'a Map<String, Value>,
    violations: &mut Vec<String>,
) -> Option<&'a Map<String, Value>> {
    match document {
        Value::Null => Some(empty),
        Value::Object(map) => Some(map),
        other => {
            violations.push(format!("{label}s must be an object but got {}", json_kind(other)));
            None
        }
    }
}

fn check_parameters(
    target: &Target,
    label: &str,
    parameters: &[Parameter],
    arguments: &Value,
    violations: &mut Vec<String>,
) {
    let empty = Map::new();
    let Some(arguments) = as_object(label, arguments, &empty, violations) else {
        return;
    };

    for parameter in parameters {
        match arguments.get(&parameter.name) {
            None | Some(Value::Null) if parameter.optional => {}
            None | Some(Value::Null) => violations.push(format!(
                "Missing required {} '{}'",
                label.to_lowercase(),
                parameter.name
            )),
            Some(value) => check_value(
                target,
                &format!("{label} '{}'", parameter.name),
                &parameter.kind,
                value,
                violations,
            ),
        }
    }
    for name in arguments.keys() {
        if !parameters.iter().any(|p| &p.name == name) {
            violations.push(format!("Unknown {} '{name}'", label.to_lowercase()));
        }
    }
}

/// Check one value against its declared type; `path` names it in messages.
pub fn check_value(
    target: &Target,
    path: &str,
    kind: &InputType,
    value: &Value,
    violations: &mut Vec<String>,
) {
    let matches = match kind {
        InputType::String => value.is_string(),
        InputType::Integer => value.is_i64() || value.is_u64(),
        InputType::Floating => value.is_number(),
        InputType::Boolean => value.is_boolean(),
        InputType::Json => true,
        InputType::File | InputType::Directory => {
            check_external_file(target, path, kind, value, violations);
            return;
        }
        InputType::List { of } => {
            let Some(items) = value.as_array() else {
                violations.push(format!("{path}: expected {kind} but got {}", json_kind(value)));
                return;
            };
            for (i, item) in items.iter().enumerate() {
                check_value(target, &format!("{path}[{i}]"), of, item, violations);
            }
            return;
        }
    };
    if !matches {
        violations.push(format!("{path}: expected {kind} but got {}", json_kind(value)));
    }
}

fn check_external_file(
    target: &Target,
    path: &str,
    kind: &InputType,
    value: &Value,
    violations: &mut Vec<String>,
) {
    let file: ExternalFile = match serde_json::from_value(value.clone()) {
        Ok(file) => file,
        Err(e) => {
            violations.push(format!(
                "{path}: expected {kind} reference {{externalIds, path}}: {e}"
            ));
            return;
        }
    };
    if file.external_ids.is_empty() {
        violations.push(format!("{path}: at least one external identifier is required"));
    }
    if file.path.trim().is_empty() {
        violations.push(format!("{path}: path is empty"));
    }
    if let Some(format) = kind.provision_format() {
        if target.input_provisioner(format).is_none() {
            violations.push(format!("{path}: no input provisioner for format '{format}'"));
        }
    }
}

fn check_metadata(
    target: &Target,
    workflow: &WorkflowDefinition,
    metadata: &Value,
    violations: &mut Vec<String>,
) {
    let empty = Map::new();
    let Some(metadata) = as_object("Metadata", metadata, &empty, violations) else {
        return;
    };

    for output in &workflow.outputs {
        let Some(entry) = metadata.get(&output.name) else {
            violations.push(format!("Missing metadata for output '{}'", output.name));
            continue;
        };
        match target.output_provisioner(output.format) {
            Some(provisioner) => violations.extend(
                provisioner
                    .check_metadata(output.format, entry)
                    .into_iter()
                    .map(|problem| format!("Output '{}': {problem}", output.name)),
            ),
            None => violations.push(format!(
                "Output '{}': no output provisioner for format '{}'",
                output.name, output.format
            )),
        }
    }
    for name in metadata.keys() {
        if workflow.output(name).is_none() {
            violations.push(format!("Metadata for unknown output '{name}'"));
        }
    }
}

fn check_resources(target: &Target, request: &RunRequest, violations: &mut Vec<String>) {
    for (name, input) in &request.consumable_resources {
        match target.resources().get(name) {
            None => violations.push(format!("Unknown consumable resource '{name}'")),
            Some(resource) => match resource.input_type() {
                Some(kind) => check_value(
                    target,
                    &format!("Consumable resource '{name}'"),
                    &kind,
                    input,
                    violations,
                ),
                None => violations.push(format!("Consumable resource '{name}' takes no input")),
            },
        }
    }
}

fn check_priority_input(input: Option<&Value>, violations: &mut Vec<String>) {
    match input {
        None | Some(Value::Null) => {}
        Some(Value::Object(labels)) => {
            for (label, value) in labels {
                if !value.is_string() {
                    violations.push(format!(
                        "Priority input '{label}': expected string but got {}",
                        json_kind(value)
                    ));
                }
            }
        }
        Some(other) => violations.push(format!(
            "Priority input must be an object of labels but got {}",
            json_kind(other)
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "floating",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
