//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Everything here runs before a run starts. A definition that passes
//! [`validate_definition`] has unique step names, no forward references, and
//! only well-formed memory needs, so the executor never re-checks them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use stepwise_types::memory::MemoryNeed;
use stepwise_types::workflow::{TemplateValue, WorkflowDefinition};
use thiserror::Error;

use crate::template::placeholders;
use crate::tool::ToolRegistry;
use crate::tool::fan_out::FAN_OUT_TOOL;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn invalid(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(msg.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a workflow file.
///
/// Accepts either a top-level `workflows:` map of name to definition, or a
/// single definition with a `name:` key. Every definition is validated.
pub fn parse_workflows_yaml(yaml: &str) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
    let raw: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;

    let mut definitions = Vec::new();
    match raw {
        Value::Object(mut root) if root.contains_key("workflows") => {
            let Some(Value::Object(workflows)) = root.remove("workflows") else {
                return Err(WorkflowError::ParseError("'workflows' must be a map".into()));
            };
            for (name, body) in workflows {
                let mut def = definition_from_value(&name, body)?;
                if def.name.is_empty() {
                    def.name = name;
                }
                definitions.push(def);
            }
        }
        Value::Object(root) => {
            let label = root
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>")
                .to_string();
            definitions.push(definition_from_value(&label, Value::Object(root))?);
        }
        _ => {
            return Err(WorkflowError::ParseError(
                "expected a workflow definition or a 'workflows' map".into(),
            ));
        }
    }

    for def in &definitions {
        validate_definition(def)?;
    }
    Ok(definitions)
}

/// Parse exactly one workflow from YAML.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let mut defs = parse_workflows_yaml(yaml)?;
    match defs.len() {
        1 => Ok(defs.remove(0)),
        n => Err(WorkflowError::ParseError(format!(
            "expected one workflow, found {n}"
        ))),
    }
}

fn definition_from_value(label: &str, body: Value) -> Result<WorkflowDefinition, WorkflowError> {
    check_need_syntax(label, &body)?;
    serde_json::from_value(body)
        .map_err(|e| WorkflowError::ParseError(format!("workflow '{label}': {e}")))
}

/// Report malformed needs as validation errors naming the step, before
/// deserialization turns them into a generic parse failure.
fn check_need_syntax(label: &str, body: &Value) -> Result<(), WorkflowError> {
    let Some(steps) = body.get("steps").and_then(Value::as_array) else {
        return Ok(());
    };
    for step in steps {
        let step_name = step.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        let Some(needs) = step.pointer("/memory/needs").and_then(Value::as_array) else {
            continue;
        };
        for need in needs {
            let Some(raw) = need.as_str() else {
                return Err(invalid(format!(
                    "workflow '{label}', step '{step_name}': memory needs must be strings"
                )));
            };
            raw.parse::<MemoryNeed>().map_err(|e| {
                invalid(format!("workflow '{label}', step '{step_name}': {e}"))
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints of a workflow definition.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let wf = def.name.as_str();
    if wf.trim().is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if def.steps.is_empty() {
        return Err(invalid(format!("workflow '{wf}' has no steps")));
    }

    let mut params = HashSet::new();
    for param in &def.params {
        if param.name.trim().is_empty() {
            return Err(invalid(format!("workflow '{wf}': empty parameter name")));
        }
        if !params.insert(param.name.as_str()) {
            return Err(invalid(format!(
                "workflow '{wf}': duplicate parameter '{}'",
                param.name
            )));
        }
    }

    let all_steps: HashSet<&str> = def.steps.iter().map(|s| s.name.as_str()).collect();
    let mut earlier: HashSet<&str> = HashSet::new();

    for step in &def.steps {
        let name = step.name.as_str();
        let at = || format!("workflow '{wf}', step '{name}'");

        if name.trim().is_empty() {
            return Err(invalid(format!("workflow '{wf}': step with empty name")));
        }
        if earlier.contains(name) {
            return Err(invalid(format!("{}: duplicate step name", at())));
        }
        match (&step.tool, &step.gate) {
            (Some(tool), _) if tool.trim().is_empty() => {
                return Err(invalid(format!("{}: empty tool name", at())));
            }
            (None, None) => {
                return Err(invalid(format!("{}: needs a tool or a gate", at())));
            }
            _ => {}
        }
        if step.timeout_secs == Some(0) {
            return Err(invalid(format!("{}: timeout_secs must be positive", at())));
        }

        let mut templates: Vec<&str> = step.inputs.values().flat_map(|v| v.texts()).collect();
        if let Some(prompt) = step.gate.as_ref().and_then(|g| g.prompt.as_deref()) {
            templates.push(prompt);
        }
        for template in templates {
            for path in placeholders(template) {
                check_reference(path, &params, &earlier, &all_steps)
                    .map_err(|e| invalid(format!("{}: {e}", at())))?;
            }
        }

        for need in &step.memory.needs {
            if let Some(target) = need.referenced_step() {
                check_step_reference(target, &earlier, &all_steps)
                    .map_err(|e| invalid(format!("{}: need '{need}' {e}", at())))?;
            }
        }

        earlier.insert(name);
    }
    Ok(())
}

fn check_reference(
    path: &str,
    params: &HashSet<&str>,
    earlier: &HashSet<&str>,
    all_steps: &HashSet<&str>,
) -> Result<(), String> {
    let mut segments = path.split('.').map(str::trim);
    let root = segments.next().unwrap_or_default();
    let head = segments.next();
    match (root, head) {
        ("params", Some(param)) => {
            let rest = path.trim_start_matches("params.");
            // Parameter names may themselves contain dots.
            if params.contains(param)
                || params
                    .iter()
                    .any(|p| rest == *p || rest.starts_with(&format!("{p}.")))
            {
                Ok(())
            } else {
                Err(format!("'{{{{{path}}}}}' references undeclared parameter '{param}'"))
            }
        }
        ("steps", Some(step)) => check_step_reference(step, earlier, all_steps)
            .map_err(|e| format!("'{{{{{path}}}}}' {e}")),
        ("memory", Some(_)) => Ok(()),
        _ => Err(format!(
            "'{{{{{path}}}}}' must start with params., steps. or memory."
        )),
    }
}

fn check_step_reference(
    step: &str,
    earlier: &HashSet<&str>,
    all_steps: &HashSet<&str>,
) -> Result<(), String> {
    if earlier.contains(step) {
        Ok(())
    } else if all_steps.contains(step) {
        Err(format!("refers to step '{step}' which runs later"))
    } else {
        Err(format!("refers to unknown step '{step}'"))
    }
}

/// Check that every step's tool is registered. Fan-out steps need a
/// `queries` input; literal sub-queries must name registered tools and may
/// not nest another fan-out.
pub fn validate_tools(def: &WorkflowDefinition, registry: &ToolRegistry) -> Result<(), WorkflowError> {
    for step in &def.steps {
        let Some(tool) = step.tool.as_deref() else {
            continue;
        };
        if !registry.contains(tool) {
            return Err(invalid(format!(
                "workflow '{}', step '{}': unknown tool '{tool}' (available: {})",
                def.name,
                step.name,
                registry.names().join(", ")
            )));
        }
        if tool == FAN_OUT_TOOL {
            check_fan_out(step.inputs.get("queries"), registry)
                .map_err(|e| invalid(format!("workflow '{}', step '{}': {e}", def.name, step.name)))?;
        }
    }
    Ok(())
}

fn check_fan_out(queries: Option<&TemplateValue>, registry: &ToolRegistry) -> Result<(), String> {
    let items = match queries {
        None => return Err(format!("'{FAN_OUT_TOOL}' needs a 'queries' input")),
        Some(TemplateValue::List(items)) => items,
        // Resolved at run time; the tool validates it then.
        Some(_) => return Ok(()),
    };
    for (index, item) in items.iter().enumerate() {
        let TemplateValue::Map(query) = item else {
            continue;
        };
        match query.get("tool") {
            Some(TemplateValue::Text(sub)) if sub == FAN_OUT_TOOL => {
                return Err(format!("query {index} cannot nest '{FAN_OUT_TOOL}'"));
            }
            Some(TemplateValue::Text(sub)) if !sub.contains("{{") && !registry.contains(sub) => {
                return Err(format!("query {index} uses unknown tool '{sub}'"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Bind run parameters against the declared schema.
///
/// Declared parameters come first in declaration order, defaults filling
/// gaps; undeclared extras are kept after them.
pub fn validate_params(
    def: &WorkflowDefinition,
    provided: Map<String, Value>,
) -> Result<Map<String, Value>, WorkflowError> {
    let mut provided = provided;
    let mut bound = Map::new();
    let mut missing = Vec::new();

    for param in &def.params {
        match provided.remove(&param.name) {
            Some(value) => {
                bound.insert(param.name.clone(), value);
            }
            None => match &param.default {
                Some(default) => {
                    bound.insert(param.name.clone(), default.clone());
                }
                None => missing.push(param.name.as_str()),
            },
        }
    }
    if !missing.is_empty() {
        return Err(invalid(format!(
            "workflow '{}' is missing required parameter(s): {}",
            def.name,
            missing.join(", ")
        )));
    }
    bound.extend(provided);
    Ok(bound)
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load and validate every workflow in a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflows_yaml(&content)
}

/// Recursively discover `*.yaml` / `*.yml` workflow files under `base_dir`.
///
/// Files that fail to load are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(defs) => results.extend(defs.into_iter().map(|d| (path.clone(), d))),
                Err(e) => tracing::warn!(?path, "skipping workflow file: {e}"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
