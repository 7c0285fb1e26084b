//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the immutable shape of a workflow: its declared
//! parameters and an ordered list of steps. Definitions are loaded from YAML
//! once and never mutated while runs execute.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::memory::MemoryNeed;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, ordered sequence of steps with declared parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name. Filled from the map key when loaded from a `workflows:` file.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered parameter schema.
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: Vec<ParamSpec>,
    /// Steps in declaration (and execution) order.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// One declared workflow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// Default value. `None` means the parameter is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            description: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            description: None,
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Accepts the three parameter spellings found in workflow files:
///
/// ```yaml
/// params: [topic, {depth: 2}, {style: {default: brief, description: Output style}}]
/// params: {topic: null, depth: 2}
/// params: [{name: topic, description: What to research}]
/// ```
fn deserialize_params<'de, D>(deserializer: D) -> Result<Vec<ParamSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    params_from_value(raw).map_err(serde::de::Error::custom)
}

const SPEC_KEYS: [&str; 4] = ["name", "default", "description", "required"];

fn params_from_value(raw: Value) -> Result<Vec<ParamSpec>, String> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Array(entries) => {
            let mut params = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Value::String(name) => params.push(ParamSpec::required(name)),
                    Value::Object(map) if map.get("name").is_some_and(Value::is_string) => {
                        if let Some(key) = map.keys().find(|k| !SPEC_KEYS.contains(&k.as_str())) {
                            return Err(format!("unknown parameter field '{key}'"));
                        }
                        let name = map["name"].as_str().unwrap_or_default().to_string();
                        params.push(spec_from_object(name, &map));
                    }
                    Value::Object(map) if map.len() == 1 => {
                        for (name, value) in map {
                            params.push(spec_from_entry(name, value));
                        }
                    }
                    other => return Err(format!("invalid parameter entry: {other}")),
                }
            }
            Ok(params)
        }
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| spec_from_entry(name, value))
            .collect()),
        other => Err(format!("params must be a list or a map, got {other}")),
    }
}

fn spec_from_entry(name: String, value: Value) -> ParamSpec {
    match value {
        Value::Null => ParamSpec::required(name),
        Value::Object(map)
            if !map.is_empty() && map.keys().all(|k| SPEC_KEYS[1..].contains(&k.as_str())) =>
        {
            spec_from_object(name, &map)
        }
        default => ParamSpec::with_default(name, default),
    }
}

fn spec_from_object(name: String, map: &serde_json::Map<String, Value>) -> ParamSpec {
    let required = map.get("required").and_then(Value::as_bool).unwrap_or(false);
    let default = if required {
        None
    } else {
        map.get("default").filter(|v| !v.is_null()).cloned()
    };
    ParamSpec {
        name,
        default,
        description: map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step: one tool invocation with templated inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub name: String,
    /// Registered tool name. A step without a tool must declare a gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Input key -> template value, in declaration order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, TemplateValue>,
    #[serde(default, skip_serializing_if = "MemorySpec::is_empty")]
    pub memory: MemorySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Overrides the registry timeout for this step's tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: Some(tool.into()),
            inputs: IndexMap::new(),
            memory: MemorySpec::default(),
            gate: None,
            on_failure: FailurePolicy::default(),
            timeout_secs: None,
        }
    }

    /// A tool-less checkpoint that only asks for approval.
    pub fn checkpoint(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            tool: None,
            gate: Some(GateSpec {
                prompt: Some(prompt.into()),
            }),
            ..Self::new(name, "")
        }
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn needs(mut self, need: MemoryNeed) -> Self {
        self.memory.needs.push(need);
        self
    }

    pub fn gate(mut self, prompt: impl Into<String>) -> Self {
        self.gate = Some(GateSpec {
            prompt: Some(prompt.into()),
        });
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Gate prompt template, falling back to a generic approval question.
    pub fn gate_prompt(&self) -> Option<String> {
        self.gate.as_ref().map(|g| {
            g.prompt
                .clone()
                .unwrap_or_else(|| format!("Approve step '{}'?", self.name))
        })
    }
}

/// Memory context a step declares it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySpec {
    #[serde(default)]
    pub needs: Vec<MemoryNeed>,
}

impl MemorySpec {
    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
    }
}

/// Human approval checkpoint evaluated before the step's tool runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// What happens to the run when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the run; later steps are recorded as skipped.
    #[default]
    AbortChain,
    /// Record the failure and move on to the next step.
    Continue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::AbortChain => write!(f, "abort_chain"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

// ---------------------------------------------------------------------------
// Template values
// ---------------------------------------------------------------------------

/// A step input before placeholder resolution.
///
/// Strings may contain `{{path}}` placeholders. Lists and maps nest freely;
/// non-string scalars pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Text(String),
    List(Vec<TemplateValue>),
    Map(IndexMap<String, TemplateValue>),
    Literal(Value),
}

impl TemplateValue {
    /// Every string leaf, depth-first.
    pub fn texts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_texts(&mut out);
        out
    }

    fn collect_texts<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            TemplateValue::Text(s) => out.push(s),
            TemplateValue::List(items) => items.iter().for_each(|i| i.collect_texts(out)),
            TemplateValue::Map(map) => map.values().for_each(|v| v.collect_texts(out)),
            TemplateValue::Literal(_) => {}
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        TemplateValue::Text(s.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(s: String) -> Self {
        TemplateValue::Text(s)
    }
}

impl From<Value> for TemplateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => TemplateValue::Text(s),
            Value::Array(items) => {
                TemplateValue::List(items.into_iter().map(TemplateValue::from).collect())
            }
            Value::Object(map) => TemplateValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, TemplateValue::from(v)))
                    .collect(),
            ),
            other => TemplateValue::Literal(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Summary returned by the engine's list operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    pub step_count: usize,
    pub step_names: Vec<String>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            params: def.params.clone(),
            step_count: def.steps.len(),
            step_names: def.steps.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_accept_list_map_and_explicit_forms() {
        let yaml = r#"
name: research
params:
  - topic
  - depth: 2
  - style: { default: brief, description: Output style }
  - { name: audience, description: Who reads it }
steps:
  - name: s1
    tool: echo
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.params.len(), 4);
        assert!(def.params[0].is_required());
        assert_eq!(def.params[1].default, Some(json!(2)));
        assert_eq!(def.params[2].default, Some(json!("brief")));
        assert_eq!(def.params[2].description.as_deref(), Some("Output style"));
        assert_eq!(def.params[3].name, "audience");
        assert!(def.params[3].is_required());

        let yaml = "params: { topic: null, depth: 3 }\nsteps: []\n";
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.params[0].name, "topic");
        assert!(def.params[0].is_required());
        assert_eq!(def.params[1].default, Some(json!(3)));
    }

    #[test]
    fn step_defaults_and_nested_inputs() {
        let yaml = r#"
name: s1
tool: parallel_query
inputs:
  queries:
    - { provider: anthropic, model: m, prompt_template: "{{params.q}}" }
  max_workers: 2
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.on_failure, FailurePolicy::AbortChain);
        assert!(step.gate.is_none());
        assert!(matches!(
            step.inputs["max_workers"],
            TemplateValue::Literal(Value::Number(_))
        ));
        let keys: Vec<&str> = step.inputs.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["queries", "max_workers"]);
        assert_eq!(step.inputs["queries"].texts(), vec!["anthropic", "m", "{{params.q}}"]);
    }

    #[test]
    fn gate_prompt_falls_back_to_default() {
        let step: StepDefinition =
            serde_yaml_ng::from_str("name: review\ngate: {}\non_failure: continue\n").unwrap();
        assert_eq!(step.gate_prompt().as_deref(), Some("Approve step 'review'?"));
        assert_eq!(step.on_failure, FailurePolicy::Continue);
        assert!(step.tool.is_none());
    }

    #[test]
    fn unknown_need_is_a_parse_error() {
        let yaml = "name: s\ntool: echo\nmemory: { needs: [\"everything()\"] }\n";
        assert!(serde_yaml_ng::from_str::<StepDefinition>(yaml).is_err());
    }
}
