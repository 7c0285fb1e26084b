//! `{{path}}` placeholder resolution against a layered step scope.
//!
//! A [`Scope`] has three namespaced layers: `params`, `steps` and `memory`.
//! [`TemplateResolver`] walks a [`TemplateValue`] depth-first and resolves
//! each string leaf in a single pass:
//!
//! - a string that is exactly one placeholder keeps the native type of the
//!   resolved value (a map stays a map),
//! - placeholders embedded in other text are spliced in as display strings,
//! - substituted text is never re-scanned for placeholders.

use serde_json::{Map, Value};
use stepwise_types::config::MissingPathPolicy;
use stepwise_types::workflow::TemplateValue;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template path '{0}' did not resolve")]
    MissingPath(String),
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Per-step variable environment. Built fresh for every step and discarded
/// once the step's inputs are resolved.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    root: Map<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.root.insert("params".into(), Value::Object(params));
        self
    }

    pub fn with_steps(mut self, steps: Map<String, Value>) -> Self {
        self.root.insert("steps".into(), Value::Object(steps));
        self
    }

    pub fn with_memory(mut self, memory: Map<String, Value>) -> Self {
        self.root.insert("memory".into(), Value::Object(memory));
        self
    }

    /// Resolve a dotted path. At every level the longest exact key match wins
    /// before descending, so keys that themselves contain dots stay reachable.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        walk_object(&self.root, &segments)
    }
}

fn walk_object<'a>(map: &'a Map<String, Value>, segments: &[&str]) -> Option<&'a Value> {
    for split in (1..=segments.len()).rev() {
        let key = segments[..split].join(".");
        if let Some(child) = map.get(&key) {
            if let Some(found) = walk(child, &segments[split..]) {
                return Some(found);
            }
        }
    }
    None
}

fn walk<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    if segments.is_empty() {
        return Some(value);
    }
    match value {
        Value::Object(map) => walk_object(map, segments),
        Value::Array(items) => {
            let index: usize = segments[0].parse().ok()?;
            walk(items.get(index)?, &segments[1..])
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Placeholder scanning
// ---------------------------------------------------------------------------

enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split `template` into literal text and placeholder paths, left to right.
/// An unterminated `{{` is kept as literal text.
fn pieces(template: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        let inner = &after[..end];
        if inner.contains('}') || inner.trim().is_empty() {
            out.push(Piece::Text(&rest[..start + OPEN.len()]));
            rest = after;
            continue;
        }
        if start > 0 {
            out.push(Piece::Text(&rest[..start]));
        }
        out.push(Piece::Placeholder(inner.trim()));
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        out.push(Piece::Text(rest));
    }
    out
}

/// Every placeholder path in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<&str> {
    pieces(template)
        .into_iter()
        .filter_map(|p| match p {
            Piece::Placeholder(path) => Some(path),
            Piece::Text(_) => None,
        })
        .collect()
}

/// Display form used when a value is spliced into surrounding text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver {
    policy: MissingPathPolicy,
}

impl TemplateResolver {
    pub fn new(policy: MissingPathPolicy) -> Self {
        Self { policy }
    }

    /// Resolve a template value into a value of the same shape.
    pub fn resolve(&self, template: &TemplateValue, scope: &Scope) -> Result<Value, TemplateError> {
        match template {
            TemplateValue::Text(s) => self.resolve_str(s, scope),
            TemplateValue::List(items) => items
                .iter()
                .map(|item| self.resolve(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            TemplateValue::Map(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.resolve(value, scope)?);
                }
                Ok(Value::Object(out))
            }
            TemplateValue::Literal(value) => Ok(value.clone()),
        }
    }

    /// Resolve one string. A lone placeholder keeps the resolved value's type.
    pub fn resolve_str(&self, template: &str, scope: &Scope) -> Result<Value, TemplateError> {
        let parts = pieces(template);
        if let [Piece::Placeholder(path)] = parts.as_slice() {
            if template.starts_with(OPEN) && template.ends_with(CLOSE) {
                return Ok(self
                    .lookup(path, scope)?
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new())));
            }
        }
        self.render_pieces(&parts, scope).map(Value::String)
    }

    /// Resolve one string to its display form (gate prompts).
    pub fn render(&self, template: &str, scope: &Scope) -> Result<String, TemplateError> {
        self.render_pieces(&pieces(template), scope)
    }

    fn render_pieces(&self, parts: &[Piece<'_>], scope: &Scope) -> Result<String, TemplateError> {
        let mut out = String::new();
        for part in parts {
            match part {
                Piece::Text(text) => out.push_str(text),
                Piece::Placeholder(path) => {
                    if let Some(value) = self.lookup(path, scope)? {
                        out.push_str(&value_to_string(value));
                    }
                }
            }
        }
        Ok(out)
    }

    fn lookup<'s>(&self, path: &str, scope: &'s Scope) -> Result<Option<&'s Value>, TemplateError> {
        match scope.lookup(path) {
            Some(value) => Ok(Some(value)),
            None => match self.policy {
                MissingPathPolicy::Empty => {
                    tracing::warn!(path, "template path did not resolve, substituting empty string");
                    Ok(None)
                }
                MissingPathPolicy::Fail => Err(TemplateError::MissingPath(path.to_string())),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
