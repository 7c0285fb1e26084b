//! Memory slice types and the "needs" descriptor grammar.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run::RunId;

/// Step name used for slices written at run start.
pub const RUN_START_STEP: &str = "__run__";

/// Step name used for the initial user prompt slice.
pub const INITIAL_PROMPT_STEP: &str = "__initial__";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Tag describing what a memory slice holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Classification {
    UserPrompt,
    Parameters,
    Output,
    Error,
    /// JSON-encoded `StepResult`, one per recorded step.
    StepResult,
    Custom(String),
}

impl Classification {
    pub fn as_str(&self) -> &str {
        match self {
            Classification::UserPrompt => "user_prompt",
            Classification::Parameters => "parameters",
            Classification::Output => "output",
            Classification::Error => "error",
            Classification::StepResult => "step_result",
            Classification::Custom(tag) => tag,
        }
    }
}

impl From<&str> for Classification {
    fn from(s: &str) -> Self {
        match s {
            "user_prompt" => Classification::UserPrompt,
            "parameters" => Classification::Parameters,
            "output" => Classification::Output,
            "error" => Classification::Error,
            "step_result" => Classification::StepResult,
            other => Classification::Custom(other.to_string()),
        }
    }
}

impl From<String> for Classification {
    fn from(s: String) -> Self {
        Classification::from(s.as_str())
    }
}

impl From<Classification> for String {
    fn from(c: Classification) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Slices
// ---------------------------------------------------------------------------

/// One durable, classified record produced during a run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySlice {
    /// Store-assigned, monotonically increasing.
    pub id: i64,
    pub run_id: RunId,
    pub step_name: String,
    pub classification: Classification,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A slice about to be appended. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSlice {
    pub run_id: RunId,
    pub step_name: String,
    pub classification: Classification,
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl NewSlice {
    pub fn new(
        run_id: &RunId,
        step_name: impl Into<String>,
        classification: Classification,
        content: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.clone(),
            step_name: step_name.into(),
            classification,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for `MemoryStore::query`. Unset fields match everything.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceQuery {
    pub run_id: RunId,
    pub step_name: Option<String>,
    pub classification: Option<Classification>,
    pub limit: Option<usize>,
}

impl SliceQuery {
    pub fn run(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
            step_name: None,
            classification: None,
            limit: None,
        }
    }

    pub fn step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, slice: &MemorySlice) -> bool {
        slice.run_id == self.run_id
            && self.step_name.as_ref().is_none_or(|s| *s == slice.step_name)
            && self
                .classification
                .as_ref()
                .is_none_or(|c| *c == slice.classification)
    }
}

/// Per-run overview used by `inspect --recent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub slice_count: u64,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_slices: u64,
    pub distinct_runs: u64,
    pub by_classification: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Needs grammar
// ---------------------------------------------------------------------------

/// A parsed memory "needs" descriptor.
///
/// | descriptor | binding |
/// |---|---|
/// | `user_prompt` | `memory.user_prompt` |
/// | `parameters` | `memory.<param>` per parameter |
/// | `tool_output(s)` / `step_output(s)` | `memory.s_output` |
/// | `step(s)` | `memory.s` |
/// | `last_output` / `previous_output` | `memory.last_output` |
/// | `classification(tag)` | `memory.tag` |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemoryNeed {
    UserPrompt,
    Parameters,
    ToolOutput(String),
    Step(String),
    LastOutput,
    Classification(String),
}

impl MemoryNeed {
    /// The step this need reads from, if any.
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            MemoryNeed::ToolOutput(step) | MemoryNeed::Step(step) => Some(step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NeedParseError {
    #[error("empty memory need")]
    Empty,

    #[error("unknown memory need '{0}'")]
    Unknown(String),

    #[error("memory need '{0}' is missing its argument")]
    MissingArgument(String),

    #[error("invalid argument '{arg}' in memory need '{need}'")]
    InvalidArgument { need: String, arg: String },
}

fn valid_argument(arg: &str) -> bool {
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl FromStr for MemoryNeed {
    type Err = NeedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NeedParseError::Empty);
        }

        let Some((head, rest)) = s.split_once('(') else {
            return match s {
                "user_prompt" | "last_user_prompt" => Ok(MemoryNeed::UserPrompt),
                "parameters" => Ok(MemoryNeed::Parameters),
                "last_output" | "previous_output" => Ok(MemoryNeed::LastOutput),
                "tool_output" | "step_output" | "step" | "classification" => {
                    Err(NeedParseError::MissingArgument(s.to_string()))
                }
                other => Err(NeedParseError::Unknown(other.to_string())),
            };
        };

        let Some(arg) = rest.strip_suffix(')') else {
            return Err(NeedParseError::Unknown(s.to_string()));
        };
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(NeedParseError::MissingArgument(s.to_string()));
        }
        if !valid_argument(arg) {
            return Err(NeedParseError::InvalidArgument {
                need: s.to_string(),
                arg: arg.to_string(),
            });
        }

        match head.trim() {
            "tool_output" | "step_output" => Ok(MemoryNeed::ToolOutput(arg.to_string())),
            "step" => Ok(MemoryNeed::Step(arg.to_string())),
            "classification" => Ok(MemoryNeed::Classification(arg.to_string())),
            _ => Err(NeedParseError::Unknown(s.to_string())),
        }
    }
}

impl TryFrom<String> for MemoryNeed {
    type Error = NeedParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MemoryNeed> for String {
    fn from(need: MemoryNeed) -> Self {
        need.to_string()
    }
}

impl fmt::Display for MemoryNeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryNeed::UserPrompt => write!(f, "user_prompt"),
            MemoryNeed::Parameters => write!(f, "parameters"),
            MemoryNeed::ToolOutput(step) => write!(f, "tool_output({step})"),
            MemoryNeed::Step(step) => write!(f, "step({step})"),
            MemoryNeed::LastOutput => write!(f, "last_output"),
            MemoryNeed::Classification(tag) => write!(f, "classification({tag})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_descriptor_form() {
        let cases = [
            ("user_prompt", MemoryNeed::UserPrompt),
            ("last_user_prompt", MemoryNeed::UserPrompt),
            ("parameters", MemoryNeed::Parameters),
            ("tool_output(s1)", MemoryNeed::ToolOutput("s1".into())),
            ("step_output( s1 )", MemoryNeed::ToolOutput("s1".into())),
            ("step(draft-2)", MemoryNeed::Step("draft-2".into())),
            ("previous_output", MemoryNeed::LastOutput),
            ("classification(summary)", MemoryNeed::Classification("summary".into())),
        ];
        for (raw, expected) in cases {
            assert_eq!(raw.parse::<MemoryNeed>().unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert_eq!("".parse::<MemoryNeed>(), Err(NeedParseError::Empty));
        assert!(matches!(
            "everything".parse::<MemoryNeed>(),
            Err(NeedParseError::Unknown(_))
        ));
        assert!(matches!(
            "tool_output()".parse::<MemoryNeed>(),
            Err(NeedParseError::MissingArgument(_))
        ));
        assert!(matches!(
            "tool_output(s1".parse::<MemoryNeed>(),
            Err(NeedParseError::Unknown(_))
        ));
        assert!(matches!(
            "step(a b)".parse::<MemoryNeed>(),
            Err(NeedParseError::InvalidArgument { .. })
        ));
        assert!(matches!(
            "search(s1)".parse::<MemoryNeed>(),
            Err(NeedParseError::Unknown(_))
        ));
    }

    #[test]
    fn classification_string_forms() {
        assert_eq!(Classification::from("output"), Classification::Output);
        assert_eq!(
            Classification::from("summary"),
            Classification::Custom("summary".into())
        );
        let json = serde_json::to_string(&Classification::UserPrompt).unwrap();
        assert_eq!(json, "\"user_prompt\"");
    }

    #[test]
    fn query_matching_respects_optional_filters() {
        let run = RunId::from("r1");
        let slice = MemorySlice {
            id: 1,
            run_id: run.clone(),
            step_name: "s1".into(),
            classification: Classification::Output,
            content: "hi".into(),
            metadata: Map::new(),
            created_at: Utc::now(),
        };
        assert!(SliceQuery::run(&run).matches(&slice));
        assert!(SliceQuery::run(&run).step("s1").matches(&slice));
        assert!(!SliceQuery::run(&run).step("s2").matches(&slice));
        assert!(!SliceQuery::run(&run)
            .classification(Classification::Error)
            .matches(&slice));
        assert!(!SliceQuery::run(&RunId::from("r2")).matches(&slice));
    }
}
