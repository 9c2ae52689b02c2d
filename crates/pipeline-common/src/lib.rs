/// Common types shared by the queue, the work units and the orchestrator
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while parsing shared identifiers and kinds
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid handle id: {0}")]
    InvalidHandleId(String),

    #[error("Unknown value kind: {0}")]
    UnknownValueKind(String),
}

/// Opaque identifier of a queued unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Allocate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HandleId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseError::InvalidHandleId(s.to_string()))
    }
}

/// State of an execution handle as tracked by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandleState {
    /// Allocated, not yet picked up by a worker (or not yet enqueued)
    Pending,
    /// Executing on a worker
    Started,
    /// Finished and produced a result
    Success,
    /// Raised an error
    Failure,
    /// Revoked or aborted before producing a result
    Revoked,
}

impl HandleState {
    /// SUCCESS, FAILURE and REVOKED never change again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured error recorded against a failed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("stage {stage_index} ({unit}) failed: {message}")]
pub struct StageError {
    /// Name of the unit that raised
    pub unit: String,
    /// Position of the stage inside its chain
    pub stage_index: usize,
    /// Rendered error message
    pub message: String,
}

/// Snapshot of a queued unit's execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: HandleId,
    pub state: HandleState,
    /// Previous stage in the same chain (traversal only)
    pub parent: Option<HandleId>,
    /// Name of the unit this handle executes
    pub unit: String,
    /// Position inside the chain
    pub stage_index: usize,
    pub result: Option<serde_json::Value>,
    pub error: Option<StageError>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionHandle {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Declared kind of a value flowing between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Any,
    Text,
    Number,
    Integer,
    Boolean,
    Path,
    Object,
    List,
}

impl ValueKind {
    /// Whether a value of kind `produced` can be bound where `self` is declared
    #[must_use]
    pub fn accepts(self, produced: ValueKind) -> bool {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Number, Self::Integer) => true,
            (expected, actual) => expected == actual,
        }
    }

    /// Kind of a concrete JSON value (paths travel as strings)
    #[must_use]
    pub fn of(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::Text,
            Value::Array(_) => Self::List,
            Value::Object(_) => Self::Object,
        }
    }

    /// Runtime check used when a static parameter is bound
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            // Paths are strings on the wire
            Self::Path => value.is_string(),
            kind => kind.accepts(Self::of(value)),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Text => "text",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Path => "path",
            Self::Object => "object",
            Self::List => "list",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "text" | "string" => Ok(Self::Text),
            "number" | "float" => Ok(Self::Number),
            "integer" | "int" => Ok(Self::Integer),
            "boolean" | "bool" => Ok(Self::Boolean),
            "path" => Ok(Self::Path),
            "object" => Ok(Self::Object),
            "list" => Ok(Self::List),
            other => Err(ParseError::UnknownValueKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(!HandleState::Pending.is_terminal());
        assert!(!HandleState::Started.is_terminal());
        assert!(HandleState::Success.is_terminal());
        assert!(HandleState::Failure.is_terminal());
        assert!(HandleState::Revoked.is_terminal());
    }

    #[test]
    fn test_handle_id_parse() {
        let id = HandleId::new();
        let parsed: HandleId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<HandleId>().is_err());
    }

    #[test]
    fn test_value_kind_compatibility() {
        assert!(ValueKind::Number.accepts(ValueKind::Integer));
        assert!(!ValueKind::Integer.accepts(ValueKind::Number));
        assert!(ValueKind::Any.accepts(ValueKind::Path));
        assert!(ValueKind::Text.accepts(ValueKind::Any));
        assert!(!ValueKind::Text.accepts(ValueKind::Path));
    }

    #[test]
    fn test_value_kind_matches_json() {
        assert!(ValueKind::Integer.matches(&json!(4)));
        assert!(ValueKind::Number.matches(&json!(4)));
        assert!(ValueKind::Number.matches(&json!(4.5)));
        assert!(!ValueKind::Integer.matches(&json!(4.5)));
        assert!(ValueKind::Path.matches(&json!("/tmp/out.txt")));
        assert!(!ValueKind::Object.matches(&json!([1, 2])));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&HandleState::Revoked).unwrap();
        assert_eq!(json, "\"REVOKED\"");
    }
}
