//! One JSONL log line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log entry; each line of a log file is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds, UTC
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Process that wrote the entry (e.g. "cli")
    pub source: String,

    /// Module path of the event (e.g. "clearmind_sync::sync::outbox")
    pub target: String,

    pub msg: String,

    /// Structured fields recorded with the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    pub fn new(
        level: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            source: source.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Look up a structured field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|f| f.get(name))
    }
}
