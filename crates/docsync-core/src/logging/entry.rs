//! Log entry type for JSONL logging.
//!
//! Each entry is a self-contained JSON object, one per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log entry in JSONL format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds (e.g., "2026-01-21T14:30:45.123Z")
    pub ts: String,

    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Instance name (e.g., "replica-1")
    pub instance: String,

    /// Module path / target (e.g., "docsync_core::sync::provider")
    pub target: String,

    /// Human-readable message
    pub msg: String,

    /// Structured fields recorded with the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, root first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// Create a new log entry with the current timestamp.
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
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

    /// Look up a structured field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|fields| fields.get(name))
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_serialization() {
        let entry = JsonLogEntry::new("warn", "replica-1", "docsync_core::sync", "Permission denied");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"warn\""));
        assert!(json.contains("\"instance\":\"replica-1\""));
        assert!(!json.contains("\"fields\""));

        let parsed: JsonLogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_log_entry_with_fields() {
        let entry = JsonLogEntry::new("error", "replica-2", "docsync_core::sync", "Unable to compute message")
            .with_fields(serde_json::json!({ "kind": 99, "origin": "1" }));

        assert_eq!(entry.field("kind"), Some(&serde_json::json!(99)));
        assert_eq!(entry.field("missing"), None);

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"kind\":99"));
    }
}
