//! The immutable trace event record.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of observable occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStart,
    AgentEnd,
    AgentTurn,
    ToolCall,
    ToolResult,
    DecisionPoint,
    Validation,
    Error,
    Note,
}

/// One timestamped record of something that happened during a run.
///
/// Events are append-only: once recorded they are never mutated or removed,
/// and timestamps are non-decreasing within a run. Event-type-specific
/// fields stay `None` (and off the wire) for other event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub formatted_timestamp: String,
    pub event_type: EventType,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl TraceEvent {
    /// A bare event of the given type; callers fill the type-specific fields.
    pub fn base(event_type: EventType, timestamp: f64) -> Self {
        Self {
            timestamp,
            formatted_timestamp: format_timestamp(timestamp),
            event_type,
            step_name: None,
            agent_name: None,
            cycle: None,
            turn: None,
            tool_name: None,
            tool_args: None,
            tool_result: None,
            tool_duration: None,
            decision: None,
            reasoning: None,
            message: None,
            metadata: Map::new(),
        }
    }
}

/// Local wall-clock rendering with millisecond precision.
fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - secs as f64) * 1e9) as u32;
    match Local.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(datetime) | chrono::LocalResult::Ambiguous(datetime, _) => {
            datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        }
        chrono::LocalResult::None => format!("{timestamp:.3}"),
    }
}

/// Truncate payload text so single events stay readable in the JSONL log.
pub fn preview(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_absent_optional_fields() {
        let event = TraceEvent::base(EventType::Note, 1_700_000_000.25);
        let value = serde_json::to_value(&event).expect("serialize");
        let object = value.as_object().expect("object");

        assert!(object.contains_key("timestamp"));
        assert!(object.contains_key("step_name"));
        assert!(object.contains_key("agent_name"));
        assert!(!object.contains_key("tool_name"));
        assert!(!object.contains_key("metadata"));
        assert_eq!(object["event_type"], json!("note"));
    }

    #[test]
    fn round_trips_through_json() {
        let mut event = TraceEvent::base(EventType::ToolCall, 100.0);
        event.step_name = Some("build".to_string());
        event.tool_name = Some("write_text".to_string());
        event.tool_args = Some(json!({"path": "out.json"}));

        let line = serde_json::to_string(&event).expect("serialize");
        let loaded: TraceEvent = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(loaded, event);
    }

    #[test]
    fn preview_truncates_long_payloads() {
        assert_eq!(preview("short", 10), "short");
        let long = "x".repeat(600);
        let cut = preview(&long, 500);
        assert_eq!(cut.len(), 503);
        assert!(cut.ends_with("..."));
    }
}
