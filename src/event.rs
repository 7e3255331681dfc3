//! Telemetry event model.
//!
//! Events are the unit of telemetry sent to the collector. They are serialized
//! in the collector's wire shape (camelCase keys, absent optionals omitted) and
//! linked into call trees through `runId`/`parentRunId`. The payload fields are
//! carried opaquely; the SDK never interprets them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of run an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Tool,
    Llm,
    Chat,
    Thread,
    Log,
}

/// Lifecycle verb of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Start,
    End,
    Error,
    Info,
    Chat,
    ToolCall,
}

/// Token counts reported with an `end` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensUsage {
    pub prompt: u32,
    pub completion: u32,
}

/// Cleaned detail of an error captured from a wrapped call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDetail {
    /// Capture an error's message for reporting
    pub fn from_display(err: &dyn std::fmt::Display) -> Self {
        Self {
            message: err.to_string(),
            stack: None,
        }
    }
}

/// Partial event record passed to `track_event`.
///
/// Everything is optional; the client fills in the run id, ambient parent,
/// ambient user identity and ambient evaluation binding for whatever is left
/// unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_props: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_usage: Option<TokensUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// A single telemetry event in collector wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub event: EventName,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Unix milliseconds; the queue bumps this to stay strictly increasing
    pub timestamp: i64,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_props: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_usage: Option<TokensUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl Event {
    /// Build a full event from a partial record.
    ///
    /// Missing run ids get a fresh one; the timestamp is provisional until the
    /// queue assigns the monotonic one.
    pub fn from_fields(
        event_type: EventType,
        event: EventName,
        fields: EventFields,
        runtime: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            event,
            run_id: fields.run_id.unwrap_or_else(new_run_id),
            parent_run_id: fields.parent_run_id,
            timestamp: now_ms(),
            runtime: runtime.into(),
            user_id: fields.user_id,
            evaluation_id: fields.evaluation_id,
            name: fields.name,
            input: fields.input,
            output: fields.output,
            params: fields.params,
            metadata: fields.metadata,
            user_props: fields.user_props,
            tokens_usage: fields.tokens_usage,
            error: fields.error,
            message: fields.message,
        }
    }
}

/// Generate a fresh run id
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall clock in Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
