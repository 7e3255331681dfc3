//! Conversation threads.
//!
//! A [`Thread`] groups a sequence of chat messages under one parent run id and
//! applies the evaluation emission gate. Messages tracked while the gate is
//! closed are remembered and retroactively emitted, in their original order,
//! the moment an evaluation binding is attached — so production traffic stays
//! silent until an evaluation claims the conversation.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::Avido;
use crate::context;
use crate::event::{new_run_id, EventFields, EventName, EventType};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message tracked on a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Pre-assigned run id; a fresh one is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ChatMessage {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            metadata: None,
            run_id: None,
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: None,
            run_id: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            metadata: None,
            run_id: None,
        }
    }

    /// Attach metadata to this message
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Assign a specific run id instead of generating one
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Options for opening a thread
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Resume an existing thread by id; a fresh id is generated when absent
    pub id: Option<String>,
    pub evaluation_id: Option<String>,
}

struct BufferedMessage {
    run_id: String,
    message: ChatMessage,
}

/// A conversation grouped under one parent run id
pub struct Thread {
    client: Avido,
    id: String,
    evaluation_id: Mutex<Option<String>>,
    pending: Mutex<Vec<BufferedMessage>>,
}

impl Thread {
    pub(crate) fn new(client: Avido, options: ThreadOptions) -> Self {
        Self {
            client,
            id: options.id.unwrap_or_else(new_run_id),
            evaluation_id: Mutex::new(options.evaluation_id),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The thread's own run id, the parent of every message tracked on it
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The thread's evaluation binding, if one is attached
    pub fn evaluation_id(&self) -> Option<String> {
        self.evaluation_id.lock().unwrap().clone()
    }

    /// Record a chat message on this thread.
    ///
    /// Returns the message's run id so a model response or feedback can later
    /// be attached as a child event. While the emission gate is closed the
    /// message is buffered instead of emitted; see [`Thread::set_evaluation`].
    pub fn track_message(&self, message: ChatMessage) -> String {
        let run_id = message.run_id.clone().unwrap_or_else(new_run_id);

        if self.gate_open() {
            self.emit(&run_id, &message);
        } else {
            debug!("Buffering thread message until an evaluation binding is set");
            self.pending.lock().unwrap().push(BufferedMessage {
                run_id: run_id.clone(),
                message,
            });
        }

        run_id
    }

    /// Attach an evaluation binding to this thread.
    ///
    /// Opens the emission gate for subsequent messages and retroactively emits
    /// every message buffered so far, exactly once, in its original order.
    pub fn set_evaluation(&self, evaluation_id: impl Into<String>) {
        *self.evaluation_id.lock().unwrap() = Some(evaluation_id.into());

        let buffered: Vec<BufferedMessage> = std::mem::take(&mut *self.pending.lock().unwrap());
        for entry in buffered {
            self.emit(&entry.run_id, &entry.message);
        }
    }

    fn gate_open(&self) -> bool {
        !self.client.config().only_send_evals || self.effective_evaluation().is_some()
    }

    // thread binding wins over the ambient one
    fn effective_evaluation(&self) -> Option<String> {
        self.evaluation_id
            .lock()
            .unwrap()
            .clone()
            .or_else(context::current_evaluation_id)
            .filter(|s| !s.is_empty())
    }

    fn emit(&self, run_id: &str, message: &ChatMessage) {
        self.client.track_event(
            EventType::Chat,
            EventName::Chat,
            EventFields {
                run_id: Some(run_id.to_string()),
                parent_run_id: Some(self.id.clone()),
                evaluation_id: self.effective_evaluation(),
                message: Some(message_payload(message)),
                ..Default::default()
            },
        );
    }
}

fn message_payload(message: &ChatMessage) -> Value {
    let mut payload = serde_json::json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(metadata) = &message.metadata {
        payload["metadata"] = metadata.clone();
    }
    payload
}
