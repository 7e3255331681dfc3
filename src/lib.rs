pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod queue;
pub mod stream;
pub mod thread;
pub mod transport;
pub mod wrap;

pub use client::Avido;
pub use config::AvidoConfig;
pub use error::{AvidoError, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::client::Avido;
    pub use crate::config::AvidoConfig;
    pub use crate::error::{AvidoError, Result};
    pub use crate::event::{EventFields, EventName, EventType, TokensUsage};
    pub use crate::stream::StreamWrapOptions;
    pub use crate::thread::{ChatMessage, MessageRole, Thread, ThreadOptions};
    pub use crate::transport::WebhookHeaders;
    pub use crate::wrap::WrapOptions;
}
