//! The Avido client.
//!
//! [`Avido`] is the handle everything else hangs off: it owns the config, the
//! event queue and the HTTP transport, and exposes the tracking surface
//! (`track_event`, the wrappers, threads, flush/drain, webhook validation).
//! The handle is cheap to clone and share across tasks.
//!
//! A client missing its app id or API key never fails the host application:
//! it logs one warning and turns every tracking operation into a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AvidoConfig;
use crate::context;
use crate::error::{AvidoError, Result};
use crate::event::{ErrorDetail, Event, EventFields, EventName, EventType};
use crate::queue::EventQueue;
use crate::stream::{StreamWrapOptions, WrappedStream};
use crate::thread::{Thread, ThreadOptions};
use crate::transport::{HttpTransport, IngestionTransport, WebhookHeaders};
use crate::wrap::{WrapOptions, Wrapped};

struct ClientInner {
    config: AvidoConfig,
    queue: Option<EventQueue>,
    transport: Option<Arc<HttpTransport>>,
    warned_disabled: AtomicBool,
}

/// Handle to the Avido SDK
#[derive(Clone)]
pub struct Avido {
    inner: Arc<ClientInner>,
}

impl Avido {
    /// Create a client from an explicit config.
    ///
    /// An incomplete config (missing app id or API key) produces a client
    /// whose tracking operations are silent no-ops.
    pub fn new(config: AvidoConfig) -> Self {
        let (queue, transport) = if config.is_complete() {
            match HttpTransport::new(&config) {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    let queue =
                        EventQueue::new(Arc::clone(&transport) as Arc<dyn IngestionTransport>);
                    (Some(queue), Some(transport))
                }
                Err(err) => {
                    warn!("Avido transport unavailable, tracking disabled: {}", err);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Self {
            inner: Arc::new(ClientInner {
                config,
                queue,
                transport,
                warned_disabled: AtomicBool::new(false),
            }),
        }
    }

    /// Create a client configured from the environment.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use avido::prelude::*;
    ///
    /// let avido = Avido::from_env();
    /// let search = avido.wrap_tool(
    ///     |q: Query| async move { run_search(q).await },
    ///     WrapOptions::new().name("search"),
    /// );
    /// let results = search.call(query).await?;
    /// ```
    pub fn from_env() -> Self {
        Self::new(AvidoConfig::from_env())
    }

    /// Create a client with a custom ingestion transport.
    ///
    /// Mainly useful for tests and in-process fakes; webhook validation is
    /// unavailable on such a client.
    pub fn with_transport(config: AvidoConfig, transport: Arc<dyn IngestionTransport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                queue: Some(EventQueue::new(transport)),
                transport: None,
                config,
                warned_disabled: AtomicBool::new(false),
            }),
        }
    }

    /// The resolved configuration
    pub fn config(&self) -> &AvidoConfig {
        &self.inner.config
    }

    /// Number of events buffered and not yet confirmed sent
    pub fn pending_events(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, EventQueue::len)
    }

    /// Record a telemetry event.
    ///
    /// Fills the ambient parent run id, user identity and evaluation binding
    /// for any of `fields` left unset, applies the `only_send_evals` gate, and
    /// enqueues the event for batched delivery.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Kind of run the event belongs to
    /// * `event` - Lifecycle verb (start, end, error, ...)
    /// * `fields` - Partial event record; unset correlation fields are
    ///   resolved from the ambient context
    pub fn track_event(&self, event_type: EventType, event: EventName, mut fields: EventFields) {
        let Some(queue) = &self.inner.queue else {
            self.warn_disabled_once();
            return;
        };

        if fields.parent_run_id.is_none() {
            fields.parent_run_id = context::current_run_id();
        }
        if fields.user_id.is_none() {
            fields.user_id = context::current_user_id();
        }
        if fields.evaluation_id.is_none() {
            fields.evaluation_id = context::current_evaluation_id();
        }

        if self.inner.config.only_send_evals
            && fields.evaluation_id.as_deref().map_or(true, str::is_empty)
        {
            debug!("Dropping event: only_send_evals is on and no evaluation binding is in scope");
            return;
        }

        queue.enqueue(Event::from_fields(
            event_type,
            event,
            fields,
            self.inner.config.runtime.clone(),
        ));
    }

    /// Record an application error as a `log` event
    pub fn error(&self, message: impl Into<String>, err: &dyn std::fmt::Display) {
        self.track_event(
            EventType::Log,
            EventName::Error,
            EventFields {
                message: Some(Value::String(message.into())),
                error: Some(ErrorDetail::from_display(err)),
                ..Default::default()
            },
        );
    }

    /// Wrap an async tool function for tracing
    pub fn wrap_tool<F, Args, Out>(
        &self,
        f: F,
        options: WrapOptions<Args, Out>,
    ) -> Wrapped<F, Args, Out> {
        Wrapped::new(self.clone(), EventType::Tool, f, options)
    }

    /// Wrap an async model-call function for tracing
    pub fn wrap_model<F, Args, Out>(
        &self,
        f: F,
        options: WrapOptions<Args, Out>,
    ) -> Wrapped<F, Args, Out> {
        Wrapped::new(self.clone(), EventType::Llm, f, options)
    }

    /// Wrap an async function returning a stream of tool output
    pub fn wrap_tool_stream<F, Args, Item>(
        &self,
        f: F,
        options: StreamWrapOptions<Args, Item>,
    ) -> WrappedStream<F, Args, Item> {
        WrappedStream::new(self.clone(), EventType::Tool, f, options)
    }

    /// Wrap an async function returning a model's token stream
    pub fn wrap_model_stream<F, Args, Item>(
        &self,
        f: F,
        options: StreamWrapOptions<Args, Item>,
    ) -> WrappedStream<F, Args, Item> {
        WrappedStream::new(self.clone(), EventType::Llm, f, options)
    }

    /// Open a conversation thread
    pub fn open_thread(&self, options: ThreadOptions) -> Thread {
        Thread::new(self.clone(), options)
    }

    /// Send whatever is queued to the collector
    pub async fn flush(&self) {
        if let Some(queue) = &self.inner.queue {
            queue.flush().await;
        }
    }

    /// Shutdown helper: deliver or wait out pending events, bounded by `max_wait`
    pub async fn drain(&self, max_wait: Duration) {
        if let Some(queue) = &self.inner.queue {
            queue.drain(max_wait).await;
        }
    }

    /// Check a webhook delivery's authenticity with the collector
    pub async fn validate_webhook(
        &self,
        payload: &Value,
        headers: &WebhookHeaders,
    ) -> Result<bool> {
        let Some(transport) = &self.inner.transport else {
            return Err(AvidoError::ConfigError(
                "webhook validation requires a configured HTTP client".to_string(),
            ));
        };
        transport.validate_webhook(payload, headers).await
    }

    fn warn_disabled_once(&self) {
        if !self.inner.warned_disabled.swap(true, Ordering::SeqCst) {
            warn!("Avido is not configured (missing app id or API key); tracking is a no-op");
        }
    }
}
