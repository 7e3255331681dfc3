//! Traced call wrappers.
//!
//! [`Wrapped`] turns an arbitrary async function into a traced invocation:
//! calling it yields a [`PendingCall`], an explicit deferred value that starts
//! executing on first await. Before that the caller can chain
//! [`PendingCall::set_parent`] to override ambient parenting and
//! [`PendingCall::identify`] to attach a user identity. Execution allocates a
//! run id, emits a `start` event, runs the function inside a context scope so
//! nested traced calls parent to it automatically, then emits `end` or `error`.
//! Tracing is transparent: the function's own result or error always reaches
//! the caller unchanged.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::client::Avido;
use crate::context;
use crate::event::{new_run_id, ErrorDetail, EventFields, EventName, EventType, TokensUsage};

pub(crate) type ArgParser<Args, T> = Arc<dyn Fn(&Args) -> T + Send + Sync>;
pub(crate) type OutParser<Out, T> = Arc<dyn Fn(&Out) -> T + Send + Sync>;

type BoxRun<T, E> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send>> + Send>;

/// Options controlling how a wrapped call is reported.
///
/// Each `*_parser` derives its value from the call's arguments (or result, for
/// the output side), overriding the static option. Without an `input_parser`
/// the args value itself is serialized as the input, which covers most calls;
/// anything fancier wants an explicit parser.
pub struct WrapOptions<Args, Out> {
    pub(crate) name: Option<String>,
    pub(crate) track: bool,
    pub(crate) name_parser: Option<ArgParser<Args, String>>,
    pub(crate) input_parser: Option<ArgParser<Args, Value>>,
    pub(crate) params_parser: Option<ArgParser<Args, Value>>,
    pub(crate) metadata_parser: Option<ArgParser<Args, Value>>,
    pub(crate) user_id_parser: Option<ArgParser<Args, String>>,
    pub(crate) evaluation_id_parser: Option<ArgParser<Args, String>>,
    pub(crate) output_parser: Option<OutParser<Out, Value>>,
    pub(crate) tokens_usage_parser: Option<OutParser<Out, Option<TokensUsage>>>,
}

impl<Args, Out> Default for WrapOptions<Args, Out> {
    fn default() -> Self {
        Self {
            name: None,
            track: true,
            name_parser: None,
            input_parser: None,
            params_parser: None,
            metadata_parser: None,
            user_id_parser: None,
            evaluation_id_parser: None,
            output_parser: None,
            tokens_usage_parser: None,
        }
    }
}

impl<Args, Out> Clone for WrapOptions<Args, Out> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            track: self.track,
            name_parser: self.name_parser.clone(),
            input_parser: self.input_parser.clone(),
            params_parser: self.params_parser.clone(),
            metadata_parser: self.metadata_parser.clone(),
            user_id_parser: self.user_id_parser.clone(),
            evaluation_id_parser: self.evaluation_id_parser.clone(),
            output_parser: self.output_parser.clone(),
            tokens_usage_parser: self.tokens_usage_parser.clone(),
        }
    }
}

impl<Args, Out> WrapOptions<Args, Out> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static name for the traced call
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Run the function without emitting any events.
    ///
    /// The call still executes inside its own context scope, so nested traced
    /// calls keep correct parentage.
    pub fn untracked(mut self) -> Self {
        self.track = false;
        self
    }

    pub fn name_parser(mut self, f: impl Fn(&Args) -> String + Send + Sync + 'static) -> Self {
        self.name_parser = Some(Arc::new(f));
        self
    }

    pub fn input_parser(mut self, f: impl Fn(&Args) -> Value + Send + Sync + 'static) -> Self {
        self.input_parser = Some(Arc::new(f));
        self
    }

    pub fn params_parser(mut self, f: impl Fn(&Args) -> Value + Send + Sync + 'static) -> Self {
        self.params_parser = Some(Arc::new(f));
        self
    }

    pub fn metadata_parser(mut self, f: impl Fn(&Args) -> Value + Send + Sync + 'static) -> Self {
        self.metadata_parser = Some(Arc::new(f));
        self
    }

    pub fn user_id_parser(mut self, f: impl Fn(&Args) -> String + Send + Sync + 'static) -> Self {
        self.user_id_parser = Some(Arc::new(f));
        self
    }

    pub fn evaluation_id_parser(
        mut self,
        f: impl Fn(&Args) -> String + Send + Sync + 'static,
    ) -> Self {
        self.evaluation_id_parser = Some(Arc::new(f));
        self
    }

    pub fn output_parser(mut self, f: impl Fn(&Out) -> Value + Send + Sync + 'static) -> Self {
        self.output_parser = Some(Arc::new(f));
        self
    }

    pub fn tokens_usage_parser(
        mut self,
        f: impl Fn(&Out) -> Option<TokensUsage> + Send + Sync + 'static,
    ) -> Self {
        self.tokens_usage_parser = Some(Arc::new(f));
        self
    }
}

/// A function wrapped for tracing. Cheap to clone and share.
pub struct Wrapped<F, Args, Out> {
    client: Avido,
    event_type: EventType,
    f: Arc<F>,
    options: WrapOptions<Args, Out>,
}

impl<F, Args, Out> Clone for Wrapped<F, Args, Out> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            event_type: self.event_type,
            f: Arc::clone(&self.f),
            options: self.options.clone(),
        }
    }
}

impl<F, Args, Out> Wrapped<F, Args, Out> {
    pub(crate) fn new(
        client: Avido,
        event_type: EventType,
        f: F,
        options: WrapOptions<Args, Out>,
    ) -> Self {
        Self {
            client,
            event_type,
            f: Arc::new(f),
            options,
        }
    }

    /// Prepare a traced invocation.
    ///
    /// Nothing executes until the returned [`PendingCall`] is awaited.
    pub fn call<Fut, E>(&self, args: Args) -> PendingCall<Out, E>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<Out, E>> + Send + 'static,
        Out: Send + 'static,
        E: Send + 'static,
    {
        let options = &self.options;
        let name = options
            .name_parser
            .as_ref()
            .map(|p| p(&args))
            .or_else(|| options.name.clone());
        let input = options
            .input_parser
            .as_ref()
            .map(|p| p(&args))
            .or_else(|| serde_json::to_value(&args).ok());
        let params = options.params_parser.as_ref().map(|p| p(&args));
        let metadata = options.metadata_parser.as_ref().map(|p| p(&args));
        let user_id = options.user_id_parser.as_ref().map(|p| p(&args));
        let evaluation_id = options.evaluation_id_parser.as_ref().map(|p| p(&args));

        let f = Arc::clone(&self.f);
        let run: BoxRun<Out, E> = Box::new(move || {
            let fut: Pin<Box<dyn Future<Output = std::result::Result<Out, E>> + Send>> =
                Box::pin((*f)(args));
            fut
        });

        PendingCall {
            client: self.client.clone(),
            event_type: self.event_type,
            track: options.track,
            name,
            input,
            params,
            metadata,
            user_id,
            user_props: None,
            evaluation_id,
            parent_run_id: None,
            run,
            output_parser: options.output_parser.clone(),
            tokens_usage_parser: options.tokens_usage_parser.clone(),
        }
    }
}

/// A traced invocation that has not started yet.
///
/// Awaiting it triggers execution and resolves to the wrapped function's own
/// result, errors included.
pub struct PendingCall<T, E> {
    client: Avido,
    event_type: EventType,
    track: bool,
    name: Option<String>,
    input: Option<Value>,
    params: Option<Value>,
    metadata: Option<Value>,
    user_id: Option<String>,
    user_props: Option<Value>,
    evaluation_id: Option<String>,
    parent_run_id: Option<String>,
    run: BoxRun<T, E>,
    output_parser: Option<OutParser<T, Value>>,
    tokens_usage_parser: Option<OutParser<T, Option<TokensUsage>>>,
}

impl<T, E> PendingCall<T, E> {
    /// Override the parent link for this call and everything nested under it,
    /// superseding the ambient context.
    pub fn set_parent(mut self, run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(run_id.into());
        self
    }

    /// Attach a user identity to this call's events.
    pub fn identify(mut self, user_id: impl Into<String>, user_props: Option<Value>) -> Self {
        self.user_id = Some(user_id.into());
        self.user_props = user_props;
        self
    }

    async fn execute(self) -> std::result::Result<T, E>
    where
        T: Serialize,
        E: std::fmt::Display,
    {
        let PendingCall {
            client,
            event_type,
            track,
            name,
            input,
            params,
            metadata,
            user_id,
            user_props,
            evaluation_id,
            parent_run_id,
            run,
            output_parser,
            tokens_usage_parser,
        } = self;

        let run_id = new_run_id();
        let parent_run_id = parent_run_id.or_else(context::current_run_id);

        if track {
            client.track_event(
                event_type,
                EventName::Start,
                EventFields {
                    run_id: Some(run_id.clone()),
                    parent_run_id: parent_run_id.clone(),
                    name: name.clone(),
                    input,
                    params,
                    metadata,
                    user_id: user_id.clone(),
                    user_props: user_props.clone(),
                    evaluation_id: evaluation_id.clone(),
                    ..Default::default()
                },
            );
        }

        let result = context::scope_run_id(run_id.clone(), run()).await;

        if track {
            match &result {
                Ok(value) => {
                    let output = output_parser
                        .as_ref()
                        .map(|p| p(value))
                        .or_else(|| serde_json::to_value(value).ok());
                    let tokens_usage = tokens_usage_parser.as_ref().and_then(|p| p(value));
                    client.track_event(
                        event_type,
                        EventName::End,
                        EventFields {
                            run_id: Some(run_id),
                            parent_run_id,
                            name,
                            output,
                            tokens_usage,
                            user_id,
                            user_props,
                            evaluation_id,
                            ..Default::default()
                        },
                    );
                }
                Err(err) => {
                    client.track_event(
                        event_type,
                        EventName::Error,
                        EventFields {
                            run_id: Some(run_id),
                            parent_run_id,
                            name,
                            error: Some(ErrorDetail::from_display(err)),
                            user_id,
                            user_props,
                            evaluation_id,
                            ..Default::default()
                        },
                    );
                    // the error may terminate the process before a debounced
                    // flush would fire
                    client.flush().await;
                }
            }
        }

        result
    }
}

impl<T, E> IntoFuture for PendingCall<T, E>
where
    T: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Output = std::result::Result<T, E>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AvidoConfig;
    use crate::transport::testing::CapturingTransport;
    use serde::Serialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize)]
    struct SearchQuery {
        term: String,
    }

    fn test_client() -> (Avido, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::new());
        let config = AvidoConfig::new("app-test", "sk-test").with_only_send_evals(false);
        let client = Avido::with_transport(config, Arc::clone(&transport) as _);
        (client, transport)
    }

    #[tokio::test]
    async fn test_tool_call_emits_start_then_end() {
        let (client, transport) = test_client();
        let search = client.wrap_tool(
            |q: SearchQuery| async move { Ok::<_, String>(vec![format!("result for {}", q.term)]) },
            WrapOptions::new().name("search"),
        );

        let results = search
            .call(SearchQuery {
                term: "cats".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(results, vec!["result for cats".to_string()]);

        client.flush().await;
        let events = transport.events();
        assert_eq!(events.len(), 2);

        let start = &events[0];
        assert_eq!(start.event_type, EventType::Tool);
        assert_eq!(start.event, EventName::Start);
        assert_eq!(start.name.as_deref(), Some("search"));
        assert_eq!(start.input, Some(json!({"term": "cats"})));
        assert!(start.parent_run_id.is_none());

        let end = &events[1];
        assert_eq!(end.event, EventName::End);
        assert_eq!(end.run_id, start.run_id);
        assert_eq!(end.output, Some(json!(["result for cats"])));
        assert!(end.timestamp > start.timestamp);
    }

    #[tokio::test]
    async fn test_nested_call_inherits_parent() {
        let (client, transport) = test_client();

        let inner = client.wrap_tool(
            |n: u32| async move { Ok::<_, String>(n * 2) },
            WrapOptions::new().name("double"),
        );
        let inner_for_outer = inner.clone();
        let outer = client.wrap_model(
            move |n: u32| {
                let inner = inner_for_outer.clone();
                async move {
                    let doubled = inner.call(n).await?;
                    Ok::<_, String>(doubled + 1)
                }
            },
            WrapOptions::new().name("compute"),
        );

        let result = outer.call(20).await.unwrap();
        assert_eq!(result, 41);

        client.flush().await;
        let events = transport.events();
        assert_eq!(events.len(), 4);

        let outer_start = &events[0];
        let inner_start = &events[1];
        let inner_end = &events[2];
        let outer_end = &events[3];

        assert_eq!(outer_start.name.as_deref(), Some("compute"));
        assert!(outer_start.parent_run_id.is_none());
        assert_eq!(inner_start.name.as_deref(), Some("double"));
        assert_eq!(inner_start.parent_run_id.as_deref(), Some(outer_start.run_id.as_str()));
        assert_eq!(inner_end.run_id, inner_start.run_id);
        assert_eq!(outer_end.run_id, outer_start.run_id);
    }

    #[tokio::test]
    async fn test_interleaved_chains_keep_their_parents() {
        let (client, transport) = test_client();

        let inner = client.wrap_tool(
            |label: String| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, String>(label)
            },
            WrapOptions::new().name("leaf"),
        );
        let inner_a = inner.clone();
        let chained = client.wrap_model(
            move |label: String| {
                let inner = inner_a.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    inner.call(label).await
                }
            },
            WrapOptions::new().name("chain"),
        );
        let solo = client.wrap_tool(
            |label: String| async move {
                tokio::time::sleep(Duration::from_millis(4)).await;
                Ok::<_, String>(label)
            },
            WrapOptions::new().name("solo"),
        );

        let (a, b) = tokio::join!(chained.call("a".to_string()), solo.call("b".to_string()));
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");

        client.flush().await;
        let events = transport.events();

        let chain_start = events
            .iter()
            .find(|e| e.name.as_deref() == Some("chain") && e.event == EventName::Start)
            .unwrap();
        let leaf_start = events
            .iter()
            .find(|e| e.name.as_deref() == Some("leaf") && e.event == EventName::Start)
            .unwrap();
        let solo_start = events
            .iter()
            .find(|e| e.name.as_deref() == Some("solo") && e.event == EventName::Start)
            .unwrap();

        // the leaf ran while the solo chain was interleaved on the same
        // runtime, but it still parents to its own chain
        assert_eq!(leaf_start.parent_run_id.as_deref(), Some(chain_start.run_id.as_str()));
        assert!(solo_start.parent_run_id.is_none());
    }

    #[tokio::test]
    async fn test_set_parent_overrides_ambient() {
        let (client, transport) = test_client();
        let tool = client.wrap_tool(
            |n: u32| async move { Ok::<_, String>(n) },
            WrapOptions::new().name("tool"),
        );

        context::scope_run_id("ambient-run".to_string(), async {
            tool.call(1).set_parent("explicit-run").await.unwrap();
        })
        .await;

        client.flush().await;
        let start = transport.events().into_iter().find(|e| e.event == EventName::Start).unwrap();
        assert_eq!(start.parent_run_id.as_deref(), Some("explicit-run"));
    }

    #[tokio::test]
    async fn test_error_is_recorded_and_rethrown() {
        let (client, transport) = test_client();
        let failing = client.wrap_tool(
            |_: u32| async move { Err::<u32, String>("boom".to_string()) },
            WrapOptions::new().name("failing"),
        );

        let result = failing.call(7).await;
        assert_eq!(result.unwrap_err(), "boom");

        // the error path flushes immediately, no manual flush needed
        let events = transport.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventName::Start);
        assert_eq!(events[1].event, EventName::Error);
        assert_eq!(events[1].run_id, events[0].run_id);
        assert_eq!(events[1].error.as_ref().unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_untracked_call_emits_nothing_but_still_scopes() {
        let (client, transport) = test_client();

        let inner = client.wrap_tool(
            |n: u32| async move { Ok::<_, String>(n) },
            WrapOptions::new().name("visible"),
        );
        let inner_clone = inner.clone();
        let outer = client.wrap_tool(
            move |n: u32| {
                let inner = inner_clone.clone();
                async move { inner.call(n).await }
            },
            WrapOptions::<u32, u32>::new().untracked(),
        );

        outer.call(5).await.unwrap();
        client.flush().await;

        let events = transport.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.name.as_deref() == Some("visible")));
        // the untracked call still established a scope, so the inner call has
        // a parent even though no event carries that run id
        assert!(events[0].parent_run_id.is_some());
    }

    #[tokio::test]
    async fn test_parsers_override_defaults() {
        let (client, transport) = test_client();
        let model = client.wrap_model(
            |prompt: String| async move { Ok::<_, String>(format!("echo: {}", prompt)) },
            WrapOptions::new()
                .name_parser(|prompt: &String| format!("model-{}", prompt.len()))
                .input_parser(|prompt: &String| json!({"messages": [prompt]}))
                .output_parser(|out: &String| json!({"content": out}))
                .tokens_usage_parser(|out: &String| {
                    Some(TokensUsage {
                        prompt: 1,
                        completion: out.len() as u32,
                    })
                }),
        );

        model.call("hi".to_string()).await.unwrap();
        client.flush().await;

        let events = transport.events();
        let start = &events[0];
        let end = &events[1];
        assert_eq!(start.event_type, EventType::Llm);
        assert_eq!(start.name.as_deref(), Some("model-2"));
        assert_eq!(start.input, Some(json!({"messages": ["hi"]})));
        assert_eq!(end.output, Some(json!({"content": "echo: hi"})));
        assert_eq!(
            end.tokens_usage,
            Some(TokensUsage {
                prompt: 1,
                completion: 8
            })
        );
    }

    #[tokio::test]
    async fn test_identify_attaches_user() {
        let (client, transport) = test_client();
        let tool = client.wrap_tool(
            |n: u32| async move { Ok::<_, String>(n) },
            WrapOptions::new().name("tool"),
        );

        tool.call(1)
            .identify("user-42", Some(json!({"plan": "pro"})))
            .await
            .unwrap();
        client.flush().await;

        let events = transport.events();
        assert!(events
            .iter()
            .all(|e| e.user_id.as_deref() == Some("user-42")));
        assert_eq!(events[0].user_props, Some(json!({"plan": "pro"})));
    }
}
