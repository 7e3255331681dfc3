//! Stream forking and the streaming completion path.
//!
//! Streaming model calls return their tokens incrementally, so the wrapper
//! cannot wait for a final value before handing the result back. Instead the
//! stream is forked: the caller consumes one copy at their own pace while a
//! background task drains the other, aggregates it into the run's output, and
//! emits the `end` event once the stream is exhausted. Nothing the background
//! side does can disturb the caller's copy.

use std::collections::VecDeque;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::warn;

use crate::client::Avido;
use crate::context;
use crate::event::{new_run_id, ErrorDetail, EventFields, EventName, EventType, TokensUsage};
use crate::wrap::ArgParser;

struct Shared<S: Stream> {
    source: Option<S>,
    buffers: [VecDeque<S::Item>; 2],
    alive: [bool; 2],
    done: bool,
    wakers: [Option<Waker>; 2],
}

/// One side of a forked stream.
///
/// Both sides observe every element of the source exactly once, in order,
/// independent of each other's consumption speed. Dropping one side frees its
/// buffer and lets the other continue; dropping both releases the source.
pub struct Fork<S: Stream> {
    shared: Arc<Mutex<Shared<S>>>,
    side: usize,
}

/// Split a stream into two independently consumable copies.
pub fn fork<S>(source: S) -> (Fork<S>, Fork<S>)
where
    S: Stream + Unpin,
    S::Item: Clone,
{
    let shared = Arc::new(Mutex::new(Shared {
        source: Some(source),
        buffers: [VecDeque::new(), VecDeque::new()],
        alive: [true, true],
        done: false,
        wakers: [None, None],
    }));
    (
        Fork {
            shared: Arc::clone(&shared),
            side: 0,
        },
        Fork { shared, side: 1 },
    )
}

impl<S> Stream for Fork<S>
where
    S: Stream + Unpin,
    S::Item: Clone,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock().unwrap();

        if let Some(item) = shared.buffers[this.side].pop_front() {
            return Poll::Ready(Some(item));
        }
        if shared.done {
            return Poll::Ready(None);
        }

        let poll = {
            let Some(source) = shared.source.as_mut() else {
                return Poll::Ready(None);
            };
            Pin::new(source).poll_next(cx)
        };

        match poll {
            Poll::Ready(Some(item)) => {
                let other = 1 - this.side;
                if shared.alive[other] {
                    shared.buffers[other].push_back(item.clone());
                    if let Some(waker) = shared.wakers[other].take() {
                        waker.wake();
                    }
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                shared.done = true;
                shared.source = None;
                let other = 1 - this.side;
                if let Some(waker) = shared.wakers[other].take() {
                    waker.wake();
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                shared.wakers[this.side] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<S: Stream> Drop for Fork<S> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.alive[self.side] = false;
        shared.buffers[self.side].clear();
        let other = 1 - self.side;
        if !shared.alive[other] {
            shared.source = None;
        } else if let Some(waker) = shared.wakers[other].take() {
            // the source may hold this side's waker; nudge the survivor so it
            // re-polls and registers its own
            waker.wake();
        }
    }
}

impl<S: Stream> Unpin for Fork<S> {}

/// Options for a streaming wrapped call.
///
/// The argument-side parsers mirror [`crate::wrap::WrapOptions`]; the output
/// side works on the collected stream items instead of a single return value.
/// Without an `aggregate` closure the collected items are serialized as-is.
pub struct StreamWrapOptions<Args, Item> {
    pub(crate) name: Option<String>,
    pub(crate) track: bool,
    pub(crate) name_parser: Option<ArgParser<Args, String>>,
    pub(crate) input_parser: Option<ArgParser<Args, Value>>,
    pub(crate) params_parser: Option<ArgParser<Args, Value>>,
    pub(crate) metadata_parser: Option<ArgParser<Args, Value>>,
    pub(crate) aggregate: Option<Arc<dyn Fn(&[Item]) -> Value + Send + Sync>>,
    pub(crate) tokens_usage_parser: Option<Arc<dyn Fn(&[Item]) -> Option<TokensUsage> + Send + Sync>>,
}

impl<Args, Item> Default for StreamWrapOptions<Args, Item> {
    fn default() -> Self {
        Self {
            name: None,
            track: true,
            name_parser: None,
            input_parser: None,
            params_parser: None,
            metadata_parser: None,
            aggregate: None,
            tokens_usage_parser: None,
        }
    }
}

impl<Args, Item> Clone for StreamWrapOptions<Args, Item> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            track: self.track,
            name_parser: self.name_parser.clone(),
            input_parser: self.input_parser.clone(),
            params_parser: self.params_parser.clone(),
            metadata_parser: self.metadata_parser.clone(),
            aggregate: self.aggregate.clone(),
            tokens_usage_parser: self.tokens_usage_parser.clone(),
        }
    }
}

impl<Args, Item> StreamWrapOptions<Args, Item> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

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

    /// How to fold the collected stream items into the run's output,
    /// e.g. concatenating tokens or merging partial tool calls.
    pub fn aggregate(mut self, f: impl Fn(&[Item]) -> Value + Send + Sync + 'static) -> Self {
        self.aggregate = Some(Arc::new(f));
        self
    }

    pub fn tokens_usage_parser(
        mut self,
        f: impl Fn(&[Item]) -> Option<TokensUsage> + Send + Sync + 'static,
    ) -> Self {
        self.tokens_usage_parser = Some(Arc::new(f));
        self
    }
}

type BoxStreamRun<S, E> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = std::result::Result<S, E>> + Send>> + Send>;

/// A streaming function wrapped for tracing. Cheap to clone and share.
pub struct WrappedStream<F, Args, Item> {
    client: Avido,
    event_type: EventType,
    f: Arc<F>,
    options: StreamWrapOptions<Args, Item>,
}

impl<F, Args, Item> Clone for WrappedStream<F, Args, Item> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            event_type: self.event_type,
            f: Arc::clone(&self.f),
            options: self.options.clone(),
        }
    }
}

impl<F, Args, Item> WrappedStream<F, Args, Item> {
    pub(crate) fn new(
        client: Avido,
        event_type: EventType,
        f: F,
        options: StreamWrapOptions<Args, Item>,
    ) -> Self {
        Self {
            client,
            event_type,
            f: Arc::new(f),
            options,
        }
    }

    /// Prepare a traced streaming invocation.
    ///
    /// Awaiting the returned call yields a [`Fork`] of the function's stream;
    /// the other fork is drained in the background to record the run's end.
    pub fn call<Fut, S, E>(&self, args: Args) -> PendingStreamCall<S, E>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Args: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<S, E>> + Send + 'static,
        S: Stream<Item = Item> + Unpin + Send + 'static,
        Item: Clone + Serialize + Send + 'static,
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

        let f = Arc::clone(&self.f);
        let run: BoxStreamRun<S, E> = Box::new(move || {
            let fut: Pin<Box<dyn Future<Output = std::result::Result<S, E>> + Send>> =
                Box::pin((*f)(args));
            fut
        });

        PendingStreamCall {
            client: self.client.clone(),
            event_type: self.event_type,
            track: options.track,
            name,
            input,
            params,
            metadata,
            user_id: None,
            user_props: None,
            parent_run_id: None,
            run,
            aggregate: options.aggregate.clone(),
            tokens_usage_parser: options.tokens_usage_parser.clone(),
        }
    }
}

/// A traced streaming invocation that has not started yet.
pub struct PendingStreamCall<S: Stream, E> {
    client: Avido,
    event_type: EventType,
    track: bool,
    name: Option<String>,
    input: Option<Value>,
    params: Option<Value>,
    metadata: Option<Value>,
    user_id: Option<String>,
    user_props: Option<Value>,
    parent_run_id: Option<String>,
    run: BoxStreamRun<S, E>,
    aggregate: Option<Arc<dyn Fn(&[S::Item]) -> Value + Send + Sync>>,
    tokens_usage_parser: Option<Arc<dyn Fn(&[S::Item]) -> Option<TokensUsage> + Send + Sync>>,
}

impl<S: Stream, E> PendingStreamCall<S, E> {
    /// Override the parent link for this call and everything nested under it.
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

    async fn execute(self) -> std::result::Result<Fork<S>, E>
    where
        S: Stream + Unpin + Send + 'static,
        S::Item: Clone + Serialize + Send + 'static,
        E: std::fmt::Display,
    {
        let PendingStreamCall {
            client,
            event_type,
            track,
            name,
            input,
            params,
            metadata,
            user_id,
            user_props,
            parent_run_id,
            run,
            aggregate,
            tokens_usage_parser,
        } = self;

        let run_id = new_run_id();
        let parent_run_id = parent_run_id.or_else(context::current_run_id);
        // resolve the ambient identity now; the background task that records
        // the end event runs outside this call chain's scopes
        let user_id = user_id.or_else(context::current_user_id);
        let evaluation_id = context::current_evaluation_id();

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

        let stream = match context::scope_run_id(run_id.clone(), run()).await {
            Ok(stream) => stream,
            Err(err) => {
                if track {
                    client.track_event(
                        event_type,
                        EventName::Error,
                        EventFields {
                            run_id: Some(run_id),
                            parent_run_id,
                            name,
                            error: Some(ErrorDetail::from_display(&err)),
                            user_id,
                            user_props,
                            evaluation_id,
                            ..Default::default()
                        },
                    );
                    client.flush().await;
                }
                return Err(err);
            }
        };

        let (for_caller, for_aggregation) = fork(stream);

        if track {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let items: Vec<S::Item> = for_aggregation.collect().await;
                        let output = match &aggregate {
                            Some(f) => Some(f(&items)),
                            None => match serde_json::to_value(&items) {
                                Ok(value) => Some(value),
                                Err(err) => {
                                    warn!("Failed to aggregate streamed output: {}", err);
                                    None
                                }
                            },
                        };
                        let tokens_usage = tokens_usage_parser.as_ref().and_then(|p| p(&items));
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
                        // the stream may outlive the process's normal exit path
                        client.flush().await;
                    });
                }
                Err(_) => {
                    warn!("No async runtime; the streamed run's end event will not be recorded");
                }
            }
        }

        Ok(for_caller)
    }
}

impl<S, E> IntoFuture for PendingStreamCall<S, E>
where
    S: Stream + Unpin + Send + 'static,
    S::Item: Clone + Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Output = std::result::Result<Fork<S>, E>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}
