//! The event queue and batched transport.
//!
//! An ordered, append-only buffer of pending events plus the logic that drains
//! it: enqueue assigns monotonic timestamps and picks a flush policy (immediate
//! past the chunk threshold, debounced otherwise), flush snapshots the queue
//! and removes exactly that prefix after a confirmed send, and at most one
//! delivery attempt is ever in flight. A failed send leaves the queue intact;
//! the next enqueue or manual flush retries from the same point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::event::{now_ms, Event};
use crate::transport::IngestionTransport;

/// Queue length beyond which a flush fires immediately
pub const CHUNK_THRESHOLD: usize = 10;

/// Quiet period after the last enqueue before a debounced flush fires
pub const DEBOUNCE: Duration = Duration::from_millis(500);

const DRAIN_POLL: Duration = Duration::from_millis(10);

struct QueueState {
    events: Vec<Event>,
    last_timestamp: i64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sending: AtomicBool,
    // bumped on every enqueue; a debounce timer only fires if it is still
    // the latest one when it wakes
    debounce_epoch: AtomicU64,
    transport: Arc<dyn IngestionTransport>,
    chunk_threshold: usize,
    debounce: Duration,
}

/// Order-preserving buffer of pending events plus its transport
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    /// Create a queue with the default flush policy
    pub fn new(transport: Arc<dyn IngestionTransport>) -> Self {
        Self::with_policy(transport, CHUNK_THRESHOLD, DEBOUNCE)
    }

    /// Create a queue with a custom chunk threshold and debounce window
    pub fn with_policy(
        transport: Arc<dyn IngestionTransport>,
        chunk_threshold: usize,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    events: Vec::new(),
                    last_timestamp: 0,
                }),
                sending: AtomicBool::new(false),
                debounce_epoch: AtomicU64::new(0),
                transport,
                chunk_threshold,
                debounce,
            }),
        }
    }

    /// Append an event and schedule a flush.
    ///
    /// The event's timestamp is replaced with one that is strictly greater
    /// than every timestamp already queued, so the collector observes queue
    /// order even on coarse clocks.
    pub fn enqueue(&self, mut event: Event) {
        let len = {
            let mut state = self.inner.state.lock().unwrap();
            let now = now_ms();
            let timestamp = if now > state.last_timestamp {
                now
            } else {
                state.last_timestamp + 1
            };
            state.last_timestamp = timestamp;
            event.timestamp = timestamp;
            state.events.push(event);
            state.events.len()
        };

        if len > self.inner.chunk_threshold {
            self.spawn_flush();
        } else {
            self.schedule_debounced_flush();
        }
    }

    /// Drain the queue to the collector.
    ///
    /// No-op when a send is already in flight or the queue is empty. Only the
    /// snapshot taken at send start is removed on success, never events that
    /// arrived during the round trip; those trigger an immediate follow-up
    /// send. On failure the queue is left untouched.
    pub async fn flush(&self) {
        if self.inner.sending.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let batch: Vec<Event> = {
                let state = self.inner.state.lock().unwrap();
                state.events.clone()
            };
            if batch.is_empty() {
                break;
            }

            match self.inner.transport.send_batch(&batch).await {
                Ok(()) => {
                    let mut state = self.inner.state.lock().unwrap();
                    state.events.drain(..batch.len());
                    debug!("Flushed {} event(s)", batch.len());
                }
                Err(err) => {
                    warn!("Failed to send events, keeping them queued: {}", err);
                    break;
                }
            }
        }

        self.inner.sending.store(false, Ordering::SeqCst);
    }

    /// Shutdown helper: wait out an in-flight send, bounded by `max_wait`,
    /// or flush once if nothing is in flight.
    pub async fn drain(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;

        if self.inner.sending.load(Ordering::SeqCst) {
            while self.inner.sending.load(Ordering::SeqCst) {
                if tokio::time::Instant::now() >= deadline {
                    warn!("Timed out waiting for in-flight send during drain");
                    return;
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }
            return;
        }

        self.flush().await;
    }

    /// Number of events waiting to be confirmed sent
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().events.len()
    }

    /// Whether the queue holds no pending events
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_flush(&self) {
        let Ok(handle) = Handle::try_current() else {
            debug!("No async runtime, events stay queued until an explicit flush");
            return;
        };
        let queue = self.clone();
        handle.spawn(async move {
            queue.flush().await;
        });
    }

    fn schedule_debounced_flush(&self) {
        let epoch = self.inner.debounce_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(handle) = Handle::try_current() else {
            debug!("No async runtime, events stay queued until an explicit flush");
            return;
        };
        let queue = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(queue.inner.debounce).await;
            if queue.inner.debounce_epoch.load(Ordering::SeqCst) == epoch {
                queue.flush().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFields, EventName, EventType};
    use crate::transport::testing::CapturingTransport;

    fn event(name: &str) -> Event {
        Event::from_fields(
            EventType::Log,
            EventName::Info,
            EventFields {
                name: Some(name.to_string()),
                ..Default::default()
            },
            "avido-rs",
        )
    }

    fn quiet_queue(transport: Arc<CapturingTransport>) -> EventQueue {
        // threshold high enough that nothing flushes on its own
        EventQueue::with_policy(transport, 1000, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_fifo_order_and_strictly_increasing_timestamps() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = quiet_queue(Arc::clone(&transport));

        for i in 0..50 {
            queue.enqueue(event(&format!("e{}", i)));
        }
        queue.flush().await;

        let sent = transport.events();
        assert_eq!(sent.len(), 50);
        let mut prev = 0;
        for (i, e) in sent.iter().enumerate() {
            assert_eq!(e.name.as_deref(), Some(format!("e{}", i).as_str()));
            assert!(e.timestamp > prev, "timestamps must be strictly increasing");
            prev = e.timestamp;
        }
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_noop() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = quiet_queue(Arc::clone(&transport));

        queue.flush().await;

        assert_eq!(transport.call_count(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_flush_sends_once() {
        let transport = Arc::new(CapturingTransport::new());
        transport.set_delay(Duration::from_millis(50));
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("only"));

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // in flight: this must return immediately without a second send
        queue.flush().await;
        assert_eq!(transport.call_count(), 1);

        first.await.unwrap();
        assert_eq!(transport.batch_count(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_events_arriving_mid_send_survive_and_follow_up() {
        let transport = Arc::new(CapturingTransport::new());
        transport.set_delay(Duration::from_millis(50));
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("first"));

        let flushing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // arrives while the first batch is on the wire
        queue.enqueue(event("second"));
        flushing.await.unwrap();

        let batches = transport.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].name.as_deref(), Some("first"));
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].name.as_deref(), Some("second"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_queue_untouched() {
        let transport = Arc::new(CapturingTransport::new());
        transport.set_fail(true);
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("a"));
        queue.enqueue(event("b"));
        queue.flush().await;

        assert_eq!(queue.len(), 2);
        assert_eq!(transport.batch_count(), 0);

        // next trigger retries from the same point, nothing lost or duplicated
        transport.set_fail(false);
        queue.flush().await;

        let sent = transport.events();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].name.as_deref(), Some("a"));
        assert_eq!(sent[1].name.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_threshold_triggers_immediate_flush() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = EventQueue::with_policy(transport.clone(), 3, Duration::from_secs(3600));

        for i in 0..4 {
            queue.enqueue(event(&format!("e{}", i)));
        }

        // the spawned flush needs a moment to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.events().len(), 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_debounce_flushes_after_quiet_period() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = EventQueue::with_policy(transport.clone(), 100, Duration::from_millis(30));

        queue.enqueue(event("a"));
        queue.enqueue(event("b"));
        assert_eq!(transport.call_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let sent = transport.events();
        assert_eq!(sent.len(), 2);
        // both arrived within the quiet period, so one batch
        assert_eq!(transport.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_each_enqueue_resets_the_debounce_timer() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = EventQueue::with_policy(transport.clone(), 100, Duration::from_millis(60));

        for i in 0..3 {
            queue.enqueue(event(&format!("e{}", i)));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // 40ms elapsed since the last enqueue, under the 60ms window
        assert_eq!(transport.call_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.events().len(), 3);
    }

    #[tokio::test]
    async fn test_drain_flushes_when_idle() {
        let transport = Arc::new(CapturingTransport::new());
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("pending"));
        queue.drain(Duration::from_millis(200)).await;

        assert_eq!(transport.events().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_send() {
        let transport = Arc::new(CapturingTransport::new());
        transport.set_delay(Duration::from_millis(40));
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("slow"));
        let flushing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.drain(Duration::from_millis(500)).await;
        flushing.await.unwrap();

        assert_eq!(transport.events().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_bounded_wait() {
        let transport = Arc::new(CapturingTransport::new());
        transport.set_delay(Duration::from_millis(300));
        let queue = quiet_queue(Arc::clone(&transport));

        queue.enqueue(event("very-slow"));
        let flushing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        queue.drain(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(250));

        flushing.await.unwrap();
    }
}
