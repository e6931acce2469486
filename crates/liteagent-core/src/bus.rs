// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-local typed publish/subscribe with at-most-once delivery.
//!
//! `emit` deduplicates by `(kind, event.id())` through a bounded LRU set,
//! then enqueues; a single dispatcher task drains the queue and invokes
//! matching handlers in registration order.  A handler returning
//! `Ok(false)` unregisters itself; a handler error is logged and does not
//! stop later handlers.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use lru::LruCache;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::events::{Event, EventKind};

const DEDUP_CAPACITY: usize = 1000;

type Handler = Box<dyn FnMut(Event) -> BoxFuture<'static, anyhow::Result<bool>> + Send>;

struct Subscriber {
    filter: Option<EventKind>,
    handler: Handler,
}

struct BusInner {
    tx: mpsc::UnboundedSender<Event>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    seen: StdMutex<LruCache<(EventKind, String), ()>>,
    pending: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus and start its dispatcher task.  Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(AtomicUsize::new(0));

        {
            let subscribers = Arc::clone(&subscribers);
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let mut subs = subscribers.lock().await;
                    let mut i = 0;
                    while i < subs.len() {
                        let matches = subs[i]
                            .filter
                            .map_or(true, |kind| kind == event.kind());
                        if !matches {
                            i += 1;
                            continue;
                        }
                        match (subs[i].handler)(event.clone()).await {
                            Ok(true) => i += 1,
                            Ok(false) => {
                                subs.remove(i);
                            }
                            Err(e) => {
                                warn!(error = %e, "event handler failed");
                                i += 1;
                            }
                        }
                    }
                    drop(subs);
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            });
        }

        Self {
            inner: Arc::new(BusInner {
                tx,
                subscribers,
                seen: StdMutex::new(LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).unwrap())),
                pending,
            }),
        }
    }

    /// The process-wide bus.  First use must happen inside a runtime.
    pub fn global() -> EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new).clone()
    }

    /// Enqueue an event.  Returns false when it was deduplicated away.
    pub fn emit(&self, event: Event) -> bool {
        let key = (event.kind(), event.id());
        {
            let mut seen = self.inner.seen.lock().unwrap();
            if seen.contains(&key) {
                return false;
            }
            seen.put(key, ());
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.send(event).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Register a handler for one event kind.  Return `Ok(false)` from the
    /// handler to unregister it.
    pub async fn on<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.register(Some(kind), handler).await;
    }

    /// Register a handler for every event.
    pub async fn on_any<F, Fut>(&self, handler: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.register(None, handler).await;
    }

    async fn register<F, Fut>(&self, filter: Option<EventKind>, mut handler: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |event| Box::pin(handler(event)));
        self.inner
            .subscribers
            .lock()
            .await
            .push(Subscriber { filter, handler });
    }

    /// Channel-backed subscription.  The forwarding handler unregisters
    /// itself when the receiver is dropped.
    pub async fn subscribe(&self, kind: Option<EventKind>) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(kind, move |event| {
            let alive = tx.send(event).is_ok();
            async move { Ok(alive) }
        })
        .await;
        rx
    }

    /// Wait until every emitted event has been dispatched.
    pub async fn flush(&self) {
        while self.inner.pending.load(Ordering::Acquire) != 0 {
            tokio::task::yield_now().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::events::EventPayload;

    fn cancelled(loop_id: &str) -> Event {
        Event::new("tester", loop_id, EventPayload::LoopCancelled)
    }

    fn complete(stream_id: &str, text: &str) -> Event {
        Event::new(
            "tester",
            "loop",
            EventPayload::AssistantMessageComplete {
                stream_id: stream_id.into(),
                text: text.into(),
            },
        )
    }

    #[tokio::test]
    async fn handlers_receive_matching_events() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.on(EventKind::LoopCancelled, move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await;
        }
        bus.emit(cancelled("l1"));
        bus.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_events_are_delivered_at_most_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.on_any(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await;
        }
        assert!(bus.emit(complete("s1", "x")));
        assert!(!bus.emit(complete("s1", "x")));
        bus.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_id_different_kind_is_not_a_duplicate() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(None).await;
        let partial = Event::new(
            "tester",
            "loop",
            EventPayload::AssistantMessagePartial {
                stream_id: "s1".into(),
                snapshot: "x".into(),
                seq: 0,
            },
        );
        // Same underlying stream, but one partial and one complete.
        assert!(bus.emit(partial));
        assert!(bus.emit(complete("s1#0", "x")));
        bus.flush().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn handler_returning_false_is_unregistered() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.on(EventKind::LoopCancelled, move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await;
        }
        bus.emit(cancelled("l1"));
        bus.emit(cancelled("l2"));
        bus.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1, "handler must auto-unregister");
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on_any(|_| async { Err(anyhow::anyhow!("boom")) }).await;
        {
            let hits = Arc::clone(&hits);
            bus.on_any(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await;
        }
        bus.emit(cancelled("l1"));
        bus.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_are_delivered_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(None).await;
        for i in 0..5 {
            bus.emit(complete(&format!("s{i}"), "x"));
        }
        bus.flush().await;
        let mut seen = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seen.push(e.id());
        }
        assert_eq!(seen, vec!["s0", "s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters_on_next_event() {
        let bus = EventBus::new();
        let rx = bus.subscribe(None).await;
        drop(rx);
        bus.emit(cancelled("l1"));
        bus.flush().await;
        assert!(bus.inner.subscribers.lock().await.is_empty());
    }
}
