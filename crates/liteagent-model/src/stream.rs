// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only streaming text primitives.
//!
//! An [`AtomicString`] is shared between one producer (a provider adapter)
//! and any number of consumers (the agent loop, renderers, session
//! observers).  It is an immutable-snapshot log with a version counter:
//! consumers hold a cursor and are woken through a `tokio::sync::watch`
//! channel, so a late subscriber's first observation is a full replay of
//! everything accumulated so far.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

/// Returned when `append` or `set` is called after `complete`.
/// Mutating a completed accumulator is a programming error in the producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("accumulator already completed")]
pub struct StreamClosed;

#[derive(Debug)]
struct State {
    value: String,
    version: u64,
    complete: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    changed: watch::Sender<()>,
}

/// A scoped, append-only text accumulator with multi-consumer replay.
#[derive(Debug, Clone)]
pub struct AtomicString {
    shared: Arc<Shared>,
}

impl Default for AtomicString {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicString {
    pub fn new() -> Self {
        Self::with_initial("")
    }

    pub fn with_initial(initial: impl Into<String>) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value: initial.into(),
                    version: 0,
                    complete: false,
                }),
                changed,
            }),
        }
    }

    /// An accumulator that is already complete.  Used when seeding history
    /// with pre-materialized assistant text.
    pub fn completed(value: impl Into<String>) -> Self {
        let s = Self::with_initial(value);
        s.complete();
        s
    }

    /// Append a delta.  Wakes all waiters.
    pub fn append(&self, delta: &str) -> Result<(), StreamClosed> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.complete {
                return Err(StreamClosed);
            }
            st.value.push_str(delta);
            st.version += 1;
        }
        self.shared.changed.send_replace(());
        Ok(())
    }

    /// Replace the accumulated value.  Used when a provider delivers
    /// cumulative snapshots rather than deltas.
    pub fn set(&self, full: impl Into<String>) -> Result<(), StreamClosed> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.complete {
                return Err(StreamClosed);
            }
            st.value = full.into();
            st.version += 1;
        }
        self.shared.changed.send_replace(());
        Ok(())
    }

    /// Current snapshot, non-blocking.
    pub fn get(&self) -> String {
        self.shared.state.lock().unwrap().value.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().unwrap().complete
    }

    /// Mark as finished and wake all waiters.  Idempotent: calling it twice
    /// is a no-op for the second call.
    pub fn complete(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.complete {
                return;
            }
            st.complete = true;
        }
        self.shared.changed.send_replace(());
    }

    /// Block until the accumulator is completed, then return the final value.
    pub async fn await_complete(&self) -> String {
        let mut rx = self.shared.changed.subscribe();
        loop {
            {
                let st = self.shared.state.lock().unwrap();
                if st.complete {
                    return st.value.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.get();
            }
        }
    }

    /// A private-cursor snapshot stream.
    ///
    /// Yields the current snapshot on subscribe (a full replay of everything
    /// so far), then a new snapshot after every mutation, and terminates once
    /// the accumulator is complete.  Concurrent consumers do not interfere.
    pub fn snapshots(&self) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        struct Cursor {
            shared: Arc<Shared>,
            rx: watch::Receiver<()>,
            seen: Option<u64>,
        }
        let cursor = Cursor {
            rx: self.shared.changed.subscribe(),
            shared: Arc::clone(&self.shared),
            seen: None,
        };
        Box::pin(futures::stream::unfold(cursor, |mut cur| async move {
            loop {
                let (value, version, complete) = {
                    let st = cur.shared.state.lock().unwrap();
                    (st.value.clone(), st.version, st.complete)
                };
                if cur.seen != Some(version) {
                    cur.seen = Some(version);
                    return Some((value, cur));
                }
                if complete {
                    return None;
                }
                if cur.rx.changed().await.is_err() {
                    return None;
                }
            }
        }))
    }
}

/// A streamed assistant text reply: a unique stream id plus the character
/// accumulator shared with every consumer.
#[derive(Debug, Clone)]
pub struct TextStream {
    pub stream_id: String,
    text: AtomicString,
}

impl Default for TextStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TextStream {
    pub fn new() -> Self {
        Self::with_initial("")
    }

    pub fn with_initial(initial: impl Into<String>) -> Self {
        Self {
            stream_id: Uuid::new_v4().to_string(),
            text: AtomicString::with_initial(initial),
        }
    }

    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            stream_id: Uuid::new_v4().to_string(),
            text: AtomicString::completed(text),
        }
    }

    pub fn append(&self, delta: &str) -> Result<(), StreamClosed> {
        self.text.append(delta)
    }

    pub fn set(&self, full: impl Into<String>) -> Result<(), StreamClosed> {
        self.text.set(full)
    }

    pub fn get(&self) -> String {
        self.text.get()
    }

    pub fn is_complete(&self) -> bool {
        self.text.is_complete()
    }

    pub fn complete(&self) {
        self.text.complete()
    }

    pub async fn await_complete(&self) -> String {
        self.text.await_complete().await
    }

    pub fn snapshots(&self) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        self.text.snapshots()
    }
}

/// A streamed tool invocation: the tool name is known as soon as the stream
/// is yielded; the raw JSON argument text accumulates token by token.
/// Completion signals that the argument text is now parsable.
#[derive(Debug, Clone)]
pub struct ToolUseStream {
    pub tool_use_id: String,
    pub name: String,
    arguments: AtomicString,
}

impl ToolUseStream {
    pub fn new(tool_use_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_initial(tool_use_id, name, "")
    }

    pub fn with_initial(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            arguments: AtomicString::with_initial(arguments),
        }
    }

    pub fn append_arguments(&self, delta: &str) -> Result<(), StreamClosed> {
        self.arguments.append(delta)
    }

    pub fn set_arguments(&self, full: impl Into<String>) -> Result<(), StreamClosed> {
        self.arguments.set(full)
    }

    pub fn arguments_snapshot(&self) -> String {
        self.arguments.get()
    }

    pub fn is_complete(&self) -> bool {
        self.arguments.is_complete()
    }

    pub fn complete(&self) {
        self.arguments.complete()
    }

    pub async fn await_complete(&self) -> String {
        self.arguments.await_complete().await
    }

    /// Wait for completion and parse the accumulated argument text.
    pub async fn await_json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.arguments.await_complete().await)
    }

    pub fn snapshots(&self) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        self.arguments.snapshots()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
