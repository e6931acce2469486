// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared stream assembly for all provider adapters.
//!
//! Adapters translate their wire protocol into [`Chunk`]s; the assembler
//! turns chunks into the message sequence the provider contract promises:
//! one `TextStream`-bearing message per logical reply, one
//! `ToolUseStream`-bearing message per tool call followed by a terminal
//! parsed `ToolUse`, and a single structured value when `respond_as` was
//! declared.  Open accumulators are completed on every exit path, including
//! transport errors and consumer drops.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::{
    provider::{CompletionStream, ResponseFormat},
    AssistantContent, AssistantMessage, TextStream, ToolUse, ToolUseStream,
};

/// One wire-level observation, normalized across protocols.
#[derive(Debug, Clone)]
pub(crate) enum Chunk {
    /// A text token (delta representation).
    TextDelta(String),
    /// A tool-call argument delta, keyed by the provider's parallel-call
    /// index.  `id` and `name` are only populated on the first delta for
    /// most protocols.
    ToolDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// A cumulative tool-call argument snapshot (providers that re-send the
    /// full argument text on every update).
    ToolSnapshot {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// A tool call that arrived fully formed in a single chunk.
    ToolComplete {
        id: String,
        name: String,
        arguments: Value,
    },
    /// The model signalled stop.
    Done,
}

/// The consumer dropped the message stream; the producing task should stop.
#[derive(Debug)]
pub(crate) struct Closed;

pub(crate) struct Assembler {
    tx: mpsc::Sender<anyhow::Result<AssistantMessage>>,
    respond_as: Option<ResponseFormat>,
    text: Option<TextStream>,
    /// Buffered text when assembling a structured value (no streaming text
    /// is delivered in that mode).
    structured_buf: String,
    pending: HashMap<u32, ToolUseStream>,
    finished: bool,
}

impl Assembler {
    pub(crate) fn new(
        tx: mpsc::Sender<anyhow::Result<AssistantMessage>>,
        respond_as: Option<ResponseFormat>,
    ) -> Self {
        Self {
            tx,
            respond_as,
            text: None,
            structured_buf: String::new(),
            pending: HashMap::new(),
            finished: false,
        }
    }

    async fn send(&self, content: AssistantContent) -> Result<(), Closed> {
        let msg = AssistantMessage {
            content,
            loop_id: None,
        };
        self.tx.send(Ok(msg)).await.map_err(|_| Closed)
    }

    pub(crate) async fn handle(&mut self, chunk: Chunk) -> Result<(), Closed> {
        match chunk {
            Chunk::TextDelta(delta) if delta.is_empty() => Ok(()),
            Chunk::TextDelta(delta) => {
                if self.respond_as.is_some() {
                    self.structured_buf.push_str(&delta);
                    return Ok(());
                }
                match &self.text {
                    Some(ts) => {
                        let _ = ts.append(&delta);
                        Ok(())
                    }
                    None => {
                        let ts = TextStream::with_initial(delta);
                        self.text = Some(ts.clone());
                        self.send(AssistantContent::Text(ts)).await
                    }
                }
            }
            Chunk::ToolDelta {
                index,
                id,
                name,
                arguments,
            } => self.tool_update(index, id, name, arguments, false).await,
            Chunk::ToolSnapshot {
                index,
                id,
                name,
                arguments,
            } => self.tool_update(index, id, name, arguments, true).await,
            Chunk::ToolComplete {
                id,
                name,
                arguments,
            } => {
                self.close_text();
                let id = ensure_id(id, &name);
                let stream =
                    ToolUseStream::with_initial(id.clone(), name.clone(), arguments.to_string());
                stream.complete();
                self.send(AssistantContent::ToolUseStream(stream)).await?;
                self.send(AssistantContent::ToolUse(ToolUse {
                    tool_use_id: id,
                    name,
                    arguments,
                }))
                .await
            }
            Chunk::Done => self.finish().await,
        }
    }

    async fn tool_update(
        &mut self,
        index: u32,
        id: String,
        name: String,
        arguments: String,
        snapshot: bool,
    ) -> Result<(), Closed> {
        // Text that preceded a tool call is a finished reply.
        self.close_text();
        if let Some(stream) = self.pending.get(&index) {
            let res = if snapshot {
                stream.set_arguments(arguments)
            } else {
                stream.append_arguments(&arguments)
            };
            if res.is_err() {
                warn!(tool = %stream.name, "argument delta after completion; dropped");
            }
            return Ok(());
        }
        let stream = ToolUseStream::with_initial(ensure_id(id, &name), name, arguments);
        self.pending.insert(index, stream.clone());
        self.send(AssistantContent::ToolUseStream(stream)).await
    }

    fn close_text(&mut self) {
        if let Some(ts) = self.text.take() {
            ts.complete();
        }
    }

    /// Normal end of stream: complete all accumulators and emit the terminal
    /// forms (parsed `ToolUse`s, the structured value).  Idempotent.
    pub(crate) async fn finish(&mut self) -> Result<(), Closed> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.close_text();

        let mut pending: Vec<(u32, ToolUseStream)> = self.pending.drain().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        // Complete every accumulator before emitting anything, so a dropped
        // consumer cannot leave later streams dangling.
        for (_, stream) in &pending {
            stream.complete();
        }
        for (_, stream) in pending {
            if stream.name.is_empty() {
                warn!(tool_use_id = %stream.tool_use_id, "tool call without a name; dropped");
                continue;
            }
            let raw = stream.arguments_snapshot();
            let arguments = if raw.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(&raw) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(tool = %stream.name, error = %e, "unparsable tool arguments; substituting {{}}");
                        json!({})
                    }
                }
            };
            self.send(AssistantContent::ToolUse(ToolUse {
                tool_use_id: stream.tool_use_id.clone(),
                name: stream.name.clone(),
                arguments,
            }))
            .await?;
        }

        if let Some(format) = self.respond_as.take() {
            let raw = self.structured_buf.trim();
            match serde_json::from_str::<Value>(raw) {
                Ok(v) => self.send(AssistantContent::Structured(v)).await?,
                Err(e) => {
                    let _ = self
                        .tx
                        .send(Err(anyhow::anyhow!(
                            "model output is not valid JSON for '{}': {e}",
                            format.name
                        )))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Abnormal exit: complete any open accumulators without emitting
    /// terminal forms.  Idempotent with `finish`.
    pub(crate) fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.close_text();
        for (_, stream) in self.pending.drain() {
            stream.complete();
        }
    }
}

fn ensure_id(id: String, name: &str) -> String {
    if id.is_empty() {
        let synthetic = Uuid::new_v4().to_string();
        warn!(tool = %name, "tool call without an id; generated {synthetic}");
        synthetic
    } else {
        id
    }
}

/// Run an HTTP byte stream through a line-oriented parser and the assembler,
/// as a detached task feeding a bounded channel.
///
/// SSE / NDJSON events can be split across TCP packets, so a carry-over
/// buffer holds the trailing incomplete line between chunks.
pub(crate) fn spawn_driver<F>(
    resp: reqwest::Response,
    respond_as: Option<ResponseFormat>,
    context: &'static str,
    parse_line: F,
) -> CompletionStream
where
    F: Fn(&str) -> Vec<Chunk> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<anyhow::Result<AssistantMessage>>(64);
    let mut assembler = Assembler::new(tx.clone(), respond_as);
    let mut bytes = resp.bytes_stream();

    tokio::spawn(async move {
        let mut buf = String::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(b) => {
                    buf.push_str(&String::from_utf8_lossy(&b));
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        for ev in parse_line(&line) {
                            if assembler.handle(ev).await.is_err() {
                                // Consumer dropped; stop reading.
                                assembler.abort();
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(anyhow::anyhow!(e).context(context))).await;
                    assembler.abort();
                    return;
                }
            }
        }
        // A well-behaved server already sent its end-of-stream marker;
        // finishing here is a no-op in that case.
        let _ = assembler.finish().await;
    });

    Box::pin(ReceiverStream::new(rx))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
