// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-scripted provider for tests.
//!
//! Each `completion` call pops the next script from the queue and replays it
//! through the same stream-assembly code the real adapters use, so tests
//! exercise exact event sequences — including streamed tool calls — without
//! network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    assembler::{Assembler, Chunk},
    provider::{CompletionRequest, CompletionStream},
    Provider,
};

/// One scripted observation from the "model".
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// A streamed text token.
    TextDelta(String),
    /// A streamed tool-call argument fragment.  Steps sharing an `id` extend
    /// the same call.
    ToolDelta {
        id: String,
        name: String,
        arguments: String,
    },
    /// A tool call delivered fully formed in one step.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
}

pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<ScriptStep>>>,
    calls: AtomicUsize,
    /// The last `CompletionRequest` seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// step sequence replayed for that call.
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicUsize::new(0),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// A provider that always answers with a single streamed text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        // Split so consumers observe more than one delta.
        let mid = reply.len() / 2;
        let (head, tail) = reply.split_at(mid);
        Self::new(vec![vec![
            ScriptStep::TextDelta(head.to_string()),
            ScriptStep::TextDelta(tail.to_string()),
        ]])
    }

    /// A provider that requests one tool call, then answers with text once
    /// the result is in history.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![ScriptStep::ToolDelta {
                id: tool_id.into(),
                name: tool_name.into(),
                arguments: args_json.into(),
            }],
            vec![ScriptStep::TextDelta(final_text.into())],
        ])
    }

    /// Number of `completion` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());

        let steps = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![ScriptStep::TextDelta("[no more scripts]".into())]
            } else {
                scripts.remove(0)
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let respond_as = req.respond_as.clone();
        tokio::spawn(async move {
            let mut assembler = Assembler::new(tx, respond_as);
            let mut indices: HashMap<String, u32> = HashMap::new();
            for step in steps {
                let chunk = match step {
                    ScriptStep::TextDelta(t) => Chunk::TextDelta(t),
                    ScriptStep::ToolDelta {
                        id,
                        name,
                        arguments,
                    } => {
                        let next = indices.len() as u32;
                        let index = *indices.entry(id.clone()).or_insert(next);
                        Chunk::ToolDelta {
                            index,
                            id,
                            name,
                            arguments,
                        }
                    }
                    ScriptStep::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Chunk::ToolComplete {
                        id,
                        name,
                        arguments,
                    },
                };
                if assembler.handle(chunk).await.is_err() {
                    assembler.abort();
                    return;
                }
                // Let consumers observe intermediate snapshots.
                tokio::task::yield_now().await;
            }
            let _ = assembler.finish().await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
