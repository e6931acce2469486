// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stateful conversation wrapper.
//!
//! A session owns an append-only buffer of the conversation so far.  Each
//! call synthesizes user messages the way the agent would, replays the full
//! buffer through the agent, and appends every streamed non-system message
//! as it passes.  Assistant text is coalesced per `stream_id`: one logical
//! reply is one `TextStream`-bearing message, which the provider adapters
//! materialize when the buffer is replayed.

use std::sync::{Arc, Mutex};

use futures::StreamExt;

use liteagent_model::{AssistantContent, Message, Role};

use crate::{
    agent::{Agent, AgentInput, MessageStream},
    error::AgentError,
};

pub struct Session {
    agent: Agent,
    conversation: Arc<Mutex<Vec<Message>>>,
}

impl Session {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            conversation: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Snapshot of the buffer.
    pub fn conversation(&self) -> Vec<Message> {
        self.conversation.lock().unwrap().clone()
    }

    /// Clear the buffer back to the agent's initial state.
    pub fn reset(&self) {
        self.conversation.lock().unwrap().clear();
    }

    /// Append the synthesized user messages, run the agent over the full
    /// buffer, and stream the results while tracking them into the buffer.
    pub async fn send(&self, input: impl Into<AgentInput>) -> Result<MessageStream, AgentError> {
        let user_messages = self.agent.build_user_messages(input.into())?;
        let history = {
            let mut conversation = self.conversation.lock().unwrap();
            conversation.extend(user_messages);
            conversation.clone()
        };

        let stream = self
            .agent
            .stream_with_loop(AgentInput::Messages(history), None)
            .await?;

        let conversation = Arc::clone(&self.conversation);
        let tracked = stream.inspect(move |item| {
            if let Ok(message) = item {
                if should_track(message) {
                    conversation.lock().unwrap().push(message.clone());
                }
            }
        });
        Ok(Box::pin(tracked))
    }
}

/// System messages are re-synthesized on every loop, and tool-use chunk
/// messages are superseded by their terminal `ToolUse` form; neither belongs
/// in the buffer.
fn should_track(message: &Message) -> bool {
    if message.role() == Role::System {
        return false;
    }
    !matches!(
        message,
        Message::Assistant(a) if matches!(a.content, AssistantContent::ToolUseStream(_))
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
