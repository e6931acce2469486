// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The event taxonomy observable on the bus.
//!
//! Every event carries the emitting agent's name, a timestamp, and the
//! `loop_id` it belongs to.  Sub-agent dispatch events carry the *child*
//! loop's id (the dispatching tool-use id) so a UI can render the nested
//! conversation under its own thread.

use chrono::{DateTime, Utc};
use serde_json::Value;

use liteagent_model::{ExecutionError, ToolResult, ToolUse, UserContent};

#[derive(Debug, Clone)]
pub struct Event {
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    /// An agent was invoked with the given (user-authored) message ids.
    AgentCall { message_ids: Vec<String> },
    SystemMessage {
        message_id: String,
        content: String,
    },
    UserMessage {
        message_id: String,
        content: UserContent,
    },
    /// A text snapshot of an in-flight assistant reply.
    AssistantMessagePartial {
        stream_id: String,
        snapshot: String,
        seq: u64,
    },
    AssistantMessageComplete {
        stream_id: String,
        text: String,
    },
    /// An argument snapshot of an in-flight tool request.
    ToolRequestPartial {
        tool_use_id: String,
        tool_name: String,
        arguments_snapshot: String,
        seq: u64,
    },
    ToolRequestComplete { tool_use: ToolUse },
    ToolExecutionStart { tool_use: ToolUse },
    ToolExecutionComplete {
        tool_use_id: String,
        tool_name: String,
        arguments: Value,
        result: Value,
    },
    ToolExecutionError {
        tool_use_id: String,
        tool_name: String,
        error: ExecutionError,
    },
    /// An argument snapshot of an in-flight sub-agent dispatch.  The event's
    /// `loop_id` is the dispatch's tool-use id.
    TeamDispatchPartial {
        tool_use_id: String,
        target_agent: String,
        arguments_snapshot: String,
        seq: u64,
    },
    TeamDispatchComplete {
        tool_use_id: String,
        target_agent: String,
        arguments: Value,
    },
    TeamDispatchFinished {
        tool_use_id: String,
        target_agent: String,
        result: ToolResult,
    },
    /// Terminal event for a cancelled loop.
    LoopCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentCall,
    SystemMessage,
    UserMessage,
    AssistantMessagePartial,
    AssistantMessageComplete,
    ToolRequestPartial,
    ToolRequestComplete,
    ToolExecutionStart,
    ToolExecutionComplete,
    ToolExecutionError,
    TeamDispatchPartial,
    TeamDispatchComplete,
    TeamDispatchFinished,
    LoopCancelled,
}

impl Event {
    pub fn new(agent: impl Into<String>, loop_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            agent: agent.into(),
            timestamp: Utc::now(),
            loop_id: loop_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::AgentCall { .. } => EventKind::AgentCall,
            EventPayload::SystemMessage { .. } => EventKind::SystemMessage,
            EventPayload::UserMessage { .. } => EventKind::UserMessage,
            EventPayload::AssistantMessagePartial { .. } => EventKind::AssistantMessagePartial,
            EventPayload::AssistantMessageComplete { .. } => EventKind::AssistantMessageComplete,
            EventPayload::ToolRequestPartial { .. } => EventKind::ToolRequestPartial,
            EventPayload::ToolRequestComplete { .. } => EventKind::ToolRequestComplete,
            EventPayload::ToolExecutionStart { .. } => EventKind::ToolExecutionStart,
            EventPayload::ToolExecutionComplete { .. } => EventKind::ToolExecutionComplete,
            EventPayload::ToolExecutionError { .. } => EventKind::ToolExecutionError,
            EventPayload::TeamDispatchPartial { .. } => EventKind::TeamDispatchPartial,
            EventPayload::TeamDispatchComplete { .. } => EventKind::TeamDispatchComplete,
            EventPayload::TeamDispatchFinished { .. } => EventKind::TeamDispatchFinished,
            EventPayload::LoopCancelled => EventKind::LoopCancelled,
        }
    }

    /// The stable identity used by the bus for `(kind, id)` dedup.  Partial
    /// events fold their sequence number in so successive snapshots are
    /// distinct; everything else keys on the underlying message or tool-use
    /// identity, so the same logical transition emitted twice is dropped.
    pub fn id(&self) -> String {
        match &self.payload {
            EventPayload::AgentCall { message_ids } => message_ids.join(","),
            EventPayload::SystemMessage { message_id, .. } => message_id.clone(),
            EventPayload::UserMessage { message_id, .. } => message_id.clone(),
            EventPayload::AssistantMessagePartial { stream_id, seq, .. } => {
                format!("{stream_id}#{seq}")
            }
            EventPayload::AssistantMessageComplete { stream_id, .. } => stream_id.clone(),
            EventPayload::ToolRequestPartial {
                tool_use_id, seq, ..
            } => format!("{tool_use_id}#{seq}"),
            EventPayload::ToolRequestComplete { tool_use } => tool_use.tool_use_id.clone(),
            EventPayload::ToolExecutionStart { tool_use } => tool_use.tool_use_id.clone(),
            EventPayload::ToolExecutionComplete { tool_use_id, .. } => tool_use_id.clone(),
            EventPayload::ToolExecutionError { tool_use_id, .. } => tool_use_id.clone(),
            EventPayload::TeamDispatchPartial {
                tool_use_id, seq, ..
            } => format!("{tool_use_id}#{seq}"),
            EventPayload::TeamDispatchComplete { tool_use_id, .. } => tool_use_id.clone(),
            EventPayload::TeamDispatchFinished { tool_use_id, .. } => tool_use_id.clone(),
            EventPayload::LoopCancelled => self.loop_id.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_payload() {
        let e = Event::new("a", "loop", EventPayload::LoopCancelled);
        assert_eq!(e.kind(), EventKind::LoopCancelled);
    }

    #[test]
    fn partial_event_ids_are_sequence_distinct() {
        let mk = |seq| {
            Event::new(
                "a",
                "loop",
                EventPayload::AssistantMessagePartial {
                    stream_id: "s1".into(),
                    snapshot: "x".into(),
                    seq,
                },
            )
        };
        assert_ne!(mk(0).id(), mk(1).id());
    }

    #[test]
    fn complete_event_id_is_the_stream_id() {
        let e = Event::new(
            "a",
            "loop",
            EventPayload::AssistantMessageComplete {
                stream_id: "s1".into(),
                text: "done".into(),
            },
        );
        assert_eq!(e.id(), "s1");
    }
}
