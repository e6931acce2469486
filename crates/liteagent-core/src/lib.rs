// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent execution loop: streaming message pipeline, tool and
//! sub-agent dispatch, session state, guardrail interception, and the
//! event bus tying them together.

mod agent;
mod bus;
mod dispatch;
mod error;
mod events;
mod guardrail;
mod prompts;
mod session;
#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentBuilder, AgentInput, AgentOutput, MessageStream, Parameter};
pub use bus::EventBus;
pub use dispatch::AgentDispatchTool;
pub use error::AgentError;
pub use events::{Event, EventKind, EventPayload};
pub use guardrail::{Guardrail, GuardrailContext, Violation};
pub use prompts::{render_system_prompt, render_user_template, DEFAULT_SYSTEM_PROMPT};
pub use session::Session;
