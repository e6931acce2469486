// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::guardrail::Violation;

/// Framework-domain failures.  These propagate to the caller; tool-domain
/// failures never appear here — they are reified as `ExecutionError` tool
/// messages the model can see and react to.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Network/protocol failure in the provider.  Fatal to the current loop.
    #[error("provider transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// The model requested a tool that is not in the registry.  Fatal: a
    /// silent mismatch would desynchronize the message history.
    #[error("model requested unknown tool '{name}'")]
    UnknownTool { name: String },

    /// No content was provided to the agent.
    #[error("no content provided to the agent")]
    EmptyInput,

    /// A guardrail rejected the input or output.
    #[error(transparent)]
    Violation(#[from] Violation),

    /// The caller dropped its handle; the loop cleaned up and stopped.
    #[error("agent loop cancelled")]
    Cancelled,

    /// `respond_as` was declared but the provider produced no typed value.
    #[error("model produced no structured output")]
    MissingStructuredOutput,
}
