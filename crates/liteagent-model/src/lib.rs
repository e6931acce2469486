// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message model, streaming primitives, and provider adapters.

mod anthropic;
mod assembler;
mod google;
pub mod history;
mod message;
mod mock;
mod ollama;
mod openai;
mod provider;
mod stream;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use message::{
    AssistantContent, AssistantMessage, ExecutionError, Image, LoopId, Message, Retry, Role,
    SystemMessage, ToolMessage, ToolResult, ToolUse, UserContent, UserMessage, UserPart,
};
pub use mock::{ScriptStep, ScriptedProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use provider::{
    CompletionRequest, CompletionStream, Provider, ProviderConfig, ResponseFormat, ToolSchema,
};
pub use stream::{AtomicString, StreamClosed, TextStream, ToolUseStream};
