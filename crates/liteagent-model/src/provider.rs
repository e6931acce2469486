// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::{AssistantMessage, Message};

/// The lazy message sequence returned by [`Provider::completion`].
///
/// Yields assistant messages only: one `TextStream`-bearing message per
/// logical reply, one `ToolUseStream`-bearing message per tool call followed
/// by its terminal parsed `ToolUse`, and a single `Structured` message when
/// `respond_as` was requested.  Transport failures surface as `Err` items and
/// are fatal to the consuming loop.
pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<AssistantMessage>> + Send>>;

/// A tool definition handed to the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// Prepared JSON Schema of the argument object.
    pub parameters: Value,
}

/// A structured-output type descriptor: a name plus the JSON Schema the model
/// must produce.
#[derive(Debug, Clone)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

/// One completion request: the conversation so far, the effective tool list,
/// and an optional structured-output declaration.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub respond_as: Option<ResponseFormat>,
}

/// Common adapter configuration.  `extra` is merged verbatim into the request
/// body so provider-specific parameters pass through without modelling.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub extra: serde_json::Map<String, Value>,
}

impl ProviderConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// The contract every provider adapter must satisfy.  Instances are shared
/// across agents and must be safe to call from concurrent loops.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider family name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the streaming response.
    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream>;
}
