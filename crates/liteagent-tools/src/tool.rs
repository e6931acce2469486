// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use liteagent_model::ExecutionError;

use crate::schema::prepare_schema;

pub const DEFAULT_EMOJI: &str = "🔧";

/// A single tool invocation requested by the model (or synthesized by the
/// loop, for eager tools).
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// The tool-use id; forwarded verbatim from the provider.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// A named, typed, callable unit.
///
/// Handler failures are returned as [`ExecutionError`] values; the agent
/// reifies them into history rather than re-raising them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Prepared JSON Schema of the argument object: `additionalProperties`
    /// is false, every property is required, no `default` keys.
    fn parameters_schema(&self) -> Value;

    /// Eager tools are invoked before the first provider call of every loop
    /// and their call/result pairs are injected into the seed messages.
    fn eager(&self) -> bool {
        false
    }

    fn emoji(&self) -> &str {
        DEFAULT_EMOJI
    }

    /// For sub-agent dispatchers: the name of the target agent.
    fn dispatch_target(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ExecutionError>;
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync>;

/// A closure-backed tool assembled through [`FunctionTool::builder`].
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    eager: bool,
    emoji: String,
    handler: Handler,
}

impl FunctionTool {
    pub fn builder<F, Fut>(name: impl Into<String>, handler: F) -> FunctionToolBuilder
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        FunctionToolBuilder {
            name: name.into(),
            description: None,
            schema: serde_json::json!({ "type": "object", "properties": {} }),
            eager: false,
            emoji: DEFAULT_EMOJI.to_string(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

pub struct FunctionToolBuilder {
    name: String,
    description: Option<String>,
    schema: Value,
    eager: bool,
    emoji: String,
    handler: Handler,
}

impl FunctionToolBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Raw JSON Schema of the argument object.  Preparation (strictness,
    /// required fields, default-stripping) happens in `build`.
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn emoji(mut self, emoji: impl Into<String>) -> Self {
        self.emoji = emoji.into();
        self
    }

    pub fn build(self) -> FunctionTool {
        let description = self
            .description
            .unwrap_or_else(|| format!("Tool {}", self.name));
        FunctionTool {
            schema: prepare_schema(self.schema),
            name: self.name,
            description,
            eager: self.eager,
            emoji: self.emoji,
            handler: self.handler,
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn eager(&self) -> bool {
        self.eager
    }

    fn emoji(&self) -> &str {
        &self.emoji
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ExecutionError> {
        (self.handler)(call.args.clone()).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
