// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use liteagent_model::{
    AssistantContent, AssistantMessage, CompletionRequest, ExecutionError, Image, Message,
    Provider, ResponseFormat, Retry, TextStream, ToolMessage, ToolResult, ToolUse, ToolUseStream,
    UserContent,
};
use liteagent_tools::schema::{prepare_schema, validate_arguments};
use liteagent_tools::{Tool, ToolCall, ToolRegistry};

use crate::{
    bus::EventBus,
    dispatch::AgentDispatchTool,
    error::AgentError,
    events::{Event, EventPayload},
    guardrail::{Guardrail, GuardrailContext},
    prompts::{render_system_prompt, render_user_template, DEFAULT_SYSTEM_PROMPT},
};

/// The lazy message sequence delivered to the caller: everything the
/// provider yields for this loop, plus the tool messages appended between
/// provider calls.  Seed messages (system, user, eager pairs) are observable
/// on the event bus, not on this stream.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, AgentError>> + Send>>;

/// A declared agent parameter, used to bind keyword arguments into the
/// user-prompt template and to synthesize the dispatcher-tool schema.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub description: Option<String>,
    pub schema: Value,
}

/// The caller-facing input forms accepted by one invocation.
#[derive(Debug, Clone)]
pub enum AgentInput {
    Text(String),
    Image(Image),
    /// Pre-built messages (used by sessions replaying their buffer).
    Messages(Vec<Message>),
    /// Keyword arguments bound against the declared signature.
    Arguments(Map<String, Value>),
}

impl From<&str> for AgentInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AgentInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Image> for AgentInput {
    fn from(image: Image) -> Self {
        Self::Image(image)
    }
}

impl From<Vec<Message>> for AgentInput {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

impl From<Map<String, Value>> for AgentInput {
    fn from(args: Map<String, Value>) -> Self {
        Self::Arguments(args)
    }
}

/// The materialized result of a non-streaming invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Text(String),
    Structured(Value),
}

impl AgentOutput {
    /// Deserialize the output into a caller-declared type.
    pub fn parsed<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Self::Structured(v) => serde_json::from_value(v.clone()),
            Self::Text(t) => serde_json::from_str(t),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Structured(_) => None,
        }
    }
}

pub(crate) struct AgentInner {
    name: String,
    description: Option<String>,
    provider: Arc<dyn Provider>,
    system_template: String,
    /// The agent's own tools, kept separate from the registry so teammates
    /// can be rebound to another bus without losing them.
    tools: Vec<Arc<dyn Tool>>,
    team: Vec<Agent>,
    /// Own tools plus one dispatcher per teammate.
    registry: ToolRegistry,
    respond_as: Option<ResponseFormat>,
    user_prompt_template: Option<String>,
    parameters: Vec<Parameter>,
    input_guards: Vec<Arc<dyn Guardrail>>,
    output_guards: Vec<Arc<dyn Guardrail>>,
    bus: EventBus,
}

/// An LLM-driven agent: provider, tools, teammates, and the streaming loop
/// tying them together.  Cheap to clone; clones share the same assembly.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

pub struct AgentBuilder {
    name: String,
    provider: Arc<dyn Provider>,
    description: Option<String>,
    system_template: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    team: Vec<Agent>,
    respond_as: Option<ResponseFormat>,
    user_prompt_template: Option<String>,
    parameters: Vec<Parameter>,
    input_guards: Vec<Arc<dyn Guardrail>>,
    output_guards: Vec<Arc<dyn Guardrail>>,
    bus: Option<EventBus>,
}

impl Agent {
    pub fn builder(name: impl Into<String>, provider: Arc<dyn Provider>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            provider,
            description: None,
            system_template: None,
            tools: Vec::new(),
            team: Vec::new(),
            respond_as: None,
            user_prompt_template: None,
            parameters: Vec::new(),
            input_guards: Vec::new(),
            output_guards: Vec::new(),
            bus: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.inner.parameters
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn tool_by_name(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Rebind this agent (and its whole team, recursively) to another bus so
    /// nested dispatch events land where the parent's subscribers listen.
    pub fn with_bus(&self, bus: EventBus) -> Agent {
        let team: Vec<Agent> = self
            .inner
            .team
            .iter()
            .map(|t| t.with_bus(bus.clone()))
            .collect();
        let registry = build_registry(&self.inner.tools, &team);
        Agent {
            inner: Arc::new(AgentInner {
                name: self.inner.name.clone(),
                description: self.inner.description.clone(),
                provider: Arc::clone(&self.inner.provider),
                system_template: self.inner.system_template.clone(),
                tools: self.inner.tools.clone(),
                team,
                registry,
                respond_as: self.inner.respond_as.clone(),
                user_prompt_template: self.inner.user_prompt_template.clone(),
                parameters: self.inner.parameters.clone(),
                input_guards: self.inner.input_guards.clone(),
                output_guards: self.inner.output_guards.clone(),
                bus,
            }),
        }
    }

    // ── Invocation ────────────────────────────────────────────────────────────

    /// Run one loop and stream every resulting message to the caller.
    /// Output guardrails do not apply (buffering would defeat streaming).
    pub async fn stream(&self, input: impl Into<AgentInput>) -> Result<MessageStream, AgentError> {
        self.stream_with_loop(input.into(), None).await
    }

    /// Run one loop to completion and return the materialized result: the
    /// parsed typed value when `respond_as` was declared, the final text
    /// otherwise.
    pub async fn invoke(&self, input: impl Into<AgentInput>) -> Result<AgentOutput, AgentError> {
        self.invoke_with_loop(input.into(), None).await
    }

    pub(crate) async fn stream_with_loop(
        &self,
        input: AgentInput,
        loop_id: Option<String>,
    ) -> Result<MessageStream, AgentError> {
        let mut user_messages = self.build_user_messages(input)?;
        self.apply_input_guards(&mut user_messages).await?;
        Ok(self.spawn_loop(user_messages, loop_id))
    }

    pub(crate) async fn invoke_with_loop(
        &self,
        input: AgentInput,
        loop_id: Option<String>,
    ) -> Result<AgentOutput, AgentError> {
        let mut stream = self.stream_with_loop(input, loop_id).await?;

        let mut last_text: Option<TextStream> = None;
        let mut structured: Option<Value> = None;
        while let Some(item) = stream.next().await {
            if let Message::Assistant(a) = item? {
                match a.content {
                    AssistantContent::Text(ts) => last_text = Some(ts),
                    AssistantContent::Structured(v) => structured = Some(v),
                    _ => {}
                }
            }
        }

        if self.inner.respond_as.is_some() {
            return structured
                .map(AgentOutput::Structured)
                .ok_or(AgentError::MissingStructuredOutput);
        }

        let text = match last_text {
            Some(ts) => ts.await_complete().await,
            None => String::new(),
        };
        let text = self.apply_output_guards(text).await?;
        Ok(AgentOutput::Text(text))
    }

    // ── Input assembly ────────────────────────────────────────────────────────

    pub(crate) fn build_user_messages(
        &self,
        input: AgentInput,
    ) -> Result<Vec<Message>, AgentError> {
        match input {
            AgentInput::Text(t) => Ok(vec![Message::user(t)]),
            AgentInput::Image(image) => Ok(vec![Message::user_image(image)]),
            AgentInput::Messages(messages) => {
                if messages.is_empty() {
                    Err(AgentError::EmptyInput)
                } else {
                    Ok(messages)
                }
            }
            AgentInput::Arguments(args) => {
                if let Some(template) = &self.inner.user_prompt_template {
                    return Ok(vec![Message::user(render_user_template(template, &args))]);
                }
                if args.is_empty() {
                    return Err(AgentError::EmptyInput);
                }
                Ok(args
                    .values()
                    .map(|v| {
                        Message::user(match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                    })
                    .collect())
            }
        }
    }

    // ── Guardrails ────────────────────────────────────────────────────────────

    async fn apply_input_guards(&self, messages: &mut [Message]) -> Result<(), AgentError> {
        if self.inner.input_guards.is_empty() {
            return Ok(());
        }
        let Some(first_user) = messages.iter_mut().find_map(|m| match m {
            Message::User(u) => match &mut u.content {
                UserContent::Text(t) => Some(t),
                _ => None,
            },
            _ => None,
        }) else {
            return Ok(());
        };

        let ctx = GuardrailContext {
            agent_name: self.inner.name.clone(),
            user_input: Some(first_user.clone()),
            ..Default::default()
        };
        let mut text = first_user.clone();
        for guard in &self.inner.input_guards {
            text = guard.validate_input(&text, &ctx).await?;
        }
        *first_user = text;
        Ok(())
    }

    async fn apply_output_guards(&self, output: String) -> Result<String, AgentError> {
        let mut text = output;
        if self.inner.output_guards.is_empty() {
            return Ok(text);
        }
        let ctx = GuardrailContext {
            agent_name: self.inner.name.clone(),
            llm_output: Some(text.clone()),
            ..Default::default()
        };
        for guard in &self.inner.output_guards {
            text = guard.validate_output(&text, &ctx).await?;
        }
        Ok(text)
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    fn spawn_loop(&self, user_messages: Vec<Message>, inherited: Option<String>) -> MessageStream {
        let (tx, rx) = mpsc::channel::<Result<Message, AgentError>>(64);
        let agent = self.clone();
        tokio::spawn(async move {
            let loop_id = inherited.unwrap_or_else(|| Uuid::new_v4().to_string());
            match agent.run_loop(user_messages, &loop_id, &tx).await {
                Ok(()) => {}
                Err(AgentError::Cancelled) => {
                    agent.emit(&loop_id, EventPayload::LoopCancelled);
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_loop(
        &self,
        user_messages: Vec<Message>,
        loop_id: &str,
        tx: &mpsc::Sender<Result<Message, AgentError>>,
    ) -> Result<(), AgentError> {
        let inner = &self.inner;

        self.emit(
            loop_id,
            EventPayload::AgentCall {
                message_ids: user_messages.iter().map(Message::id).collect(),
            },
        );

        // Seed: system prompt, then eager call/result pairs, then the
        // user-authored content.
        let mut seed: Vec<Message> =
            vec![Message::system(self.render_system_prompt()).with_loop_id(loop_id)];
        seed.extend(self.run_eager_tools(loop_id).await);
        for m in user_messages {
            seed.push(m.with_loop_id(loop_id));
        }
        for m in &seed {
            match m {
                Message::Tool(t) => self.emit_tool_result(t, false, loop_id),
                other => self.emit_message_events(other, loop_id),
            }
        }

        let mut messages = seed;
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            debug!(
                agent = %inner.name,
                loop_id,
                rounds,
                message_count = messages.len(),
                "requesting completion"
            );

            let request = CompletionRequest {
                messages: messages.clone(),
                tools: inner.registry.schemas(),
                respond_as: inner.respond_as.clone(),
            };
            let mut stream = inner
                .provider
                .completion(request)
                .await
                .map_err(AgentError::Transport)?;

            let mut round: Vec<Message> = Vec::new();
            let mut pending: Vec<(ToolUse, bool, JoinHandle<ToolMessage>)> = Vec::new();

            while let Some(item) = stream.next().await {
                let assistant: AssistantMessage = match item {
                    Ok(a) => a,
                    Err(e) => {
                        abort_pending(&pending);
                        return Err(AgentError::Transport(e));
                    }
                };
                let message = Message::Assistant(assistant).with_loop_id(loop_id);
                self.emit_message_events(&message, loop_id);
                if tx.send(Ok(message.clone())).await.is_err() {
                    abort_pending(&pending);
                    return Err(AgentError::Cancelled);
                }

                let Message::Assistant(a) = &message else {
                    unreachable!()
                };
                match &a.content {
                    AssistantContent::ToolUse(tool_use) => {
                        let Some(tool) = inner.registry.get(&tool_use.name) else {
                            abort_pending(&pending);
                            return Err(AgentError::UnknownTool {
                                name: tool_use.name.clone(),
                            });
                        };
                        round.push(message.clone());
                        let is_dispatch = tool.dispatch_target().is_some();
                        // Fan out: run the handler in parallel with further
                        // streaming; the barrier below waits for all of them.
                        let handle = self.spawn_tool(tool, tool_use.clone(), loop_id.to_string());
                        pending.push((tool_use.clone(), is_dispatch, handle));
                    }
                    AssistantContent::Text(_) | AssistantContent::Structured(_) => {
                        round.push(message.clone());
                    }
                    // Chunk form; history keeps only the terminal ToolUse.
                    AssistantContent::ToolUseStream(_) => {}
                }
            }

            // Fan-in barrier: every requested tool completes (or fails into a
            // ToolMessage) before the next provider call.
            let mut tool_messages: Vec<Message> = Vec::new();
            for (tool_use, is_dispatch, handle) in pending {
                let tool_message = match handle.await {
                    Ok(m) => m,
                    Err(e) => ToolMessage {
                        tool_use_id: tool_use.tool_use_id.clone(),
                        tool_name: tool_use.name.clone(),
                        arguments: tool_use.arguments.clone(),
                        content: ToolResult::Error(
                            ExecutionError::new(
                                "ToolPanic",
                                format!("tool '{}' panicked: {e}", tool_use.name),
                            )
                            .retry(Retry::No),
                        ),
                        loop_id: Some(loop_id.to_string()),
                    },
                };
                self.emit_tool_result(&tool_message, is_dispatch, loop_id);
                let message = Message::Tool(tool_message);
                if tx.send(Ok(message.clone())).await.is_err() {
                    return Err(AgentError::Cancelled);
                }
                tool_messages.push(message);
            }

            if tool_messages.is_empty() {
                break;
            }
            messages.extend(round);
            messages.extend(tool_messages);
        }

        Ok(())
    }

    /// Invoke eager tools and build their call/result pairs, injected into
    /// the seed exactly as if the model had called them.
    async fn run_eager_tools(&self, loop_id: &str) -> Vec<Message> {
        let mut out = Vec::new();
        for tool in self.inner.registry.eager_tools() {
            let tool_use_id = Uuid::new_v4().to_string();
            let tool_use = ToolUse {
                tool_use_id: tool_use_id.clone(),
                name: tool.name().to_string(),
                arguments: json!({}),
            };
            out.push(Message::assistant_tool_use(tool_use).with_loop_id(loop_id));

            let call = ToolCall {
                id: tool_use_id.clone(),
                name: tool.name().to_string(),
                args: json!({}),
            };
            let message = match tool.invoke(&call).await {
                Ok(value) => {
                    Message::tool_result(tool_use_id, tool.name(), json!({}), value)
                }
                Err(error) => {
                    warn!(tool = %tool.name(), error = %error, "eager tool failed");
                    Message::tool_error(tool_use_id, tool.name(), json!({}), error)
                }
            };
            out.push(message.with_loop_id(loop_id));
        }
        out
    }

    fn spawn_tool(
        &self,
        tool: Arc<dyn Tool>,
        tool_use: ToolUse,
        loop_id: String,
    ) -> JoinHandle<ToolMessage> {
        let agent = self.clone();
        tokio::spawn(async move {
            let content = match validate_arguments(&tool.parameters_schema(), &tool_use.arguments)
            {
                Err(description) => {
                    let error =
                        ExecutionError::new("SchemaViolation", description).retry(Retry::Yes);
                    agent.emit(
                        &loop_id,
                        EventPayload::ToolExecutionError {
                            tool_use_id: tool_use.tool_use_id.clone(),
                            tool_name: tool_use.name.clone(),
                            error: error.clone(),
                        },
                    );
                    ToolResult::Error(error)
                }
                Ok(()) => {
                    let call = ToolCall {
                        id: tool_use.tool_use_id.clone(),
                        name: tool_use.name.clone(),
                        args: tool_use.arguments.clone(),
                    };
                    match tool.invoke(&call).await {
                        Ok(value) => ToolResult::Value(value),
                        Err(error) => {
                            warn!(tool = %tool_use.name, error = %error, "tool execution failed");
                            if tool.dispatch_target().is_none() {
                                agent.emit(
                                    &loop_id,
                                    EventPayload::ToolExecutionError {
                                        tool_use_id: tool_use.tool_use_id.clone(),
                                        tool_name: tool_use.name.clone(),
                                        error: error.clone(),
                                    },
                                );
                            }
                            ToolResult::Error(error)
                        }
                    }
                }
            };
            ToolMessage {
                tool_use_id: tool_use.tool_use_id,
                tool_name: tool_use.name,
                arguments: tool_use.arguments,
                content,
                loop_id: Some(loop_id),
            }
        })
    }

    // ── Event emission ────────────────────────────────────────────────────────

    fn emit(&self, loop_id: &str, payload: EventPayload) {
        self.inner
            .bus
            .emit(Event::new(self.inner.name.clone(), loop_id, payload));
    }

    fn dispatch_target_of(&self, tool_name: &str) -> Option<String> {
        self.inner
            .registry
            .get(tool_name)
            .and_then(|tool| tool.dispatch_target().map(str::to_string))
    }

    fn emit_message_events(&self, message: &Message, loop_id: &str) {
        match message {
            Message::System(s) => self.emit(
                loop_id,
                EventPayload::SystemMessage {
                    message_id: message.id(),
                    content: s.content.clone(),
                },
            ),
            Message::User(u) => self.emit(
                loop_id,
                EventPayload::UserMessage {
                    message_id: message.id(),
                    content: u.content.clone(),
                },
            ),
            Message::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => self.watch_text_stream(ts.clone(), loop_id),
                AssistantContent::ToolUseStream(tus) => {
                    self.watch_tool_stream(tus.clone(), loop_id)
                }
                AssistantContent::ToolUse(tool_use) => {
                    match self.dispatch_target_of(&tool_use.name) {
                        Some(target) => self.emit(
                            // Nested loop correlation: the dispatch's id IS
                            // the child loop id.
                            &tool_use.tool_use_id,
                            EventPayload::TeamDispatchComplete {
                                tool_use_id: tool_use.tool_use_id.clone(),
                                target_agent: target,
                                arguments: tool_use.arguments.clone(),
                            },
                        ),
                        None => {
                            self.emit(
                                loop_id,
                                EventPayload::ToolRequestComplete {
                                    tool_use: tool_use.clone(),
                                },
                            );
                            self.emit(
                                loop_id,
                                EventPayload::ToolExecutionStart {
                                    tool_use: tool_use.clone(),
                                },
                            );
                        }
                    }
                }
                AssistantContent::Structured(v) => self.emit(
                    loop_id,
                    EventPayload::AssistantMessageComplete {
                        stream_id: message.id(),
                        text: v.to_string(),
                    },
                ),
            },
            Message::Tool(t) => self.emit_tool_result(t, false, loop_id),
        }
    }

    fn emit_tool_result(&self, tool_message: &ToolMessage, is_dispatch: bool, loop_id: &str) {
        if is_dispatch {
            let target = self
                .dispatch_target_of(&tool_message.tool_name)
                .unwrap_or_else(|| tool_message.tool_name.clone());
            self.emit(
                loop_id,
                EventPayload::TeamDispatchFinished {
                    tool_use_id: tool_message.tool_use_id.clone(),
                    target_agent: target,
                    result: tool_message.content.clone(),
                },
            );
            return;
        }
        match &tool_message.content {
            ToolResult::Value(value) => self.emit(
                loop_id,
                EventPayload::ToolExecutionComplete {
                    tool_use_id: tool_message.tool_use_id.clone(),
                    tool_name: tool_message.tool_name.clone(),
                    arguments: tool_message.arguments.clone(),
                    result: value.clone(),
                },
            ),
            // The failure event was already emitted at the point of failure;
            // the bus dedup drops this re-emission if it happens anyway.
            ToolResult::Error(error) => self.emit(
                loop_id,
                EventPayload::ToolExecutionError {
                    tool_use_id: tool_message.tool_use_id.clone(),
                    tool_name: tool_message.tool_name.clone(),
                    error: error.clone(),
                },
            ),
        }
    }

    /// Follow a text accumulator and emit one partial event per snapshot,
    /// then the complete event.
    fn watch_text_stream(&self, ts: TextStream, loop_id: &str) {
        let agent = self.clone();
        let loop_id = loop_id.to_string();
        tokio::spawn(async move {
            let mut snapshots = ts.snapshots();
            let mut seq = 0u64;
            while let Some(snapshot) = snapshots.next().await {
                agent.emit(
                    &loop_id,
                    EventPayload::AssistantMessagePartial {
                        stream_id: ts.stream_id.clone(),
                        snapshot,
                        seq,
                    },
                );
                seq += 1;
            }
            agent.emit(
                &loop_id,
                EventPayload::AssistantMessageComplete {
                    stream_id: ts.stream_id.clone(),
                    text: ts.get(),
                },
            );
        });
    }

    /// Follow a tool-argument accumulator and emit partial request events —
    /// dispatch partials when the tool is a teammate dispatcher, keyed to
    /// the child loop id.
    fn watch_tool_stream(&self, tus: ToolUseStream, loop_id: &str) {
        let agent = self.clone();
        let loop_id = loop_id.to_string();
        let target = self.dispatch_target_of(&tus.name);
        tokio::spawn(async move {
            let mut snapshots = tus.snapshots();
            let mut seq = 0u64;
            while let Some(snapshot) = snapshots.next().await {
                match &target {
                    Some(target_agent) => agent.emit(
                        &tus.tool_use_id,
                        EventPayload::TeamDispatchPartial {
                            tool_use_id: tus.tool_use_id.clone(),
                            target_agent: target_agent.clone(),
                            arguments_snapshot: snapshot,
                            seq,
                        },
                    ),
                    None => agent.emit(
                        &loop_id,
                        EventPayload::ToolRequestPartial {
                            tool_use_id: tus.tool_use_id.clone(),
                            tool_name: tus.name.clone(),
                            arguments_snapshot: snapshot,
                            seq,
                        },
                    ),
                }
                seq += 1;
            }
        });
    }

    fn render_system_prompt(&self) -> String {
        let team: Vec<String> = self
            .inner
            .team
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        render_system_prompt(
            &self.inner.system_template,
            &self.inner.name,
            self.inner.description.as_deref().unwrap_or("A helpful assistant"),
            &self.inner.registry.names(),
            &team,
        )
    }
}

impl AgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace the default system-prompt template.  The `{{name}}`,
    /// `{{description}}`, `{{tools}}` and `{{team}}` placeholders are
    /// substituted at loop start.
    pub fn system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = Some(template.into());
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add a sub-agent.  A dispatcher tool is synthesized for it when the
    /// agent is assembled.
    pub fn teammate(mut self, agent: Agent) -> Self {
        self.team.push(agent);
        self
    }

    /// Declare a typed result.  The caller receives the parsed value instead
    /// of streamed text.
    pub fn respond_as(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.respond_as = Some(ResponseFormat {
            name: name.into(),
            schema: prepare_schema(schema),
        });
        self
    }

    /// Template rendered with bound keyword arguments into the user message.
    pub fn user_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.user_prompt_template = Some(template.into());
        self
    }

    /// Declare a named parameter of the agent's signature.
    pub fn parameter(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            description: None,
            schema,
        });
        self
    }

    /// Apply a guardrail to both input and output.
    pub fn guardrail(mut self, guard: Arc<dyn Guardrail>) -> Self {
        self.input_guards.push(Arc::clone(&guard));
        self.output_guards.push(guard);
        self
    }

    pub fn input_guardrail(mut self, guard: Arc<dyn Guardrail>) -> Self {
        self.input_guards.push(guard);
        self
    }

    pub fn output_guardrail(mut self, guard: Arc<dyn Guardrail>) -> Self {
        self.output_guards.push(guard);
        self
    }

    /// Use an explicit bus instead of the process-wide one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Agent {
        let bus = self.bus.unwrap_or_else(EventBus::global);
        // Teammates inherit the parent's bus so nested events correlate.
        let team: Vec<Agent> = self
            .team
            .into_iter()
            .map(|t| t.with_bus(bus.clone()))
            .collect();
        let registry = build_registry(&self.tools, &team);
        Agent {
            inner: Arc::new(AgentInner {
                name: self.name,
                description: self.description,
                provider: self.provider,
                system_template: self
                    .system_template
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                tools: self.tools,
                team,
                registry,
                respond_as: self.respond_as,
                user_prompt_template: self.user_prompt_template,
                parameters: self.parameters,
                input_guards: self.input_guards,
                output_guards: self.output_guards,
                bus,
            }),
        }
    }
}

fn build_registry(tools: &[Arc<dyn Tool>], team: &[Agent]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register_arc(Arc::clone(tool));
    }
    for teammate in team {
        registry.register(AgentDispatchTool::new(teammate.clone()));
    }
    registry
}

fn abort_pending(pending: &[(ToolUse, bool, JoinHandle<ToolMessage>)]) {
    for (_, _, handle) in pending {
        handle.abort();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
