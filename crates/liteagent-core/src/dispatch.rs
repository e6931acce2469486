// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sub-agents exposed as tools.
//!
//! The dispatcher is synthesized when the parent agent is assembled: its
//! schema comes from the teammate's declared parameters (a single `prompt`
//! string when none are declared), and its handler runs the teammate with
//! the dispatch's tool-use id as the child `loop_id`, so nested events can
//! be correlated without flattening the child's messages into the parent's
//! stream.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use liteagent_model::ExecutionError;
use liteagent_tools::{schema::prepare_schema, Tool, ToolCall};

use crate::agent::{Agent, AgentInput, AgentOutput};

pub struct AgentDispatchTool {
    agent: Agent,
    name: String,
    description: String,
    schema: Value,
}

impl AgentDispatchTool {
    pub fn new(agent: Agent) -> Self {
        let name = format!(
            "{}_redirection",
            agent.name().replace(' ', "_").to_lowercase()
        );
        let description = format!(
            "Dispatch to the {} agent: {}",
            agent.name(),
            agent.description().unwrap_or("")
        );
        let schema = prepare_schema(dispatch_schema(&agent));
        Self {
            agent,
            name,
            description,
            schema,
        }
    }
}

fn dispatch_schema(agent: &Agent) -> Value {
    if agent.parameters().is_empty() {
        return json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Prompt to send to the agent",
                }
            }
        });
    }
    let mut properties = Map::new();
    for param in agent.parameters() {
        let mut schema = param.schema.clone();
        if let (Some(obj), Some(description)) = (schema.as_object_mut(), &param.description) {
            obj.entry("description")
                .or_insert_with(|| json!(description));
        }
        properties.insert(param.name.clone(), schema);
    }
    json!({ "type": "object", "properties": properties })
}

#[async_trait]
impl Tool for AgentDispatchTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn emoji(&self) -> &str {
        "🤖"
    }

    fn dispatch_target(&self) -> Option<&str> {
        Some(self.agent.name())
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ExecutionError> {
        let args = call.args.as_object().cloned().unwrap_or_default();
        // The dispatch's tool-use id becomes the child loop id.
        let result = self
            .agent
            .invoke_with_loop(AgentInput::Arguments(args), Some(call.id.clone()))
            .await;
        match result {
            Ok(AgentOutput::Structured(v)) => Ok(v),
            Ok(AgentOutput::Text(t)) => Ok(Value::String(t)),
            Err(e) => Err(ExecutionError::new("SubAgentError", e.to_string())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use liteagent_model::ScriptedProvider;

    use super::*;
    use crate::bus::EventBus;

    fn teammate(name: &str) -> Agent {
        Agent::builder(name, Arc::new(ScriptedProvider::always_text("4")))
            .bus(EventBus::new())
            .build()
    }

    #[tokio::test]
    async fn dispatcher_name_is_derived_from_the_agent_name() {
        let tool = AgentDispatchTool::new(teammate("Math Helper"));
        assert_eq!(tool.name(), "math_helper_redirection");
        assert_eq!(tool.dispatch_target(), Some("Math Helper"));
    }

    #[tokio::test]
    async fn default_schema_is_a_required_prompt_string() {
        let tool = AgentDispatchTool::new(teammate("math"));
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], json!(["prompt"]));
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["properties"]["prompt"]["type"], "string");
    }

    #[tokio::test]
    async fn declared_parameters_shape_the_schema() {
        let agent = Agent::builder("math", Arc::new(ScriptedProvider::always_text("4")))
            .bus(EventBus::new())
            .user_prompt_template("Evaluate {expr}")
            .parameter("expr", json!({"type": "string"}))
            .build();
        let tool = AgentDispatchTool::new(agent);
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], json!(["expr"]));
    }

    #[tokio::test]
    async fn invoking_the_dispatcher_returns_the_final_text() {
        let tool = AgentDispatchTool::new(teammate("math"));
        let out = tool
            .invoke(&ToolCall {
                id: "dispatch-1".into(),
                name: "math_redirection".into(),
                args: json!({"prompt": "2+2"}),
            })
            .await
            .unwrap();
        assert_eq!(out, json!("4"));
    }
}
