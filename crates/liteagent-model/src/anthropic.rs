// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic-style `/v1/messages` SSE adapter.
//!
//! The lone system message is passed out-of-band as the top-level `system`
//! field; tool results travel as `tool_result` blocks inside `user`-role
//! turns.  Structured output is requested by appending a schema instruction
//! to the system text and parsing the reply on completion.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    assembler::{spawn_driver, Chunk},
    history::{image_to_base64, pair_tool_messages, split_system},
    provider::{CompletionRequest, CompletionStream, ProviderConfig, ResponseFormat},
    AssistantContent, Image, Message, Provider, UserContent, UserPart,
};

const DEFAULT_MAX_TOKENS: u64 = 4096;
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    extra: serde_json::Map<String, Value>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            model: config.model,
            api_key: config.api_key,
            base_url: config
                .base_url
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            extra: config.extra,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream> {
        let key = self.api_key.as_deref().context("anthropic API key not set")?;

        let (mut system, rest) = split_system(&req.messages);
        if let Some(format) = &req.respond_as {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&structured_instruction(format));
        }
        let messages = build_messages(&self.client, &rest).await?;

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        for (k, v) in &self.extra {
            body[k] = v.clone();
        }

        debug!(
            model = %self.model,
            tool_count = req.tools.len(),
            "sending anthropic completion request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        Ok(spawn_driver(
            resp,
            req.respond_as.clone(),
            "anthropic stream failed",
            parse_line,
        ))
    }
}

fn structured_instruction(format: &ResponseFormat) -> String {
    format!(
        "Respond with a single JSON object matching the '{}' schema, with no \
         surrounding prose or code fences:\n{}",
        format.name, format.schema
    )
}

fn parse_line(line: &str) -> Vec<Chunk> {
    let Some(data) = line.strip_prefix("data: ") else {
        return vec![];
    };
    let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
        return vec![];
    };
    parse_event(&v)
}

fn parse_event(v: &Value) -> Vec<Chunk> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                return vec![Chunk::ToolDelta {
                    index: v["index"].as_u64().unwrap_or(0) as u32,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }];
            }
            vec![]
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![Chunk::TextDelta(text.to_string())]
                    }
                }
                "input_json_delta" => vec![Chunk::ToolDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                _ => vec![],
            }
        }
        "message_stop" => vec![Chunk::Done],
        _ => vec![],
    }
}

async fn build_messages(
    client: &reqwest::Client,
    messages: &[Message],
) -> anyhow::Result<Vec<Value>> {
    let mut out = Vec::with_capacity(messages.len());
    for m in pair_tool_messages(messages) {
        match &m {
            Message::System(_) => unreachable!("system extracted before serialization"),
            Message::User(u) => out.push(json!({
                "role": "user",
                "content": user_blocks(client, &u.content).await?,
            })),
            Message::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => out.push(json!({
                    "role": "assistant",
                    "content": ts.await_complete().await,
                })),
                AssistantContent::Structured(v) => out.push(json!({
                    "role": "assistant",
                    "content": v.to_string(),
                })),
                AssistantContent::ToolUse(tu) => out.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": tu.tool_use_id,
                        "name": tu.name,
                        "input": tu.arguments,
                    }]
                })),
                AssistantContent::ToolUseStream(tus) => {
                    let input: Value = tus.await_json().await.unwrap_or_else(|_| json!({}));
                    out.push(json!({
                        "role": "assistant",
                        "content": [{
                            "type": "tool_use",
                            "id": tus.tool_use_id,
                            "name": tus.name,
                            "input": input,
                        }]
                    }));
                }
            },
            Message::Tool(t) => out.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": t.tool_use_id,
                    "content": t.content.to_wire_string(),
                }]
            })),
        }
    }
    Ok(out)
}

async fn user_blocks(client: &reqwest::Client, content: &UserContent) -> anyhow::Result<Value> {
    Ok(match content {
        UserContent::Text(t) => json!(t),
        UserContent::Image(img) => json!([image_block(client, img).await?]),
        UserContent::Parts(parts) => {
            let mut blocks = Vec::with_capacity(parts.len());
            for p in parts {
                blocks.push(match p {
                    UserPart::Text(t) => json!({ "type": "text", "text": t }),
                    UserPart::Image(img) => image_block(client, img).await?,
                });
            }
            json!(blocks)
        }
    })
}

async fn image_block(client: &reqwest::Client, img: &Image) -> anyhow::Result<Value> {
    // Anthropic accepts remote URLs directly; local and base64 sources are
    // inlined.
    if let Image::Url { url } = img {
        return Ok(json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }));
    }
    let (media_type, data) = image_to_base64(client, img).await?;
    Ok(json!({
        "type": "image",
        "source": { "type": "base64", "media_type": media_type, "data": data }
    }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolUse;

    #[test]
    fn tool_use_block_start_parsed() {
        let chunks = parse_line(
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"add"}}"#,
        );
        match &chunks[0] {
            Chunk::ToolDelta { index, id, name, .. } => {
                assert_eq!(*index, 1);
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "add");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn input_json_delta_parsed() {
        let chunks = parse_line(
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":2"}}"#,
        );
        match &chunks[0] {
            Chunk::ToolDelta { arguments, .. } => assert_eq!(arguments, "{\"a\":2"),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn text_delta_and_stop_parsed() {
        let chunks = parse_line(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        assert!(matches!(&chunks[0], Chunk::TextDelta(t) if t == "hi"));
        let chunks = parse_line(r#"data: {"type":"message_stop"}"#);
        assert!(matches!(chunks[0], Chunk::Done));
    }

    #[tokio::test]
    async fn tool_results_serialize_as_user_role_blocks() {
        let client = reqwest::Client::new();
        let msgs = vec![
            Message::assistant_tool_use(ToolUse {
                tool_use_id: "toolu_1".into(),
                name: "add".into(),
                arguments: json!({"a": 2}),
            }),
            Message::tool_result("toolu_1", "add", json!({"a": 2}), json!(5)),
        ];
        let wire = build_messages(&client, &msgs).await.unwrap();
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"][0]["type"], "tool_result");
        assert_eq!(wire[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn structured_instruction_names_the_schema() {
        let s = structured_instruction(&ResponseFormat {
            name: "Out".into(),
            schema: json!({"type": "object"}),
        });
        assert!(s.contains("'Out'"));
        assert!(s.contains("\"object\""));
    }
}
