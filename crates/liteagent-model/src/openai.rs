// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-style `/chat/completions` SSE adapter.
//!
//! Also serves every server that speaks the same wire format (vLLM,
//! llama.cpp, LM Studio, gateways) via `ProviderConfig::base_url`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    assembler::{spawn_driver, Chunk},
    history::{image_to_url, pair_tool_messages},
    provider::{CompletionRequest, CompletionStream, ProviderConfig},
    AssistantContent, Image, Message, Provider, UserContent, UserPart,
};

pub struct OpenAiProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    extra: serde_json::Map<String, Value>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let base = config
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        Self {
            model: config.model,
            api_key: config.api_key,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            extra: config.extra,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream> {
        let messages = build_messages(&req.messages).await?;

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "strict": true,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(format) = &req.respond_as {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "strict": true,
                    "schema": format.schema,
                }
            });
        }
        for (k, v) in &self.extra {
            body[k] = v.clone();
        }

        debug!(
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending openai completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req.send().await.context("openai request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("openai error {status}: {text}");
        }

        Ok(spawn_driver(
            resp,
            req.respond_as.clone(),
            "openai stream failed",
            parse_line,
        ))
    }
}

fn parse_line(line: &str) -> Vec<Chunk> {
    let Some(data) = line.strip_prefix("data: ") else {
        return vec![];
    };
    let data = data.trim();
    if data.is_empty() {
        return vec![];
    }
    if data == "[DONE]" {
        return vec![Chunk::Done];
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return vec![];
    };
    parse_chunk(&v)
}

fn parse_chunk(v: &Value) -> Vec<Chunk> {
    let delta = &v["choices"][0]["delta"];

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        return tool_calls
            .iter()
            .map(|tc| Chunk::ToolDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            })
            .collect();
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return vec![Chunk::TextDelta(text.to_string())];
        }
    }
    vec![]
}

async fn build_messages(messages: &[Message]) -> anyhow::Result<Vec<Value>> {
    let mut out = Vec::with_capacity(messages.len());
    for m in pair_tool_messages(messages) {
        match &m {
            Message::System(s) => out.push(json!({ "role": "system", "content": s.content })),
            Message::User(u) => out.push(user_to_value(&u.content).await?),
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
                    "tool_calls": [{
                        "id": tu.tool_use_id,
                        "type": "function",
                        "function": {
                            "name": tu.name,
                            "arguments": tu.arguments.to_string(),
                        }
                    }]
                })),
                AssistantContent::ToolUseStream(tus) => {
                    let args = tus.await_complete().await;
                    out.push(json!({
                        "role": "assistant",
                        "tool_calls": [{
                            "id": tus.tool_use_id,
                            "type": "function",
                            "function": { "name": tus.name, "arguments": args }
                        }]
                    }));
                }
            },
            Message::Tool(t) => out.push(json!({
                "role": "tool",
                "tool_call_id": t.tool_use_id,
                "content": t.content.to_wire_string(),
            })),
        }
    }
    Ok(out)
}

async fn user_to_value(content: &UserContent) -> anyhow::Result<Value> {
    let value = match content {
        UserContent::Text(t) => json!({ "role": "user", "content": t }),
        UserContent::Image(img) => json!({
            "role": "user",
            "content": [image_part(img).await?],
        }),
        UserContent::Parts(parts) => {
            let mut rendered = Vec::with_capacity(parts.len());
            for p in parts {
                rendered.push(match p {
                    UserPart::Text(t) => json!({ "type": "text", "text": t }),
                    UserPart::Image(img) => image_part(img).await?,
                });
            }
            json!({ "role": "user", "content": rendered })
        }
    };
    Ok(value)
}

async fn image_part(img: &Image) -> anyhow::Result<Value> {
    Ok(json!({
        "type": "image_url",
        "image_url": { "url": image_to_url(img).await?, "detail": "auto" },
    }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolUse;

    #[test]
    fn provider_url_derives_from_base() {
        let p = OpenAiProvider::new(
            ProviderConfig::new("gpt-4.1-mini").base_url("http://localhost:8080/v1/"),
        );
        assert_eq!(p.chat_url, "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn text_delta_parsed() {
        let chunks =
            parse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#);
        assert!(matches!(&chunks[0], Chunk::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn done_sentinel_parsed() {
        assert!(matches!(parse_line("data: [DONE]")[0], Chunk::Done));
    }

    #[test]
    fn tool_call_delta_parsed() {
        let chunks = parse_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc1","function":{"name":"add","arguments":"{\"a\":"}}]}}]}"#,
        );
        match &chunks[0] {
            Chunk::ToolDelta {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!(*index, 0);
                assert_eq!(id, "tc1");
                assert_eq!(name, "add");
                assert_eq!(arguments, "{\"a\":");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_ignored() {
        assert!(parse_line(": keepalive").is_empty());
        assert!(parse_line("").is_empty());
    }

    #[tokio::test]
    async fn history_serializes_tool_round_in_wire_order() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("2+3?"),
            Message::assistant_tool_use(ToolUse {
                tool_use_id: "tc1".into(),
                name: "add".into(),
                arguments: json!({"a": 2, "b": 3}),
            }),
            Message::tool_result("tc1", "add", json!({"a": 2, "b": 3}), json!(5)),
        ];
        let wire = build_messages(&msgs).await.unwrap();
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["tool_calls"][0]["id"], "tc1");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "tc1");
        assert_eq!(wire[3]["content"], "5");
    }

    #[tokio::test]
    async fn assistant_text_is_materialized() {
        let msgs = vec![Message::assistant_text("done")];
        let wire = build_messages(&msgs).await.unwrap();
        assert_eq!(wire[0]["content"], "done");
    }

    #[tokio::test]
    async fn base64_user_image_becomes_data_url_part() {
        let msgs = vec![Message::user_image(Image::Base64 {
            data: "QUJD".into(),
            media_type: "image/png".into(),
        })];
        let wire = build_messages(&msgs).await.unwrap();
        assert_eq!(
            wire[0]["content"][0]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }
}
