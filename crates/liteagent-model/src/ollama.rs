// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ollama-style `/api/chat` NDJSON adapter.
//!
//! Each response line is a complete JSON object.  Tool calls arrive with
//! already-parsed argument objects; structured output uses the `format`
//! field; user images travel as base64 attachments on the message.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    assembler::{spawn_driver, Chunk},
    history::{image_to_base64, pair_tool_messages},
    provider::{CompletionRequest, CompletionStream, ProviderConfig},
    AssistantContent, Message, Provider, UserContent, UserPart,
};

pub struct OllamaProvider {
    model: String,
    base_url: String,
    extra: serde_json::Map<String, Value>,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            model: config.model,
            base_url: config
                .base_url
                .unwrap_or_else(|| "http://localhost:11434".into()),
            extra: config.extra,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream> {
        let messages = build_messages(&self.client, &req.messages).await?;

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(format) = &req.respond_as {
            body["format"] = format.schema.clone();
        }
        for (k, v) in &self.extra {
            body[k] = v.clone();
        }

        debug!(model = %self.model, "sending ollama completion request");

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("ollama error {status}: {text}");
        }

        Ok(spawn_driver(
            resp,
            req.respond_as.clone(),
            "ollama stream failed",
            parse_line,
        ))
    }
}

fn parse_line(line: &str) -> Vec<Chunk> {
    let line = line.trim();
    if line.is_empty() {
        return vec![];
    }
    let Ok(v) = serde_json::from_str::<Value>(line) else {
        return vec![];
    };
    let mut chunks = Vec::new();
    let message = &v["message"];

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            chunks.push(Chunk::ToolComplete {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].clone(),
            });
        }
    }
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            chunks.push(Chunk::TextDelta(text.to_string()));
        }
    }
    if v["done"].as_bool() == Some(true) {
        chunks.push(Chunk::Done);
    }
    chunks
}

async fn build_messages(
    client: &reqwest::Client,
    messages: &[Message],
) -> anyhow::Result<Vec<Value>> {
    let mut out = Vec::with_capacity(messages.len());
    for m in pair_tool_messages(messages) {
        match &m {
            Message::System(s) => out.push(json!({ "role": "system", "content": s.content })),
            Message::User(u) => out.push(user_to_value(client, &u.content).await?),
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
                        "function": { "name": tu.name, "arguments": tu.arguments }
                    }]
                })),
                AssistantContent::ToolUseStream(tus) => {
                    let args: Value = tus.await_json().await.unwrap_or_else(|_| json!({}));
                    out.push(json!({
                        "role": "assistant",
                        "tool_calls": [{
                            "function": { "name": tus.name, "arguments": args }
                        }]
                    }));
                }
            },
            Message::Tool(t) => out.push(json!({
                "role": "tool",
                "content": t.content.to_wire_string(),
            })),
        }
    }
    Ok(out)
}

async fn user_to_value(client: &reqwest::Client, content: &UserContent) -> anyhow::Result<Value> {
    let (text, images) = match content {
        UserContent::Text(t) => (t.clone(), vec![]),
        UserContent::Image(img) => {
            let (_, data) = image_to_base64(client, img).await?;
            (String::new(), vec![data])
        }
        UserContent::Parts(parts) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for p in parts {
                match p {
                    UserPart::Text(t) => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                    UserPart::Image(img) => {
                        let (_, data) = image_to_base64(client, img).await?;
                        images.push(data);
                    }
                }
            }
            (text, images)
        }
    };
    let mut value = json!({ "role": "user", "content": text });
    if !images.is_empty() {
        value["images"] = json!(images);
    }
    Ok(value)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_chunk_parsed() {
        let chunks = parse_line(r#"{"message":{"role":"assistant","content":"hi"},"done":false}"#);
        assert!(matches!(&chunks[0], Chunk::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn done_flag_parsed() {
        let chunks = parse_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#);
        assert!(matches!(chunks[0], Chunk::Done));
    }

    #[test]
    fn tool_call_arrives_with_parsed_arguments() {
        let chunks = parse_line(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"add","arguments":{"a":2,"b":3}}}]},"done":false}"#,
        );
        match &chunks[0] {
            Chunk::ToolComplete { name, arguments, .. } => {
                assert_eq!(name, "add");
                assert_eq!(*arguments, json!({"a": 2, "b": 3}));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn garbage_lines_ignored() {
        assert!(parse_line("not json").is_empty());
        assert!(parse_line("").is_empty());
    }

    #[tokio::test]
    async fn tool_results_serialize_with_tool_role() {
        let client = reqwest::Client::new();
        let msgs = vec![Message::tool_result("tc", "add", json!({}), json!(5))];
        let wire = build_messages(&client, &msgs).await.unwrap();
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["content"], "5");
    }
}
