// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google-style `streamGenerateContent` adapter.
//!
//! `systemInstruction` travels out-of-band; tool interactions use
//! `functionCall` / `functionResponse` parts matched by *function name*
//! rather than by an opaque call id.  Function calls arrive fully formed in
//! a single chunk.  Structured output uses the native `responseSchema`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    assembler::{spawn_driver, Chunk},
    history::{image_to_base64, pair_tool_messages, split_system},
    provider::{CompletionRequest, CompletionStream, ProviderConfig},
    AssistantContent, Image, Message, Provider, UserContent, UserPart,
};

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    extra: serde_json::Map<String, Value>,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            model: config.model,
            api_key: config.api_key,
            base_url: config
                .base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            extra: config.extra,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn completion(&self, req: CompletionRequest) -> anyhow::Result<CompletionStream> {
        let key = self.api_key.as_deref().context("google API key not set")?;

        let (system, rest) = split_system(&req.messages);
        let contents = build_contents(&self.client, &rest).await?;

        let mut generation_config = json!({});
        if let Some(format) = &req.respond_as {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = format.schema.clone();
        }
        for (k, v) in &self.extra {
            generation_config[k] = v.clone();
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            key
        );

        debug!(model = %self.model, "sending google completion request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("google request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("google error {status}: {text}");
        }

        Ok(spawn_driver(
            resp,
            req.respond_as.clone(),
            "google stream failed",
            parse_line,
        ))
    }
}

fn parse_line(line: &str) -> Vec<Chunk> {
    let Some(data) = line.strip_prefix("data: ") else {
        return vec![];
    };
    let data = data.trim();
    if data == "[DONE]" {
        return vec![Chunk::Done];
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return vec![];
    };
    parse_chunk(&v)
}

fn parse_chunk(v: &Value) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let candidate = &v["candidates"][0];

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fc) = part.get("functionCall") {
                chunks.push(Chunk::ToolComplete {
                    // The protocol has no call id; a synthetic one is minted
                    // by the assembler when this is empty.
                    id: String::new(),
                    name: fc["name"].as_str().unwrap_or("").to_string(),
                    arguments: fc["args"].clone(),
                });
            } else if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    chunks.push(Chunk::TextDelta(text.to_string()));
                }
            }
        }
    }

    if candidate["finishReason"].as_str().is_some() {
        chunks.push(Chunk::Done);
    }
    chunks
}

async fn build_contents(
    client: &reqwest::Client,
    messages: &[Message],
) -> anyhow::Result<Vec<Value>> {
    let mut out = Vec::with_capacity(messages.len());
    for m in pair_tool_messages(messages) {
        match &m {
            Message::System(_) => unreachable!("system extracted before serialization"),
            Message::User(u) => out.push(json!({
                "role": "user",
                "parts": user_parts(client, &u.content).await?,
            })),
            Message::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => out.push(json!({
                    "role": "model",
                    "parts": [{ "text": ts.await_complete().await }],
                })),
                AssistantContent::Structured(v) => out.push(json!({
                    "role": "model",
                    "parts": [{ "text": v.to_string() }],
                })),
                AssistantContent::ToolUse(tu) => out.push(json!({
                    "role": "model",
                    "parts": [{ "functionCall": { "name": tu.name, "args": tu.arguments } }],
                })),
                AssistantContent::ToolUseStream(tus) => {
                    let args: Value = tus.await_json().await.unwrap_or_else(|_| json!({}));
                    out.push(json!({
                        "role": "model",
                        "parts": [{ "functionCall": { "name": tus.name, "args": args } }],
                    }));
                }
            },
            // Responses are matched to calls by function name, which the
            // tool message carries directly.
            Message::Tool(t) => out.push(json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": t.tool_name,
                        "response": { "output": t.content.to_wire_string() },
                    }
                }]
            })),
        }
    }
    Ok(out)
}

async fn user_parts(client: &reqwest::Client, content: &UserContent) -> anyhow::Result<Value> {
    Ok(match content {
        UserContent::Text(t) => json!([{ "text": t }]),
        UserContent::Image(img) => json!([image_part(client, img).await?]),
        UserContent::Parts(parts) => {
            let mut rendered = Vec::with_capacity(parts.len());
            for p in parts {
                rendered.push(match p {
                    UserPart::Text(t) => json!({ "text": t }),
                    UserPart::Image(img) => image_part(client, img).await?,
                });
            }
            json!(rendered)
        }
    })
}

async fn image_part(client: &reqwest::Client, img: &Image) -> anyhow::Result<Value> {
    let (media_type, data) = image_to_base64(client, img).await?;
    Ok(json!({ "inline_data": { "mime_type": media_type, "data": data } }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
