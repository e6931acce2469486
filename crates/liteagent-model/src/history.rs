// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! History serialization helpers shared by the provider adapters.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use base64::Engine;

use crate::{AssistantContent, Image, Message};

/// Reorder history so every tool-use message is immediately followed by its
/// tool-result message.  Several wire protocols require the result right
/// after the call; the loop appends results only after the whole round, so
/// pairing happens here at the adapter boundary.
///
/// Unmatched tool-use messages are kept at the end of the list.
pub fn pair_tool_messages(messages: &[Message]) -> Vec<Message> {
    let mut paired: Vec<Message> = Vec::with_capacity(messages.len());
    let mut held: Vec<(String, Message)> = Vec::new();
    let mut held_idx: HashMap<String, usize> = HashMap::new();

    for msg in messages {
        match msg {
            Message::Assistant(a) => {
                let id = match &a.content {
                    AssistantContent::ToolUse(tu) => Some(tu.tool_use_id.clone()),
                    AssistantContent::ToolUseStream(tus) => Some(tus.tool_use_id.clone()),
                    _ => None,
                };
                if let Some(id) = id {
                    held_idx.insert(id.clone(), held.len());
                    held.push((id, msg.clone()));
                    continue;
                }
                paired.push(msg.clone());
            }
            Message::Tool(t) => {
                if let Some(idx) = held_idx.remove(&t.tool_use_id) {
                    paired.push(held[idx].1.clone());
                    held[idx].0.clear();
                    paired.push(msg.clone());
                } else {
                    paired.push(msg.clone());
                }
            }
            _ => paired.push(msg.clone()),
        }
    }

    for (id, msg) in held {
        if !id.is_empty() {
            paired.push(msg);
        }
    }
    paired
}

/// Extract the system text for protocols that take it out-of-band.
/// Multiple system messages (not expected, but harmless) are joined.
pub fn split_system(messages: &[Message]) -> (String, Vec<Message>) {
    let mut system = String::new();
    let mut rest = Vec::with_capacity(messages.len());
    for m in messages {
        match m {
            Message::System(s) => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&s.content);
            }
            other => rest.push(other.clone()),
        }
    }
    (system, rest)
}

/// Media type guessed from a file extension.  Falls back to PNG.
pub fn media_type_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}

/// Render an image as a URL the OpenAI-style protocols accept: remote URLs
/// pass through, everything else becomes a `data:` URL.
pub async fn image_to_url(image: &Image) -> anyhow::Result<String> {
    match image {
        Image::Url { url } => Ok(url.clone()),
        Image::Base64 { data, media_type } => Ok(format!("data:{media_type};base64,{data}")),
        Image::Path { path } => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading image {}", path.display()))?;
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            Ok(format!("data:{};base64,{data}", media_type_for_path(path)))
        }
    }
}

/// Render an image as `(media_type, base64)` for protocols that want the
/// source inline.  Remote URLs are fetched.
pub async fn image_to_base64(
    client: &reqwest::Client,
    image: &Image,
) -> anyhow::Result<(String, String)> {
    match image {
        Image::Base64 { data, media_type } => Ok((media_type.clone(), data.clone())),
        Image::Path { path } => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading image {}", path.display()))?;
            Ok((
                media_type_for_path(path).to_string(),
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ))
        }
        Image::Url { url } => {
            let resp = client
                .get(url)
                .send()
                .await
                .with_context(|| format!("fetching image {url}"))?;
            let media_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("image/png")
                .to_string();
            let bytes = resp.bytes().await?;
            Ok((
                media_type,
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ))
        }
    }
}

/// Parse a `data:<mime>;base64,<b64>` URL into `(mime, b64)`.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, b64) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta);
    Some((mime.to_string(), b64.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
