// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use liteagent_model::{ExecutionError, Retry};

use crate::{Tool, ToolCall};

const IPIFY_URL: &str = "https://api.ipify.org";

/// Eager ambient-fact tool: the caller's public IP, via api.ipify.org.
#[derive(Debug, Default, Clone)]
pub struct PublicIpTool {
    client: reqwest::Client,
}

#[async_trait]
impl Tool for PublicIpTool {
    fn name(&self) -> &str {
        "public_ip"
    }

    fn description(&self) -> &str {
        "The public IP address of the machine running this agent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false,
            "required": [],
        })
    }

    fn eager(&self) -> bool {
        true
    }

    fn emoji(&self) -> &str {
        "🌐"
    }

    async fn invoke(&self, _call: &ToolCall) -> Result<Value, ExecutionError> {
        let ip = self
            .client
            .get(IPIFY_URL)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExecutionError::new("TransportError", e.to_string()).retry(Retry::Maybe))?
            .text()
            .await
            .map_err(|e| ExecutionError::new("TransportError", e.to_string()).retry(Retry::Maybe))?;
        Ok(json!(ip.trim()))
    }
}
