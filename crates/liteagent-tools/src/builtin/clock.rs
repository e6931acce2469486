// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use liteagent_model::ExecutionError;

use crate::{Tool, ToolCall};

/// Eager clock tool: the current UTC instant, injected ahead of the first
/// provider call so the model always knows what time it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "The current date and time in UTC, RFC 3339 formatted."
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
        "🕐"
    }

    async fn invoke(&self, _call: &ToolCall) -> Result<Value, ExecutionError> {
        Ok(json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_returns_an_rfc3339_utc_instant() {
        let out = ClockTool
            .invoke(&ToolCall {
                id: "tc".into(),
                name: "clock".into(),
                args: json!({}),
            })
            .await
            .unwrap();
        let s = out.as_str().unwrap();
        assert!(s.ends_with('Z'), "expected UTC suffix: {s}");
        assert!(chrono::DateTime::parse_from_rfc3339(s).is_ok());
    }

    #[test]
    fn clock_is_eager() {
        assert!(ClockTool.eager());
    }
}
