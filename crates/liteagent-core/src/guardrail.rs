// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Input/output validation wrapping agent invocation.
//!
//! A guardrail may rewrite the text (redaction) or reject it outright.
//! Input validation runs against the first user text before the loop starts.
//! Output validation runs against the materialized text of non-streaming
//! invocations only — buffering a streamed reply to validate it would defeat
//! streaming, so callers wanting output guardrails use `invoke`.

use std::collections::HashMap;

use async_trait::async_trait;

/// Execution state handed to validators.
#[derive(Debug, Clone, Default)]
pub struct GuardrailContext {
    pub agent_name: String,
    /// Original user input (present during input validation).
    pub user_input: Option<String>,
    /// Materialized model output (present during output validation).
    pub llm_output: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A rejected input or output, carrying the guardrail's name.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Violation {
    #[error("[{guardrail}] input rejected: {message}")]
    Input { guardrail: String, message: String },
    #[error("[{guardrail}] output rejected: {message}")]
    Output { guardrail: String, message: String },
}

impl Violation {
    pub fn input(guardrail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            guardrail: guardrail.into(),
            message: message.into(),
        }
    }

    pub fn output(guardrail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Output {
            guardrail: guardrail.into(),
            message: message.into(),
        }
    }
}

/// A pair of validators.  Both default to pass-through; implement either or
/// both.
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn validate_input(
        &self,
        input: &str,
        _ctx: &GuardrailContext,
    ) -> Result<String, Violation> {
        Ok(input.to_string())
    }

    async fn validate_output(
        &self,
        output: &str,
        _ctx: &GuardrailContext,
    ) -> Result<String, Violation> {
        Ok(output.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    #[async_trait]
    impl Guardrail for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    #[tokio::test]
    async fn defaults_pass_text_through_unchanged() {
        let g = Passthrough;
        let ctx = GuardrailContext::default();
        assert_eq!(g.validate_input("in", &ctx).await.unwrap(), "in");
        assert_eq!(g.validate_output("out", &ctx).await.unwrap(), "out");
    }

    #[test]
    fn violations_carry_the_guardrail_name() {
        let v = Violation::input("no_pii", "found an email address");
        assert_eq!(v.to_string(), "[no_pii] input rejected: found an email address");
    }
}
