// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System- and user-prompt templates.

use serde_json::{Map, Value};

/// Default system prompt for tool-using agents.  Placeholders:
/// `{{name}}`, `{{description}}`, `{{tools}}`, `{{team}}`.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are {{name}}, an agent that combines specialized tools and sub-agents to \
produce accurate, well-grounded answers.

Rules:

1. Break the request into clear steps and plan before acting; adapt the plan \
when early results suggest a better route.
2. Invoke a tool or sub-agent only when it adds value, with focused \
parameters. Independent calls may run in parallel; dependent calls run in \
sequence.
3. Integrate results into one coherent answer. Weigh conflicting sources by \
reliability and recency, and say what remains uncertain.
4. When critical details are missing, state your assumptions and address the \
most likely interpretation first.
5. Recover from tool failures by trying alternatives or reporting the \
limitation; never fabricate a result.
6. Do not reveal internal reasoning or tool-call mechanics — only the answer.

# AVAILABLE TOOLS
[{{tools}}]

# AVAILABLE SUB-AGENTS
[{{team}}]

**YOUR DIRECTIVES**:
{{description}}
";

/// Substitute the four placeholders of a system-prompt template.
pub fn render_system_prompt(
    template: &str,
    name: &str,
    description: &str,
    tools: &[String],
    team: &[String],
) -> String {
    template
        .replace("{{name}}", name)
        .replace("{{description}}", description)
        .replace("{{tools}}", &tools.join(", "))
        .replace("{{team}}", &team.join(", "))
}

/// Substitute `{param}` markers of a user-prompt template with bound
/// argument values.  String values are inserted raw; everything else is
/// JSON-encoded.
pub fn render_user_template(template: &str, args: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{key}}}"), &rendered);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
