use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::stream::{TextStream, ToolUseStream};

/// Correlates every message and event belonging to one invocation of the
/// agent loop.
pub type LoopId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ─── User content ─────────────────────────────────────────────────────────────

/// An image attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Image {
    Url { url: String },
    Base64 { data: String, media_type: String },
    Path { path: std::path::PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserPart {
    Image(Image),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Image(Image),
    Parts(Vec<UserPart>),
    Text(String),
}

impl UserContent {
    /// The plain text of this content, if it is a single text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

// ─── Tool results ─────────────────────────────────────────────────────────────

/// How the model should treat a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retry {
    Yes,
    No,
    Maybe,
}

/// A tool handler failure, reified as data.  The agent surfaces this as the
/// ToolMessage content so the model can see and react to it; it is never
/// re-raised across the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub exception_type: String,
    pub message: String,
    pub should_tell_user: bool,
    pub should_retry: Retry,
}

impl ExecutionError {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            should_tell_user: true,
            should_retry: Retry::Maybe,
        }
    }

    pub fn retry(mut self, retry: Retry) -> Self {
        self.should_retry = retry;
        self
    }

    pub fn silent(mut self) -> Self {
        self.should_tell_user = false;
        self
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

/// The content of a ToolMessage: either the handler's value or a captured
/// execution error.  `Error` comes first so untagged deserialization prefers
/// the structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Error(ExecutionError),
    Value(Value),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// JSON-encode this result the way it is sent back to providers.
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Value(v) => v.to_string(),
            Self::Error(e) => json!({
                "error": e.message,
                "exception_type": e.exception_type,
                "should_retry": e.should_retry,
            })
            .to_string(),
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SystemMessage {
    pub content: String,
    pub loop_id: Option<LoopId>,
}

#[derive(Debug, Clone)]
pub struct UserMessage {
    pub content: UserContent,
    pub loop_id: Option<LoopId>,
}

/// The completed, parsed form of a tool invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub enum AssistantContent {
    /// A streamed text reply.  Yielded once per logical reply; its
    /// accumulator is driven to completion by the provider adapter.
    Text(TextStream),
    /// A streamed tool invocation whose raw JSON arguments are still arriving.
    ToolUseStream(ToolUseStream),
    /// The terminal, parsed form of a tool invocation.
    ToolUse(ToolUse),
    /// A typed structured-output value (when `respond_as` was requested).
    Structured(Value),
}

#[derive(Debug, Clone)]
pub struct AssistantMessage {
    pub content: AssistantContent,
    pub loop_id: Option<LoopId>,
}

#[derive(Debug, Clone)]
pub struct ToolMessage {
    pub tool_use_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub content: ToolResult,
    pub loop_id: Option<LoopId>,
}

/// A single message in a conversation, tagged by role.
#[derive(Debug, Clone)]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
    Assistant(AssistantMessage),
    Tool(ToolMessage),
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System(SystemMessage {
            content: text.into(),
            loop_id: None,
        })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: UserContent::Text(text.into()),
            loop_id: None,
        })
    }

    pub fn user_image(image: Image) -> Self {
        Self::User(UserMessage {
            content: UserContent::Image(image),
            loop_id: None,
        })
    }

    pub fn user_with_content(content: UserContent) -> Self {
        Self::User(UserMessage {
            content,
            loop_id: None,
        })
    }

    /// An assistant text message whose stream is already complete.
    /// Used when seeding conversation history.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            content: AssistantContent::Text(TextStream::completed(text)),
            loop_id: None,
        })
    }

    pub fn assistant_tool_use(tool_use: ToolUse) -> Self {
        Self::Assistant(AssistantMessage {
            content: AssistantContent::ToolUse(tool_use),
            loop_id: None,
        })
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        content: Value,
    ) -> Self {
        Self::Tool(ToolMessage {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            arguments,
            content: ToolResult::Value(content),
            loop_id: None,
        })
    }

    pub fn tool_error(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        error: ExecutionError,
    ) -> Self {
        Self::Tool(ToolMessage {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            arguments,
            content: ToolResult::Error(error),
            loop_id: None,
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System(_) => Role::System,
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
            Self::Tool(_) => Role::Tool,
        }
    }

    pub fn loop_id(&self) -> Option<&str> {
        match self {
            Self::System(m) => m.loop_id.as_deref(),
            Self::User(m) => m.loop_id.as_deref(),
            Self::Assistant(m) => m.loop_id.as_deref(),
            Self::Tool(m) => m.loop_id.as_deref(),
        }
    }

    pub fn set_loop_id(&mut self, loop_id: &str) {
        let slot = match self {
            Self::System(m) => &mut m.loop_id,
            Self::User(m) => &mut m.loop_id,
            Self::Assistant(m) => &mut m.loop_id,
            Self::Tool(m) => &mut m.loop_id,
        };
        *slot = Some(loop_id.to_string());
    }

    pub fn with_loop_id(mut self, loop_id: &str) -> Self {
        self.set_loop_id(loop_id);
        self
    }

    /// Whether this message is in its terminal form.  Stream-bearing
    /// assistant messages become complete once their accumulator does.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => ts.is_complete(),
                AssistantContent::ToolUseStream(tus) => tus.is_complete(),
                AssistantContent::ToolUse(_) | AssistantContent::Structured(_) => true,
            },
            _ => true,
        }
    }

    /// A stable identifier derived from content, used by the event bus for
    /// dedup.  Stream-bearing messages key on their stream identity so the
    /// id does not change as tokens arrive.
    pub fn id(&self) -> String {
        match self {
            Self::System(m) => digest(&["system", &m.content]),
            Self::User(m) => {
                let body = serde_json::to_string(&m.content).unwrap_or_default();
                digest(&["user", &body])
            }
            Self::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => ts.stream_id.clone(),
                AssistantContent::ToolUseStream(tus) => format!("{}:stream", tus.tool_use_id),
                AssistantContent::ToolUse(tu) => tu.tool_use_id.clone(),
                AssistantContent::Structured(v) => digest(&["structured", &v.to_string()]),
            },
            Self::Tool(t) => format!("{}:result", t.tool_use_id),
        }
    }

    /// Snapshot of this message's text content, if it has one.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::System(m) => Some(m.content.clone()),
            Self::User(m) => m.content.as_text().map(str::to_string),
            Self::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => Some(ts.get()),
                _ => None,
            },
            Self::Tool(_) => None,
        }
    }

    /// The JSON representation used for provider calls.  Streamed content is
    /// materialized by awaiting the accumulator to completion.
    pub async fn to_wire(&self) -> Value {
        match self {
            Self::System(m) => json!({ "role": "system", "content": m.content }),
            Self::User(m) => json!({ "role": "user", "content": m.content }),
            Self::Assistant(a) => match &a.content {
                AssistantContent::Text(ts) => {
                    json!({ "role": "assistant", "content": ts.await_complete().await })
                }
                AssistantContent::Structured(v) => {
                    json!({ "role": "assistant", "content": v })
                }
                AssistantContent::ToolUse(tu) => {
                    json!({ "role": "assistant", "tool_use": tu })
                }
                AssistantContent::ToolUseStream(tus) => {
                    let args: Value = tus.await_json().await.unwrap_or_else(|_| json!({}));
                    json!({
                        "role": "assistant",
                        "tool_use": {
                            "tool_use_id": tus.tool_use_id,
                            "name": tus.name,
                            "arguments": args,
                        }
                    })
                }
            },
            Self::Tool(t) => json!({
                "role": "tool",
                "tool_use_id": t.tool_use_id,
                "tool_name": t.tool_name,
                "arguments": t.arguments,
                "content": t.content,
            }),
        }
    }

    /// Reconstruct a message from its wire representation.  Stream ids are
    /// freshly minted; for completed streams the content round-trips.
    pub fn from_wire(v: &Value) -> anyhow::Result<Self> {
        let role = v["role"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("message without role: {v}"))?;
        match role {
            "system" => Ok(Self::system(v["content"].as_str().unwrap_or_default())),
            "user" => {
                let content: UserContent = serde_json::from_value(v["content"].clone())?;
                Ok(Self::user_with_content(content))
            }
            "assistant" => {
                if let Some(tu) = v.get("tool_use") {
                    let tool_use: ToolUse = serde_json::from_value(tu.clone())?;
                    Ok(Self::assistant_tool_use(tool_use))
                } else if let Some(text) = v["content"].as_str() {
                    Ok(Self::assistant_text(text))
                } else {
                    Ok(Self::Assistant(AssistantMessage {
                        content: AssistantContent::Structured(v["content"].clone()),
                        loop_id: None,
                    }))
                }
            }
            "tool" => {
                let content: ToolResult = serde_json::from_value(v["content"].clone())?;
                Ok(Self::Tool(ToolMessage {
                    tool_use_id: v["tool_use_id"].as_str().unwrap_or_default().to_string(),
                    tool_name: v["tool_name"].as_str().unwrap_or_default().to_string(),
                    arguments: v["arguments"].clone(),
                    content,
                    loop_id: None,
                }))
            }
            other => anyhow::bail!("unknown message role: {other}"),
        }
    }
}

/// Short content digest for stable message ids.
pub(crate) fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    let out = hasher.finalize();
    hex::encode(&out[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role(), Role::User);
        assert_eq!(m.as_text().as_deref(), Some("hello"));
    }

    #[test]
    fn message_ids_are_stable_and_content_derived() {
        let a = Message::user("same");
        let b = Message::user("same");
        let c = Message::user("different");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn loop_id_stamping() {
        let mut m = Message::user("x");
        assert!(m.loop_id().is_none());
        m.set_loop_id("loop-1");
        assert_eq!(m.loop_id(), Some("loop-1"));
    }

    #[test]
    fn tool_use_id_is_message_id() {
        let m = Message::assistant_tool_use(ToolUse {
            tool_use_id: "tc-9".into(),
            name: "add".into(),
            arguments: json!({"a": 1}),
        });
        assert_eq!(m.id(), "tc-9");
    }

    #[test]
    fn tool_result_wire_string_for_errors_names_the_exception() {
        let r = ToolResult::Error(ExecutionError::new("ValueError", "bad input"));
        let s = r.to_wire_string();
        assert!(s.contains("ValueError"));
        assert!(s.contains("bad input"));
    }

    #[test]
    fn execution_error_defaults() {
        let e = ExecutionError::new("IoError", "disk on fire");
        assert!(e.should_tell_user);
        assert_eq!(e.should_retry, Retry::Maybe);
        let e = e.retry(Retry::No).silent();
        assert_eq!(e.should_retry, Retry::No);
        assert!(!e.should_tell_user);
    }

    #[tokio::test]
    async fn completed_text_message_round_trips_through_wire_format() {
        let m = Message::assistant_text("final reply");
        let wire = m.to_wire().await;
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.role(), Role::Assistant);
        assert_eq!(back.as_text().as_deref(), Some("final reply"));
    }

    #[tokio::test]
    async fn tool_messages_round_trip_through_wire_format() {
        let m = Message::tool_result("tc-1", "add", json!({"a": 2, "b": 3}), json!(5));
        let wire = m.to_wire().await;
        let back = Message::from_wire(&wire).unwrap();
        match back {
            Message::Tool(t) => {
                assert_eq!(t.tool_use_id, "tc-1");
                assert_eq!(t.tool_name, "add");
                assert_eq!(t.content, ToolResult::Value(json!(5)));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_image_round_trips_through_wire_format() {
        let m = Message::user_image(Image::Url {
            url: "https://example.com/cat.png".into(),
        });
        let wire = m.to_wire().await;
        let back = Message::from_wire(&wire).unwrap();
        match back {
            Message::User(u) => assert_eq!(
                u.content,
                UserContent::Image(Image::Url {
                    url: "https://example.com/cat.png".into()
                })
            ),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn streamed_message_completeness_follows_accumulator() {
        let ts = TextStream::new();
        let m = Message::Assistant(AssistantMessage {
            content: AssistantContent::Text(ts.clone()),
            loop_id: None,
        });
        assert!(!m.is_complete());
        ts.complete();
        assert!(m.is_complete());
    }
}
