//! The conversational backend boundary. A vendor adapter implements
//! [`ChatBackend`]; everything above it (gateway, session, pipeline) only sees
//! this trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cost::CostExceeded;
use crate::ids::ChatId;
use crate::tools::Tool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Token counters attached to a single model reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
}

/// One message in a conversation buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub content_raw: Option<Value>,
    pub usage: TokenUsage,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            content_raw: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            content_raw: None,
            usage: TokenUsage::default(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend error: {0}")]
    Transport(String),

    #[error(transparent)]
    Aborted(#[from] CostExceeded),
}

pub type MessageObserver = Arc<dyn Fn(&ChatMessage)>;
pub type ToolCallObserver = Arc<dyn Fn(&str, &Value)>;
/// Runs after an assistant message completes. An `Err` aborts the exchange;
/// the spend gate is the one hook that uses this, and it needs to await the
/// cost oracle.
pub type EndMessageHook =
    Arc<dyn Fn(ChatMessage) -> futures::future::LocalBoxFuture<'static, Result<(), BackendError>>>;

/// A conversation buffer over some LLM transport. `ask` appends a user
/// message, obtains one assistant reply (running any tool loop internally),
/// fires the observers, and returns the reply.
#[async_trait(?Send)]
pub trait ChatBackend {
    fn id(&self) -> ChatId;

    async fn ask(&self, prompt: &str) -> Result<ChatMessage, BackendError>;

    fn with_tools(&self, tools: Vec<Arc<dyn Tool>>);

    fn messages(&self) -> Vec<ChatMessage>;

    fn on_new_message(&self, observer: MessageObserver);
    fn on_end_message(&self, hook: EndMessageHook);
    fn on_tool_call(&self, observer: ToolCallObserver);
    fn on_tool_result(&self, observer: ToolCallObserver);
}
