//! Provider-agnostic types shared across the wire adapters.

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for tabgate API requests.
pub const USER_AGENT: &str = concat!("tabgate/", env!("CARGO_PKG_VERSION"));

/// Role of a conversation history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A chat message with owned data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Typed result of parsing one framed stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text for the current message
    Content { text: String },
    /// Batch of texts parsed from a single line (Gemini multi-part candidates)
    ContentMulti { texts: Vec<String> },
    /// Provider signalled end of message; trailing bytes may still follow
    Done,
    /// Recognised but not useful (pings, role markers, finish-reason markers)
    Ignore,
    /// In-band error event from the provider
    Error { message: String },
}

/// HTTP request built by an adapter for one call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Composes the prompt sent to the model for a turn that carries page context.
///
/// With non-empty extracted content the instruction and content are framed
/// under their own headings; otherwise the prompt passes through verbatim.
pub fn compose_structured_prompt(prompt: &str, formatted_content: Option<&str>) -> String {
    match formatted_content {
        Some(content) if !content.is_empty() => {
            format!("# INSTRUCTION\n{prompt}\n# EXTRACTED CONTENT\n{content}")
        }
        _ => prompt.to_string(),
    }
}
