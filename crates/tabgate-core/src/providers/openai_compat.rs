//! OpenAI-compatible Chat Completions adapter.
//!
//! Four of the six providers (OpenAI, xAI Grok, Mistral, DeepSeek) speak this
//! protocol; the per-provider modules are thin wrappers over this adapter.

use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use crate::config::{ParameterStyle, ProviderConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::providers::shared::{self, ChatMessage, ProviderRequest, Role, StreamEvent};
use crate::resolver::ResolvedParams;

/// How conversation history maps onto the `messages` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HistoryMode {
    /// Roles pass through unchanged.
    Passthrough,
    /// Strict user/assistant alternation: consecutive same-role entries are
    /// merged with a blank line and non-chat roles are dropped (DeepSeek).
    MergeAlternating,
}

/// Shared adapter for providers speaking the Chat Completions protocol.
pub(crate) struct ChatCompletionsAdapter {
    endpoint: String,
    default_model: String,
    history_mode: HistoryMode,
}

impl ChatCompletionsAdapter {
    pub(crate) fn new(config: &ProviderConfig, history_mode: HistoryMode) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            default_model: config.default_model.clone(),
            history_mode,
        }
    }

    pub(crate) fn build_request(
        &self,
        prompt: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> GatewayResult<ProviderRequest> {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(params.model));
        body.insert("stream".to_string(), json!(true));
        body.insert("messages".to_string(), json!(self.build_messages(params, prompt)));
        body.insert(params.token_parameter.clone(), json!(params.max_tokens));

        // Reasoning models take no sampling parameters.
        if params.parameter_style == ParameterStyle::Standard {
            if let Some(temperature) = params.temperature {
                body.insert("temperature".to_string(), json!(temperature));
            }
            if let Some(top_p) = params.top_p {
                body.insert("top_p".to_string(), json!(top_p));
            }
        }

        let mut headers = bearer_headers(api_key)?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        Ok(ProviderRequest {
            url: self.endpoint.clone(),
            method: Method::POST,
            headers,
            body: Value::Object(body),
        })
    }

    pub(crate) fn build_validation_request(&self, api_key: &str) -> GatewayResult<ProviderRequest> {
        Ok(ProviderRequest {
            url: self.endpoint.clone(),
            method: Method::POST,
            headers: bearer_headers(api_key)?,
            body: json!({
                "model": self.default_model,
                "messages": [{"role": "user", "content": "Hi"}],
                "max_tokens": 1,
            }),
        })
    }

    fn build_messages(&self, params: &ResolvedParams, prompt: &str) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &params.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }

        match self.history_mode {
            HistoryMode::Passthrough => {
                for msg in &params.conversation_history {
                    messages.push(json!({"role": msg.role.as_str(), "content": msg.content}));
                }
                messages.push(json!({"role": "user", "content": prompt}));
            }
            HistoryMode::MergeAlternating => {
                append_alternating(&mut messages, &params.conversation_history, prompt);
            }
        }

        messages
    }
}

/// Parses one Chat Completions SSE line.
pub(crate) fn parse_line(line: &str) -> StreamEvent {
    if line == "data: [DONE]" {
        return StreamEvent::Done;
    }
    let Some(payload) = line.strip_prefix("data: ") else {
        return StreamEvent::Ignore;
    };

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => StreamEvent::Content {
                text: text.to_string(),
            },
            // Empty deltas, role markers, finish_reason-only chunks.
            _ => StreamEvent::Ignore,
        },
        Err(err) => StreamEvent::Error {
            message: format!("Error parsing stream data: {err}"),
        },
    }
}

fn bearer_headers(api_key: &str) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| GatewayError::setup("API key contains invalid header characters"))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(shared::USER_AGENT));
    Ok(headers)
}

/// Appends history plus the current prompt under strict role alternation.
///
/// Consecutive same-role entries are joined with a blank line; the current
/// prompt merges into a trailing user message the same way.
fn append_alternating(messages: &mut Vec<Value>, history: &[ChatMessage], prompt: &str) {
    for msg in history {
        match msg.role {
            Role::User | Role::Assistant => push_or_merge(messages, msg.role.as_str(), &msg.content),
            Role::System => {
                warn!("Skipping non-chat history role for strict-alternation provider");
            }
        }
    }
    push_or_merge(messages, "user", prompt);

    debug_assert!(
        is_alternating(messages),
        "merged history still has adjacent same-role messages"
    );
    if !is_alternating(messages) {
        error!("Consecutive same-role messages survived history merge");
    }
}

fn push_or_merge(messages: &mut Vec<Value>, role: &str, content: &str) {
    if let Some(last) = messages.last_mut()
        && last.get("role").and_then(Value::as_str) == Some(role)
    {
        let previous = last.get("content").and_then(Value::as_str).unwrap_or_default();
        last["content"] = Value::String(format!("{previous}\n\n{content}"));
        return;
    }
    messages.push(json!({"role": role, "content": content}));
}

fn is_alternating(messages: &[Value]) -> bool {
    messages
        .windows(2)
        .all(|pair| pair[0].get("role") != pair[1].get("role"))
}
