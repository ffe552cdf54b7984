//! Anthropic provider (Messages API).

use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::shared::{self, ProviderRequest, Role, StreamEvent};
use crate::providers::ProviderAdapter;
use crate::resolver::ResolvedParams;

const API_VERSION: &str = "2023-06-01";

/// Anthropic adapter.
pub struct AnthropicAdapter {
    endpoint: String,
    default_model: String,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            default_model: config.default_model.clone(),
        }
    }

    fn headers(api_key: &str) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| GatewayError::setup("API key contains invalid header characters"))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        // Required for calls made from inside a browser extension.
        headers.insert(
            "anthropic-dangerous-direct-browser-access",
            HeaderValue::from_static("true"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(shared::USER_AGENT));
        Ok(headers)
    }

    fn text_message(role: &str, text: &str) -> Value {
        json!({"role": role, "content": [{"type": "text", "text": text}]})
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn build_request(
        &self,
        prompt: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> GatewayResult<ProviderRequest> {
        let mut messages = Vec::new();
        for msg in &params.conversation_history {
            match msg.role {
                Role::User | Role::Assistant => {
                    messages.push(Self::text_message(msg.role.as_str(), &msg.content));
                }
                // System instructions are a top-level field in this protocol.
                Role::System => warn!("Skipping system-role history entry for Anthropic"),
            }
        }
        messages.push(Self::text_message("user", prompt));

        let mut body = Map::new();
        body.insert("model".to_string(), json!(params.model));
        body.insert(params.token_parameter.clone(), json!(params.max_tokens));
        body.insert("stream".to_string(), json!(true));
        body.insert("messages".to_string(), json!(messages));
        if let Some(temperature) = params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = params.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(system) = &params.system_prompt {
            body.insert("system".to_string(), json!(system));
        }

        let mut headers = Self::headers(api_key)?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        Ok(ProviderRequest {
            url: self.endpoint.clone(),
            method: Method::POST,
            headers,
            body: Value::Object(body),
        })
    }

    fn build_validation_request(&self, api_key: &str) -> GatewayResult<ProviderRequest> {
        Ok(ProviderRequest {
            url: self.endpoint.clone(),
            method: Method::POST,
            headers: Self::headers(api_key)?,
            body: json!({
                "model": self.default_model,
                "max_tokens": 1,
                "messages": [Self::text_message("user", "Hi")],
            }),
        })
    }

    fn parse_line(&mut self, line: &str) -> StreamEvent {
        if let Some(event_name) = line.strip_prefix("event: ") {
            return if event_name == "message_stop" {
                StreamEvent::Done
            } else {
                StreamEvent::Ignore
            };
        }

        let Some(payload) = line.strip_prefix("data: ") else {
            return StreamEvent::Ignore;
        };

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                return StreamEvent::Error {
                    message: format!("Error parsing stream data: {err}"),
                };
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let is_text_delta =
                    value.pointer("/delta/type").and_then(Value::as_str) == Some("text_delta");
                match value.pointer("/delta/text").and_then(Value::as_str) {
                    Some(text) if is_text_delta => StreamEvent::Content {
                        text: text.to_string(),
                    },
                    _ => StreamEvent::Ignore,
                }
            }
            Some("error") => {
                let error_type = value
                    .pointer("/error/type")
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                StreamEvent::Error {
                    message: format!("Stream error: {error_type} - {message}"),
                }
            }
            _ => StreamEvent::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Catalog, ParameterStyle};
    use crate::providers::ProviderId;
    use crate::providers::shared::ChatMessage;

    use super::*;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(Catalog::global().provider(ProviderId::Anthropic).unwrap())
    }

    fn params_with_history() -> ResolvedParams {
        ResolvedParams {
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 8192,
            token_parameter: "max_tokens".to_string(),
            parameter_style: ParameterStyle::Standard,
            context_window: 200_000,
            temperature: Some(0.7),
            top_p: None,
            system_prompt: Some("Be terse.".to_string()),
            model_supports_system_prompt: true,
            conversation_history: vec![ChatMessage::user("Q1"), ChatMessage::assistant("A1")],
        }
    }

    #[test]
    fn test_request_carries_provider_headers() {
        let request = adapter()
            .build_request("Q2", &params_with_history(), "sk-ant-key")
            .unwrap();

        assert_eq!(request.headers.get("x-api-key").unwrap(), "sk-ant-key");
        assert_eq!(
            request.headers.get("anthropic-version").unwrap(),
            "2023-06-01"
        );
        assert_eq!(
            request
                .headers
                .get("anthropic-dangerous-direct-browser-access")
                .unwrap(),
            "true"
        );
    }

    #[test]
    fn test_system_is_top_level_and_messages_are_blocks() {
        let request = adapter()
            .build_request("Q2", &params_with_history(), "sk-ant-key")
            .unwrap();

        assert_eq!(request.body["system"], serde_json::json!("Be terse."));
        assert_eq!(
            request.body["messages"],
            serde_json::json!([
                {"role": "user", "content": [{"type": "text", "text": "Q1"}]},
                {"role": "assistant", "content": [{"type": "text", "text": "A1"}]},
                {"role": "user", "content": [{"type": "text", "text": "Q2"}]},
            ])
        );
        assert_eq!(request.body["max_tokens"], serde_json::json!(8192));
        assert_eq!(request.body["stream"], serde_json::json!(true));
    }

    #[test]
    fn test_parse_event_lines() {
        let mut adapter = adapter();
        assert_eq!(adapter.parse_line("event: message_stop"), StreamEvent::Done);
        assert_eq!(
            adapter.parse_line("event: content_block_start"),
            StreamEvent::Ignore
        );
        assert_eq!(adapter.parse_line("event: ping"), StreamEvent::Ignore);
    }

    #[test]
    fn test_parse_text_delta() {
        let mut adapter = adapter();
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(
            adapter.parse_line(line),
            StreamEvent::Content {
                text: "Hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_ignores_non_text_deltas_and_other_data() {
        let mut adapter = adapter();
        assert_eq!(
            adapter.parse_line(
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#
            ),
            StreamEvent::Ignore
        );
        assert_eq!(
            adapter.parse_line(r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#),
            StreamEvent::Ignore
        );
    }

    #[test]
    fn test_parse_error_event() {
        let mut adapter = adapter();
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(
            adapter.parse_line(line),
            StreamEvent::Error {
                message: "Stream error: overloaded_error - Overloaded".to_string()
            }
        );
    }
}
