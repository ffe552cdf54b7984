//! Google Gemini provider (Generative Language API).
//!
//! Authentication travels in the URL query, not a header, and the endpoint
//! path is versioned per model: experimental models (wire id containing
//! `-exp-`) live under `v1beta`, everything else under `v1`.

use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::error::GatewayResult;
use crate::providers::shared::{self, ProviderRequest, Role, StreamEvent};
use crate::providers::ProviderAdapter;
use crate::resolver::ResolvedParams;

/// Gemini adapter.
pub struct GeminiAdapter {
    base_url: String,
    default_model: String,
    /// Whether the current stream already logged a finish-reason marker.
    saw_finish_reason: bool,
}

impl GeminiAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.endpoint.clone(),
            default_model: config.default_model.clone(),
            saw_finish_reason: false,
        }
    }

    fn api_version(model: &str) -> &'static str {
        if model.contains("-exp-") { "v1beta" } else { "v1" }
    }

    fn stream_url(&self, model: &str, api_key: &str) -> String {
        format!(
            "{}/{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            Self::api_version(model),
            model,
            api_key
        )
    }

    fn validation_url(&self, model: &str, api_key: &str) -> String {
        format!(
            "{}/{}/models/{}:generateContent?key={}",
            self.base_url,
            Self::api_version(model),
            model,
            api_key
        )
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(shared::USER_AGENT));
        headers
    }

    fn text_content(role: &str, text: &str) -> Value {
        json!({"role": role, "parts": [{"text": text}]})
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn build_request(
        &self,
        prompt: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> GatewayResult<ProviderRequest> {
        let mut contents = Vec::new();
        for msg in &params.conversation_history {
            match msg.role {
                Role::User => contents.push(Self::text_content("user", &msg.content)),
                Role::Assistant => contents.push(Self::text_content("model", &msg.content)),
                Role::System => warn!("Skipping system-role history entry for Gemini"),
            }
        }
        contents.push(Self::text_content("user", prompt));

        let mut generation_config = Map::new();
        generation_config.insert(params.token_parameter.clone(), json!(params.max_tokens));
        if let Some(temperature) = params.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = params.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }

        let mut body = Map::new();
        body.insert("contents".to_string(), json!(contents));
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
        if let Some(system) = &params.system_prompt {
            if params.model_supports_system_prompt {
                body.insert(
                    "systemInstruction".to_string(),
                    json!({"parts": [{"text": system}]}),
                );
            } else {
                warn!(model = %params.model, "Dropping unsupported system instruction");
            }
        }

        let mut headers = Self::headers();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        Ok(ProviderRequest {
            url: self.stream_url(&params.model, api_key),
            method: Method::POST,
            headers,
            body: Value::Object(body),
        })
    }

    fn build_validation_request(&self, api_key: &str) -> GatewayResult<ProviderRequest> {
        Ok(ProviderRequest {
            url: self.validation_url(&self.default_model, api_key),
            method: Method::POST,
            headers: Self::headers(),
            body: json!({
                "contents": [Self::text_content("user", "Hi")],
                "generationConfig": {"maxOutputTokens": 1},
            }),
        })
    }

    fn parse_line(&mut self, line: &str) -> StreamEvent {
        if line == "data: [DONE]" {
            return StreamEvent::Done;
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

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return StreamEvent::Error { message };
        }

        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            let mut texts: Vec<String> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if texts.len() > 1 {
                return StreamEvent::ContentMulti { texts };
            }
            if let Some(text) = texts.pop() {
                return StreamEvent::Content { text };
            }
        }

        if value.pointer("/candidates/0/finishReason").is_some() {
            if !self.saw_finish_reason {
                self.saw_finish_reason = true;
                info!("Gemini stream reported a finish reason");
            }
            return StreamEvent::Ignore;
        }

        StreamEvent::Ignore
    }

    fn reset_stream_state(&mut self) {
        self.saw_finish_reason = false;
    }
}
