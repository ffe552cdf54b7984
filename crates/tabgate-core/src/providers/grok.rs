//! xAI Grok provider (OpenAI-compatible Chat Completions).

use crate::config::ProviderConfig;
use crate::error::GatewayResult;
use crate::providers::openai_compat::{ChatCompletionsAdapter, HistoryMode, parse_line};
use crate::providers::{ProviderAdapter, ProviderRequest, StreamEvent};
use crate::resolver::ResolvedParams;

/// Grok adapter.
pub struct GrokAdapter {
    inner: ChatCompletionsAdapter,
}

impl GrokAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            inner: ChatCompletionsAdapter::new(config, HistoryMode::Passthrough),
        }
    }
}

impl ProviderAdapter for GrokAdapter {
    fn build_request(
        &self,
        prompt: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> GatewayResult<ProviderRequest> {
        self.inner.build_request(prompt, params, api_key)
    }

    fn build_validation_request(&self, api_key: &str) -> GatewayResult<ProviderRequest> {
        self.inner.build_validation_request(api_key)
    }

    fn parse_line(&mut self, line: &str) -> StreamEvent {
        parse_line(line)
    }
}
