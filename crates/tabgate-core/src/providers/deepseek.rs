//! DeepSeek provider (OpenAI-compatible Chat Completions).
//!
//! The DeepSeek API rejects two consecutive messages with the same role, so
//! history is assembled under strict user/assistant alternation: same-role
//! neighbours merge with a blank line, and the current prompt merges into a
//! trailing user message.

use crate::config::ProviderConfig;
use crate::error::GatewayResult;
use crate::providers::openai_compat::{ChatCompletionsAdapter, HistoryMode, parse_line};
use crate::providers::{ProviderAdapter, ProviderRequest, StreamEvent};
use crate::resolver::ResolvedParams;

/// DeepSeek adapter.
pub struct DeepSeekAdapter {
    inner: ChatCompletionsAdapter,
}

impl DeepSeekAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            inner: ChatCompletionsAdapter::new(config, HistoryMode::MergeAlternating),
        }
    }
}

impl ProviderAdapter for DeepSeekAdapter {
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
