//! Wire-protocol adapters for the supported providers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Catalog;
use crate::error::GatewayResult;
use crate::resolver::ResolvedParams;

pub mod anthropic;
pub mod deepseek;
pub mod gemini;
pub mod grok;
pub mod mistral;
pub mod openai;
pub(crate) mod openai_compat;
pub mod shared;

pub use shared::{ChatMessage, ProviderRequest, Role, StreamEvent, compose_structured_prompt};

/// Closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Gemini,
    Mistral,
    DeepSeek,
    Grok,
}

impl ProviderId {
    /// Returns all provider ids.
    pub fn all() -> &'static [ProviderId] {
        &[
            ProviderId::OpenAi,
            ProviderId::Anthropic,
            ProviderId::Gemini,
            ProviderId::Mistral,
            ProviderId::DeepSeek,
            ProviderId::Grok,
        ]
    }

    /// Returns the string identifier used in config and storage.
    pub fn id(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Mistral => "mistral",
            ProviderId::DeepSeek => "deepseek",
            ProviderId::Grok => "grok",
        }
    }

    /// Returns the human-readable label for display.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::Gemini => "Google Gemini",
            ProviderId::Mistral => "Mistral",
            ProviderId::DeepSeek => "DeepSeek",
            ProviderId::Grok => "xAI Grok",
        }
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "gemini" => Ok(ProviderId::Gemini),
            "mistral" => Ok(ProviderId::Mistral),
            "deepseek" => Ok(ProviderId::DeepSeek),
            "grok" => Ok(ProviderId::Grok),
            other => Err(format!("Unknown provider: {other}")),
        }
    }
}

/// Uniform request/parse/validate contract, implemented once per protocol.
///
/// Adapters are pure over their inputs except for per-stream parser state,
/// which [`ProviderAdapter::reset_stream_state`] clears before each response
/// body is read. One adapter instance serves one turn.
pub trait ProviderAdapter: Send {
    /// Builds the streaming HTTP request for one turn.
    ///
    /// # Errors
    /// Returns a setup error if the request cannot be constructed.
    fn build_request(
        &self,
        prompt: &str,
        params: &ResolvedParams,
        api_key: &str,
    ) -> GatewayResult<ProviderRequest>;

    /// Builds the minimal legal request used by the credential probe.
    ///
    /// # Errors
    /// Returns a setup error if the request cannot be constructed.
    fn build_validation_request(&self, api_key: &str) -> GatewayResult<ProviderRequest>;

    /// Parses one already-trimmed stream line into a typed event.
    fn parse_line(&mut self, line: &str) -> StreamEvent;

    /// Clears per-stream parser state before a new response body is read.
    fn reset_stream_state(&mut self) {}
}

/// Constructs the adapter for a provider from its catalog entry.
///
/// # Errors
/// Returns a setup error if the provider has no catalog entry.
pub fn adapter_for(
    provider: ProviderId,
    catalog: &Catalog,
) -> GatewayResult<Box<dyn ProviderAdapter>> {
    let config = catalog.provider(provider)?;
    Ok(match provider {
        ProviderId::OpenAi => Box::new(openai::OpenAiAdapter::new(config)),
        ProviderId::Anthropic => Box::new(anthropic::AnthropicAdapter::new(config)),
        ProviderId::Gemini => Box::new(gemini::GeminiAdapter::new(config)),
        ProviderId::Mistral => Box::new(mistral::MistralAdapter::new(config)),
        ProviderId::DeepSeek => Box::new(deepseek::DeepSeekAdapter::new(config)),
        ProviderId::Grok => Box::new(grok::GrokAdapter::new(config)),
    })
}
