//! Effective parameter resolution for one turn.
//!
//! User-stored settings layer over catalog defaults with capability gates:
//! per-model user settings win over platform-level user settings, which win
//! over the model descriptor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Catalog, ParameterStyle};
use crate::error::GatewayResult;
use crate::providers::ProviderId;
use crate::providers::shared::ChatMessage;
use crate::storage::{KeyValueStore, keys};

/// Where a turn originates; scopes model-preference lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    Popup,
    Sidebar,
}

/// User-stored sampling settings for one model, or the platform defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoredSettings {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub system_prompt: Option<String>,
    pub include_temperature: Option<bool>,
    pub include_top_p: Option<bool>,
    /// Platform-level system-prompt support override
    pub has_system_prompt: Option<bool>,
}

/// Stored parameter overrides for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub defaults: StoredSettings,
    pub models: BTreeMap<String, StoredSettings>,
}

/// The full effective parameter set handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub model: String,
    pub max_tokens: u32,
    pub token_parameter: String,
    pub parameter_style: ParameterStyle,
    pub context_window: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub system_prompt: Option<String>,
    /// Effective system-prompt support (platform gate AND descriptor gate)
    pub model_supports_system_prompt: bool,
    pub conversation_history: Vec<ChatMessage>,
}

fn load_provider_settings(store: &dyn KeyValueStore, provider: ProviderId) -> ProviderSettings {
    store
        .read(keys::MODEL_PARAMS)
        .and_then(|value| value.get(provider.id()).cloned())
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

/// Computes the effective parameters for `(provider, model)`.
///
/// # Errors
/// Returns a setup error if the provider or model has no catalog entry.
pub fn resolve_params(
    catalog: &Catalog,
    store: &dyn KeyValueStore,
    provider: ProviderId,
    model_id: &str,
    conversation_history: Vec<ChatMessage>,
) -> GatewayResult<ResolvedParams> {
    let descriptor = catalog.model(provider, model_id)?;
    let settings = load_provider_settings(store, provider);
    let model_settings = settings.models.get(model_id).cloned().unwrap_or_default();
    let platform = settings.defaults;

    let max_tokens = model_settings
        .max_tokens
        .or(platform.max_tokens)
        .unwrap_or(descriptor.max_tokens);

    let include_temperature = model_settings
        .include_temperature
        .or(platform.include_temperature)
        .unwrap_or(true);
    let temperature = (descriptor.supports_temperature && include_temperature).then(|| {
        model_settings
            .temperature
            .or(platform.temperature)
            .unwrap_or(descriptor.default_temperature)
    });

    let include_top_p = model_settings
        .include_top_p
        .or(platform.include_top_p)
        .unwrap_or(false);
    let top_p = (descriptor.supports_top_p && include_top_p).then(|| {
        model_settings
            .top_p
            .or(platform.top_p)
            .unwrap_or(descriptor.default_top_p)
    });

    let effective_system_support =
        platform.has_system_prompt != Some(false) && descriptor.supports_system_prompt;
    let user_system_prompt = model_settings
        .system_prompt
        .or(platform.system_prompt)
        .filter(|prompt| !prompt.trim().is_empty());
    let system_prompt = match user_system_prompt {
        Some(prompt) if effective_system_support => Some(prompt),
        Some(_) => {
            warn!(
                provider = provider.id(),
                model = model_id,
                "Dropping system prompt: model or platform does not support it"
            );
            None
        }
        None => None,
    };

    Ok(ResolvedParams {
        model: descriptor.id.clone(),
        max_tokens,
        token_parameter: descriptor.token_parameter.clone(),
        parameter_style: descriptor.parameter_style,
        context_window: descriptor.context_window,
        temperature,
        top_p,
        system_prompt,
        model_supports_system_prompt: effective_system_support,
        conversation_history,
    })
}

/// Resolves which model a turn should use.
///
/// Explicit requests win; otherwise the tab-scoped preference, then (for the
/// sidebar) the global sidebar preference, then the catalog default.
///
/// # Errors
/// Returns a setup error if the provider has no catalog entry.
pub fn resolve_model(
    catalog: &Catalog,
    store: &dyn KeyValueStore,
    provider: ProviderId,
    requested: Option<&str>,
    tab_id: Option<i64>,
    source: RequestSource,
) -> GatewayResult<String> {
    if let Some(model) = requested.filter(|model| !model.is_empty()) {
        return Ok(model.to_string());
    }

    if let Some(tab_id) = tab_id
        && let Some(model) = store
            .read(keys::TAB_MODEL_PREFS)
            .as_ref()
            .and_then(|prefs| prefs.get(tab_id.to_string()))
            .and_then(|by_provider| by_provider.get(provider.id()))
            .and_then(serde_json::Value::as_str)
    {
        return Ok(model.to_string());
    }

    if source == RequestSource::Sidebar
        && let Some(model) = store
            .read(keys::SIDEBAR_MODEL_PREF)
            .as_ref()
            .and_then(|prefs| prefs.get(provider.id()))
            .and_then(serde_json::Value::as_str)
    {
        return Ok(model.to_string());
    }

    Ok(catalog.provider(provider)?.default_model.clone())
}
