//! Static provider catalog.
//!
//! The catalog document ships embedded in the crate and is parsed once on
//! first use. Embedders may supply their own document (endpoint overrides,
//! trimmed model lists) through [`Catalog::from_toml`]; the schema is the
//! same either way.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::providers::ProviderId;

/// Embedded default catalog document.
const DEFAULT_CATALOG: &str = include_str!("providers.toml");

/// Whether a model takes the standard sampling parameters or the reasoning
/// variant (no temperature/top_p, completion-token cap).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterStyle {
    #[default]
    Standard,
    Reasoning,
}

/// Per-model wire metadata and capability flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "snake_case"))]
pub struct ModelDescriptor {
    /// Stable wire identifier
    pub id: String,
    pub display_name: String,
    /// Default output token cap
    pub max_tokens: u32,
    pub context_window: u32,
    /// Provider-specific name of the token-cap field
    #[serde(default = "default_token_parameter")]
    pub token_parameter: String,
    #[serde(default)]
    pub parameter_style: ParameterStyle,
    #[serde(default = "default_true")]
    pub supports_temperature: bool,
    #[serde(default)]
    pub supports_top_p: bool,
    #[serde(default = "default_true")]
    pub supports_system_prompt: bool,
    /// Sampling defaults applied when the user has not stored a value
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_top_p")]
    pub default_top_p: f64,
}

fn default_token_parameter() -> String {
    "max_tokens".to_string()
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.95
}

/// One provider's API surface: endpoint, default model, and model list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub display_name: String,
    pub endpoint: String,
    pub default_model: String,
    pub models: Vec<ModelDescriptor>,
}

impl ProviderConfig {
    /// Looks up a model descriptor by wire id.
    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

/// The full provider catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    providers: BTreeMap<String, ProviderConfig>,
}

static GLOBAL: OnceLock<Catalog> = OnceLock::new();

impl Catalog {
    /// Returns the embedded catalog, parsed on first use.
    pub fn global() -> &'static Catalog {
        GLOBAL.get_or_init(|| {
            Catalog::from_toml(DEFAULT_CATALOG).expect("embedded provider catalog is valid")
        })
    }

    /// Parses a catalog document.
    ///
    /// # Errors
    /// Returns an error if the document is not valid TOML, omits a known
    /// provider section, or carries an invalid endpoint URL.
    pub fn from_toml(doc: &str) -> Result<Self> {
        let catalog: Catalog =
            toml::from_str(doc).context("Failed to parse provider catalog")?;
        for id in ProviderId::all() {
            let config = catalog
                .providers
                .get(id.id())
                .with_context(|| format!("Catalog is missing provider section: {}", id.id()))?;
            url::Url::parse(&config.endpoint)
                .with_context(|| format!("Invalid endpoint for {}: {}", id.id(), config.endpoint))?;
        }
        Ok(catalog)
    }

    /// Returns the config for a provider.
    ///
    /// # Errors
    /// Returns a setup error if the provider has no catalog entry.
    pub fn provider(&self, id: ProviderId) -> GatewayResult<&ProviderConfig> {
        self.providers.get(id.id()).ok_or_else(|| {
            GatewayError::new(
                ErrorKind::Setup,
                format!("No API configuration for provider: {}", id.id()),
            )
        })
    }

    /// Returns the descriptor for a model of a provider.
    ///
    /// # Errors
    /// Returns a setup error if the provider or model is unknown.
    pub fn model(&self, id: ProviderId, model_id: &str) -> GatewayResult<&ModelDescriptor> {
        self.provider(id)?.model(model_id).ok_or_else(|| {
            GatewayError::new(
                ErrorKind::Setup,
                format!("Unknown model for {}: {model_id}", id.id()),
            )
        })
    }
}
