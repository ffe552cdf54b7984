//! API credential storage and retrieval.
//!
//! Credentials live under one storage key as a `{providerId → credentials}`
//! map. They are read fresh on every call — nothing in the core caches key
//! material — and never logged.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::providers::ProviderId;
use crate::storage::{KeyValueStore, keys};

/// API credentials for one provider.
///
/// Only `apiKey` is meaningful to the core; everything else is carried
/// opaquely for the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            extra: Map::new(),
        }
    }
}

/// Credential store over the persistent key-value contract.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load_map(&self) -> BTreeMap<String, Credentials> {
        self.store
            .read(keys::API_CREDENTIALS)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    fn save_map(&self, map: &BTreeMap<String, Credentials>) -> Result<()> {
        let value = serde_json::to_value(map).context("Failed to serialize credentials")?;
        self.store.write(keys::API_CREDENTIALS, value)
    }

    /// Returns the stored credentials for a provider, if any.
    pub fn get(&self, provider: ProviderId) -> Option<Credentials> {
        self.load_map().remove(provider.id())
    }

    /// Stores credentials for a provider, replacing any previous entry.
    ///
    /// # Errors
    /// Returns an error if the credentials could not be persisted.
    pub fn put(&self, provider: ProviderId, credentials: Credentials) -> Result<()> {
        let mut map = self.load_map();
        map.insert(provider.id().to_string(), credentials);
        self.save_map(&map)
    }

    /// Removes the credentials for a provider. Missing entries are fine.
    ///
    /// # Errors
    /// Returns an error if the removal could not be persisted.
    pub fn delete(&self, provider: ProviderId) -> Result<()> {
        let mut map = self.load_map();
        if map.remove(provider.id()).is_some() {
            self.save_map(&map)?;
        }
        Ok(())
    }

    /// Returns whether credentials exist for a provider.
    pub fn exists(&self, provider: ProviderId) -> bool {
        self.load_map().contains_key(provider.id())
    }

    /// Returns `{providerId → exists}` for a batch of providers without
    /// touching key material.
    pub fn check_multiple(&self, providers: &[ProviderId]) -> BTreeMap<String, bool> {
        let map = self.load_map();
        providers
            .iter()
            .map(|provider| (provider.id().to_string(), map.contains_key(provider.id())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::MemoryStore;

    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_put_get_delete_roundtrip() {
        let creds = store();
        assert!(creds.get(ProviderId::OpenAi).is_none());
        assert!(!creds.exists(ProviderId::OpenAi));

        creds
            .put(ProviderId::OpenAi, Credentials::new("sk-test"))
            .unwrap();
        assert!(creds.exists(ProviderId::OpenAi));
        assert_eq!(creds.get(ProviderId::OpenAi).unwrap().api_key, "sk-test");

        creds.delete(ProviderId::OpenAi).unwrap();
        assert!(creds.get(ProviderId::OpenAi).is_none());
    }

    #[test]
    fn test_extra_fields_roundtrip_opaquely() {
        let creds = store();
        let mut stored = Credentials::new("sk-test");
        stored
            .extra
            .insert("orgId".to_string(), serde_json::json!("org-1"));
        creds.put(ProviderId::Anthropic, stored.clone()).unwrap();
        assert_eq!(creds.get(ProviderId::Anthropic).unwrap(), stored);
    }

    #[test]
    fn test_check_multiple_reports_per_provider() {
        let creds = store();
        creds
            .put(ProviderId::Gemini, Credentials::new("g-key"))
            .unwrap();

        let report = creds.check_multiple(&[ProviderId::Gemini, ProviderId::Grok]);
        assert_eq!(report.get("gemini"), Some(&true));
        assert_eq!(report.get("grok"), Some(&false));
    }
}
