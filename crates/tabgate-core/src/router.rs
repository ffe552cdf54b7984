//! Inbound action dispatch.
//!
//! The router is the embedding surface for the extension shell: every
//! inbound action gets a `{success, ...}` reply envelope and no error ever
//! crosses the boundary as anything but a message string.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::Catalog;
use crate::coordinator::{StreamChunk, StreamCoordinator, TurnRequest};
use crate::credentials::{CredentialStore, Credentials};
use crate::providers::{ChatMessage, ProviderId};
use crate::resolver::RequestSource;
use crate::storage::KeyValueStore;

const CANCEL_NOT_FOUND: &str = "Stream not found or already completed/cancelled";

/// Credential operations the shell can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialOp {
    Get,
    Store,
    Remove,
    Validate,
    CheckMultiple,
}

/// Inbound actions, in the shell's message envelope shape.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    #[serde(rename_all = "camelCase")]
    ProcessContentViaApi {
        provider_id: ProviderId,
        #[serde(default)]
        model_id: Option<String>,
        #[serde(default)]
        tab_id: Option<i64>,
        source: RequestSource,
        custom_prompt: String,
        /// Page URL; carried for the shell, unused by the core
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        conversation_history: Vec<ChatMessage>,
        #[serde(default)]
        formatted_content: Option<String>,
        /// Extraction is the shell's concern; accepted and ignored here
        #[serde(default)]
        skip_initial_extraction: bool,
    },
    #[serde(rename_all = "camelCase")]
    CancelStream { stream_id: String },
    #[serde(rename_all = "camelCase")]
    GetApiModels { provider_id: ProviderId },
    #[serde(rename_all = "camelCase")]
    CredentialOperation {
        operation: CredentialOp,
        #[serde(default)]
        provider_id: Option<ProviderId>,
        #[serde(default)]
        credentials: Option<Credentials>,
        #[serde(default)]
        provider_ids: Option<Vec<ProviderId>>,
    },
}

/// Dispatches inbound actions to the gateway components.
pub struct RequestRouter {
    coordinator: Arc<StreamCoordinator>,
    credentials: CredentialStore,
    catalog: Arc<Catalog>,
}

impl RequestRouter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_catalog(Arc::new(Catalog::global().clone()), store)
    }

    pub fn with_catalog(catalog: Arc<Catalog>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            coordinator: Arc::new(StreamCoordinator::with_catalog(
                Arc::clone(&catalog),
                Arc::clone(&store),
            )),
            credentials: CredentialStore::new(store),
            catalog,
        }
    }

    /// Returns the stream coordinator (for ready-event subscriptions).
    pub fn coordinator(&self) -> &Arc<StreamCoordinator> {
        &self.coordinator
    }

    /// Dispatches one inbound action and returns its reply envelope.
    ///
    /// `chunks` receives the streaming callbacks of `processContentViaApi`;
    /// the other actions never touch it.
    pub async fn dispatch(&self, action: Action, chunks: mpsc::Sender<StreamChunk>) -> Value {
        match action {
            Action::ProcessContentViaApi {
                provider_id,
                model_id,
                tab_id,
                source,
                custom_prompt,
                url: _,
                conversation_history,
                formatted_content,
                skip_initial_extraction: _,
            } => {
                let request = TurnRequest {
                    provider: provider_id,
                    model: model_id,
                    tab_id,
                    source,
                    prompt: custom_prompt,
                    formatted_content,
                    conversation_history,
                };
                self.process_content_via_api(request, chunks).await
            }
            Action::CancelStream { stream_id } => self.cancel_stream(&stream_id),
            Action::GetApiModels { provider_id } => self.get_api_models(provider_id),
            Action::CredentialOperation {
                operation,
                provider_id,
                credentials,
                provider_ids,
            } => {
                self.credential_operation(operation, provider_id, credentials, provider_ids)
                    .await
            }
        }
    }

    /// Starts one streaming turn.
    pub async fn process_content_via_api(
        &self,
        request: TurnRequest,
        chunks: mpsc::Sender<StreamChunk>,
    ) -> Value {
        match self.coordinator.process_content(request, chunks).await {
            Ok(stream_id) => json!({
                "success": true,
                "streamId": stream_id,
                "contentType": "general",
            }),
            Err(err) => failure(err.message),
        }
    }

    /// Cancels an in-flight stream.
    pub fn cancel_stream(&self, stream_id: &str) -> Value {
        if self.coordinator.cancel(stream_id) {
            json!({"success": true})
        } else {
            failure(CANCEL_NOT_FOUND)
        }
    }

    /// Returns the model descriptors for a provider.
    pub fn get_api_models(&self, provider: ProviderId) -> Value {
        match self.catalog.provider(provider) {
            Ok(config) => json!({
                "success": true,
                "providerId": provider.id(),
                "models": config.models,
            }),
            Err(err) => failure(err.message),
        }
    }

    /// Runs one credential operation.
    pub async fn credential_operation(
        &self,
        operation: CredentialOp,
        provider: Option<ProviderId>,
        credentials: Option<Credentials>,
        providers: Option<Vec<ProviderId>>,
    ) -> Value {
        match operation {
            CredentialOp::Get => {
                let Some(provider) = provider else {
                    return failure("Missing providerId");
                };
                json!({
                    "success": true,
                    "credentials": self.credentials.get(provider),
                })
            }
            CredentialOp::Store => {
                let Some(provider) = provider else {
                    return failure("Missing providerId");
                };
                let Some(credentials) = credentials else {
                    return failure("Missing credentials");
                };
                match self.credentials.put(provider, credentials) {
                    Ok(()) => json!({"success": true}),
                    Err(err) => failure(format!("{err:#}")),
                }
            }
            CredentialOp::Remove => {
                let Some(provider) = provider else {
                    return failure("Missing providerId");
                };
                match self.credentials.delete(provider) {
                    Ok(()) => json!({"success": true}),
                    Err(err) => failure(format!("{err:#}")),
                }
            }
            CredentialOp::Validate => {
                let Some(provider) = provider else {
                    return failure("Missing providerId");
                };
                // Validate the supplied credentials, or the stored ones.
                let Some(credentials) = credentials.or_else(|| self.credentials.get(provider))
                else {
                    return failure("No credentials to validate");
                };
                let valid = self
                    .coordinator
                    .validate_credentials(provider, &credentials)
                    .await;
                json!({"success": true, "valid": valid})
            }
            CredentialOp::CheckMultiple => {
                let Some(providers) = providers else {
                    return failure("Missing providerIds");
                };
                json!({
                    "success": true,
                    "results": self.credentials.check_multiple(&providers),
                })
            }
        }
    }
}

fn failure(message: impl Into<String>) -> Value {
    json!({"success": false, "error": message.into()})
}
