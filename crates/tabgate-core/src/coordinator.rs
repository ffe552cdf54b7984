//! Stream coordination: one end-to-end turn per user message.
//!
//! The coordinator resolves parameters, hands the HTTP call to the provider
//! adapter, reads the response body as an explicit byte loop (split on
//! newlines, partial final line flushed once at EOF), dispatches chunks to
//! the consumer, and persists the terminal state exactly once. Cancellation
//! is a distinguished success-with-partial-content, never an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Catalog;
use crate::credentials::{Credentials, CredentialStore};
use crate::error::{GatewayError, GatewayResult};
use crate::extract::extract_api_error;
use crate::providers::shared::compose_structured_prompt;
use crate::providers::{ChatMessage, ProviderAdapter, ProviderId, StreamEvent, adapter_for};
use crate::resolver::{self, RequestSource};
use crate::storage::{KeyValueStore, keys};

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Inbound parameters for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub provider: ProviderId,
    /// Explicit model request; falls back to stored preferences
    pub model: Option<String>,
    pub tab_id: Option<i64>,
    pub source: RequestSource,
    pub prompt: String,
    /// Extracted page context, framed into the prompt once per turn
    pub formatted_content: Option<String>,
    pub conversation_history: Vec<ChatMessage>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One chunk-callback payload.
///
/// Mid-stream chunks carry text with `done: false`; the single terminal
/// chunk carries exactly one of `full_content`, `cancelled: true`, or
/// `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub chunk: String,
    pub done: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    fn content(text: impl Into<String>, model: &str) -> Self {
        Self {
            chunk: text.into(),
            done: false,
            model: model.to_string(),
            full_content: None,
            cancelled: false,
            error: None,
        }
    }

    fn completed(model: &str, full_content: impl Into<String>) -> Self {
        Self {
            chunk: String::new(),
            done: true,
            model: model.to_string(),
            full_content: Some(full_content.into()),
            cancelled: false,
            error: None,
        }
    }

    fn cancelled(model: &str, full_content: impl Into<String>) -> Self {
        Self {
            chunk: String::new(),
            done: true,
            model: model.to_string(),
            full_content: Some(full_content.into()),
            cancelled: true,
            error: None,
        }
    }

    fn failed(model: &str, error: impl Into<String>) -> Self {
        Self {
            chunk: String::new(),
            done: true,
            model: model.to_string(),
            full_content: None,
            cancelled: false,
            error: Some(error.into()),
        }
    }
}

/// In-flight state for one turn.
struct Turn {
    stream_id: String,
    provider: ProviderId,
    params: crate::resolver::ResolvedParams,
    prompt: String,
    formatted_content: Option<String>,
    api_key: String,
    token: CancellationToken,
}

/// How a turn ended. Exactly one terminal chunk is derived from this.
enum TurnOutcome {
    Completed { content: String },
    Cancelled { content: String },
    Failed { error: String, content: String },
}

/// Why line dispatch stopped early.
enum LineStop {
    /// The chunk consumer hung up; treated like a cancellation.
    ConsumerGone,
    /// The provider sent an in-band error event.
    ProviderError(String),
}

/// Drives streaming turns and owns the `streamId → cancel token` table.
pub struct StreamCoordinator {
    http: reqwest::Client,
    catalog: Arc<Catalog>,
    store: Arc<dyn KeyValueStore>,
    credentials: CredentialStore,
    active: Mutex<HashMap<String, CancellationToken>>,
    ready: broadcast::Sender<String>,
}

impl StreamCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_catalog(Arc::new(Catalog::global().clone()), store)
    }

    pub fn with_catalog(catalog: Arc<Catalog>, store: Arc<dyn KeyValueStore>) -> Self {
        let (ready, _) = broadcast::channel(16);
        Self {
            http: reqwest::Client::new(),
            catalog,
            credentials: CredentialStore::new(Arc::clone(&store)),
            store,
            active: Mutex::new(HashMap::new()),
            ready,
        }
    }

    /// Subscribes to best-effort response-ready notifications (stream ids).
    pub fn subscribe_ready(&self) -> broadcast::Receiver<String> {
        self.ready.subscribe()
    }

    /// Starts one streaming turn and returns its stream id.
    ///
    /// Chunks arrive on `chunks`; the terminal chunk (`done: true`) is sent
    /// exactly once per turn and nothing follows it.
    ///
    /// # Errors
    /// Returns a setup error if parameters cannot be resolved or no
    /// credentials are stored; nothing is persisted or dispatched in that
    /// case.
    pub async fn process_content(
        self: &Arc<Self>,
        request: TurnRequest,
        chunks: mpsc::Sender<StreamChunk>,
    ) -> GatewayResult<String> {
        let model = resolver::resolve_model(
            &self.catalog,
            self.store.as_ref(),
            request.provider,
            request.model.as_deref(),
            request.tab_id,
            request.source,
        )?;
        let params = resolver::resolve_params(
            &self.catalog,
            self.store.as_ref(),
            request.provider,
            &model,
            request.conversation_history,
        )?;
        // Credentials are read fresh for every turn, never cached here.
        let credentials = self.credentials.get(request.provider).ok_or_else(|| {
            GatewayError::setup(format!(
                "No API key configured for {}",
                request.provider.label()
            ))
        })?;
        let adapter = adapter_for(request.provider, &self.catalog)?;

        let stream_id = mint_stream_id();
        self.persist_record(&stream_id, "streaming", request.provider, &params.model, "", None);

        let token = CancellationToken::new();
        self.active
            .lock()
            .expect("active-stream table poisoned")
            .insert(stream_id.clone(), token.clone());

        let turn = Turn {
            stream_id: stream_id.clone(),
            provider: request.provider,
            params,
            prompt: request.prompt,
            formatted_content: request.formatted_content,
            api_key: credentials.api_key,
            token,
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_turn(adapter, turn, chunks).await;
        });

        Ok(stream_id)
    }

    /// Signals the cancel token for a stream, if it is still active.
    ///
    /// Returns false when the stream already terminated (the token table
    /// entry is removed on the turn's terminal path).
    pub fn cancel(&self, stream_id: &str) -> bool {
        let active = self.active.lock().expect("active-stream table poisoned");
        match active.get(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Executes the adapter's validation probe for the given credentials.
    ///
    /// Any construction failure, transport fault, or non-OK status yields
    /// `false`; the probe never raises.
    pub async fn validate_credentials(
        &self,
        provider: ProviderId,
        credentials: &Credentials,
    ) -> bool {
        let request = match adapter_for(provider, &self.catalog)
            .and_then(|adapter| adapter.build_validation_request(&credentials.api_key))
        {
            Ok(request) => request,
            Err(err) => {
                warn!(provider = provider.id(), "Validation probe setup failed: {err}");
                return false;
            }
        };

        let response = match self
            .http
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(VALIDATION_TIMEOUT)
            .json(&request.body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = err.without_url();
                warn!(provider = provider.id(), "Validation probe failed: {err}");
                return false;
            }
        };

        let status = response.status();
        if status.is_success() {
            return true;
        }
        let status_text = status.canonical_reason().unwrap_or("Unknown Error").to_string();
        let body = response.text().await.unwrap_or_default();
        warn!(
            provider = provider.id(),
            "Credential validation rejected: {}",
            extract_api_error(status.as_u16(), &status_text, &body)
        );
        false
    }

    async fn run_turn(
        self: Arc<Self>,
        mut adapter: Box<dyn ProviderAdapter>,
        turn: Turn,
        chunks: mpsc::Sender<StreamChunk>,
    ) {
        let outcome = self.drive_turn(adapter.as_mut(), &turn, &chunks).await;
        let model = turn.params.model.as_str();

        // The single terminal chunk and the single persisted terminal state.
        match outcome {
            TurnOutcome::Completed { content } => {
                let _ = chunks.send(StreamChunk::completed(model, content.as_str())).await;
                self.persist_record(&turn.stream_id, "completed", turn.provider, model, &content, None);
                self.set_error_field(None);
            }
            TurnOutcome::Cancelled { content } => {
                let _ = chunks.send(StreamChunk::cancelled(model, content.as_str())).await;
                // A user cancel is success-with-partial-content.
                self.persist_record(&turn.stream_id, "completed", turn.provider, model, &content, None);
                self.set_error_field(None);
            }
            TurnOutcome::Failed { error, content } => {
                let _ = chunks.send(StreamChunk::failed(model, error.as_str())).await;
                self.persist_record(&turn.stream_id, "error", turn.provider, model, &content, Some(&error));
                self.set_error_field(Some(&error));
            }
        }

        self.active
            .lock()
            .expect("active-stream table poisoned")
            .remove(&turn.stream_id);
        let _ = self.ready.send(turn.stream_id.clone());
    }

    async fn drive_turn(
        &self,
        adapter: &mut dyn ProviderAdapter,
        turn: &Turn,
        chunks: &mpsc::Sender<StreamChunk>,
    ) -> TurnOutcome {
        let prompt = compose_structured_prompt(&turn.prompt, turn.formatted_content.as_deref());
        let request = match adapter.build_request(&prompt, &turn.params, &turn.api_key) {
            Ok(request) => request,
            Err(err) => {
                return TurnOutcome::Failed {
                    error: err.message,
                    content: String::new(),
                };
            }
        };

        let send = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers)
            .json(&request.body)
            .send();
        let response = tokio::select! {
            biased;
            () = turn.token.cancelled() => {
                return TurnOutcome::Cancelled { content: String::new() };
            }
            result = send => match result {
                Ok(response) => response,
                Err(err) => {
                    // Strip the URL: for Gemini it carries the API key.
                    let err = err.without_url();
                    return TurnOutcome::Failed {
                        error: transport_message(&err),
                        content: String::new(),
                    };
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("Unknown Error").to_string();
            let body = response.text().await.unwrap_or_default();
            return TurnOutcome::Failed {
                error: extract_api_error(status.as_u16(), &status_text, &body),
                content: String::new(),
            };
        }

        adapter.reset_stream_state();
        let bytes = response.bytes_stream().map(|result| result.map_err(reqwest::Error::without_url));
        read_stream(adapter, turn, bytes, chunks).await
    }

    fn persist_record(
        &self,
        stream_id: &str,
        status: &str,
        provider: ProviderId,
        model: &str,
        content: &str,
        error: Option<&str>,
    ) {
        let mut record = json!({
            "streamId": stream_id,
            "status": status,
            "providerId": provider.id(),
            "model": model,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "content": content,
        });
        if let Some(error) = error {
            record["error"] = json!(error);
        }
        if let Err(err) = self.store.write(keys::STREAMING_RESPONSE, record) {
            warn!(stream_id, "Failed to persist streaming response: {err:#}");
        }
    }

    fn set_error_field(&self, error: Option<&str>) {
        let result = match error {
            Some(message) => self.store.write(keys::API_ERROR, json!(message)),
            None => self.store.remove(keys::API_ERROR),
        };
        if let Err(err) = result {
            warn!("Failed to update error field: {err:#}");
        }
    }
}

/// Reads the response body as lines and dispatches parsed events.
///
/// Bytes are buffered and split on newlines; the final partial line is
/// flushed once at EOF. A provider `done` signal is an observation only:
/// reading continues until the transport ends.
async fn read_stream<S, E>(
    adapter: &mut dyn ProviderAdapter,
    turn: &Turn,
    mut bytes: S,
    chunks: &mpsc::Sender<StreamChunk>,
) -> TurnOutcome
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut lines = LineBuffer::new();
    let mut content = String::new();
    let mut provider_done = false;

    loop {
        let next = tokio::select! {
            biased;
            () = turn.token.cancelled() => {
                return TurnOutcome::Cancelled { content };
            }
            next = bytes.next() => next,
        };

        match next {
            Some(Ok(chunk_bytes)) => {
                let parsed = lines.split_lines(&chunk_bytes);
                if let Err(stop) =
                    dispatch_lines(adapter, turn, parsed, &mut content, &mut provider_done, chunks)
                        .await
                {
                    return stop_outcome(stop, content);
                }
            }
            Some(Err(err)) => {
                // The cancel token may have raced with the transport abort.
                if turn.token.is_cancelled() {
                    return TurnOutcome::Cancelled { content };
                }
                return TurnOutcome::Failed {
                    error: format!("Network error: {err}"),
                    content,
                };
            }
            None => {
                let trailing = lines.flush().into_iter().collect();
                if let Err(stop) =
                    dispatch_lines(adapter, turn, trailing, &mut content, &mut provider_done, chunks)
                        .await
                {
                    return stop_outcome(stop, content);
                }
                return TurnOutcome::Completed { content };
            }
        }
    }
}

async fn dispatch_lines(
    adapter: &mut dyn ProviderAdapter,
    turn: &Turn,
    lines: Vec<String>,
    content: &mut String,
    provider_done: &mut bool,
    chunks: &mpsc::Sender<StreamChunk>,
) -> Result<(), LineStop> {
    for line in lines {
        match adapter.parse_line(&line) {
            StreamEvent::Content { text } => {
                dispatch_text(turn, text, content, chunks).await?;
            }
            StreamEvent::ContentMulti { texts } => {
                for text in texts {
                    dispatch_text(turn, text, content, chunks).await?;
                }
            }
            StreamEvent::Done => {
                if !*provider_done {
                    *provider_done = true;
                    debug!(stream_id = %turn.stream_id, "Provider signalled end of message");
                }
            }
            StreamEvent::Ignore => {}
            StreamEvent::Error { message } => {
                return Err(LineStop::ProviderError(message));
            }
        }
    }
    Ok(())
}

async fn dispatch_text(
    turn: &Turn,
    text: String,
    content: &mut String,
    chunks: &mpsc::Sender<StreamChunk>,
) -> Result<(), LineStop> {
    if text.is_empty() {
        return Ok(());
    }
    content.push_str(&text);
    chunks
        .send(StreamChunk::content(text, &turn.params.model))
        .await
        .map_err(|_| LineStop::ConsumerGone)
}

fn stop_outcome(stop: LineStop, content: String) -> TurnOutcome {
    match stop {
        // The receiver hung up; preserve what arrived, like a cancel.
        LineStop::ConsumerGone => TurnOutcome::Cancelled { content },
        LineStop::ProviderError(error) => TurnOutcome::Failed { error, content },
    }
}

fn transport_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("Request timed out: {err}")
    } else if err.is_connect() {
        format!("Connection failed: {err}")
    } else {
        format!("Network error: {err}")
    }
}

fn mint_stream_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("stream_{millis}_{suffix}")
}

/// Splits an incoming byte stream into trimmed, non-empty lines.
///
/// Incomplete trailing bytes stay buffered until the next push; UTF-8 is
/// decoded per complete line, so multi-byte sequences split across chunk
/// boundaries survive intact.
struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn split_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let decoded = String::from_utf8_lossy(&line);
            let trimmed = decoded.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buffer);
        let decoded = String::from_utf8_lossy(&bytes);
        let trimmed = decoded.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::Value;

    use crate::config::ParameterStyle;
    use crate::credentials::Credentials;
    use crate::resolver::ResolvedParams;
    use crate::storage::MemoryStore;

    use super::*;

    #[test]
    fn test_chunk_envelope_omits_absent_fields() {
        let mid = StreamChunk::content("Hi", "gpt-4o");
        assert_eq!(
            serde_json::to_value(&mid).unwrap(),
            serde_json::json!({"chunk": "Hi", "done": false, "model": "gpt-4o"})
        );

        let cancelled = StreamChunk::cancelled("gpt-4o", "partial");
        assert_eq!(
            serde_json::to_value(&cancelled).unwrap(),
            serde_json::json!({
                "chunk": "",
                "done": true,
                "model": "gpt-4o",
                "fullContent": "partial",
                "cancelled": true,
            })
        );

        let failed = StreamChunk::failed("gpt-4o", "API error (401): nope");
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({
                "chunk": "",
                "done": true,
                "model": "gpt-4o",
                "error": "API error (401): nope",
            })
        );
    }

    // ------------------------------------------------------------------
    // LineBuffer
    // ------------------------------------------------------------------

    #[test]
    fn test_line_buffer_splits_across_chunk_boundaries() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.split_lines(b"data: {\"a\":").is_empty());
        let lines = buffer.split_lines(b"1}\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_line_buffer_handles_crlf_and_blank_lines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.split_lines(b"one\r\n\r\n\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_line_buffer_flushes_partial_final_line() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.split_lines(b"first\nsecond without newline").len() == 1);
        assert_eq!(buffer.flush(), Some("second without newline".to_string()));
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_line_buffer_preserves_multibyte_utf8_split_across_chunks() {
        let text = "data: caf\u{e9}\n";
        let bytes = text.as_bytes();
        let mut buffer = LineBuffer::new();
        // Split in the middle of the two-byte é sequence.
        let split = bytes.len() - 2;
        assert!(buffer.split_lines(&bytes[..split]).is_empty());
        let lines = buffer.split_lines(&bytes[split..]);
        assert_eq!(lines, vec!["data: caf\u{e9}"]);
    }

    // ------------------------------------------------------------------
    // read_stream against in-memory byte streams
    // ------------------------------------------------------------------

    fn test_turn(model: &str) -> Turn {
        Turn {
            stream_id: mint_stream_id(),
            provider: ProviderId::OpenAi,
            params: ResolvedParams {
                model: model.to_string(),
                max_tokens: 4096,
                token_parameter: "max_tokens".to_string(),
                parameter_style: ParameterStyle::Standard,
                context_window: 128_000,
                temperature: None,
                top_p: None,
                system_prompt: None,
                model_supports_system_prompt: true,
                conversation_history: Vec::new(),
            },
            prompt: "Hello".to_string(),
            formatted_content: None,
            api_key: "sk-test".to_string(),
            token: CancellationToken::new(),
        }
    }

    fn byte_stream(
        pieces: Vec<&str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, std::io::Error>> + Unpin {
        stream::iter(
            pieces
                .into_iter()
                .map(|piece| Ok(bytes::Bytes::copy_from_slice(piece.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn drain(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk);
        }
        received
    }

    #[tokio::test]
    async fn test_read_stream_orders_chunks_and_accumulates() {
        let turn = test_turn("gpt-4o");
        let mut adapter = adapter_for(ProviderId::OpenAi, Catalog::global()).unwrap();
        let (tx, rx) = mpsc::channel(32);

        let bytes = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\nda",
            "ta: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
        ]);
        let outcome = read_stream(adapter.as_mut(), &turn, bytes, &tx).await;
        drop(tx);

        let TurnOutcome::Completed { content } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(content, "Hi there");

        let received = drain(rx).await;
        let concatenated: String = received.iter().map(|c| c.chunk.as_str()).collect();
        assert_eq!(concatenated, "Hi there");
        assert!(received.iter().all(|c| !c.done && !c.chunk.is_empty()));
    }

    #[tokio::test]
    async fn test_read_stream_flushes_partial_final_line() {
        let turn = test_turn("gpt-4o");
        let mut adapter = adapter_for(ProviderId::OpenAi, Catalog::global()).unwrap();
        let (tx, rx) = mpsc::channel(32);

        // No trailing newline on the last data line.
        let bytes = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}",
        ]);
        let outcome = read_stream(adapter.as_mut(), &turn, bytes, &tx).await;
        drop(tx);

        let TurnOutcome::Completed { content } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(content, "partial");
        assert_eq!(drain(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_read_stream_stops_on_provider_error_event() {
        let turn = test_turn("claude-3-5-sonnet-latest");
        let mut adapter = adapter_for(ProviderId::Anthropic, Catalog::global()).unwrap();
        let (tx, rx) = mpsc::channel(32);

        let bytes = byte_stream(vec![
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"never\"}}\n",
        ]);
        let outcome = read_stream(adapter.as_mut(), &turn, bytes, &tx).await;
        drop(tx);

        let TurnOutcome::Failed { error, content } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, "Stream error: overloaded_error - Overloaded");
        assert_eq!(content, "Hi");
        // Nothing after the error event was dispatched.
        assert_eq!(drain(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_read_stream_cancellation_preserves_partial_content() {
        let turn = test_turn("gpt-4o");
        let token = turn.token.clone();
        let mut adapter = adapter_for(ProviderId::OpenAi, Catalog::global()).unwrap();
        let (tx, mut rx) = mpsc::channel(32);

        let head = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n",
        ]);
        let bytes = head.chain(stream::pending());

        let driver = tokio::spawn(async move {
            let mut bytes = Box::pin(bytes);
            read_stream(adapter.as_mut(), &turn, &mut bytes, &tx).await
        });

        // Wait for the buffered bytes to be delivered, then cancel.
        assert_eq!(rx.recv().await.unwrap().chunk, "Hi");
        assert_eq!(rx.recv().await.unwrap().chunk, " there");
        token.cancel();

        let outcome = driver.await.unwrap();
        let TurnOutcome::Cancelled { content } = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(content, "Hi there");
    }

    #[tokio::test]
    async fn test_gemini_multi_part_line_fans_out_in_order() {
        let mut turn = test_turn("gemini-1.5-pro");
        turn.provider = ProviderId::Gemini;
        let mut adapter = adapter_for(ProviderId::Gemini, Catalog::global()).unwrap();
        let (tx, rx) = mpsc::channel(32);

        let bytes = byte_stream(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A\"},{\"text\":\"B\"}]}}]}\n",
        ]);
        let outcome = read_stream(adapter.as_mut(), &turn, bytes, &tx).await;
        drop(tx);

        let TurnOutcome::Completed { content } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(content, "AB");
        let received = drain(rx).await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].chunk, "A");
        assert_eq!(received[1].chunk, "B");
    }

    // ------------------------------------------------------------------
    // End-to-end turns against a mock HTTP server
    // ------------------------------------------------------------------

    fn catalog_with_openai_endpoint(endpoint: &str) -> Arc<Catalog> {
        let doc = include_str!("providers.toml").replace(
            "https://api.openai.com/v1/chat/completions",
            endpoint,
        );
        Arc::new(Catalog::from_toml(&doc).unwrap())
    }

    fn catalog_with_gemini_endpoint(endpoint: &str) -> Arc<Catalog> {
        let doc = include_str!("providers.toml")
            .replace("https://generativelanguage.googleapis.com", endpoint);
        Arc::new(Catalog::from_toml(&doc).unwrap())
    }

    fn coordinator_with(catalog: Arc<Catalog>) -> (Arc<StreamCoordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(StreamCoordinator::with_catalog(
            catalog,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        ));
        (coordinator, store)
    }

    fn openai_turn_request(prompt: &str) -> TurnRequest {
        TurnRequest {
            provider: ProviderId::OpenAi,
            model: Some("gpt-4o".to_string()),
            tab_id: Some(1),
            source: RequestSource::Popup,
            prompt: prompt.to_string(),
            formatted_content: None,
            conversation_history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_turn_happy_path_end_to_end() {
        let server = wiremock::MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n\
                   data: [DONE]\n\n";
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let (coordinator, store) =
            coordinator_with(catalog_with_openai_endpoint(&server.uri()));
        coordinator
            .credentials
            .put(ProviderId::OpenAi, Credentials::new("sk-test"))
            .unwrap();

        let (tx, rx) = mpsc::channel(32);
        let stream_id = coordinator
            .process_content(openai_turn_request("Hello"), tx)
            .await
            .unwrap();
        assert!(stream_id.starts_with("stream_"));

        let received = drain(rx).await;
        let (terminal, mid) = received.split_last().unwrap();

        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].chunk, "Hi");
        assert_eq!(mid[1].chunk, " there");
        assert!(mid.iter().all(|c| !c.done));

        assert!(terminal.done);
        assert_eq!(terminal.full_content.as_deref(), Some("Hi there"));
        assert!(!terminal.cancelled);
        assert!(terminal.error.is_none());

        let record = store.read(keys::STREAMING_RESPONSE).unwrap();
        assert_eq!(record["status"], "completed");
        assert_eq!(record["content"], "Hi there");
        assert_eq!(record["providerId"], "openai");
        assert!(record.get("error").is_none());
        assert!(store.read(keys::API_ERROR).is_none());
    }

    #[tokio::test]
    async fn test_turn_http_error_extracts_message() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(401).set_body_raw(
                r#"{"error":{"message":"Incorrect API key"}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let (coordinator, store) =
            coordinator_with(catalog_with_openai_endpoint(&server.uri()));
        coordinator
            .credentials
            .put(ProviderId::OpenAi, Credentials::new("sk-bad"))
            .unwrap();

        let (tx, rx) = mpsc::channel(32);
        coordinator
            .process_content(openai_turn_request("Hello"), tx)
            .await
            .unwrap();

        let received = drain(rx).await;
        assert_eq!(received.len(), 1);
        let terminal = &received[0];
        assert!(terminal.done);
        assert_eq!(
            terminal.error.as_deref(),
            Some("API error (401): Incorrect API key")
        );
        assert!(!terminal.cancelled);
        assert!(terminal.full_content.is_none());

        let record = store.read(keys::STREAMING_RESPONSE).unwrap();
        assert_eq!(record["status"], "error");
        assert_eq!(record["error"], "API error (401): Incorrect API key");
        assert_eq!(
            store.read(keys::API_ERROR).unwrap(),
            Value::String("API error (401): Incorrect API key".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_before_response_terminates_with_cancelled() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(30))
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let (coordinator, store) =
            coordinator_with(catalog_with_openai_endpoint(&server.uri()));
        coordinator
            .credentials
            .put(ProviderId::OpenAi, Credentials::new("sk-test"))
            .unwrap();

        let (tx, rx) = mpsc::channel(32);
        let stream_id = coordinator
            .process_content(openai_turn_request("Hello"), tx)
            .await
            .unwrap();

        assert!(coordinator.cancel(&stream_id));
        // Signalling the edge-triggered token again is a no-op.
        coordinator.cancel(&stream_id);

        let received = drain(rx).await;
        assert_eq!(received.len(), 1);
        let terminal = &received[0];
        assert!(terminal.done);
        assert!(terminal.cancelled);
        assert!(terminal.error.is_none());
        assert_eq!(terminal.full_content.as_deref(), Some(""));

        let record = store.read(keys::STREAMING_RESPONSE).unwrap();
        assert_eq!(record["status"], "completed");
        assert!(record.get("error").is_none());

        // The terminal path removed the token table entry.
        assert!(!coordinator.cancel(&stream_id));
    }

    #[tokio::test]
    async fn test_cancel_unknown_stream_returns_false() {
        let (coordinator, _) = coordinator_with(Arc::new(Catalog::global().clone()));
        assert!(!coordinator.cancel("stream_0_none"));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_streaming() {
        let (coordinator, store) = coordinator_with(Arc::new(Catalog::global().clone()));
        let (tx, mut rx) = mpsc::channel(32);

        let err = coordinator
            .process_content(openai_turn_request("Hello"), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Setup);
        assert!(err.message.starts_with("API Request Setup Error:"));
        // No turn started: no chunks, no persisted record.
        assert!(rx.recv().await.is_none());
        assert!(store.read(keys::STREAMING_RESPONSE).is_none());
    }

    #[tokio::test]
    async fn test_transport_error_does_not_leak_gemini_key() {
        // Nothing listens on this port; the connection is refused.
        let (coordinator, _) =
            coordinator_with(catalog_with_gemini_endpoint("http://127.0.0.1:9"));
        coordinator
            .credentials
            .put(ProviderId::Gemini, Credentials::new("super-secret-key"))
            .unwrap();

        let (tx, rx) = mpsc::channel(32);
        coordinator
            .process_content(
                TurnRequest {
                    provider: ProviderId::Gemini,
                    model: Some("gemini-1.5-pro".to_string()),
                    tab_id: None,
                    source: RequestSource::Popup,
                    prompt: "Hello".to_string(),
                    formatted_content: None,
                    conversation_history: Vec::new(),
                },
                tx,
            )
            .await
            .unwrap();

        let received = drain(rx).await;
        assert_eq!(received.len(), 1);
        let error = received[0].error.as_deref().unwrap();
        assert!(!error.contains("super-secret-key"), "leaked key: {error}");
    }

    #[tokio::test]
    async fn test_structured_prompt_sent_once_per_turn() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::body_string_contains(
                "# INSTRUCTION\\nSummarize\\n# EXTRACTED CONTENT\\npage text",
            ))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (coordinator, _) = coordinator_with(catalog_with_openai_endpoint(&server.uri()));
        coordinator
            .credentials
            .put(ProviderId::OpenAi, Credentials::new("sk-test"))
            .unwrap();

        let (tx, rx) = mpsc::channel(32);
        let mut request = openai_turn_request("Summarize");
        request.formatted_content = Some("page text".to_string());
        coordinator.process_content(request, tx).await.unwrap();

        let received = drain(rx).await;
        assert!(received.last().unwrap().done);
        assert!(received.last().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_validation_probe_maps_status_to_bool() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
                r#"{"choices":[{"message":{"content":"ok"}}]}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let (coordinator, _) = coordinator_with(catalog_with_openai_endpoint(&server.uri()));
        assert!(
            coordinator
                .validate_credentials(ProviderId::OpenAi, &Credentials::new("sk-good"))
                .await
        );

        server.reset().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(401).set_body_raw(
                r#"{"error":{"message":"Incorrect API key"}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        assert!(
            !coordinator
                .validate_credentials(ProviderId::OpenAi, &Credentials::new("sk-bad"))
                .await
        );
    }
}
