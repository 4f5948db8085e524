//! Generation endpoint client with streaming support.
//!
//! # Architecture
//!
//! The crate exposes one entry point, [`send_chat`], which drives a single
//! request/response cycle against an OpenAI-compatible chat-completions API
//! and forwards the reply incrementally through a
//! [`tokio::sync::mpsc::Sender<StreamEvent>`] channel:
//!
//! | Event | Description |
//! |-------|-------------|
//! | `TextDelta` | Incremental text content from the model |
//! | `Done` | Stream completed successfully |
//! | `Error` | Stream terminated with an error |
//!
//! # Error Handling
//!
//! API and transport errors during streaming are delivered as
//! `StreamEvent::Error` events rather than `Result::Err` returns, so partial
//! output accumulated before the failure is never lost. Only failures that
//! prevent reading the HTTP response stream at all surface as `Err`.
//!
//! # Cancellation
//!
//! The client has no out-of-band stop of its own: the caller wraps the
//! [`send_chat`] future in an abortable task and aborts it. Dropping the
//! future tears down the connection.

pub mod retry;

mod openai;

pub(crate) use anyhow::Result;
pub(crate) use muse_types::{ChatTurn, StreamEvent};
use std::sync::OnceLock;
use std::time::Duration;
pub(crate) use tokio::sync::mpsc;

pub use muse_types;

/// Canonical OpenAI chat-completions endpoint.
pub const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!(
                "Failed to build hardened HTTP client: {e}. Attempting minimal hardened fallback."
            );
            reqwest::Client::builder()
                .https_only(true)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Minimal hardened HTTP client must build; cannot proceed without TLS")
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(true)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("MUSE_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

/// API credential. `Debug` redacts the secret so keys cannot leak into logs.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Endpoint identity: credential, model, and where the API lives.
///
/// The base URL defaults to the public OpenAI API and is overridable for
/// self-hosted gateways and for tests.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    api_key: ApiKey,
    model: String,
    completions_url: String,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(api_key: ApiKey, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            completions_url: OPENAI_CHAT_COMPLETIONS_URL.to_string(),
        }
    }

    #[must_use]
    pub fn with_completions_url(mut self, url: impl Into<String>) -> Self {
        self.completions_url = url.into();
        self
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn completions_url(&self) -> &str {
        &self.completions_url
    }
}

/// Per-request generation knobs. Opaque to the conversation core.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Incremental SSE frame accumulator.
///
/// Bytes go in as they arrive from the transport; complete events (the text
/// between `\n\n` / `\r\n\r\n` boundaries) come out. Incomplete trailing
/// data stays buffered until the next chunk.
#[derive(Debug, Default)]
pub(crate) struct SseFrameBuffer {
    buffer: Vec<u8>,
}

impl SseFrameBuffer {
    pub(crate) fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn next_event(&mut self) -> Option<Vec<u8>> {
        let (pos, delim_len) = self.boundary()?;
        let event = self.buffer[..pos].to_vec();
        self.buffer.drain(..pos + delim_len);
        Some(event)
    }

    fn boundary(&self) -> Option<(usize, usize)> {
        let lf = self.buffer.windows(2).position(|w| w == b"\n\n");
        let crlf = self.buffer.windows(4).position(|w| w == b"\r\n\r\n");
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
            (Some(a), None) => Some((a, 2)),
            (None, Some(b)) => Some((b, 4)),
            (None, None) => None,
        }
    }
}

/// Join the `data:` lines of one SSE event, or `None` if the event has none.
pub(crate) fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit.
    Continue,
    /// Emit these events and continue.
    Emit(Vec<StreamEvent>),
    /// Stream is done.
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn endpoint_name(&self) -> &'static str;
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Process an SSE stream using an endpoint-specific parser.
///
/// Handles the transport-level concerns every stream shares:
/// - Timeout handling for idle streams
/// - Buffer management with size limits
/// - UTF-8 validation
/// - Event boundary detection
/// - `[DONE]` marker handling
/// - Parse error tracking with threshold
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut frames = SseFrameBuffer::default();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;
        frames.push_chunk(&chunk);

        if frames.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = frames.next_event() {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, StreamEvent::Done).await;
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                let is_terminal =
                                    matches!(&event, StreamEvent::Done | StreamEvent::Error(_));
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                                if is_terminal {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Done => {
                            let _ = send_event(tx, StreamEvent::Done).await;
                            return Ok(());
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, StreamEvent::Error(msg)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        endpoint = parser.endpoint_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    // Premature EOF: connection closed without completion signal
    let _ = send_event(
        tx,
        StreamEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

#[derive(Debug)]
pub(crate) enum ApiResponse {
    Success(reqwest::Response),
    StreamTerminated,
}

pub(crate) async fn handle_response(
    outcome: retry::RetryOutcome,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<ApiResponse> {
    let response = match outcome {
        retry::RetryOutcome::Success(resp) | retry::RetryOutcome::HttpError(resp) => resp,
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            let _ = send_event(
                tx,
                StreamEvent::Error(format!(
                    "Request failed after {attempts} attempts: {source}"
                )),
            )
            .await;
            return Ok(ApiResponse::StreamTerminated);
        }
        retry::RetryOutcome::NonRetryable(e) => {
            let _ = send_event(tx, StreamEvent::Error(format!("Request failed: {e}"))).await;
            return Ok(ApiResponse::StreamTerminated);
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = read_capped_error_body(response).await;
        let _ = send_event(
            tx,
            StreamEvent::Error(format!("API error {status}: {error_text}")),
        )
        .await;
        return Ok(ApiResponse::StreamTerminated);
    }

    Ok(ApiResponse::Success(response))
}

/// Stream one reply for the given prompt context.
///
/// Events arrive on `tx` in wire order; the last event is always `Done` or
/// `Error`. Returns `Err` only when the response stream itself cannot be
/// read (the caller converts that into an `Error` event too).
pub async fn send_chat(
    config: &EndpointConfig,
    options: RequestOptions,
    turns: &[ChatTurn],
    tx: mpsc::Sender<StreamEvent>,
) -> Result<()> {
    openai::send_chat(config, options, turns, &tx).await
}
