//! The generation endpoint seam.
//!
//! The conversation core treats text generation as an external collaborator:
//! give it the prompt context, receive an in-order sequence of
//! [`StreamEvent`]s. Production traffic goes through
//! [`HttpGenerationEndpoint`]; tests script the trait directly.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use muse_providers::{EndpointConfig, RequestOptions};
use muse_types::{ChatTurn, StreamEvent};

/// Prompt context for one generation: the conversation prefix, oldest
/// first, with any seeded system turn at the front.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub turns: Vec<ChatTurn>,
}

/// One request/response cycle against a text-generation service.
///
/// The implementation streams events into `events` in order and finishes
/// with exactly one `Done` or `Error`. The returned future is the unit of
/// cancellation: the coordinator runs it inside an abortable task and
/// aborts it out-of-band, so implementations need no stop channel of their
/// own. A future that resolves to `Err` is reported to the session as a
/// stream error by the coordinator.
pub trait GenerationEndpoint: Send + Sync {
    fn stream_reply(
        &self,
        request: GenerationRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Production endpoint: OpenAI-compatible chat-completions streaming.
#[derive(Debug, Clone)]
pub struct HttpGenerationEndpoint {
    config: EndpointConfig,
    options: RequestOptions,
}

impl HttpGenerationEndpoint {
    #[must_use]
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            options: RequestOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

impl GenerationEndpoint for HttpGenerationEndpoint {
    fn stream_reply(
        &self,
        request: GenerationRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let config = self.config.clone();
        let options = self.options;
        Box::pin(async move {
            muse_providers::send_chat(&config, options, &request.turns, events).await
        })
    }
}
