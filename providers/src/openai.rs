//! OpenAI-compatible chat-completions client.
//!
//! Communicates with `{base}/v1/chat/completions` using `"stream": true`.
//! System turns pass through as `"system"` role messages; the wire protocol
//! is the de-facto standard implemented by OpenAI and most gateways.
//!
//! # Typed SSE payloads
//!
//! Chunk payloads deserialize into typed structs at the serde boundary, so
//! parse errors surface there instead of being scattered through the parsing
//! logic. Unknown fields are ignored for forward compatibility.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::retry::{RetryConfig, send_with_retry};
use crate::{
    ApiResponse, ChatTurn, EndpointConfig, RequestOptions, Result, SseParseAction, SseParser,
    StreamEvent, handle_response, http_client, mpsc, process_sse_stream, stream_idle_timeout,
};

/// One streamed chunk of a chat completion.
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: String,
}

#[derive(Debug, Default)]
struct OpenAiParser;

impl SseParser for OpenAiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        // Mid-stream error payloads replace the chunk shape entirely.
        if json.get("error").is_some() {
            return match serde_json::from_value::<ErrorPayload>(json.clone()) {
                Ok(payload) => {
                    let ErrorInfo {
                        message,
                        error_type,
                    } = payload.error;
                    let detail = if message.is_empty() { error_type } else { message };
                    SseParseAction::Error(format!("API stream error: {detail}"))
                }
                Err(_) => SseParseAction::Error("API stream error".to_string()),
            };
        }

        let Some(chunk) = parse_payload::<CompletionChunk>(json, self.endpoint_name()) else {
            return SseParseAction::Continue;
        };

        let mut events = Vec::new();
        let mut finished = false;
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content
                && !content.is_empty()
            {
                events.push(StreamEvent::TextDelta(content));
            }
            if choice.finish_reason.is_some() {
                finished = true;
            }
        }

        // Some gateways never send the trailing `[DONE]` marker; the
        // finish_reason chunk is the authoritative completion signal.
        if finished {
            events.push(StreamEvent::Done);
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn endpoint_name(&self) -> &'static str {
        "openai"
    }
}

fn parse_payload<T>(json: &Value, endpoint_name: &'static str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_value(json.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(%e, endpoint = endpoint_name, "Failed to parse SSE event");
            None
        }
    }
}

fn build_request_body(model: &str, options: RequestOptions, turns: &[ChatTurn]) -> Value {
    let messages: Vec<Value> = turns
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            })
        })
        .collect();

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), json!(messages));
    body.insert("stream".to_string(), json!(true));

    if let Some(max) = options.max_output_tokens {
        body.insert("max_completion_tokens".to_string(), json!(max));
    }
    if let Some(temperature) = options.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }

    Value::Object(body)
}

pub(crate) async fn send_chat(
    config: &EndpointConfig,
    options: RequestOptions,
    turns: &[ChatTurn],
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    send_chat_with_client(http_client(), config, options, turns, tx).await
}

pub(crate) async fn send_chat_with_client(
    client: &reqwest::Client,
    config: &EndpointConfig,
    options: RequestOptions,
    turns: &[ChatTurn],
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let retry_config = RetryConfig::default();

    let body = build_request_body(config.model(), options, turns);
    let auth_header = format!("Bearer {}", config.api_key());
    let url = config.completions_url().to_string();

    let outcome = send_with_retry(
        || {
            client
                .post(&url)
                .header("Authorization", &auth_header)
                .header("content-type", "application/json")
                .json(&body)
        },
        &retry_config,
    )
    .await;

    let response = match handle_response(outcome, tx).await? {
        ApiResponse::Success(resp) => resp,
        ApiResponse::StreamTerminated => return Ok(()),
    };

    let mut parser = OpenAiParser;
    process_sse_stream(response, &mut parser, tx, stream_idle_timeout()).await
}

#[cfg(test)]
mod tests {
    use super::{OpenAiParser, build_request_body, send_chat_with_client};
    use crate::{ApiKey, EndpointConfig, RequestOptions, SseParseAction, SseParser, StreamEvent};
    use muse_types::{ChatTurn, Role};

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn turns() -> Vec<ChatTurn> {
        vec![
            ChatTurn {
                role: Role::System,
                content: "You help plan marketing campaigns.".to_string(),
            },
            ChatTurn {
                role: Role::User,
                content: "Name three taglines".to_string(),
            },
        ]
    }

    mod request_body {
        use super::{RequestOptions, build_request_body, turns};

        #[test]
        fn roles_pass_through_in_order() {
            let body = build_request_body("gpt-4o-mini", RequestOptions::default(), &turns());

            let messages = body.get("messages").unwrap().as_array().unwrap();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0]["role"].as_str(), Some("system"));
            assert_eq!(messages[1]["role"].as_str(), Some("user"));
            assert_eq!(messages[1]["content"].as_str(), Some("Name three taglines"));
        }

        #[test]
        fn streaming_is_always_requested() {
            let body = build_request_body("gpt-4o-mini", RequestOptions::default(), &turns());
            assert_eq!(body["stream"].as_bool(), Some(true));
            assert_eq!(body["model"].as_str(), Some("gpt-4o-mini"));
        }

        #[test]
        fn options_are_omitted_when_unset() {
            let body = build_request_body("gpt-4o-mini", RequestOptions::default(), &turns());
            assert!(body.get("max_completion_tokens").is_none());
            assert!(body.get("temperature").is_none());
        }

        #[test]
        fn options_are_applied_when_set() {
            let options = RequestOptions {
                max_output_tokens: Some(1024),
                temperature: Some(0.7),
            };
            let body = build_request_body("gpt-4o-mini", options, &turns());
            assert_eq!(body["max_completion_tokens"].as_u64(), Some(1024));
            assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        }
    }

    mod parser {
        use super::{OpenAiParser, SseParseAction, SseParser, StreamEvent, json};

        #[test]
        fn content_delta_emits_text() {
            let mut parser = OpenAiParser;
            let chunk = json!({
                "choices": [{"delta": {"content": "Hello"}, "finish_reason": null}]
            });
            match parser.parse(&chunk) {
                SseParseAction::Emit(events) => {
                    assert_eq!(events, vec![StreamEvent::TextDelta("Hello".to_string())]);
                }
                other => panic!("expected Emit, got {other:?}"),
            }
        }

        #[test]
        fn finish_reason_appends_done() {
            let mut parser = OpenAiParser;
            let chunk = json!({
                "choices": [{"delta": {"content": "!"}, "finish_reason": "stop"}]
            });
            match parser.parse(&chunk) {
                SseParseAction::Emit(events) => {
                    assert_eq!(
                        events,
                        vec![
                            StreamEvent::TextDelta("!".to_string()),
                            StreamEvent::Done,
                        ]
                    );
                }
                other => panic!("expected Emit, got {other:?}"),
            }
        }

        #[test]
        fn empty_delta_is_continue() {
            let mut parser = OpenAiParser;
            let chunk = json!({
                "choices": [{"delta": {}, "finish_reason": null}]
            });
            assert!(matches!(parser.parse(&chunk), SseParseAction::Continue));
        }

        #[test]
        fn error_payload_becomes_stream_error() {
            let mut parser = OpenAiParser;
            let payload = json!({
                "error": {"message": "Rate limit reached", "type": "rate_limit_error"}
            });
            match parser.parse(&payload) {
                SseParseAction::Error(msg) => assert!(msg.contains("Rate limit reached")),
                other => panic!("expected Error, got {other:?}"),
            }
        }

        #[test]
        fn unknown_shape_is_continue() {
            let mut parser = OpenAiParser;
            assert!(matches!(
                parser.parse(&json!({"object": "ping"})),
                SseParseAction::Continue
            ));
        }
    }

    async fn collect_events(
        server: &MockServer,
        turns: &[ChatTurn],
    ) -> Vec<StreamEvent> {
        let config = EndpointConfig::new(ApiKey::new("test-key"), "gpt-4o-mini")
            .with_completions_url(format!("{}/v1/chat/completions", server.uri()));

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let client = reqwest::Client::new();
        send_chat_with_client(&client, &config, RequestOptions::default(), turns, &tx)
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let server = MockServer::start().await;

        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Bold\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" ideas\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let events = collect_events(&server, &turns()).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Bold".to_string()),
                StreamEvent::TextDelta(" ideas".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn http_error_becomes_error_event() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string("{\"error\":{\"message\":\"Incorrect API key\"}}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let events = collect_events(&server, &turns()).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(msg) => {
                assert!(msg.contains("401"));
                assert!(msg.contains("Incorrect API key"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_stream_reports_error() {
        let server = MockServer::start().await;

        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n";

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let events = collect_events(&server, &turns()).await;
        assert_eq!(
            events[0],
            StreamEvent::TextDelta("partial".to_string())
        );
        match events.last() {
            Some(StreamEvent::Error(msg)) => {
                assert!(msg.contains("closed before stream completed"));
            }
            other => panic!("expected trailing Error, got {other:?}"),
        }
    }
}
