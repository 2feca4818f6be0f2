use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use merlin_core::errors::GatewayError;
use merlin_core::prompt::PromptStack;
use merlin_core::provider::{ChunkStream, GenerateOptions, GenerationClient};
use merlin_core::stream::{Chunk, Pricing, Usage};

use crate::converter;
use crate::http;
use crate::models;
use crate::sse::{FrameDecoder, SseChunkStream, SseFrame, DEFAULT_IDLE_TIMEOUT};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming Chat Completions client. Works against any compatible server.
pub struct OpenAiClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    pricing: Pricing,
    idle_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: SecretString, model: Option<&str>) -> Result<Self, GatewayError> {
        let model = model.unwrap_or(models::default_openai_model().name);
        Ok(Self {
            http: http::build_client()?,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
            pricing: models::pricing(model),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    #[instrument(skip(self, stack, options), fields(model = %self.model))]
    async fn stream(
        &self,
        stack: &PromptStack,
        options: &GenerateOptions,
    ) -> Result<ChunkStream, GatewayError> {
        let body = converter::build_openai_body(stack, options, &self.model);
        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(trace_id) = &options.trace_id {
            req = req.header("x-trace-id", trace_id);
        }

        let resp = http::send(req, options.timeout).await?;
        Ok(Box::pin(SseChunkStream::with_idle_timeout(
            resp.bytes_stream(),
            OpenAiDecoder::default(),
            self.idle_timeout,
        )))
    }
}

/// Decodes `data:` frames of a Chat Completions stream, terminated by `[DONE]`.
#[derive(Default)]
pub struct OpenAiDecoder {
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl FrameDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Vec<Chunk> {
        let data = frame.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return vec![Chunk::Done {
                usage: self.usage.take(),
                finish_reason: self.finish_reason.take(),
            }];
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, data, "skipping unparseable chunk");
                return Vec::new();
            }
        };
        if let Some(error) = chunk.error {
            return vec![Chunk::Error {
                error: classify_error(&error),
            }];
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        let mut out = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                if !text.is_empty() {
                    out.push(Chunk::delta(text));
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        out
    }
}

fn classify_error(error: &ErrorBody) -> GatewayError {
    let message = error.message.clone().unwrap_or_default();
    match error.error_type.as_deref().or(error.code.as_deref()) {
        Some("rate_limit_exceeded" | "rate_limit_error") => {
            GatewayError::RateLimited { retry_after: None }
        }
        Some("context_length_exceeded") => GatewayError::ContextWindowExceeded(message),
        Some("invalid_request_error") => GatewayError::InvalidRequest(message),
        Some("server_error") => GatewayError::ServerError {
            status: 500,
            body: message,
        },
        _ => GatewayError::StreamInterrupted(message),
    }
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChoiceChunk>,
    usage: Option<UsagePayload>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ChoiceChunk {
    delta: Option<DeltaPayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_server::serve_once;
    use futures::StreamExt;

    fn data(raw: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: raw.to_string(),
        }
    }

    #[test]
    fn client_properties() {
        let client = OpenAiClient::new(SecretString::from("sk-test"), None).unwrap();
        assert_eq!(client.name(), "openai");
        assert_eq!(client.model(), "gpt-4o-mini");
        assert!(client.pricing().input_per_mtok > 0.0);

        let custom = OpenAiClient::new(SecretString::from("sk-test"), Some("local-model")).unwrap();
        assert_eq!(custom.pricing(), Pricing::FREE);
    }

    #[test]
    fn decodes_deltas_usage_and_done() {
        let mut decoder = OpenAiDecoder::default();
        let chunks = decoder.decode(&data(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        ));
        assert!(matches!(&chunks[..], [Chunk::Delta { text }] if text == "Hello"));

        let chunks = decoder.decode(&data(
            r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ));
        assert!(chunks.is_empty());

        let chunks = decoder.decode(&data(
            r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        ));
        assert!(chunks.is_empty());

        let chunks = decoder.decode(&data("[DONE]"));
        match &chunks[..] {
            [Chunk::Done {
                usage: Some(usage),
                finish_reason: Some(reason),
            }] => {
                assert_eq!(*usage, Usage::new(12, 3));
                assert_eq!(reason, "stop");
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn error_payload_becomes_error_chunk() {
        let mut decoder = OpenAiDecoder::default();
        let chunks = decoder.decode(&data(
            r#"{"error":{"message":"slow down","type":"rate_limit_exceeded"}}"#,
        ));
        assert!(matches!(
            &chunks[..],
            [Chunk::Error { error: GatewayError::RateLimited { .. } }]
        ));
    }

    #[test]
    fn garbage_is_skipped() {
        let mut decoder = OpenAiDecoder::default();
        assert!(decoder.decode(&data("not json")).is_empty());
        assert!(decoder.decode(&data("")).is_empty());
    }

    #[tokio::test]
    async fn streams_from_server() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"The door \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"creaks.\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let (base_url, request) = serve_once(200, "text/event-stream", body).await;
        let client = OpenAiClient::new(SecretString::from("sk-test"), None)
            .unwrap()
            .with_base_url(base_url);
        let options = GenerateOptions {
            trace_id: Some("trace-9".into()),
            ..GenerateOptions::default()
        };

        let generation = client
            .generate(&PromptStack::new(), &options)
            .await
            .unwrap();
        assert_eq!(generation.text, "The door creaks.");
        assert_eq!(generation.finish_reason.as_deref(), Some("stop"));

        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /chat/completions"));
        assert!(request.contains("authorization: bearer sk-test"));
        assert!(request.contains("x-trace-id: trace-9"));
    }

    #[tokio::test]
    async fn stream_without_done_ends_early() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n";
        let (base_url, _request) = serve_once(200, "text/event-stream", body).await;
        let client = OpenAiClient::new(SecretString::from("sk-test"), None)
            .unwrap()
            .with_base_url(base_url);
        let stream = client
            .stream(&PromptStack::new(), &GenerateOptions::default())
            .await
            .unwrap();
        let chunks: Vec<Chunk> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_terminal());
    }

    #[tokio::test]
    async fn http_status_is_classified() {
        let (base_url, _request) =
            serve_once(401, "application/json", r#"{"error":"bad key"}"#).await;
        let client = OpenAiClient::new(SecretString::from("sk-test"), None)
            .unwrap()
            .with_base_url(base_url);
        let result = client
            .stream(&PromptStack::new(), &GenerateOptions::default())
            .await;
        assert!(matches!(result, Err(GatewayError::AuthenticationFailed(_))));
    }
}
