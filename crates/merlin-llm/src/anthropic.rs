use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use merlin_core::errors::GatewayError;
use merlin_core::prompt::PromptStack;
use merlin_core::provider::{ChunkStream, GenerateOptions, GenerationClient};
use merlin_core::stream::{Chunk, Pricing, Usage};

use crate::converter;
use crate::http;
use crate::models;
use crate::sse::{FrameDecoder, SseChunkStream, SseFrame, DEFAULT_IDLE_TIMEOUT};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Streaming Messages API client authenticated with an API key.
pub struct AnthropicClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    pricing: Pricing,
    idle_timeout: Duration,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString, model: Option<&str>) -> Result<Self, GatewayError> {
        let model = model.unwrap_or(models::default_anthropic_model().name);
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
impl GenerationClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
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
        let body = converter::build_anthropic_body(stack, options, &self.model);
        let mut req = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(trace_id) = &options.trace_id {
            req = req.header("x-trace-id", trace_id);
        }

        let resp = http::send(req, options.timeout).await?;
        Ok(Box::pin(SseChunkStream::with_idle_timeout(
            resp.bytes_stream(),
            AnthropicDecoder::default(),
            self.idle_timeout,
        )))
    }
}

/// State machine over Messages API stream events. Only text blocks are
/// forwarded.
#[derive(Default)]
pub struct AnthropicDecoder {
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

impl FrameDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Vec<Chunk> {
        let event_type = match frame.event.as_deref() {
            Some(event) => event,
            None => return Vec::new(),
        };

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(&frame.data) {
                    if let Some(usage) = msg.message.usage {
                        self.input_tokens = usage.input_tokens.unwrap_or(0);
                        self.output_tokens = usage.output_tokens.unwrap_or(0);
                    }
                }
                Vec::new()
            }

            "content_block_delta" => {
                let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(&frame.data) else {
                    debug!(data = %frame.data, "skipping unparseable content_block_delta");
                    return Vec::new();
                };
                match delta.delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta
                            .delta
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if text.is_empty() {
                            Vec::new()
                        } else {
                            vec![Chunk::delta(text)]
                        }
                    }
                    _ => Vec::new(),
                }
            }

            "message_delta" => {
                if let Ok(msg) = serde_json::from_str::<MessageDeltaEvent>(&frame.data) {
                    if let Some(usage) = msg.usage {
                        if let Some(output) = usage.output_tokens {
                            self.output_tokens = output;
                        }
                    }
                    if let Some(reason) = msg.delta.and_then(|d| d.stop_reason) {
                        self.stop_reason = Some(reason);
                    }
                }
                Vec::new()
            }

            "message_stop" => vec![Chunk::Done {
                usage: Some(Usage::new(self.input_tokens, self.output_tokens)),
                finish_reason: self.stop_reason.take(),
            }],

            "error" => {
                let error = match serde_json::from_str::<ErrorEvent>(&frame.data) {
                    Ok(err) => classify_error(&err),
                    Err(_) => GatewayError::MalformedResponse(frame.data.clone()),
                };
                vec![Chunk::Error { error }]
            }

            // ping, content_block_start, content_block_stop
            _ => Vec::new(),
        }
    }
}

fn classify_error(err: &ErrorEvent) -> GatewayError {
    match err.error.error_type.as_str() {
        "overloaded_error" => GatewayError::Overloaded,
        "rate_limit_error" => GatewayError::RateLimited { retry_after: None },
        "authentication_error" => GatewayError::AuthenticationFailed(err.error.message.clone()),
        "invalid_request_error" => {
            if err.error.message.contains("context window")
                || err.error.message.contains("too many tokens")
            {
                GatewayError::ContextWindowExceeded(err.error.message.clone())
            } else {
                GatewayError::InvalidRequest(err.error.message.clone())
            }
        }
        _ => GatewayError::ServerError {
            status: 500,
            body: err.error.message.clone(),
        },
    }
}

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Value,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
