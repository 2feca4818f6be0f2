use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::errors::GatewayError;
use crate::prompt::PromptStack;
use crate::stream::{Chunk, Generation, Pricing};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Options controlling one generation call.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub json_mode: bool,
    pub timeout: Duration,
    pub trace_id: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 512,
            json_mode: false,
            timeout: Duration::from_secs(30),
            trace_id: None,
        }
    }
}

/// A generative text backend. Selected once at startup and shared behind an `Arc`.
///
/// Dropping the returned stream abandons the call, so consumers cancel a
/// generation by no longer polling it.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    fn pricing(&self) -> Pricing {
        Pricing::FREE
    }

    async fn stream(
        &self,
        stack: &PromptStack,
        options: &GenerateOptions,
    ) -> Result<ChunkStream, GatewayError>;

    /// Collect a whole generation. A stream ending without `Done` is an interruption.
    async fn generate(
        &self,
        stack: &PromptStack,
        options: &GenerateOptions,
    ) -> Result<Generation, GatewayError> {
        let mut stream = self.stream(stack, options).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Chunk::Delta { text: delta } => text.push_str(&delta),
                Chunk::Done {
                    usage,
                    finish_reason,
                } => {
                    return Ok(Generation {
                        text,
                        usage: usage.unwrap_or_default(),
                        finish_reason,
                    })
                }
                Chunk::Error { error } => return Err(error),
            }
        }
        Err(GatewayError::StreamInterrupted(
            "stream ended before completion".into(),
        ))
    }
}
