use async_trait::async_trait;
use futures::stream;

use merlin_core::errors::GatewayError;
use merlin_core::prompt::PromptStack;
use merlin_core::provider::{ChunkStream, GenerateOptions, GenerationClient};
use merlin_core::stream::Chunk;

const NARRATION: &str = "The world holds its breath. Somewhere beyond the torchlight, \
something waits for your next move.";

/// Offline backend that always narrates the same short line, word by word.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpClient;

impl NoOpClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GenerationClient for NoOpClient {
    fn name(&self) -> &str {
        "noop"
    }

    fn model(&self) -> &str {
        "noop"
    }

    async fn stream(
        &self,
        _stack: &PromptStack,
        _options: &GenerateOptions,
    ) -> Result<ChunkStream, GatewayError> {
        let mut chunks: Vec<Chunk> = NARRATION
            .split_inclusive(' ')
            .map(Chunk::delta)
            .collect();
        chunks.push(Chunk::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        });
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn streams_fixed_narration() {
        let client = NoOpClient::new();
        let generation = client
            .generate(&PromptStack::new(), &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(generation.text, NARRATION);
    }

    #[tokio::test]
    async fn emits_one_delta_per_word() {
        let client = NoOpClient::new();
        let chunks: Vec<Chunk> = client
            .stream(&PromptStack::new(), &GenerateOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        let words = NARRATION.split(' ').count();
        assert_eq!(chunks.len(), words + 1);
        assert!(chunks.last().unwrap().is_terminal());
    }
}
