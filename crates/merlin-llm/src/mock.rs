use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use merlin_core::errors::GatewayError;
use merlin_core::prompt::PromptStack;
use merlin_core::provider::{ChunkStream, GenerateOptions, GenerationClient};
use merlin_core::stream::{Chunk, Pricing, Usage};

/// One step of a scripted stream.
#[derive(Clone, Debug)]
pub enum MockStep {
    Chunk(Chunk),
    /// Sleep before the next step.
    Pause(Duration),
    /// Never yield again.
    Stall,
}

/// Pre-programmed responses for deterministic testing without network calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield the steps in order, then end.
    Stream(Vec<MockStep>),
    /// Fail the `stream()` call itself.
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A single delta followed by `Done` without usage.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_words(&[text])
    }

    /// One delta per item, then `Done` without usage.
    pub fn stream_words(words: &[&str]) -> Self {
        let mut steps: Vec<MockStep> = words
            .iter()
            .map(|w| MockStep::Chunk(Chunk::delta(*w)))
            .collect();
        steps.push(MockStep::Chunk(Chunk::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        }));
        Self::Stream(steps)
    }

    pub fn stream_text_with_usage(text: &str, usage: Usage) -> Self {
        Self::Stream(vec![
            MockStep::Chunk(Chunk::delta(text)),
            MockStep::Chunk(Chunk::Done {
                usage: Some(usage),
                finish_reason: Some("stop".into()),
            }),
        ])
    }

    /// Stream that fails after it was opened.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![MockStep::Chunk(Chunk::Error { error })])
    }

    /// Deltas that end without a terminal chunk.
    pub fn truncated(text: &str) -> Self {
        Self::Stream(vec![MockStep::Chunk(Chunk::delta(text))])
    }

    /// First delta, then nothing until the consumer gives up.
    pub fn stalled_after(text: &str) -> Self {
        Self::Stream(vec![MockStep::Chunk(Chunk::delta(text)), MockStep::Stall])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Generation client that replays queued responses in order.
pub struct MockClient {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    last_stack: Mutex<Option<PromptStack>>,
    last_options: Mutex<Option<GenerateOptions>>,
    pricing: Pricing,
}

impl MockClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            last_stack: Mutex::new(None),
            last_options: Mutex::new(None),
            pricing: Pricing::FREE,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompt passed to the most recent `stream()` call.
    pub fn last_stack(&self) -> Option<PromptStack> {
        self.last_stack.lock().clone()
    }

    pub fn last_options(&self) -> Option<GenerateOptions> {
        self.last_options.lock().clone()
    }
}

#[async_trait]
impl GenerationClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    async fn stream(
        &self,
        stack: &PromptStack,
        options: &GenerateOptions,
    ) -> Result<ChunkStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        *self.last_stack.lock() = Some(stack.clone());
        *self.last_options.lock() = Some(options.clone());

        let response = self.responses.lock().pop_front().ok_or_else(|| {
            GatewayError::InvalidRequest(format!("MockClient: no response configured for call {idx}"))
        })?;
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChunkStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(steps) => return Ok(replay(steps)),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

fn replay(steps: Vec<MockStep>) -> ChunkStream {
    let steps: VecDeque<MockStep> = steps.into();
    Box::pin(stream::unfold(steps, |mut steps| async move {
        loop {
            match steps.pop_front()? {
                MockStep::Chunk(chunk) => return Some((chunk, steps)),
                MockStep::Pause(duration) => tokio::time::sleep(duration).await,
                MockStep::Stall => std::future::pending::<()>().await,
            }
        }
    }))
}
