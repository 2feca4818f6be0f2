//! Generation backends behind [`merlin_core::GenerationClient`].

pub mod anthropic;
pub mod converter;
mod http;
pub mod mock;
pub mod models;
pub mod noop;
pub mod openai;
pub mod retry;
pub mod sse;

pub use anthropic::AnthropicClient;
pub use mock::{MockClient, MockResponse, MockStep};
pub use noop::NoOpClient;
pub use openai::OpenAiClient;
pub use retry::{RetryConfig, RetryingClient};
