use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Token counters reported by a backend for one generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Per-million-token prices of a model, in USD.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub const FREE: Pricing = Pricing {
        input_per_mtok: 0.0,
        output_per_mtok: 0.0,
    };

    pub fn cost(&self, usage: &Usage) -> f64 {
        let input = usage.prompt_tokens as f64 * self.input_per_mtok / 1_000_000.0;
        let output = usage.completion_tokens as f64 * self.output_per_mtok / 1_000_000.0;
        input + output
    }
}

/// Items yielded by a generation stream. Ordering contract:
///
/// Delta* → (Done | Error)
///
/// A stream that ends without a terminal item was interrupted.
#[derive(Clone, Debug)]
pub enum Chunk {
    Delta {
        text: String,
    },
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    Error {
        error: GatewayError,
    },
}

impl Chunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Result of a single-shot generation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}
