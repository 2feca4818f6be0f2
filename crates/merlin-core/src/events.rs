//! Turn events and their text event-stream encoding.
//!
//! Each event is framed as `event: <kind>\ndata: <json>\n\n`. Idle connections
//! receive `: ping\n\n` comments, which consumers ignore.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

const HEARTBEAT: &[u8] = b": ping\n\n";

/// Machine-readable code carried by `error` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TurnConflict,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnConflict => "TURN_CONFLICT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
}

/// Present on `done` when the turn was answered without calling the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Degraded {
    pub reason: String,
    pub cooldown_seconds: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub usage: UsageSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<Degraded>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub text: String,
}

/// Events produced by the turn coordinator for the transport. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Token(TokenPayload),
    Done(DonePayload),
    Error(ErrorPayload),
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token(TokenPayload { text: text.into() })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    /// `done` and `error` close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error(payload) => Some(payload.code),
            _ => None,
        }
    }
}

/// Encode one event as an event-stream frame.
pub fn encode(event: &StreamEvent) -> Bytes {
    let data = match event {
        StreamEvent::Token(payload) => serde_json::to_string(payload),
        StreamEvent::Done(payload) => serde_json::to_string(payload),
        StreamEvent::Error(payload) => serde_json::to_string(payload),
    }
    .unwrap_or_else(|_| "{}".to_string());

    Bytes::from(format!("event: {}\ndata: {}\n\n", event.kind(), data))
}

/// Keep-alive comment frame.
pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT)
}
