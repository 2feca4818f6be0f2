//! HTTP surface: session management, streamed and blocking turns, cancel.

pub mod error;
pub mod event_bridge;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
