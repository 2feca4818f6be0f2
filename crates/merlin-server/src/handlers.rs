//! HTTP handlers for the chat API.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use merlin_core::events::StreamEvent;
use merlin_core::ids::{CharacterId, SessionId, SessionKey, UserId};
use merlin_core::prompt::Role;
use merlin_core::repository::StoredMessage;
use merlin_core::stream::Usage;
use merlin_engine::prompt::opening_message;
use merlin_engine::{TurnOutcome, TurnRequest};
use merlin_store::NewSession;
use merlin_telemetry::{new_trace_id, TRACE_HEADER};

use crate::error::ApiError;
use crate::event_bridge::event_stream;
use crate::server::AppState;

pub const USER_HEADER: &str = "x-user-id";
pub const MAX_MESSAGE_CHARS: usize = 8000;
/// Cap on free-text session context such as the story brief.
pub const MAX_CONTEXT_CHARS: usize = 4000;
const DEFAULT_HISTORY_PAGE: usize = 50;
const DEFAULT_TITLE: &str = "A New Adventure";
const EVENT_BUFFER: usize = 64;

/// Correlation id of the current request, set by [`propagate_trace`].
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

/// Reuse the caller's `x-trace-id` or mint one, and echo it on the response.
pub async fn propagate_trace(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(new_trace_id);
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

/// Identity resolved by the fronting proxy.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user_id: UserId,
    pub trace_id: String,
}

impl Caller {
    fn key(&self, session_id: String) -> SessionKey {
        SessionKey::new(self.user_id.clone(), SessionId::from_raw(session_id))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized)?;
        let trace_id = parts
            .extensions
            .get::<TraceId>()
            .map(|t| t.0.clone())
            .unwrap_or_else(new_trace_id);
        Ok(Self {
            user_id: UserId::from_raw(user_id),
            trace_id,
        })
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

fn validate_message(message: &str) -> Result<(), ApiError> {
    let chars = message.chars().count();
    if chars == 0 || chars > MAX_MESSAGE_CHARS {
        return Err(ApiError::Validation(format!(
            "message must be 1 to {MAX_MESSAGE_CHARS} characters, got {chars}"
        )));
    }
    Ok(())
}

fn validate_context(field: &str, value: Option<&str>) -> Result<(), ApiError> {
    let chars = value.map_or(0, |v| v.chars().count());
    if chars > MAX_CONTEXT_CHARS {
        return Err(ApiError::Validation(format!(
            "{field} must be at most {MAX_CONTEXT_CHARS} characters, got {chars}"
        )));
    }
    Ok(())
}

/// Owned session that still accepts turns.
fn require_open(state: &AppState, key: &SessionKey) -> Result<(), ApiError> {
    let row = state.sessions.get(&key.user_id, &key.session_id)?;
    if row.is_archived() {
        return Err(ApiError::Forbidden(format!(
            "session {} is archived",
            key.session_id
        )));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── Health & metrics ──

pub async fn health(State(state): State<AppState>) -> Response {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);
    let coordinator = &state.coordinator;

    let body = serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "service": "merlin",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
        "backend": coordinator.client().name(),
        "model": coordinator.client().model(),
        "circuitState": coordinator.breaker().state_name(),
        "activeTurns": coordinator.registry().active_count(),
        "components": {
            "database": if db_ok { "ok" } else { "error" },
        },
    });
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.coordinator.metrics().snapshot()).into_response()
}

// ── Sessions ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionBody {
    pub character_id: String,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub story_brief: Option<String>,
    #[serde(default)]
    pub status_summary: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub character_sheet: Option<String>,
}

/// Resume the caller's storyline with a character, or open a new one that
/// starts with the narrator's greeting.
pub async fn active_session(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<ActiveSessionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = json_body(payload)?;
    if body.character_id.trim().is_empty() {
        return Err(ApiError::Validation("characterId must not be empty".into()));
    }

    validate_context("storyBrief", body.story_brief.as_deref())?;
    validate_context("statusSummary", body.status_summary.as_deref())?;
    validate_context("characterSheet", body.character_sheet.as_deref())?;

    let mut seed = NewSession {
        character_name: non_blank(body.character_name),
        title: non_blank(body.title).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        story_brief: non_blank(body.story_brief),
        status_summary: non_blank(body.status_summary),
        location: non_blank(body.location),
        character_sheet: non_blank(body.character_sheet),
        opening: None,
    };
    seed.opening = Some(opening_message(
        seed.character_name.as_deref(),
        &seed.title,
        seed.story_brief.as_deref(),
        seed.status_summary.as_deref(),
    ));
    let (row, created) = state.sessions.get_or_create_active(
        &caller.user_id,
        &CharacterId::from_raw(body.character_id),
        &seed,
    )?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(row)).into_response())
}

pub async fn get_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let row = state
        .sessions
        .get(&caller.user_id, &SessionId::from_raw(session_id))?;
    Ok(Json(row).into_response())
}

/// End the storyline. Its running turn, if any, is cancelled; the next
/// `active` call for the character opens a fresh session.
pub async fn archive_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let key = caller.key(session_id);
    let row = state.sessions.archive(&key.user_id, &key.session_id)?;
    state.coordinator.cancel(&key);
    Ok(Json(row).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub message_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for HistoryMessage {
    fn from(m: StoredMessage) -> Self {
        Self {
            message_id: m.id,
            role: m.role,
            content: m.content,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: SessionId,
    pub messages: Vec<HistoryMessage>,
    pub has_more: bool,
}

/// Without `after`, the latest page and whether older messages exist. With
/// `after`, the next page forward; `hasMore` stays true while pages are
/// non-empty so pollers keep asking.
pub async fn history(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    let session_id = SessionId::from_raw(session_id);
    state.sessions.get(&caller.user_id, &session_id)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .clamp(1, state.config.max_history_page.max(1));
    let messages = state.messages.list(&session_id, query.after, limit)?;
    let has_more = match query.after {
        None => state.messages.count(&session_id)? > messages.len() as u64,
        Some(_) => !messages.is_empty(),
    };

    Ok(Json(HistoryResponse {
        session_id,
        messages: messages.into_iter().map(HistoryMessage::from).collect(),
        has_more,
    })
    .into_response())
}

// ── Turns ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnBody {
    pub message: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

fn turn_request(caller: &Caller, key: SessionKey, body: TurnBody) -> TurnRequest {
    TurnRequest {
        key,
        message: body.message,
        client_message_id: body.client_message_id,
        trace_id: Some(caller.trace_id.clone()),
    }
}

/// Stream a turn as `text/event-stream`. The turn runs on its own task; a
/// client that disconnects drops the receiver and cancels it.
pub async fn turn(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
    payload: Result<Json<TurnBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = json_body(payload)?;
    validate_message(&body.message)?;
    let key = caller.key(session_id);
    require_open(&state, &key)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    let coordinator = Arc::clone(&state.coordinator);
    let request = turn_request(&caller, key, body);
    tokio::spawn(async move {
        if let Err(e) = coordinator.submit(request, tx).await {
            tracing::warn!(error = %e, "streamed turn failed");
        }
    });

    let stream = event_stream(rx, state.config.heartbeat_interval);
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message_id: Option<i64>,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
}

async fn drain(mut rx: mpsc::Receiver<StreamEvent>) {
    while rx.recv().await.is_some() {}
}

/// Run a turn to completion and answer with the assistant message.
pub async fn message(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
    payload: Result<Json<TurnBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = json_body(payload)?;
    validate_message(&body.message)?;
    let key = caller.key(session_id);
    require_open(&state, &key)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    let request = turn_request(&caller, key, body);
    let (outcome, ()) = tokio::join!(state.coordinator.submit(request, tx), drain(rx));

    let response = match outcome? {
        TurnOutcome::Completed {
            message_id,
            text,
            usage,
        } => MessageResponse {
            message_id,
            role: Role::Assistant,
            content: text,
            usage: Some(usage),
            cooldown_seconds: None,
        },
        TurnOutcome::Degraded {
            message_id,
            text,
            cooldown_seconds,
        } => MessageResponse {
            message_id,
            role: Role::Assistant,
            content: text,
            usage: None,
            cooldown_seconds: Some(cooldown_seconds),
        },
        TurnOutcome::Conflict => return Err(ApiError::Conflict),
        TurnOutcome::Cancelled => return Err(ApiError::Cancelled),
        TurnOutcome::Failed { error } => return Err(ApiError::Backend(error.to_string())),
    };
    Ok(Json(response).into_response())
}

/// Signal the session's running turn, if any. Never waits.
pub async fn cancel(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Response {
    let key = caller.key(session_id);
    let cancelled = state.coordinator.cancel(&key);
    if cancelled {
        tracing::info!(session_id = %key.session_id, "turn cancel requested");
    }
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use merlin_core::errors::GatewayError;
    use merlin_engine::{TurnConfig, TurnCoordinator};
    use merlin_core::stream::Chunk;
    use merlin_llm::{MockClient, MockResponse, MockStep};
    use merlin_store::{Database, SqliteTurnRepository};

    use crate::server::{start, ServerConfig, ServerHandle};

    struct TestServer {
        handle: ServerHandle,
        http: reqwest::Client,
    }

    impl TestServer {
        async fn new(responses: Vec<MockResponse>) -> Self {
            let db = Database::in_memory().unwrap();
            let coordinator = TurnCoordinator::new(
                Arc::new(MockClient::new(responses)),
                Arc::new(SqliteTurnRepository::new(db.clone())),
                TurnConfig::default(),
            );
            let config = ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                ..Default::default()
            };
            let handle = start(config, Arc::new(coordinator), db).await.unwrap();
            Self {
                handle,
                http: reqwest::Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{}", self.handle.port, path)
        }

        fn post(&self, path: &str, user: &str) -> reqwest::RequestBuilder {
            self.http.post(self.url(path)).header(USER_HEADER, user)
        }

        fn get(&self, path: &str, user: &str) -> reqwest::RequestBuilder {
            self.http.get(self.url(path)).header(USER_HEADER, user)
        }

        async fn open_session(&self, user: &str) -> String {
            let resp = self
                .post("/v1/chat/sessions/active", user)
                .json(&serde_json::json!({
                    "characterId": "char_1",
                    "characterName": "Elara",
                    "title": "The Sunken Keep",
                    "storyBrief": "A keep swallowed by the marsh.",
                }))
                .send()
                .await
                .unwrap();
            assert!(resp.status().is_success());
            let body: serde_json::Value = resp.json().await.unwrap();
            body["sessionId"].as_str().unwrap().to_string()
        }

        async fn history(&self, user: &str, session_id: &str) -> serde_json::Value {
            self.get(&format!("/v1/chat/sessions/{session_id}/history"), user)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn health_reports_breaker_and_turns() {
        let server = TestServer::new(Vec::new()).await;
        let resp = server.http.get(server.url("/v1/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().contains_key(TRACE_HEADER));

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["circuitState"], "closed");
        assert_eq!(body["activeTurns"], 0);
    }

    #[tokio::test]
    async fn trace_id_is_echoed() {
        let server = TestServer::new(Vec::new()).await;
        let resp = server
            .http
            .get(server.url("/v1/metrics"))
            .header(TRACE_HEADER, "trace-abc")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()[TRACE_HEADER], "trace-abc");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["turnsStarted"], 0);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let server = TestServer::new(Vec::new()).await;
        let resp = server
            .http
            .post(server.url("/v1/chat/sessions/active"))
            .json(&serde_json::json!({ "characterId": "char_1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn new_session_opens_with_greeting() {
        let server = TestServer::new(Vec::new()).await;
        let first = server
            .post("/v1/chat/sessions/active", "user_1")
            .json(&serde_json::json!({ "characterId": "char_1", "title": "The Sunken Keep" }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 201);
        let session: serde_json::Value = first.json().await.unwrap();
        let session_id = session["sessionId"].as_str().unwrap();

        let again = server
            .post("/v1/chat/sessions/active", "user_1")
            .json(&serde_json::json!({ "characterId": "char_1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 200);
        let again: serde_json::Value = again.json().await.unwrap();
        assert_eq!(again["sessionId"], session_id);

        let history = server.history("user_1", session_id).await;
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "assistant");
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("Welcome to The Sunken Keep!"));
        assert_eq!(history["hasMore"], false);
    }

    #[tokio::test]
    async fn greeting_includes_starting_status() {
        let server = TestServer::new(Vec::new()).await;
        let resp = server
            .post("/v1/chat/sessions/active", "user_1")
            .json(&serde_json::json!({
                "characterId": "char_1",
                "characterName": "Elara",
                "title": "The Sunken Keep",
                "storyBrief": "A keep swallowed by the marsh.",
                "statusSummary": "You wade toward the gate.",
            }))
            .send()
            .await
            .unwrap();
        let session: serde_json::Value = resp.json().await.unwrap();
        let history = server
            .history("user_1", session["sessionId"].as_str().unwrap())
            .await;
        assert_eq!(
            history["messages"][0]["content"],
            "Greetings, Elara! Welcome to The Sunken Keep! A keep swallowed by the marsh. \
             You wade toward the gate. How do you proceed, adventurer?"
        );
    }

    #[tokio::test]
    async fn oversized_session_context_is_rejected() {
        let server = TestServer::new(Vec::new()).await;
        for field in ["storyBrief", "characterSheet"] {
            let resp = server
                .post("/v1/chat/sessions/active", "user_1")
                .json(&serde_json::json!({
                    "characterId": "char_1",
                    field: "lore ".repeat(MAX_CONTEXT_CHARS),
                }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 422, "{field}");
        }

        let ok = server
            .post("/v1/chat/sessions/active", "user_1")
            .json(&serde_json::json!({
                "characterId": "char_1",
                "storyBrief": "s".repeat(MAX_CONTEXT_CHARS),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 201);
    }

    #[tokio::test]
    async fn archived_session_refuses_turns() {
        let server = TestServer::new(vec![MockResponse::stream_text("Unused.")]).await;
        let session_id = server.open_session("user_1").await;

        let foreign = server
            .post(&format!("/v1/chat/sessions/{session_id}/archive"), "user_2")
            .send()
            .await
            .unwrap();
        assert_eq!(foreign.status(), 404);

        let archived = server
            .post(&format!("/v1/chat/sessions/{session_id}/archive"), "user_1")
            .send()
            .await
            .unwrap();
        assert_eq!(archived.status(), 200);
        let archived: serde_json::Value = archived.json().await.unwrap();
        assert!(archived["archivedAt"].is_string());

        for endpoint in ["turn", "message"] {
            let resp = server
                .post(&format!("/v1/chat/sessions/{session_id}/{endpoint}"), "user_1")
                .json(&serde_json::json!({ "message": "Hello?" }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 403, "{endpoint}");
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["code"], "FORBIDDEN");
        }

        let fresh = server.open_session("user_1").await;
        assert_ne!(fresh, session_id);
    }

    #[tokio::test]
    async fn sessions_are_private() {
        let server = TestServer::new(Vec::new()).await;
        let session_id = server.open_session("user_1").await;

        let own = server
            .get(&format!("/v1/chat/sessions/{session_id}"), "user_1")
            .send()
            .await
            .unwrap();
        assert_eq!(own.status(), 200);

        let foreign = server
            .get(&format!("/v1/chat/sessions/{session_id}"), "user_2")
            .send()
            .await
            .unwrap();
        assert_eq!(foreign.status(), 404);

        let history = server
            .get(&format!("/v1/chat/sessions/{session_id}/history"), "user_2")
            .send()
            .await
            .unwrap();
        assert_eq!(history.status(), 404);
    }

    #[tokio::test]
    async fn turn_streams_tokens_then_done() {
        let server = TestServer::new(vec![MockResponse::stream_words(&["The door ", "creaks."])]).await;
        let session_id = server.open_session("user_1").await;

        let resp = server
            .post(&format!("/v1/chat/sessions/{session_id}/turn"), "user_1")
            .json(&serde_json::json!({ "message": "I push the door.", "clientMessageId": "c-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE.as_str()], "text/event-stream");

        let body = resp.text().await.unwrap();
        let token_frames = body.matches("event: token\n").count();
        assert_eq!(token_frames, 2);
        assert!(body.contains("data: {\"text\":\"The door \"}"));
        assert!(body.trim_end().lines().rev().any(|l| l == "event: done"));
        assert!(body.contains("\"messageId\""));

        let history = server.history("user_1", &session_id).await;
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"], "I push the door.");
        assert_eq!(messages[2]["content"], "The door creaks.");
    }

    #[tokio::test]
    async fn turn_rejects_invalid_messages() {
        let server = TestServer::new(Vec::new()).await;
        let session_id = server.open_session("user_1").await;
        let path = format!("/v1/chat/sessions/{session_id}/turn");

        let empty = server
            .post(&path, "user_1")
            .json(&serde_json::json!({ "message": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 422);

        let long = server
            .post(&path, "user_1")
            .json(&serde_json::json!({ "message": "a".repeat(MAX_MESSAGE_CHARS + 1) }))
            .send()
            .await
            .unwrap();
        assert_eq!(long.status(), 422);

        let missing = server
            .post(&path, "user_1")
            .json(&serde_json::json!({ "text": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 422);
    }

    #[tokio::test]
    async fn turn_on_unknown_session_is_not_found() {
        let server = TestServer::new(Vec::new()).await;
        let resp = server
            .post("/v1/chat/sessions/sess_missing/turn", "user_1")
            .json(&serde_json::json!({ "message": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn blocking_message_returns_assistant_reply() {
        let server = TestServer::new(vec![MockResponse::stream_text_with_usage(
            "Mist curls around your boots.",
            Usage::new(50, 7),
        )])
        .await;
        let session_id = server.open_session("user_1").await;

        let resp = server
            .post(&format!("/v1/chat/sessions/{session_id}/message"), "user_1")
            .json(&serde_json::json!({ "message": "I look around." }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["content"], "Mist curls around your boots.");
        assert_eq!(body["usage"]["completion_tokens"], 7);
        assert!(body["messageId"].as_i64().is_some());
    }

    #[tokio::test]
    async fn blocking_message_maps_backend_failure() {
        let server = TestServer::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad key".into()),
        )])
        .await;
        let session_id = server.open_session("user_1").await;

        let resp = server
            .post(&format!("/v1/chat/sessions/{session_id}/message"), "user_1")
            .json(&serde_json::json!({ "message": "Hello?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "BACKEND_FAILURE");

        // The failed turn left only the greeting behind.
        let history = server.history("user_1", &session_id).await;
        assert_eq!(history["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_without_turn_reports_false() {
        let server = TestServer::new(Vec::new()).await;
        let session_id = server.open_session("user_1").await;
        let resp = server
            .post(&format!("/v1/chat/sessions/{session_id}/cancel"), "user_1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["cancelled"], false);
    }

    #[tokio::test]
    async fn second_turn_conflicts_until_first_is_cancelled() {
        let server = TestServer::new(vec![MockResponse::stalled_after("You hear ")]).await;
        let session_id = server.open_session("user_1").await;

        let mut streaming = server
            .post(&format!("/v1/chat/sessions/{session_id}/turn"), "user_1")
            .json(&serde_json::json!({ "message": "I listen." }))
            .send()
            .await
            .unwrap();
        let mut received = String::new();
        while !received.contains("event: token") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), streaming.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            received.push_str(std::str::from_utf8(&chunk).unwrap());
        }

        let conflict = server
            .post(&format!("/v1/chat/sessions/{session_id}/message"), "user_1")
            .json(&serde_json::json!({ "message": "I shout." }))
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), 409);

        let cancel = server
            .post(&format!("/v1/chat/sessions/{session_id}/cancel"), "user_1")
            .send()
            .await
            .unwrap();
        let cancel: serde_json::Value = cancel.json().await.unwrap();
        assert_eq!(cancel["cancelled"], true);

        let rest = streaming.text().await.unwrap();
        assert!(rest.contains("event: error"));
        assert!(rest.contains("CANCELLED"));

        // Neither turn was persisted.
        let history = server.history("user_1", &session_id).await;
        assert_eq!(history["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_stream_gets_conflict_frame_while_first_completes() {
        let server = TestServer::new(vec![MockResponse::Stream(vec![
            MockStep::Chunk(Chunk::delta("A bell ")),
            MockStep::Pause(Duration::from_secs(1)),
            MockStep::Chunk(Chunk::delta("tolls.")),
            MockStep::Chunk(Chunk::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }),
        ])])
        .await;
        let session_id = server.open_session("user_1").await;
        let path = format!("/v1/chat/sessions/{session_id}/turn");

        let mut first = server
            .post(&path, "user_1")
            .json(&serde_json::json!({ "message": "I listen." }))
            .send()
            .await
            .unwrap();
        let mut received = String::new();
        while !received.contains("event: token") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), first.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            received.push_str(std::str::from_utf8(&chunk).unwrap());
        }

        let second = server
            .post(&path, "user_1")
            .json(&serde_json::json!({ "message": "I shout." }))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 200);
        let second = second.text().await.unwrap();
        assert_eq!(second.matches("event: ").count(), 1);
        assert!(second.starts_with("event: error\n"));
        assert!(second.contains("\"code\":\"TURN_CONFLICT\""));

        received.push_str(&first.text().await.unwrap());
        assert!(received.contains("data: {\"text\":\"tolls.\"}"));
        assert!(received.contains("event: done\n"));
        assert!(!received.contains("event: error"));

        let history = server.history("user_1", &session_id).await;
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"], "I listen.");
        assert_eq!(messages[2]["content"], "A bell tolls.");
    }

    #[tokio::test]
    async fn history_pages_forward_after_cursor() {
        let server = TestServer::new(vec![
            MockResponse::stream_text("First reply."),
            MockResponse::stream_text("Second reply."),
        ])
        .await;
        let session_id = server.open_session("user_1").await;
        for message in ["one", "two"] {
            let resp = server
                .post(&format!("/v1/chat/sessions/{session_id}/message"), "user_1")
                .json(&serde_json::json!({ "message": message }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let latest: serde_json::Value = server
            .get(&format!("/v1/chat/sessions/{session_id}/history?limit=2"), "user_1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let page = latest["messages"].as_array().unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1]["content"], "Second reply.");
        assert_eq!(latest["hasMore"], true);

        let first_id = page[0]["messageId"].as_i64().unwrap();
        let forward: serde_json::Value = server
            .get(
                &format!("/v1/chat/sessions/{session_id}/history?after={first_id}&limit=10"),
                "user_1",
            )
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(forward["messages"].as_array().unwrap().len(), 1);
    }
}
