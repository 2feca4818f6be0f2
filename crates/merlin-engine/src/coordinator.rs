use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use merlin_core::errors::{GatewayError, RepositoryError};
use merlin_core::events::{Degraded, DonePayload, ErrorCode, StreamEvent, UsageSummary};
use merlin_core::ids::SessionKey;
use merlin_core::prompt::PromptStack;
use merlin_core::provider::{GenerateOptions, GenerationClient};
use merlin_core::repository::{TurnRepository, UnitOfWork};
use merlin_core::stream::{Chunk, Usage};
use merlin_telemetry::TurnMetrics;

use crate::breaker::CircuitBreaker;
use crate::budget::{apply_budget, estimate_text};
use crate::config::TurnConfig;
use crate::error::TurnError;
use crate::prompt::{assemble, degraded_reply};
use crate::registry::TurnRegistry;

/// A player message submitted against a session.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub key: SessionKey,
    pub message: String,
    pub client_message_id: Option<String>,
    pub trace_id: Option<String>,
}

/// How a turn ended. Every variant has already emitted its terminal event.
#[derive(Clone, Debug)]
pub enum TurnOutcome {
    Completed {
        message_id: Option<i64>,
        text: String,
        usage: Usage,
    },
    /// Answered with a static reply because the breaker was open.
    Degraded {
        message_id: Option<i64>,
        text: String,
        cooldown_seconds: u64,
    },
    Conflict,
    Cancelled,
    Failed {
        error: GatewayError,
    },
}

impl TurnOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Degraded { .. } => "degraded",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    Reserved,
    BuildingPrompt,
    Budgeting,
    BreakerCheck,
    Generating,
    Completing,
    Cancelled,
    Failed,
    Released,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::BuildingPrompt => "building_prompt",
            Self::Budgeting => "budgeting",
            Self::BreakerCheck => "breaker_check",
            Self::Generating => "generating",
            Self::Completing => "completing",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Released => "released",
        }
    }
}

fn enter(phase: TurnPhase) {
    debug!(phase = phase.as_str(), "turn phase");
}

enum Generated {
    Complete { text: String, usage: Option<Usage> },
    Cancelled,
    Failed(GatewayError),
}

/// Runs one player turn end to end: reservation, prompt, budget, breaker,
/// streaming generation and persistence.
pub struct TurnCoordinator {
    client: Arc<dyn GenerationClient>,
    repository: Arc<dyn TurnRepository>,
    registry: TurnRegistry,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<TurnMetrics>,
    config: TurnConfig,
}

impl TurnCoordinator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        repository: Arc<dyn TurnRepository>,
        config: TurnConfig,
    ) -> Self {
        Self {
            client,
            repository,
            registry: TurnRegistry::new(),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            metrics: Arc::new(TurnMetrics::new()),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TurnMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &TurnRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<TurnMetrics> {
        &self.metrics
    }

    pub fn client(&self) -> &Arc<dyn GenerationClient> {
        &self.client
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Signal the in-flight turn of `key`. Returns immediately.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        self.registry.cancel(key)
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    /// Run a turn, emitting events into `events`. Exactly one terminal event
    /// is sent on every path. Dropping the receiver cancels the turn.
    #[instrument(skip_all, fields(
        session_id = %request.key.session_id,
        user_id = %request.key.user_id,
        trace_id = request.trace_id.as_deref().unwrap_or_default(),
    ))]
    pub async fn submit(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        if self.registry.exists(&request.key) {
            return Ok(self.conflict(&events).await);
        }
        let cancel = CancellationToken::new();
        let Some(guard) =
            self.registry
                .try_reserve(&request.key, cancel, request.client_message_id.clone())
        else {
            return Ok(self.conflict(&events).await);
        };
        self.metrics.turn_started();
        enter(TurnPhase::Reserved);

        let result = self.run(&request, guard.cancel_token(), &events).await;
        match &result {
            Ok(outcome) => info!(outcome = outcome.name(), "turn finished"),
            Err(e) => error!(error = %e, "turn aborted"),
        }

        drop(guard);
        enter(TurnPhase::Released);
        result
    }

    async fn run(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        let mut uow = match self.repository.begin(&request.key).await {
            Ok(uow) => uow,
            Err(e) => return Err(self.persistence_failure(events, e).await),
        };
        if let Err(e) = uow
            .append_user_turn(&request.message, request.client_message_id.as_deref())
            .await
        {
            abandon(uow).await;
            return Err(self.persistence_failure(events, e).await);
        }

        enter(TurnPhase::BuildingPrompt);
        let context = match self
            .repository
            .load_context(&request.key, self.config.history_limit)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                abandon(uow).await;
                return Err(self.persistence_failure(events, e).await);
            }
        };
        let stack = assemble(&context, &request.message);

        enter(TurnPhase::Budgeting);
        let (stack, report) = apply_budget(
            &stack,
            self.config.soft_limit_tokens,
            self.config.hard_limit_tokens,
        );
        if report.applied {
            info!(
                budget_estimate = report.estimated_tokens,
                strategy = ?report.strategy,
                "prompt reduced to fit budget"
            );
        }

        if cancel.is_cancelled() || events.is_closed() {
            return Ok(self.cancelled(uow, events).await);
        }

        enter(TurnPhase::BreakerCheck);
        if self.breaker.is_open() {
            return self.degraded(uow, events).await;
        }

        enter(TurnPhase::Generating);
        let mut options = self.config.generation.clone();
        options.trace_id.clone_from(&request.trace_id);
        info!(
            provider = self.client.name(),
            model = self.client.model(),
            budget_estimate = report.estimated_tokens,
            circuit_state = "closed",
            "llm.call.start"
        );
        let started = Instant::now();
        match self.generate(&stack, &options, cancel, events).await {
            Generated::Complete { text, usage } => {
                let latency = started.elapsed();
                self.metrics.observe_generation(latency);
                self.breaker.record_success();
                let usage = usage
                    .unwrap_or_else(|| Usage::new(report.estimated_tokens, estimate_text(&text)));
                info!(
                    provider = self.client.name(),
                    model = self.client.model(),
                    latency_ms = latency.as_millis() as u64,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "llm.call.end"
                );
                self.complete(uow, events, text, usage).await
            }
            Generated::Cancelled => Ok(self.cancelled(uow, events).await),
            Generated::Failed(error) => {
                self.breaker.record_failure();
                warn!(
                    provider = self.client.name(),
                    model = self.client.model(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    error_kind = error.error_kind(),
                    error = %error,
                    circuit_state = self.breaker.state_name(),
                    "llm.call.error"
                );
                Ok(self.failed(uow, events, error).await)
            }
        }
    }

    /// Consume the generation stream, forwarding deltas as token events.
    async fn generate(
        &self,
        stack: &PromptStack,
        options: &GenerateOptions,
        cancel: &CancellationToken,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Generated {
        let deadline = Instant::now() + options.timeout;

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Generated::Cancelled,
            _ = events.closed() => return Generated::Cancelled,
            _ = sleep_until(deadline) => return Generated::Failed(GatewayError::Timeout(options.timeout)),
            opened = self.client.stream(stack, options) => match opened {
                Ok(stream) => stream,
                Err(e) => return Generated::Failed(e),
            },
        };

        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Generated::Cancelled,
                _ = events.closed() => return Generated::Cancelled,
                _ = sleep_until(deadline) => return Generated::Failed(GatewayError::Timeout(options.timeout)),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Chunk::Delta { text: delta }) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = events.send(StreamEvent::token(delta)) => sent.is_ok(),
                    };
                    if !sent {
                        return Generated::Cancelled;
                    }
                }
                Some(Chunk::Done { usage, .. }) => return Generated::Complete { text, usage },
                Some(Chunk::Error { error }) => return Generated::Failed(error),
                None => {
                    return Generated::Failed(GatewayError::StreamInterrupted(
                        "stream ended before completion".into(),
                    ))
                }
            }
        }
    }

    async fn complete(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        events: &mpsc::Sender<StreamEvent>,
        text: String,
        usage: Usage,
    ) -> Result<TurnOutcome, TurnError> {
        enter(TurnPhase::Completing);
        if let Err(e) = uow.append_assistant_turn(&text, &usage).await {
            abandon(uow).await;
            return Err(self.persistence_failure(events, e).await);
        }
        let committed = match uow.commit().await {
            Ok(committed) => committed,
            Err(e) => return Err(self.persistence_failure(events, e).await),
        };

        let done = DonePayload {
            usage: UsageSummary {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                cost: self.client.pricing().cost(&usage),
            },
            message_id: committed.assistant_message_id,
            degraded: None,
        };
        emit(events, StreamEvent::Done(done)).await;
        self.metrics.turn_completed();
        Ok(TurnOutcome::Completed {
            message_id: committed.assistant_message_id,
            text,
            usage,
        })
    }

    async fn degraded(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        let cooldown_seconds = self.breaker.remaining_cooldown();
        let text = degraded_reply(cooldown_seconds);
        warn!(
            circuit_state = "open",
            cooldown_seconds, "circuit open, answering with static reply"
        );

        if let Err(e) = uow.append_assistant_turn(&text, &Usage::default()).await {
            abandon(uow).await;
            return Err(self.persistence_failure(events, e).await);
        }
        let committed = match uow.commit().await {
            Ok(committed) => committed,
            Err(e) => return Err(self.persistence_failure(events, e).await),
        };

        emit(events, StreamEvent::token(text.clone())).await;
        let done = DonePayload {
            usage: UsageSummary::default(),
            message_id: committed.assistant_message_id,
            degraded: Some(Degraded {
                reason: "circuit_open".into(),
                cooldown_seconds,
            }),
        };
        emit(events, StreamEvent::Done(done)).await;
        self.metrics.turn_degraded();
        Ok(TurnOutcome::Degraded {
            message_id: committed.assistant_message_id,
            text,
            cooldown_seconds,
        })
    }

    async fn cancelled(
        &self,
        uow: Box<dyn UnitOfWork>,
        events: &mpsc::Sender<StreamEvent>,
    ) -> TurnOutcome {
        enter(TurnPhase::Cancelled);
        abandon(uow).await;
        emit(
            events,
            StreamEvent::error(ErrorCode::Cancelled, "turn cancelled"),
        )
        .await;
        self.metrics.turn_cancelled();
        TurnOutcome::Cancelled
    }

    async fn failed(
        &self,
        uow: Box<dyn UnitOfWork>,
        events: &mpsc::Sender<StreamEvent>,
        error: GatewayError,
    ) -> TurnOutcome {
        enter(TurnPhase::Failed);
        abandon(uow).await;
        emit(
            events,
            StreamEvent::error(ErrorCode::Internal, "generation failed"),
        )
        .await;
        self.metrics.turn_failed();
        TurnOutcome::Failed { error }
    }

    async fn conflict(&self, events: &mpsc::Sender<StreamEvent>) -> TurnOutcome {
        debug!("turn already in progress");
        emit(
            events,
            StreamEvent::error(
                ErrorCode::TurnConflict,
                "a turn is already in progress for this session",
            ),
        )
        .await;
        self.metrics.turn_conflicted();
        TurnOutcome::Conflict
    }

    async fn persistence_failure(
        &self,
        events: &mpsc::Sender<StreamEvent>,
        error: RepositoryError,
    ) -> TurnError {
        enter(TurnPhase::Failed);
        error!(error = %error, "turn persistence failed");
        emit(
            events,
            StreamEvent::error(ErrorCode::Internal, "failed to persist turn"),
        )
        .await;
        self.metrics.persistence_failed();
        TurnError::Persistence(error)
    }
}

/// Send to a receiver that may already be gone.
async fn emit(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

async fn abandon(uow: Box<dyn UnitOfWork>) {
    if let Err(e) = uow.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}
