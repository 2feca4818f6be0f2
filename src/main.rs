use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use tracing::Level;

use merlin_core::provider::{GenerateOptions, GenerationClient};
use merlin_engine::{BreakerConfig, TurnConfig, TurnCoordinator};
use merlin_llm::{AnthropicClient, NoOpClient, OpenAiClient, RetryConfig, RetryingClient};
use merlin_server::ServerConfig;
use merlin_store::{Database, SqliteTurnRepository};
use merlin_telemetry::TelemetryConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Noop,
    Openai,
    Anthropic,
}

/// Turn orchestration backend for narrated chat sessions.
#[derive(Debug, Parser)]
#[command(name = "merlin", version, about)]
struct Args {
    #[arg(long, env = "MERLIN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "MERLIN_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "MERLIN_DB_PATH", default_value = "data/merlin.db")]
    db_path: PathBuf,

    #[arg(long, env = "MERLIN_BACKEND", value_enum, default_value_t = Backend::Noop)]
    backend: Backend,

    /// Model name. Defaults to the backend's default model.
    #[arg(long, env = "MERLIN_MODEL")]
    model: Option<String>,

    /// Override the backend's API base URL.
    #[arg(long, env = "MERLIN_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "MERLIN_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long, env = "MERLIN_LOG_PRETTY")]
    log_pretty: bool,

    #[arg(long, env = "MERLIN_SOFT_LIMIT_TOKENS", default_value_t = 6000)]
    soft_limit_tokens: u32,

    #[arg(long, env = "MERLIN_HARD_LIMIT_TOKENS", default_value_t = 8000)]
    hard_limit_tokens: u32,

    #[arg(long, env = "MERLIN_HISTORY_LIMIT", default_value_t = 10)]
    history_limit: usize,

    #[arg(long, env = "MERLIN_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, env = "MERLIN_MAX_OUTPUT_TOKENS", default_value_t = 512)]
    max_output_tokens: u32,

    #[arg(long, env = "MERLIN_JSON_MODE")]
    json_mode: bool,

    #[arg(long, env = "MERLIN_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    #[arg(long, env = "MERLIN_BREAKER_THRESHOLD", default_value_t = 5)]
    breaker_threshold: u32,

    #[arg(long, env = "MERLIN_BREAKER_RESET_SECS", default_value_t = 60)]
    breaker_reset_secs: u64,

    #[arg(long, env = "MERLIN_HEARTBEAT_SECS", default_value_t = 15)]
    heartbeat_secs: u64,

    #[arg(long, env = "MERLIN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(long, env = "MERLIN_RETRY_BASE_MS", default_value_t = 1000)]
    retry_base_ms: u64,
}

impl Args {
    fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            soft_limit_tokens: self.soft_limit_tokens,
            hard_limit_tokens: self.hard_limit_tokens.max(self.soft_limit_tokens),
            history_limit: self.history_limit,
            generation: GenerateOptions {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                json_mode: self.json_mode,
                timeout: Duration::from_secs(self.timeout_secs),
                trace_id: None,
            },
            breaker: BreakerConfig {
                open_threshold: self.breaker_threshold.max(1),
                reset_after: Duration::from_secs(self.breaker_reset_secs),
            },
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            ..Default::default()
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..Default::default()
        }
    }
}

fn build_client(args: &Args) -> anyhow::Result<Arc<dyn GenerationClient>> {
    let client: Arc<dyn GenerationClient> = match args.backend {
        Backend::Noop => Arc::new(NoOpClient::new()),
        Backend::Openai => {
            let key = args
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY is required for the openai backend")?;
            let mut client = OpenAiClient::new(SecretString::from(key), args.model.as_deref())?;
            if let Some(base_url) = &args.base_url {
                client = client.with_base_url(base_url.clone());
            }
            Arc::new(RetryingClient::new(client, args.retry_config()))
        }
        Backend::Anthropic => {
            let key = args
                .anthropic_api_key
                .clone()
                .context("ANTHROPIC_API_KEY is required for the anthropic backend")?;
            let mut client = AnthropicClient::new(SecretString::from(key), args.model.as_deref())?;
            if let Some(base_url) = &args.base_url {
                client = client.with_base_url(base_url.clone());
            }
            Arc::new(RetryingClient::new(client, args.retry_config()))
        }
    };
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = merlin_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        json: !args.log_pretty,
        ..Default::default()
    });

    let db = Database::open(&args.db_path)
        .with_context(|| format!("failed to open database at {}", args.db_path.display()))?;

    let client = build_client(&args)?;
    tracing::info!(
        backend = client.name(),
        model = client.model(),
        "generation backend selected"
    );

    let coordinator = Arc::new(
        TurnCoordinator::new(
            client,
            Arc::new(SqliteTurnRepository::new(db.clone())),
            args.turn_config(),
        )
        .with_metrics(telemetry.metrics()),
    );

    let handle = merlin_server::start(args.server_config(), Arc::clone(&coordinator), db)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "merlin ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    let cancelled = coordinator.cancel_all();
    tracing::info!(cancelled, "shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_turn_config() {
        let args = Args::parse_from(["merlin"]);
        let config = args.turn_config();
        let defaults = TurnConfig::default();
        assert_eq!(config.soft_limit_tokens, defaults.soft_limit_tokens);
        assert_eq!(config.hard_limit_tokens, defaults.hard_limit_tokens);
        assert_eq!(config.history_limit, defaults.history_limit);
        assert_eq!(config.breaker.open_threshold, 5);
        assert_eq!(config.generation.timeout, Duration::from_secs(30));
        assert_eq!(args.backend, Backend::Noop);
    }

    #[test]
    fn hard_limit_never_below_soft() {
        let args = Args::parse_from([
            "merlin",
            "--soft-limit-tokens",
            "9000",
            "--hard-limit-tokens",
            "4000",
        ]);
        assert_eq!(args.turn_config().hard_limit_tokens, 9000);
    }

    #[test]
    fn remote_backend_requires_key() {
        let mut args = Args::parse_from(["merlin", "--backend", "openai"]);
        args.openai_api_key = None;
        assert!(build_client(&args).is_err());
    }

    #[test]
    fn noop_backend_needs_no_key() {
        let args = Args::parse_from(["merlin"]);
        let client = build_client(&args).unwrap();
        assert_eq!(client.name(), "noop");
    }
}
