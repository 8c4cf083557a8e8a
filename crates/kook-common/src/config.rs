//! Bot configuration loaded from defaults, an optional `kook.toml`, and the
//! environment.
//!
//! Precedence: env vars > `.env` file > `kook.toml` > defaults. Environment
//! keys use `__` both after the prefix and between sections, e.g.
//! `KOOK__GATEWAY__COMPRESS=false`.
//!
//! Nothing is cached process-wide: every call to [`load`] builds a fresh
//! [`AppConfig`] that the caller owns.

use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::ticket::{Ticket, TokenKind};

pub const DEFAULT_BASE_URL: &str = "https://www.kookapp.cn/api/v3";

/// Load configuration from the environment and an optional `kook.toml`.
pub fn load() -> Result<AppConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = with_defaults(Config::builder())?
        .add_source(File::with_name("kook").required(false))
        .add_source(
            Environment::with_prefix("KOOK")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    tracing::debug!(bots = app_config.bots.len(), "configuration loaded");
    Ok(app_config)
}

/// Layer a TOML document over the defaults. Environment is not consulted.
pub fn from_toml_str(toml: &str) -> Result<AppConfig, ConfigError> {
    with_defaults(Config::builder())?
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize()
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("api.base_url", DEFAULT_BASE_URL)?
        .set_default("api.connect_timeout_ms", 5_000)?
        .set_default("api.request_timeout_ms", 5_000)?
        .set_default("gateway.compress", true)?
        .set_default("gateway.hello_timeout_ms", 6_000)?
        .set_default("gateway.heartbeat_interval_ms", 30_000)?
        .set_default("gateway.heartbeat_jitter_ms", 5_000)?
        .set_default("gateway.heartbeat_ack_timeout_ms", 6_000)?
        .set_default("gateway.heartbeat_ack_retries", 2)?
        .set_default("gateway.max_attempts", 3)?
        .set_default("gateway.backoff_initial_ms", 1_000)?
        .set_default("gateway.backoff_max_ms", 30_000)?
        .set_default("gateway.dispatch", "sequential")
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bots: Vec<BotCredentials>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Versioned REST root, e.g. `https://www.kookapp.cn/api/v3`.
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Ask the server for zlib-compressed frames.
    pub compress: bool,
    /// How long a fresh stream may take to deliver HELLO.
    pub hello_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Random spread applied to each heartbeat interval, in either direction.
    pub heartbeat_jitter_ms: u64,
    pub heartbeat_ack_timeout_ms: u64,
    /// Extra ack waits before the connection is declared lost.
    pub heartbeat_ack_retries: u32,
    /// Consecutive failed connect attempts tolerated before giving up.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub dispatch: DispatchPolicy,
}

/// How the processor stage of the event pipeline is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// One frame's processor chain finishes before the next frame is read.
    #[default]
    Sequential,
    /// Each frame's processor chain runs as its own task; frames may finish
    /// out of order.
    Concurrent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotCredentials {
    pub client_id: String,
    pub token: String,
    #[serde(default)]
    pub kind: TokenKind,
}

impl BotCredentials {
    pub fn ticket(&self) -> Ticket {
        Ticket::new(&self.client_id, &self.token, self.kind)
    }
}
