//! # kook-bot
//!
//! Runs every bot listed in the configuration, one gateway session each,
//! and logs the events they receive:
//! - REST executor shared by all bots (rate-limit aware)
//! - Gateway sessions with heartbeat and resume
//!
//! Stops on Ctrl-C, letting in-flight events finish.

use std::sync::Arc;

use kook_api::RestClient;
use kook_gateway::{BotRegistry, CancelMode, EventFrame, KookBot, SessionConfig, processor_fn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = kook_common::config::load()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kook=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting kook-bot v{}", env!("CARGO_PKG_VERSION"));

    if config.bots.is_empty() {
        anyhow::bail!("no bots configured: add a [[bots]] entry to kook.toml");
    }

    let rest = RestClient::from_config(&config.api)?;
    let session_config = SessionConfig::from(&config.gateway);
    tracing::info!(
        base_url = %config.api.base_url,
        dispatch = ?session_config.dispatch,
        "REST executor ready"
    );

    let registry = BotRegistry::new();
    for credentials in &config.bots {
        let bot = KookBot::builder(credentials.ticket())
            .rest(rest.clone())
            .config(session_config.clone())
            .processor(processor_fn(log_event))
            .build()?;
        registry.register(bot).await?;
    }

    let failures = registry.start_all().await;
    for (client_id, error) in &failures {
        tracing::error!(client_id = %client_id, error = %error, "bot failed to start");
    }
    if failures.len() == config.bots.len() {
        anyhow::bail!("no bot could connect");
    }

    for client_id in registry.client_ids().await {
        let Some(bot) = registry.get(&client_id).await else {
            continue;
        };
        if let Some(me) = bot.me().await {
            tracing::info!(client_id = %client_id, username = %me.username, "bot online");
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    for (client_id, error) in registry.close_all(CancelMode::Soft).await {
        tracing::warn!(client_id = %client_id, error = %error, "bot did not close cleanly");
    }
    Ok(())
}

async fn log_event(frame: Arc<EventFrame>) -> anyhow::Result<()> {
    let event = &frame.event;
    if event.is_system() {
        match event.extra().as_system() {
            Some(system) => tracing::info!(sn = frame.sn, kind = system.kind(), target = %event.target_id, "system event"),
            None => tracing::debug!(sn = frame.sn, "system event without a readable body"),
        }
        return Ok(());
    }
    tracing::info!(
        sn = frame.sn,
        channel = ?event.channel_type,
        kind = ?event.event_type(),
        target = %event.target_id,
        author = %event.author_id,
        content = %event.content,
        "message"
    );
    Ok(())
}
