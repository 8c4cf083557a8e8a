//! # kook-gateway
//!
//! The KOOK event stream: one [`GatewaySession`] per bot keeps a websocket
//! alive (handshake, heartbeat, resume), accepts EVENT frames in strict `sn`
//! order and feeds them to an [`EventPipeline`] of pre-processors and
//! processors. [`KookBot`] wires a session to a REST executor and a ticket;
//! [`BotRegistry`] groups bots by client id.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kook_common::Ticket;
//! use kook_gateway::{CancelMode, EventFrame, KookBot, processor_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kook_gateway::GatewayError> {
//!     let bot = KookBot::builder(Ticket::bot("client-id", "token"))
//!         .processor(processor_fn(|frame: Arc<EventFrame>| async move {
//!             println!("#{} {}", frame.sn, frame.event.content);
//!             Ok(())
//!         }))
//!         .build()?;
//!
//!     bot.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     bot.close(CancelMode::Soft).await
//! }
//! ```

pub mod bot;
pub mod compress;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod signal;
pub mod transport;

pub use bot::{KookBot, KookBotBuilder};
pub use error::{GatewayError, Result};
pub use event::{Event, EventExtra, EventFrame, SystemEvent};
pub use pipeline::{CancelMode, EventPipeline, EventProcessor, processor_fn};
pub use registry::BotRegistry;
pub use session::{GatewaySession, SessionConfig, SessionHandle, SessionState, SessionStatus};
pub use transport::{Connector, GatewayLocator, RestLocator, WsConnector};
