//! # kook-common
//!
//! Credentials, configuration, and the handful of primitives shared by the
//! REST executor and the gateway session. No I/O lives here.

pub mod config;
pub mod ticket;

pub use config::{AppConfig, DispatchPolicy};
pub use ticket::{Ticket, TokenKind};
