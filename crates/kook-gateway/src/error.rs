//! Error types for the gateway.

use std::time::Duration;

use kook_api::ApiError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::signal::hello_code;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// `gateway/index` (or another REST call the bot needed) failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The stream ended or the server sent a close frame.
    #[error("Gateway connection lost")]
    ConnectionLost,

    #[error("No HELLO within {0:?}")]
    HelloTimeout(Duration),

    #[error("Expected HELLO as first frame, got signal {0}")]
    UnexpectedFirstFrame(i64),

    #[error("HELLO rejected with code {code}")]
    HelloRejected { code: i64 },

    /// The server refused to resume; session state has been discarded.
    #[error("Resume rejected ({code}): {err}")]
    ResumeRejected { code: i64, err: String },

    #[error("Heartbeat not acknowledged")]
    HeartbeatTimeout,

    #[error("Failed to inflate compressed frame: {0}")]
    Inflate(#[source] std::io::Error),

    #[error("Malformed gateway frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Gave up after {attempts} failed connect attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },

    #[error("Bot {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Bot has not been started")]
    NotStarted,

    #[error("Session is closed")]
    Closed,
}

impl GatewayError {
    /// Whether another connect attempt could succeed.
    ///
    /// Credential problems (bad token, malformed authorization or base URL)
    /// and lifecycle errors are not; everything on the wire is.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Api(api) => !matches!(
                api,
                ApiError::InvalidAuthorization | ApiError::InvalidUrl(_)
            ),
            Self::HelloRejected { code } => !matches!(
                *code,
                hello_code::INVALID_TOKEN
                    | hello_code::TOKEN_VERIFICATION_FAILED
                    | hello_code::TOKEN_EXPIRED
            ),
            Self::AttemptsExhausted { .. }
            | Self::AlreadyRegistered(_)
            | Self::NotStarted
            | Self::Closed => false,
            _ => true,
        }
    }

    /// Network-level failure, as opposed to a protocol violation.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Api(api) => api.is_transport(),
            Self::Transport(_) | Self::ConnectionLost | Self::HeartbeatTimeout => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
