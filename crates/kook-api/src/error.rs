//! Error types for the request executor.

use thiserror::Error;

use crate::rate_limit::RateLimit;
use crate::result::ApiResult;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection refused, reset, timed out, or the body could not be read.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx status whose body is not a result envelope.
    #[error("API responded with status {status}")]
    Status {
        status: u16,
        rate_limit: RateLimit,
        raw: String,
    },

    /// A 2xx body that is not valid JSON, or a payload that does not match
    /// the requested shape. `raw` keeps the body for diagnostics.
    #[error("Malformed API response: {source}")]
    Decode {
        source: serde_json::Error,
        raw: String,
    },

    /// The envelope arrived but reported failure (`code != 0`).
    #[error("API result error {code}: {message}")]
    Result {
        code: i64,
        message: String,
        result: Box<ApiResult>,
    },

    /// HTTP 429. Nothing is retried here; the snapshot says when the
    /// bucket (or the global ceiling, see `rate_limit.is_global`) resets.
    #[error(
        "Rate limited (bucket: {bucket:?}, global: {global}), resets in {reset}s",
        bucket = .rate_limit.bucket,
        global = .rate_limit.is_global,
        reset = .rate_limit.reset
    )]
    RateLimited {
        rate_limit: RateLimit,
        result: Box<ApiResult>,
    },

    #[error("Authorization value is not a valid header value")]
    InvalidAuthorization,

    #[error("Invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// The envelope behind this error, when one was received.
    pub fn result(&self) -> Option<&ApiResult> {
        match self {
            Self::Result { result, .. } | Self::RateLimited { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimit> {
        match self {
            Self::Status { rate_limit, .. } | Self::RateLimited { rate_limit, .. } => {
                Some(rate_limit)
            }
            Self::Result { result, .. } => Some(&result.rate_limit),
            _ => None,
        }
    }

    /// Raw response body, kept for logging whenever one was read.
    pub fn raw_body(&self) -> Option<&str> {
        match self {
            Self::Status { raw, .. } | Self::Decode { raw, .. } => Some(raw),
            Self::Result { result, .. } | Self::RateLimited { result, .. } => Some(&result.raw),
            _ => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Result { result, .. } | Self::RateLimited { result, .. } => {
                Some(result.http_status.as_u16())
            }
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Transport failures are worth retrying later; everything else needs a
    /// decision from the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
