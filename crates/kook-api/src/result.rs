//! The `{code, message, data}` envelope and its typed decoding.

use std::any::TypeId;
use std::collections::HashMap;

use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, Result};
use crate::rate_limit::RateLimit;

/// `code` value of a successful envelope.
pub const SUCCESS_CODE: i64 = 0;

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Everything one API exchange produced, before the payload is typed.
#[derive(Debug, Clone)]
pub struct ApiResult {
    pub code: i64,
    pub message: String,
    /// Raw `data` subtree; `{}` when the envelope had none.
    pub data: Value,
    pub http_status: StatusCode,
    /// Full response body as received.
    pub raw: String,
    pub rate_limit: RateLimit,
}

impl ApiResult {
    pub(crate) fn from_envelope(
        envelope: Envelope,
        http_status: StatusCode,
        raw: String,
        rate_limit: RateLimit,
    ) -> Self {
        Self {
            code: envelope.code,
            message: envelope.message,
            data: envelope.data,
            http_status,
            raw,
            rate_limit,
        }
    }

    pub fn is_http_success(&self) -> bool {
        self.http_status.is_success()
    }

    /// 2xx and `code == 0`.
    pub fn is_success(&self) -> bool {
        self.is_http_success() && self.code == SUCCESS_CODE
    }

    /// Decode `data` as `T` without looking at `code`. `()` always succeeds,
    /// whatever `data` holds.
    pub fn parse_data<T: DeserializeOwned + 'static>(&self) -> Result<T> {
        let decoded = if TypeId::of::<T>() == TypeId::of::<()>() {
            T::deserialize(&Value::Null)
        } else {
            T::deserialize(&self.data)
        };
        decoded.map_err(|source| ApiError::Decode {
            source,
            raw: self.raw.clone(),
        })
    }

    /// Fail unless [`is_success`](Self::is_success) holds. HTTP failures
    /// come first: 429 is [`ApiError::RateLimited`], any other non-2xx is
    /// [`ApiError::Status`] whatever `code` says. Only a 2xx with
    /// `code != 0` is [`ApiError::Result`].
    pub fn check(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        if self.http_status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited {
                rate_limit: self.rate_limit.clone(),
                result: Box::new(self),
            });
        }
        if !self.is_http_success() {
            return Err(ApiError::Status {
                status: self.http_status.as_u16(),
                rate_limit: self.rate_limit,
                raw: self.raw,
            });
        }
        Err(ApiError::Result {
            code: self.code,
            message: self.message.clone(),
            result: Box::new(self),
        })
    }

    /// [`check`](Self::check), then [`parse_data`](Self::parse_data).
    pub fn into_data<T: DeserializeOwned + 'static>(self) -> Result<T> {
        self.check()?.parse_data()
    }
}

/// Paged list payload used by every `*/list` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ListData<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub meta: ListMeta,
    #[serde(default)]
    pub sort: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ListMeta {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_total: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub total: u64,
}
