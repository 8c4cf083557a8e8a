//! Rate-limit snapshot taken from response headers.

use reqwest::header::HeaderMap;

pub const X_RATE_LIMIT_LIMIT: &str = "X-Rate-Limit-Limit";
pub const X_RATE_LIMIT_REMAINING: &str = "X-Rate-Limit-Remaining";
pub const X_RATE_LIMIT_RESET: &str = "X-Rate-Limit-Reset";
pub const X_RATE_LIMIT_BUCKET: &str = "X-Rate-Limit-Bucket";
pub const X_RATE_LIMIT_GLOBAL: &str = "X-Rate-Limit-Global";

/// Value used for any numeric header the response did not carry.
pub const UNKNOWN: i64 = -1;

/// Rate-limit state reported by one response.
///
/// Numbers the server did not send are [`UNKNOWN`]. `is_global` is driven by
/// the presence of `X-Rate-Limit-Global`, never by its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: i64,
    pub remaining: i64,
    /// Seconds until the bucket refills.
    pub reset: i64,
    pub bucket: Option<String>,
    pub is_global: bool,
}

impl RateLimit {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_i64(headers, X_RATE_LIMIT_LIMIT).unwrap_or(UNKNOWN),
            remaining: header_i64(headers, X_RATE_LIMIT_REMAINING).unwrap_or(UNKNOWN),
            reset: header_i64(headers, X_RATE_LIMIT_RESET).unwrap_or(UNKNOWN),
            bucket: headers
                .get(X_RATE_LIMIT_BUCKET)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            is_global: headers.contains_key(X_RATE_LIMIT_GLOBAL),
        }
    }

    /// True when the server reported an empty bucket.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            limit: UNKNOWN,
            remaining: UNKNOWN,
            reset: UNKNOWN,
            bucket: None,
            is_global: false,
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
