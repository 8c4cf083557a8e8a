//! Async REST executor for the KOOK API.

use std::time::Duration;

use kook_common::config::ApiConfig;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::{ApiError, Result};
use crate::rate_limit::RateLimit;
use crate::request::{ApiRequest, carries_body};
use crate::result::{ApiResult, Envelope};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("kook-rs/", env!("CARGO_PKG_VERSION"));

/// Stateless KOOK REST executor. Cloning shares the connection pool.
///
/// The client holds no credentials: every call takes the `Authorization`
/// value, so one executor can serve any number of bots.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
}

impl RestClient {
    /// Executor with the default 5 second connect and request timeouts.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_TIMEOUT)
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, &config.base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for a descriptor: base, path segments, then query.
    pub fn url_for<R: ApiRequest + ?Sized>(&self, request: &R) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(request.path().segments());
        }
        let query = request.query();
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        url
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Perform one exchange and return the envelope as received.
    ///
    /// A body that decodes as an envelope is returned even for non-2xx
    /// statuses; use [`ApiResult::check`] or [`ApiResult::into_data`] to turn
    /// failures into errors. Non-2xx without an envelope is
    /// [`ApiError::Status`], a 2xx without one is [`ApiError::Decode`].
    pub async fn execute<R: ApiRequest + ?Sized>(
        &self,
        request: &R,
        authorization: &str,
    ) -> Result<ApiResult> {
        let method = request.method();
        let url = self.url_for(request);
        let api = format!("{method} {}", url.path());

        // Descriptor headers first; the executor's own two always win.
        let mut headers = request.headers();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(authorization).map_err(|_| ApiError::InvalidAuthorization)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = self.client.request(method.clone(), url.clone()).headers(headers);
        if carries_body(&method) {
            if let Some(body) = request.body() {
                builder = builder.body(body.to_string());
            }
        }

        debug!(api = %api, query = url.query().unwrap_or(""), "======>");
        let response = builder.send().await?;

        let status = response.status();
        let rate_limit = RateLimit::from_headers(response.headers());
        let raw = response.text().await?;
        debug!(
            api = %api,
            status = status.as_u16(),
            remaining = rate_limit.remaining,
            bucket = rate_limit.bucket.as_deref().unwrap_or(""),
            "<======"
        );

        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => Ok(ApiResult::from_envelope(envelope, status, raw, rate_limit)),
            Err(source) if status.is_success() => Err(ApiError::Decode { source, raw }),
            Err(_) => Err(ApiError::Status {
                status: status.as_u16(),
                rate_limit,
                raw,
            }),
        }
    }

    /// [`execute`](Self::execute) followed by [`ApiResult::into_data`].
    pub async fn request_data<R: ApiRequest + ?Sized>(
        &self,
        request: &R,
        authorization: &str,
    ) -> Result<R::Output> {
        let result = self.execute(request, authorization).await?;
        if result.http_status == StatusCode::TOO_MANY_REQUESTS {
            debug!(
                reset = result.rate_limit.reset,
                global = result.rate_limit.is_global,
                "rate limited"
            );
        }
        result.into_data()
    }
}
