//! # kook-api
//!
//! The request executor every typed KOOK API call funnels through.
//!
//! A request is an [`ApiRequest`] descriptor (method, path, query, body,
//! result shape). [`RestClient::execute`] performs exactly one HTTP exchange
//! and hands back the raw [`ApiResult`] envelope with the [`RateLimit`]
//! snapshot taken from the response headers. Decoding the typed payload is a
//! separate step, so callers can look at `code` and the rate limit even when
//! the payload would not decode.
//!
//! ```rust,no_run
//! use kook_api::{RestClient, gateway::GetGateway};
//! use kook_common::Ticket;
//!
//! #[tokio::main]
//! async fn main() -> kook_api::Result<()> {
//!     let rest = RestClient::new(kook_common::config::DEFAULT_BASE_URL)?;
//!     let ticket = Ticket::bot("client-id", "token");
//!
//!     let result = rest.execute(&GetGateway::new(true), &ticket.authorization()).await?;
//!     println!("remaining in bucket: {}", result.rate_limit.remaining);
//!
//!     let gateway = result.into_data::<kook_api::gateway::Gateway>()?;
//!     println!("{}", gateway.url);
//!     Ok(())
//! }
//! ```
//!
//! The executor never retries and keeps no state between calls apart from
//! the connection pool inside `reqwest`.

pub mod error;
pub mod gateway;
pub mod rate_limit;
pub mod request;
pub mod rest;
pub mod result;
pub mod user;

pub use error::{ApiError, Result};
pub use rate_limit::RateLimit;
pub use request::{ApiPath, ApiRequest};
pub use rest::RestClient;
pub use result::{ApiResult, ListData, ListMeta};

pub const API_VERSION: &str = "v3";
