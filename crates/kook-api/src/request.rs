//! Request descriptors.

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Path below the versioned API root, kept as raw segments so each one is
/// percent-encoded on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPath(Vec<String>);

impl ApiPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for ApiPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// One endpoint: how to reach it and what its `data` payload decodes into.
///
/// The executor owns `Authorization` and `Content-Type`; a descriptor may
/// add any other header but cannot override those two.
pub trait ApiRequest: Send + Sync {
    type Output: DeserializeOwned + Send + 'static;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> ApiPath;

    fn query(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Only sent for methods that carry a body.
    fn body(&self) -> Option<Value> {
        None
    }

    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }
}

/// Only write methods send the descriptor's body; everything else drops it.
pub fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}
