//! Endpoints about the authenticated bot itself.

use reqwest::Method;
use serde::Deserialize;

use crate::request::{ApiPath, ApiRequest};

/// `GET user/me`
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMe;

impl ApiRequest for GetMe {
    type Output = Me;

    fn path(&self) -> ApiPath {
        ApiPath::new(["user", "me"])
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Me {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub identify_num: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub status: i64,
}

/// `POST user/offline`: take the bot offline on the platform side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

impl ApiRequest for Offline {
    type Output = ();

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> ApiPath {
        ApiPath::new(["user", "offline"])
    }
}
