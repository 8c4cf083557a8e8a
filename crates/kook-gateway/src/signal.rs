//! Outer gateway frames: `{"s": kind, "sn": n, "d": payload}`.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

/// Gateway signal kinds.
pub mod kind {
    pub const EVENT: i64 = 0;
    pub const HELLO: i64 = 1;
    pub const PING: i64 = 2;
    pub const PONG: i64 = 3;
    pub const RESUME: i64 = 4;
    pub const RECONNECT: i64 = 5;
    pub const RESUME_ACK: i64 = 6;
}

/// Codes carried by HELLO.
pub mod hello_code {
    pub const SUCCESS: i64 = 0;
    pub const MISSING_PARAMETER: i64 = 40100;
    pub const INVALID_TOKEN: i64 = 40101;
    pub const TOKEN_VERIFICATION_FAILED: i64 = 40102;
    pub const TOKEN_EXPIRED: i64 = 40103;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Event,
    Hello,
    Ping,
    Pong,
    Resume,
    Reconnect,
    ResumeAck,
    Unknown(i64),
}

impl SignalKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            kind::EVENT => Self::Event,
            kind::HELLO => Self::Hello,
            kind::PING => Self::Ping,
            kind::PONG => Self::Pong,
            kind::RESUME => Self::Resume,
            kind::RECONNECT => Self::Reconnect,
            kind::RESUME_ACK => Self::ResumeAck,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded frame. The payload stays raw until somebody asks for it.
#[derive(Debug, Deserialize)]
pub struct Signal {
    pub s: i64,
    #[serde(default)]
    pub sn: Option<u64>,
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
}

impl Signal {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> SignalKind {
        SignalKind::from_code(self.s)
    }

    /// Decode `d`; a missing payload decodes as `null`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.d.as_deref().map_or("null", RawValue::get))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub code: i64,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Reconnect {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub err: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ResumeAck {
    pub session_id: String,
}

/// Outbound heartbeat.
pub fn ping(sn: u64) -> String {
    format!(r#"{{"s":{},"sn":{sn}}}"#, kind::PING)
}
