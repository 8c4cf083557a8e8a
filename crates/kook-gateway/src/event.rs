//! The business envelope carried by EVENT frames.
//!
//! The envelope is decoded when the frame is accepted; the polymorphic
//! `extra` is kept as raw JSON and decoded on first access, keyed by the
//! event `type`. Discriminators without a known shape, and known ones whose
//! body does not decode, become [`EventExtra::Unsupported`].

use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use serde_json::value::RawValue;

/// Event `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Text,
    Image,
    Video,
    File,
    Audio,
    KMarkdown,
    Card,
    System,
}

impl EventType {
    pub fn from_value(value: i64) -> Option<Self> {
        Some(match value {
            1 => Self::Text,
            2 => Self::Image,
            3 => Self::Video,
            4 => Self::File,
            8 => Self::Audio,
            9 => Self::KMarkdown,
            10 => Self::Card,
            255 => Self::System,
            _ => return None,
        })
    }

    pub fn value(self) -> i64 {
        match self {
            Self::Text => 1,
            Self::Image => 2,
            Self::Video => 3,
            Self::File => 4,
            Self::Audio => 8,
            Self::KMarkdown => 9,
            Self::Card => 10,
            Self::System => 255,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ChannelType {
    Group,
    Person,
    Broadcast,
    Other(String),
}

impl From<String> for ChannelType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "GROUP" => Self::Group,
            "PERSON" => Self::Person,
            "BROADCAST" => Self::Broadcast,
            _ => Self::Other(value),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Event {
    pub channel_type: ChannelType,
    #[serde(rename = "type")]
    pub type_value: i64,
    pub target_id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: String,
    pub msg_id: String,
    pub msg_timestamp: i64,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    extra: LazyExtra,
}

impl Event {
    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_value(self.type_value)
    }

    pub fn is_system(&self) -> bool {
        self.event_type() == Some(EventType::System)
    }

    pub fn is_direct(&self) -> bool {
        self.channel_type == ChannelType::Person
    }

    /// The typed extra, decoded on first call and cached.
    pub fn extra(&self) -> &EventExtra {
        self.extra
            .decoded
            .get_or_init(|| decode_extra(self.type_value, self.extra.raw.as_deref()))
    }

    pub fn is_extra_decoded(&self) -> bool {
        self.extra.decoded.get().is_some()
    }

    pub fn raw_extra(&self) -> Option<&str> {
        self.extra.raw.as_deref().map(RawValue::get)
    }

    /// Decode the raw extra into a caller-chosen shape, bypassing the
    /// built-in discriminator table.
    pub fn extra_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.raw_extra().unwrap_or("null"))
    }
}

#[derive(Debug, Default)]
struct LazyExtra {
    raw: Option<Box<RawValue>>,
    decoded: OnceLock<EventExtra>,
}

impl<'de> Deserialize<'de> for LazyExtra {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            raw: Option::<Box<RawValue>>::deserialize(deserializer)?,
            decoded: OnceLock::new(),
        })
    }
}

/// An accepted EVENT frame as handed to the pipeline.
#[derive(Debug)]
pub struct EventFrame {
    pub sn: u64,
    pub event: Event,
    /// The frame text as received (after inflation).
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventExtra {
    Text(MessageExtra),
    Image(MediaExtra),
    Video(MediaExtra),
    KMarkdown(KMarkdownExtra),
    Card(MessageExtra),
    System(SystemEvent),
    Unsupported(Unsupported),
}

impl EventExtra {
    /// The message part of any message-shaped extra.
    pub fn as_message(&self) -> Option<&MessageExtra> {
        match self {
            Self::Text(m) | Self::Card(m) => Some(m),
            Self::Image(m) | Self::Video(m) => Some(&m.message),
            Self::KMarkdown(k) => Some(&k.message),
            Self::System(_) | Self::Unsupported(_) => None,
        }
    }

    pub fn as_system(&self) -> Option<&SystemEvent> {
        match self {
            Self::System(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsupported {
    pub discriminator: i64,
    /// Why a known discriminator failed to decode; `None` when the
    /// discriminator itself has no known shape.
    pub reason: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub identify_num: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageExtra {
    #[serde(rename = "type")]
    pub type_value: i64,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default, deserialize_with = "ids")]
    pub mention: Vec<String>,
    #[serde(default)]
    pub mention_all: bool,
    #[serde(default, deserialize_with = "ids")]
    pub mention_roles: Vec<String>,
    #[serde(default)]
    pub mention_here: bool,
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaExtra {
    #[serde(flatten)]
    pub message: MessageExtra,
    pub attachments: Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KMarkdown {
    pub raw_content: String,
    #[serde(default)]
    pub mention_part: Vec<Value>,
    #[serde(default)]
    pub mention_role_part: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KMarkdownExtra {
    #[serde(flatten)]
    pub message: MessageExtra,
    #[serde(default)]
    pub nav_channels: Vec<String>,
    #[serde(default)]
    pub code: Option<String>,
    pub kmarkdown: KMarkdown,
}

/// System notifications, keyed by `extra.type`.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    UserUpdated(UserUpdated),
    JoinedChannel(ChannelPresence),
    ExitedChannel(ChannelPresence),
    SelfJoinedGuild(GuildRef),
    SelfExitedGuild(GuildRef),
    Other { kind: String, body: Value },
}

impl SystemEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::UserUpdated(_) => "user_updated",
            Self::JoinedChannel(_) => "joined_channel",
            Self::ExitedChannel(_) => "exited_channel",
            Self::SelfJoinedGuild(_) => "self_joined_guild",
            Self::SelfExitedGuild(_) => "self_exited_guild",
            Self::Other { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserUpdated {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub avatar: String,
}

/// Body of `joined_channel` / `exited_channel`. `at` is `joined_at` or
/// `exited_at` depending on the direction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelPresence {
    pub user_id: String,
    pub channel_id: String,
    #[serde(default, alias = "joined_at", alias = "exited_at")]
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildRef {
    pub guild_id: String,
}

#[derive(Deserialize)]
struct SystemRaw {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
}

fn decode_system(raw: &str) -> Result<SystemEvent, serde_json::Error> {
    let SystemRaw { kind, body } = serde_json::from_str(raw)?;
    Ok(match kind.as_str() {
        "user_updated" => SystemEvent::UserUpdated(serde_json::from_value(body)?),
        "joined_channel" => SystemEvent::JoinedChannel(serde_json::from_value(body)?),
        "exited_channel" => SystemEvent::ExitedChannel(serde_json::from_value(body)?),
        "self_joined_guild" => SystemEvent::SelfJoinedGuild(serde_json::from_value(body)?),
        "self_exited_guild" => SystemEvent::SelfExitedGuild(serde_json::from_value(body)?),
        _ => SystemEvent::Other { kind, body },
    })
}

fn decode_extra(type_value: i64, raw: Option<&RawValue>) -> EventExtra {
    let unsupported = |reason: Option<String>| {
        EventExtra::Unsupported(Unsupported {
            discriminator: type_value,
            reason,
            raw: raw.map(|r| r.get().to_owned()),
        })
    };
    let Some(text) = raw.map(RawValue::get) else {
        return unsupported(Some("event has no extra".into()));
    };

    let decoded = match EventType::from_value(type_value) {
        Some(EventType::Text) => serde_json::from_str(text).map(EventExtra::Text),
        Some(EventType::Image) => serde_json::from_str(text).map(EventExtra::Image),
        Some(EventType::Video) => serde_json::from_str(text).map(EventExtra::Video),
        Some(EventType::KMarkdown) => serde_json::from_str(text).map(EventExtra::KMarkdown),
        Some(EventType::Card) => serde_json::from_str(text).map(EventExtra::Card),
        Some(EventType::System) => decode_system(text).map(EventExtra::System),
        // File messages arrive as cards; audio has no documented shape.
        Some(EventType::File | EventType::Audio) | None => return unsupported(None),
    };
    decoded.unwrap_or_else(|e| {
        tracing::debug!(type_value, error = %e, "extra did not match its discriminator");
        unsupported(Some(e.to_string()))
    })
}

// Mention lists carry user ids as strings and role ids as numbers.
fn ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}
