//! Bot credentials.

use std::fmt;

use serde::Deserialize;

/// Which `Authorization` scheme a token is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Bot,
    Bearer,
}

impl TokenKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Bot => "Bot",
            Self::Bearer => "Bearer",
        }
    }
}

/// Identity plus secret used to authenticate one bot.
///
/// `client_id` is stable and used as a registry key. The token may be rotated
/// at runtime; [`Ticket::same_identity`] keeps matching across rotations,
/// while `==` only holds when the secret matches too.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket {
    client_id: String,
    token: String,
    kind: TokenKind,
}

impl Ticket {
    pub fn new(client_id: impl Into<String>, token: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            client_id: client_id.into(),
            token: token.into(),
            kind,
        }
    }

    /// A bot ticket. A leading `"Bot "` on the token is stripped so it is
    /// never sent twice.
    pub fn bot(client_id: impl Into<String>, token: impl Into<String>) -> Self {
        let token: String = token.into();
        let token = match token.strip_prefix("Bot ") {
            Some(bare) => bare.to_owned(),
            None => token,
        };
        Self::new(client_id, token, TokenKind::Bot)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Ready-to-send `Authorization` header value, e.g. `Bot 1/MTA=/abc`.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.kind.prefix(), self.token)
    }

    /// Replace the secret, keeping the identifier.
    pub fn rotate_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    /// True when both tickets belong to the same client, whatever the secret.
    pub fn same_identity(&self, other: &Ticket) -> bool {
        self.client_id == other.client_id
    }
}

// The secret never ends up in logs.
impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("token", &"<redacted>")
            .finish()
    }
}
