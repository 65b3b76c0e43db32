use std::{fmt, str::FromStr};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Kind of upstream conversation an inbound event came from.
///
/// Downstream bots only see groups and private chats, so guild channels and
/// direct messages are presented as one of those and this tag records what the
/// conversation really is when a reply has to be routed back.
pub enum ConversationKind {
    Group,
    Guild,
    GuildPrivate,
    GroupPrivate,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Guild => "guild",
            Self::GuildPrivate => "guild_private",
            Self::GroupPrivate => "group_private",
        }
    }

    /// True for kinds that downstream addresses with a `group_id`.
    pub fn is_group_like(self) -> bool {
        matches!(self, Self::Group | Self::Guild)
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "group" => Ok(Self::Group),
            "guild" => Ok(Self::Guild),
            "guild_private" => Ok(Self::GuildPrivate),
            "group_private" => Ok(Self::GroupPrivate),
            other => bail!(
                "unsupported conversation kind '{}'; supported kinds are group, guild, guild_private, group_private",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Which wire field carries the correlation token between gateway and bot.
///
/// `RequestId` is token-based correlation: every event carries a unique
/// `request_id` and well-behaved bots echo it back. `Echo` is the legacy
/// OneBot field, which many bots drop or rewrite, so the gateway has to fall
/// back to weaker signals when replying.
pub enum CorrelationMode {
    RequestId,
    #[default]
    Echo,
}

impl CorrelationMode {
    pub fn from_use_request_id(use_request_id: bool) -> Self {
        if use_request_id {
            Self::RequestId
        } else {
            Self::Echo
        }
    }

    pub fn is_token_based(self) -> bool {
        matches!(self, Self::RequestId)
    }

    /// Name of the top-level JSON field the token travels in.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::RequestId => "request_id",
            Self::Echo => "echo",
        }
    }
}
