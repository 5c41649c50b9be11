//! Message types exchanged with the messaging platform.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A plain chat message posted by a user in a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message ID (platform-specific)
    pub id: String,
    /// Channel the message was posted in
    pub channel_id: String,
    /// Author identifier
    pub user_id: String,
    /// Message text
    pub text: String,
    /// Timestamp (Unix millis)
    pub timestamp: i64,
}

impl ChannelMessage {
    /// Check if the message asks to end the current session.
    pub fn is_exit_keyword(&self) -> bool {
        is_exit_keyword(&self.text)
    }
}

/// Keywords that end a chat session, compared trimmed and case-insensitively.
pub const EXIT_KEYWORDS: &[&str] = &["exit", "stop"];

/// Check whether `text` is an exit keyword.
pub fn is_exit_keyword(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    EXIT_KEYWORDS.iter().any(|k| *k == normalized)
}

/// A slash-command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Interaction ID
    pub id: String,
    /// Token used to answer the interaction and edit or delete the answer
    pub token: String,
    /// Channel the command was invoked in
    pub channel_id: String,
    /// Invoking user
    pub user_id: String,
    /// Display name of the invoking user
    pub user_name: String,
    /// Command name
    pub command: String,
    /// Command options by name
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Interaction {
    /// Get a string option by name.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }
}

/// Inbound platform event.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Command(Interaction),
    Message(ChannelMessage),
}

impl InboundEvent {
    /// The user who produced the event.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Command(i) => &i.user_id,
            Self::Message(m) => &m.user_id,
        }
    }
}

/// Answer to an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    /// Only the invoking user can see the answer
    pub ephemeral: bool,
}

impl Reply {
    /// A reply only the invoking user can see.
    pub fn private(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ephemeral: true,
        }
    }

    /// A reply everyone in the channel can see.
    pub fn public(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ephemeral: false,
        }
    }
}

/// Outgoing channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target channel ID
    pub channel_id: String,
    /// Reply to message ID (optional)
    pub reply_to: Option<String>,
    /// Message text
    pub text: String,
}

impl OutgoingMessage {
    pub fn new(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            reply_to: None,
            text: text.into(),
        }
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Handle to something the bot posted, used to withdraw it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageRef {
    /// A regular channel message
    Channel {
        channel_id: String,
        message_id: String,
    },
    /// The original answer to an interaction
    Interaction { token: String },
}
