//! Channel trait implemented by platform adapters.

use crate::message::{Interaction, MessageRef, OutgoingMessage, Reply};
use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outbound side of a messaging platform.
///
/// The relay only talks to the platform through this trait, so tests can
/// substitute a recording fake.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Answer a command invocation.
    async fn respond(&self, interaction: &Interaction, reply: Reply) -> ChannelResult<MessageRef>;

    /// Post a message to a channel.
    async fn send(&self, message: OutgoingMessage) -> ChannelResult<MessageRef>;

    /// Delete something previously posted.
    async fn withdraw(&self, message: &MessageRef) -> ChannelResult<()>;
}
