//! Relay Bot - Discord chat sessions backed by OpenAI.
//!
//! Each user saves a custom prompt and an OpenAI API key (stored encrypted),
//! then opens a time-boxed chat session in a channel. Every message they send
//! during the session is answered by the completion backend using their prompt.
//!
//! ## Architecture
//!
//! ```text
//! Discord gateway → Dispatcher ─ commands → per-user queue → Relay
//!                       │                                     │ admit + subscribe
//!                       └─ messages → MessageHub → ExchangeCollector → OpenAI
//!                                                        │
//! User ←──────────── DiscordChannel::send ←──────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod collector;
pub mod command;
pub mod completion;
pub mod discord;
pub mod dispatch;
pub mod hub;
pub mod message;
pub mod relay;
pub mod session;
pub mod store;
pub mod traits;

// Re-export commonly used types
pub use collector::{EndReason, ExchangeCollector, SessionSummary};
pub use command::Command;
pub use completion::{CompletionClient, OpenAiClient};
pub use discord::DiscordChannel;
pub use dispatch::Dispatcher;
pub use hub::{MessageHub, Subscription};
pub use message::{ChannelMessage, InboundEvent, Interaction, MessageRef, OutgoingMessage, Reply};
pub use relay::Relay;
pub use session::{SessionGuard, SessionRegistry};
pub use store::{UserRecord, UserStore};
pub use traits::{Channel, ChannelError, ChannelResult};

use relay_common::config::Config;
use relay_common::security::SecretCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay before reconnecting to the gateway after a dropped connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the gateway → dispatcher event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Validate configuration, wire every component and run until Ctrl-C.
pub async fn start_bot(config: &Config) -> anyhow::Result<()> {
    let key = config.validate()?;

    let store_path = config.store.resolved_path();
    let store = Arc::new(UserStore::load(store_path.clone(), SecretCodec::new(key)).await);
    tracing::info!(path = %store_path.display(), users = store.len().await, "User store loaded");

    let discord = Arc::new(DiscordChannel::new(&config.bot)?);
    discord.init().await?;
    if config.bot.register_commands {
        if let Err(e) = discord.register_commands().await {
            tracing::warn!(error = %e, "Failed to register slash commands");
        }
    }

    let completion = Arc::new(OpenAiClient::new(&config.completion));
    tracing::info!(model = %completion.model(), "Completion backend configured");

    let channel: Arc<dyn Channel> = discord.clone();
    let relay = Arc::new(Relay::new(store, channel, completion, config.session.clone()));
    let dispatcher = Dispatcher::new(relay, config.session.queue_capacity);

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let dispatcher_handle = dispatcher.spawn(rx);

    let gateway_handle = tokio::spawn(async move {
        loop {
            match discord.listen(tx.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Discord gateway disconnected, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    });

    tracing::info!("Relay bot running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    gateway_handle.abort();
    dispatcher_handle.abort();

    Ok(())
}
