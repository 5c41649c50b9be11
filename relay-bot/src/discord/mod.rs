//! Discord channel for the relay bot.
//!
//! Receives slash commands and channel messages over the Gateway WebSocket and
//! answers through the REST API.

pub mod format;

use crate::command;
use crate::message::{ChannelMessage, InboundEvent, Interaction, MessageRef, OutgoingMessage, Reply};
use crate::traits::{Channel, ChannelError, ChannelResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use relay_common::config::BotConfig;
use relay_common::security::Credential;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Discord REST API root.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 1 | (1 << 9) | (1 << 12) | (1 << 15);

/// Interaction callback: respond with a message.
const CALLBACK_CHANNEL_MESSAGE: u64 = 4;
/// Message flag: only the invoking user can see it.
const FLAG_EPHEMERAL: u64 = 1 << 6;
/// Interaction type of an application (slash) command.
const INTERACTION_APPLICATION_COMMAND: u64 = 2;

/// Discord channel using Gateway WebSocket for real-time events.
pub struct DiscordChannel {
    token: Credential,
    application_id: String,
    guild_id: Option<String>,
    api_base: String,
    client: Client,
}

impl DiscordChannel {
    /// Create a Discord channel from bot configuration.
    ///
    /// The application ID falls back to the bot user ID encoded in the token.
    pub fn new(config: &BotConfig) -> ChannelResult<Self> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChannelError::Auth("Discord bot token is not configured".into()))?;

        let application_id = config
            .application_id
            .clone()
            .or_else(|| bot_user_id_from_token(token))
            .ok_or_else(|| {
                ChannelError::Auth("Cannot determine the Discord application ID".into())
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            token: Credential::new(token),
            application_id,
            guild_id: config.guild_id.clone(),
            api_base: DEFAULT_API_BASE.to_string(),
            client,
        })
    }

    /// Point REST calls at another API root.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token.expose())
    }

    /// Verify the bot token.
    pub async fn init(&self) -> ChannelResult<()> {
        let resp = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| ChannelError::Auth(format!("Failed to verify Discord token: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::Auth("Invalid Discord bot token".into()));
        }

        tracing::info!(application_id = %self.application_id, "Discord channel initialized");
        Ok(())
    }

    /// Overwrite the registered slash commands.
    ///
    /// Registers guild commands when a guild is configured, global ones otherwise.
    pub async fn register_commands(&self) -> ChannelResult<()> {
        let url = match &self.guild_id {
            Some(guild_id) => format!(
                "{}/applications/{}/guilds/{}/commands",
                self.api_base, self.application_id, guild_id
            ),
            None => format!("{}/applications/{}/commands", self.api_base, self.application_id),
        };

        let resp = self
            .client
            .put(&url)
            .header("Authorization", self.auth())
            .json(&command::definitions())
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Command registration failed: {e}")))?;
        check_status(resp).await?;

        tracing::info!(
            guild_id = self.guild_id.as_deref().unwrap_or("global"),
            "Slash commands registered"
        );
        Ok(())
    }

    /// Connect to the gateway and forward events to `tx`.
    ///
    /// Returns `Ok(())` when `tx` is closed and an error when the connection
    /// drops, so the caller can reconnect.
    pub async fn listen(&self, tx: mpsc::Sender<InboundEvent>) -> ChannelResult<()> {
        let bot_user_id = bot_user_id_from_token(self.token.expose()).unwrap_or_default();

        // Get Gateway URL
        let gw_resp: Value = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to get gateway: {e}")))?
            .json()
            .await
            .map_err(|e| ChannelError::Connection(format!("Invalid gateway response: {e}")))?;

        let gw_url = gw_resp
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connection failed: {e}")))?;

        let (mut write, mut read) = ws_stream.split();

        // Read Hello (opcode 10)
        let hello = read
            .next()
            .await
            .ok_or_else(|| ChannelError::Connection("No hello from gateway".into()))?
            .map_err(|e| ChannelError::Connection(format!("WebSocket error: {e}")))?;

        let hello_data: Value = serde_json::from_str(&hello.to_string())
            .map_err(|e| ChannelError::Connection(format!("Invalid hello: {e}")))?;

        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(Value::as_u64)
            .unwrap_or(41250);

        // Send Identify (opcode 2)
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.token.expose(),
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "relay-bot",
                    "device": "relay-bot"
                }
            }
        });

        write
            .send(Message::Text(identify.to_string()))
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to identify: {e}")))?;

        tracing::info!("Discord: connected and identified");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
        let mut sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = json!({"op": 1, "d": sequence});
                    write
                        .send(Message::Text(hb.to_string()))
                        .await
                        .map_err(|e| ChannelError::Connection(format!("Heartbeat failed: {e}")))?;
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            return Err(ChannelError::Connection(format!("Gateway closed: {frame:?}")));
                        }
                        None => return Err(ChannelError::Connection("Gateway stream ended".into())),
                        Some(Err(e)) => return Err(ChannelError::Connection(format!("WebSocket error: {e}"))),
                        _ => continue,
                    };

                    let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some(s) = payload.get("s").and_then(Value::as_u64) {
                        sequence = Some(s);
                    }

                    match payload.get("op").and_then(Value::as_u64) {
                        // Heartbeat request
                        Some(1) => {
                            let hb = json!({"op": 1, "d": sequence});
                            write
                                .send(Message::Text(hb.to_string()))
                                .await
                                .map_err(|e| ChannelError::Connection(format!("Heartbeat failed: {e}")))?;
                            continue;
                        }
                        Some(7) => return Err(ChannelError::Connection("Gateway requested reconnect".into())),
                        Some(9) => return Err(ChannelError::Connection("Gateway session invalidated".into())),
                        Some(0) => {}
                        _ => continue,
                    }

                    let Some(event) = parse_dispatch(&payload, &bot_user_id) else {
                        continue;
                    };

                    match &event {
                        InboundEvent::Command(i) => tracing::info!(
                            user_id = %i.user_id,
                            channel_id = %i.channel_id,
                            command = %i.command,
                            "Discord command received"
                        ),
                        InboundEvent::Message(m) => tracing::debug!(
                            user_id = %m.user_id,
                            channel_id = %m.channel_id,
                            text_chars = m.text.chars().count(),
                            "Discord message received"
                        ),
                    }

                    if tx.send(event).await.is_err() {
                        tracing::info!("Event receiver dropped, leaving gateway");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> ChannelResult<Response> {
        let resp = self
            .client
            .post(url)
            .header("Authorization", self.auth())
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Discord send error: {e}")))?;
        check_status(resp).await
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn respond(&self, interaction: &Interaction, reply: Reply) -> ChannelResult<MessageRef> {
        let url = format!(
            "{}/interactions/{}/{}/callback",
            self.api_base, interaction.id, interaction.token
        );

        let mut data = json!({ "content": format::truncate(&reply.text) });
        if reply.ephemeral {
            data["flags"] = json!(FLAG_EPHEMERAL);
        }
        let body = json!({ "type": CALLBACK_CHANNEL_MESSAGE, "data": data });

        self.post_json(&url, &body).await?;

        Ok(MessageRef::Interaction {
            token: interaction.token.clone(),
        })
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<MessageRef> {
        if message.text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("Message text is empty".into()));
        }

        let url = format!("{}/channels/{}/messages", self.api_base, message.channel_id);
        let mut last_message_id = None;

        for chunk in format::split_message(&message.text) {
            let mut body = json!({ "content": chunk });

            // Only the first chunk carries the reply reference
            if last_message_id.is_none() {
                if let Some(ref reply_to) = message.reply_to {
                    body["message_reference"] = json!({
                        "message_id": reply_to,
                        "fail_if_not_exists": false
                    });
                }
            }

            let resp = self.post_json(&url, &body).await?;
            let msg_data: Value = resp
                .json()
                .await
                .map_err(|e| ChannelError::Internal(format!("Failed to parse response: {e}")))?;

            last_message_id = Some(
                msg_data
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            );
        }

        Ok(MessageRef::Channel {
            channel_id: message.channel_id,
            message_id: last_message_id.unwrap_or_default(),
        })
    }

    async fn withdraw(&self, message: &MessageRef) -> ChannelResult<()> {
        let url = match message {
            MessageRef::Channel {
                channel_id,
                message_id,
            } => format!("{}/channels/{}/messages/{}", self.api_base, channel_id, message_id),
            MessageRef::Interaction { token } => format!(
                "{}/webhooks/{}/{}/messages/@original",
                self.api_base, self.application_id, token
            ),
        };

        let resp = self
            .client
            .delete(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("Discord delete error: {e}")))?;

        // Already gone
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp).await.map(|_| ())
    }
}

async fn check_status(resp: Response) -> ChannelResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let body: Value = resp.json().await.unwrap_or_default();
        let retry_after = body
            .get("retry_after")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        return Err(ChannelError::RateLimited {
            retry_after_secs: retry_after.ceil() as u64,
        });
    }

    let error = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ChannelError::Auth(format!("Discord API error ({status}): {error}")));
    }
    Err(ChannelError::SendFailed(format!(
        "Discord API error ({status}): {error}"
    )))
}

/// Extract the bot user ID from the first segment of a bot token.
fn bot_user_id_from_token(token: &str) -> Option<String> {
    let part = token.split('.').next()?.trim_end_matches('=');
    let bytes = STANDARD_NO_PAD.decode(part).ok()?;
    let id = String::from_utf8(bytes).ok()?;
    id.chars().all(|c| c.is_ascii_digit()).then_some(id)
}

/// Turn a gateway dispatch (opcode 0) into an inbound event.
pub(crate) fn parse_dispatch(payload: &Value, bot_user_id: &str) -> Option<InboundEvent> {
    let d = payload.get("d")?;
    match payload.get("t").and_then(Value::as_str)? {
        "INTERACTION_CREATE" => parse_interaction(d).map(InboundEvent::Command),
        "MESSAGE_CREATE" => parse_message(d, bot_user_id).map(InboundEvent::Message),
        _ => None,
    }
}

fn parse_interaction(d: &Value) -> Option<Interaction> {
    if d.get("type").and_then(Value::as_u64) != Some(INTERACTION_APPLICATION_COMMAND) {
        return None;
    }

    // Guild invocations carry `member.user`, DMs carry `user`.
    let member = d.get("member");
    let user = member.and_then(|m| m.get("user")).or_else(|| d.get("user"))?;
    let user_name = member
        .and_then(|m| m.get("nick"))
        .and_then(Value::as_str)
        .or_else(|| user.get("global_name").and_then(Value::as_str))
        .or_else(|| user.get("username").and_then(Value::as_str))
        .unwrap_or("unknown");

    let data = d.get("data")?;
    let options: HashMap<String, String> = data
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    let name = o.get("name")?.as_str()?.to_string();
                    let value = match o.get("value")? {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(Interaction {
        id: d.get("id")?.as_str()?.to_string(),
        token: d.get("token")?.as_str()?.to_string(),
        channel_id: d.get("channel_id")?.as_str()?.to_string(),
        user_id: user.get("id")?.as_str()?.to_string(),
        user_name: user_name.to_string(),
        command: data.get("name")?.as_str()?.to_string(),
        options,
    })
}

fn parse_message(d: &Value, bot_user_id: &str) -> Option<ChannelMessage> {
    let author = d.get("author")?;
    let author_id = author.get("id")?.as_str()?;
    if author_id == bot_user_id {
        return None;
    }
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let content = d.get("content").and_then(Value::as_str).unwrap_or("");
    if content.is_empty() {
        return None;
    }

    Some(ChannelMessage {
        id: d.get("id")?.as_str()?.to_string(),
        channel_id: d.get("channel_id")?.as_str()?.to_string(),
        user_id: author_id.to_string(),
        text: content.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}
