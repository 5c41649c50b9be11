//! Command handling.
//!
//! Every command answer is private to the invoking user. Errors never escape
//! this boundary: they are logged and turned into a notice for the user.

use crate::collector::{AnnouncementTimer, ExchangeCollector, SessionContext, SessionSummary};
use crate::command::{help_text, prompt_limit_text, Command};
use crate::completion::CompletionClient;
use crate::hub::MessageHub;
use crate::message::{Interaction, Reply};
use crate::session::SessionRegistry;
use crate::store::{validate_instruction, UserStore};
use crate::traits::Channel;
use relay_common::config::SessionConfig;
use relay_common::logging::redact;
use relay_common::{Error, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Reply when `chat` has no prompt to use.
pub const NO_PROMPT: &str =
    "No custom prompt found. Save one with `/setprompt` or pass one to `/chat`.";
/// Reply when `chat` has no API key to use.
pub const NO_KEY: &str = "No OpenAI API key found. Save one with `/setkey` first.";

/// Longest prompt excerpt shown in a session announcement.
const ANNOUNCE_PREVIEW_CHARS: usize = 1500;

enum Outcome {
    Reply(String),
    Session {
        collector: ExchangeCollector,
        announcement: String,
    },
}

/// Handles slash commands for all users.
pub struct Relay {
    store: Arc<UserStore>,
    registry: Arc<SessionRegistry>,
    hub: Arc<MessageHub>,
    channel: Arc<dyn Channel>,
    completion: Arc<dyn CompletionClient>,
    session: SessionConfig,
}

impl Relay {
    pub fn new(
        store: Arc<UserStore>,
        channel: Arc<dyn Channel>,
        completion: Arc<dyn CompletionClient>,
        session: SessionConfig,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(SessionRegistry::new()),
            hub: Arc::new(MessageHub::new()),
            channel,
            completion,
            session,
        }
    }

    pub fn store(&self) -> &Arc<UserStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    /// Handle one command invocation and answer it.
    ///
    /// Returns the collector task when a chat session was opened.
    pub async fn handle(&self, interaction: &Interaction) -> Option<JoinHandle<SessionSummary>> {
        let outcome = match Command::from_interaction(interaction) {
            Ok(command) => {
                tracing::info!(
                    user_id = %interaction.user_id,
                    channel_id = %interaction.channel_id,
                    command = command.name(),
                    "Handling command"
                );
                self.execute(interaction, command).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Outcome::Reply(text)) => {
                self.reply(interaction, text).await;
                None
            }
            Ok(Outcome::Session {
                collector,
                announcement,
            }) => Some(self.start_session(interaction, collector, announcement).await),
            Err(e) => {
                tracing::warn!(user_id = %interaction.user_id, error = %e, "Command rejected");
                self.reply(interaction, e.user_message()).await;
                None
            }
        }
    }

    async fn execute(&self, interaction: &Interaction, command: Command) -> Result<Outcome> {
        let user_id = interaction.user_id.as_str();

        let text = match command {
            Command::Chat { prompt } => return self.prepare_session(interaction, prompt).await,
            Command::SetPrompt { prompt } => {
                self.store.set_instruction(user_id, &prompt).await?;
                "Your custom prompt has been saved.".to_string()
            }
            Command::PromptLimit => prompt_limit_text(),
            Command::SetKey { key } => {
                self.store.set_credential(user_id, &key).await?;
                tracing::info!(user_id = %user_id, key = %redact(&key), "API key saved");
                "Your OpenAI API key has been saved.".to_string()
            }
            Command::DeletePrompt => {
                if self.store.clear_instruction(user_id).await? {
                    "Your custom prompt has been deleted.".to_string()
                } else {
                    "You don't have a saved prompt to delete.".to_string()
                }
            }
            Command::DeleteKey => {
                if self.store.clear_credential(user_id).await? {
                    "Your OpenAI API key has been deleted.".to_string()
                } else {
                    "You don't have a saved API key to delete.".to_string()
                }
            }
            Command::Info => self.info_text(user_id).await,
            Command::Help => help_text(),
        };

        Ok(Outcome::Reply(text))
    }

    /// Run every check for a new chat session, then admit the user.
    ///
    /// Nothing is admitted or subscribed unless all checks pass.
    async fn prepare_session(&self, interaction: &Interaction, prompt: Option<String>) -> Result<Outcome> {
        let user_id = interaction.user_id.as_str();

        let instruction = match prompt {
            Some(prompt) => {
                validate_instruction(&prompt)?;
                prompt
            }
            None => self
                .store
                .get(user_id)
                .await
                .custom_instruction
                .ok_or_else(|| Error::Validation(NO_PROMPT.into()))?,
        };

        let credential = self
            .store
            .credential(user_id)
            .await?
            .ok_or_else(|| Error::Validation(NO_KEY.into()))?;

        let guard = self
            .registry
            .admit(user_id, &interaction.channel_id)
            .ok_or_else(|| Error::SessionConflict(format!("user {user_id} already has an open session")))?;
        let subscription = self
            .hub
            .subscribe(user_id, &interaction.channel_id, self.session.queue_capacity);

        let announcement = announcement_text(&instruction);
        let context = SessionContext {
            user_id: user_id.to_string(),
            user_name: interaction.user_name.clone(),
            channel_id: interaction.channel_id.clone(),
            instruction,
            credential,
        };
        let collector = ExchangeCollector::new(
            context,
            subscription,
            guard,
            Arc::clone(&self.channel),
            Arc::clone(&self.completion),
            self.session.timeout(),
        );

        Ok(Outcome::Session {
            collector,
            announcement,
        })
    }

    async fn start_session(
        &self,
        interaction: &Interaction,
        mut collector: ExchangeCollector,
        announcement: String,
    ) -> JoinHandle<SessionSummary> {
        match self.channel.respond(interaction, Reply::private(announcement)).await {
            Ok(message) => {
                let timer = AnnouncementTimer::start(
                    Arc::clone(&self.channel),
                    message,
                    self.session.announcement_ttl(),
                );
                collector = collector.with_announcement(timer);
            }
            Err(e) => {
                tracing::warn!(user_id = %interaction.user_id, error = %e, "Failed to announce session");
            }
        }

        tokio::spawn(collector.run())
    }

    async fn info_text(&self, user_id: &str) -> String {
        let record = self.store.get(user_id).await;

        let prompt = match &record.custom_instruction {
            Some(text) => format!("saved ({} characters)", text.chars().count()),
            None => "not saved".to_string(),
        };
        let key = if record.has_credential() { "saved" } else { "not saved" };
        let session = if self.registry.is_active(user_id) {
            "active"
        } else {
            "none"
        };

        format!(
            "**Your settings**\nCustom prompt: {prompt}\nAPI key: {key}\nChat session: {session}"
        )
    }

    /// Answer `interaction` privately, logging delivery failures.
    pub async fn reply(&self, interaction: &Interaction, text: String) {
        if let Err(e) = self.channel.respond(interaction, Reply::private(text)).await {
            tracing::warn!(user_id = %interaction.user_id, error = %e, "Failed to answer command");
        }
    }
}

/// Text announcing a new session and the prompt it uses.
pub fn announcement_text(instruction: &str) -> String {
    let mut preview: String = instruction.chars().take(ANNOUNCE_PREVIEW_CHARS).collect();
    if instruction.chars().count() > ANNOUNCE_PREVIEW_CHARS {
        preview.push_str("...");
    }
    format!(
        "Chat session started with prompt:\n> {preview}\n\nSend a message in this channel to chat. Type `exit` or `stop` to end the session."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_shows_prompt_and_exit_hint() {
        let text = announcement_text("be terse");
        assert!(text.contains("be terse"));
        assert!(text.contains("`exit`"));
    }

    #[test]
    fn test_announcement_truncates_long_prompt() {
        let prompt = "x".repeat(4000);
        let text = announcement_text(&prompt);
        assert!(text.chars().count() < 2000);
        assert!(text.contains("..."));
    }
}
