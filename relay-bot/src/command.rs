//! Slash commands understood by the relay.

use crate::message::Interaction;
use crate::store::MAX_INSTRUCTION_CHARS;
use relay_common::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

/// Option name carrying a custom prompt.
pub const PROMPT_OPTION: &str = "prompt";
/// Option name carrying an API key.
pub const KEY_OPTION: &str = "key";

/// A parsed slash command.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a chat session, optionally with a one-off prompt
    Chat { prompt: Option<String> },
    SetPrompt { prompt: String },
    PromptLimit,
    SetKey { key: String },
    DeletePrompt,
    DeleteKey,
    Info,
    Help,
}

impl Command {
    /// Parse a command from its name and string options.
    pub fn parse(name: &str, options: &HashMap<String, String>) -> Result<Self> {
        let command = match name {
            "chat" => Self::Chat {
                prompt: options
                    .get(PROMPT_OPTION)
                    .filter(|p| !p.trim().is_empty())
                    .cloned(),
            },
            "setprompt" => Self::SetPrompt {
                prompt: required(name, options, PROMPT_OPTION)?,
            },
            "promptlimit" => Self::PromptLimit,
            "setkey" => Self::SetKey {
                key: required(name, options, KEY_OPTION)?,
            },
            "deleteprompt" => Self::DeletePrompt,
            "deletekey" => Self::DeleteKey,
            "info" => Self::Info,
            "help" => Self::Help,
            other => {
                return Err(Error::Validation(format!(
                    "Unknown command `/{other}`. Use `/help` to see what I can do."
                )))
            }
        };
        Ok(command)
    }

    pub fn from_interaction(interaction: &Interaction) -> Result<Self> {
        Self::parse(&interaction.command, &interaction.options)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::SetPrompt { .. } => "setprompt",
            Self::PromptLimit => "promptlimit",
            Self::SetKey { .. } => "setkey",
            Self::DeletePrompt => "deleteprompt",
            Self::DeleteKey => "deletekey",
            Self::Info => "info",
            Self::Help => "help",
        }
    }
}

// Keys and prompts stay out of logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { prompt } => f
                .debug_struct("Chat")
                .field("prompt_chars", &prompt.as_ref().map(|p| p.chars().count()))
                .finish(),
            Self::SetPrompt { prompt } => f
                .debug_struct("SetPrompt")
                .field("prompt_chars", &prompt.chars().count())
                .finish(),
            Self::SetKey { .. } => f.debug_struct("SetKey").field("key", &"***").finish(),
            other => f.write_str(other.name()),
        }
    }
}

fn required(command: &str, options: &HashMap<String, String>, option: &str) -> Result<String> {
    options
        .get(option)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| Error::Validation(format!("`/{command}` needs a `{option}` value.")))
}

/// Slash-command definitions for bulk registration.
pub fn definitions() -> Value {
    let string_option = |name: &str, description: &str, required: bool| {
        json!({
            "type": 3,
            "name": name,
            "description": description,
            "required": required,
        })
    };
    let command = |name: &str, description: &str, options: Vec<Value>| {
        json!({
            "type": 1,
            "name": name,
            "description": description,
            "options": options,
        })
    };

    Value::Array(vec![
        command(
            "chat",
            "Start a chat session with your custom prompt",
            vec![string_option(
                PROMPT_OPTION,
                "Use this prompt for this session instead of your saved one",
                false,
            )],
        ),
        command(
            "setprompt",
            "Save your custom prompt",
            vec![string_option(PROMPT_OPTION, "The prompt to save", true)],
        ),
        command("promptlimit", "Show the maximum prompt length", vec![]),
        command(
            "setkey",
            "Save your OpenAI API key",
            vec![string_option(KEY_OPTION, "Your OpenAI API key", true)],
        ),
        command("deleteprompt", "Delete your saved prompt", vec![]),
        command("deletekey", "Delete your saved OpenAI API key", vec![]),
        command("info", "Show what you have saved", vec![]),
        command("help", "List the available commands", vec![]),
    ])
}

/// Text of the `help` reply.
pub fn help_text() -> String {
    [
        "**Available commands**",
        "`/chat [prompt]` - Start a chat session. Uses your saved prompt unless you pass one.",
        "`/setprompt <prompt>` - Save your custom prompt.",
        "`/promptlimit` - Show the maximum prompt length.",
        "`/setkey <key>` - Save your OpenAI API key. It is stored encrypted.",
        "`/deleteprompt` - Delete your saved prompt.",
        "`/deletekey` - Delete your saved API key.",
        "`/info` - Show what you have saved.",
        "`/help` - Show this message.",
        "",
        "During a chat session, type `exit` or `stop` to end it.",
    ]
    .join("\n")
}

/// Text of the `promptlimit` reply.
pub fn prompt_limit_text() -> String {
    format!("Custom prompts can be at most {MAX_INSTRUCTION_CHARS} characters long.")
}
