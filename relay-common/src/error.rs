//! Error types for the relay bot.

use thiserror::Error;

/// Result type alias using the relay error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the relay bot.
///
/// Only [`Error::Config`] is fatal, and only at startup. Every other variant is
/// recovered at the command or message boundary and turned into a notice via
/// [`Error::user_message`].
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing startup configuration (encryption key, platform token)
    #[error("Configuration error: {0}")]
    Config(String),

    /// User input rejected before any state was touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored ciphertext token could not be decrypted
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The durable user store could not be written
    #[error("Store IO error: {0}")]
    StoreIo(String),

    /// The completion backend could not be reached or answered with an error status
    #[error("Backend transport error: {0}")]
    BackendTransport(String),

    /// The completion backend answered with a body we could not read
    #[error("Backend parse error: {0}")]
    BackendParse(String),

    /// The user already has an open chat session
    #[error("Session conflict: {0}")]
    SessionConflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error must abort the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a backend error that keeps the chat session alive.
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::BackendTransport(_) | Self::BackendParse(_))
    }

    /// Text shown to the user when this error reaches a handler boundary.
    ///
    /// Never includes the underlying detail for secret-bearing variants.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Decryption(_) => {
                "Your saved API key could not be decrypted. Please save it again with `/setkey`."
                    .into()
            }
            Self::StoreIo(_) => {
                "Your change was applied but could not be saved to disk. It will be saved with the next successful update."
                    .into()
            }
            Self::BackendTransport(_) => {
                "Sorry, there was an error contacting OpenAI. Please try again.".into()
            }
            Self::BackendParse(_) => {
                "Sorry, I couldn't understand the response from OpenAI.".into()
            }
            Self::SessionConflict(_) => {
                "You already have an active chat session. Type `exit` or `stop` to end it first."
                    .into()
            }
            Self::Config(_) | Self::Io(_) | Self::Json(_) => {
                "Something went wrong while handling your request.".into()
            }
        }
    }
}
