//! Relay Common - Shared types and utilities for the relay bot.
//!
//! This crate provides:
//! - Configuration types, loading and startup validation
//! - The error taxonomy shared by every component
//! - Logging setup and structured logging helpers
//! - Security primitives (encryption of stored credentials)

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod security;

pub use config::{
    BotConfig, CompletionConfig, Config, ObservabilityConfig, SessionConfig, StoreConfig,
};
pub use error::{Error, Result};
pub use security::{Credential, EncryptionKey, SecretCodec};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::security::{Credential, SecretCodec};
}
