//! Durable per-user store for custom prompts and encrypted API keys.
//!
//! The whole store is one JSON object keyed by user ID:
//!
//! ```json
//! { "1234": { "promptId": "You are terse.", "openaiKey": "<hex iv>:<hex ciphertext>" } }
//! ```
//!
//! Every mutation rewrites the full file through a temporary sibling and a
//! rename. A failed write leaves the in-memory state in place; the next
//! successful write carries it to disk.

use relay_common::security::{Credential, SecretCodec};
use relay_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Maximum length of a custom prompt, in characters.
pub const MAX_INSTRUCTION_CHARS: usize = 4000;

/// Stored state for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Custom system prompt
    #[serde(rename = "promptId", default, skip_serializing_if = "Option::is_none")]
    pub custom_instruction: Option<String>,

    /// Encrypted API key token
    #[serde(rename = "openaiKey", default, skip_serializing_if = "Option::is_none")]
    pub encrypted_credential: Option<String>,
}

impl UserRecord {
    pub fn has_instruction(&self) -> bool {
        self.custom_instruction.is_some()
    }

    pub fn has_credential(&self) -> bool {
        self.encrypted_credential.is_some()
    }
}

/// Reject prompts longer than [`MAX_INSTRUCTION_CHARS`].
pub fn validate_instruction(text: &str) -> Result<()> {
    let len = text.chars().count();
    if len > MAX_INSTRUCTION_CHARS {
        return Err(Error::Validation(format!(
            "Your custom prompt is {len} characters long. The limit is {MAX_INSTRUCTION_CHARS} characters."
        )));
    }
    if text.trim().is_empty() {
        return Err(Error::Validation("Your custom prompt cannot be empty.".into()));
    }
    Ok(())
}

/// JSON-file backed user store.
pub struct UserStore {
    path: PathBuf,
    codec: SecretCodec,
    users: RwLock<BTreeMap<String, UserRecord>>,
    /// Serializes file writes so the newest snapshot always lands last
    write_lock: Mutex<()>,
}

impl UserStore {
    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. An unreadable or malformed file is
    /// logged and also yields an empty store; startup never fails here.
    pub async fn load(path: impl Into<PathBuf>, codec: SecretCodec) -> Self {
        let path = path.into();
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => match serde_json::from_str::<BTreeMap<String, UserRecord>>(&content) {
                Ok(users) => users,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "User store is malformed, starting with an empty store"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "User store not found, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read user store, starting with an empty store"
                );
                BTreeMap::new()
            }
        };

        tracing::info!(path = %path.display(), users = users.len(), "User store loaded");

        Self {
            path,
            codec,
            users: RwLock::new(users),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of known users.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    /// Get a user's record, creating an empty one if the user is new.
    pub async fn get(&self, user_id: &str) -> UserRecord {
        if let Some(record) = self.users.read().await.get(user_id) {
            return record.clone();
        }
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Save a custom prompt.
    ///
    /// Oversized prompts are rejected before anything changes.
    pub async fn set_instruction(&self, user_id: &str, text: &str) -> Result<()> {
        validate_instruction(text)?;
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .custom_instruction = Some(text.to_string());
        self.persist().await
    }

    /// Encrypt and save an API key.
    pub async fn set_credential(&self, user_id: &str, raw_secret: &str) -> Result<()> {
        let raw_secret = raw_secret.trim();
        if raw_secret.is_empty() {
            return Err(Error::Validation("Your API key cannot be empty.".into()));
        }
        let token = self.codec.encrypt(raw_secret);
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .encrypted_credential = Some(token);
        self.persist().await
    }

    /// Remove the custom prompt. Returns `false` without writing when there was none.
    pub async fn clear_instruction(&self, user_id: &str) -> Result<bool> {
        let removed = self
            .users
            .write()
            .await
            .get_mut(user_id)
            .and_then(|r| r.custom_instruction.take())
            .is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Remove the API key. Returns `false` without writing when there was none.
    pub async fn clear_credential(&self, user_id: &str) -> Result<bool> {
        let removed = self
            .users
            .write()
            .await
            .get_mut(user_id)
            .and_then(|r| r.encrypted_credential.take())
            .is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Decrypt a user's API key.
    ///
    /// A stored token that fails to decrypt is an error, never treated as absent.
    pub async fn credential(&self, user_id: &str) -> Result<Option<Credential>> {
        let token = self
            .users
            .read()
            .await
            .get(user_id)
            .and_then(|r| r.encrypted_credential.clone());

        match token {
            Some(token) => self.codec.decrypt_credential(&token).map(Some).map_err(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "Stored API key failed to decrypt");
                e
            }),
            None => Ok(None),
        }
    }

    /// Write the full store to disk.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let users = self.users.read().await;
            serde_json::to_vec_pretty(&*users)?
        };

        write_atomic(&self.path, &snapshot).await.map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist user store");
            Error::StoreIo(format!("{}: {e}", self.path.display()))
        })?;

        tracing::debug!(path = %self.path.display(), bytes = snapshot.len(), "User store persisted");
        Ok(())
    }
}

/// Write `data` to a temporary sibling of `path`, then rename it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
