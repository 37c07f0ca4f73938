//! Shared-secret storage.
//!
//! One bearer token, persisted as `{token, createdAt}` JSON in the user's
//! config directory with owner-only permissions. The `INFERENCE_TOKEN`
//! environment variable, when set, wins over the file on both the server
//! and the client side.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const TOKEN_ENV_VAR: &str = "INFERENCE_TOKEN";
const TOKEN_BYTES: usize = 32;
const APP_DIR: &str = "remote-inference";
const FILE_NAME: &str = "credentials.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    token: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    env_var: String,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::at(default_path())
    }
}

impl CredentialStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_var: TOKEN_ENV_VAR.to_string(),
        }
    }

    /// Read the override from a different environment variable.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The active token: environment first, then the file. Missing or
    /// malformed storage is simply "no token".
    pub fn current_token(&self) -> Option<String> {
        if let Ok(token) = std::env::var(&self.env_var) {
            if !token.is_empty() {
                return Some(token);
            }
        }

        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredCredential>(&raw) {
            Ok(stored) if !stored.token.is_empty() => Some(stored.token),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring unreadable credential file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Mint a fresh 32-byte token, persist it (replacing any previous one)
    /// and return it.
    pub fn generate_and_persist(&self) -> anyhow::Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create credential directory {}", dir.display()))?;
        }

        let stored = StoredCredential {
            token: token.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        write_private(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write credential file {}", self.path.display()))?;

        info!("🔑 Generated new inference token at {}", self.path.display());
        Ok(token)
    }

    /// Delete the persisted token. `Ok(false)` when there was nothing to delete.
    pub fn revoke(&self) -> anyhow::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Revoked inference token at {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// Short, non-reversible label for a token, safe to print in logs.
pub fn fingerprint(token: &str) -> String {
    let hash = blake3::hash(token.as_bytes());
    hash.to_hex().as_str()[..8].to_string()
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(FILE_NAME)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
