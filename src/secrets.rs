//! On-demand secret file reader.
//!
//! Both secrets are read from disk on every use, so rotating a key is a
//! matter of rewriting the file. Contents are trimmed; an empty file counts
//! as missing.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::SecretsConfig;

#[derive(Clone, Debug)]
pub struct SecretStore {
    api_key_file: PathBuf,
    desktop_credential_file: PathBuf,
}

impl SecretStore {
    pub fn new(config: &SecretsConfig) -> Self {
        Self {
            api_key_file: PathBuf::from(&config.api_key_file),
            desktop_credential_file: PathBuf::from(&config.desktop_credential_file),
        }
    }

    /// Current client API key, or `None` if the file is missing, unreadable
    /// or empty.
    pub async fn api_key(&self) -> Option<String> {
        read_secret(&self.api_key_file).await
    }

    /// Current desktop backend password.
    pub async fn desktop_credential(&self) -> Option<String> {
        read_secret(&self.desktop_credential_file).await
    }
}

async fn read_secret(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                warn!("Secret file {} is empty", path.display());
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(e) => {
            warn!("Cannot read secret file {}: {e}", path.display());
            None
        }
    }
}
