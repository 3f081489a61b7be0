use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use gdrive_core::OAuthToken;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("token file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Credential material persisted per vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl OAuthState {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64)),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }

    /// Expires within `skew_secs` of `now`. Without a recorded expiry the
    /// token is assumed valid until the API rejects it.
    pub fn expires_within(&self, now: i64, skew_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now.saturating_add(skew_secs))
    }

    /// State after a refresh grant. Google usually omits the refresh token
    /// and scope from the response; the stored ones carry over.
    pub fn refreshed_with(&self, token: &OAuthToken) -> Self {
        let fresh = Self::from_oauth_token(token);
        Self {
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            scope: fresh.scope.or_else(|| self.scope.clone()),
            ..fresh
        }
    }
}

/// JSON token file readable only by its owner.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &OAuthState) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(state)?;
        let staging = self.path.with_extension("json.tmp");
        {
            let mut file = owner_only_options().open(&staging)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<OAuthState, TokenStoreError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TokenStoreError::TokenNotFound(self.path.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The token file exists and can be opened; expiry is not checked.
    pub fn exists(&self) -> bool {
        fs::File::open(&self.path).is_ok()
    }

    pub fn delete(&self) -> Result<(), TokenStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(unix)]
fn owner_only_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    options
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
