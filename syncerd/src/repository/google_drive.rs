use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use gdrive_core::{ClientSecret, DriveClient, DriveFile, OAuthClient};
use tracing::{debug, info, warn};

use super::{RemoteObject, RepoError, Repository};
use crate::config::SyncerConfig;
use crate::oauth_flow::OAuthFlow;
use crate::registry::{FileRegistry, TrackedFile, Vendor};
use crate::storage::{OAuthState, TokenStore, TokenStoreError, now_unix};
use crate::sync::backoff::Backoff;
use crate::sync::transfer::{ExpectedContent, write_stream_atomically};

/// Refresh this many seconds before the recorded expiry.
const REFRESH_SKEW_SECS: i64 = 60;

pub struct GoogleDriveRepository {
    registry: FileRegistry,
    tokens: TokenStore,
    client_secret_path: PathBuf,
    base_url: Option<String>,
    http_timeout: Duration,
    oauth_port: u16,
    oauth_timeout: Duration,
    backoff: Backoff,
}

impl GoogleDriveRepository {
    pub fn new(config: &SyncerConfig, registry: FileRegistry) -> Self {
        Self {
            registry,
            tokens: TokenStore::new(config.token_path(Vendor::GoogleDrive)),
            client_secret_path: config.client_secret_path.clone(),
            base_url: config.drive_base_url.clone(),
            http_timeout: config.http_timeout,
            oauth_port: config.oauth_port,
            oauth_timeout: config.oauth_timeout,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn client_secret(&self) -> Result<Option<ClientSecret>, RepoError> {
        match std::fs::read_to_string(&self.client_secret_path) {
            Ok(raw) => Ok(Some(ClientSecret::from_json(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn oauth_client(&self) -> Result<Option<OAuthClient>, RepoError> {
        self.client_secret()?
            .map(|secret| OAuthClient::from_client_secret(&secret))
            .transpose()
            .map_err(RepoError::from)
    }

    /// Stored access token, refreshed and written back when about to expire.
    /// A refresh token Google no longer honours is discarded so that
    /// `syncer auth` starts a new authorization.
    async fn access_token(&self) -> Result<String, RepoError> {
        let state = self.tokens.load().map_err(|err| match err {
            TokenStoreError::TokenNotFound(_) => RepoError::NotAuthenticated(Vendor::GoogleDrive),
            other => other.into(),
        })?;
        if !state.expires_within(now_unix(), REFRESH_SKEW_SECS) {
            return Ok(state.access_token);
        }
        let Some(refresh_token) = state.refresh_token.as_deref() else {
            warn!("access token expired and no refresh token is stored");
            self.tokens.delete()?;
            return Err(RepoError::CredentialsExpired(Vendor::GoogleDrive));
        };
        let client = self
            .oauth_client()?
            .ok_or_else(|| RepoError::MissingClientSecret(self.client_secret_path.clone()))?;
        let token = match client.refresh_token(refresh_token).await {
            Ok(token) => token,
            Err(err) if err.is_invalid_grant() => {
                warn!(error = %err, "refresh token rejected, discarding stored credentials");
                self.tokens.delete()?;
                return Err(RepoError::CredentialsExpired(Vendor::GoogleDrive));
            }
            Err(err) => return Err(err.into()),
        };
        let refreshed = state.refreshed_with(&token);
        self.tokens.save(&refreshed)?;
        debug!("refreshed access token persisted");
        Ok(refreshed.access_token)
    }

    async fn drive_client(&self) -> Result<DriveClient, RepoError> {
        let token = self.access_token().await?;
        let client = match &self.base_url {
            Some(url) => DriveClient::with_base_url(url, token)?,
            None => DriveClient::new(token)?,
        };
        Ok(client.with_timeout(self.http_timeout)?)
    }
}

#[async_trait]
impl Repository for GoogleDriveRepository {
    fn vendor(&self) -> Vendor {
        Vendor::GoogleDrive
    }

    fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    async fn list_remote(&self) -> Result<Vec<RemoteObject>, RepoError> {
        let client = self.drive_client().await?;
        let mut attempt = 0;
        loop {
            match client.list_files_all().await {
                Ok(files) => return Ok(files.into_iter().map(RemoteObject::from).collect()),
                Err(err) if err.is_retryable() && attempt + 1 < self.backoff.max_attempts() => {
                    let delay = self.backoff.delay_with_hint(attempt, err.retry_after());
                    warn!(attempt, ?delay, error = %err, "drive listing failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn download(&self, remote: &RemoteObject, target: &Path) -> Result<(), RepoError> {
        let client = self.drive_client().await?;
        let download = client.download(&remote.id).await?;
        let expected = ExpectedContent {
            len: remote.size.or(download.content_length),
            md5: remote.md5.as_deref(),
        };
        let written = write_stream_atomically(download.body, expected, target).await?;
        debug!(remote_id = %remote.id, bytes = written, "download complete");
        Ok(())
    }

    async fn upload(
        &self,
        file: &TrackedFile,
        content: Vec<u8>,
        existing: Option<&RemoteObject>,
    ) -> Result<RemoteObject, RepoError> {
        let client = self.drive_client().await?;
        let uploaded = match existing {
            Some(remote) => client.update_file_content(&remote.id, content).await?,
            None => client.create_file(&file.remote_name, content).await?,
        };
        Ok(uploaded.into())
    }

    async fn authenticate(&self) -> Result<(), RepoError> {
        if self.tokens.exists() {
            debug!(path = %self.tokens.path().display(), "stored credentials found");
            return Ok(());
        }
        let client = self
            .oauth_client()?
            .ok_or_else(|| RepoError::MissingClientSecret(self.client_secret_path.clone()))?;
        let flow = OAuthFlow::new(client, self.oauth_port, self.oauth_timeout);
        let token = flow.authenticate().await?;
        self.tokens.save(&OAuthState::from_oauth_token(&token))?;
        info!(path = %self.tokens.path().display(), "google drive credentials saved");
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.tokens.exists()
    }
}

impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        let size = file.size_bytes();
        Self {
            id: file.id,
            name: file.name,
            modified_time: file.modified_time.unwrap_or_default(),
            size,
            md5: file.md5_checksum,
        }
    }
}

#[cfg(test)]
#[path = "google_drive_tests.rs"]
mod tests;
