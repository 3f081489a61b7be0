//! Vendor repositories.
//!
//! A vendor implements a handful of primitives (listing, download, upload and
//! credential handling). Reconciliation, status bookkeeping and batch error
//! policy are provided once on top of them by [`Repository`].

mod google_drive;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::SyncerConfig;
use crate::oauth_flow::OAuthFlowError;
use crate::registry::{FileRegistry, RegistryError, Status, TrackedFile, Vendor};
use crate::storage::TokenStoreError;
use crate::sync::reconcile::{PullDecision, PushDecision, plan_pull, plan_push, synced_at};
use crate::sync::transfer::{TransferError, content_md5, local_md5, read_local};

pub use google_drive::GoogleDriveRepository;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("no remote object named {0}")]
    NotFound(String),
    #[error("not authenticated with {0}, run `syncer auth` first")]
    NotAuthenticated(Vendor),
    #[error("{0} credentials expired and cannot be refreshed, run `syncer auth` again")]
    CredentialsExpired(Vendor),
    #[error("client secret not found at {0}")]
    MissingClientSecret(PathBuf),
    #[error("drive api error: {0}")]
    Drive(#[from] gdrive_core::DriveError),
    #[error("oauth error: {0}")]
    OAuth(#[from] gdrive_core::OAuthError),
    #[error("authorization failed: {0}")]
    OAuthFlow(#[from] OAuthFlowError),
    #[error("token storage error: {0}")]
    TokenStore(#[from] TokenStoreError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    /// Worth retrying on the next cycle without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::Drive(err) => err.is_retryable(),
            RepoError::Transfer(TransferError::Source(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub remote_name: String,
    pub message: String,
}

/// Every failure of a batch push, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateError {
    pub failures: Vec<FileFailure>,
}

impl AggregateError {
    fn push(&mut self, file: &TrackedFile, err: &RepoError) {
        self.failures.push(FileFailure {
            remote_name: file.remote_name.clone(),
            message: err.to_string(),
        });
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("{}: {}", failure.remote_name, failure.message))
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

impl std::error::Error for AggregateError {}

/// A remote object as reported by the vendor listing. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    /// RFC 3339, as sent by the vendor.
    pub modified_time: String,
    pub size: Option<u64>,
    pub md5: Option<String>,
}

impl RemoteObject {
    pub fn modified_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(
            &self.modified_time,
            &time::format_description::well_known::Rfc3339,
        )
        .ok()
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn registry(&self) -> &FileRegistry;

    /// Full listing of remote objects, in vendor order.
    async fn list_remote(&self) -> Result<Vec<RemoteObject>, RepoError>;

    /// Replaces `target` with the content of `remote`, atomically.
    async fn download(&self, remote: &RemoteObject, target: &Path) -> Result<(), RepoError>;

    /// Sends `content` as `file`, replacing `existing` when given and creating
    /// a new object otherwise. Returns the object as stored by the vendor.
    async fn upload(
        &self,
        file: &TrackedFile,
        content: Vec<u8>,
        existing: Option<&RemoteObject>,
    ) -> Result<RemoteObject, RepoError>;

    /// No-op when stored credentials exist.
    async fn authenticate(&self) -> Result<(), RepoError>;

    fn is_authenticated(&self) -> bool;

    async fn list(&self) -> Result<Vec<String>, RepoError> {
        Ok(self
            .list_remote()
            .await?
            .into_iter()
            .map(|remote| remote.name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn get_remote_id(&self, name: &str) -> Result<String, RepoError> {
        self.list_remote()
            .await?
            .into_iter()
            .find(|remote| remote.name == name)
            .map(|remote| remote.id)
            .ok_or_else(|| RepoError::NotFound(name.to_string()))
    }

    async fn pull(&self, file: &mut TrackedFile) -> Result<(), RepoError> {
        let listing = match self.list_remote().await {
            Ok(listing) => listing,
            Err(err) => {
                mark_failed(self.registry(), file, &err).await;
                return Err(err);
            }
        };
        pull_from_listing(self, &listing, file).await
    }

    /// Lists once, then pulls every file of this vendor. Stops at the first
    /// failure; files already processed keep their new status.
    async fn pull_all(&self, files: &mut [TrackedFile]) -> Result<(), RepoError> {
        let listing = self.list_remote().await?;
        let vendor = self.vendor();
        for file in files.iter_mut().filter(|file| file.vendor == vendor) {
            pull_from_listing(self, &listing, file).await?;
        }
        Ok(())
    }

    async fn push(&self, file: &mut TrackedFile) -> Result<(), RepoError> {
        let listing = match self.list_remote().await {
            Ok(listing) => listing,
            Err(err) => {
                mark_failed(self.registry(), file, &err).await;
                return Err(err);
            }
        };
        push_from_listing(self, &listing, file).await
    }

    /// Pushes every file of this vendor independently and reports all failures.
    async fn push_all(&self, files: &mut [TrackedFile]) -> Result<(), AggregateError> {
        let vendor = self.vendor();
        let mut aggregate = AggregateError::default();
        let listing = match self.list_remote().await {
            Ok(listing) => listing,
            Err(err) => {
                for file in files.iter_mut().filter(|file| file.vendor == vendor) {
                    mark_failed(self.registry(), file, &err).await;
                    aggregate.push(file, &err);
                }
                return Err(aggregate);
            }
        };
        for file in files.iter_mut().filter(|file| file.vendor == vendor) {
            if let Err(err) = push_from_listing(self, &listing, file).await {
                aggregate.push(file, &err);
            }
        }
        if aggregate.failures.is_empty() {
            Ok(())
        } else {
            Err(aggregate)
        }
    }
}

async fn pull_from_listing<R>(
    repo: &R,
    listing: &[RemoteObject],
    file: &mut TrackedFile,
) -> Result<(), RepoError>
where
    R: Repository + ?Sized,
{
    let local_exists = tokio::fs::try_exists(&file.local_path)
        .await
        .unwrap_or(false);
    match plan_pull(listing, file, local_exists) {
        PullDecision::NoRemote => {
            info!(remote_name = %file.remote_name, vendor = %file.vendor, "no remote counterpart, nothing to pull");
            Ok(())
        }
        PullDecision::UpToDate(remote) => {
            file.remote_id = remote.id.clone();
            file.status = Status::Synced;
            repo.registry().update(file, None).await?;
            Ok(())
        }
        PullDecision::Download(remote) => {
            if let Err(err) = repo.download(remote, &file.local_path).await {
                mark_failed(repo.registry(), file, &err).await;
                return Err(err);
            }
            file.remote_id = remote.id.clone();
            file.status = Status::Synced;
            file.local_md5 = local_md5(&file.local_path).await.ok();
            let pulled = synced_at(OffsetDateTime::now_utc(), remote);
            repo.registry().update(file, Some(pulled)).await?;
            info!(
                remote_name = %file.remote_name,
                local_path = %file.local_path.display(),
                "pulled"
            );
            Ok(())
        }
    }
}

async fn push_from_listing<R>(
    repo: &R,
    listing: &[RemoteObject],
    file: &mut TrackedFile,
) -> Result<(), RepoError>
where
    R: Repository + ?Sized,
{
    let content = match read_local(&file.local_path).await {
        Ok(content) => content,
        Err(err) => {
            let err = RepoError::from(err);
            mark_failed(repo.registry(), file, &err).await;
            return Err(err);
        }
    };
    let digest = content_md5(&content);
    let existing = match plan_push(listing, file, &digest) {
        PushDecision::Unchanged(remote) => {
            file.remote_id = remote.id.clone();
            file.status = Status::Synced;
            file.local_md5 = Some(digest);
            repo.registry().update(file, None).await?;
            debug!(remote_name = %file.remote_name, "local content unchanged, not pushed");
            return Ok(());
        }
        PushDecision::Create => None,
        PushDecision::Replace(remote) => Some(remote),
    };
    match repo.upload(file, content, existing).await {
        Ok(uploaded) => {
            file.remote_id = uploaded.id.clone();
            file.status = Status::Synced;
            file.last_pushed = synced_at(OffsetDateTime::now_utc(), &uploaded);
            file.local_md5 = Some(digest);
            repo.registry().update(file, None).await?;
            info!(
                remote_name = %file.remote_name,
                created = existing.is_none(),
                "pushed"
            );
            Ok(())
        }
        Err(err) => {
            mark_failed(repo.registry(), file, &err).await;
            Err(err)
        }
    }
}

/// Best effort: a failure to persist is logged and the sync error is returned.
async fn mark_failed(registry: &FileRegistry, file: &mut TrackedFile, err: &RepoError) {
    warn!(
        remote_name = %file.remote_name,
        error = %err,
        transient = err.is_transient(),
        "sync failed"
    );
    file.status = Status::Error;
    if let Err(persist) = registry.update(file, None).await {
        warn!(remote_name = %file.remote_name, error = %persist, "failed to record error status");
    }
}

/// Builds the repository for `vendor`.
pub fn open_repository(
    vendor: Vendor,
    config: &SyncerConfig,
    registry: FileRegistry,
) -> Arc<dyn Repository> {
    match vendor {
        Vendor::GoogleDrive => Arc::new(GoogleDriveRepository::new(config, registry)),
    }
}

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;
