use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{RemoteObject, RepoError, Repository};
use crate::registry::{FileRegistry, TrackedFile, Vendor};
use crate::sync::transfer::{TransferError, content_md5};

/// In-memory vendor used to exercise the shared sync policy.
pub(crate) struct FakeRepository {
    registry: FileRegistry,
    remote: Mutex<Vec<RemoteObject>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    listing_fails: Mutex<bool>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeRepository {
    pub(crate) fn new(registry: FileRegistry) -> Self {
        Self {
            registry,
            remote: Mutex::new(Vec::new()),
            contents: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            listing_fails: Mutex::new(false),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub(crate) fn put_remote(&self, name: &str, modified_time: &str, content: &[u8]) -> String {
        let id = format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.remote.lock().unwrap().push(RemoteObject {
            id: id.clone(),
            name: name.to_string(),
            modified_time: modified_time.to_string(),
            size: Some(content.len() as u64),
            md5: None,
        });
        self.contents
            .lock()
            .unwrap()
            .insert(id.clone(), content.to_vec());
        id
    }

    /// Transfers of `name` fail in both directions.
    pub(crate) fn fail_transfers_of(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn fail_listing(&self) {
        *self.listing_fails.lock().unwrap() = true;
    }

    pub(crate) fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub(crate) fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub(crate) fn remote_content(&self, name: &str) -> Option<Vec<u8>> {
        let id = self
            .remote
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id.clone())?;
        self.contents.lock().unwrap().get(&id).cloned()
    }

    fn is_failing(&self, name: &str) -> bool {
        self.failing.lock().unwrap().contains(name)
    }

    fn injected_failure(name: &str) -> RepoError {
        RepoError::Transfer(TransferError::Io(std::io::Error::other(format!(
            "injected failure for {name}"
        ))))
    }
}

#[async_trait]
impl Repository for FakeRepository {
    fn vendor(&self) -> Vendor {
        Vendor::GoogleDrive
    }

    fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    async fn list_remote(&self) -> Result<Vec<RemoteObject>, RepoError> {
        if *self.listing_fails.lock().unwrap() {
            return Err(RepoError::Io(std::io::Error::other("listing unavailable")));
        }
        Ok(self.remote.lock().unwrap().clone())
    }

    async fn download(&self, remote: &RemoteObject, target: &Path) -> Result<(), RepoError> {
        if self.is_failing(&remote.name) {
            return Err(Self::injected_failure(&remote.name));
        }
        let content = self
            .contents
            .lock()
            .unwrap()
            .get(&remote.id)
            .cloned()
            .unwrap_or_default();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Stamps the stored object a few seconds ahead of the local clock, the
    /// way a server with clock skew would.
    async fn upload(
        &self,
        file: &TrackedFile,
        content: Vec<u8>,
        existing: Option<&RemoteObject>,
    ) -> Result<RemoteObject, RepoError> {
        if self.is_failing(&file.remote_name) {
            return Err(Self::injected_failure(&file.remote_name));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let modified_time = (OffsetDateTime::now_utc() + time::Duration::seconds(5))
            .format(&Rfc3339)
            .unwrap();
        let id = match existing {
            Some(remote) => remote.id.clone(),
            None => self.put_remote(&file.remote_name, &modified_time, &content),
        };
        let mut remote = self.remote.lock().unwrap();
        let stored = remote.iter_mut().find(|r| r.id == id).unwrap();
        stored.modified_time = modified_time;
        stored.size = Some(content.len() as u64);
        stored.md5 = Some(content_md5(&content));
        let uploaded = stored.clone();
        self.contents.lock().unwrap().insert(id, content);
        Ok(uploaded)
    }

    async fn authenticate(&self) -> Result<(), RepoError> {
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        true
    }
}
