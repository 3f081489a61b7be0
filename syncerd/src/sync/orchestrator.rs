use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::SyncerConfig;
use crate::registry::{FileRegistry, RegistryError, Status, TrackedFile, Vendor};
use crate::repository::{Repository, open_repository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pull,
    Push,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pull => "pull",
            Phase::Push => "push",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorOutcome {
    pub vendor: Vendor,
    pub phase: Phase,
    pub files: usize,
    pub synced: usize,
    pub error: Option<String>,
}

/// Result of one run, one entry per vendor that had tracked files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub outcomes: Vec<VendorOutcome>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &VendorOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.error.is_some())
    }

    fn merge(&mut self, other: SyncReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Runs pulls and pushes over every tracked file, one vendor at a time.
pub struct SyncOrchestrator {
    registry: FileRegistry,
    repositories: BTreeMap<Vendor, Arc<dyn Repository>>,
}

impl SyncOrchestrator {
    pub fn new(registry: FileRegistry) -> Self {
        Self {
            registry,
            repositories: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &SyncerConfig, registry: FileRegistry) -> Self {
        Vendor::ALL.into_iter().fold(Self::new(registry.clone()), |orchestrator, vendor| {
            orchestrator.with_repository(open_repository(vendor, config, registry.clone()))
        })
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repositories.insert(repository.vendor(), repository);
        self
    }

    pub fn repository(&self, vendor: Vendor) -> Option<Arc<dyn Repository>> {
        self.repositories.get(&vendor).cloned()
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub async fn run_pull(&self) -> Result<SyncReport, RegistryError> {
        self.run(Phase::Pull).await
    }

    pub async fn run_push(&self) -> Result<SyncReport, RegistryError> {
        self.run(Phase::Push).await
    }

    /// Pull then push, re-reading the registry in between.
    pub async fn run_cycle(&self) -> Result<SyncReport, RegistryError> {
        let mut report = self.run_pull().await?;
        report.merge(self.run_push().await?);
        Ok(report)
    }

    /// Sleeps `interval`, runs a cycle, repeats until `shutdown` resolves. A
    /// cycle in progress is finished before the loop exits.
    pub async fn run_daemon<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(interval_secs = interval.as_secs(), "sync daemon started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.run_cycle().await {
                Ok(report) if report.is_success() => {
                    info!(vendors = report.outcomes.len(), "sync cycle complete");
                }
                Ok(report) => {
                    for failure in report.failures() {
                        warn!(
                            vendor = %failure.vendor,
                            phase = %failure.phase,
                            error = failure.error.as_deref().unwrap_or_default(),
                            "sync cycle finished with errors"
                        );
                    }
                }
                Err(err) => error!(error = %err, "registry unavailable, skipping cycle"),
            }
        }
        info!("sync daemon stopped");
    }

    async fn run(&self, phase: Phase) -> Result<SyncReport, RegistryError> {
        let files = self.registry.list().await?;
        let mut report = SyncReport::default();
        for (vendor, mut files) in group_by_vendor(files) {
            let Some(repository) = self.repositories.get(&vendor) else {
                warn!(%vendor, "no repository configured, skipping");
                report.outcomes.push(VendorOutcome {
                    vendor,
                    phase,
                    files: files.len(),
                    synced: 0,
                    error: Some(format!("no repository configured for {vendor}")),
                });
                continue;
            };
            let result = match phase {
                Phase::Pull => repository.pull_all(&mut files).await.map_err(|err| err.to_string()),
                Phase::Push => repository.push_all(&mut files).await.map_err(|err| err.to_string()),
            };
            if let Err(message) = &result {
                warn!(%vendor, %phase, error = %message, "vendor run failed");
            }
            report.outcomes.push(VendorOutcome {
                vendor,
                phase,
                files: files.len(),
                synced: files.iter().filter(|f| f.status == Status::Synced).count(),
                error: result.err(),
            });
        }
        Ok(report)
    }
}

/// Partitions records by vendor, keeping registry order inside each group.
pub fn group_by_vendor(files: Vec<TrackedFile>) -> BTreeMap<Vendor, Vec<TrackedFile>> {
    let mut groups: BTreeMap<Vendor, Vec<TrackedFile>> = BTreeMap::new();
    for file in files {
        groups.entry(file.vendor).or_default().push(file);
    }
    groups
}
