//! Scheduler
//!
//! A single cooperative timing loop driving the update and cleanup
//! pipelines. Each tick snapshots the registry, applies the health policy
//! (auto-ignore), and dispatches jobs onto worker tasks under a global
//! concurrency ceiling and per-directory leases. Cancellation unwinds
//! in-flight passes at their next page boundary.

use crate::cleanup::{CleanupPipeline, CleanupReport};
use crate::config::SchedulerConfig;
use crate::directory_registry::{DirectoryRecord, DirectoryRegistry, UpdatePolicy};
use crate::error::{McsdError, Result, StorageError};
use crate::provider::DirectoryProviderRefresher;
use crate::update_pipeline::{PassReport, UpdatePipeline};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a directory is currently doing, for operator introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Idle,
    Running,
    Cleaning,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Update,
    Cleanup,
}

/// Releases the per-directory lease when the job ends, however it ends.
struct LeaseGuard {
    leases: Arc<DashMap<String, JobKind>>,
    directory_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.remove(&self.directory_id);
    }
}

/// The scheduling loop plus the shared dispatch state.
pub struct Scheduler {
    registry: DirectoryRegistry,
    update_pipeline: Arc<UpdatePipeline>,
    cleanup_pipeline: Arc<CleanupPipeline>,
    refresher: Option<Arc<DirectoryProviderRefresher>>,
    config: SchedulerConfig,
    policy: UpdatePolicy,
    leases: Arc<DashMap<String, JobKind>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    pass_log: Arc<Mutex<VecDeque<PassReport>>>,
}

impl Scheduler {
    pub fn new(
        registry: DirectoryRegistry,
        update_pipeline: Arc<UpdatePipeline>,
        cleanup_pipeline: Arc<CleanupPipeline>,
        refresher: Option<Arc<DirectoryProviderRefresher>>,
        config: SchedulerConfig,
    ) -> Self {
        let policy = UpdatePolicy::from_config(&config);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_updates));
        Self {
            registry,
            update_pipeline,
            cleanup_pipeline,
            refresher,
            config,
            policy,
            leases: Arc::new(DashMap::new()),
            semaphore,
            cancel: CancellationToken::new(),
            pass_log: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Spawns the timing loop. The returned handle completes after
    /// [`Self::shutdown`] once in-flight jobs have drained.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.delay_input,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut jobs = JoinSet::new();

            info!(
                delay_input = scheduler.config.delay_input,
                max_concurrent = scheduler.config.max_concurrent_updates,
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick(&mut jobs).await {
                            warn!(error = %e, "Scheduler tick failed");
                        }
                        // Reap finished jobs without blocking the timer.
                        while jobs.try_join_next().is_some() {}
                    }
                }
            }

            info!("Scheduler stopping, draining workers");
            while jobs.join_next().await.is_some() {}
            info!("Scheduler stopped");
        })
    }

    /// Requests cancellation. In-flight passes stop at their next page
    /// boundary; watermarks only advance for passes that completed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// One scheduling round over the registry snapshot.
    async fn tick(self: &Arc<Self>, jobs: &mut JoinSet<()>) -> Result<()> {
        if let Some(refresher) = &self.refresher {
            if let Err(e) = refresher.refresh().await {
                warn!(error = %e, "Provider refresh failed, continuing with known directories");
            }
        }

        let now = Utc::now();
        let directories = self.registry.list_all().await?;

        for directory in &directories {
            // Health transitions are applied before dispatch so a directory
            // crossing a threshold this tick is not dispatched this tick.
            if !directory.is_ignored && directory.must_auto_ignore(&self.policy, now) {
                warn!(
                    directory_id = %directory.id,
                    failed_attempts = directory.failed_attempts,
                    "Auto-ignoring directory"
                );
                self.registry.mark_ignored(&directory.id).await?;
            }
        }

        if self.config.automatic_background_update {
            // Re-query so directories ignored this tick are not dispatched.
            let eligible = self.registry.list_eligible_for_update(now).await?;
            for directory in eligible {
                if directory.is_stale(&self.policy, now) {
                    self.spawn_update(jobs, directory);
                }
            }
        }

        if self.config.automatic_background_cleanup {
            let cleanup_eligible = self
                .registry
                .list_eligible_for_cleanup(now, &self.policy)
                .await?;
            for directory in cleanup_eligible {
                let deletion_due = matches!(directory.deleted_at, Some(at) if at <= now);
                if deletion_due && !self.config.cleanup_client_directory_after_directory_delete {
                    debug!(
                        directory_id = %directory.id,
                        "Skipping cleanup of deleted directory as per configuration"
                    );
                    continue;
                }
                // A passed deletion moment removes the record; staleness
                // cleanup retains it with counters reset.
                self.spawn_cleanup(jobs, directory.id.clone(), deletion_due);
            }
        }

        Ok(())
    }

    fn spawn_update(self: &Arc<Self>, jobs: &mut JoinSet<()>, directory: DirectoryRecord) {
        let Some(lease) = self.try_lease(&directory.id, JobKind::Update) else {
            return;
        };
        let scheduler = Arc::clone(self);

        jobs.spawn(async move {
            let _lease = lease;
            let Ok(_permit) = scheduler.semaphore.acquire().await else {
                return;
            };
            if scheduler.cancel.is_cancelled() {
                return;
            }

            let report = scheduler
                .update_pipeline
                .run(&directory, &scheduler.cancel)
                .await;
            scheduler.push_report(report);
        });
    }

    fn spawn_cleanup(self: &Arc<Self>, jobs: &mut JoinSet<()>, directory_id: String, purge: bool) {
        let Some(lease) = self.try_lease(&directory_id, JobKind::Cleanup) else {
            return;
        };
        let scheduler = Arc::clone(self);

        jobs.spawn(async move {
            let _lease = lease;
            let Ok(_permit) = scheduler.semaphore.acquire().await else {
                return;
            };
            if scheduler.cancel.is_cancelled() {
                return;
            }

            match scheduler
                .cleanup_pipeline
                .run(&directory_id, purge, &scheduler.cancel)
                .await
            {
                Ok(report) => {
                    debug!(
                        directory_id = %directory_id,
                        resources_deleted = report.resources_deleted,
                        "Cleanup job finished"
                    );
                }
                Err(McsdError::Cancelled) => {}
                Err(e) => warn!(directory_id = %directory_id, error = %e, "Cleanup job failed"),
            }
        });
    }

    /// At most one active pipeline per directory; holding the lease for the
    /// duration of the job enforces it.
    fn try_lease(&self, directory_id: &str, kind: JobKind) -> Option<LeaseGuard> {
        match self.leases.entry(directory_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(directory_id, "Directory already has an active job, skipping");
                None
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(kind);
                Some(LeaseGuard {
                    leases: Arc::clone(&self.leases),
                    directory_id: directory_id.to_string(),
                })
            }
        }
    }

    fn push_report(&self, report: PassReport) {
        let mut log = match self.pass_log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.push_back(report);
        while log.len() > self.config.max_logs_entries {
            log.pop_front();
        }
    }

    /// The retained pass reports, newest last.
    pub fn pass_reports(&self) -> Vec<PassReport> {
        match self.pass_log.lock() {
            Ok(log) => log.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Runs a single pass immediately, outside the timer. A successful
    /// manual pass lifts auto-ignore via the registry's success handling.
    pub async fn update_now(&self, directory_id: &str) -> Result<PassReport> {
        let directory = self.registry.get(directory_id).await?.ok_or_else(|| {
            McsdError::Storage(StorageError::DirectoryNotFound {
                id: directory_id.to_string(),
            })
        })?;

        let Some(_lease) = self.try_lease(directory_id, JobKind::Update) else {
            return Err(McsdError::Storage(StorageError::DatabaseError {
                message: format!("directory {directory_id} already has an active job"),
            }));
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| McsdError::Cancelled)?;
        let report = self.update_pipeline.run(&directory, &self.cancel).await;
        self.push_report(report.clone());
        Ok(report)
    }

    /// Runs a cleanup immediately. With `purge` the directory record is
    /// removed as well.
    pub async fn cleanup_now(&self, directory_id: &str, purge: bool) -> Result<CleanupReport> {
        let Some(_lease) = self.try_lease(directory_id, JobKind::Cleanup) else {
            return Err(McsdError::Storage(StorageError::DatabaseError {
                message: format!("directory {directory_id} already has an active job"),
            }));
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| McsdError::Cancelled)?;
        self.cleanup_pipeline
            .run(directory_id, purge, &self.cancel)
            .await
    }

    /// Current activity of a directory.
    pub async fn directory_state(&self, directory_id: &str) -> Result<DirectoryState> {
        if let Some(kind) = self.leases.get(directory_id).map(|entry| *entry.value()) {
            return Ok(match kind {
                JobKind::Update => DirectoryState::Running,
                JobKind::Cleanup => DirectoryState::Cleaning,
            });
        }

        let record = self.registry.get(directory_id).await?.ok_or_else(|| {
            McsdError::Storage(StorageError::DirectoryNotFound {
                id: directory_id.to_string(),
            })
        })?;

        Ok(if record.is_ignored {
            DirectoryState::Ignored
        } else {
            DirectoryState::Idle
        })
    }

    /// Default deletion delay used when an administrator schedules a
    /// directory for removal without an explicit timestamp.
    pub fn default_delete_at(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(self.config.cleanup_delay_after_delete as i64)
    }
}
