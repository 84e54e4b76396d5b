//! # mCSD Update Client
//!
//! A long-running synchronization engine implementing the IHE ITI-91
//! "Request Care Services Update" interaction: it polls remote mCSD FHIR
//! directories for changes, rewrites cross-directory identifiers and
//! references into a single local addressing namespace, and mirrors the
//! transformed resources into a local FHIR server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcsd_update_client::{McsdConfig, McsdUpdateClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = McsdConfig::load()?;
//!     let client = McsdUpdateClient::new(config).await?;
//!
//!     // Register a directory by hand (providers can also feed the registry).
//!     client.register_directory("dir-a", "https://dir.example/fhir").await?;
//!
//!     // Run the background scheduler until shutdown.
//!     let handle = client.start();
//!     client.shutdown();
//!     handle.await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod directory_registry;
pub mod error;
pub mod fhir;
pub mod fhir_client;
pub mod local_writer;
pub mod provider;
pub mod resource_map;
pub mod rewriter;
pub mod scheduler;
pub mod update_pipeline;

// Re-export main types
pub use cache::{InMemoryMetadataCache, MetadataCache};
pub use cleanup::{CleanupPipeline, CleanupReport};
pub use config::{CacheConfig, ClientConfig, McsdConfig, ProviderConfig, SchedulerConfig};
pub use directory_registry::{DirectoryOrigin, DirectoryRecord, DirectoryRegistry, UpdatePolicy};
pub use error::{McsdError, Result};
pub use fhir::McsdResourceType;
pub use fhir_client::DirectoryClient;
pub use local_writer::UpdateClientWriter;
pub use provider::{DirectoryProviderRefresher, ProviderSource};
pub use resource_map::{ResourceMapRecord, ResourceMapStore};
pub use scheduler::{DirectoryState, Scheduler};
pub use update_pipeline::{PassCounters, PassOutcome, PassReport, UpdatePipeline};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Main mCSD update client.
///
/// Wires the stores, pipelines and scheduler together at construction time
/// (dependency order: database → cache → HTTP clients → registry →
/// scheduler) and exposes the administrative operations the surrounding
/// service needs.
pub struct McsdUpdateClient {
    registry: DirectoryRegistry,
    maps: ResourceMapStore,
    scheduler: Arc<Scheduler>,
}

impl McsdUpdateClient {
    /// Builds the full component graph from a validated configuration.
    pub async fn new(config: McsdConfig) -> Result<Self> {
        config.validate()?;
        info!("Initializing mCSD update client");

        let database = db::Database::new(config.storage.clone()).await?;
        let cache = cache::build_cache(&config.cache);
        let writer = UpdateClientWriter::new(&config.client)?;

        let registry = DirectoryRegistry::new(database.clone());
        let maps = ResourceMapStore::new(database.clone());

        let update_pipeline = Arc::new(UpdatePipeline::new(
            registry.clone(),
            maps.clone(),
            writer.clone(),
            Arc::clone(&cache),
            config.client.clone(),
            &config.scheduler,
        ));
        let cleanup_pipeline = Arc::new(CleanupPipeline::new(
            registry.clone(),
            maps.clone(),
            writer.clone(),
        ));

        let refresher = match ProviderSource::from_config(&config.provider)? {
            Some(source) => {
                let cleanup_delay = config
                    .scheduler
                    .cleanup_client_directory_after_directory_delete
                    .then(|| {
                        std::time::Duration::from_secs(config.scheduler.cleanup_delay_after_delete)
                    });
                Some(Arc::new(DirectoryProviderRefresher::new(
                    database.clone(),
                    registry.clone(),
                    source,
                    &config.provider,
                    cleanup_delay,
                )?))
            }
            None => None,
        };

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            update_pipeline,
            cleanup_pipeline,
            refresher,
            config.scheduler.clone(),
        ));

        info!("mCSD update client initialized");

        Ok(Self {
            registry,
            maps,
            scheduler,
        })
    }

    /// Starts the background scheduling loop. The handle completes after
    /// [`Self::shutdown`] once workers have drained.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.scheduler.start()
    }

    /// Cancels the scheduler and all in-flight passes cooperatively.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Registers (or re-points) a directory by hand. Manual registrations
    /// are never removed by provider refreshes.
    pub async fn register_directory(
        &self,
        id: &str,
        endpoint_address: &str,
    ) -> Result<DirectoryRecord> {
        self.registry
            .upsert(id, endpoint_address, DirectoryOrigin::Manual)
            .await
    }

    /// Runs one update pass against a directory right now.
    pub async fn update_directory(&self, id: &str) -> Result<PassReport> {
        self.scheduler.update_now(id).await
    }

    /// Lifts the ignore flag so the scheduler dispatches the directory
    /// again.
    pub async fn unignore_directory(&self, id: &str) -> Result<()> {
        self.registry.unignore(id).await
    }

    /// Schedules the directory's local data for removal; `at = None` uses
    /// the configured delay.
    pub async fn schedule_directory_delete(
        &self,
        id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let at = at.unwrap_or_else(|| self.scheduler.default_delete_at());
        self.registry.schedule_delete(id, at).await
    }

    /// Removes every local resource and mapping for the directory, then the
    /// directory record itself.
    pub async fn purge_directory(&self, id: &str) -> Result<CleanupReport> {
        self.scheduler.cleanup_now(id, true).await
    }

    /// Cancels a scheduled deletion and resets health counters, keeping
    /// existing mappings.
    pub async fn restore_directory(&self, id: &str) -> Result<()> {
        self.registry.restore(id).await
    }

    pub async fn directory(&self, id: &str) -> Result<Option<DirectoryRecord>> {
        self.registry.get(id).await
    }

    pub async fn directories(&self) -> Result<Vec<DirectoryRecord>> {
        self.registry.list_all().await
    }

    pub async fn directory_state(&self, id: &str) -> Result<DirectoryState> {
        self.scheduler.directory_state(id).await
    }

    /// Mappings currently held for a directory.
    pub async fn resource_maps(&self, directory_id: &str) -> Result<Vec<ResourceMapRecord>> {
        self.maps.list_for_directory(directory_id).await
    }

    /// The retained pass reports, newest last.
    pub fn pass_reports(&self) -> Vec<PassReport> {
        self.scheduler.pass_reports()
    }
}
