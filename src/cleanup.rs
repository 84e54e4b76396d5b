//! Cleanup pipeline
//!
//! Removes every locally stored resource that originated from a directory,
//! then the mappings, and finally either the directory record (explicit
//! purge) or just its counters (policy-driven cleanup).

use crate::directory_registry::DirectoryRegistry;
use crate::error::{McsdError, Result};
use crate::local_writer::UpdateClientWriter;
use crate::resource_map::ResourceMapStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of a cleanup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub resources_deleted: u64,
    pub maps_removed: u64,
    pub directory_removed: bool,
}

/// The per-directory cleanup job.
pub struct CleanupPipeline {
    registry: DirectoryRegistry,
    maps: ResourceMapStore,
    writer: UpdateClientWriter,
}

impl CleanupPipeline {
    pub fn new(
        registry: DirectoryRegistry,
        maps: ResourceMapStore,
        writer: UpdateClientWriter,
    ) -> Self {
        Self {
            registry,
            maps,
            writer,
        }
    }

    /// Deletes all local resources and map rows for the directory. With
    /// `purge` the directory record itself is removed; otherwise it is
    /// retained with counters reset so a future provider refresh can start
    /// it fresh.
    ///
    /// Deletes are idempotent, so a cancelled or crashed cleanup can simply
    /// be re-run.
    #[tracing::instrument(name = "cleanup.run", skip_all, fields(directory_id = %directory_id, purge))]
    pub async fn run(
        &self,
        directory_id: &str,
        purge: bool,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport> {
        let maps = self.maps.list_for_directory(directory_id).await?;
        let mut resources_deleted = 0;
        let mut maps_removed = 0;

        for map in &maps {
            if cancel.is_cancelled() {
                return Err(McsdError::Cancelled);
            }

            self.writer
                .delete(&map.resource_type, &map.update_client_resource_id)
                .await?;
            resources_deleted += 1;

            // The mapping only disappears once the local delete succeeded.
            self.maps.delete(map).await?;
            maps_removed += 1;
        }

        let directory_removed = if purge {
            self.registry.purge(directory_id).await?
        } else {
            self.registry.reset_counters(directory_id).await?;
            false
        };

        info!(
            resources_deleted,
            maps_removed, directory_removed, "Cleanup finished"
        );

        Ok(CleanupReport {
            resources_deleted,
            maps_removed,
            directory_removed,
        })
    }
}
