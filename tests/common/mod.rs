//! Shared test infrastructure

pub mod fixtures;

use mcsd_update_client::cache::build_cache;
use mcsd_update_client::config::{ClientConfig, McsdConfig, SchedulerConfig, StorageConfig};
use mcsd_update_client::db::Database;
use mcsd_update_client::{
    CleanupPipeline, DirectoryRegistry, ResourceMapStore, UpdateClientWriter, UpdatePipeline,
};
use std::path::Path;
use tempfile::TempDir;

/// Creates an isolated scratch directory for a test database.
pub fn setup_test_env() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

pub async fn test_database(base: &Path) -> Database {
    Database::new(StorageConfig {
        db_path: base.join("state.db"),
        connection_pool_size: 2,
    })
    .await
    .expect("Failed to initialize test database")
}

pub async fn test_stores(base: &Path) -> (DirectoryRegistry, ResourceMapStore) {
    let db = test_database(base).await;
    (DirectoryRegistry::new(db.clone()), ResourceMapStore::new(db))
}

/// A fast client configuration pointed at a mock update-client server.
pub fn test_client_config(update_client_url: &str) -> ClientConfig {
    let mut config = McsdConfig::test_config(Path::new("/tmp")).client;
    config.update_client_url = update_client_url.to_string();
    config
}

/// Builds a full update pipeline against mock servers.
pub async fn test_pipeline(
    base: &Path,
    update_client_url: &str,
) -> (DirectoryRegistry, ResourceMapStore, UpdatePipeline) {
    test_pipeline_with(base, test_client_config(update_client_url)).await
}

/// Like [`test_pipeline`] but with a caller-tuned client configuration.
pub async fn test_pipeline_with(
    base: &Path,
    client_config: ClientConfig,
) -> (DirectoryRegistry, ResourceMapStore, UpdatePipeline) {
    let (registry, maps) = test_stores(base).await;
    let writer = UpdateClientWriter::new(&client_config).expect("writer");
    let cache = build_cache(&Default::default());

    let pipeline = UpdatePipeline::new(
        registry.clone(),
        maps.clone(),
        writer,
        cache,
        client_config,
        &SchedulerConfig::default(),
    );

    (registry, maps, pipeline)
}

/// Builds a cleanup pipeline sharing stores with the caller.
pub fn test_cleanup(
    registry: DirectoryRegistry,
    maps: ResourceMapStore,
    update_client_url: &str,
) -> CleanupPipeline {
    let client_config = test_client_config(update_client_url);
    let writer = UpdateClientWriter::new(&client_config).expect("writer");
    CleanupPipeline::new(registry, maps, writer)
}
