//! Cleanup-pipeline tests

use crate::common::mock_directory::MockUpdateClient;
use crate::common::{setup_test_env, test_cleanup, test_stores};
use mcsd_update_client::DirectoryOrigin;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn purge_removes_every_local_resource_map_and_the_record() {
    let temp = setup_test_env();
    let local = MockUpdateClient::start().await;
    let (registry, maps) = test_stores(temp.path()).await;
    registry
        .upsert("dir-a", "https://dir.example/fhir", DirectoryOrigin::Provider)
        .await
        .unwrap();

    let mut expected_paths = Vec::new();
    for i in 0..100 {
        let map = maps
            .allocate("dir-a", "Organization", &format!("org-{i}"))
            .await
            .unwrap();
        expected_paths.push(format!("/Organization/{}", map.update_client_resource_id));
    }

    let cleanup = test_cleanup(registry.clone(), maps.clone(), &local.base_url());
    let report = cleanup
        .run("dir-a", true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.resources_deleted, 100);
    assert_eq!(report.maps_removed, 100);
    assert!(report.directory_removed);

    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 0);
    assert!(registry.get("dir-a").await.unwrap().is_none());

    let mut deletes = local.received_paths("DELETE").await;
    deletes.sort();
    expected_paths.sort();
    assert_eq!(deletes, expected_paths);
}

#[tokio::test]
async fn policy_cleanup_retains_the_record_with_reset_counters() {
    let temp = setup_test_env();
    let local = MockUpdateClient::start().await;
    let (registry, maps) = test_stores(temp.path()).await;
    registry
        .upsert("dir-a", "https://dir.example/fhir", DirectoryOrigin::Provider)
        .await
        .unwrap();
    registry.mark_failure("dir-a", 20).await.unwrap();
    maps.allocate("dir-a", "Organization", "org-1").await.unwrap();

    let cleanup = test_cleanup(registry.clone(), maps.clone(), &local.base_url());
    let report = cleanup
        .run("dir-a", false, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.directory_removed);
    let record = registry.get("dir-a").await.unwrap().unwrap();
    assert_eq!(record.failed_attempts, 0);
    assert!(record.last_success_sync.is_none());
    assert!(record.deleted_at.is_none());
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_twice_is_idempotent() {
    let temp = setup_test_env();
    let local = MockUpdateClient::start().await;
    let (registry, maps) = test_stores(temp.path()).await;
    registry
        .upsert("dir-a", "https://dir.example/fhir", DirectoryOrigin::Provider)
        .await
        .unwrap();
    maps.allocate("dir-a", "Organization", "org-1").await.unwrap();

    let cleanup = test_cleanup(registry.clone(), maps.clone(), &local.base_url());
    let cancel = CancellationToken::new();

    let first = cleanup.run("dir-a", false, &cancel).await.unwrap();
    assert_eq!(first.resources_deleted, 1);

    let second = cleanup.run("dir-a", false, &cancel).await.unwrap();
    assert_eq!(second.resources_deleted, 0);
    assert_eq!(second.maps_removed, 0);
}

#[tokio::test]
async fn cancelled_cleanup_can_be_rerun() {
    let temp = setup_test_env();
    let local = MockUpdateClient::start().await;
    let (registry, maps) = test_stores(temp.path()).await;
    registry
        .upsert("dir-a", "https://dir.example/fhir", DirectoryOrigin::Provider)
        .await
        .unwrap();
    maps.allocate("dir-a", "Organization", "org-1").await.unwrap();

    let cleanup = test_cleanup(registry.clone(), maps.clone(), &local.base_url());

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(cleanup.run("dir-a", true, &cancelled).await.is_err());
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 1);

    let report = cleanup
        .run("dir-a", true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.maps_removed, 1);
    assert!(report.directory_removed);
}
