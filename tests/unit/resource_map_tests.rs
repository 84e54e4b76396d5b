//! Unit tests for the resource-map store

use crate::common::{setup_test_env, test_stores};
use chrono::Utc;

#[tokio::test]
async fn allocation_is_idempotent() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let first = maps.allocate("dir-a", "Organization", "1").await.unwrap();
    let second = maps.allocate("dir-a", "Organization", "1").await.unwrap();

    assert_eq!(
        first.update_client_resource_id,
        second.update_client_resource_id
    );
    assert_eq!(first.id, second.id);
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 1);
}

#[tokio::test]
async fn same_remote_id_in_two_directories_never_collides() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let a = maps.allocate("dir-a", "Organization", "1").await.unwrap();
    let b = maps.allocate("dir-b", "Organization", "1").await.unwrap();

    assert_ne!(a.update_client_resource_id, b.update_client_resource_id);
    assert!(a.update_client_resource_id.starts_with("dir-a-"));
    assert!(b.update_client_resource_id.starts_with("dir-b-"));
}

#[tokio::test]
async fn same_id_across_types_gets_distinct_mappings() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let org = maps.allocate("dir-a", "Organization", "1").await.unwrap();
    let loc = maps.allocate("dir-a", "Location", "1").await.unwrap();
    assert_ne!(org.update_client_resource_id, loc.update_client_resource_id);
}

#[tokio::test]
async fn version_counters_never_regress() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let map = maps.allocate("dir-a", "Organization", "1").await.unwrap();
    maps.record_versions(&map, 5, 2, Utc::now()).await.unwrap();

    // A replayed older update must not move versions backwards.
    maps.record_versions(&map, 3, 1, Utc::now()).await.unwrap();

    let current = maps
        .lookup("dir-a", "Organization", "1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.directory_resource_version, 5);
    assert_eq!(current.update_client_resource_version, 2);
    assert!(current.last_update.is_some());
}

#[tokio::test]
async fn delete_removes_only_the_target_row() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let doomed = maps.allocate("dir-a", "Organization", "1").await.unwrap();
    maps.allocate("dir-a", "Organization", "2").await.unwrap();

    maps.delete(&doomed).await.unwrap();

    assert!(maps
        .lookup("dir-a", "Organization", "1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 1);

    // Deleting again is a no-op.
    maps.delete(&doomed).await.unwrap();
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 1);
}

#[tokio::test]
async fn listing_is_deterministic() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    maps.allocate("dir-a", "PractitionerRole", "z").await.unwrap();
    maps.allocate("dir-a", "Organization", "b").await.unwrap();
    maps.allocate("dir-a", "Organization", "a").await.unwrap();
    maps.allocate("dir-b", "Organization", "a").await.unwrap();

    let listed = maps.list_for_directory("dir-a").await.unwrap();
    let keys: Vec<(String, String)> = listed
        .iter()
        .map(|m| (m.resource_type.clone(), m.directory_resource_id.clone()))
        .collect();

    assert_eq!(
        keys,
        vec![
            ("Organization".to_string(), "a".to_string()),
            ("Organization".to_string(), "b".to_string()),
            ("PractitionerRole".to_string(), "z".to_string()),
        ]
    );
}

#[tokio::test]
async fn concurrent_allocations_converge_on_one_row() {
    let temp = setup_test_env();
    let (_, maps) = test_stores(temp.path()).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let maps = maps.clone();
        handles.push(tokio::spawn(async move {
            maps.allocate("dir-a", "Endpoint", "ep1").await.unwrap()
        }));
    }

    let mut local_ids = Vec::new();
    for handle in handles {
        local_ids.push(handle.await.unwrap().update_client_resource_id);
    }

    local_ids.dedup();
    assert_eq!(local_ids.len(), 1, "all allocations must agree on one id");
    assert_eq!(maps.count_for_directory("dir-a").await.unwrap(), 1);
}
