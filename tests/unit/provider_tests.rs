//! Provider-refresher tests

use crate::common::{setup_test_env, test_database};
use mcsd_update_client::config::ProviderConfig;
use mcsd_update_client::{
    DirectoryOrigin, DirectoryProviderRefresher, DirectoryRegistry, ProviderSource,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint_bundle(entries: &[(&str, &str)]) -> serde_json::Value {
    let entries: Vec<_> = entries
        .iter()
        .map(|(id, address)| {
            json!({
                "resource": {
                    "resourceType": "Endpoint",
                    "id": id,
                    "status": "active",
                    "address": address
                }
            })
        })
        .collect();
    json!({"resourceType": "Bundle", "type": "searchset", "entry": entries})
}

async fn refresher_for(
    server: &MockServer,
    registry: DirectoryRegistry,
    db: mcsd_update_client::db::Database,
    cleanup_delay: Option<std::time::Duration>,
) -> DirectoryProviderRefresher {
    let config = ProviderConfig {
        directories_provider_url: Some(server.uri()),
        directory_urls_path: None,
        timeout: 5,
        backoff: 1,
    };
    let source = ProviderSource::from_config(&config).unwrap().unwrap();
    DirectoryProviderRefresher::new(db, registry, source, &config, cleanup_delay).unwrap()
}

#[tokio::test]
async fn refresh_inserts_provider_sourced_directories() {
    let temp = setup_test_env();
    let db = test_database(temp.path()).await;
    let registry = DirectoryRegistry::new(db.clone());

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(endpoint_bundle(&[
            ("dir-a", "https://a.example/fhir"),
            ("dir-b", "https://b.example/fhir"),
        ])))
        .mount(&server)
        .await;

    let refresher = refresher_for(&server, registry.clone(), db, None).await;
    assert_eq!(refresher.refresh().await.unwrap(), 2);

    let dir_a = registry.get("dir-a").await.unwrap().unwrap();
    assert_eq!(dir_a.endpoint_address, "https://a.example/fhir");
    assert_eq!(dir_a.origin, DirectoryOrigin::Provider);
    assert!(registry.get("dir-b").await.unwrap().is_some());
}

#[tokio::test]
async fn vanished_directories_are_scheduled_for_cleanup() {
    let temp = setup_test_env();
    let db = test_database(temp.path()).await;
    let registry = DirectoryRegistry::new(db.clone());

    let server = MockServer::start().await;
    let both = endpoint_bundle(&[
        ("dir-a", "https://a.example/fhir"),
        ("dir-b", "https://b.example/fhir"),
    ]);
    let only_a = endpoint_bundle(&[("dir-a", "https://a.example/fhir")]);

    let first = Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(both))
        .expect(1)
        .mount_as_scoped(&server)
        .await;

    let refresher = refresher_for(
        &server,
        registry.clone(),
        db,
        Some(std::time::Duration::from_secs(3_600)),
    )
    .await;
    refresher.refresh().await.unwrap();
    drop(first);

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(only_a))
        .mount(&server)
        .await;
    refresher.refresh().await.unwrap();

    let dir_a = registry.get("dir-a").await.unwrap().unwrap();
    assert!(dir_a.deleted_at.is_none());

    let dir_b = registry.get("dir-b").await.unwrap().unwrap();
    assert!(
        dir_b.deleted_at.is_some(),
        "a vanished directory must be scheduled for cleanup"
    );
}

#[tokio::test]
async fn manual_directories_survive_provider_removal() {
    let temp = setup_test_env();
    let db = test_database(temp.path()).await;
    let registry = DirectoryRegistry::new(db.clone());

    registry
        .upsert("dir-manual", "https://manual.example/fhir", DirectoryOrigin::Manual)
        .await
        .unwrap();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(endpoint_bundle(&[])))
        .mount(&server)
        .await;

    let refresher = refresher_for(
        &server,
        registry.clone(),
        db,
        Some(std::time::Duration::from_secs(3_600)),
    )
    .await;
    refresher.refresh().await.unwrap();

    let manual = registry.get("dir-manual").await.unwrap().unwrap();
    assert!(manual.deleted_at.is_none());
    assert_eq!(manual.origin, DirectoryOrigin::Manual);
}

#[tokio::test]
async fn file_source_feeds_the_registry() {
    let temp = setup_test_env();
    let db = test_database(temp.path()).await;
    let registry = DirectoryRegistry::new(db.clone());

    let list_path = temp.path().join("directories.json");
    std::fs::write(
        &list_path,
        serde_json::to_string(&json!([
            {"id": "dir-file", "endpoint_address": "https://file.example/fhir"}
        ]))
        .unwrap(),
    )
    .unwrap();

    let config = ProviderConfig {
        directories_provider_url: None,
        directory_urls_path: Some(list_path),
        timeout: 5,
        backoff: 1,
    };
    let source = ProviderSource::from_config(&config).unwrap().unwrap();
    let refresher =
        DirectoryProviderRefresher::new(db, registry.clone(), source, &config, None).unwrap();

    assert_eq!(refresher.refresh().await.unwrap(), 1);
    let record = registry.get("dir-file").await.unwrap().unwrap();
    assert_eq!(record.endpoint_address, "https://file.example/fhir");
}

#[tokio::test]
async fn unreachable_provider_is_an_error_not_a_panic() {
    let temp = setup_test_env();
    let db = test_database(temp.path()).await;
    let registry = DirectoryRegistry::new(db.clone());

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let refresher = refresher_for(&server, registry, db, None).await;
    assert!(refresher.refresh().await.is_err());
}
