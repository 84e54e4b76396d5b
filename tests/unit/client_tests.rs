//! Directory-client transport tests

use crate::common::fixtures::{capability_all, history_bundle, organization, upsert_entry};
use mcsd_update_client::config::ClientConfig;
use mcsd_update_client::fhir::McsdResourceType;
use mcsd_update_client::{DirectoryClient, McsdError};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> ClientConfig {
    ClientConfig {
        update_client_url: "http://localhost:8080/fhir".to_string(),
        request_count: 50,
        strict_validation: false,
        timeout: 5,
        retry_attempts: 3,
        backoff_ms: 1,
    }
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(capability_all()))
        .with_priority(2)
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    let capability = client.capability().await.unwrap();
    assert_eq!(capability["resourceType"], json!("CapabilityStatement"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn auth_rejection_is_final() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    let err = client.capability().await.unwrap_err();
    assert!(matches!(
        err,
        McsdError::Directory(mcsd_update_client::error::DirectoryError::AuthRejected { .. })
    ));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    assert!(client.capability().await.is_err());
}

#[tokio::test]
async fn read_maps_absence_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Organization/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    let resource = client
        .read(McsdResourceType::Organization, "gone")
        .await
        .unwrap();
    assert!(resource.is_none());
}

#[tokio::test]
async fn history_requests_carry_count_and_since() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Organization/_history"))
        .and(query_param("_count", "50"))
        .and(query_param("_since", "2025-06-01T00:00:00.000Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_bundle(
            vec![upsert_entry(organization("org-1", "2025-06-01T12:00:00Z", None))],
            None,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    let since = chrono::DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let page = client
        .history(McsdResourceType::Organization, Some(since))
        .await
        .unwrap();

    assert_eq!(page.entries.len(), 1);
    assert!(page.next.is_none());
    assert!(page.bytes > 0);
}

#[tokio::test]
async fn unparseable_page_is_an_invalid_bundle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Organization/_history"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = DirectoryClient::new(&server.uri(), &fast_config()).unwrap();
    let err = client
        .history(McsdResourceType::Organization, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        McsdError::Fhir(mcsd_update_client::error::FhirError::InvalidBundle { .. })
    ));
}
