//! Integration tests for transport-level error handling

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use lockstep_core::ports::{ApiError, ISyncServerApi};
use lockstep_remote::{HttpSyncServer, SyncServerClient};

use crate::common;

#[tokio::test]
async fn test_server_error_is_transient() {
    let (server, api) = common::setup_server_mock().await;
    Mock::given(method("POST"))
        .and(path("/Lock"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = api.lock().await.unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
}

#[tokio::test]
async fn test_client_error_is_usage_error() {
    let (server, api) = common::setup_server_mock().await;
    Mock::given(method("POST"))
        .and(path("/Lock"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    assert!(matches!(api.lock().await, Err(ApiError::UsageError(_))));
}

#[tokio::test]
async fn test_usage_and_network_result_codes() {
    let (server, api) = common::setup_server_mock().await;
    common::mount_result(&server, "Unlock", 4, "bad parameters").await;
    common::mount_result(&server, "Cleanup", 5, "cloud storage unreachable").await;

    assert_eq!(
        api.unlock().await.unwrap_err(),
        ApiError::UsageError("bad parameters".into())
    );
    assert!(api.cleanup().await.unwrap_err().is_network());
}

#[tokio::test]
async fn test_connection_refused_is_network_unavailable() {
    // Port 1 is reserved and never listening
    let api = HttpSyncServer::new(SyncServerClient::with_base_url("http://127.0.0.1:1", "d").unwrap());

    assert!(api.lock().await.unwrap_err().is_network());
}

#[tokio::test]
async fn test_429_is_retried() {
    let (server, api) = common::setup_server_mock().await;

    Mock::given(method("POST"))
        .and(path("/Lock"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/Lock"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ServerResult": 0 })))
        .mount(&server)
        .await;

    api.lock().await.expect("succeeds after one retry");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_429_gives_up_after_max_retries() {
    let (server, api) = common::setup_server_mock().await;

    Mock::given(method("POST"))
        .and(path("/Lock"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let err = api.lock().await.unwrap_err();
    assert!(err.is_transient());
    // One initial attempt plus two retries
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
