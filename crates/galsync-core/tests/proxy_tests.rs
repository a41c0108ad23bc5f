//! Integration tests for forwarding replica requests to a peer node using
//! wiremock.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use galsync_core::{
    DataPath, DomainConfig, GalDomain, GalError, GalOp, GalRequest, GalSourceConfig,
    HttpReplicaProxy, ReplicaAccount, ReplicaProxy, ReplicaSource, SourceKind,
    StaticReplicaCatalog, SyncOrchestrator,
};
use galsync_directory::memory::MemoryDirectory;

// =============================================================================
// Test Helpers
// =============================================================================

const DOMAIN: &str = "example.com";

fn proxy_for(server: &MockServer) -> HttpReplicaProxy {
    let nodes = HashMap::from([("node-b".to_string(), Url::parse(&server.uri()).unwrap())]);
    HttpReplicaProxy::new(nodes, Duration::from_secs(2))
        .unwrap()
        .with_peer_token(Some("peer-secret".into()))
}

fn remote_account() -> ReplicaAccount {
    ReplicaAccount {
        id: "acct-1".into(),
        node: "node-b".into(),
        active: true,
        sources: vec![ReplicaSource {
            kind: SourceKind::Internal,
            folder: "gal".into(),
            enabled: true,
            last_sync: Some("20240101000000Z".into()),
        }],
    }
}

fn orchestrator(server: &MockServer) -> SyncOrchestrator {
    let config = DomainConfig::new(DOMAIN)
        .with_internal(GalSourceConfig::new("ou=people,dc=example,dc=com"))
        .with_replica_account(remote_account());
    let domain =
        GalDomain::new(config).with_internal_directory(Arc::new(MemoryDirectory::new()));
    SyncOrchestrator::new("node-a", Arc::new(StaticReplicaCatalog::new()))
        .with_proxy(Arc::new(proxy_for(server)))
        .with_domain(domain)
        .unwrap()
}

// =============================================================================
// Proxy Tests
// =============================================================================

#[tokio::test]
async fn test_sync_is_forwarded_to_replica_host() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/gal/sync"))
        .and(header("authorization", "Bearer peer-secret"))
        .and(body_partial_json(json!({
            "domain": DOMAIN,
            "proxied": true,
            "replica_account": "acct-1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{"id": "acct-1:i1", "attributes": {}, "is_group": false}],
            "token": "_0_0_20240101000000Z:acct-1:7",
            "has_more": false,
            "served_by": "replica",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = orchestrator(&server)
        .sync(
            &GalRequest::new(DOMAIN)
                .with_caller("alice@example.com")
                .with_id_only(true),
        )
        .await
        .unwrap();

    assert_eq!(response.served_by, Some(DataPath::Replica));
    assert_eq!(response.entries.len(), 1);
    assert_eq!(response.entries[0].id, "acct-1:i1");
    assert_eq!(
        response.token.as_deref(),
        Some("_0_0_20240101000000Z:acct-1:7")
    );
}

#[tokio::test]
async fn test_failed_proxied_sync_returns_prior_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/gal/sync"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let response = orchestrator(&server)
        .sync(
            &GalRequest::new(DOMAIN)
                .with_caller("alice@example.com")
                .with_id_only(true)
                .with_token(":acct-1:3"),
        )
        .await
        .unwrap();

    assert!(response.entries.is_empty());
    assert!(!response.throttled);
    assert_eq!(response.token.as_deref(), Some(":acct-1:3"));
}

#[tokio::test]
async fn test_failed_proxied_search_falls_back_to_ldap() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/gal/search"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let response = orchestrator(&server)
        .search(&GalRequest::new(DOMAIN).with_query("ada"))
        .await
        .unwrap();
    assert_eq!(response.served_by, Some(DataPath::Ldap));
}

#[tokio::test]
async fn test_proxied_request_is_not_forwarded_again() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let mut request = GalRequest::new(DOMAIN)
        .with_caller("node-a")
        .with_id_only(true);
    request.proxied = true;
    let response = orchestrator(&server).sync(&request).await.unwrap();
    assert_eq!(response.served_by, Some(DataPath::Ldap));
}

#[tokio::test]
async fn test_unknown_node_is_a_proxy_error() {
    let server = MockServer::start().await;
    let proxy = proxy_for(&server);

    let err = proxy
        .forward("node-z", GalOp::Sync, &GalRequest::new(DOMAIN))
        .await
        .unwrap_err();
    assert!(matches!(err, GalError::Proxy { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unparseable_peer_response_is_a_proxy_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/gal/autocomplete"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = proxy_for(&server)
        .forward("node-b", GalOp::Autocomplete, &GalRequest::new(DOMAIN))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PROXY_ERROR");
}
