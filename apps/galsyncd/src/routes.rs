//! HTTP routes for GAL search, autocomplete and sync.
//!
//! - POST /v1/gal/search
//! - POST /v1/gal/autocomplete
//! - POST /v1/gal/sync
//! - GET  /health

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use galsync_core::{GalError, GalRequest, GalResponse, SyncOrchestrator};

/// Shared state for GAL routes.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Required from peers on proxied requests when set.
    pub peer_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, peer_token: Option<String>) -> Self {
        Self {
            orchestrator,
            peer_token: peer_token.map(Into::into),
        }
    }

    fn authorize(&self, headers: &HeaderMap, request: &GalRequest) -> Result<(), ApiError> {
        let Some(expected) = &self.peer_token else {
            return Ok(());
        };
        if !request.proxied {
            return Ok(());
        }
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(expected.as_ref()) {
            Ok(())
        } else {
            tracing::warn!(domain = %request.domain, "proxied request with a bad peer token");
            Err(ApiError::Unauthorized)
        }
    }
}

pub fn gal_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/gal/search", post(search))
        .route("/v1/gal/autocomplete", post(autocomplete))
        .route("/v1/gal/sync", post(sync))
        .route("/health", get(health))
        .with_state(state)
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GalRequest>,
) -> Result<Json<GalResponse>, ApiError> {
    state.authorize(&headers, &request)?;
    Ok(Json(state.orchestrator.search(&request).await?))
}

async fn autocomplete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GalRequest>,
) -> Result<Json<GalResponse>, ApiError> {
    state.authorize(&headers, &request)?;
    Ok(Json(state.orchestrator.autocomplete(&request).await?))
}

async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GalRequest>,
) -> Result<Json<GalResponse>, ApiError> {
    state.authorize(&headers, &request)?;
    Ok(Json(state.orchestrator.sync(&request).await?))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "node": state.orchestrator.node_name(),
    }))
}

/// Errors returned by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gal(#[from] GalError),

    #[error("peer authentication required")]
    Unauthorized,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Gal(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Gal(GalError::InvalidToken { .. } | GalError::UnknownDomain { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Gal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Gal(e) => e.error_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "GAL request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use galsync_core::{DomainConfig, GalDomain, GalSourceConfig, StaticReplicaCatalog};
    use galsync_directory::entry::{AttributeSet, DirectoryEntry};
    use galsync_directory::memory::MemoryDirectory;
    use tower::ServiceExt;

    fn test_app(directory: MemoryDirectory, peer_token: Option<&str>) -> Router {
        let config = DomainConfig::new("example.com")
            .with_internal(GalSourceConfig::new("ou=people,dc=example,dc=com"));
        let domain = GalDomain::new(config).with_internal_directory(Arc::new(directory));
        let orchestrator = SyncOrchestrator::new("node-a", Arc::new(StaticReplicaCatalog::new()))
            .with_domain(domain)
            .unwrap();
        gal_router(AppState::new(
            Arc::new(orchestrator),
            peer_token.map(str::to_string),
        ))
    }

    fn directory_with_ada() -> MemoryDirectory {
        let directory = MemoryDirectory::new();
        directory.insert(DirectoryEntry::new(
            "uid=ada,ou=people,dc=example,dc=com",
            AttributeSet::new()
                .with("objectClass", "inetOrgPerson")
                .with("cn", "Ada Lovelace")
                .with("createTimestamp", "20240101000000Z")
                .with("modifyTimestamp", "20240101000000Z"),
        ));
        directory
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app(MemoryDirectory::new(), None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["node"], "node-a");
    }

    #[tokio::test]
    async fn test_sync_returns_entries_and_token() {
        let response = test_app(directory_with_ada(), None)
            .oneshot(post_json(
                "/v1/gal/sync",
                json!({"domain": "example.com", "caller": "alice"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
        assert_eq!(body["token"], "20240101000000Z_0_0_20240101000000Z");
        assert_eq!(body["served_by"], "ldap");
    }

    #[tokio::test]
    async fn test_search_by_name() {
        let response = test_app(directory_with_ada(), None)
            .oneshot(post_json(
                "/v1/gal/search",
                json!({"domain": "example.com", "query": "lovelace", "wildcard": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(
            body["entries"][0]["id"],
            "uid=ada,ou=people,dc=example,dc=com"
        );
    }

    #[tokio::test]
    async fn test_invalid_token_is_bad_request() {
        let response = test_app(MemoryDirectory::new(), None)
            .oneshot(post_json(
                "/v1/gal/sync",
                json!({"domain": "example.com", "token": "a_b_c"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn test_unknown_domain_is_bad_request() {
        let response = test_app(MemoryDirectory::new(), None)
            .oneshot(post_json("/v1/gal/search", json!({"domain": "other.org"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], "UNKNOWN_DOMAIN");
    }

    #[tokio::test]
    async fn test_directory_down_is_service_unavailable() {
        let directory = directory_with_ada();
        directory.fail_next_with_server_down(3);
        let response = test_app(directory, None)
            .oneshot(post_json("/v1/gal/sync", json!({"domain": "example.com"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(read_json(response).await["code"], "DIRECTORY_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_proxied_request_requires_peer_token() {
        let app = test_app(directory_with_ada(), Some("peer-secret"));
        let request = json!({"domain": "example.com", "proxied": true});

        let rejected = app
            .clone()
            .oneshot(post_json("/v1/gal/sync", request.clone()))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let mut accepted = post_json("/v1/gal/sync", request);
        accepted.headers_mut().insert(
            header::AUTHORIZATION,
            "Bearer peer-secret".parse().unwrap(),
        );
        let accepted = app.oneshot(accepted).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }
}
