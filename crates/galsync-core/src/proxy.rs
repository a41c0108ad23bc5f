//! Cross-node replica proxy
//!
//! Forwards a request to the node hosting a replica mailbox and returns the
//! peer's response unmodified.

use async_trait::async_trait;
use reqwest::{header, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{GalError, GalResult};
use crate::request::{GalOp, GalRequest, GalResponse};

/// Sends a request to another node.
#[async_trait]
pub trait ReplicaProxy: Send + Sync {
    async fn forward(&self, node: &str, op: GalOp, request: &GalRequest) -> GalResult<GalResponse>;
}

/// [`ReplicaProxy`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpReplicaProxy {
    client: Client,
    nodes: HashMap<String, Url>,
    peer_token: Option<String>,
}

impl HttpReplicaProxy {
    /// Create a proxy for the given node base URLs.
    pub fn new(nodes: HashMap<String, Url>, timeout: Duration) -> GalResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| GalError::configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            nodes,
            peer_token: None,
        })
    }

    /// Bearer token presented to peers.
    pub fn with_peer_token(mut self, token: Option<String>) -> Self {
        self.peer_token = token;
        self
    }

    fn endpoint(&self, node: &str, op: GalOp) -> GalResult<Url> {
        let base = self
            .nodes
            .get(node)
            .ok_or_else(|| GalError::proxy(format!("no address configured for node {node}")))?;
        base.join(&format!("v1/gal/{op}")).map_err(|e| {
            GalError::configuration(format!("invalid address for node {node}: {e}"))
        })
    }
}

#[async_trait]
impl ReplicaProxy for HttpReplicaProxy {
    #[instrument(skip(self, request), fields(domain = %request.domain))]
    async fn forward(&self, node: &str, op: GalOp, request: &GalRequest) -> GalResult<GalResponse> {
        let url = self.endpoint(node, op)?;
        let mut forwarded = request.clone();
        forwarded.proxied = true;

        debug!(url = %url, "Forwarding GAL request to peer");

        let mut builder = self
            .client
            .post(url.clone())
            .header(header::ACCEPT, "application/json")
            .json(&forwarded);
        if let Some(token) = &self.peer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            GalError::proxy_with_source(format!("Failed to reach node {node}"), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "peer rejected proxied GAL request");
            return Err(GalError::proxy(format!(
                "node {node} answered {op} with status {status}"
            )));
        }

        response.json::<GalResponse>().await.map_err(|e| {
            GalError::proxy_with_source(format!("Failed to parse response from node {node}"), e)
        })
    }
}
