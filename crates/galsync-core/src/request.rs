//! GAL requests and responses

use serde::{Deserialize, Serialize};
use std::fmt;

use galsync_directory::entry::DirectoryEntry;

/// Operation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalOp {
    Search,
    Autocomplete,
    Sync,
}

impl GalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            GalOp::Search => "search",
            GalOp::Autocomplete => "autocomplete",
            GalOp::Sync => "sync",
        }
    }
}

impl fmt::Display for GalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result-type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalSearchType {
    #[default]
    All,
    Account,
    Resource,
    Group,
}

/// Which data path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPath {
    Replica,
    Ldap,
    Proxy,
}

/// One search, autocomplete or sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalRequest {
    pub domain: String,

    /// Authenticated caller, used in the sync session id.
    #[serde(default)]
    pub caller: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default)]
    pub search_type: GalSearchType,

    /// Maximum entries to return; 0 uses the domain default.
    #[serde(default)]
    pub limit: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,

    /// Prior sync token, passed back verbatim when throttled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Return entry ids only.
    #[serde(default)]
    pub id_only: bool,

    /// Search `query` as a substring.
    #[serde(default)]
    pub wildcard: bool,

    /// Compute the remaining count on the replica path.
    #[serde(default)]
    pub want_remaining: bool,

    /// Set by the node that forwarded this request.
    #[serde(default)]
    pub proxied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_account: Option<String>,
}

impl GalRequest {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_search_type(mut self, search_type: GalSearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_id_only(mut self, id_only: bool) -> Self {
        self.id_only = id_only;
        self
    }

    pub fn with_wildcard(mut self, wildcard: bool) -> Self {
        self.wildcard = wildcard;
        self
    }
}

/// Result of a GAL call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalResponse {
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,

    /// Ids deleted since the prior token.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub has_more: bool,

    #[serde(default)]
    pub throttled: bool,

    #[serde(default)]
    pub full_sync_recommended: bool,

    /// When the domain's GAL definition last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_last_modified: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<DataPath>,
}

impl GalResponse {
    /// A sync answer that hands the caller's token back unchanged.
    pub fn unchanged(token: Option<String>) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn throttled(token: Option<String>) -> Self {
        Self {
            throttled: true,
            ..Self::unchanged(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_minimal_json() {
        let request: GalRequest = serde_json::from_str(r#"{"domain": "example.com"}"#).unwrap();
        assert_eq!(request.domain, "example.com");
        assert_eq!(request.search_type, GalSearchType::All);
        assert_eq!(request.limit, 0);
        assert!(request.token.is_none());
        assert!(!request.proxied);
    }

    #[test]
    fn test_search_type_names() {
        let parsed: GalSearchType = serde_json::from_str("\"resource\"").unwrap();
        assert_eq!(parsed, GalSearchType::Resource);
        assert_eq!(GalOp::Autocomplete.to_string(), "autocomplete");
    }

    #[test]
    fn test_throttled_response_keeps_token() {
        let response = GalResponse::throttled(Some("_0_1_:r:3".into()));
        assert!(response.throttled);
        assert_eq!(response.token.as_deref(), Some("_0_1_:r:3"));
        assert!(response.entries.is_empty());
    }
}
