use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use galsync_core::DomainConfig;
use galsync_ldap::LdapConfig;

/// Process configuration for the GAL sync service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Listen address for the HTTP server.
    pub listen_addr: SocketAddr,

    /// Name of this node; replica accounts hosted here are read locally.
    pub node_name: String,

    /// TOML file describing domains and peer nodes.
    pub domains_file: PathBuf,

    /// Bearer token exchanged between nodes for proxied requests.
    pub peer_token: Option<String>,

    /// Timeout for requests forwarded to peers.
    pub proxy_timeout: Duration,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let listen_addr = reader("GALSYNC_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8089".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("GALSYNC_LISTEN_ADDR".into(), e.to_string()))?;

        let node_name = reader("GALSYNC_NODE_NAME")
            .map_err(|_| ConfigError::MissingVar("GALSYNC_NODE_NAME".into()))?;
        if node_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "GALSYNC_NODE_NAME".into(),
                "must not be empty".into(),
            ));
        }

        let domains_file = reader("GALSYNC_DOMAINS_FILE")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingVar("GALSYNC_DOMAINS_FILE".into()))?;

        let peer_token = reader("GALSYNC_PEER_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        let proxy_timeout_secs = reader("GALSYNC_PROXY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidValue("GALSYNC_PROXY_TIMEOUT_SECS".into(), e.to_string())
            })?;

        Ok(Self {
            listen_addr,
            node_name,
            domains_file,
            peer_token,
            proxy_timeout: Duration::from_secs(proxy_timeout_secs),
        })
    }
}

/// Domains and peers served by this node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainsFile {
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainEntry>,

    /// Peer node name to base URL.
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

/// One domain with the directories backing its sources.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainEntry {
    #[serde(flatten)]
    pub config: DomainConfig,

    #[serde(default)]
    pub internal_ldap: Option<LdapConfig>,

    #[serde(default)]
    pub external_ldap: Option<LdapConfig>,
}

impl DomainsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Peer base URLs, parsed.
    pub fn peer_urls(&self) -> Result<HashMap<String, Url>, ConfigError> {
        self.peers
            .iter()
            .map(|(node, raw)| {
                Url::parse(raw)
                    .map(|url| (node.clone(), url))
                    .map_err(|e| ConfigError::InvalidValue(format!("peers.{node}"), e.to_string()))
            })
            .collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("failed to load domains file: {0}")]
    Load(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use galsync_core::GalMode;
    use std::env::VarError;

    /// Create a reader closure from a HashMap (no global env mutation).
    fn make_reader(vars: HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> {
        let owned: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| owned.get(key).cloned().ok_or(VarError::NotPresent)
    }

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GALSYNC_NODE_NAME", "node-a"),
            ("GALSYNC_DOMAINS_FILE", "/etc/galsync/domains.toml"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_reader(make_reader(required())).unwrap();
        assert_eq!(config.listen_addr.port(), 8089);
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.proxy_timeout, Duration::from_secs(10));
        assert!(config.peer_token.is_none());
    }

    #[test]
    fn test_missing_node_name() {
        let mut vars = required();
        vars.remove("GALSYNC_NODE_NAME");
        let err = ServiceConfig::from_reader(make_reader(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "GALSYNC_NODE_NAME"));
    }

    #[test]
    fn test_invalid_listen_addr() {
        let mut vars = required();
        vars.insert("GALSYNC_LISTEN_ADDR", "not-an-addr");
        let err = ServiceConfig::from_reader(make_reader(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref v, _) if v == "GALSYNC_LISTEN_ADDR"));
    }

    #[test]
    fn test_empty_peer_token_is_none() {
        let mut vars = required();
        vars.insert("GALSYNC_PEER_TOKEN", "");
        let config = ServiceConfig::from_reader(make_reader(vars)).unwrap();
        assert!(config.peer_token.is_none());
    }

    #[test]
    fn test_parse_domains_file() {
        let file = DomainsFile::parse(
            r#"
            [peers]
            node-b = "http://node-b.internal:8089/"

            [[domain]]
            name = "example.com"
            gal_mode = "both"
            max_concurrent_sync_clients = 4

            [domain.internal]
            base_dn = "ou=people,dc=example,dc=com"

            [domain.external]
            base_dn = "ou=partners,dc=example,dc=com"

            [domain.internal_ldap]
            urls = ["ldap://ldap1.example.com:389", "ldap://ldap2.example.com:389"]
            bind_dn = "cn=gal,dc=example,dc=com"
            bind_password = "secret"

            [domain.external_ldap]
            urls = ["ldaps://partners.example.com:636"]
            "#,
        )
        .unwrap();

        assert_eq!(file.domains.len(), 1);
        let domain = &file.domains[0];
        assert_eq!(domain.config.name, "example.com");
        assert_eq!(domain.config.gal_mode, GalMode::Both);
        assert_eq!(domain.config.max_concurrent_sync_clients, 4);
        assert_eq!(domain.internal_ldap.as_ref().unwrap().urls.len(), 2);
        assert!(domain.external_ldap.is_some());
        assert_eq!(
            file.peer_urls().unwrap()["node-b"].as_str(),
            "http://node-b.internal:8089/"
        );
    }

    #[test]
    fn test_invalid_peer_url() {
        let file = DomainsFile::parse("[peers]\nnode-b = \"not a url\"\n").unwrap();
        assert!(matches!(file.peer_urls(), Err(ConfigError::InvalidValue(..))));
    }
}
