//! LDAP configuration
//!
//! Endpoints, bind credentials, TLS mode, pool settings and page size for one
//! directory source.

use serde::{Deserialize, Serialize};

use galsync_directory::config::ConnectionSettings;
use galsync_directory::error::{DirectoryError, DirectoryResult};

use crate::server_set::Endpoint;

/// Configuration for one LDAP directory.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Endpoint URLs (`ldap://`, `ldaps://` or a sole `ldapi://`).
    pub urls: Vec<String>,

    /// Bind DN; anonymous when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_dn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Upgrade plain connections with STARTTLS.
    #[serde(default)]
    pub starttls: bool,

    /// Verify server certificates.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,

    /// Timeouts and pool bounds.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Page size for paged searches.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("urls", &self.urls)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("starttls", &self.starttls)
            .field("verify_tls", &self.verify_tls)
            .field("connection", &self.connection)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn default_verify_tls() -> bool {
    true
}

fn default_page_size() -> u32 {
    1000
}

impl LdapConfig {
    /// Create a config for the given endpoint URLs.
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            bind_dn: None,
            bind_password: None,
            starttls: false,
            verify_tls: default_verify_tls(),
            connection: ConnectionSettings::default(),
            page_size: default_page_size(),
        }
    }

    /// Set bind credentials.
    pub fn with_bind(mut self, dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = Some(dn.into());
        self.bind_password = Some(password.into());
        self
    }

    pub fn with_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Parse every configured URL.
    pub fn endpoints(&self) -> DirectoryResult<Vec<Endpoint>> {
        self.urls.iter().map(|u| Endpoint::parse(u)).collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.urls.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "at least one LDAP url is required",
            ));
        }
        let endpoints = self.endpoints()?;
        if endpoints.len() > 1 && endpoints.iter().any(Endpoint::is_local_socket) {
            return Err(DirectoryError::invalid_configuration(
                "an ldapi url must be the only configured url",
            ));
        }
        if self.page_size == 0 {
            return Err(DirectoryError::invalid_configuration(
                "page_size must be greater than zero",
            ));
        }
        if self.bind_dn.is_some() && self.bind_password.is_none() {
            return Err(DirectoryError::invalid_configuration(
                "bind_password is required when bind_dn is set",
            ));
        }
        self.connection.validate()
    }
}
