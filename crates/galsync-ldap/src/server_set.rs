//! Server set
//!
//! Turns configured endpoint URLs into the set of servers a pool connects to:
//! a single server when one URL resolves to one address, round-robin with
//! failover across every resolved address otherwise, or a local socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use url::Url;

use galsync_directory::error::{DirectoryError, DirectoryResult};

const DEFAULT_LDAPI_PATH: &str = "/var/run/ldapi";

/// Wire transport of a network endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// `ldap://`, optionally upgraded with STARTTLS.
    Plain,
    /// `ldaps://`.
    Tls,
}

impl Transport {
    fn scheme(self) -> &'static str {
        match self {
            Transport::Plain => "ldap",
            Transport::Tls => "ldaps",
        }
    }
}

/// One configured endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Network {
        transport: Transport,
        host: String,
        port: u16,
    },
    /// `ldapi://` with a percent-encoded socket path.
    LocalSocket { path: String },
}

impl Endpoint {
    /// Parse an endpoint URL.
    pub fn parse(raw: &str) -> DirectoryResult<Self> {
        let url = Url::parse(raw).map_err(|e| {
            DirectoryError::invalid_configuration(format!("invalid LDAP url '{raw}': {e}"))
        })?;
        let transport = match url.scheme() {
            "ldap" => Transport::Plain,
            "ldaps" => Transport::Tls,
            "ldapi" => {
                let encoded = url.host_str().unwrap_or_default();
                let path = if encoded.is_empty() {
                    DEFAULT_LDAPI_PATH.to_string()
                } else {
                    percent_decode(encoded)?
                };
                return Ok(Endpoint::LocalSocket { path });
            }
            other => {
                return Err(DirectoryError::invalid_configuration(format!(
                    "unsupported LDAP url scheme '{other}' in '{raw}'"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                DirectoryError::invalid_configuration(format!("LDAP url '{raw}' has no host"))
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(match transport {
            Transport::Plain => 389,
            Transport::Tls => 636,
        });
        Ok(Endpoint::Network {
            transport,
            host,
            port,
        })
    }

    pub fn is_local_socket(&self) -> bool {
        matches!(self, Endpoint::LocalSocket { .. })
    }
}

fn percent_decode(encoded: &str) -> DirectoryResult<String> {
    urlencoding::decode(encoded)
        .map(|path| path.into_owned())
        .map_err(|_| {
            DirectoryError::invalid_configuration(format!("ldapi path '{encoded}' is not UTF-8"))
        })
}

/// Resolves host names to socket addresses.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// One resolved server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub transport: Transport,
    /// Host name from the configured URL.
    pub host: String,
    pub addr: SocketAddr,
}

impl ServerAddress {
    /// URL used to dial this server.
    ///
    /// TLS endpoints dial the configured host name so certificate names match.
    pub fn dial_url(&self) -> String {
        match self.transport {
            Transport::Plain => format!("ldap://{}", self.addr),
            Transport::Tls => format!("ldaps://{}:{}", self.host, self.addr.port()),
        }
    }
}

/// Where a connection attempt goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub url: String,
    /// The same server addressed by its configured host name, for STARTTLS.
    pub host_url: String,
    /// `None` for a local socket.
    pub transport: Option<Transport>,
}

/// Servers a pool may connect to.
#[derive(Debug)]
pub enum ServerSet {
    Single(ServerAddress),
    RoundRobin {
        servers: Vec<ServerAddress>,
        next: AtomicUsize,
    },
    LocalSocket {
        path: String,
    },
}

impl ServerSet {
    /// Build a server set from endpoint URLs.
    pub async fn build(urls: &[String], resolver: &dyn Resolver) -> DirectoryResult<Self> {
        if urls.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "at least one LDAP url is required",
            ));
        }
        let endpoints = urls
            .iter()
            .map(|u| Endpoint::parse(u))
            .collect::<DirectoryResult<Vec<_>>>()?;

        if let Some(Endpoint::LocalSocket { path }) =
            endpoints.iter().find(|e| e.is_local_socket())
        {
            if endpoints.len() > 1 {
                return Err(DirectoryError::invalid_configuration(
                    "an ldapi url must be the only configured url",
                ));
            }
            return Ok(ServerSet::LocalSocket { path: path.clone() });
        }

        let mut servers: Vec<ServerAddress> = Vec::new();
        for endpoint in &endpoints {
            let Endpoint::Network {
                transport,
                host,
                port,
            } = endpoint
            else {
                continue;
            };
            match resolver.resolve(host, *port).await {
                Ok(addrs) => {
                    for addr in addrs {
                        let duplicate = servers
                            .iter()
                            .any(|s| s.addr == addr && s.transport == *transport);
                        if !duplicate {
                            servers.push(ServerAddress {
                                transport: *transport,
                                host: host.clone(),
                                addr,
                            });
                        }
                    }
                }
                Err(e) => warn!(host = %host, port, error = %e, "failed to resolve LDAP host"),
            }
        }

        if servers.is_empty() {
            return Err(DirectoryError::connection_failed(format!(
                "no address resolved for {}",
                urls.join(", ")
            )));
        }

        if urls.len() == 1 && servers.len() == 1 {
            let server = servers.remove(0);
            debug!(addr = %server.addr, "using single LDAP server");
            return Ok(ServerSet::Single(server));
        }
        debug!(servers = servers.len(), "using round-robin LDAP server set");
        Ok(ServerSet::RoundRobin {
            servers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn is_round_robin(&self) -> bool {
        matches!(self, ServerSet::RoundRobin { .. })
    }

    /// Resolved network addresses in the set.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        match self {
            ServerSet::Single(server) => vec![server.addr],
            ServerSet::RoundRobin { servers, .. } => servers.iter().map(|s| s.addr).collect(),
            ServerSet::LocalSocket { .. } => Vec::new(),
        }
    }

    /// Connection targets in the order to try them.
    ///
    /// Round-robin sets rotate the starting server on every call and list the
    /// remaining servers after it for failover.
    pub fn candidates(&self) -> Vec<ServerTarget> {
        match self {
            ServerSet::Single(server) => vec![target(server)],
            ServerSet::RoundRobin { servers, next } => {
                let start = next.fetch_add(1, Ordering::Relaxed) % servers.len();
                servers[start..]
                    .iter()
                    .chain(servers[..start].iter())
                    .map(target)
                    .collect()
            }
            ServerSet::LocalSocket { path } => {
                let url = format!("ldapi://{}", urlencoding::encode(path));
                vec![ServerTarget {
                    host_url: url.clone(),
                    url,
                    transport: None,
                }]
            }
        }
    }
}

fn target(server: &ServerAddress) -> ServerTarget {
    let host = if server.host.contains(':') {
        format!("[{}]", server.host)
    } else {
        server.host.clone()
    };
    ServerTarget {
        url: server.dial_url(),
        host_url: format!("{}://{}:{}", server.transport, host, server.addr.port()),
        transport: Some(server.transport),
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}
