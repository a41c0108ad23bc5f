//! # GAL LDAP Backend
//!
//! LDAP implementation of the directory traits on top of ldap3.
//!
//! ## Features
//!
//! - Single, round-robin and local-socket (`ldapi://`) server sets
//! - Bounded connection pool with failover and one retry on server down
//! - Paged-results searches with per-connection cursors
//! - Attribute callbacks on modify and create
//!
//! ## Example
//!
//! ```ignore
//! use galsync_ldap::{LdapConfig, LdapDirectory};
//!
//! let config = LdapConfig::new(["ldap://ldap1.example.com", "ldap://ldap2.example.com"])
//!     .with_bind("cn=gal,dc=example,dc=com", "secret");
//! let directory = LdapDirectory::connect(config).await?;
//! ```

pub mod config;
pub mod connector;
pub mod pool;
mod result;
pub mod server_set;

pub use config::LdapConfig;
pub use connector::{LdapConnectionFactory, LdapDirectory};
pub use pool::{ConnectionFactory, ConnectionPool, PooledConnection};
pub use server_set::{Endpoint, Resolver, ServerAddress, ServerSet, ServerTarget, SystemResolver, Transport};
