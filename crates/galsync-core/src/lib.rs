//! # GAL Sync Core
//!
//! Incremental synchronization of a Global Address List from LDAP sources
//! or replica mailboxes.
//!
//! ## Features
//!
//! - **Sync tokens**: Opaque cursors carrying per-source LDAP positions and
//!   per-replica change ids
//! - **Data path selection**: Local replica, peer node or direct LDAP
//! - **Throttling**: Per-domain cap on concurrent sync sessions
//! - **Dual source**: Internal and external directories in one GAL
//!
//! ## Example
//!
//! ```ignore
//! use galsync_core::{GalDomain, GalRequest, StaticReplicaCatalog, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::new("node-a", Arc::new(StaticReplicaCatalog::new()))
//!     .with_domain(GalDomain::new(config).with_internal_directory(directory))?;
//!
//! let response = orchestrator
//!     .sync(&GalRequest::new("example.com").with_caller("alice@example.com"))
//!     .await?;
//! let next = response.token;
//! ```

pub mod domain;
pub mod error;
pub mod gal_search;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod replica;
pub mod request;
pub mod token;

pub use domain::{
    DomainConfig, GalDomain, GalMode, GalSourceConfig, ReplicaAccount, ReplicaCatalog,
    ReplicaSource, SourceKind, StaticReplicaCatalog,
};
pub use error::{GalError, GalResult};
pub use orchestrator::{ReplicaOutcome, SyncOrchestrator};
pub use proxy::{HttpReplicaProxy, ReplicaProxy};
pub use registry::{SessionGuard, SyncSessionRegistry};
pub use replica::{
    BatchOutcome, BatchRequest, ChangedItem, FolderScope, MemoryReplica, ReplicaBatch,
    ReplicaMailbox, ReplicaReader, TombstoneLog,
};
pub use request::{DataPath, GalOp, GalRequest, GalResponse, GalSearchType};
pub use token::{LdapCursor, SyncToken};
