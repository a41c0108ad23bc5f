//! # GAL Directory Framework
//!
//! Directory abstractions shared by the LDAP backend and the GAL sync core.
//!
//! ## Architecture
//!
//! - [`Directory`] - Entry operations (search, modify, compare, get, delete,
//!   create, rename, count)
//! - [`PagedSearchSource`] - One page of a paged-results search
//! - [`paged_search`] - Limit-bounded, tie-aware resumable paged search
//! - [`execute_with_one_retry`] - Single retry on server down
//! - [`AttributeCallbackRegistry`] - Per-attribute change validation
//!
//! ## Example
//!
//! ```ignore
//! use galsync_directory::prelude::*;
//!
//! let params = PagedSearchParams::new(
//!     SearchRequest::new("ou=people,dc=example,dc=com", Filter::present("mail")),
//!     500,
//! )
//! .with_limit(100);
//! let outcome = paged_search(&directory, &params).await?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`error`] - Error types with server-down/transient classification
//! - [`entry`] - `DirectoryEntry`, `AttributeSet`, modifications
//! - [`filter`] - Filter tree, RFC 4515 rendering, in-memory evaluation
//! - [`traits`] - Directory traits and search requests
//! - [`paged`] - Paged search driver
//! - [`resilience`] - One-retry execution helper
//! - [`callback`] - Attribute callback registry
//! - [`config`] - Connection and pool settings
//! - [`memory`] - In-memory directory

pub mod callback;
pub mod config;
pub mod entry;
pub mod error;
pub mod filter;
pub mod memory;
pub mod paged;
pub mod resilience;
pub mod traits;

pub use callback::{AttributeCallback, AttributeCallbackRegistry, CallbackContext};
pub use config::ConnectionSettings;
pub use entry::{AttributeChange, AttributeSet, DirectoryEntry, ModificationKind, Modifications};
pub use error::{DirectoryError, DirectoryResult};
pub use filter::{Filter, FilterOp, QueryPattern};
pub use memory::MemoryDirectory;
pub use paged::{paged_search, PagedSearchOutcome, PagedSearchParams, ResumeState};
pub use resilience::{execute_with_one_retry, Attempt};
pub use traits::{Directory, PagedSearchSource, SearchPage, SearchRequest, SearchScope};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::entry::{AttributeChange, AttributeSet, DirectoryEntry, Modifications};
    pub use crate::error::{DirectoryError, DirectoryResult};
    pub use crate::filter::{Filter, FilterOp, QueryPattern};
    pub use crate::paged::{paged_search, PagedSearchOutcome, PagedSearchParams, ResumeState};
    pub use crate::resilience::{execute_with_one_retry, Attempt};
    pub use crate::traits::{Directory, PagedSearchSource, SearchPage, SearchRequest, SearchScope};
}

// Re-export async_trait for directory implementors
pub use async_trait::async_trait;
