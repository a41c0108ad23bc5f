//! Directory traits
//!
//! The seams between the GAL layer and a concrete directory: plain entry
//! operations and server-side paged search.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entry::{DirectoryEntry, Modifications};
use crate::error::DirectoryResult;
use crate::filter::Filter;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}

/// One search against a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub filter: Filter,
    /// Attributes to return. Empty returns all user attributes.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: SearchScope::Subtree,
            filter,
            attributes: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// One page of a paged search.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub entries: Vec<DirectoryEntry>,
    /// Paging cookie for the next page; empty when the server has no more pages.
    pub cookie: Vec<u8>,
    /// The server stopped at its size limit; `entries` holds what it sent before that.
    pub size_limit_exceeded: bool,
}

/// A directory that supports the paged-results control.
#[async_trait]
pub trait PagedSearchSource: Send + Sync {
    /// Fetch the page identified by `cookie` (empty for the first page).
    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: u32,
        cookie: &[u8],
    ) -> DirectoryResult<SearchPage>;

    /// End the server cursor behind `cookie` when the caller stops before
    /// the last page.
    async fn abandon(&self, _request: &SearchRequest, _cookie: &[u8]) -> DirectoryResult<()> {
        Ok(())
    }
}

/// Entry-level directory operations.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Search and return every matching entry.
    async fn search(&self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>>;

    /// Read one entry by DN.
    async fn get_entry(
        &self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<DirectoryEntry>>;

    /// Apply modifications to an existing entry.
    async fn modify(&self, dn: &str, changes: &Modifications) -> DirectoryResult<()>;

    /// Compare an attribute value.
    async fn compare(&self, dn: &str, attribute: &str, value: &str) -> DirectoryResult<bool>;

    async fn delete(&self, dn: &str) -> DirectoryResult<()>;

    /// Create an entry; its `id` is the DN.
    async fn create_entry(&self, entry: &DirectoryEntry) -> DirectoryResult<()>;

    async fn rename_entry(&self, old_dn: &str, new_dn: &str) -> DirectoryResult<()>;

    /// Count matching entries without returning them.
    async fn count_entries(&self, request: &SearchRequest) -> DirectoryResult<usize>;
}

/// Split a DN into its leading RDN and the parent DN.
///
/// Escaped commas are not treated as separators.
pub fn split_dn(dn: &str) -> (&str, Option<&str>) {
    let bytes = dn.as_bytes();
    let mut escaped = false;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'\\' if !escaped => escaped = true,
            b',' if !escaped => return (&dn[..i], Some(dn[i + 1..].trim_start())),
            _ => escaped = false,
        }
    }
    (dn, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_dn() {
        assert_eq!(
            split_dn("uid=ada,ou=people,dc=example"),
            ("uid=ada", Some("ou=people,dc=example"))
        );
        assert_eq!(
            split_dn("cn=Smith\\, John,ou=people"),
            ("cn=Smith\\, John", Some("ou=people"))
        );
        assert_eq!(split_dn("dc=example"), ("dc=example", None));
    }

    #[test]
    fn test_search_request_builder() {
        let req = SearchRequest::new("dc=example", Filter::present("objectClass"))
            .with_scope(SearchScope::OneLevel)
            .with_attributes(vec!["cn".into()]);
        assert_eq!(req.scope, SearchScope::OneLevel);
        assert_eq!(req.attributes, vec!["cn".to_string()]);
    }
}
