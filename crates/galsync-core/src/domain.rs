//! Domain GAL policy
//!
//! Per-domain configuration: which directory sources make up the GAL, how
//! each is searched, sync limits and concurrency, and the replica accounts
//! that cache the GAL in a mailbox.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use galsync_directory::error::{DirectoryError, DirectoryResult};
use galsync_directory::filter::{Filter, QueryPattern};
use galsync_directory::traits::PagedSearchSource;

use crate::replica::ReplicaMailbox;
use crate::request::GalSearchType;

/// Which directory sources make up a domain's GAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalMode {
    #[default]
    Internal,
    External,
    Both,
}

/// One directory source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Internal,
    External,
}

/// How a directory source is searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalSourceConfig {
    pub base_dn: String,

    #[serde(default = "default_object_classes")]
    pub object_classes: Vec<String>,

    #[serde(default = "default_group_object_classes")]
    pub group_object_classes: Vec<String>,

    /// Attributes a free-text query is matched against.
    #[serde(default = "default_searchable_attributes")]
    pub searchable_attributes: Vec<String>,

    /// Create-timestamp attributes used as the resume marker; the first one
    /// is used in sync filters.
    #[serde(default = "default_marker_attributes")]
    pub marker_attributes: Vec<String>,

    /// Modify-timestamp attributes; the first one is used in sync filters.
    #[serde(default = "default_modify_attributes")]
    pub modify_attributes: Vec<String>,

    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,

    /// Present on calendar resources.
    #[serde(default = "default_resource_attribute")]
    pub resource_attribute: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_object_classes() -> Vec<String> {
    vec!["inetOrgPerson".into(), "calendarResource".into()]
}

fn default_group_object_classes() -> Vec<String> {
    vec!["groupOfNames".into(), "group".into()]
}

fn default_searchable_attributes() -> Vec<String> {
    vec![
        "cn".into(),
        "displayName".into(),
        "givenName".into(),
        "sn".into(),
        "mail".into(),
    ]
}

fn default_marker_attributes() -> Vec<String> {
    vec!["createTimestamp".into(), "whenCreated".into()]
}

fn default_modify_attributes() -> Vec<String> {
    vec!["modifyTimestamp".into(), "whenChanged".into()]
}

fn default_id_attribute() -> String {
    "entryUUID".into()
}

fn default_resource_attribute() -> String {
    "calResType".into()
}

fn default_page_size() -> u32 {
    500
}

impl GalSourceConfig {
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            object_classes: default_object_classes(),
            group_object_classes: default_group_object_classes(),
            searchable_attributes: default_searchable_attributes(),
            marker_attributes: default_marker_attributes(),
            modify_attributes: default_modify_attributes(),
            id_attribute: default_id_attribute(),
            resource_attribute: default_resource_attribute(),
            page_size: default_page_size(),
        }
    }

    pub fn with_searchable_attributes(mut self, attributes: Vec<String>) -> Self {
        self.searchable_attributes = attributes;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Attribute holding an entry's create timestamp.
    pub fn create_attribute(&self) -> &str {
        self.marker_attributes
            .first()
            .map(String::as_str)
            .unwrap_or("createTimestamp")
    }

    pub fn modify_attribute(&self) -> &str {
        self.modify_attributes
            .first()
            .map(String::as_str)
            .unwrap_or("modifyTimestamp")
    }

    fn class_filter(classes: &[String]) -> Filter {
        Filter::or(
            classes
                .iter()
                .map(|c| Filter::eq("objectClass", c.as_str()))
                .collect(),
        )
    }

    /// Filter selecting entries of one result type.
    pub fn type_filter(&self, search_type: GalSearchType) -> Filter {
        match search_type {
            GalSearchType::All => {
                let mut classes = self.object_classes.clone();
                classes.extend(self.group_object_classes.iter().cloned());
                Self::class_filter(&classes)
            }
            GalSearchType::Account => Filter::and(vec![
                Self::class_filter(&self.object_classes),
                Filter::present(self.resource_attribute.as_str()).negated(),
            ]),
            GalSearchType::Resource => Filter::present(self.resource_attribute.as_str()),
            GalSearchType::Group => Self::class_filter(&self.group_object_classes),
        }
    }

    /// Leaf for a query pattern OR-ed across the searchable attributes.
    ///
    /// `None` for a match-all pattern.
    pub fn query_filter(&self, pattern: &QueryPattern) -> Option<Filter> {
        if pattern.is_match_all() {
            return None;
        }
        Some(Filter::or(
            self.searchable_attributes
                .iter()
                .map(|a| Filter::pattern(a.as_str(), pattern))
                .collect(),
        ))
    }

    pub fn validate(&self) -> DirectoryResult<()> {
        if self.base_dn.trim().is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "GAL source base_dn must not be empty",
            ));
        }
        if self.object_classes.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "GAL source needs at least one object class",
            ));
        }
        if self.searchable_attributes.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "GAL source needs at least one searchable attribute",
            ));
        }
        if self.page_size == 0 {
            return Err(DirectoryError::invalid_configuration(
                "GAL source page_size must be greater than zero",
            ));
        }
        self.type_filter(GalSearchType::All).validate()
    }
}

/// One directory source cached in a replica mailbox folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSource {
    pub kind: SourceKind,
    pub folder: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory timestamp of the last successful import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A mailbox caching the GAL of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAccount {
    pub id: String,
    /// Node hosting the mailbox.
    pub node: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sources: Vec<ReplicaSource>,
}

impl ReplicaAccount {
    /// Every source is enabled and has synced at least once.
    pub fn is_valid(&self) -> bool {
        !self.sources.is_empty()
            && self
                .sources
                .iter()
                .all(|s| s.enabled && s.last_sync.is_some())
    }

    /// Folders holding the sources of `mode`.
    pub fn folders_for(&self, mode: GalMode) -> Vec<&ReplicaSource> {
        self.sources
            .iter()
            .filter(|s| match mode {
                GalMode::Internal => s.kind == SourceKind::Internal,
                GalMode::External => s.kind == SourceKind::External,
                GalMode::Both => true,
            })
            .collect()
    }

    pub fn folders_of(&self, kind: SourceKind) -> Vec<&ReplicaSource> {
        self.sources.iter().filter(|s| s.kind == kind).collect()
    }
}

/// GAL policy of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,

    #[serde(default)]
    pub gal_mode: GalMode,

    /// Concurrent sync sessions allowed; 0 is unlimited.
    #[serde(default)]
    pub max_concurrent_sync_clients: u32,

    /// Cap on entries per sync call; 0 is unlimited.
    #[serde(default)]
    pub sync_size_limit: u32,

    /// Entries returned by search and autocomplete when the request has no limit.
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// Serve sync from the replica whenever there is replica history.
    #[serde(default)]
    pub ldap_sync_disabled: bool,

    /// Include internal calendar resources in an external-only GAL.
    #[serde(default)]
    pub always_include_local_resources: bool,

    #[serde(default)]
    pub replica_autocomplete_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_last_modified: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<GalSourceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<GalSourceConfig>,

    #[serde(default)]
    pub replica_accounts: Vec<ReplicaAccount>,
}

fn default_max_results() -> u32 {
    100
}

impl DomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gal_mode: GalMode::default(),
            max_concurrent_sync_clients: 0,
            sync_size_limit: 0,
            max_results: default_max_results(),
            ldap_sync_disabled: false,
            always_include_local_resources: false,
            replica_autocomplete_enabled: false,
            definition_last_modified: None,
            internal: None,
            external: None,
            replica_accounts: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: GalMode) -> Self {
        self.gal_mode = mode;
        self
    }

    pub fn with_internal(mut self, source: GalSourceConfig) -> Self {
        self.internal = Some(source);
        self
    }

    pub fn with_external(mut self, source: GalSourceConfig) -> Self {
        self.external = Some(source);
        self
    }

    pub fn with_max_concurrent_sync_clients(mut self, max: u32) -> Self {
        self.max_concurrent_sync_clients = max;
        self
    }

    pub fn with_sync_size_limit(mut self, limit: u32) -> Self {
        self.sync_size_limit = limit;
        self
    }

    pub fn with_replica_account(mut self, account: ReplicaAccount) -> Self {
        self.replica_accounts.push(account);
        self
    }

    pub fn source(&self, kind: SourceKind) -> Option<&GalSourceConfig> {
        match kind {
            SourceKind::Internal => self.internal.as_ref(),
            SourceKind::External => self.external.as_ref(),
        }
    }

    /// Sources searched by the LDAP path, in token slot order.
    pub fn source_order(&self) -> &'static [SourceKind] {
        match self.gal_mode {
            GalMode::Internal => &[SourceKind::Internal],
            GalMode::External => &[SourceKind::External],
            GalMode::Both => &[SourceKind::Internal, SourceKind::External],
        }
    }

    /// Source whose attributes shape replica searches.
    pub fn primary_source(&self) -> Option<&GalSourceConfig> {
        self.source_order().iter().find_map(|k| self.source(*k))
    }

    /// Runs the internal-resource pre-pass.
    pub fn includes_local_resources(&self) -> bool {
        self.gal_mode == GalMode::External && self.always_include_local_resources
    }

    /// Entries per sync call.
    pub fn sync_limit(&self, requested: u32) -> u32 {
        match (requested, self.sync_size_limit) {
            (0, cap) => cap,
            (requested, 0) => requested,
            (requested, cap) => requested.min(cap),
        }
    }

    /// Entries per search or autocomplete call, capped by `max_results`.
    pub fn search_limit(&self, requested: u32) -> u32 {
        match (requested, self.max_results) {
            (0, cap) => cap,
            (requested, 0) => requested,
            (requested, cap) => requested.min(cap),
        }
    }

    pub fn validate(&self) -> DirectoryResult<()> {
        if self.name.trim().is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "domain name must not be empty",
            ));
        }
        for kind in self.source_order() {
            match self.source(*kind) {
                Some(source) => source.validate()?,
                None => {
                    return Err(DirectoryError::invalid_configuration(format!(
                        "domain {} uses gal mode {:?} but has no {:?} source",
                        self.name, self.gal_mode, kind
                    )))
                }
            }
        }
        if self.includes_local_resources() {
            match &self.internal {
                Some(source) => source.validate()?,
                None => {
                    return Err(DirectoryError::invalid_configuration(format!(
                        "domain {} includes local resources but has no internal source",
                        self.name
                    )))
                }
            }
        }
        for account in &self.replica_accounts {
            if account.id.is_empty() || account.id.contains(':') {
                return Err(DirectoryError::invalid_configuration(format!(
                    "replica account id '{}' must be non-empty and contain no ':'",
                    account.id
                )));
            }
        }
        Ok(())
    }
}

/// Opens replica mailboxes by account id.
#[async_trait]
pub trait ReplicaCatalog: Send + Sync {
    /// `None` when the mailbox cannot be opened.
    async fn open(&self, account_id: &str) -> Option<Arc<dyn ReplicaMailbox>>;
}

/// Catalog over mailboxes registered up front.
#[derive(Default, Clone)]
pub struct StaticReplicaCatalog {
    mailboxes: HashMap<String, Arc<dyn ReplicaMailbox>>,
}

impl std::fmt::Debug for StaticReplicaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticReplicaCatalog")
            .field("accounts", &self.mailboxes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticReplicaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox(mut self, account_id: impl Into<String>, mailbox: Arc<dyn ReplicaMailbox>) -> Self {
        self.mailboxes.insert(account_id.into(), mailbox);
        self
    }
}

#[async_trait]
impl ReplicaCatalog for StaticReplicaCatalog {
    async fn open(&self, account_id: &str) -> Option<Arc<dyn ReplicaMailbox>> {
        self.mailboxes.get(account_id).cloned()
    }
}

/// A domain with its directory sources attached.
#[derive(Clone)]
pub struct GalDomain {
    pub config: DomainConfig,
    pub internal: Option<Arc<dyn PagedSearchSource>>,
    pub external: Option<Arc<dyn PagedSearchSource>>,
}

impl std::fmt::Debug for GalDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GalDomain")
            .field("config", &self.config)
            .field("internal", &self.internal.is_some())
            .field("external", &self.external.is_some())
            .finish()
    }
}

impl GalDomain {
    pub fn new(config: DomainConfig) -> Self {
        Self {
            config,
            internal: None,
            external: None,
        }
    }

    pub fn with_internal_directory(mut self, directory: Arc<dyn PagedSearchSource>) -> Self {
        self.internal = Some(directory);
        self
    }

    pub fn with_external_directory(mut self, directory: Arc<dyn PagedSearchSource>) -> Self {
        self.external = Some(directory);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Directory and search settings of one source.
    pub fn source(&self, kind: SourceKind) -> Option<(&dyn PagedSearchSource, &GalSourceConfig)> {
        let directory = match kind {
            SourceKind::Internal => self.internal.as_deref()?,
            SourceKind::External => self.external.as_deref()?,
        };
        Some((directory, self.config.source(kind)?))
    }
}
