//! Sync orchestrator
//!
//! Chooses the data path of each GAL call: a local replica mailbox, a peer
//! node that hosts the replica, or direct LDAP search. Sync calls are
//! throttled per domain and their cursors are kept per directory source.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use galsync_directory::entry::DirectoryEntry;
use galsync_directory::filter::QueryPattern;
use galsync_directory::traits::PagedSearchSource;

use crate::domain::{DomainConfig, GalDomain, GalSourceConfig, ReplicaAccount, ReplicaCatalog, SourceKind};
use crate::error::{GalError, GalResult};
use crate::gal_search::{
    autocomplete_pattern, contact_pattern, query_filter, run_pass, search_pattern, sync_filter,
};
use crate::proxy::ReplicaProxy;
use crate::registry::SyncSessionRegistry;
use crate::replica::{BatchOutcome, BatchRequest, FolderScope, ReplicaReader};
use crate::request::{DataPath, GalOp, GalRequest, GalResponse, GalSearchType};
use crate::token::{LdapCursor, SyncToken};

/// What the replica path produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Served(GalResponse),
    /// No usable replica; `partial` holds entries already read from it.
    NotConfigured { partial: Vec<DirectoryEntry> },
}

impl ReplicaOutcome {
    fn not_configured() -> Self {
        ReplicaOutcome::NotConfigured {
            partial: Vec::new(),
        }
    }
}

/// Entry point for GAL search, autocomplete and sync.
pub struct SyncOrchestrator {
    node: String,
    domains: HashMap<String, GalDomain>,
    sessions: SyncSessionRegistry,
    replicas: Arc<dyn ReplicaCatalog>,
    proxy: Option<Arc<dyn ReplicaProxy>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("node", &self.node)
            .field("domains", &self.domains.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions)
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}

impl SyncOrchestrator {
    pub fn new(node: impl Into<String>, replicas: Arc<dyn ReplicaCatalog>) -> Self {
        Self {
            node: node.into(),
            domains: HashMap::new(),
            sessions: SyncSessionRegistry::new(),
            replicas,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ReplicaProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Register a domain after validating its configuration.
    pub fn add_domain(&mut self, domain: GalDomain) -> GalResult<()> {
        domain.config.validate()?;
        let local_resources = domain
            .config
            .includes_local_resources()
            .then_some(&SourceKind::Internal);
        for kind in domain.config.source_order().iter().chain(local_resources) {
            if domain.source(*kind).is_none() {
                return Err(GalError::configuration(format!(
                    "domain {} has no {kind:?} directory attached",
                    domain.name()
                )));
            }
        }
        self.domains
            .insert(domain.name().to_ascii_lowercase(), domain);
        Ok(())
    }

    pub fn with_domain(mut self, domain: GalDomain) -> GalResult<Self> {
        self.add_domain(domain)?;
        Ok(self)
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn domain(&self, name: &str) -> GalResult<&GalDomain> {
        self.domains
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| GalError::UnknownDomain {
                domain: name.to_string(),
            })
    }

    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.values().map(GalDomain::name)
    }

    /// Sync sessions in flight for `domain`.
    pub fn active_sync_sessions(&self, domain: &str) -> usize {
        self.sessions.active_count(domain)
    }

    /// Substring search over the GAL.
    #[instrument(skip(self, request), fields(domain = %request.domain, op = "search"))]
    pub async fn search(&self, request: &GalRequest) -> GalResult<GalResponse> {
        let domain = self.domain(&request.domain)?;
        let pattern = search_pattern(request.query.as_deref(), request.wildcard);
        self.lookup(domain, GalOp::Search, request, &pattern, true)
            .await
    }

    /// Prefix search over the GAL.
    #[instrument(skip(self, request), fields(domain = %request.domain, op = "autocomplete"))]
    pub async fn autocomplete(&self, request: &GalRequest) -> GalResult<GalResponse> {
        let domain = self.domain(&request.domain)?;
        let pattern = autocomplete_pattern(request.query.as_deref());
        let use_replica = domain.config.replica_autocomplete_enabled;
        self.lookup(domain, GalOp::Autocomplete, request, &pattern, use_replica)
            .await
    }

    /// Incremental sync from the request's prior token.
    #[instrument(skip(self, request), fields(domain = %request.domain, caller = %request.caller))]
    pub async fn sync(&self, request: &GalRequest) -> GalResult<GalResponse> {
        let domain = self.domain(&request.domain)?;
        let token = SyncToken::parse(request.token.as_deref())?;

        let session_id = format!("{}/{}/{}", request.caller, domain.name(), Uuid::new_v4());
        let Some(_session) = self.sessions.try_register(
            domain.name(),
            &session_id,
            domain.config.max_concurrent_sync_clients,
        ) else {
            info!(
                capacity = domain.config.max_concurrent_sync_clients,
                "sync throttled, returning the prior token"
            );
            return Ok(GalResponse::throttled(request.token.clone()));
        };

        let ldap_sync_disabled = domain.config.ldap_sync_disabled;
        let use_replica = token.do_mailbox_sync() && (request.id_only || ldap_sync_disabled);
        let mut partial = Vec::new();
        if use_replica {
            debug!("trying replica sync");
            match self.replica_sync(domain, request, &token).await? {
                ReplicaOutcome::Served(response) => return Ok(response),
                ReplicaOutcome::NotConfigured { partial: buffered } => {
                    info!(
                        buffered = buffered.len(),
                        "replica not configured, falling back to LDAP sync"
                    );
                    partial = buffered;
                }
            }
        }

        let full_sync_recommended = (request.id_only || ldap_sync_disabled)
            && self.select_account(&domain.config, request, None).is_some();
        if ldap_sync_disabled {
            info!(
                full_sync_recommended,
                "LDAP sync disabled, returning the prior token"
            );
            return Ok(GalResponse {
                full_sync_recommended,
                ..GalResponse::unchanged(request.token.clone())
            });
        }

        let mut response = self.ldap_sync(domain, request, &token, partial).await?;
        response.full_sync_recommended |= full_sync_recommended;
        Ok(response)
    }

    /// Search the replica with the query as given, then LDAP with `pattern`.
    async fn lookup(
        &self,
        domain: &GalDomain,
        op: GalOp,
        request: &GalRequest,
        pattern: &QueryPattern,
        use_replica: bool,
    ) -> GalResult<GalResponse> {
        let limit = domain.config.search_limit(request.limit);
        if use_replica {
            let contact = contact_pattern(request.query.as_deref());
            match self
                .replica_search(domain, op, request, &contact, limit)
                .await
            {
                Ok(ReplicaOutcome::Served(response)) => return Ok(response),
                Ok(ReplicaOutcome::NotConfigured { .. }) => {
                    debug!("replica not configured, searching LDAP");
                }
                Err(e) => warn!(error = %e, "replica search failed, searching LDAP"),
            }
        }

        let (entries, has_more) = self.ldap_search(domain, request, pattern, limit).await?;
        Ok(GalResponse {
            entries: finish_entries(entries, request.id_only),
            has_more,
            definition_last_modified: domain.config.definition_last_modified.clone(),
            served_by: Some(DataPath::Ldap),
            ..GalResponse::default()
        })
    }

    fn source<'d>(
        &self,
        domain: &'d GalDomain,
        kind: SourceKind,
    ) -> GalResult<(&'d dyn PagedSearchSource, &'d GalSourceConfig)> {
        domain.source(kind).ok_or_else(|| {
            GalError::configuration(format!(
                "domain {} has no {kind:?} directory attached",
                domain.name()
            ))
        })
    }

    async fn ldap_search(
        &self,
        domain: &GalDomain,
        request: &GalRequest,
        pattern: &QueryPattern,
        limit: u32,
    ) -> GalResult<(Vec<DirectoryEntry>, bool)> {
        let kinds = domain.config.source_order();
        let per_source = split_limit(limit, kinds.len());
        let mut entries = Vec::new();
        let mut has_more = false;

        if domain.config.includes_local_resources() && wants_resources(request.search_type) {
            let (directory, source) = self.source(domain, SourceKind::Internal)?;
            let filter = query_filter(source, GalSearchType::Resource, pattern);
            let pass = run_pass(directory, source, filter, per_source, None, request.page_size).await?;
            has_more |= pass.has_more;
            entries.extend(pass.entries);
        }

        for kind in kinds {
            let (directory, source) = self.source(domain, *kind)?;
            let filter = query_filter(source, request.search_type, pattern);
            filter.validate()?;
            let pass = run_pass(directory, source, filter, per_source, None, request.page_size).await?;
            has_more |= pass.has_more;
            entries.extend(pass.entries);
        }
        Ok((entries, has_more))
    }

    #[instrument(skip_all, fields(caller = %request.caller))]
    async fn ldap_sync(
        &self,
        domain: &GalDomain,
        request: &GalRequest,
        token: &SyncToken,
        partial: Vec<DirectoryEntry>,
    ) -> GalResult<GalResponse> {
        let config = &domain.config;
        let kinds = config.source_order();
        let limit = config.sync_limit(request.limit);
        let per_source = split_limit(limit, kinds.len());
        let primary_resuming = token.primary.as_ref().is_some_and(|c| c.has_more);

        let mut entries = partial;
        let mut has_more = false;

        if config.includes_local_resources()
            && entries.is_empty()
            && !primary_resuming
            && wants_resources(request.search_type)
        {
            let (directory, source) = self.source(domain, SourceKind::Internal)?;
            let filter = sync_filter(source, GalSearchType::Resource, token.primary.as_ref());
            let pass = run_pass(directory, source, filter, 0, None, request.page_size).await?;
            debug!(resources = pass.entries.len(), "local resources included");
            entries.extend(pass.entries);
        }

        let mut next = SyncToken::new();
        for (slot, kind) in kinds.iter().enumerate() {
            let cursor = if slot == 0 {
                token.primary.as_ref()
            } else {
                token.secondary.as_ref()
            };
            let (directory, source) = self.source(domain, *kind)?;
            let filter = sync_filter(source, request.search_type, cursor);
            filter.validate()?;
            let pass = run_pass(directory, source, filter, per_source, cursor, request.page_size).await?;
            if pass.size_limit_exceeded {
                warn!(source = ?kind, "directory truncated sync results");
            }
            has_more |= pass.has_more;
            entries.extend(pass.entries);
            if slot == 0 {
                next.primary = Some(pass.cursor);
            } else {
                next.secondary = Some(pass.cursor);
            }
        }

        info!(delivered = entries.len(), has_more, "LDAP sync finished");
        Ok(GalResponse {
            entries: finish_entries(dedupe_by_id(entries), request.id_only),
            token: Some(next.encode()),
            has_more,
            definition_last_modified: config.definition_last_modified.clone(),
            served_by: Some(DataPath::Ldap),
            ..GalResponse::default()
        })
    }

    /// Pick the replica account serving a request.
    fn select_account<'d>(
        &self,
        config: &'d DomainConfig,
        request: &GalRequest,
        token: Option<&SyncToken>,
    ) -> Option<&'d ReplicaAccount> {
        let valid = || config.replica_accounts.iter().filter(|a| a.is_valid());
        if let Some(id) = &request.replica_account {
            return valid().find(|a| &a.id == id);
        }
        if let Some(token) = token {
            if let Some(account) = valid().find(|a| token.change_ids.contains_key(&a.id)) {
                return Some(account);
            }
        }
        valid()
            .find(|a| a.node == self.node)
            .or_else(|| valid().next())
    }

    async fn open_reader(&self, account: &ReplicaAccount) -> Option<ReplicaReader> {
        if !account.active {
            info!(account = %account.id, "replica account inactive");
            return None;
        }
        match self.replicas.open(&account.id).await {
            Some(mailbox) => Some(ReplicaReader::new(account.id.clone(), mailbox)),
            None => {
                warn!(account = %account.id, "replica mailbox cannot be opened");
                None
            }
        }
    }

    async fn replica_search(
        &self,
        domain: &GalDomain,
        op: GalOp,
        request: &GalRequest,
        pattern: &QueryPattern,
        limit: u32,
    ) -> GalResult<ReplicaOutcome> {
        let config = &domain.config;
        let Some(account) = self.select_account(config, request, None) else {
            return Ok(ReplicaOutcome::not_configured());
        };
        if account.node != self.node {
            let mut forwarded = request.clone();
            forwarded.replica_account = Some(account.id.clone());
            return Ok(match self.forward(&account.node, op, &forwarded).await {
                Some(Ok(response)) => ReplicaOutcome::Served(response),
                Some(Err(e)) => {
                    warn!(node = %account.node, error = %e, "proxied search failed");
                    ReplicaOutcome::not_configured()
                }
                None => ReplicaOutcome::not_configured(),
            });
        }
        let Some(reader) = self.open_reader(account).await else {
            return Ok(ReplicaOutcome::not_configured());
        };
        let folders: Vec<FolderScope> = account
            .folders_for(config.gal_mode)
            .into_iter()
            .map(|s| FolderScope::new(s.folder.clone()))
            .collect();
        let Some(source) = config.primary_source() else {
            return Ok(ReplicaOutcome::not_configured());
        };
        if folders.is_empty() {
            return Ok(ReplicaOutcome::not_configured());
        }

        let filter = query_filter(source, request.search_type, pattern);
        let (entries, has_more) = reader
            .search(&folders, Some(&filter), limit as usize, request.id_only)
            .await?;
        debug!(account = %account.id, found = entries.len(), "replica search served");
        Ok(ReplicaOutcome::Served(GalResponse {
            entries,
            has_more,
            definition_last_modified: config.definition_last_modified.clone(),
            served_by: Some(DataPath::Replica),
            ..GalResponse::default()
        }))
    }

    #[instrument(skip_all, fields(caller = %request.caller))]
    async fn replica_sync(
        &self,
        domain: &GalDomain,
        request: &GalRequest,
        token: &SyncToken,
    ) -> GalResult<ReplicaOutcome> {
        let config = &domain.config;
        let Some(account) = self.select_account(config, request, Some(token)) else {
            return Ok(ReplicaOutcome::not_configured());
        };

        if account.node != self.node {
            let mut forwarded = request.clone();
            forwarded.replica_account = Some(account.id.clone());
            return Ok(match self.forward(&account.node, GalOp::Sync, &forwarded).await {
                Some(Ok(response)) => ReplicaOutcome::Served(response),
                Some(Err(e)) => {
                    warn!(node = %account.node, error = %e, "proxied sync failed, returning the prior token");
                    ReplicaOutcome::Served(GalResponse::unchanged(request.token.clone()))
                }
                None => ReplicaOutcome::not_configured(),
            });
        }

        let Some(reader) = self.open_reader(account).await else {
            return Ok(ReplicaOutcome::not_configured());
        };

        let type_filter = |kind: SourceKind| match request.search_type {
            GalSearchType::All => None,
            search_type => config.source(kind).map(|s| s.type_filter(search_type)),
        };
        let main: Vec<FolderScope> = account
            .folders_for(config.gal_mode)
            .into_iter()
            .map(|s| FolderScope::new(s.folder.clone()).with_filter(type_filter(s.kind)))
            .collect();
        let local: Vec<FolderScope> =
            if config.includes_local_resources() && wants_resources(request.search_type) {
                let resource_filter = config
                    .internal
                    .as_ref()
                    .map(|s| s.type_filter(GalSearchType::Resource));
                account
                    .folders_of(SourceKind::Internal)
                    .into_iter()
                    .map(|s| FolderScope::new(s.folder.clone()).with_filter(resource_filter.clone()))
                    .collect()
            } else {
                Vec::new()
            };

        let change_id = token.change_id(&account.id).unwrap_or(0);
        let limit = config.sync_limit(request.limit) as usize;

        if main.is_empty() {
            if local.is_empty() {
                info!(account = %account.id, mode = ?config.gal_mode, "replica has no folder for the gal mode");
                return Ok(ReplicaOutcome::not_configured());
            }
            let batch = reader
                .sync_batch(&BatchRequest {
                    change_id,
                    folders: local,
                    limit,
                    id_only: request.id_only,
                    want_remaining: false,
                })
                .await?;
            let partial = match batch {
                BatchOutcome::Delivered(batch) => batch.entries,
                BatchOutcome::MustResync { .. } => Vec::new(),
            };
            return Ok(ReplicaOutcome::NotConfigured { partial });
        }

        let mut folders = local;
        folders.extend(main);
        let outcome = reader
            .sync_batch(&BatchRequest {
                change_id,
                folders,
                limit,
                id_only: request.id_only,
                want_remaining: request.want_remaining,
            })
            .await?;

        let response = match outcome {
            BatchOutcome::MustResync { floor } => {
                warn!(account = %account.id, change_id, floor, "full sync recommended");
                GalResponse {
                    token: request.token.clone(),
                    full_sync_recommended: true,
                    definition_last_modified: config.definition_last_modified.clone(),
                    served_by: Some(DataPath::Replica),
                    ..GalResponse::default()
                }
            }
            BatchOutcome::Delivered(batch) => {
                let mut next = replica_cursors(config, account);
                next.change_ids = token.change_ids.clone();
                next.change_ids
                    .insert(account.id.clone(), batch.new_change_id);
                info!(
                    account = %account.id,
                    delivered = batch.entries.len(),
                    deleted = batch.deleted_ids.len(),
                    has_more = batch.has_more,
                    "replica sync served"
                );
                GalResponse {
                    entries: batch.entries,
                    deleted: batch.deleted_ids,
                    token: Some(next.encode()),
                    has_more: batch.has_more,
                    remaining: batch.remaining,
                    definition_last_modified: config.definition_last_modified.clone(),
                    served_by: Some(DataPath::Replica),
                    ..GalResponse::default()
                }
            }
        };
        Ok(ReplicaOutcome::Served(response))
    }

    /// Forward to a peer; `None` when forwarding is not possible.
    async fn forward(
        &self,
        node: &str,
        op: GalOp,
        request: &GalRequest,
    ) -> Option<GalResult<GalResponse>> {
        if request.proxied {
            debug!(node, "proxied request for a remote replica, not forwarding again");
            return None;
        }
        let proxy = self.proxy.as_ref()?;
        info!(node, op = %op, "forwarding to replica host");
        Some(proxy.forward(node, op, request).await)
    }
}

/// Per-source LDAP cursors of a replica: the earliest import timestamp of
/// each source kind, in token slot order.
fn replica_cursors(config: &DomainConfig, account: &ReplicaAccount) -> SyncToken {
    let earliest = |kind: SourceKind| {
        account
            .folders_of(kind)
            .into_iter()
            .filter_map(|s| s.last_sync.as_deref())
            .min()
            .map(LdapCursor::from_timestamp)
    };
    let kinds = config.source_order();
    SyncToken {
        primary: kinds.first().and_then(|k| earliest(*k)),
        secondary: kinds.get(1).and_then(|k| earliest(*k)),
        ..SyncToken::default()
    }
}

fn split_limit(limit: u32, sources: usize) -> u32 {
    if sources > 1 && limit > 0 {
        (limit / 2).max(1)
    } else {
        limit
    }
}

fn wants_resources(search_type: GalSearchType) -> bool {
    matches!(search_type, GalSearchType::All | GalSearchType::Resource)
}

fn dedupe_by_id(entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.id.to_ascii_lowercase()))
        .collect()
}

fn finish_entries(entries: Vec<DirectoryEntry>, id_only: bool) -> Vec<DirectoryEntry> {
    if id_only {
        entries.iter().map(DirectoryEntry::id_only).collect()
    } else {
        entries
    }
}
