//! LDAP directory
//!
//! [`Directory`] and [`PagedSearchSource`] over ldap3, running every operation
//! through a [`ConnectionPool`].

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, Scope, SearchResult};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use galsync_directory::callback::{AttributeCallbackRegistry, CallbackContext};
use galsync_directory::entry::{DirectoryEntry, ModificationKind, Modifications};
use galsync_directory::error::{DirectoryError, DirectoryResult};
use galsync_directory::paged::{paged_search, PagedSearchParams};
use galsync_directory::traits::{
    split_dn, Directory, PagedSearchSource, SearchPage, SearchRequest, SearchScope,
};

use crate::config::LdapConfig;
use crate::pool::{ConnectionFactory, ConnectionPool};
use crate::result::{
    map_ldap_error, map_result_code, to_directory_entry, RC_COMPARE_FALSE, RC_COMPARE_TRUE,
    RC_NO_SUCH_ATTRIBUTE, RC_NO_SUCH_OBJECT, RC_SIZE_LIMIT_EXCEEDED, RC_SUCCESS,
};
use crate::server_set::{Resolver, ServerSet, ServerTarget, SystemResolver, Transport};

/// Open paged cursors kept per directory.
const PINNED_CURSOR_LIMIT: usize = 256;

/// Opens and binds ldap3 connections.
#[derive(Debug, Clone)]
pub struct LdapConnectionFactory {
    config: LdapConfig,
}

impl LdapConnectionFactory {
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for LdapConnectionFactory {
    type Connection = Ldap;

    async fn connect(&self, target: &ServerTarget) -> DirectoryResult<Ldap> {
        let starttls = self.config.starttls && target.transport == Some(Transport::Plain);
        let url = if starttls {
            &target.host_url
        } else {
            &target.url
        };

        debug!(url = %url, starttls, "Connecting to LDAP server");

        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.config.connection.connection_timeout())
            .set_starttls(starttls)
            .set_no_tls_verify(!self.config.verify_tls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .map_err(|e| {
                DirectoryError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {url}"),
                    e,
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        if let Some(bind_dn) = &self.config.bind_dn {
            let bind_password = self.config.bind_password.as_deref().unwrap_or("");
            debug!(bind_dn = %bind_dn, "Performing LDAP bind");

            let result = ldap
                .simple_bind(bind_dn, bind_password)
                .await
                .map_err(|e| {
                    DirectoryError::connection_failed_with_source(
                        format!("LDAP bind failed for {bind_dn}"),
                        e,
                    )
                })?;
            if result.rc != RC_SUCCESS {
                return Err(map_result_code(result.rc, &result.text, bind_dn));
            }
        }

        info!(url = %url, "LDAP connection established successfully");
        Ok(ldap)
    }
}

/// Paged cursors are bound to the connection that opened them.
#[derive(Default)]
struct PinnedCursors {
    next_id: u64,
    open: VecDeque<(u64, Ldap)>,
}

impl PinnedCursors {
    fn pin(&mut self, ldap: Ldap) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        if self.open.len() >= PINNED_CURSOR_LIMIT {
            self.open.pop_front();
        }
        self.open.push_back((self.next_id, ldap));
        self.next_id
    }

    fn take(&mut self, id: u64) -> Option<Ldap> {
        let index = self.open.iter().position(|(open_id, _)| *open_id == id)?;
        self.open.remove(index).map(|(_, ldap)| ldap)
    }
}

fn wrap_cookie(cursor: u64, server_cookie: &[u8]) -> Vec<u8> {
    let mut cookie = cursor.to_be_bytes().to_vec();
    cookie.extend_from_slice(server_cookie);
    cookie
}

fn unwrap_cookie(cookie: &[u8]) -> DirectoryResult<(u64, &[u8])> {
    if cookie.len() <= 8 {
        return Err(DirectoryError::operation_failed("malformed paged search cookie"));
    }
    let (id, server_cookie) = cookie.split_at(8);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(id);
    Ok((u64::from_be_bytes(bytes), server_cookie))
}

fn to_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

fn check(result: LdapResult, target: &str) -> DirectoryResult<()> {
    if result.rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(map_result_code(result.rc, &result.text, target))
    }
}

fn to_mods(changes: &Modifications) -> Vec<Mod<String>> {
    changes
        .iter()
        .map(|change| {
            let values: HashSet<String> = change.values.iter().cloned().collect();
            let attribute = change.attribute.clone();
            match change.kind {
                ModificationKind::Add => Mod::Add(attribute, values),
                ModificationKind::Replace => Mod::Replace(attribute, values),
                ModificationKind::Delete => Mod::Delete(attribute, values),
            }
        })
        .collect()
}

/// Drop deletions of attributes or values the entry no longer has.
fn prune_absent_deletes(changes: &Modifications, current: &DirectoryEntry) -> Modifications {
    changes
        .iter()
        .filter_map(|change| {
            if change.kind != ModificationKind::Delete {
                return Some(change.clone());
            }
            let present = current.attributes.get(&change.attribute)?;
            if change.values.is_empty() {
                return Some(change.clone());
            }
            let mut kept = change.clone();
            kept.values
                .retain(|v| present.iter().any(|p| p.eq_ignore_ascii_case(v)));
            (!kept.values.is_empty()).then_some(kept)
        })
        .collect()
}

/// An LDAP directory behind a connection pool.
pub struct LdapDirectory {
    pool: ConnectionPool<LdapConnectionFactory>,
    callbacks: AttributeCallbackRegistry,
    group_classes: Vec<String>,
    read_timeout: Duration,
    page_size: u32,
    cursors: Mutex<PinnedCursors>,
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("pool", &self.pool)
            .field("group_classes", &self.group_classes)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl LdapDirectory {
    /// Connect using the system resolver.
    pub async fn connect(config: LdapConfig) -> DirectoryResult<Self> {
        Self::connect_with_resolver(config, &SystemResolver).await
    }

    pub async fn connect_with_resolver(
        config: LdapConfig,
        resolver: &dyn Resolver,
    ) -> DirectoryResult<Self> {
        config.validate()?;
        let servers = ServerSet::build(&config.urls, resolver).await?;
        if servers.is_round_robin() {
            info!(servers = servers.addresses().len(), "LDAP round-robin server set");
        }
        let read_timeout = config.connection.read_timeout();
        let page_size = config.page_size;
        let settings = config.connection.clone();
        let pool =
            ConnectionPool::new(LdapConnectionFactory::new(config), servers, settings).await?;
        Ok(Self {
            pool,
            callbacks: AttributeCallbackRegistry::default(),
            group_classes: vec!["group".into(), "groupOfNames".into(), "groupOfUniqueNames".into()],
            read_timeout,
            page_size,
            cursors: Mutex::new(PinnedCursors::default()),
        })
    }

    pub fn with_callbacks(mut self, callbacks: AttributeCallbackRegistry) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Object classes that mark an entry as a group.
    pub fn with_group_object_classes(mut self, classes: Vec<String>) -> Self {
        self.group_classes = classes;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<LdapConnectionFactory> {
        &self.pool
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    async fn fetch_page(
        &self,
        ldap: Ldap,
        request: &SearchRequest,
        filter: &str,
        page_size: u32,
        server_cookie: Vec<u8>,
    ) -> DirectoryResult<SearchPage> {
        let mut ldap = ldap;
        let handle = ldap.clone();
        let control = PagedResults {
            size: i32::try_from(page_size).unwrap_or(i32::MAX),
            cookie: server_cookie,
        };
        let SearchResult(raw, result) = ldap
            .with_controls(control)
            .with_timeout(self.read_timeout)
            .search(
                &request.base_dn,
                to_scope(request.scope),
                filter,
                request.attributes.clone(),
            )
            .await
            .map_err(|e| map_ldap_error(e, &request.base_dn))?;

        let size_limit_exceeded = match result.rc {
            RC_SUCCESS => false,
            RC_SIZE_LIMIT_EXCEEDED => true,
            rc => return Err(map_result_code(rc, &result.text, &request.base_dn)),
        };

        let next = result
            .ctrls
            .iter()
            .find_map(|ctrl| match ctrl {
                Control(Some(ControlType::PagedResults), raw) => {
                    Some(raw.parse::<PagedResults>().cookie)
                }
                _ => None,
            })
            .unwrap_or_default();

        let entries: Vec<DirectoryEntry> = raw
            .into_iter()
            .map(|e| to_directory_entry(e, &self.group_classes))
            .collect();

        let cookie = if next.is_empty() || size_limit_exceeded {
            Vec::new()
        } else {
            let cursor = self.cursors.lock().pin(handle);
            wrap_cookie(cursor, &next)
        };

        debug!(
            entries = entries.len(),
            more = !cookie.is_empty(),
            size_limit_exceeded,
            "LDAP page fetched"
        );

        Ok(SearchPage {
            entries,
            cookie,
            size_limit_exceeded,
        })
    }

    async fn send_modify(&self, dn: &str, changes: &Modifications) -> DirectoryResult<()> {
        let timeout = self.read_timeout;
        self.pool
            .execute("modify", move |mut ldap| async move {
                let result = ldap
                    .with_timeout(timeout)
                    .modify(dn, to_mods(changes))
                    .await
                    .map_err(|e| map_ldap_error(e, dn))?;
                check(result, dn)
            })
            .await
    }
}

#[async_trait]
impl PagedSearchSource for LdapDirectory {
    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: u32,
        cookie: &[u8],
    ) -> DirectoryResult<SearchPage> {
        request.filter.validate()?;
        let filter = request.filter.to_ldap();

        if cookie.is_empty() {
            let filter = filter.as_str();
            return self
                .pool
                .execute("paged search", move |ldap| async move {
                    self.fetch_page(ldap, request, filter, page_size, Vec::new())
                        .await
                })
                .await;
        }

        let (cursor, server_cookie) = unwrap_cookie(cookie)?;
        let pinned = self.cursors.lock().take(cursor);
        // An evicted cursor is re-opened by the caller like a dropped connection.
        let ldap = pinned.ok_or_else(|| {
            DirectoryError::server_down("paged search cursor is no longer open")
        })?;
        self.fetch_page(ldap, request, &filter, page_size, server_cookie.to_vec())
            .await
    }

    async fn abandon(&self, request: &SearchRequest, cookie: &[u8]) -> DirectoryResult<()> {
        let (cursor, server_cookie) = unwrap_cookie(cookie)?;
        let Some(mut ldap) = self.cursors.lock().take(cursor) else {
            return Ok(());
        };
        let control = PagedResults {
            size: 0,
            cookie: server_cookie.to_vec(),
        };
        let SearchResult(_, result) = ldap
            .with_controls(control)
            .with_timeout(self.read_timeout)
            .search(
                &request.base_dn,
                to_scope(request.scope),
                &request.filter.to_ldap(),
                vec!["1.1"],
            )
            .await
            .map_err(|e| map_ldap_error(e, &request.base_dn))?;
        debug!(rc = result.rc, "paged search cursor abandoned");
        Ok(())
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    #[instrument(skip(self, request), fields(base = %request.base_dn))]
    async fn search(&self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>> {
        let params = PagedSearchParams::new(request.clone(), self.page_size);
        let outcome = paged_search(self, &params).await?;
        if outcome.size_limit_exceeded {
            return Err(DirectoryError::SizeLimitExceeded {
                returned: outcome.entries.len(),
            });
        }
        Ok(outcome.entries)
    }

    async fn get_entry(
        &self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let timeout = self.read_timeout;
        let group_classes = self.group_classes.as_slice();
        self.pool
            .execute("get entry", move |mut ldap| async move {
                let SearchResult(raw, result) = ldap
                    .with_timeout(timeout)
                    .search(dn, Scope::Base, "(objectClass=*)", attributes.to_vec())
                    .await
                    .map_err(|e| map_ldap_error(e, dn))?;
                match result.rc {
                    RC_SUCCESS => Ok(raw
                        .into_iter()
                        .next()
                        .map(|e| to_directory_entry(e, group_classes))),
                    RC_NO_SUCH_OBJECT => Ok(None),
                    rc => Err(map_result_code(rc, &result.text, dn)),
                }
            })
            .await
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    async fn modify(&self, dn: &str, changes: &Modifications) -> DirectoryResult<()> {
        let changes = if self.callbacks.is_empty() {
            changes.clone()
        } else {
            let current = self.get_entry(dn, &[]).await?;
            let ctx = CallbackContext {
                dn,
                current: current.as_ref(),
            };
            self.callbacks.apply(changes, &ctx)?
        };

        match self.send_modify(dn, &changes).await {
            Err(e) if e.result_code() == Some(RC_NO_SUCH_ATTRIBUTE) => {
                let current = self.get_entry(dn, &[]).await?.ok_or_else(|| {
                    DirectoryError::ObjectNotFound {
                        identifier: dn.to_string(),
                    }
                })?;
                let pruned = prune_absent_deletes(&changes, &current);
                if pruned == changes {
                    return Err(e);
                }
                warn!(dn = %dn, "retrying modify without deletes of absent values");
                if pruned.is_empty() {
                    return Ok(());
                }
                self.send_modify(dn, &pruned).await
            }
            other => other,
        }
    }

    async fn compare(&self, dn: &str, attribute: &str, value: &str) -> DirectoryResult<bool> {
        let timeout = self.read_timeout;
        self.pool
            .execute("compare", move |mut ldap| async move {
                let result = ldap
                    .with_timeout(timeout)
                    .compare(dn, attribute, value)
                    .await
                    .map_err(|e| map_ldap_error(e, dn))?
                    .0;
                match result.rc {
                    RC_COMPARE_TRUE => Ok(true),
                    RC_COMPARE_FALSE => Ok(false),
                    rc => Err(map_result_code(rc, &result.text, dn)),
                }
            })
            .await
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let timeout = self.read_timeout;
        self.pool
            .execute("delete", move |mut ldap| async move {
                let result = ldap
                    .with_timeout(timeout)
                    .delete(dn)
                    .await
                    .map_err(|e| map_ldap_error(e, dn))?;
                check(result, dn)
            })
            .await
    }

    #[instrument(skip(self, entry), fields(dn = %entry.id))]
    async fn create_entry(&self, entry: &DirectoryEntry) -> DirectoryResult<()> {
        let entry = self.callbacks.apply_to_new(entry)?;
        let dn = entry.id.as_str();
        let attributes: Vec<(String, HashSet<String>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
            .collect();
        let attributes = &attributes;
        let timeout = self.read_timeout;
        self.pool
            .execute("add", move |mut ldap| async move {
                let result = ldap
                    .with_timeout(timeout)
                    .add(dn, attributes.clone())
                    .await
                    .map_err(|e| map_ldap_error(e, dn))?;
                check(result, dn)
            })
            .await
    }

    async fn rename_entry(&self, old_dn: &str, new_dn: &str) -> DirectoryResult<()> {
        let (new_rdn, new_parent) = split_dn(new_dn);
        let (_, old_parent) = split_dn(old_dn);
        let new_superior = match (new_parent, old_parent) {
            (Some(new), Some(old)) if new.eq_ignore_ascii_case(old) => None,
            (parent, _) => parent,
        };
        let timeout = self.read_timeout;
        self.pool
            .execute("modify dn", move |mut ldap| async move {
                let result = ldap
                    .with_timeout(timeout)
                    .modifydn(old_dn, new_rdn, true, new_superior)
                    .await
                    .map_err(|e| map_ldap_error(e, old_dn))?;
                check(result, old_dn)
            })
            .await
    }

    async fn count_entries(&self, request: &SearchRequest) -> DirectoryResult<usize> {
        let request = request.clone().with_attributes(vec!["1.1".into()]);
        let params = PagedSearchParams::new(request, self.page_size);
        let outcome = paged_search(self, &params).await?;
        Ok(outcome.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galsync_directory::entry::{AttributeChange, AttributeSet};

    #[test]
    fn test_cookie_wraps_cursor_id() {
        let cookie = wrap_cookie(7, b"server");
        let (cursor, server) = unwrap_cookie(&cookie).unwrap();
        assert_eq!(cursor, 7);
        assert_eq!(server, b"server");
        assert!(unwrap_cookie(&[0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_to_mods() {
        let changes = vec![
            AttributeChange::add("mail", vec!["a@example.com".into()]),
            AttributeChange::replace("cn", vec!["Ada".into()]),
            AttributeChange::delete("description", vec![]),
        ];
        let mods = to_mods(&changes);
        assert_eq!(mods.len(), 3);
        assert!(matches!(&mods[0], Mod::Add(a, v) if a == "mail" && v.contains("a@example.com")));
        assert!(matches!(&mods[1], Mod::Replace(a, _) if a == "cn"));
        assert!(matches!(&mods[2], Mod::Delete(a, v) if a == "description" && v.is_empty()));
    }

    #[test]
    fn test_prune_absent_deletes() {
        let current = DirectoryEntry::new(
            "uid=ada,dc=example",
            AttributeSet::new()
                .with("cn", "Ada")
                .with_values("mail", ["ada@example.com", "al@example.com"]),
        );
        let changes = vec![
            AttributeChange::delete("description", vec![]),
            AttributeChange::delete(
                "mail",
                vec!["al@example.com".into(), "gone@example.com".into()],
            ),
            AttributeChange::replace("cn", vec!["Ada L".into()]),
        ];
        let pruned = prune_absent_deletes(&changes, &current);
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].values, vec!["al@example.com".to_string()]);
        assert_eq!(pruned[1].kind, ModificationKind::Replace);
    }

    #[test]
    fn test_scope_mapping() {
        assert!(matches!(to_scope(SearchScope::Base), Scope::Base));
        assert!(matches!(to_scope(SearchScope::OneLevel), Scope::OneLevel));
        assert!(matches!(to_scope(SearchScope::Subtree), Scope::Subtree));
    }
}
