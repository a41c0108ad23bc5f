//! In-memory directory
//!
//! A [`Directory`] and [`PagedSearchSource`] over a vector of entries kept in
//! creation order. Paged searches hold a server-side cursor per cookie the way
//! an LDAP server does, and a server-wide size limit plus server-down failures
//! can be injected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::callback::{AttributeCallbackRegistry, CallbackContext};
use crate::entry::{DirectoryEntry, ModificationKind, Modifications};
use crate::error::{DirectoryError, DirectoryResult};
use crate::traits::{split_dn, Directory, PagedSearchSource, SearchPage, SearchRequest, SearchScope};

#[derive(Default)]
struct Cursor {
    matches: Vec<DirectoryEntry>,
    position: usize,
}

#[derive(Default)]
struct State {
    entries: Vec<DirectoryEntry>,
    cursors: HashMap<Vec<u8>, Cursor>,
    next_cursor: u64,
    size_limit: Option<usize>,
    fail_next: u32,
    page_requests: u64,
}

/// In-memory directory with paged-results support.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
    callbacks: Arc<AttributeCallbackRegistry>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run modifications through `callbacks` before applying them.
    pub fn with_callbacks(mut self, callbacks: AttributeCallbackRegistry) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// Append an entry, replacing any entry with the same DN in place.
    pub fn insert(&self, entry: DirectoryEntry) {
        let mut state = self.state.lock();
        match state
            .entries
            .iter_mut()
            .find(|e| e.id.eq_ignore_ascii_case(&entry.id))
        {
            Some(existing) => *existing = entry,
            None => state.entries.push(entry),
        }
    }

    /// Server-wide size limit applied to each search.
    pub fn set_size_limit(&self, limit: Option<usize>) {
        self.state.lock().size_limit = limit;
    }

    /// Fail the next `count` operations with a server-down error.
    pub fn fail_next_with_server_down(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Number of paged search requests served.
    pub fn page_requests(&self) -> u64 {
        self.state.lock().page_requests
    }

    /// Paged cursors still held for outstanding cookies.
    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_down(state: &mut State) -> DirectoryResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            state.cursors.clear();
            return Err(DirectoryError::server_down("memory directory is down"));
        }
        Ok(())
    }

    fn matching(state: &State, request: &SearchRequest) -> Vec<DirectoryEntry> {
        state
            .entries
            .iter()
            .filter(|e| in_scope(&e.id, &request.base_dn, request.scope))
            .filter(|e| request.filter.matches(e))
            .map(|e| {
                let mut e = e.clone();
                e.attributes.retain_named(&request.attributes);
                e
            })
            .collect()
    }

    fn position_of(state: &State, dn: &str) -> DirectoryResult<usize> {
        state
            .entries
            .iter()
            .position(|e| e.id.eq_ignore_ascii_case(dn))
            .ok_or_else(|| DirectoryError::ObjectNotFound {
                identifier: dn.to_string(),
            })
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let dn = dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    match scope {
        SearchScope::Base => dn == base,
        SearchScope::OneLevel => split_dn(&dn).1 == Some(base.as_str()),
        SearchScope::Subtree => {
            base.is_empty() || dn == base || dn.ends_with(&format!(",{base}"))
        }
    }
}

#[async_trait]
impl PagedSearchSource for MemoryDirectory {
    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: u32,
        cookie: &[u8],
    ) -> DirectoryResult<SearchPage> {
        request.filter.validate()?;
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        state.page_requests += 1;

        let mut cursor = if cookie.is_empty() {
            Cursor {
                matches: Self::matching(&state, request),
                position: 0,
            }
        } else {
            state.cursors.remove(cookie).ok_or_else(|| {
                DirectoryError::operation_failed_with_code("unknown paged results cookie", 53)
            })?
        };

        let mut take = page_size as usize;
        let mut size_limit_exceeded = false;
        if let Some(limit) = state.size_limit {
            let allowed = limit.saturating_sub(cursor.position);
            if take >= allowed && cursor.matches.len() > limit {
                take = allowed;
                size_limit_exceeded = true;
            }
        }

        let end = (cursor.position + take).min(cursor.matches.len());
        let entries = cursor.matches[cursor.position..end].to_vec();
        cursor.position = end;

        let cookie = if size_limit_exceeded || cursor.position >= cursor.matches.len() {
            Vec::new()
        } else {
            state.next_cursor += 1;
            let id = state.next_cursor.to_be_bytes().to_vec();
            state.cursors.insert(id.clone(), cursor);
            id
        };

        Ok(SearchPage {
            entries,
            cookie,
            size_limit_exceeded,
        })
    }

    async fn abandon(&self, _request: &SearchRequest, cookie: &[u8]) -> DirectoryResult<()> {
        self.state.lock().cursors.remove(cookie);
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn search(&self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>> {
        request.filter.validate()?;
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        let matches = Self::matching(&state, request);
        match state.size_limit {
            Some(limit) if matches.len() > limit => Err(DirectoryError::SizeLimitExceeded {
                returned: limit,
            }),
            _ => Ok(matches),
        }
    }

    async fn get_entry(
        &self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        Ok(state
            .entries
            .iter()
            .find(|e| e.id.eq_ignore_ascii_case(dn))
            .map(|e| {
                let mut e = e.clone();
                e.attributes.retain_named(attributes);
                e
            }))
    }

    async fn modify(&self, dn: &str, changes: &Modifications) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        let idx = Self::position_of(&state, dn)?;
        let ctx = CallbackContext {
            dn,
            current: state.entries.get(idx),
        };
        let changes = self.callbacks.apply(changes, &ctx)?;
        let Some(entry) = state.entries.get_mut(idx) else {
            return Err(DirectoryError::ObjectNotFound {
                identifier: dn.to_string(),
            });
        };
        for change in &changes {
            match change.kind {
                ModificationKind::Replace => {
                    if change.values.is_empty() {
                        entry.attributes.remove(&change.attribute);
                    } else {
                        entry.attributes.set(&change.attribute, change.values.clone());
                    }
                }
                ModificationKind::Add => {
                    for v in &change.values {
                        entry.attributes.add_value(&change.attribute, v.clone());
                    }
                }
                ModificationKind::Delete => {
                    if !entry.attributes.has(&change.attribute) {
                        return Err(DirectoryError::operation_failed_with_code(
                            format!("no such attribute: {}", change.attribute),
                            16,
                        ));
                    }
                    if change.values.is_empty() {
                        entry.attributes.remove(&change.attribute);
                    } else {
                        let kept: Vec<String> = entry
                            .attributes
                            .get(&change.attribute)
                            .unwrap_or_default()
                            .iter()
                            .filter(|v| !change.values.iter().any(|d| d.eq_ignore_ascii_case(v)))
                            .cloned()
                            .collect();
                        if kept.is_empty() {
                            entry.attributes.remove(&change.attribute);
                        } else {
                            entry.attributes.set(&change.attribute, kept);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn compare(&self, dn: &str, attribute: &str, value: &str) -> DirectoryResult<bool> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        let idx = Self::position_of(&state, dn)?;
        Ok(state.entries[idx]
            .attributes
            .get(attribute)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value))))
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        let idx = Self::position_of(&state, dn)?;
        state.entries.remove(idx);
        Ok(())
    }

    async fn create_entry(&self, entry: &DirectoryEntry) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        if Self::position_of(&state, &entry.id).is_ok() {
            return Err(DirectoryError::ObjectAlreadyExists {
                identifier: entry.id.clone(),
            });
        }
        state.entries.push(entry.clone());
        Ok(())
    }

    async fn rename_entry(&self, old_dn: &str, new_dn: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        if Self::position_of(&state, new_dn).is_ok() {
            return Err(DirectoryError::ObjectAlreadyExists {
                identifier: new_dn.to_string(),
            });
        }
        let idx = Self::position_of(&state, old_dn)?;
        state.entries[idx].id = new_dn.to_string();
        Ok(())
    }

    async fn count_entries(&self, request: &SearchRequest) -> DirectoryResult<usize> {
        request.filter.validate()?;
        let mut state = self.state.lock();
        Self::check_down(&mut state)?;
        Ok(Self::matching(&state, request).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AttributeChange, AttributeSet};
    use crate::filter::Filter;

    fn person(uid: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            format!("uid={uid},ou=people,dc=example"),
            AttributeSet::new()
                .with("uid", uid)
                .with("objectClass", "person")
                .with("mail", format!("{uid}@example.com")),
        )
    }

    fn all_people() -> SearchRequest {
        SearchRequest::new("ou=people,dc=example", Filter::present("objectClass"))
    }

    #[tokio::test]
    async fn test_paged_cookie_walks_all_entries() {
        let dir = MemoryDirectory::new();
        for uid in ["a", "b", "c"] {
            dir.insert(person(uid));
        }
        let first = dir.search_page(&all_people(), 2, &[]).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(!first.cookie.is_empty());
        let second = dir.search_page(&all_people(), 2, &first.cookie).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.cookie.is_empty());
        // Cookies are single-use.
        assert!(dir.search_page(&all_people(), 2, &first.cookie).await.is_err());
    }

    #[tokio::test]
    async fn test_scope_handling() {
        let dir = MemoryDirectory::new();
        dir.insert(person("a"));
        dir.insert(DirectoryEntry::new(
            "ou=people,dc=example",
            AttributeSet::new().with("objectClass", "organizationalUnit"),
        ));
        let one = all_people().with_scope(SearchScope::OneLevel);
        assert_eq!(dir.search(&one).await.unwrap().len(), 1);
        let sub = all_people();
        assert_eq!(dir.search(&sub).await.unwrap().len(), 2);
        let base = all_people().with_scope(SearchScope::Base);
        assert_eq!(dir.search(&base).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_down_injection() {
        let dir = MemoryDirectory::new();
        dir.insert(person("a"));
        dir.fail_next_with_server_down(1);
        assert!(dir.search(&all_people()).await.unwrap_err().is_server_down());
        assert_eq!(dir.search(&all_people()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_modify_and_compare() {
        let dir = MemoryDirectory::new();
        dir.insert(person("a"));
        let dn = "uid=a,ou=people,dc=example";
        dir.modify(
            dn,
            &vec![
                AttributeChange::replace("mail", vec!["alice@example.com".into()]),
                AttributeChange::add("cn", vec!["Alice".into()]),
            ],
        )
        .await
        .unwrap();
        assert!(dir.compare(dn, "mail", "ALICE@example.com").await.unwrap());
        assert!(dir.compare(dn, "cn", "Alice").await.unwrap());

        let err = dir
            .modify(dn, &vec![AttributeChange::delete("telephoneNumber", vec![])])
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(16));
    }

    #[tokio::test]
    async fn test_create_rename_delete() {
        let dir = MemoryDirectory::new();
        dir.create_entry(&person("a")).await.unwrap();
        assert!(matches!(
            dir.create_entry(&person("a")).await,
            Err(DirectoryError::ObjectAlreadyExists { .. })
        ));
        dir.rename_entry("uid=a,ou=people,dc=example", "uid=z,ou=people,dc=example")
            .await
            .unwrap();
        assert!(dir
            .get_entry("uid=z,ou=people,dc=example", &[])
            .await
            .unwrap()
            .is_some());
        dir.delete("uid=z,ou=people,dc=example").await.unwrap();
        assert!(dir.is_empty());
        assert!(matches!(
            dir.delete("uid=z,ou=people,dc=example").await,
            Err(DirectoryError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_paged_search_size_limit() {
        let dir = MemoryDirectory::new();
        for uid in ["a", "b", "c"] {
            dir.insert(person(uid));
        }
        dir.set_size_limit(Some(2));
        assert!(matches!(
            dir.search(&all_people()).await,
            Err(DirectoryError::SizeLimitExceeded { returned: 2 })
        ));
        assert_eq!(dir.count_entries(&all_people()).await.unwrap(), 3);
    }
}
