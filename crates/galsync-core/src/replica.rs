//! Replica reader
//!
//! Incremental batches from a mailbox that caches the GAL. Every item and
//! tombstone carries a modification sequence from one monotonic counter per
//! mailbox; a sync token stores the sequence the client has reached.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use galsync_directory::entry::DirectoryEntry;
use galsync_directory::filter::Filter;

use crate::error::GalResult;

/// An item reference returned by a change listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedItem {
    pub item_id: String,
    pub folder: String,
    /// Modification sequence of the item's last change.
    pub sequence: i64,
}

/// Deletions recorded since a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneLog {
    /// Tombstones at or below this sequence have been purged.
    pub floor: i64,
    /// `(item id, sequence)` in sequence order.
    pub deleted: Vec<(String, i64)>,
}

/// Read access to a replica mailbox.
#[async_trait]
pub trait ReplicaMailbox: Send + Sync {
    /// Items in `folders` changed after `sequence`, in sequence order.
    async fn changed_since(
        &self,
        folders: &[String],
        sequence: i64,
        limit: usize,
    ) -> GalResult<Vec<ChangedItem>>;

    /// `None` when the item was deleted after it was listed.
    async fn fetch(&self, item_id: &str) -> GalResult<Option<DirectoryEntry>>;

    async fn tombstones_since(&self, folders: &[String], sequence: i64) -> GalResult<TombstoneLog>;

    /// Items in `folders` changed after `sequence`.
    async fn count_changed_since(&self, folders: &[String], sequence: i64) -> GalResult<usize>;

    /// Contact search over `folders`, returning `(item id, entry)`.
    async fn search(
        &self,
        folders: &[String],
        filter: Option<&Filter>,
        limit: usize,
    ) -> GalResult<Vec<(String, DirectoryEntry)>>;
}

/// Folder to read and the filter its items must pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderScope {
    pub folder: String,
    pub filter: Option<Filter>,
}

impl FolderScope {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }
}

/// Parameters of one batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub change_id: i64,
    pub folders: Vec<FolderScope>,
    /// 0 is unlimited.
    pub limit: usize,
    pub id_only: bool,
    pub want_remaining: bool,
}

/// One delivered batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaBatch {
    pub entries: Vec<DirectoryEntry>,
    pub new_change_id: i64,
    pub has_more: bool,
    /// Deleted record ids, `<account>:<item>`.
    pub deleted_ids: Vec<String>,
    pub remaining: Option<usize>,
}

/// Result of a batch read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Delivered(ReplicaBatch),
    /// The tombstone log no longer reaches back to the requested sequence.
    MustResync { floor: i64 },
}

/// Record id handed to clients.
pub fn record_id(account_id: &str, item_id: &str) -> String {
    format!("{account_id}:{item_id}")
}

/// Reads incremental batches from one replica account.
pub struct ReplicaReader {
    account_id: String,
    mailbox: Arc<dyn ReplicaMailbox>,
}

impl std::fmt::Debug for ReplicaReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaReader")
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl ReplicaReader {
    pub fn new(account_id: impl Into<String>, mailbox: Arc<dyn ReplicaMailbox>) -> Self {
        Self {
            account_id: account_id.into(),
            mailbox,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[instrument(
        skip(self, request),
        fields(account = %self.account_id, change_id = request.change_id, limit = request.limit)
    )]
    pub async fn sync_batch(&self, request: &BatchRequest) -> GalResult<BatchOutcome> {
        let folders: Vec<String> = request.folders.iter().map(|f| f.folder.clone()).collect();

        let tombstones = if request.change_id > 0 {
            let log = self
                .mailbox
                .tombstones_since(&folders, request.change_id)
                .await?;
            if request.change_id < log.floor {
                warn!(
                    floor = log.floor,
                    "tombstone history does not cover the requested change id"
                );
                return Ok(BatchOutcome::MustResync { floor: log.floor });
            }
            Some(log)
        } else {
            None
        };

        let fetch_limit = match request.limit {
            0 => usize::MAX,
            n => n.saturating_add(1),
        };
        let mut changed = self
            .mailbox
            .changed_since(&folders, request.change_id, fetch_limit)
            .await?;
        let has_more = request.limit > 0 && changed.len() > request.limit;
        if has_more {
            changed.truncate(request.limit);
        }

        let mut new_change_id = request.change_id;
        let mut entries = Vec::with_capacity(changed.len());
        for item in &changed {
            new_change_id = new_change_id.max(item.sequence);
            let Some(mut entry) = self.mailbox.fetch(&item.item_id).await? else {
                warn!(item = %item.item_id, "item deleted during sync, skipping");
                continue;
            };
            let passes = request
                .folders
                .iter()
                .find(|f| f.folder == item.folder)
                .and_then(|f| f.filter.as_ref())
                .map_or(true, |filter| filter.matches(&entry));
            if !passes {
                continue;
            }
            entry.id = record_id(&self.account_id, &item.item_id);
            entries.push(if request.id_only {
                entry.id_only()
            } else {
                entry
            });
        }

        let mut deleted_ids = Vec::new();
        if let Some(log) = tombstones {
            for (item_id, sequence) in log.deleted {
                if sequence <= request.change_id || (has_more && sequence > new_change_id) {
                    continue;
                }
                if !has_more {
                    new_change_id = new_change_id.max(sequence);
                }
                deleted_ids.push(record_id(&self.account_id, &item_id));
            }
        }

        // An unlimited batch delivers everything, so nothing remains.
        let remaining = match (request.want_remaining, request.limit) {
            (false, _) => None,
            (true, 0) => Some(0),
            (true, limit) => {
                let total = self
                    .mailbox
                    .count_changed_since(&folders, request.change_id)
                    .await?;
                Some(total.saturating_sub(limit))
            }
        };

        debug!(
            delivered = entries.len(),
            deleted = deleted_ids.len(),
            new_change_id,
            has_more,
            "replica batch read"
        );

        Ok(BatchOutcome::Delivered(ReplicaBatch {
            entries,
            new_change_id,
            has_more,
            deleted_ids,
            remaining,
        }))
    }

    /// Contact search across the given folders.
    pub async fn search(
        &self,
        folders: &[FolderScope],
        filter: Option<&Filter>,
        limit: usize,
        id_only: bool,
    ) -> GalResult<(Vec<DirectoryEntry>, bool)> {
        let names: Vec<String> = folders.iter().map(|f| f.folder.clone()).collect();
        let fetch_limit = match limit {
            0 => usize::MAX,
            n => n.saturating_add(1),
        };
        let found = self.mailbox.search(&names, filter, fetch_limit).await?;
        let has_more = limit > 0 && found.len() > limit;
        let entries = found
            .into_iter()
            .take(if limit == 0 { usize::MAX } else { limit })
            .map(|(item_id, mut entry)| {
                entry.id = record_id(&self.account_id, &item_id);
                if id_only {
                    entry.id_only()
                } else {
                    entry
                }
            })
            .collect();
        Ok((entries, has_more))
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    folder: String,
    sequence: i64,
    entry: DirectoryEntry,
}

#[derive(Debug, Default)]
struct MailboxState {
    sequence: i64,
    items: BTreeMap<String, StoredItem>,
    tombstones: Vec<(String, String, i64)>,
    floor: i64,
    vanishing: HashSet<String>,
}

/// In-memory replica mailbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryReplica {
    state: Arc<Mutex<MailboxState>>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update an item; returns its new sequence.
    pub fn upsert(&self, folder: &str, item_id: &str, entry: DirectoryEntry) -> i64 {
        let mut state = self.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        state.items.insert(
            item_id.to_string(),
            StoredItem {
                folder: folder.to_string(),
                sequence,
                entry,
            },
        );
        sequence
    }

    /// Delete an item and record a tombstone.
    pub fn remove(&self, item_id: &str) -> Option<i64> {
        let mut state = self.state.lock();
        let item = state.items.remove(item_id)?;
        state.sequence += 1;
        let sequence = state.sequence;
        state
            .tombstones
            .push((item.folder, item_id.to_string(), sequence));
        Some(sequence)
    }

    /// Drop tombstones at or below `sequence`.
    pub fn purge_tombstones_through(&self, sequence: i64) {
        let mut state = self.state.lock();
        state.tombstones.retain(|(_, _, s)| *s > sequence);
        state.floor = state.floor.max(sequence);
    }

    /// Advance the sequence counter without changing items.
    pub fn advance_sequence_to(&self, sequence: i64) {
        let mut state = self.state.lock();
        state.sequence = state.sequence.max(sequence);
    }

    /// Make the next fetch of `item_id` miss, as if deleted after listing.
    pub fn vanish_on_fetch(&self, item_id: &str) {
        self.state.lock().vanishing.insert(item_id.to_string());
    }

    pub fn last_sequence(&self) -> i64 {
        self.state.lock().sequence
    }
}

#[async_trait]
impl ReplicaMailbox for MemoryReplica {
    async fn changed_since(
        &self,
        folders: &[String],
        sequence: i64,
        limit: usize,
    ) -> GalResult<Vec<ChangedItem>> {
        let state = self.state.lock();
        let mut changed: Vec<ChangedItem> = state
            .items
            .iter()
            .filter(|(_, item)| item.sequence > sequence && folders.contains(&item.folder))
            .map(|(id, item)| ChangedItem {
                item_id: id.clone(),
                folder: item.folder.clone(),
                sequence: item.sequence,
            })
            .collect();
        changed.sort_by_key(|c| c.sequence);
        changed.truncate(limit);
        Ok(changed)
    }

    async fn fetch(&self, item_id: &str) -> GalResult<Option<DirectoryEntry>> {
        let mut state = self.state.lock();
        if state.vanishing.remove(item_id) {
            return Ok(None);
        }
        Ok(state.items.get(item_id).map(|item| item.entry.clone()))
    }

    async fn tombstones_since(&self, folders: &[String], sequence: i64) -> GalResult<TombstoneLog> {
        let state = self.state.lock();
        Ok(TombstoneLog {
            floor: state.floor,
            deleted: state
                .tombstones
                .iter()
                .filter(|(folder, _, s)| *s > sequence && folders.contains(folder))
                .map(|(_, id, s)| (id.clone(), *s))
                .collect(),
        })
    }

    async fn count_changed_since(&self, folders: &[String], sequence: i64) -> GalResult<usize> {
        let state = self.state.lock();
        Ok(state
            .items
            .values()
            .filter(|item| item.sequence > sequence && folders.contains(&item.folder))
            .count())
    }

    async fn search(
        &self,
        folders: &[String],
        filter: Option<&Filter>,
        limit: usize,
    ) -> GalResult<Vec<(String, DirectoryEntry)>> {
        let state = self.state.lock();
        Ok(state
            .items
            .iter()
            .filter(|(_, item)| folders.contains(&item.folder))
            .filter(|(_, item)| filter.map_or(true, |f| f.matches(&item.entry)))
            .take(limit)
            .map(|(id, item)| (id.clone(), item.entry.clone()))
            .collect())
    }
}
