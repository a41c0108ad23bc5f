//! Paged directory search
//!
//! Drives a server-side paged-results cursor up to an overall limit and
//! produces a resume marker that survives ties on the marker timestamp.
//!
//! A resumed pass re-runs a search whose result stream starts at the marker
//! timestamp. `match_count` entries of that stream were already delivered, so
//! the pass skips whole pages first (the server cursor cannot seek) and then
//! the remainder of the first kept page.
//!
//! A continuation page that fails with server down is fetched once more by
//! re-opening the search and walking it back to the same page. A call that
//! stops with a live cookie abandons the server cursor.

use tracing::{debug, instrument, warn};

use crate::entry::DirectoryEntry;
use crate::error::{DirectoryError, DirectoryResult};
use crate::resilience::{execute_with_one_retry, Attempt};
use crate::traits::{PagedSearchSource, SearchPage, SearchRequest};

/// Upper bound on pages fetched by one call.
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Resume state of one paged pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    /// Timestamp of the last delivered entry.
    pub marker: Option<String>,
    /// Delivered entries sharing `marker`.
    pub match_count: u32,
    /// The pass stopped early and must be resumed.
    pub has_more: bool,
}

/// Parameters for one paged search call.
#[derive(Debug, Clone)]
pub struct PagedSearchParams {
    pub request: SearchRequest,
    pub page_size: u32,
    /// Overall limit across pages; 0 means unlimited.
    pub limit: u32,
    pub resume: ResumeState,
    /// Attributes read, in order, to get an entry's marker timestamp.
    pub marker_attributes: Vec<String>,
    pub max_pages: u32,
}

impl PagedSearchParams {
    pub fn new(request: SearchRequest, page_size: u32) -> Self {
        Self {
            request,
            page_size,
            limit: 0,
            resume: ResumeState::default(),
            marker_attributes: vec!["whenCreated".into(), "createTimestamp".into()],
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_resume(mut self, resume: ResumeState) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_marker_attributes(mut self, attributes: Vec<String>) -> Self {
        self.marker_attributes = attributes;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Result of one paged search call.
#[derive(Debug, Clone, Default)]
pub struct PagedSearchOutcome {
    pub entries: Vec<DirectoryEntry>,
    pub resume: ResumeState,
    pub has_more: bool,
    /// The server returned SIZE_LIMIT_EXCEEDED; `entries` holds the partial set.
    pub size_limit_exceeded: bool,
    pub pages_fetched: u32,
}

/// Run one paged search against `source`.
#[instrument(
    skip(source, params),
    fields(
        base = %params.request.base_dn,
        page_size = params.page_size,
        limit = params.limit,
        resuming = params.resume.has_more,
    )
)]
pub async fn paged_search(
    source: &dyn PagedSearchSource,
    params: &PagedSearchParams,
) -> DirectoryResult<PagedSearchOutcome> {
    if params.page_size == 0 {
        return Err(DirectoryError::invalid_configuration(
            "page size must be greater than zero",
        ));
    }
    let page_size = params.page_size as usize;
    let resuming = params.resume.has_more;
    let offset = if resuming {
        params.resume.match_count as usize
    } else {
        0
    };
    let mut prev_marker = if resuming {
        params.resume.marker.clone()
    } else {
        None
    };
    let skip_pages = offset / page_size;
    let mut page_offset = offset % page_size;
    let mut remaining = if params.limit == 0 {
        usize::MAX
    } else {
        params.limit as usize
    };

    let mut tie_count = offset;
    let mut last_delivered: Option<String> = None;
    let mut entries = Vec::new();
    let mut cookie: Vec<u8> = Vec::new();
    let mut has_more = false;
    let mut size_limit_exceeded = false;
    let mut current_page = 0usize;
    let mut pages_fetched = 0u32;

    loop {
        if pages_fetched >= params.max_pages {
            warn!(
                pages = pages_fetched,
                "paged search stopped at page bound, server keeps returning a cookie"
            );
            has_more = true;
            break;
        }
        let page = if cookie.is_empty() {
            source
                .search_page(&params.request, params.page_size, &cookie)
                .await?
        } else {
            let continuation = cookie.as_slice();
            execute_with_one_retry("paged search continuation", |attempt| async move {
                match attempt {
                    Attempt::Checkout => {
                        source
                            .search_page(&params.request, params.page_size, continuation)
                            .await
                    }
                    Attempt::Retry => reopen_at(source, params, current_page).await,
                }
            })
            .await?
        };
        pages_fetched += 1;

        let page_len = page.entries.len();
        let window = remaining.saturating_add(page_offset);
        let page_has_more = page_len > window;

        if current_page >= skip_pages {
            let window_end = window.min(page_len);
            let boundary = window_end
                .checked_sub(1)
                .and_then(|i| page.entries.get(i))
                .and_then(|e| e.first_of(&params.marker_attributes))
                .map(str::to_string);

            // Directory contents shifted under the marker; stale tie state is dropped.
            if prev_marker.is_some() && prev_marker != boundary {
                tie_count = 0;
            }

            for entry in page.entries.into_iter().skip(page_offset) {
                if remaining == 0 {
                    break;
                }
                remaining -= 1;
                let ts = entry.first_of(&params.marker_attributes).map(str::to_string);
                if ts.is_some() && ts == boundary {
                    tie_count += 1;
                }
                if ts.is_some() {
                    last_delivered = ts;
                }
                entries.push(entry);
            }
            prev_marker = boundary;
            page_offset = 0;
        }

        cookie = page.cookie;

        if page.size_limit_exceeded {
            warn!(
                delivered = entries.len(),
                "directory size limit exceeded, returning partial results"
            );
            size_limit_exceeded = true;
            has_more = true;
            break;
        }
        if remaining == 0 {
            has_more = !cookie.is_empty() || page_has_more;
            break;
        }
        if cookie.is_empty() {
            break;
        }
        current_page += 1;
    }

    if !cookie.is_empty() {
        if let Err(e) = source.abandon(&params.request, &cookie).await {
            warn!(error = %e, "failed to abandon paged search cursor");
        }
    }

    let delivered_any = !entries.is_empty();
    let resume = if has_more && delivered_any {
        ResumeState {
            marker: prev_marker.or(last_delivered),
            match_count: u32::try_from(tie_count).unwrap_or(u32::MAX),
            has_more: true,
        }
    } else if has_more {
        ResumeState {
            has_more: true,
            ..params.resume.clone()
        }
    } else {
        ResumeState {
            marker: last_delivered.or_else(|| params.resume.marker.clone()),
            match_count: 0,
            has_more: false,
        }
    };

    debug!(
        delivered = entries.len(),
        pages = pages_fetched,
        has_more,
        marker = ?resume.marker,
        match_count = resume.match_count,
        "paged search finished"
    );

    Ok(PagedSearchOutcome {
        entries,
        resume,
        has_more,
        size_limit_exceeded,
        pages_fetched,
    })
}

/// Re-open a search whose server cursor was lost and walk it to page `index`.
async fn reopen_at(
    source: &dyn PagedSearchSource,
    params: &PagedSearchParams,
    index: usize,
) -> DirectoryResult<SearchPage> {
    let mut page = source
        .search_page(&params.request, params.page_size, &[])
        .await?;
    for _ in 0..index {
        if page.cookie.is_empty() {
            // The result stream shrank below the page that was lost.
            return Ok(SearchPage::default());
        }
        let cookie = std::mem::take(&mut page.cookie);
        page = source
            .search_page(&params.request, params.page_size, &cookie)
            .await?;
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AttributeSet;
    use crate::filter::Filter;
    use crate::memory::MemoryDirectory;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn entry(id: &str, ts: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            format!("uid={id},ou=people,dc=example"),
            AttributeSet::new()
                .with("uid", id)
                .with("objectClass", "person")
                .with("createTimestamp", ts),
        )
    }

    fn directory(timestamps: &[&str]) -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        for (i, ts) in timestamps.iter().enumerate() {
            dir.insert(entry(&format!("e{}", i + 1), ts));
        }
        dir
    }

    fn request_for(resume: &ResumeState) -> SearchRequest {
        let filter = match (&resume.marker, resume.has_more) {
            (Some(marker), true) => Filter::ge("createTimestamp", marker.clone()),
            _ => Filter::present("objectClass"),
        };
        SearchRequest::new("ou=people,dc=example", filter)
    }

    fn uids(outcome: &PagedSearchOutcome) -> Vec<String> {
        outcome
            .entries
            .iter()
            .filter_map(|e| e.attributes.first("uid").map(str::to_string))
            .collect()
    }

    // =========================================================================
    // Tie handling
    // =========================================================================

    #[tokio::test]
    async fn test_resume_past_tied_marker() {
        let dir = directory(&["05", "05", "05", "07"]);

        let first = PagedSearchParams::new(request_for(&ResumeState::default()), 2).with_limit(3);
        let out1 = paged_search(&dir, &first).await.unwrap();
        assert_eq!(uids(&out1), vec!["e1", "e2", "e3"]);
        assert!(out1.has_more);
        assert_eq!(out1.resume.marker.as_deref(), Some("05"));
        assert_eq!(out1.resume.match_count, 3);

        let second = PagedSearchParams::new(request_for(&out1.resume), 2)
            .with_limit(3)
            .with_resume(out1.resume.clone());
        let out2 = paged_search(&dir, &second).await.unwrap();
        assert_eq!(uids(&out2), vec!["e4"]);
        assert!(!out2.has_more);
        assert_eq!(out2.resume.match_count, 0);
    }

    #[tokio::test]
    async fn test_tie_count_accumulates_across_calls_with_same_marker() {
        let dir = directory(&["01"; 7]);
        let mut resume = ResumeState::default();
        let mut seen = Vec::new();
        for _ in 0..10 {
            let params = PagedSearchParams::new(request_for(&resume), 2)
                .with_limit(3)
                .with_resume(resume.clone());
            let out = paged_search(&dir, &params).await.unwrap();
            seen.extend(uids(&out));
            resume = out.resume;
            if !out.has_more {
                break;
            }
        }
        assert_eq!(seen, vec!["e1", "e2", "e3", "e4", "e5", "e6", "e7"]);
    }

    #[tokio::test]
    async fn test_mismatched_marker_resets_tie_count() {
        let dir = directory(&["05", "07", "07", "07"]);
        // Stale state: claims one entry at "06" was delivered.
        let resume = ResumeState {
            marker: Some("06".into()),
            match_count: 1,
            has_more: true,
        };
        let params = PagedSearchParams::new(request_for(&resume), 2)
            .with_limit(1)
            .with_resume(resume);
        let out = paged_search(&dir, &params).await.unwrap();
        // Stream under (createTimestamp>=06) is [e2, e3, e4]; the stale
        // offset skips e2 and the counter restarts at the new marker.
        assert_eq!(uids(&out), vec!["e3"]);
        assert!(out.has_more);
        assert_eq!(out.resume.marker.as_deref(), Some("07"));
        assert_eq!(out.resume.match_count, 1);
    }

    // =========================================================================
    // Limits and termination
    // =========================================================================

    #[tokio::test]
    async fn test_unlimited_runs_until_cookie_exhausted() {
        let dir = directory(&["01", "02", "03", "04", "05"]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2);
        let out = paged_search(&dir, &params).await.unwrap();
        assert_eq!(out.entries.len(), 5);
        assert_eq!(out.pages_fetched, 3);
        assert!(!out.has_more);
        assert_eq!(out.resume.marker.as_deref(), Some("05"));
    }

    #[tokio::test]
    async fn test_limit_on_page_boundary_with_more_pages() {
        let dir = directory(&["01", "02", "03", "04"]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2).with_limit(2);
        let out = paged_search(&dir, &params).await.unwrap();
        assert_eq!(uids(&out), vec!["e1", "e2"]);
        assert!(out.has_more);
        assert_eq!(out.resume.match_count, 1);
    }

    #[tokio::test]
    async fn test_limit_equal_to_result_size_has_no_more() {
        let dir = directory(&["01", "02"]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 5).with_limit(2);
        let out = paged_search(&dir, &params).await.unwrap();
        assert_eq!(out.entries.len(), 2);
        assert!(!out.has_more);
    }

    #[tokio::test]
    async fn test_size_limit_exceeded_returns_partial_entries() {
        let dir = directory(&["01", "02", "03", "04", "05"]);
        dir.set_size_limit(Some(3));
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2).with_limit(10);
        let out = paged_search(&dir, &params).await.unwrap();
        assert_eq!(uids(&out), vec!["e1", "e2", "e3"]);
        assert!(out.size_limit_exceeded);
        assert!(out.has_more);
        assert_eq!(out.resume.marker.as_deref(), Some("03"));
        assert_eq!(out.resume.match_count, 1);
    }

    #[tokio::test]
    async fn test_page_bound_stops_runaway_cookie() {
        let dir = directory(&["01", "02", "03", "04", "05"]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 1)
            .with_max_pages(2);
        let out = paged_search(&dir, &params).await.unwrap();
        assert_eq!(out.pages_fetched, 2);
        assert!(out.has_more);
        assert_eq!(out.resume.marker.as_deref(), Some("02"));
    }

    #[tokio::test]
    async fn test_zero_page_size_is_configuration_error() {
        let dir = directory(&[]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 0);
        let err = paged_search(&dir, &params).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = directory(&[]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 3).with_limit(3);
        let out = paged_search(&dir, &params).await.unwrap();
        assert!(out.entries.is_empty());
        assert!(!out.has_more);
        assert_eq!(out.resume, ResumeState::default());
    }

    // =========================================================================
    // Cursor lifecycle
    // =========================================================================

    /// Takes the directory down once, on the first continuation page.
    struct DropsFirstContinuation {
        inner: MemoryDirectory,
        outages: u32,
        dropped: AtomicBool,
    }

    #[async_trait]
    impl PagedSearchSource for DropsFirstContinuation {
        async fn search_page(
            &self,
            request: &SearchRequest,
            page_size: u32,
            cookie: &[u8],
        ) -> DirectoryResult<SearchPage> {
            if !cookie.is_empty() && !self.dropped.swap(true, Ordering::SeqCst) {
                self.inner.fail_next_with_server_down(self.outages);
            }
            self.inner.search_page(request, page_size, cookie).await
        }
    }

    #[tokio::test]
    async fn test_lost_continuation_reopens_search_at_same_page() {
        let source = DropsFirstContinuation {
            inner: directory(&["01", "02", "03", "04", "05"]),
            outages: 1,
            dropped: AtomicBool::new(false),
        };
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2);
        let out = paged_search(&source, &params).await.unwrap();
        assert_eq!(uids(&out), vec!["e1", "e2", "e3", "e4", "e5"]);
        assert!(!out.has_more);
        assert_eq!(out.resume.marker.as_deref(), Some("05"));
    }

    #[tokio::test]
    async fn test_continuation_still_down_after_reopen_is_an_error() {
        let source = DropsFirstContinuation {
            inner: directory(&["01", "02", "03", "04", "05"]),
            outages: 2,
            dropped: AtomicBool::new(false),
        };
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2);
        let err = paged_search(&source, &params).await.unwrap_err();
        assert!(err.is_server_down());
    }

    #[tokio::test]
    async fn test_stopping_at_limit_abandons_cursor() {
        let dir = directory(&["01", "02", "03", "04", "05"]);
        let params = PagedSearchParams::new(request_for(&ResumeState::default()), 2).with_limit(3);
        let out = paged_search(&dir, &params).await.unwrap();
        assert!(out.has_more);
        assert_eq!(dir.open_cursors(), 0);

        let unlimited = PagedSearchParams::new(request_for(&ResumeState::default()), 2);
        paged_search(&dir, &unlimited).await.unwrap();
        assert_eq!(dir.open_cursors(), 0);
    }

    // =========================================================================
    // Tie-break fuzzing
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_resumed_passes_deliver_each_entry_once(
            mut stamps in proptest::collection::vec(0u8..6, 0..24),
            page_size in 1u32..5,
            limit in 1u32..6,
        ) {
            stamps.sort_unstable();
            let labels: Vec<String> = stamps.iter().map(|s| format!("{s:02}")).collect();
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let dir = directory(&refs);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let seen = runtime.block_on(async {
                let mut resume = ResumeState::default();
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let params = PagedSearchParams::new(request_for(&resume), page_size)
                        .with_limit(limit)
                        .with_resume(resume.clone());
                    let out = paged_search(&dir, &params).await.unwrap();
                    seen.extend(uids(&out));
                    resume = out.resume;
                    if !out.has_more {
                        break;
                    }
                }
                seen
            });

            let expected: Vec<String> = (1..=labels.len()).map(|i| format!("e{i}")).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
