//! GAL queries against directory sources
//!
//! Query rewriting, sync filters and one paged pass over a source with its
//! token cursor.

use tracing::{debug, instrument};

use galsync_directory::entry::DirectoryEntry;
use galsync_directory::filter::{Filter, QueryPattern};
use galsync_directory::paged::{paged_search, PagedSearchParams, ResumeState};
use galsync_directory::traits::{PagedSearchSource, SearchRequest};

use crate::domain::GalSourceConfig;
use crate::error::GalResult;
use crate::request::GalSearchType;
use crate::token::LdapCursor;

/// Rewrite a search query.
///
/// With `wildcard` the query becomes a substring match. `.` `*` and an empty
/// query match everything.
pub fn search_pattern(query: Option<&str>, wildcard: bool) -> QueryPattern {
    let query = query.map(str::trim).unwrap_or_default();
    if query.is_empty() || query == "." || query == "*" {
        return QueryPattern::parse("*");
    }
    if wildcard {
        QueryPattern::parse(&format!("*{}*", query.trim_matches('*')))
    } else {
        QueryPattern::parse(query)
    }
}

/// Query for a replica search.
///
/// Replica folders are searched with the query as given, matched as a prefix
/// the way contact searches match.
pub fn contact_pattern(query: Option<&str>) -> QueryPattern {
    let query = query.map(str::trim).unwrap_or_default();
    if query.is_empty() || query == "." {
        return QueryPattern::parse("*");
    }
    QueryPattern::parse(&format!("{}*", query.trim_end_matches('*')))
}

/// Rewrite an autocomplete query into a prefix match.
pub fn autocomplete_pattern(query: Option<&str>) -> QueryPattern {
    let query = query.map(str::trim).unwrap_or_default();
    let prefix = query.trim_end_matches('*');
    if prefix.is_empty() || prefix == "." {
        return QueryPattern::parse("*");
    }
    QueryPattern::parse(&format!("{prefix}*"))
}

/// Type filter AND-ed with the query across the source's searchable attributes.
pub fn query_filter(
    source: &GalSourceConfig,
    search_type: GalSearchType,
    pattern: &QueryPattern,
) -> Filter {
    let type_filter = source.type_filter(search_type);
    match source.query_filter(pattern) {
        Some(query) => Filter::and(vec![type_filter, query]),
        None => type_filter,
    }
}

/// Filter for one sync pass over a source.
///
/// A finished cursor asks for entries changed since `max_mod_ts`. A cursor in
/// the middle of a pass keeps that clause and restarts the result stream at
/// its create-timestamp marker.
pub fn sync_filter(
    source: &GalSourceConfig,
    search_type: GalSearchType,
    cursor: Option<&LdapCursor>,
) -> Filter {
    let mut filter = source.type_filter(search_type);
    let Some(cursor) = cursor else {
        return filter;
    };
    if let Some(max_mod_ts) = &cursor.max_mod_ts {
        filter = filter.and_also(Filter::or(vec![
            Filter::ge(source.modify_attribute(), max_mod_ts.as_str()),
            Filter::ge(source.create_attribute(), max_mod_ts.as_str()),
        ]));
    }
    if cursor.has_more {
        if let Some(create_ts) = &cursor.create_ts {
            filter = filter.and_also(Filter::ge(source.create_attribute(), create_ts.as_str()));
        }
    }
    filter
}

/// Newest create or modify timestamp among `entries`.
pub fn newest_timestamp(source: &GalSourceConfig, entries: &[DirectoryEntry]) -> Option<String> {
    entries
        .iter()
        .flat_map(|entry| {
            let modified = entry.first_of(&source.modify_attributes);
            let created = entry.first_of(&source.marker_attributes);
            modified.into_iter().chain(created)
        })
        .max()
        .map(str::to_string)
}

/// One pass over a source.
#[derive(Debug, Clone, Default)]
pub struct SourcePass {
    pub entries: Vec<DirectoryEntry>,
    pub cursor: LdapCursor,
    pub has_more: bool,
    pub size_limit_exceeded: bool,
}

/// Search a source once, resuming from `cursor`.
///
/// `limit` of 0 is unlimited. The cursor's change high-water mark moves only
/// when the pass completes, so entries changed while a pass is in progress
/// are seen by the next one.
#[instrument(
    skip(directory, source, filter, cursor),
    fields(base = %source.base_dn, resuming = cursor.is_some_and(|c| c.has_more))
)]
pub async fn run_pass(
    directory: &dyn PagedSearchSource,
    source: &GalSourceConfig,
    filter: Filter,
    limit: u32,
    cursor: Option<&LdapCursor>,
    page_size: Option<u32>,
) -> GalResult<SourcePass> {
    let resume = match cursor {
        Some(c) if c.has_more => ResumeState {
            marker: c.create_ts.clone(),
            match_count: c.match_count,
            has_more: true,
        },
        _ => ResumeState::default(),
    };
    let request = SearchRequest::new(source.base_dn.clone(), filter);
    let params = PagedSearchParams::new(request, page_size.unwrap_or(source.page_size))
        .with_limit(limit)
        .with_resume(resume)
        .with_marker_attributes(source.marker_attributes.clone());

    let outcome = paged_search(directory, &params).await?;

    let prior_mod_ts = cursor.and_then(|c| c.max_mod_ts.clone());
    // A pass can finish on a call that delivers nothing; the resume marker
    // still holds the newest create timestamp delivered earlier in the pass.
    let max_mod_ts = if outcome.has_more {
        prior_mod_ts
    } else {
        [
            prior_mod_ts,
            newest_timestamp(source, &outcome.entries),
            outcome.resume.marker.clone(),
        ]
        .into_iter()
        .flatten()
        .max()
    };
    let next = LdapCursor {
        create_ts: outcome.resume.marker.clone(),
        match_count: outcome.resume.match_count,
        has_more: outcome.has_more,
        max_mod_ts,
    };
    debug!(
        delivered = outcome.entries.len(),
        has_more = outcome.has_more,
        size_limit_exceeded = outcome.size_limit_exceeded,
        "source pass finished"
    );

    Ok(SourcePass {
        entries: outcome.entries,
        cursor: next,
        has_more: outcome.has_more,
        size_limit_exceeded: outcome.size_limit_exceeded,
    })
}
