//! Fuzz target for query rewriting and filter rendering.
//!
//! User queries flow into LDAP filters; rendering must escape every special
//! character and the in-memory evaluator must accept whatever was built.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_query_filter -- -max_total_time=600

#![no_main]

use galsync_core::gal_search::{
    autocomplete_pattern, contact_pattern, query_filter, search_pattern,
};
use galsync_core::{GalSearchType, GalSourceConfig};
use galsync_directory::entry::{AttributeSet, DirectoryEntry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(query) = std::str::from_utf8(data) else {
        return;
    };
    let source = GalSourceConfig::new("ou=people,dc=example,dc=com");
    let entry = DirectoryEntry::new(
        "uid=ada,ou=people,dc=example,dc=com",
        AttributeSet::new()
            .with("objectClass", "inetOrgPerson")
            .with("cn", query),
    );

    for pattern in [
        search_pattern(Some(query), true),
        search_pattern(Some(query), false),
        contact_pattern(Some(query)),
        autocomplete_pattern(Some(query)),
    ] {
        let filter = query_filter(&source, GalSearchType::All, &pattern);
        assert!(filter.validate().is_ok());

        let rendered = filter.to_ldap();
        assert!(rendered.starts_with('(') && rendered.ends_with(')'));
        // Parentheses from the query are always escaped
        let opens = rendered.matches('(').count();
        let closes = rendered.matches(')').count();
        assert_eq!(opens, closes);

        let _ = filter.matches(&entry);
    }
});
