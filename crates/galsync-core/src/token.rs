//! Sync token codec
//!
//! Wire format: `<composite>[:<replicaId>:<changeId>]*`.
//!
//! The composite holds one `createTs_matchCount_hasMore_maxModTs` group per
//! active directory source, so it has 0, 4 or 8 underscore-separated fields.
//! A single field is a legacy bare timestamp.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{GalError, GalResult};

/// Resume cursor of one directory source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LdapCursor {
    /// Create timestamp of the last delivered entry.
    pub create_ts: Option<String>,
    /// Delivered entries sharing `create_ts`.
    pub match_count: u32,
    /// The pass over this source is not finished.
    pub has_more: bool,
    /// Change-detection high-water mark.
    pub max_mod_ts: Option<String>,
}

impl LdapCursor {
    /// Cursor decoded from a legacy bare timestamp.
    pub fn from_timestamp(ts: impl Into<String>) -> Self {
        Self {
            max_mod_ts: Some(ts.into()),
            ..Self::default()
        }
    }

    fn sort_key(&self) -> (Option<&str>, Option<&str>, u32, bool) {
        (
            self.create_ts.as_deref(),
            self.max_mod_ts.as_deref(),
            self.match_count,
            self.has_more,
        )
    }

    /// The more conservative of two cursors.
    pub fn earlier(a: &Self, b: &Self) -> Self {
        match a.sort_key().cmp(&b.sort_key()) {
            Ordering::Greater => b.clone(),
            _ => a.clone(),
        }
    }

    fn encode_into(&self, out: &mut String) {
        out.push_str(self.create_ts.as_deref().unwrap_or_default());
        out.push('_');
        out.push_str(&self.match_count.to_string());
        out.push('_');
        out.push(if self.has_more { '1' } else { '0' });
        out.push('_');
        out.push_str(self.max_mod_ts.as_deref().unwrap_or_default());
    }

    fn decode(fields: &[&str]) -> GalResult<Self> {
        let [create_ts, match_count, has_more, max_mod_ts] = fields else {
            return Err(GalError::invalid_token("cursor group must have four fields"));
        };
        let match_count = match_count.parse::<u32>().map_err(|_| {
            GalError::invalid_token(format!("match count '{match_count}' is not a number"))
        })?;
        let has_more = match *has_more {
            "1" => true,
            "0" => false,
            other => {
                return Err(GalError::invalid_token(format!(
                    "has-more flag must be 0 or 1, got '{other}'"
                )))
            }
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(Self {
            create_ts: non_empty(*create_ts),
            match_count,
            has_more,
            max_mod_ts: non_empty(*max_mod_ts),
        })
    }
}

/// Resumable cursor handed to sync clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncToken {
    /// Cursor of the first searched source.
    pub primary: Option<LdapCursor>,
    /// Cursor of the external source in dual-source mode.
    pub secondary: Option<LdapCursor>,
    /// Change sequence reached per replica account.
    pub change_ids: BTreeMap<String, i64>,
}

impl SyncToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an optional client token; absent or empty is a fresh token.
    pub fn parse(raw: Option<&str>) -> GalResult<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(raw) => Self::decode(raw),
        }
    }

    pub fn decode(raw: &str) -> GalResult<Self> {
        let mut parts = raw.split(':');
        let composite = parts.next().unwrap_or_default();
        let mut token = Self::decode_composite(composite)?;

        loop {
            let Some(replica) = parts.next() else { break };
            // a trailing replica id without a change id is ignored
            let Some(change_id) = parts.next() else { break };
            let change_id = change_id.parse::<i64>().map_err(|_| {
                GalError::invalid_token(format!(
                    "change id '{change_id}' for replica '{replica}' is not a number"
                ))
            })?;
            token.change_ids.insert(replica.to_string(), change_id);
        }
        Ok(token)
    }

    fn decode_composite(composite: &str) -> GalResult<Self> {
        if composite.is_empty() {
            return Ok(Self::default());
        }
        let fields: Vec<&str> = composite.split('_').collect();
        let (primary, secondary) = match fields.len() {
            1 => (Some(LdapCursor::from_timestamp(composite)), None),
            4 => (Some(LdapCursor::decode(&fields)?), None),
            8 => (
                Some(LdapCursor::decode(&fields[..4])?),
                Some(LdapCursor::decode(&fields[4..])?),
            ),
            n => {
                return Err(GalError::invalid_token(format!(
                    "composite timestamp has {n} fields, expected 0, 4 or 8"
                )))
            }
        };
        Ok(Self {
            primary,
            secondary,
            change_ids: BTreeMap::new(),
        })
    }

    /// Encode the composite part only.
    pub fn encode_composite(&self) -> String {
        let mut out = String::new();
        match (&self.primary, &self.secondary) {
            (None, None) => {}
            (Some(primary), None) => primary.encode_into(&mut out),
            (primary, Some(secondary)) => {
                primary.clone().unwrap_or_default().encode_into(&mut out);
                out.push('_');
                secondary.encode_into(&mut out);
            }
        }
        out
    }

    pub fn encode(&self) -> String {
        let mut out = self.encode_composite();
        for (replica, change_id) in &self.change_ids {
            out.push(':');
            out.push_str(replica);
            out.push(':');
            out.push_str(&change_id.to_string());
        }
        out
    }

    /// Combine two tokens without skipping or going backwards.
    ///
    /// Cursors take the earlier value per source; an absent cursor is the
    /// earliest possible one. Change ids take the larger value per replica.
    pub fn merge(&self, other: &Self) -> Self {
        let earlier = |a: &Option<LdapCursor>, b: &Option<LdapCursor>| match (a, b) {
            (Some(a), Some(b)) => Some(LdapCursor::earlier(a, b)),
            _ => None,
        };
        let mut change_ids = self.change_ids.clone();
        for (replica, change_id) in &other.change_ids {
            change_ids
                .entry(replica.clone())
                .and_modify(|current| *current = (*current).max(*change_id))
                .or_insert(*change_id);
        }
        Self {
            primary: earlier(&self.primary, &other.primary),
            secondary: earlier(&self.secondary, &other.secondary),
            change_ids,
        }
    }

    /// There is replica-sync history to continue.
    pub fn do_mailbox_sync(&self) -> bool {
        self.has_empty_composite() || !self.change_ids.is_empty()
    }

    pub fn has_empty_composite(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }

    pub fn change_id(&self, replica: &str) -> Option<i64> {
        self.change_ids.get(replica).copied()
    }

    pub fn with_change_id(mut self, replica: impl Into<String>, change_id: i64) -> Self {
        self.change_ids.insert(replica.into(), change_id);
        self
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SyncToken {
    type Err = GalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cursor(create: &str, count: u32, more: bool, modified: &str) -> LdapCursor {
        LdapCursor {
            create_ts: (!create.is_empty()).then(|| create.to_string()),
            match_count: count,
            has_more: more,
            max_mod_ts: (!modified.is_empty()).then(|| modified.to_string()),
        }
    }

    #[test]
    fn test_decode_dual_source_with_replicas() {
        let token = SyncToken::decode(
            "20240101000000Z_3_1_20231231000000Z_20240102000000Z_0_0_20240102000000Z:acct-1:42:acct-2:7",
        )
        .unwrap();
        assert_eq!(
            token.primary,
            Some(cursor("20240101000000Z", 3, true, "20231231000000Z"))
        );
        assert_eq!(
            token.secondary,
            Some(cursor("20240102000000Z", 0, false, "20240102000000Z"))
        );
        assert_eq!(token.change_id("acct-1"), Some(42));
        assert_eq!(token.change_id("acct-2"), Some(7));
        assert!(token.do_mailbox_sync());
    }

    #[test]
    fn test_decode_legacy_bare_timestamp() {
        let token = SyncToken::decode("20240101000000Z").unwrap();
        assert_eq!(token.primary, Some(LdapCursor::from_timestamp("20240101000000Z")));
        assert!(token.secondary.is_none());
        assert!(!token.do_mailbox_sync());
        assert_eq!(token.encode(), "_0_0_20240101000000Z");
    }

    #[test]
    fn test_empty_and_replica_only_tokens() {
        let empty = SyncToken::decode("").unwrap();
        assert_eq!(empty, SyncToken::default());
        assert!(empty.do_mailbox_sync());
        assert_eq!(SyncToken::parse(None).unwrap(), SyncToken::default());

        let replica_only = SyncToken::decode(":acct-1:100").unwrap();
        assert!(replica_only.has_empty_composite());
        assert_eq!(replica_only.change_id("acct-1"), Some(100));
        assert_eq!(replica_only.encode(), ":acct-1:100");
    }

    #[test]
    fn test_dangling_replica_id_is_ignored() {
        let token = SyncToken::decode("_0_0_:acct-1:5:acct-2").unwrap();
        assert_eq!(token.change_ids.len(), 1);
        assert_eq!(token.change_id("acct-1"), Some(5));
    }

    #[test]
    fn test_malformed_tokens_are_rejected() {
        for raw in [
            "a_b",
            "a_1_0_b_c",
            "ts_x_0_ts",
            "ts_1_2_ts",
            "_0_0_:acct-1:not-a-number",
        ] {
            let err = SyncToken::decode(raw).unwrap_err();
            assert!(matches!(err, GalError::InvalidToken { .. }), "{raw}");
        }
    }

    #[test]
    fn test_secondary_without_primary_encodes_empty_primary() {
        let token = SyncToken {
            primary: None,
            secondary: Some(cursor("b", 1, true, "c")),
            change_ids: BTreeMap::new(),
        };
        assert_eq!(token.encode(), "_0_0__b_1_1_c");
    }

    #[test]
    fn test_merge_takes_earlier_cursor_and_larger_change_id() {
        let a = SyncToken {
            primary: Some(cursor("20240101", 2, true, "20240105")),
            secondary: Some(cursor("20240110", 0, false, "20240110")),
            change_ids: BTreeMap::from([("r1".to_string(), 10), ("r2".to_string(), 3)]),
        };
        let b = SyncToken {
            primary: Some(cursor("20240102", 0, false, "20240102")),
            secondary: None,
            change_ids: BTreeMap::from([("r1".to_string(), 4), ("r3".to_string(), 9)]),
        };
        let merged = a.merge(&b);
        assert_eq!(merged.primary, a.primary);
        assert_eq!(merged.secondary, None);
        assert_eq!(merged.change_id("r1"), Some(10));
        assert_eq!(merged.change_id("r2"), Some(3));
        assert_eq!(merged.change_id("r3"), Some(9));
    }

    fn arb_ts() -> impl Strategy<Value = Option<String>> {
        prop::option::of("20[0-9]{2}0[1-9][0-2][0-9]0000Z")
    }

    fn arb_cursor() -> impl Strategy<Value = LdapCursor> {
        (arb_ts(), 0u32..50, any::<bool>(), arb_ts()).prop_map(
            |(create_ts, match_count, has_more, max_mod_ts)| LdapCursor {
                create_ts,
                match_count,
                has_more,
                max_mod_ts,
            },
        )
    }

    fn arb_token() -> impl Strategy<Value = SyncToken> {
        (
            prop::option::of((arb_cursor(), prop::option::of(arb_cursor()))),
            prop::collection::btree_map("[a-z0-9-]{1,12}", 0i64..1_000_000, 0..4),
        )
            .prop_map(|(cursors, change_ids)| {
                let (primary, secondary) = match cursors {
                    Some((primary, secondary)) => (Some(primary), secondary),
                    None => (None, None),
                };
                SyncToken {
                    primary,
                    secondary,
                    change_ids,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_commutative(a in arb_token(), b in arb_token()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn prop_merge_is_idempotent(a in arb_token(), b in arb_token()) {
            let ab = a.merge(&b);
            prop_assert_eq!(a.merge(&ab), ab.clone());
            prop_assert_eq!(ab.merge(&ab), ab);
        }

        #[test]
        fn prop_decode_inverts_encode(t in arb_token()) {
            prop_assert_eq!(SyncToken::decode(&t.encode()).unwrap(), t);
        }
    }
}
