//! ldap3 result mapping
//!
//! Converts ldap3 errors, result codes and entries into directory types.

use ldap3::result::LdapError;
use ldap3::{ResultEntry, SearchEntry};

use galsync_directory::entry::{AttributeSet, DirectoryEntry};
use galsync_directory::error::DirectoryError;

pub(crate) const RC_SUCCESS: u32 = 0;
pub(crate) const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
pub(crate) const RC_COMPARE_FALSE: u32 = 5;
pub(crate) const RC_COMPARE_TRUE: u32 = 6;
pub(crate) const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
pub(crate) const RC_NO_SUCH_OBJECT: u32 = 32;

/// Map a non-success LDAP result code.
pub(crate) fn map_result_code(rc: u32, text: &str, target: &str) -> DirectoryError {
    match rc {
        RC_NO_SUCH_OBJECT => DirectoryError::ObjectNotFound {
            identifier: target.to_string(),
        },
        49 => DirectoryError::AuthenticationFailed,
        68 => DirectoryError::ObjectAlreadyExists {
            identifier: target.to_string(),
        },
        // busy, unavailable, other, server down, client timeout
        51 | 52 | 80 | 81 | 85 => {
            DirectoryError::server_down(format!("{target}: rc={rc} {text}"))
        }
        _ => DirectoryError::operation_failed_with_code(format!("{target}: rc={rc} {text}"), rc),
    }
}

/// Map an ldap3 error; transport failures become server down.
pub(crate) fn map_ldap_error(err: LdapError, target: &str) -> DirectoryError {
    match err {
        LdapError::LdapResult { result } => map_result_code(result.rc, &result.text, target),
        e @ (LdapError::Io { .. }
        | LdapError::EndOfStream
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. }
        | LdapError::Timeout { .. }) => {
            DirectoryError::server_down_with_source(format!("{target}: connection lost"), e)
        }
        other => DirectoryError::operation_failed_with_source(target.to_string(), other),
    }
}

/// Convert an ldap3 search result entry.
pub(crate) fn to_directory_entry(raw: ResultEntry, group_classes: &[String]) -> DirectoryEntry {
    let entry = SearchEntry::construct(raw);
    let is_group = entry
        .attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("objectClass"))
        .is_some_and(|(_, classes)| {
            classes
                .iter()
                .any(|c| group_classes.iter().any(|g| g.eq_ignore_ascii_case(c)))
        });
    let attributes: AttributeSet = entry.attrs.into_iter().collect();
    DirectoryEntry::new(entry.dn, attributes).with_group(is_group)
}
