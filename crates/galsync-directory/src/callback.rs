//! Attribute callbacks
//!
//! A registry mapping attribute names to pure functions that validate and may
//! rewrite a proposed change before it is sent to the directory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entry::{AttributeChange, DirectoryEntry, ModificationKind, Modifications};
use crate::error::{DirectoryError, DirectoryResult};

/// What a callback can see about the entry being changed.
#[derive(Debug, Clone, Copy)]
pub struct CallbackContext<'a> {
    pub dn: &'a str,
    /// Current state of the entry; `None` while creating it.
    pub current: Option<&'a DirectoryEntry>,
}

/// Validate `(old values, proposed change, context)` and return the change to apply.
pub type AttributeCallback = Arc<
    dyn Fn(Option<&[String]>, &AttributeChange, &CallbackContext<'_>) -> Result<AttributeChange, String>
        + Send
        + Sync,
>;

/// Attribute name to callback registry. Names match case-insensitively.
#[derive(Clone, Default)]
pub struct AttributeCallbackRegistry {
    callbacks: HashMap<String, AttributeCallback>,
}

impl std::fmt::Debug for AttributeCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeCallbackRegistry")
            .field("attributes", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AttributeCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `attribute`, replacing any previous one.
    pub fn register<F>(&mut self, attribute: &str, callback: F)
    where
        F: Fn(Option<&[String]>, &AttributeChange, &CallbackContext<'_>) -> Result<AttributeChange, String>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks
            .insert(attribute.to_ascii_lowercase(), Arc::new(callback));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, attribute: &str, callback: F) -> Self
    where
        F: Fn(Option<&[String]>, &AttributeChange, &CallbackContext<'_>) -> Result<AttributeChange, String>
            + Send
            + Sync
            + 'static,
    {
        self.register(attribute, callback);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Run every change through its attribute's callback.
    pub fn apply(
        &self,
        changes: &Modifications,
        ctx: &CallbackContext<'_>,
    ) -> DirectoryResult<Modifications> {
        changes
            .iter()
            .map(|change| {
                let Some(callback) = self.callbacks.get(&change.attribute.to_ascii_lowercase())
                else {
                    return Ok(change.clone());
                };
                let old = ctx.current.and_then(|e| e.attributes.get(&change.attribute));
                callback(old, change, ctx).map_err(|message| DirectoryError::AttributeRejected {
                    attribute: change.attribute.clone(),
                    message,
                })
            })
            .collect()
    }

    /// Run the attributes of a new entry through the registry as Add changes.
    pub fn apply_to_new(&self, entry: &DirectoryEntry) -> DirectoryResult<DirectoryEntry> {
        if self.is_empty() {
            return Ok(entry.clone());
        }
        let changes: Modifications = entry
            .attributes
            .iter()
            .map(|(name, values)| AttributeChange::add(name.clone(), values.clone()))
            .collect();
        let ctx = CallbackContext {
            dn: &entry.id,
            current: None,
        };
        let rewritten = self.apply(&changes, &ctx)?;
        let mut out = entry.clone();
        for change in rewritten {
            out.attributes.set(change.attribute, change.values);
        }
        Ok(out)
    }
}

/// Lower-case and trim every value, for address-like attributes.
pub fn normalize_lowercase(
    _old: Option<&[String]>,
    change: &AttributeChange,
    _ctx: &CallbackContext<'_>,
) -> Result<AttributeChange, String> {
    let mut change = change.clone();
    change.values = change
        .values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .collect();
    Ok(change)
}

/// Reject changes that would leave the attribute with more than one value.
pub fn single_valued(
    old: Option<&[String]>,
    change: &AttributeChange,
    _ctx: &CallbackContext<'_>,
) -> Result<AttributeChange, String> {
    let resulting = match change.kind {
        ModificationKind::Replace => change.values.len(),
        ModificationKind::Add => old.map_or(0, <[String]>::len) + change.values.len(),
        ModificationKind::Delete => 0,
    };
    if resulting > 1 {
        return Err("attribute is single-valued".to_string());
    }
    Ok(change.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AttributeSet;

    fn entry() -> DirectoryEntry {
        DirectoryEntry::new(
            "uid=ada,dc=example",
            AttributeSet::new().with("displayName", "Ada"),
        )
    }

    #[test]
    fn test_unregistered_attributes_pass_through() {
        let registry = AttributeCallbackRegistry::new().with("mail", normalize_lowercase);
        let current = entry();
        let ctx = CallbackContext {
            dn: &current.id,
            current: Some(&current),
        };
        let changes = vec![AttributeChange::replace("cn", vec![" Ada ".into()])];
        assert_eq!(registry.apply(&changes, &ctx).unwrap(), changes);
    }

    #[test]
    fn test_rewrite_by_attribute_name_ignoring_case() {
        let registry = AttributeCallbackRegistry::new().with("Mail", normalize_lowercase);
        let ctx = CallbackContext {
            dn: "uid=ada,dc=example",
            current: None,
        };
        let out = registry
            .apply(
                &vec![AttributeChange::add("mail", vec![" Ada@Example.COM ".into()])],
                &ctx,
            )
            .unwrap();
        assert_eq!(out[0].values, vec!["ada@example.com".to_string()]);
    }

    #[test]
    fn test_callback_sees_old_values_and_rejects() {
        let registry = AttributeCallbackRegistry::new().with("displayName", single_valued);
        let current = entry();
        let ctx = CallbackContext {
            dn: &current.id,
            current: Some(&current),
        };
        let err = registry
            .apply(
                &vec![AttributeChange::add("displayName", vec!["Countess".into()])],
                &ctx,
            )
            .unwrap_err();
        assert!(matches!(err, DirectoryError::AttributeRejected { ref attribute, .. } if attribute == "displayName"));
        assert!(registry
            .apply(
                &vec![AttributeChange::replace("displayName", vec!["Countess".into()])],
                &ctx,
            )
            .is_ok());
    }

    #[test]
    fn test_apply_to_new_entry() {
        let registry = AttributeCallbackRegistry::new().with("mail", normalize_lowercase);
        let new = DirectoryEntry::new(
            "uid=bob,dc=example",
            AttributeSet::new().with("mail", "BOB@example.com"),
        );
        let out = registry.apply_to_new(&new).unwrap();
        assert_eq!(out.attributes.first("mail"), Some("bob@example.com"));
    }
}
