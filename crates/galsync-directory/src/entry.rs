//! Directory entry types
//!
//! Entries, multi-valued attribute sets and attribute modifications shared by
//! the LDAP path and the replica path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named multi-valued attributes.
///
/// Attribute names keep the case they were written with; lookups ignore
/// ASCII case the way LDAP attribute descriptions do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: BTreeMap<String, Vec<String>>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    fn key_for(&self, name: &str) -> Option<&String> {
        self.attributes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
    }

    /// Replace all values of an attribute.
    pub fn set(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        if let Some(existing) = self.key_for(&name).cloned() {
            self.attributes.remove(&existing);
        }
        self.attributes.insert(name, values);
    }

    /// Set a single-valued attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, vec![value.into()]);
        self
    }

    /// Set a multi-valued attribute using builder pattern.
    pub fn with_values<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Append one value to an attribute, creating it when absent.
    pub fn add_value(&mut self, name: &str, value: impl Into<String>) {
        match self.key_for(name).cloned() {
            Some(key) => {
                if let Some(values) = self.attributes.get_mut(&key) {
                    values.push(value.into());
                }
            }
            None => {
                self.attributes.insert(name.to_string(), vec![value.into()]);
            }
        }
    }

    /// Get all values of an attribute.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.key_for(name)
            .and_then(|k| self.attributes.get(k))
            .map(Vec::as_slice)
    }

    /// Get the first value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Check if an attribute exists with at least one value.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let key = self.key_for(name).cloned()?;
        self.attributes.remove(&key)
    }

    /// Get all attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.attributes.iter()
    }

    /// Keep only the named attributes. An empty list keeps everything.
    pub fn retain_named(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.attributes
            .retain(|k, _| names.iter().any(|n| n.eq_ignore_ascii_case(k)));
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<String>)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (K, Vec<String>)>>(iter: T) -> Self {
        let mut set = AttributeSet::new();
        for (k, v) in iter {
            set.set(k, v);
        }
        set
    }
}

/// A directory record produced by either data path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Unique key: a DN on the LDAP path, `<account>:<item>` on the replica path.
    pub id: String,
    pub attributes: AttributeSet,
    #[serde(default)]
    pub is_group: bool,
}

impl DirectoryEntry {
    pub fn new(id: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            id: id.into(),
            attributes,
            is_group: false,
        }
    }

    /// Mark the entry as a group.
    pub fn with_group(mut self, is_group: bool) -> Self {
        self.is_group = is_group;
        self
    }

    /// First non-empty value among the given attributes, in order.
    pub fn first_of(&self, names: &[String]) -> Option<&str> {
        names.iter().find_map(|n| self.attributes.first(n))
    }

    /// Strip the entry down to its key.
    pub fn id_only(&self) -> Self {
        Self {
            id: self.id.clone(),
            attributes: AttributeSet::new(),
            is_group: self.is_group,
        }
    }
}

/// Kind of change applied to one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Add,
    Replace,
    Delete,
}

/// One attribute modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub kind: ModificationKind,
    /// Values to add, replace with, or delete. Empty on delete removes the attribute.
    pub values: Vec<String>,
}

impl AttributeChange {
    pub fn add(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ModificationKind::Add,
            values,
        }
    }

    pub fn replace(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ModificationKind::Replace,
            values,
        }
    }

    pub fn delete(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ModificationKind::Delete,
            values,
        }
    }
}

/// An ordered list of modifications applied to one entry.
pub type Modifications = Vec<AttributeChange>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_lookup_ignores_case() {
        let attrs = AttributeSet::new().with("displayName", "Ada Lovelace");
        assert_eq!(attrs.first("displayname"), Some("Ada Lovelace"));
        assert!(attrs.has("DISPLAYNAME"));
        assert!(!attrs.has("mail"));
    }

    #[test]
    fn test_set_replaces_differently_cased_key() {
        let mut attrs = AttributeSet::new().with("Mail", "a@example.com");
        attrs.set("mail", vec!["b@example.com".into()]);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get("MAIL"), Some(&["b@example.com".to_string()][..]));
    }

    #[test]
    fn test_add_value_appends() {
        let mut attrs = AttributeSet::new();
        attrs.add_value("objectClass", "top");
        attrs.add_value("objectclass", "person");
        assert_eq!(attrs.get("objectClass").map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_retain_named() {
        let mut attrs = AttributeSet::new()
            .with("cn", "Ada")
            .with("mail", "ada@example.com")
            .with("userPassword", "secret");
        attrs.retain_named(&["CN".into(), "mail".into()]);
        assert_eq!(attrs.len(), 2);
        assert!(!attrs.has("userPassword"));
    }

    #[test]
    fn test_first_of_uses_order() {
        let entry = DirectoryEntry::new(
            "uid=ada,ou=people,dc=example,dc=com",
            AttributeSet::new().with("createTimestamp", "20240101000000Z"),
        );
        let order = vec!["whenCreated".to_string(), "createTimestamp".to_string()];
        assert_eq!(entry.first_of(&order), Some("20240101000000Z"));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = DirectoryEntry::new("uid=ada", AttributeSet::new().with("cn", "Ada"))
            .with_group(false);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["attributes"]["cn"][0], "Ada");
        let back: DirectoryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
        assert!(entry.id_only().attributes.is_empty());
    }
}
