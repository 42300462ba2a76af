//! Property bags attached to segments
//!
//! Values are limited to a closed set of serializable kinds so every replica
//! can compare and persist them the same way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    String(String),
    Map(PropertySet),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value as f64)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<PropertySet> for PropertyValue {
    fn from(value: PropertySet) -> Self {
        PropertyValue::Map(value)
    }
}

/// Key-ordered property mapping
///
/// Keys are kept sorted so equality and serialization do not depend on the
/// order in which properties were set.
///
/// # Example
///
/// ```rust
/// use mergetree_core::crdt::merge_tree::PropertySet;
///
/// let mut props = PropertySet::new();
/// props.set("bold", true);
///
/// let mut update = PropertySet::new();
/// update.set("bold", false);
/// update.set("color", "red");
///
/// props.extend(&update);
/// assert_eq!(props.len(), 2);
/// assert_eq!(props.get("bold"), Some(&false.into()));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet(BTreeMap<String, PropertyValue>);

impl PropertySet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    /// Merge `other` into this set; values in `other` win for shared keys
    pub fn extend(&mut self, other: &PropertySet) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertySet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_overwrites() {
        let mut props: PropertySet = [("a", 1i64), ("b", 2i64)].into_iter().collect();
        let update: PropertySet = [("b", 3i64)].into_iter().collect();

        props.extend(&update);

        assert_eq!(props.get("a"), Some(&PropertyValue::Number(1.0)));
        assert_eq!(props.get("b"), Some(&PropertyValue::Number(3.0)));
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let mut first = PropertySet::new();
        first.set("x", "1");
        first.set("y", "2");

        let mut second = PropertySet::new();
        second.set("y", "2");
        second.set("x", "1");

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_nested_serialization() {
        let mut inner = PropertySet::new();
        inner.set("size", 12i64);

        let mut props = PropertySet::new();
        props.set("font", inner);
        props.set("bold", true);
        props.set("name", "heading");

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"bold":true,"font":{"size":12.0},"name":"heading"}"#);

        let back: PropertySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}
