//! Features, their attribute container and feature-type schemas.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fid::FidMapper;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Insertion-ordered name → value container.
///
/// Feature types have a handful of attributes, so lookups scan a `Vec`
/// rather than hashing; iteration order is the order attributes were set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, Value)>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Sets `name`, replacing an existing value in place or appending.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Keeps only the attributes whose name satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|(n, _)| keep(n));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (name, value) in iter {
            attrs.set(name, value);
        }
        attrs
    }
}

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// A single row of a feature type, identified by its external feature id.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub attributes: Attributes,
}

impl Feature {
    #[must_use]
    pub fn new(id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }

    /// Attribute value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Declared type of an attribute column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Boolean,
    Integer,
    Float,
    Text,
    Geometry { srid: Option<i32> },
}

impl AttributeType {
    #[must_use]
    pub fn is_geometry(self) -> bool {
        matches!(self, AttributeType::Geometry { .. })
    }
}

/// One attribute of a [`FeatureType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub binding: AttributeType,
    pub nullable: bool,
}

impl AttributeDescriptor {
    /// Nullable attribute of the given binding.
    #[must_use]
    pub fn new(name: impl Into<String>, binding: AttributeType) -> Self {
        Self {
            name: name.into(),
            binding,
            nullable: true,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema of a feature type: table name, optional database schema, ordered
/// attributes and the identity strategy of the table.
#[derive(Clone)]
pub struct FeatureType {
    pub name: String,
    pub schema: Option<String>,
    pub attributes: Vec<AttributeDescriptor>,
    pub fid_mapper: Arc<dyn FidMapper>,
}

impl FeatureType {
    #[must_use]
    pub fn new(name: impl Into<String>, fid_mapper: Arc<dyn FidMapper>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            attributes: Vec::new(),
            fid_mapper,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, descriptor: AttributeDescriptor) -> Self {
        self.attributes.push(descriptor);
        self
    }

    /// Descriptor of attribute `name`.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|d| d.name == name)
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.descriptor(name).is_some()
    }

    /// First geometry attribute, if any.
    #[must_use]
    pub fn default_geometry(&self) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|d| d.binding.is_geometry())
    }
}

impl fmt::Debug for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureType")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("attributes", &self.attributes)
            .field("fid_mapper", &self.fid_mapper.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::AutoIncrementFidMapper;

    #[test]
    fn attributes_keep_insertion_order_and_replace_in_place() {
        let mut attrs = Attributes::new().with("b", 1).with("a", 2);
        attrs.set("b", 3);
        let names: Vec<_> = attrs.names().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(attrs.get("b"), Some(&Value::Int(3)));
        assert_eq!(attrs.remove("a"), Some(Value::Int(2)));
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn feature_type_lookups() {
        let ft = FeatureType::new("road", Arc::new(AutoIncrementFidMapper::integer("fid")))
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new(
                "geom",
                AttributeType::Geometry { srid: Some(4326) },
            ));
        assert!(ft.has_attribute("name"));
        assert!(!ft.has_attribute("fid"));
        assert_eq!(ft.default_geometry().map(|d| d.name.as_str()), Some("geom"));
    }
}
