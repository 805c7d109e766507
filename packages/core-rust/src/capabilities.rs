//! Declaration of what a backing store can evaluate natively.
//!
//! Capabilities are produced outside this crate (typically by parsing a
//! capabilities document) and arrive either through [`CapabilitiesBuilder`]
//! or through serde. Once built they are never mutated.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::filter::eval::CLIENT_FUNCTIONS;
use crate::filter::SpatialOp;

/// Operator tags a store may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorTag {
    And,
    Or,
    Not,
    Exclude,
    /// `=`, `<>`, `<`, `<=`, `>`, `>=` with case-sensitive strings.
    SimpleComparisons,
    /// Comparisons with `match_case == false`.
    CaseInsensitiveComparisons,
    Between,
    /// Case-sensitive `LIKE`.
    Like,
    CaseInsensitiveLike,
    NullCheck,
    Id,
    Bbox,
    Intersects,
    Contains,
    Within,
    Disjoint,
    Touches,
    Crosses,
    Overlaps,
    Equals,
    DWithin,
    Beyond,
    Arithmetic,
}

impl OperatorTag {
    /// Every tag, in declaration order.
    pub const ALL: [OperatorTag; 23] = [
        OperatorTag::And,
        OperatorTag::Or,
        OperatorTag::Not,
        OperatorTag::Exclude,
        OperatorTag::SimpleComparisons,
        OperatorTag::CaseInsensitiveComparisons,
        OperatorTag::Between,
        OperatorTag::Like,
        OperatorTag::CaseInsensitiveLike,
        OperatorTag::NullCheck,
        OperatorTag::Id,
        OperatorTag::Bbox,
        OperatorTag::Intersects,
        OperatorTag::Contains,
        OperatorTag::Within,
        OperatorTag::Disjoint,
        OperatorTag::Touches,
        OperatorTag::Crosses,
        OperatorTag::Overlaps,
        OperatorTag::Equals,
        OperatorTag::DWithin,
        OperatorTag::Beyond,
        OperatorTag::Arithmetic,
    ];

    /// Tag of a binary spatial operator.
    #[must_use]
    pub fn spatial(op: SpatialOp) -> Self {
        match op {
            SpatialOp::Intersects => OperatorTag::Intersects,
            SpatialOp::Contains => OperatorTag::Contains,
            SpatialOp::Within => OperatorTag::Within,
            SpatialOp::Disjoint => OperatorTag::Disjoint,
            SpatialOp::Touches => OperatorTag::Touches,
            SpatialOp::Crosses => OperatorTag::Crosses,
            SpatialOp::Overlaps => OperatorTag::Overlaps,
            SpatialOp::Equals => OperatorTag::Equals,
            SpatialOp::DWithin => OperatorTag::DWithin,
            SpatialOp::Beyond => OperatorTag::Beyond,
        }
    }
}

/// Immutable set of supported operator tags and function names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    operators: BTreeSet<OperatorTag>,
    #[serde(default)]
    functions: BTreeSet<String>,
}

impl Capabilities {
    /// Nothing is supported: every predicate is evaluated client-side.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Every operator tag and every client-evaluable function.
    #[must_use]
    pub fn all() -> Self {
        Self::builder()
            .operators(OperatorTag::ALL)
            .functions(CLIENT_FUNCTIONS.iter().copied())
            .build()
    }

    #[must_use]
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }

    #[must_use]
    pub fn supports(&self, tag: OperatorTag) -> bool {
        self.operators.contains(&tag)
    }

    #[must_use]
    pub fn supports_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn operators(&self) -> impl Iterator<Item = OperatorTag> + '_ {
        self.operators.iter().copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    /// Tags and functions supported by both `self` and `other`.
    #[must_use]
    pub fn intersection(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            operators: self.operators.intersection(&other.operators).copied().collect(),
            functions: self.functions.intersection(&other.functions).cloned().collect(),
        }
    }
}

/// Accumulates tags and function names for a [`Capabilities`] value.
#[derive(Debug, Clone, Default)]
pub struct CapabilitiesBuilder {
    inner: Capabilities,
}

impl CapabilitiesBuilder {
    #[must_use]
    pub fn operator(mut self, tag: OperatorTag) -> Self {
        self.inner.operators.insert(tag);
        self
    }

    #[must_use]
    pub fn operators(mut self, tags: impl IntoIterator<Item = OperatorTag>) -> Self {
        self.inner.operators.extend(tags);
        self
    }

    #[must_use]
    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.inner.functions.insert(name.into());
        self
    }

    #[must_use]
    pub fn functions<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.inner.functions.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn build(self) -> Capabilities {
        self.inner
    }
}
