//! Query value objects handed to the store by the request layer.

use crate::filter::Filter;

/// Attribute projection of a query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    #[default]
    All,
    /// Only these attributes, in this order.
    Names(Vec<String>),
}

impl Projection {
    /// Projection over the given attribute names.
    #[must_use]
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Names(names.into_iter().map(Into::into).collect())
    }

    /// `true` if `name` is part of the projection.
    #[must_use]
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Projection::All => true,
            Projection::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// One element of a sort specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortBy {
    /// Feature-id (primary key) order.
    Natural,
    /// Reverse feature-id order.
    Reverse,
    Attribute { name: String, order: SortOrder },
}

impl SortBy {
    #[must_use]
    pub fn asc(name: impl Into<String>) -> Self {
        SortBy::Attribute {
            name: name.into(),
            order: SortOrder::Ascending,
        }
    }

    #[must_use]
    pub fn desc(name: impl Into<String>) -> Self {
        SortBy::Attribute {
            name: name.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A feature query against one feature type.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub type_name: String,
    pub properties: Projection,
    pub filter: Filter,
    pub sort_by: Vec<SortBy>,
    /// Zero-based offset; `Some(0)` behaves like `None`.
    pub start_index: Option<u64>,
    /// `None` is unbounded.
    pub max_features: Option<u64>,
}

impl Query {
    /// Everything of `type_name`, unsorted and unpaged.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: Projection::All,
            filter: Filter::Include,
            sort_by: Vec::new(),
            start_index: None,
            max_features: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Projection) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort_by: Vec<SortBy>) -> Self {
        self.sort_by = sort_by;
        self
    }

    #[must_use]
    pub fn with_start_index(mut self, start_index: u64) -> Self {
        self.start_index = Some(start_index);
        self
    }

    #[must_use]
    pub fn with_max_features(mut self, max_features: u64) -> Self {
        self.max_features = Some(max_features);
        self
    }

    /// Effective offset: `None` when unset or zero.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.start_index.filter(|n| *n > 0)
    }
}
