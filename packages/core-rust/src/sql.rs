//! SQL statement planning.
//!
//! [`SqlBuilder`] turns a feature type, a projection, a (server) filter, a
//! sort specification and paging into dialect-correct SQL. Ordering is
//! deterministic whenever paging could otherwise return shifting pages.

use std::sync::Arc;

use tracing::debug;

use crate::dialect::Dialect;
use crate::encoder::{encode_literal, EncodeContext, FilterEncoder, SqlFilterEncoder};
use crate::error::PlanningError;
use crate::feature::{AttributeDescriptor, AttributeType, Attributes, FeatureType};
use crate::fid::KeyGeneration;
use crate::filter::Filter;
use crate::query::{Projection, SortBy, SortOrder};
use crate::value::Value;

// ---------------------------------------------------------------------------
// SelectRequest
// ---------------------------------------------------------------------------

/// Inputs of a `SELECT` (or `COUNT`) over one feature type.
#[derive(Debug, Clone)]
pub struct SelectRequest<'a> {
    pub feature_type: &'a FeatureType,
    pub properties: Projection,
    /// Server-side filter; `Include` emits no `WHERE`.
    pub filter: Filter,
    pub sort_by: Vec<SortBy>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl<'a> SelectRequest<'a> {
    /// All attributes, no filter, no order, no paging.
    #[must_use]
    pub fn new(feature_type: &'a FeatureType) -> Self {
        Self {
            feature_type,
            properties: Projection::All,
            filter: Filter::Include,
            sort_by: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Projection) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort_by: Vec<SortBy>) -> Self {
        self.sort_by = sort_by;
        self
    }

    #[must_use]
    pub fn with_paging(mut self, offset: Option<u64>, limit: Option<u64>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    fn effective_offset(&self) -> Option<u64> {
        self.offset.filter(|n| *n > 0)
    }

    fn effective_limit(&self) -> Option<u64> {
        self.limit.filter(|n| *n > 0)
    }
}

// ---------------------------------------------------------------------------
// SqlBuilder
// ---------------------------------------------------------------------------

/// Plans SQL for one dialect. Cheap to clone and shareable across tasks.
#[derive(Clone)]
pub struct SqlBuilder {
    dialect: Arc<dyn Dialect>,
    encoder: Arc<dyn FilterEncoder>,
    qualify_schema: bool,
}

impl SqlBuilder {
    #[must_use]
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            encoder: Arc::new(SqlFilterEncoder),
            qualify_schema: false,
        }
    }

    /// Replaces the filter encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn FilterEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Turns schema qualification of table names on or off.
    #[must_use]
    pub fn qualify_schema(mut self, qualify: bool) -> Self {
        self.qualify_schema = qualify;
        self
    }

    #[must_use]
    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    /// Validates the request's sort and paging without planning a statement.
    /// Callers that sort or page in memory use this to fail the same way a
    /// pushed-down `ORDER BY` would.
    ///
    /// # Errors
    ///
    /// [`PlanningError::UnknownSortAttribute`],
    /// [`PlanningError::NoPrimaryKey`] or [`PlanningError::UnstablePaging`].
    pub fn check_order(&self, request: &SelectRequest<'_>) -> Result<(), PlanningError> {
        self.order_by(request).map(|_| ())
    }

    /// Plans `SELECT <key columns>, <projected columns> FROM <table> [WHERE]
    /// [ORDER BY] [paging]`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanningError`] for unknown attributes, orders that need a
    /// primary key the table lacks, and encoder failures.
    pub fn select(&self, request: &SelectRequest<'_>) -> Result<String, PlanningError> {
        let ft = request.feature_type;
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.select_list(ft, &request.properties)?.join(", "),
            self.table(ft)
        );
        self.push_where(&mut sql, ft, &request.filter)?;

        let order = self.order_by(request)?;
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        let sql = self
            .dialect
            .apply_limit_offset(sql, request.effective_offset(), request.effective_limit());
        debug!(type_name = %ft.name, sql = %sql, "planned select");
        Ok(sql)
    }

    /// Plans a row count. With paging the count is taken over the paged
    /// sub-select.
    ///
    /// # Errors
    ///
    /// Same as [`select`](Self::select).
    pub fn count(&self, request: &SelectRequest<'_>) -> Result<String, PlanningError> {
        let ft = request.feature_type;
        if request.effective_offset().is_none() && request.effective_limit().is_none() {
            let mut sql = format!("SELECT COUNT(*) FROM {}", self.table(ft));
            self.push_where(&mut sql, ft, &request.filter)?;
            return Ok(sql);
        }
        let inner = SelectRequest {
            properties: Projection::Names(Vec::new()),
            ..request.clone()
        };
        let inner_sql = self.select(&inner)?;
        Ok(format!(
            "SELECT COUNT(*) FROM {}",
            self.dialect.alias_subquery(&inner_sql, "paged")
        ))
    }

    /// Plans an `INSERT` of `attributes`.
    ///
    /// `key` supplies explicit key values, which win over attributes of the
    /// same name. Without it, a sequence-backed table draws from its sequence
    /// and database-generated keys are left to the database.
    ///
    /// # Errors
    ///
    /// Returns [`PlanningError`] for unknown attributes, missing sequence
    /// support and unencodable values.
    pub fn insert(
        &self,
        ft: &FeatureType,
        key: Option<&[Value]>,
        attributes: &Attributes,
    ) -> Result<String, PlanningError> {
        let key_columns = ft.fid_mapper.column_names();
        let mut columns = Vec::new();
        let mut values = Vec::new();

        match (key, ft.fid_mapper.key_generation()) {
            (Some(key), _) => {
                for (column, value) in key_columns.iter().zip(key) {
                    columns.push(self.dialect.quote_identifier(column));
                    values.push(encode_literal(self.dialect.as_ref(), value)?);
                }
            }
            (None, KeyGeneration::Sequence(sequence)) => {
                let next = self.dialect.next_sequence_value(&sequence).ok_or_else(|| {
                    PlanningError::NoSequences {
                        dialect: self.dialect.name(),
                        sequence: sequence.clone(),
                    }
                })?;
                if let Some(column) = key_columns.first() {
                    columns.push(self.dialect.quote_identifier(column));
                    values.push(next);
                }
            }
            (None, _) => {}
        }

        for (name, value) in attributes.iter() {
            if key.is_some() && key_columns.iter().any(|c| c == name) {
                continue;
            }
            self.descriptor(ft, name)?;
            columns.push(self.dialect.quote_identifier(name));
            values.push(encode_literal(self.dialect.as_ref(), value)?);
        }

        if columns.is_empty() {
            return Ok(format!("INSERT INTO {} DEFAULT VALUES", self.table(ft)));
        }
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(ft),
            columns.join(", "),
            values.join(", ")
        ))
    }

    /// Like [`insert`](Self::insert), reading the key columns back with
    /// `RETURNING` when the key is not supplied and the dialect can.
    ///
    /// # Errors
    ///
    /// Same as [`insert`](Self::insert).
    pub fn insert_returning(
        &self,
        ft: &FeatureType,
        key: Option<&[Value]>,
        attributes: &Attributes,
    ) -> Result<String, PlanningError> {
        let mut sql = self.insert(ft, key, attributes)?;
        let key_columns = ft.fid_mapper.column_names();
        if key.is_none() && !key_columns.is_empty() && self.dialect.supports_returning() {
            let columns: Vec<String> = key_columns.iter().map(|c| self.dialect.quote_identifier(c)).collect();
            sql.push_str(" RETURNING ");
            sql.push_str(&columns.join(", "));
        }
        Ok(sql)
    }

    /// Plans `UPDATE <table> SET ... [WHERE]`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanningError`] for unknown attributes, an empty change set
    /// and encoder failures.
    pub fn update(&self, ft: &FeatureType, changes: &Attributes, filter: &Filter) -> Result<String, PlanningError> {
        if changes.is_empty() {
            return Err(PlanningError::EmptyUpdate {
                type_name: ft.name.clone(),
            });
        }
        let mut assignments = Vec::with_capacity(changes.len());
        for (name, value) in changes.iter() {
            self.descriptor(ft, name)?;
            assignments.push(format!(
                "{} = {}",
                self.dialect.quote_identifier(name),
                encode_literal(self.dialect.as_ref(), value)?
            ));
        }
        let mut sql = format!("UPDATE {} SET {}", self.table(ft), assignments.join(", "));
        self.push_where(&mut sql, ft, filter)?;
        Ok(sql)
    }

    /// Plans `DELETE FROM <table> [WHERE]`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanningError::Encode`] if the filter cannot be encoded.
    pub fn delete(&self, ft: &FeatureType, filter: &Filter) -> Result<String, PlanningError> {
        let mut sql = format!("DELETE FROM {}", self.table(ft));
        self.push_where(&mut sql, ft, filter)?;
        Ok(sql)
    }

    // -- clause helpers -----------------------------------------------------

    fn table(&self, ft: &FeatureType) -> String {
        let table = self.dialect.quote_identifier(&ft.name);
        match &ft.schema {
            Some(schema) if self.qualify_schema && self.dialect.supports_schema() => {
                format!("{}.{table}", self.dialect.quote_identifier(schema))
            }
            _ => table,
        }
    }

    fn descriptor<'f>(&self, ft: &'f FeatureType, name: &str) -> Result<&'f AttributeDescriptor, PlanningError> {
        ft.descriptor(name).ok_or_else(|| PlanningError::UnknownAttribute {
            type_name: ft.name.clone(),
            attribute: name.to_string(),
        })
    }

    fn select_list(&self, ft: &FeatureType, properties: &Projection) -> Result<Vec<String>, PlanningError> {
        let key_columns = ft.fid_mapper.column_names();
        let mut list: Vec<String> = key_columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect();

        let descriptors: Vec<&AttributeDescriptor> = match properties {
            Projection::All => ft.attributes.iter().collect(),
            Projection::Names(names) => names
                .iter()
                .map(|n| self.descriptor(ft, n))
                .collect::<Result<_, _>>()?,
        };
        let mut seen: Vec<&str> = key_columns.iter().map(String::as_str).collect();
        for descriptor in descriptors {
            if seen.contains(&descriptor.name.as_str()) {
                continue;
            }
            seen.push(&descriptor.name);
            let column = self.dialect.quote_identifier(&descriptor.name);
            match descriptor.binding {
                AttributeType::Geometry { srid } => {
                    let expr = self.dialect.encode_geometry_column(&column, srid);
                    if expr == column {
                        list.push(column);
                    } else {
                        list.push(format!("{expr} AS {column}"));
                    }
                }
                _ => list.push(column),
            }
        }
        if list.is_empty() {
            list.push("1".to_string());
        }
        Ok(list)
    }

    fn push_where(&self, sql: &mut String, ft: &FeatureType, filter: &Filter) -> Result<(), PlanningError> {
        if filter.is_include() {
            return Ok(());
        }
        let ctx = EncodeContext {
            dialect: self.dialect.as_ref(),
            feature_type: ft,
        };
        let predicate = self.encoder.encode(filter, ctx)?;
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
        Ok(())
    }

    /// ORDER BY terms.
    ///
    /// * no sort, no offset: unordered;
    /// * no sort, offset: primary key ascending;
    /// * natural / reverse: primary key ascending / descending;
    /// * attribute sorts: as given, plus the primary key as a trailing
    ///   tiebreaker whenever paging is requested.
    fn order_by(&self, request: &SelectRequest<'_>) -> Result<Vec<String>, PlanningError> {
        let ft = request.feature_type;
        let key_columns = ft.fid_mapper.column_names();
        let offset = request.effective_offset();
        let paging = offset.is_some() || request.effective_limit().is_some();
        let no_key = || PlanningError::NoPrimaryKey {
            type_name: ft.name.clone(),
        };

        let mut terms: Vec<(String, SortOrder)> = Vec::new();
        let mut push = |column: &str, order: SortOrder| {
            if !terms.iter().any(|(c, _)| c == column) {
                terms.push((column.to_string(), order));
            }
        };

        let mut has_attribute_sort = false;
        for sort in &request.sort_by {
            match sort {
                SortBy::Natural | SortBy::Reverse => {
                    if key_columns.is_empty() {
                        return Err(no_key());
                    }
                    let order = if *sort == SortBy::Natural {
                        SortOrder::Ascending
                    } else {
                        SortOrder::Descending
                    };
                    key_columns.iter().for_each(|c| push(c.as_str(), order));
                }
                SortBy::Attribute { name, order } => {
                    if !ft.has_attribute(name) && !key_columns.contains(name) {
                        return Err(PlanningError::UnknownSortAttribute {
                            type_name: ft.name.clone(),
                            attribute: name.clone(),
                        });
                    }
                    has_attribute_sort = true;
                    push(name.as_str(), *order);
                }
            }
        }

        let needs_tiebreaker = if request.sort_by.is_empty() {
            offset.is_some()
        } else {
            has_attribute_sort && paging
        };
        if needs_tiebreaker {
            if key_columns.is_empty() {
                if offset.is_some() {
                    return Err(PlanningError::UnstablePaging {
                        type_name: ft.name.clone(),
                    });
                }
            } else {
                key_columns.iter().for_each(|c| push(c.as_str(), SortOrder::Ascending));
            }
        }

        Ok(terms
            .into_iter()
            .map(|(column, order)| format!("{} {}", self.dialect.quote_identifier(&column), order.sql()))
            .collect())
    }
}

impl std::fmt::Debug for SqlBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBuilder")
            .field("dialect", &self.dialect.name())
            .field("qualify_schema", &self.qualify_schema)
            .finish_non_exhaustive()
    }
}
