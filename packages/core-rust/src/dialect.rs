//! SQL dialects composed into the planner and the filter encoder.
//!
//! A [`Dialect`] answers "how is this spelled here" questions: identifier
//! quoting, paging syntax, geometry literals and spatial functions. It also
//! reports which predicates the database evaluates natively.

use std::fmt;

use crate::capabilities::{Capabilities, OperatorTag};
use crate::filter::SpatialOp;
use crate::value::{Envelope, Geometry};

/// Database-specific SQL spelling.
///
/// Used as `Arc<dyn Dialect>`.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Double-quotes an identifier, doubling embedded quotes.
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Whether tables may be qualified with a schema name.
    fn supports_schema(&self) -> bool {
        true
    }

    /// Applies paging to a complete `SELECT`. `offset` and `limit` are only
    /// passed when non-zero.
    fn apply_limit_offset(&self, sql: String, offset: Option<u64>, limit: Option<u64>) -> String;

    fn encode_bool(&self, value: bool) -> String;

    /// Select-list expression reading a geometry column as WKT.
    fn encode_geometry_column(&self, quoted_column: &str, srid: Option<i32>) -> String;

    /// SQL literal for a geometry.
    fn encode_geometry_literal(&self, geometry: &Geometry) -> String;

    /// Name of the function implementing a binary spatial operator.
    fn spatial_function(&self, _op: SpatialOp) -> Option<&'static str> {
        None
    }

    /// Bounding-box predicate on a geometry column.
    fn encode_bbox(&self, _quoted_column: &str, _envelope: &Envelope, _srid: Option<i32>) -> Option<String> {
        None
    }

    /// SQL function implementing a filter function.
    fn sql_function(&self, name: &str) -> Option<&'static str> {
        match name {
            "abs" => Some("ABS"),
            "strLength" => Some("LENGTH"),
            "strToUpperCase" => Some("UPPER"),
            "strToLowerCase" => Some("LOWER"),
            _ => None,
        }
    }

    /// Expression producing the next value of `sequence`.
    fn next_sequence_value(&self, _sequence: &str) -> Option<String> {
        None
    }

    /// Whether `INSERT ... RETURNING` hands back generated keys.
    fn supports_returning(&self) -> bool {
        true
    }

    /// Wraps a sub-select so it can appear in a `FROM` clause.
    fn alias_subquery(&self, sql: &str, alias: &str) -> String {
        format!("({sql}) AS {}", self.quote_identifier(alias))
    }

    /// Predicates this database evaluates with the same semantics as the
    /// client-side evaluator.
    fn native_capabilities(&self) -> Capabilities;
}

/// Tags every SQL backend handles. `Arithmetic` is absent: databases raise
/// or widen on overflow and division by zero where client evaluation yields
/// null.
const BASE_OPERATORS: [OperatorTag; 8] = [
    OperatorTag::And,
    OperatorTag::Or,
    OperatorTag::Not,
    OperatorTag::Exclude,
    OperatorTag::SimpleComparisons,
    OperatorTag::Between,
    OperatorTag::NullCheck,
    OperatorTag::Id,
];

fn format_ordinate(v: f64) -> String {
    format!("{v}")
}

// ---------------------------------------------------------------------------
// PostGIS
// ---------------------------------------------------------------------------

/// PostgreSQL with the PostGIS extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgisDialect;

impl Dialect for PostgisDialect {
    fn name(&self) -> &'static str {
        "postgis"
    }

    fn apply_limit_offset(&self, mut sql: String, offset: Option<u64>, limit: Option<u64>) -> String {
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    fn encode_bool(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    fn encode_geometry_column(&self, quoted_column: &str, _srid: Option<i32>) -> String {
        format!("ST_AsText({quoted_column})")
    }

    fn encode_geometry_literal(&self, geometry: &Geometry) -> String {
        let wkt = geometry.wkt.replace('\'', "''");
        match geometry.srid {
            Some(srid) => format!("ST_GeomFromText('{wkt}', {srid})"),
            None => format!("ST_GeomFromText('{wkt}')"),
        }
    }

    fn spatial_function(&self, op: SpatialOp) -> Option<&'static str> {
        Some(match op {
            SpatialOp::Intersects => "ST_Intersects",
            SpatialOp::Contains => "ST_Contains",
            SpatialOp::Within => "ST_Within",
            SpatialOp::Disjoint => "ST_Disjoint",
            SpatialOp::Touches => "ST_Touches",
            SpatialOp::Crosses => "ST_Crosses",
            SpatialOp::Overlaps => "ST_Overlaps",
            SpatialOp::Equals => "ST_Equals",
            SpatialOp::DWithin | SpatialOp::Beyond => "ST_DWithin",
        })
    }

    fn encode_bbox(&self, quoted_column: &str, envelope: &Envelope, srid: Option<i32>) -> Option<String> {
        Some(format!(
            "{quoted_column} && ST_MakeEnvelope({}, {}, {}, {}, {})",
            format_ordinate(envelope.min_x),
            format_ordinate(envelope.min_y),
            format_ordinate(envelope.max_x),
            format_ordinate(envelope.max_y),
            srid.unwrap_or(0),
        ))
    }

    fn sql_function(&self, name: &str) -> Option<&'static str> {
        match name {
            "strLength" => Some("CHAR_LENGTH"),
            "abs" => Some("ABS"),
            "strToUpperCase" => Some("UPPER"),
            "strToLowerCase" => Some("LOWER"),
            _ => None,
        }
    }

    fn next_sequence_value(&self, sequence: &str) -> Option<String> {
        let quoted = self.quote_identifier(sequence).replace('\'', "''");
        Some(format!("nextval('{quoted}')"))
    }

    /// Bbox is envelope intersection on both sides; the exact topological
    /// operators are left out because client-side evaluation only
    /// approximates them.
    fn native_capabilities(&self) -> Capabilities {
        Capabilities::builder()
            .operators(BASE_OPERATORS)
            .operators([
                OperatorTag::CaseInsensitiveComparisons,
                OperatorTag::Like,
                OperatorTag::CaseInsensitiveLike,
                OperatorTag::Bbox,
            ])
            .functions(["abs", "strLength", "strToUpperCase", "strToLowerCase"])
            .build()
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite with geometries stored as WKT text. No schemas, no spatial SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_schema(&self) -> bool {
        false
    }

    fn apply_limit_offset(&self, mut sql: String, offset: Option<u64>, limit: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        sql
    }

    fn encode_bool(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn encode_geometry_column(&self, quoted_column: &str, _srid: Option<i32>) -> String {
        quoted_column.to_string()
    }

    fn encode_geometry_literal(&self, geometry: &Geometry) -> String {
        format!("'{}'", geometry.wkt.replace('\'', "''"))
    }

    /// `LIKE` is left out because SQLite matches ASCII case-insensitively;
    /// `UPPER` is left out because it only folds ASCII.
    fn native_capabilities(&self) -> Capabilities {
        Capabilities::builder()
            .operators(BASE_OPERATORS)
            .functions(["abs", "strLength"])
            .build()
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Oracle, paging through `ROWNUM`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn apply_limit_offset(&self, sql: String, offset: Option<u64>, limit: Option<u64>) -> String {
        match (offset, limit) {
            (None, None) => sql,
            (None, Some(limit)) => format!("SELECT * FROM ({sql}) WHERE ROWNUM <= {limit}"),
            (Some(offset), None) => format!(
                "SELECT * FROM (SELECT A.*, ROWNUM RNUM FROM ({sql}) A) WHERE RNUM > {offset}"
            ),
            (Some(offset), Some(limit)) => format!(
                "SELECT * FROM (SELECT A.*, ROWNUM RNUM FROM ({sql}) A WHERE ROWNUM <= {}) WHERE RNUM > {offset}",
                offset.saturating_add(limit)
            ),
        }
    }

    fn encode_bool(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn encode_geometry_column(&self, quoted_column: &str, _srid: Option<i32>) -> String {
        format!("SDO_UTIL.TO_WKTGEOMETRY({quoted_column})")
    }

    fn encode_geometry_literal(&self, geometry: &Geometry) -> String {
        let wkt = geometry.wkt.replace('\'', "''");
        match geometry.srid {
            Some(srid) => format!("SDO_GEOMETRY('{wkt}', {srid})"),
            None => format!("SDO_GEOMETRY('{wkt}')"),
        }
    }

    fn sql_function(&self, name: &str) -> Option<&'static str> {
        match name {
            "abs" => Some("ABS"),
            "strLength" => Some("LENGTH"),
            _ => None,
        }
    }

    fn next_sequence_value(&self, sequence: &str) -> Option<String> {
        Some(format!("{}.NEXTVAL", self.quote_identifier(sequence)))
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn alias_subquery(&self, sql: &str, alias: &str) -> String {
        format!("({sql}) {}", self.quote_identifier(alias))
    }

    fn native_capabilities(&self) -> Capabilities {
        Capabilities::builder()
            .operators(BASE_OPERATORS)
            .operator(OperatorTag::Like)
            .functions(["abs", "strLength"])
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_with_embedded_quotes_doubled() {
        assert_eq!(PostgisDialect.quote_identifier("Road"), "\"Road\"");
        assert_eq!(SqliteDialect.quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn postgis_puts_offset_before_limit() {
        let sql = PostgisDialect.apply_limit_offset("SELECT 1".into(), Some(10), Some(5));
        assert_eq!(sql, "SELECT 1 OFFSET 10 LIMIT 5");
    }

    #[test]
    fn sqlite_needs_a_limit_for_offset() {
        assert_eq!(
            SqliteDialect.apply_limit_offset("SELECT 1".into(), Some(3), None),
            "SELECT 1 LIMIT -1 OFFSET 3"
        );
        assert_eq!(
            SqliteDialect.apply_limit_offset("SELECT 1".into(), Some(3), Some(2)),
            "SELECT 1 LIMIT 2 OFFSET 3"
        );
    }

    #[test]
    fn oracle_wraps_with_rownum() {
        let sql = OracleDialect.apply_limit_offset("SELECT x FROM t".into(), Some(10), Some(5));
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT A.*, ROWNUM RNUM FROM (SELECT x FROM t) A WHERE ROWNUM <= 15) WHERE RNUM > 10"
        );
    }

    #[test]
    fn geometry_literals() {
        let g = Geometry::with_srid("POINT (1 2)", 4326);
        assert_eq!(PostgisDialect.encode_geometry_literal(&g), "ST_GeomFromText('POINT (1 2)', 4326)");
        assert_eq!(SqliteDialect.encode_geometry_literal(&g), "'POINT (1 2)'");
    }

    #[test]
    fn sequences() {
        assert_eq!(PostgisDialect.next_sequence_value("road_seq").as_deref(), Some("nextval('\"road_seq\"')"));
        assert_eq!(OracleDialect.next_sequence_value("ROAD_SEQ").as_deref(), Some("\"ROAD_SEQ\".NEXTVAL"));
        assert_eq!(SqliteDialect.next_sequence_value("x"), None);
    }

    #[test]
    fn sqlite_does_not_advertise_like() {
        let caps = SqliteDialect.native_capabilities();
        assert!(caps.supports(OperatorTag::SimpleComparisons));
        assert!(!caps.supports(OperatorTag::Like));
        assert!(!caps.supports(OperatorTag::Bbox));
    }

    #[test]
    fn arithmetic_is_never_native() {
        for caps in [
            PostgisDialect.native_capabilities(),
            SqliteDialect.native_capabilities(),
            OracleDialect.native_capabilities(),
        ] {
            assert!(!caps.supports(OperatorTag::Arithmetic));
        }
    }
}
