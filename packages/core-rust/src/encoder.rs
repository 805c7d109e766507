//! Filter → SQL `WHERE` predicate translation.

use tracing::warn;

use crate::dialect::Dialect;
use crate::error::EncodeError;
use crate::feature::{AttributeType, FeatureType};
use crate::filter::{ArithmeticOp, Expr, Filter, SpatialOp};
use crate::value::Value;

/// Everything an encoder needs besides the filter itself.
#[derive(Clone, Copy)]
pub struct EncodeContext<'a> {
    pub dialect: &'a dyn Dialect,
    pub feature_type: &'a FeatureType,
}

/// Translates a filter into a SQL predicate.
///
/// The planner owns clause assembly and passes encoder errors through
/// unchanged.
pub trait FilterEncoder: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EncodeError`] for constructs the dialect cannot express.
    fn encode(&self, filter: &Filter, ctx: EncodeContext<'_>) -> Result<String, EncodeError>;
}

/// Default encoder producing portable SQL through the dialect hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlFilterEncoder;

impl FilterEncoder for SqlFilterEncoder {
    fn encode(&self, filter: &Filter, ctx: EncodeContext<'_>) -> Result<String, EncodeError> {
        encode_filter(filter, ctx)
    }
}

/// SQL literal for a value.
///
/// # Errors
///
/// Non-finite floats have no SQL literal.
pub fn encode_literal(dialect: &dyn Dialect, value: &Value) -> Result<String, EncodeError> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => dialect.encode_bool(*b),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{f}"),
        Value::Float(f) => return Err(EncodeError::Literal(format!("non-finite number {f}"))),
        Value::String(s) => quote_string(s),
        Value::Geometry(g) => dialect.encode_geometry_literal(g),
    })
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn encode_filter(filter: &Filter, ctx: EncodeContext<'_>) -> Result<String, EncodeError> {
    match filter {
        Filter::Include => Ok("1 = 1".to_string()),
        Filter::Exclude => Ok("0 = 1".to_string()),
        Filter::And(children) => join(children, " AND ", ctx),
        Filter::Or(children) => join(children, " OR ", ctx),
        Filter::Not(child) => Ok(format!("NOT ({})", encode_filter(child, ctx)?)),
        Filter::Compare {
            op,
            left,
            right,
            match_case,
        } => {
            let mut l = encode_expr(left, ctx)?;
            let mut r = encode_expr(right, ctx)?;
            if !match_case && (is_textual(left, ctx) || is_textual(right, ctx)) {
                l = format!("UPPER({l})");
                r = format!("UPPER({r})");
            }
            Ok(format!("{l} {} {r}", op.symbol()))
        }
        Filter::Between { expr, lower, upper } => Ok(format!(
            "{} BETWEEN {} AND {}",
            encode_expr(expr, ctx)?,
            encode_expr(lower, ctx)?,
            encode_expr(upper, ctx)?
        )),
        Filter::Like {
            expr,
            pattern,
            wildcard,
            single_char,
            escape,
            match_case,
        } => {
            let sql_pattern = like_pattern(pattern, *wildcard, *single_char, *escape);
            let target = encode_expr(expr, ctx)?;
            if *match_case {
                Ok(format!("{target} LIKE {} ESCAPE '\\'", quote_string(&sql_pattern)))
            } else {
                Ok(format!(
                    "UPPER({target}) LIKE {} ESCAPE '\\'",
                    quote_string(&sql_pattern.to_uppercase())
                ))
            }
        }
        Filter::IsNull(expr) => Ok(format!("{} IS NULL", encode_expr(expr, ctx)?)),
        Filter::Bbox { property, envelope } => {
            if envelope.is_nan() {
                return Err(EncodeError::Malformed("bbox with NaN bounds".into()));
            }
            let column = ctx.dialect.quote_identifier(property);
            ctx.dialect
                .encode_bbox(&column, envelope, srid_of(property, ctx))
                .ok_or_else(|| EncodeError::UnsupportedOperator {
                    operator: "BBOX".into(),
                    dialect: ctx.dialect.name(),
                })
        }
        Filter::Spatial {
            op,
            property,
            geometry,
            distance,
        } => {
            let function = ctx.dialect.spatial_function(*op).ok_or_else(|| {
                EncodeError::UnsupportedOperator {
                    operator: op.to_string(),
                    dialect: ctx.dialect.name(),
                }
            })?;
            let column = ctx.dialect.quote_identifier(property);
            let literal = ctx.dialect.encode_geometry_literal(geometry);
            if !op.is_distance() {
                return Ok(format!("{function}({column}, {literal})"));
            }
            let distance = distance
                .filter(|d| d.is_finite())
                .ok_or_else(|| EncodeError::Malformed(format!("{op} needs a finite distance")))?;
            let call = format!("{function}({column}, {literal}, {distance})");
            Ok(if *op == SpatialOp::Beyond {
                format!("NOT {call}")
            } else {
                call
            })
        }
        Filter::Id(ids) => encode_ids(ids.iter().map(String::as_str), ctx),
    }
}

fn join(children: &[Filter], separator: &str, ctx: EncodeContext<'_>) -> Result<String, EncodeError> {
    if children.is_empty() {
        return Err(EncodeError::Malformed("empty logical operator".into()));
    }
    let parts = children
        .iter()
        .map(|c| encode_filter(c, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", parts.join(separator)))
}

fn encode_expr(expr: &Expr, ctx: EncodeContext<'_>) -> Result<String, EncodeError> {
    match expr {
        Expr::Property(name) => Ok(ctx.dialect.quote_identifier(name)),
        Expr::Literal(value) => encode_literal(ctx.dialect, value),
        Expr::Function { name, args } => {
            let function = ctx
                .dialect
                .sql_function(name)
                .ok_or_else(|| EncodeError::UnsupportedFunction {
                    name: name.clone(),
                    dialect: ctx.dialect.name(),
                })?;
            let args = args
                .iter()
                .map(|a| encode_expr(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("{function}({})", args.join(", ")))
        }
        Expr::Arithmetic {
            op: ArithmeticOp::Divide,
            left,
            right,
        } => Ok(format!(
            "({} / NULLIF({}, 0))",
            encode_expr(left, ctx)?,
            encode_expr(right, ctx)?
        )),
        Expr::Arithmetic { op, left, right } => Ok(format!(
            "({} {} {})",
            encode_expr(left, ctx)?,
            op.symbol(),
            encode_expr(right, ctx)?
        )),
    }
}

fn is_textual(expr: &Expr, ctx: EncodeContext<'_>) -> bool {
    match expr {
        Expr::Literal(Value::String(_)) => true,
        Expr::Property(name) => ctx
            .feature_type
            .descriptor(name)
            .is_some_and(|d| d.binding == AttributeType::Text),
        Expr::Function { name, .. } => name == "strToUpperCase" || name == "strToLowerCase",
        _ => false,
    }
}

fn srid_of(property: &str, ctx: EncodeContext<'_>) -> Option<i32> {
    match ctx.feature_type.descriptor(property)?.binding {
        AttributeType::Geometry { srid } => srid,
        _ => None,
    }
}

/// Rewrites a filter `LIKE` pattern into SQL `%`/`_` syntax escaped with `\`.
fn like_pattern(pattern: &str, wildcard: char, single_char: char, escape: char) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped {
            if matches!(c, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(c);
            escaped = false;
        } else if c == escape {
            escaped = true;
        } else if c == wildcard {
            out.push('%');
        } else if c == single_char {
            out.push('_');
        } else {
            if matches!(c, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
    }
    if escaped {
        if matches!(escape, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(escape);
    }
    out
}

/// Encodes an id set, dropping ids the table's mapper rejects.
///
/// An id set with no valid id left matches nothing.
fn encode_ids<'a>(ids: impl Iterator<Item = &'a str>, ctx: EncodeContext<'_>) -> Result<String, EncodeError> {
    let mapper = &ctx.feature_type.fid_mapper;
    let columns: Vec<String> = mapper
        .column_names()
        .iter()
        .map(|c| ctx.dialect.quote_identifier(c))
        .collect();

    let mut keys = Vec::new();
    for fid in ids {
        match mapper.decode(fid) {
            Ok(values) if values.len() == columns.len() && !columns.is_empty() => keys.push(values),
            _ => {
                warn!(type_name = %ctx.feature_type.name, fid = %fid, "dropping malformed feature id");
            }
        }
    }
    if keys.is_empty() {
        return Ok("0 = 1".to_string());
    }

    if columns.len() == 1 {
        let literals = keys
            .iter()
            .map(|k| encode_literal(ctx.dialect, &k[0]))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(format!("{} IN ({})", columns[0], literals.join(", ")));
    }

    let mut alternatives = Vec::with_capacity(keys.len());
    for key in &keys {
        let terms = columns
            .iter()
            .zip(key)
            .map(|(column, value)| Ok(format!("{column} = {}", encode_literal(ctx.dialect, value)?)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        alternatives.push(format!("({})", terms.join(" AND ")));
    }
    Ok(format!("({})", alternatives.join(" OR ")))
}
