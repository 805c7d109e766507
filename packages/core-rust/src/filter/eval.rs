//! Client-side evaluation of filters against in-memory features.
//!
//! Evaluation follows SQL three-valued logic internally: a predicate over a
//! `Null` operand is *unknown*, `NOT unknown` stays unknown, and unknown
//! collapses to `false` at the top. Client-side and server-side evaluation of
//! the same predicate therefore agree on rows with missing values.

use std::collections::BTreeSet;
use std::cmp::Ordering;

use regex::Regex;

use super::{ArithmeticOp, CompareOp, Expr, Filter, SpatialOp};
use crate::feature::Feature;
use crate::value::{Envelope, Geometry, Value};

/// Names of the functions evaluated by [`Expr::evaluate`].
pub const CLIENT_FUNCTIONS: &[&str] = &[
    "geometryType",
    "strLength",
    "strToUpperCase",
    "strToLowerCase",
    "abs",
];

// ---------------------------------------------------------------------------
// SpatialEvaluator
// ---------------------------------------------------------------------------

/// Geometry predicates used during client-side evaluation.
///
/// `None` means the relation could not be decided (for example an
/// unparsable geometry) and is treated as unknown.
pub trait SpatialEvaluator: Send + Sync {
    fn relate(
        &self,
        op: SpatialOp,
        left: &Geometry,
        right: &Geometry,
        distance: Option<f64>,
    ) -> Option<bool>;

    /// Bounding-box test: the geometry's envelope intersects `envelope`.
    fn bbox(&self, geometry: &Geometry, envelope: &Envelope) -> Option<bool> {
        geometry.envelope().map(|e| e.intersects(envelope))
    }
}

/// Evaluates spatial operators on envelopes only.
///
/// `Bbox` is exact. The other operators are envelope approximations; plug in a
/// geometry-library backed [`SpatialEvaluator`] for exact topology.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeEvaluator;

impl SpatialEvaluator for EnvelopeEvaluator {
    fn relate(
        &self,
        op: SpatialOp,
        left: &Geometry,
        right: &Geometry,
        distance: Option<f64>,
    ) -> Option<bool> {
        let a = left.envelope()?;
        let b = right.envelope()?;
        Some(match op {
            SpatialOp::Intersects | SpatialOp::Touches | SpatialOp::Crosses | SpatialOp::Overlaps => {
                a.intersects(&b)
            }
            SpatialOp::Contains => a.contains(&b),
            SpatialOp::Within => b.contains(&a),
            SpatialOp::Disjoint => !a.intersects(&b),
            SpatialOp::Equals => a == b,
            SpatialOp::DWithin => a.distance(&b) <= distance?,
            SpatialOp::Beyond => a.distance(&b) > distance?,
        })
    }
}

// ---------------------------------------------------------------------------
// Filter evaluation
// ---------------------------------------------------------------------------

impl Filter {
    /// Evaluates the filter with envelope-based spatial semantics.
    #[must_use]
    pub fn evaluate(&self, feature: &Feature) -> bool {
        self.evaluate_with(feature, &EnvelopeEvaluator)
    }

    /// Evaluates the filter, delegating spatial predicates to `spatial`.
    #[must_use]
    pub fn evaluate_with(&self, feature: &Feature, spatial: &dyn SpatialEvaluator) -> bool {
        self.truth(feature, spatial) == Some(true)
    }

    fn truth(&self, feature: &Feature, spatial: &dyn SpatialEvaluator) -> Option<bool> {
        match self {
            Filter::Include => Some(true),
            Filter::Exclude => Some(false),
            Filter::And(children) => {
                let mut result = Some(true);
                for child in children {
                    match child.truth(feature, spatial) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Filter::Or(children) => {
                let mut result = Some(false);
                for child in children {
                    match child.truth(feature, spatial) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Filter::Not(child) => child.truth(feature, spatial).map(|t| !t),
            Filter::Compare {
                op,
                left,
                right,
                match_case,
            } => compare(*op, &left.evaluate(feature), &right.evaluate(feature), *match_case),
            Filter::Between { expr, lower, upper } => {
                let value = expr.evaluate(feature);
                let low = value.compare(&lower.evaluate(feature))?;
                let high = value.compare(&upper.evaluate(feature))?;
                Some(low != Ordering::Less && high != Ordering::Greater)
            }
            Filter::Like {
                expr,
                pattern,
                wildcard,
                single_char,
                escape,
                match_case,
            } => {
                let text = expr.evaluate(feature).to_text()?;
                let regex = like_regex(pattern, *wildcard, *single_char, *escape, *match_case)?;
                Some(regex.is_match(&text))
            }
            Filter::IsNull(expr) => Some(expr.evaluate(feature).is_null()),
            Filter::Bbox { property, envelope } => {
                spatial.bbox(feature.get(property)?.as_geometry()?, envelope)
            }
            Filter::Spatial {
                op,
                property,
                geometry,
                distance,
            } => spatial.relate(*op, feature.get(property)?.as_geometry()?, geometry, *distance),
            Filter::Id(ids) => Some(ids.contains(&feature.id)),
        }
    }

    /// Ids named by an `Id` filter, if this is one.
    #[must_use]
    pub fn ids(&self) -> Option<&BTreeSet<String>> {
        match self {
            Filter::Id(ids) => Some(ids),
            _ => None,
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value, match_case: bool) -> Option<bool> {
    if left.is_null() || right.is_null() {
        return None;
    }
    if let (Value::Geometry(a), Value::Geometry(b)) = (left, right) {
        return match op {
            CompareOp::Eq => Some(a == b),
            CompareOp::NotEq => Some(a != b),
            _ => None,
        };
    }
    let ordering = if match_case {
        left.compare(right)?
    } else {
        fold_case(left).compare(&fold_case(right))?
    };
    Some(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::LtEq => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::GtEq => ordering != Ordering::Less,
    })
}

/// Upper-cases strings, mirroring `UPPER(..)` on the SQL side.
fn fold_case(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        other => other.clone(),
    }
}

/// Translates a `LIKE` pattern into an anchored regex.
///
/// A trailing escape character matches itself. Returns `None` only if the
/// regex engine rejects the result.
fn like_regex(
    pattern: &str,
    wildcard: char,
    single_char: char,
    escape: char,
    match_case: bool,
) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str(if match_case { "(?s)^" } else { "(?si)^" });
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped {
            re.push_str(&regex::escape(&c.to_string()));
            escaped = false;
        } else if c == escape {
            escaped = true;
        } else if c == wildcard {
            re.push_str(".*");
        } else if c == single_char {
            re.push('.');
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    if escaped {
        re.push_str(&regex::escape(&escape.to_string()));
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

impl Expr {
    /// Evaluates the expression. Missing attributes, unknown functions, type
    /// mismatches and arithmetic overflow all yield [`Value::Null`].
    #[must_use]
    pub fn evaluate(&self, feature: &Feature) -> Value {
        match self {
            Expr::Property(name) => feature.get(name).cloned().unwrap_or(Value::Null),
            Expr::Literal(value) => value.clone(),
            Expr::Function { name, args } => {
                let values: Vec<Value> = args.iter().map(|a| a.evaluate(feature)).collect();
                call_function(name, &values)
            }
            Expr::Arithmetic { op, left, right } => {
                arithmetic(*op, &left.evaluate(feature), &right.evaluate(feature))
            }
        }
    }
}

fn call_function(name: &str, args: &[Value]) -> Value {
    match (name, args) {
        ("geometryType", [Value::Geometry(g)]) => g
            .geometry_type()
            .map_or(Value::Null, |t| Value::String(t.to_string())),
        ("strLength", [v]) => v
            .to_text()
            .and_then(|s| i64::try_from(s.chars().count()).ok())
            .map_or(Value::Null, Value::Int),
        ("strToUpperCase", [v]) => v.to_text().map_or(Value::Null, |s| Value::String(s.to_uppercase())),
        ("strToLowerCase", [v]) => v.to_text().map_or(Value::Null, |s| Value::String(s.to_lowercase())),
        ("abs", [Value::Int(i)]) => i.checked_abs().map_or(Value::Null, Value::Int),
        ("abs", [Value::Float(f)]) => Value::Float(f.abs()),
        _ => Value::Null,
    }
}

/// Integer arithmetic truncates like SQL; mixed operands widen to float.
fn arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let result = match op {
            ArithmeticOp::Add => a.checked_add(*b),
            ArithmeticOp::Subtract => a.checked_sub(*b),
            ArithmeticOp::Multiply => a.checked_mul(*b),
            ArithmeticOp::Divide => a.checked_div(*b),
        };
        return result.map_or(Value::Null, Value::Int);
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Value::Null;
    };
    let result = match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Subtract => a - b,
        ArithmeticOp::Multiply => a * b,
        ArithmeticOp::Divide if b == 0.0 => return Value::Null,
        ArithmeticOp::Divide => a / b,
    };
    if result.is_finite() {
        Value::Float(result)
    } else {
        Value::Null
    }
}
