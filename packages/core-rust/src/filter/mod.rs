//! Immutable predicate trees over feature attributes.
//!
//! A [`Filter`] is built once and then only read: by the splitter, by the
//! SQL encoder and by client-side evaluation (see [`eval`]).

pub mod eval;

use std::collections::BTreeSet;
use std::fmt;

use crate::value::{Envelope, Geometry, Value};

pub use eval::{EnvelopeEvaluator, SpatialEvaluator};

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// SQL spelling of the operator.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

/// Binary spatial predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialOp {
    Intersects,
    Contains,
    Within,
    Disjoint,
    Touches,
    Crosses,
    Overlaps,
    Equals,
    /// Within `distance` of the literal geometry.
    DWithin,
    /// Further than `distance` from the literal geometry.
    Beyond,
}

impl SpatialOp {
    /// `true` for the distance-based operators, which require a distance.
    #[must_use]
    pub fn is_distance(self) -> bool {
        matches!(self, SpatialOp::DWithin | SpatialOp::Beyond)
    }
}

impl fmt::Display for SpatialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpatialOp::Intersects => "Intersects",
            SpatialOp::Contains => "Contains",
            SpatialOp::Within => "Within",
            SpatialOp::Disjoint => "Disjoint",
            SpatialOp::Touches => "Touches",
            SpatialOp::Crosses => "Crosses",
            SpatialOp::Overlaps => "Overlaps",
            SpatialOp::Equals => "Equals",
            SpatialOp::DWithin => "DWithin",
            SpatialOp::Beyond => "Beyond",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Value-producing expression inside a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Attribute reference by name.
    Property(String),
    Literal(Value),
    /// Named function call; the set of names a store understands is part of
    /// its capabilities.
    Function { name: String, args: Vec<Expr> },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    #[must_use]
    pub fn property(name: impl Into<String>) -> Self {
        Expr::Property(name.into())
    }

    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    #[must_use]
    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn arithmetic(op: ArithmeticOp, left: Expr, right: Expr) -> Self {
        Expr::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn collect_properties<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Property(name) => {
                out.insert(name.as_str());
            }
            Expr::Literal(_) => {}
            Expr::Function { args, .. } => args.iter().for_each(|a| a.collect_properties(out)),
            Expr::Arithmetic { left, right, .. } => {
                left.collect_properties(out);
                right.collect_properties(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything.
    Include,
    /// Matches nothing.
    Exclude,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        op: CompareOp,
        left: Expr,
        right: Expr,
        /// `false` compares strings case-insensitively.
        match_case: bool,
    },
    Between {
        expr: Expr,
        lower: Expr,
        upper: Expr,
    },
    Like {
        expr: Expr,
        pattern: String,
        wildcard: char,
        single_char: char,
        escape: char,
        match_case: bool,
    },
    IsNull(Expr),
    Bbox {
        property: String,
        envelope: Envelope,
    },
    Spatial {
        op: SpatialOp,
        property: String,
        geometry: Geometry,
        distance: Option<f64>,
    },
    /// Feature-id set membership.
    Id(BTreeSet<String>),
}

impl Filter {
    /// Conjunction with identity simplification: `Include` children are
    /// dropped, any `Exclude` child makes the whole conjunction `Exclude`,
    /// a single child is returned as is and no children yield `Include`.
    #[must_use]
    pub fn and(children: impl IntoIterator<Item = Filter>) -> Filter {
        let mut kept = Vec::new();
        for child in children {
            match child {
                Filter::Include => {}
                Filter::Exclude => return Filter::Exclude,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Filter::Include,
            1 => kept.pop().unwrap_or(Filter::Include),
            _ => Filter::And(kept),
        }
    }

    /// Disjunction with identity simplification, the dual of [`Filter::and`].
    #[must_use]
    pub fn or(children: impl IntoIterator<Item = Filter>) -> Filter {
        let mut kept = Vec::new();
        for child in children {
            match child {
                Filter::Exclude => {}
                Filter::Include => return Filter::Include,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Filter::Exclude,
            1 => kept.pop().unwrap_or(Filter::Exclude),
            _ => Filter::Or(kept),
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Filter) -> Filter {
        Filter::Not(Box::new(child))
    }

    /// Case-sensitive comparison of a property with a literal.
    #[must_use]
    pub fn compare(op: CompareOp, property: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Compare {
            op,
            left: Expr::property(property),
            right: Expr::literal(value),
            match_case: true,
        }
    }

    /// `property = value`.
    #[must_use]
    pub fn equals(property: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(CompareOp::Eq, property, value)
    }

    #[must_use]
    pub fn between(property: impl Into<String>, lower: impl Into<Value>, upper: impl Into<Value>) -> Filter {
        Filter::Between {
            expr: Expr::property(property),
            lower: Expr::literal(lower),
            upper: Expr::literal(upper),
        }
    }

    /// `LIKE` with `%`, `_` and `\` as wildcard, single-char and escape.
    #[must_use]
    pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Filter {
        Filter::Like {
            expr: Expr::property(property),
            pattern: pattern.into(),
            wildcard: '%',
            single_char: '_',
            escape: '\\',
            match_case: true,
        }
    }

    #[must_use]
    pub fn is_null(property: impl Into<String>) -> Filter {
        Filter::IsNull(Expr::property(property))
    }

    #[must_use]
    pub fn bbox(property: impl Into<String>, envelope: Envelope) -> Filter {
        Filter::Bbox {
            property: property.into(),
            envelope,
        }
    }

    #[must_use]
    pub fn spatial(op: SpatialOp, property: impl Into<String>, geometry: Geometry) -> Filter {
        Filter::Spatial {
            op,
            property: property.into(),
            geometry,
            distance: None,
        }
    }

    /// Feature-id membership over the given ids.
    #[must_use]
    pub fn id<I, S>(ids: I) -> Filter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::Id(ids.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn is_include(&self) -> bool {
        matches!(self, Filter::Include)
    }

    #[must_use]
    pub fn is_exclude(&self) -> bool {
        matches!(self, Filter::Exclude)
    }

    /// Names of all attributes this filter reads.
    #[must_use]
    pub fn property_names(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Filter::Include | Filter::Exclude | Filter::Id(_) => {}
            Filter::And(children) | Filter::Or(children) => {
                children.iter().for_each(|c| c.collect_properties(out));
            }
            Filter::Not(child) => child.collect_properties(out),
            Filter::Compare { left, right, .. } => {
                left.collect_properties(out);
                right.collect_properties(out);
            }
            Filter::Between { expr, lower, upper } => {
                expr.collect_properties(out);
                lower.collect_properties(out);
                upper.collect_properties(out);
            }
            Filter::Like { expr, .. } | Filter::IsNull(expr) => expr.collect_properties(out),
            Filter::Bbox { property, .. } | Filter::Spatial { property, .. } => {
                out.insert(property.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_simplifies_identities() {
        assert_eq!(Filter::and(Vec::<Filter>::new()), Filter::Include);
        assert_eq!(Filter::and([Filter::Include, Filter::equals("a", 1)]), Filter::equals("a", 1));
        assert_eq!(Filter::and([Filter::equals("a", 1), Filter::Exclude]), Filter::Exclude);
    }

    #[test]
    fn or_simplifies_identities() {
        assert_eq!(Filter::or(Vec::<Filter>::new()), Filter::Exclude);
        assert_eq!(Filter::or([Filter::Exclude, Filter::equals("a", 1)]), Filter::equals("a", 1));
        assert_eq!(Filter::or([Filter::equals("a", 1), Filter::Include]), Filter::Include);
    }

    #[test]
    fn property_names_walks_the_tree() {
        let f = Filter::and([
            Filter::equals("name", "x"),
            Filter::not(Filter::Compare {
                op: CompareOp::Gt,
                left: Expr::function("strLength", vec![Expr::property("label")]),
                right: Expr::literal(3),
                match_case: true,
            }),
            Filter::bbox("geom", Envelope::new(0.0, 0.0, 1.0, 1.0)),
            Filter::id(["road.1"]),
        ]);
        let names: Vec<_> = f.property_names().into_iter().collect();
        assert_eq!(names, vec!["geom", "label", "name"]);
    }
}
