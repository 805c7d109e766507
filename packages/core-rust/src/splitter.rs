//! Capability-aware filter splitting.
//!
//! [`FilterSplitter::split`] partitions a filter into a part the store
//! evaluates natively and a residual evaluated client-side. The server part
//! may match more rows than the original filter but never fewer; the post
//! filter removes the extras.

use std::collections::BTreeSet;

use tracing::debug;

use crate::capabilities::{Capabilities, OperatorTag};
use crate::feature::FeatureType;
use crate::filter::{Expr, Filter};

/// Result of [`FilterSplitter::split`].
#[derive(Debug, Clone, PartialEq)]
pub struct SplitFilter {
    /// Pushed to the store.
    pub server: Filter,
    /// Applied to the rows the store returns.
    pub post: Filter,
}

impl SplitFilter {
    /// `true` when the store evaluates the whole filter.
    #[must_use]
    pub fn is_fully_pushed(&self) -> bool {
        self.post.is_include()
    }
}

/// Splits filters against a fixed set of capabilities.
///
/// Pure and `Send + Sync`: one instance may serve concurrent callers.
#[derive(Debug, Clone)]
pub struct FilterSplitter {
    capabilities: Capabilities,
    attributes: Option<BTreeSet<String>>,
}

impl FilterSplitter {
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            attributes: None,
        }
    }

    /// Restricts property references to the attributes of `feature_type`;
    /// filters naming anything else are treated as malformed.
    #[must_use]
    pub fn with_schema(mut self, feature_type: &FeatureType) -> Self {
        self.attributes = Some(feature_type.attributes.iter().map(|d| d.name.clone()).collect());
        self
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Splits `filter` into server and post parts.
    ///
    /// Malformed filters are never pushed: the server part becomes `Include`
    /// and the whole filter is evaluated client-side.
    #[must_use]
    pub fn split(&self, filter: &Filter) -> SplitFilter {
        if let Err(reason) = self.check_well_formed(filter) {
            debug!(reason = %reason, "filter is malformed, evaluating it client-side");
            return SplitFilter {
                server: Filter::Include,
                post: filter.clone(),
            };
        }
        let split = self.split_node(filter);
        debug!(
            pushed = !split.server.is_include(),
            residual = !split.post.is_include(),
            "split filter"
        );
        split
    }

    fn split_node(&self, filter: &Filter) -> SplitFilter {
        match filter {
            Filter::Include => SplitFilter {
                server: Filter::Include,
                post: Filter::Include,
            },
            Filter::And(children) => {
                let (mut servers, posts): (Vec<Filter>, Vec<Filter>) = children
                    .iter()
                    .map(|c| {
                        let part = self.split_node(c);
                        (part.server, part.post)
                    })
                    .unzip();
                servers.retain(|s| !s.is_include());
                if servers.len() > 1 && !self.capabilities.supports(OperatorTag::And) {
                    // Only one conjunct can be pushed without AND support.
                    let rest = servers.split_off(1);
                    return SplitFilter {
                        server: Filter::and(servers),
                        post: Filter::and(rest.into_iter().chain(posts)),
                    };
                }
                SplitFilter {
                    server: Filter::and(servers),
                    post: Filter::and(posts),
                }
            }
            Filter::Or(children) => {
                if !self.capabilities.supports(OperatorTag::Or) {
                    return client_side(filter);
                }
                let parts: Vec<SplitFilter> = children.iter().map(|c| self.split_node(c)).collect();
                if parts.iter().all(SplitFilter::is_fully_pushed) {
                    SplitFilter {
                        server: Filter::or(parts.into_iter().map(|p| p.server)),
                        post: Filter::Include,
                    }
                } else if parts.iter().all(|p| !p.server.is_include()) {
                    // Each branch's server part is a superset of that branch,
                    // so their disjunction is a superset of the whole.
                    SplitFilter {
                        server: Filter::or(parts.into_iter().map(|p| p.server)),
                        post: filter.clone(),
                    }
                } else {
                    client_side(filter)
                }
            }
            Filter::Not(child) => {
                let inner = self.split_node(child);
                if self.capabilities.supports(OperatorTag::Not) && inner.is_fully_pushed() {
                    SplitFilter {
                        server: Filter::not(inner.server),
                        post: Filter::Include,
                    }
                } else {
                    client_side(filter)
                }
            }
            leaf => {
                if self.leaf_supported(leaf) {
                    server_side(leaf)
                } else {
                    client_side(leaf)
                }
            }
        }
    }

    fn leaf_supported(&self, filter: &Filter) -> bool {
        let caps = &self.capabilities;
        match filter {
            Filter::Include => true,
            Filter::Exclude => caps.supports(OperatorTag::Exclude),
            Filter::Compare {
                left,
                right,
                match_case,
                ..
            } => {
                caps.supports(OperatorTag::SimpleComparisons)
                    && (*match_case || caps.supports(OperatorTag::CaseInsensitiveComparisons))
                    && self.expr_supported(left)
                    && self.expr_supported(right)
            }
            Filter::Between { expr, lower, upper } => {
                caps.supports(OperatorTag::Between)
                    && self.expr_supported(expr)
                    && self.expr_supported(lower)
                    && self.expr_supported(upper)
            }
            Filter::Like { expr, match_case, .. } => {
                let tag = if *match_case {
                    OperatorTag::Like
                } else {
                    OperatorTag::CaseInsensitiveLike
                };
                caps.supports(tag) && self.expr_supported(expr)
            }
            Filter::IsNull(expr) => caps.supports(OperatorTag::NullCheck) && self.expr_supported(expr),
            Filter::Bbox { .. } => caps.supports(OperatorTag::Bbox),
            Filter::Spatial { op, .. } => caps.supports(OperatorTag::spatial(*op)),
            Filter::Id(_) => caps.supports(OperatorTag::Id),
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => false,
        }
    }

    fn expr_supported(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Property(_) | Expr::Literal(_) => true,
            Expr::Function { name, args } => {
                self.capabilities.supports_function(name) && args.iter().all(|a| self.expr_supported(a))
            }
            Expr::Arithmetic { left, right, .. } => {
                self.capabilities.supports(OperatorTag::Arithmetic)
                    && self.expr_supported(left)
                    && self.expr_supported(right)
            }
        }
    }

    fn check_well_formed(&self, filter: &Filter) -> Result<(), String> {
        match filter {
            Filter::Include | Filter::Exclude | Filter::Id(_) => Ok(()),
            Filter::And(children) | Filter::Or(children) => {
                if children.is_empty() {
                    return Err("logical operator without operands".into());
                }
                children.iter().try_for_each(|c| self.check_well_formed(c))
            }
            Filter::Not(child) => self.check_well_formed(child),
            Filter::Compare { left, right, .. } => {
                self.check_expr(left)?;
                self.check_expr(right)
            }
            Filter::Between { expr, lower, upper } => {
                self.check_expr(expr)?;
                self.check_expr(lower)?;
                self.check_expr(upper)
            }
            Filter::Like { expr, .. } | Filter::IsNull(expr) => self.check_expr(expr),
            Filter::Bbox { property, envelope } => {
                if envelope.is_nan() {
                    return Err("bounding box with NaN bounds".into());
                }
                self.check_property(property)
            }
            Filter::Spatial {
                op,
                property,
                distance,
                ..
            } => {
                if op.is_distance() && !distance.is_some_and(f64::is_finite) {
                    return Err(format!("{op} without a finite distance"));
                }
                self.check_property(property)
            }
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), String> {
        match expr {
            Expr::Property(name) => self.check_property(name),
            Expr::Literal(value) => match value.as_f64() {
                Some(n) if !n.is_finite() => Err("non-finite numeric literal".into()),
                _ => Ok(()),
            },
            Expr::Function { name, args } => {
                if name.is_empty() {
                    return Err("function without a name".into());
                }
                args.iter().try_for_each(|a| self.check_expr(a))
            }
            Expr::Arithmetic { left, right, .. } => {
                self.check_expr(left)?;
                self.check_expr(right)
            }
        }
    }

    fn check_property(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("empty property name".into());
        }
        match &self.attributes {
            Some(attributes) if !attributes.contains(name) => Err(format!("unknown property '{name}'")),
            _ => Ok(()),
        }
    }
}

fn server_side(filter: &Filter) -> SplitFilter {
    SplitFilter {
        server: filter.clone(),
        post: Filter::Include,
    }
}

fn client_side(filter: &Filter) -> SplitFilter {
    SplitFilter {
        server: Filter::Include,
        post: filter.clone(),
    }
}
