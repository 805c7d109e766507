//! Attribute values, geometries and envelopes.
//!
//! Geometries are carried as WKT text. The only geometric operations offered
//! here are envelope extraction and geometry-type naming; real geometry
//! algorithms belong to an external library.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Runtime value of a feature attribute or a filter literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL` / missing attribute.
    Null,
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// Geometry in WKT form.
    Geometry(Geometry),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string payload, if this is a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the geometry payload, if this is a [`Value::Geometry`].
    #[must_use]
    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text rendering used by `LIKE` matching and string functions.
    ///
    /// `Null` has no text form.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Geometry(g) => Some(g.wkt.clone()),
        }
    }

    /// Compares two values the way a SQL engine would.
    ///
    /// Integers and floats compare numerically, strings lexically (by code
    /// point), booleans with `false < true`. A string compared with a number
    /// is parsed as a number first. Anything involving `Null`, geometries or
    /// mismatched kinds is unordered.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(s), Value::Int(_) | Value::Float(_)) => {
                s.trim().parse::<f64>().ok()?.partial_cmp(&other.as_f64()?)
            }
            (Value::Int(_) | Value::Float(_), Value::String(s)) => {
                self.as_f64()?.partial_cmp(&s.trim().parse::<f64>().ok()?)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::Geometry(g) => f.write_str(&g.wkt),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Geometry> for Value {
    fn from(v: Geometry) -> Self {
        Value::Geometry(v)
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// A geometry held as Well-Known Text plus an optional spatial reference id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub wkt: String,
    pub srid: Option<i32>,
}

/// Canonical geometry type names, keyed by their upper-case WKT tag.
const GEOMETRY_TYPES: &[(&str, &str)] = &[
    ("POINT", "Point"),
    ("LINESTRING", "LineString"),
    ("POLYGON", "Polygon"),
    ("MULTIPOINT", "MultiPoint"),
    ("MULTILINESTRING", "MultiLineString"),
    ("MULTIPOLYGON", "MultiPolygon"),
    ("GEOMETRYCOLLECTION", "GeometryCollection"),
    ("LINEARRING", "LinearRing"),
];

impl Geometry {
    /// Creates a geometry without an SRID.
    #[must_use]
    pub fn new(wkt: impl Into<String>) -> Self {
        Self {
            wkt: wkt.into(),
            srid: None,
        }
    }

    /// Creates a geometry tagged with `srid`.
    #[must_use]
    pub fn with_srid(wkt: impl Into<String>, srid: i32) -> Self {
        Self {
            wkt: wkt.into(),
            srid: Some(srid),
        }
    }

    /// Geometry type name (`"Polygon"`, `"MultiPoint"`, ...) read from the WKT tag.
    #[must_use]
    pub fn geometry_type(&self) -> Option<&'static str> {
        let tag: String = self
            .wkt
            .trim_start()
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .collect::<String>()
            .to_ascii_uppercase();
        GEOMETRY_TYPES
            .iter()
            .find(|(wkt_tag, _)| *wkt_tag == tag)
            .map(|(_, name)| *name)
    }

    /// Bounding envelope of all coordinates in the WKT.
    ///
    /// Returns `None` for `EMPTY` geometries and for text that carries no
    /// parsable coordinates. Z and M ordinates are skipped.
    #[must_use]
    pub fn envelope(&self) -> Option<Envelope> {
        let body_start = self.wkt.find('(')?;
        let header = self.wkt[..body_start].to_ascii_uppercase();
        let mut dims = 2;
        if header.contains("ZM") {
            dims = 4;
        } else if header.trim_end().ends_with(" Z") || header.trim_end().ends_with(" M") {
            dims = 3;
        }

        let mut envelope: Option<Envelope> = None;
        for tuple in self.wkt[body_start..]
            .split([',', '(', ')'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let ordinates: Vec<f64> = tuple
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<_, _>>()
                .ok()?;
            if ordinates.len() < 2 || ordinates.len() > dims.max(2) {
                return None;
            }
            let point = Envelope::from_point(ordinates[0], ordinates[1]);
            match envelope.as_mut() {
                Some(env) => env.expand_to_include(&point),
                None => envelope = Some(point),
            }
        }
        envelope
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Axis-aligned bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Creates an envelope, normalizing swapped corners. Corners containing
    /// NaN are kept as given so [`is_nan`](Self::is_nan) still reports them.
    #[must_use]
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        if [x1, y1, x2, y2].iter().any(|v| v.is_nan()) {
            return Self {
                min_x: x1,
                min_y: y1,
                max_x: x2,
                max_y: y2,
            };
        }
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Degenerate envelope covering a single point.
    #[must_use]
    pub fn from_point(x: f64, y: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    /// `true` if any bound is NaN.
    #[must_use]
    pub fn is_nan(&self) -> bool {
        self.min_x.is_nan() || self.min_y.is_nan() || self.max_x.is_nan() || self.max_y.is_nan()
    }

    /// `true` if the two rectangles share at least one point (boundaries included).
    #[must_use]
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// `true` if `other` lies entirely inside this envelope.
    #[must_use]
    pub fn contains(&self, other: &Envelope) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && other.max_x <= self.max_x
            && other.max_y <= self.max_y
    }

    pub fn expand_to_include(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Euclidean distance between the closest points of two envelopes
    /// (zero when they intersect).
    #[must_use]
    pub fn distance(&self, other: &Envelope) -> f64 {
        let dx = (other.min_x - self.max_x).max(self.min_x - other.max_x).max(0.0);
        let dy = (other.min_y - self.max_y).max(self.min_y - other.max_y).max(0.0);
        dx.hypot(dy)
    }
}
