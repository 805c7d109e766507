//! `GeoStore` Core: feature model, filter algebra, capability-driven
//! filter splitting, feature-id mapping and SQL planning.
//!
//! Nothing here touches a database; the store crate executes what this
//! crate plans.

pub mod capabilities;
pub mod dialect;
pub mod encoder;
pub mod error;
pub mod feature;
pub mod fid;
pub mod filter;
pub mod query;
pub mod splitter;
pub mod sql;
pub mod value;

pub use capabilities::{Capabilities, CapabilitiesBuilder, OperatorTag};
pub use dialect::{Dialect, OracleDialect, PostgisDialect, SqliteDialect};
pub use encoder::{EncodeContext, FilterEncoder, SqlFilterEncoder};
pub use error::{EncodeError, MappingError, PlanningError, UnsupportedMapping};
pub use feature::{AttributeDescriptor, AttributeType, Attributes, Feature, FeatureType};
pub use fid::{
    AutoIncrementFidMapper, CompositeFidMapper, FidMapper, KeyGeneration, KeyType, NullFidMapper,
    OidFidMapper, SequenceFidMapper, TypedFidMapper,
};
pub use filter::{ArithmeticOp, CompareOp, Expr, Filter, SpatialOp};
pub use query::{Projection, Query, SortBy, SortOrder};
pub use splitter::{FilterSplitter, SplitFilter};
pub use sql::{SelectRequest, SqlBuilder};
pub use value::{Envelope, Geometry, Value};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
