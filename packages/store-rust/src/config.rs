//! Store configuration.

use serde::Deserialize;

/// Settings of one [`FeatureStore`](crate::FeatureStore) instance.
///
/// Deserializable with every field optional, so deployments can load it
/// from whatever format they already use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database schema holding the feature tables.
    pub schema: Option<String>,
    /// Qualify table names with `schema` in generated SQL.
    pub qualify_schema: bool,
    /// Lock duration used when a caller passes none.
    pub default_lock_duration_ms: u64,
    /// Interval of the background expiry sweep. `0` disables the sweep and
    /// leaves expiry to the lazy check on access.
    pub lock_sweep_interval_ms: u64,
    /// Per-statement timeout. `None` waits for the driver.
    pub query_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema: None,
            qualify_schema: false,
            default_lock_duration_ms: 300_000,
            lock_sweep_interval_ms: 0,
            query_timeout_ms: None,
        }
    }
}
