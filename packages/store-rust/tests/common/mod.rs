//! Shared fixtures: an in-memory `SQLite` database with `river` and `road`
//! tables and a store over it.

#![allow(dead_code)]

use std::sync::Arc;

use geostore_core::{
    AttributeDescriptor, AttributeType, AutoIncrementFidMapper, FeatureType, KeyType, SqliteDialect,
    TypedFidMapper,
};
use geostore_store::{Clock, FeatureStore, SqliteExecutor, StoreConfig};

pub const SCHEMA: &str = r#"
CREATE TABLE "river" (
    "fid" INTEGER PRIMARY KEY AUTOINCREMENT,
    "river" TEXT,
    "flow" REAL,
    "geom" TEXT
);
INSERT INTO "river" ("fid", "river", "flow", "geom")
    VALUES (1, 'rv2', 10.0, 'POLYGON ((0 0, 4 0, 4 4, 0 0))');
INSERT INTO "river" ("fid", "river", "flow", "geom")
    VALUES (2, 'rv1', 5.0, 'LINESTRING (0 0, 1 1)');

CREATE TABLE "road" (
    "fid" TEXT PRIMARY KEY,
    "name" TEXT
);
INSERT INTO "road" ("fid", "name") VALUES ('rd1', 'Main Street');
INSERT INTO "road" ("fid", "name") VALUES ('rd2', 'High Street');
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn river_type() -> FeatureType {
    FeatureType::new(
        "river",
        Arc::new(TypedFidMapper::new("river", Arc::new(AutoIncrementFidMapper::integer("fid")))),
    )
    .with_attribute(AttributeDescriptor::new("river", AttributeType::Text))
    .with_attribute(AttributeDescriptor::new("flow", AttributeType::Float))
    .with_attribute(AttributeDescriptor::new("geom", AttributeType::Geometry { srid: None }))
}

pub fn road_type() -> FeatureType {
    FeatureType::new(
        "road",
        Arc::new(TypedFidMapper::new(
            "road",
            Arc::new(AutoIncrementFidMapper::new("fid", KeyType::Text)),
        )),
    )
    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
}

pub async fn executor() -> SqliteExecutor {
    init_tracing();
    let executor = SqliteExecutor::open_in_memory().expect("open sqlite");
    executor.run_script(SCHEMA).await.expect("create schema");
    executor
}

pub async fn store_with(config: StoreConfig, clock: Option<Arc<dyn Clock>>) -> FeatureStore {
    let executor = executor().await;
    let mut store = FeatureStore::new(Arc::new(executor), Arc::new(SqliteDialect), config);
    if let Some(clock) = clock {
        store = store.with_clock(clock);
    }
    store.register_type(river_type());
    store.register_type(road_type());
    store
}

pub async fn store() -> FeatureStore {
    store_with(StoreConfig::default(), None).await
}

pub fn ids(features: &[geostore_core::Feature]) -> Vec<&str> {
    features.iter().map(|f| f.id.as_str()).collect()
}
