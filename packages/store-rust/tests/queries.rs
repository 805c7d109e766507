mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ids, store, store_with};
use geostore_core::{
    AttributeDescriptor, AttributeType, Attributes, Capabilities, CompareOp, Expr, FeatureType, Filter, FilterSplitter,
    NullFidMapper, OperatorTag, PlanningError, Projection, Query, SelectRequest, SortBy, SqlBuilder, SqliteDialect,
    Value,
};
use geostore_store::{FeatureStore, Row, SqlExecutor, StoreConfig, StoreError, TransactionRef};

fn is_polygon() -> Filter {
    Filter::Compare {
        op: CompareOp::Eq,
        left: Expr::function("geometryType", vec![Expr::property("geom")]),
        right: Expr::literal("Polygon"),
        match_case: true,
    }
}

#[tokio::test]
async fn unsupported_function_is_evaluated_client_side() {
    let caps = Capabilities::builder()
        .operators(OperatorTag::ALL)
        .functions(["abs", "strLength"])
        .build();
    let split = FilterSplitter::new(caps.clone()).split(&is_polygon());
    assert_eq!(split.server, Filter::Include);
    assert_eq!(split.post, is_polygon());

    let store = store().await.with_capabilities(&caps);
    let query = Query::new("river").with_filter(is_polygon());
    let features = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(ids(&features), ["river.1"]);
    assert_eq!(store.count(&query, &TransactionRef::AutoCommit).await.unwrap(), 1);
}

#[tokio::test]
async fn attribute_sort_orders_rows() {
    let store = store().await;
    let query = Query::new("river").with_sort(vec![SortBy::asc("river")]);
    let features = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(ids(&features), ["river.2", "river.1"]);
    assert_eq!(features[0].get("river"), Some(&Value::from("rv1")));
}

#[tokio::test]
async fn offset_without_sort_pages_in_key_order() {
    let store = store().await;
    let query = Query::new("river").with_start_index(1).with_max_features(1);
    let features = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(ids(&features), ["river.2"]);
}

#[tokio::test]
async fn malformed_ids_are_stripped() {
    let store = store().await;
    let filter = Filter::id(["river.1", "_5", "river._5"]);

    let ft = store.feature_type("river").unwrap();
    let sql = SqlBuilder::new(Arc::new(SqliteDialect))
        .select(&SelectRequest::new(&ft).with_filter(filter.clone()))
        .unwrap();
    assert!(sql.ends_with("WHERE \"fid\" IN (1)"), "{sql}");

    let query = Query::new("river").with_filter(filter);
    let features = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(ids(&features), ["river.1"]);

    let none_valid = Query::new("river").with_filter(Filter::id(["_5"]));
    assert!(store
        .get_features(&none_valid, &TransactionRef::AutoCommit)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn repeated_pages_are_identical() {
    let store = store().await;
    let rows: Vec<_> = (0..12)
        .map(|i| Attributes::new().with("river", format!("rv{}", i % 3)).with("flow", f64::from(i)))
        .collect();
    store.add_features("river", rows, &TransactionRef::AutoCommit).await.unwrap();

    for sort in [vec![], vec![SortBy::asc("river")], vec![SortBy::desc("river"), SortBy::Natural]] {
        for (offset, limit) in [(1, 3), (4, 4), (10, 10)] {
            let query = Query::new("river")
                .with_sort(sort.clone())
                .with_start_index(offset)
                .with_max_features(limit);
            let first = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
            let second = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
            assert_eq!(first, second);
        }
    }
}

#[tokio::test]
async fn client_side_paging_matches_pushed_paging() {
    let store = store().await;
    let rows: Vec<_> = (0..6)
        .map(|i| Attributes::new().with("river", format!("x{i}")))
        .collect();
    store.add_features("river", rows, &TransactionRef::AutoCommit).await.unwrap();

    // Like is not native to SQLite, so this page is cut client-side.
    let like = Query::new("river")
        .with_filter(Filter::like("river", "%"))
        .with_sort(vec![SortBy::desc("river")])
        .with_start_index(2)
        .with_max_features(3);
    let pushed = Query::new("river")
        .with_filter(Filter::compare(CompareOp::NotEq, "river", ""))
        .with_sort(vec![SortBy::desc("river")])
        .with_start_index(2)
        .with_max_features(3);
    let a = store.get_features(&like, &TransactionRef::AutoCommit).await.unwrap();
    let b = store.get_features(&pushed, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(a.len(), 3);
}

#[tokio::test]
async fn projection_returns_requested_attributes_only() {
    let store = store().await;
    let query = Query::new("river")
        .with_properties(Projection::names(["flow"]))
        .with_filter(Filter::equals("river", "rv1"));
    let features = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].attributes.names().collect::<Vec<_>>(), ["flow"]);
    assert_eq!(features[0].get("flow"), Some(&Value::Float(5.0)));
}

#[tokio::test]
async fn counts_follow_paging() {
    let store = store().await;
    let all = Query::new("river");
    assert_eq!(store.count(&all, &TransactionRef::AutoCommit).await.unwrap(), 2);
    assert_eq!(
        store
            .count(&all.clone().with_start_index(1), &TransactionRef::AutoCommit)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .count(&all.with_max_features(0), &TransactionRef::AutoCommit)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn planning_errors_surface_before_execution() {
    let store = store().await;
    let query = Query::new("river").with_sort(vec![SortBy::asc("depth")]);
    let err = store.get_features(&query, &TransactionRef::AutoCommit).await.unwrap_err();
    assert!(matches!(err, StoreError::Planning(_)), "{err}");

    let err = store
        .get_features(&Query::new("lake"), &TransactionRef::AutoCommit)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownType(name) if name == "lake"));
}

#[tokio::test]
async fn unknown_sort_attribute_fails_when_sorting_in_memory() {
    let caps = Capabilities::builder()
        .operators(OperatorTag::ALL)
        .functions(["abs", "strLength"])
        .build();
    let store = store().await.with_capabilities(&caps);
    let residual = Query::new("river")
        .with_filter(is_polygon())
        .with_sort(vec![SortBy::asc("depth")]);
    let err = store
        .get_features(&residual, &TransactionRef::AutoCommit)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, StoreError::Planning(PlanningError::UnknownSortAttribute { attribute, .. }) if attribute == "depth"),
        "{err}"
    );
    assert!(matches!(
        store.count(&residual, &TransactionRef::AutoCommit).await,
        Err(StoreError::Planning(PlanningError::UnknownSortAttribute { .. }))
    ));

    let tx = store.begin();
    let inside = TransactionRef::from(&tx);
    store
        .add_features("river", vec![Attributes::new().with("river", "rv3")], &inside)
        .await
        .unwrap();
    let sorted = Query::new("river").with_sort(vec![SortBy::desc("depth")]);
    let err = store.get_features(&sorted, &inside).await.unwrap_err();
    assert!(
        matches!(&err, StoreError::Planning(PlanningError::UnknownSortAttribute { .. })),
        "{err}"
    );
}

#[tokio::test]
async fn keyless_tables_reject_key_orders_in_memory_too() {
    let store = store().await;
    store.register_type(
        FeatureType::new("gauge", Arc::new(NullFidMapper))
            .with_attribute(AttributeDescriptor::new("name", AttributeType::Text)),
    );
    let tx = store.begin();
    let inside = TransactionRef::from(&tx);

    let natural = Query::new("gauge").with_sort(vec![SortBy::Natural]);
    assert!(matches!(
        store.get_features(&natural, &inside).await,
        Err(StoreError::Planning(PlanningError::NoPrimaryKey { .. }))
    ));
    let paged = Query::new("gauge")
        .with_filter(Filter::like("name", "g%"))
        .with_start_index(1);
    assert!(matches!(
        store.get_features(&paged, &TransactionRef::AutoCommit).await,
        Err(StoreError::Planning(PlanningError::UnstablePaging { .. }))
    ));
}

struct StalledExecutor;

#[async_trait]
impl SqlExecutor for StalledExecutor {
    async fn query(&self, _sql: &str) -> anyhow::Result<Vec<Row>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }

    async fn execute(&self, _sql: &str) -> anyhow::Result<u64> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }

    async fn execute_batch(&self, _statements: &[String]) -> anyhow::Result<Vec<Vec<Row>>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_statements_time_out() {
    let config = StoreConfig {
        query_timeout_ms: Some(250),
        ..StoreConfig::default()
    };
    let store = FeatureStore::new(Arc::new(StalledExecutor), Arc::new(SqliteDialect), config);
    store.register_type(common::river_type());
    let err = store
        .get_features(&Query::new("river"), &TransactionRef::AutoCommit)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Timeout { timeout_ms: 250 }));
}

#[tokio::test(start_paused = true)]
async fn abandoned_commit_closes_the_transaction() {
    let config = StoreConfig {
        query_timeout_ms: Some(250),
        ..StoreConfig::default()
    };
    let store = FeatureStore::new(Arc::new(StalledExecutor), Arc::new(SqliteDialect), config);
    store.register_type(common::river_type());
    let tx = store.begin();
    store
        .add_features("river", vec![Attributes::new().with("river", "rv3")], &TransactionRef::from(&tx))
        .await
        .unwrap();

    let err = store.commit(&tx).await.unwrap_err();
    assert!(matches!(err, StoreError::OutcomeUnknown { timeout_ms: 250 }), "{err}");
    assert!(!tx.is_open());
    assert!(matches!(
        store.commit(&tx).await,
        Err(StoreError::TransactionClosed { .. })
    ));
}

#[tokio::test]
async fn schema_from_config_is_not_applied_on_sqlite() {
    let config = StoreConfig {
        schema: Some("hydro".into()),
        qualify_schema: true,
        ..StoreConfig::default()
    };
    let store = store_with(config, None).await;
    assert_eq!(store.feature_type("river").unwrap().schema.as_deref(), Some("hydro"));
    let features = store
        .get_features(&Query::new("river"), &TransactionRef::AutoCommit)
        .await
        .unwrap();
    assert_eq!(features.len(), 2);
}
