mod common;

use std::sync::Arc;

use common::store_with;
use geostore_core::{Attributes, Filter};
use geostore_store::{Clock, FeatureLock, FeatureLockError, ManualClock, StoreConfig, StoreError, TransactionRef};

fn rd1() -> Filter {
    Filter::id(["road.rd1"])
}

async fn store_at(clock: &Arc<ManualClock>) -> geostore_store::FeatureStore {
    let clock: Arc<dyn Clock> = clock.clone();
    store_with(StoreConfig::default(), Some(clock)).await
}

#[tokio::test]
async fn second_token_fails_to_lock_the_same_feature() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = store_at(&clock).await;
    let auto = TransactionRef::AutoCommit;

    let first = store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("T1", 1000), &auto)
        .await
        .unwrap();
    assert_eq!(first.locked, ["road.rd1"]);

    let second = store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("T2", 1000), &auto)
        .await
        .unwrap();
    assert!(second.locked.is_empty());
    assert_eq!(second.failed_fids().collect::<Vec<_>>(), ["road.rd1"]);
}

#[tokio::test]
async fn batch_lock_reports_what_succeeded() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_at(&clock).await;
    let auto = TransactionRef::AutoCommit;
    store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("A", 1000), &auto)
        .await
        .unwrap();
    let outcome = store
        .lock_features("road", &Filter::Include, &FeatureLock::with_authorization("B", 1000), &auto)
        .await
        .unwrap();
    assert_eq!(outcome.locked, ["road.rd2"]);
    assert_eq!(outcome.failed_fids().collect::<Vec<_>>(), ["road.rd1"]);
}

#[tokio::test]
async fn locked_features_reject_unauthorized_writes() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_at(&clock).await;
    let auto = TransactionRef::AutoCommit;
    store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("T1", 1000), &auto)
        .await
        .unwrap();

    let change = Attributes::new().with("name", "Oak Avenue");
    let err = store.modify_features("road", &rd1(), &change, &auto).await.unwrap_err();
    assert!(
        matches!(&err, StoreError::Lock(FeatureLockError::Locked { fid, .. }) if fid == "road.rd1"),
        "{err}"
    );
    assert!(store.remove_features("road", &rd1(), &auto).await.is_err());

    let tx = store.begin();
    tx.add_authorization("T1");
    store
        .modify_features("road", &rd1(), &change, &TransactionRef::from(&tx))
        .await
        .unwrap();
    store.commit(&tx).await.unwrap();

    // Expired locks no longer guard the feature.
    clock.advance(1000);
    store.remove_features("road", &rd1(), &auto).await.unwrap();
}

#[tokio::test]
async fn unlocking_needs_an_explicit_transaction_with_the_token() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_at(&clock).await;
    let auto = TransactionRef::AutoCommit;
    store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("T1", 60_000), &auto)
        .await
        .unwrap();

    let err = store.unlock_features("road", &rd1(), &auto).await.unwrap_err();
    assert!(matches!(err, StoreError::Lock(FeatureLockError::AutoCommitUnlock { .. })));

    let stranger = store.begin();
    let err = store
        .unlock_features("road", &rd1(), &TransactionRef::from(&stranger))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Lock(FeatureLockError::NotAuthorized { .. })));

    let owner = store.begin();
    owner.add_authorization("T1");
    let unlocked = store
        .unlock_features("road", &Filter::Include, &TransactionRef::from(&owner))
        .await
        .unwrap();
    assert_eq!(unlocked, ["road.rd1"]);
    assert!(!store
        .lock_manager()
        .is_locked(&geostore_store::LockKey::new("road", "road.rd1")));
}

#[tokio::test]
async fn transaction_locks_end_with_the_transaction() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_at(&clock).await;
    let tx = store.begin();
    let lock = FeatureLock::new(60_000);
    let outcome = store
        .lock_features("road", &rd1(), &lock, &TransactionRef::from(&tx))
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert!(tx.has_authorization(&lock.authorization));
    assert!(store.lock_manager().exists(&lock.authorization));

    store.rollback(&tx).unwrap();
    assert!(!store.lock_manager().exists(&lock.authorization));
}

#[tokio::test]
async fn refresh_and_release_by_token() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_at(&clock).await;
    let lock = FeatureLock::with_authorization("T", 1000);
    store
        .lock_features("road", &Filter::Include, &lock, &TransactionRef::AutoCommit)
        .await
        .unwrap();

    let tx = store.begin();
    let holder = TransactionRef::from(&tx);
    assert!(store.refresh_locks("T", &holder).is_err());
    tx.add_authorization("T");

    clock.advance(900);
    assert_eq!(store.refresh_locks("T", &holder).unwrap(), 2);
    clock.advance(900);
    assert!(store.lock_manager().exists("T"));
    assert_eq!(store.release_locks("T", &holder).unwrap(), 2);
    assert!(!store.lock_manager().exists("T"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lockers_have_exactly_one_winner() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(store_at(&clock).await);
    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .lock_features(
                        "road",
                        &rd1(),
                        &FeatureLock::with_authorization(format!("T{i}"), 60_000),
                        &TransactionRef::AutoCommit,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    let mut losers = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        winners += outcome.locked.len();
        losers += outcome.failed_fids().filter(|f| *f == "road.rd1").count();
    }
    assert_eq!((winners, losers), (1, 1));
}

#[tokio::test]
async fn background_sweeper_follows_config() {
    let clock = Arc::new(ManualClock::new(0));
    let config = StoreConfig {
        lock_sweep_interval_ms: 60_000,
        ..StoreConfig::default()
    };
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let store = store_with(config, Some(clock_dyn)).await;
    store
        .lock_features("road", &rd1(), &FeatureLock::with_authorization("T", 10), &TransactionRef::AutoCommit)
        .await
        .unwrap();

    let mut sweeper = store.spawn_lock_sweeper().expect("sweep interval configured");
    clock.advance(10);
    assert_eq!(sweeper.purge_now().await.unwrap(), 1);
    sweeper.stop().await;

    assert!(common::store().await.spawn_lock_sweeper().is_none());
}
