//! The feature store facade: splits filters, plans and runs SQL, applies
//! transaction diffs and post filters, and enforces feature locks on writes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use geostore_core::{
    AttributeType, Attributes, Capabilities, Dialect, Feature, FeatureType, FidMapper, Filter, FilterSplitter,
    KeyGeneration, MappingError, PlanningError, Projection, Query, SelectRequest, SortBy, SortOrder, SqlBuilder,
    Value,
};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{FeatureLockError, StoreError};
use crate::executor::{Row, SqlExecutor};
use crate::lock::{FeatureLock, LockKey, LockManager, LockOutcome, LockOwner, LockSweeper};
use crate::transaction::{PendingWrite, Transaction, TransactionId, TransactionRef, TypeDiff};

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub statements: usize,
    /// Provisional ids handed out by `add_features` mapped to the ids the
    /// database assigned.
    pub assigned_fids: BTreeMap<String, String>,
}

/// Data access for the registered feature types of one database.
pub struct FeatureStore {
    executor: Arc<dyn SqlExecutor>,
    builder: SqlBuilder,
    capabilities: Capabilities,
    types: DashMap<String, Arc<FeatureType>>,
    locks: Arc<LockManager>,
    config: StoreConfig,
    next_tx: AtomicU64,
}

impl FeatureStore {
    /// A store pushing down what `dialect` evaluates natively, on the
    /// system clock.
    #[must_use]
    pub fn new(executor: Arc<dyn SqlExecutor>, dialect: Arc<dyn Dialect>, config: StoreConfig) -> Self {
        let capabilities = dialect.native_capabilities();
        let builder = SqlBuilder::new(dialect).qualify_schema(config.qualify_schema);
        Self {
            executor,
            builder,
            capabilities,
            types: DashMap::new(),
            locks: Arc::new(LockManager::new(Arc::new(SystemClock))),
            config,
            next_tx: AtomicU64::new(1),
        }
    }

    /// Replaces the lock clock. Drops any lock already taken.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.locks = Arc::new(LockManager::new(clock));
        self
    }

    /// Restricts pushdown to `capabilities`; operators the dialect cannot
    /// encode stay client-side regardless.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &Capabilities) -> Self {
        self.capabilities = capabilities.intersection(&self.builder.dialect().native_capabilities());
        self
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Starts the background expiry sweep if the configuration asks for one.
    #[must_use]
    pub fn spawn_lock_sweeper(&self) -> Option<LockSweeper> {
        (self.config.lock_sweep_interval_ms > 0)
            .then(|| LockSweeper::start(Arc::clone(&self.locks), self.config.lock_sweep_interval_ms))
    }

    /// Registers a feature type, placing it in the configured schema unless
    /// it names its own.
    pub fn register_type(&self, mut feature_type: FeatureType) {
        if feature_type.schema.is_none() {
            feature_type.schema.clone_from(&self.config.schema);
        }
        debug!(type_name = %feature_type.name, mapper = feature_type.fid_mapper.kind(), "registered feature type");
        self.types.insert(feature_type.name.clone(), Arc::new(feature_type));
    }

    /// # Errors
    ///
    /// [`StoreError::UnknownType`] if `type_name` was never registered.
    pub fn feature_type(&self, type_name: &str) -> Result<Arc<FeatureType>, StoreError> {
        self.types
            .get(type_name)
            .map(|ft| Arc::clone(ft.value()))
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    /// Opens an explicit transaction.
    #[must_use]
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TransactionId(self.next_tx.fetch_add(1, AtomicOrdering::Relaxed));
        debug!(tx = %id, "transaction started");
        Arc::new(Transaction::new(id))
    }

    // -- reads --------------------------------------------------------------

    /// Features matching `query` as seen from `tx`.
    ///
    /// # Errors
    ///
    /// Planning errors before any SQL runs, backend errors and timeouts from
    /// the executor, [`StoreError::TransactionClosed`] for a finished
    /// transaction.
    pub async fn get_features(&self, query: &Query, tx: &TransactionRef) -> Result<Vec<Feature>, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(&query.type_name)?;
        self.check_order(&ft, query)?;
        if query.max_features == Some(0) {
            return Ok(Vec::new());
        }

        let split = FilterSplitter::new(self.capabilities.clone())
            .with_schema(&ft)
            .split(&query.filter);
        let diff = tx.explicit().and_then(|t| t.diff(&ft.name));
        let (server, post) = match &diff {
            Some(diff) => {
                let touched = diff.touched();
                let server = if touched.is_empty() {
                    split.server
                } else {
                    Filter::or([split.server, Filter::id(touched)])
                };
                (server, query.filter.clone())
            }
            None => (split.server, split.post),
        };
        let push_paging = post.is_include() && diff.is_none();

        let request = SelectRequest::new(&ft)
            .with_properties(fetch_projection(&ft, &query.properties, &post, &query.sort_by))
            .with_filter(server);
        let request = if push_paging {
            request
                .with_sort(query.sort_by.clone())
                .with_paging(query.offset(), query.max_features)
        } else {
            request
        };
        let sql = self.builder.select(&request)?;
        let rows = self.run(self.executor.query(&sql)).await?;

        let mut features: Vec<Feature> = rows.into_iter().filter_map(|row| row_to_feature(&ft, row)).collect();
        if let Some(diff) = &diff {
            features = apply_diff(diff, features);
        }
        if !post.is_include() {
            features.retain(|f| post.evaluate(f));
        }
        if !push_paging {
            features = sort_and_page(&ft, features, &query.sort_by, query.offset(), query.max_features);
        }
        if let Projection::Names(names) = &query.properties {
            for feature in &mut features {
                feature.attributes.retain(|n| names.iter().any(|p| p == n));
            }
        }
        debug!(type_name = %ft.name, returned = features.len(), pushed_paging = push_paging, "features read");
        Ok(features)
    }

    /// Number of features `get_features` would return.
    ///
    /// # Errors
    ///
    /// Same as [`get_features`](Self::get_features).
    pub async fn count(&self, query: &Query, tx: &TransactionRef) -> Result<u64, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(&query.type_name)?;
        self.check_order(&ft, query)?;
        if query.max_features == Some(0) {
            return Ok(0);
        }
        let split = FilterSplitter::new(self.capabilities.clone())
            .with_schema(&ft)
            .split(&query.filter);
        let has_diff = tx.explicit().is_some_and(|t| t.diff(&ft.name).is_some());
        if split.is_fully_pushed() && !has_diff {
            let request = SelectRequest::new(&ft)
                .with_filter(split.server)
                .with_paging(query.offset(), query.max_features);
            let sql = self.builder.count(&request)?;
            let rows = self.run(self.executor.query(&sql)).await?;
            let count = rows
                .first()
                .and_then(|row| row.iter().next())
                .and_then(|(_, value)| match value {
                    Value::Int(n) => u64::try_from(*n).ok(),
                    _ => None,
                })
                .ok_or_else(|| anyhow::anyhow!("count query returned no number"))?;
            return Ok(count);
        }
        let ids_only = query.clone().with_properties(Projection::Names(Vec::new()));
        Ok(self.get_features(&ids_only, tx).await?.len() as u64)
    }

    // -- writes -------------------------------------------------------------

    /// Inserts features, returning their ids.
    ///
    /// Under auto-commit the rows are written immediately and the ids are
    /// final. Inside a transaction, features whose key the database assigns
    /// get provisional ids, resolved in [`CommitSummary::assigned_fids`].
    ///
    /// # Errors
    ///
    /// Planning and mapping errors before any SQL runs; backend errors.
    pub async fn add_features(
        &self,
        type_name: &str,
        features: Vec<Attributes>,
        tx: &TransactionRef,
    ) -> Result<Vec<String>, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(type_name)?;
        let mut fids = Vec::with_capacity(features.len());
        for attributes in features {
            check_attributes(&ft, &attributes)?;
            let key = assigned_key(&ft, &attributes)?;
            let known_fid = match (&key, ft.fid_mapper.key_generation()) {
                (Some(key), _) => Some(ft.fid_mapper.encode(key)?),
                (None, KeyGeneration::None) => Some(ft.fid_mapper.encode(&[])?),
                (None, _) => None,
            };

            let fid = match tx.explicit() {
                Some(t) => {
                    let fid = known_fid.unwrap_or_else(provisional_fid);
                    t.record_insert(type_name, Feature::new(fid.clone(), attributes), key)?;
                    fid
                }
                None => {
                    let sql = self.builder.insert_returning(&ft, key.as_deref(), &attributes)?;
                    match known_fid {
                        Some(fid) => {
                            self.run_write(self.executor.execute(&sql)).await?;
                            fid
                        }
                        None => {
                            let rows = self.run_write(self.executor.query(&sql)).await?;
                            returned_fid(&ft, rows.first()).unwrap_or_else(|| {
                                warn!(type_name = %type_name, "database returned no key for inserted feature");
                                provisional_fid()
                            })
                        }
                    }
                }
            };
            fids.push(fid);
        }
        if tx.explicit().is_none() {
            info!(type_name = %type_name, added = fids.len(), "features added");
        }
        Ok(fids)
    }

    /// Sets `changes` on every feature matching `filter`, returning the ids
    /// of the modified features.
    ///
    /// # Errors
    ///
    /// [`StoreError::Lock`] naming the first feature locked under a token
    /// the transaction lacks; planning and backend errors.
    pub async fn modify_features(
        &self,
        type_name: &str,
        filter: &Filter,
        changes: &Attributes,
        tx: &TransactionRef,
    ) -> Result<Vec<String>, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(type_name)?;
        if changes.is_empty() {
            return Err(PlanningError::EmptyUpdate {
                type_name: ft.name.clone(),
            }
            .into());
        }
        check_attributes(&ft, changes)?;
        let fids = self.matching_fids(&ft, filter, tx).await?;
        if fids.is_empty() {
            return Ok(fids);
        }
        self.assert_access(&ft, &fids, tx)?;
        match tx.explicit() {
            Some(t) => t.record_update(type_name, fids.clone(), changes)?,
            None => {
                let sql = self.builder.update(&ft, changes, &Filter::id(fids.iter().cloned()))?;
                self.write_pinned(&ft, &fids, &sql).await?;
                info!(type_name = %type_name, modified = fids.len(), "features modified");
            }
        }
        Ok(fids)
    }

    /// Deletes every feature matching `filter`, returning their ids.
    ///
    /// # Errors
    ///
    /// Same as [`modify_features`](Self::modify_features).
    pub async fn remove_features(
        &self,
        type_name: &str,
        filter: &Filter,
        tx: &TransactionRef,
    ) -> Result<Vec<String>, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(type_name)?;
        let fids = self.matching_fids(&ft, filter, tx).await?;
        if fids.is_empty() {
            return Ok(fids);
        }
        self.assert_access(&ft, &fids, tx)?;
        match tx.explicit() {
            Some(t) => t.record_delete(type_name, fids.clone())?,
            None => {
                let sql = self.builder.delete(&ft, &Filter::id(fids.iter().cloned()))?;
                self.write_pinned(&ft, &fids, &sql).await?;
                info!(type_name = %type_name, removed = fids.len(), "features removed");
            }
        }
        Ok(fids)
    }

    // -- locking ------------------------------------------------------------

    /// Locks every feature matching `filter`, best effort.
    ///
    /// Inside a transaction the locks belong to it and its authorizations
    /// gain the lock's token; under auto-commit they are long-term.
    ///
    /// # Errors
    ///
    /// Errors of the matching query only; contention is reported per
    /// feature in the [`LockOutcome`].
    pub async fn lock_features(
        &self,
        type_name: &str,
        filter: &Filter,
        lock: &FeatureLock,
        tx: &TransactionRef,
    ) -> Result<LockOutcome, StoreError> {
        ensure_open(tx)?;
        let ft = self.feature_type(type_name)?;
        let fids = self.matching_fids(&ft, filter, tx).await?;
        let owner = match tx.explicit() {
            Some(t) => {
                t.add_authorization(lock.authorization.clone());
                LockOwner::Transaction(t.id())
            }
            None => LockOwner::LongTerm,
        };
        Ok(self
            .locks
            .lock_features(type_name, fids.iter().map(String::as_str), lock, owner))
    }

    /// Unlocks every feature matching `filter`. Only valid inside a
    /// transaction carrying the locks' tokens; nothing is unlocked unless
    /// every locked match is authorized.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::AutoCommitUnlock`] under auto-commit,
    /// [`FeatureLockError::NotAuthorized`] naming the first unauthorized
    /// feature.
    pub async fn unlock_features(
        &self,
        type_name: &str,
        filter: &Filter,
        tx: &TransactionRef,
    ) -> Result<Vec<String>, StoreError> {
        let Some(t) = tx.explicit() else {
            return Err(FeatureLockError::AutoCommitUnlock {
                type_name: type_name.to_string(),
            }
            .into());
        };
        t.ensure_open()?;
        let ft = self.feature_type(type_name)?;
        let fids = self.matching_fids(&ft, filter, tx).await?;
        let authorizations = t.authorizations();
        let keys: Vec<LockKey> = fids.iter().map(|f| LockKey::new(type_name, f.as_str())).collect();
        for key in &keys {
            self.locks.check_unlock(key, &authorizations)?;
        }
        let mut unlocked = Vec::new();
        for key in keys {
            if self.locks.is_locked(&key) {
                self.locks.unlock_feature(&key, &authorizations)?;
                unlocked.push(key.fid);
            }
        }
        info!(type_name = %type_name, unlocked = unlocked.len(), "features unlocked");
        Ok(unlocked)
    }

    /// Extends every lock held under `token`.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::UnknownAuthorization`] unless `tx` carries a
    /// token with live locks.
    pub fn refresh_locks(&self, token: &str, tx: &TransactionRef) -> Result<usize, StoreError> {
        Ok(self.locks.refresh(token, &tx.authorizations())?)
    }

    /// Releases every lock held under `token`.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::UnknownAuthorization`] unless `tx` carries `token`.
    pub fn release_locks(&self, token: &str, tx: &TransactionRef) -> Result<usize, StoreError> {
        Ok(self.locks.release(token, &tx.authorizations())?)
    }

    // -- transactions -------------------------------------------------------

    /// Applies the transaction's writes atomically, after checking every
    /// written feature's lock again.
    ///
    /// On error the transaction stays open with its journal intact, except
    /// for [`StoreError::OutcomeUnknown`], which closes it. A timed-out batch
    /// keeps its features pinned until the executor confirms it stopped.
    ///
    /// # Errors
    ///
    /// [`StoreError::Lock`] if a written feature is now locked by someone
    /// else; planning, backend and timeout errors.
    pub async fn commit(&self, tx: &Arc<Transaction>) -> Result<CommitSummary, StoreError> {
        tx.ensure_open()?;
        let journal = tx.journal();
        let keys: Vec<LockKey> = tx
            .written_features()
            .into_iter()
            .map(|(type_name, fid)| LockKey::new(type_name, fid))
            .collect();

        let mut statements = Vec::with_capacity(journal.len());
        let mut provisional = Vec::new();
        for write in &journal {
            let ft = self.feature_type(write.type_name())?;
            let sql = match write {
                PendingWrite::Insert { feature, key, .. } => {
                    if key.is_none() && !ft.fid_mapper.column_names().is_empty() {
                        provisional.push((statements.len(), Arc::clone(&ft), feature.id.clone()));
                    }
                    self.builder.insert_returning(&ft, key.as_deref(), &feature.attributes)?
                }
                PendingWrite::Update { fids, changes, .. } => {
                    self.builder.update(&ft, changes, &Filter::id(fids.iter().cloned()))?
                }
                PendingWrite::Delete { fids, .. } => self.builder.delete(&ft, &Filter::id(fids.iter().cloned()))?,
            };
            statements.push(sql);
        }

        let pin = self.locks.pin_for_commit(tx.id(), &keys, &tx.authorizations())?;
        let results = self.run_write(self.executor.execute_batch(&statements)).await;
        drop(pin);
        let results = match results {
            Ok(results) => results,
            Err(err @ StoreError::OutcomeUnknown { .. }) => {
                // Replaying the journal could apply it twice.
                let released = self.locks.release_owned_by(tx.id());
                tx.close();
                warn!(tx = %tx.id(), released_locks = released, "transaction closed with unknown outcome");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let mut assigned_fids = BTreeMap::new();
        for (index, ft, provisional_id) in provisional {
            if let Some(fid) = returned_fid(&ft, results.get(index).and_then(|rows| rows.first())) {
                assigned_fids.insert(provisional_id, fid);
            }
        }
        let released = self.locks.release_owned_by(tx.id());
        tx.close();
        info!(tx = %tx.id(), statements = statements.len(), released_locks = released, "transaction committed");
        Ok(CommitSummary {
            statements: statements.len(),
            assigned_fids,
        })
    }

    /// Discards the transaction's writes and releases the locks it owns.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionClosed`] if already finished.
    pub fn rollback(&self, tx: &Arc<Transaction>) -> Result<(), StoreError> {
        tx.ensure_open()?;
        let released = self.locks.release_owned_by(tx.id());
        tx.close();
        info!(tx = %tx.id(), released_locks = released, "transaction rolled back");
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    /// Runs a statement under the configured timeout. A statement that
    /// overruns is interrupted and awaited until settled; if the executor
    /// cannot interrupt, it is abandoned.
    async fn run_bounded<T>(
        &self,
        statement: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<anyhow::Result<T>, Expired> {
        let Some(timeout_ms) = self.config.query_timeout_ms else {
            return Ok(statement.await);
        };
        let mut statement = std::pin::pin!(statement);
        if let Ok(result) = tokio::time::timeout(Duration::from_millis(timeout_ms), statement.as_mut()).await {
            return Ok(result);
        }
        if !self.executor.interrupt() {
            warn!(timeout_ms, "statement timed out and was abandoned");
            return Err(Expired {
                timeout_ms,
                settled: false,
            });
        }
        match statement.await {
            Err(err) => {
                debug!(timeout_ms, error = %err, "statement interrupted after timeout");
                Err(Expired {
                    timeout_ms,
                    settled: true,
                })
            }
            done => {
                warn!(timeout_ms, "statement completed before the interrupt took effect");
                Ok(done)
            }
        }
    }

    async fn run<T>(&self, statement: impl Future<Output = anyhow::Result<T>>) -> Result<T, StoreError> {
        match self.run_bounded(statement).await {
            Ok(result) => result.map_err(StoreError::Backend),
            Err(expired) => Err(StoreError::Timeout {
                timeout_ms: expired.timeout_ms,
            }),
        }
    }

    /// Like [`run`](Self::run), but an abandoned write reports
    /// [`StoreError::OutcomeUnknown`].
    async fn run_write<T>(&self, statement: impl Future<Output = anyhow::Result<T>>) -> Result<T, StoreError> {
        match self.run_bounded(statement).await {
            Ok(result) => result.map_err(StoreError::Backend),
            Err(Expired { timeout_ms, settled: true }) => Err(StoreError::Timeout { timeout_ms }),
            Err(Expired { timeout_ms, settled: false }) => Err(StoreError::OutcomeUnknown { timeout_ms }),
        }
    }

    /// Sort and paging are validated up front, whether they end up in SQL
    /// or are applied in memory.
    fn check_order(&self, ft: &FeatureType, query: &Query) -> Result<(), PlanningError> {
        self.builder.check_order(
            &SelectRequest::new(ft)
                .with_sort(query.sort_by.clone())
                .with_paging(query.offset(), query.max_features),
        )
    }

    async fn matching_fids(&self, ft: &FeatureType, filter: &Filter, tx: &TransactionRef) -> Result<Vec<String>, StoreError> {
        let query = Query::new(ft.name.clone())
            .with_filter(filter.clone())
            .with_properties(Projection::Names(Vec::new()));
        Ok(self.get_features(&query, tx).await?.into_iter().map(|f| f.id).collect())
    }

    fn assert_access(&self, ft: &FeatureType, fids: &[String], tx: &TransactionRef) -> Result<(), StoreError> {
        let authorizations = tx.authorizations();
        let tx_id = tx.explicit().map(|t| t.id());
        for fid in fids {
            self.locks
                .assert_access(&LockKey::new(ft.name.as_str(), fid.as_str()), &authorizations, tx_id)?;
        }
        Ok(())
    }

    /// Runs an auto-commit write with its features pinned against
    /// concurrent lockers.
    async fn write_pinned(&self, ft: &FeatureType, fids: &[String], sql: &str) -> Result<u64, StoreError> {
        let id = TransactionId(self.next_tx.fetch_add(1, AtomicOrdering::Relaxed));
        let keys: Vec<LockKey> = fids.iter().map(|f| LockKey::new(ft.name.as_str(), f.as_str())).collect();
        let pin = self.locks.pin_for_commit(id, &keys, &BTreeSet::new())?;
        let result = self.run_write(self.executor.execute(sql)).await;
        drop(pin);
        result
    }
}

/// A statement that overran the query timeout. `settled` is `true` once
/// the executor confirmed it stopped without taking effect.
struct Expired {
    timeout_ms: u64,
    settled: bool,
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("builder", &self.builder)
            .field("types", &self.types.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn ensure_open(tx: &TransactionRef) -> Result<(), StoreError> {
    tx.explicit().map_or(Ok(()), |t| t.ensure_open())
}

fn provisional_fid() -> String {
    format!("new-{}", uuid::Uuid::new_v4())
}

fn check_attributes(ft: &FeatureType, attributes: &Attributes) -> Result<(), PlanningError> {
    let key_columns = ft.fid_mapper.column_names();
    match attributes
        .names()
        .find(|n| !ft.has_attribute(n) && !key_columns.iter().any(|c| c == n))
    {
        Some(name) => Err(PlanningError::UnknownAttribute {
            type_name: ft.name.clone(),
            attribute: name.to_string(),
        }),
        None => Ok(()),
    }
}

/// Key values of a feature whose key the caller assigns.
fn assigned_key(ft: &FeatureType, attributes: &Attributes) -> Result<Option<Vec<Value>>, MappingError> {
    if ft.fid_mapper.key_generation() != KeyGeneration::Assigned {
        return Ok(None);
    }
    let columns = ft.fid_mapper.column_names();
    let key: Vec<Value> = columns
        .iter()
        .filter_map(|c| attributes.get(c).filter(|v| !v.is_null()).cloned())
        .collect();
    if key.len() != columns.len() {
        return Err(MappingError::Arity {
            expected: columns.len(),
            actual: key.len(),
        });
    }
    Ok(Some(key))
}

fn key_values(mapper: &dyn FidMapper, row: &Row) -> Option<Vec<Value>> {
    mapper
        .column_names()
        .iter()
        .map(|c| row.get(c).cloned())
        .collect()
}

fn returned_fid(ft: &FeatureType, row: Option<&Row>) -> Option<String> {
    let key = key_values(ft.fid_mapper.as_ref(), row?)?;
    ft.fid_mapper.encode(&key).ok()
}

/// Attributes to fetch: the requested ones plus whatever the post filter
/// and a client-side sort read.
fn fetch_projection(ft: &FeatureType, requested: &Projection, post: &Filter, sort_by: &[SortBy]) -> Projection {
    let Projection::Names(names) = requested else {
        return Projection::All;
    };
    let mut fetch = names.clone();
    let extra = post.property_names().into_iter().chain(sort_by.iter().filter_map(|s| match s {
        SortBy::Attribute { name, .. } => Some(name.as_str()),
        SortBy::Natural | SortBy::Reverse => None,
    }));
    for name in extra {
        if ft.has_attribute(name) && !fetch.iter().any(|n| n == name) {
            fetch.push(name.to_string());
        }
    }
    Projection::Names(fetch)
}

fn row_to_feature(ft: &FeatureType, row: Row) -> Option<Feature> {
    let key = key_values(ft.fid_mapper.as_ref(), &row).unwrap_or_default();
    let fid = match ft.fid_mapper.encode(&key) {
        Ok(fid) => fid,
        Err(err) => {
            warn!(type_name = %ft.name, error = %err, "skipping row with unmappable key");
            return None;
        }
    };
    let mut attributes = Attributes::new();
    for descriptor in &ft.attributes {
        if let Some(value) = row.get(&descriptor.name) {
            attributes.set(descriptor.name.as_str(), coerce(value.clone(), descriptor.binding));
        }
    }
    Some(Feature::new(fid, attributes))
}

/// Maps driver values onto the declared binding.
fn coerce(value: Value, binding: AttributeType) -> Value {
    match (binding, value) {
        (AttributeType::Geometry { srid }, Value::String(wkt)) => Value::Geometry(geostore_core::Geometry { wkt, srid }),
        (AttributeType::Boolean, Value::Int(n)) => Value::Bool(n != 0),
        #[allow(clippy::cast_precision_loss)]
        (AttributeType::Float, Value::Int(n)) => Value::Float(n as f64),
        (_, value) => value,
    }
}

fn apply_diff(diff: &TypeDiff, features: Vec<Feature>) -> Vec<Feature> {
    features
        .into_iter()
        .filter_map(|f| diff.apply(f))
        .chain(diff.inserted.iter().cloned())
        .collect()
}

/// Client-side counterpart of the planner's ORDER BY and paging. Nulls sort
/// last ascending; the key order breaks ties.
fn sort_and_page(
    ft: &FeatureType,
    features: Vec<Feature>,
    sort_by: &[SortBy],
    offset: Option<u64>,
    limit: Option<u64>,
) -> Vec<Feature> {
    let mapper = ft.fid_mapper.as_ref();
    let columns = mapper.column_names();
    let mut keyed: Vec<(Option<Vec<Value>>, Feature)> =
        features.into_iter().map(|f| (mapper.decode(&f.id).ok(), f)).collect();

    keyed.sort_by(|(ka, a), (kb, b)| {
        sort_by
            .iter()
            .map(|sort| match sort {
                SortBy::Natural => compare_keys(ka.as_ref(), kb.as_ref()),
                SortBy::Reverse => compare_keys(ka.as_ref(), kb.as_ref()).reverse(),
                SortBy::Attribute { name, order } => {
                    let ord = compare_values(
                        sort_value(a, ka.as_ref(), columns, name),
                        sort_value(b, kb.as_ref(), columns, name),
                    );
                    match order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    }
                }
            })
            .find(|o| o.is_ne())
            .unwrap_or_else(|| compare_keys(ka.as_ref(), kb.as_ref()))
    });

    let skip = usize::try_from(offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let take = limit.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
    keyed.into_iter().skip(skip).take(take).map(|(_, f)| f).collect()
}

fn sort_value<'f>(feature: &'f Feature, key: Option<&'f Vec<Value>>, columns: &[String], name: &str) -> Option<&'f Value> {
    feature
        .get(name)
        .or_else(|| columns.iter().position(|c| c == name).and_then(|i| key?.get(i)))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.filter(|v| !v.is_null()), b.filter(|v| !v.is_null())) {
        (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Undecodable (provisional) ids sort after every stored key.
fn compare_keys(a: Option<&Vec<Value>>, b: Option<&Vec<Value>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a
            .iter()
            .zip(b)
            .map(|(x, y)| compare_values(Some(x), Some(y)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use geostore_core::{AttributeDescriptor, AutoIncrementFidMapper, TypedFidMapper};

    use super::*;

    fn river() -> FeatureType {
        FeatureType::new(
            "river",
            Arc::new(TypedFidMapper::new("river", Arc::new(AutoIncrementFidMapper::integer("fid")))),
        )
        .with_attribute(AttributeDescriptor::new("river", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new("flow", AttributeType::Float))
        .with_attribute(AttributeDescriptor::new("geom", AttributeType::Geometry { srid: Some(4326) }))
    }

    fn feature(id: &str, name: Option<&str>) -> Feature {
        let attributes = match name {
            Some(n) => Attributes::new().with("river", n),
            None => Attributes::new().with("river", Value::Null),
        };
        Feature::new(id, attributes)
    }

    #[test]
    fn rows_become_features_with_mapped_ids() {
        let ft = river();
        let row = Attributes::new()
            .with("fid", 7_i64)
            .with("river", "rv1")
            .with("flow", 3_i64)
            .with("geom", "POINT (1 2)");
        let feature = row_to_feature(&ft, row).unwrap();
        assert_eq!(feature.id, "river.7");
        assert_eq!(feature.get("flow"), Some(&Value::Float(3.0)));
        assert_eq!(
            feature.get("geom").and_then(Value::as_geometry).map(|g| g.srid),
            Some(Some(4326))
        );
        assert!(feature.get("fid").is_none());
    }

    #[test]
    fn rows_without_a_key_are_skipped() {
        let ft = river();
        assert!(row_to_feature(&ft, Attributes::new().with("river", "x")).is_none());
        assert!(row_to_feature(&ft, Attributes::new().with("fid", Value::Null)).is_none());
    }

    #[test]
    fn client_sort_matches_sql_ordering() {
        let ft = river();
        let features = vec![
            feature("river.3", Some("b")),
            feature("river.1", None),
            feature("river.2", Some("a")),
            feature("new-x", Some("a")),
        ];
        let sorted = sort_and_page(&ft, features.clone(), &[SortBy::asc("river")], None, None);
        let ids: Vec<_> = sorted.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["river.2", "new-x", "river.3", "river.1"]);

        let page = sort_and_page(&ft, features.clone(), &[SortBy::Reverse], Some(1), Some(2));
        let ids: Vec<_> = page.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["river.3", "river.2"]);

        let natural = sort_and_page(&ft, features, &[], Some(3), None);
        assert_eq!(natural.len(), 1);
        assert_eq!(natural[0].id, "new-x");
    }

    #[test]
    fn projection_widens_for_post_filter_and_sort() {
        let ft = river();
        let fetch = fetch_projection(
            &ft,
            &Projection::names(["geom"]),
            &Filter::equals("river", "a"),
            &[SortBy::desc("flow"), SortBy::asc("fid")],
        );
        assert_eq!(fetch, Projection::names(["geom", "river", "flow"]));
        assert_eq!(
            fetch_projection(&ft, &Projection::All, &Filter::Include, &[]),
            Projection::All
        );
    }

    #[test]
    fn unknown_write_attributes_are_planning_errors() {
        let ft = river();
        assert!(check_attributes(&ft, &Attributes::new().with("river", "a").with("fid", 1_i64)).is_ok());
        assert!(matches!(
            check_attributes(&ft, &Attributes::new().with("nope", 1_i64)),
            Err(PlanningError::UnknownAttribute { attribute, .. }) if attribute == "nope"
        ));
    }
}
