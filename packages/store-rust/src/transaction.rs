//! Units of work.
//!
//! A [`Transaction`] holds the lock authorizations it carries and a journal of
//! writes not yet visible outside it. Writes on features the transaction
//! itself inserted are folded into the pending insert, so the journal only
//! ever addresses rows that exist in the database or are about to be created.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use geostore_core::{Attributes, Feature, Value};
use parking_lot::Mutex;

use crate::error::StoreError;

/// Identifier of an explicit transaction, unique per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A buffered write, in issuance order.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Insert {
        type_name: String,
        feature: Feature,
        /// Explicit key values; `None` leaves the key to the database.
        key: Option<Vec<Value>>,
    },
    Update {
        type_name: String,
        fids: Vec<String>,
        changes: Attributes,
    },
    Delete {
        type_name: String,
        fids: Vec<String>,
    },
}

impl PendingWrite {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            PendingWrite::Insert { type_name, .. }
            | PendingWrite::Update { type_name, .. }
            | PendingWrite::Delete { type_name, .. } => type_name,
        }
    }
}

/// The transaction's own view of one feature type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDiff {
    pub inserted: Vec<Feature>,
    /// Accumulated changes per existing feature.
    pub modified: BTreeMap<String, Attributes>,
    pub removed: BTreeSet<String>,
}

impl TypeDiff {
    /// Existing features whose database state the transaction overrides.
    #[must_use]
    pub fn touched(&self) -> BTreeSet<String> {
        self.modified.keys().chain(&self.removed).cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Applies the diff to one database row; `None` if the row was removed.
    #[must_use]
    pub fn apply(&self, mut feature: Feature) -> Option<Feature> {
        if self.removed.contains(&feature.id) {
            return None;
        }
        if let Some(changes) = self.modified.get(&feature.id) {
            for (name, value) in changes.iter() {
                feature.attributes.set(name, value.clone());
            }
        }
        Some(feature)
    }
}

#[derive(Debug)]
struct TxState {
    open: bool,
    authorizations: BTreeSet<String>,
    journal: Vec<PendingWrite>,
}

/// An explicit transaction. Shared as `Arc<Transaction>`.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: Mutex<TxState>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: Mutex::new(TxState {
                open: true,
                authorizations: BTreeSet::new(),
                journal: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Fails with [`StoreError::TransactionClosed`] once committed or rolled back.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed { id: self.id.0 })
        }
    }

    /// Adds proof of ownership of the locks issued under `token`.
    pub fn add_authorization(&self, token: impl Into<String>) {
        self.state.lock().authorizations.insert(token.into());
    }

    #[must_use]
    pub fn has_authorization(&self, token: &str) -> bool {
        self.state.lock().authorizations.contains(token)
    }

    #[must_use]
    pub fn authorizations(&self) -> BTreeSet<String> {
        self.state.lock().authorizations.clone()
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().journal.len()
    }

    pub(crate) fn record_insert(&self, type_name: &str, feature: Feature, key: Option<Vec<Value>>) -> Result<(), StoreError> {
        let mut state = self.open_state()?;
        state.journal.push(PendingWrite::Insert {
            type_name: type_name.to_string(),
            feature,
            key,
        });
        Ok(())
    }

    pub(crate) fn record_update(&self, type_name: &str, fids: Vec<String>, changes: &Attributes) -> Result<(), StoreError> {
        let mut state = self.open_state()?;
        let mut existing = Vec::with_capacity(fids.len());
        for fid in fids {
            match pending_insert(&mut state.journal, type_name, &fid) {
                Some(feature) => {
                    for (name, value) in changes.iter() {
                        feature.attributes.set(name, value.clone());
                    }
                }
                None => existing.push(fid),
            }
        }
        if !existing.is_empty() {
            state.journal.push(PendingWrite::Update {
                type_name: type_name.to_string(),
                fids: existing,
                changes: changes.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn record_delete(&self, type_name: &str, fids: Vec<String>) -> Result<(), StoreError> {
        let mut state = self.open_state()?;
        let mut existing = Vec::with_capacity(fids.len());
        for fid in fids {
            let before = state.journal.len();
            state.journal.retain(|w| {
                !matches!(w, PendingWrite::Insert { type_name: t, feature, .. } if t == type_name && feature.id == fid)
            });
            if state.journal.len() == before {
                existing.push(fid);
            }
        }
        if !existing.is_empty() {
            state.journal.push(PendingWrite::Delete {
                type_name: type_name.to_string(),
                fids: existing,
            });
        }
        Ok(())
    }

    /// The transaction's view of `type_name`, or `None` if it wrote nothing there.
    #[must_use]
    pub fn diff(&self, type_name: &str) -> Option<TypeDiff> {
        let state = self.state.lock();
        let mut diff = TypeDiff::default();
        for write in state.journal.iter().filter(|w| w.type_name() == type_name) {
            match write {
                PendingWrite::Insert { feature, .. } => diff.inserted.push(feature.clone()),
                PendingWrite::Update { fids, changes, .. } => {
                    for fid in fids.iter().filter(|f| !diff.removed.contains(*f)) {
                        let entry = diff.modified.entry(fid.clone()).or_default();
                        for (name, value) in changes.iter() {
                            entry.set(name, value.clone());
                        }
                    }
                }
                PendingWrite::Delete { fids, .. } => {
                    for fid in fids {
                        diff.modified.remove(fid);
                        diff.removed.insert(fid.clone());
                    }
                }
            }
        }
        (!diff.is_empty()).then_some(diff)
    }

    /// Every `(type, fid)` of an existing feature the journal writes to.
    #[must_use]
    pub fn written_features(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let mut out = BTreeSet::new();
        for write in &state.journal {
            match write {
                PendingWrite::Update { type_name, fids, .. } | PendingWrite::Delete { type_name, fids } => {
                    out.extend(fids.iter().map(|f| (type_name.clone(), f.clone())));
                }
                PendingWrite::Insert { .. } => {}
            }
        }
        out.into_iter().collect()
    }

    pub(crate) fn journal(&self) -> Vec<PendingWrite> {
        self.state.lock().journal.clone()
    }

    /// Closes the transaction, dropping its journal.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.journal.clear();
        state.authorizations.clear();
    }

    fn open_state(&self) -> Result<parking_lot::MutexGuard<'_, TxState>, StoreError> {
        let state = self.state.lock();
        if state.open {
            Ok(state)
        } else {
            Err(StoreError::TransactionClosed { id: self.id.0 })
        }
    }
}

fn pending_insert<'j>(journal: &'j mut [PendingWrite], type_name: &str, fid: &str) -> Option<&'j mut Feature> {
    journal.iter_mut().find_map(|w| match w {
        PendingWrite::Insert { type_name: t, feature, .. } if t == type_name && feature.id == fid => Some(feature),
        _ => None,
    })
}

/// The transaction an operation runs under.
#[derive(Debug, Clone, Default)]
pub enum TransactionRef {
    /// Every write is applied immediately; locks taken here are long-term.
    #[default]
    AutoCommit,
    Explicit(Arc<Transaction>),
}

impl TransactionRef {
    #[must_use]
    pub fn explicit(&self) -> Option<&Arc<Transaction>> {
        match self {
            TransactionRef::AutoCommit => None,
            TransactionRef::Explicit(tx) => Some(tx),
        }
    }

    /// Authorizations carried; always empty under auto-commit.
    #[must_use]
    pub fn authorizations(&self) -> BTreeSet<String> {
        self.explicit().map(|tx| tx.authorizations()).unwrap_or_default()
    }
}

impl From<Arc<Transaction>> for TransactionRef {
    fn from(tx: Arc<Transaction>) -> Self {
        TransactionRef::Explicit(tx)
    }
}

impl From<&Arc<Transaction>> for TransactionRef {
    fn from(tx: &Arc<Transaction>) -> Self {
        TransactionRef::Explicit(Arc::clone(tx))
    }
}
