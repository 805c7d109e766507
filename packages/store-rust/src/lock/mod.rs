//! Per-feature locks with authorization tokens and expiry.
//!
//! The lock table is a `DashMap` keyed by `(type, fid)`: every acquire,
//! release and expiry of one feature happens under that key's shard lock, so
//! unrelated features never wait on each other. Expiry is checked lazily on
//! every access; [`LockSweeper`] optionally purges in the background.

mod sweeper;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::FeatureLockError;
use crate::transaction::TransactionId;

pub use sweeper::LockSweeper;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    pub type_name: String,
    pub fid: String,
}

impl LockKey {
    #[must_use]
    pub fn new(type_name: impl Into<String>, fid: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fid: fid.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.fid)
    }
}

/// Request to lock under an authorization token for a duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLock {
    pub authorization: String,
    pub duration_ms: u64,
}

impl FeatureLock {
    /// A lock request with a fresh random token.
    #[must_use]
    pub fn new(duration_ms: u64) -> Self {
        Self {
            authorization: uuid::Uuid::new_v4().to_string(),
            duration_ms,
        }
    }

    #[must_use]
    pub fn with_authorization(authorization: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            authorization: authorization.into(),
            duration_ms,
        }
    }
}

/// Who a lock belongs to, which decides when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// Released when the transaction commits or rolls back.
    Transaction(TransactionId),
    /// Taken under auto-commit; lives until unlock or expiry.
    LongTerm,
}

#[derive(Debug, Clone)]
struct LockEntry {
    authorization: String,
    duration_ms: u64,
    expires_at: u64,
    owner: LockOwner,
}

impl LockEntry {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct LockSlot {
    lock: Option<LockEntry>,
    /// Transaction currently committing writes to this feature.
    pinned_by: Option<TransactionId>,
}

impl LockSlot {
    /// Drops an expired lock and returns the live one, if any.
    fn live(&mut self, now: u64) -> Option<&LockEntry> {
        if self.lock.as_ref().is_some_and(|l| !l.is_live(now)) {
            self.lock = None;
        }
        self.lock.as_ref()
    }

    fn is_empty(&self) -> bool {
        self.lock.is_none() && self.pinned_by.is_none()
    }
}

/// Result of a best-effort batch lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOutcome {
    pub locked: Vec<String>,
    pub failed: Vec<FeatureLockError>,
}

impl LockOutcome {
    /// `true` if every requested feature was locked.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Feature ids that could not be locked.
    pub fn failed_fids(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().filter_map(FeatureLockError::fid)
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Process-wide lock registry of one store.
pub struct LockManager {
    clock: Arc<dyn Clock>,
    slots: DashMap<LockKey, LockSlot>,
}

impl LockManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: DashMap::new(),
        }
    }

    /// Locks one feature, or refreshes it if already held under the same
    /// token.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::Locked`] if another token holds a live lock or
    /// another transaction is committing the feature.
    pub fn lock_feature(&self, key: &LockKey, lock: &FeatureLock, owner: LockOwner) -> Result<(), FeatureLockError> {
        let now = self.clock.now_millis();
        let mut slot = self.slots.entry(key.clone()).or_default();
        let pinned_elsewhere = match (slot.pinned_by, owner) {
            (Some(pin), LockOwner::Transaction(tx)) => pin != tx,
            (Some(_), LockOwner::LongTerm) => true,
            (None, _) => false,
        };
        let held_elsewhere = slot.live(now).is_some_and(|l| l.authorization != lock.authorization);
        if pinned_elsewhere || held_elsewhere {
            return Err(locked(key));
        }
        slot.lock = Some(LockEntry {
            authorization: lock.authorization.clone(),
            duration_ms: lock.duration_ms,
            expires_at: now.saturating_add(lock.duration_ms),
            owner,
        });
        debug!(type_name = %key.type_name, fid = %key.fid, duration_ms = lock.duration_ms, "feature locked");
        Ok(())
    }

    /// Best-effort batch lock: locks what it can and reports the rest.
    pub fn lock_features<'a>(
        &self,
        type_name: &str,
        fids: impl IntoIterator<Item = &'a str>,
        lock: &FeatureLock,
        owner: LockOwner,
    ) -> LockOutcome {
        let mut outcome = LockOutcome::default();
        for fid in fids {
            match self.lock_feature(&LockKey::new(type_name, fid), lock, owner) {
                Ok(()) => outcome.locked.push(fid.to_string()),
                Err(err) => outcome.failed.push(err),
            }
        }
        if !outcome.locked.is_empty() {
            info!(
                type_name = %type_name,
                locked = outcome.locked.len(),
                failed = outcome.failed.len(),
                "locked features"
            );
        }
        outcome
    }

    /// Fails unless the feature could be unlocked with `authorizations`.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::NotAuthorized`] if a live lock's token is missing.
    pub fn check_unlock(&self, key: &LockKey, authorizations: &BTreeSet<String>) -> Result<(), FeatureLockError> {
        let now = self.clock.now_millis();
        match self.slots.get_mut(key) {
            Some(mut slot) => match slot.live(now) {
                Some(l) if !authorizations.contains(&l.authorization) => Err(not_authorized(key)),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Releases the lock on one feature. Unlocked features are a no-op.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::NotAuthorized`] if `authorizations` lacks the
    /// lock's token.
    pub fn unlock_feature(&self, key: &LockKey, authorizations: &BTreeSet<String>) -> Result<(), FeatureLockError> {
        let now = self.clock.now_millis();
        if let Some(mut slot) = self.slots.get_mut(key) {
            if slot.live(now).is_some_and(|l| !authorizations.contains(&l.authorization)) {
                return Err(not_authorized(key));
            }
            slot.lock = None;
        }
        self.slots.remove_if(key, |_, slot| slot.is_empty());
        Ok(())
    }

    /// Fails if a write to the feature would violate someone else's lock.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::Locked`] naming the feature.
    pub fn assert_access(
        &self,
        key: &LockKey,
        authorizations: &BTreeSet<String>,
        tx: Option<TransactionId>,
    ) -> Result<(), FeatureLockError> {
        let now = self.clock.now_millis();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(());
        };
        if slot.pinned_by.is_some_and(|pin| Some(pin) != tx) {
            return Err(locked(key));
        }
        match slot.live(now) {
            Some(l) if !authorizations.contains(&l.authorization) => Err(locked(key)),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn is_locked(&self, key: &LockKey) -> bool {
        let now = self.clock.now_millis();
        self.slots.get_mut(key).is_some_and(|mut slot| slot.live(now).is_some())
    }

    /// `true` if any live lock is held under `token`.
    #[must_use]
    pub fn exists(&self, token: &str) -> bool {
        let now = self.clock.now_millis();
        self.slots.iter().any(|slot| {
            slot.lock
                .as_ref()
                .is_some_and(|l| l.authorization == token && l.is_live(now))
        })
    }

    /// Extends every live lock held under `token` by its original duration.
    /// Returns how many locks were refreshed.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::UnknownAuthorization`] if the caller does not
    /// carry `token` or no live lock uses it.
    pub fn refresh(&self, token: &str, authorizations: &BTreeSet<String>) -> Result<usize, FeatureLockError> {
        if !authorizations.contains(token) {
            return Err(unknown(token));
        }
        let now = self.clock.now_millis();
        let mut refreshed = 0;
        for mut slot in self.slots.iter_mut() {
            if let Some(l) = slot.lock.as_mut() {
                if l.authorization == token && l.is_live(now) {
                    l.expires_at = now.saturating_add(l.duration_ms);
                    refreshed += 1;
                }
            }
        }
        if refreshed == 0 {
            return Err(unknown(token));
        }
        debug!(authorization = %token, refreshed, "refreshed locks");
        Ok(refreshed)
    }

    /// Releases every lock held under `token`. Returns how many were live.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::UnknownAuthorization`] if the caller does not
    /// carry `token`.
    pub fn release(&self, token: &str, authorizations: &BTreeSet<String>) -> Result<usize, FeatureLockError> {
        if !authorizations.contains(token) {
            return Err(unknown(token));
        }
        let now = self.clock.now_millis();
        let released = self.clear_where(|l| l.authorization == token, now);
        info!(authorization = %token, released, "released locks");
        Ok(released)
    }

    /// Releases the locks owned by a finished transaction.
    pub fn release_owned_by(&self, tx: TransactionId) -> usize {
        let now = self.clock.now_millis();
        self.clear_where(|l| l.owner == LockOwner::Transaction(tx), now)
    }

    /// Removes expired locks. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            if slot.lock.as_ref().is_some_and(|l| !l.is_live(now)) {
                slot.lock = None;
                purged += 1;
            }
            !slot.is_empty()
        });
        if purged > 0 {
            debug!(purged, "purged expired locks");
        }
        purged
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.slots
            .iter()
            .filter(|s| s.lock.as_ref().is_some_and(|l| l.is_live(now)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins every feature in `keys` for a committing transaction, checking
    /// its locks again. While pinned, no one else can lock or write them.
    ///
    /// # Errors
    ///
    /// [`FeatureLockError::Locked`] for the first feature that is locked
    /// under a token the transaction lacks or pinned by another commit.
    /// Nothing stays pinned on error.
    pub fn pin_for_commit(
        &self,
        tx: TransactionId,
        keys: &[LockKey],
        authorizations: &BTreeSet<String>,
    ) -> Result<CommitPin<'_>, FeatureLockError> {
        let now = self.clock.now_millis();
        let mut pin = CommitPin {
            manager: self,
            tx,
            keys: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let mut slot = self.slots.entry(key.clone()).or_default();
            if slot.pinned_by.is_some_and(|p| p != tx) {
                return Err(locked(key));
            }
            if slot.live(now).is_some_and(|l| !authorizations.contains(&l.authorization)) {
                return Err(locked(key));
            }
            slot.pinned_by = Some(tx);
            drop(slot);
            pin.keys.push(key.clone());
        }
        Ok(pin)
    }

    fn clear_where(&self, matches: impl Fn(&LockEntry) -> bool, now: u64) -> usize {
        let mut released = 0;
        self.slots.retain(|_, slot| {
            if let Some(l) = slot.lock.as_ref().filter(|l| matches(l)) {
                if l.is_live(now) {
                    released += 1;
                }
                slot.lock = None;
            }
            !slot.is_empty()
        });
        released
    }

    fn unpin(&self, tx: TransactionId, keys: &[LockKey]) {
        for key in keys {
            if let Some(mut slot) = self.slots.get_mut(key) {
                if slot.pinned_by == Some(tx) {
                    slot.pinned_by = None;
                }
            }
            self.slots.remove_if(key, |_, slot| slot.is_empty());
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Commit pins of one transaction; released on drop.
#[derive(Debug)]
pub struct CommitPin<'a> {
    manager: &'a LockManager,
    tx: TransactionId,
    keys: Vec<LockKey>,
}

impl Drop for CommitPin<'_> {
    fn drop(&mut self) {
        self.manager.unpin(self.tx, &self.keys);
    }
}

fn locked(key: &LockKey) -> FeatureLockError {
    FeatureLockError::Locked {
        type_name: key.type_name.clone(),
        fid: key.fid.clone(),
    }
}

fn not_authorized(key: &LockKey) -> FeatureLockError {
    FeatureLockError::NotAuthorized {
        type_name: key.type_name.clone(),
        fid: key.fid.clone(),
    }
}

fn unknown(token: &str) -> FeatureLockError {
    FeatureLockError::UnknownAuthorization {
        token: token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (Arc<ManualClock>, LockManager) {
        let clock = Arc::new(ManualClock::new(10_000));
        (clock.clone(), LockManager::new(clock))
    }

    fn auths(tokens: &[&str]) -> BTreeSet<String> {
        tokens.iter().map(|t| (*t).to_string()).collect()
    }

    fn rd1() -> LockKey {
        LockKey::new("road", "road.rd1")
    }

    #[test]
    fn second_token_is_rejected_naming_the_feature() {
        let (_, locks) = manager();
        let t1 = FeatureLock::with_authorization("T1", 1000);
        let t2 = FeatureLock::with_authorization("T2", 1000);
        assert!(locks.lock_feature(&rd1(), &t1, LockOwner::LongTerm).is_ok());
        let outcome = locks.lock_features("road", ["road.rd1"], &t2, LockOwner::LongTerm);
        assert!(outcome.locked.is_empty());
        assert_eq!(outcome.failed_fids().collect::<Vec<_>>(), vec!["road.rd1"]);
    }

    #[test]
    fn same_token_refreshes_instead_of_failing() {
        let (clock, locks) = manager();
        let t1 = FeatureLock::with_authorization("T1", 1000);
        locks.lock_feature(&rd1(), &t1, LockOwner::LongTerm).unwrap();
        clock.advance(900);
        locks.lock_feature(&rd1(), &t1, LockOwner::LongTerm).unwrap();
        clock.advance(900);
        assert!(locks.is_locked(&rd1()));
    }

    #[test]
    fn expiry_is_exact() {
        let (clock, locks) = manager();
        locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T1", 1000), LockOwner::LongTerm)
            .unwrap();
        clock.advance(999);
        assert!(locks.is_locked(&rd1()));
        clock.advance(1);
        assert!(!locks.is_locked(&rd1()));
        assert!(locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T2", 1000), LockOwner::LongTerm)
            .is_ok());
    }

    #[test]
    fn batch_lock_reports_partial_success() {
        let (_, locks) = manager();
        locks
            .lock_feature(&LockKey::new("road", "road.rd2"), &FeatureLock::with_authorization("A", 500), LockOwner::LongTerm)
            .unwrap();
        let outcome = locks.lock_features(
            "road",
            ["road.rd1", "road.rd2", "road.rd3"],
            &FeatureLock::with_authorization("B", 500),
            LockOwner::LongTerm,
        );
        assert_eq!(outcome.locked, vec!["road.rd1".to_string(), "road.rd3".to_string()]);
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed_fids().collect::<Vec<_>>(), vec!["road.rd2"]);
    }

    #[test]
    fn writes_need_the_token() {
        let (_, locks) = manager();
        locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T1", 1000), LockOwner::LongTerm)
            .unwrap();
        assert!(matches!(
            locks.assert_access(&rd1(), &auths(&[]), None),
            Err(FeatureLockError::Locked { fid, .. }) if fid == "road.rd1"
        ));
        assert!(locks.assert_access(&rd1(), &auths(&["T1"]), None).is_ok());
        assert!(locks.assert_access(&LockKey::new("road", "road.rd9"), &auths(&[]), None).is_ok());
    }

    #[test]
    fn unlock_requires_authorization() {
        let (_, locks) = manager();
        locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T1", 1000), LockOwner::LongTerm)
            .unwrap();
        assert!(matches!(
            locks.unlock_feature(&rd1(), &auths(&["T2"])),
            Err(FeatureLockError::NotAuthorized { .. })
        ));
        assert!(locks.is_locked(&rd1()));
        locks.unlock_feature(&rd1(), &auths(&["T1"])).unwrap();
        assert!(!locks.is_locked(&rd1()));
        assert!(locks.is_empty());
    }

    #[test]
    fn refresh_and_release_by_token() {
        let (clock, locks) = manager();
        let t = FeatureLock::with_authorization("T", 1000);
        locks.lock_features("road", ["a", "b"], &t, LockOwner::LongTerm);
        assert!(locks.exists("T"));
        assert!(matches!(locks.refresh("T", &auths(&[])), Err(FeatureLockError::UnknownAuthorization { .. })));

        clock.advance(800);
        assert_eq!(locks.refresh("T", &auths(&["T"])).unwrap(), 2);
        clock.advance(800);
        assert_eq!(locks.len(), 2);

        assert_eq!(locks.release("T", &auths(&["T"])).unwrap(), 2);
        assert!(!locks.exists("T"));
        assert!(locks.refresh("T", &auths(&["T"])).is_err());
    }

    #[test]
    fn transaction_locks_are_released_with_the_transaction() {
        let (_, locks) = manager();
        let tx = TransactionId(4);
        locks.lock_features("road", ["a"], &FeatureLock::with_authorization("X", 1000), LockOwner::Transaction(tx));
        locks.lock_features("road", ["b"], &FeatureLock::with_authorization("Y", 1000), LockOwner::LongTerm);
        assert_eq!(locks.release_owned_by(tx), 1);
        assert!(!locks.is_locked(&LockKey::new("road", "a")));
        assert!(locks.is_locked(&LockKey::new("road", "b")));
    }

    #[test]
    fn purge_drops_only_expired_locks() {
        let (clock, locks) = manager();
        locks.lock_features("road", ["a"], &FeatureLock::with_authorization("X", 100), LockOwner::LongTerm);
        locks.lock_features("road", ["b"], &FeatureLock::with_authorization("Y", 1000), LockOwner::LongTerm);
        clock.advance(500);
        assert_eq!(locks.purge_expired(), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn commit_pins_block_other_lockers_until_dropped() {
        let (_, locks) = manager();
        let keys = vec![rd1()];
        let pin = locks.pin_for_commit(TransactionId(1), &keys, &auths(&[])).unwrap();
        assert!(locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T", 1000), LockOwner::LongTerm)
            .is_err());
        assert!(locks.assert_access(&rd1(), &auths(&[]), Some(TransactionId(2))).is_err());
        assert!(locks.assert_access(&rd1(), &auths(&[]), Some(TransactionId(1))).is_ok());
        drop(pin);
        assert!(locks
            .lock_feature(&rd1(), &FeatureLock::with_authorization("T", 1000), LockOwner::LongTerm)
            .is_ok());
        assert!(matches!(
            locks.pin_for_commit(TransactionId(1), &keys, &auths(&[])),
            Err(FeatureLockError::Locked { .. })
        ));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn racing_lockers_have_exactly_one_winner() {
        let locks = Arc::new(LockManager::new(Arc::new(crate::clock::SystemClock)));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks
                        .lock_feature(&rd1(), &FeatureLock::with_authorization(format!("T{i}"), 60_000), LockOwner::LongTerm)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("locker thread panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(locks.len(), 1);
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;

    const DURATION_MS: u64 = 300;

    proptest! {
        /// Whatever the interleaving of lock attempts and clock movement, a
        /// feature is only ever granted to a second token once the first
        /// token's lock has expired.
        #[test]
        fn at_most_one_live_holder_per_feature(
            steps in prop::collection::vec((0usize..3, 0usize..3, 0u64..200), 1..60)
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let locks = LockManager::new(clock.clone());
            let mut model: HashMap<usize, (usize, u64)> = HashMap::new();

            for (token, feature, advance) in steps {
                clock.advance(advance);
                let now = clock.now_millis();
                let key = LockKey::new("road", format!("road.rd{feature}"));
                let lock = FeatureLock::with_authorization(format!("T{token}"), DURATION_MS);

                let free = model
                    .get(&feature)
                    .is_none_or(|(holder, expires)| *holder == token || now >= *expires);
                let granted = locks.lock_feature(&key, &lock, LockOwner::LongTerm).is_ok();
                prop_assert_eq!(granted, free);
                if granted {
                    model.insert(feature, (token, now + DURATION_MS));
                }
                prop_assert!(locks.is_locked(&key) || !granted);
            }
        }
    }
}
