use crate::configuration::StoreConfig;
use crate::error_handling::types::{SessionError, StorageError};
use crate::session_management::session::AcquireOutcome;
use crate::storage::storage_trait::SessionBackend;
use crate::storage::types::{ActionFlags, LockSwap, PayloadUpdate, SessionKey, SessionRecord};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

/// The session locking and expiration protocol.
///
/// A `LockCoordinator` is stateless apart from its configuration: all coordination
/// between concurrent callers goes through the backend's per-record atomicity.
/// Acquisition never blocks; contention is reported as
/// [`AcquireOutcome::HeldByOther`] together with the lock age, and any retry or
/// stale-lock policy belongs to the caller.
///
/// Expired records are evicted lazily, when an operation observes them.
///
/// # Fields Overview
///
/// - `backend`: shared durable store
/// - `config`: scope, timeout and token policies for this coordinator
pub struct LockCoordinator {
    backend: Arc<dyn SessionBackend>,
    config: StoreConfig,
}

impl LockCoordinator {
    /// Lock swaps tried per `try_acquire` before contention is reported.
    const MAX_LOCK_ATTEMPTS: u32 = 3;

    pub fn new(backend: Arc<dyn SessionBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    /// Key for `id` under the configured application scope.
    pub fn key(&self, id: &str) -> SessionKey {
        SessionKey::new(id, self.config.application_scope.as_str())
    }

    /// Looks the record up and, when `exclusive`, tries to take its lock.
    ///
    /// Cases, in order: missing -> `Absent`; expired -> evicted, `Absent`; locked ->
    /// `HeldByOther`; otherwise `Available`. A granted lock carries `lock_id + 1`, and
    /// `action_flags` in the outcome are the flags as they were before the grant
    /// cleared them.
    ///
    /// Losing the lock swap to another caller means the record is read again: a
    /// record found locked is `HeldByOther`, one found unlocked (the winner already
    /// released) is swapped for again, up to `MAX_LOCK_ATTEMPTS` swaps. When every
    /// attempt is lost the record is reported `HeldByOther` with the latest token.
    pub fn try_acquire(&self, key: &SessionKey, exclusive: bool) -> Result<AcquireOutcome, SessionError> {
        let mut attempts = 0;
        loop {
            let now = Utc::now();
            let record = match self.backend.get(key)? {
                Some(record) => record,
                None => {
                    debug!("Session {} not found", key);
                    return Ok(AcquireOutcome::Absent);
                }
            };

            if record.is_expired(now) {
                self.evict_expired(key, &record)?;
                return Ok(AcquireOutcome::Absent);
            }

            if record.locked || attempts == Self::MAX_LOCK_ATTEMPTS {
                debug!("Session {} is locked by lock id {}", key, record.lock_id);
                return Ok(AcquireOutcome::HeldByOther {
                    lock_id: record.lock_id,
                    lock_age: record.lock_age(now),
                });
            }

            if !exclusive {
                return Ok(AcquireOutcome::Available {
                    lock_id: record.lock_id,
                    action_flags: record.action_flags,
                    record,
                });
            }

            let swap = LockSwap {
                expected_lock_id: record.lock_id,
                new_lock_id: record.lock_id + 1,
                lock_date: now,
            };
            match self.backend.compare_and_swap_lock(key, swap) {
                Ok(()) => {
                    debug!("Session {} locked with lock id {}", key, swap.new_lock_id);
                    let action_flags = record.action_flags;
                    let record = SessionRecord {
                        locked: true,
                        lock_id: swap.new_lock_id,
                        lock_date: Some(now),
                        action_flags: ActionFlags::None,
                        ..record
                    };
                    return Ok(AcquireOutcome::Available {
                        record,
                        lock_id: swap.new_lock_id,
                        action_flags,
                    });
                }
                Err(StorageError::Conflict) => {
                    attempts += 1;
                    debug!("Lost lock race on session {} (attempt {})", key, attempts);
                }
                Err(StorageError::NotFound) => return Ok(AcquireOutcome::Absent),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shared read: never changes lock fields.
    pub fn read(&self, key: &SessionKey) -> Result<AcquireOutcome, SessionError> {
        self.try_acquire(key, false)
    }

    pub fn acquire(&self, key: &SessionKey) -> Result<AcquireOutcome, SessionError> {
        self.try_acquire(key, true)
    }

    /// Clears the lock if `lock_id` is the stored token. The check and the write
    /// happen in one backend operation.
    pub fn release(&self, key: &SessionKey, lock_id: i64) -> Result<(), SessionError> {
        match self.backend.release_lock(key, lock_id) {
            Ok(()) => {
                debug!("Session {} released (lock id {})", key, lock_id);
                Ok(())
            }
            Err(StorageError::Conflict) => Err(self.token_mismatch(key, Some(lock_id), "release")),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the session content and leaves the record unlocked.
    ///
    /// For a new item any expired record at the key is evicted first and a fresh
    /// record with lock id 0 is inserted. Otherwise the existing record is updated,
    /// unless it has expired, in which case it is evicted and `NotFound` returned.
    /// The token is only checked when `verify_token_on_commit` is set, and then
    /// atomically with the update.
    pub fn commit_and_release(
        &self,
        key: &SessionKey,
        lock_id: Option<i64>,
        payload: Vec<u8>,
        item_count: u32,
        timeout_minutes: u32,
        is_new: bool,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        if is_new {
            self.evict_if_expired(key, now)?;
            let record = SessionRecord::new(key, now, timeout_minutes, payload, item_count);
            self.backend.insert(&record)?;
            info!("Session {} created with {} item(s)", key, item_count);
            return Ok(());
        }

        if self.evict_if_expired(key, now)? {
            return Err(SessionError::NotFound);
        }

        let expected_lock_id = match (self.config.verify_token_on_commit, lock_id) {
            (false, _) => None,
            (true, Some(token)) => Some(token),
            (true, None) => return Err(self.token_mismatch(key, None, "save")),
        };
        let update = PayloadUpdate {
            expected_lock_id,
            payload,
            item_count,
            timeout_minutes,
            expires_at: now + Duration::minutes(i64::from(timeout_minutes)),
        };
        match self.backend.update_payload(key, &update) {
            Ok(()) => {
                debug!("Session {} saved with {} item(s)", key, item_count);
                Ok(())
            }
            Err(StorageError::Conflict) => Err(self.token_mismatch(key, lock_id, "save")),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the record; with `Some(lock_id)` only if that is the stored token.
    pub fn evict(&self, key: &SessionKey, lock_id: Option<i64>) -> Result<(), SessionError> {
        match self.backend.delete(key, lock_id) {
            Ok(()) => {
                info!("Session {} removed", key);
                Ok(())
            }
            Err(StorageError::Conflict) => Err(self.token_mismatch(key, lock_id, "remove")),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the expiry; lock state and payload are untouched. An already expired
    /// record is evicted instead and `NotFound` returned.
    pub fn touch(&self, key: &SessionKey, new_expiry: DateTime<Utc>) -> Result<(), SessionError> {
        if self.evict_if_expired(key, Utc::now())? {
            return Err(SessionError::NotFound);
        }
        self.backend.update_expiry(key, new_expiry)?;
        debug!("Session {} now expires at {}", key, new_expiry.to_rfc3339());
        Ok(())
    }

    /// Inserts an empty placeholder flagged `InitializeItem`.
    pub fn create_uninitialized(&self, key: &SessionKey, timeout_minutes: u32) -> Result<(), SessionError> {
        let now = Utc::now();
        self.evict_if_expired(key, now)?;
        self.backend
            .insert(&SessionRecord::uninitialized(key, now, timeout_minutes))?;
        debug!("Uninitialized session {} created", key);
        Ok(())
    }

    /// Deletes every expired record in the backend, all scopes included.
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        Ok(self.backend.cleanup_expired_sessions(Utc::now())?)
    }

    /// Error for a token the backend refused, carrying the token now stored.
    fn token_mismatch(&self, key: &SessionKey, presented: Option<i64>, action: &str) -> SessionError {
        match self.backend.get(key) {
            Ok(Some(current)) => {
                warn!(
                    "Refusing to {} session {}: token {:?} but current lock id is {}",
                    action, key, presented, current.lock_id
                );
                SessionError::TokenMismatch {
                    presented,
                    current: current.lock_id,
                }
            }
            Ok(None) => SessionError::NotFound,
            Err(e) => e.into(),
        }
    }

    /// Returns whether an expired record was found (and evicted) at `key`.
    fn evict_if_expired(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<bool, SessionError> {
        match self.backend.get(key)? {
            Some(existing) if existing.is_expired(now) => {
                self.evict_expired(key, &existing)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Guarded by the observed token so a record recreated in the meantime survives.
    fn evict_expired(&self, key: &SessionKey, record: &SessionRecord) -> Result<(), SessionError> {
        match self.backend.delete(key, Some(record.lock_id)) {
            Ok(()) => {
                info!("Evicted expired session {} (expired at {})", key, record.expires_at.to_rfc3339());
                Ok(())
            }
            Err(StorageError::NotFound) | Err(StorageError::Conflict) => {
                debug!("Expired session {} already changed by another caller", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
