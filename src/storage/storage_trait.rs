//! Session Backend Trait
//!
//! This module defines the `SessionBackend` trait, the durable keyed store the lock
//! coordinator runs its protocol against.
//!
//! Implementors are responsible for:
//! - Persisting and retrieving session records by `(id, application_scope)`
//! - Applying the lock compare-and-swap indivisibly per record
//! - Conditional deletes guarded by a lock token
//!
//! No transactions and no TTL semantics are assumed: expiry is decided by the caller.
//! All methods return a `Result` to handle potential storage errors.

use chrono::{DateTime, Utc};

use crate::error_handling::types::StorageError;
use crate::storage::types::{LockSwap, PayloadUpdate, SessionKey, SessionRecord};

pub trait SessionBackend: Send + Sync {
    /// Fetches a record, `Ok(None)` when absent.
    fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError>;

    /// Inserts a new record, failing with `AlreadyExists` if the key is taken.
    fn insert(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Grants an exclusive lock if the record is unlocked and its `lock_id` equals
    /// `swap.expected_lock_id`; the action flags are cleared at the same time.
    ///
    /// Fails with `NotFound` or `Conflict`. This must be atomic per record.
    fn compare_and_swap_lock(&self, key: &SessionKey, swap: LockSwap) -> Result<(), StorageError>;

    /// Replaces the payload and sliding expiry, unlocking the record. With
    /// `update.expected_lock_id` set, fails with `Conflict` unless the stored token
    /// matches, checked atomically with the write.
    fn update_payload(&self, key: &SessionKey, update: &PayloadUpdate) -> Result<(), StorageError>;

    /// Unlocks the record if `lock_id` is its current token, failing with `Conflict`
    /// otherwise. Must be atomic per record.
    fn release_lock(&self, key: &SessionKey, lock_id: i64) -> Result<(), StorageError>;

    /// Deletes a record. With `Some(lock_id)`, fails with `Conflict` unless the stored
    /// token matches.
    fn delete(&self, key: &SessionKey, expected_lock_id: Option<i64>) -> Result<(), StorageError>;

    /// Moves the expiry without touching lock state or payload.
    fn update_expiry(&self, key: &SessionKey, expires_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Deletes every record, in any scope, that expired before `now`.
    fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}
