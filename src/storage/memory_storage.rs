use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::SessionBackend;
use crate::storage::types::{LockSwap, PayloadUpdate, SessionKey, SessionRecord};

/// Process-local backend. Every operation runs under one mutex, which makes the
/// lock compare-and-swap trivially atomic.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<SessionKey, SessionRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        info!("MemoryStorage initialized");
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<SessionKey, SessionRecord>>, StorageError> {
        self.records.lock().map_err(|e| {
            error!("MemoryStorage mutex poisoned: {}", e);
            StorageError::ConnectionFailed
        })
    }
}

impl SessionBackend for MemoryStorage {
    fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.records()?.get(key).cloned())
    }

    fn insert(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        debug!("Inserted session {}", key);
        records.insert(key, record.clone());
        Ok(())
    }

    fn compare_and_swap_lock(&self, key: &SessionKey, swap: LockSwap) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let record = records.get_mut(key).ok_or(StorageError::NotFound)?;
        record.apply_lock_swap(swap)
    }

    fn update_payload(&self, key: &SessionKey, update: &PayloadUpdate) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let record = records.get_mut(key).ok_or(StorageError::NotFound)?;
        record.apply_payload_update(update)
    }

    fn release_lock(&self, key: &SessionKey, lock_id: i64) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let record = records.get_mut(key).ok_or(StorageError::NotFound)?;
        record.apply_release(lock_id)
    }

    fn delete(&self, key: &SessionKey, expected_lock_id: Option<i64>) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let record = records.get(key).ok_or(StorageError::NotFound)?;
        if let Some(expected) = expected_lock_id {
            if record.lock_id != expected {
                return Err(StorageError::Conflict);
            }
        }
        records.remove(key);
        debug!("Deleted session {}", key);
        Ok(())
    }

    fn update_expiry(&self, key: &SessionKey, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut records = self.records()?;
        let record = records.get_mut(key).ok_or(StorageError::NotFound)?;
        record.expires_at = expires_at;
        Ok(())
    }

    fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        let removed = before - records.len();
        info!("Removed {} expired session(s) (cutoff: {})", removed, now.to_rfc3339());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> SessionKey {
        SessionKey::new("S1", "app1")
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let storage = MemoryStorage::new();
        let record = SessionRecord::new(&key(), Utc::now(), 20, b"x".to_vec(), 1);
        storage.insert(&record).unwrap();
        assert_eq!(storage.insert(&record), Err(StorageError::AlreadyExists));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_scopes_are_independent() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert(&SessionRecord::new(&SessionKey::new("S1", "app1"), now, 20, vec![], 0)).unwrap();
        storage.insert(&SessionRecord::new(&SessionKey::new("S1", "app2"), now, 20, vec![], 0)).unwrap();
        storage.delete(&SessionKey::new("S1", "app1"), None).unwrap();
        assert!(storage.get(&SessionKey::new("S1", "app2")).unwrap().is_some());
    }

    #[test]
    fn test_delete_checks_token_when_given() {
        let storage = MemoryStorage::new();
        let mut record = SessionRecord::new(&key(), Utc::now(), 20, vec![], 0);
        record.lock_id = 5;
        storage.insert(&record).unwrap();
        assert_eq!(storage.delete(&key(), Some(4)), Err(StorageError::Conflict));
        storage.delete(&key(), Some(5)).unwrap();
        assert_eq!(storage.delete(&key(), None), Err(StorageError::NotFound));
    }

    #[test]
    fn test_cleanup_expired_sessions() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut old = SessionRecord::new(&SessionKey::new("old", "app1"), now, 20, vec![], 0);
        old.expires_at = now - Duration::minutes(1);
        storage.insert(&old).unwrap();
        storage.insert(&SessionRecord::new(&SessionKey::new("new", "app1"), now, 20, vec![], 0)).unwrap();
        assert_eq!(storage.cleanup_expired_sessions(now).unwrap(), 1);
        assert!(storage.get(&SessionKey::new("old", "app1")).unwrap().is_none());
        assert!(storage.get(&SessionKey::new("new", "app1")).unwrap().is_some());
    }
}
