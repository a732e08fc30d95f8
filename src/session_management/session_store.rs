//! Session provider facade.
//!
//! `SessionStore` exposes the operations a web framework's session-state layer
//! calls once per request (get, get exclusive, set-and-release, release, remove,
//! reset timeout, create uninitialized) on top of a [`LockCoordinator`], and
//! converts between [`StoreData`] and the opaque payload bytes kept by the backend.
//!
//! Minimal usage
//! ```
//! use std::sync::Arc;
//! use alveole::configuration::StoreConfig;
//! use alveole::session_management::{SessionStore, StoreData};
//! use alveole::storage::MemoryStorage;
//!
//! let store = SessionStore::new(Arc::new(MemoryStorage::new()), StoreConfig::new("/shop", 20));
//! let id = SessionStore::new_session_id();
//!
//! let mut data = StoreData::new(20);
//! data.items.insert("cart".into(), serde_json::json!(["apple"]));
//! store.set_and_release_item_exclusive(&id, &data, None, true)?;
//!
//! let fetched = store.get_item_exclusive(&id)?;
//! assert_eq!(fetched.data, Some(data.clone()));
//! store.release_item_exclusive(&id, fetched.lock.lock_id.unwrap())?;
//! # Ok::<(), alveole::error_handling::SessionError>(())
//! ```

use crate::configuration::StoreConfig;
use crate::error_handling::types::SessionError;
use crate::session_management::lock_coordinator::LockCoordinator;
use crate::session_management::session::{AcquireOutcome, FetchedItem, SessionItems, StoreData};
use crate::storage::storage_trait::SessionBackend;
use crate::storage::types::ActionFlags;
use chrono::{Duration, Utc};
use log::error;
use std::sync::Arc;
use uuid::Uuid;

pub struct SessionStore {
    coordinator: LockCoordinator,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, config: StoreConfig) -> Self {
        Self::from_coordinator(LockCoordinator::new(backend, config))
    }

    pub fn from_coordinator(coordinator: LockCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &StoreConfig {
        self.coordinator.config()
    }

    /// Fresh random session id (32 lowercase hex digits).
    pub fn new_session_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn create_new_store_data(&self, timeout_minutes: u32) -> StoreData {
        StoreData::new(timeout_minutes)
    }

    /// Shared read, the lock is neither checked out nor changed.
    pub fn get_item(&self, id: &str) -> Result<FetchedItem, SessionError> {
        let result = self.fetch(id, false);
        self.report("get_item", result)
    }

    /// Read that takes the session lock when it is free.
    pub fn get_item_exclusive(&self, id: &str) -> Result<FetchedItem, SessionError> {
        let result = self.fetch(id, true);
        self.report("get_item_exclusive", result)
    }

    pub fn set_and_release_item_exclusive(
        &self,
        id: &str,
        data: &StoreData,
        lock_id: Option<i64>,
        new_item: bool,
    ) -> Result<(), SessionError> {
        let result = serialize_items(&data.items).and_then(|payload| {
            self.coordinator.commit_and_release(
                &self.coordinator.key(id),
                lock_id,
                payload,
                data.items.len() as u32,
                data.timeout_minutes,
                new_item,
            )
        });
        self.report("set_and_release_item_exclusive", result)
    }

    pub fn release_item_exclusive(&self, id: &str, lock_id: i64) -> Result<(), SessionError> {
        let result = self.coordinator.release(&self.coordinator.key(id), lock_id);
        self.report("release_item_exclusive", result)
    }

    /// Removal always presents the caller's token.
    pub fn remove_item(&self, id: &str, lock_id: i64) -> Result<(), SessionError> {
        let result = self.coordinator.evict(&self.coordinator.key(id), Some(lock_id));
        self.report("remove_item", result)
    }

    /// Pushes the expiry to now plus the configured timeout.
    pub fn reset_item_timeout(&self, id: &str) -> Result<(), SessionError> {
        let expiry = Utc::now() + Duration::minutes(i64::from(self.config().timeout_minutes));
        let result = self.coordinator.touch(&self.coordinator.key(id), expiry);
        self.report("reset_item_timeout", result)
    }

    pub fn create_uninitialized_item(&self, id: &str, timeout_minutes: u32) -> Result<(), SessionError> {
        let result = self
            .coordinator
            .create_uninitialized(&self.coordinator.key(id), timeout_minutes);
        self.report("create_uninitialized_item", result)
    }

    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let result = self.coordinator.purge_expired();
        self.report("purge_expired", result)
    }

    fn fetch(&self, id: &str, exclusive: bool) -> Result<FetchedItem, SessionError> {
        let outcome = self.coordinator.try_acquire(&self.coordinator.key(id), exclusive)?;
        let lock = outcome.lock_state();
        let data = match outcome {
            AcquireOutcome::Available { record, action_flags, .. } => {
                if action_flags == ActionFlags::InitializeItem {
                    Some(self.create_new_store_data(self.config().timeout_minutes))
                } else {
                    Some(StoreData {
                        items: deserialize_items(&record.payload)?,
                        timeout_minutes: record.timeout_minutes,
                    })
                }
            }
            AcquireOutcome::Absent | AcquireOutcome::HeldByOther { .. } => None,
        };
        Ok(FetchedItem { data, lock })
    }

    fn report<T>(&self, action: &str, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if self.config().write_exceptions_to_log {
                error!(
                    "An exception occurred. Action: {} (scope {}). Exception: {}",
                    action,
                    self.config().application_scope,
                    e
                );
            }
        }
        result
    }
}

fn serialize_items(items: &SessionItems) -> Result<Vec<u8>, SessionError> {
    Ok(serde_json::to_vec(items)?)
}

fn deserialize_items(payload: &[u8]) -> Result<SessionItems, SessionError> {
    if payload.is_empty() {
        return Ok(SessionItems::new());
    }
    Ok(serde_json::from_slice(payload)?)
}
