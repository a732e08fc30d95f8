use crate::storage::types::{ActionFlags, SessionRecord};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of looking a session up, with or without taking its lock.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// No live record: never created, removed, or just evicted as expired.
    Absent,
    /// Another holder owns the lock; the caller must not mutate.
    HeldByOther { lock_id: i64, lock_age: Duration },
    /// The record is readable. On an exclusive request the lock is now held and
    /// `lock_id` is the new fencing token.
    Available {
        record: SessionRecord,
        lock_id: i64,
        action_flags: ActionFlags,
    },
}

impl AcquireOutcome {
    pub fn lock_state(&self) -> LockState {
        match self {
            AcquireOutcome::Absent => LockState::default(),
            AcquireOutcome::HeldByOther { lock_id, lock_age } => LockState {
                locked: true,
                lock_age: *lock_age,
                lock_id: Some(*lock_id),
                action_flags: ActionFlags::None,
            },
            AcquireOutcome::Available {
                lock_id,
                action_flags,
                ..
            } => LockState {
                locked: false,
                lock_age: Duration::zero(),
                lock_id: Some(*lock_id),
                action_flags: *action_flags,
            },
        }
    }
}

/// Lock information handed back with every read, in one value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockState {
    pub locked: bool,
    pub lock_age: Duration,
    pub lock_id: Option<i64>,
    pub action_flags: ActionFlags,
}

impl Default for LockState {
    fn default() -> Self {
        Self {
            locked: false,
            lock_age: Duration::zero(),
            lock_id: None,
            action_flags: ActionFlags::None,
        }
    }
}

/// Session item collection. Values are opaque to the store.
pub type SessionItems = BTreeMap<String, Value>;

/// Session content as the web layer sees it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub items: SessionItems,
    pub timeout_minutes: u32,
}

impl StoreData {
    pub fn new(timeout_minutes: u32) -> Self {
        Self {
            items: SessionItems::new(),
            timeout_minutes,
        }
    }
}

/// What `get_item`/`get_item_exclusive` return: data when readable, plus the lock
/// state either way.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedItem {
    pub data: Option<StoreData>,
    pub lock: LockState,
}
