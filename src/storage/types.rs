use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::StorageError;

/// Identity of a session record: the same id may live independently under
/// several application scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub id: String,
    pub application_scope: String,
}

impl SessionKey {
    pub fn new<I: Into<String>, S: Into<String>>(id: I, application_scope: S) -> Self {
        Self {
            id: id.into(),
            application_scope: application_scope.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.application_scope)
    }
}

/// Actions the session layer must take when it reads a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActionFlags {
    #[default]
    None,
    /// Placeholder record: the payload holds no committed data yet.
    InitializeItem,
}

impl ActionFlags {
    pub fn bits(self) -> i32 {
        match self {
            ActionFlags::None => 0,
            ActionFlags::InitializeItem => 1,
        }
    }

    /// Unknown values are read as `None`.
    pub fn from_bits(bits: i32) -> Self {
        match bits {
            1 => ActionFlags::InitializeItem,
            _ => ActionFlags::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub application_scope: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout_minutes: u32,
    pub payload: Vec<u8>,
    pub item_count: u32,
    pub action_flags: ActionFlags,
    pub locked: bool,
    pub lock_id: i64,
    pub lock_date: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Unlocked record holding committed items.
    pub fn new(
        key: &SessionKey,
        now: DateTime<Utc>,
        timeout_minutes: u32,
        payload: Vec<u8>,
        item_count: u32,
    ) -> Self {
        Self {
            id: key.id.clone(),
            application_scope: key.application_scope.clone(),
            created_at: now,
            expires_at: now + Duration::minutes(i64::from(timeout_minutes)),
            timeout_minutes,
            payload,
            item_count,
            action_flags: ActionFlags::None,
            locked: false,
            lock_id: 0,
            lock_date: None,
        }
    }

    /// Placeholder created before the session holds any content.
    pub fn uninitialized(key: &SessionKey, now: DateTime<Utc>, timeout_minutes: u32) -> Self {
        Self {
            action_flags: ActionFlags::InitializeItem,
            ..Self::new(key, now, timeout_minutes, Vec::new(), 0)
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.id.clone(), self.application_scope.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Time elapsed since the current lock was taken, zero when unlocked.
    pub fn lock_age(&self, now: DateTime<Utc>) -> Duration {
        match (self.locked, self.lock_date) {
            (true, Some(date)) if now > date => now - date,
            _ => Duration::zero(),
        }
    }

    /// In-place lock grant for backends that hold records in memory or on disk.
    pub(crate) fn apply_lock_swap(&mut self, swap: LockSwap) -> Result<(), StorageError> {
        if self.locked || self.lock_id != swap.expected_lock_id {
            return Err(StorageError::Conflict);
        }
        self.locked = true;
        self.lock_id = swap.new_lock_id;
        self.lock_date = Some(swap.lock_date);
        self.action_flags = ActionFlags::None;
        Ok(())
    }

    /// Unlocks the record if `lock_id` is its current token. The token itself and
    /// `lock_date` are kept.
    pub(crate) fn apply_release(&mut self, lock_id: i64) -> Result<(), StorageError> {
        if self.lock_id != lock_id {
            return Err(StorageError::Conflict);
        }
        self.locked = false;
        Ok(())
    }

    pub(crate) fn apply_payload_update(&mut self, update: &PayloadUpdate) -> Result<(), StorageError> {
        if let Some(expected) = update.expected_lock_id {
            if self.lock_id != expected {
                return Err(StorageError::Conflict);
            }
        }
        self.payload = update.payload.clone();
        self.item_count = update.item_count;
        self.timeout_minutes = update.timeout_minutes;
        self.expires_at = update.expires_at;
        self.action_flags = ActionFlags::None;
        self.locked = false;
        Ok(())
    }
}

/// Conditional lock grant: applied only while the record is unlocked and still
/// carries `expected_lock_id`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockSwap {
    pub expected_lock_id: i64,
    pub new_lock_id: i64,
    pub lock_date: DateTime<Utc>,
}

/// Content save. Also clears `locked` and the action flags.
///
/// With `expected_lock_id` set the save only applies while the record still
/// carries that token.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadUpdate {
    pub expected_lock_id: Option<i64>,
    pub payload: Vec<u8>,
    pub item_count: u32,
    pub timeout_minutes: u32,
    pub expires_at: DateTime<Utc>,
}

/// Fixed-width RFC3339 rendering so that stored timestamps sort lexically.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
