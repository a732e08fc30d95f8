use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::SessionBackend;
use crate::storage::types::{
    parse_timestamp, timestamp, ActionFlags, LockSwap, PayloadUpdate, SessionKey, SessionRecord,
};

/// Filesystem backend: one `<id>.session` metadata file and one `<id>.bin` payload
/// blob per record, grouped in a directory per application scope. Names are
/// hex-encoded so any id or scope string maps to a safe file name.
///
/// Mutations are serialized by an in-process mutex, so a directory must not be
/// shared by several processes.
pub struct FileStorage {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let sessions_dir = base_path.join("sessions");
        fs::create_dir_all(&sessions_dir).map_err(|e| { error!("Failed to create sessions dir {}: {}", sessions_dir.display(), e); StorageError::WriteFailed })?;
        info!("FileStorage initialized at {}", base_path.display());

        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Construct FileStorage using env var ALVEOLE_FILE_STORAGE_DIR if set, otherwise current directory.
    pub fn new_default() -> Result<Self, StorageError> {
        if let Ok(dir) = std::env::var("ALVEOLE_FILE_STORAGE_DIR") {
            info!("Using FileStorage from ALVEOLE_FILE_STORAGE_DIR: {}", dir);
            return Self::new(PathBuf::from(dir));
        }
        let cwd = std::env::current_dir().map_err(|e| { error!("Failed to get current dir: {}", e); StorageError::ReadFailed })?;
        info!("Using FileStorage at current directory: {}", cwd.display());
        Self::new(cwd)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn sessions_dir(&self) -> PathBuf { self.base_path.join("sessions") }
    fn scope_dir(&self, scope: &str) -> PathBuf { self.sessions_dir().join(encode_name(scope)) }
    fn session_file_path(&self, key: &SessionKey) -> PathBuf { self.scope_dir(&key.application_scope).join(format!("{}.session", encode_name(&key.id))) }
    fn payload_file_path(&self, key: &SessionKey) -> PathBuf { self.scope_dir(&key.application_scope).join(format!("{}.bin", encode_name(&key.id))) }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock.lock().map_err(|e| { error!("FileStorage mutex poisoned: {}", e); StorageError::ConnectionFailed })
    }

    fn write_record(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let key = record.key();
        let dir = self.scope_dir(&record.application_scope);
        fs::create_dir_all(&dir).map_err(|e| { error!("Failed to create scope dir {}: {}", dir.display(), e); StorageError::WriteFailed })?;

        let payload_path = self.payload_file_path(&key);
        write_file(&payload_path, &record.payload)?;

        // Simple KV text format; id and scope hex-encoded like the file names
        let mut meta = String::new();
        meta.push_str(&format!("id: {}\n", encode_name(&record.id)));
        meta.push_str(&format!("application_scope: {}\n", encode_name(&record.application_scope)));
        meta.push_str(&format!("created_at: {}\n", timestamp(record.created_at)));
        meta.push_str(&format!("expires_at: {}\n", timestamp(record.expires_at)));
        meta.push_str(&format!("timeout_minutes: {}\n", record.timeout_minutes));
        meta.push_str(&format!("item_count: {}\n", record.item_count));
        meta.push_str(&format!("action_flags: {}\n", record.action_flags.bits()));
        meta.push_str(&format!("locked: {}\n", record.locked));
        meta.push_str(&format!("lock_id: {}\n", record.lock_id));
        match record.lock_date {
            Some(date) => meta.push_str(&format!("lock_date: {}\n", timestamp(date))),
            None => meta.push_str("lock_date: none\n"),
        }
        write_file(&self.session_file_path(&key), meta.as_bytes())?;
        debug!("Saved session {} to {}", key, dir.display());
        Ok(())
    }

    fn read_record(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        let path = self.session_file_path(key);
        let mut content = String::new();
        match File::open(&path).and_then(|mut f| f.read_to_string(&mut content)) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => { error!("Failed to read session file {}: {}", path.display(), e); return Err(StorageError::ReadFailed); }
        }
        let mut record = parse_session_file(&path, &content)?;
        let payload_path = self.payload_file_path(key);
        let mut payload = Vec::new();
        match File::open(&payload_path).and_then(|mut f| f.read_to_end(&mut payload)) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => { warn!("Payload file {} missing, reading as empty", payload_path.display()); }
            Err(e) => { error!("Read failed {}: {}", payload_path.display(), e); return Err(StorageError::ReadFailed); }
        }
        record.payload = payload;
        Ok(Some(record))
    }

    fn remove_record(&self, key: &SessionKey) -> Result<(), StorageError> {
        let path = self.session_file_path(key);
        fs::remove_file(&path).map_err(|e| { error!("Failed to remove session file {}: {}", path.display(), e); StorageError::WriteFailed })?;
        let _ = fs::remove_file(self.payload_file_path(key));
        debug!("Removed session {}", key);
        Ok(())
    }

    /// Read-modify-write of one record under the write lock.
    fn modify<F>(&self, key: &SessionKey, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SessionRecord) -> Result<(), StorageError>,
    {
        let _guard = self.guard()?;
        let mut record = self.read_record(key)?.ok_or(StorageError::NotFound)?;
        change(&mut record)?;
        self.write_record(&record)
    }
}

impl SessionBackend for FileStorage {
    fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        let _guard = self.guard()?;
        self.read_record(key)
    }

    fn insert(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let _guard = self.guard()?;
        if self.session_file_path(&record.key()).exists() {
            return Err(StorageError::AlreadyExists);
        }
        self.write_record(record)
    }

    fn compare_and_swap_lock(&self, key: &SessionKey, swap: LockSwap) -> Result<(), StorageError> {
        self.modify(key, |record| record.apply_lock_swap(swap))
    }

    fn update_payload(&self, key: &SessionKey, update: &PayloadUpdate) -> Result<(), StorageError> {
        self.modify(key, |record| record.apply_payload_update(update))
    }

    fn release_lock(&self, key: &SessionKey, lock_id: i64) -> Result<(), StorageError> {
        self.modify(key, |record| record.apply_release(lock_id))
    }

    fn delete(&self, key: &SessionKey, expected_lock_id: Option<i64>) -> Result<(), StorageError> {
        let _guard = self.guard()?;
        let record = self.read_record(key)?.ok_or(StorageError::NotFound)?;
        if let Some(expected) = expected_lock_id {
            if record.lock_id != expected {
                return Err(StorageError::Conflict);
            }
        }
        self.remove_record(key)
    }

    fn update_expiry(&self, key: &SessionKey, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.modify(key, |record| {
            record.expires_at = expires_at;
            Ok(())
        })
    }

    fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.guard()?;
        let mut removed = 0usize;
        for scope_entry in fs::read_dir(self.sessions_dir()).map_err(|e| { error!("Failed to read sessions dir {}: {}", self.sessions_dir().display(), e); StorageError::ReadFailed })? {
            let scope_entry = scope_entry.map_err(|e| { error!("Dir entry error: {}", e); StorageError::ReadFailed })?;
            if !scope_entry.path().is_dir() { continue; }
            for entry in fs::read_dir(scope_entry.path()).map_err(|e| { error!("Failed to read scope dir {}: {}", scope_entry.path().display(), e); StorageError::ReadFailed })? {
                let entry = entry.map_err(|e| { error!("Dir entry error: {}", e); StorageError::ReadFailed })?;
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("session") { continue; }
                let mut content = String::new();
                if File::open(&path).and_then(|mut f| f.read_to_string(&mut content)).is_err() { continue; }
                if let Ok(record) = parse_session_file(&path, &content) {
                    if record.is_expired(now) {
                        self.remove_record(&record.key())?;
                        removed += 1;
                    }
                }
            }
        }
        info!("Removed {} expired session(s) (cutoff: {})", removed, now.to_rfc3339());
        Ok(removed)
    }
}

fn encode_name(s: &str) -> String {
    s.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_name(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Writes through a temporary file and a rename so readers never see a torn file.
fn write_file(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut f = File::create(&tmp).map_err(|e| { error!("Create failed {}: {}", tmp.display(), e); StorageError::WriteFailed })?;
    f.write_all(data).map_err(|e| { error!("Write failed {}: {}", tmp.display(), e); StorageError::WriteFailed })?;
    fs::rename(&tmp, path).map_err(|e| { error!("Rename failed {} -> {}: {}", tmp.display(), path.display(), e); StorageError::WriteFailed })
}

fn parse_session_file(path: &Path, content: &str) -> Result<SessionRecord, StorageError> {
    let mut map: HashMap<String, String> = HashMap::new();
    for line in content.lines() {
        if let Some((k, v)) = line.split_once(": ") { map.insert(k.trim().to_string(), v.trim().to_string()); }
    }
    let mut field = |name: &str| map.remove(name).ok_or_else(|| { error!("Missing {} in session file {}", name, path.display()); StorageError::ReadFailed });
    let id = field("id")?;
    let application_scope = field("application_scope")?;
    let name = |label: &str, hex: &str| decode_name(hex).ok_or_else(|| { error!("Invalid {} in {}", label, path.display()); StorageError::ReadFailed });
    let created_at = field("created_at")?;
    let expires_at = field("expires_at")?;
    let timeout_minutes = field("timeout_minutes")?;
    let item_count = field("item_count")?;
    let action_flags = field("action_flags")?;
    let locked = field("locked")?;
    let lock_id = field("lock_id")?;
    let lock_date = field("lock_date")?;

    let time = |name: &str, s: &str| parse_timestamp(s).ok_or_else(|| { error!("Invalid {} in {}", name, path.display()); StorageError::ReadFailed });
    let invalid = |name: &str| { error!("Invalid {} in {}", name, path.display()); StorageError::ReadFailed };

    Ok(SessionRecord {
        id: name("id", &id)?,
        application_scope: name("application_scope", &application_scope)?,
        created_at: time("created_at", &created_at)?,
        expires_at: time("expires_at", &expires_at)?,
        timeout_minutes: timeout_minutes.parse().map_err(|_| invalid("timeout_minutes"))?,
        payload: Vec::new(),
        item_count: item_count.parse().map_err(|_| invalid("item_count"))?,
        action_flags: ActionFlags::from_bits(action_flags.parse().map_err(|_| invalid("action_flags"))?),
        locked: locked.parse().map_err(|_| invalid("locked"))?,
        lock_id: lock_id.parse().map_err(|_| invalid("lock_id"))?,
        lock_date: if lock_date == "none" { None } else { Some(time("lock_date", &lock_date)?) },
    })
}
