use std::env;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sea_orm::sea_query::{Expr, Index, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Condition, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DbErr, EntityTrait, QueryFilter, Schema,
};

use crate::error_handling::types::StorageError;
use crate::storage::db_entities as sessions;
use crate::storage::storage_trait::SessionBackend;
use crate::storage::types::{
    parse_timestamp, timestamp, ActionFlags, LockSwap, PayloadUpdate, SessionKey, SessionRecord,
};

impl sessions::Model {
    fn into_record(self) -> Result<SessionRecord, StorageError> {
        let time = |s: &str| parse_timestamp(s).ok_or(StorageError::ReadFailed);
        Ok(SessionRecord {
            created_at: time(&self.created_at)?,
            expires_at: time(&self.expires_at)?,
            lock_date: match self.lock_date {
                Some(ref s) => Some(time(s)?),
                None => None,
            },
            timeout_minutes: u32::try_from(self.timeout_minutes).map_err(|_| StorageError::ReadFailed)?,
            item_count: u32::try_from(self.item_count).map_err(|_| StorageError::ReadFailed)?,
            action_flags: ActionFlags::from_bits(self.action_flags),
            locked: self.locked,
            lock_id: self.lock_id,
            payload: self.payload,
            id: self.id,
            application_scope: self.application_scope,
        })
    }
}

fn active_model(record: &SessionRecord) -> sessions::ActiveModel {
    sessions::ActiveModel {
        id: Set(record.id.clone()),
        application_scope: Set(record.application_scope.clone()),
        created_at: Set(timestamp(record.created_at)),
        expires_at: Set(timestamp(record.expires_at)),
        timeout_minutes: Set(i64::from(record.timeout_minutes)),
        payload: Set(record.payload.clone()),
        item_count: Set(i64::from(record.item_count)),
        action_flags: Set(record.action_flags.bits()),
        locked: Set(record.locked),
        lock_id: Set(record.lock_id),
        lock_date: Set(record.lock_date.map(timestamp)),
    }
}

fn by_key(key: &SessionKey) -> Condition {
    Condition::all()
        .add(sessions::Column::Id.eq(key.id.as_str()))
        .add(sessions::Column::ApplicationScope.eq(key.application_scope.as_str()))
}

fn read_failed(e: DbErr) -> StorageError {
    error!("Database read failed: {}", e);
    StorageError::ReadFailed
}

fn write_failed(e: DbErr) -> StorageError {
    error!("Database write failed: {}", e);
    StorageError::WriteFailed
}

/// SQLite backend built on SeaORM.
///
/// The `SessionBackend` trait is synchronous, so the backend owns a small tokio
/// runtime and blocks on it. It must therefore not be called from inside another
/// tokio runtime.
pub struct DatabaseStorage {
    rt: tokio::runtime::Runtime,
    db: DatabaseConnection,
}

impl DatabaseStorage {
    /// Default database filename used in the application's working directory
    const DEFAULT_DB_FILE: &'static str = "alveole.sqlite3";

    /// Create or open the database in the current working directory with the default filename
    pub fn new() -> Result<Self, StorageError> {
        let cwd = env::current_dir().map_err(|_| StorageError::ConnectionFailed)?;
        let path = cwd.join(Self::DEFAULT_DB_FILE);
        Self::new_file(path)
    }

    pub fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent).map_err(|_| StorageError::WriteFailed)?;
        }
        info!("Opening session database {}", path_ref.display());
        Self::connect(format!("sqlite://{}?mode=rwc", path_ref.display()), 5)
    }

    /// Private in-memory database. A single connection keeps every query on the same
    /// memory store.
    pub fn new_in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:".to_string(), 1)
    }

    fn connect(url: String, max_connections: u32) -> Result<Self, StorageError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|_| StorageError::ConnectionFailed)?;
        let db = rt.block_on(async {
            let mut opts = ConnectOptions::new(url);
            opts.max_connections(max_connections)
                .sqlx_logging_level(log::LevelFilter::Debug);
            let db = Database::connect(opts).await.map_err(|e| {
                error!("Database connection failed: {}", e);
                StorageError::ConnectionFailed
            })?;
            // create schema
            let backend = db.get_database_backend();
            let schema = Schema::new(backend);
            let mut table = schema.create_table_from_entity(sessions::Entity);
            table.if_not_exists();
            db.execute(backend.build(&table)).await.map_err(write_failed)?;
            let index = Index::create()
                .if_not_exists()
                .name("idx_sessions_expires_at")
                .table(sessions::Entity)
                .col(sessions::Column::ExpiresAt)
                .to_owned();
            db.execute(backend.build(&index)).await.map_err(write_failed)?;
            Ok::<_, StorageError>(db)
        })?;
        Ok(Self { rt, db })
    }

    /// After a conditional statement touched no row: tell a missing record from a
    /// failed condition.
    async fn missing_or_conflict(&self, key: &SessionKey) -> StorageError {
        match sessions::Entity::find().filter(by_key(key)).one(&self.db).await {
            Ok(Some(_)) => StorageError::Conflict,
            Ok(None) => StorageError::NotFound,
            Err(e) => read_failed(e),
        }
    }
}

impl SessionBackend for DatabaseStorage {
    fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StorageError> {
        self.rt.block_on(async {
            let model = sessions::Entity::find_by_id((key.id.clone(), key.application_scope.clone()))
                .one(&self.db)
                .await
                .map_err(read_failed)?;
            model.map(sessions::Model::into_record).transpose()
        })
    }

    fn insert(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let inserted = sessions::Entity::insert(active_model(record))
                .on_conflict(
                    OnConflict::columns([sessions::Column::Id, sessions::Column::ApplicationScope])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await
                .map_err(write_failed)?;
            if inserted == 0 {
                return Err(StorageError::AlreadyExists);
            }
            debug!("Inserted session {}", record.key());
            Ok(())
        })
    }

    fn compare_and_swap_lock(&self, key: &SessionKey, swap: LockSwap) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let result = sessions::Entity::update_many()
                .col_expr(sessions::Column::Locked, Expr::value(true))
                .col_expr(sessions::Column::LockId, Expr::value(swap.new_lock_id))
                .col_expr(sessions::Column::LockDate, Expr::value(Some(timestamp(swap.lock_date))))
                .col_expr(sessions::Column::ActionFlags, Expr::value(ActionFlags::None.bits()))
                .filter(by_key(key))
                .filter(sessions::Column::Locked.eq(false))
                .filter(sessions::Column::LockId.eq(swap.expected_lock_id))
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            if result.rows_affected == 0 {
                return Err(self.missing_or_conflict(key).await);
            }
            Ok(())
        })
    }

    fn update_payload(&self, key: &SessionKey, update: &PayloadUpdate) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let mut condition = by_key(key);
            if let Some(expected) = update.expected_lock_id {
                condition = condition.add(sessions::Column::LockId.eq(expected));
            }
            let result = sessions::Entity::update_many()
                .col_expr(sessions::Column::Payload, Expr::value(update.payload.clone()))
                .col_expr(sessions::Column::ItemCount, Expr::value(i64::from(update.item_count)))
                .col_expr(sessions::Column::TimeoutMinutes, Expr::value(i64::from(update.timeout_minutes)))
                .col_expr(sessions::Column::ExpiresAt, Expr::value(timestamp(update.expires_at)))
                .col_expr(sessions::Column::ActionFlags, Expr::value(ActionFlags::None.bits()))
                .col_expr(sessions::Column::Locked, Expr::value(false))
                .filter(condition)
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            if result.rows_affected == 0 {
                return Err(self.missing_or_conflict(key).await);
            }
            Ok(())
        })
    }

    fn release_lock(&self, key: &SessionKey, lock_id: i64) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let result = sessions::Entity::update_many()
                .col_expr(sessions::Column::Locked, Expr::value(false))
                .filter(by_key(key))
                .filter(sessions::Column::LockId.eq(lock_id))
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            if result.rows_affected == 0 {
                return Err(self.missing_or_conflict(key).await);
            }
            Ok(())
        })
    }

    fn delete(&self, key: &SessionKey, expected_lock_id: Option<i64>) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let mut condition = by_key(key);
            if let Some(expected) = expected_lock_id {
                condition = condition.add(sessions::Column::LockId.eq(expected));
            }
            let result = sessions::Entity::delete_many()
                .filter(condition)
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            if result.rows_affected == 0 {
                return Err(self.missing_or_conflict(key).await);
            }
            debug!("Deleted session {}", key);
            Ok(())
        })
    }

    fn update_expiry(&self, key: &SessionKey, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.rt.block_on(async {
            let result = sessions::Entity::update_many()
                .col_expr(sessions::Column::ExpiresAt, Expr::value(timestamp(expires_at)))
                .filter(by_key(key))
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            if result.rows_affected == 0 {
                return Err(StorageError::NotFound);
            }
            Ok(())
        })
    }

    fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        self.rt.block_on(async {
            let result = sessions::Entity::delete_many()
                .filter(sessions::Column::ExpiresAt.lt(timestamp(now)))
                .exec(&self.db)
                .await
                .map_err(write_failed)?;
            info!("Removed {} expired session(s) (cutoff: {})", result.rows_affected, now.to_rfc3339());
            Ok(result.rows_affected as usize)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, DatabaseStorage) {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("test.sqlite3");
        let storage = DatabaseStorage::new_file(path).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_db_record_roundtrip() {
        let (_dir, storage) = temp_db();
        let key = SessionKey::new("S1", "app1");
        let now = Utc::now();
        let record = SessionRecord::new(&key, now, 20, b"payload".to_vec(), 2);
        storage.insert(&record).unwrap();
        assert_eq!(storage.get(&key).unwrap(), Some(record.clone()));
        assert_eq!(storage.insert(&record), Err(StorageError::AlreadyExists));
        assert!(storage.get(&SessionKey::new("S1", "app2")).unwrap().is_none());
    }

    #[test]
    fn test_db_lock_swap_is_conditional() {
        let (_dir, storage) = temp_db();
        let key = SessionKey::new("S1", "app1");
        let now = Utc::now();
        storage.insert(&SessionRecord::uninitialized(&key, now, 20)).unwrap();

        let stale = LockSwap { expected_lock_id: 7, new_lock_id: 8, lock_date: now };
        assert_eq!(storage.compare_and_swap_lock(&key, stale), Err(StorageError::Conflict));

        let swap = LockSwap { expected_lock_id: 0, new_lock_id: 1, lock_date: now };
        storage.compare_and_swap_lock(&key, swap).unwrap();
        assert_eq!(storage.compare_and_swap_lock(&key, swap), Err(StorageError::Conflict));

        let locked = storage.get(&key).unwrap().unwrap();
        assert!(locked.locked);
        assert_eq!(locked.lock_id, 1);
        assert_eq!(locked.lock_date, Some(now));
        assert_eq!(locked.action_flags, ActionFlags::None);

        let missing = SessionKey::new("nope", "app1");
        assert_eq!(storage.compare_and_swap_lock(&missing, swap), Err(StorageError::NotFound));
    }

    #[test]
    fn test_db_payload_update_unlocks() {
        let (_dir, storage) = temp_db();
        let key = SessionKey::new("S1", "app1");
        let now = Utc::now();
        storage.insert(&SessionRecord::uninitialized(&key, now, 20)).unwrap();
        storage
            .compare_and_swap_lock(&key, LockSwap { expected_lock_id: 0, new_lock_id: 1, lock_date: now })
            .unwrap();

        let stale = PayloadUpdate {
            expected_lock_id: Some(0),
            payload: b"stale".to_vec(),
            item_count: 1,
            timeout_minutes: 20,
            expires_at: now,
        };
        assert_eq!(storage.update_payload(&key, &stale), Err(StorageError::Conflict));
        assert!(storage.get(&key).unwrap().unwrap().locked);

        let update = PayloadUpdate {
            expected_lock_id: Some(1),
            payload: b"{}".to_vec(),
            item_count: 0,
            timeout_minutes: 30,
            expires_at: now + Duration::minutes(30),
        };
        storage.update_payload(&key, &update).unwrap();
        let saved = storage.get(&key).unwrap().unwrap();
        assert!(!saved.locked);
        assert_eq!(saved.lock_id, 1);
        assert_eq!(saved.payload, b"{}".to_vec());
        assert_eq!(saved.timeout_minutes, 30);
        assert_eq!(saved.expires_at, update.expires_at);
        assert_eq!(saved.action_flags, ActionFlags::None);
    }

    #[test]
    fn test_db_delete_and_cleanup() {
        let (_dir, storage) = temp_db();
        let now = Utc::now();
        let key = SessionKey::new("S1", "app1");
        let mut record = SessionRecord::new(&key, now, 20, vec![], 0);
        record.lock_id = 3;
        storage.insert(&record).unwrap();
        assert_eq!(storage.delete(&key, Some(2)), Err(StorageError::Conflict));
        storage.delete(&key, Some(3)).unwrap();
        assert_eq!(storage.delete(&key, None), Err(StorageError::NotFound));

        let mut old = SessionRecord::new(&SessionKey::new("old", "app1"), now, 20, vec![], 0);
        old.expires_at = now - Duration::seconds(1);
        storage.insert(&old).unwrap();
        storage.insert(&SessionRecord::new(&SessionKey::new("live", "app1"), now, 20, vec![], 0)).unwrap();
        assert_eq!(storage.cleanup_expired_sessions(now).unwrap(), 1);
        assert!(storage.get(&SessionKey::new("live", "app1")).unwrap().is_some());
    }

    #[test]
    fn test_db_release_requires_current_token() {
        let (_dir, storage) = temp_db();
        let key = SessionKey::new("S1", "app1");
        let now = Utc::now();
        storage.insert(&SessionRecord::uninitialized(&key, now, 20)).unwrap();
        storage
            .compare_and_swap_lock(&key, LockSwap { expected_lock_id: 0, new_lock_id: 1, lock_date: now })
            .unwrap();

        assert_eq!(storage.release_lock(&key, 0), Err(StorageError::Conflict));
        assert!(storage.get(&key).unwrap().unwrap().locked);
        storage.release_lock(&key, 1).unwrap();
        let released = storage.get(&key).unwrap().unwrap();
        assert!(!released.locked);
        assert_eq!(released.lock_id, 1);
        assert_eq!(
            storage.release_lock(&SessionKey::new("nope", "app1"), 1),
            Err(StorageError::NotFound)
        );
    }

    #[test]
    fn test_db_in_memory() {
        let storage = DatabaseStorage::new_in_memory().unwrap();
        let key = SessionKey::new("S1", "app1");
        storage.insert(&SessionRecord::uninitialized(&key, Utc::now(), 20)).unwrap();
        let later = Utc::now() + Duration::minutes(45);
        storage.update_expiry(&key, later).unwrap();
        assert_eq!(storage.get(&key).unwrap().unwrap().expires_at, later);
    }
}
