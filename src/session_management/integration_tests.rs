use crate::configuration::{BackendConfig, BackendKind, StoreConfig};
use crate::error_handling::types::SessionError;
use crate::session_management::{AcquireOutcome, LockCoordinator, SessionStore, StoreData};
use crate::storage::types::{SessionKey, SessionRecord};
use crate::storage::{open_backend, SessionBackend};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

/// Every backend kind, each in its own temporary location.
fn backends() -> Vec<(TempDir, Arc<dyn SessionBackend>)> {
    [BackendKind::Memory, BackendKind::File, BackendKind::Sqlite]
        .into_iter()
        .map(|kind| {
            let dir = TempDir::new().unwrap();
            let path = match kind {
                BackendKind::Memory => None,
                BackendKind::File => Some(dir.path().join("store")),
                BackendKind::Sqlite => Some(dir.path().join("sessions.sqlite3")),
            };
            let backend = open_backend(&BackendConfig { kind, path }).unwrap();
            (dir, backend)
        })
        .collect()
}

fn lock_id_of(outcome: AcquireOutcome) -> i64 {
    match outcome {
        AcquireOutcome::Available { lock_id, .. } => lock_id,
        other => panic!("expected Available, got {:?}", other),
    }
}

#[test]
fn test_acquire_contend_release_reacquire() {
    for (_dir, backend) in backends() {
        let coordinator = LockCoordinator::new(backend.clone(), StoreConfig::new("app1", 20));
        let key = SessionKey::new("S1", "app1");
        coordinator
            .commit_and_release(&key, None, b"{}".to_vec(), 0, 20, true)
            .unwrap();

        assert_eq!(lock_id_of(coordinator.try_acquire(&key, true).unwrap()), 1);
        assert!(backend.get(&key).unwrap().unwrap().locked);

        match coordinator.try_acquire(&key, true).unwrap() {
            AcquireOutcome::HeldByOther { lock_id, .. } => assert_eq!(lock_id, 1),
            other => panic!("expected HeldByOther, got {:?}", other),
        }

        coordinator.release(&key, 1).unwrap();
        assert_eq!(lock_id_of(coordinator.try_acquire(&key, true).unwrap()), 2);
    }
}

#[test]
fn test_expired_session_is_reported_absent_and_deleted() {
    for (_dir, backend) in backends() {
        let coordinator = LockCoordinator::new(backend.clone(), StoreConfig::new("app1", 20));
        let key = SessionKey::new("S1", "app1");
        let mut record = SessionRecord::new(&key, Utc::now(), 20, b"{}".to_vec(), 0);
        record.expires_at = Utc::now() - Duration::seconds(1);
        backend.insert(&record).unwrap();

        assert_eq!(coordinator.try_acquire(&key, false).unwrap(), AcquireOutcome::Absent);
        assert!(backend.get(&key).unwrap().is_none());
    }
}

#[test]
fn test_expired_session_with_padded_id_is_evicted() {
    for (_dir, backend) in backends() {
        let coordinator = LockCoordinator::new(backend.clone(), StoreConfig::new(" app1\n", 20));
        let key = coordinator.key("S1 ");
        let mut record = SessionRecord::new(&key, Utc::now(), 20, b"{}".to_vec(), 0);
        record.expires_at = Utc::now() - Duration::seconds(1);
        backend.insert(&record).unwrap();

        assert_eq!(coordinator.read(&key).unwrap(), AcquireOutcome::Absent);
        assert!(backend.get(&key).unwrap().is_none());
        assert!(backend.get(&SessionKey::new("S1", "app1")).unwrap().is_none());
        assert_eq!(coordinator.purge_expired().unwrap(), 0);
    }
}

#[test]
fn test_stale_release_leaves_lock_untouched() {
    for (_dir, backend) in backends() {
        let coordinator = LockCoordinator::new(backend.clone(), StoreConfig::new("app1", 20));
        let key = coordinator.key("S1");
        coordinator.create_uninitialized(&key, 20).unwrap();
        let first = lock_id_of(coordinator.acquire(&key).unwrap());
        coordinator.release(&key, first).unwrap();
        let second = lock_id_of(coordinator.acquire(&key).unwrap());

        assert!(matches!(
            coordinator.release(&key, first),
            Err(SessionError::TokenMismatch { .. })
        ));
        let stored = backend.get(&key).unwrap().unwrap();
        assert!(stored.locked);
        assert_eq!(stored.lock_id, second);
    }
}

#[test]
fn test_facade_request_cycle() {
    for (_dir, backend) in backends() {
        let store = SessionStore::new(backend, StoreConfig::new("/shop", 20));
        let id = SessionStore::new_session_id();
        store.create_uninitialized_item(&id, 20).unwrap();

        let first = store.get_item_exclusive(&id).unwrap();
        assert_eq!(first.data, Some(StoreData::new(20)));
        let mut data = first.data.unwrap();
        data.items.insert("visits".into(), json!(1));
        store
            .set_and_release_item_exclusive(&id, &data, first.lock.lock_id, false)
            .unwrap();

        let second = store.get_item_exclusive(&id).unwrap();
        assert_eq!(second.lock.lock_id, Some(2));
        assert_eq!(second.data.as_ref().map(|d| d.items["visits"].clone()), Some(json!(1)));
        store.remove_item(&id, 2).unwrap();
        assert!(store.get_item(&id).unwrap().data.is_none());
    }
}

#[test]
fn test_concurrent_acquire_on_shared_backend() {
    for (_dir, backend) in backends() {
        let coordinator = Arc::new(LockCoordinator::new(backend, StoreConfig::new("app1", 20)));
        let key = coordinator.key("S1");
        coordinator.create_uninitialized(&key, 20).unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                let key = key.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.acquire(&key).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, AcquireOutcome::Available { .. }))
            .count();
        assert_eq!(winners, 1);
    }
}
