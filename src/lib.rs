//! alveole: a session store with exclusive per-session locking.
//!
//! Many request handlers share session records through a durable backend;
//! [`session_management::LockCoordinator`] makes sure only one of them mutates a
//! given session at a time, hands out fencing tokens, and evicts expired sessions
//! when it runs into them.

pub mod configuration;
pub mod error_handling;
pub mod session_management;
pub mod storage;

pub use configuration::StoreConfig;
pub use error_handling::{ConfigError, SessionError, StorageError};
pub use session_management::{AcquireOutcome, LockCoordinator, SessionStore};
pub use storage::{SessionBackend, SessionKey, SessionRecord};
