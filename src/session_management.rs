//! Session management core module.
//!
//! This module holds the locking and expiration protocol for shared session records
//! and the facade a web framework's session layer talks to.
//!
//! Record states, per `(id, application_scope)`:
//!
//! ```text
//!  [absent] --create_uninitialized / commit_and_release(new)--> [unlocked]
//!  [unlocked] --try_acquire(exclusive)--> [locked, lock_id + 1]
//!  [locked] --release(matching token)--> [unlocked]
//!  [locked] --commit_and_release--> [unlocked, payload updated]
//!  [unlocked | locked] --expiry observed by any read--> [absent]
//!  [unlocked | locked] --evict(matching token)--> [absent]
//! ```

#[cfg(test)]
mod integration_tests;
/// Submodule for the locking protocol itself.
pub mod lock_coordinator;
/// Submodule for outcome and session data types.
pub mod session;
/// Submodule for the session provider facade.
pub mod session_store;

pub use lock_coordinator::LockCoordinator;
pub use session::{AcquireOutcome, FetchedItem, LockState, SessionItems, StoreData};
pub use session_store::SessionStore;
