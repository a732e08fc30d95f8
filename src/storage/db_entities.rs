//! SeaORM entity model used by the database storage backend.
//!
//! One table, `sessions`, keyed by `(id, application_scope)`. Timestamps are stored
//! as fixed-width RFC3339 strings (see [`timestamp`](crate::storage::types::timestamp))
//! so that range filters can compare them as text.

use sea_orm::entity::prelude::*;

/// Sessions table entity model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    /// Caller-assigned session id
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Owning application
    #[sea_orm(primary_key, auto_increment = false)]
    pub application_scope: String,
    /// RFC3339 creation timestamp
    pub created_at: String,
    /// RFC3339 expiry timestamp
    pub expires_at: String,
    pub timeout_minutes: i64,
    /// Serialized session items
    pub payload: Vec<u8>,
    pub item_count: i64,
    /// `ActionFlags` as its numeric value
    pub action_flags: i32,
    pub locked: bool,
    /// Fencing token of the current or last lock
    pub lock_id: i64,
    /// Optional RFC3339 lock timestamp
    pub lock_date: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
