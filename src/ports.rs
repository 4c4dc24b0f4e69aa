//! External collaborators the router and tracker depend on.
//!
//! Implementations live outside the core; [`crate::memory`] has in-process ones.

use async_trait::async_trait;
use serde::Serialize;

use crate::model::{
    ActorId, FinalApprovalRecord, Identity, NotificationKind, PendingApprovalRecord, RecordKey,
    Status,
};

/// Identity / directory lookup.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Unknown actors resolve to an identity without roles.
    async fn lookup(&self, actor_id: &str) -> anyhow::Result<Identity>;
}

/// Outcome of inserting a record that is unique on its [`RecordKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<T> {
    Inserted,
    /// Another writer got there first; their record is returned untouched.
    Existing(T),
}

/// Durable approval state.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn pending_record(&self, key: &RecordKey) -> anyhow::Result<Option<PendingApprovalRecord>>;

    /// Insert unless a pending or final record already exists for the key.
    async fn insert_pending_record(
        &self,
        record: PendingApprovalRecord,
    ) -> anyhow::Result<Claim<PendingApprovalRecord>>;

    /// Insert unless a final record already exists; removes the pending record on success.
    async fn insert_final_record(
        &self,
        record: FinalApprovalRecord,
    ) -> anyhow::Result<Claim<FinalApprovalRecord>>;

    async fn final_record(&self, key: &RecordKey) -> anyhow::Result<Option<FinalApprovalRecord>>;

    async fn discard_pending_record(&self, key: &RecordKey) -> anyhow::Result<()>;

    async fn record_status(&self, key: &RecordKey, status: Status) -> anyhow::Result<()>;
}

/// Who a notification goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// Everyone holding the role or group.
    Group(String),
    Actor(ActorId),
}

/// Fields available to notification templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContext {
    pub request_id: String,
    pub line_item_id: String,
    pub fund_code: Option<String>,
    pub total_price: Option<String>,
    pub status: Status,
    pub actor_id: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipients: Vec<Recipient>,
    pub context: NotificationContext,
}

/// Email / message delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Live-update transport to a client session.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn push(&self, session_id: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}
