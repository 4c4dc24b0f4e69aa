//! In-process collaborators used by the batch runner and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{FinalApprovalRecord, Identity, PendingApprovalRecord, RecordKey, Status};
use crate::ports::{ApprovalStore, Claim, Directory, Notification, Notifier, PushSink};

/// Directory backed by a fixed map of identities.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: HashMap<String, Identity>,
}

impl MemoryDirectory {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            entries: identities
                .into_iter()
                .map(|identity| (identity.actor_id.clone(), identity))
                .collect(),
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn lookup(&self, actor_id: &str) -> anyhow::Result<Identity> {
        Ok(self.entries.get(actor_id).cloned().unwrap_or_else(|| Identity {
            actor_id: actor_id.to_string(),
            ..Identity::default()
        }))
    }
}

#[derive(Debug, Default)]
struct Records {
    pending: HashMap<RecordKey, PendingApprovalRecord>,
    finals: HashMap<RecordKey, FinalApprovalRecord>,
    status: HashMap<RecordKey, Status>,
}

/// Store holding every record behind one lock, which is what makes the
/// per-key uniqueness checks atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_count(&self) -> usize {
        self.records.lock().await.pending.len()
    }

    pub async fn status_of(&self, key: &RecordKey) -> Option<Status> {
        self.records.lock().await.status.get(key).copied()
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn pending_record(&self, key: &RecordKey) -> anyhow::Result<Option<PendingApprovalRecord>> {
        Ok(self.records.lock().await.pending.get(key).cloned())
    }

    async fn insert_pending_record(
        &self,
        record: PendingApprovalRecord,
    ) -> anyhow::Result<Claim<PendingApprovalRecord>> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.pending.get(&record.key) {
            return Ok(Claim::Existing(existing.clone()));
        }
        if let Some(existing) = records.finals.get(&record.key) {
            // A finalized line item never goes back to pending.
            return Ok(Claim::Existing(PendingApprovalRecord {
                key: existing.key.clone(),
                approver_actor_id: existing.approver.clone(),
                deputy_can_approve: existing.deputy_can_approve,
                created_at: existing.pending_approved_at,
            }));
        }
        records.pending.insert(record.key.clone(), record);
        Ok(Claim::Inserted)
    }

    async fn insert_final_record(
        &self,
        record: FinalApprovalRecord,
    ) -> anyhow::Result<Claim<FinalApprovalRecord>> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.finals.get(&record.key) {
            return Ok(Claim::Existing(existing.clone()));
        }
        records.pending.remove(&record.key);
        records.finals.insert(record.key.clone(), record);
        Ok(Claim::Inserted)
    }

    async fn final_record(&self, key: &RecordKey) -> anyhow::Result<Option<FinalApprovalRecord>> {
        Ok(self.records.lock().await.finals.get(key).cloned())
    }

    async fn discard_pending_record(&self, key: &RecordKey) -> anyhow::Result<()> {
        self.records.lock().await.pending.remove(key);
        Ok(())
    }

    async fn record_status(&self, key: &RecordKey, status: Status) -> anyhow::Result<()> {
        self.records.lock().await.status.insert(key.clone(), status);
        Ok(())
    }
}

/// Notifier that keeps what it was asked to send.
///
/// `failing(n)` rejects the first `n` attempts, for exercising retries.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures_left: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(attempts: usize) -> Self {
        Self {
            sent: Mutex::default(),
            failures_left: AtomicUsize::new(attempts),
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("mail relay unavailable");
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Push sink that records payloads per session. While disconnected every push fails.
#[derive(Debug, Default)]
pub struct RecordingPush {
    payloads: Mutex<Vec<(String, serde_json::Value)>>,
    disconnected: AtomicBool,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub async fn payloads(&self) -> Vec<(String, serde_json::Value)> {
        self.payloads.lock().await.clone()
    }
}

#[async_trait]
impl PushSink for RecordingPush {
    async fn push(&self, session_id: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            anyhow::bail!("no active session {session_id}");
        }
        self.payloads
            .lock()
            .await
            .push((session_id.to_string(), payload));
        Ok(())
    }
}

/// Push sink that only writes progress events to the log.
#[derive(Debug, Default)]
pub struct LogPush;

#[async_trait]
impl PushSink for LogPush {
    async fn push(&self, session_id: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        debug!(session = session_id, %payload, "progress event");
        Ok(())
    }
}

/// Notifier that only writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            kind = ?notification.kind,
            recipients = ?notification.recipients,
            line_item = %notification.context.line_item_id,
            "notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::Decision;

    fn key(line_item: &str) -> RecordKey {
        RecordKey {
            header: "REQ-1".into(),
            line_item: line_item.into(),
        }
    }

    fn pending(line_item: &str, approver: &str) -> PendingApprovalRecord {
        PendingApprovalRecord {
            key: key(line_item),
            approver_actor_id: approver.into(),
            deputy_can_approve: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unknown_actor_has_no_roles() {
        let directory = MemoryDirectory::new([Identity::new("a", "a@x", ["senior-clerk"])]);
        assert!(directory.lookup("a").await.unwrap().has_role("senior-clerk"));
        let stranger = directory.lookup("zed").await.unwrap();
        assert_eq!(stranger.actor_id, "zed");
        assert!(stranger.roles.is_empty());
    }

    #[tokio::test]
    async fn second_pending_insert_returns_existing() {
        let store = MemoryStore::new();
        assert_eq!(
            store.insert_pending_record(pending("LI-1", "first")).await.unwrap(),
            Claim::Inserted
        );
        match store.insert_pending_record(pending("LI-1", "second")).await.unwrap() {
            Claim::Existing(existing) => assert_eq!(existing.approver_actor_id, "first"),
            Claim::Inserted => panic!("duplicate pending record inserted"),
        }
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn final_record_supersedes_pending() {
        let store = MemoryStore::new();
        let record = pending("LI-1", "first");
        store.insert_pending_record(record.clone()).await.unwrap();

        let final_record = FinalApprovalRecord {
            key: key("LI-1"),
            approver: "clerk".into(),
            decision: Decision::Approved,
            deputy_can_approve: record.deputy_can_approve,
            pending_approved_at: record.created_at,
            final_approved_at: Utc::now(),
        };
        assert_eq!(
            store.insert_final_record(final_record.clone()).await.unwrap(),
            Claim::Inserted
        );
        assert!(store.pending_record(&key("LI-1")).await.unwrap().is_none());
        assert_eq!(
            store.insert_final_record(final_record).await.unwrap(),
            Claim::Existing(store.final_record(&key("LI-1")).await.unwrap().unwrap())
        );

        // finalized line items cannot re-enter pending
        assert!(matches!(
            store.insert_pending_record(pending("LI-1", "late")).await.unwrap(),
            Claim::Existing(_)
        ));
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failing_notifier_recovers() {
        let notifier = RecordingNotifier::failing(1);
        let notification = Notification {
            kind: crate::model::NotificationKind::Escalation,
            recipients: vec![crate::ports::Recipient::Group("senior-clerk".into())],
            context: crate::ports::NotificationContext {
                request_id: "REQ-1".into(),
                line_item_id: "LI-1".into(),
                fund_code: None,
                total_price: None,
                status: Status::PendingApproval,
                actor_id: "d".into(),
            },
        };
        assert!(notifier.send(&notification).await.is_err());
        assert!(notifier.send(&notification).await.is_ok());
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn disconnected_push_fails() {
        let push = RecordingPush::new();
        push.set_connected(false);
        assert!(push.push("s", serde_json::json!({})).await.is_err());
        push.set_connected(true);
        push.push("s", serde_json::json!({"percent": 5})).await.unwrap();
        assert_eq!(push.payloads().await.len(), 1);
    }
}
