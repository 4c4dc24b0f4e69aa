//! Batch runner: feeds a stream of line-item actions through the router.
//!
//! The runner remembers the latest status of each line item it has seen, so
//! later rows for the same line item continue from where the previous one left
//! it. Routing errors are logged and recorded but never stop the batch.

use std::collections::HashMap;

use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::csv::{ActionRow, OutputRow};
use crate::model::{ApprovalRequest, RecordKey, RoutingResult, Status};
use crate::progress::{ApprovalStep, ProgressTracker};
use crate::router::{RouteError, Router};

pub struct Batch {
    router: Router,
    tracker: ProgressTracker,
    statuses: HashMap<RecordKey, Status>,
    outcomes: Vec<OutputRow>,
}

/// Public API
impl Batch {
    pub fn new(router: Router, tracker: ProgressTracker) -> Self {
        Self {
            router,
            tracker,
            statuses: HashMap::new(),
            outcomes: Vec::new(),
        }
    }

    /// Run the batch with the given action stream
    pub async fn run(&mut self, mut stream: impl Stream<Item = ActionRow> + Unpin) {
        while let Some(row) = stream.next().await {
            // any error should not stop the batch, it is already logged and recorded
            let _ = self.apply(row).await;
        }
    }

    /// Route a single row on top of the statuses seen so far
    pub async fn apply(&mut self, row: ActionRow) -> Result<RoutingResult, RouteError> {
        let line = row.line;
        let request = ApprovalRequest::new(
            row.request_id,
            row.line_item_id,
            row.fund_code,
            row.total_price,
            row.actor_id,
            row.action,
        )
        .with_requester(row.requester_id);
        let key = request.key();
        let current = self.status_of(&key);
        let request = request.with_status(current);

        let mut output = OutputRow {
            request_id: key.header.clone(),
            line_item_id: key.line_item.clone(),
            action: request.action.to_string(),
            actor_id: request.actor_id.clone(),
            status: current.to_string(),
            claimed_by: String::new(),
        };

        let mut progress = self
            .tracker
            .start::<ApprovalStep>(request.actor_id.clone());
        let result = self.router.route(request, &mut progress).await;

        match &result {
            Ok(routed) => {
                self.statuses.insert(key, routed.final_status);
                output.status = routed.final_status.to_string();
                output.claimed_by = match routed.claimed_by {
                    Some(stage) => stage.as_str().to_string(),
                    None => "unhandled".to_string(),
                };
            }
            Err(e) => {
                warn!(line, line_item = %key, reason = %e, "row not routed");
                output.claimed_by = if e.is_rejected_input() {
                    "rejected".to_string()
                } else {
                    "error".to_string()
                };
            }
        }
        self.outcomes.push(output);
        result
    }

    /// Latest known status of a line item, `NEW_REQUEST` if never routed.
    pub fn status_of(&self, key: &RecordKey) -> Status {
        self.statuses
            .get(key)
            .copied()
            .unwrap_or(Status::NewRequest)
    }

    pub fn outcomes(&self) -> &[OutputRow] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<OutputRow> {
        self.outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::Amount;
    use crate::memory::{MemoryDirectory, MemoryStore, RecordingNotifier, RecordingPush};
    use crate::model::{Action, Identity};
    use crate::policy::Policy;
    use crate::router::RetryPolicy;

    fn batch() -> Batch {
        let directory = MemoryDirectory::new([
            Identity::new("fran", "fran@example.org", ["dept-first-line"]),
            Identity::new("cleo", "cleo@example.org", ["senior-clerk"]),
        ]);
        let router = Router::new(
            Policy::default(),
            Arc::new(directory),
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::new()),
        )
        .with_retry(RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
        });
        Batch::new(router, ProgressTracker::new(Arc::new(RecordingPush::new())))
    }

    fn row(line: usize, line_item: &str, price: Option<i64>, actor: &str, action: Action) -> ActionRow {
        ActionRow {
            line,
            request_id: "REQ-1".into(),
            line_item_id: line_item.into(),
            requester_id: "rita".into(),
            fund_code: Some("511000".into()),
            total_price: price.map(Amount::from_whole),
            actor_id: actor.into(),
            action,
        }
    }

    fn key(line_item: &str) -> RecordKey {
        RecordKey {
            header: "REQ-1".into(),
            line_item: line_item.into(),
        }
    }

    #[tokio::test]
    async fn statuses_carry_across_rows() {
        let mut batch = batch();
        let rows = vec![
            row(2, "LI-1", Some(600), "fran", Action::Approve),
            row(3, "LI-1", Some(600), "cleo", Action::Approve),
        ];
        batch.run(tokio_stream::iter(rows)).await;

        assert_eq!(batch.status_of(&key("LI-1")), Status::Approved);
        let outcomes = batch.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, "PENDING_APPROVAL");
        assert_eq!(outcomes[0].claimed_by, "first_line");
        assert_eq!(outcomes[1].status, "APPROVED");
        assert_eq!(outcomes[1].claimed_by, "final");
    }

    #[tokio::test]
    async fn errors_do_not_stop_the_batch() {
        let mut batch = batch();
        let rows = vec![
            row(2, "LI-1", None, "fran", Action::Approve),
            row(3, "LI-2", Some(10), "fran", Action::Approve),
        ];
        batch.run(tokio_stream::iter(rows)).await;

        let outcomes = batch.into_outcomes();
        assert_eq!(outcomes[0].claimed_by, "rejected");
        assert_eq!(outcomes[0].status, "NEW_REQUEST");
        assert_eq!(outcomes[1].claimed_by, "first_line");
    }

    #[tokio::test]
    async fn unhandled_rows_keep_status() {
        let mut batch = batch();
        let result = batch
            .apply(row(2, "LI-1", Some(10), "nobody", Action::Approve))
            .await
            .unwrap();

        assert!(!result.is_handled());
        assert_eq!(batch.status_of(&key("LI-1")), Status::NewRequest);
        assert_eq!(batch.outcomes()[0].claimed_by, "unhandled");
    }
}
