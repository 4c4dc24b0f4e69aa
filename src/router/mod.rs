//! Approval routing.
//!
//! [`Router::route`] takes one line-item action through the fixed three-stage
//! review chain (first-line, second-line, final) or, for follow-up / cancel /
//! complete, through the disposition desk. Each stage either claims the request
//! or passes it on; stages keep running after a claim so their progress
//! milestones are still recorded.
//!
//! Durable state is committed before any notification goes out, and a failed
//! notification never undoes a committed transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::model::{ApprovalRequest, NotificationKind, RoutingResult, StageOutcome, Status};
use crate::policy::{IntegrityError, Policy};
use crate::ports::{ApprovalStore, Directory, Notification, Notifier};
use crate::progress::{ApprovalStep, Operation};
use crate::status::{StatusFlag, StatusStore};

mod disposition;
mod error;
mod handlers;

pub use error::RouteError;
use handlers::{DepartmentReview, Deps, FinalReview, ReviewStage, RouteContext};

/// Progress milestones owned by the review stages.
const CHAIN_STEPS: [ApprovalStep; 10] = [
    ApprovalStep::FirstLineEvaluated,
    ApprovalStep::FirstLineRecorded,
    ApprovalStep::FirstLineNotified,
    ApprovalStep::SecondLineEvaluated,
    ApprovalStep::SecondLineRecorded,
    ApprovalStep::SecondLineNotified,
    ApprovalStep::FinalLookedUp,
    ApprovalStep::FinalEvaluated,
    ApprovalStep::FinalRecorded,
    ApprovalStep::FinalNotified,
];

/// Best-effort notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per notification, at least 1.
    pub attempts: u32,
    /// Wait before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// The approval router.
pub struct Router {
    deps: Deps,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    status: Option<Arc<StatusStore>>,
    retry: RetryPolicy,
    chain: [Box<dyn ReviewStage>; 3],
}

/// Public API
impl Router {
    pub fn new(
        policy: Policy,
        directory: Arc<dyn Directory>,
        store: Arc<dyn ApprovalStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            deps: Deps { policy, store },
            directory,
            notifier,
            status: None,
            retry: RetryPolicy::default(),
            chain: [
                Box::new(DepartmentReview::first_line()),
                Box::new(DepartmentReview::second_line()),
                Box::new(FinalReview),
            ],
        }
    }

    /// Mirror routing outcomes into the cross-process status flags.
    pub fn with_status_store(mut self, status: Arc<StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.deps.policy
    }

    /// Route one line-item action on behalf of `request.actor_id`.
    ///
    /// Returns an unhandled result (`claimed_by == None`) when no stage may act.
    /// Integrity faults are rejected before any stage runs.
    pub async fn route(
        &self,
        request: ApprovalRequest,
        progress: &mut Operation<ApprovalStep>,
    ) -> Result<RoutingResult, RouteError> {
        progress.mark_step_done(ApprovalStep::RequestReceived).await;

        if let Err(e) = Self::check_integrity(&request) {
            warn!(
                request = request.request_id(),
                line_item = request.line_item_id(),
                reason = %e,
                "routing rejected"
            );
            return Err(e.into());
        }
        progress.mark_step_done(ApprovalStep::IntegrityChecked).await;

        let actor = self
            .directory
            .lookup(&request.actor_id)
            .await
            .map_err(|source| RouteError::Directory {
                actor: request.actor_id.clone(),
                source,
            })?;
        progress.mark_step_done(ApprovalStep::ActorResolved).await;

        let mut ctx = RouteContext {
            request,
            actor,
            progress,
            claimed_by: None,
            outbox: Vec::new(),
            now: Utc::now(),
        };

        if ctx.request.action.is_review() {
            for stage in &self.chain {
                let outcome = stage.handle(&self.deps, &mut ctx).await?;
                debug!(stage = %stage.stage(), outcome = ?outcome, "stage finished");
                if let StageOutcome::Claimed(claimed) = outcome {
                    ctx.claimed_by.get_or_insert(claimed);
                }
            }
        } else {
            if let StageOutcome::Claimed(claimed) = disposition::apply(&self.deps, &mut ctx).await? {
                ctx.claimed_by = Some(claimed);
            }
            ctx.progress.mark_all_done(&CHAIN_STEPS).await;
        }

        let key = ctx.request.key();
        let final_status = ctx.request.status();
        if ctx.claimed_by.is_some() {
            self.deps
                .store
                .record_status(&key, final_status)
                .await
                .map_err(RouteError::store(&key))?;
        }
        ctx.progress.mark_step_done(ApprovalStep::StatusCommitted).await;

        if ctx.claimed_by.is_some() {
            self.update_flags(status_flags(final_status)).await;
        }
        ctx.progress.mark_step_done(ApprovalStep::StatusFlagsUpdated).await;

        let outbox = std::mem::take(&mut ctx.outbox);
        let notifications: Vec<NotificationKind> = outbox.iter().map(|n| n.kind).collect();
        ctx.progress.mark_step_done(ApprovalStep::OutboxQueued).await;
        let delivered = self.dispatch(&outbox).await;
        if delivered > 0 {
            self.update_flags(vec![(StatusFlag::NotificationSent, true)])
                .await;
        }
        ctx.progress
            .mark_step_done(ApprovalStep::NotificationsDispatched)
            .await;

        let result = RoutingResult {
            key,
            final_status,
            claimed_by: ctx.claimed_by,
            notifications,
        };
        Self::log_result(&ctx.request, &result);
        ctx.progress.mark_step_done(ApprovalStep::AuditLogged).await;
        ctx.progress.mark_step_done(ApprovalStep::Finished).await;
        Ok(result)
    }
}

/// Private API
impl Router {
    fn check_integrity(request: &ApprovalRequest) -> Result<(), IntegrityError> {
        if request.fund_code().is_none_or(|code| code.trim().is_empty()) {
            return Err(IntegrityError::MissingFundCode(
                request.line_item_id().to_string(),
            ));
        }
        if request.total_price.is_none() {
            return Err(IntegrityError::MissingTotalPrice(
                request.line_item_id().to_string(),
            ));
        }
        Ok(())
    }

    fn log_result(request: &ApprovalRequest, result: &RoutingResult) {
        match result.claimed_by {
            Some(stage) => info!(
                request = request.request_id(),
                line_item = request.line_item_id(),
                action = %request.action,
                actor = %request.actor_id,
                stage = %stage,
                status = %result.final_status,
                "routing applied"
            ),
            None => warn!(
                request = request.request_id(),
                line_item = request.line_item_id(),
                action = %request.action,
                actor = %request.actor_id,
                status = %result.final_status,
                "routing unhandled: no stage may act"
            ),
        }
    }

    /// Sends each notification with bounded retries. Returns how many were delivered.
    async fn dispatch(&self, outbox: &[Notification]) -> usize {
        let attempts = self.retry.attempts.max(1);
        let mut delivered = 0;
        for notification in outbox {
            for attempt in 1..=attempts {
                match self.notifier.send(notification).await {
                    Ok(()) => {
                        delivered += 1;
                        break;
                    }
                    Err(e) if attempt < attempts => {
                        warn!(
                            kind = ?notification.kind,
                            line_item = %notification.context.line_item_id,
                            attempt,
                            reason = %e,
                            "notification failed, retrying"
                        );
                        tokio::time::sleep(self.retry.backoff * attempt).await;
                    }
                    Err(e) => {
                        error!(
                            kind = ?notification.kind,
                            line_item = %notification.context.line_item_id,
                            attempts,
                            reason = %e,
                            "notification dropped"
                        );
                    }
                }
            }
        }
        delivered
    }

    /// Flag updates are advisory; failures are logged only.
    async fn update_flags(&self, flags: Vec<(StatusFlag, bool)>) {
        let Some(store) = self.status.clone() else {
            return;
        };
        if flags.is_empty() {
            return;
        }
        let result = tokio::task::spawn_blocking(move || {
            let mut snapshot = None;
            for (flag, value) in flags {
                snapshot = Some(store.update(flag, value)?);
            }
            Ok::<_, crate::status::StatusError>(snapshot)
        })
        .await;
        match result {
            Ok(Ok(Some(snapshot))) => debug!(flags = %snapshot.to_json(), "status flags updated"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(reason = %e, "status flag update failed"),
            Err(e) => warn!(reason = %e, "status flag task failed"),
        }
    }
}

fn status_flags(status: Status) -> Vec<(StatusFlag, bool)> {
    match status {
        Status::PendingApproval => vec![(StatusFlag::RequestPending, true)],
        Status::Approved => vec![
            (StatusFlag::RequestPending, false),
            (StatusFlag::RequestApproved, true),
        ],
        Status::Denied => vec![
            (StatusFlag::RequestPending, false),
            (StatusFlag::RequestDenied, true),
        ],
        Status::Cancelled | Status::Completed => vec![(StatusFlag::RequestPending, false)],
        Status::NewRequest | Status::OnHold => vec![],
    }
}
