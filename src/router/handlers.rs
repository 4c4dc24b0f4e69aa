//! The three review stages.
//!
//! Every stage runs on every routing call so its bookkeeping (progress marks)
//! happens even after an earlier stage claimed the request. Only the policy
//! evaluation is skipped once a claim exists.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::RouteError;
use crate::Amount;
use crate::model::{
    Action, ApprovalRequest, Decision, FinalApprovalRecord, Identity, NotificationKind,
    PendingApprovalRecord, RecordKey, Stage, StageOutcome, Status,
};
use crate::policy::{IntegrityError, Policy};
use crate::ports::{ApprovalStore, Claim, Notification, NotificationContext, Recipient};
use crate::progress::{ApprovalStep, Operation};

/// Collaborators the stages share.
pub(crate) struct Deps {
    pub policy: Policy,
    pub store: Arc<dyn ApprovalStore>,
}

/// State threaded through one routing call.
pub(crate) struct RouteContext<'a> {
    pub request: ApprovalRequest,
    pub actor: Identity,
    pub progress: &'a mut Operation<ApprovalStep>,
    pub claimed_by: Option<Stage>,
    pub outbox: Vec<Notification>,
    pub now: DateTime<Utc>,
}

impl RouteContext<'_> {
    pub fn queue(&mut self, kind: NotificationKind, recipients: Vec<Recipient>) {
        let request = &self.request;
        self.outbox.push(Notification {
            kind,
            recipients,
            context: NotificationContext {
                request_id: request.request_id().to_string(),
                line_item_id: request.line_item_id().to_string(),
                fund_code: request.fund_code().map(str::to_string),
                total_price: request.total_price.map(|p| p.to_string()),
                status: request.status(),
                actor_id: request.actor_id.clone(),
            },
        });
    }

    /// Price was checked before the chain started.
    pub fn total_price(&self) -> Result<Amount, IntegrityError> {
        self.request.total_price.ok_or_else(|| {
            IntegrityError::MissingTotalPrice(self.request.line_item_id().to_string())
        })
    }

    pub fn requester(&self) -> Vec<Recipient> {
        vec![Recipient::Actor(self.request.requester_id.clone())]
    }
}

#[async_trait]
pub(crate) trait ReviewStage: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(
        &self,
        deps: &Deps,
        ctx: &mut RouteContext<'_>,
    ) -> Result<StageOutcome, RouteError>;
}

/// First-line (H1) or second-line (H2) department review.
pub(crate) struct DepartmentReview {
    stage: Stage,
}

impl DepartmentReview {
    pub fn first_line() -> Self {
        Self {
            stage: Stage::FirstLine,
        }
    }

    pub fn second_line() -> Self {
        Self {
            stage: Stage::SecondLine,
        }
    }

    fn steps(&self) -> [ApprovalStep; 3] {
        match self.stage {
            Stage::FirstLine => [
                ApprovalStep::FirstLineEvaluated,
                ApprovalStep::FirstLineRecorded,
                ApprovalStep::FirstLineNotified,
            ],
            _ => [
                ApprovalStep::SecondLineEvaluated,
                ApprovalStep::SecondLineRecorded,
                ApprovalStep::SecondLineNotified,
            ],
        }
    }

    fn may_act(&self, policy: &Policy, ctx: &RouteContext<'_>) -> Result<bool, IntegrityError> {
        let request = &ctx.request;
        match self.stage {
            Stage::FirstLine => policy.can_first_line_approve(
                request.line_item_id(),
                request.fund_code(),
                request.status(),
                &ctx.actor,
            ),
            _ => policy.can_second_line_approve(
                request.line_item_id(),
                request.fund_code(),
                request.status(),
                &ctx.actor,
            ),
        }
    }

    /// Whether the line item already entered final review or was finalized.
    async fn already_reviewed(&self, deps: &Deps, key: &RecordKey) -> Result<bool, RouteError> {
        let store = &deps.store;
        if store.final_record(key).await.map_err(RouteError::store(key))?.is_some() {
            return Ok(true);
        }
        Ok(store
            .pending_record(key)
            .await
            .map_err(RouteError::store(key))?
            .is_some())
    }

    async fn claim(
        &self,
        deps: &Deps,
        ctx: &mut RouteContext<'_>,
    ) -> Result<StageOutcome, RouteError> {
        let key = ctx.request.key();
        match ctx.request.action {
            Action::Deny => {
                if self.already_reviewed(deps, &key).await? {
                    info!(line_item = %key, stage = %self.stage, "stale deny, line item is past department review");
                    return Ok(StageOutcome::Passed);
                }
                ctx.request.advance(Status::Denied)?;
                let recipients = ctx.requester();
                ctx.queue(NotificationKind::RequestDenied, recipients);
                info!(line_item = %key, stage = %self.stage, "line item denied");
            }
            _ => {
                let deputy_can_approve = deps.policy.deputy_can_approve(ctx.total_price()?);
                let record = PendingApprovalRecord {
                    key: key.clone(),
                    approver_actor_id: ctx.actor.actor_id.clone(),
                    deputy_can_approve,
                    created_at: ctx.now,
                };
                let claim = deps
                    .store
                    .insert_pending_record(record)
                    .await
                    .map_err(RouteError::store(&key))?;

                if matches!(claim, Claim::Existing(_))
                    && deps
                        .store
                        .final_record(&key)
                        .await
                        .map_err(RouteError::store(&key))?
                        .is_some()
                {
                    info!(line_item = %key, stage = %self.stage, "stale approval, line item is already finalized");
                    return Ok(StageOutcome::Passed);
                }
                ctx.request.advance(Status::PendingApproval)?;

                match claim {
                    Claim::Inserted => {
                        let config = deps.policy.config();
                        let mut recipients = vec![Recipient::Group(config.senior_clerk_role.clone())];
                        if deputy_can_approve {
                            recipients.push(Recipient::Group(config.delegate_role.clone()));
                        }
                        ctx.queue(NotificationKind::AwaitingFinalReview, recipients);
                        info!(
                            line_item = %key,
                            stage = %self.stage,
                            deputy_can_approve,
                            "line item pending final review"
                        );
                    }
                    Claim::Existing(existing) => {
                        info!(
                            line_item = %key,
                            stage = %self.stage,
                            approver = %existing.approver_actor_id,
                            "pending record already exists, claim is a no-op"
                        );
                    }
                }
            }
        }
        Ok(StageOutcome::Claimed(self.stage))
    }
}

#[async_trait]
impl ReviewStage for DepartmentReview {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn handle(
        &self,
        deps: &Deps,
        ctx: &mut RouteContext<'_>,
    ) -> Result<StageOutcome, RouteError> {
        let [evaluated, recorded, notified] = self.steps();
        let allowed = ctx.claimed_by.is_none() && self.may_act(&deps.policy, ctx)?;
        ctx.progress.mark_step_done(evaluated).await;

        let outcome = if allowed {
            self.claim(deps, ctx).await?
        } else {
            StageOutcome::Passed
        };
        ctx.progress.mark_all_done(&[recorded, notified]).await;
        Ok(outcome)
    }
}

/// Final clerk review (H3).
pub(crate) struct FinalReview;

impl FinalReview {
    async fn finalize(
        &self,
        deps: &Deps,
        ctx: &mut RouteContext<'_>,
        pending: PendingApprovalRecord,
    ) -> Result<(), RouteError> {
        let key = pending.key.clone();
        let decision = match ctx.request.action {
            Action::Deny => Decision::Denied,
            _ => Decision::Approved,
        };
        let record = FinalApprovalRecord {
            key: key.clone(),
            approver: ctx.actor.actor_id.clone(),
            decision,
            deputy_can_approve: pending.deputy_can_approve,
            pending_approved_at: pending.created_at,
            final_approved_at: ctx.now,
        };
        let claim = deps
            .store
            .insert_final_record(record)
            .await
            .map_err(RouteError::store(&key))?;

        let decision = match &claim {
            Claim::Inserted => decision,
            Claim::Existing(existing) => {
                info!(
                    line_item = %key,
                    approver = %existing.approver,
                    "final record already exists, claim is a no-op"
                );
                existing.decision
            }
        };
        let (status, kind) = match decision {
            Decision::Approved => (Status::Approved, NotificationKind::RequestApproved),
            Decision::Denied => (Status::Denied, NotificationKind::RequestDenied),
        };
        ctx.request.advance(status)?;
        if matches!(claim, Claim::Inserted) {
            let recipients = ctx.requester();
            ctx.queue(kind, recipients);
            info!(line_item = %key, decision = ?decision, "line item finalized");
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewStage for FinalReview {
    fn stage(&self) -> Stage {
        Stage::Final
    }

    async fn handle(
        &self,
        deps: &Deps,
        ctx: &mut RouteContext<'_>,
    ) -> Result<StageOutcome, RouteError> {
        const STEPS: [ApprovalStep; 4] = [
            ApprovalStep::FinalLookedUp,
            ApprovalStep::FinalEvaluated,
            ApprovalStep::FinalRecorded,
            ApprovalStep::FinalNotified,
        ];
        if ctx.claimed_by.is_some() {
            ctx.progress.mark_all_done(&STEPS).await;
            return Ok(StageOutcome::Passed);
        }

        let key = ctx.request.key();
        let pending = deps
            .store
            .pending_record(&key)
            .await
            .map_err(RouteError::store(&key))?;
        ctx.progress.mark_step_done(ApprovalStep::FinalLookedUp).await;

        let Some(pending) = pending else {
            ctx.progress.mark_all_done(&STEPS).await;
            return Ok(StageOutcome::Passed);
        };

        let request = &ctx.request;
        let allowed = deps.policy.can_final_approve(
            request.line_item_id(),
            request.total_price,
            request.status(),
            &ctx.actor,
            &pending,
        )?;
        ctx.progress.mark_step_done(ApprovalStep::FinalEvaluated).await;

        let outcome = if allowed {
            self.finalize(deps, ctx, pending).await?;
            StageOutcome::Claimed(Stage::Final)
        } else if deps.policy.is_final_reviewer(&ctx.actor) {
            let recipients = vec![Recipient::Group(
                deps.policy.config().senior_clerk_role.clone(),
            )];
            ctx.queue(NotificationKind::Escalation, recipients);
            info!(
                line_item = %key,
                actor = %ctx.actor.actor_id,
                deputy_can_approve = pending.deputy_can_approve,
                "actor may not finalize, escalating"
            );
            StageOutcome::Passed
        } else {
            StageOutcome::Passed
        };
        ctx.progress.mark_all_done(&STEPS).await;
        Ok(outcome)
    }
}
