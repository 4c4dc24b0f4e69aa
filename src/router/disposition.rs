//! Explicit follow-up, cancel and complete actions.

use tracing::info;

use super::RouteError;
use super::handlers::{Deps, RouteContext};
use crate::model::{Action, NotificationKind, Stage, StageOutcome, Status};

/// Applies a side-state action, or passes when the actor may not or the
/// lattice forbids it.
pub(crate) async fn apply(deps: &Deps, ctx: &mut RouteContext<'_>) -> Result<StageOutcome, RouteError> {
    let policy = &deps.policy;
    let actor = &ctx.actor;
    let (target, allowed, kind) = match ctx.request.action {
        Action::FollowUp => (
            Status::OnHold,
            policy.is_reviewer(actor),
            NotificationKind::FollowUpRequested,
        ),
        Action::Cancel => (
            Status::Cancelled,
            actor.actor_id == ctx.request.requester_id || policy.is_senior_clerk(actor),
            NotificationKind::RequestCancelled,
        ),
        Action::Complete => (
            Status::Completed,
            policy.is_final_reviewer(actor),
            NotificationKind::RequestCompleted,
        ),
        Action::Approve | Action::Deny => return Ok(StageOutcome::Passed),
    };

    let key = ctx.request.key();
    let from = ctx.request.status();
    if !allowed || !from.can_advance_to(target) {
        info!(
            line_item = %key,
            action = %ctx.request.action,
            actor = %actor.actor_id,
            allowed,
            status = %from,
            "disposition not applicable"
        );
        return Ok(StageOutcome::Passed);
    }

    ctx.request.advance(target)?;
    if matches!(target, Status::Cancelled | Status::Completed) {
        deps.store
            .discard_pending_record(&key)
            .await
            .map_err(RouteError::store(&key))?;
    }
    let recipients = ctx.requester();
    ctx.queue(kind, recipients);
    info!(line_item = %key, from = %from, to = %target, "disposition applied");
    Ok(StageOutcome::Claimed(Stage::Disposition))
}
