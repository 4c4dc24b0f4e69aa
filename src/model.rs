//! Core domain types for requisition routing.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;

/// Actor identifier as known to the directory service.
pub type ActorId = String;

/// Lifecycle status of one line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    NewRequest,
    PendingApproval,
    Approved,
    Denied,
    OnHold,
    Cancelled,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NewRequest => "NEW_REQUEST",
            Status::PendingApproval => "PENDING_APPROVAL",
            Status::Approved => "APPROVED",
            Status::Denied => "DENIED",
            Status::OnHold => "ON_HOLD",
            Status::Cancelled => "CANCELLED",
            Status::Completed => "COMPLETED",
        }
    }

    /// `APPROVED` counts as terminal even though it may still be absorbed into `COMPLETED`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Approved | Status::Denied | Status::Cancelled | Status::Completed
        )
    }

    /// Forward-only transition lattice.
    pub fn can_advance_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (NewRequest, PendingApproval | Denied) => true,
            (PendingApproval | OnHold, Approved | Denied) => true,
            (NewRequest | PendingApproval, OnHold) => true,
            (NewRequest | PendingApproval | OnHold, Cancelled | Completed) => true,
            (Approved, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "NEW_REQUEST" => Status::NewRequest,
            "PENDING_APPROVAL" => Status::PendingApproval,
            "APPROVED" => Status::Approved,
            "DENIED" => Status::Denied,
            "ON_HOLD" => Status::OnHold,
            "CANCELLED" => Status::Cancelled,
            "COMPLETED" => Status::Completed,
            _ => return Err(UnknownStatus(s.to_string())),
        };
        Ok(status)
    }
}

/// What the actor asked to do with the line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Deny,
    FollowUp,
    Cancel,
    Complete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Deny => "deny",
            Action::FollowUp => "follow_up",
            Action::Cancel => "cancel",
            Action::Complete => "complete",
        }
    }

    /// Approve and deny travel down the review chain; the rest are dispositions.
    pub fn is_review(self) -> bool {
        matches!(self, Action::Approve | Action::Deny)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown action '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Action::Approve,
            "deny" => Action::Deny,
            "follow_up" | "follow-up" => Action::FollowUp,
            "cancel" => Action::Cancel,
            "complete" => Action::Complete,
            _ => return Err(UnknownAction(s.to_string())),
        };
        Ok(action)
    }
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("line item {line_item}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub line_item: String,
    pub from: Status,
    pub to: Status,
}

/// Uniqueness key of pending and final approval records.
///
/// The approval header is the requisition itself, so `header` is the request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub header: String,
    pub line_item: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.header, self.line_item)
    }
}

/// One line item being acted on, constructed per routing call.
///
/// `fund_code` and `line_item_id` are fixed at construction. Status only moves
/// through [`ApprovalRequest::advance`].
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    request_id: String,
    line_item_id: String,
    fund_code: Option<String>,
    pub total_price: Option<Amount>,
    status: Status,
    pub requester_id: ActorId,
    pub actor_id: ActorId,
    pub action: Action,
}

impl ApprovalRequest {
    pub fn new(
        request_id: impl Into<String>,
        line_item_id: impl Into<String>,
        fund_code: Option<String>,
        total_price: Option<Amount>,
        actor_id: impl Into<ActorId>,
        action: Action,
    ) -> Self {
        let actor_id = actor_id.into();
        Self {
            request_id: request_id.into(),
            line_item_id: line_item_id.into(),
            fund_code,
            total_price,
            status: Status::NewRequest,
            requester_id: actor_id.clone(),
            actor_id,
            action,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<ActorId>) -> Self {
        self.requester_id = requester_id.into();
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn line_item_id(&self) -> &str {
        &self.line_item_id
    }

    pub fn fund_code(&self) -> Option<&str> {
        self.fund_code.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            header: self.request_id.clone(),
            line_item: self.line_item_id.clone(),
        }
    }

    /// Move to `next` if the lattice allows it.
    pub fn advance(&mut self, next: Status) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                line_item: self.line_item_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Resolved directory entry for an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub actor_id: ActorId,
    pub email: String,
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn new<I, R>(actor_id: impl Into<ActorId>, email: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            actor_id: actor_id.into(),
            email: email.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// In-flight approval decision for one line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApprovalRecord {
    pub key: RecordKey,
    pub approver_actor_id: ActorId,
    /// Fixed when the record is created. Later price edits do not change it.
    pub deputy_can_approve: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome recorded by the final stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
}

/// Concluded approval decision; supersedes the pending record with the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalApprovalRecord {
    pub key: RecordKey,
    pub approver: ActorId,
    pub decision: Decision,
    pub deputy_can_approve: bool,
    pub pending_approved_at: DateTime<Utc>,
    pub final_approved_at: DateTime<Utc>,
}

/// Router stage that may claim a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FirstLine,
    SecondLine,
    Final,
    /// Explicit follow-up, cancel and complete actions.
    Disposition,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::FirstLine => "first_line",
            Stage::SecondLine => "second_line",
            Stage::Final => "final",
            Stage::Disposition => "disposition",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one handler in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Claimed(Stage),
    Passed,
}

/// Notification categories dispatched by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AwaitingFinalReview,
    Escalation,
    RequestApproved,
    RequestDenied,
    FollowUpRequested,
    RequestCancelled,
    RequestCompleted,
}

/// Structured outcome of [`Router::route`](crate::Router::route).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResult {
    pub key: RecordKey,
    pub final_status: Status,
    /// `None` means no stage acted: the request is unhandled.
    pub claimed_by: Option<Stage>,
    pub notifications: Vec<NotificationKind>,
}

impl RoutingResult {
    pub fn is_handled(&self) -> bool {
        self.claimed_by.is_some()
    }
}

impl fmt::Display for RoutingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.claimed_by {
            Some(stage) => write!(
                f,
                "line item {} handled by {stage}: {}",
                self.key, self.final_status
            ),
            None => write!(
                f,
                "cannot process line item {}: no reviewer may act on it in status {}",
                self.key, self.final_status
            ),
        }
    }
}
