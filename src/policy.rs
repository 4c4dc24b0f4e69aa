//! Authorization policy.
//!
//! Pure decision functions. A `false` answer is an authorization denial and is
//! never an error; [`IntegrityError`] is only returned when a field the decision
//! depends on is missing from the request.

use thiserror::Error;

use crate::Amount;
use crate::model::{Identity, PendingApprovalRecord, Status};

/// Missing or unusable request data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("line item {0} has no fund code")]
    MissingFundCode(String),
    #[error("line item {0} has no total price")]
    MissingTotalPrice(String),
}

/// Role names and thresholds the policy decides with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Fund code prefix routed to first-line review.
    pub first_line_prefix: String,
    pub first_line_group: String,
    pub second_line_group: String,
    pub senior_clerk_role: String,
    pub delegate_role: String,
    /// Highest price a delegate may finalize.
    pub deputy_limit: Amount,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            first_line_prefix: "511".to_string(),
            first_line_group: "dept-first-line".to_string(),
            second_line_group: "dept-second-line".to_string(),
            senior_clerk_role: "senior-clerk".to_string(),
            delegate_role: "clerk-delegate".to_string(),
            deputy_limit: Amount::from_whole(250),
        }
    }
}

/// Policy bound to one configuration.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    config: PolicyConfig,
}

impl Policy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Whether the fund code is routed to first-line review.
    pub fn is_first_line_fund(&self, fund_code: &str) -> bool {
        fund_code.starts_with(self.config.first_line_prefix.as_str())
    }

    pub fn can_first_line_approve(
        &self,
        line_item: &str,
        fund_code: Option<&str>,
        status: Status,
        actor: &Identity,
    ) -> Result<bool, IntegrityError> {
        let fund_code = require_fund_code(line_item, fund_code)?;
        Ok(status == Status::NewRequest
            && self.is_first_line_fund(fund_code)
            && actor.has_role(&self.config.first_line_group))
    }

    pub fn can_second_line_approve(
        &self,
        line_item: &str,
        fund_code: Option<&str>,
        status: Status,
        actor: &Identity,
    ) -> Result<bool, IntegrityError> {
        let fund_code = require_fund_code(line_item, fund_code)?;
        Ok(status == Status::NewRequest
            && !self.is_first_line_fund(fund_code)
            && actor.has_role(&self.config.second_line_group))
    }

    /// Senior clerks may always finalize. Delegates only when the pending
    /// record allows it and the line item is not already terminal.
    pub fn can_final_approve(
        &self,
        line_item: &str,
        total_price: Option<Amount>,
        status: Status,
        actor: &Identity,
        pending: &PendingApprovalRecord,
    ) -> Result<bool, IntegrityError> {
        if total_price.is_none() {
            return Err(IntegrityError::MissingTotalPrice(line_item.to_string()));
        }
        if actor.has_role(&self.config.senior_clerk_role) {
            return Ok(true);
        }
        Ok(pending.deputy_can_approve
            && actor.has_role(&self.config.delegate_role)
            && !status.is_terminal())
    }

    /// Computed once when a line item enters pending state.
    pub fn deputy_can_approve(&self, total_price: Amount) -> bool {
        total_price <= self.config.deputy_limit
    }

    /// Any role that takes part in review.
    pub fn is_reviewer(&self, actor: &Identity) -> bool {
        [
            &self.config.first_line_group,
            &self.config.second_line_group,
            &self.config.senior_clerk_role,
            &self.config.delegate_role,
        ]
        .into_iter()
        .any(|role| actor.has_role(role))
    }

    pub fn is_final_reviewer(&self, actor: &Identity) -> bool {
        actor.has_role(&self.config.senior_clerk_role) || actor.has_role(&self.config.delegate_role)
    }

    pub fn is_senior_clerk(&self, actor: &Identity) -> bool {
        actor.has_role(&self.config.senior_clerk_role)
    }
}

fn require_fund_code<'a>(
    line_item: &str,
    fund_code: Option<&'a str>,
) -> Result<&'a str, IntegrityError> {
    match fund_code.map(str::trim) {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(IntegrityError::MissingFundCode(line_item.to_string())),
    }
}
