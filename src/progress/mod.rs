//! Progress tracking.
//!
//! Each user-visible operation owns an [`Operation`] created by
//! [`ProgressTracker::start`]. Marking a milestone recomputes the percentage
//! and pushes a `PROGRESS_UPDATE` event to the caller's session. Push failures
//! are logged; the milestone stays recorded and the next successful push
//! carries the cumulative percentage.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::ports::PushSink;

mod steps;
pub use steps::{ApprovalStep, DownloadStep, OperationKind, Step, SubmitStep};

/// Event name carried by every progress payload.
pub const PROGRESS_EVENT: &str = "PROGRESS_UPDATE";

/// Done flags for the steps of one kind, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedStepSet<S: Step> {
    done: Vec<bool>,
    _steps: PhantomData<S>,
}

impl<S: Step> WeightedStepSet<S> {
    pub fn new() -> Self {
        Self {
            done: vec![false; S::ALL.len()],
            _steps: PhantomData,
        }
    }

    /// Returns `false` if the step was already done.
    pub fn mark(&mut self, step: S) -> bool {
        let slot = &mut self.done[step.index()];
        let newly_done = !*slot;
        *slot = true;
        newly_done
    }

    pub fn is_done(&self, step: S) -> bool {
        self.done[step.index()]
    }

    pub fn total_weight(&self) -> u32 {
        S::ALL.iter().map(|step| step.weight()).sum()
    }

    pub fn done_weight(&self) -> u32 {
        S::ALL
            .iter()
            .zip(&self.done)
            .filter(|(_, done)| **done)
            .map(|(step, _)| step.weight())
            .sum()
    }

    /// Done weight normalized to 0..=100, rounded down.
    pub fn percent(&self) -> u8 {
        let total = self.total_weight();
        if total == 0 {
            return 100;
        }
        (u64::from(self.done_weight()) * 100 / u64::from(total)) as u8
    }

    pub fn remaining(&self) -> Vec<S> {
        S::ALL
            .iter()
            .zip(&self.done)
            .filter(|(_, done)| !**done)
            .map(|(step, _)| *step)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.done.iter().all(|done| *done)
    }

    pub fn reset(&mut self) {
        self.done.iter_mut().for_each(|done| *done = false);
    }
}

impl<S: Step> Default for WeightedStepSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out request-scoped operations that push to one transport.
#[derive(Clone)]
pub struct ProgressTracker {
    push: Arc<dyn PushSink>,
}

impl ProgressTracker {
    pub fn new(push: Arc<dyn PushSink>) -> Self {
        Self { push }
    }

    /// Fresh, zeroed operation reporting to `session_id`.
    pub fn start<S: Step>(&self, session_id: impl Into<String>) -> Operation<S> {
        let operation = Operation {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            steps: WeightedStepSet::new(),
            push: Arc::clone(&self.push),
        };
        debug!(
            operation = %operation.id,
            session = %operation.session_id,
            kind = ?S::KIND,
            "progress operation started"
        );
        operation
    }
}

/// One live operation. Owned by the request that started it.
pub struct Operation<S: Step> {
    id: Uuid,
    session_id: String,
    steps: WeightedStepSet<S>,
    push: Arc<dyn PushSink>,
}

impl<S: Step> Operation<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        S::KIND
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn percent(&self) -> u8 {
        self.steps.percent()
    }

    pub fn steps(&self) -> &WeightedStepSet<S> {
        &self.steps
    }

    /// Marks `step` done and pushes the new percentage.
    ///
    /// Marking a step twice is a no-op and pushes nothing.
    pub async fn mark_step_done(&mut self, step: S) -> u8 {
        if !self.steps.mark(step) {
            return self.steps.percent();
        }
        let percent = self.steps.percent();
        debug!(
            operation = %self.id,
            step = step.name(),
            percent,
            "progress step done"
        );

        let payload = serde_json::json!({
            "event": PROGRESS_EVENT,
            "kind": S::KIND,
            "operation": self.id.to_string(),
            "step": step.name(),
            "percent": percent,
        });
        if let Err(e) = self.push.push(&self.session_id, payload).await {
            warn!(
                operation = %self.id,
                session = %self.session_id,
                percent,
                reason = %e,
                "progress push failed"
            );
        }
        percent
    }

    pub async fn mark_all_done(&mut self, steps: &[S]) -> u8 {
        for step in steps {
            self.mark_step_done(*step).await;
        }
        self.steps.percent()
    }

    pub fn remaining_steps(&self) -> Vec<S> {
        self.steps.remaining()
    }

    pub fn reset(&mut self) {
        debug!(operation = %self.id, "progress reset");
        self.steps.reset();
    }
}
