//! Error types for routing.

use thiserror::Error;

use crate::model::{RecordKey, TransitionError};
use crate::policy::IntegrityError;

/// Top-level error returned by [`Router::route`](super::Router::route).
///
/// Authorization denials are not errors; they surface as an unhandled
/// [`RoutingResult`](crate::RoutingResult).
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("rejected input: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    #[error("directory lookup for actor {actor} failed: {source}")]
    Directory {
        actor: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("approval store failed for {key}: {source}")]
    Store {
        key: RecordKey,
        #[source]
        source: anyhow::Error,
    },
}

impl RouteError {
    /// True for faults in the request itself, as opposed to collaborator failures.
    pub fn is_rejected_input(&self) -> bool {
        matches!(self, RouteError::Integrity(_))
    }

    pub(crate) fn store(key: &RecordKey) -> impl FnOnce(anyhow::Error) -> RouteError + '_ {
        move |source| RouteError::Store {
            key: key.clone(),
            source,
        }
    }
}
