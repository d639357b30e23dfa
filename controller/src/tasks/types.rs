use crate::tasks::config::ControllerConfig;
use crate::tasks::deploy::restrict::KappOperation;
use crate::tasks::reftracker::AppRefTracker;
use crate::tasks::stages::{Stage, Stages};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Finalizer attached to every reconciled resource
pub const FINALIZER_NAME: &str = "finalizers.kapp-ctrl.k14s.io/delete";

/// Finalizer written by older controller versions; removed on unblock
pub const PREV_FINALIZER_NAME: &str = "kapp-ctrl.k14s.io/delete";

/// Total fetch-modify-write attempts for a status update
pub const STATUS_UPDATE_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Object is missing a name or namespace")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{stage} failed: {message}")]
    StageFailed {
        stage: Stage,
        message: String,
        requeue_after: Duration,
    },

    #[error("Unsupported kapp flag '{flag}' for {operation}")]
    RestrictedFlag {
        flag: String,
        operation: KappOperation,
    },
}

impl Error {
    /// Suggested requeue interval carried by stage failures
    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::StageFailed { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }

    /// Optimistic-concurrency conflict reported by the API server
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(ae)) if ae.code == 409)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconcile
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub tracker: Arc<AppRefTracker>,
    pub stages: Stages,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        }))
    }

    #[test]
    fn conflict_detection_only_matches_409() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::MissingObjectKey.is_conflict());
    }

    #[test]
    fn only_stage_failures_carry_requeue_hint() {
        let err = Error::StageFailed {
            stage: Stage::Fetch,
            message: "boom".to_string(),
            requeue_after: Duration::from_secs(4),
        };
        assert_eq!(err.requeue_after(), Some(Duration::from_secs(4)));
        assert_eq!(err.to_string(), "Fetch failed: boom");
        assert_eq!(api_error(409).requeue_after(), None);
    }
}
