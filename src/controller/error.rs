//! Error types shared by every reconciler

use std::time::Duration;

use thiserror::Error;

use crate::resources::engine::EngineError;
use crate::resources::publication::PublicationSpecError;
use crate::resources::sql::IdentifierError;

/// Reconcile errors
///
/// The `Display` text of the user-facing variants is copied verbatim into
/// `status.message`, so they carry the bare message without a prefix.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed spec, terminal until the resource is edited
    #[error("{0}")]
    Validation(String),

    /// A referenced record or secret is missing (it may appear later)
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Engine(#[from] EngineError),

    /// A status or metadata write lost an optimistic-concurrency race
    #[error("conflicting update of {0}, retrying")]
    PatchConflict(String),

    /// A rotation became due while old logins are still draining
    #[error("{0}")]
    RotationBlocked(String),

    /// A dependent record still references the record being deleted
    #[error("{0}")]
    LinkedResource(String),

    /// Physical state that cannot be reconciled in place
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Timeout(String),

    /// A detached mutation for the same record has not finished yet
    #[error("{0}")]
    MutationInFlight(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("illegal phase transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

impl From<IdentifierError> for Error {
    fn from(e: IdentifierError) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<PublicationSpecError> for Error {
    fn from(e: PublicationSpecError) -> Self {
        Error::Validation(e.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::Engine(_)
            | Error::NotFound(_)
            | Error::PatchConflict(_)
            | Error::RotationBlocked(_)
            | Error::LinkedResource(_)
            | Error::Timeout(_)
            | Error::MutationInFlight(_) => true,
            Error::Validation(_)
            | Error::Conflict(_)
            | Error::Serialization(_)
            | Error::MissingObjectKey(_)
            | Error::IllegalTransition { .. } => false,
        }
    }

    /// Whether the error should be written into the resource's status
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Error::PatchConflict(_))
    }

    /// Short machine-readable reason used for events and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationFailed",
            Error::NotFound(_) => "DependencyNotFound",
            Error::Engine(_) => "EngineError",
            Error::PatchConflict(_) => "PatchConflict",
            Error::RotationBlocked(_) => "RotationBlocked",
            Error::LinkedResource(_) => "LinkedResourceExists",
            Error::Conflict(_) => "Conflict",
            Error::Timeout(_) => "Timeout",
            Error::MutationInFlight(_) => "MutationInFlight",
            Error::Kube(_) => "KubernetesError",
            Error::Serialization(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::IllegalTransition { .. } => "IllegalTransition",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Requeue delay after a lost status-patch race
pub const PATCH_CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if matches!(error, Error::PatchConflict(_)) {
            PATCH_CONFLICT_REQUEUE
        } else if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Terminal until edited; an edit triggers a reconcile anyway
            self.max_delay
        }
    }
}
