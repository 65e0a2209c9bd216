//! Fleet configurator error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// Every failure inside an agent degrades into one of these variants; none of them are fatal to
/// the process. See `AppError::disposition` for how the reaction loop treats each class.
#[derive(Debug, Error)]
pub enum AppError {
    /// A dependency (peer data, credential, registry entry) is not yet available.
    #[error("not ready: {0}")]
    NotReady(String),
    /// A record failed basic shape validation.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// An external collaborator (daemon, registry, exchange) failed.
    #[error("collaborator failure: {0:#}")]
    Collaborator(anyhow::Error),
    /// An invariant which the system relies upon was observed to be violated.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// An administrative request was rejected by this agent.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// How the reaction loop should treat a failed handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Re-enqueue the handler after a delay.
    Defer,
    /// Log the failure and move on.
    Drop,
    /// Surface a blocked status and retry on the next relevant event.
    Block,
}

impl AppError {
    /// Classify this error for the reaction loop.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::NotReady(_) => Disposition::Defer,
            Self::MalformedInput(_) | Self::Rejected(_) => Disposition::Drop,
            // A split writer is handled exactly like a failing collaborator.
            Self::Collaborator(_) | Self::InvariantViolation(_) => Disposition::Block,
        }
    }

    /// Wrap the given error as a collaborator failure.
    pub fn collaborator(err: impl Into<anyhow::Error>) -> Self {
        Self::Collaborator(err.into())
    }
}

/// The result type returned by agent handlers.
pub type HandlerResult<T = ()> = ::std::result::Result<T, AppError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
