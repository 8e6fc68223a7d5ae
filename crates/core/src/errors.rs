use thiserror::Error;

use crate::domain::scheduled_action::ActionStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid scheduled action transition from {from:?} to {to:?}")]
    InvalidActionTransition { from: ActionStatus, to: ActionStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Stable label used as the `error_class` field in structured logs.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Persistence(_) => "persistence",
            Self::Integration(_) => "integration",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Transient failures are worth another attempt on the next cycle;
    /// domain and configuration failures will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Integration(_))
    }
}
