use async_trait::async_trait;
use thiserror::Error;

use outreach_core::chrono::{DateTime, Utc};
use outreach_core::domain::scheduled_action::{
    NewScheduledAction, ScheduledAction, ScheduledActionId, SubjectId,
};

pub mod memory;
pub mod scheduled_action;

pub use memory::InMemoryScheduledActionRepository;
pub use scheduled_action::SqlScheduledActionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("scheduled action not found: {0}")]
    NotFound(String),
    #[error("duplicate scheduled action id: {0}")]
    DuplicateId(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// What `mark_executed` found when it ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkExecutedOutcome {
    Executed,
    AlreadyExecuted,
    /// The row was cancelled after its lease lapsed; it stays cancelled.
    AlreadyCancelled,
}

/// Durable store for delayed actions.
///
/// Every implementation must make `claim_due` atomic across callers: two
/// concurrent claims never return the same row. Claims are leases on rows
/// that remain `pending`; a lease that expires without `mark_executed`
/// makes the row claimable again, so execution is at-least-once.
#[async_trait]
pub trait ScheduledActionRepository: Send + Sync {
    async fn create(&self, action: NewScheduledAction) -> Result<ScheduledAction, RepositoryError>;

    async fn get_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError>;

    /// Snapshot of pending rows, oldest `scheduled_for` first. Not a claim.
    async fn list_pending(
        &self,
        subject_id: Option<&SubjectId>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError>;

    /// Cancels every pending, unleased row for the subject and returns how
    /// many rows were cancelled. Rows leased by a poller keep their lease and
    /// get a cancel request instead: they end `cancelled` when the lease is
    /// released or lapses, and `executed` if the in-flight run succeeds.
    async fn cancel_pending_for_subject(
        &self,
        subject_id: &SubjectId,
        reason: &str,
    ) -> Result<u64, RepositoryError>;

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
    ) -> Result<MarkExecutedOutcome, RepositoryError>;

    /// Leases up to `limit` due rows to `claimant`, ordered by `scheduled_for`.
    async fn claim_due(
        &self,
        claimant: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, RepositoryError>;

    /// Drops `claimant`'s lease on a still-pending row, cancelling it if a
    /// cancel was requested during the lease. Returns false when the lease was
    /// not held (already released, expired and re-claimed, or terminal).
    async fn release_claim(
        &self,
        id: &ScheduledActionId,
        claimant: &str,
    ) -> Result<bool, RepositoryError>;
}
