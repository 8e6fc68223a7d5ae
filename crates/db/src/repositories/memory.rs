use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use outreach_core::domain::scheduled_action::{
    ActionStatus, NewScheduledAction, ScheduledAction, ScheduledActionId, SubjectId,
};

use super::{MarkExecutedOutcome, RepositoryError, ScheduledActionRepository};

/// Process-local store with the same claim and cancellation semantics as the
/// SQL repository. Claims are serialized by the write lock.
pub struct InMemoryScheduledActionRepository {
    actions: RwLock<HashMap<String, ScheduledAction>>,
    claim_lease: chrono::Duration,
}

impl Default for InMemoryScheduledActionRepository {
    fn default() -> Self {
        Self::with_claim_lease(Duration::from_secs(300))
    }
}

impl InMemoryScheduledActionRepository {
    pub fn with_claim_lease(claim_lease: Duration) -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            claim_lease: chrono::Duration::from_std(claim_lease)
                .unwrap_or(chrono::Duration::seconds(300)),
        }
    }

    async fn insert(&self, action: ScheduledAction) -> Result<ScheduledAction, RepositoryError> {
        let mut actions = self.actions.write().await;
        if actions.contains_key(&action.id.0) {
            return Err(RepositoryError::DuplicateId(action.id.0.clone()));
        }
        actions.insert(action.id.0.clone(), action.clone());
        Ok(action)
    }
}

fn sort_by_schedule(actions: &mut [ScheduledAction]) {
    actions.sort_by(|left, right| {
        left.scheduled_for
            .cmp(&right.scheduled_for)
            .then_with(|| left.created_at.cmp(&right.created_at))
    });
}

#[async_trait::async_trait]
impl ScheduledActionRepository for InMemoryScheduledActionRepository {
    async fn create(&self, action: NewScheduledAction) -> Result<ScheduledAction, RepositoryError> {
        self.insert(ScheduledAction::from_new(action, Utc::now())).await
    }

    async fn get_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError> {
        let actions = self.actions.read().await;
        Ok(actions.get(&id.0).cloned())
    }

    async fn list_pending(
        &self,
        subject_id: Option<&SubjectId>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let actions = self.actions.read().await;
        let mut pending: Vec<_> = actions
            .values()
            .filter(|action| action.status == ActionStatus::Pending)
            .filter(|action| subject_id.map_or(true, |subject| &action.subject_id == subject))
            .cloned()
            .collect();
        sort_by_schedule(&mut pending);
        Ok(pending)
    }

    async fn cancel_pending_for_subject(
        &self,
        subject_id: &SubjectId,
        reason: &str,
    ) -> Result<u64, RepositoryError> {
        let now = Utc::now();
        let mut actions = self.actions.write().await;
        let mut cancelled = 0;

        for action in actions.values_mut() {
            if &action.subject_id != subject_id || action.status != ActionStatus::Pending {
                continue;
            }
            if action.is_claimed(now) {
                action.request_cancel(reason, now).map_err(integrity)?;
                continue;
            }
            action.cancel(reason, now).map_err(integrity)?;
            cancelled += 1;
        }

        Ok(cancelled)
    }

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
    ) -> Result<MarkExecutedOutcome, RepositoryError> {
        let mut actions = self.actions.write().await;
        let action = actions.get_mut(&id.0).ok_or_else(|| RepositoryError::NotFound(id.0.clone()))?;

        match action.status {
            ActionStatus::Executed => Ok(MarkExecutedOutcome::AlreadyExecuted),
            ActionStatus::Cancelled => Ok(MarkExecutedOutcome::AlreadyCancelled),
            ActionStatus::Pending => {
                action.mark_executed(Utc::now()).map_err(integrity)?;
                Ok(MarkExecutedOutcome::Executed)
            }
        }
    }

    async fn claim_due(
        &self,
        claimant: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let mut actions = self.actions.write().await;

        for action in actions.values_mut() {
            if action.is_cancel_requested() && !action.is_claimed(now) {
                let reason = action.cancel_reason.clone().unwrap_or_default();
                action.cancel(&reason, now).map_err(integrity)?;
            }
        }

        let mut due: Vec<_> = actions
            .values()
            .filter(|action| action.is_due(now) && !action.is_claimed(now))
            .cloned()
            .collect();
        sort_by_schedule(&mut due);
        due.truncate(limit as usize);

        let expires_at = now + self.claim_lease;
        let mut claimed = Vec::with_capacity(due.len());
        for candidate in due {
            if let Some(action) = actions.get_mut(&candidate.id.0) {
                action.claimed_by = Some(claimant.to_string());
                action.claim_expires_at = Some(expires_at);
                action.updated_at = now;
                claimed.push(action.clone());
            }
        }

        Ok(claimed)
    }

    async fn release_claim(
        &self,
        id: &ScheduledActionId,
        claimant: &str,
    ) -> Result<bool, RepositoryError> {
        let mut actions = self.actions.write().await;
        let Some(action) = actions.get_mut(&id.0) else {
            return Ok(false);
        };

        if action.status != ActionStatus::Pending || action.claimed_by.as_deref() != Some(claimant)
        {
            return Ok(false);
        }

        let now = Utc::now();
        if action.is_cancel_requested() {
            let reason = action.cancel_reason.clone().unwrap_or_default();
            action.cancel(&reason, now).map_err(integrity)?;
        } else {
            action.claimed_by = None;
            action.claim_expires_at = None;
            action.updated_at = now;
        }
        Ok(true)
    }
}

fn integrity(error: outreach_core::errors::DomainError) -> RepositoryError {
    RepositoryError::Integrity(error.to_string())
}
