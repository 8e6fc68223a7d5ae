use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use outreach_core::domain::scheduled_action::{
    ActionPayload, ActionStatus, ActionType, NewScheduledAction, ScheduledAction,
    ScheduledActionId, SubjectId,
};

use super::{MarkExecutedOutcome, RepositoryError, ScheduledActionRepository};
use crate::DbPool;

const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

const ACTION_COLUMNS: &str = "id,
    subject_id,
    action_type,
    scheduled_for,
    status,
    payload_json,
    created_at,
    updated_at,
    executed_at,
    cancelled_at,
    cancel_reason,
    cancel_requested_at,
    claimed_by,
    claim_expires_at";

pub struct SqlScheduledActionRepository {
    pool: DbPool,
    claim_lease: chrono::Duration,
}

impl SqlScheduledActionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self::with_claim_lease(pool, DEFAULT_CLAIM_LEASE)
    }

    /// `claim_lease` bounds how long a crashed poller can hold a row before
    /// another poller may claim it again.
    pub fn with_claim_lease(pool: DbPool, claim_lease: Duration) -> Self {
        let claim_lease =
            chrono::Duration::from_std(claim_lease).unwrap_or(chrono::Duration::seconds(300));
        Self { pool, claim_lease }
    }
}

#[async_trait::async_trait]
impl ScheduledActionRepository for SqlScheduledActionRepository {
    async fn create(&self, action: NewScheduledAction) -> Result<ScheduledAction, RepositoryError> {
        let action = ScheduledAction::from_new(action, Utc::now());

        sqlx::query(
            "INSERT INTO scheduled_action (
                id,
                subject_id,
                action_type,
                scheduled_for,
                status,
                payload_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&action.id.0)
        .bind(&action.subject_id.0)
        .bind(action.action_type.as_str())
        .bind(encode_timestamp(action.scheduled_for))
        .bind(action.status.as_str())
        .bind(action.payload.to_json_string())
        .bind(encode_timestamp(action.created_at))
        .bind(encode_timestamp(action.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::DuplicateId(action.id.0.clone())
            }
            other => RepositoryError::Database(other),
        })?;

        debug!(
            event_name = "db.scheduled_action.created",
            action_id = %action.id,
            subject_id = %action.subject_id,
            action_type = action.action_type.as_str(),
            scheduled_for = %action.scheduled_for,
            "scheduled action persisted"
        );

        Ok(action)
    }

    async fn get_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ACTION_COLUMNS} FROM scheduled_action WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(action_from_row).transpose()
    }

    async fn list_pending(
        &self,
        subject_id: Option<&SubjectId>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let rows = if let Some(subject_id) = subject_id {
            sqlx::query(&format!(
                "SELECT {ACTION_COLUMNS}
                 FROM scheduled_action
                 WHERE status = 'pending' AND subject_id = ?
                 ORDER BY scheduled_for ASC, created_at ASC"
            ))
            .bind(&subject_id.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {ACTION_COLUMNS}
                 FROM scheduled_action
                 WHERE status = 'pending'
                 ORDER BY scheduled_for ASC, created_at ASC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(action_from_row).collect()
    }

    async fn cancel_pending_for_subject(
        &self,
        subject_id: &SubjectId,
        reason: &str,
    ) -> Result<u64, RepositoryError> {
        let now = encode_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'cancelled',
                 cancelled_at = ?,
                 cancel_reason = ?,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 updated_at = ?
             WHERE subject_id = ?
               AND status = 'pending'
               AND (claim_expires_at IS NULL OR claim_expires_at <= ?)",
        )
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(&subject_id.0)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Leased rows keep their lease; release or expiry finishes the cancel.
        let deferred = sqlx::query(
            "UPDATE scheduled_action
             SET cancel_requested_at = ?,
                 cancel_reason = ?,
                 updated_at = ?
             WHERE subject_id = ?
               AND status = 'pending'
               AND claim_expires_at > ?
               AND cancel_requested_at IS NULL",
        )
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(&subject_id.0)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if deferred > 0 {
            debug!(
                event_name = "db.scheduled_action.cancel_deferred",
                subject_id = %subject_id,
                cancelled,
                deferred,
                "cancellation recorded on leased scheduled actions"
            );
        }

        Ok(cancelled)
    }

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
    ) -> Result<MarkExecutedOutcome, RepositoryError> {
        let now = encode_timestamp(Utc::now());

        let result = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'executed',
                 executed_at = ?,
                 cancel_reason = NULL,
                 cancel_requested_at = NULL,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(MarkExecutedOutcome::Executed);
        }

        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM scheduled_action WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(id.0.clone()))?;

        match ActionStatus::parse(&status) {
            Some(ActionStatus::Executed) => Ok(MarkExecutedOutcome::AlreadyExecuted),
            Some(ActionStatus::Cancelled) => Ok(MarkExecutedOutcome::AlreadyCancelled),
            Some(ActionStatus::Pending) | None => Err(RepositoryError::Integrity(format!(
                "scheduled action `{}` has unexpected status `{status}` after mark_executed",
                id.0
            ))),
        }
    }

    async fn claim_due(
        &self,
        claimant: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now_encoded = encode_timestamp(now);
        let expires_at = encode_timestamp(now + self.claim_lease);
        let mut tx = self.pool.begin().await?;

        // Lapsed leases on rows cancelled mid-flight resolve to `cancelled`.
        sqlx::query(
            "UPDATE scheduled_action
             SET status = 'cancelled',
                 cancelled_at = ?,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 updated_at = ?
             WHERE status = 'pending'
               AND cancel_requested_at IS NOT NULL
               AND (claim_expires_at IS NULL OR claim_expires_at <= ?)",
        )
        .bind(&now_encoded)
        .bind(&now_encoded)
        .bind(&now_encoded)
        .execute(&mut *tx)
        .await?;

        // The first UPDATE already holds SQLite's write lock, so concurrent
        // claimers are serialized on the same rows.
        let rows = sqlx::query(&format!(
            "UPDATE scheduled_action
             SET claimed_by = ?,
                 claim_expires_at = ?,
                 updated_at = ?
             WHERE status = 'pending'
               AND id IN (
                   SELECT id
                   FROM scheduled_action
                   WHERE status = 'pending'
                     AND scheduled_for <= ?
                     AND cancel_requested_at IS NULL
                     AND (claim_expires_at IS NULL OR claim_expires_at <= ?)
                   ORDER BY scheduled_for ASC, created_at ASC
                   LIMIT ?
               )
             RETURNING {ACTION_COLUMNS}"
        ))
        .bind(claimant)
        .bind(&expires_at)
        .bind(&now_encoded)
        .bind(&now_encoded)
        .bind(&now_encoded)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut claimed =
            rows.into_iter().map(action_from_row).collect::<Result<Vec<_>, RepositoryError>>()?;
        // RETURNING order is unspecified.
        claimed.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });

        Ok(claimed)
    }

    async fn release_claim(
        &self,
        id: &ScheduledActionId,
        claimant: &str,
    ) -> Result<bool, RepositoryError> {
        let now = encode_timestamp(Utc::now());

        let result = sqlx::query(
            "UPDATE scheduled_action
             SET status = CASE WHEN cancel_requested_at IS NULL THEN 'pending' ELSE 'cancelled' END,
                 cancelled_at = CASE WHEN cancel_requested_at IS NULL THEN NULL ELSE ? END,
                 claimed_by = NULL,
                 claim_expires_at = NULL,
                 updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&id.0)
        .bind(claimant)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Fixed-width UTC encoding so that SQL string comparison orders instants.
fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn action_from_row(row: SqliteRow) -> Result<ScheduledAction, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ActionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown scheduled action status `{status_raw}`"))
    })?;

    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let payload = ActionPayload::from_json_str(&payload_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid payload_json `{payload_raw}` ({error})"))
    })?;

    Ok(ScheduledAction {
        id: ScheduledActionId(row.try_get("id")?),
        subject_id: SubjectId(row.try_get("subject_id")?),
        action_type: ActionType::parse(&row.try_get::<String, _>("action_type")?),
        scheduled_for: parse_timestamp("scheduled_for", row.try_get("scheduled_for")?)?,
        status,
        payload,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        executed_at: parse_optional_timestamp("executed_at", row.try_get("executed_at")?)?,
        cancelled_at: parse_optional_timestamp("cancelled_at", row.try_get("cancelled_at")?)?,
        cancel_reason: row.try_get("cancel_reason")?,
        cancel_requested_at: parse_optional_timestamp(
            "cancel_requested_at",
            row.try_get("cancel_requested_at")?,
        )?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: parse_optional_timestamp(
            "claim_expires_at",
            row.try_get("claim_expires_at")?,
        )?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use outreach_core::domain::scheduled_action::{
        ActionPayload, ActionStatus, ActionType, NewScheduledAction, ScheduledActionId, SubjectId,
    };

    use super::{encode_timestamp, SqlScheduledActionRepository};
    use crate::migrations;
    use crate::repositories::{MarkExecutedOutcome, RepositoryError, ScheduledActionRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn follow_up(subject: &str, offset: ChronoDuration) -> NewScheduledAction {
        NewScheduledAction {
            subject_id: SubjectId(subject.to_string()),
            action_type: ActionType::FollowUp,
            scheduled_for: Utc::now() + offset,
            payload: ActionPayload(json!({ "text": "Any thoughts on the proposal?" })),
        }
    }

    #[tokio::test]
    async fn create_then_get_by_id_round_trips() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());

        let created = repo
            .create(NewScheduledAction {
                subject_id: SubjectId("prospect-1".to_string()),
                action_type: ActionType::PreMeetingReminder,
                scheduled_for: Utc::now() + ChronoDuration::hours(2),
                payload: ActionPayload(json!({ "meeting_id": "mtg-42" })),
            })
            .await
            .expect("create");

        let found = repo.get_by_id(&created.id).await.expect("get").expect("row exists");
        assert_eq!(found.id, created.id);
        assert_eq!(found.status, ActionStatus::Pending);
        assert_eq!(found.action_type, ActionType::PreMeetingReminder);
        assert_eq!(found.payload, created.payload);
        assert_eq!(
            encode_timestamp(found.scheduled_for),
            encode_timestamp(created.scheduled_for)
        );

        let missing = repo
            .get_by_id(&ScheduledActionId("does-not-exist".to_string()))
            .await
            .expect("lookup of missing id succeeds");
        assert!(missing.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn list_pending_filters_by_subject_and_orders_by_schedule() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());

        let later = repo.create(follow_up("p-1", ChronoDuration::hours(3))).await.expect("create");
        let sooner =
            repo.create(follow_up("p-1", ChronoDuration::hours(1))).await.expect("create");
        repo.create(follow_up("p-2", ChronoDuration::hours(2))).await.expect("create");

        let for_subject =
            repo.list_pending(Some(&SubjectId("p-1".to_string()))).await.expect("list");
        let ids: Vec<_> = for_subject.iter().map(|action| action.id.clone()).collect();
        assert_eq!(ids, vec![sooner.id, later.id]);

        let all = repo.list_pending(None).await.expect("list all");
        assert_eq!(all.len(), 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn claim_due_only_returns_due_rows_in_schedule_order() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());

        let second =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(10))).await.expect("create");
        let first =
            repo.create(follow_up("p-2", -ChronoDuration::seconds(30))).await.expect("create");
        let future =
            repo.create(follow_up("p-3", ChronoDuration::minutes(10))).await.expect("create");

        let claimed = repo.claim_due("worker-a", Utc::now(), 10).await.expect("claim");
        let ids: Vec<_> = claimed.iter().map(|action| action.id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        assert!(claimed.iter().all(|action| action.claimed_by.as_deref() == Some("worker-a")));
        assert!(claimed.iter().all(|action| action.status == ActionStatus::Pending));

        let again = repo.claim_due("worker-b", Utc::now(), 10).await.expect("claim again");
        assert!(again.is_empty(), "leased rows must not be handed to a second claimant");

        let untouched = repo.get_by_id(&future.id).await.expect("get").expect("exists");
        assert_eq!(untouched.claimed_by, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn claim_due_respects_limit() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());

        for index in 0..5 {
            repo.create(follow_up(&format!("p-{index}"), -ChronoDuration::seconds(index + 1)))
                .await
                .expect("create");
        }

        let first = repo.claim_due("worker-a", Utc::now(), 2).await.expect("claim");
        let second = repo.claim_due("worker-a", Utc::now(), 2).await.expect("claim");
        let third = repo.claim_due("worker-a", Utc::now(), 2).await.expect("claim");

        assert_eq!((first.len(), second.len(), third.len()), (2, 2, 1));
        assert!(repo.claim_due("worker-a", Utc::now(), 0).await.expect("claim").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn expired_lease_makes_row_claimable_again() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::with_claim_lease(
            pool.clone(),
            Duration::from_secs(60),
        );
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        let now = Utc::now();
        assert_eq!(repo.claim_due("crashed-worker", now, 10).await.expect("claim").len(), 1);
        assert!(repo.claim_due("worker-b", now, 10).await.expect("claim").is_empty());

        let after_lease = now + ChronoDuration::seconds(61);
        let reclaimed = repo.claim_due("worker-b", after_lease, 10).await.expect("reclaim");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, action.id);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("worker-b"));

        pool.close().await;
    }

    #[tokio::test]
    async fn cancel_before_claim_prevents_claim() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let subject = SubjectId("p-1".to_string());

        let due = repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("c");
        repo.create(follow_up("p-1", ChronoDuration::hours(1))).await.expect("create");
        repo.create(follow_up("p-2", -ChronoDuration::seconds(1))).await.expect("create");

        let cancelled =
            repo.cancel_pending_for_subject(&subject, "prospect_replied").await.expect("cancel");
        assert_eq!(cancelled, 2);

        let claimed = repo.claim_due("worker-a", Utc::now(), 10).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].subject_id.0, "p-2");

        let row = repo.get_by_id(&due.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Cancelled);
        assert_eq!(row.cancel_reason.as_deref(), Some("prospect_replied"));
        assert!(row.cancelled_at.is_some());
        assert!(row.executed_at.is_none());

        let again = repo.cancel_pending_for_subject(&subject, "again").await.expect("cancel");
        assert_eq!(again, 0, "cancelling with nothing pending is a zero-count success");

        pool.close().await;
    }

    #[tokio::test]
    async fn cancel_during_claim_yields_to_successful_execution() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let subject = SubjectId("p-1".to_string());
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        let claimed = repo.claim_due("worker-a", Utc::now(), 10).await.expect("claim");
        assert_eq!(claimed.len(), 1);

        let in_flight = repo.cancel_pending_for_subject(&subject, "late").await.expect("cancel");
        assert_eq!(in_flight, 0);

        assert_eq!(
            repo.mark_executed(&action.id).await.expect("mark"),
            MarkExecutedOutcome::Executed
        );
        let after = repo.cancel_pending_for_subject(&subject, "later").await.expect("cancel");
        assert_eq!(after, 0);

        let row = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Executed);
        assert!(row.cancelled_at.is_none());
        assert!(row.cancel_reason.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn cancel_during_claim_applies_when_execution_fails() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let subject = SubjectId("p-1".to_string());
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        repo.claim_due("worker-a", Utc::now(), 10).await.expect("claim");
        let immediate =
            repo.cancel_pending_for_subject(&subject, "prospect_replied").await.expect("cancel");
        assert_eq!(immediate, 0);

        let leased = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(leased.status, ActionStatus::Pending);
        assert!(leased.cancel_requested_at.is_some());
        assert_eq!(leased.claimed_by.as_deref(), Some("worker-a"));

        assert!(repo.release_claim(&action.id, "worker-a").await.expect("release"));

        let row = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Cancelled);
        assert_eq!(row.cancel_reason.as_deref(), Some("prospect_replied"));
        assert!(row.cancelled_at.is_some());
        assert!(row.claimed_by.is_none());
        assert!(repo.claim_due("worker-b", Utc::now(), 10).await.expect("claim").is_empty());
        assert_eq!(
            repo.mark_executed(&action.id).await.expect("mark"),
            MarkExecutedOutcome::AlreadyCancelled
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn cancel_during_claim_applies_when_lease_lapses() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::with_claim_lease(
            pool.clone(),
            Duration::from_secs(60),
        );
        let subject = SubjectId("p-1".to_string());
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        let now = Utc::now();
        repo.claim_due("crashed-worker", now, 10).await.expect("claim");
        repo.cancel_pending_for_subject(&subject, "prospect_replied").await.expect("cancel");

        let after_lease = now + ChronoDuration::seconds(61);
        assert!(repo.claim_due("worker-b", after_lease, 10).await.expect("reclaim").is_empty());

        let row = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Cancelled);
        assert!(row.claimed_by.is_none());
        assert!(row.claim_expires_at.is_none());
        assert!(repo.list_pending(Some(&subject)).await.expect("list").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn mark_executed_is_idempotent() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        assert_eq!(
            repo.mark_executed(&action.id).await.expect("first"),
            MarkExecutedOutcome::Executed
        );
        assert_eq!(
            repo.mark_executed(&action.id).await.expect("second"),
            MarkExecutedOutcome::AlreadyExecuted
        );

        let row = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Executed);
        assert!(row.executed_at.is_some());
        assert!(row.claimed_by.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn mark_executed_never_overrides_cancellation() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let action =
            repo.create(follow_up("p-1", ChronoDuration::hours(1))).await.expect("create");
        repo.cancel_pending_for_subject(&action.subject_id, "meeting_booked")
            .await
            .expect("cancel");

        assert_eq!(
            repo.mark_executed(&action.id).await.expect("mark"),
            MarkExecutedOutcome::AlreadyCancelled
        );
        let row = repo.get_by_id(&action.id).await.expect("get").expect("exists");
        assert_eq!(row.status, ActionStatus::Cancelled);
        assert!(row.executed_at.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn mark_executed_on_unknown_id_is_an_integrity_error() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());

        let error = repo
            .mark_executed(&ScheduledActionId("ghost".to_string()))
            .await
            .expect_err("unknown id must fail");
        assert!(matches!(error, RepositoryError::NotFound(ref id) if id == "ghost"));

        pool.close().await;
    }

    #[tokio::test]
    async fn release_claim_returns_row_to_the_due_set() {
        let pool = setup_pool().await;
        let repo = SqlScheduledActionRepository::new(pool.clone());
        let action =
            repo.create(follow_up("p-1", -ChronoDuration::seconds(1))).await.expect("create");

        repo.claim_due("worker-a", Utc::now(), 10).await.expect("claim");
        assert!(!repo.release_claim(&action.id, "worker-b").await.expect("foreign release"));
        assert!(repo.release_claim(&action.id, "worker-a").await.expect("release"));
        assert!(!repo.release_claim(&action.id, "worker-a").await.expect("double release"));

        let reclaimed = repo.claim_due("worker-b", Utc::now(), 10).await.expect("reclaim");
        assert_eq!(reclaimed.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("claims.db").display());

        let setup = connect_with_settings(&url, 1, 30).await.expect("connect");
        migrations::run_pending(&setup).await.expect("migrate");
        let seed = SqlScheduledActionRepository::new(setup.clone());
        let mut expected = HashSet::new();
        for index in 0..40 {
            let action = seed
                .create(follow_up(&format!("p-{index}"), -ChronoDuration::seconds(1)))
                .await
                .expect("create");
            expected.insert(action.id);
        }

        // Two pools stand in for two poller processes sharing one database file.
        let repo_a = SqlScheduledActionRepository::new(
            connect_with_settings(&url, 2, 30).await.expect("connect a"),
        );
        let repo_b = SqlScheduledActionRepository::new(
            connect_with_settings(&url, 2, 30).await.expect("connect b"),
        );

        let claim_all = |repo: SqlScheduledActionRepository, claimant: &'static str| async move {
            let mut seen = Vec::new();
            loop {
                let batch = repo.claim_due(claimant, Utc::now(), 3).await.expect("claim");
                if batch.is_empty() {
                    break;
                }
                seen.extend(batch.into_iter().map(|action| action.id));
                tokio::task::yield_now().await;
            }
            seen
        };

        let (from_a, from_b) =
            tokio::join!(claim_all(repo_a, "worker-a"), claim_all(repo_b, "worker-b"));

        let set_a: HashSet<_> = from_a.iter().cloned().collect();
        let set_b: HashSet<_> = from_b.iter().cloned().collect();
        assert_eq!(set_a.len(), from_a.len(), "claimant a saw a row twice");
        assert_eq!(set_b.len(), from_b.len(), "claimant b saw a row twice");
        assert!(set_a.is_disjoint(&set_b), "a row was claimed by both claimants");

        let union: HashSet<_> = set_a.union(&set_b).cloned().collect();
        assert_eq!(union, expected);

        setup.close().await;
    }
}
