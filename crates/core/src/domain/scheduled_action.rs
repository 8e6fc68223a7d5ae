use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledActionId(pub String);

impl ScheduledActionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ScheduledActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The conversation or prospect an action belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FollowUp,
    PreMeetingReminder,
    Custom(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FollowUp => "follow_up",
            Self::PreMeetingReminder => "pre_meeting_reminder",
            Self::Custom(value) => value.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "follow_up" => Self::FollowUp,
            "pre_meeting_reminder" => Self::PreMeetingReminder,
            _ => Self::Custom(value.trim().to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Executed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "executed" => Some(Self::Executed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Terminal states are final: only `pending -> executed` and
    /// `pending -> cancelled` are legal.
    pub fn ensure_transition(&self, to: ActionStatus) -> Result<(), DomainError> {
        match (self, to) {
            (Self::Pending, Self::Executed) | (Self::Pending, Self::Cancelled) => Ok(()),
            (from, to) => Err(DomainError::InvalidActionTransition { from: *from, to }),
        }
    }
}

/// Opaque action data. Only the executor registered for the action's
/// [`ActionType`] knows how to decode it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionPayload(pub serde_json::Value);

impl ActionPayload {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewScheduledAction {
    pub subject_id: SubjectId,
    pub action_type: ActionType,
    pub scheduled_for: DateTime<Utc>,
    pub payload: ActionPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: ScheduledActionId,
    pub subject_id: SubjectId,
    pub action_type: ActionType,
    pub scheduled_for: DateTime<Utc>,
    pub status: ActionStatus,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    /// Set when a cancellation arrived while a poller held the lease. The
    /// row becomes `cancelled` once that lease is released or lapses,
    /// unless the in-flight execution succeeds first.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl ScheduledAction {
    /// Builds a fresh `pending` action with a newly generated id.
    pub fn from_new(new: NewScheduledAction, now: DateTime<Utc>) -> Self {
        Self {
            id: ScheduledActionId::generate(),
            subject_id: new.subject_id,
            action_type: new.action_type,
            scheduled_for: new.scheduled_for,
            status: ActionStatus::Pending,
            payload: new.payload,
            created_at: now,
            updated_at: now,
            executed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            cancel_requested_at: None,
            claimed_by: None,
            claim_expires_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.scheduled_for <= now
    }

    /// True while another poller holds an unexpired lease on this row.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.is_some_and(|expires_at| expires_at > now)
    }

    pub fn mark_executed(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status.ensure_transition(ActionStatus::Executed)?;
        self.status = ActionStatus::Executed;
        self.executed_at = Some(now);
        self.updated_at = now;
        self.cancel_reason = None;
        self.cancel_requested_at = None;
        self.claimed_by = None;
        self.claim_expires_at = None;
        Ok(())
    }

    /// Records a cancellation against a leased row without touching the lease.
    pub fn request_cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status.ensure_transition(ActionStatus::Cancelled)?;
        if self.cancel_requested_at.is_none() {
            self.cancel_requested_at = Some(now);
            self.cancel_reason = Some(reason.to_string());
            self.updated_at = now;
        }
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.status == ActionStatus::Pending && self.cancel_requested_at.is_some()
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status.ensure_transition(ActionStatus::Cancelled)?;
        self.status = ActionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancel_reason = Some(reason.to_string());
        self.updated_at = now;
        self.claimed_by = None;
        self.claim_expires_at = None;
        Ok(())
    }
}
