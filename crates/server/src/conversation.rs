use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use outreach_core::config::FollowUpConfig;
use outreach_core::domain::conversation::{BufferedMessage, ConversationKey};
use outreach_core::domain::scheduled_action::{
    ActionPayload, ActionType, NewScheduledAction, ScheduledAction, SubjectId,
};
use outreach_core::errors::{ApplicationError, DomainError};
use outreach_db::repositories::ScheduledActionRepository;
use outreach_runtime::{ActionExecutor, FlushHandler};

pub const REPLY_CANCEL_REASON: &str = "prospect_replied";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpPayload {
    pub conversation_key: ConversationKey,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingReminderPayload {
    pub conversation_key: ConversationKey,
    pub meeting_at: DateTime<Utc>,
    pub text: String,
}

/// Delivers text to a prospect on the messaging channel.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, conversation_key: &ConversationKey, text: &str) -> anyhow::Result<()>;
}

/// Channel used when no messaging transport is configured.
#[derive(Clone, Debug, Default)]
pub struct LoggingOutboundChannel;

#[async_trait]
impl OutboundChannel for LoggingOutboundChannel {
    async fn send(&self, conversation_key: &ConversationKey, text: &str) -> anyhow::Result<()> {
        info!(
            event_name = "conversation.outbound.logged",
            conversation_key = %conversation_key,
            chars = text.chars().count(),
            "outbound message (logging channel)"
        );
        Ok(())
    }
}

/// Handles each flushed turn: a reply from the prospect voids whatever was
/// scheduled for them and re-arms a single follow-up.
pub struct FollowUpPlanner {
    store: Arc<dyn ScheduledActionRepository>,
    delay: chrono::Duration,
    message: String,
}

impl FollowUpPlanner {
    pub fn new(store: Arc<dyn ScheduledActionRepository>, config: &FollowUpConfig) -> Self {
        let delay = chrono::Duration::from_std(Duration::from_secs(config.delay_secs))
            .unwrap_or(chrono::Duration::hours(24));
        Self { store, delay, message: config.message.clone() }
    }

    async fn process_turn(
        &self,
        key: &ConversationKey,
        messages: &[BufferedMessage],
    ) -> Result<(), ApplicationError> {
        let subject_id = SubjectId(key.0.clone());
        let cancelled = self
            .store
            .cancel_pending_for_subject(&subject_id, REPLY_CANCEL_REASON)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let payload = ActionPayload::encode(&FollowUpPayload {
            conversation_key: key.clone(),
            text: self.message.clone(),
        })
        .map_err(|error| DomainError::InvariantViolation(format!("follow-up payload: {error}")))?;
        let scheduled = self
            .store
            .create(NewScheduledAction {
                subject_id: subject_id.clone(),
                action_type: ActionType::FollowUp,
                scheduled_for: Utc::now() + self.delay,
                payload,
            })
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        info!(
            event_name = "conversation.turn.processed",
            conversation_key = %key,
            subject_id = %subject_id,
            messages = messages.len(),
            cancelled_actions = cancelled,
            action_id = %scheduled.id,
            scheduled_for = %scheduled.scheduled_for,
            "conversation turn processed; follow-up re-armed"
        );
        Ok(())
    }
}

#[async_trait]
impl FlushHandler for FollowUpPlanner {
    async fn flush(
        &self,
        key: ConversationKey,
        messages: Vec<BufferedMessage>,
    ) -> anyhow::Result<()> {
        if let Err(error) = self.process_turn(&key, &messages).await {
            warn!(
                event_name = "conversation.turn.failed",
                conversation_key = %key,
                error_class = error.error_class(),
                transient = error.is_transient(),
                error = %error,
                "conversation turn could not be processed"
            );
            return Err(error.into());
        }
        Ok(())
    }
}

/// Executes scheduled actions by sending their text over the outbound channel.
pub struct ChannelDispatcher {
    channel: Arc<dyn OutboundChannel>,
}

impl ChannelDispatcher {
    pub fn new(channel: Arc<dyn OutboundChannel>) -> Self {
        Self { channel }
    }

    async fn dispatch(&self, action: &ScheduledAction) -> Result<(), ApplicationError> {
        match &action.action_type {
            ActionType::FollowUp => {
                let payload: FollowUpPayload = decode_payload(action)?;
                self.send(&payload.conversation_key, &payload.text).await
            }
            ActionType::PreMeetingReminder => {
                let payload: MeetingReminderPayload = decode_payload(action)?;
                if payload.meeting_at <= Utc::now() {
                    warn!(
                        event_name = "conversation.reminder.stale",
                        action_id = %action.id,
                        subject_id = %action.subject_id,
                        meeting_at = %payload.meeting_at,
                        "meeting already started; reminder skipped"
                    );
                    return Ok(());
                }
                self.send(&payload.conversation_key, &payload.text).await
            }
            // Unknown types would fail on every cycle; acknowledge and drop them.
            ActionType::Custom(kind) => {
                warn!(
                    event_name = "conversation.action.unsupported",
                    action_id = %action.id,
                    subject_id = %action.subject_id,
                    action_type = %kind,
                    "no dispatcher for action type; dropping"
                );
                Ok(())
            }
        }
    }

    async fn send(&self, key: &ConversationKey, text: &str) -> Result<(), ApplicationError> {
        self.channel
            .send(key, text)
            .await
            .map_err(|error| ApplicationError::Integration(format!("{error:#}")))
    }
}

fn decode_payload<T: DeserializeOwned>(action: &ScheduledAction) -> Result<T, ApplicationError> {
    action.payload.decode().map_err(|error| {
        ApplicationError::from(DomainError::InvariantViolation(format!(
            "{} payload for action {}: {error}",
            action.action_type.as_str(),
            action.id
        )))
    })
}

#[async_trait]
impl ActionExecutor for ChannelDispatcher {
    async fn execute(&self, action: &ScheduledAction) -> anyhow::Result<()> {
        if let Err(error) = self.dispatch(action).await {
            warn!(
                event_name = "conversation.dispatch.failed",
                action_id = %action.id,
                subject_id = %action.subject_id,
                error_class = error.error_class(),
                transient = error.is_transient(),
                error = %error,
                "scheduled action could not be dispatched"
            );
            return Err(error.into());
        }
        Ok(())
    }
}
