//! Outreach core - domain types, error taxonomy and configuration
//!
//! Everything in this crate is free of I/O: the durable store lives in
//! `outreach-db` and the timers live in `outreach-runtime`.

pub mod config;
pub mod domain;
pub mod errors;

pub use domain::conversation::{BufferedMessage, ConversationKey, MessageContent, MessageId};
pub use domain::scheduled_action::{
    ActionPayload, ActionStatus, ActionType, NewScheduledAction, ScheduledAction,
    ScheduledActionId, SubjectId,
};
pub use errors::{ApplicationError, DomainError};

pub use chrono;
