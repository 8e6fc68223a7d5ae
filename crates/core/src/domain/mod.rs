pub mod conversation;
pub mod scheduled_action;
