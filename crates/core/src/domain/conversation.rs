use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one conversation thread on the messaging channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Media { mime_type: String, url: String, caption: Option<String> },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Text visible to a reader of the thread; media contributes its caption.
    pub fn display_text(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body.as_str()),
            Self::Media { caption, .. } => caption.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub message_id: MessageId,
    pub content: MessageContent,
    pub received_at: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn text(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: MessageId(message_id.into()),
            content: MessageContent::text(body),
            received_at: Utc::now(),
        }
    }
}
