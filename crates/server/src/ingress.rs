use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use outreach_core::domain::conversation::{
    BufferedMessage, ConversationKey, MessageContent, MessageId,
};
use outreach_runtime::{BufferError, MessageBuffer};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, Deserialize)]
pub struct InboundMessage {
    pub conversation_key: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngressResponse {
    pub status: &'static str,
    pub buffered: usize,
}

pub fn router(buffer: MessageBuffer) -> Router {
    Router::new().route("/webhooks/inbound", post(receive)).with_state(buffer)
}

pub async fn receive(
    State(buffer): State<MessageBuffer>,
    Json(inbound): Json<InboundMessage>,
) -> (StatusCode, Json<IngressResponse>) {
    if inbound.conversation_key.trim().is_empty() || inbound.message_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(IngressResponse { status: "rejected", buffered: 0 }));
    }

    let key = ConversationKey(inbound.conversation_key);
    let message = BufferedMessage {
        message_id: MessageId(inbound.message_id),
        content: MessageContent::text(inbound.text),
        received_at: Utc::now(),
    };

    match buffer.add_message(key.clone(), message) {
        Ok(()) => {
            let buffered = buffer.buffered_len(&key);
            (StatusCode::ACCEPTED, Json(IngressResponse { status: "accepted", buffered }))
        }
        Err(BufferError::ShuttingDown) => {
            warn!(
                event_name = "system.ingress.rejected",
                conversation_key = %key,
                "inbound message rejected during shutdown"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(IngressResponse { status: "shutting_down", buffered: 0 }),
            )
        }
    }
}
