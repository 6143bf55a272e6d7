use crate::hub::message::Message;
use crate::hub::Hub;

/// Handle an inbound text frame: decode, fill in the sender and push it to
/// the hub for fleet-wide delivery. Bad frames are logged and skipped.
pub fn handle_text(hub: &Hub, client_id: &str, text: &str) {
    let mut msg = match Message::decode(text.as_bytes()) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                client_id = %client_id,
                error = %e,
                "Skipping malformed frame: {}",
                text.chars().take(100).collect::<String>()
            );
            return;
        }
    };
    if msg.from.is_none() {
        msg.from = Some(client_id.to_string());
    }

    if let Err(e) = hub.push_message(msg) {
        tracing::warn!(client_id = %client_id, error = %e, "Failed to queue inbound message");
    }
}
