//! Inbound message classification.
//!
//! Topic layout is `<namespace>/face/<deviceId>/<eventKind>`; the payload is
//! JSON with a required `info` object.

use crate::types::{EventKind, InboundEvent};
use chrono::Local;
use serde_json::Value;

/// Parse and classify a raw message. Returns `None` for anything that should
/// be dropped without an audit row: malformed JSON, a missing `info` object,
/// or an event kind other than `Rec`/`Snap`.
pub fn classify(topic: &str, payload: &[u8]) -> Option<InboundEvent> {
    let (command_topic, segment) = match topic.rsplit_once('/') {
        Some((head, tail)) => (head, tail),
        None => ("", topic),
    };

    let Some(kind) = EventKind::from_topic_segment(segment) else {
        tracing::debug!(topic, "ignoring topic with unknown event kind");
        return None;
    };

    let envelope: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(topic, error = %e, preview = %preview(payload), "payload is not valid JSON");
            return None;
        }
    };

    let info = match envelope.get("info") {
        Some(Value::Object(map)) => map.clone(),
        _ => {
            tracing::warn!(topic, preview = %preview(payload), "payload has no info object");
            return None;
        }
    };

    let device_id = command_topic
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(InboundEvent {
        topic: topic.to_string(),
        kind,
        device_id,
        command_topic: command_topic.to_string(),
        info,
        received_at: Local::now(),
    })
}

/// First 50 characters of a payload, for diagnostics. Image payloads are large.
pub(crate) fn preview(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).chars().take(50).collect()
}
