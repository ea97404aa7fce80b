use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Placeholder display name for faces the camera could not match.
pub const STRANGER_NAME: &str = "Stranger";

/// Timestamp format used for audit `event_time` values.
pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Kind of face event, selected by the trailing segment of the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `.../Rec`: the camera matched an enrolled person.
    Recognized,
    /// `.../Snap`: a face the camera does not know.
    Unrecognized,
}

impl EventKind {
    /// Map a topic's final segment to an event kind. Unknown segments yield `None`.
    pub fn from_topic_segment(segment: &str) -> Option<Self> {
        match segment {
            "Rec" => Some(Self::Recognized),
            "Snap" => Some(Self::Unrecognized),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recognized => "Recognized",
            Self::Unrecognized => "Unrecognized",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified inbound message. Lives for one handler invocation.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub topic: String,
    pub kind: EventKind,
    /// Segment preceding the event kind (`<ns>/face/<deviceId>/<kind>`), if any.
    pub device_id: Option<String>,
    /// Topic the fleet listens on for commands: the inbound topic minus its kind.
    pub command_topic: String,
    pub info: Map<String, Value>,
    pub received_at: DateTime<Local>,
}

impl InboundEvent {
    /// Inline image payload, if present and non-empty.
    pub fn picture(&self) -> Option<&str> {
        match self.info.get("pic") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Source timestamp, falling back to the receipt time.
    pub fn event_time(&self) -> String {
        self.text_field("time")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.received_at.format(EVENT_TIME_FORMAT).to_string())
    }

    /// Display name reported by the camera. Firmware in the field also sends
    /// the misspelled `persionName`.
    pub fn person_name(&self) -> Option<String> {
        self.text_field("personName")
            .or_else(|| self.text_field("persionName"))
    }

    pub fn person_id(&self) -> Option<String> {
        self.text_field("personId")
    }

    /// A string field; numbers are rendered as text.
    pub fn text_field(&self, key: &str) -> Option<String> {
        match self.info.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A float field that may arrive as a JSON number or a numeric string.
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        match self.info.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// An integer field that may arrive as a JSON number or a numeric string.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        match self.info.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// One append-only audit row. Written for every `Rec`/`Snap` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_type: EventKind,
    pub person_name: String,
    pub person_id: Option<String>,
    pub similarity: Option<f64>,
    pub record_id: Option<i64>,
    pub event_time: String,
    /// Archive-relative path of the evidence image.
    pub image_path: Option<String>,
}

impl AuditRecord {
    /// Audit row for an unrecognized face with no identity and no image.
    pub fn stranger(event_time: String) -> Self {
        Self {
            event_type: EventKind::Unrecognized,
            person_name: STRANGER_NAME.to_string(),
            person_id: None,
            similarity: None,
            record_id: None,
            event_time,
            image_path: None,
        }
    }
}

/// A newly registered person. Created once per image content per cooldown window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub short_id: String,
    pub person_name: String,
    /// Public-facing path of the registration photo (`uploads/photos/...`).
    pub registration_photo_path: String,
}

/// Logical paths of one image stored under both the archive and public roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceImagePair {
    pub faces_path: String,
    pub photos_path: String,
}

impl FaceImagePair {
    /// Bare file name shared by both copies.
    pub fn file_name(&self) -> &str {
        self.faces_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.faces_path)
    }
}
