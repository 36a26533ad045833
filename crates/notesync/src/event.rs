use event_bus::{EventKind, Payload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// One frame on the live channel: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Missing payloads decode as `null`; the server answers pings with a
    /// bare `{"type":"pong"}`.
    #[serde(default)]
    pub payload: Payload,
}

impl ChannelEvent {
    pub fn new(kind: EventKind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    pub fn ping() -> Self {
        Self::new(EventKind::Ping, Payload::Object(Default::default()))
    }

    pub fn note_create(note: &Note) -> SyncResult<Self> {
        Ok(Self::new(EventKind::NoteCreate, serde_json::to_value(note)?))
    }

    pub fn note_update(note: &Note) -> SyncResult<Self> {
        Ok(Self::new(EventKind::NoteUpdate, serde_json::to_value(note)?))
    }

    pub fn note_delete(id: impl Into<String>) -> Self {
        Self::new(
            EventKind::NoteDelete,
            serde_json::json!({ "id": id.into() }),
        )
    }

    /// Parses an inbound text frame. Lifecycle kinds are local-only and are
    /// rejected when they show up on the wire.
    pub fn decode(text: &str) -> SyncResult<Self> {
        let event: ChannelEvent = serde_json::from_str(text)
            .map_err(|err| SyncError::ProtocolDecode(err.to_string()))?;
        if event.kind.is_lifecycle() {
            return Err(SyncError::ProtocolDecode(format!(
                "`{}` is not a wire event",
                event.kind
            )));
        }
        Ok(event)
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| SyncError::ProtocolDecode(err.to_string()))
    }
}

/// Note as the backend serializes it in `note_*` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Payload of a `note_delete` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRef {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_note_update() {
        let frame = r#"{"type":"note_update","payload":{"id":"n-1","title":"Plan","content":"ship it","createdAt":"2024-05-01T08:00:00Z","updatedAt":"2024-05-02T09:30:00Z"}}"#;
        let event = ChannelEvent::decode(frame).expect("decodes");
        assert_eq!(event.kind, EventKind::NoteUpdate);

        let note: Note = event.payload_as().expect("note payload");
        assert_eq!(note.title, "Plan");
        assert_eq!(note.updated_at, "2024-05-02T09:30:00Z");
    }

    #[test]
    fn pong_without_payload_decodes_as_null() {
        let event = ChannelEvent::decode(r#"{"type":"pong"}"#).expect("decodes");
        assert_eq!(event, ChannelEvent::new(EventKind::Pong, Payload::Null));
    }

    #[test]
    fn rejects_unknown_empty_and_lifecycle_types() {
        for frame in [
            r#"{"type":"note_archive","payload":{}}"#,
            r#"{"type":"","payload":{}}"#,
            r#"{"type":"connected","payload":{}}"#,
            r#"{"payload":{}}"#,
            "not json",
        ] {
            assert!(
                matches!(ChannelEvent::decode(frame), Err(SyncError::ProtocolDecode(_))),
                "{frame} should be rejected"
            );
        }
    }

    #[test]
    fn ping_frame_matches_heartbeat_format() {
        let encoded = ChannelEvent::ping().encode().expect("encodes");
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, serde_json::json!({"type": "ping", "payload": {}}));
    }

    #[test]
    fn note_delete_carries_only_the_id() {
        let event = ChannelEvent::note_delete("n-9");
        assert_eq!(event.kind, EventKind::NoteDelete);
        let target: NoteRef = event.payload_as().unwrap();
        assert_eq!(target.id, "n-9");
    }
}
