//! Consumer descriptions received from the portal.
//!
//! `consumeAllExistingProducer` returns an array of these; the
//! server-initiated `newConsumer` / `newDataConsumer` requests carry a single
//! one in a slightly different shape (`kind` instead of `producerType`, no
//! `producerType` for data). The constructors below normalize all three into
//! one struct.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub user_id: String,
    pub consumer_id: String,
    pub producer_id: String,
    pub producer_type: String,
    #[serde(default)]
    pub rtp_parameters: Value,
    #[serde(default)]
    pub stream_id: Option<u16>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub producer_paused: bool,
}

/// What the remote peer is producing, as far as sink selection goes.
/// Unrecognized producer types are treated as video, matching portal
/// behavior for screen-share and camera streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Audio,
    Video,
    Data,
}

impl ConsumerInfo {
    pub fn kind(&self) -> ProducerKind {
        match self.producer_type.as_str() {
            "audio" => ProducerKind::Audio,
            "data" => ProducerKind::Data,
            _ => ProducerKind::Video,
        }
    }

    /// Normalize the payload of a server-initiated `newConsumer` request.
    pub fn from_new_consumer(data: &Value) -> Result<Self, serde_json::Error> {
        let mut normalized = data.clone();
        if let Some(obj) = normalized.as_object_mut()
            && let Some(kind) = obj.remove("kind")
        {
            obj.insert("producerType".to_owned(), kind);
        }
        serde_json::from_value(normalized)
    }

    /// Normalize the payload of a server-initiated `newDataConsumer` request.
    pub fn from_new_data_consumer(data: &Value) -> Result<Self, serde_json::Error> {
        let mut normalized = data.clone();
        if let Some(obj) = normalized.as_object_mut() {
            obj.insert("producerType".to_owned(), Value::from("data"));
        }
        serde_json::from_value(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_batch_entry() {
        let info: ConsumerInfo = serde_json::from_value(json!({
            "userId": "u1",
            "consumerId": "c1",
            "producerId": "p1",
            "producerType": "audio",
            "rtpParameters": {"codecs": []},
        }))
        .unwrap();
        assert_eq!(info.kind(), ProducerKind::Audio);
        assert_eq!(info.rtp_parameters["codecs"], json!([]));
        assert!(info.stream_id.is_none());
    }

    #[test]
    fn unknown_producer_type_maps_to_video() {
        let info: ConsumerInfo = serde_json::from_value(json!({
            "userId": "u1",
            "consumerId": "c1",
            "producerId": "p1",
            "producerType": "screen",
        }))
        .unwrap();
        assert_eq!(info.kind(), ProducerKind::Video);
    }

    #[test]
    fn normalizes_new_consumer_payload() {
        let info = ConsumerInfo::from_new_consumer(&json!({
            "userId": "u2",
            "consumerId": "c2",
            "producerId": "p2",
            "kind": "video",
            "rtpParameters": {},
            "producerPaused": true,
        }))
        .unwrap();
        assert_eq!(info.kind(), ProducerKind::Video);
        assert!(info.producer_paused);
    }

    #[test]
    fn normalizes_new_data_consumer_payload() {
        let info = ConsumerInfo::from_new_data_consumer(&json!({
            "userId": "u3",
            "consumerId": "c3",
            "producerId": "p3",
            "streamId": 17,
            "label": "virtual-avatar",
            "protocol": "",
        }))
        .unwrap();
        assert_eq!(info.kind(), ProducerKind::Data);
        assert_eq!(info.stream_id, Some(17));
        assert_eq!(info.label.as_deref(), Some("virtual-avatar"));
    }
}
