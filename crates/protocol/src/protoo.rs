//! Protoo signaling frames.
//!
//! Protoo is the JSON-over-WebSocket protocol mediasoup portals speak. Every
//! frame is a JSON object discriminated by exactly one of three boolean tags:
//!
//! ```text
//! {"request": true, "id": 7, "method": "join", "data": {...}}
//! {"response": true, "ok": true, "id": 7, "method": "ws-response", "data": {...}}
//! {"response": true, "ok": false, "id": 7, "method": "ws-response", "errorReason": "..."}
//! {"notification": true, "method": "consumerPaused", "data": {...}}
//! ```
//!
//! Ids are per-originator and monotonically increasing; responses correlate
//! to requests by id only. Objects with none of the tags set are not an
//! error at this layer; receivers drop them silently.

use serde_json::{Value, json};

/// Method stamped into outgoing responses. The portal ignores it, but the
/// field must be present on the wire.
pub const RESPONSE_METHOD: &str = "ws-response";

#[derive(Debug, Clone, PartialEq)]
pub struct ProtooRequest {
    pub id: u64,
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtooResponse {
    pub ok: bool,
    pub id: u64,
    pub data: Value,
    pub error_reason: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtooNotification {
    pub method: String,
    pub data: Value,
}

/// Any inbound protoo frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtooMessage {
    Request(ProtooRequest),
    Response(ProtooResponse),
    Notification(ProtooNotification),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtooParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON that is not an object. Receivers drop these silently.
    #[error("frame is not a json object")]
    NotAnObject,
    /// An object carrying none of the three discriminator tags.
    #[error("frame has no request/response/notification tag")]
    UnknownShape,
    #[error("frame is missing field `{0}`")]
    MissingField(&'static str),
}

impl ProtooRequest {
    pub fn new(id: u64, method: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            method: method.into(),
            data,
        }
    }

    /// Build the success response to this request.
    pub fn ok(&self, data: Value) -> ProtooResponse {
        ProtooResponse {
            ok: true,
            id: self.id,
            data,
            error_reason: Value::Null,
        }
    }

    /// Build the error response to this request.
    pub fn err(&self, reason: impl Into<Value>) -> ProtooResponse {
        ProtooResponse {
            ok: false,
            id: self.id,
            data: Value::Null,
            error_reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "request": true,
            "id": self.id,
            "method": self.method,
            "data": self.data,
        })
    }
}

impl ProtooResponse {
    pub fn to_json(&self) -> Value {
        if self.ok {
            json!({
                "response": true,
                "ok": true,
                "id": self.id,
                "method": RESPONSE_METHOD,
                "data": self.data,
            })
        } else {
            json!({
                "response": true,
                "ok": false,
                "id": self.id,
                "method": RESPONSE_METHOD,
                "errorReason": self.error_reason,
            })
        }
    }
}

impl ProtooNotification {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "notification": true,
            "method": self.method,
            "data": self.data,
        })
    }
}

impl ProtooMessage {
    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtooParseError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_json(value)
    }

    pub fn from_json(value: Value) -> Result<Self, ProtooParseError> {
        let obj = value.as_object().ok_or(ProtooParseError::NotAnObject)?;

        let tag = |name| obj.get(name).and_then(Value::as_bool).unwrap_or(false);

        if tag("request") {
            Ok(ProtooMessage::Request(ProtooRequest {
                id: require_u64(&value, "id")?,
                method: require_str(&value, "method")?,
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }))
        } else if tag("response") {
            let ok = require_bool(&value, "ok")?;
            let id = require_u64(&value, "id")?;
            if ok {
                Ok(ProtooMessage::Response(ProtooResponse {
                    ok,
                    id,
                    data: value.get("data").cloned().unwrap_or(Value::Null),
                    error_reason: Value::Null,
                }))
            } else {
                Ok(ProtooMessage::Response(ProtooResponse {
                    ok,
                    id,
                    data: Value::Null,
                    error_reason: value.get("errorReason").cloned().unwrap_or(Value::Null),
                }))
            }
        } else if tag("notification") {
            Ok(ProtooMessage::Notification(ProtooNotification {
                method: require_str(&value, "method")?,
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }))
        } else {
            Err(ProtooParseError::UnknownShape)
        }
    }
}

fn require_u64(value: &Value, field: &'static str) -> Result<u64, ProtooParseError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or(ProtooParseError::MissingField(field))
}

fn require_bool(value: &Value, field: &'static str) -> Result<bool, ProtooParseError> {
    value
        .get(field)
        .and_then(Value::as_bool)
        .ok_or(ProtooParseError::MissingField(field))
}

fn require_str(value: &Value, field: &'static str) -> Result<String, ProtooParseError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtooParseError::MissingField(field))
}
