//! Control-substream wire format.
//!
//! Every frame is a JSON object `{type, args, message_id, time, tries}`.
//! Outbound frames always carry all five fields; inbound frames are parsed
//! leniently because the host only guarantees `type` and `args`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::layout::LayoutSnapshot;

pub type MessageId = u64;

/// Label of the reliable-ordered substream carrying control frames.
pub const CONTROL_LABEL: &str = "%";

/// Wire value of the restore marker when no saved state is available.
pub const NO_MARKER: i64 = -1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid control frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed `{kind}` frame: {reason}")]
    Malformed { kind: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthArgs {
    pub token: String,
    pub marker: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub pane_id: u64,
    pub sx: u16,
    pub sy: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPayloadArgs {
    #[serde(rename = "Payload")]
    pub payload: LayoutSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckArgs {
    #[serde(rename = "ref")]
    pub reference: MessageId,
    #[serde(default)]
    pub body: Value,
}

/// Closed set of control messages understood by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Auth(AuthArgs),
    Resize(ResizeArgs),
    SetPayload(SetPayloadArgs),
    Mark,
    Ack(AckArgs),
    Nack(AckArgs),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Auth(_) => "auth",
            ControlMessage::Resize(_) => "resize",
            ControlMessage::SetPayload(_) => "set_payload",
            ControlMessage::Mark => "mark",
            ControlMessage::Ack(_) => "ack",
            ControlMessage::Nack(_) => "nack",
        }
    }

    fn args(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            ControlMessage::Auth(args) => serde_json::to_value(args)?,
            ControlMessage::Resize(args) => serde_json::to_value(args)?,
            ControlMessage::SetPayload(args) => serde_json::to_value(args)?,
            ControlMessage::Mark => Value::Null,
            ControlMessage::Ack(args) | ControlMessage::Nack(args) => serde_json::to_value(args)?,
        };
        Ok(value)
    }

    fn from_parts(kind: &str, args: Value) -> Result<Option<Self>, ProtocolError> {
        let malformed = |err: serde_json::Error| ProtocolError::Malformed {
            kind: kind.to_string(),
            reason: err.to_string(),
        };
        let message = match kind {
            "auth" => ControlMessage::Auth(serde_json::from_value(args).map_err(malformed)?),
            "resize" => ControlMessage::Resize(serde_json::from_value(args).map_err(malformed)?),
            "set_payload" => {
                ControlMessage::SetPayload(serde_json::from_value(args).map_err(malformed)?)
            }
            "mark" => ControlMessage::Mark,
            "ack" => ControlMessage::Ack(serde_json::from_value(args).map_err(malformed)?),
            "nack" => ControlMessage::Nack(serde_json::from_value(args).map_err(malformed)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tries: Option<u32>,
}

impl ControlFrame {
    pub fn outbound(
        message: &ControlMessage,
        message_id: MessageId,
        time: i64,
        tries: u32,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: message.kind().to_string(),
            args: message.args()?,
            message_id: Some(message_id),
            time: Some(time),
            tries: Some(tries),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known {
        message_id: Option<MessageId>,
        message: ControlMessage,
    },
    Unknown {
        kind: String,
    },
}

pub fn decode(data: &[u8]) -> Result<Decoded, ProtocolError> {
    let frame: ControlFrame = serde_json::from_slice(data)?;
    match ControlMessage::from_parts(&frame.kind, frame.args)? {
        Some(message) => Ok(Decoded::Known {
            message_id: frame.message_id,
            message,
        }),
        None => Ok(Decoded::Unknown { kind: frame.kind }),
    }
}

/// Builds the frame a host sends to acknowledge `reference`.
pub fn ack_frame(reference: MessageId, negative: bool, body: Value) -> Result<Bytes, ProtocolError> {
    let args = AckArgs { reference, body };
    let message = if negative {
        ControlMessage::Nack(args)
    } else {
        ControlMessage::Ack(args)
    };
    let frame = ControlFrame {
        kind: message.kind().to_string(),
        args: message.args()?,
        message_id: None,
        time: Some(epoch_millis()),
        tries: None,
    };
    frame.to_bytes()
}

/// The host answers `mark` with the marker either as a number or as a
/// numeric string.
pub fn parse_marker(body: &Value) -> Option<i64> {
    let marker = match body {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }?;
    (marker != NO_MARKER).then_some(marker)
}

pub fn epoch_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
