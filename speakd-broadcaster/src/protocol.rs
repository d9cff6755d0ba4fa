//! Inbound client protocol
//!
//! Every text frame is a JSON envelope `{type, timestamp, data}`. Audio may
//! also arrive as a raw binary frame, which the transport hands straight to
//! [`ClientMessage::AudioChunk`].

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use speakd_audio::FormatSpec;

use crate::error::ProtocolError;

/// Raw envelope as sent by producers
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

/// Playback control actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Play,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Deserialize)]
struct ControlData {
    action: ControlAction,
}

/// Decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `None` means the client sent no format; the daemon default applies
    StartSession { format: Option<FormatSpec> },
    AudioChunk(Vec<u8>),
    EndStream,
    Control(ControlAction),
    Heartbeat,
    Status,
    TimingAnalysis,
}

impl ClientMessage {
    /// Decode one JSON text frame.
    ///
    /// An `audio_chunk` whose payload cannot be normalized yields
    /// [`ProtocolError::MalformedChunk`] so the caller can drop just that chunk.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.kind.as_str() {
            "start_session" => parse_start(envelope.data),
            "audio_chunk" => normalize_chunk(envelope.data).map(Self::AudioChunk),
            "end_stream" => Ok(Self::EndStream),
            "control" => {
                let control: ControlData = serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::invalid("control", e.to_string()))?;
                Ok(Self::Control(control.action))
            }
            "heartbeat" => Ok(Self::Heartbeat),
            "status" => Ok(Self::Status),
            "timing_analysis" => Ok(Self::TimingAnalysis),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "start_session",
            Self::AudioChunk(_) => "audio_chunk",
            Self::EndStream => "end_stream",
            Self::Control(_) => "control",
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::TimingAnalysis => "timing_analysis",
        }
    }
}

fn parse_start(data: Value) -> Result<ClientMessage, ProtocolError> {
    let spec = match data {
        Value::Null => None,
        Value::Object(mut fields) => {
            let inner = fields
                .remove("format")
                .unwrap_or(Value::Object(fields));
            Some(
                serde_json::from_value::<FormatSpec>(inner)
                    .map_err(|e| ProtocolError::invalid("start_session", e.to_string()))?,
            )
        }
        other => {
            return Err(ProtocolError::invalid(
                "start_session",
                format!("expected an object, got {}", json_kind(&other)),
            ))
        }
    };
    Ok(ClientMessage::StartSession { format: spec })
}

/// Every wire shape an audio chunk has been seen in
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WirePayload {
    /// Base64 text
    Base64(String),
    /// Plain JSON byte array
    Bytes(Vec<u8>),
    /// Node.js `Buffer#toJSON()` shape: `{"type":"Buffer","data":[..]}`
    NodeBuffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
    /// Typed array serialized as an index-keyed object: `{"0":12,"1":250,..}`
    Indexed(BTreeMap<String, u8>),
}

impl WirePayload {
    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Base64(text) => BASE64
                .decode(text.trim())
                .map_err(|e| ProtocolError::MalformedChunk(format!("bad base64: {}", e))),
            Self::Bytes(bytes) => Ok(bytes),
            Self::NodeBuffer { kind, data } if kind == "Buffer" => Ok(data),
            Self::NodeBuffer { kind, .. } => Err(ProtocolError::MalformedChunk(format!(
                "unexpected buffer type {:?}",
                kind
            ))),
            Self::Indexed(map) => indexed_to_bytes(map),
        }
    }
}

fn indexed_to_bytes(map: BTreeMap<String, u8>) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = vec![0u8; map.len()];
    let mut seen = vec![false; map.len()];

    for (key, value) in map {
        let index: usize = key
            .parse()
            .map_err(|_| ProtocolError::MalformedChunk(format!("non-numeric key {:?}", key)))?;
        if index >= bytes.len() || seen[index] {
            return Err(ProtocolError::MalformedChunk(format!(
                "index {} out of sequence",
                index
            )));
        }
        bytes[index] = value;
        seen[index] = true;
    }

    Ok(bytes)
}

/// Reduce an `audio_chunk` data field to bytes.
///
/// The payload may sit under `chunk`, `audio` or `data`, or be the data field
/// itself.
pub fn normalize_chunk(data: Value) -> Result<Vec<u8>, ProtocolError> {
    let payload = match data {
        Value::Object(mut fields) => {
            let is_node_buffer = fields.get("type").and_then(Value::as_str) == Some("Buffer");
            if let Some(inner) = fields.remove("chunk") {
                inner
            } else if let Some(inner) = fields.remove("audio") {
                inner
            } else if is_node_buffer {
                Value::Object(fields)
            } else if let Some(inner) = fields.remove("data") {
                inner
            } else {
                Value::Object(fields)
            }
        }
        other => other,
    };

    if payload.is_null() {
        return Err(ProtocolError::MalformedChunk("missing payload".to_string()));
    }

    let kind = json_kind(&payload);
    serde_json::from_value::<WirePayload>(payload)
        .map_err(|_| ProtocolError::MalformedChunk(format!("unrecognized {} payload", kind)))?
        .into_bytes()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
