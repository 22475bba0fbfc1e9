use crate::diagnostics::Diagnostic;
use crate::snapshot::{ChangeEvent, RepositorySnapshot, RepositoryStats};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
pub const HUB_SENDER_ID: &str = "pyrite-hub";

/// Wire protocol version. Serialized as a string; peers may send `1`, `"1"`
/// or `"v1"`, and a missing field means the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawVersion", into = "String")]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let digits = raw.trim();
        let digits = digits.strip_prefix(['v', 'V']).unwrap_or(digits);
        digits
            .parse::<u16>()
            .map(ProtocolVersion)
            .map_err(|err| format!("invalid protocol version '{raw}': {err}"))
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl TryFrom<RawVersion> for ProtocolVersion {
    type Error = String;

    fn try_from(raw: RawVersion) -> Result<Self, Self::Error> {
        match raw {
            RawVersion::Number(value) => u16::try_from(value)
                .map(ProtocolVersion)
                .map_err(|_| format!("protocol version out of range: {value}")),
            RawVersion::Text(text) => text.parse(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn from_hub(msg: WireMsg) -> Self {
        Self::new(HUB_SENDER_ID, msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Resync(ResyncPayload),
    Init(InitPayload),
    /// One repository's full state, sent when the hub starts tracking it.
    Snapshot(SnapshotPayload),
    Update(UpdatePayload),
    Unwatched(UnwatchedPayload),
    Diagnostic(Diagnostic),
    Error(ErrorPayload),
}

impl WireMsg {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::Resync(_) => "resync",
            WireMsg::Init(_) => "init",
            WireMsg::Snapshot(_) => "snapshot",
            WireMsg::Update(_) => "update",
            WireMsg::Unwatched(_) => "unwatched",
            WireMsg::Diagnostic(_) => "diagnostic",
            WireMsg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitPayload {
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositorySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotPayload {
    pub snapshot: RepositorySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePayload {
    pub repository: String,
    pub revision: u64,
    #[serde(default)]
    pub changes: Vec<ChangeEvent>,
    #[serde(default)]
    pub stats: RepositoryStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnwatchedPayload {
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Serializes one WebSocket text frame.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, Ticket, TicketStatus};

    fn update_envelope() -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            sender_id: HUB_SENDER_ID.to_string(),
            timestamp: "2026-02-07T21:00:00+00:00".to_string(),
            request_id: None,
            msg: WireMsg::Update(UpdatePayload {
                repository: "demo".to_string(),
                revision: 4,
                changes: vec![ChangeEvent::Updated {
                    entity: Entity::Ticket(Ticket {
                        id: "TKT-ab12-001".to_string(),
                        parent: "WE-2024-ab12".to_string(),
                        title: "Wire parser".to_string(),
                        status: TicketStatus::Completed,
                        created: None,
                        last_updated: None,
                        path: "t.md".to_string(),
                        sections: Vec::new(),
                    }),
                }],
                stats: RepositoryStats::default(),
            }),
        }
    }

    #[test]
    fn update_frame_uses_stable_field_names() {
        let frame = encode_frame(&update_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "update");
        assert_eq!(value["version"], "1");
        assert_eq!(value["payload"]["repository"], "demo");
        assert_eq!(value["payload"]["revision"], 4);
        assert_eq!(value["payload"]["changes"][0]["action"], "updated");
        assert!(value["payload"]["stats"]["workEffortsByStatus"].is_object());

        let decoded: WireEnvelope =
            decode_frame(frame.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, update_envelope());
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let result = encode_frame(&update_envelope(), 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn client_resync_without_payload_fields() {
        let decoded: WireEnvelope = serde_json::from_str(
            r#"{"version": 1, "type": "resync", "sender_id": "browser-1",
                "timestamp": "2026-02-07T21:00:00Z", "payload": {}}"#,
        )
        .expect("parse resync");
        assert_eq!(decoded.msg, WireMsg::Resync(ResyncPayload::default()));

        let missing_version: WireEnvelope = serde_json::from_str(
            r#"{"type": "hello", "sender_id": "browser-1",
                "timestamp": "2026-02-07T21:00:00Z", "payload": {"client_id": "browser-1"}}"#,
        )
        .expect("parse hello");
        assert_eq!(missing_version.version, ProtocolVersion::CURRENT);
    }

    #[test]
    fn version_accepts_number_text_and_prefix() {
        for raw in ["1", "\"1\"", "\"v1\"", "\" V1 \""] {
            let version: ProtocolVersion = serde_json::from_str(raw).expect(raw);
            assert_eq!(version, ProtocolVersion::CURRENT);
        }
        assert!(serde_json::from_str::<ProtocolVersion>("70000").is_err());
        assert!(serde_json::from_str::<ProtocolVersion>("\"latest\"").is_err());
        assert_eq!(serde_json::to_string(&ProtocolVersion(2)).expect("encode"), "\"2\"");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result = decode_frame::<WireEnvelope>(b"{\"type\":\"init\"", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
