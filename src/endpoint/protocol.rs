//! Wire protocol for the synchronization endpoint
//!
//! Every WebSocket text message carries one JSON [`Frame`]. Requests and
//! responses share the frame envelope; a response copies the correlation id
//! of the request it answers. Stream updates reuse the correlation id of the
//! `StreamClipboardUpdates` request that opened the stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::{ClipboardSnapshot, NodeInfo};

/// Current protocol version
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// HTTP path the endpoint upgrades on
pub const ENDPOINT_PATH: &str = "/clipmesh";

/// Envelope around every request and response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    pub version: String,
    pub correlation_id: Uuid,
    pub body: T,
}

pub type RequestFrame = Frame<Request>;
pub type ResponseFrame = Frame<Response>;

impl<T> Frame<T> {
    /// Wrap `body` with a fresh correlation id
    pub fn new(body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            correlation_id: Uuid::new_v4(),
            body,
        }
    }

    /// Build the frame answering this one
    pub fn reply<U>(&self, body: U) -> Frame<U> {
        Frame {
            version: PROTOCOL_VERSION.to_string(),
            correlation_id: self.correlation_id,
            body,
        }
    }

    /// Frames are compatible when the major versions agree
    pub fn is_compatible(&self) -> bool {
        major(&self.version) == major(PROTOCOL_VERSION)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Endpoint operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    SyncClipboard(ClipboardSnapshot),
    RegisterNode(NodeInfo),
    GetActiveNodes,
    /// Turns the connection into a server-to-client update stream
    StreamClipboardUpdates,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncClipboard(_) => "SyncClipboard",
            Self::RegisterNode(_) => "RegisterNode",
            Self::GetActiveNodes => "GetActiveNodes",
            Self::StreamClipboardUpdates => "StreamClipboardUpdates",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    SyncAck(SyncAck),
    Registered(RegisterReply),
    ActiveNodes(NodeList),
    /// One snapshot on an update stream
    Update(ClipboardSnapshot),
    /// The request could not be processed at all
    Error(ErrorReply),
}

/// Result of SyncClipboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub success: bool,
    pub message: String,
}

impl SyncAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Result of RegisterNode: the registry after registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub active_nodes: Vec<NodeInfo>,
}

/// Result of GetActiveNodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

/// Serde adapter encoding byte payloads as standard base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::ClipboardFormat;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::new(Request::RegisterNode(NodeInfo::new("a", "10.0.0.1", 50051)));
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["body"]["type"], "RegisterNode");
        assert_eq!(json["body"]["data"]["hostname"], "a");
        assert_eq!(json["body"]["data"]["port"], 50051);
    }

    #[test]
    fn test_payload_is_base64() {
        let snapshot = ClipboardSnapshot::new("a", vec![ClipboardFormat::new("bin", vec![0, 159, 146, 150])]);
        let json = serde_json::to_value(Frame::new(Request::SyncClipboard(snapshot.clone()))).unwrap();

        assert_eq!(json["body"]["data"]["formats"][0]["data"], "AJ+Slg==");

        let parsed: RequestFrame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.body, Request::SyncClipboard(snapshot));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let json = r#"{"version":"1.0.0","correlation_id":"00000000-0000-0000-0000-000000000000",
            "body":{"type":"SyncClipboard","data":{"source_host":"a","timestamp":0,"message_id":"m",
            "formats":[{"name":"x","data":"***"}]}}}"#;
        assert!(serde_json::from_str::<RequestFrame>(json).is_err());
    }

    #[test]
    fn test_unit_request_shape() {
        let json = serde_json::to_string(&Request::GetActiveNodes).unwrap();
        assert_eq!(json, r#"{"type":"GetActiveNodes"}"#);
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let request = Frame::new(Request::GetActiveNodes);
        let reply = request.reply(Response::ActiveNodes(NodeList { nodes: Vec::new() }));
        assert_eq!(reply.correlation_id, request.correlation_id);
    }

    #[test]
    fn test_version_compatibility() {
        let mut frame = Frame::new(Request::GetActiveNodes);
        assert!(frame.is_compatible());

        frame.version = "1.4.2".into();
        assert!(frame.is_compatible());

        frame.version = "2.0.0".into();
        assert!(!frame.is_compatible());
    }
}
