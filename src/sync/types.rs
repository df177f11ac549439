use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::fingerprint::ContentFingerprint;
use crate::clipboard::ClipboardFormat;

/// Complete clipboard content captured on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardSnapshot {
    /// Hostname of the originating node
    pub source_host: String,
    /// Unix seconds at capture time
    pub timestamp: i64,
    /// Unique per snapshot
    pub message_id: String,
    pub formats: Vec<ClipboardFormat>,
}

impl ClipboardSnapshot {
    /// Stamp a freshly captured format set with a new id and the current time
    pub fn new(source_host: impl Into<String>, formats: Vec<ClipboardFormat>) -> Self {
        Self {
            source_host: source_host.into(),
            timestamp: Utc::now().timestamp(),
            message_id: Uuid::new_v4().to_string(),
            formats,
        }
    }

    /// Total payload bytes across all formats
    pub fn payload_size(&self) -> usize {
        self.formats.iter().map(ClipboardFormat::size).sum()
    }

    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint::of(&self.formats)
    }

    /// Check the fields a receiving node relies on
    pub fn validate(&self, max_payload_size: usize) -> Result<(), ValidationError> {
        if self.source_host.trim().is_empty() {
            return Err(ValidationError::MissingSourceHost);
        }
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::MissingMessageId);
        }
        if let Some(index) = self.formats.iter().position(|f| f.name.is_empty()) {
            return Err(ValidationError::UnnamedFormat(index));
        }
        let size = self.payload_size();
        if size > max_payload_size {
            return Err(ValidationError::PayloadTooLarge {
                size,
                max: max_payload_size,
            });
        }
        Ok(())
    }
}

/// Registry entry describing a reachable node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Registry key
    pub hostname: String,
    pub ip_address: String,
    pub port: i32,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>, ip_address: impl Into<String>, port: i32) -> Self {
        Self {
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            port,
        }
    }

    /// `host:port` form used to dial the node, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.ip_address.contains(':') && !self.ip_address.starts_with('[') {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hostname.trim().is_empty() {
            return Err(ValidationError::MissingHostname);
        }
        if self.ip_address.trim().is_empty() {
            return Err(ValidationError::MissingAddress);
        }
        if !(1..=65535).contains(&self.port) {
            return Err(ValidationError::InvalidPort(self.port));
        }
        Ok(())
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.address())
    }
}

/// Reasons an inbound snapshot or registration is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("snapshot has no source host")]
    MissingSourceHost,

    #[error("snapshot has no message id")]
    MissingMessageId,

    #[error("format #{0} has an empty name")]
    UnnamedFormat(usize),

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("node has no hostname")]
    MissingHostname,

    #[error("node has no IP address")]
    MissingAddress,

    #[error("port {0} is out of range")]
    InvalidPort(i32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_new_snapshot_is_stamped() {
        let a = ClipboardSnapshot::new("host-a", vec![ClipboardFormat::text("x")]);
        let b = ClipboardSnapshot::new("host-a", vec![ClipboardFormat::text("x")]);

        assert_ne!(a.message_id, b.message_id);
        assert!(a.timestamp > 0);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_snapshot_validation() {
        let good = ClipboardSnapshot::new("host-a", vec![ClipboardFormat::text("hello")]);
        assert_eq!(good.validate(1024), Ok(()));

        let mut anonymous = good.clone();
        anonymous.source_host = " ".into();
        assert_eq!(
            anonymous.validate(1024),
            Err(ValidationError::MissingSourceHost)
        );

        let mut unnamed = good.clone();
        unnamed.formats.push(ClipboardFormat::new("", vec![1]));
        assert_eq!(unnamed.validate(1024), Err(ValidationError::UnnamedFormat(1)));

        assert_eq!(
            good.validate(4),
            Err(ValidationError::PayloadTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_empty_snapshot_is_valid() {
        let snapshot = ClipboardSnapshot::new("host-a", Vec::new());
        assert_eq!(snapshot.validate(0), Ok(()));
    }

    #[rstest]
    #[case(NodeInfo::new("a", "10.0.0.1", 50051), Ok(()))]
    #[case(NodeInfo::new("", "10.0.0.1", 50051), Err(ValidationError::MissingHostname))]
    #[case(NodeInfo::new("a", "", 50051), Err(ValidationError::MissingAddress))]
    #[case(NodeInfo::new("a", "10.0.0.1", 0), Err(ValidationError::InvalidPort(0)))]
    #[case(NodeInfo::new("a", "10.0.0.1", 70000), Err(ValidationError::InvalidPort(70000)))]
    fn test_node_validation(#[case] node: NodeInfo, #[case] expected: Result<(), ValidationError>) {
        assert_eq!(node.validate(), expected);
    }

    #[rstest]
    #[case("10.0.0.1", "10.0.0.1:50051")]
    #[case("::1", "[::1]:50051")]
    #[case("[::1]", "[::1]:50051")]
    fn test_node_address(#[case] ip: &str, #[case] expected: &str) {
        assert_eq!(NodeInfo::new("a", ip, 50051).address(), expected);
    }
}
