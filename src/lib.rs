//! # ClipMesh
//!
//! Multi-node clipboard synchronization engine.
//!
//! Every node captures the complete clipboard content (all formats) when it
//! changes locally, broadcasts it to every registered node and to local
//! stream subscribers, and applies snapshots received from other nodes
//! without echoing them back.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod endpoint;
pub mod monitor;
pub mod node;
pub mod sync;

pub use config::Config;

/// Result type alias for ClipMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipMesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Change monitor error
    #[error("Monitor error: {0}")]
    Monitor(#[from] monitor::MonitorError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// Endpoint error
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] endpoint::EndpointError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Target triple this binary was built for
pub const BUILD_TARGET: &str = env!("TARGET");

/// Build timestamp
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Maximum total snapshot payload (8MB default)
///
/// Base64 inflates payloads by a third, so this keeps one encoded snapshot
/// below the 16MB WebSocket frame limit.
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;
