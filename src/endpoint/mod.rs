//! Synchronization endpoint
//!
//! Exposes the sync manager to other nodes over WebSocket: SyncClipboard,
//! RegisterNode, GetActiveNodes and StreamClipboardUpdates. The handlers in
//! [`SyncService`] are transport-free; [`server`] and [`client`] carry them
//! over the wire.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClipboardUpdates, EndpointClient, WebSocketPeerClient};
pub use protocol::{NodeList, RegisterReply, Request, Response, SyncAck};
pub use server::EndpointServer;

use crate::sync::{ApplyOutcome, ClipboardSnapshot, NodeInfo, SyncManager};

/// Endpoint errors
#[derive(Debug, Error)]
pub enum EndpointError {
    /// WebSocket protocol error
    #[error("CM001: Network connection error: {message}")]
    WebSocket { message: String },

    /// The remote node could not be reached
    #[error("CM002: Connection to {address} failed: {message}. Check that the node is running and reachable.")]
    Connection { address: String, message: String },

    #[error("CM003: Data format error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CM004: System error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CM005: Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("CM006: Request to {0} timed out")]
    Timeout(String),

    #[error("CM007: Incompatible protocol versions: this node speaks v{expected}, remote sent v{actual}")]
    VersionMismatch { expected: String, actual: String },

    /// The remote node answered with an error frame
    #[error("CM008: Remote node reported an error: {0}")]
    Remote(String),

    /// The remote node answered with an unexpected frame
    #[error("CM009: Unexpected {0} response")]
    UnexpectedResponse(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for EndpointError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            other => Self::WebSocket {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for endpoint operations
pub type Result<T> = std::result::Result<T, EndpointError>;

/// Request handlers backed by a [`SyncManager`]
pub struct SyncService {
    manager: Arc<SyncManager>,
    max_payload_size: usize,
}

impl SyncService {
    pub fn new(manager: Arc<SyncManager>, max_payload_size: usize) -> Self {
        Self {
            manager,
            max_payload_size,
        }
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Validate and apply an inbound snapshot
    ///
    /// Never fails; every problem is reported as `success = false`.
    #[instrument(skip_all, fields(source = %snapshot.source_host, message_id = %snapshot.message_id))]
    pub async fn sync_clipboard(&self, snapshot: ClipboardSnapshot) -> SyncAck {
        if let Err(e) = snapshot.validate(self.max_payload_size) {
            warn!("Rejected snapshot: {}", e);
            return SyncAck::failed(format!("Rejected snapshot: {}", e));
        }

        let applied = AssertUnwindSafe(self.manager.apply(snapshot))
            .catch_unwind()
            .await;
        match applied {
            Ok(Ok(ApplyOutcome::EchoSuppressed)) => SyncAck::ok("Ignored snapshot from this node"),
            Ok(Ok(ApplyOutcome::AlreadyCurrent)) => SyncAck::ok("Clipboard already current"),
            Ok(Ok(ApplyOutcome::Applied { skipped: 0, .. })) => SyncAck::ok("Clipboard updated"),
            Ok(Ok(ApplyOutcome::Applied { restored, skipped })) => SyncAck::ok(format!(
                "Clipboard updated ({} formats restored, {} skipped)",
                restored, skipped
            )),
            Ok(Err(e)) => SyncAck::failed(e.to_string()),
            Err(_) => {
                error!("Applying snapshot panicked");
                SyncAck::failed("Internal error while applying snapshot")
            }
        }
    }

    /// Register a node and return the full registry
    pub async fn register_node(&self, node: NodeInfo) -> RegisterReply {
        match node.validate() {
            Ok(()) => {
                self.manager.register_node(node);
                RegisterReply {
                    success: true,
                    message: String::new(),
                    active_nodes: self.manager.active_nodes(),
                }
            }
            Err(e) => {
                warn!("Rejected registration: {}", e);
                RegisterReply {
                    success: false,
                    message: e.to_string(),
                    active_nodes: self.manager.active_nodes(),
                }
            }
        }
    }

    pub async fn get_active_nodes(&self) -> NodeList {
        NodeList {
            nodes: self.manager.active_nodes(),
        }
    }

    /// Forward every broadcast into `handle` until it closes
    pub async fn stream_clipboard_updates(&self, handle: mpsc::Sender<ClipboardSnapshot>) {
        info!("Update stream opened");
        self.manager.subscribe(handle).await;
        info!("Update stream closed");
    }

    /// Dispatch a unary request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SyncClipboard(snapshot) => Response::SyncAck(self.sync_clipboard(snapshot).await),
            Request::RegisterNode(node) => Response::Registered(self.register_node(node).await),
            Request::GetActiveNodes => Response::ActiveNodes(self.get_active_nodes().await),
            Request::StreamClipboardUpdates => Response::Error(protocol::ErrorReply {
                message: "StreamClipboardUpdates is not a unary request".to_string(),
            }),
        }
    }
}
