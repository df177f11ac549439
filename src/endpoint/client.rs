//! WebSocket client for the synchronization endpoint

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument};

use super::protocol::{
    Frame, NodeList, RegisterReply, Request, Response, ResponseFrame, SyncAck, ENDPOINT_PATH,
    PROTOCOL_VERSION,
};
use super::{EndpointError, Result};
use crate::sync::{ClipboardSnapshot, NodeInfo, PeerClient};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One connection to a remote endpoint
pub struct EndpointClient {
    ws: WsStream,
    address: String,
    timeout: Duration,
}

impl EndpointClient {
    /// Connect to `address` (`host:port`), giving up after `timeout`
    #[instrument(skip(timeout))]
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let url = format!("ws://{}{}", address, ENDPOINT_PATH);
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| EndpointError::Timeout(address.to_string()))?
            .map_err(|e| EndpointError::Connection {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        debug!("Connected to {}", url);

        Ok(Self {
            ws,
            address: address.to_string(),
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn sync_clipboard(&mut self, snapshot: ClipboardSnapshot) -> Result<SyncAck> {
        match self.call(Request::SyncClipboard(snapshot)).await? {
            Response::SyncAck(ack) => Ok(ack),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn register_node(&mut self, node: NodeInfo) -> Result<RegisterReply> {
        match self.call(Request::RegisterNode(node)).await? {
            Response::Registered(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_active_nodes(&mut self) -> Result<Vec<NodeInfo>> {
        match self.call(Request::GetActiveNodes).await? {
            Response::ActiveNodes(NodeList { nodes }) => Ok(nodes),
            other => Err(unexpected(&other)),
        }
    }

    /// Turn this connection into an update stream
    pub async fn stream_clipboard_updates(mut self) -> Result<ClipboardUpdates> {
        let request = Frame::new(Request::StreamClipboardUpdates);
        self.send(&request).await?;
        Ok(ClipboardUpdates { client: self })
    }

    /// Send a close frame; errors are irrelevant at this point
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        let frame = Frame::new(request);
        self.send(&frame).await?;

        let reply = tokio::time::timeout(self.timeout, self.next_frame())
            .await
            .map_err(|_| EndpointError::Timeout(self.address.clone()))??;

        if reply.correlation_id != frame.correlation_id {
            if let Response::Error(error) = reply.body {
                return Err(EndpointError::Remote(error.message));
            }
            return Err(EndpointError::UnexpectedResponse(format!(
                "uncorrelated ({})",
                reply.correlation_id
            )));
        }
        match reply.body {
            Response::Error(error) => Err(EndpointError::Remote(error.message)),
            body => Ok(body),
        }
    }

    async fn send(&mut self, frame: &Frame<Request>) -> Result<()> {
        let serialized = serde_json::to_string(frame)?;
        self.ws.send(WsMessage::Text(serialized.into())).await?;
        debug!("Sent {} to {}", frame.body.kind(), self.address);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<ResponseFrame> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: ResponseFrame = serde_json::from_str(text.as_str())?;
                    if !frame.is_compatible() {
                        return Err(EndpointError::VersionMismatch {
                            expected: PROTOCOL_VERSION.to_string(),
                            actual: frame.version,
                        });
                    }
                    return Ok(frame);
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(EndpointError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn unexpected(response: &Response) -> EndpointError {
    let kind = match response {
        Response::SyncAck(_) => "SyncAck",
        Response::Registered(_) => "Registered",
        Response::ActiveNodes(_) => "ActiveNodes",
        Response::Update(_) => "Update",
        Response::Error(_) => "Error",
    };
    EndpointError::UnexpectedResponse(kind.to_string())
}

/// Snapshots pushed by a remote node
pub struct ClipboardUpdates {
    client: EndpointClient,
}

impl ClipboardUpdates {
    /// Wait for the next update; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<ClipboardSnapshot>> {
        loop {
            match self.client.next_frame().await {
                Ok(Frame {
                    body: Response::Update(snapshot),
                    ..
                }) => return Some(Ok(snapshot)),
                Ok(Frame {
                    body: Response::Error(error),
                    ..
                }) => return Some(Err(EndpointError::Remote(error.message))),
                Ok(frame) => debug!("Ignoring {} on update stream", unexpected(&frame.body)),
                Err(EndpointError::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub async fn close(self) {
        self.client.close().await;
    }
}

/// [`PeerClient`] opening one short-lived connection per delivery
pub struct WebSocketPeerClient {
    timeout: Duration,
}

impl WebSocketPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PeerClient for WebSocketPeerClient {
    async fn sync_clipboard(&self, node: &NodeInfo, snapshot: &ClipboardSnapshot) -> Result<SyncAck> {
        let mut client = EndpointClient::connect(&node.address(), self.timeout).await?;
        let ack = client.sync_clipboard(snapshot.clone()).await;
        client.close().await;
        ack
    }
}
