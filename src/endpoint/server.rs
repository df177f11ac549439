//! WebSocket server for the synchronization endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::protocol::{ErrorReply, Frame, Request, RequestFrame, Response, ResponseFrame, PROTOCOL_VERSION};
use super::{EndpointError, Result, SyncService};

type WsError = tokio_tungstenite::tungstenite::Error;

/// Accepts endpoint connections and serves them from a [`SyncService`]
pub struct EndpointServer {
    listener: TcpListener,
    service: Arc<SyncService>,
    subscriber_buffer: usize,
}

impl EndpointServer {
    /// Bind the listening socket
    ///
    /// `subscriber_buffer` bounds how many updates may queue for one stream
    /// before it is considered stalled and dropped.
    pub async fn bind(
        addr: &str,
        service: Arc<SyncService>,
        subscriber_buffer: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Endpoint listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            service,
            subscriber_buffer: subscriber_buffer.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let service = Arc::clone(&self.service);
            let buffer = self.subscriber_buffer;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer_addr, service, buffer).await {
                    debug!("Connection from {} ended with error: {}", peer_addr, e);
                }
            });
        }
    }
}

#[instrument(skip(stream, service, subscriber_buffer))]
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<SyncService>,
    subscriber_buffer: usize,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    debug!("Accepted endpoint connection");
    let (mut sink, mut source) = ws_stream.split();

    while let Some(message) = source.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Binary(data)) => {
                warn!("Ignoring binary message of {} bytes", data.len());
                continue;
            }
            Ok(_) => continue,
            Err(e) => return Err(e.into()),
        };

        let frame: RequestFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed request: {}", e);
                let reply = Frame {
                    version: PROTOCOL_VERSION.to_string(),
                    correlation_id: Uuid::nil(),
                    body: error_response(format!("Malformed request: {}", e)),
                };
                send_frame(&mut sink, &reply).await?;
                continue;
            }
        };

        if !frame.is_compatible() {
            let mismatch = EndpointError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: frame.version.clone(),
            };
            warn!("{}", mismatch);
            send_frame(&mut sink, &frame.reply(error_response(mismatch.to_string()))).await?;
            continue;
        }

        let Frame {
            correlation_id,
            body,
            ..
        } = frame;
        debug!("Handling {} ({})", body.kind(), correlation_id);

        match body {
            Request::StreamClipboardUpdates => {
                stream_updates(correlation_id, &mut sink, &mut source, &service, subscriber_buffer)
                    .await?;
                break;
            }
            request => {
                let reply = ResponseFrame {
                    version: PROTOCOL_VERSION.to_string(),
                    correlation_id,
                    body: service.handle(request).await,
                };
                send_frame(&mut sink, &reply).await?;
            }
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    debug!("Endpoint connection closed");
    Ok(())
}

/// Push broadcasts to the client until either side goes away
async fn stream_updates<S, R>(
    correlation_id: Uuid,
    sink: &mut S,
    source: &mut R,
    service: &SyncService,
    buffer: usize,
) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let (tx, mut rx) = mpsc::channel(buffer);
    let subscription = service.stream_clipboard_updates(tx);
    tokio::pin!(subscription);

    loop {
        tokio::select! {
            _ = &mut subscription => {
                // Deliver whatever was queued before the subscriber went away.
                while let Ok(snapshot) = rx.try_recv() {
                    send_frame(sink, &update_frame(correlation_id, snapshot)).await?;
                }
                break;
            }
            update = rx.recv() => match update {
                Some(snapshot) => send_frame(sink, &update_frame(correlation_id, snapshot)).await?,
                None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => debug!("Ignoring client message on update stream"),
            },
        }
    }
    Ok(())
}

fn update_frame(correlation_id: Uuid, snapshot: crate::sync::ClipboardSnapshot) -> ResponseFrame {
    Frame {
        version: PROTOCOL_VERSION.to_string(),
        correlation_id,
        body: Response::Update(snapshot),
    }
}

fn error_response(message: String) -> Response {
    Response::Error(ErrorReply { message })
}

async fn send_frame<S>(sink: &mut S, frame: &ResponseFrame) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let serialized = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(serialized.into())).await?;
    Ok(())
}
