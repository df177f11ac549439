use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use clipmesh::{
    clipboard::{memory::MemoryClipboard, ClipboardFormat},
    config::{ClipboardBackend, Config},
    endpoint::{
        protocol::{Frame, Request, Response, ResponseFrame},
        EndpointClient, EndpointServer, SyncService, WebSocketPeerClient,
    },
    monitor::create_monitor,
    node::{announce, bootstrap, ClipboardNode},
    sync::{ClipboardSnapshot, LocalChange, NodeInfo, SyncManager},
    MAX_PAYLOAD_SIZE,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct RunningNode {
    addr: SocketAddr,
    identity: NodeInfo,
    manager: Arc<SyncManager>,
    clipboard: Arc<MemoryClipboard>,
    server: JoinHandle<()>,
}

impl RunningNode {
    fn address(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn start_node(hostname: &str) -> Result<RunningNode> {
    let clipboard = Arc::new(MemoryClipboard::new());
    let manager = Arc::new(SyncManager::new(
        hostname,
        clipboard.clone(),
        Arc::new(WebSocketPeerClient::new(TIMEOUT)),
    ));
    let service = Arc::new(SyncService::new(Arc::clone(&manager), MAX_PAYLOAD_SIZE));
    let server = EndpointServer::bind("127.0.0.1:0", service, 8).await?;
    let addr = server.local_addr()?;

    let identity = NodeInfo::new(hostname, "127.0.0.1", i32::from(addr.port()));
    manager.register_node(identity.clone());
    let server = tokio::spawn(async move {
        let _ = server.run().await;
    });

    Ok(RunningNode {
        addr,
        identity,
        manager,
        clipboard,
        server,
    })
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_register_and_list_nodes() -> Result<()> {
    let a = start_node("node-a").await?;
    let mut client = EndpointClient::connect(&a.address(), TIMEOUT).await?;

    let reply = client
        .register_node(NodeInfo::new("node-b", "127.0.0.2", 50051))
        .await?;
    assert!(reply.success);
    assert_eq!(
        reply.active_nodes,
        vec![a.identity.clone(), NodeInfo::new("node-b", "127.0.0.2", 50051)]
    );

    // Same connection serves further requests.
    let nodes = client.get_active_nodes().await?;
    assert_eq!(nodes.len(), 2);

    let rejected = client
        .register_node(NodeInfo::new("node-c", "127.0.0.3", 99999))
        .await?;
    assert!(!rejected.success);
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_copy_propagates_over_websocket() -> Result<()> {
    let a = start_node("node-a").await?;
    let b = start_node("node-b").await?;
    a.manager.register_node(b.identity.clone());
    b.manager.register_node(a.identity.clone());

    a.clipboard
        .set_formats(vec![ClipboardFormat::text("Hello World")]);
    match a.manager.on_local_change().await {
        LocalChange::Broadcast(report) => {
            assert_eq!(report.peers_delivered, 1);
            assert_eq!(report.peers_failed, 0);
        }
        other => panic!("expected broadcast, got {:?}", other),
    }

    assert_eq!(b.clipboard.formats(), vec![ClipboardFormat::text("Hello World")]);
    assert_eq!(b.manager.on_local_change().await, LocalChange::Unchanged);
    assert_eq!(a.clipboard.restore_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_binary_formats_survive_the_wire() -> Result<()> {
    let a = start_node("node-a").await?;
    let mut client = EndpointClient::connect(&a.address(), TIMEOUT).await?;

    let formats = vec![
        ClipboardFormat::new("CF_DIB", (0..=255u8).collect()).with_metadata("format_id", 8),
        ClipboardFormat::new("PNG", vec![0x89, b'P', b'N', b'G', 0, 0, 0xff]),
    ];
    let ack = client
        .sync_clipboard(ClipboardSnapshot::new("node-z", formats.clone()))
        .await?;
    assert!(ack.success, "{}", ack.message);
    assert_eq!(a.clipboard.formats(), formats);
    Ok(())
}

#[tokio::test]
async fn test_invalid_snapshot_is_acknowledged_as_failure() -> Result<()> {
    let a = start_node("node-a").await?;
    let mut client = EndpointClient::connect(&a.address(), TIMEOUT).await?;

    let mut snapshot = ClipboardSnapshot::new("node-z", vec![ClipboardFormat::text("x")]);
    snapshot.source_host.clear();
    let ack = client.sync_clipboard(snapshot).await?;

    assert!(!ack.success);
    assert_eq!(a.clipboard.restore_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stream_receives_local_changes() -> Result<()> {
    let a = start_node("node-a").await?;
    let client = EndpointClient::connect(&a.address(), TIMEOUT).await?;
    let mut updates = client.stream_clipboard_updates().await?;
    assert!(eventually(|| a.manager.subscriber_count() == 1).await);

    a.clipboard.set_formats(vec![ClipboardFormat::text("streamed")]);
    a.manager.on_local_change().await;

    let update = timeout(TIMEOUT, updates.next()).await?;
    let snapshot = update.expect("stream ended")?;
    assert_eq!(snapshot.source_host, "node-a");
    assert_eq!(snapshot.formats, vec![ClipboardFormat::text("streamed")]);

    updates.close().await;
    assert!(eventually(|| a.manager.subscriber_count() == 0).await);
    Ok(())
}

#[tokio::test]
async fn test_malformed_request_gets_error_frame() -> Result<()> {
    let a = start_node("node-a").await?;
    let url = format!("ws://{}/clipmesh", a.address());
    let (mut ws, _) = connect_async(url.as_str()).await?;

    ws.send(WsMessage::Text("not json".to_string().into())).await?;
    let reply = timeout(TIMEOUT, ws.next()).await?.expect("no reply")?;
    let frame: ResponseFrame = serde_json::from_str(reply.to_text()?)?;
    assert!(matches!(frame.body, Response::Error(_)));

    let mut future = Frame::new(Request::GetActiveNodes);
    future.version = "2.0.0".to_string();
    ws.send(WsMessage::Text(serde_json::to_string(&future)?.into()))
        .await?;
    let reply = timeout(TIMEOUT, ws.next()).await?.expect("no reply")?;
    let frame: ResponseFrame = serde_json::from_str(reply.to_text()?)?;
    assert_eq!(frame.correlation_id, future.correlation_id);
    assert!(matches!(frame.body, Response::Error(ref e) if e.message.contains("CM007")));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_others() -> Result<()> {
    let a = start_node("node-a").await?;
    let b = start_node("node-b").await?;
    a.manager.register_node(b.identity.clone());
    // Nothing listens on port 1.
    a.manager.register_node(NodeInfo::new("node-gone", "127.0.0.1", 1));

    a.clipboard.set_formats(vec![ClipboardFormat::text("partial")]);
    match a.manager.on_local_change().await {
        LocalChange::Broadcast(report) => {
            assert_eq!(report.peers_delivered, 1);
            assert_eq!(report.peers_failed, 1);
        }
        other => panic!("expected broadcast, got {:?}", other),
    }
    assert_eq!(b.clipboard.formats(), vec![ClipboardFormat::text("partial")]);
    Ok(())
}

#[tokio::test]
async fn test_silent_peer_does_not_delay_others() -> Result<()> {
    let a = start_node("node-a").await?;
    let b = start_node("node-b").await?;
    a.manager.register_node(b.identity.clone());

    // Accepts TCP connections and never answers the WebSocket handshake.
    let silent = TcpListener::bind("127.0.0.1:0").await?;
    let silent_port = silent.local_addr()?.port();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            held.push(socket);
        }
    });
    a.manager
        .register_node(NodeInfo::new("node-silent", "127.0.0.1", i32::from(silent_port)));

    a.clipboard.set_formats(vec![ClipboardFormat::text("not stuck")]);
    let started = std::time::Instant::now();
    let broadcast = tokio::spawn({
        let manager = Arc::clone(&a.manager);
        async move { manager.on_local_change().await }
    });

    let expected = vec![ClipboardFormat::text("not stuck")];
    assert!(eventually(|| b.clipboard.formats() == expected).await);
    assert!(started.elapsed() < TIMEOUT / 2, "delivery to node-b waited on the silent peer");

    match timeout(TIMEOUT * 2, broadcast).await?? {
        LocalChange::Broadcast(report) => {
            assert_eq!(report.peers_delivered, 1);
            assert_eq!(report.peers_failed, 1);
        }
        other => panic!("expected broadcast, got {:?}", other),
    }
    holder.abort();
    Ok(())
}

#[tokio::test]
async fn test_announce_keeps_direct_registration() -> Result<()> {
    let b = start_node("node-b").await?;
    let d = start_node("node-d").await?;

    // node-c moved to 9002 and told B; D still has the old address.
    b.manager.register_node(NodeInfo::new("node-c", "127.0.0.1", 9002));
    d.manager.register_node(NodeInfo::new("node-c", "127.0.0.1", 9001));

    let report = announce(&b.manager, &b.identity, &[d.address()], TIMEOUT).await;
    assert_eq!(report.reached, 1);
    assert_eq!(report.learned, vec!["node-d".to_string()]);

    let node_c = b
        .manager
        .active_nodes()
        .into_iter()
        .find(|node| node.hostname == "node-c")
        .expect("node-c missing");
    assert_eq!(node_c.port, 9002);
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_introduces_nodes() -> Result<()> {
    let a = start_node("node-a").await?;
    let b = start_node("node-b").await?;
    let c = start_node("node-c").await?;

    // B already knows A.
    let report = bootstrap(&b.manager, &b.identity, &[a.address()], TIMEOUT).await;
    assert_eq!(report.reached, 1);
    assert_eq!(report.learned, vec!["node-a".to_string()]);

    // C only knows A, and learns about B through it.
    let report = bootstrap(&c.manager, &c.identity, &[a.address()], TIMEOUT).await;
    assert_eq!(report.reached, 2);
    assert!(report.learned.contains(&"node-b".to_string()));

    for node in [&a, &b, &c] {
        let hosts: Vec<String> = node
            .manager
            .active_nodes()
            .into_iter()
            .map(|n| n.hostname)
            .collect();
        assert_eq!(hosts, vec!["node-a", "node-b", "node-c"], "{}", node.identity);
    }
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_tolerates_dead_seed() -> Result<()> {
    let a = start_node("node-a").await?;
    let report = bootstrap(
        &a.manager,
        &a.identity,
        &["127.0.0.1:1".to_string()],
        Duration::from_secs(1),
    )
    .await;

    assert_eq!(report.reached, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(a.manager.active_nodes(), vec![a.identity.clone()]);
    Ok(())
}

#[tokio::test]
async fn test_node_runs_until_shutdown() -> Result<()> {
    let mut config = Config::default();
    config.hostname = "node-run".to_string();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.sync.announce_interval_secs = 0;
    config.monitor.backend = ClipboardBackend::Memory;
    config.monitor.poll_interval_ms = 50;

    let clipboard = Arc::new(MemoryClipboard::new());
    let monitor = create_monitor(clipboard.clone(), &config.monitor);
    let node = ClipboardNode::new(config, clipboard, monitor);
    let manager = node.manager();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(node.run(async {
        let _ = stop_rx.await;
    }));

    assert!(eventually(|| manager.active_nodes().len() == 1).await);
    assert_eq!(manager.active_nodes()[0].hostname, "node-run");

    stop_tx.send(()).ok();
    timeout(TIMEOUT, running).await???;
    Ok(())
}
