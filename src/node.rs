//! Node runtime
//!
//! Wires one clipboard bridge, change monitor, sync manager and endpoint
//! server into a running node, and keeps it registered with the rest of the
//! mesh.

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::clipboard::ClipboardBridge;
use crate::config::{Config, DEFAULT_PORT};
use crate::endpoint::{EndpointClient, EndpointServer, RegisterReply, SyncService, WebSocketPeerClient};
use crate::monitor::{ChangeMonitor, ChangeSignal};
use crate::sync::{NodeInfo, SyncManager};

/// Result of one round of registrations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnnounceReport {
    /// Targets that accepted the registration
    pub reached: usize,
    /// Targets that could not be reached or refused
    pub failed: usize,
    /// Hostnames that were not in the local registry before
    pub learned: Vec<String>,
}

/// A clipboard node built from configuration
pub struct ClipboardNode {
    config: Config,
    manager: Arc<SyncManager>,
    monitor: Box<dyn ChangeMonitor>,
    advertise_ip: String,
}

impl ClipboardNode {
    pub fn new(
        config: Config,
        bridge: Arc<dyn ClipboardBridge>,
        monitor: Box<dyn ChangeMonitor>,
    ) -> Self {
        let peers = Arc::new(WebSocketPeerClient::new(config.sync.request_timeout()));
        let manager = SyncManager::new(config.hostname.clone(), bridge, peers)
            .with_peer_failure_limit(config.sync.peer_failure_limit);
        let advertise_ip = resolve_advertise_ip(&config);

        Self {
            config,
            manager: Arc::new(manager),
            monitor,
            advertise_ip,
        }
    }

    pub fn manager(&self) -> Arc<SyncManager> {
        Arc::clone(&self.manager)
    }

    /// Run until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> crate::Result<()> {
        let service = Arc::new(SyncService::new(
            Arc::clone(&self.manager),
            self.config.sync.max_payload_size,
        ));
        let server = EndpointServer::bind(
            &self.config.listen_addr,
            service,
            self.config.sync.subscriber_buffer,
        )
        .await?;
        let local_addr = server.local_addr()?;

        let identity = NodeInfo::new(
            self.config.hostname.clone(),
            self.advertise_ip.clone(),
            i32::from(local_addr.port()),
        );
        self.manager.register_node(identity.clone());
        info!("Node {} serving on {}", identity, local_addr);

        let (signal, signals) = ChangeSignal::channel();
        self.monitor.start(Arc::new(signal))?;

        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("Endpoint server stopped: {}", e);
            }
        });
        let sync_task = tokio::spawn({
            let manager = Arc::clone(&self.manager);
            async move { manager.run(signals).await }
        });

        let timeout = self.config.sync.request_timeout();
        let seeds = self.config.peers.clone();
        let report = bootstrap(&self.manager, &identity, &seeds, timeout).await;
        if !seeds.is_empty() {
            info!(
                "Bootstrap reached {} of {} seeds, learned {} nodes",
                report.reached,
                seeds.len(),
                report.learned.len()
            );
        }

        let announce_task = self.config.sync.announce_interval().map(|interval| {
            let manager = Arc::clone(&self.manager);
            let identity = identity.clone();
            tokio::spawn(async move {
                announce_loop(manager, identity, seeds, interval, timeout).await
            })
        });

        shutdown.await;
        info!("Shutting down node {}", identity.hostname);

        if let Some(task) = announce_task {
            task.abort();
        }
        let mut monitor = self.monitor;
        if tokio::task::spawn_blocking(move || monitor.stop()).await.is_err() {
            warn!("Monitor stop task failed");
        }
        // Stopping the monitor drops the signal sender, which ends the sync loop.
        if tokio::time::timeout(Duration::from_secs(5), sync_task).await.is_err() {
            warn!("Sync loop did not finish in time");
        }
        server_task.abort();
        Ok(())
    }
}

/// Identity a node with this configuration registers under
pub fn local_identity(config: &Config) -> NodeInfo {
    NodeInfo::new(
        config.hostname.clone(),
        resolve_advertise_ip(config),
        i32::from(config.listen_port().unwrap_or(DEFAULT_PORT)),
    )
}

/// IP other nodes should dial: configured, else first non-loopback IPv4
fn resolve_advertise_ip(config: &Config) -> String {
    if let Some(ip) = &config.advertise_ip {
        return ip.clone();
    }

    if let Ok(addr) = config.listen_addr.parse::<std::net::SocketAddr>() {
        if !addr.ip().is_unspecified() {
            return addr.ip().to_string();
        }
    }

    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .find(IpAddr::is_ipv4)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            "127.0.0.1".to_string()
        }
    }
}

async fn register_with(
    address: &str,
    identity: &NodeInfo,
    timeout: Duration,
) -> crate::endpoint::Result<RegisterReply> {
    let mut client = EndpointClient::connect(address, timeout).await?;
    let reply = client.register_node(identity.clone()).await;
    client.close().await;
    reply
}

/// Register `identity` with every target and learn the nodes they report
///
/// Entries already in the local registry are never replaced by a peer's view.
pub async fn announce(
    manager: &SyncManager,
    identity: &NodeInfo,
    targets: &[String],
    timeout: Duration,
) -> AnnounceReport {
    let replies = join_all(
        targets
            .iter()
            .map(|target| async move { (target, register_with(target, identity, timeout).await) }),
    )
    .await;

    let mut report = AnnounceReport::default();
    for (target, reply) in replies {
        match reply {
            Ok(reply) if reply.success => {
                report.reached += 1;
                for node in reply.active_nodes {
                    if node.hostname == identity.hostname || node.validate().is_err() {
                        continue;
                    }
                    let hostname = node.hostname.clone();
                    if manager.learn_node(node) {
                        report.learned.push(hostname);
                    }
                }
            }
            Ok(reply) => {
                warn!("{} refused registration: {}", target, reply.message);
                report.failed += 1;
            }
            Err(e) => {
                debug!("Registration with {} failed: {}", target, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Register with the seeds, then with every node they told us about
pub async fn bootstrap(
    manager: &SyncManager,
    identity: &NodeInfo,
    seeds: &[String],
    timeout: Duration,
) -> AnnounceReport {
    if seeds.is_empty() {
        return AnnounceReport::default();
    }

    let mut report = announce(manager, identity, seeds, timeout).await;
    let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();
    let introductions: Vec<String> = manager
        .active_nodes()
        .into_iter()
        .filter(|node| report.learned.contains(&node.hostname))
        .map(|node| node.address())
        .filter(|address| !seed_set.contains(address.as_str()))
        .collect();

    if !introductions.is_empty() {
        let second = announce(manager, identity, &introductions, timeout).await;
        report.reached += second.reached;
        report.failed += second.failed;
        report.learned.extend(second.learned);
    }
    report
}

async fn announce_loop(
    manager: Arc<SyncManager>,
    identity: NodeInfo,
    seeds: Vec<String>,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; bootstrap already covered it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let mut targets: Vec<String> = manager
            .active_nodes()
            .into_iter()
            .filter(|node| node.hostname != identity.hostname)
            .map(|node| node.address())
            .collect();
        for seed in &seeds {
            if !targets.contains(seed) {
                targets.push(seed.clone());
            }
        }
        if targets.is_empty() {
            continue;
        }

        let report = announce(&manager, &identity, &targets, timeout).await;
        debug!(
            "Announce reached {} of {} nodes",
            report.reached,
            targets.len()
        );
        if !report.learned.is_empty() {
            info!("Learned nodes: {}", report.learned.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_ip_from_config() {
        let mut config = Config::default();
        config.advertise_ip = Some("192.168.1.50".to_string());
        assert_eq!(resolve_advertise_ip(&config), "192.168.1.50");
    }

    #[test]
    fn test_advertise_ip_from_listen_addr() {
        let mut config = Config::default();
        config.listen_addr = "127.0.0.1:0".to_string();
        assert_eq!(resolve_advertise_ip(&config), "127.0.0.1");
    }

    #[test]
    fn test_detected_ip_is_ipv4() {
        let config = Config::default();
        let ip: IpAddr = resolve_advertise_ip(&config).parse().unwrap();
        assert!(ip.is_ipv4());
    }
}
