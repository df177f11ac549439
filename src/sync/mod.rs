//! Sync manager: node registry, subscriber fan-out and loop suppression
//!
//! All shared state sits behind one mutex that is never held across an
//! `.await`. Network and clipboard calls always run on snapshots of the
//! state taken under the lock.

pub mod fingerprint;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use fingerprint::ContentFingerprint;
pub use types::{ClipboardSnapshot, NodeInfo, ValidationError};

use crate::clipboard::{ClipboardBridge, ClipboardError, ClipboardFormat};
use crate::endpoint::protocol::SyncAck;
use crate::endpoint::EndpointError;

/// Delivers a snapshot to a remote node's SyncClipboard operation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn sync_clipboard(
        &self,
        node: &NodeInfo,
        snapshot: &ClipboardSnapshot,
    ) -> Result<SyncAck, EndpointError>;
}

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),

    /// The blocking clipboard task panicked or was cancelled
    #[error("Clipboard task failed: {0}")]
    Task(String),
}

/// What happened to an inbound snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot originated here
    EchoSuppressed,
    /// The clipboard already holds this content
    AlreadyCurrent,
    /// Written to the clipboard; `skipped` formats could not be restored
    Applied { restored: usize, skipped: usize },
}

/// What happened after a local change signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// Nothing could be captured
    Empty,
    /// Content matches the last broadcast or applied snapshot
    Unchanged,
    Broadcast(BroadcastReport),
}

/// Per-destination results of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub subscribers_delivered: usize,
    /// Subscribers removed because their stream was full or closed
    pub subscribers_dropped: usize,
    pub peers_delivered: usize,
    /// Peers that answered with `success = false`
    pub peers_rejected: usize,
    /// Peers that could not be reached
    pub peers_failed: usize,
    /// Hostnames removed from the registry after repeated failures
    pub peers_evicted: Vec<String>,
}

struct Subscriber {
    sender: mpsc::Sender<ClipboardSnapshot>,
    // Dropping this wakes the subscribe call.
    _removed: oneshot::Sender<()>,
}

#[derive(Default)]
struct SyncState {
    nodes: HashMap<String, NodeInfo>,
    subscribers: HashMap<Uuid, Subscriber>,
    fingerprint: ContentFingerprint,
    // What the clipboard reads back as after the last apply.
    applied_alias: Option<ContentFingerprint>,
    failures: HashMap<String, u32>,
    // Evicted hosts stay out until they register again themselves.
    evicted: HashSet<String>,
}

/// Coordinates local change broadcast and inbound snapshot application
pub struct SyncManager {
    local_host: String,
    bridge: Arc<dyn ClipboardBridge>,
    peers: Arc<dyn PeerClient>,
    peer_failure_limit: u32,
    state: Mutex<SyncState>,
}

impl SyncManager {
    pub fn new(
        local_host: impl Into<String>,
        bridge: Arc<dyn ClipboardBridge>,
        peers: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            bridge,
            peers,
            peer_failure_limit: 0,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Evict a node after `limit` consecutive delivery failures (0 never evicts)
    pub fn with_peer_failure_limit(mut self, limit: u32) -> Self {
        self.peer_failure_limit = limit;
        self
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the registry entry keyed by `node.hostname`
    ///
    /// The failure count survives a re-registration at the same address.
    pub fn register_node(&self, node: NodeInfo) {
        let mut state = self.state();
        state.evicted.remove(&node.hostname);
        match state.nodes.insert(node.hostname.clone(), node.clone()) {
            Some(previous) if previous != node => {
                state.failures.remove(&node.hostname);
                info!("Node {} moved from {} to {}", node.hostname, previous.address(), node.address())
            }
            Some(_) => debug!("Node {} re-registered", node.hostname),
            None => {
                state.failures.remove(&node.hostname);
                info!("Registered node {}", node)
            }
        }
    }

    /// Add a node reported by another node's registry
    ///
    /// Existing entries and evicted hosts are left alone. Returns whether the
    /// node was added.
    pub fn learn_node(&self, node: NodeInfo) -> bool {
        let mut state = self.state();
        if state.nodes.contains_key(&node.hostname) || state.evicted.contains(&node.hostname) {
            return false;
        }
        info!("Learned node {}", node);
        state.nodes.insert(node.hostname.clone(), node);
        true
    }

    /// Registry contents sorted by hostname, including this node
    pub fn active_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.state().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        nodes
    }

    /// Fingerprint of the last broadcast or applied content
    pub fn fingerprint(&self) -> ContentFingerprint {
        self.state().fingerprint.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Capture the clipboard and broadcast it if the content is new
    pub async fn on_local_change(&self) -> LocalChange {
        let formats = self.capture().await;
        if formats.is_empty() {
            debug!("Local change produced an empty capture, ignoring");
            return LocalChange::Empty;
        }

        let fingerprint = ContentFingerprint::of(&formats);
        {
            let mut state = self.state();
            if state.fingerprint == fingerprint {
                debug!("Local content unchanged ({})", fingerprint.short());
                return LocalChange::Unchanged;
            }
            if state.applied_alias.as_ref() == Some(&fingerprint) {
                debug!("Local content is the last applied snapshot ({})", fingerprint.short());
                return LocalChange::Unchanged;
            }
            state.fingerprint = fingerprint.clone();
            state.applied_alias = None;
        }

        let snapshot = ClipboardSnapshot::new(self.local_host.clone(), formats);
        info!(
            "Broadcasting local clipboard change {} ({} formats, {} bytes, {})",
            snapshot.message_id,
            snapshot.formats.len(),
            snapshot.payload_size(),
            fingerprint.short()
        );
        LocalChange::Broadcast(self.broadcast(&snapshot).await)
    }

    async fn capture(&self) -> Vec<ClipboardFormat> {
        let bridge = Arc::clone(&self.bridge);
        match tokio::task::spawn_blocking(move || bridge.capture()).await {
            Ok(formats) => formats,
            Err(e) => {
                error!("Clipboard capture task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Write an inbound snapshot to the local clipboard
    ///
    /// The stored fingerprint is updated before the restore so the change
    /// notification the restore triggers is recognised as already seen. The
    /// clipboard is read back right after the restore, since the OS may add
    /// formats of its own, and that content is recognised as well.
    #[instrument(skip_all, fields(source = %snapshot.source_host, message_id = %snapshot.message_id))]
    pub async fn apply(&self, snapshot: ClipboardSnapshot) -> Result<ApplyOutcome, SyncError> {
        if snapshot.source_host == self.local_host {
            debug!("Ignoring snapshot that originated here");
            return Ok(ApplyOutcome::EchoSuppressed);
        }

        let fingerprint = snapshot.fingerprint();
        let (previous, previous_alias) = {
            let mut state = self.state();
            if state.fingerprint == fingerprint || state.applied_alias.as_ref() == Some(&fingerprint) {
                debug!("Clipboard already holds {}", fingerprint.short());
                return Ok(ApplyOutcome::AlreadyCurrent);
            }
            let previous = std::mem::replace(&mut state.fingerprint, fingerprint.clone());
            (previous, state.applied_alias.take())
        };

        let bridge = Arc::clone(&self.bridge);
        let formats = snapshot.formats;
        let restore = move || {
            let report = bridge.restore(&formats)?;
            let readback = ContentFingerprint::of(&bridge.capture());
            Ok::<_, ClipboardError>((report, readback))
        };
        let result = match tokio::task::spawn_blocking(restore).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(e) => Err(SyncError::Task(e.to_string())),
        };

        match result {
            Ok((report, readback)) => {
                if !readback.is_empty() && readback != fingerprint {
                    let mut state = self.state();
                    if state.fingerprint == fingerprint {
                        debug!("Clipboard reads back as {} after restore", readback.short());
                        state.applied_alias = Some(readback);
                    }
                }
                for (name, reason) in &report.skipped {
                    warn!("Format {} was not restored: {}", name, reason);
                }
                info!(
                    "Applied remote clipboard ({} restored, {} skipped, {})",
                    report.restored.len(),
                    report.skipped.len(),
                    fingerprint.short()
                );
                Ok(ApplyOutcome::Applied {
                    restored: report.restored.len(),
                    skipped: report.skipped.len(),
                })
            }
            Err(e) => {
                let mut state = self.state();
                if state.fingerprint == fingerprint {
                    state.fingerprint = previous;
                    state.applied_alias = previous_alias;
                }
                warn!("Failed to apply remote clipboard: {}", e);
                Err(e)
            }
        }
    }

    /// Push a snapshot to every subscriber and every registered remote node
    ///
    /// Individual failures are logged and counted, never returned.
    pub async fn broadcast(&self, snapshot: &ClipboardSnapshot) -> BroadcastReport {
        let (subscribers, nodes) = {
            let state = self.state();
            let subscribers: Vec<(Uuid, mpsc::Sender<ClipboardSnapshot>)> = state
                .subscribers
                .iter()
                .map(|(id, subscriber)| (*id, subscriber.sender.clone()))
                .collect();
            let nodes: Vec<NodeInfo> = state
                .nodes
                .values()
                .filter(|node| node.hostname != self.local_host)
                .cloned()
                .collect();
            (subscribers, nodes)
        };

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, sender) in subscribers {
            match sender.try_send(snapshot.clone()) {
                Ok(()) => report.subscribers_delivered += 1,
                Err(e) => {
                    warn!("Dropping subscriber {}: {}", id, e);
                    dead.push(id);
                }
            }
        }

        let deliveries = nodes.iter().map(|node| async move {
            (node, self.peers.sync_clipboard(node, snapshot).await)
        });
        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for (node, result) in join_all(deliveries).await {
            match result {
                Ok(ack) if ack.success => {
                    report.peers_delivered += 1;
                    reachable.push(node.hostname.clone());
                }
                Ok(ack) => {
                    warn!("Node {} rejected snapshot {}: {}", node.hostname, snapshot.message_id, ack.message);
                    report.peers_rejected += 1;
                    reachable.push(node.hostname.clone());
                }
                Err(e) => {
                    warn!("Failed to deliver snapshot to {}: {}", node, e);
                    report.peers_failed += 1;
                    unreachable.push(node.clone());
                }
            }
        }

        let mut state = self.state();
        for id in &dead {
            state.subscribers.remove(id);
        }
        report.subscribers_dropped = dead.len();
        for hostname in reachable {
            state.failures.remove(&hostname);
        }
        for node in unreachable {
            let failures = state.failures.entry(node.hostname.clone()).or_insert(0);
            *failures += 1;
            let failures = *failures;
            // Only evict the entry we actually failed against, not a newer registration.
            if self.peer_failure_limit > 0
                && failures >= self.peer_failure_limit
                && state.nodes.get(&node.hostname) == Some(&node)
            {
                state.nodes.remove(&node.hostname);
                state.failures.remove(&node.hostname);
                state.evicted.insert(node.hostname.clone());
                warn!("Evicted node {} after {} failed deliveries", node, failures);
                report.peers_evicted.push(node.hostname);
            }
        }

        debug!("Broadcast {} finished: {:?}", snapshot.message_id, report);
        report
    }

    /// Stream every future broadcast into `handle`
    ///
    /// Returns once the receiving side is dropped or the subscriber is
    /// removed after a failed write. The subscriber is removed on return and
    /// when this future is cancelled.
    pub async fn subscribe(&self, handle: mpsc::Sender<ClipboardSnapshot>) {
        let id = Uuid::new_v4();
        let (removed_tx, removed_rx) = oneshot::channel();
        self.state().subscribers.insert(
            id,
            Subscriber {
                sender: handle.clone(),
                _removed: removed_tx,
            },
        );
        info!("Subscriber {} attached", id);

        let _guard = SubscriptionGuard {
            state: &self.state,
            id,
        };
        tokio::select! {
            _ = handle.closed() => debug!("Subscriber {} closed its stream", id),
            _ = removed_rx => debug!("Subscriber {} was removed", id),
        }
    }

    /// Drain change signals until the channel closes
    ///
    /// Signals that queue up while a broadcast is in flight collapse into
    /// one capture.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<()>) {
        info!("Sync loop started for {}", self.local_host);
        while signals.recv().await.is_some() {
            let mut coalesced = 0usize;
            while signals.try_recv().is_ok() {
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!("Coalesced {} queued change signals", coalesced);
            }

            if let LocalChange::Broadcast(report) = self.on_local_change().await {
                if report.peers_failed > 0 || report.subscribers_dropped > 0 {
                    warn!(
                        "Broadcast reached {} of {} nodes",
                        report.peers_delivered + report.peers_rejected,
                        report.peers_delivered + report.peers_rejected + report.peers_failed
                    );
                }
            }
        }
        info!("Change signal channel closed, sync loop exiting");
    }
}

struct SubscriptionGuard<'a> {
    state: &'a Mutex<SyncState>,
    id: Uuid,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.subscribers.remove(&self.id).is_some() {
            info!("Subscriber {} detached", self.id);
        }
    }
}
