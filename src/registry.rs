use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::{Envelope, Inbound, is_critical};
use crate::types::{ConnectionId, ConnectionInfo, NodeId};

/* ============================= INTERCEPTOR ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// What to do with one message in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Drop,
    Delay(Duration),
}

/// Capability the registry consults inline on every send and every receive.
/// The chaos engine is the production implementor.
pub trait Interceptor: Send + Sync {
    fn intercept_outgoing(
        &self,
        connection: ConnectionId,
        node: Option<&NodeId>,
        msg_type: &str,
    ) -> Decision;

    fn intercept_incoming(
        &self,
        connection: ConnectionId,
        node: Option<&NodeId>,
        msg_type: &str,
    ) -> Decision;
}

/// Default interceptor: every message passes untouched.
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {
    fn intercept_outgoing(&self, _: ConnectionId, _: Option<&NodeId>, _: &str) -> Decision {
        Decision::Forward
    }

    fn intercept_incoming(&self, _: ConnectionId, _: Option<&NodeId>, _: &str) -> Decision {
        Decision::Forward
    }
}

/* ============================= CHANNELS ============================= */

/// Control-plane side of one bidirectional in-process channel.
pub struct Channel {
    pub remote_addr: String,
    to_peer: mpsc::Sender<Envelope>,
    from_peer: mpsc::Receiver<Envelope>,
}

/// Node side of the channel; what a (simulated) node holds.
pub struct PeerChannel {
    pub to_control: mpsc::Sender<Envelope>,
    pub from_control: mpsc::Receiver<Envelope>,
}

/// Build a connected channel pair. Framing beyond the envelope is out of
/// scope; a network transport would sit behind the same two pipes.
pub fn channel_pair(remote_addr: &str, capacity: usize) -> (Channel, PeerChannel) {
    let (to_peer, from_control) = mpsc::channel(capacity);
    let (to_control, from_peer) = mpsc::channel(capacity);
    (
        Channel {
            remote_addr: remote_addr.to_string(),
            to_peer,
            from_peer,
        },
        PeerChannel { to_control, from_control },
    )
}

/* ============================= PARTITIONS ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// A labelled cut: the member set is one side, everything else (the control
/// plane included) the other. Messages straddling the cut are dropped.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: PartitionId,
    pub members: HashSet<NodeId>,
    pub expires_at_ms: Option<u64>,
}

/* ============================= CONNECTION STATE ============================= */

enum PauseState {
    Active,
    Paused { until_ms: Option<u64> },
}

struct ConnectionEntry {
    remote_addr: String,
    ip: String,
    connected_at: chrono::DateTime<chrono::Utc>,
    last_activity_ms: u64,
    /// Bound identities in bind order; the first is the routing identity.
    nodes: Vec<NodeId>,
    outbound: mpsc::Sender<Envelope>,
    pause: PauseState,
    pause_queue: VecDeque<Envelope>,
    cancel: CancellationToken,
}

struct Tables {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    node_bindings: HashMap<NodeId, ConnectionId>,
    bans: HashMap<NodeId, Option<u64>>,
    partitions: HashMap<PartitionId, Partition>,
    per_ip: HashMap<String, usize>,
}

/* ============================= REGISTRY ============================= */

/// Owns every open channel, translates between the wire and in-process
/// operations, and exposes the disconnect/pause/partition primitives used
/// by the reconciler and the chaos harness.
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
    interceptor: Arc<dyn Interceptor>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    clock: Arc<Clock>,
    config: Config,
    next_connection: AtomicU64,
    next_partition: AtomicU64,
    cancel: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(
        config: Config,
        clock: Arc<Clock>,
        interceptor: Arc<dyn Interceptor>,
        cancel: CancellationToken,
    ) -> Arc<ConnectionRegistry> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_queue);
        Arc::new(ConnectionRegistry {
            tables: RwLock::new(Tables {
                connections: HashMap::new(),
                node_bindings: HashMap::new(),
                bans: HashMap::new(),
                partitions: HashMap::new(),
                per_ip: HashMap::new(),
            }),
            interceptor,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            clock,
            config,
            next_connection: AtomicU64::new(1),
            next_partition: AtomicU64::new(1),
            cancel,
        })
    }

    /// The single consumer side of the inbound pipe; taken once by the
    /// orchestrator's dispatch task.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound_rx.lock().take()
    }

    /* ── admission & lifecycle ── */

    /// Register a new channel and start its send and receive loops.
    pub fn admit(self: &Arc<Self>, channel: Channel) -> Result<ConnectionId> {
        let ip = ip_of(&channel.remote_addr);
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(self.config.max_queue);
        let cancel = self.cancel.child_token();

        {
            let mut tables = self.tables.write();
            if tables.connections.len() >= self.config.max_connections {
                return Err(Error::ChannelLimit(format!(
                    "global cap of {} connections reached",
                    self.config.max_connections
                )));
            }
            let ip_count = tables.per_ip.get(&ip).copied().unwrap_or(0);
            if ip_count >= self.config.max_connections_per_ip {
                return Err(Error::ChannelLimit(format!(
                    "per-ip cap of {} connections reached for {ip}",
                    self.config.max_connections_per_ip
                )));
            }
            tables.connections.insert(
                id,
                ConnectionEntry {
                    remote_addr: channel.remote_addr.clone(),
                    ip: ip.clone(),
                    connected_at: self.clock.wall(),
                    last_activity_ms: self.clock.now_ms(),
                    nodes: Vec::new(),
                    outbound: outbound_tx,
                    pause: PauseState::Active,
                    pause_queue: VecDeque::new(),
                    cancel: cancel.clone(),
                },
            );
            *tables.per_ip.entry(ip).or_insert(0) += 1;
        }

        metrics::CONNECTIONS_ADMITTED.inc();
        metrics::CONNECTIONS_ACTIVE.inc();
        info!(connection = %id, remote = %channel.remote_addr, "connection_admitted");

        let registry = Arc::clone(self);
        let send_cancel = cancel.clone();
        let to_peer = channel.to_peer;
        tokio::spawn(async move {
            registry.send_loop(id, to_peer, outbound_rx, send_cancel).await;
        });

        let registry = Arc::clone(self);
        let from_peer = channel.from_peer;
        tokio::spawn(async move {
            registry.receive_loop(id, from_peer, cancel).await;
        });

        Ok(id)
    }

    /// Record that the far end claims `node`. A NodeId is held by at most
    /// one connection; a second binding evicts the first.
    pub fn bind_node(self: &Arc<Self>, connection: ConnectionId, node: &NodeId) -> Result<()> {
        if self.is_banned(node) {
            return Err(Error::NodeBanned(node.clone()));
        }
        let superseded = {
            let mut tables = self.tables.write();
            if !tables.connections.contains_key(&connection) {
                return Err(Error::ChannelClosed(format!("{connection}")));
            }
            match tables.node_bindings.get(node) {
                Some(existing) if *existing == connection => return Ok(()),
                Some(existing) => Some(*existing),
                None => None,
            }
        };
        if let Some(old) = superseded {
            warn!(node = %node, old = %old, new = %connection, "node_binding_superseded");
            self.terminate_with_reason(old, "superseded_by");
        }
        let mut tables = self.tables.write();
        let Some(entry) = tables.connections.get_mut(&connection) else {
            return Err(Error::ChannelClosed(format!("{connection}")));
        };
        if !entry.nodes.contains(node) {
            entry.nodes.push(node.clone());
        }
        tables.node_bindings.insert(node.clone(), connection);
        debug!(node = %node, connection = %connection, "node_bound");
        Ok(())
    }

    /// Close the channel immediately. Cancels pending delays, drops the
    /// pause queue, and removes every binding atomically.
    pub fn terminate_connection(self: &Arc<Self>, connection: ConnectionId) -> bool {
        self.terminate_with_reason(connection, "terminated")
    }

    fn terminate_with_reason(self: &Arc<Self>, connection: ConnectionId, reason: &str) -> bool {
        let entry = {
            let mut tables = self.tables.write();
            let Some(entry) = tables.connections.remove(&connection) else {
                return false;
            };
            for node in &entry.nodes {
                if tables.node_bindings.get(node) == Some(&connection) {
                    tables.node_bindings.remove(node);
                }
            }
            if let Some(count) = tables.per_ip.get_mut(&entry.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    tables.per_ip.remove(&entry.ip);
                }
            }
            entry
        };
        entry.cancel.cancel();
        metrics::CONNECTIONS_ACTIVE.dec();
        info!(connection = %connection, reason = %reason, "connection_closed");
        true
    }

    /// Drop the channel currently bound to `node`, if any.
    pub fn simulate_node_loss(self: &Arc<Self>, node: &NodeId) -> bool {
        match self.node_connection(node) {
            Some(connection) => self.terminate_with_reason(connection, "simulated_loss"),
            None => false,
        }
    }

    pub fn node_connection(&self, node: &NodeId) -> Option<ConnectionId> {
        self.tables.read().node_bindings.get(node).copied()
    }

    pub fn bound_nodes(&self, connection: ConnectionId) -> Vec<NodeId> {
        self.tables
            .read()
            .connections
            .get(&connection)
            .map(|e| e.nodes.clone())
            .unwrap_or_default()
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let tables = self.tables.read();
        let mut list: Vec<ConnectionInfo> = tables
            .connections
            .iter()
            .map(|(id, e)| ConnectionInfo {
                id: *id,
                node_ids: e.nodes.clone(),
                remote_addr: e.remote_addr.clone(),
                authenticated: !e.nodes.is_empty(),
                connected_at: e.connected_at,
                last_activity_ms: e.last_activity_ms,
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub fn connection_count(&self) -> usize {
        self.tables.read().connections.len()
    }

    /* ── sending ── */

    /// Enqueue for transmission; never blocks the caller. False when the
    /// channel is closed, the peer is banned or partitioned away, the
    /// message was dropped in flight, or buffers are full.
    pub fn send_to_connection(self: &Arc<Self>, connection: ConnectionId, msg: Envelope) -> bool {
        let node = {
            let tables = self.tables.read();
            match tables.connections.get(&connection) {
                Some(entry) => entry.nodes.first().cloned(),
                None => return false,
            }
        };
        self.dispatch_outbound(connection, node, msg)
    }

    /// Resolve the node's binding and delegate; false when unbound.
    pub fn send_to_node(self: &Arc<Self>, node: &NodeId, msg: Envelope) -> bool {
        match self.node_connection(node) {
            Some(connection) => self.dispatch_outbound(connection, Some(node.clone()), msg),
            None => false,
        }
    }

    fn dispatch_outbound(
        self: &Arc<Self>,
        connection: ConnectionId,
        node: Option<NodeId>,
        msg: Envelope,
    ) -> bool {
        if let Some(n) = &node {
            if self.is_banned(n) {
                return false;
            }
            if self.is_partitioned(n) {
                metrics::MESSAGES_DROPPED_PARTITION.inc();
                debug!(node = %n, msg_type = %msg.msg_type, "message_dropped_partition");
                return false;
            }
        }
        match self
            .interceptor
            .intercept_outgoing(connection, node.as_ref(), &msg.msg_type)
        {
            Decision::Drop => {
                debug!(connection = %connection, msg_type = %msg.msg_type, "message_dropped_chaos");
                false
            }
            Decision::Delay(delay) => {
                let registry = Arc::clone(self);
                let cancel = match self.tables.read().connections.get(&connection) {
                    Some(entry) => entry.cancel.clone(),
                    None => return false,
                };
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            // later messages may have overtaken this one
                            registry.enqueue_outbound(connection, msg);
                        }
                    }
                });
                true
            }
            Decision::Forward => self.enqueue_outbound(connection, msg),
        }
    }

    fn enqueue_outbound(self: &Arc<Self>, connection: ConnectionId, msg: Envelope) -> bool {
        let mut tables = self.tables.write();
        let Some(entry) = tables.connections.get_mut(&connection) else {
            return false;
        };

        // lazily expire a timed pause the resume timer has not reached yet
        if let PauseState::Paused { until_ms: Some(until) } = entry.pause
            && self.clock.now_ms() >= until
        {
            entry.pause = PauseState::Active;
            let queued: Vec<Envelope> = entry.pause_queue.drain(..).collect();
            for queued_msg in queued {
                if entry.outbound.try_send(queued_msg).is_err() {
                    metrics::MESSAGES_DROPPED_OVERFLOW.inc();
                }
            }
        }

        if matches!(entry.pause, PauseState::Paused { .. }) {
            entry.pause_queue.push_back(msg);
            if entry.pause_queue.len() > self.config.max_paused_queue {
                // evict the oldest non-critical message; oldest overall if
                // everything queued is critical
                let victim = entry
                    .pause_queue
                    .iter()
                    .position(|m| !is_critical(&m.msg_type))
                    .unwrap_or(0);
                let dropped = entry.pause_queue.remove(victim);
                metrics::MESSAGES_DROPPED_OVERFLOW.inc();
                if let Some(dropped) = dropped {
                    debug!(connection = %connection, msg_type = %dropped.msg_type, "paused_queue_overflow");
                }
            }
            return true;
        }

        match entry.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::MESSAGES_DROPPED_OVERFLOW.inc();
                warn!(connection = %connection, "outbound_queue_overflow");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /* ── pause / resume ── */

    /// Quiesce the outbound side; messages queue up to `max_paused_queue`.
    pub fn pause_connection(self: &Arc<Self>, connection: ConnectionId, duration_ms: Option<u64>) -> bool {
        let until_ms = duration_ms.filter(|d| *d > 0).map(|d| self.clock.now_ms() + d);
        {
            let mut tables = self.tables.write();
            let Some(entry) = tables.connections.get_mut(&connection) else {
                return false;
            };
            entry.pause = PauseState::Paused { until_ms };
        }
        info!(connection = %connection, until_ms = ?until_ms, "connection_paused");
        if let Some(duration) = duration_ms.filter(|d| *d > 0) {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(duration)).await;
                registry.resume_connection(connection);
            });
        }
        true
    }

    /// Lift the pause and flush queued messages in FIFO order.
    pub fn resume_connection(self: &Arc<Self>, connection: ConnectionId) -> bool {
        let mut tables = self.tables.write();
        let Some(entry) = tables.connections.get_mut(&connection) else {
            return false;
        };
        if matches!(entry.pause, PauseState::Active) {
            return false;
        }
        entry.pause = PauseState::Active;
        let queued: Vec<Envelope> = entry.pause_queue.drain(..).collect();
        let flushed = queued.len();
        for msg in queued {
            if entry.outbound.try_send(msg).is_err() {
                metrics::MESSAGES_DROPPED_OVERFLOW.inc();
            }
        }
        info!(connection = %connection, flushed, "connection_resumed");
        true
    }

    pub fn pause_node(self: &Arc<Self>, node: &NodeId, duration_ms: Option<u64>) -> bool {
        match self.node_connection(node) {
            Some(connection) => self.pause_connection(connection, duration_ms),
            None => false,
        }
    }

    pub fn resume_node(self: &Arc<Self>, node: &NodeId) -> bool {
        match self.node_connection(node) {
            Some(connection) => self.resume_connection(connection),
            None => false,
        }
    }

    /* ── bans ── */

    /// Disconnect the node and refuse new bindings until the ban expires.
    /// A zero or missing duration bans indefinitely.
    pub fn ban_node(self: &Arc<Self>, node: &NodeId, duration_ms: Option<u64>) {
        let expires_at_ms = duration_ms.filter(|d| *d > 0).map(|d| self.clock.now_ms() + d);
        self.tables.write().bans.insert(node.clone(), expires_at_ms);
        info!(node = %node, expires_at_ms = ?expires_at_ms, "node_banned");
        if let Some(connection) = self.node_connection(node) {
            self.terminate_with_reason(connection, "banned");
        }
    }

    pub fn unban_node(&self, node: &NodeId) -> bool {
        let removed = self.tables.write().bans.remove(node).is_some();
        if removed {
            info!(node = %node, "node_unbanned");
        }
        removed
    }

    pub fn is_banned(&self, node: &NodeId) -> bool {
        let now_ms = self.clock.now_ms();
        let expired = {
            let tables = self.tables.read();
            match tables.bans.get(node) {
                None => return false,
                Some(None) => return true,
                Some(Some(expiry)) if now_ms < *expiry => return true,
                Some(Some(_)) => true,
            }
        };
        if expired {
            self.tables.write().bans.remove(node);
        }
        false
    }

    /* ── partitions ── */

    /// Install a logical cut around `members`. Messages between a member and
    /// the rest of the world (the control plane included) are dropped while
    /// the partition is active.
    pub fn create_partition(
        self: &Arc<Self>,
        members: Vec<NodeId>,
        duration_ms: Option<u64>,
    ) -> PartitionId {
        let id = PartitionId(self.next_partition.fetch_add(1, Ordering::Relaxed));
        let expires_at_ms = duration_ms.filter(|d| *d > 0).map(|d| self.clock.now_ms() + d);
        let partition = Partition {
            id,
            members: members.into_iter().collect(),
            expires_at_ms,
        };
        info!(partition = %id, members = partition.members.len(), "partition_created");
        self.tables.write().partitions.insert(id, partition);
        if let Some(duration) = duration_ms.filter(|d| *d > 0) {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(duration)).await;
                registry.remove_partition(id);
            });
        }
        id
    }

    /// Partition the nodes currently bound to the given connections.
    pub fn create_partition_for_connections(
        self: &Arc<Self>,
        connections: &[ConnectionId],
        duration_ms: Option<u64>,
    ) -> PartitionId {
        let members: Vec<NodeId> = {
            let tables = self.tables.read();
            connections
                .iter()
                .filter_map(|c| tables.connections.get(c))
                .flat_map(|e| e.nodes.iter().cloned())
                .collect()
        };
        self.create_partition(members, duration_ms)
    }

    pub fn remove_partition(&self, id: PartitionId) -> bool {
        let removed = self.tables.write().partitions.remove(&id).is_some();
        if removed {
            info!(partition = %id, "partition_removed");
        }
        removed
    }

    pub fn is_partitioned(&self, node: &NodeId) -> bool {
        let now_ms = self.clock.now_ms();
        let mut expired: Vec<PartitionId> = Vec::new();
        let active = {
            let tables = self.tables.read();
            let mut hit = false;
            for partition in tables.partitions.values() {
                if let Some(expiry) = partition.expires_at_ms
                    && now_ms >= expiry
                {
                    expired.push(partition.id);
                    continue;
                }
                if partition.members.contains(node) {
                    hit = true;
                }
            }
            hit
        };
        if !expired.is_empty() {
            let mut tables = self.tables.write();
            for id in expired {
                tables.partitions.remove(&id);
            }
        }
        active
    }

    pub fn active_partitions(&self) -> Vec<(PartitionId, Vec<NodeId>)> {
        let tables = self.tables.read();
        let mut list: Vec<(PartitionId, Vec<NodeId>)> = tables
            .partitions
            .values()
            .map(|p| {
                let mut members: Vec<NodeId> = p.members.iter().cloned().collect();
                members.sort();
                (p.id, members)
            })
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    /* ── shutdown ── */

    /// Send a shutdown frame to every peer, then close all channels.
    pub async fn shutdown_all(self: &Arc<Self>, reason: &str) {
        let frame = Envelope::new(
            crate::protocol::NODE_SHUTDOWN,
            &crate::protocol::NodeShutdownPayload { reason: reason.to_string() },
        )
        .expect("shutdown payload serializes");
        let ids: Vec<ConnectionId> = self.tables.read().connections.keys().copied().collect();
        for id in &ids {
            self.send_to_connection(*id, frame.clone());
        }
        // give send loops one scheduling round to drain the frame
        tokio::task::yield_now().await;
        for id in ids {
            self.terminate_with_reason(id, reason);
        }
    }

    /* ── loops ── */

    async fn send_loop(
        self: Arc<Self>,
        connection: ConnectionId,
        to_peer: mpsc::Sender<Envelope>,
        mut outbound: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = outbound.recv() => match msg {
                    None => break,
                    Some(envelope) => {
                        if to_peer.send(envelope).await.is_err() {
                            self.terminate_with_reason(connection, "peer_gone");
                            break;
                        }
                        metrics::MESSAGES_SENT.inc();
                    }
                },
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        connection: ConnectionId,
        mut from_peer: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = from_peer.recv() => match msg {
                    None => {
                        self.terminate_with_reason(connection, "peer_closed");
                        break;
                    }
                    Some(envelope) => self.handle_incoming(connection, envelope).await,
                },
            }
        }
    }

    async fn handle_incoming(self: &Arc<Self>, connection: ConnectionId, envelope: Envelope) {
        let node = {
            let mut tables = self.tables.write();
            let Some(entry) = tables.connections.get_mut(&connection) else {
                return;
            };
            entry.last_activity_ms = self.clock.now_ms();
            entry.nodes.first().cloned()
        };

        if let Some(n) = &node {
            if self.is_banned(n) {
                return;
            }
            if self.is_partitioned(n) {
                metrics::MESSAGES_DROPPED_PARTITION.inc();
                return;
            }
        }

        match self
            .interceptor
            .intercept_incoming(connection, node.as_ref(), &envelope.msg_type)
        {
            Decision::Drop => {}
            Decision::Delay(delay) => {
                let inbound_tx = self.inbound_tx.clone();
                let cancel = match self.tables.read().connections.get(&connection) {
                    Some(entry) => entry.cancel.clone(),
                    None => return,
                };
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            metrics::MESSAGES_RECEIVED.inc();
                            let _ = inbound_tx.send(Inbound { connection_id: connection, envelope }).await;
                        }
                    }
                });
            }
            Decision::Forward => {
                metrics::MESSAGES_RECEIVED.inc();
                let _ = self
                    .inbound_tx
                    .send(Inbound { connection_id: connection, envelope })
                    .await;
            }
        }
    }
}

fn ip_of(remote_addr: &str) -> String {
    remote_addr
        .rsplit_once(':')
        .map(|(ip, _)| ip.to_string())
        .unwrap_or_else(|| remote_addr.to_string())
}

/* ============================= TESTS ============================= */
