use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::Store;
use crate::types::{NodeId, NodeRecord, NodeStatus, TerminationReason};

/* ============================= EVENTS ============================= */

/// Liveness transitions consumed by the reconciler and the logs.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Online(NodeId),
    Suspect(NodeId),
    Offline(NodeId),
}

/* ============================= SERVICE ============================= */

/// Heartbeat bookkeeping and the ONLINE → SUSPECT → OFFLINE state machine.
///
/// The sole writer of liveness transitions; operator-driven states
/// (draining, maintenance) are set through `set_operator_status` and never
/// overridden by the sweep. Timers are one periodic sweep, so worst-case
/// OFFLINE detection latency is `lease_timeout + health_check_interval`.
pub struct NodeHealthService {
    store: Arc<dyn Store>,
    clock: Arc<Clock>,
    config: Config,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHealthService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<Clock>, config: Config) -> Arc<NodeHealthService> {
        let (events, _) = broadcast::channel(256);
        Arc::new(NodeHealthService { store, clock, config, events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Record an accepted heartbeat. Suspect and offline nodes return to
    /// online; draining and maintenance keep their operator-set state.
    pub async fn record_heartbeat(&self, node_id: &NodeId) -> Result<NodeRecord> {
        let node = self.store.record_heartbeat(node_id, self.clock.now_ms()).await?;
        metrics::HEARTBEATS_TOTAL.inc();

        if node.status.is_liveness_managed() && node.status != NodeStatus::Online {
            let was = node.status;
            let node = self.store.set_node_status(node_id, NodeStatus::Online).await?;
            info!(node = %node_id, from = ?was, "node_online");
            metrics::NODE_TRANSITIONS.with_label_values(&["online"]).inc();
            let _ = self.events.send(NodeEvent::Online(node_id.clone()));
            return Ok(node);
        }
        Ok(node)
    }

    /// One pass over all liveness-managed nodes. Called on every
    /// `health_check_interval` tick.
    pub async fn sweep(&self) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let heartbeat_timeout = self.config.heartbeat_timeout_ms;
        let lease_timeout = self.config.lease_timeout_ms;

        for node in self.store.list_nodes().await? {
            if !node.status.is_liveness_managed() {
                continue;
            }
            let Some(last) = node.last_heartbeat_ms else {
                continue;
            };
            let elapsed = now_ms.saturating_sub(last);

            if elapsed >= lease_timeout && node.status != NodeStatus::Offline {
                self.transition_offline(&node).await?;
            } else if elapsed >= heartbeat_timeout
                && elapsed < lease_timeout
                && node.status == NodeStatus::Online
            {
                self.store.set_node_status(&node.id, NodeStatus::Suspect).await?;
                warn!(node = %node.id, elapsed_ms = elapsed, "node_suspect");
                metrics::NODE_TRANSITIONS.with_label_values(&["suspect"]).inc();
                let _ = self.events.send(NodeEvent::Suspect(node.id.clone()));
            }
        }
        Ok(())
    }

    async fn transition_offline(&self, node: &NodeRecord) -> Result<()> {
        self.store.set_node_status(&node.id, NodeStatus::Offline).await?;
        let failed = self
            .store
            .mark_node_pods_failed(&node.id, TerminationReason::NodeLost)
            .await?;
        warn!(node = %node.id, pods_lost = failed.len(), "node_offline");
        metrics::NODE_TRANSITIONS.with_label_values(&["offline"]).inc();
        let _ = self.events.send(NodeEvent::Offline(node.id.clone()));
        Ok(())
    }

    /// Operator-driven transitions. Only online nodes can enter draining or
    /// maintenance; leaving them requires `reactivate`.
    pub async fn set_operator_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<()> {
        if !matches!(status, NodeStatus::Draining | NodeStatus::Maintenance) {
            return Err(Error::Validation(format!(
                "{status:?} is not an operator-settable status"
            )));
        }
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        if node.status != NodeStatus::Online {
            return Err(Error::Policy(format!(
                "node {node_id} is {:?}, not online",
                node.status
            )));
        }
        self.store.set_node_status(node_id, status).await?;
        info!(node = %node_id, status = ?status, "node_operator_status");
        Ok(())
    }

    /// Return an operator-parked node to liveness management.
    pub async fn reactivate(&self, node_id: &NodeId) -> Result<()> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        if !matches!(node.status, NodeStatus::Draining | NodeStatus::Maintenance) {
            return Err(Error::Policy(format!(
                "node {node_id} is {:?}, not operator-parked",
                node.status
            )));
        }
        self.store.set_node_status(node_id, NodeStatus::Online).await?;
        info!(node = %node_id, "node_reactivated");
        Ok(())
    }

    /// Periodic sweep loop; one task, ticks never overlap.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "health_sweep_failed");
                    }
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
