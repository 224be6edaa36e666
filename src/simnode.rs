use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::protocol::{
    self, Envelope, NodeHeartbeatPayload, NodeRegisterAck, NodeRegisterPayload, PodDeployPayload,
    PodStatusPayload, PodStopPayload,
};
use crate::registry::channel_pair;
use crate::types::{
    NodeId, PodId, PodStatus, ResourceVector, RuntimeKind, Taint, TerminationReason,
};

/* ============================= BEHAVIOUR ============================= */

/// What a simulated node does with a deployed pod.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PodBehavior {
    /// starting → running, stays up until stopped.
    Healthy,
    /// starting → running, then fails with the reason after the delay.
    CrashAfter { delay: Duration, reason: TerminationReason },
    /// reports failed without ever reaching running.
    FailToStart { reason: TerminationReason },
}

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone)]
pub struct SimNodeConfig {
    pub name: String,
    /// Reuse a prior identity on reconnect.
    pub node_id: Option<NodeId>,
    pub runtime_kind: RuntimeKind,
    pub runtime_version: Option<String>,
    pub allocatable: ResourceVector,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub remote_addr: String,
    pub heartbeat_interval: Duration,
    pub default_behavior: PodBehavior,
    /// Per-pack-version behaviour overrides, e.g. a crashing canary build.
    pub behavior_by_version: BTreeMap<String, PodBehavior>,
    /// Pod ids the node believes it is running before it ever receives a
    /// deploy; models state carried across a control-plane-visible restart.
    pub preloaded_pods: Vec<(PodId, u64)>,
}

impl SimNodeConfig {
    pub fn named(name: &str, heartbeat_interval: Duration) -> SimNodeConfig {
        SimNodeConfig {
            name: name.to_string(),
            node_id: Some(NodeId::from(name)),
            runtime_kind: RuntimeKind::Server,
            runtime_version: Some("2.0.0".to_string()),
            allocatable: ResourceVector::new(4000, 8192, 20, 2000),
            labels: BTreeMap::new(),
            taints: vec![],
            remote_addr: format!("10.1.0.1:{}", 42_000),
            heartbeat_interval,
            default_behavior: PodBehavior::Healthy,
            behavior_by_version: BTreeMap::new(),
            preloaded_pods: vec![],
        }
    }
}

/* ============================= STATE ============================= */

#[derive(Default)]
struct SimState {
    node_id: Option<NodeId>,
    /// (incarnation, was actually deployed here) per claimed pod.
    claimed: HashMap<PodId, (u64, bool)>,
    /// Every pod:stop payload received, in order.
    stops_received: Vec<PodStopPayload>,
    deploys_received: Vec<PodId>,
}

/// In-process synthetic node: registers over a duplex channel, heartbeats
/// on its interval, and answers deploys and stops the way the node runtime
/// would. The chaos tests drive the control plane entirely through these.
pub struct SimNode {
    state: Arc<Mutex<SimState>>,
    cancel: CancellationToken,
    config: SimNodeConfig,
}

impl SimNode {
    /// Connect, register, and wait for the identity ack.
    pub async fn connect(orchestrator: &Arc<Orchestrator>, config: SimNodeConfig) -> Result<SimNode> {
        let (channel, peer) = channel_pair(&config.remote_addr, 256);
        orchestrator.connect(channel)?;

        let state = Arc::new(Mutex::new(SimState {
            node_id: None,
            claimed: config
                .preloaded_pods
                .iter()
                .map(|(pod, incarnation)| (pod.clone(), (*incarnation, false)))
                .collect(),
            stops_received: Vec::new(),
            deploys_received: Vec::new(),
        }));
        let cancel = CancellationToken::new();

        let node = SimNode {
            state: state.clone(),
            cancel: cancel.clone(),
            config: config.clone(),
        };

        tokio::spawn(run_node(config, peer.to_control, peer.from_control, state, cancel));

        node.wait_registered().await?;
        Ok(node)
    }

    async fn wait_registered(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.state.lock().node_id.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("sim node registration".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.state
            .lock()
            .node_id
            .clone()
            .expect("connect waits for registration")
    }

    /// Pod ids the node currently claims in its heartbeats.
    pub fn claimed_pods(&self) -> Vec<PodId> {
        let mut pods: Vec<PodId> = self.state.lock().claimed.keys().cloned().collect();
        pods.sort();
        pods
    }

    pub fn deploys_received(&self) -> Vec<PodId> {
        self.state.lock().deploys_received.clone()
    }

    pub fn stops_received(&self) -> Vec<PodStopPayload> {
        self.state.lock().stops_received.clone()
    }

    pub fn stops_received_for(&self, pod: &PodId) -> usize {
        self.state
            .lock()
            .stops_received
            .iter()
            .filter(|s| s.pod_id == *pod)
            .count()
    }

    /// Drop the channel; the registry observes a peer close.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// The config to reconnect with the same identity and claimed pods.
    pub fn reconnect_config(&self) -> SimNodeConfig {
        let state = self.state.lock();
        let mut config = self.config.clone();
        config.node_id = state.node_id.clone();
        config.preloaded_pods = state
            .claimed
            .iter()
            .map(|(pod, (incarnation, _))| (pod.clone(), *incarnation))
            .collect();
        config
    }
}

/* ============================= NODE LOOP ============================= */

async fn run_node(
    config: SimNodeConfig,
    to_control: mpsc::Sender<Envelope>,
    mut from_control: mpsc::Receiver<Envelope>,
    state: Arc<Mutex<SimState>>,
    cancel: CancellationToken,
) {
    let register = NodeRegisterPayload {
        name: config.name.clone(),
        runtime_kind: config.runtime_kind,
        runtime_version: config.runtime_version.clone(),
        capabilities: vec![],
        allocatable: config.allocatable,
        labels: config.labels.clone(),
        annotations: BTreeMap::new(),
        taints: config.taints.clone(),
        node_id: config.node_id.clone(),
    };
    let envelope = Envelope::with_correlation(
        protocol::NODE_REGISTER,
        &register,
        &format!("register-{}", config.name),
    )
    .expect("register payload serializes");
    if to_control.send(envelope).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                let (node_id, active) = {
                    let state = state.lock();
                    (state.node_id.clone(), state.claimed.keys().cloned().collect::<Vec<_>>())
                };
                let Some(node_id) = node_id else { continue };
                let payload = NodeHeartbeatPayload {
                    node_id,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    allocated: ResourceVector::ZERO,
                    active_pod_ids: active,
                };
                let envelope = Envelope::new(protocol::NODE_HEARTBEAT, &payload)
                    .expect("heartbeat serializes");
                if to_control.send(envelope).await.is_err() {
                    break;
                }
            }
            msg = from_control.recv() => match msg {
                None => break,
                Some(envelope) => {
                    if !handle_control_message(&config, &to_control, &state, &cancel, envelope).await {
                        break;
                    }
                }
            },
        }
    }
}

async fn handle_control_message(
    config: &SimNodeConfig,
    to_control: &mpsc::Sender<Envelope>,
    state: &Arc<Mutex<SimState>>,
    cancel: &CancellationToken,
    envelope: Envelope,
) -> bool {
    match envelope.msg_type.as_str() {
        protocol::NODE_REGISTER => {
            match envelope.decode::<NodeRegisterAck>() {
                Ok(ack) if ack.success => {
                    state.lock().node_id = ack.node_id;
                }
                Ok(ack) => {
                    warn!(node = %config.name, message = ?ack.message, "sim_node_registration_refused");
                    return false;
                }
                Err(e) => warn!(error = %e, "sim_node_bad_register_ack"),
            }
            true
        }
        protocol::POD_DEPLOY => {
            let Ok(deploy) = envelope.decode::<PodDeployPayload>() else {
                return true;
            };
            {
                let mut state = state.lock();
                state.deploys_received.push(deploy.pod_id.clone());
                state
                    .claimed
                    .insert(deploy.pod_id.clone(), (deploy.incarnation, true));
            }
            let behavior = config
                .behavior_by_version
                .get(&deploy.pack.version)
                .copied()
                .unwrap_or(config.default_behavior);
            tokio::spawn(run_pod_lifecycle(
                deploy,
                behavior,
                to_control.clone(),
                state.clone(),
                cancel.clone(),
            ));
            true
        }
        protocol::POD_STOP => {
            let Ok(stop) = envelope.decode::<PodStopPayload>() else {
                return true;
            };
            let deployed_here = {
                let mut state = state.lock();
                state.stops_received.push(stop.clone());
                state
                    .claimed
                    .remove(&stop.pod_id)
                    .map(|(_, deployed)| deployed)
                    .unwrap_or(false)
            };
            // only pods this node actually ran get a terminal report; stale
            // ids are just dropped from the claim list
            if deployed_here {
                let report = PodStatusPayload {
                    pod_id: stop.pod_id.clone(),
                    incarnation: stop.incarnation,
                    status: PodStatus::Stopped,
                    status_message: None,
                    termination_reason: Some(stop.reason),
                };
                let envelope =
                    Envelope::new(protocol::POD_STATUS, &report).expect("status serializes");
                let _ = to_control.send(envelope).await;
            }
            true
        }
        protocol::NODE_SHUTDOWN => {
            debug!(node = %config.name, "sim_node_shutdown_frame");
            false
        }
        other => {
            debug!(msg_type = %other, "sim_node_ignored_message");
            true
        }
    }
}

async fn run_pod_lifecycle(
    deploy: PodDeployPayload,
    behavior: PodBehavior,
    to_control: mpsc::Sender<Envelope>,
    state: Arc<Mutex<SimState>>,
    cancel: CancellationToken,
) {
    let report = |status: PodStatus, reason: Option<TerminationReason>| {
        let payload = PodStatusPayload {
            pod_id: deploy.pod_id.clone(),
            incarnation: deploy.incarnation,
            status,
            status_message: None,
            termination_reason: reason,
        };
        Envelope::new(protocol::POD_STATUS, &payload).expect("status serializes")
    };

    let _ = to_control.send(report(PodStatus::Starting, None)).await;

    match behavior {
        PodBehavior::FailToStart { reason } => {
            let _ = to_control.send(report(PodStatus::Failed, Some(reason))).await;
            state.lock().claimed.remove(&deploy.pod_id);
        }
        PodBehavior::Healthy => {
            let _ = to_control.send(report(PodStatus::Running, None)).await;
        }
        PodBehavior::CrashAfter { delay, reason } => {
            let _ = to_control.send(report(PodStatus::Running, None)).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // a stop may have landed while the pod was running
                    let still_ours = state.lock().claimed.contains_key(&deploy.pod_id);
                    if still_ours {
                        let _ = to_control.send(report(PodStatus::Failed, Some(reason))).await;
                        state.lock().claimed.remove(&deploy.pod_id);
                    }
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
