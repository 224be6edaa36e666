use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chaos::ChaosEngine;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::NodeHealthService;
use crate::protocol::{
    self, Envelope, Inbound, NodeHeartbeatPayload, NodeRegisterAck, NodeRegisterPayload, PackRef,
    PodDeployPayload, PodStatusPayload, PodStopPayload,
};
use crate::reconciler::{ReconcileCommand, ServiceReconciler};
use crate::registry::{Channel, ConnectionRegistry};
use crate::scheduler::{ScheduleEvent, SchedulerCore};
use crate::store::{MemoryStore, Store};
use crate::token::PodTokenIssuer;
use crate::types::{
    ConnectionId, NODE_IDENTITY_LABEL, NodeId, NodeRecord, NodeStatus, PodId, ResourceVector,
    TerminationReason,
};

/* ============================= ORCHESTRATOR ============================= */

/// Owns the singletons, wires cross-component events, and drives the
/// start/stop lifecycle. There is no process-global mutable state beyond a
/// configured instance of this type.
pub struct Orchestrator {
    config: Config,
    clock: Arc<Clock>,
    store: Arc<dyn Store>,
    chaos: Arc<ChaosEngine>,
    registry: Arc<ConnectionRegistry>,
    health: Arc<NodeHealthService>,
    scheduler: Arc<SchedulerCore>,
    reconciler: Arc<ServiceReconciler>,
    tokens: PodTokenIssuer,
    cancel: CancellationToken,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    loops_started: AtomicBool,
    schedule_events: Mutex<Option<mpsc::UnboundedReceiver<ScheduleEvent>>>,
    reconcile_commands: Mutex<Option<mpsc::UnboundedReceiver<ReconcileCommand>>>,
}

impl Orchestrator {
    /// Build the control plane against the in-memory store.
    pub fn new(config: Config) -> Result<Arc<Orchestrator>> {
        let clock = Clock::new();
        let store = MemoryStore::new(clock.clone());
        Self::with_store(config, store, clock)
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn Store>,
        clock: Arc<Clock>,
    ) -> Result<Arc<Orchestrator>> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let chaos = ChaosEngine::new(config.chaos_seed, config.production_mode, clock.clone());
        if config.chaos_permitted() {
            chaos.enable()?;
        }
        // the registry keeps its own root token so shutdown frames can still
        // drain after the control loops are cancelled
        let registry = ConnectionRegistry::new(
            config.clone(),
            clock.clone(),
            chaos.clone(),
            CancellationToken::new(),
        );
        let health = NodeHealthService::new(store.clone(), clock.clone(), config.clone());
        let (scheduler, schedule_events) =
            SchedulerCore::new(store.clone(), chaos.clone(), clock.clone(), config.clone());
        let (reconciler, reconcile_commands) =
            ServiceReconciler::new(store.clone(), chaos.clone(), clock.clone(), config.clone());
        let tokens = PodTokenIssuer::new(config.pod_token_secret.as_deref());

        Ok(Arc::new(Orchestrator {
            config,
            clock,
            store,
            chaos,
            registry,
            health,
            scheduler,
            reconciler,
            tokens,
            cancel,
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            loops_started: AtomicBool::new(false),
            schedule_events: Mutex::new(Some(schedule_events)),
            reconcile_commands: Mutex::new(Some(reconcile_commands)),
        }))
    }

    /* ── accessors for the admin surface and the harness ── */

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn chaos(&self) -> Arc<ChaosEngine> {
        self.chaos.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn health(&self) -> Arc<NodeHealthService> {
        self.health.clone()
    }

    pub fn scheduler(&self) -> Arc<SchedulerCore> {
        self.scheduler.clone()
    }

    pub fn reconciler(&self) -> Arc<ServiceReconciler> {
        self.reconciler.clone()
    }

    /* ── lifecycle ── */

    /// Spawn the dispatch tasks and the three periodic loops.
    pub fn start(self: &Arc<Self>) {
        if self.loops_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            schedule_interval_ms = self.config.schedule_interval_ms,
            reconcile_interval_ms = self.config.reconcile_interval_ms,
            health_check_interval_ms = self.config.health_check_interval_ms,
            "orchestrator_started"
        );
        let mut tasks = self.tasks.lock();

        let inbound = self.registry.take_inbound().expect("inbound pipe taken once");
        let this = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            this.dispatch_inbound(inbound, cancel).await;
        }));

        let schedule_events = self
            .schedule_events
            .lock()
            .take()
            .expect("schedule events taken once");
        let this = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            this.dispatch_schedule_events(schedule_events, cancel).await;
        }));

        let commands = self
            .reconcile_commands
            .lock()
            .take()
            .expect("reconcile commands taken once");
        let this = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            this.dispatch_reconcile_commands(commands, cancel).await;
        }));

        tasks.push(tokio::spawn(
            self.health.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.scheduler.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.reconciler.clone().run(self.cancel.child_token()),
        ));
    }

    /// Orderly stop: refuse new connections, let in-flight ticks finish,
    /// close every channel with a shutdown frame, flush the chaos rules.
    pub async fn shutdown(&self) {
        info!("orchestrator_stopping");
        self.accepting.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let _ = futures::future::join_all(tasks).await;
        self.registry.shutdown_all("shutdown").await;
        self.chaos.flush();
        info!("orchestrator_stopped");
    }

    /// Admission gate for new node channels.
    pub fn connect(&self, channel: Channel) -> Result<ConnectionId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Policy("control plane is shutting down".to_string()));
        }
        self.registry.admit(channel)
    }

    /* ── inbound dispatch ── */

    async fn dispatch_inbound(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbound.recv() => match msg {
                    None => break,
                    Some(Inbound { connection_id, envelope }) => {
                        if let Err(e) = self.handle_message(connection_id, envelope).await {
                            if !e.is_conflict() {
                                warn!(error = %e, "inbound_message_failed");
                            }
                        }
                    }
                },
            }
        }
    }

    async fn handle_message(&self, connection: ConnectionId, envelope: Envelope) -> Result<()> {
        match envelope.msg_type.as_str() {
            protocol::NODE_REGISTER => self.handle_register(connection, &envelope).await,
            protocol::NODE_HEARTBEAT => self.handle_heartbeat(&envelope).await,
            protocol::POD_STATUS => self.handle_pod_status(&envelope).await,
            other => {
                debug!(msg_type = %other, "unknown_message_type_ignored");
                Ok(())
            }
        }
    }

    async fn handle_register(&self, connection: ConnectionId, envelope: &Envelope) -> Result<()> {
        let payload: NodeRegisterPayload = envelope.decode()?;
        let node_id = payload.node_id.clone().unwrap_or_else(NodeId::generate);

        if let Err(e) = self.registry.bind_node(connection, &node_id) {
            let ack = NodeRegisterAck {
                success: false,
                node_id: None,
                message: Some(e.to_string()),
            };
            self.reply(connection, envelope, protocol::NODE_REGISTER, &ack)?;
            // let the send loop drain the refusal before the channel drops
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            self.registry.terminate_connection(connection);
            return Err(e);
        }

        let mut labels = payload.labels.clone();
        labels.insert(NODE_IDENTITY_LABEL.to_string(), node_id.to_string());

        let existing = self.store.get_node(&node_id).await?;
        let node = NodeRecord {
            id: node_id.clone(),
            name: payload.name.clone(),
            runtime_kind: payload.runtime_kind,
            status: NodeStatus::Online,
            last_heartbeat_ms: Some(self.clock.now_ms()),
            connection_id: Some(connection),
            allocatable: payload.allocatable,
            // placement accounting survives a reconnect
            allocated: existing.as_ref().map(|n| n.allocated).unwrap_or(ResourceVector::ZERO),
            labels,
            annotations: payload.annotations.clone(),
            taints: payload.taints.clone(),
            unschedulable: existing.as_ref().map(|n| n.unschedulable).unwrap_or(false),
            capabilities: payload.capabilities.clone(),
            runtime_version: payload.runtime_version.clone(),
            registered_at: existing
                .as_ref()
                .map(|n| n.registered_at)
                .unwrap_or_else(|| self.clock.wall()),
        };
        self.store.put_node(node).await?;

        info!(node = %node_id, name = %payload.name, connection = %connection, "node_registered");
        let ack = NodeRegisterAck {
            success: true,
            node_id: Some(node_id),
            message: None,
        };
        self.reply(connection, envelope, protocol::NODE_REGISTER, &ack)
    }

    async fn handle_heartbeat(&self, envelope: &Envelope) -> Result<()> {
        let payload: NodeHeartbeatPayload = envelope.decode()?;
        if self.store.get_node(&payload.node_id).await?.is_none() {
            debug!(node = %payload.node_id, "heartbeat_from_unknown_node");
            return Ok(());
        }
        self.health.record_heartbeat(&payload.node_id).await?;
        // stale cleanup runs against every claimed pod id before the node's
        // next heartbeat is handled
        self.reconciler
            .handle_node_report(&payload.node_id, &payload.active_pod_ids)
            .await?;
        Ok(())
    }

    async fn handle_pod_status(&self, envelope: &Envelope) -> Result<()> {
        let payload: PodStatusPayload = envelope.decode()?;
        match self
            .store
            .update_pod_status(
                &payload.pod_id,
                payload.incarnation,
                payload.status,
                payload.status_message.clone(),
                payload.termination_reason,
            )
            .await
        {
            Ok(pod) => {
                debug!(pod = %payload.pod_id, status = ?pod.status, "pod_status_applied");
                Ok(())
            }
            Err(Error::StaleIncarnation { pod, reported, current }) => {
                // stale reports never mutate state; liveness was already
                // credited on the receive path
                debug!(pod = %pod, reported, current, "stale_pod_report_ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reply<T: serde::Serialize>(
        &self,
        connection: ConnectionId,
        request: &Envelope,
        msg_type: &str,
        payload: &T,
    ) -> Result<()> {
        let reply = match &request.correlation_id {
            Some(correlation) => Envelope::with_correlation(msg_type, payload, correlation)?,
            None => Envelope::new(msg_type, payload)?,
        };
        self.registry.send_to_connection(connection, reply);
        Ok(())
    }

    /* ── outbound dispatch ── */

    async fn dispatch_schedule_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ScheduleEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(ScheduleEvent::Scheduled { pod, node }) => {
                        if let Err(e) = self.dispatch_deploy(&pod, &node).await {
                            warn!(pod = %pod, node = %node, error = %e, "pod_deploy_dispatch_failed");
                        }
                    }
                    Some(ScheduleEvent::Preempted { victim, node, incarnation }) => {
                        self.send_pod_stop(&node, &victim, incarnation, TerminationReason::Preempted);
                    }
                },
            }
        }
    }

    async fn dispatch_deploy(&self, pod_id: &PodId, node: &NodeId) -> Result<()> {
        let pod = self
            .store
            .get_pod(pod_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
        let pack = self
            .store
            .get_pack(&pod.pack_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pack {}", pod.pack_id)))?;

        let payload = PodDeployPayload {
            pod_id: pod.id.clone(),
            node_id: node.clone(),
            pack: PackRef {
                id: pack.id.clone(),
                version: pack.version.clone(),
                runtime_tag: pack.runtime_tag,
                bundle_ref: pack.bundle_ref.clone(),
                metadata: pack.metadata.clone(),
            },
            resources: pod.resource_requests,
            namespace: pod.namespace.clone(),
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            granted_capabilities: pod.granted_capabilities.clone(),
            incarnation: pod.incarnation,
            pod_token: Some(self.tokens.issue(&pod.id, pod.incarnation)),
        };
        let envelope = Envelope::new(protocol::POD_DEPLOY, &payload)?;
        if !self.registry.send_to_node(node, envelope) {
            // the node flapped between claim and dispatch; health will fail
            // the pod and the reconciler will replace it
            warn!(pod = %pod_id, node = %node, "pod_deploy_undeliverable");
        }
        Ok(())
    }

    async fn dispatch_reconcile_commands(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<ReconcileCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    None => break,
                    Some(ReconcileCommand::StopPod { pod, node, incarnation, reason }) => {
                        self.send_pod_stop(&node, &pod, incarnation, reason);
                    }
                    Some(ReconcileCommand::StopStalePod { node, pod }) => {
                        // the control plane holds no record for a stale pod;
                        // incarnation 0 tells the node the stop is unconditional
                        self.send_pod_stop(&node, &pod, 0, TerminationReason::Unknown);
                    }
                },
            }
        }
    }

    fn send_pod_stop(
        &self,
        node: &NodeId,
        pod: &PodId,
        incarnation: u64,
        reason: TerminationReason,
    ) {
        let payload = PodStopPayload {
            pod_id: pod.clone(),
            incarnation,
            grace_period_ms: self.config.grace_period_ms,
            reason,
        };
        match Envelope::new(protocol::POD_STOP, &payload) {
            Ok(envelope) => {
                if !self.registry.send_to_node(node, envelope) {
                    debug!(pod = %pod, node = %node, "pod_stop_undeliverable");
                }
            }
            Err(e) => warn!(error = %e, "pod_stop_encode_failed"),
        }
    }
}

/* ============================= TESTS ============================= */
