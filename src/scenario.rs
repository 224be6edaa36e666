use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::chaos::{MessageRule, RuleDirection};
use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::simnode::{PodBehavior, SimNode, SimNodeConfig};
use crate::store::Store;
use crate::types::{
    NodeId, NodeStatus, PackId, PackMetadata, PackNamespace, PackRecord, PackVisibility, PodId,
    PodRecord, PodStatus, PodTemplate, ResourceVector, RuntimeTag, ServiceId, ServiceRecord,
    ServiceStatus, TerminationReason,
};

/* ============================= SCENARIO KINDS ============================= */

/// The closed set of chaos scenarios. Each kind carries its full recipe;
/// there are no free-form option records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Ban a node, watch the pod reschedule, verify unban does not reclaim.
    NodeBanReschedule,
    /// Ban briefly and unban before the heartbeat timeout; nothing moves.
    FastUnban,
    /// Delay heartbeats below the timeout; the node stays online.
    HeartbeatDelayBelowThreshold,
    /// Delay heartbeats past the lease; pod moves, stale claim is stopped.
    HeartbeatDelayAboveThreshold,
    /// Scale 3 → 1 and verify retirement semantics.
    ServiceScaleDown,
    /// Roll out a crash-looping version and watch the auto-rollback.
    CrashLoopRollback,
}

impl ScenarioKind {
    pub fn all() -> [ScenarioKind; 6] {
        [
            ScenarioKind::NodeBanReschedule,
            ScenarioKind::FastUnban,
            ScenarioKind::HeartbeatDelayBelowThreshold,
            ScenarioKind::HeartbeatDelayAboveThreshold,
            ScenarioKind::ServiceScaleDown,
            ScenarioKind::CrashLoopRollback,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::NodeBanReschedule => "node-ban-reschedule",
            ScenarioKind::FastUnban => "fast-unban",
            ScenarioKind::HeartbeatDelayBelowThreshold => "heartbeat-delay-below-threshold",
            ScenarioKind::HeartbeatDelayAboveThreshold => "heartbeat-delay-above-threshold",
            ScenarioKind::ServiceScaleDown => "service-scale-down",
            ScenarioKind::CrashLoopRollback => "crash-loop-rollback",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioKind::NodeBanReschedule => {
                "ban a node, pod reschedules elsewhere, unban does not reclaim it"
            }
            ScenarioKind::FastUnban => "ban and quickly unban; no liveness transition, no reschedule",
            ScenarioKind::HeartbeatDelayBelowThreshold => {
                "heartbeat delay under the timeout leaves the node online"
            }
            ScenarioKind::HeartbeatDelayAboveThreshold => {
                "heartbeat delay past the lease moves the pod and stops the stale one"
            }
            ScenarioKind::ServiceScaleDown => "scale down retires pods with scaled_down and no stragglers",
            ScenarioKind::CrashLoopRollback => {
                "crash-looping rollout rolls back to the last successful version"
            }
        }
    }

    pub fn by_name(name: &str) -> Option<ScenarioKind> {
        ScenarioKind::all().into_iter().find(|k| k.name() == name)
    }
}

/* ============================= OUTCOME ============================= */

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub description: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub passed: bool,
    pub steps: Vec<StepResult>,
}

struct Checker {
    steps: Vec<StepResult>,
}

impl Checker {
    fn new() -> Checker {
        Checker { steps: Vec::new() }
    }

    fn record(&mut self, description: &str, passed: bool, detail: Option<String>) {
        info!(step = %description, passed, "scenario_step");
        self.steps.push(StepResult {
            description: description.to_string(),
            passed,
            detail,
        });
    }

    fn finish(self, scenario: ScenarioKind) -> ScenarioOutcome {
        let passed = self.steps.iter().all(|s| s.passed);
        ScenarioOutcome {
            scenario: scenario.name().to_string(),
            passed,
            steps: self.steps,
        }
    }
}

/* ============================= POLLING ============================= */

async fn wait_until<F, Fut>(timeout: Duration, poll: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// The predicate must hold at every poll for the whole duration.
async fn holds_throughout<F, Fut>(duration: Duration, poll: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        if !predicate().await {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
    predicate().await
}

/* ============================= STORE PROBES ============================= */

async fn live_service_pods(orchestrator: &Orchestrator, service: &ServiceId) -> Vec<PodRecord> {
    orchestrator
        .store()
        .list_pods_for_service(service)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !p.status.is_terminal())
        .collect()
}

async fn running_on(
    orchestrator: &Orchestrator,
    service: &ServiceId,
    node: &NodeId,
) -> Vec<PodRecord> {
    live_service_pods(orchestrator, service)
        .await
        .into_iter()
        .filter(|p| p.status == PodStatus::Running && p.node_id.as_ref() == Some(node))
        .collect()
}

async fn node_status(orchestrator: &Orchestrator, node: &NodeId) -> Option<NodeStatus> {
    orchestrator
        .store()
        .get_node(node)
        .await
        .ok()
        .flatten()
        .map(|n| n.status)
}

/* ============================= RUNNER ============================= */

/// Boots a fresh control plane with simulated nodes per scenario and
/// asserts the documented convergence behaviour against it.
pub struct ScenarioRunner {
    config: Config,
}

impl ScenarioRunner {
    pub fn new(mut config: Config) -> ScenarioRunner {
        config.production_mode = false;
        config.chaos_enabled = true;
        config.pod_token_secret = None;
        if config.chaos_seed == 0 {
            config.chaos_seed = 1;
        }
        ScenarioRunner { config }
    }

    pub async fn run(&self, kind: ScenarioKind) -> Result<ScenarioOutcome> {
        info!(scenario = %kind.name(), seed = self.config.chaos_seed, "scenario_started");
        let outcome = match kind {
            ScenarioKind::NodeBanReschedule => self.node_ban_reschedule().await?,
            ScenarioKind::FastUnban => self.fast_unban().await?,
            ScenarioKind::HeartbeatDelayBelowThreshold => self.heartbeat_delay_below().await?,
            ScenarioKind::HeartbeatDelayAboveThreshold => self.heartbeat_delay_above().await?,
            ScenarioKind::ServiceScaleDown => self.service_scale_down().await?,
            ScenarioKind::CrashLoopRollback => self.crash_loop_rollback().await?,
        };
        info!(scenario = %kind.name(), passed = outcome.passed, "scenario_finished");
        Ok(outcome)
    }

    /* ── shared setup ── */

    async fn boot(&self) -> Result<Arc<Orchestrator>> {
        let orchestrator = Orchestrator::new(self.config.clone())?;
        orchestrator.start();
        Ok(orchestrator)
    }

    async fn register_pack(
        &self,
        orchestrator: &Arc<Orchestrator>,
        id: &str,
        version: &str,
    ) -> Result<()> {
        orchestrator
            .store()
            .register_pack(PackRecord {
                id: PackId::from(id),
                name: "pingpong".to_string(),
                version: version.to_string(),
                runtime_tag: RuntimeTag::Universal,
                namespace: PackNamespace::User,
                visibility: PackVisibility::Private,
                bundle_ref: format!("bundle://pingpong/{version}"),
                metadata: PackMetadata::default(),
                granted_capabilities: vec![],
                registered_at: orchestrator.clock().wall(),
            })
            .await
    }

    async fn create_service(
        &self,
        orchestrator: &Arc<Orchestrator>,
        replicas: u32,
    ) -> Result<ServiceId> {
        let id = ServiceId::from("svc-pingpong");
        orchestrator
            .store()
            .put_service(ServiceRecord {
                id: id.clone(),
                name: "pingpong".to_string(),
                pack_id: PackId::from("pack-v1"),
                pack_version: "1.0.0".to_string(),
                follow_latest: false,
                namespace: "user".to_string(),
                replicas,
                status: ServiceStatus::Active,
                template: PodTemplate {
                    resource_requests: ResourceVector::new(100, 128, 1, 0),
                    ..Default::default()
                },
                generation: 1,
                observed_generation: 0,
                ready_replicas: 0,
                available_replicas: 0,
                updated_replicas: 0,
                last_successful_version: None,
                failed_version: None,
                consecutive_failures: 0,
                failure_backoff_until_ms: None,
                status_message: None,
                created_at: orchestrator.clock().wall(),
            })
            .await?;
        Ok(id)
    }

    async fn connect_node(&self, orchestrator: &Arc<Orchestrator>, name: &str) -> Result<SimNode> {
        SimNode::connect(
            orchestrator,
            SimNodeConfig::named(name, self.config.heartbeat_interval()),
        )
        .await
    }

    fn poll(&self) -> Duration {
        Duration::from_millis((self.config.health_check_interval_ms / 10).max(10))
    }

    /// Generous settle window for one full control-loop round.
    fn settle(&self) -> Duration {
        self.config.reconcile_interval()
            + self.config.schedule_interval()
            + self.config.heartbeat_interval() * 2
            + self.config.health_check_interval()
    }

    async fn wait_running_on(
        &self,
        orchestrator: &Arc<Orchestrator>,
        service: &ServiceId,
        node: &NodeId,
        count: usize,
    ) -> bool {
        wait_until(self.settle() * 2, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            let node = node.clone();
            async move { running_on(&orchestrator, &service, &node).await.len() == count }
        })
        .await
    }

    async fn wait_node_status(
        &self,
        orchestrator: &Arc<Orchestrator>,
        node: &NodeId,
        timeout: Duration,
        want: NodeStatus,
    ) -> bool {
        wait_until(timeout, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let node = node.clone();
            async move { node_status(&orchestrator, &node).await == Some(want) }
        })
        .await
    }

    async fn holds_online(
        &self,
        orchestrator: &Arc<Orchestrator>,
        node: &NodeId,
        duration: Duration,
    ) -> bool {
        holds_throughout(duration, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let node = node.clone();
            async move { node_status(&orchestrator, &node).await == Some(NodeStatus::Online) }
        })
        .await
    }

    /* ── scenario 1: node ban, reschedule, unban does not reclaim ── */

    async fn node_ban_reschedule(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        let service = self.create_service(&orchestrator, 1).await?;

        let node_a = self.connect_node(&orchestrator, "node-a").await?;
        let _node_b = self.connect_node(&orchestrator, "node-b").await?;
        let a = node_a.node_id();
        let b = NodeId::from("node-b");

        let placed = self.wait_running_on(&orchestrator, &service, &a, 1).await;
        checker.record("initial pod runs on node-a", placed, None);
        let old_pod = running_on(&orchestrator, &service, &a)
            .await
            .first()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| PodId::from("missing"));

        orchestrator.registry().ban_node(&a, None);

        // not demoted before the heartbeat timeout
        let early = self
            .holds_online(&orchestrator, &a, self.config.heartbeat_timeout() / 2)
            .await;
        checker.record("node-a still online before the heartbeat timeout", early, None);

        let suspect_window =
            self.config.heartbeat_timeout() + self.config.health_check_interval() * 2;
        let suspect = wait_until(suspect_window, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let a = a.clone();
            async move {
                matches!(
                    node_status(&orchestrator, &a).await,
                    Some(NodeStatus::Suspect) | Some(NodeStatus::Offline)
                )
            }
        })
        .await;
        checker.record("node-a demoted to suspect", suspect, None);

        let offline_window = self.config.lease_timeout() + self.config.health_check_interval() * 2;
        let offline = self
            .wait_node_status(&orchestrator, &a, offline_window, NodeStatus::Offline)
            .await;
        checker.record("node-a offline after the lease timeout", offline, None);

        let replaced = self.wait_running_on(&orchestrator, &service, &b, 1).await;
        checker.record("replacement pod runs on node-b", replaced, None);

        // unban and reconnect with the stale claim
        orchestrator.registry().unban_node(&a);
        let reconnect = node_a.reconnect_config();
        let node_a = SimNode::connect(&orchestrator, reconnect).await?;

        let online_again = self
            .wait_node_status(&orchestrator, &a, self.settle(), NodeStatus::Online)
            .await;
        checker.record("node-a back online after unban", online_again, None);

        let node_ref = &node_a;
        let stale_stopped = wait_until(self.settle(), self.poll(), || {
            let old_pod = old_pod.clone();
            async move {
                node_ref.stops_received_for(&old_pod) >= 1 && node_ref.claimed_pods().is_empty()
            }
        })
        .await;
        checker.record("stale pod stop dispatched to node-a", stale_stopped, None);

        // let a few more heartbeats through: the stop must not repeat
        tokio::time::sleep(self.config.heartbeat_interval() * 3).await;
        let stops = node_a.stops_received_for(&old_pod);
        checker.record(
            "exactly one stop for the stale pod",
            stops == 1,
            Some(format!("stops={stops}")),
        );

        let steady = wait_until(self.settle(), self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            let b = b.clone();
            async move {
                let live = live_service_pods(&orchestrator, &service).await;
                live.len() == 1
                    && live[0].status == PodStatus::Running
                    && live[0].node_id.as_ref() == Some(&b)
            }
        })
        .await;
        checker.record("steady state: exactly one pod, on node-b", steady, None);

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::NodeBanReschedule))
    }

    /* ── scenario 2: fast unban, no rescheduling ── */

    async fn fast_unban(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        let service = self.create_service(&orchestrator, 1).await?;

        let node_a = self.connect_node(&orchestrator, "node-a").await?;
        let _node_b = self.connect_node(&orchestrator, "node-b").await?;
        let a = node_a.node_id();

        let placed = self.wait_running_on(&orchestrator, &service, &a, 1).await;
        checker.record("initial pod runs on node-a", placed, None);
        let pod = running_on(&orchestrator, &service, &a)
            .await
            .first()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| PodId::from("missing"));

        orchestrator.registry().ban_node(&a, None);
        tokio::time::sleep(self.config.heartbeat_timeout() / 2).await;
        orchestrator.registry().unban_node(&a);
        let node_a = SimNode::connect(&orchestrator, node_a.reconnect_config()).await?;

        let stayed_online = self
            .holds_online(&orchestrator, &a, self.config.heartbeat_timeout())
            .await;
        checker.record("node-a never left online", stayed_online, None);

        let live = live_service_pods(&orchestrator, &service).await;
        let unchanged = live.len() == 1 && live[0].id == pod && live[0].node_id.as_ref() == Some(&a);
        checker.record("pod count and placement unchanged", unchanged, None);

        checker.record("no pod stops dispatched", node_a.stops_received().is_empty(), None);

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::FastUnban))
    }

    /* ── scenario 3: heartbeat delay below the threshold ── */

    async fn heartbeat_delay_below(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        let service = self.create_service(&orchestrator, 1).await?;

        let node_a = self.connect_node(&orchestrator, "node-a").await?;
        let _node_b = self.connect_node(&orchestrator, "node-b").await?;
        let a = node_a.node_id();

        let placed = self.wait_running_on(&orchestrator, &service, &a, 1).await;
        checker.record("initial pod runs on node-a", placed, None);

        // delay under the timeout: 3/4 of it
        orchestrator.chaos().install_heartbeat_rule(MessageRule {
            id: "hb-delay-low".to_string(),
            direction: RuleDirection::Incoming,
            node_id: Some(a.clone()),
            connection_id: None,
            message_types: None,
            drop_rate: 0.0,
            delay_ms: Some(self.config.heartbeat_timeout_ms * 3 / 4),
            delay_jitter_ms: None,
            expires_at_ms: None,
        })?;

        let stayed_online = self
            .holds_online(&orchestrator, &a, self.config.lease_timeout())
            .await;
        checker.record("node-a online for the whole window", stayed_online, None);

        let pods_constant = running_on(&orchestrator, &service, &a).await.len() == 1;
        checker.record("running pod count constant", pods_constant, None);

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::HeartbeatDelayBelowThreshold))
    }

    /* ── scenario 4: heartbeat delay above the threshold ── */

    async fn heartbeat_delay_above(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        let service = self.create_service(&orchestrator, 1).await?;

        let node_a = self.connect_node(&orchestrator, "node-a").await?;
        let _node_b = self.connect_node(&orchestrator, "node-b").await?;
        let a = node_a.node_id();
        let b = NodeId::from("node-b");

        let placed = self.wait_running_on(&orchestrator, &service, &a, 1).await;
        checker.record("initial pod runs on node-a", placed, None);
        let old_pod = running_on(&orchestrator, &service, &a)
            .await
            .first()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| PodId::from("missing"));

        // delay past the lease: 1.25 × lease timeout
        orchestrator.chaos().install_heartbeat_rule(MessageRule {
            id: "hb-delay-high".to_string(),
            direction: RuleDirection::Incoming,
            node_id: Some(a.clone()),
            connection_id: None,
            message_types: None,
            drop_rate: 0.0,
            delay_ms: Some(self.config.lease_timeout_ms * 5 / 4),
            delay_jitter_ms: None,
            expires_at_ms: None,
        })?;

        let offline_window = self.config.lease_timeout() + self.config.health_check_interval() * 2;
        let offline = self
            .wait_node_status(&orchestrator, &a, offline_window, NodeStatus::Offline)
            .await;
        checker.record("node-a goes suspect then offline", offline, None);

        let replaced = self.wait_running_on(&orchestrator, &service, &b, 1).await;
        checker.record("pod moved to node-b", replaced, None);

        orchestrator.chaos().remove_heartbeat_rule("hb-delay-high");

        let recovered = self
            .wait_node_status(&orchestrator, &a, self.config.lease_timeout() * 2, NodeStatus::Online)
            .await;
        checker.record("node-a returns to online", recovered, None);

        let node_ref = &node_a;
        let stale_stopped = wait_until(self.config.lease_timeout() * 2, self.poll(), || {
            let old_pod = old_pod.clone();
            async move {
                node_ref.stops_received_for(&old_pod) >= 1
                    && !node_ref.claimed_pods().contains(&old_pod)
            }
        })
        .await;
        checker.record("stale pod claim stopped", stale_stopped, None);

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::HeartbeatDelayAboveThreshold))
    }

    /* ── scenario 5: service scale down ── */

    async fn service_scale_down(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        let service = self.create_service(&orchestrator, 3).await?;

        let _node_a = self.connect_node(&orchestrator, "node-a").await?;
        let _node_b = self.connect_node(&orchestrator, "node-b").await?;

        let all_running = wait_until(self.settle() * 2, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            async move {
                live_service_pods(&orchestrator, &service)
                    .await
                    .iter()
                    .filter(|p| p.status == PodStatus::Running)
                    .count()
                    == 3
            }
        })
        .await;
        checker.record("three pods running across two nodes", all_running, None);

        let mut svc = orchestrator
            .store()
            .get_service(&service)
            .await?
            .expect("service exists");
        svc.replicas = 1;
        svc.generation += 1;
        orchestrator.store().put_service(svc).await?;

        let window = self.config.reconcile_interval() + self.config.grace_period() + self.settle();
        let converged = wait_until(window, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            async move {
                let pods = orchestrator
                    .store()
                    .list_pods_for_service(&service)
                    .await
                    .unwrap_or_default();
                let running = pods.iter().filter(|p| p.status == PodStatus::Running).count();
                let stopping = pods.iter().filter(|p| p.status == PodStatus::Stopping).count();
                let stopped = pods
                    .iter()
                    .filter(|p| {
                        p.status == PodStatus::Stopped
                            && p.termination_reason == Some(TerminationReason::ScaledDown)
                    })
                    .count();
                running == 1 && stopping == 0 && stopped == 2
            }
        })
        .await;
        checker.record(
            "exactly one running pod; two stopped with scaled_down; none lingering",
            converged,
            None,
        );

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::ServiceScaleDown))
    }

    /* ── scenario 6: crash-looping rollout auto-rollback ── */

    async fn crash_loop_rollback(&self) -> Result<ScenarioOutcome> {
        let mut checker = Checker::new();
        let orchestrator = self.boot().await?;
        self.register_pack(&orchestrator, "pack-v1", "1.0.0").await?;
        self.register_pack(&orchestrator, "pack-v2", "1.1.0").await?;
        let service = self.create_service(&orchestrator, 1).await?;

        let mut node_config = SimNodeConfig::named("node-a", self.config.heartbeat_interval());
        node_config.behavior_by_version.insert(
            "1.1.0".to_string(),
            PodBehavior::CrashAfter {
                delay: self.config.reconcile_interval(),
                reason: TerminationReason::Error,
            },
        );
        let _node_a = SimNode::connect(&orchestrator, node_config).await?;

        // v1.0.0 must be recorded as the last successful version first
        let success_window = self.config.stability_window() + self.settle() * 2;
        let v1_successful = wait_until(success_window, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            async move {
                orchestrator
                    .store()
                    .get_service(&service)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|s| s.last_successful_version.as_deref() == Some("1.0.0"))
            }
        })
        .await;
        checker.record("v1.0.0 rollout recorded successful", v1_successful, None);

        let mut svc = orchestrator
            .store()
            .get_service(&service)
            .await?
            .expect("service exists");
        svc.pack_id = PackId::from("pack-v2");
        svc.pack_version = "1.1.0".to_string();
        svc.generation += 1;
        orchestrator.store().put_service(svc).await?;

        // three crash rounds with exponential backoff in between
        let rollback_window = self.config.stability_window() * 10;
        let rolled_back = wait_until(rollback_window, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            async move {
                orchestrator
                    .store()
                    .get_service(&service)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|s| {
                        s.failed_version.as_deref() == Some("1.1.0")
                            && s.pack_version == "1.0.0"
                            && s.failure_backoff_until_ms.is_some()
                    })
            }
        })
        .await;
        checker.record("failed version recorded and pack version reverted", rolled_back, None);

        let stabilised = wait_until(self.settle() * 2, self.poll(), || {
            let orchestrator = orchestrator.clone();
            let service = service.clone();
            async move {
                let live = live_service_pods(&orchestrator, &service).await;
                live.len() == 1
                    && live[0].pack_version == "1.0.0"
                    && live[0].status == PodStatus::Running
            }
        })
        .await;
        checker.record("v1.0.0 pod stabilises after rollback", stabilised, None);

        orchestrator.shutdown().await;
        Ok(checker.finish(ScenarioKind::CrashLoopRollback))
    }
}

/* ============================= TESTS ============================= */
