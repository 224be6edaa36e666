use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use semver::Version;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chaos::ChaosEngine;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::scheduler::feasible_ignoring_resources;
use crate::store::{ServiceStatusPatch, Store, StoreEvent, guarded_call};
use crate::types::{
    NODE_IDENTITY_LABEL, NodeId, NodeRecord, PackRecord, PodId, PodRecord, PodStatus,
    ServiceRecord, ServiceStatus, TerminationReason,
};

/* ============================= COMMANDS ============================= */

/// Wire-side effects the orchestrator executes on the reconciler's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileCommand {
    /// Ask the node to terminate a pod the control plane owns.
    StopPod {
        pod: PodId,
        node: NodeId,
        incarnation: u64,
        reason: TerminationReason,
    },
    /// One-shot stop for a pod id a node reported but the control plane no
    /// longer owns. No store state is touched for it.
    StopStalePod { node: NodeId, pod: PodId },
}

/* ============================= RECONCILER ============================= */

/// Desired-vs-actual convergence loop per service: replica and DaemonSet
/// quantity, version rollout with crash-loop rollback, retirement, and
/// stale-pod cleanup after node flaps.
pub struct ServiceReconciler {
    store: Arc<dyn Store>,
    chaos: Arc<ChaosEngine>,
    clock: Arc<Clock>,
    config: Config,
    commands: mpsc::UnboundedSender<ReconcileCommand>,
    running: AtomicBool,
}

impl ServiceReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        chaos: Arc<ChaosEngine>,
        clock: Arc<Clock>,
        config: Config,
    ) -> (Arc<ServiceReconciler>, mpsc::UnboundedReceiver<ReconcileCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ServiceReconciler {
                store,
                chaos,
                clock,
                config,
                commands,
                running: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// One pass over every service. Overlapping ticks skip and count.
    pub async fn tick(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            metrics::RECONCILE_SKIPS.inc();
            return Ok(());
        }
        metrics::RECONCILE_TICKS.inc();
        let _timer = metrics::RECONCILE_DURATION.start_timer();
        let result =
            tokio::time::timeout(self.config.reconciler_tick_timeout(), self.tick_inner()).await;
        self.running.store(false, Ordering::SeqCst);
        match result {
            Ok(r) => r,
            Err(_) => {
                warn!("reconciler_tick_deadline_exceeded");
                Ok(())
            }
        }
    }

    async fn tick_inner(&self) -> Result<()> {
        self.chaos.maybe_fail_api_call().await?;
        let store_timeout = self.config.store_call_timeout();
        let services = guarded_call(store_timeout, || self.store.list_services()).await?;
        for service in services {
            // an error in one service's pass never aborts the others
            if let Err(e) = self.reconcile_service(service).await {
                if !e.is_conflict() {
                    warn!(error = %e, "service_reconcile_failed");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_service(&self, mut service: ServiceRecord) -> Result<()> {
        match service.status {
            ServiceStatus::Paused => return Ok(()),
            ServiceStatus::Deleting => return self.teardown(&service).await,
            ServiceStatus::Active | ServiceStatus::Scaling => {}
        }

        let now_ms = self.clock.now_ms();
        let expected_generation = service.observed_generation;
        let mut patch = ServiceStatusPatch::default();
        let mut status_message: Option<String> = None;

        self.promote_stopped(&service).await?;

        let pods = self.store.list_pods_for_service(&service.id).await?;
        let pack = self.store.get_pack(&service.pack_id).await?;

        // stable running pods shed their crash-loop history
        for pod in &pods {
            if pod.status == PodStatus::Running
                && pod.crash_loop_count > 0
                && let Some(since) = pod.running_since_ms
                && now_ms.saturating_sub(since) >= self.config.stability_window_ms
            {
                self.store.set_pod_crash_loop(&pod.id, 0, None).await?;
            }
        }

        // application failures of the current target version; the persisted
        // counter saturates at the same bound the backoff exponent does
        let failed_current: Vec<&PodRecord> = pods
            .iter()
            .filter(|p| {
                p.status == PodStatus::Failed
                    && p.pack_version == service.pack_version
                    && p.termination_reason
                        .is_some_and(|r| r.counts_toward_crash_loop())
            })
            .collect();
        let mut consecutive_failures = (service.consecutive_failures
            + failed_current.len() as u32)
            .min(Config::BACKOFF_EXPONENT_CAP);

        // the threshold fires on the tick that brings fresh failures, so a
        // marked version is not re-marked every pass
        let threshold_tripped =
            !failed_current.is_empty() && consecutive_failures >= self.config.fail_threshold;

        if threshold_tripped {
            // failedVersion and the backoff are recorded regardless of
            // whether a revert target exists
            let failed_version = service.pack_version.clone();
            let backoff = self.config.backoff_for(consecutive_failures);
            let backoff_until = now_ms + backoff.as_millis() as u64;
            service.failed_version = Some(failed_version.clone());
            service.failure_backoff_until_ms = Some(backoff_until);
            patch.failed_version = Some(Some(failed_version.clone()));
            patch.failure_backoff_until_ms = Some(Some(backoff_until));

            let revert_to = service
                .last_successful_version
                .clone()
                .filter(|v| *v != failed_version);
            match revert_to {
                Some(revert_to) => {
                    warn!(
                        service = %service.id,
                        failed_version = %failed_version,
                        revert_to = %revert_to,
                        consecutive_failures,
                        "rollout_rolled_back"
                    );
                    metrics::ROLLBACKS_TOTAL.inc();

                    // retire every remaining pod of the abandoned version
                    for pod in pods.iter().filter(|p| {
                        p.pack_version == failed_version && !p.status.is_terminal()
                    }) {
                        self.retire_pod(pod, TerminationReason::RollingUpdate).await?;
                    }

                    if let Some(new_pack) = self
                        .resolve_pack_id(&service, &revert_to, pack.as_ref())
                        .await?
                    {
                        service.pack_id = new_pack;
                    }
                    service.pack_version = revert_to.clone();
                    patch.pack_id = Some(service.pack_id.clone());
                    patch.pack_version = Some(revert_to);
                    status_message = Some(format!(
                        "rolled back from {failed_version} after {consecutive_failures} failures"
                    ));
                }
                None => {
                    // nothing to revert to: hold the retry of the same
                    // version behind the service backoff
                    warn!(
                        service = %service.id,
                        failed_version = %failed_version,
                        consecutive_failures,
                        "rollout_failed_no_fallback"
                    );
                    for pod in &failed_current {
                        let count = pod.crash_loop_count + 1;
                        self.store
                            .reset_pod_for_reschedule(&pod.id, count, Some(backoff_until))
                            .await?;
                    }
                    status_message = Some(format!(
                        "version {failed_version} failing with no fallback; retrying after backoff"
                    ));
                }
            }
        } else {
            // resurrect crash-looping pods on the same record so the
            // scheduler backoff has a stable subject
            for pod in &failed_current {
                let count = pod.crash_loop_count + 1;
                let backoff = self.config.backoff_for(count);
                let until = now_ms + backoff.as_millis() as u64;
                debug!(pod = %pod.id, count, backoff_ms = backoff.as_millis() as u64, "pod_crash_loop_resurrected");
                self.store
                    .reset_pod_for_reschedule(&pod.id, count, Some(until))
                    .await?;
            }
        }

        // follow the newest registered version, skipping the failed one
        if service.follow_latest
            && !threshold_tripped
            && let Some(pack_ref) = pack.as_ref()
            && let Some(newest) = self.newest_adoptable(pack_ref, &service).await?
            && newest.version != service.pack_version
        {
            info!(service = %service.id, from = %service.pack_version, to = %newest.version, "service_version_adopted");
            service.pack_version = newest.version.clone();
            service.pack_id = newest.id.clone();
            patch.pack_version = Some(newest.version.clone());
            patch.pack_id = Some(newest.id.clone());
        }

        // refreshed view after resurrections / retirements
        let pods = self.store.list_pods_for_service(&service.id).await?;
        let nodes = self.store.list_nodes().await?;
        let eligible = self.eligible_nodes(&service, pack.as_ref(), &nodes);
        let desired = if service.is_daemon_set() {
            eligible.len()
        } else {
            service.replicas as usize
        };

        let active: Vec<&PodRecord> =
            pods.iter().filter(|p| !p.status.is_terminal()).collect();
        let active_settled: Vec<&PodRecord> = active
            .iter()
            .copied()
            .filter(|p| p.status != PodStatus::Stopping)
            .collect();
        let old_active: Vec<&PodRecord> = active_settled
            .iter()
            .copied()
            .filter(|p| p.pack_version != service.pack_version)
            .collect();
        let new_active: Vec<&PodRecord> = active_settled
            .iter()
            .copied()
            .filter(|p| p.pack_version == service.pack_version)
            .collect();
        let stable_new = new_active
            .iter()
            .filter(|p| self.is_stable(p, now_ms))
            .count();

        if old_active.is_empty() {
            // steady state or finished rollout: plain quantity reconcile
            let current = active_settled.len();
            if current < desired {
                let deficit = desired - current;
                self.create_pods(&service, deficit, &eligible, &active_settled)
                    .await?;
            } else if current > desired {
                let excess = current - desired;
                self.retire_excess(&service, &active_settled, &eligible, excess)
                    .await?;
            }

            // a settled rollout marks the version successful and sheds any
            // failure bookkeeping it accumulated on the way
            if desired > 0 && stable_new >= desired {
                consecutive_failures = 0;
                if service.last_successful_version.as_deref()
                    != Some(service.pack_version.as_str())
                {
                    info!(service = %service.id, version = %service.pack_version, "rollout_succeeded");
                    patch.last_successful_version = Some(Some(service.pack_version.clone()));
                }
                if service.failed_version.as_deref() == Some(service.pack_version.as_str()) {
                    patch.failed_version = Some(None);
                    patch.failure_backoff_until_ms = Some(None);
                }
            }
        } else {
            // rollout in flight: surge one replacement batch, drain the old
            // version one stable replacement at a time
            let in_flight = new_active.len() - stable_new;
            let mut creations = 0usize;
            while new_active.len() + creations < desired
                && in_flight + creations < self.config.rollout_batch_size
            {
                creations += 1;
            }
            if creations > 0 {
                self.create_pods(&service, creations, &eligible, &active_settled)
                    .await?;
            }

            let freed_slots = desired.saturating_sub(old_active.len());
            let drainable = stable_new
                .saturating_sub(freed_slots)
                .min(self.config.rollout_batch_size)
                .min(old_active.len());
            if drainable > 0 {
                let mut victims = old_active.clone();
                victims.sort_by(retirement_preference);
                for victim in victims.into_iter().take(drainable) {
                    info!(service = %service.id, pod = %victim.id, "rollout_draining_old_version");
                    self.retire_pod(victim, TerminationReason::RollingUpdate).await?;
                }
            }
            status_message = Some(format!(
                "rolling out {}: {}/{} replacements stable",
                service.pack_version, stable_new, desired
            ));
        }

        // counters
        let pods = self.store.list_pods_for_service(&service.id).await?;
        let ready = pods
            .iter()
            .filter(|p| p.status == PodStatus::Running && p.pack_version == service.pack_version)
            .count() as u32;
        let available = pods
            .iter()
            .filter(|p| {
                p.status == PodStatus::Running
                    && p.pack_version == service.pack_version
                    && self.is_stable(p, now_ms)
            })
            .count() as u32;
        let updated = pods
            .iter()
            .filter(|p| !p.status.is_terminal() && p.pack_version == service.pack_version)
            .count() as u32;

        patch.observed_generation = Some(service.generation);
        patch.ready_replicas = Some(ready);
        patch.available_replicas = Some(available);
        patch.updated_replicas = Some(updated);
        patch.consecutive_failures = Some(consecutive_failures);
        patch.status_message = Some(status_message);

        if patch_changes_anything(&service, &patch, expected_generation) {
            self.store
                .update_service_status(&service.id, expected_generation, patch)
                .await?;
        }
        Ok(())
    }

    /* ── helpers ── */

    /// Pods past their stop grace period are promoted to stopped even when
    /// the node never confirmed.
    async fn promote_stopped(&self, service: &ServiceRecord) -> Result<()> {
        let now_ms = self.clock.now_ms();
        for pod in self.store.list_pods_for_service(&service.id).await? {
            if pod.status == PodStatus::Stopping
                && let Some(since) = pod.stopping_since_ms
                && now_ms.saturating_sub(since) >= self.config.grace_period_ms
            {
                let reason = pod.pending_stop_reason.unwrap_or(TerminationReason::Unknown);
                debug!(pod = %pod.id, reason = ?reason, "pod_stop_grace_elapsed");
                self.store
                    .finalize_pod(&pod.id, PodStatus::Stopped, reason)
                    .await?;
            }
        }
        Ok(())
    }

    fn is_stable(&self, pod: &PodRecord, now_ms: u64) -> bool {
        pod.status == PodStatus::Running
            && pod
                .running_since_ms
                .is_some_and(|since| now_ms.saturating_sub(since) >= self.config.stability_window_ms)
    }

    /// Online schedulable nodes whose labels/taints satisfy the service's
    /// pod template predicates.
    fn eligible_nodes<'a>(
        &self,
        service: &ServiceRecord,
        pack: Option<&PackRecord>,
        nodes: &'a [NodeRecord],
    ) -> Vec<&'a NodeRecord> {
        let probe = self.pod_from_template(service, None);
        let mut eligible: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| n.is_schedulable())
            .filter(|n| feasible_ignoring_resources(&probe, pack, n).is_ok())
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        eligible
    }

    fn pod_from_template(&self, service: &ServiceRecord, pin_to: Option<&NodeId>) -> PodRecord {
        let template = &service.template;
        let mut scheduling = template.scheduling.clone();
        if let Some(node) = pin_to {
            scheduling
                .node_selector
                .insert(NODE_IDENTITY_LABEL.to_string(), node.to_string());
        }
        let mut labels = template.labels.clone();
        labels.insert("service".to_string(), service.name.clone());
        PodRecord {
            id: PodId::generate(),
            pack_id: service.pack_id.clone(),
            pack_version: service.pack_version.clone(),
            node_id: None,
            status: PodStatus::Pending,
            status_message: None,
            termination_reason: None,
            namespace: service.namespace.clone(),
            labels,
            annotations: template.annotations.clone(),
            priority: self
                .config
                .resolve_priority_class(template.priority_class_name.as_deref()),
            tolerations: template.tolerations.clone(),
            resource_requests: template.resource_requests,
            resource_limits: template.resource_limits,
            scheduling,
            created_by: Some(service.id.clone()),
            incarnation: 0,
            created_at: self.clock.wall(),
            scheduled_at: None,
            started_at: None,
            stopped_at: None,
            granted_capabilities: vec![],
            pending_reason: None,
            crash_loop_count: 0,
            backoff_until_ms: None,
            stopping_since_ms: None,
            pending_stop_reason: None,
            running_since_ms: None,
        }
    }

    async fn create_pods(
        &self,
        service: &ServiceRecord,
        count: usize,
        eligible: &[&NodeRecord],
        active: &[&PodRecord],
    ) -> Result<()> {
        if service.is_daemon_set() {
            // pin each new pod to a distinct eligible node missing coverage
            let covered: Vec<NodeId> = active.iter().filter_map(|p| daemon_target_node(p)).collect();
            let uncovered: Vec<&&NodeRecord> = eligible
                .iter()
                .filter(|n| !covered.contains(&n.id))
                .collect();
            for node in uncovered.into_iter().take(count) {
                let pod = self.pod_from_template(service, Some(&node.id));
                info!(service = %service.id, pod = %pod.id, node = %node.id, "daemon_pod_created");
                metrics::PODS_CREATED.inc();
                self.store.put_pod(pod).await?;
            }
        } else {
            for _ in 0..count {
                let pod = self.pod_from_template(service, None);
                info!(service = %service.id, pod = %pod.id, "pod_created");
                metrics::PODS_CREATED.inc();
                self.store.put_pod(pod).await?;
            }
        }
        Ok(())
    }

    async fn retire_excess(
        &self,
        service: &ServiceRecord,
        active: &[&PodRecord],
        eligible: &[&NodeRecord],
        excess: usize,
    ) -> Result<()> {
        let mut candidates: Vec<&PodRecord> = active.to_vec();
        if service.is_daemon_set() {
            // orphaned daemon pods (pinned node no longer eligible) go first
            candidates.sort_by(|a, b| {
                let a_orphan = daemon_pod_orphaned(a, eligible);
                let b_orphan = daemon_pod_orphaned(b, eligible);
                b_orphan
                    .cmp(&a_orphan)
                    .then_with(|| retirement_preference(a, b))
            });
        } else {
            candidates.sort_by(|a, b| retirement_preference(a, b));
        }
        for pod in candidates.into_iter().take(excess) {
            self.retire_pod(pod, TerminationReason::ScaledDown).await?;
        }
        Ok(())
    }

    /// Mark a pod stopping and hand the wire-side stop to the orchestrator.
    /// Pods that never reached a node are finalized directly.
    async fn retire_pod(&self, pod: &PodRecord, reason: TerminationReason) -> Result<()> {
        metrics::PODS_RETIRED.inc();
        match (&pod.node_id, pod.status) {
            (_, PodStatus::Pending) | (None, _) => {
                self.store
                    .finalize_pod(&pod.id, PodStatus::Stopped, reason)
                    .await?;
            }
            (Some(node), _) => {
                let stopping = self.store.set_pod_stopping(&pod.id, reason).await?;
                info!(pod = %pod.id, node = %node, reason = ?reason, "pod_stop_dispatched");
                let _ = self.commands.send(ReconcileCommand::StopPod {
                    pod: pod.id.clone(),
                    node: node.clone(),
                    incarnation: stopping.incarnation,
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn teardown(&self, service: &ServiceRecord) -> Result<()> {
        self.promote_stopped(service).await?;
        let pods = self.store.list_pods_for_service(&service.id).await?;
        let mut remaining = 0usize;
        for pod in &pods {
            match pod.status {
                s if s.is_terminal() => {}
                PodStatus::Stopping => remaining += 1,
                _ => {
                    remaining += 1;
                    self.retire_pod(pod, TerminationReason::ServiceDeleted).await?;
                }
            }
        }
        if remaining == 0 {
            info!(service = %service.id, "service_deleted");
            self.store.delete_service(&service.id).await?;
        }
        Ok(())
    }

    async fn resolve_pack_id(
        &self,
        service: &ServiceRecord,
        version: &str,
        current_pack: Option<&PackRecord>,
    ) -> Result<Option<crate::types::PackId>> {
        let Some(pack) = current_pack else { return Ok(None) };
        if pack.version == version {
            return Ok(Some(pack.id.clone()));
        }
        let all = self.store.list_packs().await?;
        Ok(all
            .into_iter()
            .find(|p| p.name == pack.name && p.version == version)
            .map(|p| p.id)
            .or_else(|| Some(service.pack_id.clone())))
    }

    /// Newest registered version of the service's pack that is neither the
    /// recorded failed version nor backoff-locked.
    async fn newest_adoptable(
        &self,
        pack: &PackRecord,
        service: &ServiceRecord,
    ) -> Result<Option<PackRecord>> {
        let now_ms = self.clock.now_ms();
        let mut best: Option<(Version, PackRecord)> = None;
        for candidate in self.store.list_packs().await? {
            if candidate.name != pack.name {
                continue;
            }
            if service.failed_version.as_deref() == Some(candidate.version.as_str()) {
                let locked = service
                    .failure_backoff_until_ms
                    .is_none_or(|until| now_ms < until);
                if locked {
                    continue;
                }
            }
            let Ok(version) = Version::parse(&candidate.version) else {
                continue;
            };
            if best.as_ref().is_none_or(|(b, _)| version > *b) {
                best = Some((version, candidate));
            }
        }
        Ok(best.map(|(_, p)| p))
    }

    /* ── stale cleanup ── */

    /// Cross-check a node's claimed pod ids against the store. Every id the
    /// control plane no longer owns gets exactly one `pod:stop` dispatched
    /// before the node's next heartbeat is processed; nothing is written to
    /// the store for it.
    pub async fn handle_node_report(&self, node: &NodeId, reported: &[PodId]) -> Result<Vec<PodId>> {
        let mut stale = Vec::new();
        for pod_id in reported {
            let owned = match self.store.get_pod(pod_id).await? {
                None => false,
                Some(pod) => {
                    !pod.status.is_terminal() && pod.node_id.as_ref() == Some(node)
                }
            };
            if !owned {
                metrics::STALE_POD_STOPS.inc();
                info!(node = %node, pod = %pod_id, "stale_pod_stop_dispatched");
                let _ = self.commands.send(ReconcileCommand::StopStalePod {
                    node: node.clone(),
                    pod: pod_id.clone(),
                });
                stale.push(pod_id.clone());
            }
        }
        Ok(stale)
    }

    /* ── loop ── */

    /// Periodic loop, also nudged by store change events.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = self.store.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "reconcile_tick_failed");
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(StoreEvent::PodChanged(_)) | Ok(StoreEvent::NodeChanged(_)) => {
                            if let Err(e) = self.tick().await {
                                warn!(error = %e, "reconcile_tick_failed");
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}

/// Retirement order: newest created first, then lower priority, then pods
/// that have not reached running.
fn retirement_preference(a: &&PodRecord, b: &&PodRecord) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then(a.priority.cmp(&b.priority))
        .then_with(|| {
            let a_running = a.status == PodStatus::Running;
            let b_running = b.status == PodStatus::Running;
            a_running.cmp(&b_running)
        })
        .then(a.id.cmp(&b.id))
}

/// The node a daemon pod is destined for: its placement when scheduled, or
/// the selector pin while still pending.
fn daemon_target_node(pod: &PodRecord) -> Option<NodeId> {
    pod.node_id.clone().or_else(|| {
        pod.scheduling
            .node_selector
            .get(NODE_IDENTITY_LABEL)
            .map(|v| NodeId::from(v.as_str()))
    })
}

fn daemon_pod_orphaned(pod: &PodRecord, eligible: &[&NodeRecord]) -> bool {
    match daemon_target_node(pod) {
        Some(node) => !eligible.iter().any(|n| n.id == node),
        None => false,
    }
}

fn patch_changes_anything(
    service: &ServiceRecord,
    patch: &ServiceStatusPatch,
    expected_generation: u64,
) -> bool {
    patch.observed_generation.is_some_and(|g| g != expected_generation)
        || patch.ready_replicas.is_some_and(|v| v != service.ready_replicas)
        || patch.available_replicas.is_some_and(|v| v != service.available_replicas)
        || patch.updated_replicas.is_some_and(|v| v != service.updated_replicas)
        || patch.consecutive_failures.is_some_and(|v| v != service.consecutive_failures)
        || patch
            .status_message
            .as_ref()
            .is_some_and(|m| *m != service.status_message)
        || patch.pack_version.is_some()
        || patch.pack_id.is_some()
        || patch.failed_version.is_some()
        || patch.last_successful_version.is_some()
        || patch.failure_backoff_until_ms.is_some()
        || patch.status.is_some()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_node(id: &str) -> NodeRecord {
        let mut labels = BTreeMap::new();
        labels.insert(NODE_IDENTITY_LABEL.to_string(), id.to_string());
        NodeRecord {
            id: NodeId::from(id),
            name: id.to_string(),
            runtime_kind: RuntimeKind::Server,
            status: NodeStatus::Online,
            last_heartbeat_ms: Some(0),
            connection_id: None,
            allocatable: ResourceVector::new(4000, 8192, 20, 2000),
            allocated: ResourceVector::ZERO,
            labels,
            annotations: BTreeMap::new(),
            taints: vec![],
            unschedulable: false,
            capabilities: vec![],
            runtime_version: Some("2.0.0".to_string()),
            registered_at: Utc::now(),
        }
    }

    fn make_pack(id: &str, version: &str) -> PackRecord {
        PackRecord {
            id: PackId::from(id),
            name: "pingpong".to_string(),
            version: version.to_string(),
            runtime_tag: RuntimeTag::Universal,
            namespace: Default::default(),
            visibility: Default::default(),
            bundle_ref: format!("bundle://pingpong/{version}"),
            metadata: Default::default(),
            granted_capabilities: vec![],
            registered_at: Utc::now(),
        }
    }

    fn make_service(id: &str, replicas: u32) -> ServiceRecord {
        ServiceRecord {
            id: ServiceId::from(id),
            name: format!("{id}-name"),
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
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        reconciler: Arc<ServiceReconciler>,
        commands: mpsc::UnboundedReceiver<ReconcileCommand>,
    }

    async fn fixture() -> Fixture {
        let clock = Clock::new();
        let store = MemoryStore::new(clock.clone());
        store.register_pack(make_pack("pack-v1", "1.0.0")).await.unwrap();
        let chaos = ChaosEngine::new(1, false, clock.clone());
        let (reconciler, commands) =
            ServiceReconciler::new(store.clone(), chaos, clock, Config::default());
        Fixture { store, reconciler, commands }
    }

    /// Drive a service-owned pod to running through the store's own paths.
    async fn run_pod(store: &MemoryStore, pod: &PodId, node: &str) {
        store
            .schedule_pod(pod, &NodeId::from(node), PodStatus::Pending)
            .await
            .unwrap();
        let scheduled = store.get_pod(pod).await.unwrap().unwrap();
        store
            .update_pod_status(pod, scheduled.incarnation, PodStatus::Running, None, None)
            .await
            .unwrap();
    }

    async fn service_pods(store: &MemoryStore, id: &str) -> Vec<PodRecord> {
        store.list_pods_for_service(&ServiceId::from(id)).await.unwrap()
    }

    // ── Quantity: scale up ──

    #[tokio::test]
    async fn test_scale_up_creates_pending_pods() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 3)).await.unwrap();

        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-1").await;
        assert_eq!(pods.len(), 3);
        for pod in &pods {
            assert_eq!(pod.status, PodStatus::Pending);
            assert_eq!(pod.pack_version, "1.0.0");
            assert_eq!(pod.created_by, Some(ServiceId::from("svc-1")));
        }

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.observed_generation, 1);
    }

    #[tokio::test]
    async fn test_tick_is_idempotent_at_desired_count() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 2)).await.unwrap();

        f.reconciler.tick().await.unwrap();
        f.reconciler.tick().await.unwrap();
        f.reconciler.tick().await.unwrap();

        assert_eq!(service_pods(&f.store, "svc-1").await.len(), 2);
    }

    // ── Quantity: scale down ──

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_retires_with_scaled_down_reason() {
        let mut f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 3)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        for pod in service_pods(&f.store, "svc-1").await {
            run_pod(&f.store, &pod.id, "node-a").await;
        }

        let mut svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        svc.replicas = 1;
        svc.generation = 2;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-1").await;
        let stopping: Vec<&PodRecord> =
            pods.iter().filter(|p| p.status == PodStatus::Stopping).collect();
        assert_eq!(stopping.len(), 2);
        for _ in 0..2 {
            match f.commands.recv().await.unwrap() {
                ReconcileCommand::StopPod { reason, .. } => {
                    assert_eq!(reason, TerminationReason::ScaledDown);
                }
                other => panic!("unexpected command {other:?}"),
            }
        }

        // grace elapses without node confirmation: promoted to stopped
        tokio::time::advance(Duration::from_millis(10_500)).await;
        f.reconciler.tick().await.unwrap();
        let pods = service_pods(&f.store, "svc-1").await;
        let stopped = pods.iter().filter(|p| p.status == PodStatus::Stopped).count();
        let running = pods.iter().filter(|p| p.status == PodStatus::Running).count();
        assert_eq!(stopped, 2);
        assert_eq!(running, 1);
        for pod in pods.iter().filter(|p| p.status == PodStatus::Stopped) {
            assert_eq!(pod.termination_reason, Some(TerminationReason::ScaledDown));
        }
    }

    #[tokio::test]
    async fn test_retirement_prefers_newest_then_lower_priority_then_not_running() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 3)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        // make pods distinguishable: old+running, new+running, newest pending
        let mut pods = service_pods(&f.store, "svc-1").await;
        pods.sort_by(|a, b| a.id.cmp(&b.id));
        let base = Utc::now();
        let ids: Vec<PodId> = pods.iter().map(|p| p.id.clone()).collect();
        for (i, pod) in pods.iter_mut().enumerate() {
            pod.created_at = base - chrono::Duration::seconds(100 - i as i64 * 10);
            f.store.put_pod(pod.clone()).await.unwrap();
        }
        run_pod(&f.store, &ids[0], "node-a").await;
        run_pod(&f.store, &ids[1], "node-a").await;

        let mut svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        svc.replicas = 2;
        svc.generation = 2;
        f.store.put_service(svc).await.unwrap();
        f.reconciler.tick().await.unwrap();

        // the newest pod (pending, latest created_at) goes first
        let newest = f.store.get_pod(&ids[2]).await.unwrap().unwrap();
        assert_eq!(newest.status, PodStatus::Stopped);
        assert_eq!(f.store.get_pod(&ids[0]).await.unwrap().unwrap().status, PodStatus::Running);
        assert_eq!(f.store.get_pod(&ids[1]).await.unwrap().unwrap().status, PodStatus::Running);
    }

    // ── DaemonSet mode ──

    #[tokio::test]
    async fn test_daemonset_one_pinned_pod_per_eligible_node() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_node(make_node("node-b")).await.unwrap();
        let mut cordoned = make_node("node-c");
        cordoned.unschedulable = true;
        f.store.put_node(cordoned).await.unwrap();
        f.store.put_service(make_service("svc-ds", 0)).await.unwrap();

        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-ds").await;
        assert_eq!(pods.len(), 2);
        let mut pins: Vec<String> = pods
            .iter()
            .map(|p| p.scheduling.node_selector.get(NODE_IDENTITY_LABEL).unwrap().clone())
            .collect();
        pins.sort();
        assert_eq!(pins, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[tokio::test]
    async fn test_daemonset_covers_new_node() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-ds", 0)).await.unwrap();
        f.reconciler.tick().await.unwrap();
        assert_eq!(service_pods(&f.store, "svc-ds").await.len(), 1);

        f.store.put_node(make_node("node-b")).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-ds").await;
        assert_eq!(pods.len(), 2);
    }

    #[tokio::test]
    async fn test_daemonset_to_replica_conversion_retires_excess() {
        let mut f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_node(make_node("node-b")).await.unwrap();
        f.store.put_service(make_service("svc-ds", 0)).await.unwrap();
        f.reconciler.tick().await.unwrap();
        assert_eq!(service_pods(&f.store, "svc-ds").await.len(), 2);

        let mut svc = f.store.get_service(&ServiceId::from("svc-ds")).await.unwrap().unwrap();
        svc.replicas = 1;
        svc.generation = 2;
        f.store.put_service(svc).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-ds").await;
        let live = pods.iter().filter(|p| !p.status.is_terminal()).count();
        assert_eq!(live, 1);
        let _ = f.commands.try_recv();
    }

    // ── Crash loop ──

    #[tokio::test(start_paused = true)]
    async fn test_application_failure_resurrects_with_backoff() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let pod = &service_pods(&f.store, "svc-1").await[0];
        run_pod(&f.store, &pod.id, "node-a").await;
        let running = f.store.get_pod(&pod.id).await.unwrap().unwrap();
        f.store
            .update_pod_status(
                &pod.id,
                running.incarnation,
                PodStatus::Failed,
                None,
                Some(TerminationReason::Error),
            )
            .await
            .unwrap();

        f.reconciler.tick().await.unwrap();

        let pod = f.store.get_pod(&pod.id).await.unwrap().unwrap();
        assert_eq!(pod.status, PodStatus::Pending);
        assert_eq!(pod.crash_loop_count, 1);
        // min(2^1 * 10s, 300s)
        assert_eq!(pod.backoff_until_ms, Some(20_000));

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_spawns_fresh_pod_without_counting() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let original = service_pods(&f.store, "svc-1").await[0].id.clone();
        run_pod(&f.store, &original, "node-a").await;
        f.store
            .finalize_pod(&original, PodStatus::Failed, TerminationReason::NodeLost)
            .await
            .unwrap();

        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-1").await;
        assert_eq!(pods.len(), 2);
        let fresh: Vec<&PodRecord> = pods.iter().filter(|p| p.id != original).collect();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].status, PodStatus::Pending);
        assert_eq!(fresh[0].crash_loop_count, 0);

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_resets_crash_loop_count() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let pod_id = service_pods(&f.store, "svc-1").await[0].id.clone();
        f.store.set_pod_crash_loop(&pod_id, 2, None).await.unwrap();
        run_pod(&f.store, &pod_id, "node-a").await;

        // not yet stable: count survives
        tokio::time::advance(Duration::from_secs(30)).await;
        f.reconciler.tick().await.unwrap();
        assert_eq!(f.store.get_pod(&pod_id).await.unwrap().unwrap().crash_loop_count, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        f.reconciler.tick().await.unwrap();
        assert_eq!(f.store.get_pod(&pod_id).await.unwrap().unwrap().crash_loop_count, 0);
    }

    // ── Rollout & rollback ──

    async fn rollout_fixture() -> Fixture {
        let f = fixture().await;
        f.store.register_pack(make_pack("pack-v2", "1.1.0")).await.unwrap();
        f.store.put_node(make_node("node-a")).await.unwrap();
        let mut svc = make_service("svc-1", 1);
        svc.last_successful_version = Some("1.0.0".to_string());
        f.store.put_service(svc).await.unwrap();
        f.reconciler.tick().await.unwrap();
        let pod = service_pods(&f.store, "svc-1").await[0].id.clone();
        run_pod(&f.store, &pod, "node-a").await;
        // v1 pod becomes stable
        tokio::time::advance(Duration::from_secs(61)).await;
        f.reconciler.tick().await.unwrap();
        f
    }

    async fn begin_rollout(f: &Fixture) {
        let mut svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        svc.pack_id = PackId::from("pack-v2");
        svc.pack_version = "1.1.0".to_string();
        svc.generation += 1;
        f.store.put_service(svc).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_surges_replacement_then_drains_old() {
        let mut f = rollout_fixture().await;
        begin_rollout(&f).await;

        f.reconciler.tick().await.unwrap();
        let pods = service_pods(&f.store, "svc-1").await;
        let new_pods: Vec<&PodRecord> =
            pods.iter().filter(|p| p.pack_version == "1.1.0").collect();
        assert_eq!(new_pods.len(), 1);
        assert_eq!(new_pods[0].status, PodStatus::Pending);
        // the old pod is untouched until the replacement is stable
        assert_eq!(
            pods.iter().filter(|p| p.pack_version == "1.0.0" && p.status == PodStatus::Running).count(),
            1
        );

        // replacement runs and survives the stability window
        let new_id = new_pods[0].id.clone();
        run_pod(&f.store, &new_id, "node-a").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        f.reconciler.tick().await.unwrap();

        let old: Vec<PodRecord> = service_pods(&f.store, "svc-1")
            .await
            .into_iter()
            .filter(|p| p.pack_version == "1.0.0")
            .collect();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].status, PodStatus::Stopping);
        match f.commands.recv().await.unwrap() {
            ReconcileCommand::StopPod { reason, .. } => {
                assert_eq!(reason, TerminationReason::RollingUpdate);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_looping_rollout_rolls_back() {
        let f = rollout_fixture().await;
        begin_rollout(&f).await;

        // three consecutive application failures of the new version
        for round in 0..3 {
            f.reconciler.tick().await.unwrap();
            let pods = service_pods(&f.store, "svc-1").await;
            let new_pod = pods
                .iter()
                .find(|p| p.pack_version == "1.1.0" && p.status == PodStatus::Pending)
                .unwrap_or_else(|| panic!("round {round}: no pending v1.1.0 pod"));
            // clear scheduler backoff so the test can drive it directly
            f.store.set_pod_crash_loop(&new_pod.id, new_pod.crash_loop_count, None).await.unwrap();
            run_pod(&f.store, &new_pod.id, "node-a").await;
            let running = f.store.get_pod(&new_pod.id).await.unwrap().unwrap();
            f.store
                .update_pod_status(
                    &new_pod.id,
                    running.incarnation,
                    PodStatus::Failed,
                    Some("exit 1".to_string()),
                    Some(TerminationReason::Error),
                )
                .await
                .unwrap();
        }

        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.pack_version, "1.0.0");
        assert_eq!(svc.failed_version, Some("1.1.0".to_string()));
        assert!(svc.failure_backoff_until_ms.is_some());

        // the surviving v1.0.0 pod is still the steady state
        let pods = service_pods(&f.store, "svc-1").await;
        assert_eq!(
            pods.iter().filter(|p| p.pack_version == "1.0.0" && p.status == PodStatus::Running).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_latest_adopts_newest_but_skips_failed_version() {
        let f = rollout_fixture().await;
        let mut svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        svc.follow_latest = true;
        svc.generation += 1;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();
        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.pack_version, "1.1.0");
        assert_eq!(svc.pack_id, PackId::from("pack-v2"));

        // a failed version is not re-adopted while its backoff holds
        let mut svc = svc;
        svc.pack_id = PackId::from("pack-v1");
        svc.pack_version = "1.0.0".to_string();
        svc.failed_version = Some("1.1.0".to_string());
        svc.failure_backoff_until_ms = Some(u64::MAX);
        svc.generation += 1;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();
        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.pack_version, "1.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_version_crash_loop_marks_failed_without_revert() {
        // a service whose very first version crash-loops has nothing to
        // revert to, but the failed version and backoff are still recorded
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();

        for round in 0..3 {
            f.reconciler.tick().await.unwrap();
            let pods = service_pods(&f.store, "svc-1").await;
            let pod = pods
                .iter()
                .find(|p| p.status == PodStatus::Pending)
                .unwrap_or_else(|| panic!("round {round}: no pending pod"));
            // clear scheduler backoff so the test can drive it directly
            f.store
                .set_pod_crash_loop(&pod.id, pod.crash_loop_count, None)
                .await
                .unwrap();
            run_pod(&f.store, &pod.id, "node-a").await;
            let running = f.store.get_pod(&pod.id).await.unwrap().unwrap();
            f.store
                .update_pod_status(
                    &pod.id,
                    running.incarnation,
                    PodStatus::Failed,
                    Some("exit 1".to_string()),
                    Some(TerminationReason::Error),
                )
                .await
                .unwrap();
        }

        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.failed_version, Some("1.0.0".to_string()));
        assert!(svc.failure_backoff_until_ms.is_some());
        assert_eq!(svc.consecutive_failures, 3);
        // nothing to revert to: the version stays put
        assert_eq!(svc.pack_version, "1.0.0");
        assert_eq!(svc.last_successful_version, None);

        // the retry is held behind the service backoff on the same record
        let pods = service_pods(&f.store, "svc-1").await;
        let live: Vec<&PodRecord> = pods.iter().filter(|p| !p.status.is_terminal()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, PodStatus::Pending);
        assert_eq!(live[0].crash_loop_count, 3);
        assert_eq!(live[0].backoff_until_ms, svc.failure_backoff_until_ms);

        // no new failures, no further counting or re-marking
        f.reconciler.tick().await.unwrap();
        f.reconciler.tick().await.unwrap();
        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_saturate_at_backoff_cap() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        let mut svc = make_service("svc-1", 1);
        svc.consecutive_failures = Config::BACKOFF_EXPONENT_CAP;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();
        let pod = service_pods(&f.store, "svc-1").await[0].id.clone();
        run_pod(&f.store, &pod, "node-a").await;
        let running = f.store.get_pod(&pod).await.unwrap().unwrap();
        f.store
            .update_pod_status(
                &pod,
                running.incarnation,
                PodStatus::Failed,
                None,
                Some(TerminationReason::Error),
            )
            .await
            .unwrap();

        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.consecutive_failures, Config::BACKOFF_EXPONENT_CAP);
        assert_eq!(svc.failed_version, Some("1.0.0".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stabilised_version_clears_failed_mark() {
        // a version marked failed with no fallback later stabilises: the
        // mark and backoff are shed and the version recorded successful
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();

        for _ in 0..3 {
            f.reconciler.tick().await.unwrap();
            let pods = service_pods(&f.store, "svc-1").await;
            let pod = pods.iter().find(|p| p.status == PodStatus::Pending).unwrap();
            f.store
                .set_pod_crash_loop(&pod.id, pod.crash_loop_count, None)
                .await
                .unwrap();
            run_pod(&f.store, &pod.id, "node-a").await;
            let running = f.store.get_pod(&pod.id).await.unwrap().unwrap();
            f.store
                .update_pod_status(
                    &pod.id,
                    running.incarnation,
                    PodStatus::Failed,
                    None,
                    Some(TerminationReason::Error),
                )
                .await
                .unwrap();
        }
        f.reconciler.tick().await.unwrap();
        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.failed_version, Some("1.0.0".to_string()));

        // the app recovers: the held pod runs and survives the window
        let pod = service_pods(&f.store, "svc-1").await[0].id.clone();
        f.store.set_pod_crash_loop(&pod, 3, None).await.unwrap();
        run_pod(&f.store, &pod, "node-a").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.failed_version, None);
        assert_eq!(svc.failure_backoff_until_ms, None);
        assert_eq!(svc.last_successful_version, Some("1.0.0".to_string()));
        assert_eq!(svc.consecutive_failures, 0);
    }

    // ── Deletion ──

    #[tokio::test(start_paused = true)]
    async fn test_deleting_service_tears_down_pods_then_record() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 2)).await.unwrap();
        f.reconciler.tick().await.unwrap();
        for pod in service_pods(&f.store, "svc-1").await {
            run_pod(&f.store, &pod.id, "node-a").await;
        }

        let mut svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        svc.status = ServiceStatus::Deleting;
        svc.generation += 1;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();
        for pod in service_pods(&f.store, "svc-1").await {
            assert_eq!(pod.status, PodStatus::Stopping);
            assert_eq!(pod.pending_stop_reason, Some(TerminationReason::ServiceDeleted));
        }

        tokio::time::advance(Duration::from_millis(10_500)).await;
        f.reconciler.tick().await.unwrap();
        // pods promoted to stopped; next pass removes the record
        f.reconciler.tick().await.unwrap();
        assert!(f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().is_none());
    }

    // ── Paused services & counters ──

    #[tokio::test]
    async fn test_paused_service_is_left_alone() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        let mut svc = make_service("svc-1", 3);
        svc.status = ServiceStatus::Paused;
        f.store.put_service(svc).await.unwrap();

        f.reconciler.tick().await.unwrap();
        assert!(service_pods(&f.store, "svc-1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_track_ready_and_available() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 2)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let pods = service_pods(&f.store, "svc-1").await;
        run_pod(&f.store, &pods[0].id, "node-a").await;
        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.ready_replicas, 1);
        assert_eq!(svc.available_replicas, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        f.reconciler.tick().await.unwrap();
        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert_eq!(svc.available_replicas, 1);
    }

    // ── Stale cleanup ──

    #[tokio::test]
    async fn test_node_report_flags_unowned_pods() {
        let mut f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();
        let owned = service_pods(&f.store, "svc-1").await[0].id.clone();
        run_pod(&f.store, &owned, "node-a").await;

        let reported = vec![
            owned.clone(),
            PodId::from("pod-ghost"),
        ];
        let stale = f
            .reconciler
            .handle_node_report(&NodeId::from("node-a"), &reported)
            .await
            .unwrap();

        assert_eq!(stale, vec![PodId::from("pod-ghost")]);
        match f.commands.recv().await.unwrap() {
            ReconcileCommand::StopStalePod { pod, node } => {
                assert_eq!(pod, PodId::from("pod-ghost"));
                assert_eq!(node, NodeId::from("node-a"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        // the owned pod record is untouched
        assert_eq!(
            f.store.get_pod(&owned).await.unwrap().unwrap().status,
            PodStatus::Running
        );
    }

    #[tokio::test]
    async fn test_node_report_flags_pod_reassigned_elsewhere() {
        let mut f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_node(make_node("node-b")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();
        let pod = service_pods(&f.store, "svc-1").await[0].id.clone();
        run_pod(&f.store, &pod, "node-b").await;

        // node-a still claims a pod that now lives on node-b
        let stale = f
            .reconciler
            .handle_node_report(&NodeId::from("node-a"), &[pod.clone()])
            .await
            .unwrap();
        assert_eq!(stale, vec![pod]);
        assert!(matches!(
            f.commands.recv().await.unwrap(),
            ReconcileCommand::StopStalePod { .. }
        ));
    }

    // ── Generation guard ──

    #[tokio::test]
    async fn test_observed_generation_never_exceeds_generation() {
        let f = fixture().await;
        f.store.put_node(make_node("node-a")).await.unwrap();
        f.store.put_service(make_service("svc-1", 1)).await.unwrap();
        f.reconciler.tick().await.unwrap();

        let svc = f.store.get_service(&ServiceId::from("svc-1")).await.unwrap().unwrap();
        assert!(svc.observed_generation <= svc.generation);
        assert_eq!(svc.observed_generation, 1);
    }
}
