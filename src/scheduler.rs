use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use semver::Version;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chaos::ChaosEngine;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::store::{Store, guarded_call};
use crate::types::{
    NodeId, NodeRecord, PackRecord, PodId, PodRecord, PodStatus, SchedulingPolicy, TaintEffect,
    TerminationReason, tolerated,
};

/* ============================= EVENTS ============================= */

/// Placement outcomes the orchestrator turns into wire messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleEvent {
    /// Pod claimed onto a node; dispatch `pod:deploy`.
    Scheduled { pod: PodId, node: NodeId },
    /// Victim evicted to make room; dispatch `pod:stop` for it.
    Preempted { victim: PodId, node: NodeId, incarnation: u64 },
}

/* ============================= PREDICATES ============================= */

/// The full Feasible(pod, node) predicate set. Returns the pending reason
/// of the first failing predicate.
pub fn feasible(
    pod: &PodRecord,
    pack: Option<&PackRecord>,
    node: &NodeRecord,
) -> std::result::Result<(), &'static str> {
    feasible_ignoring_resources(pod, pack, node)?;
    if let Some(reason) = node.available().first_shortfall(&pod.resource_requests) {
        return Err(reason);
    }
    Ok(())
}

/// Every predicate except resource fit; the preemption path uses this to
/// find nodes where an eviction could make room.
pub fn feasible_ignoring_resources(
    pod: &PodRecord,
    pack: Option<&PackRecord>,
    node: &NodeRecord,
) -> std::result::Result<(), &'static str> {
    // runtime compatibility
    if let Some(pack) = pack {
        if !pack.runtime_tag.runs_on(node.runtime_kind) {
            return Err("runtime_incompatible");
        }
        if !min_runtime_satisfied(pack, node) {
            return Err("runtime_version_too_old");
        }
    }

    // taints: every NoSchedule / NoExecute taint must be tolerated
    for taint in &node.taints {
        if matches!(taint.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
            && !tolerated(taint, &pod.tolerations)
        {
            return Err("untolerated_taint");
        }
    }

    // node selector: exact label match on every pair
    for (key, value) in &pod.scheduling.node_selector {
        if node.labels.get(key) != Some(value) {
            return Err("node_selector_mismatch");
        }
    }

    // required node affinity: every term must hold
    if let Some(affinity) = &pod.scheduling.node_affinity
        && !affinity.required.iter().all(|t| t.matches(&node.labels))
    {
        return Err("affinity_mismatch");
    }

    Ok(())
}

/// Missing version fields on either side are treated as compatible.
fn min_runtime_satisfied(pack: &PackRecord, node: &NodeRecord) -> bool {
    let Some(min) = &pack.metadata.min_runtime_version else {
        return true;
    };
    let Some(node_version) = &node.runtime_version else {
        return true;
    };
    match (Version::parse(min), Version::parse(node_version)) {
        (Ok(min), Ok(have)) => min <= have,
        // unparseable versions do not block scheduling
        _ => true,
    }
}

/* ============================= SCORING ============================= */

/// Priority score for one feasible node. Higher is better; callers
/// normalise before picking, so only relative order matters.
pub fn score(pod: &PodRecord, node: &NodeRecord, policy: SchedulingPolicy, perturbation: i64) -> i64 {
    let mut total: i64 = 0;

    // preferred node affinity
    if let Some(affinity) = &pod.scheduling.node_affinity {
        for preferred in &affinity.preferred {
            if preferred.preference.matches(&node.labels) {
                total += i64::from(preferred.weight);
            }
        }
    }

    // untolerated soft taints repel
    for taint in &node.taints {
        if taint.effect == TaintEffect::PreferNoSchedule && !tolerated(taint, &pod.tolerations) {
            total -= 10;
        }
    }

    total += match policy {
        SchedulingPolicy::Spread => -node.allocated.pods,
        SchedulingPolicy::Binpack => node.allocated.pods,
        SchedulingPolicy::Random => perturbation,
        SchedulingPolicy::LeastLoaded => -(utilisation_pct(node.allocated.cpu_millis, node.allocatable.cpu_millis)
            + utilisation_pct(node.allocated.memory_mb, node.allocatable.memory_mb)),
        SchedulingPolicy::Affinity => 0,
    };

    total
}

fn utilisation_pct(used: i64, capacity: i64) -> i64 {
    if capacity <= 0 { 0 } else { used * 100 / capacity }
}

/* ============================= SCHEDULER ============================= */

/// Periodic placement engine: matches pending pods to eligible nodes under
/// the predicate set and the cluster scheduling policy, claiming each pod
/// through the store's conditional update.
pub struct SchedulerCore {
    store: Arc<dyn Store>,
    chaos: Arc<ChaosEngine>,
    clock: Arc<Clock>,
    config: Config,
    events: mpsc::UnboundedSender<ScheduleEvent>,
    rng: Mutex<StdRng>,
    running: AtomicBool,
}

impl SchedulerCore {
    pub fn new(
        store: Arc<dyn Store>,
        chaos: Arc<ChaosEngine>,
        clock: Arc<Clock>,
        config: Config,
    ) -> (Arc<SchedulerCore>, mpsc::UnboundedReceiver<ScheduleEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let seed = config.chaos_seed.wrapping_add(0x5eed);
        (
            Arc::new(SchedulerCore {
                store,
                chaos,
                clock,
                config,
                events,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                running: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// One placement pass. A tick arriving while the previous still runs
    /// skips and counts.
    pub async fn tick(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            metrics::SCHEDULER_SKIPS.inc();
            return Ok(());
        }
        metrics::SCHEDULER_TICKS.inc();
        let result =
            tokio::time::timeout(self.config.scheduler_tick_timeout(), self.tick_inner()).await;
        self.running.store(false, Ordering::SeqCst);
        match result {
            Ok(r) => r,
            Err(_) => {
                warn!("scheduler_tick_deadline_exceeded");
                Ok(())
            }
        }
    }

    async fn tick_inner(&self) -> Result<()> {
        self.chaos.maybe_fail_api_call().await?;
        let store_timeout = self.config.store_call_timeout();

        let pending = guarded_call(store_timeout, || {
            self.store.list_pending_pods(self.config.max_pods_per_run)
        })
        .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut nodes: Vec<NodeRecord> = guarded_call(store_timeout, || self.store.list_nodes())
            .await?
            .into_iter()
            .filter(|n| n.is_schedulable())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut packs: HashMap<crate::types::PackId, Option<PackRecord>> = HashMap::new();
        let now_ms = self.clock.now_ms();

        for pod in pending {
            if let Some(until) = pod.backoff_until_ms
                && now_ms < until
            {
                let _ = self
                    .store
                    .set_pod_pending_reason(&pod.id, Some("crash_loop_backoff".to_string()))
                    .await;
                continue;
            }

            let pack = match packs.get(&pod.pack_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = guarded_call(store_timeout, || self.store.get_pack(&pod.pack_id))
                        .await
                        .unwrap_or(None);
                    packs.insert(pod.pack_id.clone(), fetched.clone());
                    fetched
                }
            };
            if pack.is_none() {
                let _ = self
                    .store
                    .set_pod_pending_reason(&pod.id, Some("pack_not_found".to_string()))
                    .await;
                continue;
            }

            if let Err(e) = self.place_pod(&pod, pack.as_ref(), &mut nodes).await {
                // a failed placement for one pod never aborts the pass
                debug!(pod = %pod.id, error = %e, "pod_placement_error");
            }
        }
        Ok(())
    }

    async fn place_pod(
        &self,
        pod: &PodRecord,
        pack: Option<&PackRecord>,
        nodes: &mut [NodeRecord],
    ) -> Result<()> {
        let mut last_reason: Option<&'static str> = None;
        let mut candidates: Vec<(i64, usize)> = Vec::new();

        for (index, node) in nodes.iter().enumerate() {
            match feasible(pod, pack, node) {
                Ok(()) => {
                    let perturbation = if self.config.scheduling_policy == SchedulingPolicy::Random {
                        self.rng.lock().random_range(-50..=50)
                    } else {
                        0
                    };
                    candidates.push((
                        score(pod, node, self.config.scheduling_policy, perturbation),
                        index,
                    ));
                }
                Err(reason) => last_reason = Some(reason),
            }
        }

        if candidates.is_empty() {
            if self.config.enable_preemption
                && self.try_preempt(pod, pack, nodes).await?
            {
                return Ok(());
            }
            let reason = if nodes.is_empty() {
                "no_eligible_nodes"
            } else {
                last_reason.unwrap_or("no_eligible_nodes")
            };
            self.store
                .set_pod_pending_reason(&pod.id, Some(reason.to_string()))
                .await?;
            debug!(pod = %pod.id, reason, "pod_unschedulable");
            return Ok(());
        }

        // best score wins; ties go to the lexicographically lower node id
        // (nodes are pre-sorted by id, so stable max-by keeps the first)
        let (_, best_index) = candidates
            .iter()
            .copied()
            .max_by(|(score_a, index_a), (score_b, index_b)| {
                score_a.cmp(score_b).then(index_b.cmp(index_a))
            })
            .expect("candidates not empty");

        let node_id = nodes[best_index].id.clone();
        match self
            .store
            .schedule_pod(&pod.id, &node_id, PodStatus::Pending)
            .await
        {
            Ok(scheduled) => {
                metrics::PODS_SCHEDULED.inc();
                info!(pod = %pod.id, node = %node_id, incarnation = scheduled.incarnation, "pod_scheduled");
                // keep the in-pass view of capacity current
                nodes[best_index].allocated =
                    nodes[best_index].allocated.plus(&pod.resource_requests);
                let _ = self.events.send(ScheduleEvent::Scheduled {
                    pod: pod.id.clone(),
                    node: node_id,
                });
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                metrics::SCHEDULE_CONFLICTS.inc();
                debug!(pod = %pod.id, node = %node_id, "schedule_conflict_requeued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Preemption: only when no node is feasible, evict a single strictly
    /// lower-priority pod whose removal makes the pod fit.
    async fn try_preempt(
        &self,
        pod: &PodRecord,
        pack: Option<&PackRecord>,
        nodes: &mut [NodeRecord],
    ) -> Result<bool> {
        for node in nodes.iter_mut() {
            if feasible_ignoring_resources(pod, pack, node).is_err() {
                continue;
            }
            let running = self.store.list_pods_on_node(&node.id).await?;
            let mut victims: Vec<&PodRecord> = running
                .iter()
                .filter(|p| p.status == PodStatus::Running && p.priority < pod.priority)
                .collect();
            // evict the least important first
            victims.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

            for victim in victims {
                let freed = node.available().plus(&victim.resource_requests);
                if !pod.resource_requests.fits_within(&freed) {
                    continue;
                }
                let evicted = self
                    .store
                    .finalize_pod(&victim.id, PodStatus::Evicted, TerminationReason::Preempted)
                    .await?;
                metrics::PODS_PREEMPTED.inc();
                warn!(
                    victim = %victim.id,
                    node = %node.id,
                    pod = %pod.id,
                    "pod_preempted"
                );
                let _ = self.events.send(ScheduleEvent::Preempted {
                    victim: victim.id.clone(),
                    node: node.id.clone(),
                    incarnation: evicted.incarnation,
                });

                node.allocated = node.allocated.minus(&victim.resource_requests);
                match self
                    .store
                    .schedule_pod(&pod.id, &node.id, PodStatus::Pending)
                    .await
                {
                    Ok(_) => {
                        metrics::PODS_SCHEDULED.inc();
                        node.allocated = node.allocated.plus(&pod.resource_requests);
                        info!(pod = %pod.id, node = %node.id, "pod_scheduled_after_preemption");
                        let _ = self.events.send(ScheduleEvent::Scheduled {
                            pod: pod.id.clone(),
                            node: node.id.clone(),
                        });
                        return Ok(true);
                    }
                    Err(e) if e.is_conflict() => {
                        metrics::SCHEDULE_CONFLICTS.inc();
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }

    /// Periodic loop; two ticks never run concurrently.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.schedule_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler_tick_failed");
                    }
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
