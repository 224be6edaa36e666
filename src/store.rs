use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use semver::Version;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::{
    ConnectionId, NodeId, NodeRecord, NodeStatus, PackId, PackRecord, PodId, PodRecord, PodStatus,
    ResourceVector, ServiceId, ServiceRecord, TerminationReason,
};

/* ============================= EVENTS ============================= */

/// Change notifications that nudge the reconciler between ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    NodeChanged(NodeId),
    PodChanged(PodId),
    ServiceChanged(ServiceId),
    PackRegistered(PackId),
}

/* ============================= PATCHES ============================= */

/// Conditional status patch applied by the service reconciler; fields left
/// `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatusPatch {
    pub observed_generation: Option<u64>,
    pub ready_replicas: Option<u32>,
    pub available_replicas: Option<u32>,
    pub updated_replicas: Option<u32>,
    pub pack_id: Option<PackId>,
    pub pack_version: Option<String>,
    pub last_successful_version: Option<Option<String>>,
    pub failed_version: Option<Option<String>>,
    pub consecutive_failures: Option<u32>,
    pub failure_backoff_until_ms: Option<Option<u64>>,
    pub status_message: Option<Option<String>>,
    pub status: Option<crate::types::ServiceStatus>,
}

/* ============================= STORE TRAIT ============================= */

/// Persistent-state capability.
///
/// The in-memory implementation below is the reference; the discipline that
/// matters to callers is the conditional updates: `schedule_pod` and
/// `update_service_status` fail with `Error::Conflict` instead of clobbering
/// concurrent writes, and stale pod incarnations are rejected.
#[async_trait]
pub trait Store: Send + Sync {
    // nodes
    async fn put_node(&self, node: NodeRecord) -> Result<()>;
    async fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>>;
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;
    async fn set_node_status(&self, id: &NodeId, status: NodeStatus) -> Result<NodeRecord>;
    async fn set_node_connection(
        &self,
        id: &NodeId,
        connection: Option<ConnectionId>,
    ) -> Result<()>;
    async fn set_node_unschedulable(&self, id: &NodeId, unschedulable: bool) -> Result<()>;
    /// Record an accepted heartbeat at `now_ms` on the monotonic clock.
    async fn record_heartbeat(&self, id: &NodeId, now_ms: u64) -> Result<NodeRecord>;

    // pods
    async fn put_pod(&self, pod: PodRecord) -> Result<()>;
    async fn get_pod(&self, id: &PodId) -> Result<Option<PodRecord>>;
    async fn list_pods(&self) -> Result<Vec<PodRecord>>;
    /// Pending pods ordered by (priority desc, created_at asc), capped at `limit`.
    async fn list_pending_pods(&self, limit: usize) -> Result<Vec<PodRecord>>;
    async fn list_pods_for_service(&self, id: &ServiceId) -> Result<Vec<PodRecord>>;
    async fn list_pods_on_node(&self, id: &NodeId) -> Result<Vec<PodRecord>>;
    /// Atomic claim: fails with `Conflict` unless the pod still has
    /// `expected_status`; on success binds the node, stamps `scheduled_at`,
    /// bumps the incarnation, and allocates the node's resources.
    async fn schedule_pod(
        &self,
        pod_id: &PodId,
        node_id: &NodeId,
        expected_status: PodStatus,
    ) -> Result<PodRecord>;
    /// Incarnation-guarded status update driven by node reports.
    async fn update_pod_status(
        &self,
        pod_id: &PodId,
        incarnation: u64,
        status: PodStatus,
        message: Option<String>,
        reason: Option<TerminationReason>,
    ) -> Result<PodRecord>;
    /// Idempotent transition into a terminal status; releases the node's
    /// allocated resources exactly once.
    async fn finalize_pod(
        &self,
        pod_id: &PodId,
        terminal: PodStatus,
        reason: TerminationReason,
    ) -> Result<PodRecord>;
    /// Single atomic batch used on the OFFLINE transition.
    async fn mark_node_pods_failed(
        &self,
        node_id: &NodeId,
        reason: TerminationReason,
    ) -> Result<Vec<PodId>>;
    /// Return a failed pod to pending on the same record for re-scheduling.
    async fn reset_pod_for_reschedule(
        &self,
        pod_id: &PodId,
        crash_loop_count: u32,
        backoff_until_ms: Option<u64>,
    ) -> Result<PodRecord>;
    async fn set_pod_pending_reason(&self, pod_id: &PodId, reason: Option<String>) -> Result<()>;
    /// Transition an active pod to stopping, stamping the grace timer and
    /// the reason the eventual stop will carry.
    async fn set_pod_stopping(&self, pod_id: &PodId, reason: TerminationReason)
    -> Result<PodRecord>;
    /// Reconciler-owned bookkeeping writes on one pod.
    async fn set_pod_crash_loop(
        &self,
        pod_id: &PodId,
        crash_loop_count: u32,
        backoff_until_ms: Option<u64>,
    ) -> Result<()>;

    // services
    async fn put_service(&self, service: ServiceRecord) -> Result<()>;
    async fn get_service(&self, id: &ServiceId) -> Result<Option<ServiceRecord>>;
    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;
    async fn delete_service(&self, id: &ServiceId) -> Result<()>;
    /// Conditional update keyed on `observed_generation` to prevent lost
    /// updates between overlapping reconcile passes.
    async fn update_service_status(
        &self,
        id: &ServiceId,
        expected_observed_generation: u64,
        patch: ServiceStatusPatch,
    ) -> Result<ServiceRecord>;

    // packs
    async fn register_pack(&self, pack: PackRecord) -> Result<()>;
    async fn get_pack(&self, id: &PackId) -> Result<Option<PackRecord>>;
    async fn list_packs(&self) -> Result<Vec<PackRecord>>;
    /// Highest semver version registered under `name`, if any.
    async fn latest_pack_version(&self, name: &str) -> Result<Option<PackRecord>>;

    // namespaces
    async fn ensure_namespace(&self, name: &str) -> Result<()>;
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/* ============================= MEMORY STORE ============================= */

struct Inner {
    nodes: BTreeMap<NodeId, NodeRecord>,
    pods: BTreeMap<PodId, PodRecord>,
    services: BTreeMap<ServiceId, ServiceRecord>,
    packs: BTreeMap<PackId, PackRecord>,
    namespaces: BTreeSet<String>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<Clock>) -> Arc<MemoryStore> {
        let (events, _) = broadcast::channel(256);
        let mut namespaces = BTreeSet::new();
        namespaces.insert("system".to_string());
        namespaces.insert("user".to_string());
        Arc::new(MemoryStore {
            inner: RwLock::new(Inner {
                nodes: BTreeMap::new(),
                pods: BTreeMap::new(),
                services: BTreeMap::new(),
                packs: BTreeMap::new(),
                namespaces,
            }),
            events,
            clock,
        })
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Release a pod's resources from its node; called exactly once per pod
    /// while it holds capacity.
    fn release_resources(inner: &mut Inner, pod: &PodRecord) {
        let Some(node_id) = &pod.node_id else { return };
        let Some(node) = inner.nodes.get_mut(node_id) else { return };
        let freed = node.allocated.minus(&pod.resource_requests);
        if freed.is_non_negative() {
            node.allocated = freed;
        } else {
            error!(
                node = %node_id,
                pod = %pod.id,
                "fatal_invariant_negative_allocation"
            );
            node.allocated = ResourceVector {
                cpu_millis: freed.cpu_millis.max(0),
                memory_mb: freed.memory_mb.max(0),
                pods: freed.pods.max(0),
                storage_mb: freed.storage_mb.max(0),
            };
        }
    }

    fn finalize_in_place(
        &self,
        inner: &mut Inner,
        pod_id: &PodId,
        terminal: PodStatus,
        reason: TerminationReason,
    ) -> Result<PodRecord> {
        if !terminal.is_terminal() {
            return Err(Error::Validation(format!(
                "{terminal:?} is not a terminal pod status"
            )));
        }
        let pod = inner
            .pods
            .get(pod_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
        if pod.status.is_terminal() {
            // already finalized; idempotent
            return Ok(pod);
        }
        if pod.status.holds_resources() {
            Self::release_resources(inner, &pod);
        }
        let entry = inner.pods.get_mut(pod_id).expect("pod present");
        entry.status = terminal;
        entry.termination_reason = Some(reason);
        entry.stopped_at = Some(self.clock.wall());
        entry.stopping_since_ms = None;
        entry.running_since_ms = None;
        entry.pending_stop_reason = None;
        Ok(entry.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_node(&self, node: NodeRecord) -> Result<()> {
        let id = node.id.clone();
        self.inner.write().nodes.insert(id.clone(), node);
        self.emit(StoreEvent::NodeChanged(id));
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        Ok(self.inner.read().nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.inner.read().nodes.values().cloned().collect())
    }

    async fn set_node_status(&self, id: &NodeId, status: NodeStatus) -> Result<NodeRecord> {
        let updated = {
            let mut inner = self.inner.write();
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            node.status = status;
            node.clone()
        };
        self.emit(StoreEvent::NodeChanged(id.clone()));
        Ok(updated)
    }

    async fn set_node_connection(
        &self,
        id: &NodeId,
        connection: Option<ConnectionId>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        node.connection_id = connection;
        Ok(())
    }

    async fn set_node_unschedulable(&self, id: &NodeId, unschedulable: bool) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            node.unschedulable = unschedulable;
        }
        self.emit(StoreEvent::NodeChanged(id.clone()));
        Ok(())
    }

    async fn record_heartbeat(&self, id: &NodeId, now_ms: u64) -> Result<NodeRecord> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        node.last_heartbeat_ms = Some(now_ms);
        Ok(node.clone())
    }

    async fn put_pod(&self, pod: PodRecord) -> Result<()> {
        let id = pod.id.clone();
        self.inner.write().pods.insert(id.clone(), pod);
        self.emit(StoreEvent::PodChanged(id));
        Ok(())
    }

    async fn get_pod(&self, id: &PodId) -> Result<Option<PodRecord>> {
        Ok(self.inner.read().pods.get(id).cloned())
    }

    async fn list_pods(&self) -> Result<Vec<PodRecord>> {
        Ok(self.inner.read().pods.values().cloned().collect())
    }

    async fn list_pending_pods(&self, limit: usize) -> Result<Vec<PodRecord>> {
        let inner = self.inner.read();
        let mut pending: Vec<PodRecord> = inner
            .pods
            .values()
            .filter(|p| p.status == PodStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_pods_for_service(&self, id: &ServiceId) -> Result<Vec<PodRecord>> {
        Ok(self
            .inner
            .read()
            .pods
            .values()
            .filter(|p| p.created_by.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn list_pods_on_node(&self, id: &NodeId) -> Result<Vec<PodRecord>> {
        Ok(self
            .inner
            .read()
            .pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn schedule_pod(
        &self,
        pod_id: &PodId,
        node_id: &NodeId,
        expected_status: PodStatus,
    ) -> Result<PodRecord> {
        let scheduled = {
            let mut inner = self.inner.write();

            let pod = inner
                .pods
                .get(pod_id)
                .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
            if pod.status != expected_status {
                return Err(Error::Conflict(format!(
                    "pod {pod_id} is {:?}, expected {:?}",
                    pod.status, expected_status
                )));
            }
            let requests = pod.resource_requests;

            let node = inner
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
            let next = node.allocated.plus(&requests);
            if !next.fits_within(&node.allocatable) {
                return Err(Error::Conflict(format!(
                    "node {node_id} no longer fits pod {pod_id}"
                )));
            }
            node.allocated = next;

            let pod = inner.pods.get_mut(pod_id).expect("pod present");
            pod.node_id = Some(node_id.clone());
            pod.status = PodStatus::Scheduled;
            pod.scheduled_at = Some(self.clock.wall());
            pod.incarnation += 1;
            pod.pending_reason = None;
            pod.clone()
        };
        self.emit(StoreEvent::PodChanged(pod_id.clone()));
        Ok(scheduled)
    }

    async fn update_pod_status(
        &self,
        pod_id: &PodId,
        incarnation: u64,
        status: PodStatus,
        message: Option<String>,
        reason: Option<TerminationReason>,
    ) -> Result<PodRecord> {
        let now_ms = self.clock.now_ms();
        let updated = {
            let mut inner = self.inner.write();
            let current = inner
                .pods
                .get(pod_id)
                .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?
                .clone();

            if incarnation < current.incarnation {
                return Err(Error::StaleIncarnation {
                    pod: pod_id.clone(),
                    reported: incarnation,
                    current: current.incarnation,
                });
            }
            if incarnation > current.incarnation {
                return Err(Error::FatalInvariant(format!(
                    "pod {pod_id} reported future incarnation {incarnation} (current {})",
                    current.incarnation
                )));
            }

            if status.is_terminal() {
                self.finalize_in_place(
                    &mut inner,
                    pod_id,
                    status,
                    reason.unwrap_or(TerminationReason::Unknown),
                )?
            } else {
                let pod = inner.pods.get_mut(pod_id).expect("pod present");
                if pod.status.is_terminal() {
                    // a terminal pod never comes back on the same incarnation
                    return Err(Error::Conflict(format!(
                        "pod {pod_id} is already {:?}",
                        pod.status
                    )));
                }
                if pod.status == PodStatus::Pending {
                    // a late report landing between resurrection and the next
                    // claim must not move an unplaced pod
                    return Err(Error::Conflict(format!("pod {pod_id} is not placed")));
                }
                if status == PodStatus::Running && pod.status != PodStatus::Running {
                    pod.started_at = Some(self.clock.wall());
                    pod.running_since_ms = Some(now_ms);
                }
                pod.status = status;
                pod.status_message = message;
                pod.clone()
            }
        };
        self.emit(StoreEvent::PodChanged(pod_id.clone()));
        Ok(updated)
    }

    async fn finalize_pod(
        &self,
        pod_id: &PodId,
        terminal: PodStatus,
        reason: TerminationReason,
    ) -> Result<PodRecord> {
        let finalized = {
            let mut inner = self.inner.write();
            self.finalize_in_place(&mut inner, pod_id, terminal, reason)?
        };
        self.emit(StoreEvent::PodChanged(pod_id.clone()));
        Ok(finalized)
    }

    async fn mark_node_pods_failed(
        &self,
        node_id: &NodeId,
        reason: TerminationReason,
    ) -> Result<Vec<PodId>> {
        let failed = {
            let mut inner = self.inner.write();
            let ids: Vec<PodId> = inner
                .pods
                .values()
                .filter(|p| {
                    p.node_id.as_ref() == Some(node_id)
                        && matches!(
                            p.status,
                            PodStatus::Scheduled
                                | PodStatus::Starting
                                | PodStatus::Running
                                | PodStatus::Stopping
                                | PodStatus::Unknown
                        )
                })
                .map(|p| p.id.clone())
                .collect();
            for id in &ids {
                self.finalize_in_place(&mut inner, id, PodStatus::Failed, reason)?;
            }
            ids
        };
        for id in &failed {
            self.emit(StoreEvent::PodChanged(id.clone()));
        }
        Ok(failed)
    }

    async fn reset_pod_for_reschedule(
        &self,
        pod_id: &PodId,
        crash_loop_count: u32,
        backoff_until_ms: Option<u64>,
    ) -> Result<PodRecord> {
        let reset = {
            let mut inner = self.inner.write();
            let pod = inner
                .pods
                .get_mut(pod_id)
                .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
            if pod.status.holds_resources() {
                return Err(Error::Conflict(format!(
                    "pod {pod_id} still holds resources in {:?}",
                    pod.status
                )));
            }
            pod.status = PodStatus::Pending;
            pod.node_id = None;
            pod.termination_reason = None;
            pod.status_message = None;
            pod.scheduled_at = None;
            pod.started_at = None;
            pod.stopped_at = None;
            pod.running_since_ms = None;
            pod.stopping_since_ms = None;
            pod.pending_stop_reason = None;
            pod.crash_loop_count = crash_loop_count;
            pod.backoff_until_ms = backoff_until_ms;
            pod.clone()
        };
        self.emit(StoreEvent::PodChanged(pod_id.clone()));
        Ok(reset)
    }

    async fn set_pod_pending_reason(&self, pod_id: &PodId, reason: Option<String>) -> Result<()> {
        let mut inner = self.inner.write();
        let pod = inner
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
        pod.pending_reason = reason;
        Ok(())
    }

    async fn set_pod_stopping(
        &self,
        pod_id: &PodId,
        reason: TerminationReason,
    ) -> Result<PodRecord> {
        let now_ms = self.clock.now_ms();
        let stopping = {
            let mut inner = self.inner.write();
            let pod = inner
                .pods
                .get_mut(pod_id)
                .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
            if pod.status.is_terminal() || pod.status == PodStatus::Stopping {
                return Err(Error::Conflict(format!(
                    "pod {pod_id} is {:?}",
                    pod.status
                )));
            }
            pod.status = PodStatus::Stopping;
            pod.stopping_since_ms = Some(now_ms);
            pod.pending_stop_reason = Some(reason);
            pod.clone()
        };
        self.emit(StoreEvent::PodChanged(pod_id.clone()));
        Ok(stopping)
    }

    async fn set_pod_crash_loop(
        &self,
        pod_id: &PodId,
        crash_loop_count: u32,
        backoff_until_ms: Option<u64>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let pod = inner
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| Error::NotFound(format!("pod {pod_id}")))?;
        pod.crash_loop_count = crash_loop_count;
        pod.backoff_until_ms = backoff_until_ms;
        Ok(())
    }

    async fn put_service(&self, service: ServiceRecord) -> Result<()> {
        let id = service.id.clone();
        {
            let mut inner = self.inner.write();
            if let Some(dup) = inner
                .services
                .values()
                .find(|s| s.id != service.id && s.name == service.name && s.namespace == service.namespace)
            {
                return Err(Error::Validation(format!(
                    "service name {} already taken in namespace {} by {}",
                    service.name, service.namespace, dup.id
                )));
            }
            inner.services.insert(id.clone(), service);
        }
        self.emit(StoreEvent::ServiceChanged(id));
        Ok(())
    }

    async fn get_service(&self, id: &ServiceId) -> Result<Option<ServiceRecord>> {
        Ok(self.inner.read().services.get(id).cloned())
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.inner.read().services.values().cloned().collect())
    }

    async fn delete_service(&self, id: &ServiceId) -> Result<()> {
        self.inner.write().services.remove(id);
        self.emit(StoreEvent::ServiceChanged(id.clone()));
        Ok(())
    }

    async fn update_service_status(
        &self,
        id: &ServiceId,
        expected_observed_generation: u64,
        patch: ServiceStatusPatch,
    ) -> Result<ServiceRecord> {
        let updated = {
            let mut inner = self.inner.write();
            let service = inner
                .services
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("service {id}")))?;
            if service.observed_generation != expected_observed_generation {
                return Err(Error::Conflict(format!(
                    "service {id} observed generation moved to {}",
                    service.observed_generation
                )));
            }
            if let Some(v) = patch.observed_generation {
                if v > service.generation {
                    return Err(Error::FatalInvariant(format!(
                        "service {id} observed generation {v} would exceed generation {}",
                        service.generation
                    )));
                }
                service.observed_generation = v;
            }
            if let Some(v) = patch.ready_replicas {
                service.ready_replicas = v;
            }
            if let Some(v) = patch.available_replicas {
                service.available_replicas = v;
            }
            if let Some(v) = patch.updated_replicas {
                service.updated_replicas = v;
            }
            if let Some(v) = patch.pack_id {
                service.pack_id = v;
            }
            if let Some(v) = patch.pack_version {
                service.pack_version = v;
            }
            if let Some(v) = patch.last_successful_version {
                service.last_successful_version = v;
            }
            if let Some(v) = patch.failed_version {
                service.failed_version = v;
            }
            if let Some(v) = patch.consecutive_failures {
                service.consecutive_failures = v;
            }
            if let Some(v) = patch.failure_backoff_until_ms {
                service.failure_backoff_until_ms = v;
            }
            if let Some(v) = patch.status_message {
                service.status_message = v;
            }
            if let Some(v) = patch.status {
                service.status = v;
            }
            service.clone()
        };
        self.emit(StoreEvent::ServiceChanged(id.clone()));
        Ok(updated)
    }

    async fn register_pack(&self, pack: PackRecord) -> Result<()> {
        let id = pack.id.clone();
        {
            let mut inner = self.inner.write();
            if inner.packs.contains_key(&pack.id) {
                return Err(Error::Validation(format!("pack {} already registered", pack.id)));
            }
            if inner
                .packs
                .values()
                .any(|p| p.name == pack.name && p.version == pack.version)
            {
                return Err(Error::Validation(format!(
                    "pack {}@{} already registered",
                    pack.name, pack.version
                )));
            }
            if Version::parse(&pack.version).is_err() {
                return Err(Error::Validation(format!(
                    "pack version {:?} is not valid semver",
                    pack.version
                )));
            }
            inner.packs.insert(id.clone(), pack);
        }
        self.emit(StoreEvent::PackRegistered(id));
        Ok(())
    }

    async fn get_pack(&self, id: &PackId) -> Result<Option<PackRecord>> {
        Ok(self.inner.read().packs.get(id).cloned())
    }

    async fn list_packs(&self) -> Result<Vec<PackRecord>> {
        Ok(self.inner.read().packs.values().cloned().collect())
    }

    async fn latest_pack_version(&self, name: &str) -> Result<Option<PackRecord>> {
        let inner = self.inner.read();
        let mut latest: Option<(Version, PackRecord)> = None;
        for pack in inner.packs.values().filter(|p| p.name == name) {
            let Ok(version) = Version::parse(&pack.version) else {
                warn!(pack = %pack.id, version = %pack.version, "pack_version_not_semver");
                continue;
            };
            if latest.as_ref().is_none_or(|(best, _)| version > *best) {
                latest = Some((version, pack.clone()));
            }
        }
        Ok(latest.map(|(_, p)| p))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.inner.write().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().namespaces.iter().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

/* ============================= GUARDED CALLS ============================= */

/// Run a store call under the per-call deadline, retrying once with a
/// deterministic backoff on transient failure.
pub async fn guarded_call<T, F, Fut>(timeout: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<Error> = None;
    for attempt in 0..2u64 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(50 + attempt * 100)).await;
        }
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retriable() => last = Some(e),
            Ok(Err(e)) => return Err(e),
            Err(_) => last = Some(Error::Timeout("store call deadline exceeded".to_string())),
        }
    }
    Err(last.unwrap_or_else(|| Error::Transient("store call failed".to_string())))
}

/* ============================= TESTS ============================= */
