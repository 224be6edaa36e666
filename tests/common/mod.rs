#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use packplane::clock::Clock;
use packplane::config::Config;
use packplane::orchestrator::Orchestrator;
use packplane::store::Store;
use packplane::types::*;

pub fn make_node(id: &str) -> NodeRecord {
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

pub fn make_pack(id: &str, version: &str) -> PackRecord {
    PackRecord {
        id: PackId::from(id),
        name: "pingpong".to_string(),
        version: version.to_string(),
        runtime_tag: RuntimeTag::Universal,
        namespace: PackNamespace::User,
        visibility: PackVisibility::Private,
        bundle_ref: format!("bundle://pingpong/{version}"),
        metadata: PackMetadata::default(),
        granted_capabilities: vec![],
        registered_at: Utc::now(),
    }
}

pub fn make_pod(id: &str, pack: &str, priority: i32) -> PodRecord {
    PodRecord {
        id: PodId::from(id),
        pack_id: PackId::from(pack),
        pack_version: "1.0.0".to_string(),
        node_id: None,
        status: PodStatus::Pending,
        status_message: None,
        termination_reason: None,
        namespace: "user".to_string(),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        priority,
        tolerations: vec![],
        resource_requests: ResourceVector::new(100, 128, 1, 0),
        resource_limits: None,
        scheduling: SchedulingSpec::default(),
        created_by: None,
        incarnation: 0,
        created_at: Utc::now(),
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

pub fn make_service(id: &str, replicas: u32) -> ServiceRecord {
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

/// Full control plane on the in-memory store with all loops running.
pub async fn boot(config: Config) -> Arc<Orchestrator> {
    let orchestrator = Orchestrator::new(config).expect("config is valid");
    orchestrator.start();
    orchestrator
}

/// Boot with a pack and a service pre-registered.
pub async fn boot_with_service(config: Config, replicas: u32) -> (Arc<Orchestrator>, ServiceId) {
    let orchestrator = boot(config).await;
    orchestrator
        .store()
        .register_pack(make_pack("pack-v1", "1.0.0"))
        .await
        .expect("pack registers");
    let service = make_service("svc-1", replicas);
    let id = service.id.clone();
    orchestrator.store().put_service(service).await.expect("service stores");
    (orchestrator, id)
}

/// Poll a predicate against the store until it holds or the deadline passes.
pub async fn eventually<F, Fut>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

pub fn clock() -> Arc<Clock> {
    Clock::new()
}
