mod common;

use std::sync::Arc;
use std::time::Duration;

use packplane::config::Config;
use packplane::orchestrator::Orchestrator;
use packplane::simnode::{SimNode, SimNodeConfig};
use packplane::store::Store;
use packplane::types::{NodeId, PodStatus, ServiceId, TerminationReason};

// ══════════════════════════════════════════════════════════════════
// Reconciler integration (full control plane, virtual time)
//
// Eventual-convergence properties: readyReplicas reaches the desired
// count within bounded reconcile cycles, DaemonSet coverage follows the
// fleet, and retirement drains cleanly.
// ══════════════════════════════════════════════════════════════════

const HEARTBEAT: Duration = Duration::from_secs(15);

/// Five reconcile intervals: the documented convergence bound.
fn convergence_window(config: &Config) -> Duration {
    config.reconcile_interval() * 5 + config.schedule_interval() * 2 + HEARTBEAT * 2
}

async fn ready_replicas(orchestrator: &Orchestrator, service: &ServiceId) -> u32 {
    orchestrator
        .store()
        .get_service(service)
        .await
        .ok()
        .flatten()
        .map(|s| s.ready_replicas)
        .unwrap_or(0)
}

async fn wait_ready(
    orchestrator: &Arc<Orchestrator>,
    service: &ServiceId,
    timeout: Duration,
    want: u32,
) -> bool {
    common::eventually(timeout, || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move { ready_replicas(&orchestrator, &service).await == want }
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_ready_replicas_converges_to_desired() {
    let config = Config::default();
    let (orchestrator, service) = common::boot_with_service(config.clone(), 3).await;
    let _a = SimNode::connect(&orchestrator, SimNodeConfig::named("node-a", HEARTBEAT))
        .await
        .unwrap();
    let _b = SimNode::connect(&orchestrator, SimNodeConfig::named("node-b", HEARTBEAT))
        .await
        .unwrap();

    let converged = wait_ready(&orchestrator, &service, convergence_window(&config), 3).await;
    assert!(converged, "readyReplicas never reached 3");
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_convergence_capped_by_eligible_nodes_in_daemonset_mode() {
    let config = Config::default();
    let (orchestrator, service) = common::boot_with_service(config.clone(), 0).await;
    let _a = SimNode::connect(&orchestrator, SimNodeConfig::named("node-a", HEARTBEAT))
        .await
        .unwrap();
    let _b = SimNode::connect(&orchestrator, SimNodeConfig::named("node-b", HEARTBEAT))
        .await
        .unwrap();

    // |EligibleNodes| = 2, one pod per node
    let converged = wait_ready(&orchestrator, &service, convergence_window(&config), 2).await;
    assert!(converged, "daemonset coverage never reached 2");

    // a third node joins: coverage follows
    let _c = SimNode::connect(&orchestrator, SimNodeConfig::named("node-c", HEARTBEAT))
        .await
        .unwrap();
    let extended = wait_ready(&orchestrator, &service, convergence_window(&config), 3).await;
    assert!(extended, "daemonset coverage never followed the new node");

    // and each pod sits on its own node
    let pods = orchestrator.store().list_pods_for_service(&service).await.unwrap();
    let mut nodes: Vec<_> = pods
        .iter()
        .filter(|p| p.status == PodStatus::Running)
        .map(|p| p.node_id.clone().unwrap())
        .collect();
    nodes.sort();
    nodes.dedup();
    assert_eq!(nodes.len(), 3);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_drains_without_stragglers() {
    let config = Config::default();
    let (orchestrator, service) = common::boot_with_service(config.clone(), 3).await;
    let _a = SimNode::connect(&orchestrator, SimNodeConfig::named("node-a", HEARTBEAT))
        .await
        .unwrap();

    let up = wait_ready(&orchestrator, &service, convergence_window(&config), 3).await;
    assert!(up);

    let mut svc = orchestrator.store().get_service(&service).await.unwrap().unwrap();
    svc.replicas = 1;
    svc.generation += 1;
    orchestrator.store().put_service(svc).await.unwrap();

    let window = convergence_window(&config) + config.grace_period();
    let drained = common::eventually(window, || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move {
            let pods = orchestrator.store().list_pods_for_service(&service).await.unwrap();
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
    assert!(drained, "scale-down left stragglers");
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_node_loss_replaces_pods_on_survivor() {
    let config = Config::default();
    let (orchestrator, service) = common::boot_with_service(config.clone(), 2).await;
    let a = SimNode::connect(&orchestrator, SimNodeConfig::named("node-a", HEARTBEAT))
        .await
        .unwrap();
    let _b = SimNode::connect(&orchestrator, SimNodeConfig::named("node-b", HEARTBEAT))
        .await
        .unwrap();

    let up = wait_ready(&orchestrator, &service, convergence_window(&config), 2).await;
    assert!(up);

    a.disconnect();

    // after the lease expires everything runs on node-b
    let window = config.lease_timeout() + config.health_check_interval() + convergence_window(&config);
    let replaced = common::eventually(window, || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move {
            let pods = orchestrator.store().list_pods_for_service(&service).await.unwrap();
            let on_b = pods
                .iter()
                .filter(|p| {
                    p.status == PodStatus::Running
                        && p.node_id == Some(NodeId::from("node-b"))
                })
                .count();
            on_b == 2
        }
    })
    .await;
    assert!(replaced, "pods never consolidated on the survivor");
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_follow_latest_picks_up_new_pack_registration() {
    let config = Config::default();
    let (orchestrator, service) = common::boot_with_service(config.clone(), 1).await;
    {
        let mut svc = orchestrator.store().get_service(&service).await.unwrap().unwrap();
        svc.follow_latest = true;
        svc.generation += 1;
        orchestrator.store().put_service(svc).await.unwrap();
    }
    let _a = SimNode::connect(&orchestrator, SimNodeConfig::named("node-a", HEARTBEAT))
        .await
        .unwrap();

    let up = wait_ready(&orchestrator, &service, convergence_window(&config), 1).await;
    assert!(up);

    orchestrator
        .store()
        .register_pack(common::make_pack("pack-v2", "1.2.0"))
        .await
        .unwrap();

    let adopted = common::eventually(convergence_window(&config), || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move {
            orchestrator
                .store()
                .get_service(&service)
                .await
                .unwrap()
                .unwrap()
                .pack_version
                == "1.2.0"
        }
    })
    .await;
    assert!(adopted, "follow_latest never adopted 1.2.0");

    // the rollout replaces the old pod with a 1.2.0 one
    let window = config.stability_window() + convergence_window(&config) * 2;
    let rolled = common::eventually(window, || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move {
            let pods = orchestrator.store().list_pods_for_service(&service).await.unwrap();
            pods.iter()
                .any(|p| p.status == PodStatus::Running && p.pack_version == "1.2.0")
        }
    })
    .await;
    assert!(rolled, "rollout never produced a running 1.2.0 pod");
    orchestrator.shutdown().await;
}
