mod common;

use std::sync::Arc;
use std::time::Duration;

use packplane::config::Config;
use packplane::orchestrator::Orchestrator;
use packplane::simnode::{SimNode, SimNodeConfig};
use packplane::store::Store;
use packplane::types::{NodeId, NodeStatus, PodStatus, ServiceId, TerminationReason};

// ══════════════════════════════════════════════════════════════════
// Node health integration (full control plane, virtual time)
//
// Drives the ONLINE → SUSPECT → OFFLINE machine through real heartbeat
// traffic from a simulated node, with the documented timing boundaries.
// ══════════════════════════════════════════════════════════════════

async fn node_status(orchestrator: &Orchestrator, node: &NodeId) -> Option<NodeStatus> {
    orchestrator
        .store()
        .get_node(node)
        .await
        .ok()
        .flatten()
        .map(|n| n.status)
}

async fn wait_status(
    orchestrator: &Arc<Orchestrator>,
    node: &NodeId,
    timeout: Duration,
    want: NodeStatus,
) -> bool {
    common::eventually(timeout, || {
        let orchestrator = orchestrator.clone();
        let node = node.clone();
        async move { node_status(&orchestrator, &node).await == Some(want) }
    })
    .await
}

async fn wait_running(
    orchestrator: &Arc<Orchestrator>,
    service: &ServiceId,
    timeout: Duration,
) -> bool {
    common::eventually(timeout, || {
        let orchestrator = orchestrator.clone();
        let service = service.clone();
        async move {
            orchestrator
                .store()
                .list_pods_for_service(&service)
                .await
                .unwrap()
                .iter()
                .any(|p| p.status == PodStatus::Running)
        }
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_heartbeating_node_stays_online_indefinitely() {
    let orchestrator = common::boot(Config::default()).await;
    let node = SimNode::connect(
        &orchestrator,
        SimNodeConfig::named("node-a", Duration::from_secs(15)),
    )
    .await
    .unwrap();
    let id = node.node_id();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(node_status(&orchestrator, &id).await, Some(NodeStatus::Online));
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_walks_suspect_then_offline() {
    let orchestrator = common::boot(Config::default()).await;
    let node = SimNode::connect(
        &orchestrator,
        SimNodeConfig::named("node-a", Duration::from_secs(15)),
    )
    .await
    .unwrap();
    let id = node.node_id();
    tokio::time::sleep(Duration::from_secs(20)).await;

    node.disconnect();

    // before the heartbeat timeout: still online
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(node_status(&orchestrator, &id).await, Some(NodeStatus::Online));

    // past the heartbeat timeout plus a sweep: suspect
    let demoted = wait_status(&orchestrator, &id, Duration::from_secs(60), NodeStatus::Suspect).await;
    assert!(demoted, "node never became suspect");

    // past the lease timeout plus a sweep: offline
    let offline = wait_status(&orchestrator, &id, Duration::from_secs(120), NodeStatus::Offline).await;
    assert!(offline, "node never went offline");
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_transition_fails_pods_with_node_lost() {
    let (orchestrator, service) = common::boot_with_service(Config::default(), 1).await;
    let node = SimNode::connect(
        &orchestrator,
        SimNodeConfig::named("node-a", Duration::from_secs(15)),
    )
    .await
    .unwrap();
    let id = node.node_id();

    let placed = wait_running(&orchestrator, &service, Duration::from_secs(60)).await;
    assert!(placed, "pod never started running");

    node.disconnect();
    let offline = wait_status(&orchestrator, &id, Duration::from_secs(200), NodeStatus::Offline).await;
    assert!(offline);

    // the placement batch-failed with the infrastructure reason
    let pods = orchestrator.store().list_pods_for_service(&service).await.unwrap();
    let lost: Vec<_> = pods
        .iter()
        .filter(|p| p.termination_reason == Some(TerminationReason::NodeLost))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].status, PodStatus::Failed);

    // capacity accounting survived the batch
    let record = orchestrator.store().get_node(&id).await.unwrap().unwrap();
    assert!(record.allocated.is_non_negative());
    assert_eq!(record.allocated.pods, 0);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_online_and_clears_stale_claim() {
    let (orchestrator, service) = common::boot_with_service(Config::default(), 1).await;
    let node = SimNode::connect(
        &orchestrator,
        SimNodeConfig::named("node-a", Duration::from_secs(15)),
    )
    .await
    .unwrap();
    let id = node.node_id();

    let placed = wait_running(&orchestrator, &service, Duration::from_secs(60)).await;
    assert!(placed);
    let old_pod = orchestrator
        .store()
        .list_pods_for_service(&service)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.status == PodStatus::Running)
        .unwrap()
        .id;

    let reconnect = node.reconnect_config();
    node.disconnect();
    let offline = wait_status(&orchestrator, &id, Duration::from_secs(200), NodeStatus::Offline).await;
    assert!(offline);

    // reconnect still claiming the failed pod
    let node = SimNode::connect(&orchestrator, reconnect).await.unwrap();
    let online = wait_status(&orchestrator, &id, Duration::from_secs(60), NodeStatus::Online).await;
    assert!(online);

    // the stale claim is stopped; a replacement may well land here too
    let node_ref = &node;
    let cleared = common::eventually(Duration::from_secs(60), || {
        let old_pod = old_pod.clone();
        async move { !node_ref.claimed_pods().contains(&old_pod) }
    })
    .await;
    assert!(cleared, "stale claim never stopped");
    assert!(node.stops_received_for(&old_pod) >= 1);
    orchestrator.shutdown().await;
}
