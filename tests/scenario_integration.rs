mod common;

use packplane::config::Config;
use packplane::scenario::{ScenarioKind, ScenarioRunner};

// ══════════════════════════════════════════════════════════════════
// End-to-end chaos scenarios (virtual time, default constants, seed 1)
//
// Each test boots a fresh control plane with simulated nodes through
// the ScenarioRunner and checks every step of the documented timeline.
// ══════════════════════════════════════════════════════════════════

fn runner() -> ScenarioRunner {
    ScenarioRunner::new(Config {
        chaos_seed: 1,
        ..Default::default()
    })
}

async fn assert_scenario_passes(kind: ScenarioKind) {
    let outcome = runner().run(kind).await.expect("scenario runs");
    let failed: Vec<String> = outcome
        .steps
        .iter()
        .filter(|s| !s.passed)
        .map(|s| match &s.detail {
            Some(detail) => format!("{} ({detail})", s.description),
            None => s.description.clone(),
        })
        .collect();
    assert!(
        outcome.passed,
        "scenario {} failed steps: {failed:?}",
        outcome.scenario
    );
}

#[tokio::test(start_paused = true)]
async fn test_scenario_node_ban_reschedule() {
    assert_scenario_passes(ScenarioKind::NodeBanReschedule).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_fast_unban() {
    assert_scenario_passes(ScenarioKind::FastUnban).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_heartbeat_delay_below_threshold() {
    assert_scenario_passes(ScenarioKind::HeartbeatDelayBelowThreshold).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_heartbeat_delay_above_threshold() {
    assert_scenario_passes(ScenarioKind::HeartbeatDelayAboveThreshold).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_service_scale_down() {
    assert_scenario_passes(ScenarioKind::ServiceScaleDown).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_crash_loop_rollback() {
    assert_scenario_passes(ScenarioKind::CrashLoopRollback).await;
}

#[tokio::test(start_paused = true)]
async fn test_scenarios_are_reproducible_with_same_seed() {
    // two runs of the same scenario with the same seed agree step by step
    let first = runner().run(ScenarioKind::FastUnban).await.unwrap();
    let second = runner().run(ScenarioKind::FastUnban).await.unwrap();
    assert_eq!(first.passed, second.passed);
    assert_eq!(first.steps.len(), second.steps.len());
    for (a, b) in first.steps.iter().zip(second.steps.iter()) {
        assert_eq!(a.passed, b.passed, "step {:?} diverged", a.description);
    }
}
