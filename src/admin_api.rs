use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::chaos::{ApiRules, MessageRule, RuleDirection};
use crate::config::Config;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::registry::PartitionId;
use crate::scenario::{ScenarioKind, ScenarioRunner};
use crate::types::{ConnectionId, NodeId};

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub ready: Arc<AtomicBool>,
}

impl AdminState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> AdminState {
        AdminState {
            orchestrator,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    fn production_locked(&self) -> bool {
        self.orchestrator.config().production_mode
    }
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        // chaos surface
        .route("/chaos/enable", post(chaos_enable))
        .route("/chaos/disable", post(chaos_disable))
        .route("/chaos/stats", get(chaos_stats))
        .route("/chaos/rules", get(chaos_list_rules))
        .route("/chaos/rules/message", post(chaos_install_message_rule))
        .route("/chaos/rules/message/:id", delete(chaos_remove_message_rule))
        .route("/chaos/rules/heartbeat", post(chaos_install_heartbeat_rule))
        .route("/chaos/rules/heartbeat/:id", delete(chaos_remove_heartbeat_rule))
        .route("/chaos/api-rules", post(chaos_set_api_rules))
        .route("/chaos/api-rules", delete(chaos_clear_api_rules))
        // fabric surface
        .route("/partitions", get(list_partitions))
        .route("/partitions", post(create_partition))
        .route("/partitions/:id", delete(remove_partition))
        .route("/nodes/:id/ban", post(ban_node))
        .route("/nodes/:id/unban", post(unban_node))
        .route("/connections", get(list_connections))
        // read-only state
        .route("/nodes", get(list_nodes))
        .route("/pods", get(list_pods))
        .route("/services", get(list_services))
        // scenarios
        .route("/scenarios", get(list_scenarios))
        .route("/scenarios/:name/run", post(run_scenario))
        .with_state(state)
}

fn forbidden() -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::FORBIDDEN,
        axum::Json(json!({
            "success": false,
            "error": "refused: production mode is set"
        })),
    )
}

fn ok_json(value: serde_json::Value) -> (StatusCode, axum::Json<serde_json::Value>) {
    (StatusCode::OK, axum::Json(value))
}

/* ============================= HEALTH & METRICS ============================= */

async fn ready_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= CHAOS ============================= */

async fn chaos_enable(State(state): State<AdminState>) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    match state.orchestrator.chaos().enable() {
        Ok(()) => ok_json(json!({"success": true, "enabled": true})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn chaos_disable(State(state): State<AdminState>) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    state.orchestrator.chaos().disable();
    ok_json(json!({"success": true, "enabled": false}))
}

async fn chaos_stats(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.orchestrator.chaos().stats();
    ok_json(json!({"success": true, "stats": stats}))
}

async fn chaos_list_rules(State(state): State<AdminState>) -> impl IntoResponse {
    let chaos = state.orchestrator.chaos();
    ok_json(json!({
        "success": true,
        "enabled": chaos.is_enabled(),
        "messageRules": chaos.list_message_rules(),
        "heartbeatRules": chaos.list_heartbeat_rules(),
    }))
}

/// Rule install request; `durationMs` of zero means no auto-expiry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    direction: RuleDirection,
    #[serde(default)]
    node_id: Option<NodeId>,
    #[serde(default)]
    connection_id: Option<ConnectionId>,
    #[serde(default)]
    message_types: Option<std::collections::BTreeSet<String>>,
    #[serde(default)]
    drop_rate: f64,
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(default)]
    delay_jitter_ms: Option<u64>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

impl RuleRequest {
    fn into_rule(self, state: &AdminState) -> MessageRule {
        let chaos = state.orchestrator.chaos();
        MessageRule {
            id: self.id.unwrap_or_else(|| format!("rule-{}", Uuid::new_v4().simple())),
            direction: self.direction,
            node_id: self.node_id,
            connection_id: self.connection_id,
            message_types: self.message_types,
            drop_rate: self.drop_rate,
            delay_ms: self.delay_ms,
            delay_jitter_ms: self.delay_jitter_ms,
            expires_at_ms: chaos.expiry_for(self.duration_ms),
        }
    }
}

async fn chaos_install_message_rule(
    State(state): State<AdminState>,
    axum::Json(request): axum::Json<RuleRequest>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let rule = request.into_rule(&state);
    let id = rule.id.clone();
    match state.orchestrator.chaos().install_message_rule(rule) {
        Ok(()) => ok_json(json!({"success": true, "ruleId": id})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn chaos_remove_message_rule(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let removed = state.orchestrator.chaos().remove_message_rule(&id);
    ok_json(json!({"success": removed}))
}

async fn chaos_install_heartbeat_rule(
    State(state): State<AdminState>,
    axum::Json(request): axum::Json<RuleRequest>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let rule = request.into_rule(&state);
    let id = rule.id.clone();
    match state.orchestrator.chaos().install_heartbeat_rule(rule) {
        Ok(()) => ok_json(json!({"success": true, "ruleId": id})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn chaos_remove_heartbeat_rule(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let removed = state.orchestrator.chaos().remove_heartbeat_rule(&id);
    ok_json(json!({"success": removed}))
}

async fn chaos_set_api_rules(
    State(state): State<AdminState>,
    axum::Json(rules): axum::Json<ApiRules>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    match state.orchestrator.chaos().set_api_rules(Some(rules)) {
        Ok(()) => ok_json(json!({"success": true})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn chaos_clear_api_rules(State(state): State<AdminState>) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let _ = state.orchestrator.chaos().set_api_rules(None);
    ok_json(json!({"success": true}))
}

/* ============================= FABRIC ============================= */

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionRequest {
    nodes: Vec<NodeId>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

async fn list_partitions(State(state): State<AdminState>) -> impl IntoResponse {
    let partitions: Vec<serde_json::Value> = state
        .orchestrator
        .registry()
        .active_partitions()
        .into_iter()
        .map(|(id, members)| json!({"id": id, "members": members}))
        .collect();
    ok_json(json!({"success": true, "partitions": partitions}))
}

async fn create_partition(
    State(state): State<AdminState>,
    axum::Json(request): axum::Json<PartitionRequest>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let id = state
        .orchestrator
        .registry()
        .create_partition(request.nodes, request.duration_ms);
    ok_json(json!({"success": true, "partitionId": id}))
}

async fn remove_partition(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let removed = state.orchestrator.registry().remove_partition(PartitionId(id));
    ok_json(json!({"success": removed}))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BanRequest {
    #[serde(default)]
    duration_ms: Option<u64>,
}

async fn ban_node(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    request: Option<axum::Json<BanRequest>>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let duration = request.map(|r| r.duration_ms).unwrap_or_default();
    let node = NodeId::from(id.as_str());
    state.orchestrator.registry().ban_node(&node, duration);
    info!(node = %node, "admin_ban_node");
    ok_json(json!({"success": true}))
}

async fn unban_node(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let removed = state.orchestrator.registry().unban_node(&NodeId::from(id.as_str()));
    ok_json(json!({"success": removed}))
}

async fn list_connections(State(state): State<AdminState>) -> impl IntoResponse {
    let connections = state.orchestrator.registry().list_connections();
    ok_json(json!({"success": true, "connections": connections}))
}

/* ============================= READ-ONLY STATE ============================= */

async fn list_nodes(State(state): State<AdminState>) -> impl IntoResponse {
    match state.orchestrator.store().list_nodes().await {
        Ok(nodes) => ok_json(json!({"success": true, "nodes": nodes})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn list_pods(State(state): State<AdminState>) -> impl IntoResponse {
    match state.orchestrator.store().list_pods().await {
        Ok(pods) => ok_json(json!({"success": true, "pods": pods})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

async fn list_services(State(state): State<AdminState>) -> impl IntoResponse {
    match state.orchestrator.store().list_services().await {
        Ok(services) => ok_json(json!({"success": true, "services": services})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

/* ============================= SCENARIOS ============================= */

async fn list_scenarios(State(_state): State<AdminState>) -> impl IntoResponse {
    let scenarios: Vec<serde_json::Value> = ScenarioKind::all()
        .into_iter()
        .map(|k| json!({"name": k.name(), "description": k.description()}))
        .collect();
    ok_json(json!({"success": true, "scenarios": scenarios}))
}

/// Scenario runs from the admin surface use a compressed timing table so a
/// request completes in seconds of real time.
const SCENARIO_TIME_COMPRESSION: u64 = 100;

async fn run_scenario(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.production_locked() {
        return forbidden();
    }
    let Some(kind) = ScenarioKind::by_name(&name) else {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({"success": false, "error": format!("unknown scenario {name}")})),
        );
    };
    let config = base_scenario_config(state.orchestrator.config());
    let runner = ScenarioRunner::new(config.accelerated(SCENARIO_TIME_COMPRESSION));
    match runner.run(kind).await {
        Ok(outcome) => ok_json(json!({"success": outcome.passed, "outcome": outcome})),
        Err(e) => ok_json(json!({"success": false, "error": e.to_string()})),
    }
}

fn base_scenario_config(config: &Config) -> Config {
    Config {
        production_mode: false,
        chaos_enabled: true,
        pod_token_secret: None,
        chaos_seed: if config.chaos_seed == 0 { 1 } else { config.chaos_seed },
        ..Config::default()
    }
}

/* ============================= TESTS ============================= */
