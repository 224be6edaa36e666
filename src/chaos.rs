use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::NODE_HEARTBEAT;
use crate::registry::{Decision, Interceptor, MessageDirection};
use crate::types::{ConnectionId, NodeId};

/* ============================= RULES ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

impl RuleDirection {
    fn applies_to(self, direction: MessageDirection) -> bool {
        match self {
            RuleDirection::Both => true,
            RuleDirection::Incoming => direction == MessageDirection::Incoming,
            RuleDirection::Outgoing => direction == MessageDirection::Outgoing,
        }
    }
}

/// One installed fault rule. Filters narrow the candidate set; the PRNG
/// decides per candidate message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRule {
    pub id: String,
    #[serde(default)]
    pub direction: RuleDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// `None` matches every message type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_types: Option<BTreeSet<String>>,
    #[serde(default)]
    pub drop_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_jitter_ms: Option<u64>,
    /// Monotonic clock millis; `None` means no auto-expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl MessageRule {
    fn applies(
        &self,
        now_ms: u64,
        direction: MessageDirection,
        node: Option<&NodeId>,
        connection: ConnectionId,
        msg_type: &str,
    ) -> bool {
        if let Some(expiry) = self.expires_at_ms
            && now_ms >= expiry
        {
            return false;
        }
        if !self.direction.applies_to(direction) {
            return false;
        }
        if let Some(rule_node) = &self.node_id
            && node != Some(rule_node)
        {
            return false;
        }
        if let Some(rule_conn) = self.connection_id
            && rule_conn != connection
        {
            return false;
        }
        if let Some(types) = &self.message_types
            && !types.contains(msg_type)
        {
            return false;
        }
        true
    }
}

/// Synthetic failure rates for store/API calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiRules {
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub timeout_rate: f64,
    #[serde(default)]
    pub timeout_ms: u64,
}

/* ============================= STATE ============================= */

#[derive(Debug, Default)]
struct ChaosState {
    enabled: bool,
    message_rules: Vec<MessageRule>,
    heartbeat_rules: Vec<MessageRule>,
    api_rules: Option<ApiRules>,
}

/// Decision counters; the drop counter is the §-level accounting the tests
/// reconcile against.
#[derive(Debug, Default)]
pub struct ChaosStats {
    pub messages_dropped: AtomicU64,
    pub messages_delayed: AtomicU64,
    pub api_calls_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStatsSnapshot {
    pub messages_dropped: u64,
    pub messages_delayed: u64,
    pub api_calls_failed: u64,
}

/* ============================= ENGINE ============================= */

/// Rule store plus deterministic RNG, consulted by the registry on every
/// send and receive.
///
/// Rule state is copy-on-write: installs clone the state and swap it, so
/// evaluators read a consistent snapshot without a per-message lock. All
/// randomness flows from the seed; two runs with the same seed and the same
/// message order produce identical decision traces.
pub struct ChaosEngine {
    production_mode: bool,
    state: ArcSwap<ChaosState>,
    rng: Mutex<StdRng>,
    clock: Arc<Clock>,
    stats: ChaosStats,
}

impl ChaosEngine {
    pub fn new(seed: u64, production_mode: bool, clock: Arc<Clock>) -> Arc<ChaosEngine> {
        Arc::new(ChaosEngine {
            production_mode,
            state: ArcSwap::from_pointee(ChaosState::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            clock,
            stats: ChaosStats::default(),
        })
    }

    /* ── enablement ── */

    pub fn enable(&self) -> Result<()> {
        if self.production_mode {
            error!("chaos_enable_refused_in_production");
            return Err(Error::Policy(
                "chaos injection is disabled in production".to_string(),
            ));
        }
        self.mutate(|s| s.enabled = true);
        info!("chaos_enabled");
        Ok(())
    }

    pub fn disable(&self) {
        self.mutate(|s| s.enabled = false);
        info!("chaos_disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load().enabled
    }

    /// Reset the PRNG stream; used by the scenario runner for reproducible
    /// traces.
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    /* ── rule management ── */

    /// Normalise a requested duration: zero means "no auto-expiry".
    pub fn expiry_for(&self, duration_ms: Option<u64>) -> Option<u64> {
        duration_ms.filter(|d| *d > 0).map(|d| self.clock.now_ms() + d)
    }

    pub fn install_message_rule(&self, rule: MessageRule) -> Result<()> {
        self.require_enabled()?;
        info!(rule = %rule.id, drop_rate = rule.drop_rate, delay_ms = ?rule.delay_ms, "chaos_rule_installed");
        self.mutate(|s| {
            s.message_rules.retain(|r| r.id != rule.id);
            s.message_rules.push(rule.clone());
        });
        self.refresh_rule_gauges();
        Ok(())
    }

    pub fn remove_message_rule(&self, id: &str) -> bool {
        let mut removed = false;
        self.mutate(|s| {
            let before = s.message_rules.len();
            s.message_rules.retain(|r| r.id != id);
            removed = s.message_rules.len() != before;
        });
        self.refresh_rule_gauges();
        removed
    }

    /// Heartbeat rules are message rules constrained to `node:heartbeat`.
    pub fn install_heartbeat_rule(&self, mut rule: MessageRule) -> Result<()> {
        self.require_enabled()?;
        rule.message_types = Some(BTreeSet::from([NODE_HEARTBEAT.to_string()]));
        info!(rule = %rule.id, delay_ms = ?rule.delay_ms, "chaos_heartbeat_rule_installed");
        self.mutate(|s| {
            s.heartbeat_rules.retain(|r| r.id != rule.id);
            s.heartbeat_rules.push(rule.clone());
        });
        self.refresh_rule_gauges();
        Ok(())
    }

    pub fn remove_heartbeat_rule(&self, id: &str) -> bool {
        let mut removed = false;
        self.mutate(|s| {
            let before = s.heartbeat_rules.len();
            s.heartbeat_rules.retain(|r| r.id != id);
            removed = s.heartbeat_rules.len() != before;
        });
        self.refresh_rule_gauges();
        removed
    }

    pub fn set_api_rules(&self, rules: Option<ApiRules>) -> Result<()> {
        if rules.is_some() {
            self.require_enabled()?;
        }
        self.mutate(|s| s.api_rules = rules);
        Ok(())
    }

    /// Drop every installed rule; part of orchestrator shutdown.
    pub fn flush(&self) {
        self.mutate(|s| {
            s.message_rules.clear();
            s.heartbeat_rules.clear();
            s.api_rules = None;
        });
        self.refresh_rule_gauges();
    }

    pub fn list_message_rules(&self) -> Vec<MessageRule> {
        self.state.load().message_rules.clone()
    }

    pub fn list_heartbeat_rules(&self) -> Vec<MessageRule> {
        self.state.load().heartbeat_rules.clone()
    }

    /* ── evaluation ── */

    fn evaluate(
        &self,
        direction: MessageDirection,
        connection: ConnectionId,
        node: Option<&NodeId>,
        msg_type: &str,
    ) -> Decision {
        let state = self.state.load();
        if !state.enabled {
            return Decision::Forward;
        }
        let now_ms = self.clock.now_ms();

        let heartbeat_rules = if msg_type == NODE_HEARTBEAT {
            state.heartbeat_rules.as_slice()
        } else {
            &[]
        };

        let mut max_delay: Option<u64> = None;
        for rule in state.message_rules.iter().chain(heartbeat_rules) {
            if !rule.applies(now_ms, direction, node, connection, msg_type) {
                continue;
            }
            // one uniform draw per matching rule; first drop wins
            let roll: f64 = self.rng.lock().random();
            if roll < rule.drop_rate {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::MESSAGES_DROPPED_CHAOS.inc();
                return Decision::Drop;
            }
            if let Some(delay) = rule.delay_ms {
                let jitter = match rule.delay_jitter_ms {
                    Some(j) if j > 0 => self.rng.lock().random_range(0..=j),
                    _ => 0,
                };
                let total = delay + jitter;
                if max_delay.is_none_or(|d| total > d) {
                    max_delay = Some(total);
                }
            }
        }

        match max_delay {
            Some(ms) if ms > 0 => {
                self.stats.messages_delayed.fetch_add(1, Ordering::Relaxed);
                metrics::MESSAGES_DELAYED.inc();
                Decision::Delay(Duration::from_millis(ms))
            }
            _ => Decision::Forward,
        }
    }

    /// Synthetic store/API failure gate: error, timeout, or pass-through.
    pub async fn maybe_fail_api_call(&self) -> Result<()> {
        let Some(rules) = self.state.load().api_rules else {
            return Ok(());
        };
        if !self.is_enabled() {
            return Ok(());
        }
        let roll: f64 = self.rng.lock().random();
        if roll < rules.error_rate {
            self.stats.api_calls_failed.fetch_add(1, Ordering::Relaxed);
            metrics::API_CALLS_FAILED_CHAOS.inc();
            return Err(Error::Transient("chaos-injected api failure".to_string()));
        }
        if roll < rules.error_rate + rules.timeout_rate {
            self.stats.api_calls_failed.fetch_add(1, Ordering::Relaxed);
            metrics::API_CALLS_FAILED_CHAOS.inc();
            tokio::time::sleep(Duration::from_millis(rules.timeout_ms)).await;
            return Err(Error::Timeout("chaos-injected api timeout".to_string()));
        }
        Ok(())
    }

    pub fn stats(&self) -> ChaosStatsSnapshot {
        ChaosStatsSnapshot {
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            messages_delayed: self.stats.messages_delayed.load(Ordering::Relaxed),
            api_calls_failed: self.stats.api_calls_failed.load(Ordering::Relaxed),
        }
    }

    /* ── internals ── */

    fn require_enabled(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::Policy("chaos is not enabled".to_string()));
        }
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut ChaosState)) {
        // copy-on-write: clone, mutate, swap
        let current = self.state.load();
        let mut next = ChaosState {
            enabled: current.enabled,
            message_rules: current.message_rules.clone(),
            heartbeat_rules: current.heartbeat_rules.clone(),
            api_rules: current.api_rules,
        };
        f(&mut next);
        self.state.store(Arc::new(next));
    }

    fn refresh_rule_gauges(&self) {
        let state = self.state.load();
        metrics::CHAOS_RULES_ACTIVE
            .with_label_values(&["message"])
            .set(state.message_rules.len() as i64);
        metrics::CHAOS_RULES_ACTIVE
            .with_label_values(&["heartbeat"])
            .set(state.heartbeat_rules.len() as i64);
    }
}

impl Interceptor for ChaosEngine {
    fn intercept_outgoing(
        &self,
        connection: ConnectionId,
        node: Option<&NodeId>,
        msg_type: &str,
    ) -> Decision {
        self.evaluate(MessageDirection::Outgoing, connection, node, msg_type)
    }

    fn intercept_incoming(
        &self,
        connection: ConnectionId,
        node: Option<&NodeId>,
        msg_type: &str,
    ) -> Decision {
        self.evaluate(MessageDirection::Incoming, connection, node, msg_type)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NODE_HEARTBEAT, POD_DEPLOY};

    fn engine(seed: u64) -> Arc<ChaosEngine> {
        let e = ChaosEngine::new(seed, false, Clock::new());
        e.enable().unwrap();
        e
    }

    fn drop_all(id: &str) -> MessageRule {
        MessageRule {
            id: id.to_string(),
            direction: RuleDirection::Both,
            node_id: None,
            connection_id: None,
            message_types: None,
            drop_rate: 1.0,
            delay_ms: None,
            delay_jitter_ms: None,
            expires_at_ms: None,
        }
    }

    #[tokio::test]
    async fn test_enable_refused_in_production() {
        let e = ChaosEngine::new(1, true, Clock::new());
        let err = e.enable().unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
        assert!(!e.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_engine_forwards_everything() {
        let e = ChaosEngine::new(1, false, Clock::new());
        // rules cannot even be installed while disabled
        assert!(e.install_message_rule(drop_all("r1")).is_err());
        assert_eq!(
            e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
            Decision::Forward
        );
    }

    #[tokio::test]
    async fn test_drop_rate_one_always_drops() {
        let e = engine(1);
        e.install_message_rule(drop_all("r1")).unwrap();
        for _ in 0..20 {
            assert_eq!(
                e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
                Decision::Drop
            );
        }
        assert_eq!(e.stats().messages_dropped, 20);
    }

    #[tokio::test]
    async fn test_drop_rate_zero_never_drops() {
        let e = engine(1);
        let mut rule = drop_all("r1");
        rule.drop_rate = 0.0;
        e.install_message_rule(rule).unwrap();
        for _ in 0..20 {
            assert_eq!(
                e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
                Decision::Forward
            );
        }
        assert_eq!(e.stats().messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_same_seed_same_decision_trace() {
        let a = engine(42);
        let b = engine(42);
        for e in [&a, &b] {
            let mut rule = drop_all("half");
            rule.drop_rate = 0.5;
            e.install_message_rule(rule).unwrap();
        }
        let trace_a: Vec<Decision> = (0..64)
            .map(|_| a.intercept_incoming(ConnectionId(1), None, POD_DEPLOY))
            .collect();
        let trace_b: Vec<Decision> = (0..64)
            .map(|_| b.intercept_incoming(ConnectionId(1), None, POD_DEPLOY))
            .collect();
        assert_eq!(trace_a, trace_b);
        assert_eq!(a.stats().messages_dropped, b.stats().messages_dropped);
    }

    #[tokio::test]
    async fn test_rule_filters_by_node_and_type() {
        let e = engine(1);
        let mut rule = drop_all("node-a-heartbeats");
        rule.node_id = Some(NodeId::from("node-a"));
        rule.message_types = Some(BTreeSet::from([NODE_HEARTBEAT.to_string()]));
        e.install_message_rule(rule).unwrap();

        let node_a = NodeId::from("node-a");
        let node_b = NodeId::from("node-b");
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), Some(&node_a), NODE_HEARTBEAT),
            Decision::Drop
        );
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), Some(&node_b), NODE_HEARTBEAT),
            Decision::Forward
        );
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), Some(&node_a), POD_DEPLOY),
            Decision::Forward
        );
    }

    #[tokio::test]
    async fn test_direction_scoping() {
        let e = engine(1);
        let mut rule = drop_all("out-only");
        rule.direction = RuleDirection::Outgoing;
        e.install_message_rule(rule).unwrap();
        assert_eq!(
            e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
            Decision::Drop
        );
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), None, POD_DEPLOY),
            Decision::Forward
        );
    }

    #[tokio::test]
    async fn test_largest_delay_among_matching_rules_wins() {
        let e = engine(1);
        let mut short = drop_all("short");
        short.drop_rate = 0.0;
        short.delay_ms = Some(100);
        let mut long = drop_all("long");
        long.drop_rate = 0.0;
        long.delay_ms = Some(500);
        e.install_message_rule(short).unwrap();
        e.install_message_rule(long).unwrap();

        match e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY) {
            Decision::Delay(d) => assert_eq!(d, Duration::from_millis(500)),
            other => panic!("expected delay, got {other:?}"),
        }
        assert_eq!(e.stats().messages_delayed, 1);
    }

    #[tokio::test]
    async fn test_first_matching_drop_wins_over_later_delay() {
        let e = engine(1);
        e.install_message_rule(drop_all("dropper")).unwrap();
        let mut delayer = drop_all("delayer");
        delayer.drop_rate = 0.0;
        delayer.delay_ms = Some(500);
        e.install_message_rule(delayer).unwrap();
        assert_eq!(
            e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
            Decision::Drop
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_expiry() {
        let clock = Clock::new();
        let e = ChaosEngine::new(1, false, clock.clone());
        e.enable().unwrap();
        let mut rule = drop_all("ephemeral");
        rule.expires_at_ms = e.expiry_for(Some(1_000));
        e.install_message_rule(rule).unwrap();

        assert_eq!(
            e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
            Decision::Drop
        );
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(
            e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
            Decision::Forward
        );
    }

    #[tokio::test]
    async fn test_zero_duration_means_no_expiry() {
        let e = engine(1);
        assert_eq!(e.expiry_for(Some(0)), None);
        assert_eq!(e.expiry_for(None), None);
        assert!(e.expiry_for(Some(5_000)).is_some());
    }

    #[tokio::test]
    async fn test_remove_rule_restores_baseline() {
        let e = engine(1);
        e.install_message_rule(drop_all("r1")).unwrap();
        assert!(e.remove_message_rule("r1"));
        assert!(!e.remove_message_rule("r1"));
        for _ in 0..10 {
            assert_eq!(
                e.intercept_outgoing(ConnectionId(1), None, POD_DEPLOY),
                Decision::Forward
            );
        }
    }

    #[tokio::test]
    async fn test_heartbeat_rules_only_touch_heartbeats() {
        let e = engine(1);
        let mut rule = drop_all("hb");
        // any message_types filter set here is overwritten
        rule.message_types = None;
        e.install_heartbeat_rule(rule).unwrap();
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), None, NODE_HEARTBEAT),
            Decision::Drop
        );
        assert_eq!(
            e.intercept_incoming(ConnectionId(1), None, POD_DEPLOY),
            Decision::Forward
        );
    }

    #[tokio::test]
    async fn test_api_error_rate_one_always_fails() {
        let e = engine(1);
        e.set_api_rules(Some(ApiRules {
            error_rate: 1.0,
            timeout_rate: 0.0,
            timeout_ms: 0,
        }))
        .unwrap();
        let err = e.maybe_fail_api_call().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(e.stats().api_calls_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_timeout_suspends_then_fails() {
        let e = engine(1);
        e.set_api_rules(Some(ApiRules {
            error_rate: 0.0,
            timeout_rate: 1.0,
            timeout_ms: 2_000,
        }))
        .unwrap();
        let start = tokio::time::Instant::now();
        let err = e.maybe_fail_api_call().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let e = engine(1);
        e.install_message_rule(drop_all("r1")).unwrap();
        e.install_heartbeat_rule(drop_all("hb")).unwrap();
        e.set_api_rules(Some(ApiRules { error_rate: 1.0, ..Default::default() })).unwrap();
        e.flush();
        assert!(e.list_message_rules().is_empty());
        assert!(e.list_heartbeat_rules().is_empty());
        assert!(e.maybe_fail_api_call().await.is_ok());
    }
}
