use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::SchedulingPolicy;

/* ============================= CONFIG ============================= */

/// Effective configuration of the control plane.
///
/// Every timing constant scenarios depend on is a field here; all of them
/// can be overridden from a YAML file and from the environment. Durations
/// are stored as milliseconds so partial YAML configs stay trivial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Disables chaos globally and requires a pod token secret.
    pub production_mode: bool,
    /// Opt-in for the chaos surface outside production.
    pub chaos_enabled: bool,
    /// Seed for the chaos PRNG; identical seeds give identical decision traces.
    pub chaos_seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_token_secret: Option<String>,

    // timing table (§ wire defaults)
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub lease_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub schedule_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_max_attempts: u32,

    // per-operation deadlines
    pub scheduler_tick_timeout_ms: u64,
    pub reconciler_tick_timeout_ms: u64,
    pub store_call_timeout_ms: u64,

    // scheduler
    pub max_pods_per_run: usize,
    pub scheduling_policy: SchedulingPolicy,
    pub enable_preemption: bool,
    pub crash_loop_backoff_base_ms: u64,
    pub crash_loop_backoff_ceiling_ms: u64,
    pub stability_window_ms: u64,

    // reconciler
    pub grace_period_ms: u64,
    pub fail_threshold: u32,
    pub rollout_batch_size: usize,

    // registry
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub max_queue: usize,
    pub max_paused_queue: usize,

    // admin surface
    pub admin_addr: String,

    /// Named priority classes resolved into pod priority.
    pub priority_classes: BTreeMap<String, i32>,
}

impl Default for Config {
    fn default() -> Self {
        let mut priority_classes = BTreeMap::new();
        priority_classes.insert("system-critical".to_string(), 1000);
        priority_classes.insert("high".to_string(), 100);
        priority_classes.insert("default".to_string(), 0);

        Config {
            production_mode: false,
            chaos_enabled: false,
            chaos_seed: 0,
            pod_token_secret: None,

            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 60_000,
            lease_timeout_ms: 120_000,
            health_check_interval_ms: 30_000,
            schedule_interval_ms: 5_000,
            reconcile_interval_ms: 10_000,
            reconnect_backoff_initial_ms: 5_000,
            reconnect_max_attempts: 10,

            scheduler_tick_timeout_ms: 5_000,
            reconciler_tick_timeout_ms: 15_000,
            store_call_timeout_ms: 5_000,

            max_pods_per_run: 10,
            scheduling_policy: SchedulingPolicy::Spread,
            enable_preemption: false,
            crash_loop_backoff_base_ms: 10_000,
            crash_loop_backoff_ceiling_ms: 300_000,
            stability_window_ms: 60_000,

            grace_period_ms: 10_000,
            fail_threshold: 3,
            rollout_batch_size: 1,

            max_connections: 1024,
            max_connections_per_ip: 32,
            max_queue: 1024,
            max_paused_queue: 256,

            admin_addr: "0.0.0.0:7070".to_string(),

            priority_classes,
        }
    }
}

macro_rules! duration_accessor {
    ($fn_name:ident, $field:ident) => {
        pub fn $fn_name(&self) -> Duration {
            Duration::from_millis(self.$field)
        }
    };
}

impl Config {
    duration_accessor!(heartbeat_interval, heartbeat_interval_ms);
    duration_accessor!(heartbeat_timeout, heartbeat_timeout_ms);
    duration_accessor!(lease_timeout, lease_timeout_ms);
    duration_accessor!(health_check_interval, health_check_interval_ms);
    duration_accessor!(schedule_interval, schedule_interval_ms);
    duration_accessor!(reconcile_interval, reconcile_interval_ms);
    duration_accessor!(scheduler_tick_timeout, scheduler_tick_timeout_ms);
    duration_accessor!(reconciler_tick_timeout, reconciler_tick_timeout_ms);
    duration_accessor!(store_call_timeout, store_call_timeout_ms);
    duration_accessor!(stability_window, stability_window_ms);
    duration_accessor!(grace_period, grace_period_ms);

    /// Load a YAML config file and apply environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Validation(format!("config file {}: {e}", p.display())))?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| Error::Validation(format!("config file {}: {e}", p.display())))?
            }
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides; names are normative (§ external interfaces).
    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("PRODUCTION_MODE") {
            self.production_mode = v;
        }
        if let Some(v) = env_bool("CHAOS_ENABLED") {
            self.chaos_enabled = v;
        }
        if let Ok(v) = std::env::var("CHAOS_SEED")
            && let Ok(seed) = v.parse()
        {
            self.chaos_seed = seed;
        }
        if let Ok(v) = std::env::var("POD_TOKEN_SECRET")
            && !v.is_empty()
        {
            self.pod_token_secret = Some(v);
        }
        for (name, field) in [
            ("HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms),
            ("HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms),
            ("LEASE_TIMEOUT_MS", &mut self.lease_timeout_ms),
            ("HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms),
            ("SCHEDULE_INTERVAL_MS", &mut self.schedule_interval_ms),
            ("RECONCILE_INTERVAL_MS", &mut self.reconcile_interval_ms),
        ] {
            if let Ok(v) = std::env::var(name)
                && let Ok(ms) = v.parse()
            {
                *field = ms;
            }
        }
        if let Ok(v) = std::env::var("SCHEDULING_POLICY")
            && let Ok(policy) = serde_json::from_value(serde_json::Value::String(v))
        {
            self.scheduling_policy = policy;
        }
        if let Some(v) = env_bool("ENABLE_PREEMPTION") {
            self.enable_preemption = v;
        }
        if let Ok(v) = std::env::var("ADMIN_ADDR")
            && !v.is_empty()
        {
            self.admin_addr = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.production_mode && self.pod_token_secret.is_none() {
            return Err(Error::Validation(
                "POD_TOKEN_SECRET is required in production mode".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Validation(
                "heartbeat timeout must exceed the heartbeat interval".to_string(),
            ));
        }
        if self.lease_timeout_ms <= self.heartbeat_timeout_ms {
            return Err(Error::Validation(
                "lease timeout must exceed the heartbeat timeout".to_string(),
            ));
        }
        if self.fail_threshold == 0 || self.rollout_batch_size == 0 {
            return Err(Error::Validation(
                "fail threshold and rollout batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Chaos is active only when opted in and not locked out by production.
    pub fn chaos_permitted(&self) -> bool {
        self.chaos_enabled && !self.production_mode
    }

    /// Exponent clamp for the backoff curve. The persisted consecutive
    /// failure counter saturates at the same bound so neither can run away.
    pub const BACKOFF_EXPONENT_CAP: u32 = 20;

    /// Crash-loop / rollout backoff: `min(2^n · base, ceiling)`.
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.min(Self::BACKOFF_EXPONENT_CAP);
        let ms = (1u64 << exp)
            .saturating_mul(self.crash_loop_backoff_base_ms)
            .min(self.crash_loop_backoff_ceiling_ms);
        Duration::from_millis(ms)
    }

    pub fn resolve_priority_class(&self, name: Option<&str>) -> i32 {
        name.and_then(|n| self.priority_classes.get(n).copied()).unwrap_or(0)
    }

    /// Compress every timing field by `divisor`; used when running
    /// scenarios from the CLI against real time.
    pub fn accelerated(mut self, divisor: u64) -> Config {
        let d = divisor.max(1);
        for field in [
            &mut self.heartbeat_interval_ms,
            &mut self.heartbeat_timeout_ms,
            &mut self.lease_timeout_ms,
            &mut self.health_check_interval_ms,
            &mut self.schedule_interval_ms,
            &mut self.reconcile_interval_ms,
            &mut self.reconnect_backoff_initial_ms,
            &mut self.crash_loop_backoff_base_ms,
            &mut self.crash_loop_backoff_ceiling_ms,
            &mut self.stability_window_ms,
            &mut self.grace_period_ms,
        ] {
            *field = (*field / d).max(1);
        }
        self
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(v) => Some(matches!(v.as_str(), "1" | "true" | "TRUE" | "yes")),
        Err(_) => None,
    }
}

/* ============================= TESTS ============================= */
