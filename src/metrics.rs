use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

macro_rules! int_counter {
    ($static_name:ident, $name:literal, $help:literal) => {
        pub static $static_name: LazyLock<IntCounter> = LazyLock::new(|| {
            let c = IntCounter::new($name, $help).expect("metric definition is valid");
            REGISTRY
                .register(Box::new(c.clone()))
                .expect("metric not yet registered");
            c
        });
    };
}

macro_rules! int_gauge {
    ($static_name:ident, $name:literal, $help:literal) => {
        pub static $static_name: LazyLock<IntGauge> = LazyLock::new(|| {
            let g = IntGauge::new($name, $help).expect("metric definition is valid");
            REGISTRY
                .register(Box::new(g.clone()))
                .expect("metric not yet registered");
            g
        });
    };
}

/* ============================= REGISTRY / CHANNELS ============================= */

int_gauge!(
    CONNECTIONS_ACTIVE,
    "packplane_connections_active",
    "Currently admitted channels"
);
int_counter!(
    CONNECTIONS_ADMITTED,
    "packplane_connections_admitted_total",
    "Total channels admitted"
);
int_counter!(
    MESSAGES_SENT,
    "packplane_messages_sent_total",
    "Outbound messages handed to a channel"
);
int_counter!(
    MESSAGES_RECEIVED,
    "packplane_messages_received_total",
    "Inbound messages delivered to the control plane"
);
int_counter!(
    MESSAGES_DROPPED_CHAOS,
    "packplane_messages_dropped_chaos_total",
    "Messages dropped by a chaos rule decision"
);
int_counter!(
    MESSAGES_DROPPED_PARTITION,
    "packplane_messages_dropped_partition_total",
    "Messages dropped by an active partition"
);
int_counter!(
    MESSAGES_DROPPED_OVERFLOW,
    "packplane_messages_dropped_overflow_total",
    "Messages dropped by queue or pause-buffer overflow"
);
int_counter!(
    MESSAGES_DELAYED,
    "packplane_messages_delayed_total",
    "Messages delayed by a chaos rule decision"
);

/* ============================= CHAOS ============================= */

int_counter!(
    API_CALLS_FAILED_CHAOS,
    "packplane_api_calls_failed_chaos_total",
    "Store/API calls failed by chaos injection"
);
pub static CHAOS_RULES_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("packplane_chaos_rules_active", "Installed chaos rules by kind"),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/* ============================= HEALTH ============================= */

int_counter!(
    HEARTBEATS_TOTAL,
    "packplane_heartbeats_total",
    "Heartbeats accepted for liveness"
);
pub static NODE_TRANSITIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "packplane_node_transitions_total",
            "Node liveness transitions by target state",
        ),
        &["to"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= SCHEDULER ============================= */

int_counter!(
    SCHEDULER_TICKS,
    "packplane_scheduler_ticks_total",
    "Scheduler tick cycles"
);
int_counter!(
    SCHEDULER_SKIPS,
    "packplane_scheduler_skips_total",
    "Scheduler ticks skipped by the re-entrancy guard"
);
int_counter!(
    PODS_SCHEDULED,
    "packplane_pods_scheduled_total",
    "Pods successfully claimed onto a node"
);
int_counter!(
    PODS_PREEMPTED,
    "packplane_pods_preempted_total",
    "Running pods evicted to make room for higher priority"
);
int_counter!(
    SCHEDULE_CONFLICTS,
    "packplane_schedule_conflicts_total",
    "Pod claims lost to a concurrent modification"
);

/* ============================= RECONCILER ============================= */

int_counter!(
    RECONCILE_TICKS,
    "packplane_reconcile_ticks_total",
    "Service reconcile passes"
);
int_counter!(
    RECONCILE_SKIPS,
    "packplane_reconcile_skips_total",
    "Reconcile passes skipped because the previous pass still runs"
);
int_counter!(
    PODS_CREATED,
    "packplane_pods_created_total",
    "Pods created from service templates"
);
int_counter!(
    PODS_RETIRED,
    "packplane_pods_retired_total",
    "Pods retired by scale-down or rollout"
);
int_counter!(
    ROLLBACKS_TOTAL,
    "packplane_rollbacks_total",
    "Version rollouts reverted after repeated failures"
);
int_counter!(
    STALE_POD_STOPS,
    "packplane_stale_pod_stops_total",
    "pod:stop messages dispatched for stale node-reported pods"
);

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "packplane_reconcile_duration_seconds",
        "Duration of each service reconcile pass",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init every metric so it shows on /metrics before first use.
pub fn force_init() {
    LazyLock::force(&CONNECTIONS_ACTIVE);
    LazyLock::force(&CONNECTIONS_ADMITTED);
    LazyLock::force(&MESSAGES_SENT);
    LazyLock::force(&MESSAGES_RECEIVED);
    LazyLock::force(&MESSAGES_DROPPED_CHAOS);
    LazyLock::force(&MESSAGES_DROPPED_PARTITION);
    LazyLock::force(&MESSAGES_DROPPED_OVERFLOW);
    LazyLock::force(&MESSAGES_DELAYED);
    LazyLock::force(&API_CALLS_FAILED_CHAOS);
    LazyLock::force(&CHAOS_RULES_ACTIVE);
    LazyLock::force(&HEARTBEATS_TOTAL);
    LazyLock::force(&NODE_TRANSITIONS);
    LazyLock::force(&SCHEDULER_TICKS);
    LazyLock::force(&SCHEDULER_SKIPS);
    LazyLock::force(&PODS_SCHEDULED);
    LazyLock::force(&PODS_PREEMPTED);
    LazyLock::force(&SCHEDULE_CONFLICTS);
    LazyLock::force(&RECONCILE_TICKS);
    LazyLock::force(&RECONCILE_SKIPS);
    LazyLock::force(&PODS_CREATED);
    LazyLock::force(&PODS_RETIRED);
    LazyLock::force(&ROLLBACKS_TOTAL);
    LazyLock::force(&STALE_POD_STOPS);
    LazyLock::force(&RECONCILE_DURATION);
}
