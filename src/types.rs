use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/* ============================= IDENTIFIERS ============================= */

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(NodeId, "node");
string_id!(PodId, "pod");
string_id!(ServiceId, "svc");
string_id!(PackId, "pack");

/// Issued by the connection registry, unique for the process lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Label every node carries implicitly; DaemonSet pods pin to it.
pub const NODE_IDENTITY_LABEL: &str = "node.id";

/* ============================= RUNTIME KINDS ============================= */

/// What kind of runtime a node offers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeKind {
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "embedded-client")]
    EmbeddedClient,
}

/// What kind of runtime a pack requires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTag {
    Server,
    Client,
    #[default]
    Universal,
}

impl RuntimeTag {
    /// Runtime compatibility predicate between a pack and a node.
    pub fn runs_on(self, kind: RuntimeKind) -> bool {
        match self {
            RuntimeTag::Universal => true,
            RuntimeTag::Server => kind == RuntimeKind::Server,
            RuntimeTag::Client => kind == RuntimeKind::EmbeddedClient,
        }
    }
}

/* ============================= RESOURCES ============================= */

/// Componentwise resource vector shared by node capacity and pod requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu_millis: i64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub pods: i64,
    #[serde(default)]
    pub storage_mb: i64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu_millis: 0,
        memory_mb: 0,
        pods: 0,
        storage_mb: 0,
    };

    pub fn new(cpu_millis: i64, memory_mb: i64, pods: i64, storage_mb: i64) -> Self {
        Self { cpu_millis, memory_mb, pods, storage_mb }
    }

    /// True when every component of `self` fits within `other`.
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_mb <= other.memory_mb
            && self.pods <= other.pods
            && self.storage_mb <= other.storage_mb
    }

    pub fn plus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            memory_mb: self.memory_mb + other.memory_mb,
            pods: self.pods + other.pods,
            storage_mb: self.storage_mb + other.storage_mb,
        }
    }

    pub fn minus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis - other.cpu_millis,
            memory_mb: self.memory_mb - other.memory_mb,
            pods: self.pods - other.pods,
            storage_mb: self.storage_mb - other.storage_mb,
        }
    }

    /// Negative components indicate accounting drift, which callers treat as
    /// a fatal invariant violation.
    pub fn is_non_negative(&self) -> bool {
        self.cpu_millis >= 0 && self.memory_mb >= 0 && self.pods >= 0 && self.storage_mb >= 0
    }

    /// Name of the first component of `request` that does not fit into
    /// `self`, for pending-reason annotations.
    pub fn first_shortfall(&self, request: &ResourceVector) -> Option<&'static str> {
        if request.cpu_millis > self.cpu_millis {
            Some("insufficient_cpu")
        } else if request.memory_mb > self.memory_mb {
            Some("insufficient_memory")
        } else if request.pods > self.pods {
            Some("insufficient_pod_slots")
        } else if request.storage_mb > self.storage_mb {
            Some("insufficient_storage")
        } else {
            None
        }
    }
}

/* ============================= TAINTS & TOLERATIONS ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Empty key with operator `Exists` matches every taint.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// `None` matches taints of any effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<u64>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => {
                self.key == taint.key && self.value.as_deref() == taint.value.as_deref()
            }
        }
    }
}

/// True when some toleration in `tolerations` matches `taint`.
pub fn tolerated(taint: &Taint, tolerations: &[Toleration]) -> bool {
    tolerations.iter().any(|t| t.tolerates(taint))
}

/* ============================= NODE AFFINITY ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            NodeSelectorOperator::In => {
                value.is_some_and(|v| self.values.iter().any(|c| c == v))
            }
            NodeSelectorOperator::NotIn => {
                value.is_none_or(|v| !self.values.iter().any(|c| c == v))
            }
            NodeSelectorOperator::Exists => value.is_some(),
            NodeSelectorOperator::DoesNotExist => value.is_none(),
            // Gt/Lt compare the first candidate value as a number.
            NodeSelectorOperator::Gt => numeric_compare(value, self.values.first())
                .is_some_and(|(label, bound)| label > bound),
            NodeSelectorOperator::Lt => numeric_compare(value, self.values.first())
                .is_some_and(|(label, bound)| label < bound),
        }
    }
}

fn numeric_compare(label: Option<&String>, bound: Option<&String>) -> Option<(i64, i64)> {
    let label = label?.parse::<i64>().ok()?;
    let bound = bound?.parse::<i64>().ok()?;
    Some((label, bound))
}

/// All requirements of a term must hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

impl NodeSelectorTerm {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreferredSchedulingTerm {
    /// Weight in 1..=100 added to the node score when the preference matches.
    pub weight: i32,
    pub preference: NodeSelectorTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    /// Every term listed here must be satisfied by the node's labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<NodeSelectorTerm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<PreferredSchedulingTerm>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
}

/* ============================= NODE ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Suspect,
    Offline,
    Draining,
    Maintenance,
}

impl NodeStatus {
    /// Liveness states owned by the health sweep; draining and maintenance
    /// are operator-driven and never overwritten by it.
    pub fn is_liveness_managed(self) -> bool {
        matches!(self, NodeStatus::Online | NodeStatus::Suspect | NodeStatus::Offline)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub runtime_kind: RuntimeKind,
    pub status: NodeStatus,
    /// Monotonic clock millis of the last accepted heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    pub allocatable: ResourceVector,
    pub allocated: ResourceVector,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn available(&self) -> ResourceVector {
        self.allocatable.minus(&self.allocated)
    }

    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Online && !self.unschedulable
    }
}

/* ============================= POD ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Evicted,
    Unknown,
}

impl PodStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodStatus::Stopped | PodStatus::Failed | PodStatus::Evicted)
    }

    /// States in which the pod occupies capacity on its node.
    pub fn holds_resources(self) -> bool {
        matches!(
            self,
            PodStatus::Scheduled
                | PodStatus::Starting
                | PodStatus::Running
                | PodStatus::Stopping
                | PodStatus::Unknown
        )
    }
}

/* ============================= TERMINATION REASONS ============================= */

/// Closed set of pod termination reasons; the classification drives the
/// crash-loop policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    // infrastructure
    NodeLost,
    NodeRestart,
    NodeUnhealthy,
    NodeDraining,
    NodeMaintenance,
    EvictedResources,
    Preempted,
    // operator
    UserStopped,
    RollingUpdate,
    ScaledDown,
    ServiceDeleted,
    // application
    Error,
    InitError,
    ConfigError,
    PackLoadError,
    OomKilled,
    DeadlineExceeded,
    // lifecycle
    Completed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonClass {
    Infrastructure,
    Operator,
    Application,
    Lifecycle,
    Unknown,
}

impl TerminationReason {
    pub fn classification(self) -> ReasonClass {
        use TerminationReason::*;
        match self {
            NodeLost | NodeRestart | NodeUnhealthy | NodeDraining | NodeMaintenance
            | EvictedResources | Preempted => ReasonClass::Infrastructure,
            UserStopped | RollingUpdate | ScaledDown | ServiceDeleted => ReasonClass::Operator,
            Error | InitError | ConfigError | PackLoadError | OomKilled | DeadlineExceeded => {
                ReasonClass::Application
            }
            Completed => ReasonClass::Lifecycle,
            Unknown => ReasonClass::Unknown,
        }
    }

    /// Unknown is counted conservatively.
    pub fn counts_toward_crash_loop(self) -> bool {
        matches!(self.classification(), ReasonClass::Application | ReasonClass::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub id: PodId,
    pub pack_id: PackId,
    pub pack_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: PodStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    pub resource_requests: ResourceVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceVector>,
    #[serde(default)]
    pub scheduling: SchedulingSpec,
    /// Owning service, when the pod is service-managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<ServiceId>,
    /// Bumped each time the control plane (re)schedules the pod; stale node
    /// reports are rejected against it.
    pub incarnation: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub granted_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reason: Option<String>,
    #[serde(default)]
    pub crash_loop_count: u32,
    /// Monotonic clock millis before which the scheduler must not place the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until_ms: Option<u64>,
    /// Monotonic clock millis of the stopping transition, for grace promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping_since_ms: Option<u64>,
    /// Reason the stop was requested with; becomes the termination reason if
    /// the node never confirms and the grace period promotes the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_stop_reason: Option<TerminationReason>,
    /// Monotonic clock millis of the last running transition, for the
    /// stability window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since_ms: Option<u64>,
}

/* ============================= SERVICE ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Paused,
    Scaling,
    Deleting,
}

/// Pod template fields stamped onto every pod the service creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub resource_requests: ResourceVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceVector>,
    #[serde(default)]
    pub scheduling: SchedulingSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: ServiceId,
    /// Unique per namespace.
    pub name: String,
    pub pack_id: PackId,
    pub pack_version: String,
    #[serde(default)]
    pub follow_latest: bool,
    pub namespace: String,
    /// 0 means DaemonSet semantics: one pod per eligible node.
    pub replicas: u32,
    pub status: ServiceStatus,
    #[serde(default)]
    pub template: PodTemplate,
    pub generation: u64,
    pub observed_generation: u64,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_version: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Monotonic clock millis before which the failed version must not be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_backoff_until_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn is_daemon_set(&self) -> bool {
        self.replicas == 0
    }
}

/* ============================= PACK ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackNamespace {
    System,
    #[default]
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackVisibility {
    Public,
    #[default]
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_capabilities: Vec<String>,
    #[serde(default)]
    pub enable_ephemeral: bool,
}

/// Immutable once registered; identified by (name, version).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackRecord {
    pub id: PackId,
    pub name: String,
    pub version: String,
    pub runtime_tag: RuntimeTag,
    #[serde(default)]
    pub namespace: PackNamespace,
    #[serde(default)]
    pub visibility: PackVisibility,
    /// Opaque reference to the deployable bundle; transport is out of scope.
    pub bundle_ref: String,
    #[serde(default)]
    pub metadata: PackMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub granted_capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/* ============================= CONNECTION ============================= */

/// Registry-owned view of one live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// A connection may advertise several identities during bootstrap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<NodeId>,
    pub remote_addr: String,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity_ms: u64,
}

/* ============================= SCHEDULING POLICY ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    #[default]
    Spread,
    Binpack,
    Random,
    LeastLoaded,
    Affinity,
}

/* ============================= TESTS ============================= */
