use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{
    ConnectionId, NodeId, PackMetadata, PodId, PodStatus, ResourceVector, RuntimeKind, RuntimeTag,
    Taint, TerminationReason,
};

/* ============================= MESSAGE TYPES ============================= */

pub const NODE_REGISTER: &str = "node:register";
pub const NODE_HEARTBEAT: &str = "node:heartbeat";
pub const POD_STATUS: &str = "pod:status";
pub const POD_DEPLOY: &str = "pod:deploy";
pub const POD_STOP: &str = "pod:stop";
pub const NODE_SHUTDOWN: &str = "node:shutdown";

/// Messages that must never be dropped from a pause queue.
pub fn is_critical(msg_type: &str) -> bool {
    matches!(msg_type, POD_STOP | NODE_SHUTDOWN)
}

/* ============================= ENVELOPE ============================= */

/// Framed wire message. The payload stays opaque until a handler picks the
/// typed view for the message type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new<T: Serialize>(msg_type: &str, payload: &T) -> Result<Envelope> {
        Ok(Envelope {
            msg_type: msg_type.to_string(),
            payload: serde_json::to_value(payload)?,
            correlation_id: None,
        })
    }

    pub fn with_correlation<T: Serialize>(
        msg_type: &str,
        payload: &T,
        correlation_id: &str,
    ) -> Result<Envelope> {
        let mut env = Envelope::new(msg_type, payload)?;
        env.correlation_id = Some(correlation_id.to_string());
        Ok(env)
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/* ============================= NODE → CONTROL ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterPayload {
    pub name: String,
    pub runtime_kind: RuntimeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    pub allocatable: ResourceVector,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    /// Set on re-registration after a reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// Control-plane reply to `node:register`, correlated by correlationId.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeartbeatPayload {
    pub node_id: NodeId,
    /// Sender wall-clock millis; informational only.
    pub timestamp: i64,
    #[serde(default)]
    pub allocated: ResourceVector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_pod_ids: Vec<PodId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusPayload {
    pub pod_id: PodId,
    pub incarnation: u64,
    pub status: PodStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

/* ============================= CONTROL → NODE ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackRef {
    pub id: crate::types::PackId,
    pub version: String,
    pub runtime_tag: RuntimeTag,
    pub bundle_ref: String,
    #[serde(default)]
    pub metadata: PackMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodDeployPayload {
    pub pod_id: PodId,
    pub node_id: NodeId,
    pub pack: PackRef,
    pub resources: ResourceVector,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub granted_capabilities: Vec<String>,
    pub incarnation: u64,
    /// HMAC the node presents when reporting for this pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStopPayload {
    pub pod_id: PodId,
    pub incarnation: u64,
    pub grace_period_ms: u64,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeShutdownPayload {
    pub reason: String,
}

/* ============================= INBOUND ROUTING ============================= */

/// A received envelope tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub connection_id: ConnectionId,
    pub envelope: Envelope,
}

/* ============================= TESTS ============================= */
