use thiserror::Error;

use crate::types::{NodeId, PodId};

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the control plane.
///
/// Kinds, not call sites: transient infrastructure is retried locally,
/// conflicts are normal control flow, validation stops at the boundary,
/// policy refusals are structured, and fatal invariants are logged and
/// refused without taking the process down.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient infrastructure failure; retried with bounded jitter before
    /// being surfaced.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A store call or channel operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A conditional store update lost a race. Callers re-enqueue and continue.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A node report carried an incarnation older than the stored one.
    /// Ignored for state, counted for liveness.
    #[error("stale incarnation for pod {pod}: reported {reported}, current {current}")]
    StaleIncarnation { pod: PodId, reported: u64, current: u64 },

    /// Malformed input rejected at the boundary.
    #[error("validation: {0}")]
    Validation(String),

    /// Chaos not enabled, production lockout, ban in effect.
    #[error("policy refusal: {0}")]
    Policy(String),

    /// Per-IP or global connection caps exceeded.
    #[error("channel limit reached: {0}")]
    ChannelLimit(String),

    /// A node is banned from admission.
    #[error("node {0} is banned")]
    NodeBanned(NodeId),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal invariant was violated. The offending operation is
    /// refused; the process keeps serving.
    #[error("invariant violation: {0}")]
    FatalInvariant(String),

    /// The channel to the peer is closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a local bounded retry is worthwhile.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Timeout(_))
    }

    /// Conflicts and stale incarnations are never surfaced to users; the
    /// caller skips and requeues.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::StaleIncarnation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_and_timeout_are_retriable() {
        assert!(Error::Transient("store".into()).is_retriable());
        assert!(Error::Timeout("store".into()).is_retriable());
        assert!(!Error::Conflict("cas".into()).is_retriable());
        assert!(!Error::Validation("bad".into()).is_retriable());
    }

    #[test]
    fn test_conflict_kinds() {
        assert!(Error::Conflict("cas".into()).is_conflict());
        assert!(
            Error::StaleIncarnation {
                pod: PodId::from("pod-1"),
                reported: 1,
                current: 2
            }
            .is_conflict()
        );
        assert!(!Error::Policy("chaos disabled".into()).is_conflict());
    }

    #[test]
    fn test_display_carries_context() {
        let e = Error::StaleIncarnation {
            pod: PodId::from("pod-9"),
            reported: 3,
            current: 5,
        };
        let s = e.to_string();
        assert!(s.contains("pod-9"));
        assert!(s.contains('3'));
        assert!(s.contains('5'));
    }
}
