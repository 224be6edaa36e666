use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::PodId;

/// Issues the per-pod token stamped into `pod:deploy`.
///
/// The token binds (pod id, incarnation) to the configured secret; a node
/// presents it when reporting for the pod. Production boots refuse to start
/// without a configured secret (enforced by config validation); outside
/// production an ephemeral secret is generated per process.
pub struct PodTokenIssuer {
    secret: Vec<u8>,
}

impl PodTokenIssuer {
    pub fn new(secret: Option<&str>) -> PodTokenIssuer {
        let secret = match secret {
            Some(s) => s.as_bytes().to_vec(),
            None => Uuid::new_v4().as_bytes().to_vec(),
        };
        PodTokenIssuer { secret }
    }

    pub fn issue(&self, pod: &PodId, incarnation: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(pod.as_str().as_bytes());
        hasher.update(incarnation.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self, pod: &PodId, incarnation: u64, token: &str) -> bool {
        self.issue(pod, incarnation) == token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_is_deterministic_per_secret() {
        let issuer = PodTokenIssuer::new(Some("s3cret"));
        let pod = PodId::from("pod-1");
        assert_eq!(issuer.issue(&pod, 1), issuer.issue(&pod, 1));
        assert_ne!(issuer.issue(&pod, 1), issuer.issue(&pod, 2));
        assert!(issuer.verify(&pod, 1, &issuer.issue(&pod, 1)));
        assert!(!issuer.verify(&pod, 2, &issuer.issue(&pod, 1)));
    }

    #[test]
    fn test_different_secrets_differ() {
        let a = PodTokenIssuer::new(Some("a"));
        let b = PodTokenIssuer::new(Some("b"));
        let pod = PodId::from("pod-1");
        assert_ne!(a.issue(&pod, 1), b.issue(&pod, 1));
    }

    #[test]
    fn test_ephemeral_secret_still_verifies_own_tokens() {
        let issuer = PodTokenIssuer::new(None);
        let pod = PodId::from("pod-1");
        let token = issuer.issue(&pod, 3);
        assert!(issuer.verify(&pod, 3, &token));
    }
}
