use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Used when no master secret is configured. Deployments should set
/// `master_secret`; startup warns loudly when this fallback is active.
pub const FALLBACK_AUDIT_SECRET: &str = "wasmgate-default-audit-secret";

pub fn audit_key(seq: u64) -> String {
    format!("audit.job.{seq}")
}

/// The signed summary persisted under `audit.job.<seq>` in the tenant's
/// state bucket after a successful job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub job_id: u64,
    pub timestamp: String,
    pub signature: String,
    pub status: String,
}

#[derive(Clone)]
pub struct AuditSigner {
    secret: Vec<u8>,
}

impl AuditSigner {
    pub fn new(master_secret: &str) -> Self {
        let secret = if master_secret.is_empty() {
            tracing::warn!("no master_secret configured; audit records use the fallback secret");
            FALLBACK_AUDIT_SECRET.as_bytes().to_vec()
        } else {
            master_secret.as_bytes().to_vec()
        };
        Self { secret }
    }

    fn payload(tenant: &str, job: u64, stdout: &str, stderr: &str, timestamp: &str) -> String {
        format!("tenant:{tenant}|job:{job}|out:{stdout}|err:{stderr}|ts:{timestamp}")
    }

    /// Hex HMAC-SHA256 over the exact execution evidence.
    pub fn sign(&self, tenant: &str, job: u64, stdout: &str, stderr: &str, timestamp: &str) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            // HMAC accepts keys of any length; unreachable.
            return String::new();
        };
        mac.update(Self::payload(tenant, job, stdout, stderr, timestamp).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(
        &self,
        tenant: &str,
        job: u64,
        stdout: &str,
        stderr: &str,
        timestamp: &str,
        signature_hex: &str,
    ) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(Self::payload(tenant, job, stdout, stderr, timestamp).as_bytes());
        match hex::decode(signature_hex) {
            Ok(sig) => mac.verify_slice(&sig).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = AuditSigner::new("master");
        let sig = signer.sign("abc", 7, "out", "err", "2026-01-01T00:00:00Z");
        assert!(signer.verify("abc", 7, "out", "err", "2026-01-01T00:00:00Z", &sig));
    }

    #[test]
    fn any_field_change_breaks_the_signature() {
        let signer = AuditSigner::new("master");
        let sig = signer.sign("abc", 7, "out", "err", "ts");
        assert!(!signer.verify("abc", 8, "out", "err", "ts", &sig));
        assert!(!signer.verify("xyz", 7, "out", "err", "ts", &sig));
        assert!(!signer.verify("abc", 7, "out!", "err", "ts", &sig));
        assert!(!signer.verify("abc", 7, "out", "err", "later", &sig));
    }

    #[test]
    fn different_secrets_disagree() {
        let a = AuditSigner::new("one");
        let b = AuditSigner::new("two");
        let sig = a.sign("t", 1, "o", "e", "ts");
        assert!(!b.verify("t", 1, "o", "e", "ts", &sig));
    }

    #[test]
    fn empty_secret_falls_back_deterministically() {
        let implicit = AuditSigner::new("");
        let explicit = AuditSigner::new(FALLBACK_AUDIT_SECRET);
        assert_eq!(implicit.sign("t", 1, "o", "e", "ts"), explicit.sign("t", 1, "o", "e", "ts"));
    }

    #[test]
    fn record_serializes_with_spec_field_names() {
        let record = AuditRecord {
            job_id: 12,
            timestamp: "ts".to_string(),
            signature: "ab".to_string(),
            status: "success".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["job_id"], 12);
        assert!(json.get("signature").is_some());
        assert_eq!(audit_key(12), "audit.job.12");
    }
}
