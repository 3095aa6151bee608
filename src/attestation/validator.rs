//! Evidence validation — decide whether the remote enclave is trusted
//!
//! Each protocol variant implements [`EvidenceValidator`]:
//! 1. Verify the report was signed by a trusted issuer
//! 2. Check the report is bound to this attestation endpoint (and nonce, for tokens)
//! 3. Check freshness, debug flag, security version and measurement against policy
//! 4. Hand back the enclave signing key that vouches for the DH public key

use super::evidence::{decode_verifying_key, AuthorityClaims, Evidence, HealthClaims, SignedReport};
use super::protocol::AttestationProtocol;
use crate::error::{EnclaveError, Result};
use chrono::{DateTime, Utc};
use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Tolerated clock skew for reports issued "in the future"
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Policy for accepting or rejecting attestation evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationPolicy {
    /// Hex SEC1 keys of trusted attestation authorities / host guardians
    pub trusted_authorities: Vec<String>,
    /// Trusted enclave measurements (empty = accept any)
    pub trusted_measurements: Vec<String>,
    /// Minimum security version number
    pub min_svn: u16,
    /// Whether to accept enclaves running in debug mode
    pub allow_debug: bool,
    /// Maximum age of a report in seconds
    pub max_evidence_age_secs: i64,
    /// Host health reports must show enforced code integrity
    pub require_code_integrity: bool,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self {
            trusted_authorities: Vec::new(),
            trusted_measurements: Vec::new(),
            min_svn: 0,
            allow_debug: false,
            max_evidence_age_secs: 3600,
            require_code_integrity: true,
        }
    }
}

impl AttestationPolicy {
    /// Pin both the issuer keys and the enclave measurements
    pub fn strict(trusted_authorities: Vec<String>, trusted_measurements: Vec<String>) -> Self {
        Self {
            trusted_authorities,
            trusted_measurements,
            min_svn: 1,
            max_evidence_age_secs: 300,
            ..Self::default()
        }
    }

    pub fn authority_keys(&self) -> Result<Vec<VerifyingKey>> {
        self.trusted_authorities
            .iter()
            .map(|k| {
                decode_verifying_key(k).map_err(|e| {
                    EnclaveError::Config(format!("Trusted authority key '{}': {}", k, e))
                })
            })
            .collect()
    }
}

/// Inputs a validator checks evidence against
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub nonce: &'a [u8],
    pub attestation_url: &'a str,
    pub server_name: &'a str,
    pub now: DateTime<Utc>,
}

/// Result of validating attestation evidence
#[derive(Debug, Clone)]
pub enum AttestationVerdict {
    /// Evidence is valid and the enclave is trusted
    Trusted {
        measurement: Option<String>,
        /// Key that must have signed the enclave's DH public key (None = bypass)
        enclave_signing_key: Option<VerifyingKey>,
    },
    /// Evidence is genuine but the enclave does not meet policy
    Untrusted { reason: String },
    /// Evidence is forged, tampered or not bound to this attempt
    Invalid { reason: String },
    /// Report is older than the policy allows
    Expired,
}

/// What a trusted verdict yields
#[derive(Debug, Clone)]
pub struct TrustedEnclave {
    pub measurement: Option<String>,
    pub enclave_signing_key: Option<VerifyingKey>,
}

impl AttestationVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, AttestationVerdict::Trusted { .. })
    }

    pub fn into_trusted(self) -> Result<TrustedEnclave> {
        match self {
            AttestationVerdict::Trusted {
                measurement,
                enclave_signing_key,
            } => Ok(TrustedEnclave {
                measurement,
                enclave_signing_key,
            }),
            AttestationVerdict::Untrusted { reason } => {
                Err(EnclaveError::AttestationRejected(format!("Untrusted enclave: {}", reason)))
            }
            AttestationVerdict::Invalid { reason } => {
                Err(EnclaveError::AttestationRejected(format!("Invalid evidence: {}", reason)))
            }
            AttestationVerdict::Expired => Err(EnclaveError::AttestationRejected(
                "Attestation report expired".into(),
            )),
        }
    }
}

/// Variant-specific evidence check
pub trait EvidenceValidator: Send + Sync {
    fn protocol(&self) -> AttestationProtocol;

    /// `Err` only for malformed input; trust decisions come back as a verdict.
    fn validate(&self, evidence: &Evidence, ctx: &ValidationContext<'_>) -> Result<AttestationVerdict>;
}

/// Select the validator for a protocol variant
pub fn validator_for(
    protocol: AttestationProtocol,
    policy: &AttestationPolicy,
) -> Result<Box<dyn EvidenceValidator>> {
    Ok(match protocol {
        AttestationProtocol::AuthorityToken => Box::new(AuthorityTokenValidator::new(policy)?),
        AttestationProtocol::HostHealth => Box::new(HostHealthValidator::new(policy)?),
        AttestationProtocol::None => Box::new(BypassValidator),
    })
}

/// Variant A: token from an attestation authority, bound to the client nonce
pub struct AuthorityTokenValidator {
    policy: AttestationPolicy,
    authorities: Vec<VerifyingKey>,
}

impl AuthorityTokenValidator {
    pub fn new(policy: &AttestationPolicy) -> Result<Self> {
        Ok(Self {
            authorities: policy.authority_keys()?,
            policy: policy.clone(),
        })
    }
}

impl EvidenceValidator for AuthorityTokenValidator {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::AuthorityToken
    }

    fn validate(&self, evidence: &Evidence, ctx: &ValidationContext<'_>) -> Result<AttestationVerdict> {
        let report = decode_report(evidence)?;
        if let Some(verdict) = check_issuer_signature(&report, &self.authorities) {
            return Ok(verdict);
        }
        let claims: AuthorityClaims = report.parse_claims()?;

        if !same_endpoint(&claims.issuer, ctx.attestation_url) {
            return Ok(AttestationVerdict::Untrusted {
                reason: format!(
                    "Token issued by '{}', expected '{}'",
                    claims.issuer, ctx.attestation_url
                ),
            });
        }

        // Freshness binding: the authority must echo exactly our nonce
        if !claims.nonce.eq_ignore_ascii_case(&hex::encode(ctx.nonce)) {
            return Ok(AttestationVerdict::Invalid {
                reason: "Token nonce does not match request (stale or replayed)".into(),
            });
        }

        let identity = EnclaveIdentity {
            measurement: &claims.measurement,
            svn: claims.svn,
            debuggable: claims.debuggable,
            issued_at: claims.issued_at,
        };
        if let Some(verdict) = identity.check(&self.policy, ctx.now) {
            return Ok(verdict);
        }

        Ok(AttestationVerdict::Trusted {
            measurement: Some(claims.measurement),
            enclave_signing_key: Some(decode_verifying_key(&claims.enclave_signing_key)?),
        })
    }
}

/// Variant B: host guardian health report. Freshness comes from report age;
/// the nonce is bound later by the enclave's own key signature.
pub struct HostHealthValidator {
    policy: AttestationPolicy,
    guardians: Vec<VerifyingKey>,
}

impl HostHealthValidator {
    pub fn new(policy: &AttestationPolicy) -> Result<Self> {
        Ok(Self {
            guardians: policy.authority_keys()?,
            policy: policy.clone(),
        })
    }
}

impl EvidenceValidator for HostHealthValidator {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::HostHealth
    }

    fn validate(&self, evidence: &Evidence, ctx: &ValidationContext<'_>) -> Result<AttestationVerdict> {
        let report = decode_report(evidence)?;
        if let Some(verdict) = check_issuer_signature(&report, &self.guardians) {
            return Ok(verdict);
        }
        let claims: HealthClaims = report.parse_claims()?;

        if !same_endpoint(&claims.issuer, ctx.attestation_url) {
            return Ok(AttestationVerdict::Untrusted {
                reason: format!(
                    "Health report issued by '{}', expected '{}'",
                    claims.issuer, ctx.attestation_url
                ),
            });
        }

        if self.policy.require_code_integrity && !claims.code_integrity {
            return Ok(AttestationVerdict::Untrusted {
                reason: format!("Host {} does not enforce code integrity", ctx.server_name),
            });
        }

        let identity = EnclaveIdentity {
            measurement: &claims.measurement,
            svn: claims.svn,
            debuggable: claims.debuggable,
            issued_at: claims.issued_at,
        };
        if let Some(verdict) = identity.check(&self.policy, ctx.now) {
            return Ok(verdict);
        }

        Ok(AttestationVerdict::Trusted {
            measurement: Some(claims.measurement),
            enclave_signing_key: Some(decode_verifying_key(&claims.enclave_signing_key)?),
        })
    }
}

/// No attestation. Only selected when the caller explicitly configures `None`.
pub struct BypassValidator;

impl EvidenceValidator for BypassValidator {
    fn protocol(&self) -> AttestationProtocol {
        AttestationProtocol::None
    }

    fn validate(&self, _evidence: &Evidence, _ctx: &ValidationContext<'_>) -> Result<AttestationVerdict> {
        Ok(AttestationVerdict::Trusted {
            measurement: None,
            enclave_signing_key: None,
        })
    }
}

fn decode_report(evidence: &Evidence) -> Result<SignedReport> {
    if evidence.report.is_empty() {
        return Err(EnclaveError::Protocol(format!(
            "{} evidence is missing its attestation report",
            evidence.protocol
        )));
    }
    SignedReport::decode(&evidence.report)
}

fn check_issuer_signature(report: &SignedReport, issuers: &[VerifyingKey]) -> Option<AttestationVerdict> {
    if issuers.is_empty() {
        return Some(AttestationVerdict::Untrusted {
            reason: "No trusted attestation issuers configured".into(),
        });
    }
    if !issuers.iter().any(|key| report.verify(key)) {
        return Some(AttestationVerdict::Invalid {
            reason: "Report signature does not verify against any trusted issuer".into(),
        });
    }
    None
}

fn same_endpoint(issuer: &str, attestation_url: &str) -> bool {
    issuer.trim_end_matches('/') == attestation_url.trim_end_matches('/')
}

struct EnclaveIdentity<'a> {
    measurement: &'a str,
    svn: u16,
    debuggable: bool,
    issued_at: i64,
}

impl EnclaveIdentity<'_> {
    fn check(&self, policy: &AttestationPolicy, now: DateTime<Utc>) -> Option<AttestationVerdict> {
        let Some(age) = now.timestamp().checked_sub(self.issued_at) else {
            return Some(AttestationVerdict::Invalid {
                reason: format!("Report issued_at {} out of range", self.issued_at),
            });
        };
        if age > policy.max_evidence_age_secs {
            return Some(AttestationVerdict::Expired);
        }
        if age < -MAX_CLOCK_SKEW_SECS {
            return Some(AttestationVerdict::Invalid {
                reason: format!("Report issued {}s in the future", -age),
            });
        }

        if self.debuggable && !policy.allow_debug {
            return Some(AttestationVerdict::Untrusted {
                reason: "Debug enclave not allowed by policy".into(),
            });
        }

        if self.svn < policy.min_svn {
            return Some(AttestationVerdict::Untrusted {
                reason: format!("SVN {} below minimum {}", self.svn, policy.min_svn),
            });
        }

        if !policy.trusted_measurements.is_empty()
            && !policy
                .trusted_measurements
                .iter()
                .any(|m| m.eq_ignore_ascii_case(self.measurement))
        {
            return Some(AttestationVerdict::Untrusted {
                reason: "Enclave measurement not in trusted list".into(),
            });
        }

        None
    }
}
