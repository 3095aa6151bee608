//! Session establishment — turn validated evidence into a keyed session
//!
//! 1. Decode the evidence envelope
//! 2. Refuse any protocol other than the configured one (no downgrade)
//! 3. Validate the report with the variant's [`EvidenceValidator`]
//! 4. Check the enclave signed its DH key together with our nonce
//! 5. ECDH + HKDF with the caller's one-shot key pair

use super::kex::{decode_public_key, LocalKeyPair, SESSION_KEY_LEN};
use crate::attestation::evidence::{key_binding_message, verify_message, Evidence};
use crate::attestation::{
    validator_for, AttestationPolicy, AttestationProtocol, EvidenceValidator, ValidationContext,
};
use crate::error::{EnclaveError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use zeroize::Zeroizing;

/// An attested session with a remote enclave.
///
/// Not `Clone`: the cache owns it and hands out `Arc`s. The key is wiped when
/// the last reference drops.
pub struct EnclaveSession {
    session_id: u64,
    handle: uuid::Uuid,
    key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    context: Vec<u8>,
    protocol: AttestationProtocol,
    measurement: Option<String>,
    created_at: DateTime<Utc>,
}

impl EnclaveSession {
    pub(crate) fn new(
        session_id: u64,
        key: Zeroizing<[u8; SESSION_KEY_LEN]>,
        context: Vec<u8>,
        protocol: AttestationProtocol,
        measurement: Option<String>,
    ) -> Self {
        Self {
            session_id,
            handle: uuid::Uuid::new_v4(),
            key,
            context,
            protocol,
            measurement,
            created_at: Utc::now(),
        }
    }

    /// Session id assigned by the enclave
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Local identity; differs between two establishments even if the enclave reuses ids
    pub fn handle(&self) -> uuid::Uuid {
        self.handle
    }

    pub fn key_material(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    /// Opaque, protocol-specific context echoed by the enclave
    pub fn context(&self) -> &[u8] {
        &self.context
    }

    pub fn protocol(&self) -> AttestationProtocol {
        self.protocol
    }

    pub fn measurement(&self) -> Option<&str> {
        self.measurement.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn summary(&self) -> String {
        format!(
            "Session {:016x} | protocol={} | measurement={} | created={}",
            self.session_id,
            self.protocol,
            self.measurement
                .as_deref()
                .map(|m| m.get(..16).unwrap_or(m))
                .unwrap_or("none"),
            self.created_at.to_rfc3339(),
        )
    }
}

impl PartialEq for EnclaveSession {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.session_id == other.session_id
    }
}

impl Eq for EnclaveSession {}

impl fmt::Debug for EnclaveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveSession")
            .field("session_id", &format_args!("{:016x}", self.session_id))
            .field("handle", &self.handle)
            .field("protocol", &self.protocol)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Validates evidence for one protocol variant and derives the session key
pub struct SessionEstablisher {
    validator: Box<dyn EvidenceValidator>,
}

impl SessionEstablisher {
    pub fn new(validator: Box<dyn EvidenceValidator>) -> Self {
        Self { validator }
    }

    pub fn for_protocol(protocol: AttestationProtocol, policy: &AttestationPolicy) -> Result<Self> {
        Ok(Self::new(validator_for(protocol, policy)?))
    }

    pub fn protocol(&self) -> AttestationProtocol {
        self.validator.protocol()
    }

    /// Consumes `key_pair` whatever the outcome.
    pub fn establish(
        &self,
        evidence: &[u8],
        key_pair: LocalKeyPair,
        attestation_url: &str,
        server_name: &str,
    ) -> Result<EnclaveSession> {
        let expected = self.validator.protocol();
        if key_pair.protocol() != expected {
            return Err(EnclaveError::Protocol(format!(
                "Key pair was generated for {} attestation, provider expects {}",
                key_pair.protocol(),
                expected
            )));
        }

        let evidence = Evidence::decode(evidence)?;
        if evidence.protocol != expected {
            return Err(EnclaveError::AttestationRejected(format!(
                "Enclave answered with {} evidence, {} is required",
                evidence.protocol, expected
            )));
        }

        let ctx = ValidationContext {
            nonce: key_pair.nonce(),
            attestation_url,
            server_name,
            now: Utc::now(),
        };
        let trusted = self.validator.validate(&evidence, &ctx)?.into_trusted()?;

        match &trusted.enclave_signing_key {
            Some(signer) => {
                let msg = key_binding_message(
                    &evidence.enclave_public_key,
                    key_pair.nonce(),
                    evidence.session_id,
                );
                if !verify_message(signer, &msg, &evidence.enclave_signature) {
                    return Err(EnclaveError::AttestationRejected(
                        "Enclave key signature mismatch".into(),
                    ));
                }
            }
            None => log::warn!(
                "Establishing unattested enclave session with {} ({})",
                server_name,
                attestation_url
            ),
        }

        let enclave_public = decode_public_key(&evidence.enclave_public_key)?;
        let key = key_pair.derive_session_key(&enclave_public, evidence.session_id);

        log::debug!(
            "Derived session {:016x} with {} via {}",
            evidence.session_id,
            server_name,
            expected
        );

        Ok(EnclaveSession::new(
            evidence.session_id,
            key,
            evidence.session_context,
            expected,
            trusted.measurement,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::ParameterGenerator;
    use crate::simulator::{Fault, SimulatedEnclave};

    const URL: &str = "https://attest.example/enclave";
    const SERVER: &str = "sql.example.com";

    fn attempt(
        enclave: &SimulatedEnclave,
        protocol: AttestationProtocol,
    ) -> (Vec<u8>, LocalKeyPair) {
        let params = ParameterGenerator::default().generate(protocol).unwrap();
        let evidence = enclave.respond(&params.to_bytes()).unwrap();
        (evidence, params.into_key_pair())
    }

    #[test]
    fn test_establish_each_protocol() {
        for protocol in [
            AttestationProtocol::AuthorityToken,
            AttestationProtocol::HostHealth,
            AttestationProtocol::None,
        ] {
            let enclave = SimulatedEnclave::new(protocol, URL);
            let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();
            let (evidence, key_pair) = attempt(&enclave, protocol);

            let session = establisher.establish(&evidence, key_pair, URL, SERVER).unwrap();
            assert_eq!(session.protocol(), protocol);
            assert_eq!(
                session.key_material(),
                &*enclave.take_enclave_key(session.session_id()).unwrap()
            );
            assert!(!session.context().is_empty());
            assert_eq!(session.measurement().is_some(), protocol.is_attested());
        }
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let protocol = AttestationProtocol::AuthorityToken;
        let enclave = SimulatedEnclave::new(protocol, URL);
        let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();

        let (old_evidence, _old_pair) = attempt(&enclave, protocol);
        let (_new_evidence, new_pair) = attempt(&enclave, protocol);

        let err = establisher
            .establish(&old_evidence, new_pair, URL, SERVER)
            .unwrap_err();
        assert!(err.is_security_rejection());
    }

    #[test]
    fn test_host_health_binds_nonce_through_enclave_signature() {
        let protocol = AttestationProtocol::HostHealth;
        let enclave = SimulatedEnclave::new(protocol, URL);
        let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();

        let (old_evidence, _old_pair) = attempt(&enclave, protocol);
        let (_, new_pair) = attempt(&enclave, protocol);

        let err = establisher
            .establish(&old_evidence, new_pair, URL, SERVER)
            .unwrap_err();
        assert_eq!(
            err,
            EnclaveError::AttestationRejected("Enclave key signature mismatch".into())
        );
    }

    #[test]
    fn test_tampered_evidence_rejected() {
        for fault in [Fault::TamperReport, Fault::TamperKeyBinding, Fault::Debuggable, Fault::Expired] {
            let protocol = AttestationProtocol::HostHealth;
            let enclave = SimulatedEnclave::new(protocol, URL);
            enclave.set_fault(Some(fault));
            let establisher =
                SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();
            let (evidence, key_pair) = attempt(&enclave, protocol);
            let err = establisher
                .establish(&evidence, key_pair, URL, SERVER)
                .unwrap_err();
            assert!(err.is_security_rejection(), "{:?} gave {:?}", fault, err);
        }
    }

    #[test]
    fn test_truncated_evidence_is_protocol_error() {
        let protocol = AttestationProtocol::AuthorityToken;
        let enclave = SimulatedEnclave::new(protocol, URL);
        enclave.set_fault(Some(Fault::Truncate));
        let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();
        let (evidence, key_pair) = attempt(&enclave, protocol);
        assert!(matches!(
            establisher.establish(&evidence, key_pair, URL, SERVER),
            Err(EnclaveError::Protocol(_))
        ));
    }

    #[test]
    fn test_no_downgrade_to_unattested() {
        let enclave = SimulatedEnclave::new(AttestationProtocol::None, URL);
        let trusted = SimulatedEnclave::new(AttestationProtocol::AuthorityToken, URL);
        let establisher = SessionEstablisher::for_protocol(
            AttestationProtocol::AuthorityToken,
            &trusted.policy(),
        )
        .unwrap();

        let (evidence, key_pair) = attempt(&enclave, AttestationProtocol::AuthorityToken);
        let err = establisher
            .establish(&evidence, key_pair, URL, SERVER)
            .unwrap_err();
        assert!(err.is_security_rejection());
    }

    #[test]
    fn test_wrong_attestation_url_rejected() {
        let protocol = AttestationProtocol::AuthorityToken;
        let enclave = SimulatedEnclave::new(protocol, URL);
        let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();
        let (evidence, key_pair) = attempt(&enclave, protocol);
        let err = establisher
            .establish(&evidence, key_pair, "https://other.example/attest", SERVER)
            .unwrap_err();
        assert!(err.is_security_rejection());
    }

    #[test]
    fn test_key_pair_for_other_protocol() {
        let enclave = SimulatedEnclave::new(AttestationProtocol::HostHealth, URL);
        let establisher =
            SessionEstablisher::for_protocol(AttestationProtocol::HostHealth, &enclave.policy())
                .unwrap();
        let (evidence, key_pair) = attempt(&enclave, AttestationProtocol::None);
        assert!(matches!(
            establisher.establish(&evidence, key_pair, URL, SERVER),
            Err(EnclaveError::Protocol(_))
        ));
    }

    #[test]
    fn test_session_identity_and_debug() {
        let protocol = AttestationProtocol::None;
        let enclave = SimulatedEnclave::new(protocol, URL);
        let establisher = SessionEstablisher::for_protocol(protocol, &enclave.policy()).unwrap();
        let (evidence, key_pair) = attempt(&enclave, protocol);
        let a = establisher.establish(&evidence, key_pair, URL, SERVER).unwrap();
        let (evidence, key_pair) = attempt(&enclave, protocol);
        let b = establisher.establish(&evidence, key_pair, URL, SERVER).unwrap();

        assert_eq!(a, a);
        assert_ne!(a, b);
        let shown = format!("{:?}", a);
        assert!(!shown.contains("key"));
        assert!(a.summary().contains("protocol=none"));
    }
}
