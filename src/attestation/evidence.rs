//! Attestation evidence — what the enclave host sends back
//!
//! Technology-neutral envelope:
//! 1. Variant report (signed claims from an attestation authority or host guardian)
//! 2. The enclave's ephemeral DH public key
//! 3. Enclave signature binding that key to the client nonce and session id
//! 4. Session id and opaque session context echoed by the enclave

use super::protocol::AttestationProtocol;
use crate::error::{EnclaveError, Result};
use crate::wire::{Reader, Writer};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const EVIDENCE_MAGIC: &[u8; 4] = b"EEVD";
const KEY_BINDING_LABEL: &[u8] = b"enclave-key-binding-v1";

/// Decoded evidence envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub protocol: AttestationProtocol,
    /// Variant-specific report; empty for the `None` protocol
    pub report: Vec<u8>,
    /// SEC1 enclave DH public key
    pub enclave_public_key: Vec<u8>,
    /// Enclave signature over [`key_binding_message`]; empty for `None`
    pub enclave_signature: Vec<u8>,
    pub session_id: u64,
    pub session_context: Vec<u8>,
}

impl Evidence {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .magic(EVIDENCE_MAGIC)
            .u32(self.protocol.tag())
            .field(&self.report)
            .field(&self.enclave_public_key)
            .field(&self.enclave_signature)
            .u64(self.session_id)
            .field(&self.session_context)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes, "attestation evidence");
        reader.expect_magic(EVIDENCE_MAGIC)?;
        let protocol = AttestationProtocol::from_tag(reader.u32()?)?;
        let report = reader.field()?.to_vec();
        let enclave_public_key = reader.field()?.to_vec();
        let enclave_signature = reader.field()?.to_vec();
        let session_id = reader.u64()?;
        let session_context = reader.field()?.to_vec();
        reader.finish()?;

        if enclave_public_key.is_empty() {
            return Err(EnclaveError::Protocol(
                "Evidence carries no enclave public key".into(),
            ));
        }

        Ok(Self {
            protocol,
            report,
            enclave_public_key,
            enclave_signature,
            session_id,
            session_context,
        })
    }
}

/// Message the enclave signs to bind its DH key to this attempt
pub fn key_binding_message(enclave_public_key: &[u8], nonce: &[u8], session_id: u64) -> Vec<u8> {
    let mut msg =
        Vec::with_capacity(KEY_BINDING_LABEL.len() + enclave_public_key.len() + nonce.len() + 8);
    msg.extend_from_slice(KEY_BINDING_LABEL);
    msg.extend_from_slice(enclave_public_key);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(&session_id.to_le_bytes());
    msg
}

/// Claims issued by an attestation authority (variant A)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityClaims {
    /// Attestation endpoint that issued the token
    pub issuer: String,
    /// Hex client nonce echoed by the authority
    pub nonce: String,
    pub measurement: String,
    pub svn: u16,
    pub debuggable: bool,
    /// Hex SEC1 enclave signing key
    pub enclave_signing_key: String,
    /// Unix seconds
    pub issued_at: i64,
}

/// Health report signed by the host guardian (variant B)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthClaims {
    pub issuer: String,
    pub measurement: String,
    pub svn: u16,
    /// Hypervisor code integrity enforced on the host
    pub code_integrity: bool,
    pub debuggable: bool,
    pub enclave_signing_key: String,
    pub issued_at: i64,
}

/// JSON claims plus the issuer's ECDSA-P256 signature over them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedReport {
    pub claims: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedReport {
    pub fn sign<C: Serialize>(claims: &C, issuer_key: &SigningKey) -> Result<Self> {
        let claims = serde_json::to_vec(claims)
            .map_err(|e| EnclaveError::Protocol(format!("Claims serialization: {}", e)))?;
        let signature = sign_message(issuer_key, &claims);
        Ok(Self { claims, signature })
    }

    pub fn verify(&self, issuer_key: &VerifyingKey) -> bool {
        verify_message(issuer_key, &self.claims, &self.signature)
    }

    pub fn parse_claims<C: DeserializeOwned>(&self) -> Result<C> {
        serde_json::from_slice(&self.claims)
            .map_err(|e| EnclaveError::Protocol(format!("Malformed report claims: {}", e)))
    }

    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .field(&self.claims)
            .field(&self.signature)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes, "attestation report");
        let claims = reader.field()?.to_vec();
        let signature = reader.field()?.to_vec();
        reader.finish()?;
        Ok(Self { claims, signature })
    }
}

pub fn sign_message(key: &SigningKey, msg: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(msg);
    signature.to_bytes().to_vec()
}

pub fn verify_message(key: &VerifyingKey, msg: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(signature) => key.verify(msg, &signature).is_ok(),
        Err(_) => false,
    }
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(false).as_bytes())
}

pub fn decode_verifying_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| EnclaveError::Protocol(format!("Verifying key hex: {}", e)))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| EnclaveError::Protocol(format!("Verifying key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn sample_evidence() -> Evidence {
        Evidence {
            protocol: AttestationProtocol::HostHealth,
            report: vec![1, 2, 3],
            enclave_public_key: vec![4; 65],
            enclave_signature: vec![5; 64],
            session_id: 0xdead_beef,
            session_context: b"ctx".to_vec(),
        }
    }

    #[test]
    fn test_decode_encoded_evidence() {
        let evidence = sample_evidence();
        assert_eq!(Evidence::decode(&evidence.encode()).unwrap(), evidence);
    }

    #[test]
    fn test_truncated_evidence() {
        let bytes = sample_evidence().encode();
        for cut in [0, 3, 8, bytes.len() - 1] {
            let err = Evidence::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, EnclaveError::Protocol(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unknown_protocol_tag() {
        let mut bytes = sample_evidence().encode();
        bytes[4] = 9;
        assert!(matches!(
            Evidence::decode(&bytes),
            Err(EnclaveError::Protocol(_))
        ));
    }

    #[test]
    fn test_missing_enclave_key() {
        let mut evidence = sample_evidence();
        evidence.enclave_public_key.clear();
        assert!(Evidence::decode(&evidence.encode()).is_err());
    }

    #[test]
    fn test_signed_report_detects_tampering() {
        let issuer = SigningKey::random(&mut OsRng);
        let claims = HealthClaims {
            issuer: "https://hgs.example/attest".into(),
            measurement: "abc".into(),
            svn: 2,
            code_integrity: true,
            debuggable: false,
            enclave_signing_key: "00".into(),
            issued_at: 1_700_000_000,
        };
        let mut report = SignedReport::sign(&claims, &issuer).unwrap();
        assert!(report.verify(issuer.verifying_key()));
        assert_eq!(report.parse_claims::<HealthClaims>().unwrap(), claims);

        let last = report.claims.len() - 2;
        report.claims[last] ^= 0x01;
        assert!(!report.verify(issuer.verifying_key()));
    }

    #[test]
    fn test_verifying_key_hex() {
        let key = SigningKey::random(&mut OsRng);
        let encoded = encode_verifying_key(key.verifying_key());
        assert_eq!(&decode_verifying_key(&encoded).unwrap(), key.verifying_key());
        assert!(decode_verifying_key("zz").is_err());
    }
}
