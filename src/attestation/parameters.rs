//! Attestation parameters — the client's half of the exchange
//!
//! A fresh nonce and ephemeral P-256 key pair are generated for every attempt.
//! The public part travels to the enclave as an [`AttestationRequest`]; the
//! private half stays with the caller as a [`LocalKeyPair`].

use super::protocol::AttestationProtocol;
use crate::error::{EnclaveError, Result};
use crate::session::kex::{EntropySource, LocalKeyPair, OsEntropy, NONCE_LEN};
use crate::wire::{Reader, Writer};
use std::sync::Arc;

const REQUEST_MAGIC: &[u8; 4] = b"EATR";

/// Public attestation request sent to the enclave host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRequest {
    pub protocol: AttestationProtocol,
    pub nonce: [u8; NONCE_LEN],
    /// SEC1 uncompressed client public key
    pub client_public_key: Vec<u8>,
}

impl AttestationRequest {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .magic(REQUEST_MAGIC)
            .u32(self.protocol.tag())
            .field(&self.nonce)
            .field(&self.client_public_key)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes, "attestation request");
        reader.expect_magic(REQUEST_MAGIC)?;
        let protocol = AttestationProtocol::from_tag(reader.u32()?)?;
        let nonce: [u8; NONCE_LEN] = reader.field()?.try_into().map_err(|_| {
            EnclaveError::Protocol(format!("Attestation nonce must be {} bytes", NONCE_LEN))
        })?;
        let client_public_key = reader.field()?.to_vec();
        reader.finish()?;
        Ok(Self {
            protocol,
            nonce,
            client_public_key,
        })
    }
}

/// Parameters for one establishment attempt. Never cached.
#[derive(Debug)]
pub struct AttestationParameters {
    request: AttestationRequest,
    key_pair: LocalKeyPair,
}

impl AttestationParameters {
    pub fn protocol(&self) -> AttestationProtocol {
        self.request.protocol
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.request.nonce
    }

    pub fn client_public_key(&self) -> &[u8] {
        &self.request.client_public_key
    }

    pub fn request(&self) -> &AttestationRequest {
        &self.request
    }

    /// Wire bytes for the attestation exchange
    pub fn to_bytes(&self) -> Vec<u8> {
        self.request.encode()
    }

    /// Hand the private half to the caller once the request has been sent.
    pub fn into_key_pair(self) -> LocalKeyPair {
        self.key_pair
    }
}

/// Produces attestation parameters; has no access to any session state.
#[derive(Clone)]
pub struct ParameterGenerator {
    entropy: Arc<dyn EntropySource>,
}

impl Default for ParameterGenerator {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

impl ParameterGenerator {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    pub fn generate(&self, protocol: AttestationProtocol) -> Result<AttestationParameters> {
        let key_pair = LocalKeyPair::generate(protocol, self.entropy.as_ref())?;
        let request = AttestationRequest {
            protocol,
            nonce: *key_pair.nonce(),
            client_public_key: key_pair.public_key().to_vec(),
        };
        log::debug!(
            "Generated {} attestation parameters (client key {}..)",
            protocol,
            &hex::encode(&request.client_public_key)[..16]
        );
        Ok(AttestationParameters { request, key_pair })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeadEntropy;

    impl EntropySource for DeadEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<()> {
            Err(EnclaveError::KeyGeneration("getrandom returned EIO".into()))
        }
    }

    #[test]
    fn test_generate_parameters() {
        let generator = ParameterGenerator::default();
        let params = generator
            .generate(AttestationProtocol::AuthorityToken)
            .unwrap();
        assert_eq!(params.protocol(), AttestationProtocol::AuthorityToken);
        assert_eq!(params.client_public_key().len(), 65);

        let nonce = *params.nonce();
        let key_pair = params.into_key_pair();
        assert_eq!(key_pair.nonce(), &nonce);
        assert_eq!(key_pair.protocol(), AttestationProtocol::AuthorityToken);
    }

    #[test]
    fn test_nonce_never_reused() {
        let generator = ParameterGenerator::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let params = generator.generate(AttestationProtocol::HostHealth).unwrap();
            assert!(seen.insert(*params.nonce()));
        }
    }

    #[test]
    fn test_request_wire_format() {
        let params = ParameterGenerator::default()
            .generate(AttestationProtocol::None)
            .unwrap();
        let decoded = AttestationRequest::decode(&params.to_bytes()).unwrap();
        assert_eq!(&decoded, params.request());
    }

    #[test]
    fn test_request_with_short_nonce_rejected() {
        let bytes = Writer::new()
            .magic(REQUEST_MAGIC)
            .u32(AttestationProtocol::None.tag())
            .field(&[0u8; 8])
            .field(&[4u8; 65])
            .finish();
        let err = AttestationRequest::decode(&bytes).unwrap_err();
        assert!(matches!(err, EnclaveError::Protocol(_)));
    }

    #[test]
    fn test_generation_failure() {
        let generator = ParameterGenerator::new(Arc::new(DeadEntropy));
        let err = generator.generate(AttestationProtocol::None).unwrap_err();
        assert!(matches!(err, EnclaveError::KeyGeneration(_)));
    }
}
