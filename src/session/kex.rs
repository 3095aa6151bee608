//! Ephemeral key exchange
//!
//! P-256 ECDH with the shared secret stretched through HKDF-SHA256. The
//! client nonce is the HKDF salt and the enclave-assigned session id is mixed
//! into the info string, so a key is bound to exactly one attestation attempt.

use crate::attestation::AttestationProtocol;
use crate::error::{EnclaveError, Result};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ecdh::diffie_hellman, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 32;

const SESSION_KEY_INFO: &[u8] = b"enclave-session-key-v1";
const MAX_SCALAR_ATTEMPTS: usize = 8;

/// Source of key and nonce entropy
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<()>;
}

/// Operating-system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| EnclaveError::KeyGeneration(format!("OS entropy unavailable: {}", e)))
    }
}

/// Caller-owned ephemeral key pair for one establishment attempt.
///
/// Carries the nonce it was generated with so the evidence can be checked
/// against it. Consumed by the establisher; the scalar is wiped on drop.
pub struct LocalKeyPair {
    protocol: AttestationProtocol,
    nonce: [u8; NONCE_LEN],
    secret: SecretKey,
    public: Vec<u8>,
}

impl LocalKeyPair {
    pub fn generate(protocol: AttestationProtocol, entropy: &dyn EntropySource) -> Result<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        entropy.fill(&mut nonce)?;
        let secret = random_secret(entropy)?;
        let public = encode_public_key(&secret.public_key());
        Ok(Self {
            protocol,
            nonce,
            secret,
            public,
        })
    }

    pub fn protocol(&self) -> AttestationProtocol {
        self.protocol
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// SEC1 uncompressed public key
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    pub(crate) fn derive_session_key(
        &self,
        peer: &PublicKey,
        session_id: u64,
    ) -> Zeroizing<[u8; SESSION_KEY_LEN]> {
        derive_session_key(&self.secret, peer, &self.nonce, session_id)
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("protocol", &self.protocol)
            .field("public", &hex::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// Draw a valid P-256 scalar from `entropy`, retrying out-of-range draws.
pub fn random_secret(entropy: &dyn EntropySource) -> Result<SecretKey> {
    for _ in 0..MAX_SCALAR_ATTEMPTS {
        let mut bytes = Zeroizing::new([0u8; 32]);
        entropy.fill(&mut bytes[..])?;
        if let Ok(secret) = SecretKey::from_slice(&bytes[..]) {
            return Ok(secret);
        }
    }
    Err(EnclaveError::KeyGeneration(
        "Entropy source produced no valid P-256 scalar".into(),
    ))
}

pub fn encode_public_key(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(false).as_bytes().to_vec()
}

pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|e| EnclaveError::Protocol(format!("Invalid enclave public key: {}", e)))
}

/// Both sides run this with their own secret and the other's public key.
pub fn derive_session_key(
    secret: &SecretKey,
    peer: &PublicKey,
    nonce: &[u8],
    session_id: u64,
) -> Zeroizing<[u8; SESSION_KEY_LEN]> {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let hk = Hkdf::<Sha256>::new(Some(nonce), shared.raw_secret_bytes().as_slice());

    let mut info = Vec::with_capacity(SESSION_KEY_INFO.len() + 8);
    info.extend_from_slice(SESSION_KEY_INFO);
    info.extend_from_slice(&session_id.to_le_bytes());

    let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    let res = hk.expand(&info, &mut okm[..]);
    debug_assert!(res.is_ok(), "HKDF expand cannot fail for 32-byte output");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeadEntropy;

    impl EntropySource for DeadEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<()> {
            Err(EnclaveError::KeyGeneration("entropy pool closed".into()))
        }
    }

    /// Always yields 0xFF bytes, which is above the P-256 group order.
    struct SaturatedEntropy;

    impl EntropySource for SaturatedEntropy {
        fn fill(&self, dest: &mut [u8]) -> Result<()> {
            dest.fill(0xFF);
            Ok(())
        }
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let client = LocalKeyPair::generate(AttestationProtocol::None, &OsEntropy).unwrap();
        let enclave_secret = random_secret(&OsEntropy).unwrap();

        let client_public = decode_public_key(client.public_key()).unwrap();
        let enclave_side =
            derive_session_key(&enclave_secret, &client_public, client.nonce(), 42);
        let client_side = client.derive_session_key(&enclave_secret.public_key(), 42);

        assert_eq!(*enclave_side, *client_side);
    }

    #[test]
    fn test_session_id_changes_key() {
        let client = LocalKeyPair::generate(AttestationProtocol::None, &OsEntropy).unwrap();
        let enclave_secret = random_secret(&OsEntropy).unwrap();
        let a = client.derive_session_key(&enclave_secret.public_key(), 1);
        let b = client.derive_session_key(&enclave_secret.public_key(), 2);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_fresh_nonce_per_key_pair() {
        let a = LocalKeyPair::generate(AttestationProtocol::HostHealth, &OsEntropy).unwrap();
        let b = LocalKeyPair::generate(AttestationProtocol::HostHealth, &OsEntropy).unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.public_key(), b.public_key());
        assert_eq!(a.public_key().len(), 65);
    }

    #[test]
    fn test_entropy_failure_surfaces_key_generation_error() {
        let err = LocalKeyPair::generate(AttestationProtocol::None, &DeadEntropy).unwrap_err();
        assert!(matches!(err, EnclaveError::KeyGeneration(_)));
    }

    #[test]
    fn test_out_of_range_scalars_exhaust_attempts() {
        let err = random_secret(&SaturatedEntropy).unwrap_err();
        assert!(matches!(err, EnclaveError::KeyGeneration(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let pair = LocalKeyPair::generate(AttestationProtocol::None, &OsEntropy).unwrap();
        let shown = format!("{:?}", pair);
        assert!(shown.contains("LocalKeyPair"));
        assert!(!shown.contains("secret"));
    }
}
