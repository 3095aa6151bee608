//! Enclave Session — client-side enclave attestation and session establishment
//!
//! Before an encryption layer sends plaintext to a server-side secure enclave it
//! must be sure the enclave is genuine and share a symmetric key with it:
//! 1. Generate attestation parameters (nonce + ephemeral P-256 key)
//! 2. Validate the evidence the server returns for the configured protocol
//! 3. Derive the session key over ECDH + HKDF
//! 4. Cache the session per endpoint, coalescing concurrent establishments
//!    and handing out a replay counter with every use

pub mod attestation;
pub mod config;
pub mod error;
pub mod provider;
pub mod session;
pub mod simulator;
mod wire;

pub use attestation::{
    AttestationParameters, AttestationPolicy, AttestationProtocol, AttestationVerdict,
    EvidenceValidator, ParameterGenerator,
};
pub use config::ProviderConfig;
pub use error::{EnclaveError, Result};
pub use provider::{AttestationTransport, EnclaveProvider};
pub use session::{CacheConfig, EnclaveSession, LocalKeyPair, SessionCache};
pub use simulator::SimulatedEnclave;
