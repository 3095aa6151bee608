//! Error taxonomy for attestation and session establishment
//!
//! Every variant carries owned data so a single establishment outcome can be
//! cloned out to the producer and to every coalesced waiter.

use std::time::Duration;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EnclaveError>;

/// Errors raised while attesting an enclave or managing its session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnclaveError {
    /// Entropy source or key primitive could not produce key material
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Evidence failed trust validation. Never retry against this enclave blindly.
    #[error("Attestation rejected: {0}")]
    AttestationRejected(String),

    /// Evidence or request bytes were malformed or truncated
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The network collaborator failed to carry the attestation exchange
    #[error("Transport error: {0}")]
    Transport(String),

    /// The producing establishment was dropped before it completed
    #[error("Session establishment cancelled")]
    Cancelled,

    /// The producing establishment exceeded the configured deadline
    #[error("Session establishment timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EnclaveError {
    /// Whether the caller may reasonably retry the whole establishment.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnclaveError::Transport(_) | EnclaveError::Timeout(_) | EnclaveError::Cancelled
        )
    }

    /// Whether the failure is a trust decision rather than a mechanical fault.
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, EnclaveError::AttestationRejected(_))
    }
}
