//! Attestation — parameters the client sends and evidence it gets back
//!
//! - **Protocol**: the pluggable attestation variants and their wire tags
//! - **Parameters**: nonce + ephemeral key generation for each attempt
//! - **Evidence**: the enclave's response envelope and signed reports
//! - **Validator**: per-variant trust decisions against an [`AttestationPolicy`]

pub mod evidence;
pub mod parameters;
pub mod protocol;
pub mod validator;

pub use evidence::{AuthorityClaims, Evidence, HealthClaims, SignedReport};
pub use parameters::{AttestationParameters, AttestationRequest, ParameterGenerator};
pub use protocol::AttestationProtocol;
pub use validator::{
    validator_for, AttestationPolicy, AttestationVerdict, EvidenceValidator, TrustedEnclave,
    ValidationContext,
};
