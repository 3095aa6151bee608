//! Attestation protocol variants and their wire tags

use crate::error::{EnclaveError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported attestation protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttestationProtocol {
    /// Attestation authority issues a signed token bound to the client nonce
    AuthorityToken,
    /// Host guardian signs a health report for the enclave host
    HostHealth,
    /// No attestation; the enclave key is accepted as-is (development only)
    None,
}

impl AttestationProtocol {
    pub fn tag(&self) -> u32 {
        match self {
            AttestationProtocol::AuthorityToken => 1,
            AttestationProtocol::None => 2,
            AttestationProtocol::HostHealth => 3,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(AttestationProtocol::AuthorityToken),
            2 => Ok(AttestationProtocol::None),
            3 => Ok(AttestationProtocol::HostHealth),
            other => Err(EnclaveError::Protocol(format!(
                "Unknown attestation protocol tag {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttestationProtocol::AuthorityToken => "authority-token",
            AttestationProtocol::HostHealth => "host-health",
            AttestationProtocol::None => "none",
        }
    }

    /// Whether evidence for this variant proves anything about the enclave
    pub fn is_attested(&self) -> bool {
        !matches!(self, AttestationProtocol::None)
    }
}

impl fmt::Display for AttestationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttestationProtocol {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "authority-token" | "aas" | "a" => Ok(AttestationProtocol::AuthorityToken),
            "host-health" | "hgs" | "b" => Ok(AttestationProtocol::HostHealth),
            "none" => Ok(AttestationProtocol::None),
            other => Err(EnclaveError::Config(format!(
                "Unknown attestation protocol '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(AttestationProtocol::AuthorityToken.tag(), 1);
        assert_eq!(AttestationProtocol::None.tag(), 2);
        assert_eq!(AttestationProtocol::HostHealth.tag(), 3);
        assert!(AttestationProtocol::from_tag(0).is_err());
        assert_eq!(
            AttestationProtocol::from_tag(3).unwrap(),
            AttestationProtocol::HostHealth
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "AAS".parse::<AttestationProtocol>().unwrap(),
            AttestationProtocol::AuthorityToken
        );
        assert_eq!(
            "host-health".parse::<AttestationProtocol>().unwrap(),
            AttestationProtocol::HostHealth
        );
        assert!("sgx".parse::<AttestationProtocol>().is_err());
        assert!(!AttestationProtocol::None.is_attested());
    }
}
