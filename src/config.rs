//! Provider configuration, loadable from a JSON file

use crate::attestation::{AttestationPolicy, AttestationProtocol};
use crate::error::{EnclaveError, Result};
use crate::session::cache::CacheConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub protocol: AttestationProtocol,
    /// Reuse established sessions per (server, attestation URL)
    pub caching_enabled: bool,
    pub case_sensitive_keys: bool,
    /// Drop cached sessions after this many seconds
    pub session_ttl_secs: Option<u64>,
    /// Abort an establishment (and fail its waiters) after this many seconds
    pub establish_timeout_secs: Option<u64>,
    pub policy: AttestationPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            protocol: AttestationProtocol::AuthorityToken,
            caching_enabled: true,
            case_sensitive_keys: false,
            session_ttl_secs: None,
            establish_timeout_secs: None,
            policy: AttestationPolicy::default(),
        }
    }
}

impl ProviderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EnclaveError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&json)?;
        info!(
            "Loaded provider config from {} (protocol={})",
            path.display(),
            config.protocol
        );
        Ok(config)
    }

    /// Parse only; `EnclaveProvider::new` runs `validate`
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EnclaveError::Config(format!("Invalid provider config: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EnclaveError::Config(e.to_string()))
    }

    /// Reject configurations that could never attest successfully
    pub fn validate(&self) -> Result<()> {
        let keys = self.policy.authority_keys()?;
        if self.protocol.is_attested() && keys.is_empty() {
            return Err(EnclaveError::Config(format!(
                "Protocol {} requires at least one trusted authority key",
                self.protocol
            )));
        }
        if self.policy.max_evidence_age_secs <= 0 {
            return Err(EnclaveError::Config(
                "max_evidence_age_secs must be positive".into(),
            ));
        }
        if self.session_ttl_secs == Some(0) || self.establish_timeout_secs == Some(0) {
            return Err(EnclaveError::Config(
                "Durations must be at least one second".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.caching_enabled,
            case_sensitive_keys: self.case_sensitive_keys,
            session_ttl: self.session_ttl_secs.map(Duration::from_secs),
            establish_timeout: self.establish_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::evidence::encode_verifying_key;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn authority() -> String {
        encode_verifying_key(SigningKey::random(&mut OsRng).verifying_key())
    }

    #[test]
    fn test_defaults_from_empty_object() {
        let config: ProviderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ProviderConfig::default());
        assert!(config.caching_enabled);
        assert!(!config.case_sensitive_keys);
    }

    #[test]
    fn test_parse_full_config() {
        let json = format!(
            r#"{{
                "protocol": "host-health",
                "caching_enabled": false,
                "session_ttl_secs": 600,
                "establish_timeout_secs": 30,
                "policy": {{
                    "trusted_authorities": ["{}"],
                    "min_svn": 2,
                    "allow_debug": true
                }}
            }}"#,
            authority()
        );
        let config = ProviderConfig::from_json(&json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.protocol, AttestationProtocol::HostHealth);
        assert_eq!(config.policy.min_svn, 2);
        assert!(config.policy.allow_debug);
        assert!(config.policy.require_code_integrity);

        let cache = config.cache_config();
        assert!(!cache.enabled);
        assert_eq!(cache.session_ttl, Some(Duration::from_secs(600)));
        assert_eq!(cache.establish_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_attested_protocol_needs_authority() {
        let err = ProviderConfig::default().validate().unwrap_err();
        assert!(matches!(err, EnclaveError::Config(_)));

        let none = ProviderConfig {
            protocol: AttestationProtocol::None,
            ..ProviderConfig::default()
        };
        assert!(none.validate().is_ok());
    }

    #[test]
    fn test_malformed_authority_key() {
        let config = ProviderConfig {
            policy: AttestationPolicy {
                trusted_authorities: vec!["not-hex".into()],
                ..AttestationPolicy::default()
            },
            ..ProviderConfig::default()
        };
        assert!(matches!(config.validate(), Err(EnclaveError::Config(_))));
    }

    #[test]
    fn test_invalid_json_and_missing_file() {
        assert!(matches!(
            ProviderConfig::from_json("{ nope"),
            Err(EnclaveError::Config(_))
        ));
        assert!(matches!(
            ProviderConfig::load("/nonexistent/enclave-session.json"),
            Err(EnclaveError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let config = ProviderConfig {
            protocol: AttestationProtocol::None,
            session_ttl_secs: Some(60),
            ..ProviderConfig::default()
        };
        let path = std::env::temp_dir().join(format!(
            "enclave-session-config-{}.json",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let loaded = ProviderConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
