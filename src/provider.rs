//! Enclave Provider — the façade consumed by the encryption layer
//!
//! Composes the parameter generator, the session establisher for one protocol
//! variant and an injected [`SessionCache`]:
//! - `get_enclave_session`: cache lookup only, never attests
//! - `get_attestation_parameters`: fresh nonce + ephemeral key
//! - `create_enclave_session`: validate evidence and derive the key, coalesced per endpoint
//! - `invalidate_enclave_session`: drop a session the caller found stale

use crate::attestation::{
    AttestationParameters, AttestationPolicy, AttestationProtocol, ParameterGenerator,
};
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::session::cache::{Invalidation, SessionCache};
use crate::session::establisher::{EnclaveSession, SessionEstablisher};
use crate::session::kex::LocalKeyPair;
use futures::future::BoxFuture;
use log::debug;
use std::sync::Arc;

/// Network collaborator that carries an attestation request to the enclave
/// host and returns its evidence bytes. Failures should be `EnclaveError::Transport`.
pub trait AttestationTransport: Send + Sync {
    fn exchange<'a>(&'a self, request: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>>;
}

pub struct EnclaveProvider {
    protocol: AttestationProtocol,
    generator: ParameterGenerator,
    establisher: SessionEstablisher,
    cache: Arc<SessionCache>,
}

impl EnclaveProvider {
    /// Provider with its own cache, built from configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(SessionCache::new(config.cache_config()));
        Self::with_cache(config.protocol, &config.policy, cache)
    }

    /// Provider over a caller-owned cache, e.g. shared between providers
    pub fn with_cache(
        protocol: AttestationProtocol,
        policy: &AttestationPolicy,
        cache: Arc<SessionCache>,
    ) -> Result<Self> {
        Ok(Self {
            protocol,
            generator: ParameterGenerator::default(),
            establisher: SessionEstablisher::for_protocol(protocol, policy)?,
            cache,
        })
    }

    pub fn with_generator(mut self, generator: ParameterGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Replace the establisher, e.g. one built over a custom [`EvidenceValidator`]
    ///
    /// [`EvidenceValidator`]: crate::attestation::EvidenceValidator
    pub fn with_establisher(mut self, establisher: SessionEstablisher) -> Self {
        self.protocol = establisher.protocol();
        self.establisher = establisher;
        self
    }

    pub fn protocol(&self) -> AttestationProtocol {
        self.protocol
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Cached session and its next replay counter; `(None, 0)` on a miss.
    pub fn get_enclave_session(
        &self,
        server_name: &str,
        attestation_url: &str,
    ) -> (Option<Arc<EnclaveSession>>, u64) {
        let key = self.cache.key(server_name, attestation_url);
        self.cache.lookup(&key).into_parts()
    }

    pub fn get_attestation_parameters(
        &self,
        protocol: AttestationProtocol,
    ) -> Result<AttestationParameters> {
        self.generator.generate(protocol)
    }

    /// Establish (or join the in-flight establishment of) the session for this
    /// endpoint. `key_pair` is released when the call returns.
    pub async fn create_enclave_session(
        &self,
        evidence: &[u8],
        key_pair: LocalKeyPair,
        attestation_url: &str,
        server_name: &str,
    ) -> Result<(Arc<EnclaveSession>, u64)> {
        let key = self.cache.key(server_name, attestation_url);
        self.cache
            .get_or_create(key, move || async move {
                self.establisher
                    .establish(evidence, key_pair, attestation_url, server_name)
            })
            .await
    }

    pub fn invalidate_enclave_session(
        &self,
        server_name: &str,
        attestation_url: &str,
        session: &EnclaveSession,
    ) {
        let key = self.cache.key(server_name, attestation_url);
        if self.cache.invalidate(&key, session) == Invalidation::SessionMismatch {
            debug!(
                "Session {:016x} for {} already replaced, nothing to invalidate",
                session.session_id(),
                key
            );
        }
    }

    /// Full flow: cached session if any, otherwise generate parameters, run the
    /// exchange over `transport` and establish. Concurrent callers for the same
    /// endpoint share one exchange.
    pub async fn establish_session<T>(
        &self,
        server_name: &str,
        attestation_url: &str,
        transport: &T,
    ) -> Result<(Arc<EnclaveSession>, u64)>
    where
        T: AttestationTransport + ?Sized,
    {
        let key = self.cache.key(server_name, attestation_url);
        self.cache
            .get_or_create(key, || async move {
                let params = self.generator.generate(self.protocol)?;
                let evidence = transport.exchange(&params.to_bytes()).await?;
                self.establisher.establish(
                    &evidence,
                    params.into_key_pair(),
                    attestation_url,
                    server_name,
                )
            })
            .await
    }
}
