//! Simulated enclave host — software stand-in for a real attested server
//!
//! Plays both the enclave and its attestation issuer: answers an
//! [`AttestationRequest`] with genuinely signed evidence for the configured
//! protocol, and remembers the enclave-side session keys so callers can check
//! both ends agree. NOT hardware-secured; for development, demos and tests.

use crate::attestation::evidence::{
    encode_verifying_key, key_binding_message, sign_message, AuthorityClaims, Evidence,
    HealthClaims, SignedReport,
};
use crate::attestation::{AttestationPolicy, AttestationProtocol, AttestationRequest};
use crate::error::{EnclaveError, Result};
use crate::provider::AttestationTransport;
use crate::session::kex::{
    decode_public_key, derive_session_key, encode_public_key, random_secret, OsEntropy,
    SESSION_KEY_LEN,
};
use chrono::Utc;
use futures::future::BoxFuture;
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use zeroize::Zeroizing;

/// Enclave-side keys kept for comparison; the oldest is dropped beyond this
const MAX_RETAINED_KEYS: usize = 64;

/// Misbehaviour to inject into the next responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip a bit in the issuer's report signature
    TamperReport,
    /// Flip a bit in the enclave's key-binding signature
    TamperKeyBinding,
    /// Answer with a nonce other than the one requested
    StaleNonce,
    /// Cut the evidence in half
    Truncate,
    /// Report a debug-mode enclave
    Debuggable,
    /// Backdate the report by a day
    Expired,
    /// Fail the exchange at the transport level
    Unavailable,
}

pub struct SimulatedEnclave {
    protocol: AttestationProtocol,
    attestation_url: String,
    issuer: SigningKey,
    enclave: SigningKey,
    measurement: String,
    svn: u16,
    latency: Duration,
    fault: Mutex<Option<Fault>>,
    next_session_id: AtomicU64,
    exchanges: AtomicUsize,
    keys: Mutex<HashMap<u64, Zeroizing<[u8; SESSION_KEY_LEN]>>>,
}

impl SimulatedEnclave {
    pub fn new(protocol: AttestationProtocol, attestation_url: &str) -> Self {
        let instance = uuid::Uuid::new_v4();
        let measurement = {
            let mut h = Sha256::new();
            h.update(b"enclave-session-simulated-enclave");
            h.update(instance.as_bytes());
            hex::encode(h.finalize())
        };

        log::info!(
            "Simulated enclave started: protocol={}, measurement={}..",
            protocol,
            &measurement[..16]
        );

        Self {
            protocol,
            attestation_url: attestation_url.to_string(),
            issuer: SigningKey::random(&mut OsRng),
            enclave: SigningKey::random(&mut OsRng),
            measurement,
            svn: 1,
            latency: Duration::ZERO,
            fault: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
            exchanges: AtomicUsize::new(0),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every transport exchange, to widen race windows in tests
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_fault(&self, fault: Option<Fault>) {
        *lock(&self.fault) = fault;
    }

    pub fn protocol(&self) -> AttestationProtocol {
        self.protocol
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Number of transport exchanges served so far
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Policy that trusts exactly this simulated issuer and enclave build
    pub fn policy(&self) -> AttestationPolicy {
        AttestationPolicy {
            trusted_authorities: vec![encode_verifying_key(self.issuer.verifying_key())],
            trusted_measurements: vec![self.measurement.clone()],
            min_svn: self.svn,
            ..AttestationPolicy::default()
        }
    }

    /// Hand out the enclave-side copy of a session key. Each key can be taken once.
    pub fn take_enclave_key(&self, session_id: u64) -> Option<Zeroizing<[u8; SESSION_KEY_LEN]>> {
        lock(&self.keys).remove(&session_id)
    }

    /// Number of enclave-side keys not yet taken
    pub fn retained_keys(&self) -> usize {
        lock(&self.keys).len()
    }

    /// Answer an encoded attestation request with encoded evidence
    pub fn respond(&self, request: &[u8]) -> Result<Vec<u8>> {
        let fault = *lock(&self.fault);
        if fault == Some(Fault::Unavailable) {
            return Err(EnclaveError::Transport(
                "Simulated attestation service unavailable".into(),
            ));
        }

        let request = AttestationRequest::decode(request)?;
        let client_public = decode_public_key(&request.client_public_key)?;

        let dh_secret = random_secret(&OsEntropy)?;
        let enclave_public_key = encode_public_key(&dh_secret.public_key());
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);

        let mut echoed_nonce = request.nonce;
        if fault == Some(Fault::StaleNonce) {
            echoed_nonce[0] ^= 0xFF;
        }
        let issued_at = match fault {
            Some(Fault::Expired) => Utc::now().timestamp() - 86_400,
            _ => Utc::now().timestamp(),
        };
        let debuggable = fault == Some(Fault::Debuggable);
        let enclave_signing_key = encode_verifying_key(self.enclave.verifying_key());

        let mut report = match self.protocol {
            AttestationProtocol::AuthorityToken => SignedReport::sign(
                &AuthorityClaims {
                    issuer: self.attestation_url.clone(),
                    nonce: hex::encode(echoed_nonce),
                    measurement: self.measurement.clone(),
                    svn: self.svn,
                    debuggable,
                    enclave_signing_key,
                    issued_at,
                },
                &self.issuer,
            )?
            .encode(),
            AttestationProtocol::HostHealth => SignedReport::sign(
                &HealthClaims {
                    issuer: self.attestation_url.clone(),
                    measurement: self.measurement.clone(),
                    svn: self.svn,
                    code_integrity: true,
                    debuggable,
                    enclave_signing_key,
                    issued_at,
                },
                &self.issuer,
            )?
            .encode(),
            AttestationProtocol::None => Vec::new(),
        };
        if fault == Some(Fault::TamperReport) {
            if let Some(last) = report.last_mut() {
                *last ^= 0x01;
            }
        }

        let mut enclave_signature = if self.protocol.is_attested() {
            sign_message(
                &self.enclave,
                &key_binding_message(&enclave_public_key, &echoed_nonce, session_id),
            )
        } else {
            Vec::new()
        };
        if fault == Some(Fault::TamperKeyBinding) {
            if let Some(first) = enclave_signature.first_mut() {
                *first ^= 0x01;
            }
        }

        let key = derive_session_key(&dh_secret, &client_public, &request.nonce, session_id);
        {
            let mut keys = lock(&self.keys);
            if keys.len() >= MAX_RETAINED_KEYS {
                if let Some(oldest) = keys.keys().min().copied() {
                    keys.remove(&oldest);
                }
            }
            keys.insert(session_id, key);
        }

        let mut evidence = Evidence {
            protocol: self.protocol,
            report,
            enclave_public_key,
            enclave_signature,
            session_id,
            session_context: format!("simulated-session-{}", session_id).into_bytes(),
        }
        .encode();
        if fault == Some(Fault::Truncate) {
            evidence.truncate(evidence.len() / 2);
        }

        log::debug!(
            "Simulated enclave issued session {:016x} ({} bytes of evidence)",
            session_id,
            evidence.len()
        );
        Ok(evidence)
    }
}

impl AttestationTransport for SimulatedEnclave {
    fn exchange<'a>(&'a self, request: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.respond(request)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
