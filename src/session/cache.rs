//! Session Cache — keyed store of established enclave sessions
//!
//! One entry per (server name, attestation URL):
//! - **Pending**: an establishment is in flight; late arrivals subscribe to its
//!   watch channel instead of starting their own attestation
//! - **Established**: the session plus its replay counter
//!
//! The map lock is only held for map operations, never across an await, so
//! unrelated keys do not serialize behind each other.

use super::establisher::EnclaveSession;
use crate::error::{EnclaveError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Counter handed out with a freshly established session
pub const FIRST_COUNTER: u64 = 1;

/// Identifies one logical enclave endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    server_name: String,
    attestation_url: String,
}

impl CacheKey {
    pub fn new(server_name: &str, attestation_url: &str, case_sensitive: bool) -> Self {
        if case_sensitive {
            Self {
                server_name: server_name.to_string(),
                attestation_url: attestation_url.to_string(),
            }
        } else {
            Self {
                server_name: server_name.to_ascii_lowercase(),
                attestation_url: attestation_url.to_ascii_lowercase(),
            }
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn attestation_url(&self) -> &str {
        &self.attestation_url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.server_name, self.attestation_url)
    }
}

/// Cache behaviour
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored
    pub enabled: bool,
    pub case_sensitive_keys: bool,
    /// Established sessions older than this are dropped on access
    pub session_ttl: Option<Duration>,
    /// Deadline for one establishment, shared by its waiters
    pub establish_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            case_sensitive_keys: false,
            session_ttl: None,
            establish_timeout: None,
        }
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit {
        session: Arc<EnclaveSession>,
        counter: u64,
    },
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }

    /// Replay counter; 0 on a miss
    pub fn counter(&self) -> u64 {
        match self {
            Lookup::Hit { counter, .. } => *counter,
            Lookup::Miss => 0,
        }
    }

    pub fn into_parts(self) -> (Option<Arc<EnclaveSession>>, u64) {
        match self {
            Lookup::Hit { session, counter } => (Some(session), counter),
            Lookup::Miss => (None, 0),
        }
    }
}

/// What `invalidate` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Removed,
    /// No established session for the key
    NotCached,
    /// A different (newer) session is cached; left untouched
    SessionMismatch,
}

type Outcome = Option<std::result::Result<Arc<EnclaveSession>, EnclaveError>>;

enum Entry {
    Pending {
        flight: u64,
        outcome: watch::Receiver<Outcome>,
    },
    Established {
        session: Arc<EnclaveSession>,
        counter: u64,
        stored_at: Instant,
    },
}

enum Claim {
    Hit(Arc<EnclaveSession>, u64),
    Wait(watch::Receiver<Outcome>),
    Produce(u64, watch::Sender<Outcome>),
}

/// Concurrent session cache with single-flight establishment
pub struct SessionCache {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    next_flight: AtomicU64,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SessionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build a key honouring the configured case sensitivity
    pub fn key(&self, server_name: &str, attestation_url: &str) -> CacheKey {
        CacheKey::new(server_name, attestation_url, self.config.case_sensitive_keys)
    }

    /// Read an established session and bump its counter in one step.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        if !self.config.enabled {
            return Lookup::Miss;
        }
        let mut entries = self.entries();
        match self.retrieve(&mut entries, key) {
            Some((session, counter)) => Lookup::Hit { session, counter },
            None => Lookup::Miss,
        }
    }

    /// Return the cached session or run `establish` exactly once per key,
    /// sharing its outcome with every caller that arrives while it runs.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: CacheKey,
        establish: F,
    ) -> Result<(Arc<EnclaveSession>, u64)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EnclaveSession>>,
    {
        if !self.config.enabled {
            let session = self.run_establish(&key, establish).await?;
            return Ok((Arc::new(session), 0));
        }

        let claim = {
            let mut entries = self.entries();
            if let Some((session, counter)) = self.retrieve(&mut entries, &key) {
                Claim::Hit(session, counter)
            } else if let Some(Entry::Pending { outcome, .. }) = entries.get(&key) {
                Claim::Wait(outcome.clone())
            } else {
                let flight = self.next_flight.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entries.insert(
                    key.clone(),
                    Entry::Pending {
                        flight,
                        outcome: rx,
                    },
                );
                Claim::Produce(flight, tx)
            }
        };

        match claim {
            Claim::Hit(session, counter) => Ok((session, counter)),
            Claim::Wait(rx) => self.await_flight(&key, rx).await,
            Claim::Produce(flight, tx) => self.produce(&key, flight, tx, establish).await,
        }
    }

    /// Remove `key` only if it still holds `session`.
    pub fn invalidate(&self, key: &CacheKey, session: &EnclaveSession) -> Invalidation {
        let mut entries = self.entries();
        let outcome = match entries.get(key) {
            Some(Entry::Established { session: cached, .. }) => {
                if cached.as_ref() == session {
                    Invalidation::Removed
                } else {
                    Invalidation::SessionMismatch
                }
            }
            _ => Invalidation::NotCached,
        };

        match outcome {
            Invalidation::Removed => {
                entries.remove(key);
                info!(
                    "Invalidated enclave session {:016x} for {}",
                    session.session_id(),
                    key
                );
            }
            Invalidation::SessionMismatch => debug!(
                "Ignoring invalidation of stale session {:016x} for {}",
                session.session_id(),
                key
            ),
            Invalidation::NotCached => {}
        }
        outcome
    }

    /// Number of entries, pending ones included
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every established session. Pending entries stay so callers keep
    /// joining the establishment already in flight.
    pub fn clear(&self) {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| matches!(entry, Entry::Pending { .. }));
        if before > entries.len() {
            info!(
                "Cleared {} enclave sessions from cache",
                before - entries.len()
            );
        }
    }

    // --- Internal helpers ---

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, stored_at: Instant) -> bool {
        self.config
            .session_ttl
            .is_some_and(|ttl| stored_at.elapsed() >= ttl)
    }

    /// Bump the counter of an established entry, evicting it if it expired or
    /// its counter is exhausted.
    fn retrieve(
        &self,
        entries: &mut HashMap<CacheKey, Entry>,
        key: &CacheKey,
    ) -> Option<(Arc<EnclaveSession>, u64)> {
        let evict = match entries.get_mut(key) {
            Some(Entry::Established {
                session,
                counter,
                stored_at,
            }) => {
                if self.is_expired(*stored_at) {
                    debug!("Enclave session for {} expired", key);
                    true
                } else if let Some(next) = counter.checked_add(1) {
                    *counter = next;
                    return Some((Arc::clone(session), next));
                } else {
                    warn!("Replay counter exhausted for {}, forcing re-attestation", key);
                    true
                }
            }
            _ => false,
        };
        if evict {
            entries.remove(key);
        }
        None
    }

    async fn run_establish<F, Fut>(&self, key: &CacheKey, establish: F) -> Result<EnclaveSession>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EnclaveSession>>,
    {
        let started = Instant::now();
        let result = match self.config.establish_timeout {
            Some(limit) => match tokio::time::timeout(limit, establish()).await {
                Ok(result) => result,
                Err(_) => Err(EnclaveError::Timeout(limit)),
            },
            None => establish().await,
        };

        match &result {
            Ok(session) => info!(
                "Enclave session {:016x} established for {} in {:?}",
                session.session_id(),
                key,
                started.elapsed()
            ),
            Err(e) => warn!("Enclave session establishment for {} failed: {}", key, e),
        }
        result
    }

    async fn produce<F, Fut>(
        &self,
        key: &CacheKey,
        flight: u64,
        tx: watch::Sender<Outcome>,
        establish: F,
    ) -> Result<(Arc<EnclaveSession>, u64)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EnclaveSession>>,
    {
        let mut guard = FlightGuard {
            cache: self,
            key,
            flight,
            armed: true,
        };

        let outcome = self.run_establish(key, establish).await.map(Arc::new);

        {
            let mut entries = self.entries();
            if owns_flight(&entries, key, flight) {
                match &outcome {
                    Ok(session) => {
                        entries.insert(
                            key.clone(),
                            Entry::Established {
                                session: Arc::clone(session),
                                counter: FIRST_COUNTER,
                                stored_at: Instant::now(),
                            },
                        );
                    }
                    Err(_) => {
                        entries.remove(key);
                    }
                }
            }
        }
        guard.armed = false;

        tx.send_replace(Some(outcome.clone()));
        outcome.map(|session| (session, FIRST_COUNTER))
    }

    async fn await_flight(
        &self,
        key: &CacheKey,
        mut rx: watch::Receiver<Outcome>,
    ) -> Result<(Arc<EnclaveSession>, u64)> {
        debug!("Joining in-flight establishment for {}", key);
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => return Err(EnclaveError::Cancelled),
        };
        match outcome {
            Some(Ok(session)) => Ok((session, FIRST_COUNTER)),
            Some(Err(e)) => Err(e),
            None => Err(EnclaveError::Cancelled),
        }
    }

    fn abandon_flight(&self, key: &CacheKey, flight: u64) {
        let mut entries = self.entries();
        if owns_flight(&entries, key, flight) {
            entries.remove(key);
            warn!("Enclave session establishment for {} was cancelled", key);
        }
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn owns_flight(entries: &HashMap<CacheKey, Entry>, key: &CacheKey, flight: u64) -> bool {
    matches!(entries.get(key), Some(Entry::Pending { flight: f, .. }) if *f == flight)
}

/// Clears the Pending marker if the producing future is dropped mid-flight.
/// Dropping the watch sender alongside wakes every waiter with `Cancelled`.
struct FlightGuard<'a> {
    cache: &'a SessionCache,
    key: &'a CacheKey,
    flight: u64,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon_flight(self.key, self.flight);
        }
    }
}
