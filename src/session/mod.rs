//! Session — key agreement, establishment and caching
//!
//! - **Kex**: ephemeral P-256 keys and HKDF session-key derivation
//! - **Establisher**: turns validated evidence into an [`EnclaveSession`]
//! - **Cache**: per-endpoint single-flight store with replay counters

pub mod cache;
pub mod establisher;
pub mod kex;

pub use cache::{CacheConfig, CacheKey, Invalidation, Lookup, SessionCache, FIRST_COUNTER};
pub use establisher::{EnclaveSession, SessionEstablisher};
pub use kex::{EntropySource, LocalKeyPair, OsEntropy};
