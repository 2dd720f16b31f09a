//! Generation Gateway
//!
//! The only path from a run to the external text-generation service:
//! fingerprinting, the two-tier response cache, retry with backoff, model
//! fallback, the process-wide rate limiter and budget reservations.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod durable;
pub mod fingerprint;
pub mod generation;
pub mod rate_limit;
pub mod request;

pub use backoff::BackoffPolicy;
pub use cache::{CacheEntry, CacheStats, CachedResponse, ResponseCache};
pub use client::{GenerationClient, OfflineClient};
pub use durable::{DurableCache, SqliteCacheStore};
pub use fingerprint::Fingerprint;
pub use generation::GenerationGateway;
pub use rate_limit::SharedRateLimiter;
pub use request::{GatewayResponse, Generation, GenerationRequest, Message, Role, SamplingParams};
