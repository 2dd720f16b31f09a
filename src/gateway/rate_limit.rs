//! Shared Rate Limiter
//!
//! One token bucket for the whole process. Every worker holds a clone, so the
//! provider's global request limit is respected no matter how many runs are
//! in flight.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

#[derive(Clone)]
pub struct SharedRateLimiter {
    inner: Arc<DefaultDirectRateLimiter>,
    per_minute: NonZeroU32,
}

impl std::fmt::Debug for SharedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

impl SharedRateLimiter {
    /// `None` for a zero rate.
    pub fn per_minute(requests: u32) -> Option<Self> {
        let per_minute = NonZeroU32::new(requests)?;
        Some(Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            per_minute,
        })
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.per_minute.get()
    }

    /// Waits for a permit.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Takes a permit only if one is available now.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}
