//! Token-bucket gate on source reads.
//!
//! Every range-reader open goes through [OpenGate::acquire]. The bucket
//! refills at the configured request rate with a burst of one token per
//! worker, so a freshly opened handle can start all its workers at once
//! without immediately tripping the limit.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::FsError;

/// Default cap on how long an open may wait for a token.
pub const DEFAULT_OPEN_WAIT: Duration = Duration::from_secs(10);

pub struct OpenGate {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OpenGate {
    /// `rps == 0` disables limiting entirely.
    pub fn new(rps: u32, burst: usize) -> Self {
        let limiter = NonZeroU32::new(rps).map(|rate| {
            let burst = NonZeroU32::new(burst.max(1) as u32).unwrap_or(NonZeroU32::MIN);
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });
        Self { limiter }
    }

    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    /// Wait for a token, up to `max_wait`. [FsError::Canceled] when the
    /// deadline elapses first.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), FsError> {
        let limiter = match &self.limiter {
            Some(limiter) => limiter,
            None => return Ok(()),
        };
        match tokio::time::timeout(max_wait, limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(FsError::Canceled),
        }
    }
}
