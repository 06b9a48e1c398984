//! Byte budgets backed by `governor` token buckets

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Bytes per second plus the largest amount that may be spent at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub bytes_per_sec: u64,
    pub burst: u64,
}

impl RateConfig {
    /// A burst of `0` defaults to one second worth of traffic
    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        Self {
            bytes_per_sec,
            burst,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Build a fresh budget, `None` when the rate is unlimited
    pub fn budget(&self) -> Option<Budget> {
        Budget::new(*self)
    }
}

/// Shared byte budget
///
/// Clones draw from the same bucket.
#[derive(Clone)]
pub struct Budget {
    limiter: Arc<DefaultDirectRateLimiter>,
    burst: NonZeroU32,
}

impl Budget {
    pub fn new(config: RateConfig) -> Option<Self> {
        let rate = NonZeroU32::new(clamp_u32(config.bytes_per_sec))?;
        let burst = NonZeroU32::new(clamp_u32(config.burst)).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Some(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            burst,
        })
    }

    pub fn burst(&self) -> usize {
        self.burst.get() as usize
    }

    /// Wait until `bytes` may pass, debiting the bucket
    ///
    /// Amounts above the burst are paid in burst-sized instalments.
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.burst());
            if let Some(n) = NonZeroU32::new(chunk as u32) {
                // `chunk` never exceeds the burst, so capacity is always sufficient
                let _ = self.limiter.until_n_ready(n).await;
            }
            remaining -= chunk;
        }
    }
}

impl std::fmt::Debug for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Budget").field("burst", &self.burst).finish()
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
