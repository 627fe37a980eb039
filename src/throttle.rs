//! Token bucket that paces texture packets per connection.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Packet budget for texture streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub packets_per_second: u32,
    pub burst: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            packets_per_second: 200,
            burst: 40,
        }
    }
}

impl ThrottleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_packets_per_second(mut self, rate: u32) -> Self {
        self.packets_per_second = rate;
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }
}

pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_rate: u32,
    last_refill: Instant,
    total_granted: u64,
    total_denied: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
            total_granted: 0,
            total_denied: 0,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.burst, config.packets_per_second)
    }

    /// Grants up to `wanted` tokens after refilling for time elapsed by `now`.
    pub fn take_at(&mut self, wanted: usize, now: Instant) -> usize {
        self.refill_at(now);

        let granted = (self.tokens as usize).min(wanted);
        self.tokens -= granted as u32;
        self.total_granted += granted as u64;
        self.total_denied += (wanted - granted) as u64;
        granted
    }

    pub fn take(&mut self, wanted: usize) -> usize {
        self.take_at(wanted, Instant::now())
    }

    /// Returns unspent tokens, never above capacity.
    pub fn give_back(&mut self, unused: usize) {
        let unused = unused.min(self.capacity as usize) as u32;
        self.tokens = (self.tokens + unused).min(self.capacity);
        self.total_granted = self.total_granted.saturating_sub(unused as u64);
    }

    fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u32;

        if tokens_to_add > 0 {
            self.tokens = self.tokens.saturating_add(tokens_to_add).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }

    pub fn available(&self) -> u32 {
        self.tokens
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.total_granted, self.total_denied)
    }
}
