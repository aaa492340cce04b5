//! Exponential backoff with a ceiling and jitter, shared by the transport,
//! the watchers and the scheduler.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_ms: 1_000, multiplier: 2.0, cap_ms: 30_000, jitter: 0.2 }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_ms == 0 { return Err("base_ms must be > 0".into()); }
        if self.cap_ms < self.base_ms { return Err("cap_ms must be >= base_ms".into()); }
        if !(self.multiplier >= 1.0) { return Err("multiplier must be >= 1".into()); }
        if !(0.0..=1.0).contains(&self.jitter) { return Err("jitter must be within [0, 1]".into()); }
        Ok(())
    }

    /// Un-jittered delay for a zero-based attempt number.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = self.base_ms as f64 * self.multiplier.powi(attempt.min(64) as i32);
        let ms = if exp.is_finite() { exp.min(self.cap_ms as f64) } else { self.cap_ms as f64 };
        Duration::from_millis(ms as u64)
    }

    /// Jittered delay: the top `jitter` share of the ceiling is randomized, never exceeding the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceil = self.ceiling(attempt).as_millis() as u64;
        let spread = (ceil as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread == 0 { return Duration::from_millis(ceil); }
        let fixed = ceil - spread;
        Duration::from_millis(fixed + rand::thread_rng().gen_range(0..=spread))
    }
}

/// Stateful attempt counter over a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self { Self { cfg, attempt: 0 } }
    pub fn attempt(&self) -> u32 { self.attempt }
    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.cfg.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }
}
