//! Token-bucket limiter for warning logs.
//!
//! Malformed input is re-observed every cycle until fixed; the sites
//! that warn about it go through one of these so the log stays readable.

use std::time::Instant;

#[derive(Debug)]
pub struct LogLimiter {
    tokens: f64,
    burst: f64,
    per_sec: f64,
    last: Instant,
}

impl LogLimiter {
    /// Allow `per_sec` messages per second with bursts up to `burst`.
    pub fn new(per_sec: f64, burst: u32) -> Self {
        LogLimiter {
            tokens: burst as f64,
            burst: burst as f64,
            per_sec,
            last: Instant::now(),
        }
    }

    /// Whether a message may be emitted now.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for LogLimiter {
    fn default() -> Self {
        // Matches the historic one-per-second, burst-of-one warn sites.
        Self::new(1.0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_throttle() {
        let mut l = LogLimiter::new(0.0, 2);
        assert!(l.allow());
        assert!(l.allow());
        assert!(!l.allow());
    }
}
