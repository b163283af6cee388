//! Sliding-window publish rate limiter
//!
//! Cloud brokers ban accounts that publish too aggressively, so every MQTT
//! publish goes through a per-device-identity window of `max_count` sends per
//! `duration`. A rejection is final for that call; the scheduler is expected
//! to use [`RateLimiter::safe_delay`] to space bursts out pre-emptively
//! instead of getting dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use super::TransportError;

pub const WINDOW_DURATION: Duration = Duration::from_secs(60);
pub const WINDOW_MAX_COUNT: usize = 6;

#[derive(Default)]
struct Window {
    stamps: VecDeque<Instant>,
    dropped: u64,
}

impl Window {
    fn evict(&mut self, now: Instant, duration: Duration) {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) >= duration {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One window per device identity. Owned by the MQTT connection and shared by
/// every device session publishing through it, hence the mutex.
pub struct RateLimiter {
    duration: Duration,
    max_count: usize,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(duration: Duration, max_count: usize) -> Self {
        Self {
            duration,
            max_count,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Window>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a publish for `identity`, or rejects it when the window is
    /// saturated.
    pub fn try_acquire(&self, identity: &str) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut windows = self.lock();
        let window = windows.entry(identity.to_owned()).or_default();
        window.evict(now, self.duration);
        if window.stamps.len() >= self.max_count {
            window.dropped += 1;
            warn!(
                identity,
                dropped = window.dropped,
                "publish dropped by rate limiter"
            );
            return Err(TransportError::RateLimited);
        }
        window.stamps.push_back(now);
        Ok(())
    }

    /// Non-mutating estimate of how long to wait before a publish is
    /// guaranteed to pass: zero on an empty window, a pro-rata spacing while
    /// the window fills, the time until the oldest stamp expires when full.
    pub fn safe_delay(&self, identity: &str) -> Duration {
        let now = Instant::now();
        let mut windows = self.lock();
        let window = windows.entry(identity.to_owned()).or_default();
        window.evict(now, self.duration);
        let used = window.stamps.len();
        if used == 0 {
            Duration::ZERO
        } else if used < self.max_count {
            self.duration / (self.max_count - used) as u32
        } else {
            // full: wait for the oldest stamp to leave the window
            match window.stamps.front() {
                Some(oldest) => (*oldest + self.duration).saturating_duration_since(now),
                None => Duration::ZERO,
            }
        }
    }

    /// Publishes dropped so far for `identity`.
    pub fn dropped(&self, identity: &str) -> u64 {
        self.lock()
            .get(identity)
            .map(|w| w.dropped)
            .unwrap_or_default()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(WINDOW_DURATION, WINDOW_MAX_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seventh_call_in_window_is_rejected() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 6);
        for _ in 0..6 {
            limiter.try_acquire("dev").unwrap();
        }
        assert!(matches!(
            limiter.try_acquire("dev"),
            Err(TransportError::RateLimited)
        ));
        assert_eq!(limiter.dropped("dev"), 1);
    }

    #[test]
    fn window_elapse_admits_again() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 2);
        limiter.try_acquire("dev").unwrap();
        limiter.try_acquire("dev").unwrap();
        assert!(limiter.try_acquire("dev").is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_acquire("dev").is_ok());
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("a").is_err());
        assert!(limiter.try_acquire("b").is_ok());
        assert_eq!(limiter.dropped("b"), 0);
    }

    #[test]
    fn safe_delay_branches() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 6);
        assert_eq!(limiter.safe_delay("dev"), Duration::ZERO);
        limiter.try_acquire("dev").unwrap();
        // filling: duration spread over the remaining slots
        assert_eq!(limiter.safe_delay("dev"), Duration::from_secs(12));
        for _ in 0..5 {
            limiter.try_acquire("dev").unwrap();
        }
        // saturated: bounded by the time the oldest stamp leaves the window
        let delay = limiter.safe_delay("dev");
        assert!(delay > Duration::from_secs(59));
        assert!(delay <= Duration::from_secs(60));
    }
}
