//! Inter-request rate limiter shared by every driver talking to a gateway
//!
//! In [`LockScope::Global`] mode a single lock is held for the whole exchange,
//! so no two exchanges are ever in flight at once, and consecutive exchanges
//! to the same endpoint are spaced by at least `min_gap`.
//!
//! [`LockScope::PerEndpoint`] keeps the spacing but only serializes exchanges
//! that share an endpoint.

use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Default spacing between exchanges on one endpoint
pub const DEFAULT_MIN_GAP: Duration = Duration::from_millis(120);

/// Ordering domain of the limiter lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    #[default]
    Global,
    PerEndpoint,
}

type Slot = Arc<Mutex<Option<Instant>>>;

/// Serializes protocol exchanges and enforces a minimum gap per endpoint
pub struct RateLimiter {
    min_gap: Duration,
    scope: LockScope,
    /// Global mode: the lock itself plus last-release times
    last_release: Mutex<HashMap<String, Instant>>,
    /// Per-endpoint mode: one slot per endpoint key
    slots: Mutex<HashMap<String, Slot>>,
}

/// Held for the duration of one exchange; records the release time on drop
pub struct RateGuard<'a> {
    key: String,
    held: Held<'a>,
}

enum Held<'a> {
    Global(MutexGuard<'a, HashMap<String, Instant>>),
    Endpoint(ArcMutexGuard<RawMutex, Option<Instant>>),
}

impl RateLimiter {
    pub fn new(min_gap: Duration, scope: LockScope) -> Self {
        Self {
            min_gap,
            scope,
            last_release: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide limiter with the default gap and global scope
    pub fn global() -> Arc<RateLimiter> {
        static GLOBAL: OnceLock<Arc<RateLimiter>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(RateLimiter::new(DEFAULT_MIN_GAP, LockScope::Global))
        }))
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Block until an exchange on `key` may start
    pub fn acquire(&self, key: &str) -> RateGuard<'_> {
        let held = match self.scope {
            LockScope::Global => {
                let map = self.last_release.lock();
                if let Some(&last) = map.get(key) {
                    self.wait_gap(key, last);
                }
                Held::Global(map)
            }
            LockScope::PerEndpoint => {
                let slot = {
                    let mut slots = self.slots.lock();
                    Arc::clone(slots.entry(key.to_string()).or_default())
                };
                let guard = slot.lock_arc();
                if let Some(last) = *guard {
                    self.wait_gap(key, last);
                }
                Held::Endpoint(guard)
            }
        };

        RateGuard {
            key: key.to_string(),
            held,
        }
    }

    fn wait_gap(&self, key: &str, last: Instant) {
        let ready_at = last + self.min_gap;
        let now = Instant::now();
        if ready_at > now {
            let wait = ready_at - now;
            log::trace!("Rate limit {}: waiting {:?}", key, wait);
            thread::sleep(wait);
        }
    }
}

impl RateGuard<'_> {
    /// Endpoint key this guard was acquired for
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly (same as dropping)
    pub fn release(self) {}
}

impl Drop for RateGuard<'_> {
    fn drop(&mut self) {
        let now = Instant::now();
        match &mut self.held {
            Held::Global(map) => {
                map.insert(self.key.clone(), now);
            }
            Held::Endpoint(slot) => {
                **slot = Some(now);
            }
        }
    }
}
