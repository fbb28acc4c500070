use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by `app_id:service_id`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Windows>>,
    window: Duration,
    max_keys: usize,
}

struct Windows {
    events: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl Windows {
    /// Drops keys with no events left in the window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.events.retain(|_, events| {
            prune_queue(events, now, window);
            !events.is_empty()
        });
        self.last_sweep = now;
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Windows {
                events: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            window,
            max_keys,
        }
    }

    /// One-second window, as service limits are expressed per second.
    pub fn per_second(max_keys: usize) -> Self {
        Self::new(Duration::from_secs(1), max_keys)
    }

    pub fn allow_call(&self, app_id: &str, service_id: &str, limit_per_second: u32) -> bool {
        self.allow(&format!("{}:{}", app_id, service_id), limit_per_second)
    }

    /// Only the caller's own key is pruned per call. Idle keys are swept once
    /// per window, or early when the key count passes `max_keys`.
    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.events.entry(key.to_string()).or_default();
        prune_queue(queue, now, self.window);
        if queue.len() >= limit as usize {
            return false;
        }
        queue.push_back(now);

        if inner.events.len() > self.max_keys
            || now.duration_since(inner.last_sweep) >= self.window
        {
            inner.sweep(now, self.window);
        }

        if inner.events.len() > self.max_keys {
            let overflow = inner.events.len() - self.max_keys;
            let evicted = inner
                .events
                .keys()
                .filter(|k| k.as_str() != key)
                .take(overflow)
                .cloned()
                .collect::<Vec<_>>();
            for k in evicted {
                inner.events.remove(&k);
            }
        }

        true
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.events.len(),
            Err(poisoned) => poisoned.into_inner().events.len(),
        }
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

/// Remembers signature nonces for `ttl` so a signed request cannot be
/// replayed. `claim` is set-if-absent.
#[derive(Clone)]
pub struct NonceGuard {
    seen: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
    max_entries: usize,
}

pub const NONCE_TTL: Duration = Duration::from_secs(300);

impl NonceGuard {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            max_entries,
        }
    }

    /// True when `nonce` was not seen within the TTL; it is now recorded.
    pub fn claim(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let key = format!("nonce:{}", nonce);
        if seen.get(&key).is_some_and(|expires_at| *expires_at > now) {
            return false;
        }

        if seen.len() >= self.max_entries {
            seen.retain(|_, expires_at| *expires_at > now);
        }
        seen.insert(key, now + self.ttl);
        true
    }
}
