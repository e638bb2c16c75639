use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fixed-window request counter keyed by caller. A limit of zero disables
/// the limiter. Stale windows are pruned opportunistically so the map stays
/// bounded by `max_keys` live callers.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Window>>>,
    window: Duration,
    max_keys: usize,
}

struct Window {
    started_at: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = inner.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.duration_since(entry.started_at) > self.window {
            entry.started_at = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            return false;
        }
        entry.count += 1;

        inner.retain(|_, w| now.duration_since(w.started_at) <= self.window);

        if inner.len() > self.max_keys {
            let mut overflow = inner.len() - self.max_keys;
            let keys = inner.keys().cloned().collect::<Vec<_>>();
            for key in keys {
                if overflow == 0 {
                    break;
                }
                if inner.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn limiter_rejects_when_window_is_full() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        assert!(limiter.allow("k", 2));
        assert!(limiter.allow("k", 2));
        assert!(!limiter.allow("k", 2));
    }

    #[test]
    fn limiter_resets_after_window_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(5), 16);
        assert!(limiter.allow("k", 1));
        assert!(!limiter.allow("k", 1));
        thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("k", 1));
    }

    #[test]
    fn zero_limit_disables_the_limiter() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        for _ in 0..100 {
            assert!(limiter.allow("k", 0));
        }
    }

    #[test]
    fn keys_are_counted_independently() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        assert!(limiter.allow("a", 1));
        assert!(limiter.allow("b", 1));
        assert!(!limiter.allow("a", 1));
    }
}
