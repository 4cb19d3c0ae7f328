//! Per-source-IP token bucket for handshake messages
//!
//! Each source address gets a bucket allowing a sustained 20 packets per
//! second with a burst of 5. Entries idle for longer than a second are
//! collected by a background task so the table only ever holds actively
//! abusive (or actively handshaking) sources.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

const PACKETS_PER_SECOND: u64 = 20;
const PACKETS_BURSTABLE: u64 = 5;
const PACKET_COST: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = PACKET_COST * PACKETS_BURSTABLE;

/// Entry lifetime since last activity
const GC_AFTER: Duration = Duration::from_secs(1);

struct Bucket {
    last_time: Instant,
    tokens: u64,
}

#[derive(Default)]
pub struct RateLimiter {
    table: RwLock<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handshake message from `ip` may be processed now
    pub fn allow(&self, ip: IpAddr) -> bool {
        let entry = self.table.read().expect("ratelimiter lock").get(&ip).cloned();

        let Some(entry) = entry else {
            // new source: full bucket minus this packet
            let bucket = Bucket {
                last_time: Instant::now(),
                tokens: MAX_TOKENS - PACKET_COST,
            };
            self.table
                .write()
                .expect("ratelimiter lock")
                .insert(ip, Arc::new(Mutex::new(bucket)));
            return true;
        };

        let mut bucket = entry.lock().expect("bucket lock");
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_time).as_nanos() as u64;
        bucket.tokens = bucket.tokens.saturating_add(refill).min(MAX_TOKENS);
        bucket.last_time = now;

        if bucket.tokens > PACKET_COST {
            bucket.tokens -= PACKET_COST;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle past the GC horizon
    pub fn sweep(&self) {
        let now = Instant::now();
        self.table
            .write()
            .expect("ratelimiter lock")
            .retain(|_, entry| {
                let bucket = entry.lock().expect("bucket lock");
                now.duration_since(bucket.last_time) <= GC_AFTER
            });
    }

    /// Background GC loop; exits when the shutdown signal flips
    pub async fn run_gc(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = shutdown.changed() => return,
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_throttle() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        for i in 0..PACKETS_BURSTABLE {
            assert!(limiter.allow(ip), "burst packet {i} should pass");
        }
        assert!(!limiter.allow(ip), "burst exhausted");
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "203.0.113.6".parse().unwrap();

        while limiter.allow(ip) {}
        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.allow(ip), "one packet worth of tokens refilled");
    }

    #[test]
    fn sources_are_independent() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "203.0.113.7".parse().unwrap();
        let b: IpAddr = "203.0.113.8".parse().unwrap();

        while limiter.allow(a) {}
        assert!(limiter.allow(b));
    }

    #[test]
    fn sweep_keeps_active_entries() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        limiter.allow(ip);

        limiter.sweep();
        assert_eq!(limiter.len(), 1, "fresh entry survives");
    }
}
