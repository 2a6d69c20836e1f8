//! Per-IP burst protection with a fixed-window counter.
//!
//! Runs before identity resolution and is independent of subscription
//! accounting. Process-local and approximate.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstGuardConfig {
    /// Requests allowed per window. `0` disables the guard.
    pub max_requests: u64,
    pub window: Duration,
    /// Upper bound on the number of addresses tracked at once.
    pub max_tracked: usize,
}

impl Default for BurstGuardConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
            max_tracked: 100_000,
        }
    }
}

struct IpCounter {
    count: u64,
    window_start: Instant,
}

// key: ip-burst-guard -> fixed window per address
#[derive(Clone)]
pub struct BurstGuard {
    inner: Arc<BurstGuardInner>,
}

struct BurstGuardInner {
    config: BurstGuardConfig,
    counters: DashMap<IpAddr, IpCounter>,
}

impl BurstGuard {
    pub fn new(config: BurstGuardConfig) -> Self {
        Self {
            inner: Arc::new(BurstGuardInner {
                config,
                counters: DashMap::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.max_requests > 0
    }

    pub fn window(&self) -> Duration {
        self.inner.config.window
    }

    /// Counts this call and reports whether the address is over its ceiling.
    pub fn is_limited(&self, ip: IpAddr) -> bool {
        self.is_limited_at(ip, Instant::now())
    }

    pub(crate) fn is_limited_at(&self, ip: IpAddr, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let ip = bucket(ip);

        let config = &self.inner.config;
        if !self.inner.counters.contains_key(&ip) && self.inner.counters.len() >= config.max_tracked
        {
            self.evict_expired_at(now);
            if self.inner.counters.len() >= config.max_tracked {
                debug!(%ip, tracked = config.max_tracked, "burst guard table full; address not tracked");
                return false;
            }
        }

        let mut entry = self.inner.counters.entry(ip).or_insert(IpCounter {
            count: 0,
            window_start: now,
        });
        let counter = entry.value_mut();
        if now.saturating_duration_since(counter.window_start) >= config.window {
            counter.count = 1;
            counter.window_start = now;
        } else {
            counter.count += 1;
        }

        counter.count > config.max_requests
    }

    /// Drops entries whose window has elapsed.
    pub fn evict_expired(&self) {
        self.evict_expired_at(Instant::now());
    }

    fn evict_expired_at(&self, now: Instant) {
        let window = self.inner.config.window;
        self.inner
            .counters
            .retain(|_, counter| now.saturating_duration_since(counter.window_start) < window);
    }

    pub fn tracked(&self) -> usize {
        self.inner.counters.len()
    }
}

/// Counting key for an address. IPv6 clients usually own a whole /64, so the
/// prefix is counted rather than each rotated address; IPv4-mapped IPv6 counts
/// as the IPv4 address.
fn bucket(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => {
                let [a, b, c, d, ..] = v6.segments();
                IpAddr::V6(Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0))
            }
        },
    }
}

/// Periodically evicts expired entries so idle addresses do not accumulate.
pub fn spawn_eviction(guard: BurstGuard) -> tokio::task::JoinHandle<()> {
    let period = guard.window().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            guard.evict_expired();
        }
    })
}
