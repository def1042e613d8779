//! Sliding-window admission control for outbound HTTP requests.
//!
//! Every registrable domain gets its own [`RateLimit`], created on first use
//! from a [`RateLimitPolicy`] and kept for the life of the process. A limit is
//! a set of `(window, count)` pairs; a request is admitted only if no window
//! already holds `count` requests. Exceeding a window, or an explicit
//! [`RateLimit::block_until`] (as done on `429 Too Many Requests`), puts the
//! domain in a cooldown during which every request is refused.
//!
//! Locking is two-level: the registry map has one mutex for
//! insert-if-absent, and each limiter guards its own window state.

use crate::clock::Clock;
use crate::consts::DEFAULT_API_DOMAIN;
use core::fmt;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One admission window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Limit {
    /// Window length in milliseconds.
    pub duration_ms: i64,
    /// Requests allowed inside one window.
    pub count: u16,
}

impl Limit {
    /// Builds a window of `count` requests per `duration_ms`.
    pub const fn new(duration_ms: i64, count: u16) -> Self {
        Self { duration_ms, count }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    block_until_ms: i64,
    /// Sorted by window length.
    limits: Vec<Limit>,
    /// Admission times, oldest first.
    requests: Vec<i64>,
}

impl WindowState {
    fn prune(&mut self, now_ms: i64) {
        let Some(longest) = self.limits.last() else {
            self.requests.clear();
            return;
        };
        let horizon = now_ms - longest.duration_ms;
        let stale = self.requests.partition_point(|&t| t < horizon);
        let _ = self.requests.drain(..stale);
    }

    fn in_window(&self, now_ms: i64, limit: &Limit) -> usize {
        let start = now_ms - limit.duration_ms;
        self.requests.len() - self.requests.partition_point(|&t| t < start)
    }
}

/// Window state for one domain.
#[derive(Debug, Default)]
pub struct RateLimit {
    state: Mutex<WindowState>,
}

impl RateLimit {
    /// A limiter with no windows; it admits everything until limits are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// A limiter with the given windows.
    pub fn with_limits(limits: &[Limit]) -> Self {
        let limiter = Self::new();
        for limit in limits {
            limiter.add_limit(limit.duration_ms, limit.count);
        }
        limiter
    }

    /// Adds a window, keeping windows ordered by length.
    pub fn add_limit(&self, duration_ms: i64, count: u16) {
        let mut state = self.state.lock();
        let at = state.limits.partition_point(|l| l.duration_ms <= duration_ms);
        state.limits.insert(at, Limit::new(duration_ms, count));
    }

    /// Removes every window.
    pub fn clear_limits(&self) {
        self.state.lock().limits.clear();
    }

    /// Tries to admit one request at `now_ms`.
    ///
    /// # Returns
    /// - `true`: the request is admitted and recorded
    /// - `false`: the domain is cooling down or a window is full; a full
    ///   window starts a cooldown of that window's length
    pub fn try_request(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock();

        if state.block_until_ms > now_ms {
            return false;
        }

        state.prune(now_ms);

        let full = state
            .limits
            .iter()
            .find(|l| state.in_window(now_ms, l) >= usize::from(l.count))
            .copied();
        if let Some(limit) = full {
            debug!(
                "Rate limit of {} per {} ms reached, blocking",
                limit.count, limit.duration_ms
            );
            state.block_until_ms = now_ms + limit.duration_ms;
            return false;
        }

        state.requests.push(now_ms);
        true
    }

    /// Refuses every request until `block_until_ms`.
    pub fn block_until(&self, block_until_ms: i64) {
        self.state.lock().block_until_ms = block_until_ms;
    }

    /// End of the current cooldown; in the past when there is none.
    pub fn blocked_until(&self) -> i64 {
        self.state.lock().block_until_ms
    }

    /// Number of recorded requests at or after `since_ms`.
    pub fn requests_since(&self, since_ms: i64) -> usize {
        self.state.lock().requests.iter().filter(|&&t| t >= since_ms).count()
    }

    /// Forgets every recorded request.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }
}

/// Windows applied to newly seen domains.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitPolicy {
    /// Windows every domain gets.
    pub default_limits: Vec<Limit>,
    /// Registrable domain of the primary backend.
    pub api_domain: String,
    /// Extra windows for [`RateLimitPolicy::api_domain`].
    pub api_limits: Vec<Limit>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            default_limits: vec![Limit::new(1_000, 5), Limit::new(10_000, 10)],
            api_domain: DEFAULT_API_DOMAIN.into(),
            api_limits: vec![Limit::new(60_000, 12), Limit::new(3_600_000, 120)],
        }
    }
}

impl RateLimitPolicy {
    fn build(&self, domain: &str) -> RateLimit {
        let limiter = RateLimit::with_limits(&self.default_limits);
        if domain == self.api_domain {
            for limit in &self.api_limits {
                limiter.add_limit(limit.duration_ms, limit.count);
            }
        }
        limiter
    }
}

/// Reduces a URL to its registrable domain.
///
/// Scheme, credentials, path, query and port are dropped, and only the last
/// two labels of the host are kept: `"https://api.example.com:443/x"` becomes
/// `"example.com"`. Single-label hosts such as `localhost` are returned as is.
///
/// # Returns
/// `None` when no host is left.
pub fn registrable_domain(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = host_port.rsplit_once(':').map_or(host_port, |(host, _)| host);

    if host.is_empty() {
        return None;
    }

    let Some(last_dot) = host.rfind('.') else {
        return Some(host);
    };
    match host[..last_dot].rfind('.') {
        Some(dot) => Some(&host[dot + 1..]),
        None => Some(host),
    }
}

/// Per-domain limiters, created lazily and never evicted.
pub struct RateLimiterRegistry {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    limiters: Mutex<HashMap<String, Arc<RateLimit>>>,
}

impl fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("policy", &self.policy)
            .field("domains", &self.limiters.lock().len())
            .finish()
    }
}

impl RateLimiterRegistry {
    /// An empty registry.
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// The limiter for the domain of `url`, created on first sight.
    ///
    /// # Returns
    /// `None` when `url` has no host.
    pub fn limiter_for(&self, url: &str) -> Option<Arc<RateLimit>> {
        let domain = registrable_domain(url)?;
        let mut limiters = self.limiters.lock();
        let limiter = limiters.entry(domain.to_owned()).or_insert_with(|| {
            trace!("Creating rate limiter for {domain}");
            Arc::new(self.policy.build(domain))
        });
        Some(Arc::clone(limiter))
    }

    /// Admission check for a request to `url` at the current time.
    ///
    /// # Returns
    /// `false` when the domain is throttled or `url` has no host.
    pub fn try_admit(&self, url: &str) -> bool {
        self.limiter_for(url)
            .is_some_and(|limiter| limiter.try_request(self.clock.now_ms()))
    }

    /// Time source shared by every limiter of the registry.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
