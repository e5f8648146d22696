//! Client-side rate limiting.
//!
//! ServiceNow throttles aggressively and some endpoint families are far
//! more expensive than others, so outbound calls are gated through
//! independent token buckets keyed by [`EndpointClass`]. Attachment and
//! import operations carry larger payloads and heavier server-side cost
//! than plain table reads, hence their tighter default limits.
//!
//! Paths are classified by a precedence-ordered first-match-wins rule
//! list; anything unmatched lands in the default bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SnowError;

/// Coarse endpoint category selecting an independent rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Table API reads and writes (`/api/now/table/...`).
    Table,
    /// Attachment upload/download (`/api/now/attachment...`).
    Attachment,
    /// Import set operations (`/api/now/import/...`).
    Import,
    /// Everything else (aggregate, identity, catalog, ...).
    Default,
}

/// Ordered classification rules; the first matching substring wins.
const CLASSIFY_RULES: &[(&str, EndpointClass)] = &[
    ("/attachment", EndpointClass::Attachment),
    ("/import", EndpointClass::Import),
    ("/table", EndpointClass::Table),
];

/// Maps a request path to its endpoint class.
pub fn classify_path(path: &str) -> EndpointClass {
    for (needle, class) in CLASSIFY_RULES {
        if path.contains(needle) {
            return *class;
        }
    }
    EndpointClass::Default
}

/// Rate and burst for one endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    /// Sustained refill rate in requests per second.
    pub rate: f64,
    /// Maximum permits the bucket can hold.
    pub burst: u32,
}

/// Per-class limits for the whole limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Limit for table operations.
    pub table: ClassLimit,
    /// Limit for attachment operations.
    pub attachment: ClassLimit,
    /// Limit for import set operations.
    pub import: ClassLimit,
    /// Limit for everything else.
    pub default: ClassLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            table: ClassLimit {
                rate: 5.0,
                burst: 10,
            },
            attachment: ClassLimit {
                rate: 2.0,
                burst: 5,
            },
            import: ClassLimit {
                rate: 1.0,
                burst: 2,
            },
            default: ClassLimit {
                rate: 3.0,
                burst: 6,
            },
        }
    }
}

impl RateLimitConfig {
    /// Checks that every class limit can actually pace requests.
    ///
    /// A zero, negative, or non-finite rate would turn the wait-delay
    /// division into infinity or NaN.
    fn validate(&self) -> Result<(), SnowError> {
        let classes = [
            ("table", self.table),
            ("attachment", self.attachment),
            ("import", self.import),
            ("default", self.default),
        ];
        for (name, limit) in classes {
            if !limit.rate.is_finite() || limit.rate <= 0.0 {
                return Err(SnowError::config(format!(
                    "rate for {} endpoints must be positive and finite, got {}",
                    name, limit.rate
                )));
            }
        }
        Ok(())
    }

    fn limit_for(&self, class: EndpointClass) -> ClassLimit {
        match class {
            EndpointClass::Table => self.table,
            EndpointClass::Attachment => self.attachment,
            EndpointClass::Import => self.import,
            EndpointClass::Default => self.default,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket: holds up to `burst` permits, refilling at
/// `rate` permits per second. Starts full.
struct Bucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(limit: ClassLimit) -> Self {
        Self {
            rate: limit.rate,
            burst: f64::from(limit.burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(limit.burst),
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Takes one permit if available, without blocking.
    fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        self.refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks until a permit is available or the caller cancels.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), SnowError> {
        loop {
            let delay = {
                let mut state = self.lock_state();
                self.refill_locked(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SnowError::cancelled("rate limit wait"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pre-commits one permit, possibly driving the balance negative.
    ///
    /// Returns the delay until the reserved slot is usable. Fails only
    /// when the bucket can never hold a whole permit.
    fn reserve(&self) -> (bool, Duration) {
        if self.burst < 1.0 {
            return (false, Duration::ZERO);
        }
        let mut state = self.lock_state();
        self.refill_locked(&mut state);
        state.tokens -= 1.0;
        let delay = if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        };
        (true, delay)
    }

    /// Returns a reserved permit to the bucket.
    fn unreserve(&self) {
        let mut state = self.lock_state();
        state.tokens = (state.tokens + 1.0).min(self.burst);
    }
}

/// A pre-committed future rate-limit permit.
///
/// Inspect [`delay`](Reservation::delay) for how long to hold off before
/// consuming the slot, or [`cancel`](Reservation::cancel) to return it.
pub struct Reservation {
    ok: bool,
    delay: Duration,
    bucket: Option<Arc<Bucket>>,
}

impl Reservation {
    /// Whether the reservation succeeded.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// How long to wait before the reserved slot is usable.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancels the reservation, returning the permit to its bucket.
    pub fn cancel(mut self) {
        if self.ok {
            if let Some(bucket) = self.bucket.take() {
                bucket.unreserve();
            }
        }
    }
}

/// Per-endpoint-class token bucket rate limiter.
///
/// Process-wide state, shared by all callers of one client. Buckets are
/// independent: waiting on the table bucket never blocks attachment
/// traffic.
pub struct RateLimiter {
    buckets: RwLock<HashMap<EndpointClass, Arc<Bucket>>>,
}

const ALL_CLASSES: [EndpointClass; 4] = [
    EndpointClass::Table,
    EndpointClass::Attachment,
    EndpointClass::Import,
    EndpointClass::Default,
];

impl RateLimiter {
    /// Creates a limiter with the given per-class limits.
    ///
    /// # Errors
    ///
    /// Returns `SnowError::Config` if any class has a rate that is zero,
    /// negative, or non-finite.
    pub fn new(config: RateLimitConfig) -> Result<Self, SnowError> {
        config.validate()?;
        Ok(Self {
            buckets: RwLock::new(Self::build_buckets(&config)),
        })
    }

    fn build_buckets(config: &RateLimitConfig) -> HashMap<EndpointClass, Arc<Bucket>> {
        ALL_CLASSES
            .iter()
            .map(|&class| (class, Arc::new(Bucket::new(config.limit_for(class)))))
            .collect()
    }

    fn bucket(&self, class: EndpointClass) -> Arc<Bucket> {
        let buckets = self
            .buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // All four classes are always present
        Arc::clone(&buckets[&class])
    }

    /// Blocks until a permit for the class is available, honoring
    /// cancellation. Must be called exactly once per request attempt,
    /// retries included.
    pub async fn wait(
        &self,
        class: EndpointClass,
        cancel: &CancellationToken,
    ) -> Result<(), SnowError> {
        self.bucket(class).wait(cancel).await
    }

    /// Non-blocking check: takes a permit if one is available right now.
    pub fn allow(&self, class: EndpointClass) -> bool {
        self.bucket(class).try_acquire()
    }

    /// Pre-commits a future permit for the class.
    pub fn reserve(&self, class: EndpointClass) -> Reservation {
        let bucket = self.bucket(class);
        let (ok, delay) = bucket.reserve();
        Reservation {
            ok,
            delay,
            bucket: ok.then_some(bucket),
        }
    }

    /// Replaces all buckets with freshly built ones.
    ///
    /// This is a reset, not an in-place reconfiguration: accumulated
    /// bucket state is discarded, and in-flight waiters finish against
    /// the buckets they started on. An invalid config is rejected and
    /// the current buckets stay in place.
    pub fn update_config(&self, config: RateLimitConfig) -> Result<(), SnowError> {
        config.validate()?;
        let fresh = Self::build_buckets(&config);
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *buckets = fresh;
        debug!("rate limit config replaced");
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        // The built-in limits are statically valid
        Self {
            buckets: RwLock::new(Self::build_buckets(&RateLimitConfig::default())),
        }
    }
}
