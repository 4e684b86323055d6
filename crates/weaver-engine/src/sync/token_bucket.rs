//! Token bucket rate limiter.
//!
//! Lock-free and independent of the scheduler: it can be used from tasks and
//! plain threads alike. Tokens are added in whole refill steps measured on
//! the steady clock relative to the bucket's creation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How tokens are added back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillPolicy {
    /// Tokens added per step
    pub amount: u64,
    /// Step length; zero refills instantly and makes the bucket unbounded
    pub interval: Duration,
}

impl RefillPolicy {
    /// `amount` tokens every `interval`
    pub fn new(amount: u64, interval: Duration) -> Self {
        Self { amount, interval }
    }

    /// Policy that makes every obtain succeed
    pub fn instant() -> Self {
        Self {
            amount: 1,
            interval: Duration::ZERO,
        }
    }
}

/// Rate limiter with a bounded number of tokens
pub struct TokenBucket {
    origin: Instant,
    max_size: AtomicU64,
    tokens: AtomicU64,
    refill_amount: AtomicU64,
    refill_interval_ns: AtomicU64,
    /// Start of the current refill step, nanoseconds since `origin`
    last_refill_ns: AtomicU64,
}

impl TokenBucket {
    /// Full bucket with `max_size` tokens
    pub fn new(max_size: u64, policy: RefillPolicy) -> Self {
        let bucket = Self {
            origin: Instant::now(),
            max_size: AtomicU64::new(max_size),
            tokens: AtomicU64::new(max_size),
            refill_amount: AtomicU64::new(0),
            refill_interval_ns: AtomicU64::new(0),
            last_refill_ns: AtomicU64::new(0),
        };
        bucket.set_refill_policy(policy);
        bucket
    }

    /// Bucket that never runs out
    pub fn unbounded() -> Self {
        Self::new(u64::MAX, RefillPolicy::instant())
    }

    /// Whether every obtain succeeds
    pub fn is_unbounded(&self) -> bool {
        self.refill_interval_ns.load(Ordering::Acquire) == 0
            && self.refill_amount.load(Ordering::Acquire) > 0
    }

    /// Take one token if available
    pub fn obtain(&self) -> bool {
        self.obtain_all(1)
    }

    /// Take `count` tokens at once, or none
    pub fn obtain_all(&self, count: u64) -> bool {
        if self.is_unbounded() {
            return true;
        }
        self.refill(self.now_ns());
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(count)
            })
            .is_ok()
    }

    /// Tokens available right now
    pub fn tokens_approx(&self) -> u64 {
        if self.is_unbounded() {
            return self.max_size.load(Ordering::Acquire);
        }
        self.refill(self.now_ns());
        self.tokens.load(Ordering::Acquire)
    }

    /// Time until the next refill step adds tokens; zero if it already is due
    pub fn time_to_next_refill(&self) -> Duration {
        let interval = self.refill_interval_ns.load(Ordering::Acquire);
        if interval == 0 {
            return Duration::ZERO;
        }
        let next = self
            .last_refill_ns
            .load(Ordering::Acquire)
            .saturating_add(interval);
        Duration::from_nanos(next.saturating_sub(self.now_ns()))
    }

    /// Change the capacity; surplus tokens are dropped
    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::Release);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                (tokens > max_size).then_some(max_size)
            });
    }

    /// Change how tokens are added back; the current step restarts now
    pub fn set_refill_policy(&self, policy: RefillPolicy) {
        let interval_ns = u64::try_from(policy.interval.as_nanos()).unwrap_or(u64::MAX);
        self.refill_amount.store(policy.amount, Ordering::Release);
        self.refill_interval_ns.store(interval_ns, Ordering::Release);
        self.last_refill_ns.store(self.now_ns(), Ordering::Release);
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn refill(&self, now_ns: u64) {
        let interval = self.refill_interval_ns.load(Ordering::Acquire);
        let amount = self.refill_amount.load(Ordering::Acquire);
        if interval == 0 || amount == 0 {
            return;
        }
        let last = self.last_refill_ns.load(Ordering::Acquire);
        if now_ns < last.saturating_add(interval) {
            return;
        }
        let steps = (now_ns - last) / interval;
        let step_start = last + steps * interval;
        // the thread that moves the step forward adds the tokens for it
        if self
            .last_refill_ns
            .compare_exchange(last, step_start, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let added = steps.saturating_mul(amount);
        let max_size = self.max_size.load(Ordering::Acquire);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(added).min(max_size))
            });
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_size", &self.max_size.load(Ordering::Relaxed))
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .field("refill_amount", &self.refill_amount.load(Ordering::Relaxed))
            .field(
                "refill_interval",
                &Duration::from_nanos(self.refill_interval_ns.load(Ordering::Relaxed)),
            )
            .finish()
    }
}
