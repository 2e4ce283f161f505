use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RateLimitError};

/// Upper bound on the ledger slots reserved up front; larger limits grow on demand.
const INITIAL_LEDGER_CAPACITY: u32 = 1024;

/// Sliding-window rate limiter shared by concurrent workers.
///
/// The limiter keeps the timestamp of every permit granted within the trailing
/// window. A new permit is granted only while fewer than `max_requests` of
/// those timestamps are younger than `window`; otherwise the caller blocks
/// until the oldest one ages out.
///
/// # Algorithm Behavior
///
/// - A grant recorded at `t` counts against every window covering `t`
/// - A grant expires once `now - t >= window`
/// - Blocking callers sleep without holding the internal lock, then retry
/// - Releasing a permit does not return capacity; capacity returns with time
///
/// # Example
///
/// ```rust
/// use rate_guard_runner::RateLimiter;
///
/// // At most 2 permits in any trailing 1 second
/// let limiter = RateLimiter::new(2, 1.0).unwrap();
///
/// {
///     let _permit = limiter.acquire();
///     // gated work
/// }
///
/// assert_eq!(limiter.capacity_remaining(), 1);
/// assert_eq!(limiter.total_granted(), 1);
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum number of permits granted within any trailing window
    max_requests: u32,
    /// Length of the trailing window
    window: Duration,
    /// Grant ledger protected by mutex for thread safety
    state: Mutex<RateLimiterState>,
}

/// Internal state of the rate limiter
#[derive(Debug, Default)]
struct RateLimiterState {
    /// Grant timestamps inside the window, oldest first
    grants: VecDeque<Instant>,
    /// Permits granted over the limiter's lifetime
    total_granted: u64,
}

impl RateLimiterState {
    /// Drops grants that have left the window ending at `now`.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.grants.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` permits per `per_seconds`.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::InvalidMaxRequests`] if `max_requests` is zero
    /// * [`ConfigError::InvalidWindow`] if `per_seconds` is not a finite,
    ///   positive number of seconds
    ///
    /// # Example
    ///
    /// ```rust
    /// use rate_guard_runner::RateLimiter;
    ///
    /// assert!(RateLimiter::new(10, 0.5).is_ok());
    /// assert!(RateLimiter::new(0, 1.0).is_err());
    /// assert!(RateLimiter::new(10, 0.0).is_err());
    /// ```
    pub fn new(max_requests: u32, per_seconds: f64) -> Result<Self, ConfigError> {
        if !per_seconds.is_finite() || per_seconds <= 0.0 {
            return Err(ConfigError::InvalidWindow(per_seconds));
        }
        let window = Duration::try_from_secs_f64(per_seconds)
            .map_err(|_| ConfigError::InvalidWindow(per_seconds))?;
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow(per_seconds));
        }
        Self::with_window(max_requests, window)
    }

    /// Creates a limiter from a [`Duration`] window.
    ///
    /// # Errors
    ///
    /// Fails like [`RateLimiter::new`] for a zero `max_requests` or a zero window.
    pub fn with_window(max_requests: u32, window: Duration) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests(max_requests));
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow(0.0));
        }

        Ok(RateLimiter {
            max_requests,
            window,
            state: Mutex::new(RateLimiterState {
                grants: VecDeque::with_capacity(max_requests.min(INITIAL_LEDGER_CAPACITY) as usize),
                total_granted: 0,
            }),
        })
    }

    /// Maximum number of permits per window.
    #[inline]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Length of the sliding window.
    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The ledger is consistent after any partial update, so a poisoned lock
    /// is still usable.
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, RateLimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a grant at `now` if the window has room, otherwise returns the
    /// time until the oldest grant expires.
    fn grant_locked(&self, state: &mut RateLimiterState, now: Instant) -> Result<Instant, Duration> {
        // Keep the ledger ordered even if the caller's clock lags the newest grant
        let now = match state.grants.back() {
            Some(&newest) if newest > now => newest,
            _ => now,
        };

        state.prune(now, self.window);

        if state.grants.len() < self.max_requests as usize {
            state.grants.push_back(now);
            state.total_granted += 1;
            return Ok(now);
        }

        // Non-empty here since max_requests >= 1. A window too long for the
        // clock to represent never expires.
        let retry_after = state
            .grants
            .front()
            .map(|&oldest| {
                oldest
                    .checked_add(self.window)
                    .map_or(Duration::MAX, |expiry| expiry.saturating_duration_since(now))
            })
            .unwrap_or_default();
        Err(retry_after)
    }

    /// One locked attempt at the current instant.
    fn poll(&self) -> Result<RateLimitPermit<'_>, Duration> {
        let mut state = self.lock_state();
        let granted_at = self.grant_locked(&mut state, Instant::now())?;
        tracing::trace!(
            max_requests = self.max_requests,
            in_window = state.grants.len(),
            "rate limit permit granted"
        );
        Ok(RateLimitPermit {
            limiter: self,
            granted_at,
        })
    }

    fn log_wait(&self, wait: Duration) {
        tracing::debug!(
            wait_ms = wait.as_millis() as u64,
            max_requests = self.max_requests,
            window_ms = self.window.as_millis() as u64,
            "rate limit reached, waiting for a permit"
        );
    }

    /// Blocks until a permit is available and returns it.
    ///
    /// The permit is released when the returned guard is dropped. Releasing
    /// has no effect on the window: the grant keeps counting until it is
    /// `window` old.
    pub fn acquire(&self) -> RateLimitPermit<'_> {
        loop {
            match self.poll() {
                Ok(permit) => return permit,
                Err(retry_after) => {
                    self.log_wait(retry_after);
                    thread::sleep(retry_after);
                }
            }
        }
    }

    /// Blocks for at most `timeout` waiting for a permit.
    ///
    /// # Errors
    ///
    /// [`RateLimitError::Timeout`] if no permit became available in time.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<RateLimitPermit<'_>, RateLimitError> {
        let started = Instant::now();
        let Some(deadline) = started.checked_add(timeout) else {
            return Ok(self.acquire());
        };

        loop {
            let retry_after = match self.poll() {
                Ok(permit) => return Ok(permit),
                Err(retry_after) => retry_after,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimitError::Timeout {
                    waited: now.saturating_duration_since(started),
                });
            }
            let sleep_for = retry_after.min(deadline - now);
            self.log_wait(sleep_for);
            thread::sleep(sleep_for);
        }
    }

    /// Takes a permit only if one is available right now.
    ///
    /// # Errors
    ///
    /// [`RateLimitError::Exhausted`] with the time until the next permit frees up.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rate_guard_runner::{RateLimiter, RateLimitError};
    ///
    /// let limiter = RateLimiter::new(1, 60.0).unwrap();
    /// let _first = limiter.try_acquire().unwrap();
    ///
    /// match limiter.try_acquire() {
    ///     Err(RateLimitError::Exhausted { retry_after }) => assert!(retry_after.as_secs() <= 60),
    ///     _ => panic!("window should be full"),
    /// };
    /// ```
    pub fn try_acquire(&self) -> Result<RateLimitPermit<'_>, RateLimitError> {
        self.poll()
            .map_err(|retry_after| RateLimitError::Exhausted { retry_after })
    }

    /// Attempts to record a grant at the given instant.
    ///
    /// This is the clock-free form of [`try_acquire`](Self::try_acquire) for
    /// callers that drive time themselves. An instant older than the newest
    /// recorded grant is treated as that grant's instant.
    ///
    /// # Returns
    /// * `Ok(())` if the grant was recorded
    /// * `Err(RateLimitError::Exhausted)` if the window ending at `now` is full
    ///
    /// # Example
    ///
    /// ```rust
    /// use rate_guard_runner::RateLimiter;
    /// use std::time::{Duration, Instant};
    ///
    /// let limiter = RateLimiter::new(2, 1.0).unwrap();
    /// let t0 = Instant::now();
    ///
    /// assert!(limiter.try_acquire_at(t0).is_ok());
    /// assert!(limiter.try_acquire_at(t0).is_ok());
    /// assert!(limiter.try_acquire_at(t0 + Duration::from_millis(500)).is_err());
    ///
    /// // The first grant leaves the window exactly one second later
    /// assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)).is_ok());
    /// ```
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), RateLimitError> {
        let mut state = self.lock_state();
        self.grant_locked(&mut state, now)
            .map(|_| ())
            .map_err(|retry_after| RateLimitError::Exhausted { retry_after })
    }

    /// Runs `f` while holding a permit.
    ///
    /// The permit is released on every exit path of `f`, including unwinding.
    pub fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _permit = self.acquire();
        f()
    }

    /// Number of permits that could be granted right now without waiting.
    pub fn capacity_remaining(&self) -> u32 {
        self.capacity_remaining_at(Instant::now())
    }

    /// Number of permits that could be granted at `now` without waiting.
    pub fn capacity_remaining_at(&self, now: Instant) -> u32 {
        let mut state = self.lock_state();
        state.prune(now, self.window);
        self.max_requests
            .saturating_sub(u32::try_from(state.grants.len()).unwrap_or(u32::MAX))
    }

    /// Number of permits granted since the limiter was created.
    pub fn total_granted(&self) -> u64 {
        self.lock_state().total_granted
    }
}

/// A granted permit. Dropping it ends the gated scope.
#[must_use = "the gated scope ends as soon as the permit is dropped"]
#[derive(Debug)]
pub struct RateLimitPermit<'a> {
    limiter: &'a RateLimiter,
    granted_at: Instant,
}

impl RateLimitPermit<'_> {
    /// Instant at which this permit was recorded in the window.
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    /// The limiter that issued this permit.
    pub fn limiter(&self) -> &RateLimiter {
        self.limiter
    }
}

impl Drop for RateLimitPermit<'_> {
    fn drop(&mut self) {
        // Nothing to return: the grant expires with the window.
        tracing::trace!(
            held_us = self.granted_at.elapsed().as_micros() as u64,
            "rate limit permit released"
        );
    }
}

/// Configuration structure for creating a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum number of permits per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub per_seconds: f64,
}

impl RateLimiterConfig {
    /// Creates a new configuration instance.
    pub fn new(max_requests: u32, per_seconds: f64) -> Self {
        Self {
            max_requests,
            per_seconds,
        }
    }
}

impl TryFrom<RateLimiterConfig> for RateLimiter {
    type Error = ConfigError;

    /// Converts a [`RateLimiterConfig`] into a [`RateLimiter`], validating it.
    ///
    /// ```
    /// use rate_guard_runner::{RateLimiter, RateLimiterConfig};
    ///
    /// let limiter = RateLimiter::try_from(RateLimiterConfig::new(5, 1.0)).unwrap();
    /// assert_eq!(limiter.max_requests(), 5);
    /// ```
    fn try_from(config: RateLimiterConfig) -> Result<Self, Self::Error> {
        RateLimiter::new(config.max_requests, config.per_seconds)
    }
}
