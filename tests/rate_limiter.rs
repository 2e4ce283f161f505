use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rate_guard_runner::{ConfigError, RateLimitError, RateLimiter, RateLimiterConfig};

/// Asserts that no window of length `window` contains more than `max` grants.
fn assert_window_respected(mut grants: Vec<Instant>, max: usize, window: Duration) {
    grants.sort();
    for (i, &start) in grants.iter().enumerate() {
        let in_window = grants[i..]
            .iter()
            .take_while(|&&t| t.duration_since(start) < window)
            .count();
        assert!(
            in_window <= max,
            "{} grants within {:?} starting at grant {}, max is {}",
            in_window,
            window,
            i,
            max
        );
    }
}

#[test]
fn test_new_rate_limiter() {
    let limiter = RateLimiter::new(10, 1.5).unwrap();
    assert_eq!(limiter.max_requests(), 10);
    assert_eq!(limiter.window(), Duration::from_millis(1500));
    assert_eq!(limiter.capacity_remaining(), 10);
    assert_eq!(limiter.total_granted(), 0);
}

#[test]
fn test_new_with_zero_max_requests() {
    assert!(matches!(
        RateLimiter::new(0, 1.0),
        Err(ConfigError::InvalidMaxRequests(0))
    ));
}

#[test]
fn test_new_with_invalid_window() {
    for per_seconds in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        assert!(
            matches!(RateLimiter::new(5, per_seconds), Err(ConfigError::InvalidWindow(_))),
            "per_seconds = {per_seconds} should be rejected"
        );
    }
    assert!(matches!(
        RateLimiter::with_window(5, Duration::ZERO),
        Err(ConfigError::InvalidWindow(_))
    ));
}

#[test]
fn test_try_acquire_at_fills_window() {
    let limiter = RateLimiter::new(3, 1.0).unwrap();
    let t0 = Instant::now();

    assert_eq!(limiter.try_acquire_at(t0), Ok(()));
    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(100)), Ok(()));
    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(200)), Ok(()));

    // Window is full until the first grant is a full second old
    match limiter.try_acquire_at(t0 + Duration::from_millis(300)) {
        Err(RateLimitError::Exhausted { retry_after }) => {
            assert_eq!(retry_after, Duration::from_millis(700));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(limiter.total_granted(), 3);
}

#[test]
fn test_grant_expires_exactly_at_window_edge() {
    let limiter = RateLimiter::new(1, 1.0).unwrap();
    let t0 = Instant::now();

    assert_eq!(limiter.try_acquire_at(t0), Ok(()));
    assert!(limiter
        .try_acquire_at(t0 + Duration::from_millis(999))
        .is_err());

    // One full window later the first grant no longer counts
    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_secs(1)), Ok(()));
}

#[test]
fn test_sliding_not_fixed_window() {
    // 2 per second: a fixed window would reset at t0 + 1s and allow a burst
    let limiter = RateLimiter::new(2, 1.0).unwrap();
    let t0 = Instant::now();

    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(900)), Ok(()));
    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(950)), Ok(()));

    // t0 + 1.1s: both grants still inside the trailing second
    assert!(limiter
        .try_acquire_at(t0 + Duration::from_millis(1100))
        .is_err());

    // t0 + 1.9s: the first grant has aged out
    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(1900)), Ok(()));
    assert!(limiter
        .try_acquire_at(t0 + Duration::from_millis(1920))
        .is_err());
}

#[test]
fn test_stale_instant_is_clamped_to_newest_grant() {
    let limiter = RateLimiter::new(2, 1.0).unwrap();
    let t0 = Instant::now();

    assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(500)), Ok(()));
    // An older instant is treated as t0 + 500ms and still fits
    assert_eq!(limiter.try_acquire_at(t0), Ok(()));
    assert!(limiter.try_acquire_at(t0).is_err());
    assert_eq!(limiter.capacity_remaining_at(t0 + Duration::from_millis(1500)), 2);
}

#[test]
fn test_capacity_remaining_recovers_with_time() {
    let limiter = RateLimiter::new(4, 2.0).unwrap();
    let t0 = Instant::now();

    for offset in [0, 500, 1000] {
        assert_eq!(limiter.try_acquire_at(t0 + Duration::from_millis(offset)), Ok(()));
    }
    assert_eq!(limiter.capacity_remaining_at(t0 + Duration::from_millis(1000)), 1);
    assert_eq!(limiter.capacity_remaining_at(t0 + Duration::from_millis(2000)), 2);
    assert_eq!(limiter.capacity_remaining_at(t0 + Duration::from_millis(3000)), 4);
}

#[test]
fn test_try_acquire_does_not_block() {
    let limiter = RateLimiter::new(1, 60.0).unwrap();
    let _first = limiter.try_acquire().unwrap();

    let started = Instant::now();
    assert!(matches!(
        limiter.try_acquire(),
        Err(RateLimitError::Exhausted { .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_permit_drop_does_not_return_capacity() {
    let limiter = RateLimiter::new(1, 60.0).unwrap();
    {
        let permit = limiter.acquire();
        assert!(permit.granted_at() <= Instant::now());
    }
    // Released, but the grant keeps counting for the rest of the window
    assert_eq!(limiter.capacity_remaining(), 0);
    assert!(limiter.try_acquire().is_err());
}

#[test]
fn test_run_releases_on_panic() {
    let limiter = RateLimiter::new(5, 60.0).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        limiter.run(|| panic!("gated work failed"))
    }));
    assert!(result.is_err());

    // The limiter is still usable after the gated closure unwound
    assert_eq!(limiter.run(|| 7), 7);
    assert_eq!(limiter.total_granted(), 2);
}

#[test]
fn test_acquire_timeout_expires() {
    let limiter = RateLimiter::new(1, 10.0).unwrap();
    let _held = limiter.acquire();

    let started = Instant::now();
    match limiter.acquire_timeout(Duration::from_millis(100)) {
        Err(RateLimitError::Timeout { waited }) => {
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "timed out too late: {elapsed:?}");
}

#[test]
fn test_acquire_timeout_succeeds_when_permit_frees_up() {
    let limiter = RateLimiter::new(1, 0.1).unwrap();
    let _first = limiter.acquire();

    let permit = limiter.acquire_timeout(Duration::from_secs(2));
    assert!(permit.is_ok());
}

#[test]
fn test_back_to_back_calls_block_until_window_slides() {
    // max_requests = 2 per 0.5s, 5 calls from one thread
    let window = Duration::from_millis(500);
    let limiter = RateLimiter::with_window(2, window).unwrap();
    let started = Instant::now();

    let grants: Vec<Instant> = (0..5)
        .map(|_| limiter.acquire().granted_at())
        .collect();

    let tolerance = Duration::from_millis(250);

    // First two are immediate
    assert!(grants[0].duration_since(started) < tolerance);
    assert!(grants[1].duration_since(started) < tolerance);

    // Call k (k >= 3) waits for call k - 2 to leave the window
    for k in 2..5 {
        let gap = grants[k].duration_since(grants[k - 2]);
        assert!(gap >= window, "call {} came {:?} after call {}", k + 1, gap, k - 1);
        assert!(gap < window + tolerance, "call {} waited too long: {:?}", k + 1, gap);
    }

    assert_window_respected(grants, 2, window);
}

#[test]
fn test_concurrent_acquire_never_exceeds_limit() {
    let window = Duration::from_millis(200);
    let limiter = Arc::new(RateLimiter::with_window(3, window).unwrap());
    let grants = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let grants = Arc::clone(&grants);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..3 {
                    let permit = limiter.acquire();
                    grants.lock().unwrap().push(permit.granted_at());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let grants = Arc::try_unwrap(grants).unwrap().into_inner().unwrap();
    assert_eq!(grants.len(), 24);
    assert_eq!(limiter.total_granted(), 24);
    assert_window_respected(grants, 3, window);
}

#[test]
fn test_from_config() {
    let limiter = RateLimiter::try_from(RateLimiterConfig::new(7, 0.25)).unwrap();
    assert_eq!(limiter.max_requests(), 7);
    assert_eq!(limiter.window(), Duration::from_millis(250));

    assert!(RateLimiter::try_from(RateLimiterConfig::new(0, 1.0)).is_err());
}

#[test]
fn test_huge_window_reports_unbounded_retry_after() {
    // Finite and positive, but far beyond what the clock can add to an Instant
    let limiter = RateLimiter::new(1, 1e19).unwrap();
    let _first = limiter.try_acquire().unwrap();

    match limiter.try_acquire() {
        Err(RateLimitError::Exhausted { retry_after }) => assert_eq!(retry_after, Duration::MAX),
        other => panic!("expected Exhausted, got {other:?}"),
    }

    // Timed acquisition still gives up instead of overflowing
    assert!(matches!(
        limiter.acquire_timeout(Duration::from_millis(20)),
        Err(RateLimitError::Timeout { .. })
    ));
    assert_eq!(limiter.capacity_remaining(), 0);
}

#[test]
fn test_max_u32_requests_is_usable() {
    let limiter = RateLimiter::new(u32::MAX, 1.0).unwrap();
    assert_eq!(limiter.capacity_remaining(), u32::MAX);

    for _ in 0..2000 {
        assert!(limiter.try_acquire().is_ok());
    }
    assert_eq!(limiter.total_granted(), 2000);
    assert_eq!(limiter.capacity_remaining(), u32::MAX - 2000);
}
