//! Admission control for signing-key refreshes.
//!
//! Two limits apply to every network fetch of a key set:
//!
//! - a per-webservice budget (`refreshes_per_interval` per `interval`), kept in a
//!   keyed `governor` limiter;
//! - a process-wide cap on refreshes in flight, kept in a `tokio` semaphore.
//!
//! Both fail fast. A saturated guard returns a retryable error instead of
//! queueing the caller.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::KeyCacheConfig;
use crate::{Error, Result};

/// Held for the duration of one refresh; releases the in-flight slot on drop.
#[derive(Debug)]
pub struct RefreshPermit {
    _permit: OwnedSemaphorePermit,
}

/// Refresh rate and concurrency limiter.
pub struct RefreshGuard {
    limiter: DefaultKeyedRateLimiter<String>,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
}

impl RefreshGuard {
    /// Create from cache configuration.
    ///
    /// The bucket holds `refreshes_per_interval` cells and regains one cell every
    /// `interval / refreshes_per_interval`, so a spent budget is whole again one
    /// `interval` later.
    pub fn new(config: &KeyCacheConfig) -> Self {
        let burst = NonZeroU32::new(config.refreshes_per_interval).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(config.interval / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        let max_in_flight = config.max_concurrent_refreshes.max(1);

        Self {
            limiter: GovernorLimiter::keyed(quota),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Admit one refresh for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyRefreshConcurrencyLimit`] when all slots are taken and
    /// [`Error::KeyRefreshRateLimited`] when `key` has spent its budget.
    pub fn try_admit(&self, key: &str) -> Result<RefreshPermit> {
        let permit = Arc::clone(&self.in_flight)
            .try_acquire_owned()
            .map_err(|_| {
                warn!(webservice = %key, max = self.max_in_flight, "Signing key refresh concurrency limit reached");
                Error::KeyRefreshConcurrencyLimit
            })?;

        if self.limiter.check_key(&key.to_string()).is_err() {
            warn!(webservice = %key, "Signing key refresh rate limit reached");
            return Err(Error::KeyRefreshRateLimited(key.to_string()));
        }

        debug!(webservice = %key, in_flight = self.in_flight(), "Signing key refresh admitted");
        Ok(RefreshPermit { _permit: permit })
    }

    /// Refreshes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn guard(per_interval: u32, concurrent: usize) -> RefreshGuard {
        guard_over(per_interval, Duration::from_secs(300), concurrent)
    }

    fn guard_over(per_interval: u32, interval: Duration, concurrent: usize) -> RefreshGuard {
        RefreshGuard::new(&KeyCacheConfig {
            refreshes_per_interval: per_interval,
            interval,
            max_concurrent_refreshes: concurrent,
        })
    }

    #[test]
    fn budget_is_per_webservice() {
        // GIVEN: a budget of 10 per window
        let guard = guard(10, 3);

        // WHEN: spending it on one webservice
        for _ in 0..10 {
            drop(guard.try_admit("acme:webservice:conjur/authn-jwt/a").unwrap());
        }

        // THEN: the 11th is refused, another webservice is unaffected
        assert!(matches!(
            guard.try_admit("acme:webservice:conjur/authn-jwt/a"),
            Err(Error::KeyRefreshRateLimited(_))
        ));
        assert!(guard.try_admit("acme:webservice:conjur/authn-jwt/b").is_ok());
    }

    #[test]
    fn fourth_concurrent_refresh_fails_fast() {
        // GIVEN: three permits held
        let guard = guard(10, 3);
        let held: Vec<RefreshPermit> = ["a", "b", "c"]
            .iter()
            .map(|k| guard.try_admit(k).unwrap())
            .collect();
        assert_eq!(guard.in_flight(), 3);

        // THEN: a fourth is refused immediately
        assert!(matches!(guard.try_admit("d"), Err(Error::KeyRefreshConcurrencyLimit)));

        // AND: releasing one frees a slot
        drop(held);
        assert_eq!(guard.in_flight(), 0);
        assert!(guard.try_admit("d").is_ok());
    }

    #[test]
    fn refused_concurrency_does_not_spend_budget() {
        let guard = guard(1, 1);
        let held = guard.try_admit("a").unwrap();
        assert!(guard.try_admit("b").is_err());
        drop(held);
        assert!(guard.try_admit("b").is_ok());
    }

    #[tokio::test]
    async fn spent_budget_is_whole_again_after_one_interval() {
        // GIVEN: a budget of 10 per 200 ms, fully spent
        let guard = guard_over(10, Duration::from_millis(200), 3);
        for _ in 0..10 {
            drop(guard.try_admit("a").unwrap());
        }
        assert!(matches!(guard.try_admit("a"), Err(Error::KeyRefreshRateLimited(_))));

        // WHEN: the next window starts
        tokio::time::sleep(Duration::from_millis(250)).await;

        // THEN: the whole budget is available again, not a single cell
        let admitted = (0..10).filter(|_| guard.try_admit("a").is_ok()).count();
        assert_eq!(admitted, 10);
        assert!(matches!(guard.try_admit("a"), Err(Error::KeyRefreshRateLimited(_))));
    }

    #[test]
    fn zero_interval_still_builds_a_guard() {
        let guard = guard_over(2, Duration::ZERO, 1);
        assert!(guard.try_admit("a").is_ok());
    }
}
