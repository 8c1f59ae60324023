use crate::config::RateLimitConfig;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::info;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Admission decision for one upload request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Over the limit; retry after roughly this many seconds
    Rejected { retry_after_secs: u64 },
}

/// Per-source-address admission control for the ingestion path.
///
/// Allows at most `max_requests` uploads per `window_secs` from one
/// client address (burst up to the full allowance, replenishing at
/// `max_requests / window`). Retrieval routes are never limited.
pub struct AdmissionGuard {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl AdmissionGuard {
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.max_requests.max(1)).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(config.window_secs.max(1));
        let replenish = (window / burst.get()).max(Duration::from_millis(1));
        let quota = Quota::with_period(replenish)
            .expect("replenish interval is non-zero")
            .allow_burst(burst);

        info!(
            max_requests = burst.get(),
            window_secs = window.as_secs(),
            "Admission guard initialized"
        );

        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Check whether an upload from this source may proceed
    pub fn check(&self, source: IpAddr) -> Admission {
        match self.limiter.check_key(&source) {
            Ok(_) => Admission::Admitted,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Admission::Rejected {
                    retry_after_secs: wait.as_secs().max(1),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn guard(max_requests: u32, window_secs: u64) -> AdmissionGuard {
        AdmissionGuard::new(&RateLimitConfig {
            max_requests,
            window_secs,
        })
    }

    #[test]
    fn test_admits_up_to_limit() {
        let guard = guard(3, 60);
        let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        for _ in 0..3 {
            assert_eq!(guard.check(source), Admission::Admitted);
        }
    }

    #[test]
    fn test_rejects_over_limit_with_retry_hint() {
        let guard = guard(2, 60);
        let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert_eq!(guard.check(source), Admission::Admitted);
        assert_eq!(guard.check(source), Admission::Admitted);

        match guard.check(source) {
            Admission::Rejected { retry_after_secs } => assert!(retry_after_secs >= 1),
            Admission::Admitted => panic!("expected rejection over the limit"),
        }
    }

    #[test]
    fn test_sources_are_limited_independently() {
        let guard = guard(1, 60);
        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4));

        assert_eq!(guard.check(first), Admission::Admitted);
        assert!(matches!(guard.check(first), Admission::Rejected { .. }));
        assert_eq!(guard.check(second), Admission::Admitted);
    }
}
