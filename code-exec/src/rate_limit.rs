use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Sliding-window admission control shared by all ingestion traffic.
///
/// Keeps the timestamps of recent admissions; each call first evicts the ones
/// that have aged out of the window and then admits only while fewer than
/// `max_requests` remain.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check whether a request arriving now is admitted
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit arrival time
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while let Some(oldest) = requests.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() < self.max_requests {
            requests.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn denies_after_max_requests_within_window() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start + Duration::from_secs(1)));
        assert!(limiter.allow_at(start + Duration::from_secs(2)));
        assert!(!limiter.allow_at(start + Duration::from_secs(3)));
        assert!(!limiter.allow_at(start + Duration::from_millis(9_999)));
    }

    #[test]
    fn admits_again_once_oldest_ages_out() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start + Duration::from_secs(5)));
        assert!(!limiter.allow_at(start + Duration::from_secs(6)));

        // Only the first admission has left the window
        let past_first = start + Duration::from_secs(10) + Duration::from_nanos(1);
        assert!(limiter.allow_at(past_first));
        assert!(!limiter.allow_at(start + Duration::from_secs(11)));
        assert!(limiter.allow_at(start + Duration::from_secs(16)));
    }

    #[test]
    fn denied_calls_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at(start));
        for second in 1..10 {
            assert!(!limiter.allow_at(start + Duration::from_secs(second)));
        }
        assert!(limiter.allow_at(start + Duration::from_secs(10) + Duration::from_nanos(1)));
    }

    #[test]
    fn admission_exactly_one_window_old_still_counts() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_secs(10)));
        assert!(limiter.allow_at(start + Duration::from_secs(10) + Duration::from_nanos(1)));
    }

    #[test]
    fn zero_capacity_denies_everything() {
        let limiter = SlidingWindowLimiter::new(0, Duration::from_secs(1));
        assert!(!limiter.allow());
    }

    #[test]
    fn shared_across_threads() {
        let limiter = Arc::new(SlidingWindowLimiter::new(50, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
