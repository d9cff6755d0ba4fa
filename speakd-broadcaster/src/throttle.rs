use std::time::{Duration, Instant};

/// Rate limiter for recurring log lines such as heartbeats
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_count)` when a line may be logged now,
    /// `None` when this occurrence should be swallowed.
    pub fn check(&mut self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Option<u64> {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_emit = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_window() {
        let mut throttle = LogThrottle::new(Duration::from_secs(30));
        let start = Instant::now();

        assert_eq!(throttle.check_at(start), Some(0));
        assert_eq!(throttle.check_at(start + Duration::from_secs(1)), None);
        assert_eq!(throttle.check_at(start + Duration::from_secs(10)), None);
        assert_eq!(throttle.check_at(start + Duration::from_secs(31)), Some(2));
        assert_eq!(throttle.check_at(start + Duration::from_secs(32)), None);
    }

    #[test]
    fn test_zero_interval_never_suppresses() {
        let mut throttle = LogThrottle::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(throttle.check_at(now), Some(0));
        assert_eq!(throttle.check_at(now), Some(0));
    }
}
