use std::time::{Duration, Instant};

/// Monotonic nanosecond clock anchored at scheduler start.
///
/// Timestamps stored in the indexes are nanoseconds since `start`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    pub fn until(&self, deadline_ns: u64) -> Duration {
        Duration::from_nanos(deadline_ns.saturating_sub(self.now_ns()))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now_ns();
        assert!(b > a);
        assert_eq!(clock.until(0), Duration::ZERO);
    }
}
