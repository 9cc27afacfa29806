use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    FlushNow,
    /// A trailing flush is scheduled at [`FlushThrottle::next_deadline`].
    Deferred,
}

/// Leading-edge throttle with one trailing flush: the first change in a quiet
/// period flushes at once, later changes inside the window collapse into a
/// single flush when the window ends.
#[derive(Debug)]
pub struct FlushThrottle {
    window: Duration,
    last_flush: Option<Instant>,
    trailing: Option<Instant>,
}

impl FlushThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_flush: None,
            trailing: None,
        }
    }

    pub fn on_change(&mut self, now: Instant) -> ThrottleDecision {
        match self.last_flush {
            Some(last) if now.saturating_duration_since(last) < self.window => {
                if self.trailing.is_none() {
                    self.trailing = Some(last + self.window);
                }
                ThrottleDecision::Deferred
            }
            _ => {
                self.last_flush = Some(now);
                ThrottleDecision::FlushNow
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.trailing
    }

    /// Call when the trailing deadline fires; the caller then flushes.
    pub fn on_deadline(&mut self, now: Instant) {
        self.trailing = None;
        self.last_flush = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(150);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_flushes_once_then_once_more_at_window_end() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);

        assert_eq!(throttle.on_change(t0), ThrottleDecision::FlushNow);
        assert_eq!(throttle.next_deadline(), None);

        assert_eq!(throttle.on_change(t0 + ms(40)), ThrottleDecision::Deferred);
        assert_eq!(throttle.on_change(t0 + ms(90)), ThrottleDecision::Deferred);
        assert_eq!(throttle.next_deadline(), Some(t0 + WINDOW));

        throttle.on_deadline(t0 + WINDOW);
        assert_eq!(throttle.next_deadline(), None);

        // Still inside the window opened by the trailing flush.
        assert_eq!(throttle.on_change(t0 + ms(200)), ThrottleDecision::Deferred);
        assert_eq!(throttle.next_deadline(), Some(t0 + WINDOW + WINDOW));
        throttle.on_deadline(t0 + ms(300));

        assert_eq!(throttle.on_change(t0 + ms(500)), ThrottleDecision::FlushNow);
    }

    #[test]
    fn quiet_changes_always_flush_immediately() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        for i in 0..3 {
            assert_eq!(
                throttle.on_change(t0 + ms(i * 200)),
                ThrottleDecision::FlushNow
            );
        }
        assert_eq!(throttle.next_deadline(), None);
    }
}
