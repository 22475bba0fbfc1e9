use std::time::{Duration, Instant};

/// Trailing-edge debounce with a hard ceiling.
///
/// A burst fires once after `debounce` of quiet. An event stream that never
/// goes quiet still fires at most `max_wait` after the first pending event.
#[derive(Debug, Clone)]
pub struct Debouncer {
    debounce: Duration,
    max_wait: Duration,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(debounce: Duration, max_wait: Duration) -> Self {
        Self {
            debounce,
            max_wait: max_wait.max(debounce),
            first: None,
            last: None,
        }
    }

    pub fn record(&mut self, now: Instant) {
        if self.first.is_none() {
            self.first = Some(now);
        }
        self.last = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.first.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first?;
        let last = self.last.unwrap_or(first);
        Some((last + self.debounce).min(first + self.max_wait))
    }

    /// Returns true, and clears the pending burst, once the deadline passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.first = None;
                self.last = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn burst_collapses_into_one_fire() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(ms(250), ms(2000));
        assert!(!debouncer.poll(start));

        for offset in [0, 20, 40, 60, 80] {
            debouncer.record(start + ms(offset));
            assert!(!debouncer.poll(start + ms(offset)));
        }
        assert_eq!(debouncer.deadline(), Some(start + ms(330)));
        assert!(!debouncer.poll(start + ms(329)));
        assert!(debouncer.poll(start + ms(330)));
        assert!(!debouncer.is_pending());
        assert!(!debouncer.poll(start + ms(1000)));
    }

    #[test]
    fn continuous_stream_still_fires_within_max_wait() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(ms(250), ms(1000));
        let mut fires = Vec::new();
        let mut now = start;
        while now < start + ms(5000) {
            debouncer.record(now);
            if debouncer.poll(now) {
                fires.push(now.duration_since(start));
            }
            now += ms(100);
        }
        assert!(fires.len() >= 4, "fires: {fires:?}");
        let mut previous = Duration::ZERO;
        for fire in fires {
            assert!(fire - previous <= ms(1100), "gap too long at {fire:?}");
            previous = fire;
        }
    }

    #[test]
    fn max_wait_never_shorter_than_debounce() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(ms(300), ms(100));
        debouncer.record(start);
        assert_eq!(debouncer.deadline(), Some(start + ms(300)));
    }
}
