//! Rolling transfer history used to measure speeds.
use std::{cell::Cell, time::Duration};

use tokio::time::Instant;

/// Window covered by the history.
pub const HISTORY: Duration = Duration::from_millis(2000);
const GRANULARITY: Duration = Duration::from_millis(100);
const HISTORY_SIZE: usize =
    (HISTORY.as_millis() / GRANULARITY.as_millis()) as usize;

#[derive(Debug, Clone, Copy, Default)]
struct Transfer {
    date: Option<Instant>,
    size: u64,
}

/// Circular buffer of `(timestamp, bytes)` buckets.
#[derive(Debug, Clone, Default)]
pub struct RateControl {
    transfers: [Transfer; HISTORY_SIZE],
    newest: usize,
    cache: Cell<Option<(Instant, u64)>>,
}

impl RateControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_used(&mut self, now: Instant, size: u64) {
        let newest = &mut self.transfers[self.newest];

        match newest.date {
            Some(date) if date + GRANULARITY >= now => newest.size += size,
            _ => {
                self.newest = (self.newest + 1) % HISTORY_SIZE;
                self.transfers[self.newest] = Transfer { date: Some(now), size };
            }
        }

        self.cache.set(None);
    }

    /// Bytes per second over the last `interval`. Cached per `now`.
    pub fn speed(&self, now: Instant, interval: Duration) -> u64 {
        if let Some((at, val)) = self.cache.get() {
            if at == now {
                return val;
            }
        }

        let cutoff = now.checked_sub(interval);
        let mut bytes = 0;
        let mut i = self.newest;

        loop {
            let t = &self.transfers[i];
            let Some(date) = t.date else { break };
            if cutoff.is_some_and(|c| date <= c) {
                break;
            }
            bytes += t.size;

            i = if i == 0 { HISTORY_SIZE - 1 } else { i - 1 };
            if i == self.newest {
                break;
            }
        }

        let interval_ms = interval.as_millis().max(1) as u64;
        let val = bytes * 1000 / interval_ms;
        self.cache.set(Some((now, val)));
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_over_window() {
        let mut r = RateControl::new();
        let now = Instant::now();

        r.bytes_used(now, 1000);
        r.bytes_used(now, 1000);
        assert_eq!(r.speed(now, HISTORY), 1000);

        // a bucket from outside the window is ignored
        let later = now + Duration::from_millis(2500);
        r.bytes_used(later, 500);
        assert_eq!(r.speed(later, HISTORY), 250);

        assert_eq!(r.speed(later + Duration::from_secs(5), HISTORY), 0);
    }

    #[test]
    fn buckets_wrap_around() {
        let mut r = RateControl::new();
        let start = Instant::now();

        for i in 0..(HISTORY_SIZE as u64 * 3) {
            r.bytes_used(start + GRANULARITY * 2 * i as u32, 10);
        }

        let now = start + GRANULARITY * 2 * (HISTORY_SIZE as u32 * 3 - 1);
        // only the buckets inside the last two seconds count
        let speed = r.speed(now, HISTORY);
        assert!(speed > 0);
        assert!(speed <= 10 * HISTORY_SIZE as u64 * 1000 / 2000);
    }

    #[test]
    fn cache_is_dropped_on_use() {
        let mut r = RateControl::new();
        let now = Instant::now();
        assert_eq!(r.speed(now, HISTORY), 0);
        r.bytes_used(now, 2000);
        assert_eq!(r.speed(now, HISTORY), 1000);
    }
}
