//! Throughput sampling. Purely observational: a sampler never touches
//! protocol state, it only reads an offset and reports the delta.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Sampler {
    interval: Duration,
    next_due: Instant,
    last_offset: u64,
    finished: bool,
}

impl Sampler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_due: now + interval,
            last_offset: 0,
            finished: false,
        }
    }

    /// Take a sample if an interval has elapsed. Returns the bytes moved
    /// since the previous sample.
    pub fn poll(&mut self, offset: u64, now: Instant) -> Option<u64> {
        if self.finished || now < self.next_due {
            return None;
        }
        // Skip intervals missed while the event loop was busy.
        while self.next_due <= now {
            self.next_due += self.interval;
        }
        Some(self.take(offset))
    }

    /// Final sample when the exchange ends for any reason. Only the first
    /// call reports.
    pub fn finish(&mut self, offset: u64) -> Option<u64> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.take(offset))
    }

    fn take(&mut self, offset: u64) -> u64 {
        let delta = offset.saturating_sub(self.last_offset);
        self.last_offset = offset;
        delta
    }
}
