// ABOUTME: Sliding-window event counter used for throughput and drain-rate estimates.
// ABOUTME: Buckets counts by time so a rate over the recent window is cheap to read.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Upper bound on how many slots a window is divided into.
const SLOTS_PER_WINDOW: u32 = 50;
const MAX_SLOT: Duration = Duration::from_millis(100);

/// Counts occurrences over a trailing time window. Counts are summed into
/// fixed-width time slots, so memory is bounded by the window size rather
/// than the event rate.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    slot: Duration,
    origin: Instant,
    /// (slot index since `origin`, count), oldest first.
    slots: Mutex<VecDeque<(u64, u64)>>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        let slot = (window / SLOTS_PER_WINDOW).clamp(Duration::from_millis(1), MAX_SLOT);
        Self {
            window,
            slot,
            origin: Instant::now(),
            slots: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `count` occurrences happening now.
    pub fn record(&self, count: u64) {
        if count == 0 {
            return;
        }
        let now = self.slot_index(Instant::now());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut slots, now);
        match slots.back_mut() {
            Some((index, total)) if *index == now => *total += count,
            _ => slots.push_back((now, count)),
        }
    }

    /// Occurrences recorded within the window ending now.
    pub fn total(&self) -> u64 {
        let now = self.slot_index(Instant::now());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut slots, now);
        slots.iter().map(|(_, count)| count).sum()
    }

    /// Average occurrences per second across the full window.
    pub fn per_second(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total() as f64 / secs
    }

    fn slot_index(&self, at: Instant) -> u64 {
        (at.duration_since(self.origin).as_nanos() / self.slot.as_nanos()) as u64
    }

    fn evict(&self, slots: &mut VecDeque<(u64, u64)>, now: u64) {
        while let Some((index, _)) = slots.front() {
            if u128::from(now - index) * self.slot.as_nanos() >= self.window.as_nanos() {
                slots.pop_front();
            } else {
                break;
            }
        }
    }
}
