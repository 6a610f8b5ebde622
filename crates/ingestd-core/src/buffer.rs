// ABOUTME: Bounded FIFO of accepted-but-not-yet-persisted events shared by producers and the batch worker.
// ABOUTME: Assigns sequence numbers, answers backpressure decisions, and hands out chunks for persistence.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

use crate::admission::{Admission, UnavailableReason};
use crate::config::PipelineConfig;
use crate::event::{Event, NewEvent, SequenceRange};
use crate::rate::RateWindow;

/// Events removed from the head of the buffer for one persistence attempt.
/// Its slots stay reserved until the chunk is handed back through
/// [`EventBuffer::settle`] or [`EventBuffer::requeue_front`].
#[derive(Debug)]
pub struct Chunk {
    events: Vec<Event>,
}

impl Chunk {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Lowest and highest sequence in this chunk. Reinserted dead letters
    /// can sit behind newer events, so the head is not always the minimum.
    /// Chunks handed out by the buffer are never empty.
    pub fn range(&self) -> SequenceRange {
        let mut sequences = self.events.iter().map(|e| e.sequence);
        let Some(head) = sequences.next() else {
            return SequenceRange { first: 0, last: 0 };
        };
        let (first, last) = sequences.fold((head, head), |(lo, hi), s| (lo.min(s), hi.max(s)));
        SequenceRange { first, last }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReinsertError {
    #[error("buffer is closed")]
    Closed,

    #[error("buffer has room for {available} of {needed} events")]
    NoRoom { needed: usize, available: usize },
}

#[derive(Debug)]
struct BufferInner {
    queue: VecDeque<Event>,
    /// Events currently held by the worker in a chunk.
    in_flight: usize,
    next_sequence: u64,
    closed: bool,
}

impl BufferInner {
    fn occupied(&self) -> usize {
        self.queue.len() + self.in_flight
    }

    fn push_existing(&mut self, event: Event) {
        self.next_sequence = self.next_sequence.max(event.sequence + 1);
        self.queue.push_back(event);
    }
}

/// Bounded event queue. Every mutation happens under one short-lived lock;
/// no I/O is ever performed while it is held.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    chunk_size: usize,
    chunk_ready_threshold: usize,
    retry_after_fallback: Duration,
    retry_after_max: Duration,
    inner: Mutex<BufferInner>,
    total_enqueued: AtomicU64,
    total_rejected: AtomicU64,
    enqueue_rate: RateWindow,
    drain_rate: RateWindow,
    chunk_ready: Notify,
}

impl EventBuffer {
    /// Create an empty buffer whose first accepted event gets sequence 1.
    pub fn new(config: &PipelineConfig) -> Self {
        Self::starting_at(config, 1)
    }

    /// Create an empty buffer that continues numbering at `next_sequence`.
    pub fn starting_at(config: &PipelineConfig, next_sequence: u64) -> Self {
        let window = config.metrics.throughput_window();
        Self {
            capacity: config.buffer.capacity,
            chunk_size: config.worker.batch_chunk_size,
            chunk_ready_threshold: config.worker.chunk_ready_threshold(),
            retry_after_fallback: Duration::from_secs(config.buffer.retry_after_fallback_secs),
            retry_after_max: Duration::from_secs(config.buffer.retry_after_max_secs),
            inner: Mutex::new(BufferInner {
                queue: VecDeque::with_capacity(config.buffer.capacity),
                in_flight: 0,
                next_sequence: next_sequence.max(1),
                closed: false,
            }),
            total_enqueued: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            enqueue_rate: RateWindow::new(window),
            drain_rate: RateWindow::new(window),
            chunk_ready: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an already-validated event. A full buffer is rejected without
    /// any mutation; a closed buffer reports the service as unavailable.
    pub fn enqueue(&self, payload: NewEvent) -> Admission {
        let (admission, ready) = {
            let mut inner = self.lock();
            if inner.closed {
                return Admission::ServiceUnavailable {
                    reason: UnavailableReason::ShuttingDown,
                };
            }
            if inner.occupied() >= self.capacity {
                drop(inner);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Admission::BufferSaturated {
                    retry_after: self.retry_after(),
                };
            }

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            let event = Event::accept(sequence, payload);
            let admission = Admission::Accepted {
                sequence,
                event_id: event.event_id,
                queued_at: event.ingested_at,
            };
            inner.queue.push_back(event);
            self.total_enqueued.fetch_add(1, Ordering::Relaxed);
            (admission, inner.queue.len() >= self.chunk_ready_threshold)
        };

        self.enqueue_rate.record(1);
        if ready {
            self.chunk_ready.notify_one();
        }
        admission
    }

    /// Remove up to `max_size` events from the head. Returns None when
    /// nothing is queued. Only the batch worker calls this.
    pub fn dequeue_chunk(&self, max_size: usize) -> Option<Chunk> {
        let mut inner = self.lock();
        let count = max_size.min(inner.queue.len());
        if count == 0 {
            return None;
        }
        let events: Vec<Event> = inner.queue.drain(..count).collect();
        inner.in_flight += events.len();
        Some(Chunk { events })
    }

    /// Put an unpersisted chunk back at the head in its original order.
    /// Counters are left untouched.
    pub fn requeue_front(&self, chunk: Chunk) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(chunk.events.len());
        for event in chunk.events.into_iter().rev() {
            inner.queue.push_front(event);
        }
    }

    /// Release the slots of a chunk that was persisted or dropped, returning
    /// its events to the caller.
    pub fn settle(&self, chunk: Chunk) -> Vec<Event> {
        let len = chunk.events.len();
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(len);
        }
        self.drain_rate.record(len as u64);
        chunk.events
    }

    /// Reinsert events recovered from a previous run, in order, without
    /// counting them as new enqueues. Events that do not fit are returned.
    pub fn restore(&self, events: Vec<Event>) -> Vec<Event> {
        let mut inner = self.lock();
        let mut overflow = Vec::new();
        for event in events {
            if inner.occupied() >= self.capacity {
                overflow.push(event);
                continue;
            }
            inner.push_existing(event);
        }
        overflow
    }

    /// Put previously dropped events back at the tail, keeping their
    /// sequence numbers. All or nothing: a closed buffer or one without room
    /// for every event is left untouched.
    pub fn reinsert(&self, events: Vec<Event>) -> Result<usize, ReinsertError> {
        let count = events.len();
        let ready = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(ReinsertError::Closed);
            }
            let available = self.capacity.saturating_sub(inner.occupied());
            if count > available {
                return Err(ReinsertError::NoRoom {
                    needed: count,
                    available,
                });
            }
            for event in events {
                inner.push_existing(event);
            }
            inner.queue.len() >= self.chunk_ready_threshold
        };
        if ready {
            self.chunk_ready.notify_one();
        }
        Ok(count)
    }

    /// Stop accepting new events.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove every queued event, leaving in-flight chunks alone.
    pub fn take_remaining(&self) -> Vec<Event> {
        self.lock().queue.drain(..).collect()
    }

    /// Resolves once the queued count has reached the chunk-ready
    /// threshold since the last wakeup.
    pub async fn chunk_ready(&self) {
        self.chunk_ready.notified().await;
    }

    /// Accepted events not yet persisted, including any chunk in flight.
    pub fn len(&self) -> usize {
        self.lock().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events waiting in the queue, excluding any chunk in flight.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy as a fraction in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    /// Accepted events per second over the recent window.
    pub fn throughput_per_second(&self) -> f64 {
        self.enqueue_rate.per_second()
    }

    /// Estimated wait until one chunk's worth of space frees up at the
    /// recently observed drain rate.
    pub fn retry_after(&self) -> Duration {
        let rate = self.drain_rate.per_second();
        if rate <= 0.0 {
            return self.retry_after_fallback.min(self.retry_after_max);
        }
        let secs = (self.chunk_size as f64 / rate).ceil() as u64;
        Duration::from_secs(secs.clamp(1, self.retry_after_max.as_secs().max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize, chunk: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.buffer.capacity = capacity;
        config.worker.batch_chunk_size = chunk;
        config
    }

    fn payload(n: usize) -> NewEvent {
        NewEvent::new("svc", format!("message {}", n))
    }

    fn accepted_sequence(admission: &Admission) -> u64 {
        match admission {
            Admission::Accepted { sequence, .. } => *sequence,
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn enqueue_assigns_contiguous_sequences() {
        let buffer = EventBuffer::new(&config(10, 5));
        let sequences: Vec<u64> = (0..5)
            .map(|n| accepted_sequence(&buffer.enqueue(payload(n))))
            .collect();

        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.total_enqueued(), 5);
    }

    #[test]
    fn full_buffer_rejects_without_mutation() {
        let buffer = EventBuffer::new(&config(3, 1));
        for n in 0..3 {
            buffer.enqueue(payload(n));
        }
        let before_next = buffer.next_sequence();

        let result = buffer.enqueue(payload(99));

        assert!(matches!(result, Admission::BufferSaturated { .. }));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_enqueued(), 3);
        assert_eq!(buffer.next_sequence(), before_next);
        assert_eq!(buffer.total_rejected(), 1);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let buffer = EventBuffer::new(&config(50, 10));
        for n in 0..500 {
            buffer.enqueue(payload(n));
            assert!(buffer.len() <= buffer.capacity());
        }
        assert_eq!(buffer.len(), 50);
    }

    #[test]
    fn dequeue_chunk_takes_head_in_order() {
        let buffer = EventBuffer::new(&config(10, 4));
        for n in 0..6 {
            buffer.enqueue(payload(n));
        }

        let chunk = buffer.dequeue_chunk(4).unwrap();
        let seqs: Vec<u64> = chunk.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(chunk.range(), SequenceRange { first: 1, last: 4 });
        assert_eq!(buffer.queued(), 2);
        // in-flight events still occupy their slots
        assert_eq!(buffer.len(), 6);

        buffer.settle(chunk);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn dequeue_on_empty_buffer_returns_none() {
        let buffer = EventBuffer::new(&config(10, 4));
        assert!(buffer.dequeue_chunk(4).is_none());
    }

    #[test]
    fn requeue_front_restores_original_order() {
        let buffer = EventBuffer::new(&config(10, 3));
        for n in 0..5 {
            buffer.enqueue(payload(n));
        }
        let chunk = buffer.dequeue_chunk(3).unwrap();
        buffer.requeue_front(chunk);

        let all = buffer.dequeue_chunk(10).unwrap();
        let seqs: Vec<u64> = all.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.total_enqueued(), 5);
    }

    #[test]
    fn in_flight_chunk_reserves_capacity() {
        let buffer = EventBuffer::new(&config(4, 2));
        for n in 0..4 {
            buffer.enqueue(payload(n));
        }
        let chunk = buffer.dequeue_chunk(2).unwrap();

        // Slots of the in-flight chunk are not reusable until settled
        assert!(matches!(
            buffer.enqueue(payload(10)),
            Admission::BufferSaturated { .. }
        ));

        buffer.requeue_front(chunk);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn closed_buffer_reports_shutting_down() {
        let buffer = EventBuffer::new(&config(4, 2));
        buffer.close();
        assert!(matches!(
            buffer.enqueue(payload(0)),
            Admission::ServiceUnavailable {
                reason: UnavailableReason::ShuttingDown
            }
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn restore_keeps_order_and_returns_overflow() {
        let source = EventBuffer::new(&config(10, 2));
        for n in 0..5 {
            source.enqueue(payload(n));
        }
        let recovered = source.take_remaining();

        let buffer = EventBuffer::new(&config(3, 2));
        let overflow = buffer.restore(recovered);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_enqueued(), 0);
        assert_eq!(overflow.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
        // numbering continues past every restored event
        assert_eq!(buffer.next_sequence(), 4);
    }

    #[test]
    fn reinsert_is_all_or_nothing() {
        let source = EventBuffer::new(&config(10, 2));
        for n in 0..3 {
            source.enqueue(payload(n));
        }
        let dropped = source.take_remaining();

        let buffer = EventBuffer::starting_at(&config(4, 2), 20);
        buffer.enqueue(payload(0));
        buffer.enqueue(payload(1));
        assert_eq!(
            buffer.reinsert(dropped.clone()),
            Err(ReinsertError::NoRoom {
                needed: 3,
                available: 2
            })
        );
        assert_eq!(buffer.len(), 2);

        let chunk = buffer.dequeue_chunk(1).unwrap();
        buffer.settle(chunk);
        assert_eq!(buffer.reinsert(dropped), Ok(3));

        let chunk = buffer.dequeue_chunk(4).unwrap();
        let seqs: Vec<u64> = chunk.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![21, 1, 2, 3]);
        assert_eq!(chunk.range(), SequenceRange { first: 1, last: 21 });
        assert_eq!(buffer.total_enqueued(), 2);
        assert_eq!(buffer.next_sequence(), 22);
    }

    #[test]
    fn reinsert_refuses_closed_buffer() {
        let buffer = EventBuffer::new(&config(10, 2));
        buffer.close();
        let events = vec![Event::accept(1, payload(0))];
        assert_eq!(buffer.reinsert(events), Err(ReinsertError::Closed));
        assert!(buffer.is_empty());
    }

    #[test]
    fn starting_at_continues_numbering() {
        let buffer = EventBuffer::starting_at(&config(10, 2), 101);
        assert_eq!(accepted_sequence(&buffer.enqueue(payload(0))), 101);
    }

    #[test]
    fn utilization_tracks_occupancy() {
        let buffer = EventBuffer::new(&config(10, 2));
        for n in 0..7 {
            buffer.enqueue(payload(n));
        }
        assert!((buffer.utilization() - 0.7).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_uses_fallback_without_drain_history() {
        let mut cfg = config(2, 1);
        cfg.buffer.retry_after_fallback_secs = 7;
        let buffer = EventBuffer::new(&cfg);
        assert_eq!(buffer.retry_after(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_estimates_from_drain_rate() {
        let mut cfg = config(100, 10);
        cfg.metrics.throughput_window_ms = 1_000;
        let buffer = EventBuffer::new(&cfg);
        for n in 0..10 {
            buffer.enqueue(payload(n));
        }
        // 5 events drained in the last second: 10 / 5 per second = 2s
        let chunk = buffer.dequeue_chunk(5).unwrap();
        buffer.settle(chunk);

        assert_eq!(buffer.retry_after(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_ready_fires_at_threshold() {
        let buffer = EventBuffer::new(&config(10, 3));
        for n in 0..3 {
            buffer.enqueue(payload(n));
        }
        tokio::time::timeout(Duration::from_millis(10), buffer.chunk_ready())
            .await
            .expect("notification should be pending");
    }
}
