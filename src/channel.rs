use crate::{Config, MetricsSnapshot, Reservation, Ring};
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a registration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The static producer ceiling was already reached.
    #[error("too many producers registered (max: {max})")]
    TooManyProducers {
        /// The configured ceiling.
        max: usize,
    },
    /// The channel has been closed and admits no new producers.
    #[error("channel is closed")]
    Closed,
}

/// Multi-producer single-consumer channel decomposed into per-producer rings.
///
/// Every registered producer owns a private [`Ring`], so producers never
/// contend with each other: the only cross-core traffic is the one
/// release/acquire pair each ring already pays. The single consumer sweeps
/// the rings in index order with [`consume_all`](Channel::consume_all).
///
/// `Channel` is a cheap handle over shared state: clone it freely to move it
/// into threads. Ordering guarantees are per ring only; the channel imposes
/// no order between producers.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    rings: Box<[Ring<T>]>,
    // Padded so registration traffic cannot share a line with the flag or
    // the ring array.
    producer_count: CachePadded<AtomicUsize>,
    closed: CachePadded<AtomicBool>,
    config: Config,
}

impl<T> Channel<T> {
    /// Allocates `config.max_producers` rings, all empty and inactive.
    pub fn new(config: Config) -> Self {
        let rings: Box<[Ring<T>]> = (0..config.max_producers)
            .map(|_| Ring::new(config))
            .collect();

        Self {
            shared: Arc::new(Shared {
                rings,
                producer_count: CachePadded::new(AtomicUsize::new(0)),
                closed: CachePadded::new(AtomicBool::new(false)),
                config,
            }),
        }
    }

    /// Claims the next unused ring and returns the producer handle bound to
    /// it.
    ///
    /// Ring indices are handed out by an atomic fetch-add and never reused;
    /// concurrent registrations partition the index space without seeing each
    /// other's ring. An over-ceiling attempt undoes its increment, so a flood
    /// of failed registrations cannot exhaust the ceiling for later callers.
    pub fn register(&self) -> Result<Producer<T>, ChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let id = self.shared.producer_count.fetch_add(1, Ordering::Relaxed);
        if id >= self.shared.config.max_producers {
            self.shared.producer_count.fetch_sub(1, Ordering::Relaxed);
            return Err(ChannelError::TooManyProducers {
                max: self.shared.config.max_producers,
            });
        }

        self.shared.rings[id].set_active();

        Ok(Producer {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    /// Drains every registered ring in index order; returns the total count.
    ///
    /// Index order is stable, so in a quiet steady state the observed
    /// interleaving is ring 0's batch, then ring 1's, and so on. Under
    /// saturation it favors low-indexed rings; callers that need fairness
    /// can bound each sweep with
    /// [`consume_all_up_to`](Channel::consume_all_up_to).
    pub fn consume_all<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        let count = self.shared.producer_count.load(Ordering::Acquire);
        let mut total = 0;
        for ring in &self.shared.rings[..count.min(self.shared.rings.len())] {
            total += ring.consume_batch(&mut handler);
        }
        total
    }

    /// Like [`consume_all`](Channel::consume_all) but stops after
    /// `max_total` items, earlier rings first.
    pub fn consume_all_up_to<F>(&self, max_total: usize, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        let count = self.shared.producer_count.load(Ordering::Acquire);
        let mut total = 0;
        for ring in &self.shared.rings[..count.min(self.shared.rings.len())] {
            if total >= max_total {
                break;
            }
            total += ring.consume_up_to(max_total - total, &mut handler);
        }
        total
    }

    /// Copying sweep for `Copy` payloads; fills `out` front to back.
    pub fn recv(&self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        let count = self.shared.producer_count.load(Ordering::Acquire);
        let mut total = 0;
        for ring in &self.shared.rings[..count.min(self.shared.rings.len())] {
            if total >= out.len() {
                break;
            }
            total += ring.recv(&mut out[total..]);
        }
        total
    }

    /// Closes the channel and cascades the close to every registered ring.
    ///
    /// New registrations fail from this point; the consumer keeps draining
    /// until every ring is both closed and empty.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let count = self.shared.producer_count.load(Ordering::Acquire);
        for ring in &self.shared.rings[..count.min(self.shared.rings.len())] {
            ring.close();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of producers registered so far.
    #[inline]
    pub fn producer_count(&self) -> usize {
        self.shared.producer_count.load(Ordering::Acquire)
    }

    /// Direct access to one ring, e.g. to pin a dedicated consumer per ring
    /// or to poll `is_closed`/`is_empty` for end-of-stream.
    pub fn ring(&self, id: usize) -> Option<&Ring<T>> {
        self.shared.rings.get(id)
    }

    /// True when every registered ring has been closed and drained, the
    /// consumer's termination condition.
    pub fn is_drained(&self) -> bool {
        let count = self.shared.producer_count.load(Ordering::Acquire);
        self.shared.rings[..count.min(self.shared.rings.len())]
            .iter()
            .all(|ring| ring.is_closed() && ring.is_empty())
    }

    /// Counters aggregated across all registered rings.
    pub fn metrics(&self) -> MetricsSnapshot {
        let count = self.shared.producer_count.load(Ordering::Acquire);
        let mut total = MetricsSnapshot::default();
        for ring in &self.shared.rings[..count.min(self.shared.rings.len())] {
            total.merge(ring.metrics());
        }
        total
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("producer_count", &self.producer_count())
            .field("max_producers", &self.shared.config.max_producers)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Write handle bound to one ring of a [`Channel`].
///
/// Deliberately not `Clone`: a second handle to the same ring would mean two
/// writers, and the whole lock-free scheme rests on there being one. Move the
/// handle into the producing thread instead.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    id: usize,
}

impl<T> Producer<T> {
    /// Index of the ring this producer writes to.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    fn ring(&self) -> &Ring<T> {
        &self.shared.rings[self.id]
    }

    /// Reserves one slot; see [`Ring::reserve`].
    #[inline]
    pub fn reserve(&self) -> Option<Reservation<'_, T>> {
        self.ring().reserve()
    }

    /// Reserves up to `n` contiguous slots; see [`Ring::reserve_n`].
    #[inline]
    pub fn reserve_n(&self, n: usize) -> Option<Reservation<'_, T>> {
        self.ring().reserve_n(n)
    }

    /// Reserve with an adaptive spin/yield retry loop.
    #[inline]
    pub fn reserve_with_backoff(&self, n: usize) -> Option<Reservation<'_, T>> {
        self.ring().reserve_with_backoff(n)
    }

    /// Sends one value. `false` means the ring is full; pause and retry.
    #[inline]
    pub fn send(&self, value: T) -> bool {
        self.ring().push(value)
    }

    /// Copies as much of `items` as fits contiguously; returns the count.
    #[inline]
    pub fn send_slice(&self, items: &[T]) -> usize
    where
        T: Copy,
    {
        self.ring().send_slice(items)
    }

    /// Signals end-of-stream on this producer's ring.
    #[inline]
    pub fn close(&self) {
        self.ring().close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.ring().is_closed()
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
