use crate::{Config, Metrics, MetricsSnapshot};
use crossbeam_utils::Backoff;
use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Synchronization protocol
// ------------------------
//
// `head` and `tail` are unbounded u64 counters; a slot index is recovered by
// masking at access time. Keeping the counters unreduced makes a full ring
// (`tail - head == capacity`) distinguishable from an empty one and rules out
// ABA on the indices for any realistic runtime.
//
// One release/acquire edge in each direction carries all payload visibility:
//
//   producer                         consumer
//   --------                         --------
//   load tail          Relaxed       load head          Relaxed
//   load head          Acquire <---- store head         Release
//   write slots [tail, tail+n)       read slots [head, tail)
//   store tail         Release ----> load tail          Acquire
//
// `cached_head` (producer side) and `cached_tail` (consumer side) are plain
// snapshots of the peer's index. Each is read and written by exactly one
// thread, so they live in `UnsafeCell` without atomics. A snapshot is only
// ever a lower bound of the real index, which makes acting on a stale value
// safe: the fast path can under-estimate free space or available items, never
// over-estimate them.

/// Bytes per isolation unit for the hot index fields. Two hardware lines, to
/// defeat adjacent-line prefetching on current x86 and Apple cores.
const INDEX_LINE: usize = 128;

/// Alignment of the slot array itself.
const BUFFER_ALIGN: usize = 64;

/// The producer's line: its own published index plus its private snapshot of
/// the consumer's. Commits touch nothing outside this line on the fast path.
#[repr(C, align(128))]
struct ProducerLine {
    tail: AtomicU64,
    cached_head: UnsafeCell<u64>,
}

/// The consumer's line, mirror-image of [`ProducerLine`].
#[repr(C, align(128))]
struct ConsumerLine {
    head: AtomicU64,
    cached_tail: UnsafeCell<u64>,
}

/// Cold flags, kept off both hot lines.
#[repr(C, align(128))]
struct StateLine {
    active: AtomicBool,
    closed: AtomicBool,
}

// The isolation contract, checked where it is cheapest to check.
const _: () = {
    assert!(std::mem::align_of::<ProducerLine>() == INDEX_LINE);
    assert!(std::mem::align_of::<ConsumerLine>() == INDEX_LINE);
    assert!(std::mem::align_of::<StateLine>() == INDEX_LINE);
    assert!(std::mem::size_of::<ProducerLine>() == INDEX_LINE);
    assert!(std::mem::size_of::<ConsumerLine>() == INDEX_LINE);
};

/// Heap slot array, aligned to [`BUFFER_ALIGN`] regardless of `T`.
struct SlotBuffer<T> {
    ptr: NonNull<UnsafeCell<MaybeUninit<T>>>,
    capacity: usize,
    _owns: PhantomData<T>,
}

impl<T> SlotBuffer<T> {
    fn allocate(capacity: usize) -> Self {
        let layout = Self::layout(capacity);
        let ptr = if layout.size() == 0 {
            // Zero-sized payloads need no storage; slot pointers are never
            // dereferenced as more than a place for a ZST.
            NonNull::dangling()
        } else {
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc(layout) };
            match NonNull::new(raw.cast::<UnsafeCell<MaybeUninit<T>>>()) {
                Some(ptr) => ptr,
                None => alloc::handle_alloc_error(layout),
            }
        };
        Self {
            ptr,
            capacity,
            _owns: PhantomData,
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::array::<UnsafeCell<MaybeUninit<T>>>(capacity)
            .and_then(|layout| layout.align_to(BUFFER_ALIGN))
            .expect("ring capacity overflows the address space")
    }

    /// Raw pointer to slot `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be below `capacity`. Writing through the result is only
    /// sound for the single producer inside a live reservation; reading is
    /// only sound for the single consumer on slots in `[head, tail)`.
    #[inline]
    unsafe fn slot(&self, idx: usize) -> *mut MaybeUninit<T> {
        debug_assert!(idx < self.capacity);
        // UnsafeCell<MaybeUninit<T>> is transparent over MaybeUninit<T>.
        unsafe { self.ptr.as_ptr().add(idx).cast::<MaybeUninit<T>>() }
    }
}

impl<T> Drop for SlotBuffer<T> {
    fn drop(&mut self) {
        // Items still in flight are dropped by `Ring::drop`; this only
        // returns the storage.
        let layout = Self::layout(self.capacity);
        if layout.size() != 0 {
            // SAFETY: allocated in `allocate` with the identical layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), layout) };
        }
    }
}

/// Lock-free single-producer single-consumer ring buffer.
///
/// The building block of [`Channel`](crate::Channel): one thread writes
/// through reserve/commit, one thread reads through the `consume_*` family,
/// and the two never contend on a cache line while slack remains.
///
/// The write side is zero-copy: [`reserve_n`](Ring::reserve_n) hands out a
/// [`Reservation`] over uninitialized slots and [`Reservation::commit`]
/// publishes them with a single release store of `tail`.
#[repr(C)]
pub struct Ring<T> {
    producer: ProducerLine,
    consumer: ConsumerLine,
    state: StateLine,
    metrics: Metrics,
    config: Config,
    buffer: SlotBuffer<T>,
}

// SAFETY: the single-writer discipline documented above is what makes the
// UnsafeCell fields and raw slot accesses sound across threads; the type
// itself only moves `T` values between them.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates an empty, open, inactive ring sized by `config`.
    pub fn new(config: Config) -> Self {
        Self {
            producer: ProducerLine {
                tail: AtomicU64::new(0),
                cached_head: UnsafeCell::new(0),
            },
            consumer: ConsumerLine {
                head: AtomicU64::new(0),
                cached_tail: UnsafeCell::new(0),
            },
            state: StateLine {
                active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            metrics: Metrics::new(),
            config,
            buffer: SlotBuffer::allocate(config.capacity()),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.config.mask()
    }

    /// Items currently committed but not consumed. Advisory: both indices are
    /// read relaxed, so the value may be stale the moment it is returned.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.producer.tail.load(Ordering::Relaxed);
        let head = self.consumer.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// True once the producer (or the owning channel) has signalled
    /// end-of-stream. Remaining items stay consumable.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// One-shot end-of-stream signal. Idempotent; never transitions back.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    /// True once the ring has been handed to a producer by registration.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self) {
        self.state.active.store(true, Ordering::Release);
    }

    // --- producer side -----------------------------------------------------

    /// Free slots visible to the producer, refreshing `cached_head` from the
    /// shared index only when the snapshot is too stale to admit `n`.
    #[inline]
    fn free_space(&self, tail: u64, n: usize) -> usize {
        // SAFETY: `cached_head` is read and written only on producer paths,
        // and the ring admits exactly one producer.
        let cached = unsafe { *self.producer.cached_head.get() };
        let space = self
            .capacity()
            .saturating_sub(tail.wrapping_sub(cached) as usize);
        if space >= n {
            return space;
        }

        let head = self.consumer.head.load(Ordering::Acquire);
        // SAFETY: as above. The Acquire load synchronizes with the consumer's
        // Release store of `head`, so every slot below `head` is ours to
        // overwrite.
        unsafe { *self.producer.cached_head.get() = head };
        self.capacity()
            .saturating_sub(tail.wrapping_sub(head) as usize)
    }

    /// Reserves one slot for writing. `None` means the ring is full right
    /// now; backpressure, not an error.
    #[inline]
    pub fn reserve(&self) -> Option<Reservation<'_, T>> {
        self.reserve_n(1)
    }

    /// Reserves up to `n` contiguous slots for zero-copy writing.
    ///
    /// Fails if fewer than `n` slots are free, or if `n` is 0 or exceeds the
    /// capacity. On success the reservation may still cover fewer than `n`
    /// slots: it stops at the buffer's physical end rather than bridging the
    /// wrap. Check [`Reservation::len`] and issue a follow-up reserve for the
    /// remainder after committing.
    ///
    /// Reservations must be committed (or dropped) before the next
    /// `reserve*` call; the producer is a single thread, so the calls are
    /// naturally sequential.
    pub fn reserve_n(&self, n: usize) -> Option<Reservation<'_, T>> {
        if n == 0 || n > self.capacity() {
            return None;
        }

        let tail = self.producer.tail.load(Ordering::Relaxed);
        if self.free_space(tail, n) < n {
            return None;
        }

        let idx = tail as usize & self.mask();
        let contiguous = n.min(self.capacity() - idx);
        Some(Reservation {
            ring: self,
            idx,
            len: contiguous,
        })
    }

    /// [`reserve_n`](Ring::reserve_n) wrapped in an adaptive spin/yield loop.
    /// Gives up once the backoff saturates or the ring closes.
    pub fn reserve_with_backoff(&self, n: usize) -> Option<Reservation<'_, T>> {
        let backoff = Backoff::new();
        loop {
            if let Some(reservation) = self.reserve_n(n) {
                return Some(reservation);
            }
            if self.is_closed() || backoff.is_completed() {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Publishes `n` written slots. Called by [`Reservation`].
    fn publish(&self, n: usize) {
        if n == 0 {
            return;
        }
        let tail = self.producer.tail.load(Ordering::Relaxed);
        let new_tail = tail.wrapping_add(n as u64);
        debug_assert!(
            new_tail.wrapping_sub(self.consumer.head.load(Ordering::Relaxed)) as usize
                <= self.capacity(),
            "commit overruns unconsumed slots"
        );
        self.producer.tail.store(new_tail, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.record_send(n as u64);
        }
    }

    /// Writes a single item, committing immediately. `false` on a full ring.
    #[inline]
    pub fn push(&self, item: T) -> bool {
        match self.reserve() {
            Some(mut reservation) => {
                reservation.as_mut_slice()[0].write(item);
                reservation.commit();
                true
            }
            None => false,
        }
    }

    /// Copies as much of `items` as fits contiguously; returns the count
    /// actually enqueued.
    pub fn send_slice(&self, items: &[T]) -> usize
    where
        T: Copy,
    {
        if items.is_empty() {
            return 0;
        }
        self.reserve_n(items.len()).map_or(0, |mut reservation| {
            let slots = reservation.as_mut_slice();
            let n = slots.len();
            for (slot, item) in slots.iter_mut().zip(items) {
                slot.write(*item);
            }
            reservation.commit();
            n
        })
    }

    // --- consumer side -----------------------------------------------------

    /// Drains every available item in FIFO order, then advances `head` with a
    /// single release store. Returns the number of items handled.
    ///
    /// Each item is moved out of its slot, handed to `handler` by reference,
    /// and dropped afterwards, so payloads with destructors are cleaned up
    /// even when the handler ignores them. A return of 0 means the ring is
    /// currently empty; end-of-stream is `is_closed() && is_empty()`.
    pub fn consume_batch<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        let head = self.consumer.head.load(Ordering::Relaxed);
        let tail = self.producer.tail.load(Ordering::Acquire);

        let avail = tail.wrapping_sub(head) as usize;
        if avail == 0 {
            return 0;
        }

        let mask = self.mask();
        let mut pos = head;
        while pos != tail {
            // SAFETY: slots in [head, tail) were fully written before the
            // producer's Release store of `tail`, which the Acquire load
            // above synchronized with; each slot is moved out exactly once
            // before `head` advances past it.
            let item = unsafe { (*self.buffer.slot(pos as usize & mask)).assume_init_read() };
            handler(&item);
            // `item` drops here; destructors run even if the handler ignored it.
            pos = pos.wrapping_add(1);
        }

        self.consumer.head.store(tail, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.record_recv(avail as u64);
        }
        avail
    }

    /// Like [`consume_batch`](Ring::consume_batch) but handles at most `max`
    /// items, bounding how long the consumer stays inside one call.
    ///
    /// Short polls are amortized through `cached_tail`: the shared `tail` is
    /// re-read (Acquire) only when the snapshot no longer covers `max`.
    pub fn consume_up_to<F>(&self, max: usize, mut handler: F) -> usize
    where
        F: FnMut(&T),
    {
        if max == 0 {
            return 0;
        }

        let head = self.consumer.head.load(Ordering::Relaxed);

        // SAFETY: `cached_tail` is read and written only on consumer paths,
        // and the ring admits exactly one consumer.
        let mut tail = unsafe { *self.consumer.cached_tail.get() };
        if (tail.wrapping_sub(head) as usize) < max {
            tail = self.producer.tail.load(Ordering::Acquire);
            // SAFETY: as above.
            unsafe { *self.consumer.cached_tail.get() = tail };
        }

        let avail = tail.wrapping_sub(head) as usize;
        if avail == 0 {
            return 0;
        }

        let count = avail.min(max);
        let mask = self.mask();
        for offset in 0..count {
            let pos = head.wrapping_add(offset as u64);
            // SAFETY: same publication argument as `consume_batch`; the
            // snapshot in `cached_tail` was itself taken with an Acquire
            // load, so the edge to the producer's Release store holds.
            let item = unsafe { (*self.buffer.slot(pos as usize & mask)).assume_init_read() };
            handler(&item);
        }

        self.consumer
            .head
            .store(head.wrapping_add(count as u64), Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.record_recv(count as u64);
        }
        count
    }

    /// Borrows the contiguous initialized prefix without consuming it.
    ///
    /// The dual of [`reserve_n`](Ring::reserve_n): a zero-copy read view that
    /// stops at the physical end of the buffer. Pair with
    /// [`advance`](Ring::advance) to release the slots. Intended for `Copy`
    /// payloads: advancing past items viewed this way forgets them without
    /// running destructors.
    pub fn readable(&self) -> Option<&[T]> {
        let head = self.consumer.head.load(Ordering::Relaxed);

        // SAFETY: consumer-only field, as in `consume_up_to`.
        let mut tail = unsafe { *self.consumer.cached_tail.get() };
        if tail == head {
            tail = self.producer.tail.load(Ordering::Acquire);
            // SAFETY: as above.
            unsafe { *self.consumer.cached_tail.get() = tail };
            if tail == head {
                return None;
            }
        }

        let idx = head as usize & self.mask();
        let contiguous = (tail.wrapping_sub(head) as usize).min(self.capacity() - idx);
        // SAFETY: the range is initialized and published (see
        // `consume_batch`); the returned borrow keeps the consumer from
        // advancing `head`, and the producer cannot touch slots below `tail`.
        unsafe {
            Some(std::slice::from_raw_parts(
                self.buffer.slot(idx).cast::<T>().cast_const(),
                contiguous,
            ))
        }
    }

    /// Releases `n` slots previously observed through
    /// [`readable`](Ring::readable).
    #[inline]
    pub fn advance(&self, n: usize) {
        if n == 0 {
            return;
        }
        let head = self.consumer.head.load(Ordering::Relaxed);
        let new_head = head.wrapping_add(n as u64);
        debug_assert!(
            new_head <= self.producer.tail.load(Ordering::Relaxed),
            "advancing head past published tail"
        );
        self.consumer.head.store(new_head, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.record_recv(n as u64);
        }
    }

    /// Copies up to `out.len()` items into `out`; returns the count.
    pub fn recv(&self, out: &mut [T]) -> usize
    where
        T: Copy,
    {
        match self.readable() {
            Some(view) => {
                let n = view.len().min(out.len());
                out[..n].copy_from_slice(&view[..n]);
                self.advance(n);
                n
            }
            None => 0,
        }
    }

    /// Counter snapshot; all zeros unless metrics are enabled in the config.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // `&mut self`: no concurrent accessors remain. Drop whatever was
        // committed but never consumed.
        let head = self.consumer.head.load(Ordering::Relaxed);
        let tail = self.producer.tail.load(Ordering::Relaxed);
        let mask = self.mask();

        let mut pos = head;
        while pos != tail {
            // SAFETY: [head, tail) holds initialized items, each dropped once.
            unsafe { (*self.buffer.slot(pos as usize & mask)).assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

/// Exclusive write access to a contiguous run of reserved slots.
///
/// Obtained from [`Ring::reserve`] / [`Ring::reserve_n`]. Write through
/// [`as_mut_slice`](Reservation::as_mut_slice), then call
/// [`commit`](Reservation::commit) to publish. Dropping without committing
/// publishes nothing; the slots are simply handed out again by the next
/// reserve.
#[must_use = "a reservation publishes nothing until committed"]
pub struct Reservation<'a, T> {
    ring: &'a Ring<T>,
    idx: usize,
    len: usize,
}

impl<'a, T> Reservation<'a, T> {
    /// The writable slots. May be shorter than the count requested when the
    /// reservation stops at the buffer's wrap point.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [MaybeUninit<T>] {
        // SAFETY: the reservation covers `len` in-bounds slots past `tail`
        // that the consumer cannot observe until commit, and the single
        // producer holds at most one reservation at a time.
        unsafe { std::slice::from_raw_parts_mut(self.ring.buffer.slot(self.idx), self.len) }
    }

    /// Number of slots reserved (the contiguous count).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Publishes every reserved slot. All of them must have been written.
    #[inline]
    pub fn commit(self) {
        let n = self.len;
        self.commit_n(n);
    }

    /// Publishes the first `n` slots, releasing the rest unwritten.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the reserved count.
    pub fn commit_n(self, n: usize) {
        assert!(n <= self.len, "committing more slots than reserved");
        self.ring.publish(n);
    }
}
