/// Sizing parameters for rings and channels.
///
/// `ring_bits` fixes each ring's capacity at `1 << ring_bits` slots; the
/// power-of-two shape lets slot indices be computed with a mask instead of a
/// modulo. `max_producers` bounds how many rings a channel allocates up front.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Ring capacity exponent: capacity = `1 << ring_bits`.
    pub ring_bits: u8,
    /// Upper bound on producers a channel will admit.
    pub max_producers: usize,
    /// Collect per-ring send/receive counters (small atomic overhead).
    pub enable_metrics: bool,
}

impl Config {
    /// Builds a configuration, validating the bounds at construction time.
    ///
    /// # Panics
    ///
    /// Panics if `ring_bits` is outside `1..=30` or `max_producers` is outside
    /// `1..=128`. The 30-bit ceiling keeps a single ring allocation within
    /// sane limits on the 64-bit targets this crate addresses.
    pub const fn new(ring_bits: u8, max_producers: usize, enable_metrics: bool) -> Self {
        assert!(ring_bits >= 1 && ring_bits <= 30, "ring_bits must be in 1..=30");
        assert!(
            max_producers >= 1 && max_producers <= 128,
            "max_producers must be in 1..=128"
        );
        Self {
            ring_bits,
            max_producers,
            enable_metrics,
        }
    }

    /// Slots per ring.
    #[inline]
    pub const fn capacity(&self) -> usize {
        1 << self.ring_bits
    }

    /// Mask applied to a monotonic index to obtain a slot index.
    #[inline]
    pub const fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// 4K slots per ring; the whole ring fits comfortably in L2.
    pub const LOW_LATENCY: Config = Config::new(12, 16, false);

    /// 256K slots per ring, 32 producers; sized for saturated batch traffic.
    pub const HIGH_THROUGHPUT: Config = Config::new(18, 32, false);
}

impl Default for Config {
    /// 64K slots per ring, up to 16 producers, metrics off.
    fn default() -> Self {
        Self {
            ring_bits: 16,
            max_producers: 16,
            enable_metrics: false,
        }
    }
}
