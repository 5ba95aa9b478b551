use std::sync::atomic::{AtomicU64, Ordering};

/// Per-ring traffic counters.
///
/// Updated with relaxed atomics on the hot paths, and only when
/// `Config::enable_metrics` is set; otherwise the counters stay at zero and
/// the branches guarding them are predicted away.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    batches_sent: AtomicU64,
    batches_received: AtomicU64,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_send(&self, items: u64) {
        self.messages_sent.fetch_add(items, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_recv(&self, items: u64) {
        self.messages_received.fetch_add(items, Ordering::Relaxed);
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters out at one instant. Counts taken mid-traffic are
    /// advisory, like `Ring::len`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`Metrics`], summable across rings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub batches_sent: u64,
    pub batches_received: u64,
}

impl MetricsSnapshot {
    pub(crate) fn merge(&mut self, other: MetricsSnapshot) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.batches_sent += other.batches_sent;
        self.batches_received += other.batches_received;
    }
}
