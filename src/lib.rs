//! fanin: a lock-free multi-producer single-consumer channel built from
//! per-producer SPSC rings.
//!
//! Instead of arbitrating producers over one shared queue, the channel hands
//! each registered producer a private single-producer single-consumer ring
//! buffer. Producers therefore never contend with each other at all; the only
//! synchronization in the system is the release/acquire pair between each
//! producer and the one consumer that sweeps the rings.
//!
//! What keeps the hot path fast:
//!
//! - monotonic 64-bit indices, masked only at slot access, so full and empty
//!   never alias;
//! - producer and consumer state on disjoint 128-byte lines, with each side
//!   holding a private snapshot of the peer's index so the common case never
//!   touches the peer's line;
//! - a zero-copy reserve/commit write path and a batch consume path that
//!   publishes one `head` update per sweep, however many items it handled.
//!
//! Ordering is FIFO per producer; the channel deliberately imposes no order
//! across producers.
//!
//! # Example
//!
//! ```
//! use fanin::{Channel, Config};
//!
//! let channel = Channel::<u64>::new(Config::default());
//! let producer = channel.register().unwrap();
//!
//! // Single-value sends; `false` would mean the ring is full.
//! assert!(producer.send(1));
//! assert!(producer.send(2));
//!
//! // Zero-copy batch: reserve, write in place, commit.
//! let mut reservation = producer.reserve_n(2).unwrap();
//! reservation.as_mut_slice()[0].write(3);
//! reservation.as_mut_slice()[1].write(4);
//! reservation.commit();
//!
//! let mut received = Vec::new();
//! let consumed = channel.consume_all(|item: &u64| received.push(*item));
//! assert_eq!(consumed, 4);
//! assert_eq!(received, [1, 2, 3, 4]);
//! ```
//!
//! Backpressure is a return value, not an error: `reserve*` yields `None`
//! and `send` yields `false` when a ring is momentarily full. Pause (spin
//! hint or [`Ring::reserve_with_backoff`]) and retry. End-of-stream is the
//! pair `is_closed() && is_empty()` per ring, or
//! [`Channel::is_drained`] across the whole channel.

mod channel;
mod config;
mod metrics;
mod ring;

pub use channel::{Channel, ChannelError, Producer};
pub use config::Config;
pub use metrics::{Metrics, MetricsSnapshot};
pub use ring::{Reservation, Ring};
