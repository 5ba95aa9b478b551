use fanin::{Channel, ChannelError, Config};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

/// One producer streams a million sequential values; the consumer must see
/// them in order, then observe closed + empty and stop.
#[test]
fn spsc_million_in_order() {
    const N: u64 = 1_000_000;
    const BATCH: usize = 4096;

    let channel = Arc::new(Channel::<u64>::new(Config::default()));
    let ch = Arc::clone(&channel);

    let producer_handle = thread::spawn(move || {
        let producer = ch.register().unwrap();
        let mut sent = 0u64;
        while sent < N {
            let want = BATCH.min((N - sent) as usize);
            if let Some(mut r) = producer.reserve_n(want) {
                let slots = r.as_mut_slice();
                for (i, slot) in slots.iter_mut().enumerate() {
                    slot.write(sent + i as u64);
                }
                let n = slots.len();
                r.commit();
                sent += n as u64;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.close();
    });

    let mut expected = 0u64;
    loop {
        let consumed = channel.consume_all(|item| {
            assert_eq!(*item, expected, "out-of-order delivery");
            expected += 1;
        });
        if consumed == 0 {
            if channel.is_drained() && channel.producer_count() == 1 {
                break;
            }
            std::hint::spin_loop();
        }
    }

    assert_eq!(expected, N);
    producer_handle.join().unwrap();
}

/// Four producers, a quarter million values each; FIFO must hold per ring
/// and every value must arrive exactly once.
#[test]
fn four_producers_fifo_per_ring() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: u64 = 250_000;

    let channel = Arc::new(Channel::<(usize, u64)>::new(Config::default()));

    let mut handles = Vec::new();
    for _ in 0..PRODUCERS {
        let ch = Arc::clone(&channel);
        handles.push(thread::spawn(move || {
            let producer = ch.register().unwrap();
            let id = producer.id();
            for value in 0..PER_PRODUCER {
                while !producer.send((id, value)) {
                    std::hint::spin_loop();
                }
            }
            producer.close();
        }));
    }

    let ch = Arc::clone(&channel);
    let consumer = thread::spawn(move || {
        let mut next_expected = [0u64; PRODUCERS];
        let mut total = 0usize;
        loop {
            let consumed = ch.consume_all(|&(id, value)| {
                assert_eq!(
                    value, next_expected[id],
                    "ring {id} broke FIFO: got {value}, wanted {}",
                    next_expected[id]
                );
                next_expected[id] += 1;
            });
            total += consumed;
            if consumed == 0 {
                if ch.producer_count() == PRODUCERS && ch.is_drained() {
                    break;
                }
                thread::yield_now();
            }
        }
        (total, next_expected)
    });

    for handle in handles {
        handle.join().unwrap();
    }
    let (total, next_expected) = consumer.join().unwrap();

    assert_eq!(total, PRODUCERS * PER_PRODUCER as usize);
    assert_eq!(next_expected, [PER_PRODUCER; PRODUCERS]);
}

/// Small ring, slow consumer: the producer rides backpressure the whole way
/// and nothing is lost or duplicated.
#[test]
fn backpressure_loop_delivers_everything() {
    const N: u64 = 10_000;

    // 1024 slots.
    let channel = Arc::new(Channel::<u64>::new(Config::new(10, 1, false)));
    let ch = Arc::clone(&channel);

    let producer_handle = thread::spawn(move || {
        let producer = ch.register().unwrap();
        for value in 0..N {
            while !producer.send(value) {
                std::hint::spin_loop();
            }
        }
        producer.close();
    });

    let mut expected = 0u64;
    let mut polls = 0u32;
    loop {
        let consumed = channel.consume_all_up_to(64, |item| {
            assert_eq!(*item, expected);
            expected += 1;
        });
        polls += 1;
        if polls % 32 == 0 {
            // Artificial consumer delay to keep the ring saturated.
            thread::sleep(Duration::from_micros(200));
        }
        if consumed == 0 && channel.is_drained() && channel.producer_count() == 1 {
            break;
        }
    }

    assert_eq!(expected, N);
    producer_handle.join().unwrap();
}

/// Five racing registrations against a ceiling of four: exactly one loser,
/// distinct ring ids for the winners, and a counter that settles at four.
#[test]
fn registration_ceiling_under_race() {
    const ATTEMPTS: usize = 5;

    let channel = Arc::new(Channel::<u64>::new(Config::new(4, 4, false)));
    let barrier = Arc::new(Barrier::new(ATTEMPTS));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..ATTEMPTS {
        let ch = Arc::clone(&channel);
        let barrier = Arc::clone(&barrier);
        let outcomes = Arc::clone(&outcomes);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let outcome = ch.register().map(|p| p.id());
            outcomes.lock().unwrap().push(outcome);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let outcomes = outcomes.lock().unwrap();
    let mut ids: Vec<usize> = outcomes.iter().filter_map(|o| o.as_ref().ok().copied()).collect();
    let failures: Vec<&ChannelError> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();

    ids.sort_unstable();
    assert_eq!(ids, [0, 1, 2, 3]);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0], &ChannelError::TooManyProducers { max: 4 });
    assert_eq!(channel.producer_count(), 4);
}

/// Values committed before the consumer ever runs survive the close and are
/// all delivered before end-of-stream is reported.
#[test]
fn close_before_drain_keeps_items() {
    let channel = Channel::<u64>::new(Config::default());
    let producer = channel.register().unwrap();

    for value in 0..100 {
        assert!(producer.send(value));
    }
    producer.close();
    assert!(!channel.is_drained());

    let mut seen = Vec::new();
    let consumed = channel.consume_all(|item| seen.push(*item));
    assert_eq!(consumed, 100);
    assert_eq!(seen, (0..100).collect::<Vec<u64>>());
    assert!(channel.is_drained());
    assert_eq!(channel.consume_all(|_| {}), 0);
}

/// Channel-level close flips every registered ring and refuses late
/// registrations; producers observe the close through their handles.
#[test]
fn channel_close_cascades() {
    let channel = Channel::<u64>::new(Config::new(4, 8, false));
    let producers: Vec<_> = (0..3).map(|_| channel.register().unwrap()).collect();
    assert!(producers[1].send(42));

    channel.close();

    assert!(channel.is_closed());
    for producer in &producers {
        assert!(producer.is_closed());
    }
    assert_eq!(channel.register().unwrap_err(), ChannelError::Closed);

    // The committed item still drains after the cascade.
    let mut seen = Vec::new();
    channel.consume_all(|item| seen.push(*item));
    assert_eq!(seen, [42]);
    assert!(channel.is_drained());
}

/// Saturation stress: eight producers hammering while the consumer sweeps.
#[test]
fn concurrent_stress_checksums() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: u64 = 50_000;

    let channel = Arc::new(Channel::<u64>::new(Config::new(12, PRODUCERS, false)));

    let mut handles = Vec::new();
    for _ in 0..PRODUCERS {
        let ch = Arc::clone(&channel);
        handles.push(thread::spawn(move || {
            let producer = ch.register().unwrap();
            for value in 0..PER_PRODUCER {
                loop {
                    if let Some(mut r) = producer.reserve() {
                        r.as_mut_slice()[0].write(value);
                        r.commit();
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }));
    }

    let ch = Arc::clone(&channel);
    let consumer = thread::spawn(move || {
        let target = PRODUCERS * PER_PRODUCER as usize;
        let mut total = 0usize;
        let mut sum = 0u64;
        while total < target {
            let consumed = ch.consume_all(|item| sum += *item);
            total += consumed;
            if consumed == 0 {
                thread::yield_now();
            }
        }
        (total, sum)
    });

    for handle in handles {
        handle.join().unwrap();
    }
    let (total, sum) = consumer.join().unwrap();

    let per_producer_sum: u64 = (0..PER_PRODUCER).sum();
    assert_eq!(total, PRODUCERS * PER_PRODUCER as usize);
    assert_eq!(sum, per_producer_sum * PRODUCERS as u64);
}
