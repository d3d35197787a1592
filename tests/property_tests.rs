//! Property-based tests for the queue and the stream shuffler.
//!
//! Coverage:
//! - Queue: bounded size, counter accounting, monotonic closure
//! - StreamShuffler: permutation property, no duplicates under bound moves,
//!   single-draw uniformity (chi-square with generous tolerance)

use chunkfeed::{OverflowPolicy, Queue, QueueError, StreamShuffler};
use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::HashSet;

// =============================================================================
// Queue: size never exceeds capacity, and the counters account for every
// item: total_put == total_get + total_drop + size.
// =============================================================================

proptest! {
    #[test]
    fn prop_queue_bounded_and_accounted(
        capacity in 1usize..32,
        policy_index in 0usize..3,
        ops in prop::collection::vec(prop::bool::ANY, 1..200),
    ) {
        let policy = [
            OverflowPolicy::Block,
            OverflowPolicy::DropNew,
            OverflowPolicy::KeepNewest,
        ][policy_index];
        let queue = Queue::<u64>::with_policy(capacity, policy);
        let producer = queue.create_producer().unwrap();

        for (i, put_op) in ops.iter().enumerate() {
            if *put_op {
                // Under Block a full queue would deadlock single-threaded;
                // skip the put when no room is left.
                if policy == OverflowPolicy::Block && queue.size() == capacity {
                    continue;
                }
                producer.put(i as u64).unwrap();
            } else if queue.size() > 0 {
                queue.get().unwrap();
            }
            prop_assert!(queue.size() <= capacity,
                "size {} exceeds capacity {}", queue.size(), capacity);
        }

        let counters = queue.counters();
        prop_assert_eq!(
            counters.total_put,
            counters.total_get + counters.total_drop + queue.size() as u64,
            "counter accounting broken: {:?}", counters
        );
    }

    #[test]
    fn prop_queue_closure_is_monotonic(
        items in prop::collection::vec(any::<u64>(), 0..20),
    ) {
        let queue = Queue::<u64>::new(32);
        let producer = queue.create_producer().unwrap();
        producer.put_batch(items.clone()).unwrap();
        queue.close();

        prop_assert!(queue.is_closed());
        prop_assert_eq!(producer.put(99), Err(QueueError::Closed));

        // Closed queues drain their remaining items in order, then fail.
        for expected in &items {
            prop_assert_eq!(queue.get().unwrap(), *expected);
        }
        prop_assert_eq!(queue.get(), Err(QueueError::Closed));
        prop_assert!(queue.is_closed());
    }
}

// =============================================================================
// StreamShuffler: for any fixed interval, one full pass visits every index
// exactly once.
// =============================================================================

proptest! {
    #[test]
    fn prop_shuffler_full_pass_is_permutation(
        seed in any::<u64>(),
        lower in 0u64..1000,
        width in 0u64..300,
    ) {
        let mut shuffler = StreamShuffler::with_rng(SmallRng::seed_from_u64(seed));
        shuffler.reset(lower, lower + width);

        let mut emitted = Vec::new();
        while let Some(value) = shuffler.next() {
            emitted.push(value);
        }
        emitted.sort_unstable();
        prop_assert_eq!(emitted, (lower..lower + width).collect::<Vec<_>>());
    }

    #[test]
    fn prop_shuffler_bound_moves_never_duplicate(
        seed in any::<u64>(),
        initial_width in 1u64..100,
        growth in 0u64..100,
        consumed_before in 0usize..50,
        lower_advance in 0u64..150,
    ) {
        let mut shuffler = StreamShuffler::with_rng(SmallRng::seed_from_u64(seed));
        shuffler.reset(0, initial_width);

        let mut before = Vec::new();
        for _ in 0..consumed_before {
            match shuffler.next() {
                Some(value) => before.push(value),
                None => break,
            }
        }

        let upper = initial_width + growth;
        shuffler.set_upper_bound(upper);
        let lower = lower_advance.min(upper);
        shuffler.set_lower_bound(lower);

        let mut after = Vec::new();
        while let Some(value) = shuffler.next() {
            after.push(value);
        }

        // No value is ever emitted twice.
        let mut all: Vec<u64> = before.iter().chain(after.iter()).copied().collect();
        let emitted_count = all.len();
        all.sort_unstable();
        all.dedup();
        prop_assert_eq!(all.len(), emitted_count, "duplicate emission");

        // Post-move emissions respect the new bounds.
        for &value in &after {
            prop_assert!(value >= lower && value < upper);
        }

        // Every value still in range came out in one of the two phases.
        let seen: HashSet<u64> = before.iter().chain(after.iter()).copied().collect();
        for value in lower..upper {
            prop_assert!(seen.contains(&value), "value {} never emitted", value);
        }
    }
}

// =============================================================================
// Uniformity: with no bound changes, the first draw of a pass is uniform
// over the interval. Chi-square over 10 buckets, generous tolerance.
// =============================================================================

#[test]
fn shuffler_first_draw_is_uniform() {
    const BUCKETS: u64 = 10;
    const DRAWS: u64 = 50_000;

    let mut counts = [0u64; BUCKETS as usize];
    for seed in 0..DRAWS {
        let mut shuffler = StreamShuffler::with_rng(SmallRng::seed_from_u64(seed));
        shuffler.reset(0, BUCKETS);
        counts[shuffler.next().unwrap() as usize] += 1;
    }

    let expected = (DRAWS / BUCKETS) as f64;
    let chi_square: f64 = counts
        .iter()
        .map(|&count| {
            let diff = count as f64 - expected;
            diff * diff / expected
        })
        .sum();
    // 9 degrees of freedom; p = 0.001 critical value is 27.88.
    assert!(chi_square < 27.88, "chi-square too high: {chi_square}");
}
