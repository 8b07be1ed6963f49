//! Property-based tests for timeline invariants.
//!
//! Uses proptest to drive arbitrary accepted put sequences against a
//! brute-force model, checking the prefix-sum recurrences, index
//! monotonicity, range statistics, and reopen consistency.
//!
//! Generated times stay on the first put's bucket grid (the first put lands
//! exactly on a bucket boundary), so the model can mirror bucket identity
//! without re-deriving the engine's anchor arithmetic. Query endpoints are
//! drawn from materialized bucket times: a range endpoint inside a gap
//! resolves through extrapolated offsets by design and is not a
//! brute-force-comparable query.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tally::Timeline;
use tempfile::TempDir;

const RESOLUTION: u64 = 10;

/// A start time plus `(bucket gap, in-bucket jitter, count)` steps.
fn puts_strategy() -> impl Strategy<Value = (u64, Vec<(u64, u64, u64)>)> {
    (
        (0u64..1_000).prop_map(|s| s * RESOLUTION),
        prop::collection::vec((0u64..4, 0u64..RESOLUTION, 0u64..1_000), 1..60),
    )
}

/// Applies the generated puts to both the timeline and a bucket-time model.
///
/// Every generated put is in order (bucket positions never decrease), so
/// all of them must be accepted.
fn apply(
    start: u64,
    steps: &[(u64, u64, u64)],
    timeline: &mut Timeline,
    model: &mut BTreeMap<u64, u64>,
) {
    let mut bucket = 0u64;
    let mut first = true;
    for &(gap, jitter, count) in steps {
        bucket += gap;
        let jitter = if first { 0 } else { jitter };
        first = false;
        let t = start + bucket * RESOLUTION + jitter;
        assert!(timeline.put(t, count).unwrap(), "in-order put refused at t={t}");
        *model.entry(start + bucket * RESOLUTION).or_insert(0) += count;
    }
}

proptest! {
    /// Prefix sums obey their recurrences and the index stays strictly
    /// increasing after any accepted put sequence.
    #[test]
    fn prop_prefix_sums_and_index_invariants((start, steps) in puts_strategy()) {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();
        let mut model = BTreeMap::new();
        apply(start, &steps, &mut timeline, &mut model);

        let count = timeline.bucket_count();
        prop_assert_eq!(count as usize, model.len());

        let first = timeline.bucket(0);
        prop_assert_eq!(first.integral, first.value);
        prop_assert_eq!(first.second_integral, first.value * first.value);
        for i in 1..count {
            let prev = timeline.bucket(i - 1);
            let bucket = timeline.bucket(i);
            prop_assert_eq!(bucket.integral, prev.integral + bucket.value);
            prop_assert_eq!(
                bucket.second_integral,
                prev.second_integral + bucket.value * bucket.value
            );
        }

        // Materialized bucket values match the model in order.
        for (i, (&time, &value)) in model.iter().enumerate() {
            prop_assert_eq!(timeline.bucket(i as u64).value, value, "bucket at t={}", time);
        }

        // Index entries are strictly increasing in both fields, anchor at
        // position zero, and carry bucket-grid times.
        prop_assert_eq!(timeline.entry(0).pos, 0);
        for i in 1..timeline.entry_count() {
            let prev = timeline.entry(i - 1);
            let entry = timeline.entry(i);
            prop_assert!(entry.time > prev.time);
            prop_assert!(entry.pos > prev.pos);
        }
        for i in 0..timeline.entry_count() {
            let entry = timeline.entry(i);
            let expected = model.keys().nth(entry.pos as usize).copied();
            prop_assert_eq!(Some(entry.time), expected);
        }
    }

    /// `diff` agrees with a brute-force walk over the materialized buckets.
    #[test]
    fn prop_diff_matches_brute_force(
        (start, steps) in puts_strategy(),
        ia in 0usize..64,
        ib in 0usize..64,
        extend in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();
        let mut model = BTreeMap::new();
        apply(start, &steps, &mut timeline, &mut model);

        let times: Vec<u64> = model.keys().copied().collect();
        let last = *times.last().unwrap();
        let a = times[ia % times.len()];
        let b = if extend {
            last + RESOLUTION
        } else {
            times[ib % times.len()]
        };
        let (a, b) = if a > b { (b, a) } else { (a, b) };

        let d = timeline.diff(a, b, 0);
        prop_assert_eq!(d.n, (b - a) / RESOLUTION);

        if d.n == 0 {
            prop_assert_eq!(d.sum, 0);
            return Ok(());
        }

        // The subtraction endpoints resolve to buckets, so the covered
        // range is [a's bucket, b's bucket] inclusive; b beyond the last
        // bucket clamps to it.
        let upper = b.min(last);
        let sum: u64 = model.range(a..=upper).map(|(_, v)| *v).sum();
        let second_sum: u64 = model.range(a..=upper).map(|(_, v)| v * v).sum();
        prop_assert_eq!(d.sum, sum);

        let n = d.n as f64;
        let mean = sum as f64 / n;
        let variance = second_sum as f64 / n - mean * mean;
        prop_assert!((d.mean - mean).abs() < 1e-9);
        prop_assert!((d.variance - variance).abs() < 1e-6);
    }

    /// A put behind the window is refused and leaves every bucket, entry,
    /// and summary statistic unchanged.
    #[test]
    fn prop_refused_put_leaves_state_unchanged(
        (buckets, target) in (60u64..120).prop_flat_map(|b| (Just(b), 0u64..=(b - 60))),
        count in 1u64..1_000,
    ) {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();
        for i in 0..buckets {
            assert!(timeline.put(i * RESOLUTION, 1).unwrap());
        }

        let before: Vec<_> = (0..buckets).map(|i| timeline.bucket(i)).collect();
        let summary_before = timeline.summary();

        // `target` is at least the slack limit behind the end.
        prop_assert!(!timeline.put(target * RESOLUTION, count).unwrap());

        let after: Vec<_> = (0..buckets).map(|i| timeline.bucket(i)).collect();
        prop_assert_eq!(before, after);
        prop_assert_eq!(timeline.summary(), summary_before);
    }

    /// Accumulating twice into one bucket is the same as one combined put.
    #[test]
    fn prop_accumulation_is_additive(
        c1 in 0u64..10_000,
        c2 in 0u64..10_000,
        tail in 0u64..30,
    ) {
        let dir = TempDir::new().unwrap();
        let mut timeline = Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();

        assert!(timeline.put(500, c1).unwrap());
        for i in 1..=tail {
            assert!(timeline.put(500 + i * RESOLUTION, 1).unwrap());
        }
        assert!(timeline.put(500, c2).unwrap());

        let combined = c1 + c2;
        prop_assert_eq!(timeline.bucket(0).value, combined);
        prop_assert_eq!(timeline.bucket(0).integral, combined);
        prop_assert_eq!(timeline.bucket(0).second_integral, combined * combined);
        if tail > 0 {
            prop_assert_eq!(timeline.bucket(tail).integral, combined + tail);
        }
    }

    /// A closed-and-reopened timeline replays the same query results.
    #[test]
    fn prop_reopen_replays_queries((start, steps) in puts_strategy()) {
        let dir = TempDir::new().unwrap();

        let (summary, diff) = {
            let mut timeline =
                Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();
            let mut model = BTreeMap::new();
            apply(start, &steps, &mut timeline, &mut model);
            timeline.flush().unwrap();
            let s = timeline.summary();
            (s, timeline.diff(s.from, s.to, 0))
        };

        let reopened = Timeline::from_directory(dir.path().join("t"), RESOLUTION).unwrap();
        prop_assert_eq!(reopened.summary(), summary);
        prop_assert_eq!(reopened.diff(summary.from, summary.to, 0), diff);
    }
}
