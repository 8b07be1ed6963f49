//! Per-key timeline storage and range statistics.
//!
//! A [`Timeline`] aggregates `(time, count)` points into fixed-resolution
//! buckets and answers range queries for the running sum and variance in
//! O(1) after an index lookup. It composes two memory-mapped arrays rooted
//! in one directory:
//!
//! - `_.d`: the dense bucket array. Each bucket carries its own count plus
//!   two prefix sums: `integral` (sum of counts through this bucket) and
//!   `second_integral` (sum of squared counts through this bucket).
//! - `_.i`: the sparse temporal index of `(time, pos)` anchors; see
//!   [`index`].
//!
//! Range statistics fall out of the prefix sums and the identity
//! `Var(X) = E[X²] − (E[X])²`: subtracting two bucket records yields the sum
//! and the sum of squares over the whole range between them.
//!
//! Integrals are 64-bit and wrap on overflow; the safe operating envelope is
//! `Σ value < 2^64` and `Σ value² < 2^64` over a timeline's life.

pub mod index;

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, TallyError};
use crate::store::{MappedArray, Slot};

use self::index::{IndexEntry, PosResult, TimeIndex};

/// Wall-clock time in caller-defined units (typically seconds).
pub type Time = u64;

/// An unsigned count accumulated into a bucket.
pub type Count = u64;

/// How many buckets back an in-range `put` may reach before it is refused.
///
/// Re-propagating prefix sums costs one pass over the tail, so the window
/// keeps inserts amortized O(1) while giving slow writers a bounded buffer
/// to catch up.
pub const ADD_BUCKET_BACK_LIMIT: u64 = 60;

/// Initial record capacity of a new bucket array.
pub const DATA_SIZE: u64 = 4096;

/// Initial record capacity of a new index.
pub const INDEX_SIZE: u64 = 512;

const INDEX_FILE: &str = "_.i";
const DATA_FILE: &str = "_.d";

/// One time bucket: its accumulated count and the prefix sums through it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    /// Count accumulated in this bucket.
    pub value: u64,
    /// Sum of `value` from bucket 0 through this bucket inclusive.
    pub integral: u64,
    /// Sum of `value²` from bucket 0 through this bucket inclusive.
    pub second_integral: u64,
}

impl Bucket {
    /// The all-zero bucket; stands in for "before the first bucket".
    pub const ZERO: Bucket = Bucket {
        value: 0,
        integral: 0,
        second_integral: 0,
    };

    /// Recomputes both prefix sums from the previous bucket and this
    /// bucket's own `value`, turning a raw bucket into a summed one.
    fn propagate(&mut self, prev: Bucket) {
        let v = self.value;
        self.integral = prev.integral.wrapping_add(v);
        self.second_integral = prev.second_integral.wrapping_add(v.wrapping_mul(v));
    }

    /// Adds `c` to this bucket's count and recomputes its prefix sums.
    fn accumulate(&mut self, prev: Bucket, c: Count) {
        self.value = self.value.wrapping_add(c);
        self.propagate(prev);
    }
}

impl Slot for Bucket {
    const SIZE: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.value.to_le_bytes());
        buf[8..16].copy_from_slice(&self.integral.to_le_bytes());
        buf[16..24].copy_from_slice(&self.second_integral.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            value: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            integral: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            second_integral: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Result of resolving one time to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetResult {
    /// Index entry the lookup landed on; feed into the next call as a hint
    /// when querying in time order.
    pub index_offset: u64,
    /// The caller's query time, unchanged.
    pub query_time: Time,
    /// Anchor time of the run the lookup landed on.
    pub range_time: Time,
    /// Bucket position of that anchor.
    pub pos: u64,
    /// Buckets from the anchor to the resolved bucket, clamped to the end
    /// of the data.
    pub offset: u64,
    /// The resolved bucket; all zero when the query precedes the first
    /// bucket or the timeline is empty.
    pub value: Bucket,
}

/// Range statistics between two times.
///
/// `n` is the bucket count implied by `(to - from) / resolution`; across a
/// gap it exceeds the number of materialized buckets, and `mean` and
/// `variance` are computed against it (missing buckets count as zeros).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffResult {
    /// Effective range start after clamping.
    pub from: Time,
    /// Effective range end after clamping.
    pub to: Time,
    /// Time units per bucket.
    pub resolution: u64,
    /// Index entry the `from` lookup landed on; usable as a hint.
    pub index_offset: u64,
    /// Sum of counts over the range.
    pub sum: u64,
    /// Mean count per bucket.
    pub mean: f64,
    /// Population variance of the per-bucket counts. Rounding can leave it
    /// slightly negative when the true variance is near zero; it is not
    /// clamped.
    pub variance: f64,
    /// Number of buckets in the range.
    pub n: u64,
    /// Subtraction endpoint for the range start (the bucket preceding
    /// `from`, or all-zero at the origin).
    pub a: Bucket,
    /// Subtraction endpoint for the range end.
    pub b: Bucket,
}

/// Statistics over a whole timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryResult {
    /// Time of the first bucket.
    pub from: Time,
    /// End of the last bucket.
    pub to: Time,
    /// Time units per bucket.
    pub resolution: u64,
    /// Sum of all counts.
    pub sum: u64,
    /// Mean count per bucket.
    pub mean: f64,
    /// Population variance of the per-bucket counts.
    pub variance: f64,
    /// Number of buckets between `from` and `to`.
    pub n: u64,
}

/// Subtracts two summed buckets into range statistics.
///
/// Mean is `sum(x) / n`; variance uses the running sum of squares:
/// `variance = sum(x²)/n − (sum(x)/n)²`, the `E[X²] − (E[X])²` identity
/// that makes the query O(1) given the two prefix sums.
fn diff_buckets(
    from: Time,
    to: Time,
    resolution: u64,
    index_offset: u64,
    a: Bucket,
    b: Bucket,
    n: u64,
) -> DiffResult {
    debug_assert!(resolution > 0);
    debug_assert!(n > 0);

    let sum = b.integral.wrapping_sub(a.integral);
    let second_sum = b.second_integral.wrapping_sub(a.second_integral);
    let mean = sum as f64 / n as f64;
    let second_mean = second_sum as f64 / n as f64;
    let variance = second_mean - mean * mean;

    DiffResult {
        from,
        to,
        resolution,
        index_offset,
        sum,
        mean,
        variance,
        n,
        a,
        b,
    }
}

/// One logical stream of counts: a sparse index plus a dense bucket array.
///
/// A timeline is single-writer / multi-reader; the caller serializes `put`
/// against the query methods (readers of a timeline mid-repropagation would
/// observe inconsistent prefix sums).
pub struct Timeline {
    index: TimeIndex,
    data: MappedArray<u64, Bucket>,
}

impl Timeline {
    /// Opens or creates the timeline rooted at `path` with the given bucket
    /// resolution.
    ///
    /// The directory is created when missing; `_.i` is seeded with the
    /// resolution and `_.d` with [`DATA_SIZE`] reserved buckets.
    ///
    /// # Errors
    ///
    /// Fails for a zero resolution, a path that exists but is not a
    /// directory, a resolution differing from the one the timeline was
    /// created with, or mapped files that do not pass validation.
    pub fn from_directory(path: impl AsRef<Path>, resolution: u64) -> Result<Timeline> {
        let path = path.as_ref();
        if resolution == 0 {
            return Err(TallyError::ZeroResolution);
        }

        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(TallyError::NotADirectory(path.to_path_buf()));
        }

        let index = TimeIndex::open(path.join(INDEX_FILE), resolution, INDEX_SIZE)?;
        let data = MappedArray::open(path.join(DATA_FILE), DATA_SIZE)?;

        let timeline = Timeline { index, data };
        timeline.validate()?;

        debug!(
            path = %path.display(),
            resolution,
            buckets = timeline.data.len(),
            "opened timeline"
        );
        Ok(timeline)
    }

    /// Cross-checks the two arrays after opening.
    fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| TallyError::CorruptArray {
            path: self.data.path().to_path_buf(),
            reason,
        };

        if self.index.is_empty() != self.data.is_empty() {
            return Err(corrupt(format!(
                "index has {} entries but data has {} buckets",
                self.index.len(),
                self.data.len()
            )));
        }
        if !self.index.is_empty() {
            let front = self.index.front();
            if front.pos != 0 {
                return Err(corrupt(format!("first index entry at pos {}", front.pos)));
            }
            let back = self.index.back();
            if back.pos >= self.data.len() {
                return Err(corrupt(format!(
                    "last index entry at pos {} beyond {} buckets",
                    back.pos,
                    self.data.len()
                )));
            }
        }
        Ok(())
    }

    /// Incorporates count `c` at time `t`.
    ///
    /// Returns `Ok(false)` when the update is refused: either `t` precedes
    /// the last indexed anchor, or the target bucket lies
    /// [`ADD_BUCKET_BACK_LIMIT`] or more buckets behind the end of the data
    /// (re-propagation would be too expensive). Refused updates leave the
    /// timeline unchanged.
    ///
    /// # Errors
    ///
    /// I/O or mapping failures while appending are fatal to the timeline.
    pub fn put(&mut self, t: Time, c: Count) -> Result<bool> {
        // Empty timeline: seed the first bucket and its anchor.
        if self.index.is_empty() {
            debug_assert_eq!(self.data.len(), 0);

            let mut first = Bucket {
                value: c,
                ..Bucket::ZERO
            };
            first.propagate(Bucket::ZERO);
            self.data.push(first)?;
            self.index.push(IndexEntry { time: t, pos: 0 })?;
            return Ok(true);
        }

        // Never accept updates behind the last anchor; this caps how much
        // history a misbehaving writer can force us to re-propagate.
        if t < self.index.back().time {
            return Ok(false);
        }

        // Only the last run is consulted, to keep the insert path flat.
        let p = self
            .index
            .find_pos_in_range(t, self.index.len() - 1, self.index.len());
        let pos = p.pos + p.offset;

        if pos < self.data.len() {
            // The bucket exists. Refuse if it is too far back, otherwise
            // fold the count in and re-propagate the tail.
            if self.data.len() - pos >= ADD_BUCKET_BACK_LIMIT {
                return Ok(false);
            }

            let prev = if pos > 0 {
                self.data.get(pos - 1)
            } else {
                Bucket::ZERO
            };
            let mut current = self.data.get(pos);
            current.accumulate(prev, c);
            self.data.set(pos, &current);

            for i in pos + 1..self.data.len() {
                let prev = self.data.get(i - 1);
                let mut bucket = self.data.get(i);
                bucket.propagate(prev);
                self.data.set(i, &bucket);
            }
        } else {
            // Past the end: append a new bucket, and a new anchor if the
            // append crossed a gap.
            let last_pos = self.data.len() - 1;
            let prev = self.data.get(last_pos);

            let mut current = Bucket {
                value: c,
                ..Bucket::ZERO
            };
            current.propagate(prev);
            self.data.push(current)?;

            let new_pos = last_pos + 1;
            if pos != new_pos {
                let resolution = self.index.resolution();
                let aliased_time = p.time + p.offset * resolution;
                debug_assert!(aliased_time <= t);
                self.index.push(IndexEntry {
                    time: aliased_time,
                    pos: new_pos,
                })?;
            }
        }

        Ok(true)
    }

    /// Resolves `t` to a bucket.
    ///
    /// Queries past the end of the data are clamped to the last bucket;
    /// queries before the first bucket (and queries against an empty
    /// timeline) resolve to a zero bucket. Pass a previous result's
    /// `index_offset` as the hint when querying in time order.
    pub fn get(&self, t: Time, hint: u64) -> GetResult {
        if self.data.is_empty() {
            return GetResult {
                index_offset: 0,
                query_time: t,
                range_time: t,
                pos: 0,
                offset: 0,
                value: Bucket::ZERO,
            };
        }

        let mut p = self.index.find_pos(t, hint);
        self.clamp(&mut p);

        let before_beginning = t < p.time;
        let value = if before_beginning {
            Bucket::ZERO
        } else {
            self.data.get(p.pos + p.offset)
        };

        GetResult {
            index_offset: p.index_offset,
            query_time: t,
            range_time: p.time,
            pos: p.pos,
            offset: p.offset,
            value,
        }
    }

    /// Keeps a resolved position inside the data array.
    fn clamp(&self, p: &mut PosResult) {
        let size = self.data.len();
        debug_assert!(p.pos < size);
        if p.pos + p.offset >= size {
            p.offset = size - p.pos - 1;
        }
    }

    /// Range statistics over `[a, b]`.
    ///
    /// Endpoints are normalized (`a` and `b` swap when reversed) and then
    /// clamped to what the data supports; a range that collapses to zero
    /// buckets returns a zero-count result with the endpoint buckets
    /// attached. The range includes `a`'s own bucket: the subtraction
    /// endpoint on the `a` side is the bucket preceding `a`'s position, with
    /// the zero bucket standing in at the origin.
    pub fn diff(&self, a: Time, b: Time, hint: u64) -> DiffResult {
        let resolution = self.index.resolution();
        debug_assert!(resolution > 0);

        let (a, b) = if a > b { (b, a) } else { (a, b) };
        if self.data.is_empty() {
            return DiffResult {
                from: a,
                to: b,
                resolution,
                index_offset: 0,
                sum: 0,
                mean: 0.0,
                variance: 0.0,
                n: 0,
                a: Bucket::ZERO,
                b: Bucket::ZERO,
            };
        }

        let ar = self.get(a, hint);
        let br = self.get(b, hint);

        let to = br.query_time.max(br.range_time);
        let from = ar.query_time.min(to);

        let n = (to - from) / resolution;
        if n == 0 {
            return DiffResult {
                from,
                to,
                resolution,
                index_offset: 0,
                sum: 0,
                mean: 0.0,
                variance: 0.0,
                n: 0,
                a: ar.value,
                b: br.value,
            };
        }

        let a_bucket = if a < ar.range_time {
            // Before the first bucket: everything from the origin counts.
            Bucket::ZERO
        } else if a >= self.last_bucket_time().saturating_add(resolution) {
            // Past the last bucket: nothing in [a, b] is materialized, so
            // subtract the clamped bucket from itself.
            ar.value
        } else if ar.pos + ar.offset == 0 {
            Bucket::ZERO
        } else {
            self.data.get(ar.pos + ar.offset - 1)
        };

        debug_assert!(ar.index_offset <= br.index_offset);
        diff_buckets(from, to, resolution, ar.index_offset, a_bucket, br.value, n)
    }

    /// Statistics over the whole timeline.
    ///
    /// Equivalent to `diff(first bucket time, end of last bucket)`; the
    /// subtraction endpoint on the `from` side is the zero bucket, so the
    /// sum spans all data.
    pub fn summary(&self) -> SummaryResult {
        let resolution = self.index.resolution();
        debug_assert!(resolution > 0);

        if self.index.is_empty() {
            return SummaryResult {
                from: 0,
                to: 0,
                resolution,
                sum: 0,
                mean: 0.0,
                variance: 0.0,
                n: 0,
            };
        }

        let front = self.index.front();
        let back = self.index.back();

        let from = front.time;
        let last_buckets = self.data.len() - back.pos;
        let to = back.time + last_buckets * resolution;
        let n = (to - from) / resolution;

        let diff = diff_buckets(
            from,
            to,
            resolution,
            0,
            Bucket::ZERO,
            self.data.back(),
            n,
        );

        SummaryResult {
            from,
            to,
            resolution,
            sum: diff.sum,
            mean: diff.mean,
            variance: diff.variance,
            n,
        }
    }

    /// Time units per bucket.
    pub fn resolution(&self) -> u64 {
        self.index.resolution()
    }

    /// Number of materialized buckets.
    pub fn bucket_count(&self) -> u64 {
        self.data.len()
    }

    /// Reads the bucket at `pos`.
    pub fn bucket(&self, pos: u64) -> Bucket {
        self.data.get(pos)
    }

    /// Number of index entries.
    pub fn entry_count(&self) -> u64 {
        self.index.len()
    }

    /// Reads the index entry at `i`.
    pub fn entry(&self, i: u64) -> IndexEntry {
        self.index.get(i)
    }

    /// Whether the timeline holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time of the last materialized bucket.
    ///
    /// Meaningless on an empty timeline (debug-asserted).
    pub fn last_bucket_time(&self) -> Time {
        debug_assert!(!self.index.is_empty());
        let back = self.index.back();
        back.time + (self.data.len() - 1 - back.pos) * self.index.resolution()
    }

    /// Flushes both mappings to disk.
    pub fn flush(&self) -> Result<()> {
        self.index.flush()?;
        self.data.flush()
    }
}
