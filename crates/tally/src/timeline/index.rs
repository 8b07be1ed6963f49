//! Sparse temporal index over the bucket array.
//!
//! The index maps wall-clock times to positions in the dense bucket array.
//! Each entry anchors a contiguous run of buckets; within a run the bucket at
//! position `p` covers time `entry.time + (p - entry.pos) * resolution`. A
//! gap in time between adjacent runs is expressed purely by non-contiguous
//! entries; no zero buckets are materialized.
//!
//! Entries are strictly increasing in both `time` and `pos`, which makes the
//! lookup a binary search that callers can accelerate with a hint from a
//! previous lookup.

use std::path::Path;

use crate::error::{Result, TallyError};
use crate::store::{MappedArray, Slot};
use crate::timeline::Time;

/// One index entry: the wall-clock time of the first bucket in a run and the
/// position of that bucket in the data array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// First-bucket time of the run this entry anchors.
    pub time: Time,
    /// Bucket position where the run begins.
    pub pos: u64,
}

impl Slot for IndexEntry {
    const SIZE: usize = 16;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8..16].copy_from_slice(&self.pos.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            time: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            pos: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Index header: the number of time units per bucket, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    /// Time units per bucket; always greater than zero.
    pub resolution: u64,
}

impl Slot for IndexMeta {
    const SIZE: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.resolution.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            resolution: u64::from_le_bytes(buf[..8].try_into().unwrap()),
        }
    }
}

/// Result of resolving a time against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosResult {
    /// Index of the entry that anchors the run covering the queried time.
    pub index_offset: u64,
    /// Anchor time of that entry.
    pub time: Time,
    /// Bucket position of that entry.
    pub pos: u64,
    /// Buckets from the anchor to the bucket containing the queried time;
    /// zero when the queried time precedes the anchor.
    pub offset: u64,
}

/// The sparse temporal index backing one timeline.
pub struct TimeIndex {
    entries: MappedArray<IndexMeta, IndexEntry>,
}

impl TimeIndex {
    /// Opens or creates the index file, seeding the resolution on creation.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::ZeroResolution`] for a zero resolution and
    /// [`TallyError::ResolutionMismatch`] when reopening an index that was
    /// created with a different resolution.
    pub fn open(path: impl AsRef<Path>, resolution: u64, initial_capacity: u64) -> Result<Self> {
        if resolution == 0 {
            return Err(TallyError::ZeroResolution);
        }

        let mut entries: MappedArray<IndexMeta, IndexEntry> =
            MappedArray::open(path, initial_capacity)?;
        let meta = entries.meta();
        if meta.resolution == 0 {
            entries.set_meta(&IndexMeta { resolution });
        } else if meta.resolution != resolution {
            return Err(TallyError::ResolutionMismatch {
                existing: meta.resolution,
                requested: resolution,
            });
        }

        Ok(Self { entries })
    }

    /// Time units per bucket.
    pub fn resolution(&self) -> u64 {
        self.entries.meta().resolution
    }

    /// Locates the bucket position for `t`, starting the search at entry
    /// `hint`.
    ///
    /// The hint is a monotone accelerator: any hint at or below the answer
    /// yields the same result, so a caller replaying queries in time order
    /// can feed each result's `index_offset` into the next call. A time
    /// before the first searched entry resolves to that entry with a zero
    /// offset; a time past the last entry extrapolates without checking the
    /// data array's length (the timeline clamps).
    pub fn find_pos(&self, t: Time, hint: u64) -> PosResult {
        debug_assert!(!self.entries.is_empty(), "find_pos on an empty index");
        let end = self.entries.len();
        let begin = hint.min(end - 1);
        self.find_pos_in_range(t, begin, end)
    }

    /// [`Self::find_pos`] restricted to entries `[begin, end)`.
    ///
    /// The put hot path passes `begin = len() - 1` so only the last run is
    /// ever consulted.
    pub fn find_pos_in_range(&self, t: Time, begin: u64, end: u64) -> PosResult {
        debug_assert!(begin < end && end <= self.entries.len());

        // Binary search for the first entry with time > t; the answer is the
        // entry before it, clamped to the start of the searched range.
        let mut lo = begin;
        let mut hi = end;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entries.get(mid).time <= t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let at = if lo > begin { lo - 1 } else { begin };
        let entry = self.entries.get(at);
        let offset = if t > entry.time {
            (t - entry.time) / self.resolution()
        } else {
            0
        };

        PosResult {
            index_offset: at,
            time: entry.time,
            pos: entry.pos,
            offset,
        }
    }

    /// Appends an entry; entries must arrive strictly increasing in both
    /// fields.
    pub fn push(&mut self, entry: IndexEntry) -> Result<()> {
        debug_assert!(
            self.entries.is_empty() || {
                let back = self.entries.back();
                entry.time > back.time && entry.pos > back.pos
            },
            "index entries must be strictly increasing"
        );
        self.entries.push(entry)
    }

    /// Reads the first entry.
    pub fn front(&self) -> IndexEntry {
        self.entries.front()
    }

    /// Reads the last entry.
    pub fn back(&self) -> IndexEntry {
        self.entries.back()
    }

    /// Reads the entry at `i`.
    pub fn get(&self, i: u64) -> IndexEntry {
        self.entries.get(i)
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.entries.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.entries.flush()
    }
}
