//! Memory-mapped fixed-record array storage.
//!
//! A [`MappedArray`] is a growable, file-backed array of fixed-size records
//! behind a small typed header, accessed through a shared memory mapping:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Header                                        │
//! │  - size: u64      (count of valid records)     │
//! │  - meta: M        (caller-defined header word) │
//! ├────────────────────────────────────────────────┤
//! │  Records: R * capacity                         │
//! │  (capacity derived from the file length)       │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! All integers are fixed-width little-endian, so a file written on one run
//! maps identically on the next. The record count is persisted in the first
//! header word rather than derived from the file length, because growth
//! reserves capacity ahead of use.
//!
//! Appends write the record bytes before bumping the persisted size, so a
//! crash mid-append leaves the array at its old size with no partial record
//! visible after reopen.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Result, TallyError};

/// Fixed-size little-endian codec for header words and records.
pub trait Slot: Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Writes the encoded form into `buf`, which is exactly `SIZE` bytes.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes a value from `buf`, which is exactly `SIZE` bytes.
    fn read_from(buf: &[u8]) -> Self;
}

impl Slot for u64 {
    const SIZE: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}

/// A growable memory-mapped array of fixed-size records.
///
/// `M` is the typed meta word stored in the header; `R` is the record type.
/// The array never shrinks. Random access is bounds-checked against the
/// logical size in debug builds.
pub struct MappedArray<M, R> {
    path: PathBuf,
    file: File,
    map: MmapMut,
    len: u64,
    capacity: u64,
    _slots: PhantomData<(M, R)>,
}

impl<M: Slot, R: Slot> MappedArray<M, R> {
    /// Bytes occupied by the header (persisted size word plus meta).
    pub const HEADER_SIZE: usize = 8 + M::SIZE;

    /// Maps the file at `path`, creating it when missing.
    ///
    /// A new file is sized for `initial_capacity` zeroed record slots with a
    /// zeroed meta word and a persisted size of zero. An existing file is
    /// validated: its length must cover the header and divide evenly into
    /// record slots, and the persisted size must fit the derived capacity.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::CorruptArray`] when validation fails, or an I/O
    /// error from the filesystem or mapping layer.
    pub fn open(path: impl AsRef<Path>, initial_capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len == 0 {
            let capacity = initial_capacity.max(1);
            file.set_len(Self::HEADER_SIZE as u64 + capacity * R::SIZE as u64)?;
            let map = unsafe { MmapMut::map_mut(&file)? };
            debug!(path = %path.display(), capacity, "created mapped array");
            let mut array = Self {
                path,
                file,
                map,
                len: 0,
                capacity,
                _slots: PhantomData,
            };
            array.write_len(0);
            return Ok(array);
        }

        let header = Self::HEADER_SIZE as u64;
        if file_len < header || (file_len - header) % R::SIZE as u64 != 0 {
            return Err(TallyError::CorruptArray {
                path,
                reason: format!("file length {file_len} does not match the record layout"),
            });
        }

        let capacity = (file_len - header) / R::SIZE as u64;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let len = u64::from_le_bytes(map[..8].try_into().unwrap());
        if len > capacity {
            return Err(TallyError::CorruptArray {
                path,
                reason: format!("persisted size {len} exceeds capacity {capacity}"),
            });
        }

        Ok(Self {
            path,
            file,
            map,
            len,
            capacity,
            _slots: PhantomData,
        })
    }

    /// Appends a record, growing the file by doubling when the reserved
    /// slots are exhausted.
    pub fn push(&mut self, record: R) -> Result<()> {
        if self.len == self.capacity {
            self.grow()?;
        }
        let at = Self::HEADER_SIZE + self.len as usize * R::SIZE;
        record.write_to(&mut self.map[at..at + R::SIZE]);
        self.write_len(self.len + 1);
        Ok(())
    }

    /// Reads the record at position `i`.
    pub fn get(&self, i: u64) -> R {
        debug_assert!(i < self.len, "index {i} out of bounds (len {})", self.len);
        let at = Self::HEADER_SIZE + i as usize * R::SIZE;
        R::read_from(&self.map[at..at + R::SIZE])
    }

    /// Overwrites the record at position `i`.
    pub fn set(&mut self, i: u64, record: &R) {
        debug_assert!(i < self.len, "index {i} out of bounds (len {})", self.len);
        let at = Self::HEADER_SIZE + i as usize * R::SIZE;
        record.write_to(&mut self.map[at..at + R::SIZE]);
    }

    /// Reads the first record.
    pub fn front(&self) -> R {
        self.get(0)
    }

    /// Reads the last record.
    pub fn back(&self) -> R {
        self.get(self.len - 1)
    }

    /// Number of valid records.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the array holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of reserved record slots.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reads the typed meta word from the header.
    pub fn meta(&self) -> M {
        M::read_from(&self.map[8..8 + M::SIZE])
    }

    /// Overwrites the typed meta word in the header.
    pub fn set_meta(&mut self, meta: &M) {
        meta.write_to(&mut self.map[8..8 + M::SIZE]);
    }

    /// Flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = (self.capacity * 2).max(1);
        self.file
            .set_len(Self::HEADER_SIZE as u64 + new_capacity * R::SIZE as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        debug!(
            path = %self.path.display(),
            capacity = new_capacity,
            "grew mapped array"
        );
        self.capacity = new_capacity;
        Ok(())
    }

    fn write_len(&mut self, len: u64) {
        self.map[..8].copy_from_slice(&len.to_le_bytes());
        self.len = len;
    }
}
