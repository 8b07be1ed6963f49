//! Tally - persistent bucketed count time-series storage.
//!
//! This crate stores streams of `(time, count)` points in fixed-resolution
//! time buckets and answers range queries for the running sum, mean, and
//! variance in O(1) after an index lookup.
//!
//! # Components
//!
//! - [`store::MappedArray`]: growable memory-mapped array of fixed-size
//!   records behind a typed header
//! - [`timeline::Timeline`]: one logical stream, a dense bucket array with
//!   maintained prefix sums plus a sparse temporal index
//! - [`server`]: the line-protocol front-end and the sharded registry of
//!   timelines
//!
//! # Example
//!
//! ```rust,ignore
//! use tally::Timeline;
//!
//! // One timeline per key, rooted in its own directory; 10-unit buckets.
//! let mut timeline = Timeline::from_directory("/var/lib/tally/web.hits", 10)?;
//!
//! timeline.put(100, 2)?;
//! timeline.put(105, 3)?;
//! timeline.put(110, 5)?;
//!
//! let stats = timeline.diff(100, 120, 0);
//! assert_eq!(stats.sum, 10);
//! assert_eq!(stats.mean, 5.0);
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod server;
pub mod store;
pub mod timeline;

pub use error::{Result, TallyError};
pub use timeline::{Bucket, DiffResult, GetResult, SummaryResult, Timeline};
