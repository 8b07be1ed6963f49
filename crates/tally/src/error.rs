//! Error and Result types for tally operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

/// The error type for timeline storage operations.
///
/// Operational rejections (a `put` behind the last indexed anchor, or too far
/// back within the slack window) are not errors; they are reported as a
/// `false` return from [`crate::timeline::Timeline::put`].
#[derive(Debug, Error)]
pub enum TallyError {
    /// A timeline cannot have a zero bucket resolution.
    #[error("resolution must be greater than zero")]
    ZeroResolution,

    /// An existing timeline was created with a different resolution.
    #[error("resolution mismatch: timeline has {existing}, requested {requested}")]
    ResolutionMismatch {
        /// Resolution persisted in the index header.
        existing: u64,
        /// Resolution requested by the caller.
        requested: u64,
    },

    /// The timeline root path exists but is not a directory.
    #[error("path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// A mapped file does not match the expected record layout.
    #[error("corrupt array {}: {}", .path.display(), .reason)]
    CorruptArray {
        /// Path of the mapped file.
        path: PathBuf,
        /// What the validation found.
        reason: String,
    },

    /// The engine is shutting down and no longer answers commands.
    #[error("engine is shutting down")]
    Shutdown,

    /// Underlying I/O or mapping error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
