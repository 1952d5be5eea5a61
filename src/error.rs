//! Custom error types for strip-blur.
//!
//! `StripError` is the single error type of the library. It is built with `thiserror`
//! so every fallible operation can use `?`, and the binary wraps it in `anyhow` at the
//! edge.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidPartitionCount`**: a strip count of zero, a count wider than the image,
//!   or nothing to reassemble.
//! - **`WorkerTransport`**: a worker process could not be spawned, died, closed its
//!   channel early, exited non-zero, timed out, or answered with a mismatched frame.
//! - **`PoolLaneFailed`**: a pool worker failed outside any strip exchange, e.g. it
//!   would not start or exited non-zero after serving its share of the queue.
//! - **`ShapeMismatch`**: pixel buffer length or strip dimensions disagree with the
//!   shape they are paired with (including shared-buffer slots).
//! - **`Codec`**: decode/encode failures from the `image` crate, propagated untouched.
//! - **`PoolBatchFailed`**: the aggregate failure of a pool batch. A pool never returns
//!   partial results; the first task error is carried as the source.
//! - **`Protocol`**: a malformed wire frame or shared-buffer header.
//! - **`Config`** / **`Configuration`**: configuration that cannot be read, or that reads
//!   fine but holds invalid values.
//! - **`Io`**: filesystem and pipe I/O.
//! - **`Cancelled`**: the run was interrupted by the lifecycle guard.
//!
//! Partition and shape errors are raised before any process is spawned. Transport
//! errors abort the whole batch; nothing is retried.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type StripResult<T> = std::result::Result<T, StripError>;

/// Errors produced while splitting, transporting, and reassembling strips.
#[derive(Error, Debug)]
pub enum StripError {
    /// Strip count is zero, exceeds the image width, or there is nothing to combine.
    #[error("Invalid partition count {requested} for image width {width}")]
    InvalidPartitionCount {
        /// Requested number of strips.
        requested: usize,
        /// Width of the image being partitioned.
        width: u32,
    },

    /// A worker failed to deliver a complete result.
    #[error("Worker {index} transport error: {reason}")]
    WorkerTransport {
        /// Strip index the worker was responsible for.
        index: usize,
        /// Human readable cause.
        reason: String,
    },

    /// Dimensions or buffer sizes disagree.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// External codec failure.
    #[error("Codec error: {0}")]
    Codec(#[from] image::ImageError),

    /// A pool lane's worker failed while no strip was in flight.
    #[error("Pool lane {lane} failed: {reason}")]
    PoolLaneFailed {
        /// Lane whose worker failed.
        lane: usize,
        /// Human readable cause.
        reason: String,
    },

    /// One task of a pool batch failed, so the batch produced nothing.
    #[error("Pool batch of {total} strips failed: {source}")]
    PoolBatchFailed {
        /// Index of the first strip that failed, when the failure belongs to one.
        index: Option<usize>,
        /// Number of strips in the batch.
        total: usize,
        /// The underlying task error.
        source: Box<StripError>,
    },

    /// Malformed frame or shared-buffer header.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or pipe I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by a termination signal.
    #[error("Run cancelled")]
    Cancelled,
}

impl StripError {
    /// Build a [`StripError::WorkerTransport`] for strip `index`.
    pub fn transport(index: usize, reason: impl Into<String>) -> Self {
        StripError::WorkerTransport {
            index,
            reason: reason.into(),
        }
    }

    /// Strip index this error is attributed to, if any.
    pub fn strip_index(&self) -> Option<usize> {
        match self {
            StripError::WorkerTransport { index, .. } => Some(*index),
            StripError::PoolBatchFailed { index, .. } => *index,
            _ => None,
        }
    }

    /// Whether this error came from the cancellation token rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StripError::Cancelled => true,
            StripError::PoolBatchFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<figment::Error> for StripError {
    fn from(value: figment::Error) -> Self {
        StripError::Config(Box::new(value))
    }
}
