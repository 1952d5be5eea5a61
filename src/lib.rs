//! # strip-blur
//!
//! Splits an image into vertical strips, blurs each strip in its own worker
//! process, and stitches the results back together. Three transports carry strips
//! between the coordinator and its workers, and all of them produce the same image.
//!
//! ## Crate Structure
//!
//! - **`raster`**: `Shape`, `Image`, and `Strip`, the typed pixel buffers everything
//!   else passes around.
//! - **`partition`**: splits an image into `n` contiguous strips, the last absorbing
//!   the remainder.
//! - **`filter`**: the per-strip transform (Gaussian blur or identity).
//! - **`wire`**: length-checked strip frames for stdin/stdout pipes.
//! - **`transport`**: worker process handles plus the pipe, pool, and shared-memory
//!   transports.
//! - **`shared_buffer`**: the memory-mapped buffer workers write results into,
//!   readable only after every writer has been joined.
//! - **`reassemble`**: concatenates ordered strips into one image.
//! - **`codec`**: image file decode/encode, atomic writes, per-strip saving.
//! - **`pipeline`**: the coordinator tying it all together.
//! - **`worker`**: the worker-process side of every transport.
//! - **`lifecycle`**: turns termination signals into a cancellation token.
//! - **`config`** / **`logging`** / **`error`**: Figment configuration, tracing
//!   setup, and the `StripError` type.

pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod logging;
pub mod partition;
pub mod pipeline;
pub mod raster;
pub mod reassemble;
pub mod shared_buffer;
pub mod transport;
pub mod wire;
pub mod worker;

pub use error::{StripError, StripResult};
pub use pipeline::{Pipeline, RunSummary};
pub use raster::{Image, Shape, Strip};
