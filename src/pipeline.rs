//! Coordinator: split, transport, reassemble.
//!
//! ```text
//! decode ─► split(n) ─► transport (pipe | pool | shared) ─► [shared round trip]
//!        ─► [save strips] ─► combine ─► encode
//! ```
//!
//! All waits observe one [`CancellationToken`]. Cancellation before the final
//! encode means no output file is written.

use crate::codec;
use crate::config::BlurConfig;
use crate::error::{StripError, StripResult};
use crate::partition::split;
use crate::raster::{Image, Strip};
use crate::reassemble::combine;
use crate::shared_buffer::SharedLayout;
use crate::transport::{self, shared, TransportKind, TransportOptions, WorkerCommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

/// What one run did, logged when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Transport that carried the strips.
    pub transport: TransportKind,
    /// Width of every strip, in index order.
    pub strip_widths: Vec<u32>,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Whether results were also passed through a shared buffer.
    pub round_trip_shared: bool,
    /// Strip files written, if any.
    pub saved_strips: Vec<PathBuf>,
    /// Wall time from split to combine.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Emit the summary as one structured event.
    pub fn log(&self) {
        info!(
            transport = %self.transport,
            strips = self.strip_widths.len(),
            widths = ?self.strip_widths,
            width = self.width,
            height = self.height,
            round_trip_shared = self.round_trip_shared,
            saved = self.saved_strips.len(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Run complete"
        );
    }
}

/// Configured coordinator.
pub struct Pipeline {
    config: BlurConfig,
    command: WorkerCommand,
    options: TransportOptions,
}

impl Pipeline {
    /// Validate `config` and resolve the worker command from it.
    pub fn new(config: BlurConfig) -> StripResult<Self> {
        let command = config.worker_command()?;
        Self::with_command(config, command)
    }

    /// Like [`Pipeline::new`] but with an explicit worker command.
    pub fn with_command(config: BlurConfig, command: WorkerCommand) -> StripResult<Self> {
        config.validate()?;
        let options = config.transport_options();
        Ok(Self {
            config,
            command,
            options,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &BlurConfig {
        &self.config
    }

    /// Run already-split strips through the configured transport.
    pub async fn process_strips(
        &self,
        strips: Vec<Strip>,
        cancel: &CancellationToken,
    ) -> StripResult<Vec<Strip>> {
        let kind = self.config.pipeline.transport;
        let round_trip = self.config.pipeline.round_trip_shared && kind != TransportKind::Shared;
        if round_trip {
            // Filtering keeps strip shapes, so the round-trip layout can be checked now.
            SharedLayout::for_strips(&strips, self.options.layout)?;
        }

        let results = transport::process(kind, strips, &self.command, &self.options, cancel).await?;
        if round_trip {
            return shared::round_trip(results, &self.options, cancel).await;
        }
        Ok(results)
    }

    /// Blur `image` strip by strip and put it back together.
    pub async fn process(
        &self,
        image: &Image,
        cancel: &CancellationToken,
    ) -> StripResult<(Image, RunSummary)> {
        let pipeline = &self.config.pipeline;
        let span = info_span!(
            "pipeline",
            width = image.width(),
            height = image.height(),
            strips = pipeline.strips,
            transport = %pipeline.transport
        );

        async move {
            let started = Instant::now();
            let strips = split(image, pipeline.strips)?;
            let strip_widths = strips.iter().map(Strip::width).collect();

            let results = self.process_strips(strips, cancel).await?;

            let output = &self.config.output;
            let saved_strips = if output.save_strips {
                codec::save_strips(&results, &output.strip_prefix, &output.strip_extension)?
            } else {
                Vec::new()
            };

            let combined = combine(&results)?;
            let summary = RunSummary {
                transport: pipeline.transport,
                strip_widths,
                width: combined.width(),
                height: combined.height(),
                round_trip_shared: pipeline.round_trip_shared,
                saved_strips,
                elapsed: started.elapsed(),
            };
            Ok((combined, summary))
        }
        .instrument(span)
        .await
    }

    /// Decode `input`, process it, and encode the result to `output`.
    pub async fn run_file(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> StripResult<RunSummary> {
        let source = input.to_path_buf();
        let image = blocking(move || codec::decode(&source)).await?;
        info!(input = %input.display(), width = image.width(), height = image.height(), "Input loaded");

        let (combined, summary) = self.process(&image, cancel).await?;
        if cancel.is_cancelled() {
            return Err(StripError::Cancelled);
        }

        let target = output.to_path_buf();
        blocking(move || codec::encode(&combined, &target)).await?;
        info!(output = %output.display(), "Output written");
        summary.log();
        Ok(summary)
    }
}

async fn blocking<T, F>(f: F) -> StripResult<T>
where
    F: FnOnce() -> StripResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StripError::Io(std::io::Error::other(e)))?
}
