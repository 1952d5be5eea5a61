//! Worker-process side of every transport.
//!
//! A worker is this same executable started with the hidden `worker` subcommand.
//! It reads strip frames from stdin and, depending on how it was started, either
//! answers each one with a filtered frame on stdout (pipe and pool transports) or
//! filters a single strip into its slot of a shared buffer (shared transport).
//!
//! Stdout carries frames only. Everything the worker logs goes to stderr.

use crate::error::{StripError, StripResult};
use crate::filter::{apply_filter, FilterKind, FilterSpec, DEFAULT_SIGMA};
use crate::raster::Strip;
use crate::shared_buffer::SlotWriter;
use crate::wire::{read_strip, write_strip};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Arguments of the hidden `worker` subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct WorkerArgs {
    /// Transform to apply
    #[arg(long, value_enum, default_value_t = FilterKind::Gaussian)]
    pub filter: FilterKind,

    /// Gaussian sigma
    #[arg(long, default_value_t = DEFAULT_SIGMA)]
    pub sigma: f32,

    /// Shared buffer to write the result into instead of stdout
    #[arg(long, requires = "slot")]
    pub shared: Option<PathBuf>,

    /// Slot of the shared buffer owned by this worker
    #[arg(long, requires = "shared")]
    pub slot: Option<usize>,

    /// Log level for worker diagnostics
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl WorkerArgs {
    /// Filter described by these arguments.
    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            kind: self.filter,
            sigma: self.sigma,
        }
    }
}

/// Answer every incoming frame with its filtered counterpart until end-of-stream.
///
/// Returns the number of strips served.
pub async fn serve<R, W>(reader: &mut R, writer: &mut W, filter: FilterSpec) -> StripResult<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut served = 0;
    while let Some(strip) = read_strip(reader).await? {
        let index = strip.index;
        let filtered = filter_blocking(filter, strip).await?;
        write_strip(writer, &filtered).await?;
        served += 1;
        debug!(index, served, "Strip served");
    }
    Ok(served)
}

/// Filter exactly one incoming strip into `slot` of the shared buffer at `path`.
pub async fn serve_shared<R>(
    reader: &mut R,
    filter: FilterSpec,
    path: &Path,
    slot: usize,
) -> StripResult<()>
where
    R: AsyncRead + Unpin,
{
    let strip = read_strip(reader)
        .await?
        .ok_or_else(|| StripError::Protocol(format!("no strip arrived for slot {slot}")))?;

    let mut writer = SlotWriter::open(path, slot)?;
    let expected = writer.shape()?;
    if strip.shape() != expected {
        return Err(StripError::ShapeMismatch(format!(
            "strip {} is {}, slot {} holds {}",
            strip.index,
            strip.shape(),
            slot,
            expected
        )));
    }

    let filtered = filter_blocking(filter, strip).await?;
    writer.store(&filtered.image)?;
    debug!(slot, "Strip written to shared buffer");
    Ok(())
}

/// Run the worker on the process's own stdin and stdout.
pub async fn run(args: &WorkerArgs) -> StripResult<()> {
    let filter = args.filter_spec();
    let mut stdin = tokio::io::stdin();
    match (&args.shared, args.slot) {
        (Some(path), Some(slot)) => serve_shared(&mut stdin, filter, path, slot).await,
        _ => {
            let mut stdout = tokio::io::stdout();
            let served = serve(&mut stdin, &mut stdout, filter).await?;
            info!(served, "Worker input closed");
            Ok(())
        }
    }
}

/// Blurring is CPU-bound; keep it off the reactor threads.
async fn filter_blocking(filter: FilterSpec, strip: Strip) -> StripResult<Strip> {
    let index = strip.index;
    tokio::task::spawn_blocking(move || apply_filter(&filter, &strip))
        .await
        .map_err(|err| StripError::transport(index, format!("filter task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::split;
    use crate::raster::tests::gradient;
    use crate::shared_buffer::{LayoutKind, SharedBuffer, SharedLayout};
    use clap::Parser;
    use tokio_util::sync::CancellationToken;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        worker: WorkerArgs,
    }

    async fn frames(strips: &[Strip]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for strip in strips {
            write_strip(&mut bytes, strip).await.unwrap();
        }
        bytes
    }

    #[tokio::test]
    async fn serve_answers_every_frame_in_order() {
        let strips = split(&gradient(12, 4), 3).unwrap();
        let input = frames(&strips).await;
        let mut output = Vec::new();

        let served = serve(&mut input.as_slice(), &mut output, FilterSpec::identity())
            .await
            .unwrap();
        assert_eq!(served, 3);

        let mut reader = output.as_slice();
        for expected in &strips {
            assert_eq!(&read_strip(&mut reader).await.unwrap().unwrap(), expected);
        }
        assert!(read_strip(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn serve_of_empty_input_serves_nothing() {
        let mut output = Vec::new();
        let served = serve(&mut &b""[..], &mut output, FilterSpec::default())
            .await
            .unwrap();
        assert_eq!(served, 0);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn serve_shared_fills_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let strips = split(&gradient(10, 5), 2).unwrap();
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();

        for (slot, strip) in strips.iter().enumerate() {
            let input = frames(std::slice::from_ref(strip)).await;
            serve_shared(&mut input.as_slice(), FilterSpec::identity(), buffer.path(), slot)
                .await
                .unwrap();
        }

        let sealed = buffer
            .seal(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sealed.load_all().unwrap(), strips);
    }

    #[tokio::test]
    async fn serve_shared_rejects_wrong_slot_shape() {
        let dir = tempfile::tempdir().unwrap();
        let strips = split(&gradient(10, 5), 3).unwrap();
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();

        let input = frames(&strips[2..]).await;
        let err = serve_shared(&mut input.as_slice(), FilterSpec::identity(), buffer.path(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StripError::ShapeMismatch(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn serve_shared_without_input_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let strips = split(&gradient(4, 2), 1).unwrap();
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();

        let err = serve_shared(&mut &b""[..], FilterSpec::identity(), buffer.path(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StripError::Protocol(_)));
    }

    #[test]
    fn worker_arguments_parse() {
        let harness = Harness::parse_from([
            "worker", "--filter", "identity", "--sigma", "1.5", "--shared", "/dev/shm/x", "--slot",
            "2",
        ]);
        assert_eq!(harness.worker.filter, FilterKind::Identity);
        assert_eq!(harness.worker.sigma, 1.5);
        assert_eq!(harness.worker.slot, Some(2));
        assert_eq!(harness.worker.log_level, "warn");

        assert!(Harness::try_parse_from(["worker", "--slot", "1"]).is_err());
    }
}
