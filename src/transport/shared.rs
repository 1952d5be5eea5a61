//! Shared-memory transport.
//!
//! Input strips still travel to workers over stdin, but results never come back
//! through a pipe: each worker maps the coordinator's [`SharedBuffer`] and copies
//! its filtered pixels into its own slot. The coordinator then seals the buffer,
//! which joins every worker, and only the sealed view can be read.

use super::{TransportOptions, WorkerCommand, WorkerHandle};
use crate::error::{StripError, StripResult};
use crate::raster::Strip;
use crate::shared_buffer::{SharedBuffer, SharedLayout};
use std::ffi::OsString;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

/// Extra worker arguments that point it at `slot` of the buffer at `path`.
pub fn shared_args(path: &Path, slot: usize) -> Vec<OsString> {
    vec![
        OsString::from("--shared"),
        path.as_os_str().to_os_string(),
        OsString::from("--slot"),
        OsString::from(slot.to_string()),
    ]
}

/// Filter every strip in its own worker, collecting results through shared memory.
pub async fn process_via_shared(
    strips: Vec<Strip>,
    command: &WorkerCommand,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> StripResult<Vec<Strip>> {
    if strips.is_empty() {
        return Ok(Vec::new());
    }
    // Shape problems surface here, before anything is spawned.
    let layout = SharedLayout::for_strips(&strips, options.layout)?;
    let span = info_span!(
        "shared_transport",
        strips = strips.len(),
        data_bytes = layout.data_len()
    );

    async move {
        let buffer = SharedBuffer::create(options.shared_dir.as_deref(), layout)?;
        let mut writers: Vec<WorkerHandle> = Vec::with_capacity(strips.len());

        for (slot, strip) in strips.iter().enumerate() {
            let args = shared_args(buffer.path(), slot);
            let mut handle = match command.spawn(strip.index, &args, options.receive_timeout) {
                Ok(handle) => handle,
                Err(err) => {
                    terminate_all(writers).await;
                    return Err(err);
                }
            };
            let sent = tokio::select! {
                sent = handle.send(strip) => sent,
                _ = cancel.cancelled() => Err(StripError::Cancelled),
            };
            handle.close_input();
            writers.push(handle);
            if let Err(err) = sent {
                terminate_all(writers).await;
                if cancel.is_cancelled() {
                    return Err(StripError::Cancelled);
                }
                return Err(err);
            }
        }

        let sealed = buffer.seal(writers, cancel).await?;
        let results = restore_indices(&strips, sealed.load_all()?);
        info!(strips = results.len(), "Shared transport complete");
        Ok(results)
    }
    .instrument(span)
    .await
}

/// Store already-filtered strips in a shared buffer and read them back.
///
/// Used to pass the output of the pipe or pool transport through shared memory.
pub async fn round_trip(
    strips: Vec<Strip>,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> StripResult<Vec<Strip>> {
    if strips.is_empty() {
        return Ok(strips);
    }
    let layout = SharedLayout::for_strips(&strips, options.layout)?;
    let mut buffer = SharedBuffer::create(options.shared_dir.as_deref(), layout)?;
    for (slot, strip) in strips.iter().enumerate() {
        buffer.store(slot, strip)?;
    }
    let sealed = buffer.seal(Vec::new(), cancel).await?;
    Ok(restore_indices(&strips, sealed.load_all()?))
}

/// Slots are numbered by position; give each loaded image back its strip's index.
fn restore_indices(strips: &[Strip], loaded: Vec<Strip>) -> Vec<Strip> {
    strips
        .iter()
        .zip(loaded)
        .map(|(strip, slot)| strip.with_image(slot.image))
        .collect()
}

async fn terminate_all(writers: Vec<WorkerHandle>) {
    for writer in writers {
        writer.terminate().await;
    }
}
