//! Pipe transport: one worker process and one duplex channel per strip.
//!
//! For every strip the coordinator spawns a worker, writes the strip frame into the
//! worker's stdin, closes it, and reads exactly one result frame from the worker's
//! stdout. Exchanges run concurrently, but results are collected in strip-index
//! order and every worker is joined before the batch returns.
//!
//! Cost is one process plus one channel per strip, so this transport is meant for
//! small strip counts.

use super::{keep_first, settle, TransportOptions, WorkerCommand, WorkerHandle};
use crate::error::{StripError, StripResult};
use crate::raster::Strip;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Filter every strip in its own worker process, returning results in input order.
pub async fn process_via_pipes(
    strips: Vec<Strip>,
    command: &WorkerCommand,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> StripResult<Vec<Strip>> {
    let total = strips.len();
    let span = info_span!("pipe_transport", strips = total);
    async move {
        let batch = cancel.child_token();
        let mut exchanges = Vec::with_capacity(total);
        let mut failure = None;

        for strip in strips {
            let index = strip.index;
            match command.spawn(index, &[], options.receive_timeout) {
                Ok(handle) => {
                    let batch = batch.clone();
                    let task = tokio::spawn(exchange(handle, strip, batch));
                    exchanges.push((index, task));
                }
                Err(err) => {
                    keep_first(&mut failure, err);
                    batch.cancel();
                    break;
                }
            }
        }

        let mut results = Vec::with_capacity(total);
        for (index, task) in exchanges {
            let outcome = task.await.unwrap_or_else(|err| {
                Err(StripError::transport(index, format!("exchange task failed: {err}")))
            });
            match outcome {
                Ok(strip) => results.push(strip),
                Err(err) => {
                    batch.cancel();
                    keep_first(&mut failure, err);
                }
            }
        }

        settle(failure, cancel)?;
        info!(strips = results.len(), "Pipe transport complete");
        Ok(results)
    }
    .instrument(span)
    .await
}

/// Send one strip, receive its result, then join the worker.
async fn exchange(
    mut handle: WorkerHandle,
    strip: Strip,
    cancel: CancellationToken,
) -> StripResult<Strip> {
    let outcome = tokio::select! {
        result = async {
            handle.send(&strip).await?;
            handle.close_input();
            handle.receive(&strip).await
        } => result,
        _ = cancel.cancelled() => Err(StripError::Cancelled),
    };

    match outcome {
        Ok(result) => {
            handle.join(&cancel).await?;
            debug!(index = strip.index, "Strip received over pipe");
            Ok(result)
        }
        Err(err) => {
            handle.terminate().await;
            Err(err)
        }
    }
}
