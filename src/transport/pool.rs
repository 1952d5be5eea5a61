//! Pool transport: a fixed number of worker processes fed from one task queue.
//!
//! Each lane owns a long-lived worker that serves frames in a loop. Lanes pop
//! `(position, strip)` tasks from a lock-free queue, exchange one frame each way, and
//! park the result in the slot for that position, so output order always matches
//! submission order no matter which lane finishes first.
//!
//! A failing task aborts the batch: the remaining lanes are cancelled, their workers
//! killed and reaped, and a single [`StripError::PoolBatchFailed`] wraps the first
//! underlying error. No partial results are returned.

use super::{keep_first, TransportOptions, WorkerCommand};
use crate::error::{StripError, StripResult};
use crate::raster::Strip;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Work shared by every lane of one batch.
struct Batch {
    /// Pending tasks, tagged with their submission position
    queue: SegQueue<(usize, Strip)>,
    /// One result slot per submitted strip
    results: Mutex<Vec<Option<Strip>>>,
}

/// Filter `strips` on a bounded pool of worker processes.
pub async fn process_via_pool(
    strips: Vec<Strip>,
    command: &WorkerCommand,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> StripResult<Vec<Strip>> {
    let total = strips.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let lanes = options.pool_lanes(total);
    let span = info_span!("pool_transport", strips = total, lanes);

    async move {
        let batch = Arc::new(Batch {
            queue: SegQueue::new(),
            results: Mutex::new((0..total).map(|_| None).collect()),
        });
        for task in strips.into_iter().enumerate() {
            batch.queue.push(task);
        }

        let abort = cancel.child_token();
        let mut set = JoinSet::new();
        for lane in 0..lanes {
            set.spawn(run_lane(
                lane,
                command.clone(),
                Arc::clone(&batch),
                options.receive_timeout,
                abort.clone(),
            ));
        }

        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|err| {
                Err(StripError::Io(std::io::Error::other(err)))
            });
            match outcome {
                Ok(served) => debug!(served, "Pool lane finished"),
                Err(err) => {
                    abort.cancel();
                    keep_first(&mut failure, err);
                }
            }
        }

        if let Some(err) = failure {
            if cancel.is_cancelled() {
                return Err(StripError::Cancelled);
            }
            return Err(StripError::PoolBatchFailed {
                index: err.strip_index(),
                total,
                source: Box::new(err),
            });
        }

        let slots = std::mem::take(&mut *batch.results.lock());
        let results = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.ok_or_else(|| StripError::PoolBatchFailed {
                    index: Some(position),
                    total,
                    source: Box::new(StripError::transport(position, "no lane produced a result")),
                })
            })
            .collect::<StripResult<Vec<_>>>()?;
        info!(strips = results.len(), "Pool transport complete");
        Ok(results)
    }
    .instrument(span)
    .await
}

/// Drive one worker until the queue is empty, then join it.
///
/// Exchange errors name the strip in flight; spawn and exit failures name the lane.
async fn run_lane(
    lane: usize,
    command: WorkerCommand,
    batch: Arc<Batch>,
    timeout: Duration,
    cancel: CancellationToken,
) -> StripResult<usize> {
    let mut handle = command
        .spawn(lane, &[], timeout)
        .map_err(|err| lane_failure(lane, err))?;
    let mut served = 0;

    let outcome = tokio::select! {
        result = async {
            while let Some((position, strip)) = batch.queue.pop() {
                handle.send(&strip).await?;
                let result = handle.receive(&strip).await?;
                batch.results.lock()[position] = Some(result);
                served += 1;
            }
            Ok::<(), StripError>(())
        } => result,
        _ = cancel.cancelled() => Err(StripError::Cancelled),
    };

    match outcome {
        Ok(()) => {
            handle
                .join(&cancel)
                .await
                .map_err(|err| lane_failure(lane, err))?;
            Ok(served)
        }
        Err(err) => {
            handle.terminate().await;
            Err(err)
        }
    }
}

fn lane_failure(lane: usize, err: StripError) -> StripError {
    match err {
        StripError::WorkerTransport { reason, .. } => StripError::PoolLaneFailed { lane, reason },
        other => other,
    }
}
