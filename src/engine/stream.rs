//! Streaming front end
//!
//! Inputs arrive over a bounded channel, so a slow engine backpressures the
//! reader. Completed flows leave in chunks after every message, and on a
//! periodic tick that also flushes a partial batch so a quiet live source
//! still drains. A shutdown broadcast stops the loop between messages and
//! hands the engine back with its open flows intact.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::FlowRecord;
use super::{FlowEngine, Ingest};

/// How a stream run ended
pub struct StreamOutcome {
    /// The engine, finished unless the run was cancelled
    pub engine: FlowEngine,
    /// Stopped by the shutdown signal or a closed output
    pub cancelled: bool,
    /// Chunks sent downstream
    pub chunks_sent: u64,
    /// Flow records sent downstream
    pub records_sent: u64,
}

/// Ticker whose first tick is one period away
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Drive `engine` from `input` until the channel closes, the row limit is
/// reached or shutdown fires.
///
/// On normal end of input the engine is finished and every remaining flow is
/// emitted. On cancellation all flows completed so far have been emitted and
/// the rest stay in the engine; call [`FlowEngine::finish`] to finalize them.
pub async fn run_stream(
    mut engine: FlowEngine,
    mut input: mpsc::Receiver<Vec<Ingest>>,
    output: mpsc::Sender<Vec<FlowRecord>>,
    mut shutdown: broadcast::Receiver<()>,
) -> StreamOutcome {
    let mut chunks_sent = 0u64;
    let mut records_sent = 0u64;
    let mut shutdown_open = true;
    let mut flush = ticker(Duration::from_millis(engine.config().flush_interval_ms));

    let cancelled = loop {
        tokio::select! {
            biased;

            signal = shutdown.recv(), if shutdown_open => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    info!("Shutdown requested, stopping stream");
                    break true;
                }
                Err(broadcast::error::RecvError::Closed) => shutdown_open = false,
            },

            message = input.recv() => match message {
                Some(items) => {
                    for item in items {
                        engine.push(item);
                    }
                    if engine.input_exhausted() {
                        info!("Row limit reached, finishing stream");
                        let chunks = engine.finish_chunks();
                        let delivered = send_chunks(&output, chunks, &mut chunks_sent, &mut records_sent).await;
                        break !delivered;
                    }
                    let chunks = engine.drain_chunks();
                    if !send_chunks(&output, chunks, &mut chunks_sent, &mut records_sent).await {
                        warn!("Flow output closed, stopping stream");
                        break true;
                    }
                }
                None => {
                    debug!("Input closed, finishing stream");
                    let chunks = engine.finish_chunks();
                    let delivered = send_chunks(&output, chunks, &mut chunks_sent, &mut records_sent).await;
                    break !delivered;
                }
            },

            _ = flush.tick() => {
                engine.flush();
                let chunks = engine.drain_chunks();
                if !send_chunks(&output, chunks, &mut chunks_sent, &mut records_sent).await {
                    warn!("Flow output closed, stopping stream");
                    break true;
                }
            }
        }
    };

    StreamOutcome {
        engine,
        cancelled,
        chunks_sent,
        records_sent,
    }
}

async fn send_chunks(
    output: &mpsc::Sender<Vec<FlowRecord>>,
    chunks: Vec<Vec<FlowRecord>>,
    chunks_sent: &mut u64,
    records_sent: &mut u64,
) -> bool {
    for chunk in chunks {
        let len = chunk.len() as u64;
        if output.send(chunk).await.is_err() {
            return false;
        }
        *chunks_sent += 1;
        *records_sent += len;
    }
    true
}

/// Read JSON lines from `reader` and forward them in groups of `group_size`.
/// A partial group is sent once `flush_every` passes without filling it.
/// Stops early when the receiver goes away. Returns the number of lines read.
pub async fn forward_lines<R>(
    reader: R,
    tx: mpsc::Sender<Vec<Ingest>>,
    group_size: usize,
    flush_every: Duration,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let group_size = group_size.max(1);
    let mut lines = reader.lines();
    let mut group = Vec::with_capacity(group_size);
    let mut count = 0u64;
    let mut flush = ticker(flush_every);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    count += 1;
                    group.push(Ingest::Line(line));
                    if group.len() < group_size {
                        continue;
                    }
                }
                None => break,
            },
            _ = flush.tick(), if !group.is_empty() => {}
        }

        let full = std::mem::replace(&mut group, Vec::with_capacity(group_size));
        if tx.send(full).await.is_err() {
            debug!(lines = count, "Input receiver closed, stopping reader");
            return Ok(count);
        }
    }

    if !group.is_empty() && tx.send(group).await.is_err() {
        debug!(lines = count, "Input receiver closed, last group dropped");
    }
    Ok(count)
}
