//! Run executor: one producer worker drives the frame pipeline, one consumer
//! worker drains the output queue into the encoder.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pipeline::FramePipeline;
use crate::queue::{BoundedFrameQueue, DEFAULT_QUEUE_CAPACITY};
use crate::types::Frame;
use crate::video::{FrameEncoder, FrameSource, QueuedSink};

/// What to do when a single pair cannot be interpolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairFailurePolicy {
    /// End the run as failed.
    #[default]
    Abort,
    /// Drop the pair and continue with the next one.
    Skip,
}

impl PairFailurePolicy {
    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(Self::Abort),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for PairFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub pairs_interpolated: u64,
    pub pairs_skipped: u64,
    /// Frames persisted by the encoder. Zero unless the run completed.
    pub frames_written: u64,
}

/// Called after each pair with `(pairs_done, total_pairs)`.
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub queue_capacity: usize,
    pub on_pair_error: PairFailurePolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_pair_error: PairFailurePolicy::Abort,
        }
    }
}

/// Fails when `output` names the same file as `input`. Call before
/// [`prepare_output_path`], which would otherwise delete the input.
pub fn ensure_output_is_not_input(input: &Path, output: &Path) -> Result<()> {
    let input = input
        .canonicalize()
        .with_context(|| format!("failed to resolve input path {}", input.display()))?;
    // An output that does not exist yet cannot be the input.
    let Ok(resolved_output) = output.canonicalize() else {
        return Ok(());
    };
    ensure!(
        input != resolved_output,
        "output {} is the input video; choose a different output path",
        output.display()
    );
    Ok(())
}

/// Removes a stale artifact at `path` and creates its parent directory.
pub fn prepare_output_path(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove existing output {}", path.display()))?;
        debug!(path = %path.display(), "removed existing output");
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct ProducerSummary {
    pairs_interpolated: u64,
    pairs_skipped: u64,
}

/// Shared stop signal: the flag is checked between pairs, cancelling the
/// sink wakes whichever worker is parked on the queue.
#[derive(Clone)]
struct CancelHandle {
    state: Arc<AtomicBool>,
    sink: QueuedSink,
}

impl CancelHandle {
    fn signal(&self) {
        self.state.store(true, Ordering::SeqCst);
        self.sink.cancel();
    }

    fn is_set(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }
}

/// Signals cancellation when a worker unwinds so the other worker is not
/// left parked on the queue.
struct SignalOnUnwind<'a>(&'a CancelHandle);

impl Drop for SignalOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.signal();
        }
    }
}

pub struct InterpolationRun {
    options: RunOptions,
}

impl InterpolationRun {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub async fn execute(
        &self,
        source: Box<dyn FrameSource>,
        mut pipeline: FramePipeline,
        mut encoder: Box<dyn FrameEncoder>,
        cancel: watch::Receiver<bool>,
        progress_callback: Option<ProgressCallback>,
    ) -> RunReport {
        if *cancel.borrow() {
            pipeline.mark_cancelled();
            encoder.discard();
            return RunReport {
                outcome: RunOutcome::Cancelled,
                pairs_interpolated: 0,
                pairs_skipped: 0,
                frames_written: 0,
            };
        }

        let started = Instant::now();
        let queue = Arc::new(BoundedFrameQueue::new(self.options.queue_capacity));
        let cancel_handle = CancelHandle {
            state: Arc::new(AtomicBool::new(false)),
            sink: QueuedSink::new(queue.clone()),
        };
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();

        let external_cancel_handle = spawn_external_cancel_watcher(cancel, cancel_handle.clone());

        let producer = spawn_producer(
            source,
            pipeline,
            self.options.on_pair_error,
            progress_callback,
            cancel_handle.clone(),
            error_tx.clone(),
        );
        let consumer = spawn_consumer(encoder, queue, cancel_handle.clone(), error_tx.clone());
        drop(error_tx);

        let mut first_error: Option<anyhow::Error> = None;

        let summary = match producer.await {
            Ok(summary) => summary,
            Err(join_error) => {
                cancel_handle.signal();
                first_error = Some(anyhow!("producer task panicked: {join_error}"));
                ProducerSummary::default()
            }
        };
        let frames_written = match consumer.await {
            Ok(written) => written,
            Err(join_error) => {
                cancel_handle.signal();
                if first_error.is_none() {
                    first_error = Some(anyhow!("consumer task panicked: {join_error}"));
                }
                0
            }
        };

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        external_cancel_handle.abort();
        if let Err(join_error) = external_cancel_handle.await {
            if !join_error.is_cancelled() && first_error.is_none() {
                first_error = Some(anyhow!("external cancel watcher failed: {join_error}"));
            }
        }

        let outcome = match first_error {
            Some(error) => RunOutcome::Failed(format!("{error:#}")),
            None if cancel_handle.is_set() => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        };

        info!(
            outcome = %outcome,
            pairs = summary.pairs_interpolated,
            skipped = summary.pairs_skipped,
            frames_written,
            elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
            "Interpolation run finished"
        );

        RunReport {
            outcome,
            pairs_interpolated: summary.pairs_interpolated,
            pairs_skipped: summary.pairs_skipped,
            frames_written,
        }
    }
}

impl Default for InterpolationRun {
    fn default() -> Self {
        Self::new(RunOptions::default())
    }
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    cancel_handle: CancelHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if *cancel.borrow() {
            cancel_handle.signal();
            return;
        }

        loop {
            match cancel.changed().await {
                Ok(()) => {
                    if *cancel.borrow() {
                        debug!("external cancellation requested");
                        cancel_handle.signal();
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

fn spawn_producer(
    mut source: Box<dyn FrameSource>,
    mut pipeline: FramePipeline,
    policy: PairFailurePolicy,
    progress_callback: Option<ProgressCallback>,
    cancel_handle: CancelHandle,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<ProducerSummary> {
    tokio::task::spawn_blocking(move || {
        let _unwind = SignalOnUnwind(&cancel_handle);
        let mut summary = ProducerSummary::default();
        let result = run_producer_loop(
            source.as_mut(),
            &mut pipeline,
            policy,
            progress_callback,
            &cancel_handle,
            &mut summary,
        );
        match result {
            Ok(()) if cancel_handle.is_set() => pipeline.mark_cancelled(),
            Ok(()) => {
                pipeline.mark_completed();
                cancel_handle.sink.finish();
            }
            Err(error) => {
                pipeline.mark_failed();
                report_task_error(&error_tx, &cancel_handle, error.context("producer failed"));
            }
        }
        summary
    })
}

fn run_producer_loop(
    source: &mut dyn FrameSource,
    pipeline: &mut FramePipeline,
    policy: PairFailurePolicy,
    progress_callback: Option<ProgressCallback>,
    cancel_handle: &CancelHandle,
    summary: &mut ProducerSummary,
) -> Result<()> {
    pipeline.prepare()?;

    let total_pairs = source.frame_count().map(|n| n.saturating_sub(1));
    let mut pair_index = 0_u64;
    let mut total_enqueue_ms = 0.0_f64;

    'pairs: while !source.is_done() {
        if cancel_handle.is_set() {
            break;
        }

        let Some((a, b)) = source
            .next_frame_pair()
            .with_context(|| format!("failed to decode frame pair {pair_index}"))?
        else {
            break;
        };

        match pipeline.interpolate(a, b) {
            Ok(triple) => {
                let t_enqueue = Instant::now();
                for frame in triple.into_frames() {
                    if cancel_handle.sink.enqueue(frame).is_err() {
                        break 'pairs;
                    }
                }
                total_enqueue_ms += t_enqueue.elapsed().as_secs_f64() * 1000.0;
                summary.pairs_interpolated += 1;
            }
            Err(error) if error.is_pair_local() && policy == PairFailurePolicy::Skip => {
                warn!(pair = pair_index, error = %error, "skipping frame pair");
                summary.pairs_skipped += 1;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("frame pair {pair_index} failed"));
            }
        }

        pair_index += 1;
        if let Some(callback) = progress_callback.as_ref() {
            callback(pair_index, total_pairs);
        }
    }

    if summary.pairs_interpolated > 0 {
        info!(
            pairs = summary.pairs_interpolated,
            avg_enqueue_wait_ms = format!(
                "{:.1}",
                total_enqueue_ms / summary.pairs_interpolated as f64
            ),
            "Producer summary"
        );
    }
    Ok(())
}

fn spawn_consumer(
    mut encoder: Box<dyn FrameEncoder>,
    queue: Arc<BoundedFrameQueue<Frame>>,
    cancel_handle: CancelHandle,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        let _unwind = SignalOnUnwind(&cancel_handle);
        let result = run_consumer_loop(encoder.as_mut(), &queue, &cancel_handle);
        match result {
            Ok(_) if cancel_handle.is_set() => {
                encoder.discard();
                0
            }
            Ok(_) => match encoder.finish().context("encoder finish failed") {
                Ok(written) => written,
                Err(error) => {
                    report_task_error(&error_tx, &cancel_handle, error);
                    0
                }
            },
            Err(error) => {
                report_task_error(&error_tx, &cancel_handle, error.context("consumer failed"));
                encoder.discard();
                0
            }
        }
    })
}

fn run_consumer_loop(
    encoder: &mut dyn FrameEncoder,
    queue: &BoundedFrameQueue<Frame>,
    cancel_handle: &CancelHandle,
) -> Result<u64> {
    let mut written = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_encode_ms = 0.0_f64;

    loop {
        let t_recv = Instant::now();
        let Some(frame) = queue.pop() else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;
        if cancel_handle.is_set() {
            break;
        }

        let t_enc = Instant::now();
        encoder
            .write_frame(&frame)
            .with_context(|| format!("failed to encode frame {written}"))?;
        total_encode_ms += t_enc.elapsed().as_secs_f64() * 1000.0;
        written += 1;
    }

    if written > 0 {
        info!(
            frames = written,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / written as f64),
            avg_encode_ms = format!("{:.1}", total_encode_ms / written as f64),
            "Consumer summary"
        );
    }
    Ok(written)
}

fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    cancel_handle: &CancelHandle,
    error: anyhow::Error,
) {
    cancel_handle.signal();
    let _ = error_tx.send(error);
}
