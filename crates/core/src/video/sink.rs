use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::queue::{BoundedFrameQueue, QueueClosed};
use crate::types::Frame;

/// Producer-side handle onto the output queue.
///
/// The consumer end drains the same queue into a
/// [`FrameEncoder`](super::FrameEncoder). `finish` lets buffered frames reach
/// the encoder; `cancel` drops them and wakes a producer blocked in `enqueue`.
#[derive(Clone, Debug)]
pub struct QueuedSink {
    queue: Arc<BoundedFrameQueue<Frame>>,
    cancelled: Arc<AtomicBool>,
}

impl QueuedSink {
    pub fn new(queue: Arc<BoundedFrameQueue<Frame>>) -> Self {
        Self {
            queue,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> &Arc<BoundedFrameQueue<Frame>> {
        &self.queue
    }

    /// Blocks while the queue is full.
    pub fn enqueue(&self, frame: Frame) -> Result<(), QueueClosed> {
        self.queue.put(frame)
    }

    pub fn finish(&self) {
        self.queue.signal_termination();
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.queue.abort();
        debug!(dropped_frames = dropped, "output sink cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
