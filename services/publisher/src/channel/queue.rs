//! In-process chunk queue.

use super::{ChannelError, ChunkReceiver, ChunkSink};
use crate::chunk::Chunk;
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes blocking `pop` callers on a dedicated thread.
    available: Condvar,
    /// Wakes the event loop.
    ready: Notify,
    high_water_mark: usize,
}

struct Inner {
    chunks: VecDeque<Chunk>,
    closed: bool,
    next_alarm: usize,
}

/// Create an unbounded in-process chunk queue.
///
/// A warning is logged each time the depth passes `high_water_mark`, and
/// again at every doubling after that.
pub fn channel(high_water_mark: usize) -> (QueueSender, QueueReceiver) {
    let high_water_mark = high_water_mark.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            chunks: VecDeque::new(),
            closed: false,
            next_alarm: high_water_mark,
        }),
        available: Condvar::new(),
        ready: Notify::new(),
        high_water_mark,
    });

    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

/// Producer handle. Dropping it closes the queue.
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl ChunkSink for QueueSender {
    fn push(&mut self, chunk: Chunk) -> Result<(), ChannelError> {
        let depth = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(ChannelError::Closed);
            }
            inner.chunks.push_back(chunk);

            let depth = inner.chunks.len();
            if depth > inner.next_alarm {
                warn!(
                    depth = depth,
                    high_water_mark = self.shared.high_water_mark,
                    "Chunk queue growing, uploader is falling behind"
                );
                inner.next_alarm = inner.next_alarm.saturating_mul(2);
            }
            depth
        };

        metrics::gauge!("channel.queue.depth").set(depth as f64);
        debug!(depth = depth, "Chunk queued");

        self.shared.available.notify_one();
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        self.shared.inner.lock().closed = true;
        self.shared.available.notify_all();
        self.shared.ready.notify_one();
    }
}

/// Consumer handle.
pub struct QueueReceiver {
    shared: Arc<Shared>,
}

impl QueueReceiver {
    /// Block up to `timeout` for the oldest chunk.
    ///
    /// Only for a dedicated consumer thread: calling this on the event loop
    /// thread stalls every other task on it.
    pub fn pop(&self, timeout: Duration) -> Option<Chunk> {
        let mut inner = self.shared.inner.lock();
        if inner.chunks.is_empty() && !inner.closed {
            self.shared.available.wait_while_for(
                &mut inner,
                |inner| inner.chunks.is_empty() && !inner.closed,
                timeout,
            );
        }
        let chunk = inner.chunks.pop_front();
        self.reset_alarm(&mut inner);
        chunk
    }

    /// Number of chunks waiting.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    fn take_ready(&self, out: &mut VecDeque<Chunk>) -> (usize, bool) {
        let mut inner = self.shared.inner.lock();
        let moved = inner.chunks.len();
        out.extend(inner.chunks.drain(..));
        self.reset_alarm(&mut inner);
        if moved > 0 {
            metrics::gauge!("channel.queue.depth").set(0.0);
        }
        (moved, inner.closed)
    }

    fn reset_alarm(&self, inner: &mut Inner) {
        if inner.chunks.len() < self.shared.high_water_mark {
            inner.next_alarm = self.shared.high_water_mark;
        }
    }
}

#[async_trait]
impl ChunkReceiver for QueueReceiver {
    async fn drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
        loop {
            let (moved, closed) = self.take_ready(out);
            if moved > 0 || closed {
                return Ok(moved);
            }
            self.shared.ready.notified().await;
        }
    }

    fn try_drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
        Ok(self.take_ready(out).0)
    }
}
