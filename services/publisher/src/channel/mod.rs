//! Hand-off of finished chunks from the producer thread to the event loop.
//!
//! Two shapes are provided, chosen by deployment topology:
//!
//! - [`queue`]: an in-process mutex/condvar queue. The producer never blocks;
//!   the queue is unbounded and logs its growth.
//! - [`pipe`]: a Unix socket pair carrying one fixed-width token per chunk.
//!   The event loop registers the read end as a readiness source. The writer
//!   end is blocking, so a full socket buffer applies backpressure to the
//!   producer instead of dropping a token.
//!
//! Both preserve push order exactly. The discipline is single writer thread,
//! single reader thread.

pub mod pipe;
pub mod queue;

use crate::chunk::Chunk;
use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;

/// Errors raised by either channel shape.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Chunk channel is closed")]
    Closed,

    #[error("Malformed chunk token {token:#018x} (expected {expected:#018x})")]
    MalformedToken { token: u64, expected: u64 },

    #[error("Short chunk token: {0} trailing bytes at end of stream")]
    ShortToken(usize),

    #[error("Chunk channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error means the channel content can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChannelError::MalformedToken { .. } | ChannelError::ShortToken(_)
        )
    }
}

/// Producer side of a chunk channel. Only ever used from the producer thread.
pub trait ChunkSink: Send {
    fn push(&mut self, chunk: Chunk) -> Result<(), ChannelError>;
}

/// Event-loop side of a chunk channel.
#[async_trait]
pub trait ChunkReceiver: Send {
    /// Wait until at least one chunk is ready, then move every ready chunk,
    /// oldest first, to the back of `out`.
    ///
    /// Returns the number of chunks moved; `0` means the producer side is
    /// gone and nothing is left.
    async fn drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError>;

    /// Move every chunk that is ready right now, without waiting.
    fn try_drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError>;
}
