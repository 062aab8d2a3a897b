//! Producer side: cuts an already-encoded byte stream into chunks.
//!
//! The segmenter runs on its own thread, reading from any [`Read`] source
//! (stdin, a FIFO, a file) and pushing sealed chunks into a [`ChunkSink`].
//! It does not understand the container format; chunk boundaries fall on
//! read boundaries once the chunk is old enough or large enough.

use crate::channel::{ChannelError, ChunkSink};
use crate::chunk::ChunkBuilder;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("Failed to read capture source: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to hand chunk to publisher: {0}")]
    Channel(#[from] ChannelError),
}

/// Chunk cutting parameters.
#[derive(Debug, Clone)]
pub struct SegmenterSettings {
    /// Seal a chunk once it has been open this long.
    pub chunk_duration: Duration,
    /// Seal a chunk once it holds at least this many bytes.
    pub max_chunk_bytes: usize,
    /// Size of each read from the source.
    pub read_buffer_bytes: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_secs(10),
            max_chunk_bytes: 8 * 1024 * 1024,
            read_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SegmenterStats {
    pub chunks_sealed: u64,
    pub bytes_read: u64,
}

/// Cooperative stop flag shared with the controller.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the segmenter to seal its current chunk as final and return.
    /// Takes effect after the read in progress completes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct Segmenter<R> {
    source: R,
    settings: SegmenterSettings,
    stop: StopHandle,
    stats: SegmenterStats,
}

impl<R: Read> Segmenter<R> {
    pub fn new(source: R, settings: SegmenterSettings) -> Self {
        Self {
            source,
            settings,
            stop: StopHandle::default(),
            stats: SegmenterStats::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Read until EOF or stop, pushing every sealed chunk into `sink`.
    ///
    /// The last chunk pushed is always marked final, even when it is empty
    /// or when the source fails mid-stream.
    pub fn run<S: ChunkSink>(mut self, sink: &mut S) -> Result<SegmenterStats, SegmenterError> {
        let mut buffer = vec![0u8; self.settings.read_buffer_bytes.max(1)];
        let mut builder = self.new_builder();
        let mut failure = None;

        info!(
            chunk_duration_secs = self.settings.chunk_duration.as_secs(),
            max_chunk_bytes = self.settings.max_chunk_bytes,
            "Segmenter started"
        );

        while !self.stop.is_stopped() {
            let n = match self.source.read(&mut buffer) {
                Ok(0) => {
                    info!("Capture source reached end of stream");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Capture source read failed");
                    failure = Some(SegmenterError::Read(e));
                    break;
                }
            };

            builder.extend_from_slice(&buffer[..n]);
            self.stats.bytes_read += n as u64;

            if builder.len() >= self.settings.max_chunk_bytes
                || builder.started_at().elapsed() >= self.settings.chunk_duration
            {
                let full = std::mem::replace(&mut builder, self.new_builder());
                self.push(sink, full, false)?;
            }
        }

        self.push(sink, builder, true)?;
        info!(
            chunks_sealed = self.stats.chunks_sealed,
            bytes_read = self.stats.bytes_read,
            "Segmenter finished"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    fn new_builder(&self) -> ChunkBuilder {
        ChunkBuilder::with_capacity(
            self.settings
                .max_chunk_bytes
                .min(self.settings.read_buffer_bytes.saturating_mul(16)),
        )
    }

    fn push<S: ChunkSink>(
        &mut self,
        sink: &mut S,
        builder: ChunkBuilder,
        is_final: bool,
    ) -> Result<(), SegmenterError> {
        let chunk = builder.seal(is_final);
        debug!(size_bytes = chunk.len(), is_final, "Chunk sealed");
        sink.push(chunk)?;
        self.stats.chunks_sealed += 1;
        Ok(())
    }
}
