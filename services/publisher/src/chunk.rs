//! Recorded stream chunks, the unit of upload.

use bytes::{Bytes, BytesMut};
use std::time::Instant;

/// One finished, time-bounded segment of the recorded stream.
///
/// A `Chunk` is immutable: its payload is a reference-counted [`Bytes`], so
/// handing it to the transport for an upload attempt never copies the data,
/// and the buffer is released once the last holder drops it.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Bytes,
    is_final: bool,
}

impl Chunk {
    /// Create a chunk from an already sealed payload.
    pub fn new(data: impl Into<Bytes>, is_final: bool) -> Self {
        Self {
            data: data.into(),
            is_final,
        }
    }

    /// Chunk payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this is the last chunk of the recording session.
    pub fn is_final(&self) -> bool {
        self.is_final
    }
}

/// Append-only buffer a producer fills until the chunk is sealed.
#[derive(Debug)]
pub struct ChunkBuilder {
    buffer: BytesMut,
    started_at: Instant,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            started_at: Instant::now(),
        }
    }

    /// Append encoded stream bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// When the first byte of this chunk could have arrived.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Seal the buffer into an immutable chunk.
    pub fn seal(self, is_final: bool) -> Chunk {
        Chunk {
            data: self.buffer.freeze(),
            is_final,
        }
    }
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
