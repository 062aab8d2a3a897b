//! Cross-boundary chunk channel over a Unix socket pair.
//!
//! The socket carries one fixed-width token per chunk: the chunk's sequence
//! number, little endian. The chunk itself is parked in a table shared by
//! both ends and is moved out by the reader when its token arrives. Tokens
//! must arrive in sequence; anything else is treated as corruption.

use super::{ChannelError, ChunkReceiver, ChunkSink};
use crate::chunk::Chunk;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tracing::{debug, error};

/// Width of one token on the wire.
pub const TOKEN_WIDTH: usize = std::mem::size_of::<u64>();

const READ_BATCH: usize = TOKEN_WIDTH * 64;

type Parked = Arc<Mutex<HashMap<u64, Chunk>>>;

/// Create a socket-pair chunk channel.
///
/// The writer end stays blocking: when the socket buffer is full, `push`
/// waits for the event loop to drain it rather than losing a token.
pub fn channel() -> Result<(PipeSender, PipeReceiver), ChannelError> {
    let (writer, reader) = UnixStream::pair()?;
    from_streams(writer, reader)
}

fn from_streams(
    writer: UnixStream,
    reader: UnixStream,
) -> Result<(PipeSender, PipeReceiver), ChannelError> {
    writer.set_nonblocking(false)?;
    reader.set_nonblocking(true)?;
    let parked: Parked = Arc::new(Mutex::new(HashMap::new()));

    Ok((
        PipeSender {
            stream: writer,
            parked: parked.clone(),
            next_token: 0,
        },
        PipeReceiver {
            unregistered: Some(reader),
            stream: None,
            parked,
            pending: Vec::with_capacity(READ_BATCH),
            expected: 0,
            eof: false,
        },
    ))
}

/// Producer end. Dropping it closes the write side of the socket.
pub struct PipeSender {
    stream: UnixStream,
    parked: Parked,
    next_token: u64,
}

impl ChunkSink for PipeSender {
    fn push(&mut self, chunk: Chunk) -> Result<(), ChannelError> {
        let token = self.next_token;
        self.parked.lock().insert(token, chunk);

        if let Err(e) = self.stream.write_all(&token.to_le_bytes()) {
            self.parked.lock().remove(&token);
            error!(token = token, error = %e, "Failed to signal chunk");
            return Err(e.into());
        }

        self.next_token += 1;
        debug!(token = token, "Chunk token written");
        Ok(())
    }
}

/// Event-loop end.
///
/// The socket is registered with the tokio reactor the first time it is
/// drained, so this must happen inside a runtime with I/O enabled.
pub struct PipeReceiver {
    unregistered: Option<UnixStream>,
    stream: Option<tokio::net::UnixStream>,
    parked: Parked,
    pending: Vec<u8>,
    expected: u64,
    eof: bool,
}

impl PipeReceiver {
    fn register(&mut self) -> Result<&tokio::net::UnixStream, ChannelError> {
        if self.stream.is_none() {
            let std_stream = self.unregistered.take().ok_or(ChannelError::Closed)?;
            self.stream = Some(tokio::net::UnixStream::from_std(std_stream)?);
        }
        self.stream.as_ref().ok_or(ChannelError::Closed)
    }

    /// Read every byte available right now without blocking.
    fn read_available(&mut self) -> Result<(), ChannelError> {
        if self.eof {
            return Ok(());
        }
        self.register()?;
        let Some(stream) = self.stream.as_ref() else {
            return Err(ChannelError::Closed);
        };

        let mut buf = [0u8; READ_BATCH];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Turn complete tokens into chunks.
    fn decode(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
        let whole = self.pending.len() - self.pending.len() % TOKEN_WIDTH;
        let mut moved = 0;

        for raw in self.pending[..whole].chunks_exact(TOKEN_WIDTH) {
            let mut bytes = [0u8; TOKEN_WIDTH];
            bytes.copy_from_slice(raw);
            let token = u64::from_le_bytes(bytes);

            if token != self.expected {
                return Err(ChannelError::MalformedToken {
                    token,
                    expected: self.expected,
                });
            }
            let chunk = self
                .parked
                .lock()
                .remove(&token)
                .ok_or(ChannelError::MalformedToken {
                    token,
                    expected: self.expected,
                })?;

            out.push_back(chunk);
            self.expected += 1;
            moved += 1;
        }
        self.pending.drain(..whole);

        if self.eof && !self.pending.is_empty() {
            return Err(ChannelError::ShortToken(self.pending.len()));
        }
        Ok(moved)
    }
}

#[async_trait]
impl ChunkReceiver for PipeReceiver {
    async fn drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
        loop {
            let moved = self.try_drain_into(out)?;
            if moved > 0 || self.eof {
                return Ok(moved);
            }
            self.register()?.readable().await?;
        }
    }

    fn try_drain_into(&mut self, out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
        self.read_available()?;
        self.decode(out)
    }
}
