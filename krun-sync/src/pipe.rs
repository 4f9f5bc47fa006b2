//! Bounded byte pipe between a blocking producer and a downstream consumer.
//!
//! The tar packer runs on a blocking thread and writes frames into the pipe;
//! the consumer is either another blocking reader (the chunker) or an async
//! pump feeding a remote stdin. The channel bound is the backpressure: a full
//! pipe blocks the producer until the consumer catches up. Dropping the
//! reader fails the producer's next write with `BrokenPipe`, which is how
//! cancellation unwinds the packing thread.
//!
//! [`ByteWriter::close_with_error`] is the close-with-error half of the
//! protocol: the reader surfaces the message as an I/O error instead of a
//! clean EOF, so a failed producer is never mistaken for a short stream.

use std::io::{Read, Write};

use tokio::sync::mpsc;

enum Frame {
    Data(Vec<u8>),
    Error(String),
}

/// Create a pipe holding at most `capacity` in-flight frames.
pub fn byte_pipe(capacity: usize) -> (ByteWriter, ByteReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ByteWriter { tx },
        ByteReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
    )
}

/// Blocking write half. Must only be used from outside the async runtime
/// (a dedicated thread or `spawn_blocking`).
pub struct ByteWriter {
    tx: mpsc::Sender<Frame>,
}

impl ByteWriter {
    /// Close the pipe so the reader observes `message` as an I/O error.
    pub fn close_with_error(self, message: impl Into<String>) {
        let _ = self.tx.blocking_send(Frame::Error(message.into()));
    }
}

impl Write for ByteWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Frame::Data(buf.to_vec()))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "byte pipe reader dropped")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read half. Offers both a blocking [`Read`] view (for the chunker) and an
/// async frame view (for pumping into a remote stdin); use one or the other.
pub struct ByteReader {
    rx: mpsc::Receiver<Frame>,
    pending: Vec<u8>,
    offset: usize,
}

impl ByteReader {
    /// Await the next frame. `None` is clean EOF; an `Err` frame carries the
    /// producer's close-with-error message.
    pub async fn next_chunk(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        match self.rx.recv().await? {
            Frame::Data(data) => Some(Ok(data)),
            Frame::Error(message) => {
                Some(Err(std::io::Error::other(message)))
            }
        }
    }
}

impl Read for ByteReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.blocking_recv() {
                Some(Frame::Data(data)) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Some(Frame::Error(message)) => {
                    return Err(std::io::Error::other(message));
                }
                None => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
