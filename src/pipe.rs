//! Block Pipe
//!
//! Bounded byte buffer between an archive producer running on a worker
//! thread and the backup state machine running on the async runtime.
//!
//! ```text
//!  producer thread                     runtime
//! ┌──────────────┐   write (blocks   ┌──────────────┐
//! │  PipeWriter  │ ─────────────────▶│  PipeReader  │ read(n).await
//! └──────────────┘   when full)      └──────────────┘
//! ```
//!
//! The reader gets empty bytes exactly once after the writer calls
//! [`PipeWriter::mark_finished`] and the buffer drains, or immediately after
//! [`PipeReader::close`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Observable pipe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Nothing buffered and the producer is still running
    Empty,
    /// Bytes or the end-of-stream marker are waiting
    ReadyToRead,
    /// Closed, or end-of-stream already delivered
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    buf: BytesMut,
    finished: bool,
    closed: bool,
    producer_dropped: bool,
    eof_delivered: bool,
    reading: bool,
}

impl Inner {
    fn state(&self) -> PipeState {
        if self.closed || self.eof_delivered {
            PipeState::Closed
        } else if !self.buf.is_empty() || self.finished || self.producer_dropped {
            PipeState::ReadyToRead
        } else {
            PipeState::Empty
        }
    }
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    inner: Mutex<Inner>,
    space: Condvar,
    readable: Notify,
}

/// Create a pipe holding at most `capacity` buffered bytes.
pub fn block_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        inner: Mutex::new(Inner::default()),
        space: Condvar::new(),
        readable: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

// =============================================================================
// Writer
// =============================================================================

/// Producer end. Blocking; use from a worker thread.
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append bytes, blocking while the buffer is full.
    pub fn write(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let mut inner = self.shared.inner.lock();
            loop {
                if inner.closed {
                    return Err(Error::PipeClosed);
                }
                if inner.finished {
                    return Err(Error::Internal("write after mark_finished".to_string()));
                }
                if inner.buf.len() < self.shared.capacity {
                    break;
                }
                self.shared.space.wait(&mut inner);
            }
            let room = self.shared.capacity - inner.buf.len();
            let n = room.min(data.len());
            inner.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            drop(inner);
            self.shared.readable.notify_one();
        }
        Ok(())
    }

    /// Signal end of stream.
    pub fn mark_finished(&self) {
        self.shared.inner.lock().finished = true;
        self.shared.readable.notify_one();
    }

    /// Abort from the producer side.
    pub fn close(&self) {
        close(&self.shared);
    }

    pub fn state(&self) -> PipeState {
        self.shared.inner.lock().state()
    }
}

impl std::io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        PipeWriter::write(self, buf)
            .map(|_| buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if !inner.finished {
            inner.producer_dropped = true;
        }
        drop(inner);
        self.shared.readable.notify_one();
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Consumer end, owned by the backup state machine.
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Clears the reading flag even if the read future is dropped.
struct ReadingGuard<'a>(&'a Shared);

impl Drop for ReadingGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().reading = false;
    }
}

impl PipeReader {
    /// Read up to `n` bytes.
    ///
    /// Returns empty bytes once at end of stream or after `close()`. Fails
    /// with [`Error::AlreadyReading`] if another read is pending and with
    /// [`Error::PipeClosed`] once end of stream was already delivered.
    pub async fn read(&self, n: usize) -> Result<Bytes> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.reading {
                return Err(Error::AlreadyReading);
            }
            inner.reading = true;
        }
        let _guard = ReadingGuard(&self.shared);

        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.inner.lock();
                if inner.closed {
                    if inner.eof_delivered {
                        return Err(Error::PipeClosed);
                    }
                    inner.eof_delivered = true;
                    return Ok(Bytes::new());
                }
                if !inner.buf.is_empty() {
                    let take = n.max(1).min(inner.buf.len());
                    let out = inner.buf.split_to(take).freeze();
                    drop(inner);
                    self.shared.space.notify_all();
                    return Ok(out);
                }
                if inner.finished || inner.producer_dropped {
                    if inner.eof_delivered {
                        return Err(Error::PipeClosed);
                    }
                    inner.eof_delivered = true;
                    return Ok(Bytes::new());
                }
            }

            notified.await;
        }
    }

    /// Close the pipe; a pending reader receives empty bytes.
    pub fn close(&self) {
        close(&self.shared);
    }

    pub fn state(&self) -> PipeState {
        self.shared.inner.lock().state()
    }

    /// True when the stream ended because the producer finished normally.
    pub fn finished_cleanly(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.finished && !inner.closed
    }
}

fn close(shared: &Shared) {
    shared.inner.lock().closed = true;
    shared.readable.notify_waiters();
    shared.readable.notify_one();
    shared.space.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_read_write_and_eof_once() {
        let (writer, reader) = block_pipe(16);
        assert_eq!(reader.state(), PipeState::Empty);

        writer.write(b"hello world").unwrap();
        writer.mark_finished();
        assert_eq!(reader.state(), PipeState::ReadyToRead);

        assert_eq!(&reader.read(5).await.unwrap()[..], b"hello");
        assert_eq!(&reader.read(100).await.unwrap()[..], b" world");
        assert!(reader.read(10).await.unwrap().is_empty());
        assert_eq!(reader.state(), PipeState::Closed);
        assert_matches!(reader.read(10).await, Err(Error::PipeClosed));
        assert!(reader.finished_cleanly());
    }

    #[tokio::test]
    async fn test_already_reading() {
        let (_writer, reader) = block_pipe(16);
        let reader = Arc::new(reader);

        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_matches!(reader.read(4).await, Err(Error::AlreadyReading));

        reader.close();
        let result = pending.await.unwrap().unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_writer_blocks_when_full() {
        let (writer, reader) = block_pipe(8);
        let producer = std::thread::spawn(move || {
            writer.write(&[7u8; 64]).unwrap();
            writer.mark_finished();
        });

        let mut total = 0;
        loop {
            let chunk = reader.read(5).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 5);
            total += chunk.len();
        }
        producer.join().unwrap();
        assert_eq!(total, 64);
    }

    #[tokio::test]
    async fn test_close_unblocks_writer() {
        let (writer, reader) = block_pipe(4);
        let producer = std::thread::spawn(move || writer.write(&[1u8; 32]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.close();
        let result = producer.join().unwrap();
        assert_matches!(result, Err(Error::PipeClosed));
        assert_eq!(reader.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_producer_ends_stream() {
        let (writer, reader) = block_pipe(16);
        writer.write(b"abc").unwrap();
        drop(writer);

        assert_eq!(&reader.read(16).await.unwrap()[..], b"abc");
        assert!(reader.read(16).await.unwrap().is_empty());
        assert!(!reader.finished_cleanly());
    }
}
