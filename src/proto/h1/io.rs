//! Buffered connection IO.
//!
//! The read and write halves are kept apart so the dispatcher can pump
//! a request body in while a response body streams out.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// Once the write buffer grows past this, flushing is preferred over
/// more buffering.
pub(crate) const WRITE_FLUSH_THRESHOLD: usize = 16 * 1024;

pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
}

impl<T: AsyncRead + Unpin> Buffered<T> {
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(0),
        }
    }

    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub(crate) fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Reads more bytes into the buffer; `0` means EOF.
    pub(crate) async fn read_more(&mut self) -> io::Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < INIT_BUFFER_SIZE / 8 {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        self.io.read_buf(&mut self.read_buf).await
    }

    /// Takes up to `max` already-buffered bytes.
    pub(crate) fn take_buffered(&mut self, max: usize) -> Bytes {
        let n = std::cmp::min(max, self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    /// Robustness against clients sending empty lines between
    /// pipelined requests.
    pub(crate) fn consume_leading_lines(&mut self) {
        let mut i = 0;
        while i < self.read_buf.len() {
            match self.read_buf[i] {
                b'\r' | b'\n' => i += 1,
                _ => break,
            }
        }
        if i > 0 {
            self.read_buf.advance(i);
        }
    }
}

pub(crate) struct Writer<T> {
    io: T,
    buf: BytesMut,
}

impl<T: AsyncWrite + Unpin> Writer<T> {
    pub(crate) fn new(io: T) -> Writer<T> {
        Writer {
            io,
            buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    pub(crate) fn buffer(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.buf.len() >= WRITE_FLUSH_THRESHOLD
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Writes everything buffered and flushes the transport.
    ///
    /// Restartable: a cancelled flush leaves the unwritten remainder
    /// buffered.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while self.buf.has_remaining() {
            self.io.write_all_buf(&mut self.buf).await?;
        }
        self.io.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}
