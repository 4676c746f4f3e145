//! The per-connection response pipeline.
//!
//! Serialises response writes and polices the interim/final protocol:
//! any number of 1xx heads may precede exactly one final response per
//! exchange. Writes that stall beyond the configured deadline close
//! the output and fail the exchange.

use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderMap;
use http::Version;
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

use super::encode::{encode_head, Encoder};
use super::io::Writer;
use crate::error::{Error, Rejection, Result};
use crate::response::{connection_says_close, connection_says_keep_alive, Response};
use http::header::CONTENT_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    StreamingInterim,
    StreamingFinal,
    Closed,
}

pub(crate) struct Pipeline<T> {
    writer: Writer<T>,
    state: State,
    response_timeout: Duration,
}

impl<T: AsyncWrite + Unpin> Pipeline<T> {
    pub(crate) fn new(writer: Writer<T>, response_timeout: Duration) -> Pipeline<T> {
        Pipeline {
            writer,
            state: State::Idle,
            response_timeout,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Why a new submission cannot be accepted right now, if so.
    pub(crate) fn rejection(&self) -> Option<Rejection> {
        match self.state {
            State::Closed => Some(Rejection::ChannelClosed),
            State::StreamingFinal => Some(Rejection::AlreadyFinal),
            State::Idle | State::StreamingInterim => None,
        }
    }

    /// Buffers an interim response head. The write completes with
    /// [`finish_interim`](Self::finish_interim).
    pub(crate) fn stage_interim(&mut self, response: &Response, version: Version) {
        debug_assert!(response.is_interim());
        debug_assert_eq!(self.state, State::Idle);
        self.state = State::StreamingInterim;
        encode_head(self.writer.buf_mut(), response, version);
        trace!("interim {} staged", response.status());
    }

    /// Flushes a staged interim response. Restartable when cancelled
    /// mid-flush.
    pub(crate) async fn finish_interim(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::StreamingInterim);
        self.flush_timed().await?;
        self.state = State::Idle;
        Ok(())
    }

    /// Starts the final response: writes the head and returns the
    /// encoder bounding its body.
    pub(crate) fn begin_final(
        &mut self,
        response: &Response,
        version: Version,
        elide_body: bool,
    ) -> Encoder {
        debug_assert!(!response.is_interim());
        debug_assert_ne!(self.state, State::Closed);
        self.state = State::StreamingFinal;
        encode_head(self.writer.buf_mut(), response, version);
        if elide_body {
            return Encoder::length(0);
        }
        // The promise on the wire wins: a declared Content-Length
        // bounds the body even when the producer's own hint disagrees.
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        match declared.or_else(|| response.content_length()) {
            Some(len) => Encoder::length(len),
            None => Encoder::close_delimited(),
        }
    }

    /// Writes one body chunk of the final response.
    pub(crate) async fn write_chunk(
        &mut self,
        encoder: &mut Encoder,
        chunk: Bytes,
    ) -> Result<()> {
        encoder.encode(chunk.len() as u64)?;
        self.writer.buffer(&chunk);
        if self.writer.should_flush() {
            self.flush_timed().await?;
        }
        Ok(())
    }

    /// Completes the final response. Returns `true` when the body was
    /// truncated against its `Content-Length`, which forfeits the
    /// connection.
    pub(crate) async fn end_final(&mut self, encoder: &Encoder) -> Result<bool> {
        self.flush_timed().await?;
        self.state = State::Idle;
        match encoder.end() {
            Ok(()) => Ok(false),
            Err(not_eof) => {
                debug!("response body short by {} bytes", not_eof.0);
                Ok(true)
            }
        }
    }

    /// Closes the output half. Buffered bytes are given one last
    /// best-effort flush.
    pub(crate) async fn close_output(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if self.writer.has_pending() {
            let flush = self.writer.flush();
            let _ = tokio::time::timeout(self.response_timeout, flush).await;
        }
        let _ = self.writer.shutdown().await;
    }

    async fn flush_timed(&mut self) -> Result<()> {
        match tokio::time::timeout(self.response_timeout, self.writer.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state = State::Closed;
                Err(Error::new_io(e))
            }
            Err(_elapsed) => {
                debug!("response write timed out");
                self.state = State::Closed;
                Err(Error::new_response_timeout())
            }
        }
    }
}

/// Whether the connection survives this exchange.
pub(crate) fn wants_keep_alive(
    version: Version,
    req_headers: &HeaderMap,
    response: &Response,
    close_delimited: bool,
) -> bool {
    if close_delimited
        || response.must_close_after_write()
        || response.must_shutdown_output_after_write()
    {
        return false;
    }
    if connection_says_close(req_headers) || connection_says_close(response.headers()) {
        return false;
    }
    match version {
        Version::HTTP_11 => true,
        Version::HTTP_10 => connection_says_keep_alive(req_headers),
        _ => false,
    }
}
