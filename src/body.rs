//! Streaming bodies for requests and responses.
//!
//! A [`Body`] is a lazy sequence of byte chunks. Request bodies are fed
//! by the connection as the peer sends them; response bodies are fed by
//! the application. Either way the feeding side only runs when the
//! reading side has signalled demand. The accounting is done by the
//! transfer service in `common::transfer`, so chunks are never buffered
//! ahead of the consumer beyond the demand it raised.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::future;

use crate::common::transfer::Transfer;
use crate::error::{Error, Result};

/// A stream of `Bytes` chunks, used when receiving or sending bodies.
#[must_use = "streams do nothing unless polled"]
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Once(Option<Bytes>),
    Chan(Receiver),
}

/// The feeding half of a body channel.
///
/// Chunks pushed here come out of the paired [`Body`], but only as the
/// receiving side demands them.
pub struct Sender {
    transfer: Transfer<Result<Bytes>>,
    queues: Arc<Queues>,
}

struct Receiver {
    transfer: Transfer<Result<Bytes>>,
    queues: Arc<Queues>,
}

struct Queues {
    /// Chunks waiting for demand; the transfer producer pulls here.
    pending: Mutex<VecDeque<Result<Bytes>>>,
    /// Chunks delivered and not yet taken by the receiver.
    delivered: Mutex<VecDeque<Result<Bytes>>>,
    rx_waker: Mutex<Option<Waker>>,
    tx_waker: Mutex<Option<Waker>>,
    rx_dropped: AtomicBool,
    /// Sender is done; whatever is still pending is delivered first.
    tx_done: AtomicBool,
    /// The transfer service itself stopped (abort or teardown).
    tx_finished: AtomicBool,
}

impl Queues {
    fn wake_rx(&self) {
        if let Some(waker) = self.rx_waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    fn wake_tx(&self) {
        if let Some(waker) = self.tx_waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

impl Body {
    /// A body with no chunks.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// Creates a channel-backed body, returning the feeding half too.
    ///
    /// Useful for streaming response bodies whose chunks are produced
    /// while the response is already on the wire.
    pub fn channel() -> (Sender, Body) {
        let queues = Arc::new(Queues {
            pending: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(VecDeque::new()),
            rx_waker: Mutex::new(None),
            tx_waker: Mutex::new(None),
            rx_dropped: AtomicBool::new(false),
            tx_done: AtomicBool::new(false),
            tx_finished: AtomicBool::new(false),
        });

        let producer = queues.clone();
        let consumer = queues.clone();
        let finisher = queues.clone();
        let transfer = Transfer::with_callbacks(
            move || producer.pending.lock().unwrap().pop_front(),
            move |item| {
                consumer.delivered.lock().unwrap().push_back(item);
                consumer.wake_rx();
            },
            None,
            Some(Box::new(move || {
                finisher.tx_finished.store(true, Ordering::Release);
                finisher.wake_rx();
                finisher.wake_tx();
            })),
        );

        (
            Sender {
                transfer: transfer.clone(),
                queues: queues.clone(),
            },
            Body {
                kind: Kind::Chan(Receiver { transfer, queues }),
            },
        )
    }

    /// The exact byte length, when the body is not streamed.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Once(ref chunk) => {
                Some(chunk.as_ref().map(|c| c.len() as u64).unwrap_or(0))
            }
            Kind::Chan(_) => None,
        }
    }

    /// True when the body is statically known to carry no bytes.
    pub(crate) fn known_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    /// Polls the next chunk.
    pub fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        match self.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Once(ref mut chunk) => {
                Poll::Ready(chunk.take().filter(|c| !c.is_empty()).map(Ok))
            }
            Kind::Chan(ref mut rx) => rx.poll_next(cx),
        }
    }

    /// Returns the next chunk, or `None` at end of body.
    pub async fn data(&mut self) -> Option<Result<Bytes>> {
        future::poll_fn(|cx| self.poll_data(cx)).await
    }
}

impl Receiver {
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            if let Some(item) = self.queues.delivered.lock().unwrap().pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.queues.tx_finished.load(Ordering::Acquire) {
                return Poll::Ready(None);
            }
            if self.at_graceful_end() {
                self.transfer.finish(None);
                return Poll::Ready(None);
            }
            *self.queues.rx_waker.lock().unwrap() = Some(cx.waker().clone());

            if self.transfer.demand() == 0 {
                self.transfer.increase_demand(1);
                self.queues.wake_tx();
            } else {
                self.transfer.try_transfer();
            }

            // A delivery may have raced the waker registration.
            if self.queues.delivered.lock().unwrap().is_empty()
                && !self.queues.tx_finished.load(Ordering::Acquire)
                && !self.at_graceful_end()
            {
                return Poll::Pending;
            }
        }
    }

    /// The sender finished and everything it queued was delivered.
    fn at_graceful_end(&self) -> bool {
        self.queues.tx_done.load(Ordering::Acquire)
            && self.queues.pending.lock().unwrap().is_empty()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.queues.rx_dropped.store(true, Ordering::Release);
        self.transfer.finish(None);
        self.queues.wake_tx();
    }
}

impl Sender {
    /// Polls until the receiving side wants a chunk.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Err(Error::new_closed()));
        }
        if self.transfer.demand() > 0 {
            return Poll::Ready(Ok(()));
        }
        *self.queues.tx_waker.lock().unwrap() = Some(cx.waker().clone());
        if self.transfer.demand() > 0 {
            return Poll::Ready(Ok(()));
        }
        if self.is_closed() {
            return Poll::Ready(Err(Error::new_closed()));
        }
        Poll::Pending
    }

    fn is_closed(&self) -> bool {
        self.queues.rx_dropped.load(Ordering::Acquire)
            || self.queues.tx_done.load(Ordering::Acquire)
            || self.transfer.is_finished()
    }

    pub(crate) async fn ready(&mut self) -> Result<()> {
        future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Queues a chunk without waiting for demand.
    pub fn try_send_data(&mut self, chunk: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::new_closed());
        }
        self.queues.pending.lock().unwrap().push_back(Ok(chunk));
        self.transfer.try_transfer();
        Ok(())
    }

    /// Sends a chunk once the receiving side demands one.
    pub async fn send_data(&mut self, chunk: Bytes) -> Result<()> {
        self.ready().await?;
        self.try_send_data(chunk)
    }

    /// Terminates the body with an error. Jumps ahead of undelivered
    /// chunks; the receiver sees it on its next poll.
    pub(crate) fn send_error(&mut self, err: Error) {
        self.queues.delivered.lock().unwrap().push_back(Err(err));
        self.transfer.finish(None);
        self.queues.wake_rx();
    }

    /// Marks the normal end of the body. Chunks already queued are
    /// still delivered before the receiver observes the end.
    pub fn finish(&mut self) {
        self.queues.tx_done.store(true, Ordering::Release);
        self.transfer.try_transfer();
        self.queues.wake_rx();
    }

    /// Aborts the body; the receiver observes a client-abort error.
    pub(crate) fn abort(mut self) {
        self.send_error(Error::new_client_aborted());
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Stream for Body {
    type Item = Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.poll_data(cx)
    }
}

impl From<Bytes> for Body {
    fn from(chunk: Bytes) -> Body {
        if chunk.is_empty() {
            Body::empty()
        } else {
            Body {
                kind: Kind::Once(Some(chunk)),
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s.into_bytes()))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Empty => f.write_str("Body(Empty)"),
            Kind::Once(ref chunk) => f
                .debug_tuple("Body")
                .field(&chunk.as_ref().map(|c| c.len()).unwrap_or(0))
                .finish(),
            Kind::Chan(_) => f.write_str("Body(Streaming)"),
        }
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish()
    }
}

/// Concatenates all chunks of a body into one buffer.
pub async fn to_bytes(mut body: Body) -> Result<Bytes> {
    let first = match body.data().await {
        Some(chunk) => chunk?,
        None => return Ok(Bytes::new()),
    };
    let second = match body.data().await {
        Some(chunk) => chunk?,
        None => return Ok(first),
    };
    let mut buf = BytesMut::with_capacity(first.len() + second.len());
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second);
    while let Some(chunk) = body.data().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
