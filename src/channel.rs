//! The per-exchange write handle.
//!
//! Handlers (and error handlers) respond by submitting [`Response`]s
//! through a [`Channel`]. Submissions are queued to the connection
//! task, which writes them in order; the returned future resolves once
//! the response is fully on the wire, or with the pipeline's rejection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_channel::{mpsc, oneshot};
use http::Version;

use crate::error::{Error, Rejection, Result};
use crate::response::Response;

const OPEN: u8 = 0;
const FINAL: u8 = 1;
const CLOSED: u8 = 2;

/// A clonable handle for writing responses on one exchange.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Submission>,
}

pub(crate) struct Submission {
    pub(crate) response: Response,
    pub(crate) ack: oneshot::Sender<Result<()>>,
}

pub(crate) struct Shared {
    version: Version,
    ignore_rejected_interim: bool,
    state: AtomicU8,
}

impl Channel {
    pub(crate) fn new(
        version: Version,
        ignore_rejected_interim: bool,
    ) -> (Channel, mpsc::UnboundedReceiver<Submission>, Arc<Shared>) {
        let (tx, rx) = mpsc::unbounded();
        let shared = Arc::new(Shared {
            version,
            ignore_rejected_interim,
            state: AtomicU8::new(OPEN),
        });
        (
            Channel {
                shared: shared.clone(),
                tx,
            },
            rx,
            shared,
        )
    }

    /// Submits a response and waits for it to be written.
    ///
    /// Interim responses may be followed by more submissions; the
    /// first non-interim response is final, and anything after it is
    /// rejected. An interim response towards an HTTP/1.0 peer is
    /// either silently dropped (the default) or rejected with
    /// `ProtocolNotSupported`, per server configuration.
    pub async fn send(&self, response: Response) -> Result<()> {
        match self.shared.state.load(Ordering::Acquire) {
            CLOSED => return Err(Error::new_rejected(Rejection::ChannelClosed)),
            FINAL => return Err(Error::new_rejected(Rejection::AlreadyFinal)),
            _ => {}
        }
        if response.is_interim() && self.shared.version < Version::HTTP_11 {
            if self.shared.ignore_rejected_interim {
                tracing::debug!(
                    "dropping interim response not supported by {:?}",
                    self.shared.version
                );
                return Ok(());
            }
            return Err(Error::new_rejected(Rejection::ProtocolNotSupported));
        }

        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .unbounded_send(Submission { response, ack })
            .map_err(|_| Error::new_rejected(Rejection::ChannelClosed))?;
        match ack_rx.await {
            Ok(result) => result,
            Err(_canceled) => Err(Error::new_rejected(Rejection::ChannelClosed)),
        }
    }

    /// True while the exchange can still accept a final response.
    pub fn is_open(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == OPEN
    }
}

impl Shared {
    pub(crate) fn mark_final(&self) {
        let _ = self.state.compare_exchange(
            OPEN,
            FINAL,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub(crate) fn saw_final(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINAL
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish()
    }
}
