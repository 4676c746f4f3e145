//! Graceful-shutdown plumbing.
//!
//! A `Signal`/`Watch` pair: every connection task holds a `Watch`
//! clone; draining the `Signal` tells the watchers to wind down, and
//! the returned `Draining` future resolves once the last watcher is
//! dropped.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::{mpsc, oneshot};
use futures_core::Stream;
use futures_util::future::{Fuse, FutureExt, Shared};

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = oneshot::channel();
    let (drained_tx, drained_rx) = mpsc::channel(0);
    (
        Signal { drained_rx, tx },
        Watch {
            _drained_tx: drained_tx,
            rx: rx.shared(),
        },
    )
}

pub(crate) struct Signal {
    drained_rx: mpsc::Receiver<Infallible>,
    tx: oneshot::Sender<()>,
}

#[derive(Clone)]
pub(crate) struct Watch {
    _drained_tx: mpsc::Sender<Infallible>,
    rx: Shared<oneshot::Receiver<()>>,
}

pin_project_lite::pin_project! {
    #[must_use = "futures do nothing unless polled"]
    pub(crate) struct Draining {
        #[pin]
        drained_rx: mpsc::Receiver<Infallible>,
    }
}

pin_project_lite::pin_project! {
    #[must_use = "futures do nothing unless polled"]
    pub(crate) struct Signaled {
        #[pin]
        rx: Fuse<Shared<oneshot::Receiver<()>>>,
    }
}

impl Signal {
    pub(crate) fn drain(self) -> Draining {
        let _ = self.tx.send(());
        Draining {
            drained_rx: self.drained_rx,
        }
    }
}

impl Watch {
    /// Resolves once the signal side has started draining (or is gone).
    pub(crate) fn signaled(&self) -> Signaled {
        Signaled {
            rx: self.rx.clone().fuse(),
        }
    }
}

impl Future for Draining {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().drained_rx.poll_next(cx)) {
            Some(never) => match never {},
            None => Poll::Ready(()),
        }
    }
}

impl Future for Signaled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Either a deliberate drain or a dropped signal means shutdown.
        let _ = ready!(self.project().rx.poll(cx));
        Poll::Ready(())
    }
}
