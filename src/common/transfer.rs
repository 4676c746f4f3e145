//! The demand-gated transfer service.
//!
//! Moves items from a producer to a consumer, one at a time, only when
//! there is outstanding demand. This is the primitive beneath every
//! lazy body stream: the receiving side raises demand, the feeding side
//! pokes `try_transfer`, and deliveries happen strictly serialised on
//! whichever thread gets there first (gated by a `SerialExecutor`, so
//! producer and consumer never overlap and are never re-entered).
//!
//! The demand counter lives in a single atomic cell. Two values are
//! reserved: `UNBOUNDED` saturates the counter (it is never decremented
//! again) and `FINISHED` stops the service for good.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::serial::SerialExecutor;

/// Demand value at which accounting stops: the consumer has authorised
/// everything the producer will ever yield.
pub(crate) const UNBOUNDED: u64 = u64::MAX - 1;

const FINISHED: u64 = u64::MAX;

type Callback = Box<dyn FnOnce() + Send>;

pub(crate) struct Transfer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Transfer<T> {
    fn clone(&self) -> Self {
        Transfer {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    demand: AtomicU64,
    serial: SerialExecutor,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    producer: Box<dyn FnMut() -> Option<T> + Send>,
    consumer: Box<dyn FnMut(T) + Send>,
    before_first: Option<Callback>,
    after_finish: Option<Callback>,
    finish_cb: Option<Callback>,
    delivered_any: bool,
    finish_ran: bool,
}

impl<T: Send + 'static> Transfer<T> {
    pub(crate) fn new<P, C>(producer: P, consumer: C) -> Transfer<T>
    where
        P: FnMut() -> Option<T> + Send + 'static,
        C: FnMut(T) + Send + 'static,
    {
        Transfer::with_callbacks(producer, consumer, None, None)
    }

    /// Like `new`, with an action to run just before the first delivery
    /// and another to run once after the service finishes.
    pub(crate) fn with_callbacks<P, C>(
        producer: P,
        consumer: C,
        before_first: Option<Callback>,
        after_finish: Option<Callback>,
    ) -> Transfer<T>
    where
        P: FnMut() -> Option<T> + Send + 'static,
        C: FnMut(T) + Send + 'static,
    {
        Transfer {
            shared: Arc::new(Shared {
                demand: AtomicU64::new(0),
                // Safe mode: a consumer poking `try_transfer` from
                // within its own callback queues a re-poll instead of
                // recursing.
                serial: SerialExecutor::new(),
                inner: Mutex::new(Inner {
                    producer: Box::new(producer),
                    consumer: Box::new(consumer),
                    before_first,
                    after_finish,
                    finish_cb: None,
                    delivered_any: false,
                    finish_ran: false,
                }),
            }),
        }
    }

    /// Current demand; `0` when finished.
    pub(crate) fn demand(&self) -> u64 {
        match self.shared.demand.load(Ordering::Acquire) {
            FINISHED => 0,
            n => n,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.shared.demand.load(Ordering::Acquire) == FINISHED
    }

    /// Adds `n` to the demand counter and initiates a transfer.
    ///
    /// Saturates at `UNBOUNDED`, after which the counter is never
    /// decremented again. No effect once finished.
    pub(crate) fn increase_demand(&self, n: u64) {
        debug_assert!(n >= 1, "demand increments must be positive");
        let mut cur = self.shared.demand.load(Ordering::Relaxed);
        loop {
            if cur == FINISHED {
                return;
            }
            let next = match cur.checked_add(n) {
                Some(v) if v < UNBOUNDED => v,
                _ => UNBOUNDED,
            };
            match self.shared.demand.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.try_transfer();
    }

    /// Initiates a delivery attempt.
    ///
    /// If a transfer is already in progress on another thread, one more
    /// attempt is queued behind it and this call returns immediately.
    /// Deliveries continue while demand remains and the producer keeps
    /// yielding items.
    pub(crate) fn try_transfer(&self) {
        let shared = self.shared.clone();
        self.shared.serial.execute(move || Shared::drive(&shared));
    }

    /// Stops the service. `cb` runs exactly once, after any delivery in
    /// progress. Returns `false` (and drops `cb`) if already finished.
    pub(crate) fn finish(&self, cb: Option<Callback>) -> bool {
        if self.shared.demand.swap(FINISHED, Ordering::AcqRel) == FINISHED {
            return false;
        }
        if let Some(cb) = cb {
            self.shared.inner.lock().unwrap().finish_cb = Some(cb);
        }
        let shared = self.shared.clone();
        self.shared
            .serial
            .execute(move || Shared::run_finish(&shared));
        true
    }
}

impl<T> Shared<T> {
    fn drive(shared: &Arc<Shared<T>>) {
        loop {
            match shared.demand.load(Ordering::Acquire) {
                FINISHED => {
                    Shared::run_finish(shared);
                    return;
                }
                0 => return,
                _ => {}
            }

            let mut inner = shared.inner.lock().unwrap();
            let item = match (inner.producer)() {
                Some(item) => item,
                None => return,
            };

            // The item counts as consumed as soon as the producer
            // yields it, whatever the consumer then does with it. One
            // unit of demand is released unless the counter is
            // saturated or the service finished mid-delivery.
            let _ = shared.demand.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |cur| match cur {
                    FINISHED | UNBOUNDED | 0 => None,
                    n => Some(n - 1),
                },
            );

            if !inner.delivered_any {
                inner.delivered_any = true;
                if let Some(cb) = inner.before_first.take() {
                    cb();
                }
            }
            (inner.consumer)(item);
            drop(inner);
        }
    }

    fn run_finish(shared: &Arc<Shared<T>>) {
        if shared.demand.load(Ordering::Acquire) != FINISHED {
            return;
        }
        let (after, cb) = {
            let mut inner = shared.inner.lock().unwrap();
            if inner.finish_ran {
                return;
            }
            inner.finish_ran = true;
            (inner.after_finish.take(), inner.finish_cb.take())
        };
        if let Some(after) = after {
            after();
        }
        if let Some(cb) = cb {
            cb();
        }
    }
}
