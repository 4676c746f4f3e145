//! A FIFO executor guaranteeing non-overlapping execution.
//!
//! `SerialExecutor` is the serialisation guard used by the transfer
//! engine (and available anywhere a callback sequence must not
//! overlap). Submitted actions run strictly in submission order, and
//! never concurrently: whichever thread wins the `running` flag drains
//! the queue, while losers simply enqueue and leave. In recursive mode
//! a submission from the draining thread itself runs inline instead of
//! deadlocking the queue behind the current action.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct SerialExecutor {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    running: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
    recursive: bool,
}

impl SerialExecutor {
    /// A safe-mode executor: recursive submissions are queued, so the
    /// stack never grows with the submission depth.
    pub(crate) fn new() -> SerialExecutor {
        SerialExecutor::with_mode(false)
    }

    /// An executor permitting same-thread recursion: a submission made
    /// while the calling thread is draining runs inline.
    pub(crate) fn recursive() -> SerialExecutor {
        SerialExecutor::with_mode(true)
    }

    fn with_mode(recursive: bool) -> SerialExecutor {
        SerialExecutor {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                owner: Mutex::new(None),
                recursive,
            }),
        }
    }

    /// Runs `job` now, or queues it behind the currently running one.
    ///
    /// Returns once `job` has run, or once it is queued for the thread
    /// currently draining.
    pub(crate) fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.recursive && self.held_by_current_thread() {
            job();
            return;
        }
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back(Box::new(job));
        self.drain();
    }

    fn held_by_current_thread(&self) -> bool {
        *self.shared.owner.lock().unwrap() == Some(thread::current().id())
    }

    fn drain(&self) {
        loop {
            if self.shared.running.swap(true, Ordering::AcqRel) {
                // Whoever holds the flag re-checks the queue before
                // releasing it, so this job will not be stranded.
                return;
            }
            *self.shared.owner.lock().unwrap() = Some(thread::current().id());
            loop {
                let job = self.shared.queue.lock().unwrap().pop_front();
                match job {
                    Some(job) => job(),
                    None => break,
                }
            }
            *self.shared.owner.lock().unwrap() = None;
            self.shared.running.store(false, Ordering::Release);
            if self.shared.queue.lock().unwrap().is_empty() {
                return;
            }
        }
    }
}
