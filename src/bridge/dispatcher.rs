//! Marshals work from background tasks onto the consumer thread.
//!
//! Any thread may [`enqueue`](MainThreadDispatcher::enqueue) a closure; the
//! simulation loop calls [`drain`](MainThreadDispatcher::drain) once per tick
//! and the closures run there, in FIFO order, with mutable access to the
//! consumer's context. A failing or panicking action is logged and the rest
//! of the batch still runs.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

pub type DispatchAction<C> = Box<dyn FnOnce(&mut C) -> color_eyre::Result<()> + Send>;

pub struct MainThreadDispatcher<C> {
    queue: Arc<Mutex<VecDeque<DispatchAction<C>>>>,
}

impl<C> Clone for MainThreadDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<C> Default for MainThreadDispatcher<C> {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub ran: usize,
    pub failed: usize,
}

impl<C> MainThreadDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DispatchAction<C>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue<F>(&self, action: F)
    where
        F: FnOnce(&mut C) -> color_eyre::Result<()> + Send + 'static,
    {
        self.lock().push_back(Box::new(action));
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Run everything queued so far. Actions enqueued while draining wait
    /// for the next call.
    pub fn drain(&self, context: &mut C) -> DrainReport {
        let batch = std::mem::take(&mut *self.lock());
        let mut report = DrainReport::default();

        for action in batch {
            report.ran += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| action(context))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!("Dispatched action failed: {:?}", e);
                }
                Err(_) => {
                    report.failed += 1;
                    error!("Dispatched action panicked");
                }
            }
        }

        if report.ran > 0 {
            debug!("Dispatcher ran {} actions ({} failed)", report.ran, report.failed);
        }
        report
    }
}
