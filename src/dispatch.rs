//! Where subscription handlers run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Routing policy for subscription callbacks.
///
/// Either way, callbacks for one connection run one at a time in the order the
/// connection produced them, never while the connection's bookkeeping lock is
/// held, so handlers may call back into the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerDispatch {
    /// Run handlers on whichever task or thread produced the callback, as
    /// soon as it releases the connection's lock. Lowest latency.
    #[default]
    Inline,
    /// Run handlers on a dedicated task fed by an unbounded queue.
    Dedicated,
}

/// Executes callbacks according to a [`HandlerDispatch`] policy.
pub(crate) enum Dispatcher {
    Inline {
        queue: Mutex<VecDeque<Job>>,
        /// Set while some thread is draining `queue`.
        draining: AtomicBool,
    },
    Dedicated {
        tx: mpsc::UnboundedSender<Job>,
        /// Taken by [`Dispatcher::start`] when the worker task is spawned.
        rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    },
}

impl Dispatcher {
    pub(crate) fn new(policy: HandlerDispatch) -> Self {
        match policy {
            HandlerDispatch::Inline => Self::Inline {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            },
            HandlerDispatch::Dedicated => {
                let (tx, rx) = mpsc::unbounded_channel();
                Self::Dedicated {
                    tx,
                    rx: Mutex::new(Some(rx)),
                }
            }
        }
    }

    /// Spawn the worker task on `runtime` if this is a dedicated dispatcher
    /// that has not been started.
    pub(crate) fn start(&self, runtime: &Handle) {
        let Self::Dedicated { rx, .. } = self else {
            return;
        };
        let Some(mut rx) = rx.lock().take() else {
            return;
        };
        runtime.spawn(async move {
            debug!("handler dispatcher started");
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("handler dispatcher exited");
        });
    }

    /// Queue `job`. Inline jobs run at the next [`flush`](Self::flush);
    /// dedicated jobs go to the dispatcher task.
    pub(crate) fn run(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            Self::Inline { queue, .. } => queue.lock().push_back(Box::new(job)),
            Self::Dedicated { tx, .. } => {
                if tx.send(Box::new(job)).is_err() {
                    debug!("handler dispatcher gone, dropping callback");
                }
            }
        }
    }

    /// Run queued inline jobs on the calling thread. Must be called without
    /// the connection lock held.
    ///
    /// Only one thread drains at a time. A flush that finds another drain in
    /// progress returns at once and leaves its jobs to that drain, which also
    /// covers a handler calling back into the connection.
    pub(crate) fn flush(&self) {
        let Self::Inline { queue, draining } = self else {
            return;
        };
        loop {
            if draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let Some(job) = queue.lock().pop_front() else {
                    break;
                };
                job();
            }
            draining.store(false, Ordering::Release);
            // A job queued between the last pop and the store above would
            // otherwise wait for the next flush.
            if queue.lock().is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inline_runs_on_flush() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(HandlerDispatch::Inline);
        let h = Arc::clone(&hits);
        dispatcher.run(move || h.lock().push(1));
        assert!(hits.lock().is_empty());
        dispatcher.flush();
        assert_eq!(*hits.lock(), vec![1]);
    }

    #[test]
    fn nested_flush_keeps_order() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Arc::new(Dispatcher::new(HandlerDispatch::Inline));
        let (h, d) = (Arc::clone(&hits), Arc::clone(&dispatcher));
        dispatcher.run(move || {
            h.lock().push(1);
            let h2 = Arc::clone(&h);
            d.run(move || h2.lock().push(3));
            // Returns at once; the outer drain runs job 3 after job 2.
            d.flush();
            h.lock().push(2);
        });
        dispatcher.flush();
        assert_eq!(*hits.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dedicated_preserves_order() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(HandlerDispatch::Dedicated);
        for i in 0..10 {
            let h = Arc::clone(&hits);
            dispatcher.run(move || h.lock().push(i));
        }
        assert!(hits.lock().is_empty());

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        dispatcher.run(move || {
            let _ = done_tx.send(());
        });
        dispatcher.start(&Handle::current());
        done_rx.await.unwrap();
        assert_eq!(*hits.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dispatcher = Dispatcher::new(HandlerDispatch::Dedicated);
        dispatcher.start(&Handle::current());
        dispatcher.start(&Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatcher.run(move || {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }
}
