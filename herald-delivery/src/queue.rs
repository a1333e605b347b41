//! The delivery task queue and its worker loop.
//!
//! Tasks are one delivery attempt per pending recipient, processed in FIFO
//! submission order with exactly one task in flight. The worker starts
//! paused; nothing is delivered until the queue is explicitly resumed.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use herald_common::{Signal, internal};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::error;

use crate::{config::QueueConfig, deliver::Deliver, error::DeliveryError};

/// Live worker counters, safe to read at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting in the backlog plus the one in flight, if any.
    pub pending: usize,
    /// Tasks finished this run, successfully or not.
    pub completed: u64,
    /// Tasks that ended in a successful delivery this run.
    pub succeeded: u64,
}

/// What a single delivery attempt ended in.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The transport accepted the message.
    Delivered,
    /// The attempt failed; `will_retry` says whether the worker has
    /// scheduled another attempt for the same task.
    Failed { error: String, will_retry: bool },
}

/// Signals emitted by the worker.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// An attempt finished. Emitted after every attempt; the carried stats
    /// already account for the task when the attempt was its last.
    Attempt {
        address: String,
        outcome: AttemptOutcome,
        stats: QueueStats,
    },
    /// The backlog went from non-empty to empty with nothing in flight.
    /// Emitted exactly once per such transition.
    Drained { stats: QueueStats },
}

/// How a task ended, from the worker loop's point of view.
#[derive(Debug, PartialEq, Eq)]
enum TaskEnd {
    Success,
    Failure,
    /// Shutdown arrived while a retry was scheduled; the task's recorded
    /// state is already durable, the re-attempt simply never starts.
    Interrupted,
}

/// In-process FIFO delivery queue with bounded retries.
///
/// Cloning is cheap and shares the same queue; exactly one clone should
/// drive [`Self::run`].
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    backlog: Mutex<VecDeque<String>>,
    paused: AtomicBool,
    in_flight: AtomicBool,
    completed: AtomicU64,
    succeeded: AtomicU64,
    notify: Notify,
}

impl TaskQueue {
    /// Create a queue in the paused state.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                backlog: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(true),
                in_flight: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a delivery task. Tasks start in submission order.
    pub fn push(&self, address: impl Into<String>) {
        self.inner
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(address.into());
        self.inner.notify.notify_one();
    }

    /// Stop admitting tasks to execution. The task already in flight, if
    /// any, runs to its end.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// (Re)start admission.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// Whether admission is currently stopped.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether a delivery attempt is currently in flight.
    pub fn has_task_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Current counters. Non-blocking.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.backlog_len() + usize::from(self.inner.in_flight.load(Ordering::SeqCst)),
            completed: self.inner.completed.load(Ordering::SeqCst),
            succeeded: self.inner.succeeded.load(Ordering::SeqCst),
        }
    }

    fn backlog_len(&self) -> usize {
        self.inner
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn pop_front(&self) -> Option<String> {
        self.inner
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Drive the queue until shutdown.
    ///
    /// Pulls tasks in FIFO order, one at a time, invoking `deliver` for
    /// each attempt. Temporary failures are re-attempted after the
    /// configured retry delay until the attempt budget is spent; permanent
    /// failures end the task immediately.
    pub async fn run(
        &self,
        deliver: Arc<dyn Deliver>,
        events: mpsc::UnboundedSender<QueueEvent>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        internal!("Worker started, admission paused: {}", self.is_paused());

        loop {
            let Some(address) = self.next_task(&mut shutdown).await else {
                internal!("Worker stopping, no further tasks will be admitted");
                return;
            };

            self.inner.in_flight.store(true, Ordering::SeqCst);
            let end = self
                .attempt_task(&address, deliver.as_ref(), &events, &mut shutdown)
                .await;
            self.inner.in_flight.store(false, Ordering::SeqCst);

            if end == TaskEnd::Interrupted {
                return;
            }

            if self.backlog_len() == 0 {
                let _ = events.send(QueueEvent::Drained {
                    stats: self.stats(),
                });
            }

            let pacing = self.inner.config.inter_task_delay();
            if !pacing.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(pacing) => {}
                    _ = shutdown.recv() => return,
                }
            }
        }
    }

    /// Wait for the next admissible task, or `None` on shutdown.
    async fn next_task(&self, shutdown: &mut broadcast::Receiver<Signal>) -> Option<String> {
        loop {
            // Register interest before the check so a push or resume that
            // lands in between is not lost.
            let notified = self.inner.notify.notified();

            if !self.is_paused()
                && let Some(address) = self.pop_front()
            {
                return Some(address);
            }

            tokio::select! {
                () = notified => {}
                _ = shutdown.recv() => return None,
            }
        }
    }

    async fn attempt_task(
        &self,
        address: &str,
        deliver: &dyn Deliver,
        events: &mpsc::UnboundedSender<QueueEvent>,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> TaskEnd {
        let max_tries = self.inner.config.max_tries.max(1);
        let mut attempt: u32 = 1;

        loop {
            match deliver.deliver(address).await {
                Ok(()) => {
                    self.inner.succeeded.fetch_add(1, Ordering::SeqCst);
                    self.inner.completed.fetch_add(1, Ordering::SeqCst);
                    self.inner.in_flight.store(false, Ordering::SeqCst);
                    let _ = events.send(QueueEvent::Attempt {
                        address: address.to_string(),
                        outcome: AttemptOutcome::Delivered,
                        stats: self.stats(),
                    });
                    return TaskEnd::Success;
                }
                Err(e) => {
                    if let DeliveryError::Store(store_error) = &e {
                        // A failing store mid-run is a broken contract, not
                        // a delivery condition.
                        error!("Store failure while recording outcome for {address}: {store_error}");
                    }

                    let will_retry = e.is_temporary() && attempt < max_tries;

                    if will_retry {
                        let _ = events.send(QueueEvent::Attempt {
                            address: address.to_string(),
                            outcome: AttemptOutcome::Failed {
                                error: e.to_string(),
                                will_retry: true,
                            },
                            stats: self.stats(),
                        });

                        attempt += 1;
                        tokio::select! {
                            () = tokio::time::sleep(self.inner.config.retry_delay()) => {}
                            _ = shutdown.recv() => return TaskEnd::Interrupted,
                        }
                    } else {
                        self.inner.completed.fetch_add(1, Ordering::SeqCst);
                        self.inner.in_flight.store(false, Ordering::SeqCst);
                        let _ = events.send(QueueEvent::Attempt {
                            address: address.to_string(),
                            outcome: AttemptOutcome::Failed {
                                error: e.to_string(),
                                will_retry: false,
                            },
                            stats: self.stats(),
                        });
                        return TaskEnd::Failure;
                    }
                }
            }
        }
    }
}
