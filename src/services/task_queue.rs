//! Concurrency-bounded task queue.
//!
//! Work is admitted under two independent ceilings:
//! - a general ceiling on concurrently executing tasks (agent invocations);
//! - a tighter ceiling on in-flight LLM calls, acquired separately through
//!   [`TaskQueue::llm_slot`].
//!
//! Both ceilings are [`tokio::sync::Semaphore`]s behind an [`AdmissionGate`]
//! that fixes each waiter's place in line when `enqueue` is called, before
//! the returned future is first polled. A task may hold a general slot while
//! waiting for an LLM slot: the LLM gate never needs a general slot, so this
//! cannot deadlock.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};

/// Identity of a queued task as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
}

impl QueuedTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Lifecycle callbacks. Invoked synchronously right after the counters they
/// report have changed; implementations must not block.
pub trait QueueObserver<R>: Send + Sync {
    fn on_task_start(&self, _task: &QueuedTask) {}

    fn on_task_complete(&self, _task: &QueuedTask, _result: &R, _duration: Duration) {}

    fn on_task_error(&self, _task: &QueuedTask, _error: &DomainError, _duration: Duration) {}

    fn on_progress(&self, _completed: usize, _total: usize) {}
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub total: usize,
    pub running: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub llm_in_use: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// FIFO admission over a [`Semaphore`].
///
/// Callers are admitted in the order they called [`AdmissionGate::acquire`],
/// not the order in which their futures are first polled: each waiter only
/// queues on the semaphore once the waiter registered before it holds a
/// permit or has been dropped.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: usize,
    permits: Arc<Semaphore>,
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tail: Mutex::new(None),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Take a place in line now; the returned future resolves with a permit
    /// that is released on drop.
    pub fn acquire(
        self: &Arc<Self>,
    ) -> impl Future<Output = DomainResult<OwnedSemaphorePermit>> + Send + 'static {
        let mut tail = lock(&self.tail);
        let predecessor = tail.take().and_then(|mut rx| match rx.try_recv() {
            Err(TryRecvError::Empty) => Some(rx),
            _ => None,
        });
        let ready = match predecessor {
            None => Arc::clone(&self.permits).try_acquire_owned().ok(),
            Some(_) => None,
        };
        let turn = if ready.is_none() {
            let (tx, rx) = oneshot::channel();
            *tail = Some(rx);
            Some(tx)
        } else {
            None
        };
        drop(tail);

        let permits = Arc::clone(&self.permits);
        async move {
            if let Some(permit) = ready {
                return Ok(permit);
            }
            if let Some(predecessor) = predecessor {
                // A closed channel means the predecessor gave up its place.
                let _ = predecessor.await;
            }
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DomainError::QueueClosed)?;
            if let Some(turn) = turn {
                let _ = turn.send(());
            }
            Ok(permit)
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    running: usize,
    completed: usize,
    failed: usize,
}

/// Admission-controlled executor. `R` is the success type of every task.
pub struct TaskQueue<R> {
    general: Arc<AdmissionGate>,
    llm: Arc<AdmissionGate>,
    observers: Vec<Arc<dyn QueueObserver<R>>>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
}

impl<R: Send + 'static> TaskQueue<R> {
    pub fn new(max_concurrency: usize, max_llm_concurrency: usize) -> Self {
        Self {
            general: AdmissionGate::new(max_concurrency),
            llm: AdmissionGate::new(max_llm_concurrency),
            observers: Vec::new(),
            counters: Mutex::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Add an observer. Observers are fixed once the queue is shared.
    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver<R>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.general.capacity()
    }

    pub fn max_llm_concurrency(&self) -> usize {
        self.llm.capacity()
    }

    /// Admit `execute` under the general ceiling.
    ///
    /// The wait-list position is taken immediately; the returned future
    /// resolves with the task's own outcome. The slot is released when the
    /// task settles, including on panic, which is reported as
    /// `DomainError::TaskPanicked`.
    pub fn enqueue<E, Fut>(
        self: &Arc<Self>,
        task: QueuedTask,
        execute: E,
    ) -> impl Future<Output = DomainResult<R>> + Send + 'static
    where
        E: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DomainResult<R>> + Send + 'static,
    {
        let admission = if self.closed.load(Ordering::SeqCst) {
            None
        } else {
            let (completed, total) = {
                let mut counters = lock(&self.counters);
                counters.total += 1;
                (counters.completed, counters.total)
            };
            for observer in &self.observers {
                observer.on_progress(completed, total);
            }
            Some(self.general.acquire())
        };
        let queue = Arc::clone(self);

        async move {
            let Some(admission) = admission else {
                warn!(task_id = %task.id, "rejecting task: queue closed");
                return Err(DomainError::QueueClosed);
            };

            let slot = admission.await?;
            queue.mark_started(&task);
            let started = Instant::now();

            let outcome = AssertUnwindSafe(execute())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DomainError::TaskPanicked(task.id.clone())));

            queue.mark_settled(&task, &outcome, started.elapsed());
            drop(slot);
            outcome
        }
    }

    /// Register for an LLM slot. Holding a general slot while waiting is fine.
    pub fn llm_slot(
        &self,
    ) -> impl Future<Output = DomainResult<OwnedSemaphorePermit>> + Send + 'static {
        self.llm.acquire()
    }

    /// The LLM gate, for collaborators that pace their own LLM calls.
    pub fn llm_gate(&self) -> Arc<AdmissionGate> {
        Arc::clone(&self.llm)
    }

    /// Stop admitting new tasks. Tasks already enqueued run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let counters = lock(&self.counters);
        QueueStats {
            total: counters.total,
            running: counters.running,
            waiting: counters
                .total
                .saturating_sub(counters.running + counters.completed),
            completed: counters.completed,
            failed: counters.failed,
            llm_in_use: self.llm.in_use(),
        }
    }

    fn mark_started(&self, task: &QueuedTask) {
        let running = {
            let mut counters = lock(&self.counters);
            counters.running += 1;
            counters.running
        };
        debug!(task_id = %task.id, task = %task.name, running, "task started");
        for observer in &self.observers {
            observer.on_task_start(task);
        }
    }

    fn mark_settled(&self, task: &QueuedTask, outcome: &DomainResult<R>, duration: Duration) {
        let (completed, total) = {
            let mut counters = lock(&self.counters);
            counters.running -= 1;
            counters.completed += 1;
            if outcome.is_err() {
                counters.failed += 1;
            }
            (counters.completed, counters.total)
        };

        match outcome {
            Ok(result) => {
                debug!(
                    task_id = %task.id,
                    duration_ms = duration.as_millis() as u64,
                    "task completed"
                );
                for observer in &self.observers {
                    observer.on_task_complete(task, result, duration);
                }
            }
            Err(error) => {
                warn!(
                    task_id = %task.id,
                    duration_ms = duration.as_millis() as u64,
                    error = %error,
                    "task failed"
                );
                for observer in &self.observers {
                    observer.on_task_error(task, error, duration);
                }
            }
        }

        for observer in &self.observers {
            observer.on_progress(completed, total);
        }
    }
}
