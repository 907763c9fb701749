//! Bounded multi-producer/multi-consumer work queue with per-key status
//! tracking.
//!
//! Producers submit argument keys with [`JobQueue::put`]; worker threads
//! pop them with [`JobQueue::get_arg`]/[`JobQueue::get_args`] and report
//! [`JobQueue::done`] or [`JobQueue::failed`]; readers block on
//! [`JobQueue::get_result`] for a specific key. Each key moves through
//! `Pending → InProgress → (Done | Failed)` exactly once per submission
//! cycle.
//!
//! # Invariants
//! - Exactly one consumer pop transitions a key out of `Pending`.
//! - Exactly one terminal call (`done` or `failed`) per `InProgress` key.
//! - `get_result` observes effects-before of the terminal call
//!   (happens-before via the queue mutex).
//! - Ordering between distinct keys is unspecified; submission order is
//!   not preserved across consumers.
//!
//! # Shutdown
//! [`JobQueue::stop`] wakes every waiter. Consumers keep draining the
//! pending deque and get `None` once it is empty; result readers for keys
//! that have not reached a terminal state fail immediately instead of
//! blocking forever. A supervisor that has joined its workers calls
//! [`JobQueue::fail_remaining`] so no key is left dangling.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use ahash::AHashMap;

/// Default bound on `pending + in_progress` keys.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Lifecycle state of a submitted key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Submitted, not yet claimed by a consumer.
    Pending,
    /// Claimed by a consumer, result outstanding.
    InProgress,
    /// Completed with a result.
    Done,
    /// Completed without a result.
    Failed,
}

impl JobStatus {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

struct Inner<A, R> {
    pending: VecDeque<A>,
    status: AHashMap<A, JobStatus>,
    results: AHashMap<A, R>,
    in_progress: usize,
    stopped: bool,
}

/// Bounded MPMC coordinator keyed on argument `A`, carrying result `R`.
pub struct JobQueue<A, R> {
    inner: Mutex<Inner<A, R>>,
    capacity: usize,
    arg_ready: Condvar,
    result_ready: Condvar,
    space_ready: Condvar,
}

impl<A, R> JobQueue<A, R>
where
    A: Clone + Eq + Hash,
{
    /// Creates a queue with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a queue bounded to `capacity` unfinished keys.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                status: AHashMap::new(),
                results: AHashMap::new(),
                in_progress: 0,
                stopped: false,
            }),
            capacity: capacity.max(1),
            arg_ready: Condvar::new(),
            result_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<A, R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, Inner<A, R>>,
    ) -> MutexGuard<'a, Inner<A, R>> {
        condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends arguments to the pending deque, marking each `Pending`.
    ///
    /// Blocks while `pending + in_progress` is at capacity. A key that is
    /// already pending or in progress is not enqueued again; a key in a
    /// terminal state is overwritten and re-enqueued. Returns `false`
    /// without enqueueing further keys once the queue is stopped.
    pub fn put<I>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = A>,
    {
        let mut inner = self.lock();
        for arg in args {
            loop {
                if inner.stopped {
                    return false;
                }
                if inner.pending.len() + inner.in_progress < self.capacity {
                    break;
                }
                inner = self.wait(&self.space_ready, inner);
            }
            if let Some(status) = inner.status.get(&arg) {
                if !status.is_terminal() {
                    continue;
                }
            }
            inner.results.remove(&arg);
            inner.status.insert(arg.clone(), JobStatus::Pending);
            inner.pending.push_back(arg);
            self.arg_ready.notify_one();
        }
        true
    }

    /// Consumer pop: blocks until an argument is available or the queue is
    /// stopped with nothing pending. The returned key is `InProgress`.
    pub fn get_arg(&self) -> Option<A> {
        let mut inner = self.lock();
        loop {
            if let Some(arg) = inner.pending.pop_front() {
                inner.status.insert(arg.clone(), JobStatus::InProgress);
                inner.in_progress += 1;
                self.space_ready.notify_all();
                return Some(arg);
            }
            if inner.stopped {
                return None;
            }
            inner = self.wait(&self.arg_ready, inner);
        }
    }

    /// Batched consumer pop: up to `max` arguments in submission order.
    ///
    /// Returns a non-empty batch, or `None` once the queue is stopped and
    /// drained.
    pub fn get_args(&self, max: usize) -> Option<Vec<A>> {
        let max = max.max(1);
        let mut inner = self.lock();
        loop {
            if !inner.pending.is_empty() {
                let take = inner.pending.len().min(max);
                let mut batch = Vec::with_capacity(take);
                for _ in 0..take {
                    if let Some(arg) = inner.pending.pop_front() {
                        inner.status.insert(arg.clone(), JobStatus::InProgress);
                        inner.in_progress += 1;
                        batch.push(arg);
                    }
                }
                self.space_ready.notify_all();
                return Some(batch);
            }
            if inner.stopped {
                return None;
            }
            inner = self.wait(&self.arg_ready, inner);
        }
    }

    /// Stores a result and marks the key `Done`, waking result waiters.
    pub fn done(&self, arg: A, result: R) {
        let mut inner = self.lock();
        if inner.status.get(&arg) == Some(&JobStatus::InProgress) {
            inner.in_progress -= 1;
        }
        inner.status.insert(arg.clone(), JobStatus::Done);
        inner.results.insert(arg, result);
        self.result_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Marks the key `Failed`, waking result waiters.
    pub fn failed(&self, arg: &A) {
        let mut inner = self.lock();
        if inner.status.get(arg) == Some(&JobStatus::InProgress) {
            inner.in_progress -= 1;
        }
        inner.results.remove(arg);
        inner.status.insert(arg.clone(), JobStatus::Failed);
        self.result_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Blocks until `arg` reaches a terminal state and consumes the entry.
    ///
    /// Returns the result for `Done`, `None` for `Failed` or an unknown
    /// key. When the queue is stopped, a key that is not yet terminal
    /// fails immediately instead of blocking.
    pub fn get_result(&self, arg: &A) -> Option<R> {
        let mut inner = self.lock();
        loop {
            match inner.status.get(arg).copied() {
                None => return None,
                Some(JobStatus::Done) => {
                    inner.status.remove(arg);
                    return inner.results.remove(arg);
                }
                Some(JobStatus::Failed) => {
                    inner.status.remove(arg);
                    return None;
                }
                Some(_) if inner.stopped => return None,
                Some(_) => inner = self.wait(&self.result_ready, inner),
            }
        }
    }

    /// Non-blocking: true if the key is known in any state.
    pub fn has_arg(&self, arg: &A) -> bool {
        self.lock().status.contains_key(arg)
    }

    /// Marks the queue stopped and wakes all waiters.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        self.arg_ready.notify_all();
        self.result_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Supervisor teardown: every non-terminal key becomes `Failed` and
    /// the pending deque is cleared. Call after joining all consumers.
    pub fn fail_remaining(&self) {
        let mut inner = self.lock();
        inner.pending.clear();
        for status in inner.status.values_mut() {
            if !status.is_terminal() {
                *status = JobStatus::Failed;
            }
        }
        inner.in_progress = 0;
        self.result_ready.notify_all();
        self.space_ready.notify_all();
    }
}

impl<A, R> Default for JobQueue<A, R>
where
    A: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
