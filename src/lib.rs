use futures_channel::oneshot;
use futures_executor::block_on;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use thiserror::Error;
use tracing::{debug, error, warn};

const BITS: usize = std::mem::size_of::<usize>() * 8;
const PHASE_BITS: usize = 3;
const COUNT_BITS: usize = BITS - PHASE_BITS;

/// The largest worker count the control word can represent. Growing the pool
/// beyond this bound is refused, never a panic.
pub const CAPACITY: usize = (1 << COUNT_BITS) - 1;

const MAIN_LOCK_POISONED: &str = "could not acquire the main pool lock";
const FIRST_TASK_POISONED: &str = "could not acquire the first task slot";

/// Lifecycle stage of a [`ThreadPool`]. Phases are totally ordered and only
/// ever advance.
///
/// * `Running`: accepting new tasks and processing queued ones.
/// * `Shutdown`: no new tasks accepted, queued tasks still processed.
/// * `Stop`: no new tasks accepted, queued tasks abandoned, in-flight workers
///   signalled.
/// * `Tidying`: all workers have exited, the terminated hook is running.
/// * `Terminated`: the terminated hook has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Running,
    Shutdown,
    Stop,
    Tidying,
    Terminated,
}

#[inline]
fn phase_bits(phase: Phase) -> usize {
    (phase as usize) << COUNT_BITS
}

#[inline]
fn encode(phase: Phase, count: usize) -> usize {
    phase_bits(phase) | count
}

#[inline]
fn phase_of(val: usize) -> Phase {
    match val >> COUNT_BITS {
        0 => Phase::Running,
        1 => Phase::Shutdown,
        2 => Phase::Stop,
        3 => Phase::Tidying,
        _ => Phase::Terminated,
    }
}

#[inline]
fn count_of(val: usize) -> usize {
    val & CAPACITY
}

#[inline]
fn phase_at_least(val: usize, phase: Phase) -> bool {
    val >= phase_bits(phase)
}

#[inline]
fn is_running(val: usize) -> bool {
    val < phase_bits(Phase::Shutdown)
}

/// Struct that stores and handles an `AtomicUsize` combining the pool's
/// lifecycle phase in the topmost bits with the live worker count in the
/// remaining bits. Packing both fields into one word makes sure every update
/// of either field is a single atomic operation, so no reader ever observes a
/// phase from one state paired with a count from another.
struct ControlState {
    word: AtomicUsize,
}

impl ControlState {
    fn new() -> Self {
        ControlState {
            word: AtomicUsize::new(encode(Phase::Running, 0)),
        }
    }

    #[inline]
    fn load(&self) -> usize {
        self.word.load(Ordering::SeqCst)
    }

    #[inline]
    fn phase(&self) -> Phase {
        phase_of(self.load())
    }

    #[inline]
    fn worker_count(&self) -> usize {
        count_of(self.load())
    }

    #[inline]
    fn phase_at_least(&self, phase: Phase) -> bool {
        phase_at_least(self.load(), phase)
    }

    /// Attempt a single compare-and-swap incrementing the worker count by one.
    /// Callers loop themselves because they must re-examine the phase before
    /// retrying.
    fn try_increment_count(&self, expected: usize) -> bool {
        self.word
            .compare_exchange(expected, expected + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Attempt a single compare-and-swap decrementing the worker count by one.
    fn try_decrement_count(&self, expected: usize) -> bool {
        self.word
            .compare_exchange(expected, expected - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Decrement the worker count unconditionally. Only called on paths where
    /// the current worker holds one reservation, so the count cannot be zero.
    fn decrement_count(&self) {
        let old = self.word.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(count_of(old) > 0);
    }

    fn cas(&self, expected: usize, new: usize) -> bool {
        self.word
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn store(&self, val: usize) {
        self.word.store(val, Ordering::SeqCst);
    }

    /// Move the phase forward to `target`, keeping the current worker count.
    /// A no-op if the phase already is at or beyond `target`; the phase never
    /// regresses, even under races.
    fn advance_phase(&self, target: Phase) {
        loop {
            let c = self.load();
            if phase_at_least(c, target) || self.cas(c, encode(target, count_of(c))) {
                return;
            }
        }
    }
}

/// Identifier handed out for every submitted task, usable with
/// [`ThreadPool::remove`] to pull a still-queued task back out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work owned by the pool: the submitted closure plus its [`TaskId`]
/// and an optional cancellation flag shared with a [`JoinHandle`].
///
/// A `Job` is consumed exactly once, either by a worker, by the caller-runs
/// rejection policy, or by being handed back from [`ThreadPool::shutdown_now`].
pub struct Job {
    id: TaskId,
    cancel: Option<Arc<AtomicBool>>,
    work: Work,
}

type Work = Box<dyn FnOnce() + Send + 'static>;

impl Job {
    fn new(id: TaskId, cancel: Option<Arc<AtomicBool>>, work: Work) -> Self {
        Job { id, cancel, work }
    }

    /// The identifier assigned to this task on submission.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the handle belonging to this task has been cancelled. Tasks
    /// without a handle never report cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Run the task, consuming it. A cancelled task is dropped without
    /// running.
    pub fn run(self) {
        if !self.is_cancelled() {
            (self.work)()
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sending half of a worker's wake channel, held by the pool to interrupt a
/// blocked queue wait. The channel holds at most one pending wake; further
/// wakes coalesce.
pub struct WakeHandle {
    sender: crossbeam_channel::Sender<()>,
}

impl WakeHandle {
    fn wake(&self) {
        let _ignored_full = self.sender.try_send(());
    }
}

/// Receiving half of a worker's wake channel, owned by the worker thread and
/// passed into every blocking queue wait so the wait can be interrupted.
pub struct WakeSignal {
    receiver: crossbeam_channel::Receiver<()>,
}

impl WakeSignal {
    /// The underlying receiver, for queue implementations that select over it.
    pub fn receiver(&self) -> &crossbeam_channel::Receiver<()> {
        &self.receiver
    }

    /// Discard any pending wake so a stale signal does not leak into the next
    /// wait.
    pub fn drain(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Create a connected wake channel pair.
pub fn wake_channel() -> (WakeHandle, WakeSignal) {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    (WakeHandle { sender }, WakeSignal { receiver })
}

/// Outcome of a blocking wait on a [`WorkQueue`].
#[derive(Debug)]
pub enum Polled {
    /// A task was received.
    Task(Job),
    /// The timeout elapsed without a task arriving.
    TimedOut,
    /// The wait was interrupted through the worker's wake channel. Not an
    /// emptiness signal; callers re-check state and retry.
    Interrupted,
}

/// The queue of pending tasks consumed by the pool.
///
/// Implementations must tolerate concurrent producers and consumers. A
/// [`Polled::TimedOut`] or empty poll result is advisory only; `is_empty` is
/// the authoritative emptiness check and the pool re-consults it wherever the
/// distinction matters.
pub trait WorkQueue: Send + Sync {
    /// Non-blocking insert. Hands the job back if the queue is at capacity.
    fn offer(&self, job: Job) -> Result<(), Job>;

    /// Non-blocking removal of the queue head.
    fn poll_now(&self) -> Option<Job>;

    /// Wait for a task for at most `timeout`, or until interrupted through
    /// `signal`.
    fn poll(&self, timeout: Duration, signal: &WakeSignal) -> Polled;

    /// Wait for a task without bound, or until interrupted through `signal`.
    /// Never returns [`Polled::TimedOut`].
    fn take(&self, signal: &WakeSignal) -> Polled;

    /// Best-effort removal of a queued task by id, returning it if it was
    /// still queued.
    fn remove(&self, id: TaskId) -> Option<Job>;

    /// Best-effort removal of every queued task matching `pred`, returning
    /// how many were dropped.
    fn remove_where(&self, pred: &dyn Fn(&Job) -> bool) -> usize;

    /// Remove and return every currently queued task.
    fn drain(&self) -> Vec<Job>;

    /// Authoritative emptiness check.
    fn is_empty(&self) -> bool;

    /// Number of currently queued tasks.
    fn len(&self) -> usize;
}

/// [`WorkQueue`] implementation on top of a crossbeam channel.
///
/// Comes in three flavors: unbounded, bounded with a fixed capacity, and a
/// rendezvous queue (capacity zero) where `offer` only succeeds while a worker
/// is already waiting, handing the task over directly.
///
/// `remove`, `remove_where` and `drain` sweep the channel by draining it and
/// re-offering the retained tasks in order. The sweep holds a queue-level
/// mutex that briefly blocks producers, which guarantees the re-offer cannot
/// run out of capacity; consumers keep running and may pick tasks out of a
/// sweep, which is equivalent to them having been dequeued just before it.
pub struct ChannelQueue {
    sender: crossbeam_channel::Sender<Job>,
    receiver: crossbeam_channel::Receiver<Job>,
    sweep: Mutex<()>,
}

impl ChannelQueue {
    /// Create a queue without a capacity bound.
    pub fn unbounded() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        ChannelQueue {
            sender,
            receiver,
            sweep: Mutex::new(()),
        }
    }

    /// Create a queue holding at most `capacity` tasks. A capacity of zero
    /// creates a rendezvous queue that never stores tasks.
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        ChannelQueue {
            sender,
            receiver,
            sweep: Mutex::new(()),
        }
    }
}

impl WorkQueue for ChannelQueue {
    fn offer(&self, job: Job) -> Result<(), Job> {
        let _sweep = self.sweep.lock().expect("could not acquire the queue sweep lock");
        self.sender.try_send(job).map_err(|err| err.into_inner())
    }

    fn poll_now(&self) -> Option<Job> {
        self.receiver.try_recv().ok()
    }

    fn poll(&self, timeout: Duration, signal: &WakeSignal) -> Polled {
        select! {
            recv(self.receiver) -> job => match job {
                Ok(job) => Polled::Task(job),
                Err(_) => Polled::Interrupted,
            },
            recv(signal.receiver()) -> _ => Polled::Interrupted,
            default(timeout) => Polled::TimedOut,
        }
    }

    fn take(&self, signal: &WakeSignal) -> Polled {
        select! {
            recv(self.receiver) -> job => match job {
                Ok(job) => Polled::Task(job),
                Err(_) => Polled::Interrupted,
            },
            recv(signal.receiver()) -> _ => Polled::Interrupted,
        }
    }

    fn remove(&self, id: TaskId) -> Option<Job> {
        let _sweep = self.sweep.lock().expect("could not acquire the queue sweep lock");
        let mut found = None;
        let mut kept = Vec::new();
        while let Ok(job) = self.receiver.try_recv() {
            if found.is_none() && job.id() == id {
                found = Some(job);
            } else {
                kept.push(job);
            }
        }
        for job in kept {
            self.sender
                .send(job)
                .expect("could not restore swept task to the queue");
        }
        found
    }

    fn remove_where(&self, pred: &dyn Fn(&Job) -> bool) -> usize {
        let _sweep = self.sweep.lock().expect("could not acquire the queue sweep lock");
        let mut removed = 0;
        let mut kept = Vec::new();
        while let Ok(job) = self.receiver.try_recv() {
            if pred(&job) {
                removed += 1;
            } else {
                kept.push(job);
            }
        }
        for job in kept {
            self.sender
                .send(job)
                .expect("could not restore swept task to the queue");
        }
        removed
    }

    fn drain(&self) -> Vec<Job> {
        let _sweep = self.sweep.lock().expect("could not acquire the queue sweep lock");
        let mut drained = Vec::new();
        while let Ok(job) = self.receiver.try_recv() {
            drained.push(job);
        }
        drained
    }

    fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Factory the pool asks for a new thread whenever it starts a worker.
/// Returning `None` is a recoverable admission failure: the pool rolls the
/// worker back and carries on without the thread.
pub trait ThreadFactory: Send + Sync {
    /// Spawn a thread named `name` running `work`.
    fn new_thread(
        &self,
        name: String,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> Option<thread::JoinHandle<()>>;
}

/// Default [`ThreadFactory`] backed by [`thread::Builder`]. A spawn error is
/// logged and reported as `None`.
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(
        &self,
        name: String,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> Option<thread::JoinHandle<()>> {
        match thread::Builder::new().name(name.clone()).spawn(work) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(thread = %name, error = %err, "failed to spawn worker thread");
                None
            }
        }
    }
}

/// Error returned by [`ThreadPool::try_execute`] and
/// [`ThreadPool::try_evaluate`] when a task is not admitted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// The pool refused admission while still running, i.e. the queue and the
    /// max pool size are both exhausted.
    #[error("task rejected because the pool refused admission")]
    Rejected,
    /// The pool has been shut down and accepts no new tasks.
    #[error("task rejected because the pool has been shut down")]
    Shutdown,
}

/// Borrowed view of a pool handed to a [`RejectionHandler`], exposing the
/// operations the built-in policies are made of so custom handlers can
/// recombine them.
pub struct PoolRef<'a> {
    shared: &'a Arc<PoolData>,
}

impl PoolRef<'_> {
    /// Whether the pool has begun shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Send the job back through regular admission.
    pub fn resubmit(&self, job: Job) -> Result<(), ExecuteError> {
        PoolData::dispatch(self.shared, job)
    }

    /// Remove and return the oldest queued task, if any.
    pub fn poll_oldest(&self) -> Option<Job> {
        self.shared.queue.poll_now()
    }

    /// Number of currently queued tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.shared.ctl.worker_count()
    }
}

/// Custom strategy invoked when admission fails, see
/// [`RejectionPolicy::Custom`].
pub trait RejectionHandler: Send + Sync {
    /// Decide what happens to `job`. Invoked synchronously on the submitting
    /// thread; may run, drop or resubmit the job.
    fn reject(&self, job: Job, pool: &PoolRef<'_>) -> Result<(), ExecuteError>;
}

/// Strategy applied when the pool cannot admit a task: the queue refused it
/// and no worker could be started.
#[derive(Clone)]
pub enum RejectionPolicy {
    /// Signal an error back to the submitter. The default.
    Abort,
    /// Run the task on the submitting thread as a backpressure mechanism,
    /// unless the pool is shut down, in which case the task is dropped.
    CallerRuns,
    /// Drop the task silently.
    Discard,
    /// Drop the oldest queued task and resubmit this one, unless the pool is
    /// shut down, in which case this task is dropped instead.
    DiscardOldest,
    /// Delegate to a user-supplied handler.
    Custom(Arc<dyn RejectionHandler>),
}

impl fmt::Debug for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectionPolicy::Abort => "Abort",
            RejectionPolicy::CallerRuns => "CallerRuns",
            RejectionPolicy::Discard => "Discard",
            RejectionPolicy::DiscardOldest => "DiscardOldest",
            RejectionPolicy::Custom(_) => "Custom",
        })
    }
}

/// A panic captured at the worker boundary while running a task.
pub struct TaskFault {
    payload: Box<dyn Any + Send>,
}

impl TaskFault {
    /// The panic message, if the payload was a string.
    pub fn message(&self) -> Option<&str> {
        self.payload
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| self.payload.downcast_ref::<String>().map(String::as_str))
    }

    /// The raw panic payload.
    pub fn payload(&self) -> &(dyn Any + Send) {
        &*self.payload
    }

    fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFault")
            .field("message", &self.message())
            .finish()
    }
}

/// Extension hooks bracketing task execution and the pool lifecycle. All
/// default to no-ops. `before_execute` and `after_execute` run on the worker
/// thread exactly once per task; `on_terminated` runs exactly once, on
/// whichever thread completes termination.
pub trait PoolHooks: Send + Sync {
    /// Called on the worker thread immediately before a task runs.
    fn before_execute(&self, _task: TaskId) {}

    /// Called on the worker thread after a task ran, with the captured panic
    /// if it did not complete normally.
    fn after_execute(&self, _task: TaskId, _fault: Option<&TaskFault>) {}

    /// Called while shutting down gracefully, before queued tasks finish.
    fn on_shutdown(&self) {}

    /// Called when the pool reaches its terminal state.
    fn on_terminated(&self) {}
}

struct NoopHooks;

impl PoolHooks for NoopHooks {}

/// Handle returned by [`ThreadPool::evaluate`] and
/// [`ThreadPool::try_evaluate`] that allows to block the current thread and
/// wait for the result of a submitted task. This handle communicates with the
/// worker thread using a oneshot channel, blocking the thread when
/// [`try_await_complete()`](JoinHandle::try_await_complete) is called until a
/// message, i.e. the result of the task, is received.
///
/// The handle may also cancel the task: a cancelled task that has not started
/// yet is dropped without running, either when a worker picks it up or when
/// [`ThreadPool::purge`] sweeps it out of the queue.
pub struct JoinHandle<T: Send> {
    receiver: oneshot::Receiver<T>,
    cancel: Arc<AtomicBool>,
    id: TaskId,
}

impl<T: Send> JoinHandle<T> {
    /// Block the current thread until the result of the task is received.
    ///
    /// # Errors
    ///
    /// This function might return a `oneshot::Canceled` if the channel was
    /// broken before the result was received. This is generally the case if
    /// execution of the task panicked or the task was cancelled before it
    /// ran.
    pub fn try_await_complete(self) -> Result<T, oneshot::Canceled> {
        block_on(self.receiver)
    }

    /// Block the current thread until the result of the task is received.
    ///
    /// # Panics
    ///
    /// This function might panic if
    /// [`try_await_complete()`](JoinHandle::try_await_complete) returns
    /// `oneshot::Canceled`. This is generally the case if execution of the
    /// task panicked or the task was cancelled before it ran.
    pub fn await_complete(self) -> T {
        self.try_await_complete()
            .expect("could not receive message because channel was cancelled")
    }

    /// Mark the task as cancelled. A task that already started running is
    /// unaffected; a still-queued task is dropped without running.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](JoinHandle::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// The id of the underlying task.
    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

/// Bounded, dynamically-sized `ThreadPool` with a two-mode shutdown
/// lifecycle.
///
/// This `ThreadPool` has two different pool sizes; a core pool size filled
/// with threads that live for as long as the pool keeps running and a max
/// pool size which describes the maximum amount of worker threads that may
/// live at the same time. Those additional non-core threads have a specific
/// keep_alive time described when creating the `ThreadPool` that defines how
/// long such threads may be idle for without receiving any work before giving
/// up and terminating their work loop. Core threads are subject to the same
/// culling if `allow_core_thread_timeout` is enabled.
///
/// This `ThreadPool` does not spawn any threads until a task is submitted to
/// it. Then it will create a new thread for each task until the core pool
/// size is full. After that, submitted tasks are handed to the work queue; a
/// new thread up to the max pool size is only created if the queue refuses
/// the task. If the queue refuses the task and the pool is already at its max
/// size, the configured [`RejectionPolicy`] decides what happens to the task:
/// signal an error, run it on the submitting thread, drop it, or drop the
/// oldest queued task to make room.
///
/// When creating a new worker this `ThreadPool` tries to increment the worker
/// count using a compare-and-swap mechanism on the control word that also
/// carries the lifecycle phase. If the phase changes underneath the
/// admission, the attempt starts over from the phase check; if only the count
/// changed, the swap is simply retried. That way the pool never starts a
/// worker the current phase forbids.
///
/// The pool is shut down in one of two modes. [`shutdown`](ThreadPool::shutdown)
/// stops admission but lets the workers drain the queue before terminating;
/// [`shutdown_now`](ThreadPool::shutdown_now) additionally abandons queued
/// tasks, handing them back to the caller, and signals every worker so
/// running tasks can observe the cancellation intent through
/// [`task_interrupted`]. Either way the pool eventually reaches its terminal
/// state, observable through [`is_terminated`](ThreadPool::is_terminated)
/// and awaitable through
/// [`await_termination`](ThreadPool::await_termination).
///
/// Cloning the pool produces another handle to the same pool. When the last
/// handle is dropped a graceful [`shutdown`](ThreadPool::shutdown) runs
/// automatically; live workers finish the queued work and exit on their own
/// time. Dropping handles is no substitute for
/// [`await_termination`](ThreadPool::await_termination) when completion
/// matters, since the process may exit before detached workers get to finish.
///
/// Locks are only used for the worker set, its aggregate statistics and the
/// termination condvar; the hot admission path relies on the control word and
/// the work queue alone.
///
/// # Usage
///
/// Create a new `ThreadPool`:
/// ```rust
/// use flex_pool::Builder;
/// use flex_pool::ThreadPool;
/// use std::time::Duration;
/// // core pool size equal to the number of CPUs, max twice that, 60s keep alive
/// let pool = ThreadPool::default();
/// let pool2 = ThreadPool::new(5, 50, Duration::from_secs(60));
/// let pool3 = ThreadPool::new_named(String::from("my_pool"), 5, 50, Duration::from_secs(60));
/// let pool4 = Builder::new().core_size(5).max_size(50).build();
/// ```
///
/// Submit a task and await the result:
/// ```rust
/// use flex_pool::ThreadPool;
/// let pool = ThreadPool::default();
/// let handle = pool.evaluate(|| 4 + 4);
/// assert_eq!(handle.await_complete(), 8);
/// ```
///
/// Shut down and wait for termination:
/// ```rust
/// use flex_pool::ThreadPool;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let pool = ThreadPool::default();
/// let count = Arc::new(AtomicUsize::new(0));
/// for _ in 0..10 {
///     let count = count.clone();
///     pool.execute(move || {
///         count.fetch_add(1, Ordering::Relaxed);
///     });
/// }
/// pool.shutdown();
/// assert!(pool.await_termination(Duration::from_secs(10)));
/// assert_eq!(count.load(Ordering::Relaxed), 10);
/// ```
#[derive(Clone)]
pub struct ThreadPool {
    handle: Arc<PoolHandle>,
}

impl ThreadPool {
    /// Construct a new `ThreadPool` with the specified core pool size, max
    /// pool size and keep_alive time for culled threads. This function does
    /// not spawn any threads. This `ThreadPool` will receive a default name
    /// in the following format: "flex_pool_" + pool number.
    ///
    /// # Panics
    ///
    /// This function will panic if max_size is 0 or lower than core_size.
    pub fn new(core_size: usize, max_size: usize, keep_alive: Duration) -> Self {
        Builder::new()
            .core_size(core_size)
            .max_size(max_size)
            .keep_alive(keep_alive)
            .build()
    }

    /// Construct a new `ThreadPool` with the specified name, core pool size,
    /// max pool size and keep_alive time for culled threads. This function
    /// does not spawn any threads. The name is used as prefix for each worker
    /// thread.
    ///
    /// # Panics
    ///
    /// This function will panic if max_size is 0 or lower than core_size.
    pub fn new_named(name: String, core_size: usize, max_size: usize, keep_alive: Duration) -> Self {
        Builder::new()
            .name(name)
            .core_size(core_size)
            .max_size(max_size)
            .keep_alive(keep_alive)
            .build()
    }

    #[inline]
    fn shared(&self) -> &Arc<PoolData> {
        &self.handle.shared
    }

    /// Submit a new task. If the current worker count is lower than the core
    /// pool size this function will always create a new worker seeded with
    /// the task. Otherwise the task is handed to the work queue, and only if
    /// the queue refuses it a non-core worker up to the max pool size is
    /// created. If that fails as well the configured [`RejectionPolicy`]
    /// runs.
    ///
    /// # Panics
    ///
    /// This function panics if the task is rejected with an error, i.e. under
    /// the [`RejectionPolicy::Abort`] policy. Use
    /// [`try_execute`](ThreadPool::try_execute) to handle rejection
    /// explicitly.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.try_execute(task) {
            panic!("failed to submit task to the pool: {}", err);
        }
    }

    /// Submit a new task and return its [`TaskId`]. See
    /// [`execute`](ThreadPool::execute) for the admission behaviour.
    ///
    /// Never blocks the submitting thread, with one documented exception: the
    /// [`RejectionPolicy::CallerRuns`] policy runs the rejected task inline.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError`] if the task is rejected with an error, i.e.
    /// under the [`RejectionPolicy::Abort`] policy.
    pub fn try_execute<F>(&self, task: F) -> Result<TaskId, ExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = self.shared().new_job(None, Box::new(task));
        let id = job.id();
        PoolData::dispatch(self.shared(), job)?;
        Ok(id)
    }

    /// Submit a task and return a [`JoinHandle`] that may be used to await
    /// the result or cancel the task while it is still queued.
    ///
    /// # Panics
    ///
    /// This function panics if the task is rejected with an error, i.e. under
    /// the [`RejectionPolicy::Abort`] policy. Use
    /// [`try_evaluate`](ThreadPool::try_evaluate) to handle rejection
    /// explicitly.
    pub fn evaluate<R, F>(&self, task: F) -> JoinHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        match self.try_evaluate(task) {
            Ok(handle) => handle,
            Err(err) => panic!("failed to submit task to the pool: {}", err),
        }
    }

    /// Submit a task and return a [`JoinHandle`] that may be used to await
    /// the result or cancel the task while it is still queued.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError`] if the task is rejected with an error, i.e.
    /// under the [`RejectionPolicy::Abort`] policy.
    pub fn try_evaluate<R, F>(&self, task: F) -> Result<JoinHandle<R>, ExecuteError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel::<R>();
        let cancel = Arc::new(AtomicBool::new(false));
        let job = self.shared().new_job(
            Some(Arc::clone(&cancel)),
            Box::new(move || {
                let result = task();
                // if the receiver was dropped that means the caller was not interested in the result
                let _ignored_result = sender.send(result);
            }),
        );
        let id = job.id();
        PoolData::dispatch(self.shared(), job)?;
        Ok(JoinHandle {
            receiver,
            cancel,
            id,
        })
    }

    /// Initiate a graceful shutdown: previously submitted tasks, including
    /// queued ones, are still executed, but no new tasks will be accepted.
    /// Idle workers are woken so they observe the new phase promptly. Has no
    /// additional effect if already shut down.
    ///
    /// This method does not wait for the queue to drain; use
    /// [`await_termination`](ThreadPool::await_termination) for that.
    pub fn shutdown(&self) {
        self.shared().shutdown();
    }

    /// Initiate an immediate stop: no new tasks are accepted, queued tasks
    /// are removed and returned, and every worker is signalled so running
    /// tasks can observe the cancellation intent through
    /// [`task_interrupted`]. There are no guarantees beyond the signal;
    /// a task that never checks it runs to completion.
    pub fn shutdown_now(&self) -> Vec<Job> {
        self.shared().shutdown_now()
    }

    /// Whether the pool has begun shutting down, gracefully or not.
    pub fn is_shutdown(&self) -> bool {
        self.shared().is_shutdown()
    }

    /// Whether the pool is shutting down but has not yet reached its terminal
    /// state.
    pub fn is_terminating(&self) -> bool {
        let c = self.shared().ctl.load();
        phase_at_least(c, Phase::Shutdown) && !phase_at_least(c, Phase::Terminated)
    }

    /// Whether the pool has reached its terminal state: shut down with every
    /// worker exited and the terminated hook completed.
    pub fn is_terminated(&self) -> bool {
        self.shared().ctl.phase_at_least(Phase::Terminated)
    }

    /// Block until the pool reaches its terminal state or the timeout
    /// elapses, whichever happens first. Returns whether the pool terminated
    /// within the timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let shared = self.shared();
        let deadline = Instant::now().checked_add(timeout);
        let mut workers = shared.workers.lock().expect(MAIN_LOCK_POISONED);
        loop {
            if shared.ctl.phase_at_least(Phase::Terminated) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = shared
                        .termination
                        .wait_timeout(workers, deadline - now)
                        .expect(MAIN_LOCK_POISONED);
                    workers = guard;
                }
                None => {
                    workers = shared.termination.wait(workers).expect(MAIN_LOCK_POISONED);
                }
            }
        }
    }

    /// Get the core pool size.
    pub fn get_core_size(&self) -> usize {
        self.shared().core_size()
    }

    /// Set the core pool size. If the new size is below the current worker
    /// count, idle workers are woken so the excess ones cull themselves; if
    /// it is larger than before, new workers are eagerly started as long as
    /// the queue holds work for them.
    ///
    /// # Panics
    ///
    /// Panics if `core_size` exceeds the max pool size.
    pub fn set_core_size(&self, core_size: usize) {
        let shared = self.shared();
        if core_size > shared.max_size() {
            panic!("core pool size may not exceed the max pool size");
        }
        let old = shared.core_size.swap(core_size, Ordering::SeqCst);
        if shared.ctl.worker_count() > core_size {
            shared.interrupt_idle_workers(false);
        } else if core_size > old {
            let mut headroom = (core_size - old).min(shared.queue.len());
            while headroom > 0 && PoolData::add_worker(shared, None, true).is_ok() {
                if shared.queue.is_empty() {
                    break;
                }
                headroom -= 1;
            }
        }
    }

    /// Get the max pool size.
    pub fn get_max_size(&self) -> usize {
        self.shared().max_size()
    }

    /// Set the max pool size. If the new size is below the current worker
    /// count, idle workers are woken so the excess ones cull themselves.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0 or lower than the core pool size.
    pub fn set_max_size(&self, max_size: usize) {
        let shared = self.shared();
        if max_size == 0 || max_size < shared.core_size() {
            panic!("max_size must be greater than 0 and greater or equal to the core pool size");
        }
        shared.max_size.store(max_size, Ordering::SeqCst);
        if shared.ctl.worker_count() > max_size {
            shared.interrupt_idle_workers(false);
        }
    }

    /// Get the keep_alive duration for workers subject to idle culling.
    pub fn get_keep_alive(&self) -> Duration {
        self.shared().keep_alive()
    }

    /// Set the keep_alive duration for workers subject to idle culling. A
    /// decrease wakes idle workers so waits in progress pick up the shorter
    /// bound.
    ///
    /// # Panics
    ///
    /// Panics if `keep_alive` is zero while core threads are allowed to time
    /// out.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        let shared = self.shared();
        if keep_alive.is_zero() && shared.allows_core_timeout() {
            panic!("keep_alive must be non-zero while core threads are allowed to time out");
        }
        let nanos = duration_to_nanos(keep_alive);
        let old = shared.keep_alive_nanos.swap(nanos, Ordering::SeqCst);
        if nanos < old {
            shared.interrupt_idle_workers(false);
        }
    }

    /// Whether core threads are subject to idle culling.
    pub fn allows_core_thread_timeout(&self) -> bool {
        self.shared().allows_core_timeout()
    }

    /// Configure whether core threads are subject to idle culling. Enabling
    /// it wakes idle workers so they re-enter a timed wait.
    ///
    /// # Panics
    ///
    /// Panics if enabled while the keep_alive duration is zero.
    pub fn allow_core_thread_timeout(&self, value: bool) {
        let shared = self.shared();
        if value && shared.keep_alive().is_zero() {
            panic!("keep_alive must be non-zero while core threads are allowed to time out");
        }
        let old = shared.allow_core_timeout.swap(value, Ordering::SeqCst);
        if value && !old {
            shared.interrupt_idle_workers(false);
        }
    }

    /// Replace the thread factory used for workers started from now on.
    pub fn set_thread_factory(&self, factory: Arc<dyn ThreadFactory>) {
        *self
            .shared()
            .factory
            .lock()
            .expect("could not acquire the thread factory lock") = factory;
    }

    /// Replace the rejection policy applied to submissions from now on.
    pub fn set_rejection_policy(&self, policy: RejectionPolicy) {
        *self
            .shared()
            .policy
            .lock()
            .expect("could not acquire the rejection policy lock") = policy;
    }

    /// The rejection policy currently in effect.
    pub fn get_rejection_policy(&self) -> RejectionPolicy {
        self.shared()
            .policy
            .lock()
            .expect("could not acquire the rejection policy lock")
            .clone()
    }

    /// Start one idle core worker ahead of demand. Returns whether a worker
    /// was started.
    pub fn prestart_core_thread(&self) -> bool {
        let shared = self.shared();
        shared.ctl.worker_count() < shared.core_size()
            && PoolData::add_worker(shared, None, true).is_ok()
    }

    /// Start idle core workers until the core pool is full, returning how
    /// many were started.
    pub fn prestart_all_core_threads(&self) -> usize {
        let mut started = 0;
        while self.prestart_core_thread() {
            started += 1;
        }
        started
    }

    /// Get the number of live workers, includes all workers waiting for work
    /// or executing tasks. Reads the lock-free control word.
    pub fn get_current_worker_count(&self) -> usize {
        self.shared().ctl.worker_count()
    }

    /// Current size of the worker set. Unlike
    /// [`get_current_worker_count`](ThreadPool::get_current_worker_count)
    /// this takes the pool lock and reports 0 once the pool is tidying up.
    pub fn pool_size(&self) -> usize {
        let shared = self.shared();
        let workers = shared.workers.lock().expect(MAIN_LOCK_POISONED);
        if shared.ctl.phase_at_least(Phase::Tidying) {
            0
        } else {
            workers.members.len()
        }
    }

    /// Estimate of the number of workers currently running a task.
    pub fn active_count(&self) -> usize {
        let workers = self.shared().workers.lock().expect(MAIN_LOCK_POISONED);
        workers
            .members
            .values()
            .filter(|worker| worker.flag.is_locked())
            .count()
    }

    /// The largest worker set size ever reached.
    pub fn largest_pool_size(&self) -> usize {
        self.shared()
            .workers
            .lock()
            .expect(MAIN_LOCK_POISONED)
            .largest_pool_size
    }

    /// Approximate number of tasks that have completed execution, including
    /// tasks that panicked.
    pub fn completed_task_count(&self) -> u64 {
        let workers = self.shared().workers.lock().expect(MAIN_LOCK_POISONED);
        let mut count = workers.completed_task_count;
        for worker in workers.members.values() {
            count += worker.completed.load(Ordering::Relaxed);
        }
        count
    }

    /// Approximate total number of tasks that have ever been scheduled:
    /// completed, running and queued.
    pub fn task_count(&self) -> u64 {
        let shared = self.shared();
        let workers = shared.workers.lock().expect(MAIN_LOCK_POISONED);
        let mut count = workers.completed_task_count;
        for worker in workers.members.values() {
            count += worker.completed.load(Ordering::Relaxed);
            if worker.flag.is_locked() {
                count += 1;
            }
        }
        count + shared.queue.len() as u64
    }

    /// Approximate number of tasks ever submitted, accepted or not.
    pub fn submitted_count(&self) -> u64 {
        self.shared().task_number.load(Ordering::Relaxed)
    }

    /// The work queue, for monitoring. Draining or mutating it directly
    /// bypasses the pool's bookkeeping.
    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.shared().queue)
    }

    /// Best-effort removal of a still-queued task. Returns whether the task
    /// was removed before a worker picked it up.
    pub fn remove(&self, id: TaskId) -> bool {
        let shared = self.shared();
        let removed = shared.queue.remove(id).is_some();
        // removing the last queued task may be what termination waits for
        shared.try_terminate();
        removed
    }

    /// Best-effort removal of queued tasks that have been cancelled through
    /// their [`JoinHandle`], returning how many were dropped.
    pub fn purge(&self) -> usize {
        let shared = self.shared();
        let removed = shared.queue.remove_where(&|job| job.is_cancelled());
        shared.try_terminate();
        removed
    }

    /// Return the name of this pool, used as prefix for each worker thread.
    pub fn get_name(&self) -> &str {
        &self.shared().pool_name
    }
}

impl Default for ThreadPool {
    /// Create default `ThreadPool` with the core pool size being equal to the
    /// number of cpus and the max_size being twice the core size with a 60
    /// second timeout.
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        ThreadPool::new(
            num_cpus,
            std::cmp::max(num_cpus, num_cpus * 2),
            Duration::from_secs(60),
        )
    }
}

/// A helper struct to aid creating a new [`ThreadPool`] using default values
/// where no value was explicitly specified.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    core_size: Option<usize>,
    max_size: Option<usize>,
    keep_alive: Option<Duration>,
    allow_core_timeout: bool,
    queue: Option<Arc<dyn WorkQueue>>,
    factory: Option<Arc<dyn ThreadFactory>>,
    policy: Option<RejectionPolicy>,
    hooks: Option<Arc<dyn PoolHooks>>,
}

impl Builder {
    /// Create a new `Builder`.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Specify the name of the `ThreadPool` that will be used as prefix for
    /// the name of each worker thread. By default the name is "flex_pool_x"
    /// with x being a static pool counter.
    pub fn name(mut self, name: String) -> Builder {
        self.name = Some(name);
        self
    }

    /// Specify the core pool size for the `ThreadPool`. Workers up to the
    /// core pool size are started eagerly, one per submitted task, and stay
    /// alive while the pool runs unless core thread timeout is enabled.
    pub fn core_size(mut self, size: usize) -> Builder {
        self.core_size = Some(size);
        self
    }

    /// Specify the maximum pool size this `ThreadPool` may scale up to. Above
    /// the core pool size, additional workers are only started when the work
    /// queue refuses a task, and they remain idle for at most the keep_alive
    /// duration before culling themselves.
    pub fn max_size(mut self, size: usize) -> Builder {
        self.max_size = Some(size);
        self
    }

    /// Specify the duration for which workers above the core pool size remain
    /// alive while not receiving any work before giving up and terminating.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Builder {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Subject core workers to the same keep_alive idle culling as non-core
    /// workers, allowing the pool to shrink to zero threads when idle.
    pub fn allow_core_thread_timeout(mut self) -> Builder {
        self.allow_core_timeout = true;
        self
    }

    /// Specify the work queue holding tasks that could not be handed to a
    /// worker directly. Defaults to an unbounded [`ChannelQueue`]; a bounded
    /// queue makes the pool grow towards its max size under load, a
    /// rendezvous queue ([`ChannelQueue::bounded(0)`](ChannelQueue::bounded))
    /// makes it grow whenever no worker is idle.
    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Builder {
        self.queue = Some(queue);
        self
    }

    /// Specify the factory asked for a thread whenever the pool starts a
    /// worker. Defaults to [`DefaultThreadFactory`].
    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Builder {
        self.factory = Some(factory);
        self
    }

    /// Specify what happens to tasks the pool cannot admit. Defaults to
    /// [`RejectionPolicy::Abort`].
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Builder {
        self.policy = Some(policy);
        self
    }

    /// Install extension hooks bracketing task execution and termination.
    pub fn hooks(mut self, hooks: Arc<dyn PoolHooks>) -> Builder {
        self.hooks = Some(hooks);
        self
    }

    /// Build the `ThreadPool` using the parameters previously supplied to
    /// this `Builder`, using the number of CPUs as default core size, twice
    /// the core size as max size, 60 seconds keep_alive and the default
    /// naming (flex_pool_{pool_number}).
    ///
    /// # Panics
    ///
    /// Building might panic if the `max_size` is 0 or lower than `core_size`,
    /// or if core thread timeout is enabled with a zero keep_alive.
    pub fn build(self) -> ThreadPool {
        use std::cmp::{max, min};

        let core_size = self.core_size.unwrap_or_else(|| {
            let num_cpus = num_cpus::get();
            if let Some(max_size) = self.max_size {
                min(CAPACITY, min(num_cpus, max_size))
            } else {
                min(CAPACITY, num_cpus)
            }
        });
        // handle potential overflow: try using twice the core_size or return core_size
        let max_size = self
            .max_size
            .unwrap_or_else(|| min(CAPACITY, max(core_size, core_size * 2)));
        let keep_alive = self.keep_alive.unwrap_or_else(|| Duration::from_secs(60));

        if max_size == 0 || max_size < core_size {
            panic!("max_size must be greater than 0 and greater or equal to the core pool size");
        }
        if self.allow_core_timeout && keep_alive.is_zero() {
            panic!("keep_alive must be non-zero while core threads are allowed to time out");
        }

        let name = self.name.unwrap_or_else(|| {
            static POOL_COUNTER: AtomicUsize = AtomicUsize::new(1);
            format!("flex_pool_{}", POOL_COUNTER.fetch_add(1, Ordering::Relaxed))
        });

        let shared = Arc::new(PoolData {
            pool_name: name,
            ctl: ControlState::new(),
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(ChannelQueue::unbounded())),
            core_size: AtomicUsize::new(core_size),
            max_size: AtomicUsize::new(max_size),
            keep_alive_nanos: AtomicU64::new(duration_to_nanos(keep_alive)),
            allow_core_timeout: AtomicBool::new(self.allow_core_timeout),
            factory: Mutex::new(
                self.factory
                    .unwrap_or_else(|| Arc::new(DefaultThreadFactory)),
            ),
            policy: Mutex::new(self.policy.unwrap_or(RejectionPolicy::Abort)),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            workers: Mutex::new(WorkerSet::default()),
            termination: Condvar::new(),
            worker_number: AtomicUsize::new(1),
            task_number: AtomicU64::new(0),
        });

        ThreadPool {
            handle: Arc::new(PoolHandle { shared }),
        }
    }
}

fn duration_to_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

/// Owner of the shared pool state on behalf of all user-facing handles.
/// Worker threads hold the shared state directly, so dropping the last
/// user handle can trigger a graceful shutdown without tearing the state
/// out from under live workers.
struct PoolHandle {
    shared: Arc<PoolData>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        // best effort: stop admission and let live workers drain the queue
        if !self.shared.is_shutdown() {
            self.shared.shutdown();
        }
    }
}

/// struct containing data shared between all handles and workers of one pool
struct PoolData {
    pool_name: String,
    ctl: ControlState,
    queue: Arc<dyn WorkQueue>,
    core_size: AtomicUsize,
    max_size: AtomicUsize,
    keep_alive_nanos: AtomicU64,
    allow_core_timeout: AtomicBool,
    factory: Mutex<Arc<dyn ThreadFactory>>,
    policy: Mutex<RejectionPolicy>,
    hooks: Arc<dyn PoolHooks>,
    workers: Mutex<WorkerSet>,
    termination: Condvar,
    worker_number: AtomicUsize,
    task_number: AtomicU64,
}

/// The pool's collection of live workers plus the aggregate statistics that
/// share its mutex. Membership only ever changes while holding the pool's
/// main lock.
#[derive(Default)]
struct WorkerSet {
    members: HashMap<usize, Arc<WorkerState>>,
    largest_pool_size: usize,
    completed_task_count: u64,
}

impl PoolData {
    #[inline]
    fn core_size(&self) -> usize {
        self.core_size.load(Ordering::SeqCst)
    }

    #[inline]
    fn max_size(&self) -> usize {
        self.max_size.load(Ordering::SeqCst)
    }

    #[inline]
    fn keep_alive(&self) -> Duration {
        Duration::from_nanos(self.keep_alive_nanos.load(Ordering::SeqCst))
    }

    #[inline]
    fn allows_core_timeout(&self) -> bool {
        self.allow_core_timeout.load(Ordering::SeqCst)
    }

    #[inline]
    fn is_shutdown(&self) -> bool {
        self.ctl.phase_at_least(Phase::Shutdown)
    }

    fn new_job(&self, cancel: Option<Arc<AtomicBool>>, work: Work) -> Job {
        let id = TaskId(self.task_number.fetch_add(1, Ordering::Relaxed));
        Job::new(id, cancel, work)
    }

    /// Decide what happens to one submitted task: start a seeded core worker,
    /// enqueue, start a seeded non-core worker, or reject.
    fn dispatch(pool: &Arc<PoolData>, job: Job) -> Result<(), ExecuteError> {
        let mut job = job;
        let c = pool.ctl.load();
        if count_of(c) < pool.core_size() {
            match PoolData::add_worker(pool, Some(job), true) {
                Ok(()) => return Ok(()),
                Err(Some(returned)) => job = returned,
                Err(None) => return Ok(()),
            }
        }

        let c = pool.ctl.load();
        if is_running(c) {
            let id = job.id();
            match pool.queue.offer(job) {
                Ok(()) => {
                    // the pool may have started shutting down while enqueueing
                    let recheck = pool.ctl.load();
                    if !is_running(recheck) {
                        if let Some(job) = pool.queue.remove(id) {
                            return PoolData::reject_with_policy(pool, job);
                        }
                    } else if count_of(recheck) == 0 {
                        // all workers exited between the count check and the
                        // enqueue, make sure the queued task is not orphaned
                        let _ = PoolData::add_worker(pool, None, false);
                    }
                    return Ok(());
                }
                Err(returned) => job = returned,
            }
        }

        match PoolData::add_worker(pool, Some(job), false) {
            Ok(()) => Ok(()),
            Err(Some(job)) => PoolData::reject_with_policy(pool, job),
            Err(None) => Ok(()),
        }
    }

    fn reject_with_policy(pool: &Arc<PoolData>, job: Job) -> Result<(), ExecuteError> {
        let policy = pool
            .policy
            .lock()
            .expect("could not acquire the rejection policy lock")
            .clone();
        debug!(pool = %pool.pool_name, task = %job.id(), policy = ?policy, "task rejected");
        match policy {
            RejectionPolicy::Abort => Err(if pool.is_shutdown() {
                ExecuteError::Shutdown
            } else {
                ExecuteError::Rejected
            }),
            RejectionPolicy::CallerRuns => {
                if !pool.is_shutdown() {
                    job.run();
                }
                Ok(())
            }
            RejectionPolicy::Discard => Ok(()),
            RejectionPolicy::DiscardOldest => {
                if pool.is_shutdown() {
                    return Ok(());
                }
                drop(pool.queue.poll_now());
                // recursion is bounded, the queue shrinks by one per attempt
                PoolData::dispatch(pool, job)
            }
            RejectionPolicy::Custom(handler) => handler.reject(job, &PoolRef { shared: pool }),
        }
    }

    /// Admit one new worker against the chosen capacity bound, optionally
    /// seeded with a first task that skips the queue round-trip. On refusal
    /// or rollback the seed task is handed back to the caller.
    fn add_worker(
        pool: &Arc<PoolData>,
        first_task: Option<Job>,
        core_limit: bool,
    ) -> Result<(), Option<Job>> {
        let seeded = first_task.is_some();
        'phase_check: loop {
            let c = pool.ctl.load();
            let phase = phase_of(c);
            // once shutting down, the only workers still admitted are
            // unseeded ones draining a non-empty queue
            if phase >= Phase::Shutdown
                && !(phase == Phase::Shutdown && !seeded && !pool.queue.is_empty())
            {
                return Err(first_task);
            }
            let mut c = c;
            loop {
                let bound = if core_limit {
                    pool.core_size()
                } else {
                    pool.max_size()
                };
                if count_of(c) >= bound.min(CAPACITY) {
                    return Err(first_task);
                }
                if pool.ctl.try_increment_count(c) {
                    break 'phase_check;
                }
                c = pool.ctl.load();
                if phase_of(c) != phase {
                    continue 'phase_check;
                }
                // only the count moved, retry the swap against the new value
            }
        }

        // count reserved; build the worker record outside any lock
        let id = pool.worker_number.fetch_add(1, Ordering::Relaxed);
        let (wake, signal) = wake_channel();
        let state = Arc::new(WorkerState {
            id,
            first_task: Mutex::new(first_task),
            flag: ExclusionFlag::new(),
            interrupted: AtomicBool::new(false),
            wake,
            completed: AtomicU64::new(0),
            thread: Mutex::new(None),
        });

        let mut added = false;
        {
            let mut workers = pool.workers.lock().expect(MAIN_LOCK_POISONED);
            // re-verify under the lock, the world may have shut down since
            // the reservation
            let phase = pool.ctl.phase();
            if phase == Phase::Running || (phase == Phase::Shutdown && !seeded) {
                workers.members.insert(id, Arc::clone(&state));
                if workers.members.len() > workers.largest_pool_size {
                    workers.largest_pool_size = workers.members.len();
                }
                added = true;
            }
        }

        let mut started = false;
        if added {
            let name = format!("{}_thread_{}", pool.pool_name, id);
            let factory = pool
                .factory
                .lock()
                .expect("could not acquire the thread factory lock")
                .clone();
            let thread_pool = Arc::clone(pool);
            let thread_state = Arc::clone(&state);
            let body: Box<dyn FnOnce() + Send + 'static> =
                Box::new(move || PoolData::run_worker(thread_pool, thread_state, signal));
            if let Some(handle) = factory.new_thread(name, body) {
                *state
                    .thread
                    .lock()
                    .expect("could not acquire the worker thread slot") = Some(handle);
                started = true;
                debug!(pool = %pool.pool_name, worker = id, "worker started");
            }
        }

        if !started {
            let leftover = state.first_task.lock().expect(FIRST_TASK_POISONED).take();
            pool.add_worker_failed(id, added);
            return Err(leftover);
        }
        Ok(())
    }

    /// Roll back a worker admission that failed after the count reservation.
    fn add_worker_failed(&self, id: usize, added: bool) {
        if added {
            let mut workers = self.workers.lock().expect(MAIN_LOCK_POISONED);
            workers.members.remove(&id);
        }
        self.ctl.decrement_count();
        // this removal may be the last thing blocking termination
        self.try_terminate();
    }

    /// The work loop of one worker thread.
    fn run_worker(pool: Arc<PoolData>, state: Arc<WorkerState>, signal: WakeSignal) {
        CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(Arc::clone(&state)));
        let mut task = state.first_task.lock().expect(FIRST_TASK_POISONED).take();
        state.flag.mark_started();
        let mut guard = WorkerExitGuard {
            pool: &pool,
            state: &state,
            completed_abruptly: true,
        };

        loop {
            let job = match task.take() {
                Some(job) => job,
                None => match pool.get_task(&signal) {
                    Some(job) => job,
                    None => break,
                },
            };

            state.flag.lock();
            // once stopping, make sure the task observes the cancellation
            // intent; otherwise clear a stale signal delivered while idle so
            // it does not leak into the task
            if pool.ctl.phase_at_least(Phase::Stop) {
                state.set_interrupted();
            } else {
                state.clear_interrupted(&signal);
                if pool.ctl.phase_at_least(Phase::Stop) {
                    state.set_interrupted();
                }
            }

            let id = job.id();
            pool.hooks.before_execute(id);
            let outcome = catch_unwind(AssertUnwindSafe(|| job.run()));
            let fault = outcome.err().map(|payload| TaskFault { payload });
            pool.hooks.after_execute(id, fault.as_ref());
            state.completed.fetch_add(1, Ordering::Relaxed);
            state.flag.unlock();

            if let Some(fault) = fault {
                error!(
                    pool = %pool.pool_name,
                    worker = state.id,
                    task = %id,
                    "task panicked: {}",
                    fault.message().unwrap_or("opaque panic payload")
                );
                // the fault propagates so the thread exits abruptly; the exit
                // guard still runs the worker exit bookkeeping
                resume_unwind(fault.into_payload());
            }
        }

        guard.completed_abruptly = false;
    }

    /// One worker's blocking wait for its next task, including the decision
    /// whether this worker is subject to idle culling. Returning `None` means
    /// the worker must exit and its count reservation has been released.
    fn get_task(&self, signal: &WakeSignal) -> Option<Job> {
        let mut timed_out = false;
        loop {
            let c = self.ctl.load();
            let phase = phase_of(c);
            if phase >= Phase::Shutdown && (phase >= Phase::Stop || self.queue.is_empty()) {
                self.ctl.decrement_count();
                return None;
            }

            let wc = count_of(c);
            let timed = self.allows_core_timeout() || wc > self.core_size();
            if (wc > self.max_size() || (timed && timed_out))
                && (wc > 1 || self.queue.is_empty())
            {
                // never let the last worker exit while work is queued
                if self.ctl.try_decrement_count(c) {
                    return None;
                }
                continue;
            }

            let polled = if timed {
                self.queue.poll(self.keep_alive(), signal)
            } else {
                self.queue.take(signal)
            };
            match polled {
                Polled::Task(job) => return Some(job),
                Polled::TimedOut => timed_out = true,
                // a wake is not a timeout, re-check the phase and wait again
                Polled::Interrupted => timed_out = false,
            }
        }
    }

    /// Bookkeeping for a worker leaving its run loop, cleanly or abruptly.
    fn process_worker_exit(pool: &Arc<PoolData>, state: &Arc<WorkerState>, completed_abruptly: bool) {
        if completed_abruptly {
            // a clean exit already released the reservation in get_task
            pool.ctl.decrement_count();
        }

        {
            let mut workers = pool.workers.lock().expect(MAIN_LOCK_POISONED);
            workers.completed_task_count += state.completed.load(Ordering::Relaxed);
            workers.members.remove(&state.id);
        }
        // the exit guard runs on the worker thread itself, detach the handle
        drop(
            state
                .thread
                .lock()
                .expect("could not acquire the worker thread slot")
                .take(),
        );
        debug!(
            pool = %pool.pool_name,
            worker = state.id,
            abrupt = completed_abruptly,
            "worker exited"
        );

        pool.try_terminate();

        let c = pool.ctl.load();
        if !phase_at_least(c, Phase::Stop) {
            if !completed_abruptly {
                let mut min = if pool.allows_core_timeout() {
                    0
                } else {
                    pool.core_size()
                };
                if min == 0 && !pool.queue.is_empty() {
                    min = 1;
                }
                if count_of(c) >= min {
                    return;
                }
            }
            // an abrupt exit must never silently shrink the pool below policy
            let _ = PoolData::add_worker(pool, None, false);
        }
    }

    /// Transition to the terminal state if shutdown has been requested and
    /// nothing is left to do. Invoked after every action that might unblock
    /// termination.
    fn try_terminate(&self) {
        loop {
            let c = self.ctl.load();
            if is_running(c)
                || phase_at_least(c, Phase::Tidying)
                || (phase_of(c) == Phase::Shutdown && !self.queue.is_empty())
            {
                return;
            }
            if count_of(c) != 0 {
                // propagate the shutdown signal one idle worker at a time
                // instead of waking the whole set on every exit
                self.interrupt_idle_workers(true);
                return;
            }

            let guard = self.workers.lock().expect(MAIN_LOCK_POISONED);
            if self.ctl.cas(c, encode(Phase::Tidying, 0)) {
                if let Err(_payload) =
                    catch_unwind(AssertUnwindSafe(|| self.hooks.on_terminated()))
                {
                    error!(pool = %self.pool_name, "terminated hook panicked");
                }
                self.ctl.store(encode(Phase::Terminated, 0));
                debug!(pool = %self.pool_name, "pool terminated");
                self.termination.notify_all();
                return;
            }
            drop(guard);
            // lost the race against a phase or count change, retry
        }
    }

    fn shutdown(&self) {
        {
            let workers = self.workers.lock().expect(MAIN_LOCK_POISONED);
            self.ctl.advance_phase(Phase::Shutdown);
            self.interrupt_idle_workers_locked(&workers, false);
            self.hooks.on_shutdown();
        }
        debug!(pool = %self.pool_name, "shutdown initiated");
        self.try_terminate();
    }

    fn shutdown_now(&self) -> Vec<Job> {
        let drained;
        {
            let workers = self.workers.lock().expect(MAIN_LOCK_POISONED);
            self.ctl.advance_phase(Phase::Stop);
            self.interrupt_workers_locked(&workers);
            drained = self.drain_queue();
        }
        debug!(
            pool = %self.pool_name,
            drained = drained.len(),
            "stop initiated, queue drained"
        );
        self.try_terminate();
        drained
    }

    /// Drain the queue for [`ThreadPool::shutdown_now`]. A single drain pass
    /// is not trusted to observe emptiness, so sweeping continues until the
    /// queue agrees it is empty or stops yielding tasks.
    fn drain_queue(&self) -> Vec<Job> {
        let mut tasks = Vec::new();
        loop {
            let batch = self.queue.drain();
            let progressed = !batch.is_empty();
            tasks.extend(batch);
            if self.queue.is_empty() || !progressed {
                return tasks;
            }
        }
    }

    fn interrupt_idle_workers(&self, only_one: bool) {
        let workers = self.workers.lock().expect(MAIN_LOCK_POISONED);
        self.interrupt_idle_workers_locked(&workers, only_one);
    }

    /// Wake workers that are idle, i.e. not currently holding their exclusion
    /// flag, so they re-check the phase and configuration. A worker mid-task
    /// is left alone.
    fn interrupt_idle_workers_locked(&self, workers: &WorkerSet, only_one: bool) {
        for state in workers.members.values() {
            if !state.is_interrupted() && state.flag.try_lock() {
                state.interrupt();
                state.flag.unlock();
            }
            if only_one {
                break;
            }
        }
    }

    /// Signal every started worker regardless of whether it is mid-task.
    fn interrupt_workers_locked(&self, workers: &WorkerSet) {
        for state in workers.members.values() {
            if state.flag.has_started() {
                state.interrupt();
            }
        }
    }
}

const WORKER_UNINIT: u8 = 0;
const WORKER_UNLOCKED: u8 = 1;
const WORKER_LOCKED: u8 = 2;

/// Non-reentrant tri-state execution-exclusion flag. Starts out `UNINIT`,
/// which inhibits wake signals until the worker's run loop has started; the
/// worker holds the flag for the duration of one task, and the lifecycle
/// controller test-acquires it to tell idle workers from busy ones.
struct ExclusionFlag(AtomicU8);

impl ExclusionFlag {
    fn new() -> Self {
        ExclusionFlag(AtomicU8::new(WORKER_UNINIT))
    }

    fn mark_started(&self) {
        self.0.store(WORKER_UNLOCKED, Ordering::Release);
    }

    /// Acquire the flag. Only the owning worker calls this; the only
    /// contention is a lifecycle test-acquire that is released immediately,
    /// so spinning is fine.
    fn lock(&self) {
        while self
            .0
            .compare_exchange(
                WORKER_UNLOCKED,
                WORKER_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(
                WORKER_UNLOCKED,
                WORKER_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn unlock(&self) {
        self.0.store(WORKER_UNLOCKED, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) == WORKER_LOCKED
    }

    fn has_started(&self) -> bool {
        self.0.load(Ordering::Acquire) != WORKER_UNINIT
    }
}

/// Per-worker state owned by the pool once the worker is registered.
struct WorkerState {
    id: usize,
    first_task: Mutex<Option<Job>>,
    flag: ExclusionFlag,
    interrupted: AtomicBool,
    wake: WakeHandle,
    completed: AtomicU64,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerState {
    /// Deliver the advisory interrupt: raise the flag and wake a blocked
    /// queue wait.
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wake.wake();
    }

    fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn clear_interrupted(&self, signal: &WakeSignal) {
        self.interrupted.store(false, Ordering::SeqCst);
        signal.drain();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Type that exists to run the worker exit bookkeeping no matter how the work
/// loop ends.
///
/// This type is constructed once per worker run loop and implements `Drop` so
/// that a panic escaping a task still removes the worker from the set, folds
/// its statistics into the pool and triggers the replacement / termination
/// logic. A clean loop exit clears `completed_abruptly` before the guard is
/// dropped.
struct WorkerExitGuard<'a> {
    pool: &'a Arc<PoolData>,
    state: &'a Arc<WorkerState>,
    completed_abruptly: bool,
}

impl Drop for WorkerExitGuard<'_> {
    fn drop(&mut self) {
        PoolData::process_worker_exit(self.pool, self.state, self.completed_abruptly);
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerState>>> = RefCell::new(None);
}

/// Whether the worker thread running the current task has been signalled,
/// which happens when the pool is stopped through
/// [`ThreadPool::shutdown_now`]. Long-running tasks can poll this to observe
/// the cancellation intent. Returns `false` on threads not owned by a pool.
pub fn task_interrupted() -> bool {
    CURRENT_WORKER.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|worker| worker.is_interrupted())
            .unwrap_or(false)
    })
}

// assert that Send is implemented
trait ThreadSafe: Send {}

impl ThreadSafe for ThreadPool {}

impl ThreadSafe for Job {}

impl<R: Send> ThreadSafe for JoinHandle<R> {}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    }

    #[test]
    fn control_word_packing() {
        assert_eq!(count_of(encode(Phase::Running, 0)), 0);
        assert_eq!(count_of(encode(Phase::Running, 42)), 42);
        assert_eq!(phase_of(encode(Phase::Running, 42)), Phase::Running);
        assert_eq!(phase_of(encode(Phase::Shutdown, 42)), Phase::Shutdown);
        assert_eq!(phase_of(encode(Phase::Stop, CAPACITY)), Phase::Stop);
        assert_eq!(count_of(encode(Phase::Stop, CAPACITY)), CAPACITY);
        assert_eq!(phase_of(encode(Phase::Tidying, 0)), Phase::Tidying);
        assert_eq!(phase_of(encode(Phase::Terminated, 0)), Phase::Terminated);

        assert!(phase_at_least(encode(Phase::Stop, 3), Phase::Shutdown));
        assert!(phase_at_least(encode(Phase::Shutdown, 0), Phase::Shutdown));
        assert!(!phase_at_least(
            encode(Phase::Running, CAPACITY),
            Phase::Shutdown
        ));
        assert!(is_running(encode(Phase::Running, CAPACITY)));
        assert!(!is_running(encode(Phase::Shutdown, 0)));
    }

    #[test]
    fn control_state_increment_and_decrement() {
        let ctl = ControlState::new();
        assert_eq!(ctl.worker_count(), 0);
        assert_eq!(ctl.phase(), Phase::Running);

        assert!(ctl.try_increment_count(encode(Phase::Running, 0)));
        assert!(!ctl.try_increment_count(encode(Phase::Running, 0)));
        assert!(ctl.try_increment_count(encode(Phase::Running, 1)));
        assert_eq!(ctl.worker_count(), 2);

        assert!(ctl.try_decrement_count(encode(Phase::Running, 2)));
        ctl.decrement_count();
        assert_eq!(ctl.worker_count(), 0);
        assert_eq!(ctl.phase(), Phase::Running);
    }

    #[test]
    fn control_state_concurrent_increments_never_lose_updates() {
        let ctl = Arc::new(ControlState::new());
        let mut join_handles = Vec::with_capacity(5);
        for _ in 0..5 {
            let ctl = Arc::clone(&ctl);
            join_handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    loop {
                        let c = ctl.load();
                        if ctl.try_increment_count(c) {
                            break;
                        }
                    }
                }
            }));
        }
        for join_handle in join_handles {
            join_handle.join().unwrap();
        }
        assert_eq!(ctl.worker_count(), 5000);
        assert_eq!(ctl.phase(), Phase::Running);
    }

    #[test]
    fn control_state_phase_never_regresses() {
        let ctl = ControlState::new();
        ctl.advance_phase(Phase::Stop);
        assert_eq!(ctl.phase(), Phase::Stop);
        ctl.advance_phase(Phase::Shutdown);
        assert_eq!(ctl.phase(), Phase::Stop);
        ctl.advance_phase(Phase::Stop);
        assert_eq!(ctl.phase(), Phase::Stop);
        ctl.advance_phase(Phase::Terminated);
        assert_eq!(ctl.phase(), Phase::Terminated);
    }

    #[test]
    fn exclusion_flag_states() {
        let flag = ExclusionFlag::new();
        assert!(!flag.has_started());
        // an uninitialized flag refuses the lifecycle test-acquire
        assert!(!flag.try_lock());

        flag.mark_started();
        assert!(flag.has_started());
        assert!(!flag.is_locked());
        assert!(flag.try_lock());
        assert!(flag.is_locked());
        assert!(!flag.try_lock());
        flag.unlock();
        assert!(!flag.is_locked());
        flag.lock();
        assert!(flag.is_locked());
    }

    #[test]
    fn channel_queue_basics() {
        let queue = ChannelQueue::bounded(2);

        let job_1 = Job::new(TaskId(1), None, Box::new(|| {}));
        let job_2 = Job::new(TaskId(2), None, Box::new(|| {}));
        let job_3 = Job::new(TaskId(3), None, Box::new(|| {}));
        let id_2 = job_2.id();

        assert!(queue.offer(job_1).is_ok());
        assert!(queue.offer(job_2).is_ok());
        assert!(queue.offer(job_3).is_err());
        assert_eq!(queue.len(), 2);

        let removed = queue.remove(id_2);
        assert_eq!(removed.map(|job| job.id()), Some(id_2));
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(id_2).is_none());

        assert!(queue.poll_now().is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn rendezvous_queue_refuses_without_waiting_worker() {
        let queue = ChannelQueue::bounded(0);
        let job = Job::new(TaskId(1), None, Box::new(|| {}));
        assert!(queue.offer(job).is_err());
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn wake_signal_interrupts_waits() {
        let queue = ChannelQueue::unbounded();
        let (wake, signal) = wake_channel();
        wake.wake();
        match queue.poll(Duration::from_secs(5), &signal) {
            Polled::Interrupted => {}
            other => panic!("expected interrupted wait, got {:?}", other),
        }
        // the wake was consumed, the next wait times out
        match queue.poll(Duration::from_millis(10), &signal) {
            Polled::TimedOut => {}
            other => panic!("expected timed out wait, got {:?}", other),
        }
    }

    #[test]
    fn workers_grow_to_core_size_per_submission() {
        init_tracing();
        let pool = ThreadPool::new(4, 4, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let count = count.clone();
            pool.execute(move || {
                count.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(200));
            });
        }
        thread::sleep(Duration::from_millis(100));

        assert_eq!(pool.get_current_worker_count(), 4);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn tasks_queue_once_core_is_full() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(50));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert_eq!(pool.get_current_worker_count(), 1);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn single_worker_drains_and_culls_to_zero() {
        init_tracing();
        let pool = ThreadPool::new(0, 1, Duration::from_millis(50));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(10));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::Relaxed), 3);
        // exactly one worker was ever started
        assert_eq!(pool.handle.shared.worker_number.load(Ordering::Relaxed), 2);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.get_current_worker_count(), 0);
    }

    #[test]
    fn direct_handoff_rejects_when_saturated() {
        let pool = Builder::new()
            .core_size(2)
            .max_size(2)
            .queue(Arc::new(ChannelQueue::bounded(0)))
            .build();

        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..2 {
            let release = release.clone();
            let submitted = pool.try_execute(move || {
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            });
            assert!(submitted.is_ok());
        }

        assert_eq!(
            pool.try_execute(|| {}),
            Err(ExecuteError::Rejected)
        );

        release.store(true, Ordering::Relaxed);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn discard_oldest_never_raises() {
        let pool = Builder::new()
            .core_size(1)
            .max_size(4)
            .keep_alive(Duration::from_millis(50))
            .queue(Arc::new(ChannelQueue::bounded(1)))
            .rejection_policy(RejectionPolicy::DiscardOldest)
            .build();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let count = count.clone();
            let submitted = pool.try_execute(move || {
                thread::sleep(Duration::from_millis(50));
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert!(submitted.is_ok());
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        // some tasks may have been silently dropped but never more than
        // submitted and never any error
        assert!(count.load(Ordering::Relaxed) <= 4);
        assert!(count.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn caller_runs_policy_runs_on_submitting_thread() {
        let pool = Builder::new()
            .core_size(1)
            .max_size(1)
            .queue(Arc::new(ChannelQueue::bounded(0)))
            .rejection_policy(RejectionPolicy::CallerRuns)
            .build();

        let release = Arc::new(AtomicBool::new(false));
        {
            let release = release.clone();
            pool.execute(move || {
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        {
            let ran_on = ran_on.clone();
            pool.execute(move || {
                *ran_on.lock().unwrap() = Some(thread::current().id());
            });
        }

        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
        release.store(true, Ordering::Relaxed);
    }

    #[test]
    fn discard_policy_drops_silently() {
        let pool = Builder::new()
            .core_size(1)
            .max_size(1)
            .queue(Arc::new(ChannelQueue::bounded(0)))
            .rejection_policy(RejectionPolicy::Discard)
            .build();
        let count = Arc::new(AtomicUsize::new(0));

        let release = Arc::new(AtomicBool::new(false));
        {
            let release = release.clone();
            let count = count.clone();
            pool.execute(move || {
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        {
            let count = count.clone();
            let submitted = pool.try_execute(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert!(submitted.is_ok());
        }

        release.store(true, Ordering::Relaxed);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shutdown_rejects_new_tasks_but_drains_queued_ones() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(20));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.try_execute(|| {}), Err(ExecuteError::Shutdown));

        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn shutdown_now_returns_pending_tasks() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(200));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        // give the seeded worker time to start its first task
        thread::sleep(Duration::from_millis(100));
        let pending = pool.shutdown_now();
        assert_eq!(pending.len(), 4);

        assert!(pool.await_termination(Duration::from_secs(5)));
        // the tasks handed back plus the one that ran account for everything
        // accepted, and nothing ran twice
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn await_termination_respects_timeout() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        pool.execute(|| thread::sleep(Duration::from_millis(300)));
        pool.shutdown();

        assert!(pool.is_terminating());
        assert!(!pool.await_termination(Duration::from_millis(50)));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
        assert!(!pool.is_terminating());
    }

    #[test]
    fn non_core_workers_cull_while_core_workers_persist() {
        init_tracing();
        let pool = Builder::new()
            .core_size(1)
            .max_size(3)
            .keep_alive(Duration::from_millis(50))
            .queue(Arc::new(ChannelQueue::bounded(0)))
            .build();

        for _ in 0..3 {
            pool.execute(|| thread::sleep(Duration::from_millis(100)));
        }
        assert_eq!(pool.get_current_worker_count(), 3);

        thread::sleep(Duration::from_millis(400));
        // the two workers above the core bound timed out, the core one stays
        assert_eq!(pool.get_current_worker_count(), 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.get_current_worker_count(), 1);
    }

    #[test]
    fn core_workers_cull_when_core_timeout_is_allowed() {
        let pool = Builder::new()
            .core_size(2)
            .max_size(2)
            .keep_alive(Duration::from_millis(50))
            .allow_core_thread_timeout()
            .build();

        for _ in 0..2 {
            pool.execute(|| thread::sleep(Duration::from_millis(50)));
        }
        assert_eq!(pool.get_current_worker_count(), 2);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.get_current_worker_count(), 0);
    }

    #[test]
    fn panicking_workers_are_replaced() {
        init_tracing();
        let pool = ThreadPool::new(2, 2, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            pool.execute(|| panic!("test"));
        }
        thread::sleep(Duration::from_millis(200));

        // abrupt exits spawned replacements
        assert_eq!(pool.get_current_worker_count(), 2);
        assert!(pool.handle.shared.worker_number.load(Ordering::Relaxed) >= 4);

        for _ in 0..2 {
            let count = count.clone();
            pool.execute(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    struct RecordingHooks {
        before: AtomicUsize,
        after: AtomicUsize,
        faults: AtomicUsize,
        shutdowns: AtomicUsize,
        terminations: AtomicUsize,
    }

    impl RecordingHooks {
        fn new() -> Arc<Self> {
            Arc::new(RecordingHooks {
                before: AtomicUsize::new(0),
                after: AtomicUsize::new(0),
                faults: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                terminations: AtomicUsize::new(0),
            })
        }
    }

    impl PoolHooks for RecordingHooks {
        fn before_execute(&self, _task: TaskId) {
            self.before.fetch_add(1, Ordering::Relaxed);
        }

        fn after_execute(&self, _task: TaskId, fault: Option<&TaskFault>) {
            self.after.fetch_add(1, Ordering::Relaxed);
            if fault.is_some() {
                self.faults.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
        }

        fn on_terminated(&self) {
            self.terminations.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn hooks_bracket_every_task_and_termination() {
        let hooks = RecordingHooks::new();
        let pool = Builder::new()
            .core_size(2)
            .max_size(2)
            .hooks(hooks.clone())
            .build();

        for _ in 0..5 {
            pool.execute(|| {});
        }
        pool.execute(|| panic!("test"));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));

        assert_eq!(hooks.before.load(Ordering::Relaxed), 6);
        assert_eq!(hooks.after.load(Ordering::Relaxed), 6);
        assert_eq!(hooks.faults.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.shutdowns.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.terminations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn completed_count_includes_panicked_tasks() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        pool.execute(|| panic!("test"));
        pool.execute(|| {});
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(pool.completed_task_count(), 2);
    }

    #[test]
    fn cancelled_tasks_are_purged() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));

        let release = Arc::new(AtomicBool::new(false));
        {
            let release = release.clone();
            pool.execute(move || {
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }

        let handle = pool.evaluate(|| 42);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(pool.purge(), 1);
        assert!(pool.queue().is_empty());

        release.store(true, Ordering::Relaxed);
        assert!(handle.try_await_complete().is_err());
    }

    #[test]
    fn queued_tasks_can_be_removed() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(100));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        let count_removed = count.clone();
        let id = pool
            .try_execute(move || {
                count_removed.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert!(pool.remove(id));
        assert!(!pool.remove(id));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    struct FlakyFactory {
        failures_left: AtomicUsize,
    }

    impl ThreadFactory for FlakyFactory {
        fn new_thread(
            &self,
            name: String,
            work: Box<dyn FnOnce() + Send + 'static>,
        ) -> Option<thread::JoinHandle<()>> {
            let failures = self.failures_left.load(Ordering::Relaxed);
            if failures > 0 {
                self.failures_left.store(failures - 1, Ordering::Relaxed);
                return None;
            }
            DefaultThreadFactory.new_thread(name, work)
        }
    }

    #[test]
    fn factory_failure_is_rolled_back_cleanly() {
        let pool = Builder::new()
            .core_size(1)
            .max_size(1)
            .thread_factory(Arc::new(FlakyFactory {
                failures_left: AtomicUsize::new(1),
            }))
            .build();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            // the seeded admission fails, the task lands in the queue and the
            // fallback unseeded admission gets the second, working thread
            let submitted = pool.try_execute(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert!(submitted.is_ok());
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn prestart_fills_the_core_pool() {
        let pool = ThreadPool::new(3, 6, Duration::from_secs(5));
        assert_eq!(pool.get_current_worker_count(), 0);
        assert!(pool.prestart_core_thread());
        assert_eq!(pool.prestart_all_core_threads(), 2);
        assert_eq!(pool.get_current_worker_count(), 3);
        assert!(!pool.prestart_core_thread());
    }

    #[test]
    fn oversized_max_bound_is_clamped_not_fatal() {
        let pool = ThreadPool::new(1, usize::MAX, Duration::from_secs(5));
        let handle = pool.evaluate(|| 7);
        assert_eq!(handle.await_complete(), 7);
    }

    #[test]
    fn dropping_the_last_handle_shuts_down_gracefully() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
            for _ in 0..3 {
                let count = count.clone();
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(20));
                    count.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        // queued work still drains after the handle is gone
        thread::sleep(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn tasks_observe_the_stop_signal() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let observed = Arc::new(AtomicBool::new(false));

        {
            let observed = observed.clone();
            pool.execute(move || {
                for _ in 0..400 {
                    if task_interrupted() {
                        observed.store(true, Ordering::Relaxed);
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }

        thread::sleep(Duration::from_millis(50));
        pool.shutdown_now();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(observed.load(Ordering::Relaxed));
    }

    #[test]
    fn interrupt_is_not_delivered_to_busy_workers_on_graceful_shutdown() {
        let pool = ThreadPool::new(1, 1, Duration::from_secs(5));
        let observed = Arc::new(AtomicBool::new(false));

        {
            let observed = observed.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(100));
                observed.store(true, Ordering::Relaxed);
            });
        }

        thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        // the running task completed untouched
        assert!(observed.load(Ordering::Relaxed));
    }

    #[test]
    fn set_core_size_starts_workers_for_queued_tasks() {
        let pool = ThreadPool::new(1, 4, Duration::from_secs(5));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let count = count.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(100));
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(pool.get_current_worker_count(), 1);

        pool.set_core_size(3);
        thread::sleep(Duration::from_millis(50));
        assert!(pool.get_current_worker_count() >= 3);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn evaluate_returns_task_results() {
        let pool = ThreadPool::new(0, 3, Duration::from_secs(5));
        let handle = pool.evaluate(|| {
            thread::sleep(Duration::from_millis(50));
            4
        });
        assert_eq!(handle.await_complete(), 4);
    }

    #[should_panic(expected = "could not receive message because channel was cancelled")]
    #[test]
    fn evaluate_panicking_task_cancels_the_handle() {
        let pool = Builder::new().core_size(2).max_size(2).build();
        let handle = pool.evaluate(|| {
            if 3 > 2 {
                panic!("expected panic")
            }
            3
        });
        handle.await_complete();
    }

    #[should_panic(
        expected = "max_size must be greater than 0 and greater or equal to the core pool size"
    )]
    #[test]
    fn test_panic_on_0_max_pool_size() {
        ThreadPool::new(0, 0, Duration::from_secs(2));
    }

    #[should_panic(
        expected = "max_size must be greater than 0 and greater or equal to the core pool size"
    )]
    #[test]
    fn test_panic_on_smaller_max_than_core_pool_size() {
        ThreadPool::new(10, 4, Duration::from_secs(2));
    }

    #[should_panic(
        expected = "keep_alive must be non-zero while core threads are allowed to time out"
    )]
    #[test]
    fn test_panic_on_zero_keep_alive_with_core_timeout() {
        Builder::new()
            .core_size(1)
            .max_size(1)
            .keep_alive(Duration::ZERO)
            .allow_core_thread_timeout()
            .build();
    }

    #[should_panic(expected = "core pool size may not exceed the max pool size")]
    #[test]
    fn test_panic_on_raising_core_above_max() {
        let pool = ThreadPool::new(1, 2, Duration::from_secs(2));
        pool.set_core_size(3);
    }

    #[test]
    fn introspection_counts_add_up() {
        let pool = ThreadPool::new(2, 2, Duration::from_secs(5));
        let release = Arc::new(AtomicBool::new(false));

        for _ in 0..2 {
            let release = release.clone();
            pool.execute(move || {
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
        pool.execute(|| {});
        thread::sleep(Duration::from_millis(50));

        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.largest_pool_size(), 2);
        assert_eq!(pool.submitted_count(), 3);
        assert_eq!(pool.task_count(), 3);
        assert_eq!(pool.completed_task_count(), 0);

        release.store(true, Ordering::Relaxed);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(pool.completed_task_count(), 3);
        assert_eq!(pool.pool_size(), 0);
    }

    struct RequeueHandler;

    impl RejectionHandler for RequeueHandler {
        fn reject(&self, job: Job, pool: &PoolRef<'_>) -> Result<(), ExecuteError> {
            if pool.is_shutdown() {
                return Ok(());
            }
            drop(pool.poll_oldest());
            pool.resubmit(job)
        }
    }

    #[test]
    fn custom_rejection_handler_is_invoked() {
        let pool = Builder::new()
            .core_size(1)
            .max_size(1)
            .queue(Arc::new(ChannelQueue::bounded(1)))
            .rejection_policy(RejectionPolicy::Custom(Arc::new(RequeueHandler)))
            .build();

        for _ in 0..4 {
            assert!(pool.try_execute(|| thread::sleep(Duration::from_millis(20))).is_ok());
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn get_name_prefixes_worker_threads() {
        let pool = ThreadPool::new_named(
            String::from("my_pool"),
            1,
            1,
            Duration::from_secs(5),
        );
        assert_eq!(pool.get_name(), "my_pool");

        let name = pool
            .evaluate(|| thread::current().name().map(String::from))
            .await_complete();
        assert_eq!(name.as_deref(), Some("my_pool_thread_1"));
    }
}
