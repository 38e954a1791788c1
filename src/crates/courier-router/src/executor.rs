//! Priority executor with cooperatively suspendable tasks
//!
//! One executor runs per dispatched event. Tasks start strictly by
//! priority level: the executor keeps a `running_priority` watermark and
//! only drops it to the next waiting level while the `next_priority` gate
//! is open - a handler can close the gate to suppress all lower-priority
//! work for the rest of the event. Tasks at [`Priority::NEVER`] are never
//! started.
//!
//! Suspension is a channel pair: the executor holds the outcome receiver
//! of every running task; a pausing handler sends `Paused` on the current
//! outcome channel (freeing its worker slot) and awaits a resume channel
//! the next executor completes when the task is woken.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use courier_model::{HandlerResult, WaitError};

use crate::context::HandlerContext;
use crate::key::next_id;
use crate::node::{Terminal, TerminalId};

/// Task priority levels. Any `i32` is a valid priority; these are the
/// well-known marks.
pub struct Priority;

impl Priority {
    pub const MAX: i32 = 10000;
    pub const WAKEUP: i32 = 1000;
    pub const DEFAULT: i32 = 0;
    pub const MIN: i32 = -10000;
    pub const NEVER: i32 = -99999;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Done,
    Cancelled,
}

/// Wait flags recorded by `wait_until` and read by the wakeup sweeper.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitFlags {
    /// Stop waking further candidates after this one.
    pub suspend_other: bool,
    /// Close the executor's next-priority gate for the waking event.
    pub suspend_next_priority: bool,
}

enum ResumeSignal {
    Resume(HandlerContext),
    Raise(WaitError),
}

pub(crate) enum TaskOutcome {
    Done(HandlerResult),
    Paused,
}

struct TaskInner {
    status: TaskStatus,
    outcome_tx: Option<oneshot::Sender<TaskOutcome>>,
    resume_tx: Option<oneshot::Sender<ResumeSignal>>,
}

/// A handler invocation with priority and pause/resume support.
pub struct Task {
    id: u64,
    terminal: Arc<Terminal>,
    priority: AtomicI32,
    flags: Mutex<WaitFlags>,
    last_active: Mutex<Instant>,
    cancelled: AtomicBool,
    wait_generation: Mutex<u64>,
    inner: Mutex<TaskInner>,
}

impl Task {
    pub fn new(terminal: Arc<Terminal>, priority: i32) -> Arc<Task> {
        Arc::new(Task {
            id: next_id(),
            terminal,
            priority: AtomicI32::new(priority),
            flags: Mutex::new(WaitFlags::default()),
            last_active: Mutex::new(Instant::now()),
            cancelled: AtomicBool::new(false),
            wait_generation: Mutex::new(0),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Idle,
                outcome_tx: None,
                resume_tx: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    /// Wakeups inherit the priority of the task that resumes them.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn status(&self) -> TaskStatus {
        if self.cancelled.load(Ordering::SeqCst) {
            TaskStatus::Cancelled
        } else {
            self.inner.lock().status
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status() == TaskStatus::Paused
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> WaitFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: WaitFlags) {
        *self.flags.lock() = flags;
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Time since the task last started or resumed.
    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// Bump the wait generation. Timers capture the returned value and
    /// only fire when it is still current, so a stale timeout never
    /// touches a later suspension.
    pub(crate) fn begin_wait(&self) -> u64 {
        let mut generation = self.wait_generation.lock();
        *generation += 1;
        *generation
    }

    pub(crate) fn current_wait_generation(&self) -> u64 {
        *self.wait_generation.lock()
    }

    /// Start an idle task or resume a paused one, returning the outcome
    /// receiver for this run. `None` when the task cannot run (done,
    /// cancelled, already running).
    pub(crate) fn run(self: &Arc<Self>, ctx: HandlerContext) -> Option<oneshot::Receiver<TaskOutcome>> {
        if self.is_cancelled() {
            return None;
        }
        let status = { self.inner.lock().status };
        match status {
            TaskStatus::Idle => {}
            TaskStatus::Paused => return self.resume(ctx),
            _ => return None,
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.status = TaskStatus::Running;
            inner.outcome_tx = Some(tx);
        }
        *self.last_active.lock() = Instant::now();

        let task = self.clone();
        let handler = self.terminal.handler();
        tokio::spawn(async move {
            let result = handler(ctx).await;
            task.finish(result);
        });
        Some(rx)
    }

    fn finish(&self, result: HandlerResult) {
        let tx = {
            let mut inner = self.inner.lock();
            if inner.status != TaskStatus::Running {
                return;
            }
            inner.status = TaskStatus::Done;
            inner.outcome_tx.take()
        };
        if self.is_cancelled() {
            return;
        }
        if let Some(tx) = tx {
            let _ = tx.send(TaskOutcome::Done(result));
        }
    }

    /// Suspend the calling handler until the task is resumed or raised
    /// into. Must only be called from inside the task's own handler.
    pub(crate) async fn pause(&self) -> Result<HandlerContext, WaitError> {
        if self.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let resume_rx = {
            let mut inner = self.inner.lock();
            let (resume_tx, resume_rx) = oneshot::channel();
            inner.resume_tx = Some(resume_tx);
            inner.status = TaskStatus::Paused;
            if let Some(tx) = inner.outcome_tx.take() {
                let _ = tx.send(TaskOutcome::Paused);
            }
            resume_rx
        };
        match resume_rx.await {
            Ok(ResumeSignal::Resume(ctx)) => Ok(ctx),
            Ok(ResumeSignal::Raise(err)) => Err(err),
            Err(_) => {
                self.cancel();
                Err(WaitError::Cancelled)
            }
        }
    }

    /// Resume a paused task with the waking context.
    pub(crate) fn resume(&self, ctx: HandlerContext) -> Option<oneshot::Receiver<TaskOutcome>> {
        let (resume_tx, rx) = {
            let mut inner = self.inner.lock();
            if inner.status != TaskStatus::Paused {
                return None;
            }
            let resume_tx = inner.resume_tx.take()?;
            let (tx, rx) = oneshot::channel();
            inner.outcome_tx = Some(tx);
            inner.status = TaskStatus::Running;
            (resume_tx, rx)
        };
        *self.last_active.lock() = Instant::now();
        if resume_tx.send(ResumeSignal::Resume(ctx)).is_err() {
            return None;
        }
        Some(rx)
    }

    /// Deliver an error into a paused task. The handler observes it as
    /// the result of its `wait_until`. `None` when the task is not
    /// paused.
    pub fn raise(&self, err: WaitError) -> Option<()> {
        let resume_tx = {
            let mut inner = self.inner.lock();
            if inner.status != TaskStatus::Paused {
                return None;
            }
            let resume_tx = inner.resume_tx.take()?;
            let (tx, _rx) = oneshot::channel();
            // The raising party does not consume the outcome; the task
            // finishes into a dropped receiver.
            inner.outcome_tx = Some(tx);
            inner.status = TaskStatus::Running;
            resume_tx
        };
        *self.last_active.lock() = Instant::now();
        resume_tx.send(ResumeSignal::Raise(err)).ok()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("terminal", &self.terminal.id())
            .field("priority", &self.priority())
            .field("status", &self.status())
            .finish()
    }
}

/// Result of one finished task.
#[derive(Debug)]
pub struct TaskResult {
    pub terminal: TerminalId,
    pub result: HandlerResult,
}

struct QueueEntry {
    priority: i32,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap on priority, FIFO (smaller sequence first) inside one
        // priority level.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WaitQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

struct ExecutorShared {
    max_workers: usize,
    queue: Mutex<WaitQueue>,
    next_priority: AtomicBool,
}

/// Priority-ordered task executor for one dispatch pass.
#[derive(Clone)]
pub struct PriorityExecutor {
    shared: Arc<ExecutorShared>,
}

impl PriorityExecutor {
    pub const DEFAULT_MAX_WORKERS: usize = 20;

    pub fn new(max_workers: usize) -> Self {
        PriorityExecutor {
            shared: Arc::new(ExecutorShared {
                max_workers,
                queue: Mutex::new(WaitQueue { heap: BinaryHeap::new(), next_seq: 0 }),
                next_priority: AtomicBool::new(true),
            }),
        }
    }

    /// Queue a fresh task for a terminal at the given priority.
    pub fn create_task(&self, terminal: Arc<Terminal>, priority: i32) -> Arc<Task> {
        let task = Task::new(terminal, priority);
        self.add_task(task.clone());
        task
    }

    /// Queue an existing task (e.g. a paused one being woken).
    pub fn add_task(&self, task: Arc<Task>) {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueueEntry { priority: task.priority(), seq, task });
    }

    /// Open or close the next-priority gate. While closed, no task below
    /// the current running priority starts for the rest of this run.
    pub fn set_next_priority(&self, open: bool) {
        self.shared.next_priority.store(open, Ordering::SeqCst);
    }

    pub fn next_priority(&self) -> bool {
        self.shared.next_priority.load(Ordering::SeqCst)
    }

    fn waiting_priority(&self) -> i32 {
        self.shared
            .queue
            .lock()
            .heap
            .peek()
            .map(|e| e.priority)
            .unwrap_or(Priority::NEVER)
    }

    fn pop_if(&self, running: usize, running_priority: i32) -> Option<Arc<Task>> {
        let mut queue = self.shared.queue.lock();
        if running >= self.shared.max_workers {
            return None;
        }
        match queue.heap.peek() {
            Some(entry) if entry.priority >= running_priority => {
                queue.heap.pop().map(|e| e.task)
            }
            _ => None,
        }
    }

    fn has_waiting(&self) -> bool {
        !self.shared.queue.lock().heap.is_empty()
    }

    /// Run queued tasks to completion, yielding results as they finish.
    /// `base` supplies the per-event context every task receives.
    pub fn run(&self, base: crate::context::LaunchContext) -> impl Stream<Item = TaskResult> {
        let executor = self.clone();
        async_stream::stream! {
            executor.set_next_priority(true);
            let mut running_priority = Priority::MAX;
            let mut running: FuturesUnordered<
                BoxFuture<'static, (Arc<Task>, Option<TaskOutcome>)>,
            > = FuturesUnordered::new();

            while executor.has_waiting() || !running.is_empty() {
                while let Some(task) = executor.pop_if(running.len(), running_priority) {
                    running_priority = task.priority();
                    running.push(launch(task, &executor, &base));
                }
                if executor.next_priority() && executor.waiting_priority() > Priority::NEVER {
                    running_priority = executor.waiting_priority();
                    while let Some(task) = executor.pop_if(running.len(), running_priority) {
                        running_priority = task.priority();
                        running.push(launch(task, &executor, &base));
                    }
                }

                if running.is_empty() {
                    break;
                }

                if let Some((task, outcome)) = running.next().await {
                    match outcome {
                        Some(TaskOutcome::Done(result)) => {
                            tracing::debug!(task = task.id(), "task finished");
                            yield TaskResult { terminal: task.terminal().id(), result };
                        }
                        Some(TaskOutcome::Paused) => {
                            tracing::debug!(task = task.id(), "task paused");
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

impl Default for PriorityExecutor {
    fn default() -> Self {
        PriorityExecutor::new(Self::DEFAULT_MAX_WORKERS)
    }
}

fn launch(
    task: Arc<Task>,
    executor: &PriorityExecutor,
    base: &crate::context::LaunchContext,
) -> BoxFuture<'static, (Arc<Task>, Option<TaskOutcome>)> {
    let ctx = base.handler_context(task.clone(), executor.clone());
    async move {
        match task.run(ctx) {
            Some(rx) => {
                let outcome = rx.await.ok();
                (task, outcome)
            }
            None => (task, None),
        }
    }
    .boxed()
}
