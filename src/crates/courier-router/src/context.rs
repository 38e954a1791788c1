//! Handler context and event-driven suspension
//!
//! Every handler receives a [`HandlerContext`]: the event, its key store,
//! the running task, the executor of the current pass and the engine.
//! [`HandlerContext::wait_until`] suspends the handler until a future
//! event matches a caller-supplied subgraph: it subscribes an ephemeral
//! terminal (at [`Priority::NEVER`], so it never runs as a handler) whose
//! path registers the paused task as a wakeup candidate in the matching
//! event's store. A sweeper handler installed on every engine at
//! [`Priority::WAKEUP`] drains those candidates and re-queues the paused
//! tasks on the current executor, newest first.

use std::sync::Arc;
use std::time::Duration;

use courier_model::{BotSession, Event, WaitError};

use crate::engine::Engine;
use crate::executor::{Priority, PriorityExecutor, Task, WaitFlags};
use crate::graph::Graph;
use crate::key::{Key, KeyFn, RouteArgs};
use crate::message::same_event_as;
use crate::node::Terminal;
use crate::store::{KeyStore, WakeupCandidate};
use crate::{combinators, message};

/// Per-event ingredients the executor combines with each task into a
/// [`HandlerContext`].
#[derive(Clone)]
pub struct LaunchContext {
    event: Arc<Event>,
    store: Arc<KeyStore>,
    engine: Engine,
    session: Option<Arc<dyn BotSession>>,
}

impl LaunchContext {
    pub(crate) fn new(
        event: Arc<Event>,
        store: Arc<KeyStore>,
        engine: Engine,
        session: Option<Arc<dyn BotSession>>,
    ) -> Self {
        LaunchContext { event, store, engine, session }
    }

    pub(crate) fn handler_context(
        &self,
        task: Arc<Task>,
        executor: PriorityExecutor,
    ) -> HandlerContext {
        HandlerContext {
            event: self.event.clone(),
            store: self.store.clone(),
            session: self.session.clone(),
            engine: self.engine.clone(),
            executor,
            task,
        }
    }
}

/// Options for [`HandlerContext::wait_until`].
#[derive(Clone, Copy, Debug)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Once this task is woken, do not wake further candidates on the
    /// same event.
    pub suspend_other: bool,
    /// Close the next-priority gate of the waking event's executor.
    pub suspend_next_priority: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            timeout: Duration::from_secs(3600),
            suspend_other: false,
            suspend_next_priority: false,
        }
    }
}

impl WaitOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn suspend_other(mut self, suspend: bool) -> Self {
        self.suspend_other = suspend;
        self
    }

    pub fn suspend_next_priority(mut self, suspend: bool) -> Self {
        self.suspend_next_priority = suspend;
        self
    }
}

/// Execution context passed to every handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub event: Arc<Event>,
    pub store: Arc<KeyStore>,
    pub session: Option<Arc<dyn BotSession>>,
    engine: Engine,
    executor: PriorityExecutor,
    task: Arc<Task>,
}

impl HandlerContext {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn executor(&self) -> &PriorityExecutor {
        &self.executor
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Suppress all lower-priority tasks for the rest of this event.
    pub fn suspend_next_priority(&self) {
        self.executor.set_next_priority(false);
    }

    /// Suspend until a future event matches `graph`, or until the
    /// timeout. Returns the context of the waking event.
    pub async fn wait_until(
        &self,
        graph: Graph,
        opts: WaitOptions,
    ) -> Result<HandlerContext, WaitError> {
        let task = self.task.clone();
        task.set_flags(WaitFlags {
            suspend_other: opts.suspend_other,
            suspend_next_priority: opts.suspend_next_priority,
        });
        let generation = task.begin_wait();

        let dummy = Terminal::new(Priority::NEVER, |_ctx| async { Ok(serde_json::Value::Null) });
        let dummy_id = dummy.id();
        let engine = self.engine.clone();

        // Lazy timeout: any event routed past the guard after the
        // deadline raises into the paused task and retires the wait.
        let guard = {
            let task = task.clone();
            let engine = engine.clone();
            let timeout = opts.timeout;
            KeyFn::new(move |_args: RouteArgs| {
                let task = task.clone();
                let engine = engine.clone();
                async move {
                    if task.idle_for() > timeout {
                        if task.raise(WaitError::Timeout).is_some() {
                            tracing::debug!(task = task.id(), "wait timed out on route");
                        }
                        engine.unsubscribe_terminals(&[dummy_id]);
                        Ok(Key::Bool(false))
                    } else {
                        Ok(Key::Bool(true))
                    }
                }
            })
        };

        let register = {
            let task = task.clone();
            KeyFn::new(move |args: RouteArgs| {
                let task = task.clone();
                async move {
                    args.store.push_wakeup(WakeupCandidate { task, terminal: dummy_id });
                    Ok(Key::None)
                }
            })
        };

        engine
            .on(combinators::when(guard) & graph & combinators::process(register))
            .attach(dummy);

        // Armed timeout: fires even when no event arrives at all. The
        // generation check keeps a stale timer away from later waits.
        {
            let task = task.clone();
            let engine = engine.clone();
            let timeout = opts.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if task.current_wait_generation() == generation
                    && task.raise(WaitError::Timeout).is_some()
                {
                    tracing::debug!(task = task.id(), "wait timed out");
                    engine.unsubscribe_terminals(&[dummy_id]);
                }
            });
        }

        task.pause().await
    }

    /// Wait for the next event from the same conversation that also
    /// matches `graph`.
    pub async fn wait_next(
        &self,
        graph: Graph,
        opts: WaitOptions,
    ) -> Result<HandlerContext, WaitError> {
        let graph = match same_event_as(&self.event) {
            Some(conversation) => conversation & graph,
            None => graph,
        };
        self.wait_until(graph, opts).await
    }

    /// Wait for a message from the same conversation quoting
    /// `message_id`.
    pub async fn wait_quote(
        &self,
        message_id: courier_model::MessageId,
        opts: WaitOptions,
    ) -> Result<HandlerContext, WaitError> {
        self.wait_next(message::quotes(message_id), opts).await
    }
}

/// Subscribe the wakeup sweeper: runs at [`Priority::WAKEUP`] on every
/// event, resuming candidates registered during routing, newest first.
pub(crate) fn install_wakeup_sweeper(engine: &Engine) {
    engine
        .on(combinators::always())
        .handle_with_priority(Priority::WAKEUP, |ctx: HandlerContext| async move {
            let mut candidates = ctx.store.take_wakeups();
            candidates.sort_by_key(|c| c.task.last_active());

            let mut suspend_next_priority = false;
            while let Some(candidate) = candidates.pop() {
                let flags = candidate.task.flags();
                ctx.engine().unsubscribe_terminals(&[candidate.terminal]);
                if !candidate.task.is_paused() {
                    continue;
                }
                suspend_next_priority |= flags.suspend_next_priority;
                // The woken task inherits the sweeper's priority level.
                candidate.task.set_priority(ctx.task().priority());
                ctx.executor().add_task(candidate.task.clone());
                tracing::debug!(task = candidate.task.id(), "waking suspended task");
                if flags.suspend_other {
                    break;
                }
            }
            if suspend_next_priority {
                ctx.executor().set_next_priority(false);
            }
            Ok(serde_json::Value::Null)
        });
}
