//! Dispatch engine
//!
//! The engine owns the live routing graph. Subscriptions mutate the root
//! graph under a lock and mark it dirty; each [`Engine::forward`] pass
//! routes on an immutable snapshot that is rebuilt lazily from the root,
//! so routing never contends with subscription and a pass in flight keeps
//! its own consistent view even when handlers subscribe or unsubscribe
//! mid-event.

use std::sync::Arc;

use futures::pin_mut;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;

use courier_model::{BotSession, Event, HandlerResult};

use crate::context::{install_wakeup_sweeper, HandlerContext, LaunchContext};
use crate::error::RouteError;
use crate::executor::{PriorityExecutor, TaskResult};
use crate::graph::{ClosedGraph, Graph};
use crate::key::RouteArgs;
use crate::node::{Terminal, TerminalId};
use crate::store::KeyStore;

/// One result of a dispatch pass: route errors first, then task results
/// as they complete.
#[derive(Debug)]
pub enum ForwardItem {
    Route(RouteError),
    Task(TaskResult),
}

struct EngineState {
    root: ClosedGraph,
    snapshot: Arc<ClosedGraph>,
    dirty: bool,
}

struct EngineShared {
    state: Mutex<EngineState>,
    max_workers: usize,
}

/// Cloneable handle to the dispatch engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_max_workers(PriorityExecutor::DEFAULT_MAX_WORKERS)
    }

    /// Engine with a custom per-event worker bound.
    pub fn with_max_workers(max_workers: usize) -> Self {
        let root = ClosedGraph::empty();
        let snapshot = Arc::new(root.clone());
        let engine = Engine {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState { root, snapshot, dirty: false }),
                max_workers,
            }),
        };
        install_wakeup_sweeper(&engine);
        engine
    }

    /// Begin a subscription: the returned builder closes `graph` onto a
    /// handler terminal and subscribes the result.
    pub fn on(&self, graph: Graph) -> Subscription {
        Subscription { engine: self.clone(), graph }
    }

    /// Merge a closed graph into the live root.
    pub fn subscribe(&self, graph: &ClosedGraph) {
        let mut state = self.shared.state.lock();
        state.root.union_with(graph);
        state.dirty = true;
    }

    /// Remove terminals from the live root, pruning transitively.
    pub fn unsubscribe_terminals(&self, terminals: &[TerminalId]) {
        let mut state = self.shared.state.lock();
        for &id in terminals {
            state.root.remove_terminal(id);
        }
        state.dirty = true;
    }

    /// Terminals currently subscribed to the live root.
    pub fn terminals(&self) -> Vec<Arc<Terminal>> {
        self.shared.state.lock().root.terminals()
    }

    /// Reachable node count of the live root (diagnostics and tests).
    pub fn node_count(&self) -> usize {
        self.shared.state.lock().root.node_count()
    }

    fn snapshot(&self) -> Arc<ClosedGraph> {
        let mut state = self.shared.state.lock();
        if state.dirty {
            state.snapshot = Arc::new(state.root.clone());
            state.dirty = false;
            tracing::debug!(nodes = state.snapshot.node_count(), "routing snapshot rebuilt");
        }
        state.snapshot.clone()
    }

    /// Dispatch one event: route it, post-filter the matched terminals,
    /// yield in-band route errors, then run the matched handlers under
    /// the priority executor, streaming their results.
    pub fn forward(
        &self,
        event: Event,
        session: Option<Arc<dyn BotSession>>,
    ) -> impl Stream<Item = ForwardItem> {
        let engine = self.clone();
        async_stream::stream! {
            let snapshot = engine.snapshot();
            let event = Arc::new(event);
            let store = Arc::new(KeyStore::new());
            let args = RouteArgs {
                event: event.clone(),
                store: store.clone(),
                session: session.clone(),
            };

            tracing::debug!(kind = ?event.kind(), "routing event");
            let routed = snapshot.route(&args).await;

            let mut terminals = routed.terminals;
            for error in &routed.errors {
                if let RouteError::Filtered(filter) = error {
                    terminals.retain(|t| filter.keep(t));
                }
            }
            for error in routed.errors {
                yield ForwardItem::Route(error);
            }

            let executor = PriorityExecutor::new(engine.shared.max_workers);
            for terminal in &terminals {
                executor.create_task(terminal.clone(), terminal.priority());
            }
            tracing::debug!(matched = terminals.len(), "terminals scheduled");

            let launch = LaunchContext::new(event, store, engine.clone(), session);
            let results = executor.run(launch);
            pin_mut!(results);
            while let Some(result) = results.next().await {
                yield ForwardItem::Task(result);
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

/// Builder returned by [`Engine::on`]: attach a handler (or an existing
/// terminal) to close and subscribe the graph.
pub struct Subscription {
    engine: Engine,
    graph: Graph,
}

impl Subscription {
    /// Close the graph onto `f` at default priority and subscribe.
    /// Returns the terminal handle used for unsubscription.
    pub fn handle<F, Fut>(self, f: F) -> Arc<Terminal>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle_with_priority(crate::executor::Priority::DEFAULT, f)
    }

    /// Close the graph onto `f` at the given task priority and subscribe.
    pub fn handle_with_priority<F, Fut>(self, priority: i32, f: F) -> Arc<Terminal>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.attach(Terminal::new(priority, f))
    }

    /// Close the graph onto an existing terminal and subscribe.
    pub fn attach(self, terminal: Arc<Terminal>) -> Arc<Terminal> {
        let closed = self.graph.apply(terminal.clone());
        self.engine.subscribe(&closed);
        terminal
    }
}
