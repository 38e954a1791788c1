//! Per-event key memoization store
//!
//! One [`KeyStore`] is created for each dispatched event. The first access
//! to a key function schedules its computation; every further access -
//! from any node of the routing graph - awaits the same shared future, so
//! a key shared by many predicates evaluates at most once per event.
//! Entries are write-once: a resolved key never changes for the lifetime
//! of the pass.
//!
//! The store also carries the reserved wakeup-candidate list that
//! suspended tasks register through (see [`crate::context`]).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::RouteError;
use crate::executor::Task;
use crate::key::{Key, KeyFn, KeyFnId, RouteArgs};
use crate::node::TerminalId;

/// Lookup key inside a [`KeyStore`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum StoreKey {
    Fn(KeyFnId),
    Alias(String),
}

type SharedKeyFuture = Shared<BoxFuture<'static, Result<Key, RouteError>>>;

#[derive(Clone)]
enum Cell {
    Pending(SharedKeyFuture),
    Ready(Result<Key, RouteError>),
}

/// A paused task registered for wakeup by the current event.
#[derive(Clone)]
pub struct WakeupCandidate {
    pub task: Arc<Task>,
    /// Ephemeral terminal to unsubscribe once the task is woken.
    pub terminal: TerminalId,
}

/// Per-event memoization map from key functions (and their string
/// aliases) to computed values.
#[derive(Default)]
pub struct KeyStore {
    cells: Mutex<HashMap<StoreKey, Cell>>,
    wakeups: Mutex<Vec<WakeupCandidate>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute `kf` for this event, or await the already-scheduled
    /// computation. Once resolved, the value is also published under the
    /// key function's alias, when it has one.
    pub async fn compute(&self, kf: &KeyFn, args: &RouteArgs) -> Result<Key, RouteError> {
        let fut = {
            let mut cells = self.cells.lock();
            match cells.get(&StoreKey::Fn(kf.id().clone())) {
                Some(Cell::Ready(res)) => return res.clone(),
                Some(Cell::Pending(shared)) => shared.clone(),
                None => {
                    let shared = kf.invoke(args.clone()).shared();
                    cells.insert(StoreKey::Fn(kf.id().clone()), Cell::Pending(shared.clone()));
                    shared
                }
            }
        };

        let res = fut.await;

        let mut cells = self.cells.lock();
        cells.insert(StoreKey::Fn(kf.id().clone()), Cell::Ready(res.clone()));
        if let (Some(alias), Ok(value)) = (kf.alias(), &res) {
            cells
                .entry(StoreKey::Alias(alias.to_string()))
                .or_insert_with(|| Cell::Ready(Ok(value.clone())));
        }
        res
    }

    /// Value published under a string alias, if resolved.
    pub fn get(&self, alias: &str) -> Option<Key> {
        match self.cells.lock().get(&StoreKey::Alias(alias.to_string())) {
            Some(Cell::Ready(Ok(value))) => Some(value.clone()),
            _ => None,
        }
    }

    /// Publish a value under a string alias. Existing entries are kept:
    /// the store is write-once.
    pub fn set(&self, alias: impl Into<String>, value: Key) {
        self.cells
            .lock()
            .entry(StoreKey::Alias(alias.into()))
            .or_insert(Cell::Ready(Ok(value)));
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.cells.lock().contains_key(&StoreKey::Alias(alias.to_string()))
    }

    /// Register a paused task to be woken by this event.
    pub fn push_wakeup(&self, candidate: WakeupCandidate) {
        self.wakeups.lock().push(candidate);
    }

    /// Drain the wakeup candidates registered during routing.
    pub fn take_wakeups(&self) -> Vec<WakeupCandidate> {
        std::mem::take(&mut *self.wakeups.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_model::Event;

    fn args(store: &Arc<KeyStore>) -> RouteArgs {
        RouteArgs { event: Arc::new(Event::Unknown), store: store.clone(), session: None }
    }

    #[tokio::test]
    async fn computes_once_per_event() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mk = |counter: Arc<AtomicUsize>| {
            KeyFn::named("test.expensive", move |_args: RouteArgs| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Key::Int(42))
                }
            })
        };
        // Two distinct instances sharing one named identity.
        let a = mk(counter.clone());
        let b = mk(counter.clone());

        let store = Arc::new(KeyStore::new());
        let args1 = args(&store);
        assert_eq!(store.compute(&a, &args1).await.unwrap(), Key::Int(42));
        assert_eq!(store.compute(&b, &args1).await.unwrap(), Key::Int(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // A fresh store is a fresh event: computed again.
        let store2 = Arc::new(KeyStore::new());
        let args2 = args(&store2);
        assert_eq!(store2.compute(&a, &args2).await.unwrap(), Key::Int(42));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn republishes_under_alias() {
        let kf = KeyFn::named("test.aliased", |_args: RouteArgs| async {
            Ok(Key::Str("value".into()))
        })
        .with_alias("answer");

        let store = Arc::new(KeyStore::new());
        assert!(store.get("answer").is_none());
        store.compute(&kf, &args(&store)).await.unwrap();
        assert_eq!(store.get("answer"), Some(Key::Str("value".into())));
    }

    #[tokio::test]
    async fn errors_are_memoized_too() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let kf = KeyFn::new(move |_args: RouteArgs| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RouteError::internal("boom"))
            }
        });

        let store = Arc::new(KeyStore::new());
        let args = args(&store);
        assert!(store.compute(&kf, &args).await.is_err());
        assert!(store.compute(&kf, &args).await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_is_write_once() {
        let store = KeyStore::new();
        store.set("k", Key::Int(1));
        store.set("k", Key::Int(2));
        assert_eq!(store.get("k"), Some(Key::Int(1)));
    }
}
