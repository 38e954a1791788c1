//! Key functions - memoizable computations over an event
//!
//! A [`KeyFn`] is an async computation `(event, store) -> Key` with an
//! identity. Identity drives both per-event memoization (two references to
//! the same key compute once, see [`KeyStore`](crate::store::KeyStore)) and
//! graph-node merging (two `Equal` nodes over the same key collapse into
//! one). Standard key functions carry *named* identities so independently
//! built subscriptions still share nodes and computations; ad-hoc closures
//! get a fresh anonymous identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use courier_model::{Event, EventKind, GroupPermission, MetaEventKind};

use crate::error::RouteError;
use crate::store::KeyStore;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id generator shared by nodes, terminals and key
/// functions.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A hashable value computed by a key function.
///
/// Used both as the result of key computations and as the bucket key of
/// `Equal` nodes, so it must stay `Eq + Hash` (no floats).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    EventKind(EventKind),
    MetaKind(MetaEventKind),
    Permission(GroupPermission),
    List(Vec<Key>),
}

impl Key {
    /// Truthiness used by predicate buckets.
    pub fn truthy(&self) -> bool {
        match self {
            Key::None => false,
            Key::Bool(b) => *b,
            Key::Int(i) => *i != 0,
            Key::Str(s) => !s.is_empty(),
            Key::EventKind(_) | Key::MetaKind(_) | Key::Permission(_) => true,
            Key::List(items) => !items.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Key {
    fn from(v: bool) -> Self {
        Key::Bool(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

impl From<EventKind> for Key {
    fn from(v: EventKind) -> Self {
        Key::EventKind(v)
    }
}

impl From<MetaEventKind> for Key {
    fn from(v: MetaEventKind) -> Self {
        Key::MetaKind(v)
    }
}

impl From<GroupPermission> for Key {
    fn from(v: GroupPermission) -> Self {
        Key::Permission(v)
    }
}

impl<T: Into<Key>> From<Option<T>> for Key {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Key::None)
    }
}

/// Identity of a [`KeyFn`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyFnId {
    /// Shared identity: equal names compute and merge as one key.
    Named(String),
    /// Fresh identity per constructed function.
    Anonymous(u64),
}

/// Arguments every key function receives.
#[derive(Clone)]
pub struct RouteArgs {
    pub event: Arc<Event>,
    pub store: Arc<KeyStore>,
    /// Session the event arrived on, when it came from a bot connection.
    pub session: Option<Arc<dyn courier_model::BotSession>>,
}

type KeyFnInner = Arc<dyn Fn(RouteArgs) -> BoxFuture<'static, Result<Key, RouteError>> + Send + Sync>;

/// An identified async computation over the event, memoized per event.
#[derive(Clone)]
pub struct KeyFn {
    id: KeyFnId,
    alias: Option<String>,
    func: KeyFnInner,
}

impl KeyFn {
    /// Key function with a fresh anonymous identity.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(RouteArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Key, RouteError>> + Send + 'static,
    {
        KeyFn {
            id: KeyFnId::Anonymous(next_id()),
            alias: None,
            func: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Key function with a shared named identity.
    pub fn named<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(RouteArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Key, RouteError>> + Send + 'static,
    {
        KeyFn {
            id: KeyFnId::Named(id.into()),
            alias: None,
            func: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Infallible synchronous projection of the event.
    pub fn from_event<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Key + Send + Sync + 'static,
    {
        Self::new(move |args: RouteArgs| {
            let key = f(&args.event);
            async move { Ok(key) }
        })
    }

    /// Named infallible synchronous projection of the event.
    pub fn named_from_event<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Key + Send + Sync + 'static,
    {
        Self::named(id, move |args: RouteArgs| {
            let key = f(&args.event);
            async move { Ok(key) }
        })
    }

    /// Boolean predicate over the event.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self::from_event(move |event| Key::Bool(f(event)))
    }

    /// Republish the computed value under `alias` in the event's store so
    /// handlers can fetch it by name.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn id(&self) -> &KeyFnId {
        &self.id
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub(crate) fn invoke(&self, args: RouteArgs) -> BoxFuture<'static, Result<Key, RouteError>> {
        (self.func)(args)
    }
}

impl PartialEq for KeyFn {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyFn {}

impl std::hash::Hash for KeyFn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for KeyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFn")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_ids_are_shared_identities() {
        let a = KeyFn::named_from_event("event.kind", |e| Key::EventKind(e.kind()));
        let b = KeyFn::named_from_event("event.kind", |_| Key::None);
        let c = KeyFn::from_event(|e| Key::EventKind(e.kind()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(KeyFn::predicate(|_| true), KeyFn::predicate(|_| true));
    }

    #[test]
    fn truthiness() {
        assert!(Key::Bool(true).truthy());
        assert!(!Key::Bool(false).truthy());
        assert!(!Key::None.truthy());
        assert!(Key::Str("x".into()).truthy());
        assert!(!Key::Str(String::new()).truthy());
        assert!(Key::List(vec![Key::None]).truthy());
        assert!(!Key::List(vec![]).truthy());
    }
}
