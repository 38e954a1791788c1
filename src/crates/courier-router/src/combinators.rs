//! Graph builders
//!
//! Each builder returns a small open [`Graph`] (start feeding one node)
//! ready for composition with `&` and `|`. Builders over the same named
//! key produce nodes that merge when subscribed, so the live graph stays
//! compact no matter how many subscriptions use them.

use crate::graph::Graph;
use crate::key::{Key, KeyFn};
use crate::node::NodeBody;

use courier_model::{EventKind, MessageKind};

/// The graph that matches every event.
pub fn always() -> Graph {
    Graph::new()
}

/// Route on by-key equality: follow only the bucket matching the computed
/// key.
pub fn equals_by(key: KeyFn, values: impl IntoIterator<Item = Key>) -> Graph {
    Graph::from_body(NodeBody::equal(key, values))
}

/// Route through `pred` when it computes truthy.
pub fn when(pred: KeyFn) -> Graph {
    Graph::from_body(NodeBody::predicate([pred]))
}

/// One predicate node holding several predicates; each truthy predicate
/// emits its own bucket.
pub fn when_any(preds: impl IntoIterator<Item = KeyFn>) -> Graph {
    Graph::from_body(NodeBody::predicate(preds))
}

/// Evaluate `func` for its side effect on the store, then route on
/// unconditionally.
pub fn process(func: KeyFn) -> Graph {
    Graph::from_body(NodeBody::processor([func]))
}

/// Compute `func` and publish the result under `name` in the event's
/// store, then route on unconditionally.
pub fn store_value(name: impl Into<String>, func: KeyFn) -> Graph {
    process(func.with_alias(name))
}

/// Route on string prefixes of the computed key: every stored prefix of
/// the key fires.
pub fn prefix_by(key: KeyFn, prefixes: impl IntoIterator<Item = String>) -> Graph {
    Graph::from_body(NodeBody::prefix(key, prefixes))
}

/// Route on the kinds of the event's message elements.
pub fn has_kinds(kinds: impl IntoIterator<Item = MessageKind>) -> Graph {
    Graph::from_body(NodeBody::message_kind(kinds))
}

/// Key function projecting the event kind; shared identity so all uses
/// merge into one node.
pub fn key_event_kind() -> KeyFn {
    KeyFn::named_from_event("event.kind", |e| Key::EventKind(e.kind()))
}

/// Route on the event kind.
pub fn kind_is(kind: EventKind) -> Graph {
    kind_is_any([kind])
}

/// Route on any of the given event kinds.
pub fn kind_is_any(kinds: impl IntoIterator<Item = EventKind>) -> Graph {
    equals_by(key_event_kind(), kinds.into_iter().map(Key::EventKind))
}
