//! Graph nodes
//!
//! Nodes live in an id-keyed arena owned by their graph (see
//! [`crate::graph`]); edges store both endpoints by id, with predecessor
//! back-edges mirroring every successor edge so terminals can be removed
//! transitively. Nonterminal bodies keep their successors in *buckets*
//! keyed by the transition value: an `Equal` node buckets by computed key,
//! a `Predicate` node by predicate identity, a `Prefix` node by stored
//! prefix string, and so on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use courier_model::{HandlerResult, MessageKind};

use crate::context::HandlerContext;
use crate::key::{next_id, Key, KeyFn, KeyFnId};

pub(crate) type NodeId = u64;

/// Identity of a terminal node. Object identity, never merged: two
/// literally-equal handlers stay distinct terminals.
pub type TerminalId = u64;

pub(crate) type HandlerFn =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A handler node - the sink of a closed graph.
pub struct Terminal {
    id: TerminalId,
    priority: i32,
    handler: HandlerFn,
}

impl Terminal {
    /// Wrap a handler into a terminal with the given task priority.
    pub fn new<F, Fut>(priority: i32, f: F) -> Arc<Terminal>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Arc::new(Terminal {
            id: next_id(),
            priority,
            handler: Arc::new(move |ctx| f(ctx).boxed()),
        })
    }

    pub fn id(&self) -> TerminalId {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn handler(&self) -> HandlerFn {
        self.handler.clone()
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("handler", &"<function>")
            .finish()
    }
}

/// Transition label of an edge, mirroring the bucket it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum EdgeKey {
    /// The single unconditional bucket of an identity node.
    Seq,
    /// An `Equal` bucket value.
    Value(Key),
    /// A predicate / processor bucket.
    Fn(KeyFnId),
    /// A stored prefix string.
    Prefix(String),
    /// A message-element kind bucket.
    Kind(MessageKind),
}

/// Merge identity of a node: its type plus the key-function identity
/// where the node computes one. Two nonterminals may merge only when
/// their tags match (and their predecessor paths do, see
/// [`crate::graph`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeTag {
    Identity,
    Equal(KeyFnId),
    Predicate,
    Prefix(KeyFnId),
    Processor,
    MessageKind,
    Terminal(TerminalId),
}

/// A predicate/processor bucket: the function plus its successors.
#[derive(Clone)]
pub(crate) struct FnBucket {
    pub func: KeyFn,
    pub nodes: HashSet<NodeId>,
}

impl FnBucket {
    fn new(func: KeyFn) -> Self {
        FnBucket { func, nodes: HashSet::new() }
    }
}

/// Node payload stored in the graph arena.
#[derive(Clone)]
pub(crate) enum NodeBody {
    Terminal(Arc<Terminal>),
    Identity {
        succ: HashSet<NodeId>,
    },
    Equal {
        key: KeyFn,
        succ: HashMap<Key, HashSet<NodeId>>,
    },
    Predicate {
        succ: HashMap<KeyFnId, FnBucket>,
    },
    /// Buckets ordered by prefix string; routing emits the successors of
    /// every stored prefix of the computed key.
    Prefix {
        key: KeyFn,
        succ: BTreeMap<String, HashSet<NodeId>>,
    },
    Processor {
        succ: HashMap<KeyFnId, FnBucket>,
    },
    MessageKind {
        succ: HashMap<MessageKind, HashSet<NodeId>>,
    },
}

impl NodeBody {
    pub fn identity() -> Self {
        NodeBody::Identity { succ: HashSet::new() }
    }

    pub fn equal(key: KeyFn, values: impl IntoIterator<Item = Key>) -> Self {
        NodeBody::Equal {
            key,
            succ: values.into_iter().map(|v| (v, HashSet::new())).collect(),
        }
    }

    pub fn predicate(preds: impl IntoIterator<Item = KeyFn>) -> Self {
        NodeBody::Predicate {
            succ: preds.into_iter().map(|p| (p.id().clone(), FnBucket::new(p))).collect(),
        }
    }

    pub fn prefix(key: KeyFn, prefixes: impl IntoIterator<Item = String>) -> Self {
        NodeBody::Prefix {
            key,
            succ: prefixes.into_iter().map(|p| (p, HashSet::new())).collect(),
        }
    }

    pub fn processor(fns: impl IntoIterator<Item = KeyFn>) -> Self {
        NodeBody::Processor {
            succ: fns.into_iter().map(|p| (p.id().clone(), FnBucket::new(p))).collect(),
        }
    }

    pub fn message_kind(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        NodeBody::MessageKind {
            succ: kinds.into_iter().map(|k| (k, HashSet::new())).collect(),
        }
    }

    pub fn tag(&self) -> NodeTag {
        match self {
            NodeBody::Terminal(t) => NodeTag::Terminal(t.id()),
            NodeBody::Identity { .. } => NodeTag::Identity,
            NodeBody::Equal { key, .. } => NodeTag::Equal(key.id().clone()),
            NodeBody::Predicate { .. } => NodeTag::Predicate,
            NodeBody::Prefix { key, .. } => NodeTag::Prefix(key.id().clone()),
            NodeBody::Processor { .. } => NodeTag::Processor,
            NodeBody::MessageKind { .. } => NodeTag::MessageKind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeBody::Terminal(_))
    }

    pub fn as_terminal(&self) -> Option<&Arc<Terminal>> {
        match self {
            NodeBody::Terminal(t) => Some(t),
            _ => None,
        }
    }

    /// All successor ids across buckets.
    pub fn successors(&self) -> HashSet<NodeId> {
        match self {
            NodeBody::Terminal(_) => HashSet::new(),
            NodeBody::Identity { succ } => succ.clone(),
            NodeBody::Equal { succ, .. } => succ.values().flatten().copied().collect(),
            NodeBody::Predicate { succ } => {
                succ.values().flat_map(|b| b.nodes.iter()).copied().collect()
            }
            NodeBody::Prefix { succ, .. } => succ.values().flatten().copied().collect(),
            NodeBody::Processor { succ } => {
                succ.values().flat_map(|b| b.nodes.iter()).copied().collect()
            }
            NodeBody::MessageKind { succ } => succ.values().flatten().copied().collect(),
        }
    }

    /// A nonterminal with no successors in any bucket. Such nodes form the
    /// curve of an open graph and are pruned when removal empties them.
    pub fn is_vacant(&self) -> bool {
        match self {
            NodeBody::Terminal(_) => false,
            _ => self.successors().is_empty(),
        }
    }

    /// Bucket labels under which a new successor gets attached by the
    /// graph algebra (`apply` / sequencing onto curve nodes).
    pub fn attach_keys(&self) -> Vec<EdgeKey> {
        match self {
            NodeBody::Terminal(_) => Vec::new(),
            NodeBody::Identity { .. } => vec![EdgeKey::Seq],
            NodeBody::Equal { succ, .. } => succ.keys().cloned().map(EdgeKey::Value).collect(),
            NodeBody::Predicate { succ } => succ.keys().cloned().map(EdgeKey::Fn).collect(),
            NodeBody::Prefix { succ, .. } => succ.keys().cloned().map(EdgeKey::Prefix).collect(),
            NodeBody::Processor { succ } => succ.keys().cloned().map(EdgeKey::Fn).collect(),
            NodeBody::MessageKind { succ } => succ.keys().copied().map(EdgeKey::Kind).collect(),
        }
    }

    /// Every `(label, members)` bucket of the node, including vacant ones.
    pub fn buckets(&self) -> Vec<(EdgeKey, Vec<NodeId>)> {
        match self {
            NodeBody::Terminal(_) => Vec::new(),
            NodeBody::Identity { succ } => {
                vec![(EdgeKey::Seq, succ.iter().copied().collect())]
            }
            NodeBody::Equal { succ, .. } => succ
                .iter()
                .map(|(k, v)| (EdgeKey::Value(k.clone()), v.iter().copied().collect()))
                .collect(),
            NodeBody::Predicate { succ } => succ
                .iter()
                .map(|(k, b)| (EdgeKey::Fn(k.clone()), b.nodes.iter().copied().collect()))
                .collect(),
            NodeBody::Prefix { succ, .. } => succ
                .iter()
                .map(|(k, v)| (EdgeKey::Prefix(k.clone()), v.iter().copied().collect()))
                .collect(),
            NodeBody::Processor { succ } => succ
                .iter()
                .map(|(k, b)| (EdgeKey::Fn(k.clone()), b.nodes.iter().copied().collect()))
                .collect(),
            NodeBody::MessageKind { succ } => succ
                .iter()
                .map(|(k, v)| (EdgeKey::Kind(*k), v.iter().copied().collect()))
                .collect(),
        }
    }

    /// Members of one bucket.
    pub fn bucket(&self, key: &EdgeKey) -> Option<Vec<NodeId>> {
        self.buckets().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The function evaluated by a predicate/processor bucket.
    pub fn bucket_fn(&self, id: &KeyFnId) -> Option<&KeyFn> {
        match self {
            NodeBody::Predicate { succ } | NodeBody::Processor { succ } => {
                succ.get(id).map(|b| &b.func)
            }
            _ => None,
        }
    }

    /// Insert a successor under `key`, creating the bucket when absent.
    /// The bucket label must match the node's shape; mismatched labels are
    /// a logic error in the graph algebra.
    pub fn add_to_bucket(&mut self, key: EdgeKey, node: NodeId) {
        match (self, key) {
            (NodeBody::Identity { succ }, EdgeKey::Seq) => {
                succ.insert(node);
            }
            (NodeBody::Equal { succ, .. }, EdgeKey::Value(v)) => {
                succ.entry(v).or_default().insert(node);
            }
            (NodeBody::Predicate { succ }, EdgeKey::Fn(id))
            | (NodeBody::Processor { succ }, EdgeKey::Fn(id)) => {
                if let Some(bucket) = succ.get_mut(&id) {
                    bucket.nodes.insert(node);
                }
            }
            (NodeBody::Prefix { succ, .. }, EdgeKey::Prefix(p)) => {
                succ.entry(p).or_default().insert(node);
            }
            (NodeBody::MessageKind { succ }, EdgeKey::Kind(k)) => {
                succ.entry(k).or_default().insert(node);
            }
            (body, key) => {
                debug_assert!(false, "bucket label {key:?} does not fit node {:?}", body.tag());
            }
        }
    }

    /// Make sure a bucket exists for `key` even with no members yet, so
    /// vacant buckets survive graph copies and merges.
    pub fn ensure_bucket(&mut self, key: &EdgeKey, func: Option<&KeyFn>) {
        match (self, key) {
            (NodeBody::Identity { .. }, EdgeKey::Seq) => {}
            (NodeBody::Equal { succ, .. }, EdgeKey::Value(v)) => {
                succ.entry(v.clone()).or_default();
            }
            (NodeBody::Predicate { succ }, EdgeKey::Fn(id))
            | (NodeBody::Processor { succ }, EdgeKey::Fn(id)) => {
                if let Some(func) = func {
                    succ.entry(id.clone()).or_insert_with(|| FnBucket::new(func.clone()));
                }
            }
            (NodeBody::Prefix { succ, .. }, EdgeKey::Prefix(p)) => {
                succ.entry(p.clone()).or_default();
            }
            (NodeBody::MessageKind { succ }, EdgeKey::Kind(k)) => {
                succ.entry(*k).or_default();
            }
            _ => {}
        }
    }

    /// Remove a successor from every bucket, dropping buckets it empties.
    pub fn remove_from_buckets(&mut self, node: NodeId) {
        match self {
            NodeBody::Terminal(_) => {}
            NodeBody::Identity { succ } => {
                succ.remove(&node);
            }
            NodeBody::Equal { succ, .. } => {
                succ.retain(|_, nodes| {
                    nodes.remove(&node);
                    !nodes.is_empty()
                });
            }
            NodeBody::Predicate { succ } | NodeBody::Processor { succ } => {
                succ.retain(|_, bucket| {
                    bucket.nodes.remove(&node);
                    !bucket.nodes.is_empty()
                });
            }
            NodeBody::Prefix { succ, .. } => {
                succ.retain(|_, nodes| {
                    nodes.remove(&node);
                    !nodes.is_empty()
                });
            }
            NodeBody::MessageKind { succ } => {
                succ.retain(|_, nodes| {
                    nodes.remove(&node);
                    !nodes.is_empty()
                });
            }
        }
    }

    /// Same shape with every bucket emptied; used when transplanting a
    /// node into another arena.
    pub fn vacant_shell(&self) -> NodeBody {
        match self {
            NodeBody::Terminal(t) => NodeBody::Terminal(t.clone()),
            NodeBody::Identity { .. } => NodeBody::identity(),
            NodeBody::Equal { key, succ } => {
                NodeBody::equal(key.clone(), succ.keys().cloned())
            }
            NodeBody::Predicate { succ } => {
                NodeBody::predicate(succ.values().map(|b| b.func.clone()))
            }
            NodeBody::Prefix { key, succ } => {
                NodeBody::prefix(key.clone(), succ.keys().cloned())
            }
            NodeBody::Processor { succ } => {
                NodeBody::processor(succ.values().map(|b| b.func.clone()))
            }
            NodeBody::MessageKind { succ } => NodeBody::message_kind(succ.keys().copied()),
        }
    }

    /// Rewrite successor ids through a map, used when splicing a graph
    /// into another arena.
    pub fn remap(&mut self, map: &HashMap<NodeId, NodeId>) {
        let remap_set = |set: &mut HashSet<NodeId>| {
            *set = set.iter().map(|n| map.get(n).copied().unwrap_or(*n)).collect();
        };
        match self {
            NodeBody::Terminal(_) => {}
            NodeBody::Identity { succ } => remap_set(succ),
            NodeBody::Equal { succ, .. } => succ.values_mut().for_each(remap_set),
            NodeBody::Predicate { succ } | NodeBody::Processor { succ } => {
                succ.values_mut().for_each(|b| remap_set(&mut b.nodes))
            }
            NodeBody::Prefix { succ, .. } => succ.values_mut().for_each(remap_set),
            NodeBody::MessageKind { succ } => succ.values_mut().for_each(remap_set),
        }
    }
}

impl fmt::Debug for NodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeBody::Terminal(t) => f.debug_tuple("Terminal").field(&t.id()).finish(),
            NodeBody::Identity { succ } => f.debug_struct("Identity").field("succ", succ).finish(),
            NodeBody::Equal { key, succ } => f
                .debug_struct("Equal")
                .field("key", key.id())
                .field("values", &succ.keys().collect::<Vec<_>>())
                .finish(),
            NodeBody::Predicate { succ } => f
                .debug_struct("Predicate")
                .field("predicates", &succ.keys().collect::<Vec<_>>())
                .finish(),
            NodeBody::Prefix { key, succ } => f
                .debug_struct("Prefix")
                .field("key", key.id())
                .field("prefixes", &succ.keys().collect::<Vec<_>>())
                .finish(),
            NodeBody::Processor { succ } => f
                .debug_struct("Processor")
                .field("functions", &succ.keys().collect::<Vec<_>>())
                .finish(),
            NodeBody::MessageKind { succ } => f
                .debug_struct("MessageKind")
                .field("kinds", &succ.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// Arena slot: a node body plus its predecessor back-edges.
#[derive(Clone, Debug)]
pub(crate) struct NodeSlot {
    pub body: NodeBody,
    pub preds: HashSet<(NodeId, EdgeKey)>,
}

impl NodeSlot {
    pub fn new(body: NodeBody) -> Self {
        NodeSlot { body, preds: HashSet::new() }
    }
}
