//! Routing graph and its algebra
//!
//! A graph is a DAG rooted at an identity start node. Open graphs have a
//! *curve* - frontier nonterminals with no successors yet - and compose
//! with `&` (sequence) and `|` (union); [`Graph::apply`] attaches a
//! terminal under every curve bucket and closes the graph. Closed graphs
//! route events and can absorb further closed graphs (subscription) or
//! drop terminals (unsubscription) with transitive pruning.
//!
//! Whether a graph is open or closed is encoded in the type: [`Graph`] is
//! always open, [`ClosedGraph`] always closed, so "cannot apply on a
//! closed graph" misuse is unrepresentable.
//!
//! Merging: when a union attaches a node whose type, key identity and
//! predecessor path structurally match an existing node, the two collapse
//! into one and their buckets merge recursively. This is what makes
//! hundreds of `kind_is(GroupMessage) & ...` subscriptions share a single
//! `Equal` node at the top of the live graph. Nodes with differing
//! predecessor sets (shared diamonds) never merge.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::RouteError;
use crate::key::{next_id, RouteArgs};
use crate::node::{EdgeKey, NodeBody, NodeId, NodeSlot, Terminal, TerminalId};

/// Outcome of routing one event through a closed graph.
#[derive(Debug, Default)]
pub(crate) struct Routed {
    /// Matched terminals, deduplicated, in discovery order.
    pub terminals: Vec<Arc<Terminal>>,
    /// In-band route errors, deduplicated.
    pub errors: Vec<RouteError>,
}

#[derive(Clone, Debug)]
pub(crate) struct GraphCore {
    nodes: HashMap<NodeId, NodeSlot>,
    start: NodeId,
}

impl GraphCore {
    fn new() -> Self {
        let start = next_id();
        let mut nodes = HashMap::new();
        nodes.insert(start, NodeSlot::new(NodeBody::identity()));
        GraphCore { nodes, start }
    }

    fn slot(&self, id: NodeId) -> &NodeSlot {
        &self.nodes[&id]
    }

    /// Add an edge, mirroring it in the target's predecessor set.
    fn add_edge(&mut self, from: NodeId, key: EdgeKey, to: NodeId) {
        if let Some(slot) = self.nodes.get_mut(&from) {
            slot.body.add_to_bucket(key.clone(), to);
        }
        if let Some(slot) = self.nodes.get_mut(&to) {
            slot.preds.insert((from, key));
        }
    }

    /// Breadth-first node ids reachable from start.
    fn traverse(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self.start]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            for succ in self.slot(id).body.successors() {
                queue.push_back(succ);
            }
        }
        order
    }

    /// Frontier nonterminals with no successors.
    fn curve(&self) -> Vec<NodeId> {
        self.traverse()
            .into_iter()
            .filter(|id| self.slot(*id).body.is_vacant())
            .collect()
    }

    fn terminals(&self) -> Vec<Arc<Terminal>> {
        self.traverse()
            .into_iter()
            .filter_map(|id| self.slot(id).body.as_terminal().cloned())
            .collect()
    }

    /// Copy every node of `other` into this arena under fresh ids.
    /// Returns the id map. No edges into the spliced subgraph are created.
    fn splice(&mut self, other: &GraphCore) -> HashMap<NodeId, NodeId> {
        let map: HashMap<NodeId, NodeId> =
            other.nodes.keys().map(|&id| (id, next_id())).collect();
        for (&old, slot) in &other.nodes {
            let mut body = slot.body.clone();
            body.remap(&map);
            let preds = slot
                .preds
                .iter()
                .map(|(p, k)| (map[p], k.clone()))
                .collect();
            self.nodes.insert(map[&old], NodeSlot { body, preds });
        }
        map
    }

    /// Drop nodes unreachable from start, cleaning dangling predecessor
    /// entries.
    fn prune_unreachable(&mut self) {
        let live: HashSet<NodeId> = self.traverse().into_iter().collect();
        self.nodes.retain(|id, _| live.contains(id));
        for slot in self.nodes.values_mut() {
            slot.preds.retain(|(p, _)| live.contains(p));
        }
    }

    /// Structural node equality: same tag and structurally equal
    /// predecessor sets, recursing toward start. This is the merge guard
    /// that keeps same-typed nodes rooted under different paths apart.
    fn structurally_equal(&self, a: NodeId, other: &GraphCore, b: NodeId) -> bool {
        if self.slot(a).body.tag() != other.slot(b).body.tag() {
            return false;
        }
        let apreds = &self.slot(a).preds;
        let bpreds = &other.slot(b).preds;
        if apreds.len() != bpreds.len() {
            return false;
        }
        let bvec: Vec<&(NodeId, EdgeKey)> = bpreds.iter().collect();
        let mut used = vec![false; bvec.len()];
        for (ap, akey) in apreds {
            let mut found = false;
            for (i, (bp, bkey)) in bvec.iter().enumerate() {
                if used[i] || akey != bkey {
                    continue;
                }
                if self.structurally_equal(*ap, other, *bp) {
                    used[i] = true;
                    found = true;
                    break;
                }
            }
            if !found {
                return false;
            }
        }
        true
    }

    /// Absorb `other` (rooted at its start) into this graph: other's
    /// entries become additional successors of this start, merging
    /// structurally equal nonterminals and transplanting the rest under
    /// fresh ids. Terminals always transplant (identity semantics).
    fn absorb(&mut self, other: &GraphCore) {
        let mut map: HashMap<NodeId, NodeId> = HashMap::from([(other.start, self.start)]);
        let mut queue = VecDeque::from([other.start]);
        let mut processed = HashSet::new();

        while let Some(o) = queue.pop_front() {
            if !processed.insert(o) {
                continue;
            }
            let s = map[&o];
            for (key, members) in other.slot(o).body.buckets() {
                let func = match &key {
                    EdgeKey::Fn(id) => other.slot(o).body.bucket_fn(id).cloned(),
                    _ => None,
                };
                if let Some(slot) = self.nodes.get_mut(&s) {
                    slot.body.ensure_bucket(&key, func.as_ref());
                }
                for oc in members {
                    if let Some(&sc) = map.get(&oc) {
                        self.add_edge(s, key.clone(), sc);
                        continue;
                    }
                    let oc_body = &other.slot(oc).body;
                    if oc_body.is_terminal() {
                        let nid = next_id();
                        self.nodes.insert(nid, NodeSlot::new(oc_body.clone()));
                        map.insert(oc, nid);
                        self.add_edge(s, key.clone(), nid);
                    } else {
                        let merged = self
                            .slot(s)
                            .body
                            .bucket(&key)
                            .unwrap_or_default()
                            .into_iter()
                            .find(|&u| self.structurally_equal(u, other, oc));
                        match merged {
                            Some(u) => {
                                map.insert(oc, u);
                            }
                            None => {
                                let nid = next_id();
                                self.nodes.insert(nid, NodeSlot::new(oc_body.vacant_shell()));
                                map.insert(oc, nid);
                                self.add_edge(s, key.clone(), nid);
                            }
                        }
                        queue.push_back(oc);
                    }
                }
            }
        }
    }

    /// Remove a node: detach it from every predecessor bucket and prune
    /// predecessors left without successors, transitively, never removing
    /// start.
    fn remove_node(&mut self, id: NodeId) {
        let Some(slot) = self.nodes.remove(&id) else {
            return;
        };
        let preds: HashSet<NodeId> = slot.preds.into_iter().map(|(p, _)| p).collect();
        for p in preds {
            let vacated = match self.nodes.get_mut(&p) {
                Some(pslot) => {
                    pslot.body.remove_from_buckets(id);
                    pslot.body.is_vacant()
                }
                None => false,
            };
            if vacated && p != self.start {
                self.remove_node(p);
            }
        }
    }

    fn find_terminal_node(&self, terminal: TerminalId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, slot)| {
                slot.body.as_terminal().map(|t| t.id()) == Some(terminal)
            })
            .map(|(id, _)| *id)
    }

    /// Recursive routing walk. Terminal successors are emitted; routing
    /// errors travel in-band inside the returned list.
    fn route_node<'a>(
        &'a self,
        id: NodeId,
        args: &'a RouteArgs,
    ) -> BoxFuture<'a, Vec<RouteStep>> {
        async move {
            match &self.slot(id).body {
                NodeBody::Terminal(_) => Vec::new(),

                NodeBody::Identity { succ } => {
                    let mut out = Vec::new();
                    for &child in succ {
                        out.extend(self.follow(child, args).await);
                    }
                    out
                }

                NodeBody::Equal { key, succ } => {
                    let computed = match args.store.compute(key, args).await {
                        Ok(k) => k,
                        Err(e) => return vec![RouteStep::Error(e)],
                    };
                    let mut out = Vec::new();
                    if let Some(children) = succ.get(&computed) {
                        for &child in children {
                            out.extend(self.follow(child, args).await);
                        }
                    }
                    out
                }

                NodeBody::Predicate { succ } => {
                    let mut out = Vec::new();
                    for bucket in succ.values() {
                        match args.store.compute(&bucket.func, args).await {
                            Ok(k) if k.truthy() => {
                                for &child in &bucket.nodes {
                                    out.extend(self.follow(child, args).await);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => out.push(RouteStep::Error(e)),
                        }
                    }
                    out
                }

                NodeBody::Prefix { key, succ } => {
                    let computed = match args.store.compute(key, args).await {
                        Ok(k) => k,
                        Err(e) => {
                            tracing::debug!(error = %e, "prefix key failed, yielding nothing");
                            return Vec::new();
                        }
                    };
                    let Some(text) = computed.as_str() else {
                        return Vec::new();
                    };
                    // Every stored prefix of the key fires, not just the
                    // longest one.
                    let mut out = Vec::new();
                    for (prefix, children) in succ {
                        if text.starts_with(prefix.as_str()) {
                            for &child in children {
                                out.extend(self.follow(child, args).await);
                            }
                        }
                    }
                    out
                }

                NodeBody::Processor { succ } => {
                    let mut out = Vec::new();
                    for bucket in succ.values() {
                        match args.store.compute(&bucket.func, args).await {
                            Ok(_) => {}
                            Err(e @ RouteError::Filtered(_)) => {
                                // A filter request still lets the bucket
                                // emit its successors.
                                out.push(RouteStep::Error(e));
                            }
                            Err(e) => {
                                out.push(RouteStep::Error(e));
                                continue;
                            }
                        }
                        for &child in &bucket.nodes {
                            out.extend(self.follow(child, args).await);
                        }
                    }
                    out
                }

                NodeBody::MessageKind { succ } => {
                    let mut chosen: HashSet<NodeId> = HashSet::new();
                    if let Some(message) = args.event.message() {
                        for element in message {
                            if let Some(children) = succ.get(&element.kind()) {
                                chosen.extend(children.iter().copied());
                            }
                        }
                    }
                    let mut out = Vec::new();
                    for child in chosen {
                        out.extend(self.follow(child, args).await);
                    }
                    out
                }
            }
        }
        .boxed()
    }

    fn follow<'a>(
        &'a self,
        child: NodeId,
        args: &'a RouteArgs,
    ) -> BoxFuture<'a, Vec<RouteStep>> {
        async move {
            match self.slot(child).body.as_terminal() {
                Some(t) => vec![RouteStep::Terminal(t.clone())],
                None => self.route_node(child, args).await,
            }
        }
        .boxed()
    }
}

#[derive(Debug)]
enum RouteStep {
    Terminal(Arc<Terminal>),
    Error(RouteError),
}

/// An open routing graph under construction.
#[derive(Clone, Debug)]
pub struct Graph {
    core: GraphCore,
}

impl Graph {
    /// The graph that matches everything: a lone start node. Applying a
    /// terminal to it attaches the terminal directly under start.
    pub fn new() -> Self {
        Graph { core: GraphCore::new() }
    }

    /// Graph consisting of start feeding a single node.
    pub(crate) fn from_body(body: NodeBody) -> Self {
        let mut core = GraphCore::new();
        let id = next_id();
        core.nodes.insert(id, NodeSlot::new(body));
        core.add_edge(core.start, EdgeKey::Seq, id);
        Graph { core }
    }

    /// Sequence: this graph's curve feeds `other`'s entries. When both
    /// sides are multi-headed, `other`'s start node is kept in between so
    /// the connection stays linear instead of a cross-product.
    pub fn seq(mut self, other: Graph) -> Graph {
        let curve = self.core.curve();
        let map = self.core.splice(&other.core);
        let other_start = map[&other.core.start];
        let entries: Vec<NodeId> = self.core.slot(other_start).body.successors().into_iter().collect();

        if curve.len() > 1 && entries.len() > 1 {
            for &u in &curve {
                for key in self.core.slot(u).body.attach_keys() {
                    self.core.add_edge(u, key, other_start);
                }
            }
        } else {
            for &u in &curve {
                for key in self.core.slot(u).body.attach_keys() {
                    for &v in &entries {
                        self.core.add_edge(u, key.clone(), v);
                    }
                }
            }
            // The spliced start is bypassed; drop it and its back-edges.
            self.core.nodes.remove(&other_start);
            for &v in &entries {
                if let Some(slot) = self.core.nodes.get_mut(&v) {
                    slot.preds.retain(|(p, _)| *p != other_start);
                }
            }
        }
        self.core.prune_unreachable();
        self
    }

    /// Union: `other`'s entries become additional successors of this
    /// graph's start, merging structurally equal nodes.
    pub fn union(mut self, other: Graph) -> Graph {
        self.core.absorb(&other.core);
        self
    }

    /// Attach `terminal` under every bucket of every curve node and close
    /// the graph. The open graph is left intact for reuse.
    pub fn apply(&self, terminal: Arc<Terminal>) -> ClosedGraph {
        let mut core = self.core.clone();
        let tid = next_id();
        core.nodes.insert(tid, NodeSlot::new(NodeBody::Terminal(terminal)));
        for u in core.curve() {
            for key in core.slot(u).body.attach_keys() {
                core.add_edge(u, key, tid);
            }
        }
        ClosedGraph { core }
    }

    /// Number of reachable nodes, including start.
    pub fn node_count(&self) -> usize {
        self.core.traverse().len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl BitAnd for Graph {
    type Output = Graph;

    fn bitand(self, rhs: Graph) -> Graph {
        self.seq(rhs)
    }
}

impl BitOr for Graph {
    type Output = Graph;

    fn bitor(self, rhs: Graph) -> Graph {
        self.union(rhs)
    }
}

/// A closed routing graph: terminals attached, ready to route events.
#[derive(Clone, Debug)]
pub struct ClosedGraph {
    core: GraphCore,
}

impl ClosedGraph {
    /// Closed graph with no terminals; routes nothing.
    pub fn empty() -> Self {
        ClosedGraph { core: GraphCore::new() }
    }

    /// Absorb another closed graph (subscription).
    pub fn union_with(&mut self, other: &ClosedGraph) {
        self.core.absorb(&other.core);
    }

    /// All terminals reachable in the graph.
    pub fn terminals(&self) -> Vec<Arc<Terminal>> {
        self.core.terminals()
    }

    /// Remove a terminal and transitively prune nonterminals it leaves
    /// without successors.
    pub fn remove_terminal(&mut self, terminal: TerminalId) {
        if let Some(id) = self.core.find_terminal_node(terminal) {
            self.core.remove_node(id);
        }
    }

    /// Number of reachable nodes, including start.
    pub fn node_count(&self) -> usize {
        self.core.traverse().len()
    }

    /// Route one event: collect the deduplicated matched terminal set and
    /// the in-band route errors.
    pub(crate) async fn route(&self, args: &RouteArgs) -> Routed {
        let steps = self.core.route_node(self.core.start, args).await;
        let mut routed = Routed::default();
        let mut seen = HashSet::new();
        for step in steps {
            match step {
                RouteStep::Terminal(t) => {
                    if seen.insert(t.id()) {
                        routed.terminals.push(t);
                    }
                }
                RouteStep::Error(e) => {
                    if !routed.errors.iter().any(|x| x.same_as(&e)) {
                        routed.errors.push(e);
                    }
                }
            }
        }
        routed
    }
}
