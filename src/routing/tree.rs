//! Segment trie over route paths.
//!
//! # Responsibilities
//! - Index routes by the literal text of their path segments
//! - Hold the fallback route out of band
//! - Order a node's children by specificity for a given pathname
//!
//! # Design Decisions
//! - Dynamic segments (`:id`, `:id(\d+)`) are plain trie keys; pattern
//!   semantics are only evaluated during traversal
//! - Nodes live in an arena owned by the tree; traversal is top-down so no
//!   back references are needed
//! - Routes sharing one node are ordered by query rule count (descending),
//!   then declaration order

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use crate::routing::matcher::{segment_matches, PatternCache};
use crate::routing::route::Route;
use crate::routing::router::RoutingError;

/// Index of a node in the tree arena.
pub type NodeId = usize;

/// Index of the root node.
pub const ROOT: NodeId = 0;

/// A trie node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Depth in the trie; the root is 0.
    pub level: usize,
    /// Segment key leading to this node (empty for the root).
    pub segment: String,
    /// Children keyed by segment text.
    pub children: HashMap<String, NodeId>,
    /// Indexes (into the route list) of routes ending at this node.
    pub routes: Vec<usize>,
}

impl Node {
    fn new(level: usize, segment: &str) -> Self {
        Self {
            level,
            segment: segment.to_string(),
            children: HashMap::new(),
            routes: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Route trie plus the optional fallback route.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    fallback: Option<usize>,
}

/// Split a path on `/`, dropping empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Literal keys compare by text; everything else is a pattern.
pub(crate) fn is_literal(segment: &str) -> bool {
    !segment.contains([':', '(', '*', '?', '+'])
}

/// Keys that may consume more than one pathname segment.
fn can_span_segments(segment: &str) -> bool {
    segment.contains(['*', '+', '('])
}

/// Keys that may match no segment at all.
pub(crate) fn is_optional(segment: &str) -> bool {
    segment.ends_with('?') || segment.ends_with('*')
}

fn has_capturing_group(segment: &str) -> bool {
    segment.contains('(')
}

impl Tree {
    /// Build the trie for a route list.
    ///
    /// Fails if more than one route is a fallback route.
    pub fn build(routes: &[Arc<Route>]) -> Result<Self, RoutingError> {
        let mut tree = Self {
            nodes: vec![Node::new(0, "")],
            fallback: None,
        };

        for (index, route) in routes.iter().enumerate() {
            if route.is_fallback() {
                if let Some(existing) = tree.fallback {
                    return Err(RoutingError::DuplicateFallback {
                        first: routes[existing].label().to_string(),
                        second: route.label().to_string(),
                    });
                }
                tree.fallback = Some(index);
                continue;
            }
            tree.insert(&route.path, index);
        }

        for node in &mut tree.nodes {
            node.routes.sort_by_key(|&i| Reverse(routes[i].query.len()));
        }

        Ok(tree)
    }

    fn insert(&mut self, path: &str, route: usize) {
        let mut current = ROOT;
        for (depth, segment) in split_segments(path).into_iter().enumerate() {
            current = match self.nodes[current].children.get(segment) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::new(depth + 1, segment));
                    self.nodes[current].children.insert(segment.to_string(), child);
                    child
                }
            };
        }
        self.nodes[current].routes.push(route);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn root(&self) -> &Node {
        &self.nodes[ROOT]
    }

    /// Index of the fallback route, if one was declared.
    pub fn fallback(&self) -> Option<usize> {
        self.fallback
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.fallback.is_none()
    }

    /// Children of `id` that may match `segments[depth]`, most specific first.
    ///
    /// 1. literal keys equal to the segment
    /// 2. pattern keys that accept the segment and whose subtree shape agrees
    ///    with whether more segments follow
    /// 3. remaining pattern keys that may still match
    ///
    /// Within groups 2 and 3, keys with a capturing group come first.
    pub fn ordered_children(
        &self,
        id: NodeId,
        segments: &[&str],
        patterns: &PatternCache,
    ) -> Vec<NodeId> {
        let node = &self.nodes[id];
        let Some(segment) = segments.get(node.level) else {
            return Vec::new();
        };
        let more_follow = segments.len() > node.level + 1;

        let mut exact = Vec::new();
        let mut aligned = Vec::new();
        let mut rest = Vec::new();

        for (key, &child) in &node.children {
            if is_literal(key) {
                if key.eq_ignore_ascii_case(segment) {
                    exact.push(child);
                }
                continue;
            }

            let accepts = segment_matches(patterns, key, segment);
            if accepts && more_follow == !self.nodes[child].is_leaf() {
                aligned.push(child);
            } else if accepts || can_span_segments(key) || is_optional(key) {
                rest.push(child);
            }
        }

        // HashMap order is arbitrary; sort for determinism before grouping
        let by_specificity = |ids: &mut Vec<NodeId>| {
            ids.sort_by(|&a, &b| {
                let (ka, kb) = (&self.nodes[a].segment, &self.nodes[b].segment);
                has_capturing_group(kb)
                    .cmp(&has_capturing_group(ka))
                    .then_with(|| ka.cmp(kb))
            });
        };
        by_specificity(&mut aligned);
        by_specificity(&mut rest);

        exact.into_iter().chain(aligned).chain(rest).collect()
    }

    /// Children of `id` whose key may match no segment, most specific first.
    pub fn optional_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self.nodes[id]
            .children
            .iter()
            .filter(|(key, _)| is_optional(key))
            .map(|(_, &child)| child)
            .collect();
        children.sort_by(|&a, &b| {
            let (ka, kb) = (&self.nodes[a].segment, &self.nodes[b].segment);
            has_capturing_group(kb)
                .cmp(&has_capturing_group(ka))
                .then_with(|| ka.cmp(kb))
        });
        children
    }
}
