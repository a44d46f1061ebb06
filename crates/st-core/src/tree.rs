//! Device tree adapters.
//!
//! The simulator's model is a tree of named nodes. The telemetry core only
//! needs a narrow view of it:
//! - Counters (normal delta semantics or latest-sample semantics)
//! - Parameters (invariant numeric values)
//! - Statistic definitions (an expression string plus optional
//!   sub-statistics for grouped output)
//! - Notification sources (payload broadcasters used by triggers)
//!
//! Nodes are shared through `Rc`; parents are held weakly so statistic
//! instances can outlive the part of the tree they observe.

use crate::sched::Clock;
use regex::Regex;
use st_common::{Error, Result, StatClass, Visibility};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::trace;

/// Counter semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterBehavior {
    /// Monotonic count; statistics report the delta over their window.
    #[default]
    Normal,
    /// Sampled absolute value; statistics report the current value.
    Latest,
}

/// Subscription handle returned by [`TreeNode::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Rc<dyn Fn(f64)>;

/// A member of a context-counter group.
#[derive(Debug, Clone)]
pub struct SubStatistic {
    pub node: Weak<TreeNode>,
    /// Short name used as the key in grouped output.
    pub name: String,
}

/// What a node is.
pub enum NodeKind {
    Container,
    Counter {
        behavior: CounterBehavior,
        value: Cell<u64>,
    },
    Parameter {
        value: Cell<f64>,
    },
    StatisticDef {
        expression: String,
        sub_statistics: RefCell<Vec<SubStatistic>>,
    },
    NotificationSource {
        observers: RefCell<Vec<(SubscriptionId, Observer)>>,
        next_id: Cell<u64>,
    },
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Container => "container",
            NodeKind::Counter { .. } => "counter",
            NodeKind::Parameter { .. } => "parameter",
            NodeKind::StatisticDef { .. } => "statistic_def",
            NodeKind::NotificationSource { .. } => "notification_source",
        }
    }
}

/// One node of the device tree.
pub struct TreeNode {
    name: String,
    desc: String,
    kind: NodeKind,
    visibility: Visibility,
    class: StatClass,
    parent: RefCell<Weak<TreeNode>>,
    children: RefCell<Vec<Rc<TreeNode>>>,
    clock: RefCell<Option<Rc<Clock>>>,
}

impl TreeNode {
    fn with_kind(name: impl Into<String>, desc: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            desc: desc.into(),
            kind,
            visibility: Visibility::Normal,
            class: StatClass::Default,
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            clock: RefCell::new(None),
        }
    }

    /// A root node driven by `clock`.
    pub fn root(name: impl Into<String>, clock: Rc<Clock>) -> Rc<Self> {
        let node = Self::with_kind(name, "", NodeKind::Container);
        *node.clock.borrow_mut() = Some(clock);
        Rc::new(node)
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self::with_kind(name, "", NodeKind::Container)
    }

    pub fn counter(name: impl Into<String>, desc: impl Into<String>, behavior: CounterBehavior) -> Self {
        Self::with_kind(
            name,
            desc,
            NodeKind::Counter {
                behavior,
                value: Cell::new(0),
            },
        )
    }

    pub fn parameter(name: impl Into<String>, desc: impl Into<String>, value: f64) -> Self {
        Self::with_kind(
            name,
            desc,
            NodeKind::Parameter {
                value: Cell::new(value),
            },
        )
    }

    pub fn statistic_def(name: impl Into<String>, desc: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            desc,
            NodeKind::StatisticDef {
                expression: expression.into(),
                sub_statistics: RefCell::new(Vec::new()),
            },
        )
    }

    pub fn notification_source(name: impl Into<String>, desc: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            desc,
            NodeKind::NotificationSource {
                observers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            },
        )
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_class(mut self, class: StatClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_clock(self, clock: Rc<Clock>) -> Self {
        *self.clock.borrow_mut() = Some(clock);
        self
    }

    /// Attach `child` and return the shared handle.
    pub fn add_child(self: &Rc<Self>, child: TreeNode) -> Result<Rc<TreeNode>> {
        if child.name.is_empty() || child.name.contains('.') {
            return Err(Error::Construction(format!(
                "invalid node name '{}' under '{}'",
                child.name,
                self.location()
            )));
        }
        if self.child(&child.name).is_some() {
            return Err(Error::Construction(format!(
                "node '{}' already has a child named '{}'",
                self.location(),
                child.name
            )));
        }
        let child = Rc::new(child);
        *child.parent.borrow_mut() = Rc::downgrade(self);
        self.children.borrow_mut().push(Rc::clone(&child));
        Ok(child)
    }

    /// Detach a child; statistics observing it see an expired source once
    /// the last handle is dropped.
    pub fn remove_child(&self, name: &str) -> Option<Rc<TreeNode>> {
        let mut children = self.children.borrow_mut();
        let idx = children.iter().position(|c| c.name == name)?;
        let child = children.remove(idx);
        *child.parent.borrow_mut() = Weak::new();
        Some(child)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn class(&self) -> &StatClass {
        &self.class
    }

    pub fn parent(&self) -> Option<Rc<TreeNode>> {
        self.parent.borrow().upgrade()
    }

    pub fn children(&self) -> Vec<Rc<TreeNode>> {
        self.children.borrow().clone()
    }

    pub fn child(&self, name: &str) -> Option<Rc<TreeNode>> {
        self.children.borrow().iter().find(|c| c.name == name).cloned()
    }

    /// Topmost ancestor (or self).
    pub fn root_node(self: &Rc<Self>) -> Rc<TreeNode> {
        let mut node = Rc::clone(self);
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// Dotted path from the root, root name included.
    pub fn location(&self) -> String {
        let mut parts = vec![self.name.clone()];
        let mut parent = self.parent();
        while let Some(p) = parent {
            parts.push(p.name.clone());
            parent = p.parent();
        }
        parts.reverse();
        parts.join(".")
    }

    /// This node's clock, or the nearest ancestor's.
    pub fn clock(&self) -> Option<Rc<Clock>> {
        if let Some(clock) = self.clock.borrow().as_ref() {
            return Some(Rc::clone(clock));
        }
        let mut parent = self.parent();
        while let Some(p) = parent {
            if let Some(clock) = p.clock.borrow().as_ref() {
                return Some(Rc::clone(clock));
            }
            parent = p.parent();
        }
        None
    }

    pub fn is_counter(&self) -> bool {
        matches!(self.kind, NodeKind::Counter { .. })
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, NodeKind::Parameter { .. })
    }

    pub fn is_statistic_def(&self) -> bool {
        matches!(self.kind, NodeKind::StatisticDef { .. })
    }

    pub fn is_notification_source(&self) -> bool {
        matches!(self.kind, NodeKind::NotificationSource { .. })
    }

    /// Whether statistics can be built from this node.
    pub fn is_statistic_source(&self) -> bool {
        self.is_counter() || self.is_parameter() || self.is_statistic_def()
    }

    // ------------------------------------------------------------------
    // Counters and parameters
    // ------------------------------------------------------------------

    pub fn counter_behavior(&self) -> Option<CounterBehavior> {
        match &self.kind {
            NodeKind::Counter { behavior, .. } => Some(*behavior),
            _ => None,
        }
    }

    /// Add `n` to a counter. No-op on other kinds.
    pub fn increment(&self, n: u64) {
        if let NodeKind::Counter { value, .. } = &self.kind {
            value.set(value.get().wrapping_add(n));
        }
    }

    /// Overwrite a counter or parameter value.
    pub fn set(&self, v: f64) {
        match &self.kind {
            NodeKind::Counter { value, .. } => value.set(v.max(0.0) as u64),
            NodeKind::Parameter { value } => value.set(v),
            _ => {}
        }
    }

    pub fn get(&self) -> u64 {
        match &self.kind {
            NodeKind::Counter { value, .. } => value.get(),
            _ => 0,
        }
    }

    /// Current raw value; NaN for kinds without an intrinsic value.
    pub fn current_value(&self) -> f64 {
        match &self.kind {
            NodeKind::Counter { value, .. } => value.get() as f64,
            NodeKind::Parameter { value } => value.get(),
            _ => f64::NAN,
        }
    }

    /// Counters and parameters compress; statistic definitions decide
    /// through their expression.
    pub fn supports_compression(&self) -> bool {
        matches!(self.kind, NodeKind::Counter { .. } | NodeKind::Parameter { .. })
    }

    // ------------------------------------------------------------------
    // Statistic definitions
    // ------------------------------------------------------------------

    pub fn expression(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::StatisticDef { expression, .. } => Some(expression),
            _ => None,
        }
    }

    /// Register a member of this definition's context-counter group.
    pub fn add_sub_statistic(&self, node: &Rc<TreeNode>, name: impl Into<String>) -> Result<()> {
        match &self.kind {
            NodeKind::StatisticDef { sub_statistics, .. } => {
                sub_statistics.borrow_mut().push(SubStatistic {
                    node: Rc::downgrade(node),
                    name: name.into(),
                });
                Ok(())
            }
            _ => Err(Error::IllegalOperation(format!(
                "'{}' is not a statistic definition",
                self.location()
            ))),
        }
    }

    pub fn sub_statistics(&self) -> Vec<SubStatistic> {
        match &self.kind {
            NodeKind::StatisticDef { sub_statistics, .. } => sub_statistics.borrow().clone(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Notification sources
    // ------------------------------------------------------------------

    pub fn subscribe(&self, observer: impl Fn(f64) + 'static) -> Option<SubscriptionId> {
        match &self.kind {
            NodeKind::NotificationSource { observers, next_id } => {
                let id = SubscriptionId(next_id.get());
                next_id.set(id.0 + 1);
                observers.borrow_mut().push((id, Rc::new(observer)));
                Some(id)
            }
            _ => None,
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match &self.kind {
            NodeKind::NotificationSource { observers, .. } => {
                let mut observers = observers.borrow_mut();
                let before = observers.len();
                observers.retain(|(sid, _)| *sid != id);
                observers.len() != before
            }
            _ => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        match &self.kind {
            NodeKind::NotificationSource { observers, .. } => observers.borrow().len(),
            _ => 0,
        }
    }

    /// Deliver `payload` to every observer, synchronously.
    ///
    /// Observers may subscribe or unsubscribe while being notified; the
    /// delivery list is fixed when the post starts.
    pub fn post(&self, payload: f64) {
        if let NodeKind::NotificationSource { observers, .. } = &self.kind {
            let snapshot: Vec<Observer> = observers.borrow().iter().map(|(_, o)| Rc::clone(o)).collect();
            trace!(source = %self.name, payload, observers = snapshot.len(), "Posting notification");
            for observer in snapshot {
                observer(payload);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Resolve a dotted path relative to this node.
    pub fn find(self: &Rc<Self>, path: &str) -> Option<Rc<TreeNode>> {
        let path = path.trim();
        if path.is_empty() {
            return Some(Rc::clone(self));
        }
        let mut node = Rc::clone(self);
        for part in path.split('.') {
            node = node.child(part)?;
        }
        Some(node)
    }

    /// Resolve relative to this node, then relative to the root (with or
    /// without the root's own name as first segment).
    pub fn resolve(self: &Rc<Self>, path: &str) -> Option<Rc<TreeNode>> {
        if let Some(node) = self.find(path) {
            return Some(node);
        }
        let root = self.root_node();
        if let Some(rest) = path.strip_prefix(root.name()).and_then(|r| r.strip_prefix('.')) {
            if let Some(node) = root.find(rest) {
                return Some(node);
            }
        }
        if path == root.name() {
            return Some(root);
        }
        root.find(path)
    }

    /// Match a dotted pattern with `*` / `?` wildcards below this node.
    ///
    /// Each wildcard segment contributes one capture per wildcard
    /// character, in order; captures feed `%1..%N` replacements.
    pub fn find_pattern(self: &Rc<Self>, pattern: &str) -> Result<Vec<(Rc<TreeNode>, Vec<String>)>> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "_global" {
            return Ok(vec![(Rc::clone(self), Vec::new())]);
        }
        let segments = pattern
            .split('.')
            .map(SegmentMatcher::compile)
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::new();
        match_segments(self, &segments, Vec::new(), &mut out);
        if out.is_empty() && !self.name.is_empty() {
            // Patterns may name the root explicitly.
            if let Some(first) = segments.first() {
                if let Some(mut caps) = first.captures(&self.name) {
                    if segments.len() == 1 {
                        out.push((Rc::clone(self), caps));
                    } else {
                        let mut rest = Vec::new();
                        match_segments(self, &segments[1..], std::mem::take(&mut caps), &mut rest);
                        out = rest;
                    }
                }
            }
        }
        Ok(out)
    }

    /// First notification source named `name` in a depth-first walk.
    pub fn find_notification_source(self: &Rc<Self>, name: &str) -> Option<Rc<TreeNode>> {
        if self.is_notification_source() && self.name == name {
            return Some(Rc::clone(self));
        }
        self.children()
            .iter()
            .find_map(|c| c.find_notification_source(name))
    }

    /// Depth-first visit of this node and its descendants.
    pub fn walk(self: &Rc<Self>, visit: &mut dyn FnMut(&Rc<TreeNode>, usize)) {
        fn go(node: &Rc<TreeNode>, depth: usize, visit: &mut dyn FnMut(&Rc<TreeNode>, usize)) {
            visit(node, depth);
            for child in node.children() {
                go(&child, depth + 1, visit);
            }
        }
        go(self, 0, visit);
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("location", &self.location())
            .field("kind", &self.kind.as_str())
            .finish()
    }
}

/// One compiled pattern segment.
enum SegmentMatcher {
    Literal(String),
    Wildcard(Regex),
}

impl SegmentMatcher {
    fn compile(segment: &str) -> Result<Self> {
        if !segment.contains(['*', '?']) {
            return Ok(SegmentMatcher::Literal(segment.to_string()));
        }
        let mut re = String::from("^");
        for ch in segment.chars() {
            match ch {
                '*' => re.push_str("(.*)"),
                '?' => re.push_str("(.)"),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        Regex::new(&re)
            .map(SegmentMatcher::Wildcard)
            .map_err(|e| Error::parse(format!("invalid location pattern segment '{}': {}", segment, e)))
    }

    fn captures(&self, name: &str) -> Option<Vec<String>> {
        match self {
            SegmentMatcher::Literal(lit) => (lit == name).then(Vec::new),
            SegmentMatcher::Wildcard(re) => re.captures(name).map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            }),
        }
    }
}

fn match_segments(
    node: &Rc<TreeNode>,
    segments: &[SegmentMatcher],
    captured: Vec<String>,
    out: &mut Vec<(Rc<TreeNode>, Vec<String>)>,
) {
    let Some((first, rest)) = segments.split_first() else {
        out.push((Rc::clone(node), captured));
        return;
    };
    for child in node.children() {
        if let Some(caps) = first.captures(child.name()) {
            let mut next = captured.clone();
            next.extend(caps);
            match_segments(&child, rest, next, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;

    fn tree() -> Rc<TreeNode> {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        for core in ["core0", "core1"] {
            let c = root.add_child(TreeNode::container(core)).unwrap();
            c.add_child(TreeNode::counter("retired", "Instructions retired", CounterBehavior::Normal))
                .unwrap();
        }
        root
    }

    #[test]
    fn test_location_and_lookup() {
        let root = tree();
        let node = root.find("core1.retired").unwrap();
        assert_eq!(node.location(), "top.core1.retired");
        assert!(Rc::ptr_eq(&root.resolve("top.core1.retired").unwrap(), &node));
        let core0 = root.find("core0").unwrap();
        assert!(core0.resolve("core1.retired").is_some());
        assert!(root.find("core2").is_none());
        assert!(node.clock().is_some());
    }

    #[test]
    fn test_wildcard_captures() {
        let root = tree();
        let hits = root.find_pattern("core*.retired").unwrap();
        let caps: Vec<_> = hits.iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(caps, vec![vec!["0".to_string()], vec!["1".to_string()]]);

        let hits = root.find_pattern("top.core?").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].0.name(), "core1");
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let root = tree();
        assert!(root.add_child(TreeNode::container("core0")).is_err());
        assert!(root.add_child(TreeNode::container("a.b")).is_err());
    }

    #[test]
    fn test_notification_delivery() {
        let root = tree();
        let src = root
            .add_child(TreeNode::notification_source("A", "test channel"))
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let id = src.subscribe(move |v| s.borrow_mut().push(v)).unwrap();
        src.post(1.0);
        assert!(src.unsubscribe(id));
        src.post(2.0);
        assert_eq!(*seen.borrow(), vec![1.0]);
        assert!(Rc::ptr_eq(&root.find_notification_source("A").unwrap(), &src));
    }

    #[test]
    fn test_counter_semantics() {
        let root = tree();
        let c = root.find("core0.retired").unwrap();
        c.increment(3);
        c.increment(2);
        assert_eq!(c.get(), 5);
        assert_eq!(c.current_value(), 5.0);
        assert_eq!(c.counter_behavior(), Some(CounterBehavior::Normal));
    }
}
