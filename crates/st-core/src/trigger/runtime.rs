//! Armed trigger expressions.
//!
//! Arming an expression registers one watcher per atom: counter atoms
//! poll once per clock cycle in [`Phase::Trigger`], notification atoms
//! subscribe to their source, reference atoms listen on the tag registry,
//! and cycle/time atoms schedule a single event. Each watcher latches its
//! atom when satisfied; the trigger fires the first time the expression
//! over the latches is true, then drops every registration.

use super::expr::{Edge, TriggerAtom, TriggerExpr};
use super::periodic::TimeTrigger;
use super::tags::{TagListenerId, TagRegistry};
use crate::sched::{Clock, EventId, Phase, RepeatingEvent, Scheduler};
use crate::tree::{SubscriptionId, TreeNode};
use st_common::{Error, Result};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Where trigger paths resolve and tags are published.
#[derive(Clone)]
pub struct TriggerContext {
    pub node: Rc<TreeNode>,
    pub tags: TagRegistry,
}

impl TriggerContext {
    pub fn new(node: &Rc<TreeNode>, tags: &TagRegistry) -> Self {
        Self {
            node: Rc::clone(node),
            tags: tags.clone(),
        }
    }

    pub fn clock(&self) -> Result<Rc<Clock>> {
        self.node
            .clock()
            .ok_or_else(|| Error::trigger(format!("no clock reachable from '{}'", self.node.location())))
    }

    pub fn scheduler(&self) -> Result<Rc<Scheduler>> {
        Ok(Rc::clone(self.clock()?.scheduler()))
    }

    /// First clock named `name` in the tree.
    pub fn find_clock(&self, name: &str) -> Option<Rc<Clock>> {
        let mut found = None;
        self.node.root_node().walk(&mut |node, _| {
            if found.is_none() {
                if let Some(clock) = node.clock() {
                    if clock.name() == name {
                        found = Some(clock);
                    }
                }
            }
        });
        found
    }

    /// Counter or parameter at `path`.
    pub fn counter(&self, path: &str) -> Result<Rc<TreeNode>> {
        match self.node.resolve(path) {
            Some(node) if node.is_counter() || node.is_parameter() => Ok(node),
            Some(node) => Err(Error::trigger(format!(
                "'{}' is a {}, not a counter",
                node.location(),
                node.kind().as_str()
            ))),
            None => Err(Error::trigger(format!(
                "counter '{}' not found from '{}'",
                path,
                self.node.location()
            ))),
        }
    }

    pub fn notification_source(&self, channel: &str) -> Result<Rc<TreeNode>> {
        self.node
            .find_notification_source(channel)
            .or_else(|| self.node.root_node().find_notification_source(channel))
            .or_else(|| self.node.resolve(channel).filter(|n| n.is_notification_source()))
            .ok_or_else(|| Error::trigger(format!("notification source '{}' not found", channel)))
    }
}

/// One thing a trigger is registered with.
pub(crate) enum Registration {
    Poll(RepeatingEvent),
    Event { scheduler: Weak<Scheduler>, id: EventId },
    Timer(TimeTrigger),
    Subscription { node: Weak<TreeNode>, id: SubscriptionId },
    Tag { registry: TagRegistry, tag: String, id: TagListenerId },
}

impl Registration {
    pub(crate) fn cancel(self) {
        match self {
            Registration::Poll(event) => event.cancel(),
            Registration::Event { scheduler, id } => {
                if let Some(s) = scheduler.upgrade() {
                    s.cancel(id);
                }
            }
            Registration::Timer(timer) => timer.deactivate(),
            Registration::Subscription { node, id } => {
                if let Some(n) = node.upgrade() {
                    n.unsubscribe(id);
                }
            }
            Registration::Tag { registry, tag, id } => {
                registry.unlisten(&tag, id);
            }
        }
    }
}

/// An expression about to be armed.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    name: String,
    expr: TriggerExpr,
    publish: Option<(String, Edge)>,
}

impl TriggerSpec {
    pub fn new(name: impl Into<String>, expr: TriggerExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            publish: None,
        }
    }

    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        Ok(Self::new(name, TriggerExpr::parse(text)?))
    }

    /// Publish `tag.<edge>` when this trigger fires.
    pub fn publish_as(mut self, tag: impl Into<String>, edge: Edge) -> Self {
        self.publish = Some((tag.into(), edge));
        self
    }

    pub fn expression(&self) -> &TriggerExpr {
        &self.expr
    }

    pub fn arm(self, ctx: &TriggerContext, callback: impl FnOnce() + 'static) -> Result<ExpressionTrigger> {
        let latches = vec![false; self.expr.atoms().len()];
        let inner = Rc::new(Inner {
            name: self.name,
            expr: self.expr,
            latches: RefCell::new(latches),
            fired: Cell::new(false),
            registrations: RefCell::new(Vec::new()),
            callback: RefCell::new(Some(Box::new(callback))),
            publish: self.publish.map(|(tag, edge)| (ctx.tags.clone(), tag, edge)),
        });
        let atoms: Vec<TriggerAtom> = inner.expr.atoms().into_iter().cloned().collect();
        for (idx, atom) in atoms.iter().enumerate() {
            match watch(&inner, idx, atom, ctx) {
                Ok(reg) => inner.registrations.borrow_mut().push(reg),
                Err(e) => {
                    inner.cancel_all();
                    return Err(e);
                }
            }
        }
        debug!(trigger = %inner.name, expression = %inner.expr, "Trigger armed");
        Ok(ExpressionTrigger { inner })
    }
}

struct Inner {
    name: String,
    expr: TriggerExpr,
    latches: RefCell<Vec<bool>>,
    fired: Cell<bool>,
    registrations: RefCell<Vec<Registration>>,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
    publish: Option<(TagRegistry, String, Edge)>,
}

impl Inner {
    fn latch(&self, idx: usize) {
        if self.fired.get() {
            return;
        }
        let ready = {
            let mut latches = self.latches.borrow_mut();
            if let Some(slot) = latches.get_mut(idx) {
                *slot = true;
            }
            self.expr.evaluate(&latches)
        };
        if ready {
            self.fire();
        }
    }

    fn fire(&self) {
        self.fired.set(true);
        self.cancel_all();
        debug!(trigger = %self.name, "Trigger fired");
        let callback = self.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
        if let Some((tags, tag, edge)) = &self.publish {
            tags.fire(tag, *edge);
        }
    }

    fn cancel_all(&self) {
        let regs = std::mem::take(&mut *self.registrations.borrow_mut());
        for reg in regs {
            reg.cancel();
        }
    }
}

fn latch(weak: &Weak<Inner>, idx: usize) {
    if let Some(inner) = weak.upgrade() {
        inner.latch(idx);
    }
}

/// Poll `node` once per cycle until `satisfied` holds.
fn poll_counter(
    weak: Weak<Inner>,
    idx: usize,
    node: &Rc<TreeNode>,
    clock: &Rc<Clock>,
    satisfied: impl Fn(f64) -> bool + 'static,
) -> Registration {
    let target = Rc::downgrade(node);
    let event = clock.every_cycle(Phase::Trigger, move || {
        let Some(node) = target.upgrade() else {
            warn!("Counter watched by a trigger was destroyed; the condition can no longer fire");
            return false;
        };
        if satisfied(node.current_value()) {
            latch(&weak, idx);
            return false;
        }
        true
    });
    Registration::Poll(event)
}

fn watch(inner: &Rc<Inner>, idx: usize, atom: &TriggerAtom, ctx: &TriggerContext) -> Result<Registration> {
    let weak = Rc::downgrade(inner);
    match atom {
        TriggerAtom::Counter { path, threshold } => {
            let node = ctx.counter(path)?;
            let clock = node.clock().map_or_else(|| ctx.clock(), Ok)?;
            let threshold = *threshold as f64;
            Ok(poll_counter(weak, idx, &node, &clock, move |v| v >= threshold))
        }
        TriggerAtom::Notification { channel, op, value } => {
            let node = ctx.notification_source(channel)?;
            let (op, value) = (*op, *value);
            let id = node
                .subscribe(move |payload| {
                    if op.apply(payload, value) {
                        latch(&weak, idx);
                    }
                })
                .ok_or_else(|| Error::trigger(format!("'{}' does not accept subscriptions", channel)))?;
            Ok(Registration::Subscription {
                node: Rc::downgrade(&node),
                id,
            })
        }
        TriggerAtom::Reference { tag, edge } => {
            let id = ctx.tags.listen(tag, *edge, move || latch(&weak, idx));
            Ok(Registration::Tag {
                registry: ctx.tags.clone(),
                tag: tag.clone(),
                id,
            })
        }
        TriggerAtom::Cycles { clock, count } => {
            let clock = match clock {
                Some(name) => ctx
                    .find_clock(name)
                    .ok_or_else(|| Error::trigger(format!("clock '{}' not found", name)))?,
                None => ctx.clock()?,
            };
            schedule_cycles(weak, idx, &clock, *count)
        }
        TriggerAtom::Time { .. } => {
            let ticks = atom.time_ticks().unwrap_or(0);
            let timer = TimeTrigger::new(&inner.name, &ctx.scheduler()?, move || latch(&weak, idx));
            timer.set(ticks)?;
            Ok(Registration::Timer(timer))
        }
        TriggerAtom::Period { name, count } => {
            if let Some(clock) = ctx.find_clock(name) {
                return schedule_cycles(weak, idx, &clock, *count);
            }
            let node = ctx.counter(name)?;
            let clock = node.clock().map_or_else(|| ctx.clock(), Ok)?;
            let target = node.current_value() + *count as f64;
            Ok(poll_counter(weak, idx, &node, &clock, move |v| v >= target))
        }
    }
}

fn schedule_cycles(weak: Weak<Inner>, idx: usize, clock: &Rc<Clock>, count: u64) -> Result<Registration> {
    let id = clock.schedule_cycles(count, Phase::Trigger, move || latch(&weak, idx));
    Ok(Registration::Event {
        scheduler: Rc::downgrade(clock.scheduler()),
        id,
    })
}

/// A one-shot trigger. Dropping it cancels every registration.
pub struct ExpressionTrigger {
    inner: Rc<Inner>,
}

impl ExpressionTrigger {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn expression(&self) -> &TriggerExpr {
        &self.inner.expr
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.get()
    }

    /// Live registrations (scheduled events, subscriptions, listeners).
    pub fn registration_count(&self) -> usize {
        self.inner.registrations.borrow().len()
    }

    /// Disarm without firing.
    pub fn cancel(&self) {
        self.inner.cancel_all();
        self.inner.callback.borrow_mut().take();
    }
}

impl Drop for ExpressionTrigger {
    fn drop(&mut self) {
        self.inner.cancel_all();
    }
}

impl fmt::Debug for ExpressionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionTrigger")
            .field("name", &self.inner.name)
            .field("expression", &self.inner.expr.to_string())
            .field("fired", &self.inner.fired.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::CounterBehavior;

    struct Bench {
        sched: Rc<Scheduler>,
        root: Rc<TreeNode>,
        c0: Rc<TreeNode>,
        notif: Rc<TreeNode>,
        tags: TagRegistry,
    }

    fn bench() -> Bench {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "ticks", CounterBehavior::Normal))
            .unwrap();
        let notif = root
            .add_child(TreeNode::notification_source("A", "phase changes"))
            .unwrap();
        let counter = Rc::clone(&c0);
        sched.schedule_repeating(0, 1, Phase::Tick, move || {
            counter.increment(1);
            true
        });
        Bench {
            sched,
            root,
            c0,
            notif,
            tags: TagRegistry::new(),
        }
    }

    fn fired_at(b: &Bench, text: &str) -> (ExpressionTrigger, Rc<Cell<Option<u64>>>) {
        let at = Rc::new(Cell::new(None));
        let slot = Rc::clone(&at);
        let sched = Rc::clone(&b.sched);
        let trig = TriggerSpec::parse("t", text)
            .unwrap()
            .arm(&TriggerContext::new(&b.root, &b.tags), move || {
                slot.set(Some(sched.current_tick()))
            })
            .unwrap();
        (trig, at)
    }

    #[test]
    fn test_counter_threshold_fires_once() {
        let b = bench();
        let (trig, at) = fired_at(&b, "c0 >= 5");
        b.sched.run_until(20);
        assert_eq!(at.get(), Some(5));
        assert!(trig.has_fired());
        assert_eq!(trig.registration_count(), 0);
        assert_eq!(b.c0.get(), 20);
    }

    #[test]
    fn test_notification_and_time() {
        let b = bench();
        let (_trig, at) = fired_at(&b, "notif.A != 99 && 8 ps");
        b.notif.post(99.0);
        b.notif.post(54.0);
        b.sched.run_until(20);
        assert_eq!(at.get(), Some(8));
        assert_eq!(b.notif.observer_count(), 0);
    }

    #[test]
    fn test_or_fires_on_first() {
        let b = bench();
        let (_trig, at) = fired_at(&b, "c0 >= 50 || 3");
        b.sched.run_until(10);
        assert_eq!(at.get(), Some(3));
        assert_eq!(b.sched.pending_count(), 1, "only the counter driver remains");
    }

    #[test]
    fn test_reference_and_publish() {
        let b = bench();
        let ctx = TriggerContext::new(&b.root, &b.tags);
        let follower_at = Rc::new(Cell::new(None));
        let slot = Rc::clone(&follower_at);
        let sched = Rc::clone(&b.sched);
        let _follower = TriggerSpec::parse("follower", "t0.start")
            .unwrap()
            .arm(&ctx, move || slot.set(Some(sched.current_tick())))
            .unwrap();
        b.tags.define("t0").unwrap();
        let _leader = TriggerSpec::parse("leader", "c0 >= 6")
            .unwrap()
            .publish_as("t0", Edge::Start)
            .arm(&ctx, || {})
            .unwrap();
        b.sched.run_until(20);
        assert_eq!(follower_at.get(), Some(6));
    }

    #[test]
    fn test_drop_removes_registrations() {
        let b = bench();
        let (trig, at) = fired_at(&b, "c0 >= 5 && notif.A == 1");
        assert_eq!(b.notif.observer_count(), 1);
        drop(trig);
        assert_eq!(b.notif.observer_count(), 0);
        b.sched.run_until(10);
        assert_eq!(at.get(), None);
    }

    #[test]
    fn test_counter_lookup_accepts_parameters() {
        let b = bench();
        b.root
            .add_child(TreeNode::parameter("width", "issue width", 4.0))
            .unwrap();
        let ctx = TriggerContext::new(&b.root, &b.tags);
        assert!(ctx.counter("c0").unwrap().is_counter());
        assert!(ctx.counter("width").unwrap().is_parameter());
        let err = ctx.counter("A").unwrap_err();
        assert!(err.to_string().contains("not a counter"), "{}", err);
    }

    #[test]
    fn test_unknown_sources() {
        let b = bench();
        let ctx = TriggerContext::new(&b.root, &b.tags);
        assert!(TriggerSpec::parse("t", "missing >= 1").unwrap().arm(&ctx, || {}).is_err());
        assert!(TriggerSpec::parse("t", "notif.B == 1").unwrap().arm(&ctx, || {}).is_err());
        assert!(TriggerSpec::parse("t", "fast_clk 3").unwrap().arm(&ctx, || {}).is_err());
        assert_eq!(b.notif.observer_count(), 0);
    }

    #[test]
    fn test_counter_period_is_relative_to_arming() {
        let b = bench();
        b.sched.run_until(4);
        let (_trig, at) = fired_at(&b, "c0 3");
        b.sched.run_until(20);
        assert_eq!(at.get(), Some(7));
    }
}
