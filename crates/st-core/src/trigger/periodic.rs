//! Repeating and level-sensitive triggers: report update periods
//! (`update-count`, `update-cycles`, `update-time`), the one-shot
//! [`TimeTrigger`] and the `whenever` / `update-whenever` toggles.

use super::expr::{TimeUnit, TriggerAtom, TriggerExpr};
use super::runtime::{Registration, TriggerContext};
use crate::sched::{Clock, EventId, Phase, Scheduler};
use crate::tree::TreeNode;
use st_common::{Error, Result, Tick};
use st_config::TriggerKey;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::trace;

/// Fires once, `delay` ticks after [`TimeTrigger::set`].
pub struct TimeTrigger {
    name: String,
    scheduler: Weak<Scheduler>,
    pending: Rc<Cell<Option<EventId>>>,
    callback: Rc<dyn Fn()>,
}

impl TimeTrigger {
    pub fn new(name: impl Into<String>, scheduler: &Rc<Scheduler>, callback: impl Fn() + 'static) -> Self {
        Self {
            name: name.into(),
            scheduler: Rc::downgrade(scheduler),
            pending: Rc::new(Cell::new(None)),
            callback: Rc::new(callback),
        }
    }

    /// Schedule the callback `delay` ticks from now.
    pub fn set(&self, delay: Tick) -> Result<()> {
        if delay == 0 {
            return Err(Error::trigger(format!("time trigger '{}' needs a delay greater than zero", self.name)));
        }
        if self.is_active() {
            return Err(Error::trigger(format!(
                "time trigger '{}' is already active; deactivate it before rescheduling",
                self.name
            )));
        }
        let scheduler = self
            .scheduler
            .upgrade()
            .ok_or_else(|| Error::trigger("scheduler has been destroyed"))?;
        let pending = Rc::clone(&self.pending);
        let callback = Rc::clone(&self.callback);
        let id = scheduler.schedule(delay, Phase::Trigger, move || {
            pending.set(None);
            callback();
        });
        self.pending.set(Some(id));
        Ok(())
    }

    /// Schedule from a `<value> <unit>` pair.
    pub fn set_in(&self, value: u64, unit: &str) -> Result<()> {
        let unit = TimeUnit::lookup(unit.trim()).ok_or_else(|| {
            Error::parse(format!("unknown time unit '{}' (expected ps, ns, us, ms or s)", unit.trim()))
        })?;
        self.set(value.saturating_mul(unit.ticks_per_unit()))
    }

    pub fn is_active(&self) -> bool {
        self.pending.get().is_some()
    }

    pub fn deactivate(&self) {
        if let (Some(id), Some(sched)) = (self.pending.take(), self.scheduler.upgrade()) {
            sched.cancel(id);
        }
    }
}

impl Drop for TimeTrigger {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl fmt::Debug for TimeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeTrigger")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// How often a report writes an update.
#[derive(Clone)]
pub enum UpdatePeriod {
    /// Whenever `node` has advanced by `every` since the last update.
    Counter { node: Rc<TreeNode>, every: u64 },
    /// Every `every` cycles of `clock`.
    Cycles { clock: Rc<Clock>, every: u64 },
    /// Every `ticks` ticks.
    Ticks { scheduler: Rc<Scheduler>, ticks: Tick },
}

impl UpdatePeriod {
    /// Interpret an `update-*` key of a trigger block.
    pub fn from_block(key: TriggerKey, text: &str, ctx: &TriggerContext) -> Result<Self> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let count = |word: &str| -> Result<u64> {
            match word.parse::<u64>() {
                Ok(0) => Err(Error::trigger(format!("{} '{}' must be greater than zero", key.as_str(), text))),
                Ok(n) => Ok(n),
                Err(_) => Err(Error::parse(format!("{} '{}': '{}' is not a count", key.as_str(), text, word))),
            }
        };
        match (key, words.as_slice()) {
            (TriggerKey::UpdateCount, [path, n]) => Ok(UpdatePeriod::Counter {
                node: ctx.counter(path)?,
                every: count(n)?,
            }),
            (TriggerKey::UpdateCycles, [n]) => Ok(UpdatePeriod::Cycles {
                clock: ctx.clock()?,
                every: count(n)?,
            }),
            (TriggerKey::UpdateCycles, [clock, n]) => Ok(UpdatePeriod::Cycles {
                clock: ctx
                    .find_clock(clock)
                    .ok_or_else(|| Error::trigger(format!("clock '{}' not found", clock)))?,
                every: count(n)?,
            }),
            (TriggerKey::UpdateTime, [n]) => Ok(UpdatePeriod::Ticks {
                scheduler: ctx.scheduler()?,
                ticks: count(n)?,
            }),
            (TriggerKey::UpdateTime, [_, _]) => match TriggerExpr::parse(text)? {
                TriggerExpr::Atom(atom @ TriggerAtom::Time { .. }) => Ok(UpdatePeriod::Ticks {
                    scheduler: ctx.scheduler()?,
                    ticks: atom.time_ticks().unwrap_or(1),
                }),
                _ => Err(Error::parse(format!("update-time '{}' is not a time interval", text))),
            },
            _ => Err(Error::parse(format!("cannot interpret {} '{}'", key.as_str(), text))),
        }
    }
}

impl fmt::Debug for UpdatePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePeriod::Counter { node, every } => write!(f, "Counter({} every {})", node.location(), every),
            UpdatePeriod::Cycles { clock, every } => write!(f, "Cycles({} every {})", clock.name(), every),
            UpdatePeriod::Ticks { ticks, .. } => write!(f, "Ticks({})", ticks),
        }
    }
}

/// Calls its body in [`Phase::Collection`] once per period, starting with
/// the tick it is armed on. Dropping it stops the repetition.
pub struct PeriodicTrigger {
    period: UpdatePeriod,
    registration: Option<Registration>,
}

impl PeriodicTrigger {
    pub fn arm(period: UpdatePeriod, mut body: impl FnMut() + 'static) -> Result<Self> {
        let event = match &period {
            UpdatePeriod::Ticks { scheduler, ticks } => {
                scheduler.schedule_repeating(0, *ticks, Phase::Collection, move || {
                    body();
                    true
                })
            }
            UpdatePeriod::Cycles { clock, every } => clock.scheduler().schedule_repeating(
                clock.ticks_to_next_edge(),
                clock.cycles_to_ticks(*every),
                Phase::Collection,
                move || {
                    body();
                    true
                },
            ),
            UpdatePeriod::Counter { node, every } => {
                let clock = node
                    .clock()
                    .ok_or_else(|| Error::trigger(format!("no clock reachable from '{}'", node.location())))?;
                let target = Rc::downgrade(node);
                let every = *every as f64;
                let mut next = node.current_value();
                clock.every_cycle(Phase::Collection, move || {
                    let Some(node) = target.upgrade() else {
                        return false;
                    };
                    let value = node.current_value();
                    if value >= next {
                        trace!(counter = %node.location(), value, "Counter update period reached");
                        body();
                        while next <= value {
                            next += every;
                        }
                    }
                    true
                })
            }
        };
        Ok(Self {
            period,
            registration: Some(Registration::Poll(event)),
        })
    }

    pub fn period(&self) -> &UpdatePeriod {
        &self.period
    }

    pub fn is_active(&self) -> bool {
        matches!(&self.registration, Some(Registration::Poll(e)) if e.is_active())
    }

    pub fn cancel(&mut self) {
        if let Some(reg) = self.registration.take() {
            reg.cancel();
        }
    }
}

impl Drop for PeriodicTrigger {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for PeriodicTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTrigger")
            .field("period", &self.period)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Level-sensitive trigger for `whenever` / `update-whenever`.
///
/// Only counter and notification conditions are allowed: the toggle is on
/// while the expression holds for the counters' current values and the
/// most recent payload of each notification channel.
pub struct ToggleTrigger {
    inner: Rc<ToggleInner>,
}

struct ToggleInner {
    expr: TriggerExpr,
    levels: RefCell<Vec<bool>>,
    on: Cell<bool>,
    on_change: RefCell<Box<dyn FnMut(bool)>>,
    registrations: RefCell<Vec<Registration>>,
}

impl ToggleInner {
    fn set_level(&self, idx: usize, level: bool) {
        let now = {
            let mut levels = self.levels.borrow_mut();
            if levels.get(idx) == Some(&level) {
                return;
            }
            if let Some(slot) = levels.get_mut(idx) {
                *slot = level;
            }
            self.expr.evaluate(&levels)
        };
        if now != self.on.get() {
            self.on.set(now);
            (self.on_change.borrow_mut())(now);
        }
    }
}

impl ToggleTrigger {
    pub fn arm(expr: TriggerExpr, ctx: &TriggerContext, on_change: impl FnMut(bool) + 'static) -> Result<Self> {
        let atoms: Vec<TriggerAtom> = expr.atoms().into_iter().cloned().collect();
        let inner = Rc::new(ToggleInner {
            levels: RefCell::new(vec![false; atoms.len()]),
            expr,
            on: Cell::new(false),
            on_change: RefCell::new(Box::new(on_change)),
            registrations: RefCell::new(Vec::new()),
        });
        let toggle = ToggleTrigger {
            inner: Rc::clone(&inner),
        };
        for (idx, atom) in atoms.iter().enumerate() {
            let weak = Rc::downgrade(&inner);
            let reg = match atom {
                TriggerAtom::Counter { path, threshold } => {
                    let node = ctx.counter(path)?;
                    let clock = node.clock().map_or_else(|| ctx.clock(), Ok)?;
                    let target = Rc::downgrade(&node);
                    let threshold = *threshold as f64;
                    Registration::Poll(clock.every_cycle(Phase::Trigger, move || {
                        match (weak.upgrade(), target.upgrade()) {
                            (Some(inner), Some(node)) => {
                                inner.set_level(idx, node.current_value() >= threshold);
                                true
                            }
                            _ => false,
                        }
                    }))
                }
                TriggerAtom::Notification { channel, op, value } => {
                    let node = ctx.notification_source(channel)?;
                    let (op, value) = (*op, *value);
                    let id = node
                        .subscribe(move |payload| {
                            if let Some(inner) = weak.upgrade() {
                                inner.set_level(idx, op.apply(payload, value));
                            }
                        })
                        .ok_or_else(|| Error::trigger(format!("'{}' does not accept subscriptions", channel)))?;
                    Registration::Subscription {
                        node: Rc::downgrade(&node),
                        id,
                    }
                }
                other => {
                    return Err(Error::trigger(format!(
                        "'{}' cannot be used in a whenever condition; only counter and notification conditions toggle",
                        other
                    )));
                }
            };
            inner.registrations.borrow_mut().push(reg);
        }
        Ok(toggle)
    }

    pub fn is_on(&self) -> bool {
        self.inner.on.get()
    }

    pub fn cancel(&self) {
        let regs = std::mem::take(&mut *self.inner.registrations.borrow_mut());
        for reg in regs {
            reg.cancel();
        }
    }
}

impl Drop for ToggleTrigger {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ToggleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToggleTrigger")
            .field("expression", &self.inner.expr.to_string())
            .field("on", &self.is_on())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TagRegistry;
    use crate::tree::CounterBehavior;

    fn setup() -> (Rc<Scheduler>, Rc<TreeNode>, Rc<TreeNode>, TriggerContext) {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 2, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "events", CounterBehavior::Normal))
            .unwrap();
        let ctx = TriggerContext::new(&root, &TagRegistry::new());
        (sched, root, c0, ctx)
    }

    fn record(sched: &Rc<Scheduler>) -> (Rc<RefCell<Vec<Tick>>>, impl FnMut() + 'static) {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&ticks);
        let s = Rc::clone(sched);
        (ticks, move || out.borrow_mut().push(s.current_tick()))
    }

    #[test]
    fn test_time_trigger_rules() {
        let (sched, ..) = setup();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let timer = TimeTrigger::new("t", &sched, move || h.set(h.get() + 1));
        assert!(timer.set(0).is_err());
        timer.set_in(3, "ps").unwrap();
        let err = timer.set(5).unwrap_err();
        assert!(err.to_string().contains("already active"));
        assert!(timer.set_in(1, "fortnight").unwrap_err().to_string().contains("unknown time unit"));
        sched.run_until(10);
        assert_eq!(hits.get(), 1);
        assert!(!timer.is_active());
        timer.set(2).unwrap();
        drop(timer);
        sched.run_until(20);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_update_cycles_starts_inclusive() {
        let (sched, _root, _c0, ctx) = setup();
        let period = UpdatePeriod::from_block(TriggerKey::UpdateCycles, "2", &ctx).unwrap();
        let (ticks, body) = record(&sched);
        let _p = PeriodicTrigger::arm(period, body).unwrap();
        sched.run_until(12);
        assert_eq!(*ticks.borrow(), vec![0, 4, 8]);
    }

    #[test]
    fn test_update_time_units() {
        let (sched, _root, _c0, ctx) = setup();
        let period = UpdatePeriod::from_block(TriggerKey::UpdateTime, "3 ps", &ctx).unwrap();
        let (ticks, body) = record(&sched);
        let mut p = PeriodicTrigger::arm(period, body).unwrap();
        sched.run_until(7);
        p.cancel();
        sched.run_until(20);
        assert_eq!(*ticks.borrow(), vec![0, 3, 6]);
        assert!(!p.is_active());
        assert!(UpdatePeriod::from_block(TriggerKey::UpdateTime, "0", &ctx).is_err());
        assert!(UpdatePeriod::from_block(TriggerKey::UpdateTime, "4 parsecs", &ctx).is_err());
    }

    #[test]
    fn test_update_count_follows_counter() {
        let (sched, _root, c0, ctx) = setup();
        let period = UpdatePeriod::from_block(TriggerKey::UpdateCount, "c0 5", &ctx).unwrap();
        let (ticks, body) = record(&sched);
        let _p = PeriodicTrigger::arm(period, body).unwrap();
        let counter = Rc::clone(&c0);
        sched.schedule_repeating(0, 2, Phase::Tick, move || {
            counter.increment(3);
            true
        });
        sched.run_until(14);
        // Collection precedes Tick: the counter reads 0, 3, 6, 9, 12, 15, 18
        // at ticks 0, 2, .., 12 and thresholds advance 0, 5, 10, 15, 20.
        assert_eq!(*ticks.borrow(), vec![0, 4, 8, 10]);
    }

    #[test]
    fn test_toggle_follows_notification_level() {
        let (sched, root, _c0, ctx) = setup();
        let gate = root
            .add_child(TreeNode::notification_source("gate", "update gate"))
            .unwrap();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&changes);
        let toggle = ToggleTrigger::arm(TriggerExpr::parse("notif.gate == 1").unwrap(), &ctx, move |on| {
            out.borrow_mut().push(on)
        })
        .unwrap();
        gate.post(1.0);
        gate.post(1.0);
        assert!(toggle.is_on());
        gate.post(0.0);
        gate.post(1.0);
        assert_eq!(*changes.borrow(), vec![true, false, true]);
        drop(toggle);
        assert_eq!(gate.observer_count(), 0);
        sched.run_until(2);
    }

    #[test]
    fn test_toggle_rejects_edges() {
        let (_sched, _root, _c0, ctx) = setup();
        let err = ToggleTrigger::arm(TriggerExpr::parse("t0.start").unwrap(), &ctx, |_| {}).unwrap_err();
        assert!(err.to_string().contains("whenever"));
    }
}
