//! Discrete-event scheduler and clocks.
//!
//! Time advances in ticks (picoseconds). Within a tick, events run phase by
//! phase in the order of [`Phase`]; within a phase, in scheduling order.
//! Everything runs on the simulation thread: callbacks are `FnOnce` closures
//! without `Send` bounds and the scheduler is shared through `Rc`.

use st_common::Tick;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// Scheduling phases, executed in declaration order within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Counter and notification trigger checks.
    Trigger,
    /// Port and notification delivery.
    Update,
    /// Periodic report updates.
    Collection,
    /// Model logic.
    Tick,
    /// End-of-tick sampling (occupancy histograms).
    PostTick,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Trigger,
        Phase::Update,
        Phase::Collection,
        Phase::Tick,
        Phase::PostTick,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Trigger => "trigger",
            Phase::Update => "update",
            Phase::Collection => "collection",
            Phase::Tick => "tick",
            Phase::PostTick => "post_tick",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle to a scheduled event, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    tick: Tick,
    phase: Phase,
    seq: u64,
}

impl EventId {
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

type Callback = Box<dyn FnOnce()>;

/// The event queue.
pub struct Scheduler {
    current: Cell<Tick>,
    next_seq: Cell<u64>,
    events: RefCell<BTreeMap<EventId, Callback>>,
}

impl Scheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            current: Cell::new(0),
            next_seq: Cell::new(0),
            events: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn current_tick(&self) -> Tick {
        self.current.get()
    }

    /// Schedule `callback` to run `delay` ticks from now in `phase`.
    ///
    /// A zero delay targets the current tick; if that phase has already run
    /// the event still runs before the tick ends.
    pub fn schedule(&self, delay: Tick, phase: Phase, callback: impl FnOnce() + 'static) -> EventId {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let id = EventId {
            tick: self.current.get().saturating_add(delay),
            phase,
            seq,
        };
        self.events.borrow_mut().insert(id, Box::new(callback));
        id
    }

    /// Cancel a pending event. Returns false if it already ran or was cancelled.
    pub fn cancel(&self, id: EventId) -> bool {
        self.events.borrow_mut().remove(&id).is_some()
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.events.borrow().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.events.borrow().len()
    }

    /// Run every event due in the current tick, then advance by one tick.
    pub fn run_tick(&self) {
        let now = self.current.get();
        loop {
            // The borrow ends before the callback runs so it may schedule.
            let next = {
                let mut events = self.events.borrow_mut();
                let due = matches!(events.first_key_value(), Some((id, _)) if id.tick <= now);
                if due {
                    events.pop_first()
                } else {
                    None
                }
            };
            match next {
                Some((id, callback)) => {
                    trace!(tick = now, phase = %id.phase, "Running event");
                    callback();
                }
                None => break,
            }
        }
        self.current.set(now + 1);
    }

    /// Run ticks until the current tick reaches `end` (exclusive).
    pub fn run_until(&self, end: Tick) {
        while self.current.get() < end {
            self.run_tick();
        }
    }

    /// Run `ticks` more ticks.
    pub fn run_for(&self, ticks: Tick) {
        self.run_until(self.current.get().saturating_add(ticks));
    }

    /// Rewind to tick 0 and drop every pending event.
    pub fn restart(&self) {
        self.events.borrow_mut().clear();
        self.current.set(0);
    }

    /// Run `body` every `period` ticks in `phase`, starting `delay` ticks
    /// from now, until it returns false or the returned handle is cancelled.
    pub fn schedule_repeating(
        self: &Rc<Self>,
        delay: Tick,
        period: Tick,
        phase: Phase,
        body: impl FnMut() -> bool + 'static,
    ) -> RepeatingEvent {
        let state = Rc::new(RepeatState {
            active: Cell::new(true),
            pending: Cell::new(None),
        });
        let body: Rc<RefCell<dyn FnMut() -> bool>> = Rc::new(RefCell::new(body));
        arm_repeat(self, delay, period.max(1), phase, Rc::clone(&state), body);
        RepeatingEvent {
            scheduler: Rc::downgrade(self),
            state,
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("current", &self.current.get())
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct RepeatState {
    active: Cell<bool>,
    pending: Cell<Option<EventId>>,
}

fn arm_repeat(
    scheduler: &Rc<Scheduler>,
    delay: Tick,
    period: Tick,
    phase: Phase,
    state: Rc<RepeatState>,
    body: Rc<RefCell<dyn FnMut() -> bool>>,
) {
    let weak = Rc::downgrade(scheduler);
    let st = Rc::clone(&state);
    let id = scheduler.schedule(delay, phase, move || {
        st.pending.set(None);
        if !st.active.get() {
            return;
        }
        let again = {
            let mut f = body.borrow_mut();
            (*f)()
        };
        if again && st.active.get() {
            if let Some(sched) = weak.upgrade() {
                arm_repeat(&sched, period, period, phase, Rc::clone(&st), body);
            }
        } else {
            st.active.set(false);
        }
    });
    state.pending.set(Some(id));
}

/// Handle to a repeating event; dropping it does not cancel.
pub struct RepeatingEvent {
    scheduler: std::rc::Weak<Scheduler>,
    state: Rc<RepeatState>,
}

impl RepeatingEvent {
    pub fn is_active(&self) -> bool {
        self.state.active.get()
    }

    /// Stop repeating and remove the pending occurrence.
    pub fn cancel(&self) {
        self.state.active.set(false);
        if let (Some(id), Some(sched)) = (self.state.pending.take(), self.scheduler.upgrade()) {
            sched.cancel(id);
        }
    }
}

impl fmt::Debug for RepeatingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatingEvent")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A named clock with a fixed period in ticks.
pub struct Clock {
    name: String,
    period: Tick,
    scheduler: Rc<Scheduler>,
}

impl Clock {
    pub fn new(name: impl Into<String>, period: Tick, scheduler: &Rc<Scheduler>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            period: period.max(1),
            scheduler: Rc::clone(scheduler),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Tick {
        self.period
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    pub fn current_cycle(&self) -> u64 {
        self.scheduler.current_tick() / self.period
    }

    pub fn ticks_to_cycles(&self, ticks: Tick) -> u64 {
        ticks / self.period
    }

    pub fn cycles_to_ticks(&self, cycles: u64) -> Tick {
        cycles.saturating_mul(self.period)
    }

    /// Clock frequency in MHz (period is in picoseconds).
    pub fn frequency_mhz(&self) -> f64 {
        1.0e6 / self.period as f64
    }

    /// Ticks until the next cycle boundary; 0 when on a boundary.
    pub fn ticks_to_next_edge(&self) -> Tick {
        let rem = self.scheduler.current_tick() % self.period;
        if rem == 0 {
            0
        } else {
            self.period - rem
        }
    }

    pub fn schedule_cycles(&self, cycles: u64, phase: Phase, callback: impl FnOnce() + 'static) -> EventId {
        let delay = self.ticks_to_next_edge() + self.cycles_to_ticks(cycles);
        self.scheduler.schedule(delay, phase, callback)
    }

    /// Run `body` once per cycle in `phase`, starting at the next edge.
    pub fn every_cycle(&self, phase: Phase, body: impl FnMut() -> bool + 'static) -> RepeatingEvent {
        self.scheduler
            .schedule_repeating(self.ticks_to_next_edge(), self.period, phase, body)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_run_in_order() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for phase in [Phase::PostTick, Phase::Tick, Phase::Trigger, Phase::Collection, Phase::Update] {
            let log = Rc::clone(&log);
            sched.schedule(0, phase, move || log.borrow_mut().push(phase));
        }
        sched.run_tick();
        assert_eq!(*log.borrow(), Phase::ALL.to_vec());
        assert_eq!(sched.current_tick(), 1);
    }

    #[test]
    fn test_cancel_and_delay() {
        let sched = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let id = sched.schedule(3, Phase::Tick, move || h.set(h.get() + 1));
        let h = Rc::clone(&hits);
        sched.schedule(2, Phase::Tick, move || h.set(h.get() + 10));
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
        sched.run_until(5);
        assert_eq!(hits.get(), 10);
    }

    #[test]
    fn test_callbacks_may_schedule_same_tick() {
        let sched = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let s = Rc::clone(&sched);
        let h = Rc::clone(&hits);
        sched.schedule(0, Phase::Update, move || {
            let h = Rc::clone(&h);
            s.schedule(0, Phase::Tick, move || h.set(h.get() + 1));
        });
        sched.run_tick();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_repeating_event_and_cancel() {
        let sched = Scheduler::new();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&ticks);
        let s = Rc::clone(&sched);
        let rep = sched.schedule_repeating(1, 2, Phase::Collection, move || {
            t.borrow_mut().push(s.current_tick());
            true
        });
        sched.run_until(6);
        rep.cancel();
        sched.run_until(12);
        assert_eq!(*ticks.borrow(), vec![1, 3, 5]);
        assert!(!rep.is_active());
    }

    #[test]
    fn test_restart_rewinds() {
        let sched = Scheduler::new();
        sched.schedule(100, Phase::Tick, || {});
        sched.run_until(10);
        sched.restart();
        assert_eq!(sched.current_tick(), 0);
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn test_clock_cycles() {
        let sched = Scheduler::new();
        let clk = Clock::new("core", 1000, &sched);
        assert_eq!(clk.frequency_mhz(), 1000.0);
        sched.run_until(2500);
        assert_eq!(clk.current_cycle(), 2);
        assert_eq!(clk.ticks_to_next_edge(), 500);
        let id = clk.schedule_cycles(1, Phase::Tick, || {});
        assert_eq!(id.tick(), 4000);
    }
}
