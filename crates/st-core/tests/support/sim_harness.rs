//! Small simulated model shared by the integration tests.
//!
//! Tree layout:
//! ```text
//! top            (clock "core", period 1)
//!   c0, c1       counters, incremented once per tick in Phase::Tick
//!   A            notification source
//! ```

#![allow(dead_code)]
// Not every test uses every helper.

use st_config::{ReportDefinition, ReportDescriptor, ReportFormat, TriggerKey};
use st_core::sched::RepeatingEvent;
use st_core::{
    Clock, CounterBehavior, FormatContext, Phase, ReportRepository, Scheduler, SimulationInfo, StreamListener,
    TreeNode,
};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

pub struct SimHarness {
    pub sched: Rc<Scheduler>,
    pub root: Rc<TreeNode>,
    pub c0: Rc<TreeNode>,
    pub c1: Rc<TreeNode>,
    pub source: Rc<TreeNode>,
    drivers: Vec<RepeatingEvent>,
}

impl SimHarness {
    pub fn new() -> Self {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "first counter", CounterBehavior::Normal))
            .unwrap();
        let c1 = root
            .add_child(TreeNode::counter("c1", "second counter", CounterBehavior::Normal))
            .unwrap();
        let source = root
            .add_child(TreeNode::notification_source("A", "payload source"))
            .unwrap();
        let (a, b) = (Rc::clone(&c0), Rc::clone(&c1));
        let ticker = sched.schedule_repeating(0, 1, Phase::Tick, move || {
            a.increment(1);
            b.increment(1);
            true
        });
        Self {
            sched,
            root,
            c0,
            c1,
            source,
            drivers: vec![ticker],
        }
    }

    /// Post one payload per tick, in `Phase::Update`, starting now.
    pub fn post_sequence(&mut self, payloads: Vec<f64>) {
        let source = Rc::clone(&self.source);
        let next = Cell::new(0usize);
        let poster = self.sched.schedule_repeating(0, 1, Phase::Update, move || {
            let i = next.get();
            match payloads.get(i) {
                Some(p) => {
                    source.post(*p);
                    next.set(i + 1);
                    true
                }
                None => false,
            }
        });
        self.drivers.push(poster);
    }

    pub fn repository(&self) -> ReportRepository {
        ReportRepository::new(&self.root, FormatContext::new(SimulationInfo::new("harness", "1.0"))).unwrap()
    }

    pub fn run_until(&self, tick: u64) {
        self.sched.run_until(tick);
    }

    pub fn run_for(&self, ticks: u64) {
        self.sched.run_for(ticks);
    }
}

/// Descriptor over the whole tree, updated every cycle.
pub fn every_cycle(definition: &str, dest: &str, format: ReportFormat) -> ReportDescriptor {
    let def = ReportDefinition::from_yaml_str(definition).unwrap();
    ReportDescriptor::inline("top", def, dest, format).with_trigger(TriggerKey::UpdateCycles, "1")
}

/// Every row queued for `listener`.
pub fn drain(listener: &StreamListener) -> Vec<Vec<f64>> {
    let mut out = VecDeque::new();
    listener.get_buffered_stream_data(&mut out);
    out.into_iter().collect()
}

/// Column `idx` of `rows`.
pub fn column(rows: &[Vec<f64>], idx: usize) -> Vec<f64> {
    rows.iter().map(|r| r[idx]).collect()
}

/// Concatenated runs: `ramp(&[5, 3])` is `0,1,2,3,4,0,1,2`.
pub fn ramp(lengths: &[u32]) -> Vec<f64> {
    lengths.iter().flat_map(|n| (0..*n).map(f64::from)).collect()
}
