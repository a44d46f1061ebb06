//! Statistic instances: windowed scalar evaluators.
//!
//! A [`StatisticInstance`] observes exactly one source:
//! - a counter, parameter or statistic definition in the device tree (held
//!   weakly; an expired source reads as NaN and fails lifecycle calls)
//! - a free expression
//! - a user calculator callback
//! - a direct-lookup slot in a shared row vector (post-mortem replay)
//!
//! `start()` opens a window at the current tick and captures the source's
//! initial value; `end()` closes it and freezes the value. Every successful
//! `get_value()` is copied into the registered snapshot sinks.

use crate::expr::Expression;
use crate::sched::{Clock, Scheduler};
use crate::tree::{CounterBehavior, TreeNode};
use st_common::{Error, Result, StatClass, Tick, Visibility, TICK_MAX};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Shared row of values written by snapshot sinks.
pub type SnapshotRow = Rc<RefCell<Vec<f64>>>;

/// A registration copying each computed value into one slot of a row.
///
/// The sink owns a liveness token; the row's owner keeps the weak side so
/// it can tell when the instance is gone.
pub struct SnapshotSink {
    row: SnapshotRow,
    index: usize,
    _token: Rc<()>,
}

impl SnapshotSink {
    pub fn new(row: SnapshotRow, index: usize) -> (Self, Weak<()>) {
        let token = Rc::new(());
        let weak = Rc::downgrade(&token);
        (
            Self {
                row,
                index,
                _token: token,
            },
            weak,
        )
    }

    fn write(&self, value: f64) {
        if let Some(slot) = self.row.borrow_mut().get_mut(self.index) {
            *slot = value;
        }
    }
}

/// User-supplied value callback.
pub type Calculator = Rc<dyn Fn() -> f64>;

/// Backing source of an instance.
#[derive(Clone)]
pub enum StatSource {
    Counter {
        node: Weak<TreeNode>,
        behavior: CounterBehavior,
    },
    Parameter(Weak<TreeNode>),
    StatisticDef {
        node: Weak<TreeNode>,
        expression: Box<Expression>,
    },
    Expression(Box<Expression>),
    UserCalculator {
        name: String,
        calc: Calculator,
    },
    DirectLookup {
        values: SnapshotRow,
        index: usize,
    },
}

impl StatSource {
    pub fn kind_str(&self) -> &'static str {
        match self {
            StatSource::Counter { .. } => "counter",
            StatSource::Parameter(_) => "parameter",
            StatSource::StatisticDef { .. } => "statistic_def",
            StatSource::Expression(_) => "expression",
            StatSource::UserCalculator { .. } => "user_calculator",
            StatSource::DirectLookup { .. } => "direct_lookup",
        }
    }
}

/// Metadata overrides supplied by the creator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvidedMetadata {
    pub location: Option<String>,
    pub desc: Option<String>,
    pub visibility: Option<Visibility>,
    pub class: Option<StatClass>,
    pub expression: Option<String>,
}

/// A windowed scalar evaluator.
pub struct StatisticInstance {
    source: StatSource,
    scheduler: Option<Rc<Scheduler>>,
    clock: Option<Rc<Clock>>,
    /// Location captured at construction; valid after expiry.
    location: String,
    desc: String,
    visibility: Visibility,
    class: StatClass,
    start_tick: Tick,
    end_tick: Tick,
    initial: f64,
    end_value: Option<f64>,
    accumulate: bool,
    started_once: bool,
    provided: ProvidedMetadata,
    sinks: Vec<SnapshotSink>,
}

impl StatisticInstance {
    fn with_source(source: StatSource, scheduler: Option<Rc<Scheduler>>) -> Self {
        let start_tick = scheduler.as_ref().map(|s| s.current_tick()).unwrap_or(0);
        Self {
            source,
            scheduler,
            clock: None,
            location: String::new(),
            desc: String::new(),
            visibility: Visibility::Normal,
            class: StatClass::Default,
            start_tick,
            end_tick: TICK_MAX,
            initial: 0.0,
            end_value: None,
            accumulate: false,
            started_once: false,
            provided: ProvidedMetadata::default(),
            sinks: Vec::new(),
        }
    }

    /// Build from a device-tree node, dispatching on its kind.
    pub fn from_node(node: &Rc<TreeNode>) -> Result<Self> {
        Self::from_node_in(node, &mut Vec::new())
    }

    /// Build from a node with an explicit already-used list.
    ///
    /// Statistic definitions already on `used` are cycles; the error names
    /// the definition being expanded and the one it reaches back to.
    pub fn from_node_in(node: &Rc<TreeNode>, used: &mut Vec<Rc<TreeNode>>) -> Result<Self> {
        let clock = node.clock();
        let scheduler = clock.as_ref().map(|c| Rc::clone(c.scheduler()));
        let source = if let Some(behavior) = node.counter_behavior() {
            StatSource::Counter {
                node: Rc::downgrade(node),
                behavior,
            }
        } else if node.is_parameter() {
            StatSource::Parameter(Rc::downgrade(node))
        } else if let Some(text) = node.expression() {
            if used.iter().any(|u| Rc::ptr_eq(u, node)) {
                let from = used.last().map(|u| u.location()).unwrap_or_default();
                return Err(Error::parse(format!(
                    "cycle in statistic definitions: '{}' references '{}', which is already being expanded",
                    from,
                    node.location()
                )));
            }
            let context = node.parent().unwrap_or_else(|| Rc::clone(node));
            used.push(Rc::clone(node));
            let parsed = Expression::parse_with(text, &context, used, &Default::default());
            used.pop();
            StatSource::StatisticDef {
                node: Rc::downgrade(node),
                expression: Box::new(parsed?),
            }
        } else {
            return Err(Error::Construction(format!(
                "'{}' is a {}; statistics need a counter, parameter or statistic definition",
                node.location(),
                node.kind().as_str()
            )));
        };
        if scheduler.is_none() {
            return Err(Error::Construction(format!(
                "'{}' has no clock; statistics need a scheduler",
                node.location()
            )));
        }

        let mut si = Self::with_source(source, scheduler);
        si.clock = clock;
        si.location = node.location();
        si.desc = node.desc().to_string();
        si.visibility = node.visibility();
        si.class = node.class().clone();
        si.capture_initial();
        Ok(si)
    }

    /// Build from an owned expression.
    pub fn from_expression(expression: Expression, scheduler: &Rc<Scheduler>) -> Self {
        let text = expression.text().to_string();
        let mut si = Self::with_source(StatSource::Expression(Box::new(expression)), Some(Rc::clone(scheduler)));
        si.location = text.clone();
        si.desc = text;
        si
    }

    /// Build from a user calculator.
    pub fn from_calculator(name: impl Into<String>, calc: Calculator, scheduler: &Rc<Scheduler>) -> Self {
        let name = name.into();
        let mut si = Self::with_source(
            StatSource::UserCalculator {
                name: name.clone(),
                calc,
            },
            Some(Rc::clone(scheduler)),
        );
        si.location = name;
        si
    }

    /// Build over slot `index` of a shared row vector.
    pub fn direct_lookup(values: SnapshotRow, index: usize, metadata: ProvidedMetadata) -> Self {
        let mut si = Self::with_source(StatSource::DirectLookup { values, index }, None);
        si.location = metadata.location.clone().unwrap_or_default();
        si.provided = metadata;
        si
    }

    pub fn source(&self) -> &StatSource {
        &self.source
    }

    pub fn is_direct_lookup(&self) -> bool {
        matches!(self.source, StatSource::DirectLookup { .. })
    }

    /// Whether a weakly held tree source has been destroyed.
    pub fn is_expired(&self) -> bool {
        match &self.source {
            StatSource::Counter { node, .. } | StatSource::Parameter(node) => node.strong_count() == 0,
            StatSource::StatisticDef { node, .. } => node.strong_count() == 0,
            StatSource::Expression(expr) => expr.has_expired_source(),
            StatSource::UserCalculator { .. } | StatSource::DirectLookup { .. } => false,
        }
    }

    fn current_tick(&self) -> Tick {
        self.scheduler.as_ref().map(|s| s.current_tick()).unwrap_or(0)
    }

    /// Raw source value, ignoring windows.
    fn source_value(&self) -> f64 {
        match &self.source {
            StatSource::Counter { node, .. } | StatSource::Parameter(node) => {
                node.upgrade().map(|n| n.current_value()).unwrap_or(f64::NAN)
            }
            StatSource::StatisticDef { node, expression } => {
                if node.strong_count() == 0 {
                    f64::NAN
                } else {
                    expression.evaluate()
                }
            }
            StatSource::Expression(expr) => expr.evaluate(),
            StatSource::UserCalculator { calc, .. } => calc(),
            StatSource::DirectLookup { values, index } => {
                values.borrow().get(*index).copied().unwrap_or(f64::NAN)
            }
        }
    }

    fn capture_initial(&mut self) {
        self.initial = match &self.source {
            StatSource::Counter {
                behavior: CounterBehavior::Normal,
                ..
            } => self.source_value(),
            _ => 0.0,
        };
    }

    fn expired_error(&self, op: &str) -> Error {
        Error::ExpiredReference(format!(
            "cannot {} statistic '{}': its source no longer exists",
            op, self.location
        ))
    }

    /// Value over the current window, without range checks or sinks.
    ///
    /// Expired sources read as NaN.
    pub fn raw_value(&self) -> f64 {
        if let Some(v) = self.end_value {
            return v;
        }
        self.windowed_value()
    }

    fn windowed_value(&self) -> f64 {
        match &self.source {
            StatSource::Counter {
                behavior: CounterBehavior::Normal,
                ..
            } => self.source_value() - self.initial,
            _ => self.source_value(),
        }
    }

    /// Value over the window, copied into every snapshot sink.
    pub fn get_value(&self) -> Result<f64> {
        if !self.is_direct_lookup() {
            let now = self.current_tick();
            if self.end_tick != TICK_MAX && self.end_tick > now {
                return Err(Error::FutureStatisticRange {
                    end: self.end_tick,
                    current: now,
                });
            }
            let end = if self.end_tick == TICK_MAX { now } else { self.end_tick };
            if end < self.start_tick {
                return Err(Error::ReversedStatisticRange {
                    start: self.start_tick,
                    end,
                });
            }
        }
        let value = self.raw_value();
        for sink in &self.sinks {
            sink.write(value);
        }
        Ok(value)
    }

    /// Open a new window at the current tick.
    ///
    /// In accumulation mode only the first call captures the initial value.
    pub fn start(&mut self) -> Result<()> {
        if self.is_direct_lookup() {
            return Err(Error::IllegalOperation(format!(
                "cannot start direct-lookup statistic '{}'",
                self.location
            )));
        }
        if self.is_expired() {
            return Err(self.expired_error("start"));
        }
        let now = self.current_tick();
        let keep = self.accumulate && self.started_once;
        if !keep {
            self.start_tick = now;
            self.capture_initial();
        }
        self.end_tick = TICK_MAX;
        self.end_value = None;
        match &mut self.source {
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.start()?;
            }
            _ => {}
        }
        self.started_once = true;
        Ok(())
    }

    /// Close the window at the current tick and freeze the value.
    pub fn end(&mut self) -> Result<()> {
        if self.is_direct_lookup() {
            return Err(Error::IllegalOperation(format!(
                "cannot end direct-lookup statistic '{}'",
                self.location
            )));
        }
        if self.is_expired() {
            return Err(self.expired_error("end"));
        }
        self.end_value = Some(self.windowed_value());
        self.end_tick = self.current_tick();
        match &mut self.source {
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.end()?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
        match &mut self.source {
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.set_accumulate(accumulate);
            }
            _ => {}
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulate
    }

    pub fn start_tick(&self) -> Tick {
        self.start_tick
    }

    pub fn end_tick(&self) -> Tick {
        self.end_tick
    }

    pub fn initial_value(&self) -> f64 {
        self.initial
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn set_provided(&mut self, provided: ProvidedMetadata) {
        self.provided = provided;
    }

    pub fn provided(&self) -> &ProvidedMetadata {
        &self.provided
    }

    pub fn location(&self) -> &str {
        self.provided.location.as_deref().unwrap_or(&self.location)
    }

    pub fn desc(&self) -> &str {
        self.provided.desc.as_deref().unwrap_or(&self.desc)
    }

    pub fn visibility(&self) -> Visibility {
        self.provided.visibility.unwrap_or(self.visibility)
    }

    pub fn class(&self) -> &StatClass {
        self.provided.class.as_ref().unwrap_or(&self.class)
    }

    /// Expression text behind the value (the location for plain counters).
    pub fn expression_string(&self) -> String {
        if let Some(expr) = &self.provided.expression {
            return expr.clone();
        }
        match &self.source {
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.text().to_string()
            }
            _ => self.location().to_string(),
        }
    }

    /// Tree node behind the instance, if any and still alive.
    pub fn node(&self) -> Option<Rc<TreeNode>> {
        match &self.source {
            StatSource::Counter { node, .. } | StatSource::Parameter(node) => node.upgrade(),
            StatSource::StatisticDef { node, .. } => node.upgrade(),
            _ => None,
        }
    }

    pub fn clocks(&self) -> Vec<Rc<Clock>> {
        match &self.source {
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.clocks()
            }
            _ => self.clock.iter().cloned().collect(),
        }
    }

    pub fn supports_compression(&self) -> bool {
        match &self.source {
            StatSource::Counter { .. } | StatSource::Parameter(_) | StatSource::DirectLookup { .. } => true,
            StatSource::StatisticDef { expression, .. } | StatSource::Expression(expression) => {
                expression.supports_compression()
            }
            StatSource::UserCalculator { .. } => false,
        }
    }

    // ------------------------------------------------------------------
    // Snapshot sinks
    // ------------------------------------------------------------------

    /// Register a sink writing into `row[index]`; the returned weak token
    /// dies with this instance.
    pub fn add_snapshot_sink(&mut self, row: SnapshotRow, index: usize) -> Weak<()> {
        let (sink, token) = SnapshotSink::new(row, index);
        self.sinks.push(sink);
        token
    }

    pub fn snapshot_sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn clear_snapshot_sinks(&mut self) {
        self.sinks.clear();
    }
}

/// Clones observe the same source with the same window; sinks stay with
/// the original.
impl Clone for StatisticInstance {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            location: self.location.clone(),
            desc: self.desc.clone(),
            visibility: self.visibility,
            class: self.class.clone(),
            start_tick: self.start_tick,
            end_tick: self.end_tick,
            initial: self.initial,
            end_value: self.end_value,
            accumulate: self.accumulate,
            started_once: self.started_once,
            provided: self.provided.clone(),
            sinks: Vec::new(),
        }
    }
}

impl fmt::Debug for StatisticInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatisticInstance")
            .field("location", &self.location())
            .field("source", &self.source.kind_str())
            .field("start_tick", &self.start_tick)
            .field("end_tick", &self.end_tick)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        sched: Rc<Scheduler>,
        root: Rc<TreeNode>,
        normal: Rc<TreeNode>,
        latest: Rc<TreeNode>,
    }

    fn fixture() -> Fixture {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let normal = root
            .add_child(TreeNode::counter("hits", "cache hits", CounterBehavior::Normal))
            .unwrap();
        let latest = root
            .add_child(TreeNode::counter("occ", "occupancy", CounterBehavior::Latest))
            .unwrap();
        root.add_child(TreeNode::parameter("ways", "associativity", 8.0))
            .unwrap();
        root.add_child(TreeNode::statistic_def("hit_rate", "hits per tick", "hits / ticks"))
            .unwrap();
        Fixture {
            sched,
            root,
            normal,
            latest,
        }
    }

    #[test]
    fn test_normal_counter_window() {
        let f = fixture();
        f.normal.increment(5);
        let mut si = StatisticInstance::from_node(&f.normal).unwrap();
        f.normal.increment(3);
        assert_eq!(si.get_value().unwrap(), 3.0);
        si.start().unwrap();
        f.normal.increment(2);
        assert_eq!(si.get_value().unwrap(), 2.0);
        si.end().unwrap();
        f.normal.increment(100);
        assert_eq!(si.get_value().unwrap(), 2.0);
        assert_eq!(si.location(), "top.hits");
    }

    #[test]
    fn test_latest_counter_and_parameter() {
        let f = fixture();
        f.latest.set(7.0);
        let mut si = StatisticInstance::from_node(&f.latest).unwrap();
        si.start().unwrap();
        assert_eq!(si.get_value().unwrap(), 7.0);
        let ways = StatisticInstance::from_node(&f.root.find("ways").unwrap()).unwrap();
        assert_eq!(ways.get_value().unwrap(), 8.0);
    }

    #[test]
    fn test_statistic_def_windows_its_expression() {
        let f = fixture();
        let mut si = StatisticInstance::from_node(&f.root.find("hit_rate").unwrap()).unwrap();
        for _ in 0..4 {
            f.normal.increment(2);
            f.sched.run_tick();
        }
        assert_eq!(si.get_value().unwrap(), 2.0);
        si.start().unwrap();
        f.normal.increment(1);
        f.sched.run_tick();
        assert_eq!(si.get_value().unwrap(), 1.0);
        assert_eq!(si.expression_string(), "hits / ticks");
    }

    #[test]
    fn test_accumulation_captures_initial_once() {
        let f = fixture();
        let mut si = StatisticInstance::from_node(&f.normal).unwrap();
        si.set_accumulate(true);
        si.start().unwrap();
        f.normal.increment(4);
        si.end().unwrap();
        f.normal.increment(10);
        si.start().unwrap();
        f.normal.increment(1);
        assert_eq!(si.initial_value(), 0.0);
        assert_eq!(si.get_value().unwrap(), 15.0);
    }

    #[test]
    fn test_range_errors() {
        let f = fixture();
        f.sched.run_until(10);
        let mut si = StatisticInstance::from_node(&f.normal).unwrap();
        f.sched.run_until(50);
        si.end().unwrap();
        f.sched.restart();
        assert!(matches!(
            si.get_value(),
            Err(Error::FutureStatisticRange { end: 50, current: 0 })
        ));

        si.start().unwrap();
        f.sched.run_until(20);
        si.start().unwrap();
        f.sched.restart();
        assert!(matches!(
            si.get_value(),
            Err(Error::ReversedStatisticRange { start: 20, end: 0 })
        ));
    }

    #[test]
    fn test_expired_source() {
        let f = fixture();
        let mut si = StatisticInstance::from_node(&f.normal).unwrap();
        let Fixture { root, normal, .. } = f;
        drop(normal);
        root.remove_child("hits");
        assert!(si.is_expired());
        assert!(si.get_value().unwrap().is_nan());
        assert!(matches!(si.start(), Err(Error::ExpiredReference(_))));
        assert!(matches!(si.end(), Err(Error::ExpiredReference(_))));
    }

    #[test]
    fn test_direct_lookup_and_sinks() {
        let f = fixture();
        let row: SnapshotRow = Rc::new(RefCell::new(vec![1.5, 2.5]));
        let mut si = StatisticInstance::direct_lookup(
            Rc::clone(&row),
            1,
            ProvidedMetadata {
                location: Some("top.x".into()),
                ..Default::default()
            },
        );
        assert_eq!(si.get_value().unwrap(), 2.5);
        assert!(matches!(si.start(), Err(Error::IllegalOperation(_))));

        let out: SnapshotRow = Rc::new(RefCell::new(vec![0.0; 2]));
        let mut counter = StatisticInstance::from_node(&f.normal).unwrap();
        let token = counter.add_snapshot_sink(Rc::clone(&out), 0);
        f.normal.increment(9);
        counter.get_value().unwrap();
        assert_eq!(out.borrow()[0], 9.0);
        assert!(token.upgrade().is_some());
        drop(counter);
        assert!(token.upgrade().is_none());
    }

    #[test]
    fn test_container_is_not_a_source() {
        let f = fixture();
        let c = f.root.add_child(TreeNode::container("sub")).unwrap();
        assert!(matches!(
            StatisticInstance::from_node(&c),
            Err(Error::Construction(_))
        ));
    }
}
