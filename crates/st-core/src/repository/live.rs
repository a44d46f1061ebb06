//! A report bound to its formatter, its triggers and its capture planes.

use crate::archive::{ArchiveController, ArchiveDataSeries, ArchiveWriter, LiveArchiveController};
use crate::format::{create_formatter, FormatContext, ReportFormatter};
use crate::logging::TRIGGER_TARGET;
use crate::report::Report;
use crate::stream::{ReportStreamNode, StreamController, StreamListener};
use crate::tree::{SubscriptionId, TreeNode};
use crate::trigger::{
    Edge, ExpressionTrigger, PeriodicTrigger, TagRegistry, ToggleTrigger, TriggerContext, TriggerExpr, TriggerSpec,
    UpdatePeriod,
};
use st_common::{Error, Result, SimulationInfo, Tick};
use st_config::{ReportFormat, TriggerBlock, TriggerKey};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a live report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// Waiting for its start trigger.
    Pending,
    /// Window open; updates are written.
    Active,
    /// Window closed by a stop trigger or a `whenever` condition.
    Stopped,
    /// Written out; no further updates.
    Saved,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Active => "active",
            ReportStatus::Stopped => "stopped",
            ReportStatus::Saved => "saved",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger text found on a subreport, addressed by index path.
#[derive(Debug, Clone)]
struct SubreportTriggers {
    path: Vec<usize>,
    name: String,
    context: Option<Rc<TreeNode>>,
    block: TriggerBlock,
}

#[derive(Default)]
struct Handles {
    start: Option<ExpressionTrigger>,
    stop_spec: Option<TriggerSpec>,
    stop: Option<ExpressionTrigger>,
    period: Option<UpdatePeriod>,
    update: Option<PeriodicTrigger>,
    update_gate: Option<ToggleTrigger>,
    toggle: Option<ToggleTrigger>,
    on_demand: Option<(Weak<TreeNode>, SubscriptionId)>,
    subreports: Vec<ExpressionTrigger>,
}

struct LiveInner {
    name: String,
    dest: String,
    format: ReportFormat,
    triggers: TriggerBlock,
    format_ctx: FormatContext,
    report: RefCell<Report>,
    formatter: RefCell<Box<dyn ReportFormatter>>,
    status: Cell<ReportStatus>,
    gated: Cell<bool>,
    updates: Cell<u64>,
    handles: RefCell<Handles>,
    tags: RefCell<Option<TagRegistry>>,
    archive: RefCell<Option<LiveArchiveController>>,
    stream: RefCell<Option<ReportStreamNode>>,
    first_error: RefCell<Option<Error>>,
}

/// Shared handle to a report registered with a repository.
///
/// Cloning is cheap; every clone drives the same report.
#[derive(Clone)]
pub struct LiveReport {
    inner: Rc<LiveInner>,
}

fn merged_block(primary: &TriggerBlock, fallback: Option<&TriggerBlock>) -> TriggerBlock {
    let mut merged = primary.clone();
    if let Some(fallback) = fallback {
        let has_periodic = primary.periodic_update().is_some();
        for (key, text) in fallback.iter() {
            if !merged.contains(key) && !(has_periodic && key.is_periodic_update()) {
                merged = merged.with(key, text);
            }
        }
    }
    merged
}

fn collect_subreport_triggers(report: &Report, prefix: &mut Vec<usize>, out: &mut Vec<SubreportTriggers>) {
    for (i, sub) in report.subreports().iter().enumerate() {
        prefix.push(i);
        if let Some(block) = sub.trigger_block().filter(|b| !b.is_empty()) {
            out.push(SubreportTriggers {
                path: prefix.clone(),
                name: sub.name().to_string(),
                context: sub.context().cloned(),
                block: block.clone(),
            });
        }
        collect_subreport_triggers(sub, prefix, out);
        prefix.pop();
    }
}

impl LiveReport {
    /// Bind `report` to `format` at `dest`.
    ///
    /// `triggers` is the descriptor's block; keys it lacks are taken from
    /// the report's own (definition-level) block.
    pub fn new(
        mut report: Report,
        format: ReportFormat,
        dest: &str,
        triggers: &TriggerBlock,
        format_ctx: FormatContext,
    ) -> Result<Self> {
        let triggers = merged_block(triggers, report.trigger_block());
        triggers.validate()?;
        if triggers.contains(TriggerKey::Whenever)
            && (triggers.contains(TriggerKey::Start) || triggers.contains(TriggerKey::Stop))
        {
            return Err(Error::trigger(format!(
                "report '{}': 'whenever' cannot be combined with 'start' or 'stop'",
                report.name()
            )));
        }
        if format.is_cumulative() {
            report.set_accumulate(true);
        }
        let formatter = create_formatter(format, dest)?;
        Ok(Self {
            inner: Rc::new(LiveInner {
                name: report.name().to_string(),
                dest: dest.to_string(),
                format,
                triggers,
                format_ctx,
                report: RefCell::new(report),
                formatter: RefCell::new(formatter),
                status: Cell::new(ReportStatus::Pending),
                gated: Cell::new(false),
                updates: Cell::new(0),
                handles: RefCell::new(Handles::default()),
                tags: RefCell::new(None),
                archive: RefCell::new(None),
                stream: RefCell::new(None),
                first_error: RefCell::new(None),
            }),
        })
    }

    fn from_weak(weak: &Weak<LiveInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<LiveInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dest(&self) -> &str {
        &self.inner.dest
    }

    pub fn format(&self) -> ReportFormat {
        self.inner.format
    }

    pub fn triggers(&self) -> &TriggerBlock {
        &self.inner.triggers
    }

    pub fn status(&self) -> ReportStatus {
        self.inner.status.get()
    }

    /// Updates written so far.
    pub fn update_count(&self) -> u64 {
        self.inner.updates.get()
    }

    /// Whether `update-whenever` currently suppresses updates.
    pub fn is_gated(&self) -> bool {
        self.inner.gated.get()
    }

    pub fn report(&self) -> Ref<'_, Report> {
        self.inner.report.borrow()
    }

    /// First runtime error raised from a trigger callback, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.first_error.borrow_mut().take()
    }

    /// Tags defined by this report and its subreports.
    pub fn defined_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.triggers.tag().map(str::to_string).into_iter().collect();
        let report = self.inner.report.borrow();
        let mut subs = Vec::new();
        collect_subreport_triggers(&report, &mut Vec::new(), &mut subs);
        tags.extend(subs.iter().filter_map(|s| s.block.tag().map(str::to_string)));
        tags
    }

    fn current_tick(&self) -> Tick {
        self.inner.report.borrow().scheduler().current_tick()
    }

    fn record_error(&self, err: Error) {
        warn!(report = %self.inner.name, error = %err, "Report trigger callback failed");
        let mut slot = self.inner.first_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn context(&self, node: Option<&Rc<TreeNode>>, tags: &TagRegistry) -> Result<TriggerContext> {
        let report = self.inner.report.borrow();
        let node = node.or(report.context()).ok_or_else(|| {
            Error::trigger(format!(
                "report '{}' has no context node to resolve its triggers against",
                self.inner.name
            ))
        })?;
        Ok(TriggerContext::new(node, tags))
    }

    // ------------------------------------------------------------------
    // Capture planes
    // ------------------------------------------------------------------

    /// Capture every update into an archive at `dir`.
    pub fn enable_archive(&self, dir: impl AsRef<Path>, siminfo: Option<SimulationInfo>) -> Result<()> {
        if self.inner.archive.borrow().is_some() {
            return Err(Error::IllegalOperation(format!(
                "report '{}' already writes an archive",
                self.inner.name
            )));
        }
        let writer = ArchiveWriter::create(dir, &mut self.inner.report.borrow_mut(), siminfo)?;
        *self.inner.archive.borrow_mut() = Some(LiveArchiveController::new(writer));
        Ok(())
    }

    pub fn archive_dir(&self) -> Option<PathBuf> {
        self.inner
            .archive
            .borrow()
            .as_ref()
            .map(|a| a.dir().to_path_buf())
    }

    /// Flush the archive so readers see every written row.
    pub fn synchronize_archive(&self) -> Result<()> {
        match self.inner.archive.borrow_mut().as_mut() {
            Some(archive) => archive.synchronize(),
            None => Ok(()),
        }
    }

    /// Time series of one archived leaf.
    pub fn archive_series(&self, leaf_index: usize) -> Result<ArchiveDataSeries> {
        self.synchronize_archive()?;
        let archive = self.inner.archive.borrow();
        let archive = archive.as_ref().ok_or_else(|| {
            Error::IllegalOperation(format!("report '{}' has no archive", self.inner.name))
        })?;
        archive.series(leaf_index)
    }

    /// Copy the archive to `dest`, replacing what is there.
    pub fn save_archive_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        match self.inner.archive.borrow_mut().as_mut() {
            Some(archive) => archive.save_to(dest.as_ref()),
            None => Err(Error::IllegalOperation(format!(
                "report '{}' has no archive",
                self.inner.name
            ))),
        }
    }

    fn with_stream<R>(&self, f: impl FnOnce(&mut ReportStreamNode) -> Result<R>) -> Result<R> {
        if self.inner.stream.borrow().is_none() {
            let node = ReportStreamNode::attach(&mut self.inner.report.borrow_mut());
            *self.inner.stream.borrow_mut() = Some(node);
        }
        let mut stream = self.inner.stream.borrow_mut();
        match stream.as_mut() {
            Some(node) => f(node),
            None => Err(Error::IllegalOperation("stream root missing".into())),
        }
    }

    /// Queue for a consumer thread; each update appends one row.
    pub fn add_stream_listener(&self, name: impl Into<String>) -> Result<StreamListener> {
        self.with_stream(|node| node.add_listener(name))
    }

    pub fn add_stream_controller(&self, controller: Box<dyn StreamController>) -> Result<()> {
        self.with_stream(|node| node.add_controller(controller))
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Write one update if the report is active and not gated.
    ///
    /// Order per update: formatter record, archive row, stream push.
    pub fn update(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.status.get() != ReportStatus::Active || inner.gated.get() {
            return Ok(());
        }
        let report = inner.report.borrow();
        report.collect_values()?;
        {
            let mut formatter = inner.formatter.borrow_mut();
            if formatter.supports_updates() {
                formatter.write_update(&report, &inner.format_ctx)?;
            }
        }
        if let Some(archive) = inner.archive.borrow_mut().as_mut() {
            archive.writer_mut().write_row()?;
        }
        if let Some(stream) = inner.stream.borrow_mut().as_mut() {
            stream.push_current();
        }
        inner.updates.set(inner.updates.get() + 1);
        trace!(report = %inner.name, update = inner.updates.get(), "Report updated");
        Ok(())
    }

    fn update_or_record(&self) {
        if let Err(e) = self.update() {
            self.record_error(e);
        }
    }

    // ------------------------------------------------------------------
    // Window transitions
    // ------------------------------------------------------------------

    fn begin(&self) {
        let tick = self.current_tick();
        if let Err(e) = self.inner.report.borrow_mut().start() {
            self.record_error(e);
            return;
        }
        self.inner.status.set(ReportStatus::Active);
        info!(
            target: TRIGGER_TARGET,
            report = %self.inner.name,
            tick,
            "[trigger] Now starting report '{}' at tick {}",
            self.inner.name,
            tick
        );
        if let Err(e) = self.arm_updates() {
            self.record_error(e);
        }
        if let Err(e) = self.arm_stop() {
            self.record_error(e);
        }
    }

    fn halt(&self) {
        let tick = self.current_tick();
        if let Err(e) = self.inner.report.borrow_mut().end() {
            self.record_error(e);
        }
        self.inner.status.set(ReportStatus::Stopped);
        let (update, stop) = {
            let mut handles = self.inner.handles.borrow_mut();
            (handles.update.take(), handles.stop.take())
        };
        drop(update);
        drop(stop);
        info!(
            target: TRIGGER_TARGET,
            report = %self.inner.name,
            tick,
            "[trigger] Now stopping report '{}' at tick {}",
            self.inner.name,
            tick
        );
    }

    fn arm_updates(&self) -> Result<()> {
        let period = self.inner.handles.borrow().period.clone();
        let Some(period) = period else {
            return Ok(());
        };
        let weak = self.downgrade();
        let trigger = PeriodicTrigger::arm(period, move || {
            if let Some(live) = LiveReport::from_weak(&weak) {
                live.update_or_record();
            }
        })?;
        self.inner.handles.borrow_mut().update = Some(trigger);
        Ok(())
    }

    fn arm_stop(&self) -> Result<()> {
        let spec = self.inner.handles.borrow().stop_spec.clone();
        let (Some(spec), Some(tags)) = (spec, self.inner.tags.borrow().clone()) else {
            return Ok(());
        };
        let ctx = self.context(None, &tags)?;
        let weak = self.downgrade();
        let trigger = spec.arm(&ctx, move || {
            if let Some(live) = LiveReport::from_weak(&weak) {
                live.halt();
            }
        })?;
        self.inner.handles.borrow_mut().stop = Some(trigger);
        Ok(())
    }

    fn set_subreport_window(&self, path: &[usize], name: &str, open: bool) {
        let tick = self.current_tick();
        let result = {
            let mut report = self.inner.report.borrow_mut();
            match report.subreport_at_mut(path) {
                Some(sub) if open => sub.start(),
                Some(sub) => sub.end(),
                None => Err(Error::IllegalOperation(format!("subreport '{}' no longer exists", name))),
            }
        };
        if let Err(e) = result {
            self.record_error(e);
            return;
        }
        let verb = if open { "starting" } else { "stopping" };
        info!(
            target: TRIGGER_TARGET,
            report = %name,
            tick,
            "[trigger] Now {} report '{}' at tick {}",
            verb,
            name,
            tick
        );
    }

    fn arm_subreport_stop(&self, sub: &SubreportTriggers, tags: &TagRegistry) -> Result<()> {
        let Some(text) = sub.block.get(TriggerKey::Stop) else {
            return Ok(());
        };
        let mut spec = TriggerSpec::parse(format!("{}.stop", sub.name), text)?;
        if let Some(tag) = sub.block.tag() {
            spec = spec.publish_as(tag, Edge::Stop);
        }
        let ctx = self.context(sub.context.as_ref(), tags)?;
        let weak = self.downgrade();
        let (path, name) = (sub.path.clone(), sub.name.clone());
        let trigger = spec.arm(&ctx, move || {
            if let Some(live) = LiveReport::from_weak(&weak) {
                live.set_subreport_window(&path, &name, false);
            }
        })?;
        self.inner.handles.borrow_mut().subreports.push(trigger);
        Ok(())
    }

    fn arm_subreport(&self, sub: SubreportTriggers, tags: &TagRegistry) -> Result<()> {
        let Some(text) = sub.block.get(TriggerKey::Start) else {
            return self.arm_subreport_stop(&sub, tags);
        };
        let mut spec = TriggerSpec::parse(format!("{}.start", sub.name), text)?;
        if let Some(tag) = sub.block.tag() {
            spec = spec.publish_as(tag, Edge::Start);
        }
        let ctx = self.context(sub.context.as_ref(), tags)?;
        let weak = self.downgrade();
        let tags_for_stop = tags.clone();
        let trigger = spec.arm(&ctx, move || {
            let Some(live) = LiveReport::from_weak(&weak) else {
                return;
            };
            live.set_subreport_window(&sub.path, &sub.name, true);
            if let Err(e) = live.arm_subreport_stop(&sub, &tags_for_stop) {
                live.record_error(e);
            }
        })?;
        self.inner.handles.borrow_mut().subreports.push(trigger);
        Ok(())
    }

    /// Arm every trigger of the report.
    ///
    /// Returns the tags whose start edge fired immediately because their
    /// report had no start trigger; the caller publishes them once every
    /// report is armed.
    pub(crate) fn arm(&self, tags: &TagRegistry) -> Result<Vec<String>> {
        *self.inner.tags.borrow_mut() = Some(tags.clone());
        let block = self.inner.triggers.clone();
        let ctx = || self.context(None, tags);
        let mut started_tags = Vec::new();

        if let Some((key, text)) = block.periodic_update() {
            let period = UpdatePeriod::from_block(key, text, &ctx()?)?;
            self.inner.handles.borrow_mut().period = Some(period);
        }
        if let Some(text) = block.get(TriggerKey::Stop) {
            let mut spec = TriggerSpec::parse(format!("{}.stop", self.inner.name), text)?;
            if let Some(tag) = block.tag() {
                spec = spec.publish_as(tag, Edge::Stop);
            }
            self.inner.handles.borrow_mut().stop_spec = Some(spec);
        }
        if let Some(text) = block.get(TriggerKey::UpdateWhenever) {
            self.inner.gated.set(true);
            let weak = self.downgrade();
            let gate = ToggleTrigger::arm(TriggerExpr::parse(text)?, &ctx()?, move |on| {
                if let Some(live) = LiveReport::from_weak(&weak) {
                    live.inner.gated.set(!on);
                }
            })?;
            self.inner.handles.borrow_mut().update_gate = Some(gate);
        }
        if let Some(channel) = block.notification_channels(TriggerKey::OnDemand).into_iter().next() {
            let source = ctx()?.notification_source(&channel)?;
            let weak = self.downgrade();
            let id = source
                .subscribe(move |_| {
                    if let Some(live) = LiveReport::from_weak(&weak) {
                        live.update_or_record();
                    }
                })
                .ok_or_else(|| Error::trigger(format!("'{}' does not accept subscriptions", channel)))?;
            self.inner.handles.borrow_mut().on_demand = Some((Rc::downgrade(&source), id));
        }

        let subs = {
            let report = self.inner.report.borrow();
            let mut subs = Vec::new();
            collect_subreport_triggers(&report, &mut Vec::new(), &mut subs);
            subs
        };
        for sub in subs {
            if sub.block.get(TriggerKey::Start).is_none() {
                if let Some(tag) = sub.block.tag() {
                    started_tags.push(tag.to_string());
                }
            }
            self.arm_subreport(sub, tags)?;
        }

        if let Some(text) = block.get(TriggerKey::Whenever) {
            let weak = self.downgrade();
            let toggle = ToggleTrigger::arm(TriggerExpr::parse(text)?, &ctx()?, move |on| {
                if let Some(live) = LiveReport::from_weak(&weak) {
                    if on {
                        live.begin();
                    } else {
                        live.halt();
                    }
                }
            })?;
            self.inner.handles.borrow_mut().toggle = Some(toggle);
        } else if let Some(text) = block.get(TriggerKey::Start) {
            let mut spec = TriggerSpec::parse(format!("{}.start", self.inner.name), text)?;
            if let Some(tag) = block.tag() {
                spec = spec.publish_as(tag, Edge::Start);
            }
            let weak = self.downgrade();
            let trigger = spec.arm(&ctx()?, move || {
                if let Some(live) = LiveReport::from_weak(&weak) {
                    live.begin();
                }
            })?;
            self.inner.handles.borrow_mut().start = Some(trigger);
        } else {
            if let Some(tag) = block.tag() {
                started_tags.push(tag.to_string());
            }
            self.begin();
            if let Some(err) = self.take_error() {
                return Err(err);
            }
        }
        debug!(report = %self.inner.name, status = %self.status(), "Report triggers armed");
        Ok(started_tags)
    }

    fn disarm(&self) {
        let handles = std::mem::take(&mut *self.inner.handles.borrow_mut());
        if let Some((source, id)) = &handles.on_demand {
            if let Some(source) = source.upgrade() {
                source.unsubscribe(*id);
            }
        }
        drop(handles);
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Close the window, finish the output and flush the archive.
    ///
    /// A report in a per-update format that never received an update gets
    /// one now, so its output is never empty.
    pub fn save(&self) -> Result<()> {
        if self.status() == ReportStatus::Saved {
            return Ok(());
        }
        self.disarm();
        let supports_updates = self.inner.formatter.borrow().supports_updates();
        if supports_updates && self.inner.updates.get() == 0 && self.status() == ReportStatus::Active {
            self.update()?;
        }
        if self.status() == ReportStatus::Active {
            self.inner.report.borrow_mut().end()?;
        }
        {
            let report = self.inner.report.borrow();
            self.inner
                .formatter
                .borrow_mut()
                .finish(&report, &self.inner.format_ctx)?;
        }
        let ids = self.inner.formatter.borrow().db_ids();
        if let Some(ids) = ids {
            self.inner.report.borrow_mut().set_db_ids(ids);
        }
        self.synchronize_archive()?;
        self.inner.status.set(ReportStatus::Saved);
        debug!(
            report = %self.inner.name,
            dest = %self.inner.dest,
            updates = self.inner.updates.get(),
            "Report saved"
        );
        Ok(())
    }
}

impl fmt::Debug for LiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveReport")
            .field("name", &self.inner.name)
            .field("format", &self.inner.format)
            .field("dest", &self.inner.dest)
            .field("status", &self.inner.status.get())
            .field("updates", &self.inner.updates.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Phase, Scheduler};
    use crate::tree::CounterBehavior;
    use std::collections::VecDeque;

    struct Fixture {
        sched: Rc<Scheduler>,
        root: Rc<TreeNode>,
        c0: Rc<TreeNode>,
        _ticker: crate::sched::RepeatingEvent,
    }

    fn fixture() -> Fixture {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "count", CounterBehavior::Normal))
            .unwrap();
        let c = Rc::clone(&c0);
        let ticker = sched.schedule_repeating(0, 1, Phase::Tick, move || {
            c.increment(1);
            true
        });
        Fixture {
            sched,
            root,
            c0,
            _ticker: ticker,
        }
    }

    fn live(f: &Fixture, block: TriggerBlock) -> LiveReport {
        let mut report = Report::new("r", &f.sched).with_context(&f.root);
        report.add_expression("c0", None).unwrap();
        LiveReport::new(report, ReportFormat::Text, "1", &block, FormatContext::default()).unwrap()
    }

    fn drain(listener: &StreamListener) -> Vec<f64> {
        let mut out = VecDeque::new();
        listener.get_buffered_stream_data(&mut out);
        out.into_iter().map(|row| row[0]).collect()
    }

    #[test]
    fn test_start_stop_window_and_updates() {
        let f = fixture();
        let block = TriggerBlock::new()
            .with(TriggerKey::Start, "c0 >= 3")
            .with(TriggerKey::Stop, "c0 >= 6")
            .with(TriggerKey::UpdateCycles, "1");
        let report = live(&f, block);
        let listener = report.add_stream_listener("t").unwrap();
        let tags = TagRegistry::new();
        assert!(report.arm(&tags).unwrap().is_empty());
        assert_eq!(report.status(), ReportStatus::Pending);

        f.sched.run_until(10);
        assert_eq!(report.status(), ReportStatus::Stopped);
        // Updates run only inside the window: ticks 3..=5.
        assert_eq!(drain(&listener), vec![0.0, 1.0, 2.0]);
        assert_eq!(report.update_count(), 3);
        assert_eq!(f.c0.get(), 10);
    }

    #[test]
    fn test_no_start_trigger_begins_immediately() {
        let f = fixture();
        let report = live(&f, TriggerBlock::new().with(TriggerKey::Tag, "t0"));
        let tags = TagRegistry::new();
        tags.define("t0").unwrap();
        assert_eq!(report.arm(&tags).unwrap(), vec!["t0".to_string()]);
        assert_eq!(report.status(), ReportStatus::Active);
        report.save().unwrap();
        assert_eq!(report.status(), ReportStatus::Saved);
    }

    #[test]
    fn test_update_whenever_gates_updates() {
        let f = fixture();
        let gate = f
            .root
            .add_child(TreeNode::notification_source("gate", "gate"))
            .unwrap();
        let block = TriggerBlock::new()
            .with(TriggerKey::UpdateCycles, "1")
            .with(TriggerKey::UpdateWhenever, "notif.gate == 1");
        let report = live(&f, block);
        let listener = report.add_stream_listener("t").unwrap();
        report.arm(&TagRegistry::new()).unwrap();
        assert!(report.is_gated());

        f.sched.run_until(2);
        gate.post(1.0);
        f.sched.run_until(4);
        gate.post(0.0);
        f.sched.run_until(6);
        assert_eq!(drain(&listener), vec![2.0, 3.0]);
    }

    #[test]
    fn test_on_demand_updates() {
        let f = fixture();
        let dump = f
            .root
            .add_child(TreeNode::notification_source("dump", "dump"))
            .unwrap();
        let report = live(&f, TriggerBlock::new().with(TriggerKey::OnDemand, "notif.dump"));
        let listener = report.add_stream_listener("t").unwrap();
        report.arm(&TagRegistry::new()).unwrap();
        f.sched.run_until(5);
        dump.post(0.0);
        assert_eq!(drain(&listener), vec![5.0]);
        report.save().unwrap();
        assert_eq!(dump.observer_count(), 0);
    }

    #[test]
    fn test_whenever_with_start_rejected() {
        let f = fixture();
        let mut report = Report::new("r", &f.sched).with_context(&f.root);
        report.add_expression("c0", None).unwrap();
        let block = TriggerBlock::new()
            .with(TriggerKey::Start, "c0 >= 1")
            .with(TriggerKey::Whenever, "c0 >= 2");
        let err = LiveReport::new(report, ReportFormat::Text, "1", &block, FormatContext::default()).unwrap_err();
        assert!(err.to_string().contains("whenever"));
    }

    #[test]
    fn test_definition_block_fills_missing_keys() {
        let f = fixture();
        let mut report = Report::new("r", &f.sched).with_context(&f.root);
        report.add_expression("c0", None).unwrap();
        report.set_trigger_block(Some(
            TriggerBlock::new()
                .with(TriggerKey::Start, "c0 >= 100")
                .with(TriggerKey::UpdateCycles, "2"),
        ));
        let block = TriggerBlock::new().with(TriggerKey::Start, "c0 >= 1");
        let live = LiveReport::new(report, ReportFormat::Text, "1", &block, FormatContext::default()).unwrap();
        assert_eq!(live.triggers().get(TriggerKey::Start), Some("c0 >= 1"));
        assert_eq!(live.triggers().get(TriggerKey::UpdateCycles), Some("2"));
    }
}
