//! Report trees.
//!
//! A [`Report`] is a named, ordered collection of statistic instances plus
//! nested subreports. Subreports are owned by value; a subreport's parent is
//! the report whose `subreports` vector holds it, and callers that need to
//! address a subreport from outside (triggers, replays) use an index path
//! from the top report.
//!
//! This module provides:
//! - Programmatic population (`add`, `add_node`, `add_expression`)
//! - Window control over the whole tree (`start`, `end`)
//! - Style inheritance along the subreport chain
//! - Depth-first flattening (stats before subreports) shared by every
//!   formatter, the archive and the stream plane
//! - Context-counter grouping of sub-statistics

mod populate;

pub use populate::{autopopulate_decision, SubtreeDecision, SubtreeFilter};

use crate::expr::Expression;
use crate::sched::Scheduler;
use crate::stat::StatisticInstance;
use crate::tree::TreeNode;
use st_common::{Error, Result, Tick, DEFAULT_DECIMAL_PLACES, TICK_MAX};
use st_config::TriggerBlock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Inherited style map.
pub type Style = BTreeMap<String, String>;

/// Style key: digits after the decimal point in text formats.
pub const STYLE_DECIMAL_PLACES: &str = "decimal_places";

/// Style key: omit zero values from reduced structured output.
pub const STYLE_OMIT_ZERO_VALUES: &str = "omit_zero_values";

/// Style key: include descriptions in text output.
pub const STYLE_SHOW_DESCRIPTIONS: &str = "show_descriptions";

/// Style key: collapse subreports whose only content is one subreport.
pub const STYLE_COLLAPSIBLE_CHILDREN: &str = "collapsible_children";

/// One named statistic of a report.
#[derive(Debug, Clone)]
pub struct ReportStat {
    pub name: String,
    pub si: StatisticInstance,
}

/// Database ids cached for replay: the report's record range in its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDbIds {
    pub table: String,
    pub first_record: u64,
    pub record_count: u64,
}

/// Ordered key/value header written by tabular formatters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportHeader {
    entries: Vec<(String, String)>,
}

impl ReportHeader {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A node of a report tree.
#[derive(Clone)]
pub struct Report {
    name: String,
    scheduler: Rc<Scheduler>,
    context: Option<Rc<TreeNode>>,
    stats: Vec<ReportStat>,
    stat_names: HashSet<String>,
    subreports: Vec<Report>,
    start_tick: Tick,
    end_tick: Tick,
    info: Option<String>,
    header: ReportHeader,
    style: Style,
    /// Context-counter groups built from live statistic definitions:
    /// aggregate stat index -> member stat indices.
    sub_stat_groups: BTreeMap<usize, Vec<usize>>,
    /// The same grouping restored from stored metadata during replay.
    db_sub_stat_groups: BTreeMap<usize, Vec<usize>>,
    trigger: Option<TriggerBlock>,
    db_ids: Option<ReportDbIds>,
}

impl Report {
    pub fn new(name: impl Into<String>, scheduler: &Rc<Scheduler>) -> Self {
        Self {
            name: name.into(),
            scheduler: Rc::clone(scheduler),
            context: None,
            stats: Vec::new(),
            stat_names: HashSet::new(),
            subreports: Vec::new(),
            start_tick: scheduler.current_tick(),
            end_tick: TICK_MAX,
            info: None,
            header: ReportHeader::default(),
            style: Style::new(),
            sub_stat_groups: BTreeMap::new(),
            db_sub_stat_groups: BTreeMap::new(),
            trigger: None,
            db_ids: None,
        }
    }

    pub fn with_context(mut self, context: &Rc<TreeNode>) -> Self {
        self.context = Some(Rc::clone(context));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    pub fn context(&self) -> Option<&Rc<TreeNode>> {
        self.context.as_ref()
    }

    pub fn set_context(&mut self, context: &Rc<TreeNode>) {
        self.context = Some(Rc::clone(context));
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn set_info(&mut self, info: impl Into<String>) {
        self.info = Some(info.into());
    }

    pub fn header(&self) -> &ReportHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut ReportHeader {
        &mut self.header
    }

    pub fn trigger_block(&self) -> Option<&TriggerBlock> {
        self.trigger.as_ref()
    }

    pub fn set_trigger_block(&mut self, trigger: Option<TriggerBlock>) {
        self.trigger = trigger;
    }

    pub fn db_ids(&self) -> Option<&ReportDbIds> {
        self.db_ids.as_ref()
    }

    pub fn set_db_ids(&mut self, ids: ReportDbIds) {
        self.db_ids = Some(ids);
    }

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    /// Add an instance under `name` (default: its location).
    ///
    /// Returns the index of the new statistic.
    pub fn add(&mut self, si: StatisticInstance, name: Option<&str>) -> Result<usize> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => si.location().to_string(),
        };
        if !self.stat_names.insert(name.clone()) {
            return Err(Error::Construction(format!(
                "report '{}' already has a statistic named '{}'",
                self.name, name
            )));
        }
        self.stats.push(ReportStat { name, si });
        Ok(self.stats.len() - 1)
    }

    /// Add a tree node. Statistic definitions with sub-statistics add their
    /// members too, grouped under the aggregate.
    pub fn add_node(&mut self, node: &Rc<TreeNode>, name: Option<&str>) -> Result<usize> {
        let si = StatisticInstance::from_node(node)?;
        let idx = self.add(si, name)?;
        let subs = node.sub_statistics();
        if subs.is_empty() {
            return Ok(idx);
        }
        let parent_name = self.stats[idx].name.clone();
        let mut members = Vec::with_capacity(subs.len());
        for sub in subs {
            let Some(member) = sub.node.upgrade() else {
                return Err(Error::ExpiredReference(format!(
                    "sub-statistic '{}' of '{}' no longer exists",
                    sub.name,
                    node.location()
                )));
            };
            let si = StatisticInstance::from_node(&member)?;
            let member_name = format!("{}.{}", parent_name, sub.name);
            members.push(self.add(si, Some(&member_name))?);
        }
        self.sub_stat_groups.insert(idx, members);
        Ok(idx)
    }

    /// Add an expression resolved against the report's context node.
    pub fn add_expression(&mut self, text: &str, name: Option<&str>) -> Result<usize> {
        let context = self.context.clone().ok_or_else(|| {
            Error::Construction(format!(
                "report '{}' has no context node to resolve '{}'",
                self.name, text
            ))
        })?;
        self.add_expression_in(text, name, &context)
    }

    /// Add `text` resolved against `context`: a bare path to a statistic
    /// source becomes a node statistic, anything else an expression.
    pub fn add_expression_in(&mut self, text: &str, name: Option<&str>, context: &Rc<TreeNode>) -> Result<usize> {
        if let Some(node) = context.resolve(text).filter(|n| n.is_statistic_source()) {
            return self.add_node(&node, name.or(Some(text)));
        }
        let expr = Expression::parse(text, context)?;
        let si = StatisticInstance::from_expression(expr, &self.scheduler);
        self.add(si, name.or(Some(text)))
    }

    /// Append a subreport and return it.
    pub fn add_subreport(&mut self, report: Report) -> &mut Report {
        self.subreports.push(report);
        let last = self.subreports.len() - 1;
        &mut self.subreports[last]
    }

    pub fn statistics(&self) -> &[ReportStat] {
        &self.stats
    }

    pub fn statistics_mut(&mut self) -> &mut [ReportStat] {
        &mut self.stats
    }

    pub fn stat(&self, name: &str) -> Option<&StatisticInstance> {
        self.stats.iter().find(|s| s.name == name).map(|s| &s.si)
    }

    pub fn has_stat(&self, name: &str) -> bool {
        self.stat_names.contains(name)
    }

    pub fn subreports(&self) -> &[Report] {
        &self.subreports
    }

    pub fn subreports_mut(&mut self) -> &mut [Report] {
        &mut self.subreports
    }

    pub fn subreport(&self, name: &str) -> Option<&Report> {
        self.subreports.iter().find(|r| r.name == name)
    }

    /// Follow an index path from this report.
    pub fn subreport_at(&self, path: &[usize]) -> Option<&Report> {
        let mut report = self;
        for idx in path {
            report = report.subreports.get(*idx)?;
        }
        Some(report)
    }

    pub fn subreport_at_mut(&mut self, path: &[usize]) -> Option<&mut Report> {
        let mut report = self;
        for idx in path {
            report = report.subreports.get_mut(*idx)?;
        }
        Some(report)
    }

    /// Index path of the first subreport named `name` (depth-first).
    pub fn find_subreport_path(&self, name: &str) -> Option<Vec<usize>> {
        for (i, sub) in self.subreports.iter().enumerate() {
            if sub.name == name {
                return Some(vec![i]);
            }
            if let Some(mut rest) = sub.find_subreport_path(name) {
                rest.insert(0, i);
                return Some(rest);
            }
        }
        None
    }

    pub fn sub_stat_groups(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.sub_stat_groups
    }

    pub fn db_sub_stat_groups(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.db_sub_stat_groups
    }

    pub(crate) fn set_db_sub_stat_group(&mut self, aggregate: usize, members: Vec<usize>) {
        self.db_sub_stat_groups.insert(aggregate, members);
    }

    /// Live groups, or the replayed ones when the report came from storage.
    pub fn context_groups(&self) -> &BTreeMap<usize, Vec<usize>> {
        if self.sub_stat_groups.is_empty() {
            &self.db_sub_stat_groups
        } else {
            &self.sub_stat_groups
        }
    }

    // ------------------------------------------------------------------
    // Windows
    // ------------------------------------------------------------------

    pub fn start_tick(&self) -> Tick {
        self.start_tick
    }

    pub fn end_tick(&self) -> Tick {
        self.end_tick
    }

    /// Restart the window of this report, its statistics and subreports.
    pub fn start(&mut self) -> Result<()> {
        self.start_tick = self.scheduler.current_tick();
        self.end_tick = TICK_MAX;
        for stat in &mut self.stats {
            if !stat.si.is_direct_lookup() {
                stat.si.start()?;
            }
        }
        for sub in &mut self.subreports {
            sub.start()?;
        }
        Ok(())
    }

    /// Close the window of this report, its statistics and subreports.
    pub fn end(&mut self) -> Result<()> {
        self.end_tick = self.scheduler.current_tick();
        for stat in &mut self.stats {
            if !stat.si.is_direct_lookup() {
                stat.si.end()?;
            }
        }
        for sub in &mut self.subreports {
            sub.end()?;
        }
        Ok(())
    }

    /// Put every statistic into (or out of) accumulation mode.
    pub fn set_accumulate(&mut self, accumulate: bool) {
        for stat in &mut self.stats {
            stat.si.set_accumulate(accumulate);
        }
        for sub in &mut self.subreports {
            sub.set_accumulate(accumulate);
        }
    }

    // ------------------------------------------------------------------
    // Style
    // ------------------------------------------------------------------

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn set_style(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.style.insert(key.into(), value.into());
    }

    pub fn extend_style(&mut self, style: &Style) {
        for (k, v) in style {
            self.style.insert(k.clone(), v.clone());
        }
    }

    /// This report's style over the inherited one.
    pub fn effective_style(&self, inherited: &Style) -> Style {
        let mut merged = inherited.clone();
        for (k, v) in &self.style {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    // ------------------------------------------------------------------
    // Flattening
    // ------------------------------------------------------------------

    /// Number of statistics in the whole tree.
    pub fn leaf_count(&self) -> usize {
        self.stats.len() + self.subreports.iter().map(Report::leaf_count).sum::<usize>()
    }

    pub fn subreport_count(&self) -> usize {
        self.subreports.len() + self.subreports.iter().map(Report::subreport_count).sum::<usize>()
    }

    /// Depth-first (stats before subreports) list of qualified column
    /// names and instances. Subreport names prefix their statistics.
    pub fn flatten(&self) -> Vec<(String, &StatisticInstance)> {
        let mut out = Vec::with_capacity(self.leaf_count());
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a StatisticInstance)>) {
        for stat in &self.stats {
            out.push((format!("{}{}", prefix, stat.name), &stat.si));
        }
        for sub in &self.subreports {
            let prefix = format!("{}{}.", prefix, sub.name);
            sub.flatten_into(&prefix, out);
        }
    }

    /// Visit every statistic mutably in flattened order with its leaf index.
    pub fn for_each_stat_mut(&mut self, visit: &mut dyn FnMut(usize, &mut StatisticInstance)) {
        fn go(report: &mut Report, next: &mut usize, visit: &mut dyn FnMut(usize, &mut StatisticInstance)) {
            for stat in &mut report.stats {
                visit(*next, &mut stat.si);
                *next += 1;
            }
            for sub in &mut report.subreports {
                go(sub, next, visit);
            }
        }
        let mut next = 0;
        go(self, &mut next, visit);
    }

    /// Evaluate every statistic in flattened order (feeding snapshot sinks).
    pub fn collect_values(&self) -> Result<Vec<f64>> {
        self.flatten().into_iter().map(|(_, si)| si.get_value()).collect()
    }

    /// Decimal places from the effective style.
    pub fn decimal_places(style: &Style) -> usize {
        style
            .get(STYLE_DECIMAL_PLACES)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_DECIMAL_PLACES)
    }

    /// Truthy style flag (`true`, `yes`, `1`).
    pub fn style_flag(style: &Style, key: &str) -> bool {
        style
            .get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "on"))
            .unwrap_or(false)
    }
}

impl Drop for Report {
    fn drop(&mut self) {
        // Instances are released newest first.
        while let Some(stat) = self.stats.pop() {
            drop(stat);
        }
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("name", &self.name)
            .field("stats", &self.stats.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("subreports", &self.subreports)
            .field("start_tick", &self.start_tick)
            .field("end_tick", &self.end_tick)
            .finish()
    }
}
