//! Report population from definitions and device subtrees.
//!
//! - `Report::from_definition` instantiates a parsed definition against a
//!   context node, expanding wildcard contexts and `%N` replacements
//! - `Report::add_subtree` captures a device subtree under a caller-supplied
//!   decision function
//! - `Report::autopopulate` is `add_subtree` with a visibility filter

use super::Report;
use crate::sched::Scheduler;
use crate::tree::TreeNode;
use st_common::Result;
use st_config::{apply_replacements, AutopopulateDef, ContentEntry, ReportDefinition};
use std::rc::Rc;
use tracing::{debug, warn};

/// Decides whether a container node becomes its own subreport.
///
/// Arguments: the node, the subreport name (pre-filled with the node name,
/// may be rewritten), whether the subreport nests under the current report
/// (`true`, default) or is attached to the top report of the capture
/// (`false`), and the node's depth below the capture root.
pub type SubtreeDecision<'a> = dyn FnMut(&Rc<TreeNode>, &mut String, &mut bool, usize) -> bool + 'a;

/// Include filter applied to every statistic source found while capturing.
pub type SubtreeFilter<'a> = dyn Fn(&Rc<TreeNode>) -> bool + 'a;

/// Decision function used by `autopopulate`: one nested subreport per
/// container down to `max_report_depth`, flattened below it.
pub fn autopopulate_decision(
    max_report_depth: Option<u32>,
) -> impl FnMut(&Rc<TreeNode>, &mut String, &mut bool, usize) -> bool {
    move |_node, _name, is_child, depth| {
        *is_child = true;
        max_report_depth.map_or(true, |max| depth <= max as usize)
    }
}

struct Capture<'a> {
    scheduler: Rc<Scheduler>,
    decision: &'a mut SubtreeDecision<'a>,
    filters: &'a [&'a SubtreeFilter<'a>],
    max_depth: Option<usize>,
    detached: Vec<Report>,
}

impl Capture<'_> {
    fn accepts(&self, node: &Rc<TreeNode>) -> bool {
        self.filters.iter().all(|f| f(node))
    }

    fn walk(&mut self, target: &mut Report, anchor: &Rc<TreeNode>, node: &Rc<TreeNode>, depth: usize) -> Result<usize> {
        let mut added = 0;
        for child in node.children() {
            let child_depth = depth + 1;
            if self.max_depth.is_some_and(|max| child_depth > max) {
                continue;
            }
            if child.is_statistic_source() {
                if self.accepts(&child) {
                    let name = relative_location(anchor, &child);
                    if !target.has_stat(&name) {
                        target.add_node(&child, Some(&name))?;
                        added += 1;
                    }
                }
                continue;
            }
            if child.is_notification_source() {
                continue;
            }
            let mut name = child.name().to_string();
            let mut is_child = true;
            if (self.decision)(&child, &mut name, &mut is_child, child_depth) {
                let mut sub = Report::new(name, &self.scheduler).with_context(&child);
                added += self.walk(&mut sub, &child, &child, child_depth)?;
                if sub.leaf_count() == 0 {
                    continue;
                }
                if is_child {
                    target.add_subreport(sub);
                } else {
                    self.detached.push(sub);
                }
            } else {
                added += self.walk(target, anchor, &child, child_depth)?;
            }
        }
        Ok(added)
    }
}

/// Dotted path of `node` below `anchor`, or its full location when it is
/// not a descendant.
fn relative_location(anchor: &Rc<TreeNode>, node: &Rc<TreeNode>) -> String {
    let base = anchor.location();
    let loc = node.location();
    match loc.strip_prefix(&base).and_then(|r| r.strip_prefix('.')) {
        Some(rest) if !base.is_empty() => rest.to_string(),
        _ => loc,
    }
}

impl Report {
    /// Instantiate `def` against `context`.
    ///
    /// `replacements` are the wildcard captures of the pattern that
    /// selected `context`; they substitute `%1..%N` in names and
    /// expressions.
    pub fn from_definition(
        def: &ReportDefinition,
        context: &Rc<TreeNode>,
        scheduler: &Rc<Scheduler>,
        replacements: &[String],
    ) -> Result<Report> {
        let name = def
            .name
            .as_deref()
            .map(|n| apply_replacements(n, replacements))
            .unwrap_or_else(|| context.location());
        let mut report = Report::new(name, scheduler).with_context(context);
        report.extend_style(&def.style);
        report.set_trigger_block(def.trigger.clone());
        report.populate(&def.content, context, replacements)?;
        debug!(
            report = report.name(),
            stats = report.leaf_count(),
            subreports = report.subreport_count(),
            "Report populated from definition"
        );
        Ok(report)
    }

    /// Add definition content resolved against `context`.
    pub fn populate(&mut self, entries: &[ContentEntry], context: &Rc<TreeNode>, replacements: &[String]) -> Result<()> {
        for entry in entries {
            match entry {
                ContentEntry::Stat { expression, name } => {
                    let expression = apply_replacements(expression, replacements);
                    let name = name.as_deref().map(|n| apply_replacements(n, replacements));
                    self.add_expression_in(&expression, name.as_deref(), context)?;
                }
                ContentEntry::Context { location, entries } => {
                    let matches = context.find_pattern(location)?;
                    if matches.is_empty() {
                        warn!(
                            report = self.name(),
                            context = %context.location(),
                            pattern = %location,
                            "Definition context matched no tree nodes"
                        );
                    }
                    for (node, captures) in matches {
                        let mut reps = replacements.to_vec();
                        reps.extend(captures);
                        self.populate(entries, &node, &reps)?;
                    }
                }
                ContentEntry::Subreport(def) => {
                    let name = apply_replacements(&def.name, replacements);
                    let mut sub = Report::new(name, self.scheduler()).with_context(context);
                    sub.extend_style(&def.style);
                    sub.set_trigger_block(def.trigger.clone());
                    sub.populate(&def.content, context, replacements)?;
                    self.add_subreport(sub);
                }
                ContentEntry::Autopopulate(def) => {
                    self.autopopulate(context, def)?;
                }
            }
        }
        Ok(())
    }

    /// Capture the statistic sources below `node`.
    ///
    /// Containers for which `decision` returns true become subreports;
    /// the rest are flattened into the enclosing report with their
    /// relative path as statistic name. Subreports that end up empty are
    /// dropped. Returns the number of statistics added.
    pub fn add_subtree(
        &mut self,
        node: &Rc<TreeNode>,
        decision: &mut SubtreeDecision<'_>,
        filters: &[&SubtreeFilter<'_>],
        max_recursion_depth: Option<usize>,
    ) -> Result<usize> {
        if node.is_statistic_source() {
            if filters.iter().all(|f| f(node)) && !self.has_stat(node.name()) {
                self.add_node(node, Some(node.name()))?;
                return Ok(1);
            }
            return Ok(0);
        }
        let mut capture = Capture {
            scheduler: Rc::clone(self.scheduler()),
            decision,
            filters,
            max_depth: max_recursion_depth,
            detached: Vec::new(),
        };
        let added = capture.walk(self, node, node, 0)?;
        for sub in std::mem::take(&mut capture.detached) {
            self.add_subreport(sub);
        }
        Ok(added)
    }

    /// Capture every statistic source below `context` whose visibility
    /// passes the definition's filter.
    pub fn autopopulate(&mut self, context: &Rc<TreeNode>, def: &AutopopulateDef) -> Result<usize> {
        let filter = def.filter.clone();
        let by_visibility = move |n: &Rc<TreeNode>| filter.matches(n.visibility());
        let mut decision = autopopulate_decision(def.max_report_depth);
        self.add_subtree(
            context,
            &mut decision,
            &[&by_visibility],
            def.max_recursion_depth.map(|d| d as usize),
        )
    }
}
