//! Plain-text dump: one `name = value` line per statistic, subreports
//! indented below their parent.

use super::{Destination, FormatContext, ReportFormatter};
use crate::report::{Report, Style, STYLE_SHOW_DESCRIPTIONS};
use st_common::{format_number, Result};
use st_config::ReportFormat;
use std::fmt::Write as _;

const INDENT: &str = "  ";

pub struct TextFormatter {
    dest: Destination,
}

impl TextFormatter {
    pub fn new(dest: &str) -> Self {
        Self {
            dest: Destination::parse(dest),
        }
    }

    /// Render `report` as text.
    pub fn render(&self, report: &Report, ctx: &FormatContext) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Report \"{}\" [{} .. {}] ({} {})",
            report.name(),
            report.start_tick(),
            report.end_tick(),
            ctx.siminfo.name,
            ctx.siminfo.sim_version
        );
        render_report(report, &Style::new(), 1, &mut out)?;
        Ok(out)
    }
}

fn render_report(report: &Report, inherited: &Style, depth: usize, out: &mut String) -> Result<()> {
    let style = report.effective_style(inherited);
    let decimals = Report::decimal_places(&style);
    let show_desc = Report::style_flag(&style, STYLE_SHOW_DESCRIPTIONS);
    let pad = INDENT.repeat(depth);
    let width = report
        .statistics()
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);
    for stat in report.statistics() {
        let value = format_number(stat.si.get_value()?, true, decimals);
        if show_desc && !stat.si.desc().is_empty() {
            let _ = writeln!(out, "{}{:<width$} = {}  # {}", pad, stat.name, value, stat.si.desc(), width = width);
        } else {
            let _ = writeln!(out, "{}{:<width$} = {}", pad, stat.name, value, width = width);
        }
    }
    for sub in report.subreports() {
        let _ = writeln!(out, "{}{}", pad, sub.name());
        render_report(sub, &style, depth + 1, out)?;
    }
    Ok(())
}

impl ReportFormatter for TextFormatter {
    fn format(&self) -> ReportFormat {
        ReportFormat::Text
    }

    fn write_header(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn write_update(&mut self, _report: &Report, _ctx: &FormatContext) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        let text = self.render(report, ctx)?;
        self.dest.write_all(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Scheduler};
    use crate::tree::{CounterBehavior, TreeNode};

    #[test]
    fn test_render_indents_subreports() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let hits = root
            .add_child(TreeNode::counter("hits", "cache hits", CounterBehavior::Normal))
            .unwrap();
        root.add_child(TreeNode::parameter("ways", "associativity", 8.0)).unwrap();
        let mut report = Report::new("cache", &sched).with_context(&root);
        report.add_expression("hits", None).unwrap();
        report.set_style(STYLE_SHOW_DESCRIPTIONS, "true");
        let mut sub = Report::new("config", &sched).with_context(&root);
        sub.add_expression("ways / 3", Some("third")).unwrap();
        sub.set_style("decimal_places", "2");
        report.add_subreport(sub);
        hits.increment(5);

        let text = TextFormatter::new("1").render(&report, &FormatContext::default()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("Report \"cache\""));
        assert_eq!(lines[1], "  hits = 5  # cache hits");
        assert_eq!(lines[2], "  config");
        assert_eq!(lines[3], "    third = 2.7  # ways / 3");
    }
}
