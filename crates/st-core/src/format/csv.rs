//! Tabular-row output.
//!
//! ```text
//! # name=core, start=0                   , end=18446744073709551615, report_format=csv, sim_name=...
//! retired,ipc,fetch.stalls
//! 12,0.75,3
//! ```
//!
//! Integral header fields are padded to a fixed width so the end tick can be
//! rewritten in place when the report finishes.

use super::{Destination, FormatContext, OutputSink, ReportFormatter};
use crate::report::Report;
use st_common::{format_number, Result, Tick};
use st_config::ReportFormat;
use std::io::Write;

/// Width reserved for integral header values (fits `u64::MAX`).
const TICK_FIELD_WIDTH: usize = 20;

pub struct CsvFormatter {
    dest: Destination,
    cumulative: bool,
    sink: Option<OutputSink>,
    end_offset: Option<u64>,
    rows: u64,
}

impl CsvFormatter {
    pub fn new(dest: &str, cumulative: bool) -> Self {
        Self {
            dest: Destination::parse(dest),
            cumulative,
            sink: None,
            end_offset: None,
            rows: 0,
        }
    }

    /// Data lines written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn padded(tick: Tick) -> String {
        format!("{:<width$}", tick, width = TICK_FIELD_WIDTH)
    }

    fn header_line(&self, report: &Report, ctx: &FormatContext) -> (String, usize) {
        let mut line = format!("# name={}, start={}, end=", report.name(), Self::padded(report.start_tick()));
        let end_pos = line.len();
        line.push_str(&Self::padded(report.end_tick()));
        line.push_str(&format!(", report_format={}", self.format().as_str()));
        for (key, value) in ctx.siminfo.header_pairs() {
            line.push_str(&format!(", {}={}", key, value));
        }
        for (key, value) in report.header().iter() {
            line.push_str(&format!(", {}={}", key, value));
        }
        line.push('\n');
        (line, end_pos)
    }
}

impl ReportFormatter for CsvFormatter {
    fn format(&self) -> ReportFormat {
        if self.cumulative {
            ReportFormat::CsvCumulative
        } else {
            ReportFormat::Csv
        }
    }

    fn write_header(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        let mut sink = self.dest.open()?;
        let (header, end_pos) = self.header_line(report, ctx);
        sink.write_all(header.as_bytes())?;
        let columns: Vec<String> = report.flatten().into_iter().map(|(name, _)| name).collect();
        writeln!(sink, "{}", columns.join(","))?;
        self.end_offset = Some(end_pos as u64);
        self.sink = Some(sink);
        Ok(())
    }

    fn write_update(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        if self.sink.is_none() {
            self.write_header(report, ctx)?;
        }
        let style = report.effective_style(&Default::default());
        let decimals = Report::decimal_places(&style);
        let values = report.collect_values()?;
        let line = values
            .iter()
            .map(|v| format_number(*v, true, decimals))
            .collect::<Vec<_>>()
            .join(",");
        if let Some(sink) = self.sink.as_mut() {
            writeln!(sink, "{}", line)?;
        }
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        if self.sink.is_none() {
            self.write_header(report, ctx)?;
        }
        let end = if report.end_tick() == st_common::TICK_MAX {
            report.scheduler().current_tick()
        } else {
            report.end_tick()
        };
        if let (Some(sink), Some(offset)) = (self.sink.as_mut(), self.end_offset) {
            sink.rewrite_at(offset, Self::padded(end).as_bytes())?;
            sink.flush()?;
        }
        self.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Scheduler};
    use crate::tree::{CounterBehavior, TreeNode};
    use st_common::SimulationInfo;
    use tempfile::tempdir;

    #[test]
    fn test_header_columns_rows_and_end_rewrite() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let c0 = root
            .add_child(TreeNode::counter("c0", "count", CounterBehavior::Normal))
            .unwrap();
        let mut report = Report::new("r", &sched).with_context(&root);
        report.add_expression("c0", None).unwrap();
        report.add_expression("c0 / 4", Some("quarter")).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let ctx = FormatContext::new(SimulationInfo::new("sim", "1.0"));
        let mut csv = CsvFormatter::new(path.to_str().unwrap(), false);
        csv.write_header(&report, &ctx).unwrap();
        c0.increment(2);
        csv.write_update(&report, &ctx).unwrap();
        c0.increment(1);
        csv.write_update(&report, &ctx).unwrap();
        sched.run_until(7);
        csv.finish(&report, &ctx).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# name=r, start=0 "));
        assert!(lines[0].contains(&format!("end={:<20},", 7)));
        assert!(lines[0].contains("report_format=csv, sim_name=sim"));
        assert_eq!(lines[1], "c0,quarter");
        assert_eq!(lines[2], "2,0.5");
        assert_eq!(lines[3], "3,0.75");
        assert_eq!(lines.len(), 4);
        assert_eq!(csv.rows_written(), 2);
    }

    #[test]
    fn test_cumulative_format_token() {
        let csv = CsvFormatter::new("1", true);
        assert_eq!(csv.format(), ReportFormat::CsvCumulative);
    }
}
