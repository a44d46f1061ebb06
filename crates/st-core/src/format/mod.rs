//! Report output formats.
//!
//! Every formatter walks the report in flattened order (stats before
//! subreports, depth first). Formats that support updates write one record
//! per report update; the structured formats write one document when the
//! report is finished.
//!
//! Destination `1` is standard output; anything else is a path.

mod columnar;
mod csv;
mod json;
mod text;

pub use columnar::{column_names, storage_name, ColumnarFormatter, TICK_COLUMN};
pub use csv::CsvFormatter;
pub use json::{JsonFormatter, JsonStyle, StatsMappingFormatter, JSON_REPORT_VERSION};
pub use text::TextFormatter;

use crate::report::{Report, ReportDbIds};
use chrono::Utc;
use serde_json::Value;
use st_common::{format_number, Result, SimulationInfo};
use st_config::{ReportFormat, STDOUT_DESTINATION};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Explicit inputs shared by every formatter.
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub siminfo: SimulationInfo,
    /// Free-form `report_metadata` entries.
    pub metadata: BTreeMap<String, String>,
}

impl FormatContext {
    pub fn new(siminfo: SimulationInfo) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("Created".to_string(), Utc::now().to_rfc3339());
        Self { siminfo, metadata }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A report writer.
pub trait ReportFormatter {
    fn format(&self) -> ReportFormat;

    /// Whether `write_update` produces output.
    fn supports_updates(&self) -> bool {
        self.format().supports_updates()
    }

    /// Called once before the first update.
    fn write_header(&mut self, report: &Report, ctx: &FormatContext) -> Result<()>;

    /// Record the current values of `report`.
    fn write_update(&mut self, report: &Report, ctx: &FormatContext) -> Result<()>;

    /// Called once when the report is saved.
    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()>;

    /// Database record range written so far, for formats that keep one.
    fn db_ids(&self) -> Option<ReportDbIds> {
        None
    }
}

/// Build the formatter for `format` writing to `dest`.
pub fn create_formatter(format: ReportFormat, dest: &str) -> Result<Box<dyn ReportFormatter>> {
    Ok(match format {
        ReportFormat::Csv => Box::new(CsvFormatter::new(dest, false)),
        ReportFormat::CsvCumulative => Box::new(CsvFormatter::new(dest, true)),
        ReportFormat::Json => Box::new(JsonFormatter::new(dest, JsonStyle::Full)),
        ReportFormat::JsonReduced => Box::new(JsonFormatter::new(dest, JsonStyle::Reduced)),
        ReportFormat::JsonDetail => Box::new(JsonFormatter::new(dest, JsonStyle::Detail)),
        ReportFormat::StatsMapping => Box::new(StatsMappingFormatter::new(dest)),
        ReportFormat::Text => Box::new(TextFormatter::new(dest)),
        ReportFormat::Columnar => Box::new(ColumnarFormatter::new(dest)),
    })
}

// ----------------------------------------------------------------------------
// Destinations
// ----------------------------------------------------------------------------

/// Where a formatter writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl Destination {
    pub fn parse(dest: &str) -> Self {
        if dest.trim() == STDOUT_DESTINATION {
            Destination::Stdout
        } else {
            Destination::File(PathBuf::from(dest.trim()))
        }
    }

    pub fn is_stdout(&self) -> bool {
        matches!(self, Destination::Stdout)
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Destination::Stdout => None,
            Destination::File(p) => Some(p),
        }
    }

    /// Open for writing, truncating files.
    pub(crate) fn open(&self) -> Result<OutputSink> {
        Ok(match self {
            Destination::Stdout => OutputSink::Stdout(io::stdout()),
            Destination::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                OutputSink::File(BufWriter::new(File::create(path)?))
            }
        })
    }

    /// Write a whole document at once.
    pub(crate) fn write_all(&self, text: &str) -> Result<()> {
        let mut sink = self.open()?;
        sink.write_all(text.as_bytes())?;
        sink.flush()?;
        Ok(())
    }
}

/// Open output stream of a formatter.
pub(crate) enum OutputSink {
    Stdout(io::Stdout),
    File(BufWriter<File>),
}

impl OutputSink {
    /// Overwrite `bytes` at absolute `offset`, then return to the end.
    ///
    /// No-op for standard output.
    pub(crate) fn rewrite_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        match self {
            OutputSink::Stdout(_) => Ok(()),
            OutputSink::File(w) => {
                w.flush()?;
                let file = w.get_mut();
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)?;
                file.seek(SeekFrom::End(0))?;
                Ok(())
            }
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::Stdout(s) => s.write(buf),
            OutputSink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Stdout(s) => s.flush(),
            OutputSink::File(f) => f.flush(),
        }
    }
}

// ----------------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------------

/// JSON value for a statistic. Non-finite values use their text form.
pub(crate) fn json_number(val: f64) -> Value {
    if !val.is_finite() {
        return Value::String(format_number(val, true, 0));
    }
    if val.fract() == 0.0 && val.abs() < 9.0e15 {
        return Value::from(val as i64);
    }
    Value::from(val)
}

/// Indices of the report's own statistics that a context-counter
/// aggregate already covers.
pub(crate) fn grouped_members(report: &Report) -> std::collections::HashSet<usize> {
    report
        .context_groups()
        .values()
        .flat_map(|m| m.iter().copied())
        .collect()
}

/// Member key of a grouped statistic: its name without the aggregate prefix.
pub(crate) fn member_key<'a>(aggregate: &str, member: &'a str) -> &'a str {
    member
        .strip_prefix(aggregate)
        .and_then(|r| r.strip_prefix('.'))
        .unwrap_or(member)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_parse() {
        assert!(Destination::parse("1").is_stdout());
        assert!(Destination::parse(" 1 ").is_stdout());
        assert_eq!(
            Destination::parse("out/r.csv").path(),
            Some(Path::new("out/r.csv"))
        );
    }

    #[test]
    fn test_json_number() {
        assert_eq!(json_number(3.0), Value::from(3));
        assert_eq!(json_number(-2.5), Value::from(-2.5));
        assert_eq!(json_number(f64::NAN), Value::from("nan"));
        assert_eq!(json_number(f64::NEG_INFINITY), Value::from("-inf"));
    }

    #[test]
    fn test_member_key() {
        assert_eq!(member_key("total", "total.busy"), "busy");
        assert_eq!(member_key("total", "other"), "other");
    }

    #[test]
    fn test_create_formatter_matches_format() {
        for format in [
            ReportFormat::Csv,
            ReportFormat::CsvCumulative,
            ReportFormat::Json,
            ReportFormat::JsonReduced,
            ReportFormat::JsonDetail,
            ReportFormat::StatsMapping,
            ReportFormat::Text,
            ReportFormat::Columnar,
        ] {
            let f = create_formatter(format, "1").unwrap();
            assert_eq!(f.format(), format);
            assert_eq!(f.supports_updates(), format.supports_updates());
        }
    }
}
