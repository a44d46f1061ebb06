//! Columnar database output.
//!
//! One row table per report, named after it: a `tick` column followed by
//! one `Double` column per flattened statistic. Each update appends one
//! fixed-size record; the `<table>_Summary` sibling gets one row of
//! min/max/avg per column at finish, computed from the stored records.

use super::{Destination, FormatContext, ReportFormatter};
use crate::report::{Report, ReportDbIds};
use st_common::{Error, Result};
use st_config::ReportFormat;
use st_telemetry::{
    ColumnDataType, ColumnValue, ColumnarConnProxy, ObjectFactories, ObjectManager, Schema, SUMMARY_SUFFIX,
};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Name of the tick column of every report table.
pub const TICK_COLUMN: &str = "tick";

pub struct ColumnarFormatter {
    dir: Option<PathBuf>,
    table: String,
    columns: Vec<String>,
    manager: Option<ObjectManager>,
    factories: Option<ObjectFactories>,
    first_record: Option<u64>,
    record_count: u64,
}

/// Table / column name usable as a file and field name.
pub fn storage_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "report".to_string()
    } else {
        cleaned
    }
}

/// Storage column names for a report's flattened statistics, made unique
/// and kept clear of the tick column.
pub fn column_names(report: &Report) -> Vec<String> {
    let mut seen = HashSet::new();
    seen.insert(TICK_COLUMN.to_string());
    report
        .flatten()
        .into_iter()
        .map(|(name, _)| {
            let base = storage_name(&name);
            let mut unique = base.clone();
            let mut n = 1;
            while !seen.insert(unique.clone()) {
                unique = format!("{}_{}", base, n);
                n += 1;
            }
            unique
        })
        .collect()
}

impl ColumnarFormatter {
    /// `dest` is the database directory.
    pub fn new(dest: &str) -> Self {
        Self {
            dir: Destination::parse(dest).path().map(PathBuf::from),
            table: String::new(),
            columns: Vec::new(),
            manager: None,
            factories: None,
            first_record: None,
            record_count: 0,
        }
    }

    /// Table holding the report's records.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Storage column names, in flattened statistic order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn schema_for(&mut self, report: &Report) -> Result<Schema> {
        self.table = storage_name(report.name());
        self.columns = column_names(report);

        let mut schema = Schema::with_default_summaries();
        let table = schema.add_table(&self.table)?;
        table.add_column(TICK_COLUMN, ColumnDataType::UInt64).no_summary();
        for col in &self.columns {
            table.add_column(col, ColumnDataType::Double);
        }
        Ok(schema)
    }
}

impl ReportFormatter for ColumnarFormatter {
    fn format(&self) -> ReportFormat {
        ReportFormat::Columnar
    }

    fn write_header(&mut self, report: &Report, _ctx: &FormatContext) -> Result<()> {
        let dir = self.dir.clone().ok_or_else(|| {
            Error::IllegalOperation("columnar reports cannot be written to standard output".into())
        })?;
        let schema = self.schema_for(report)?;
        let mut manager = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir)));
        manager.create_database(schema)?;
        self.factories = Some(manager.factories(&self.table)?);
        self.manager = Some(manager);
        debug!(table = %self.table, columns = self.columns.len(), "Columnar report database created");
        Ok(())
    }

    fn write_update(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        if self.manager.is_none() {
            self.write_header(report, ctx)?;
        }
        let values = report.collect_values()?;
        let mut record = Vec::with_capacity(values.len() + 1);
        record.push(ColumnValue::UInt64(report.scheduler().current_tick()));
        record.extend(values.iter().map(|v| ColumnValue::Double(*v)));

        let (Some(manager), Some(factories)) = (self.manager.as_ref(), self.factories.as_ref()) else {
            return Err(Error::db("columnar report is not connected"));
        };
        let id = match &factories.fixed_size {
            Some(write_packed) => {
                let bytes = manager.table(&self.table)?.pack_values(&record)?;
                write_packed(&bytes)?
            }
            None => (factories.any_size)(&record)?,
        };
        self.first_record.get_or_insert(id);
        self.record_count += 1;
        Ok(())
    }

    fn finish(&mut self, report: &Report, ctx: &FormatContext) -> Result<()> {
        if self.manager.is_none() {
            self.write_header(report, ctx)?;
        }
        let Some(mut manager) = self.manager.take() else {
            return Ok(());
        };
        let summary = format!("{}{}", self.table, SUMMARY_SUFFIX);
        if manager.schema().table(&summary).is_some() {
            let first = self.first_record.unwrap_or(1);
            let ids = first..first + self.record_count;
            let row: Vec<ColumnValue> = manager
                .schema()
                .summary_values_with(&self.table, |column| {
                    Ok(ids
                        .clone()
                        .filter_map(|id| manager.read_field_f64(&self.table, column, id))
                        .collect())
                })?
                .into_iter()
                .map(ColumnValue::Double)
                .collect();
            let factories = manager.factories(&summary)?;
            (factories.any_size)(&row)?;
        }
        self.factories = None;
        manager.close()?;
        Ok(())
    }

    fn db_ids(&self) -> Option<ReportDbIds> {
        self.first_record.map(|first| ReportDbIds {
            table: self.table.clone(),
            first_record: first,
            record_count: self.record_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Scheduler};
    use crate::tree::{CounterBehavior, TreeNode};
    use tempfile::tempdir;

    #[test]
    fn test_storage_name() {
        assert_eq!(storage_name("Core Stats/0"), "Core_Stats_0");
        assert_eq!(storage_name(""), "report");
    }

    #[test]
    fn test_records_and_summary() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let c = root
            .add_child(TreeNode::counter("c", "count", CounterBehavior::Latest))
            .unwrap();
        let mut report = Report::new("perf", &sched).with_context(&root);
        report.add_expression("c", None).unwrap();
        report.add_expression("c * 2", Some("double")).unwrap();

        let dir = tempdir().unwrap();
        let db = dir.path().join("db");
        let ctx = FormatContext::default();
        let mut fmt = ColumnarFormatter::new(db.to_str().unwrap());
        fmt.write_header(&report, &ctx).unwrap();
        for v in [1u64, 5, 3] {
            c.set(v as f64);
            fmt.write_update(&report, &ctx).unwrap();
            sched.run_tick();
        }
        let ids = fmt.db_ids().unwrap();
        assert_eq!(ids.first_record, 1);
        assert_eq!(ids.record_count, 3);
        fmt.finish(&report, &ctx).unwrap();

        let mut reader = ObjectManager::new(Box::new(ColumnarConnProxy::new(&db)));
        reader.connect_to_existing_database(&db).unwrap();
        assert!(reader.has_object("perf", 3));
        assert!(!reader.has_object("perf", 4));
        assert_eq!(reader.read_field_f64("perf", "double", 2), Some(10.0));
        assert_eq!(reader.read_field_f64("perf", "tick", 3), Some(2.0));
        assert_eq!(reader.read_field_f64("perf_Summary", "c_max", 1), Some(5.0));
        assert_eq!(reader.read_field_f64("perf_Summary", "c_avg", 1), Some(3.0));
    }

    #[test]
    fn test_stdout_is_rejected() {
        let sched = Scheduler::new();
        let report = Report::new("r", &sched);
        let mut fmt = ColumnarFormatter::new("1");
        assert!(fmt.write_header(&report, &FormatContext::default()).is_err());
    }
}
