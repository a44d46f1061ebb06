//! Post-mortem replay: rebuild a report whose statistics read stored rows.

use super::{stored_rows, ArchiveNode, ArchiveTree, VALUES_FILE, VALUE_BYTES};
use crate::format::column_names;
use crate::report::Report;
use crate::sched::Scheduler;
use crate::stat::{ProvidedMetadata, SnapshotRow, StatisticInstance};
use st_common::{Error, Result};
use st_telemetry::{ColumnarConnProxy, ObjectManager};
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Report of direct-lookup statistics over `row`, shaped like `node`.
fn replay_report(node: &ArchiveNode, row: &SnapshotRow, scheduler: &Rc<Scheduler>) -> Result<Report> {
    let mut report = Report::new(&node.name, scheduler);
    report.extend_style(&node.style);
    for leaf in &node.stats {
        let si = StatisticInstance::direct_lookup(
            Rc::clone(row),
            leaf.leaf_index,
            ProvidedMetadata {
                location: Some(leaf.location.clone()),
                desc: Some(leaf.desc.clone()),
                visibility: Some(leaf.visibility),
                class: Some(leaf.class.clone()),
                expression: Some(leaf.expression.clone()),
            },
        );
        report.add(si, Some(&leaf.name))?;
    }
    for (aggregate, members) in &node.groups {
        report.set_db_sub_stat_group(*aggregate, members.clone());
    }
    for sub in &node.subreports {
        let sub = replay_report(sub, row, scheduler)?;
        report.add_subreport(sub);
    }
    Ok(report)
}

/// Replays an archive directory.
pub struct ArchiveReplay {
    dir: PathBuf,
    tree: ArchiveTree,
    row: SnapshotRow,
    report: Report,
    rows: u64,
    current: Option<u64>,
}

impl ArchiveReplay {
    pub fn open(dir: impl AsRef<Path>, scheduler: &Rc<Scheduler>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let tree = ArchiveTree::load(&dir)?;
        let rows = stored_rows(&dir, tree.row_bytes())?;
        let row: SnapshotRow = Rc::new(RefCell::new(vec![f64::NAN; tree.leaf_count]));
        let report = replay_report(&tree.root, &row, scheduler)?;
        Ok(Self {
            dir,
            tree,
            row,
            report,
            rows,
            current: None,
        })
    }

    pub fn tree(&self) -> &ArchiveTree {
        &self.tree
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn row_count(&self) -> u64 {
        self.rows
    }

    pub fn current_row(&self) -> Option<u64> {
        self.current
    }

    /// Load row `row` into the replay statistics.
    pub fn seek(&mut self, row: u64) -> Result<()> {
        if row >= self.rows {
            return Err(Error::IllegalOperation(format!(
                "archive '{}' has {} rows; cannot seek to row {}",
                self.dir.display(),
                self.rows,
                row
            )));
        }
        let row_bytes = self.tree.row_bytes();
        let mut file = File::open(self.dir.join(VALUES_FILE))?;
        file.seek(SeekFrom::Start(row * row_bytes as u64))?;
        let mut bytes = vec![0u8; row_bytes];
        file.read_exact(&mut bytes)?;
        let mut values = self.row.borrow_mut();
        for (slot, chunk) in values.iter_mut().zip(bytes.chunks_exact(VALUE_BYTES)) {
            let mut b = [0u8; VALUE_BYTES];
            b.copy_from_slice(chunk);
            *slot = f64::from_le_bytes(b);
        }
        self.current = Some(row);
        Ok(())
    }
}

/// Replays a report from its columnar database records.
pub struct DbReplay {
    manager: ObjectManager,
    table: String,
    columns: Vec<String>,
    first_record: u64,
    record_count: u64,
    row: SnapshotRow,
    report: Report,
}

impl DbReplay {
    /// `template` is the report that was written; its cached database ids
    /// locate the records.
    pub fn open(db_dir: impl AsRef<Path>, template: &Report) -> Result<Self> {
        let ids = template.db_ids().cloned().ok_or_else(|| {
            Error::IllegalOperation(format!(
                "report '{}' has no database ids; it was not written to a columnar database",
                template.name()
            ))
        })?;
        let db_dir = db_dir.as_ref();
        let mut manager = ObjectManager::new(Box::new(ColumnarConnProxy::new(db_dir)));
        manager.connect_to_existing_database(db_dir)?;
        let mut next = 0;
        let node = ArchiveNode::from_report(template, &mut next);
        let row: SnapshotRow = Rc::new(RefCell::new(vec![f64::NAN; next]));
        let report = replay_report(&node, &row, template.scheduler())?;
        Ok(Self {
            manager,
            table: ids.table,
            columns: column_names(template),
            first_record: ids.first_record,
            record_count: ids.record_count,
            row,
            report,
        })
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn row_count(&self) -> u64 {
        self.record_count
    }

    /// Load the `row`-th record written for the report.
    pub fn seek(&mut self, row: u64) -> Result<()> {
        if row >= self.record_count {
            return Err(Error::IllegalOperation(format!(
                "table '{}' holds {} records for this report; cannot seek to {}",
                self.table, self.record_count, row
            )));
        }
        let id = self.first_record + row;
        if !self.manager.has_object(&self.table, id) {
            return Err(Error::db(format!("record {} missing from table '{}'", id, self.table)));
        }
        let mut values = self.row.borrow_mut();
        for (slot, column) in values.iter_mut().zip(&self.columns) {
            *slot = self
                .manager
                .read_field_f64(&self.table, column, id)
                .unwrap_or(f64::NAN);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveController, ArchiveWriter, LiveArchiveController, OfflineArchiveController};
    use crate::format::{ColumnarFormatter, FormatContext, ReportFormatter};
    use crate::sched::Clock;
    use crate::tree::{CounterBehavior, TreeNode};
    use st_common::Visibility;
    use tempfile::tempdir;

    struct Model {
        _root: Rc<TreeNode>,
        sched: Rc<Scheduler>,
        a: Rc<TreeNode>,
        report: Report,
    }

    fn model() -> Model {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let a = root
            .add_child(TreeNode::counter("a", "alpha", CounterBehavior::Normal).with_visibility(Visibility::Summary))
            .unwrap();
        let b = root
            .add_child(TreeNode::counter("b", "beta", CounterBehavior::Normal))
            .unwrap();
        let total = root
            .add_child(TreeNode::statistic_def("total", "a plus b", "a + b"))
            .unwrap();
        total.add_sub_statistic(&a, "a").unwrap();
        total.add_sub_statistic(&b, "b").unwrap();
        let mut report = Report::new("r", &sched).with_context(&root);
        report.add_expression("total", None).unwrap();
        let mut sub = Report::new("s", &sched).with_context(&root);
        sub.add_expression("a * 3", Some("triple")).unwrap();
        report.add_subreport(sub);
        Model {
            _root: root,
            sched,
            a,
            report,
        }
    }

    #[test]
    fn test_archive_write_reopen_read_matches() {
        let mut m = model();
        let dir = tempdir().unwrap();
        let arch = dir.path().join("arch");
        let mut live = LiveArchiveController::new(ArchiveWriter::create(&arch, &mut m.report, None).unwrap());
        let mut written = Vec::new();
        for _ in 0..5 {
            m.a.increment(2);
            written.push(m.report.collect_values().unwrap());
            live.writer_mut().write_row().unwrap();
            m.sched.run_tick();
        }
        live.synchronize().unwrap();

        let offline = OfflineArchiveController::open(&arch).unwrap();
        let leaves = offline.tree().leaf_count;
        for leaf in 0..leaves {
            let series = offline.series(leaf).unwrap();
            let data = series.data().unwrap();
            for (k, row) in written.iter().enumerate() {
                assert_eq!(data[k], row[leaf], "leaf {} update {}", leaf, k);
            }
        }

        let mut replay = ArchiveReplay::open(&arch, &m.sched).unwrap();
        assert_eq!(replay.row_count(), 5);
        replay.seek(2).unwrap();
        assert_eq!(replay.report().collect_values().unwrap(), written[2]);
        assert!(replay.seek(5).is_err());
        let groups = replay.report().context_groups();
        assert_eq!(groups.get(&0), Some(&vec![1, 2]));
        let a = replay.report().stat("total.a").unwrap();
        assert_eq!(a.visibility(), Visibility::Summary);
        assert_eq!(a.desc(), "alpha");
    }

    #[test]
    fn test_db_replay_reads_records() {
        let m = model();
        let dir = tempdir().unwrap();
        let db = dir.path().join("db");
        let ctx = FormatContext::default();
        let mut fmt = ColumnarFormatter::new(db.to_str().unwrap());
        let mut written = Vec::new();
        for _ in 0..3 {
            m.a.increment(1);
            written.push(m.report.collect_values().unwrap());
            fmt.write_update(&m.report, &ctx).unwrap();
        }
        fmt.finish(&m.report, &ctx).unwrap();
        let mut report = m.report.clone();
        assert!(DbReplay::open(&db, &report).is_err());
        report.set_db_ids(fmt.db_ids().unwrap());

        let mut replay = DbReplay::open(&db, &report).unwrap();
        assert_eq!(replay.row_count(), 3);
        replay.seek(1).unwrap();
        assert_eq!(replay.report().collect_values().unwrap(), written[1]);
    }
}
