//! Statistic archives.
//!
//! An archive mirrors one report: every flattened statistic is a leaf with
//! a fixed index, and each report update appends one row of
//! `leaf_count` little-endian `f64` values to `values.bin`. The tree itself
//! (names, leaf indices, statistic metadata, context-counter groups) is
//! stored next to it in `archive_tree.bin`.
//!
//! ```text
//! <archive-dir>/
//!   archive_tree.bin
//!   values.bin
//! ```

mod replay;
mod series;

pub use replay::{ArchiveReplay, DbReplay};
pub use series::ArchiveDataSeries;

use crate::report::{Report, Style};
use crate::stat::SnapshotRow;
use serde::{Deserialize, Serialize};
use st_common::{Error, Result, SimulationInfo, StatClass, Visibility};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

pub const VALUES_FILE: &str = "values.bin";
pub const TREE_FILE: &str = "archive_tree.bin";
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Bytes per stored value.
pub const VALUE_BYTES: usize = std::mem::size_of::<f64>();

/// One archived statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveLeaf {
    pub name: String,
    pub leaf_index: usize,
    pub location: String,
    pub desc: String,
    pub visibility: Visibility,
    pub class: StatClass,
    pub expression: String,
}

/// One archived report or subreport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveNode {
    pub name: String,
    pub stats: Vec<ArchiveLeaf>,
    pub subreports: Vec<ArchiveNode>,
    /// Context-counter groups by local statistic index.
    pub groups: BTreeMap<usize, Vec<usize>>,
    pub style: Style,
}

impl ArchiveNode {
    /// Mirror `report`, numbering leaves depth first from `next`.
    pub fn from_report(report: &Report, next: &mut usize) -> Self {
        let stats = report
            .statistics()
            .iter()
            .map(|s| {
                let leaf = ArchiveLeaf {
                    name: s.name.clone(),
                    leaf_index: *next,
                    location: s.si.location().to_string(),
                    desc: s.si.desc().to_string(),
                    visibility: s.si.visibility(),
                    class: s.si.class().clone(),
                    expression: s.si.expression_string(),
                };
                *next += 1;
                leaf
            })
            .collect();
        let subreports = report
            .subreports()
            .iter()
            .map(|sub| ArchiveNode::from_report(sub, next))
            .collect();
        Self {
            name: report.name().to_string(),
            stats,
            subreports,
            groups: report.context_groups().clone(),
            style: report.style().clone(),
        }
    }

    /// Leaves in row order.
    pub fn leaves(&self) -> Vec<&ArchiveLeaf> {
        let mut out: Vec<&ArchiveLeaf> = self.stats.iter().collect();
        for sub in &self.subreports {
            out.extend(sub.leaves());
        }
        out
    }
}

/// Contents of `archive_tree.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveTree {
    pub format_version: u32,
    pub leaf_count: usize,
    pub start_tick: u64,
    pub siminfo: Option<SimulationInfo>,
    pub root: ArchiveNode,
}

impl ArchiveTree {
    pub fn from_report(report: &Report, siminfo: Option<SimulationInfo>) -> Self {
        let mut next = 0;
        let root = ArchiveNode::from_report(report, &mut next);
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            leaf_count: next,
            start_tick: report.start_tick(),
            siminfo,
            root,
        }
    }

    /// Bytes per row.
    pub fn row_bytes(&self) -> usize {
        self.leaf_count * VALUE_BYTES
    }

    /// Leaf whose flattened (dotted) name is `name`.
    pub fn find_leaf(&self, name: &str) -> Option<&ArchiveLeaf> {
        fn go<'a>(node: &'a ArchiveNode, prefix: &str, name: &str) -> Option<&'a ArchiveLeaf> {
            for leaf in &node.stats {
                if format!("{}{}", prefix, leaf.name) == name {
                    return Some(leaf);
                }
            }
            node.subreports
                .iter()
                .find_map(|sub| go(sub, &format!("{}{}.", prefix, sub.name), name))
        }
        go(&self.root, "", name)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::db(format!("cannot encode archive tree: {}", e)))?;
        fs::write(dir.join(TREE_FILE), bytes)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TREE_FILE);
        let bytes = fs::read(&path)?;
        let (tree, _): (ArchiveTree, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::db(format!("cannot decode '{}': {}", path.display(), e)))?;
        if tree.format_version != ARCHIVE_FORMAT_VERSION {
            return Err(Error::db(format!(
                "'{}' has archive format {}, expected {}",
                path.display(),
                tree.format_version,
                ARCHIVE_FORMAT_VERSION
            )));
        }
        Ok(tree)
    }
}

/// Rows currently stored in `values.bin`.
pub(crate) fn stored_rows(dir: &Path, row_bytes: usize) -> Result<u64> {
    let len = match fs::metadata(dir.join(VALUES_FILE)) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    if row_bytes == 0 {
        return Ok(0);
    }
    if len % row_bytes as u64 != 0 {
        warn!(
            dir = %dir.display(),
            len,
            row_bytes,
            "Archive values file ends with a partial row; ignoring it"
        );
    }
    Ok(len / row_bytes as u64)
}

/// Appends report rows to an archive directory.
pub struct ArchiveWriter {
    dir: PathBuf,
    tree: ArchiveTree,
    row: SnapshotRow,
    tokens: Vec<Weak<()>>,
    file: BufWriter<File>,
    rows: u64,
}

impl ArchiveWriter {
    /// Create (or truncate) an archive for `report` and register a snapshot
    /// sink on each of its statistics.
    pub fn create(dir: impl AsRef<Path>, report: &mut Report, siminfo: Option<SimulationInfo>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let tree = ArchiveTree::from_report(report, siminfo);
        tree.save(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(VALUES_FILE))?;

        let row: SnapshotRow = Rc::new(RefCell::new(vec![f64::NAN; tree.leaf_count]));
        let mut tokens = Vec::with_capacity(tree.leaf_count);
        report.for_each_stat_mut(&mut |idx, si| tokens.push(si.add_snapshot_sink(Rc::clone(&row), idx)));
        debug!(dir = %dir.display(), leaves = tree.leaf_count, "Archive created");
        Ok(Self {
            dir,
            tree,
            row,
            tokens,
            file: BufWriter::new(file),
            rows: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tree(&self) -> &ArchiveTree {
        &self.tree
    }

    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Statistics whose sink is still registered.
    pub fn live_sink_count(&self) -> usize {
        self.tokens.iter().filter(|t| t.strong_count() > 0).count()
    }

    /// Append the values last written by the snapshot sinks.
    pub fn write_row(&mut self) -> Result<()> {
        let row = self.row.borrow();
        let mut bytes = Vec::with_capacity(row.len() * VALUE_BYTES);
        for v in row.iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.file.write_all(&bytes)?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("dir", &self.dir)
            .field("leaves", &self.tree.leaf_count)
            .field("rows", &self.rows)
            .finish()
    }
}

/// Access to one archive directory.
pub trait ArchiveController {
    fn dir(&self) -> &Path;
    fn tree(&self) -> &ArchiveTree;
    fn is_read_only(&self) -> bool;

    /// Make written rows visible to readers and invalidate cached series.
    fn synchronize(&mut self) -> Result<()>;

    /// Data series of leaf `leaf_index`.
    fn series(&self, leaf_index: usize) -> Result<ArchiveDataSeries>;

    /// Copy the archive to `dest`, replacing whatever is there.
    fn save_to(&mut self, dest: &Path) -> Result<()>;
}

fn copy_archive(src: &Path, dest: &Path) -> Result<()> {
    if src == dest {
        return Ok(());
    }
    if dest.exists() {
        if let Err(e) = fs::remove_dir_all(dest) {
            warn!(dest = %dest.display(), error = %e, "Could not clear archive destination");
        }
    }
    fs::create_dir_all(dest)?;
    for name in [TREE_FILE, VALUES_FILE] {
        fs::copy(src.join(name), dest.join(name))?;
    }
    info!(from = %src.display(), to = %dest.display(), "Archive saved");
    Ok(())
}

fn series_for(dir: &Path, tree: &ArchiveTree, leaf_index: usize, generation: &Rc<Cell<u64>>) -> Result<ArchiveDataSeries> {
    if leaf_index >= tree.leaf_count {
        return Err(Error::IllegalOperation(format!(
            "archive has {} leaves; no leaf {}",
            tree.leaf_count, leaf_index
        )));
    }
    Ok(ArchiveDataSeries::new(
        dir.join(VALUES_FILE),
        leaf_index,
        tree.leaf_count,
        Rc::clone(generation),
    ))
}

/// Controller over an archive being written by this simulation.
pub struct LiveArchiveController {
    writer: ArchiveWriter,
    generation: Rc<Cell<u64>>,
}

impl LiveArchiveController {
    pub fn new(writer: ArchiveWriter) -> Self {
        Self {
            writer,
            generation: Rc::new(Cell::new(0)),
        }
    }

    pub fn writer(&self) -> &ArchiveWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut ArchiveWriter {
        &mut self.writer
    }
}

impl ArchiveController for LiveArchiveController {
    fn dir(&self) -> &Path {
        self.writer.dir()
    }

    fn tree(&self) -> &ArchiveTree {
        self.writer.tree()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn synchronize(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.generation.set(self.generation.get() + 1);
        Ok(())
    }

    fn series(&self, leaf_index: usize) -> Result<ArchiveDataSeries> {
        series_for(self.writer.dir(), self.writer.tree(), leaf_index, &self.generation)
    }

    /// Flush, then copy; the live directory keeps receiving rows.
    fn save_to(&mut self, dest: &Path) -> Result<()> {
        self.synchronize()?;
        copy_archive(self.writer.dir(), dest)
    }
}

/// Read-only controller over an archive on disk.
pub struct OfflineArchiveController {
    dir: PathBuf,
    tree: ArchiveTree,
    generation: Rc<Cell<u64>>,
}

impl OfflineArchiveController {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let tree = ArchiveTree::load(&dir)?;
        Ok(Self {
            dir,
            tree,
            generation: Rc::new(Cell::new(0)),
        })
    }

    pub fn row_count(&self) -> Result<u64> {
        stored_rows(&self.dir, self.tree.row_bytes())
    }
}

impl ArchiveController for OfflineArchiveController {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn tree(&self) -> &ArchiveTree {
        &self.tree
    }

    fn is_read_only(&self) -> bool {
        true
    }

    /// Nothing is written; readers only need a fresh look at the file.
    fn synchronize(&mut self) -> Result<()> {
        self.generation.set(self.generation.get() + 1);
        Ok(())
    }

    fn series(&self, leaf_index: usize) -> Result<ArchiveDataSeries> {
        series_for(&self.dir, &self.tree, leaf_index, &self.generation)
    }

    fn save_to(&mut self, dest: &Path) -> Result<()> {
        copy_archive(&self.dir, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Clock, Scheduler};
    use crate::tree::{CounterBehavior, TreeNode};
    use tempfile::tempdir;

    fn report_with_subreport(sched: &Rc<Scheduler>, root: &Rc<TreeNode>) -> Report {
        let mut report = Report::new("r", sched).with_context(root);
        report.add_expression("a", None).unwrap();
        let mut sub = Report::new("s", sched).with_context(root);
        sub.add_expression("a + 100", Some("shifted")).unwrap();
        report.add_subreport(sub);
        report.add_expression("a * 2", Some("twice")).unwrap();
        report
    }

    #[test]
    fn test_tree_leaf_order_and_roundtrip() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        root.add_child(TreeNode::counter("a", "alpha", CounterBehavior::Normal))
            .unwrap();
        let report = report_with_subreport(&sched, &root);
        let tree = ArchiveTree::from_report(&report, Some(SimulationInfo::new("sim", "2")));
        let names: Vec<(&str, usize)> = tree
            .root
            .leaves()
            .into_iter()
            .map(|l| (l.name.as_str(), l.leaf_index))
            .collect();
        assert_eq!(names, vec![("a", 0), ("twice", 1), ("shifted", 2)]);
        assert_eq!(tree.find_leaf("s.shifted").unwrap().leaf_index, 2);
        assert_eq!(tree.row_bytes(), 24);

        let dir = tempdir().unwrap();
        tree.save(dir.path()).unwrap();
        assert_eq!(ArchiveTree::load(dir.path()).unwrap(), tree);
    }

    #[test]
    fn test_values_file_grows_by_one_row_per_update() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        let a = root
            .add_child(TreeNode::counter("a", "alpha", CounterBehavior::Normal))
            .unwrap();
        let mut report = report_with_subreport(&sched, &root);
        let dir = tempdir().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("arch"), &mut report, None).unwrap();
        assert_eq!(writer.live_sink_count(), 3);

        for k in 1..=4u64 {
            a.increment(1);
            report.collect_values().unwrap();
            writer.write_row().unwrap();
            writer.flush().unwrap();
            let len = fs::metadata(dir.path().join("arch").join(VALUES_FILE)).unwrap().len();
            assert_eq!(len, k * 24);
        }
        assert_eq!(writer.rows_written(), 4);
    }

    #[test]
    fn test_offline_save_replaces_destination() {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        root.add_child(TreeNode::counter("a", "alpha", CounterBehavior::Normal))
            .unwrap();
        let mut report = report_with_subreport(&sched, &root);
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let mut live = LiveArchiveController::new(ArchiveWriter::create(&src, &mut report, None).unwrap());
        report.collect_values().unwrap();
        live.writer_mut().write_row().unwrap();
        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.txt"), "old").unwrap();
        live.save_to(&dest).unwrap();
        assert!(!dest.join("stale.txt").exists());

        let mut offline = OfflineArchiveController::open(&dest).unwrap();
        assert!(offline.is_read_only());
        assert_eq!(offline.row_count().unwrap(), 1);
        let copy = dir.path().join("copy");
        offline.save_to(&copy).unwrap();
        assert!(copy.join(VALUES_FILE).exists());
        assert!(offline.series(3).is_err());
    }
}
