//! Report repository.
//!
//! The repository turns report descriptors into [`LiveReport`]s bound to a
//! device tree. Descriptors are queued with [`ReportRepository::add_descriptor`]
//! and instantiated as a batch by [`ReportRepository::commit`], which yields
//! a [`DirectoryHandle`] for the committed directory. Reports built in code
//! can join a directory with [`ReportRepository::add_report`].
//!
//! Lifecycle:
//! 1. Queue descriptors, commit directories
//! 2. [`ReportRepository::finalize`]: define tags, arm every trigger, check
//!    that every referenced tag exists
//! 3. Run the simulation
//! 4. [`ReportRepository::save_reports`]

mod live;

pub use live::{LiveReport, ReportStatus};

use crate::format::{storage_name, FormatContext};
use crate::report::Report;
use crate::sched::Scheduler;
use crate::trigger::{Edge, TagRegistry};
use crate::tree::TreeNode;
use st_common::{Error, Result};
use st_config::{load_descriptors, DefinitionSearchPath, ReportDescriptor, ReportFormat, TriggerBlock};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Handle to a committed report directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryHandle(usize);

impl DirectoryHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Reports committed together.
#[derive(Debug, Default)]
pub struct ReportDirectory {
    reports: Vec<LiveReport>,
}

impl ReportDirectory {
    pub fn reports(&self) -> &[LiveReport] {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

pub struct ReportRepository {
    root: Rc<TreeNode>,
    scheduler: Rc<Scheduler>,
    format_ctx: FormatContext,
    search: DefinitionSearchPath,
    pending: Vec<ReportDescriptor>,
    directories: Vec<ReportDirectory>,
    tags: TagRegistry,
    archive_root: Option<PathBuf>,
    finalized: bool,
}

impl ReportRepository {
    /// Repository over the tree rooted at `root`; the scheduler is taken
    /// from the root's clock.
    pub fn new(root: &Rc<TreeNode>, format_ctx: FormatContext) -> Result<Self> {
        let clock = root
            .clock()
            .ok_or_else(|| Error::config(format!("tree root '{}' has no clock", root.location())))?;
        Ok(Self {
            root: Rc::clone(root),
            scheduler: Rc::clone(clock.scheduler()),
            format_ctx,
            search: DefinitionSearchPath::from_env(),
            pending: Vec::new(),
            directories: Vec::new(),
            tags: TagRegistry::new(),
            archive_root: None,
            finalized: false,
        })
    }

    /// Replace the definition-file search path.
    pub fn with_search_path(mut self, search: DefinitionSearchPath) -> Self {
        self.search = search;
        self
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    pub fn tags(&self) -> &TagRegistry {
        &self.tags
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::IllegalOperation(format!(
                "cannot {} after the repository was finalized",
                what
            )));
        }
        Ok(())
    }

    /// Queue a descriptor for the next commit.
    pub fn add_descriptor(&mut self, descriptor: ReportDescriptor) {
        self.pending.push(descriptor);
    }

    pub fn add_descriptors(&mut self, descriptors: impl IntoIterator<Item = ReportDescriptor>) {
        self.pending.extend(descriptors);
    }

    /// Queue every descriptor of a descriptor document.
    pub fn load_descriptor_file(&mut self, path: &Path) -> Result<usize> {
        let descriptors = load_descriptors(path)?;
        let n = descriptors.len();
        self.add_descriptors(descriptors);
        Ok(n)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Capture every report into `<dir>/<report>` archives.
    pub fn enable_archives(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        self.ensure_open("enable archives")?;
        self.archive_root = Some(dir.into());
        Ok(())
    }

    /// Instantiate every queued descriptor into a new directory.
    ///
    /// Descriptors marked `skip` are dropped. A pattern that matches
    /// nothing is an error; nothing is committed in that case.
    pub fn commit(&mut self) -> Result<DirectoryHandle> {
        self.ensure_open("commit a directory")?;
        let pending = std::mem::take(&mut self.pending);
        let mut reports = Vec::with_capacity(pending.len());
        for descriptor in &pending {
            if descriptor.skip {
                debug!(report = %descriptor.display_name(), "Descriptor skipped");
                continue;
            }
            reports.push(self.build(descriptor)?);
        }
        let handle = DirectoryHandle(self.directories.len());
        info!(directory = handle.0, reports = reports.len(), "Report directory committed");
        self.directories.push(ReportDirectory { reports });
        Ok(handle)
    }

    fn build(&self, descriptor: &ReportDescriptor) -> Result<LiveReport> {
        let def = descriptor.definition(&self.search)?;
        let pattern = if descriptor.pattern.trim().is_empty() {
            def.pattern.clone().unwrap_or_default()
        } else {
            descriptor.pattern.clone()
        };
        let matches = self.root.find_pattern(&pattern)?;
        let report = match matches.as_slice() {
            [] => {
                return Err(Error::config(format!(
                    "pattern '{}' of report '{}' matches no node of the device tree",
                    pattern,
                    descriptor.display_name()
                )))
            }
            [(node, captures)] => Report::from_definition(&def, node, &self.scheduler, captures)?,
            many => {
                let mut top = Report::new(descriptor.display_name(), &self.scheduler).with_context(&self.root);
                top.set_trigger_block(def.trigger.clone());
                for (node, captures) in many {
                    let mut instance = Report::from_definition(&def, node, &self.scheduler, captures)?;
                    instance.set_trigger_block(None);
                    top.add_subreport(instance);
                }
                top
            }
        };
        let mut report = report;
        if let Some(name) = &descriptor.name {
            report.set_name(name.clone());
        }
        debug!(
            report = %report.name(),
            pattern = %pattern,
            format = %descriptor.format,
            dest = %descriptor.dest_file,
            "Report built from descriptor"
        );
        LiveReport::new(
            report,
            descriptor.format,
            &descriptor.dest_file,
            &descriptor.triggers,
            self.format_ctx.clone(),
        )
    }

    /// Add a report built in code to a committed directory.
    pub fn add_report(
        &mut self,
        directory: DirectoryHandle,
        report: Report,
        format: ReportFormat,
        dest: &str,
        triggers: &TriggerBlock,
    ) -> Result<LiveReport> {
        self.ensure_open("add a report")?;
        let live = LiveReport::new(report, format, dest, triggers, self.format_ctx.clone())?;
        let dir = self
            .directories
            .get_mut(directory.0)
            .ok_or_else(|| Error::IllegalOperation(format!("unknown report directory {}", directory.0)))?;
        dir.reports.push(live.clone());
        Ok(live)
    }

    pub fn directory(&self, handle: DirectoryHandle) -> Option<&ReportDirectory> {
        self.directories.get(handle.0)
    }

    /// Every report in registration order.
    pub fn reports(&self) -> Vec<LiveReport> {
        self.directories
            .iter()
            .flat_map(|d| d.reports.iter().cloned())
            .collect()
    }

    pub fn report(&self, name: &str) -> Option<LiveReport> {
        self.directories
            .iter()
            .flat_map(|d| d.reports.iter())
            .find(|r| r.name() == name)
            .cloned()
    }

    /// Arm every trigger.
    ///
    /// Tags are defined before anything is armed, so a report may
    /// reference a tag defined by a report registered after it. Reports
    /// without a start trigger begin immediately and publish their tag's
    /// start edge once every report is armed.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_open("finalize")?;
        if !self.pending.is_empty() {
            self.commit()?;
        }
        let reports = self.reports();
        for report in &reports {
            for tag in report.defined_tags() {
                self.tags.define(&tag)?;
            }
        }
        if let Some(root) = &self.archive_root {
            for report in &reports {
                let dir = root.join(storage_name(report.name()));
                report.enable_archive(&dir, Some(self.format_ctx.siminfo.clone()))?;
            }
        }
        let mut started = Vec::new();
        for report in &reports {
            started.extend(report.arm(&self.tags)?);
        }
        self.tags.validate()?;
        self.finalized = true;
        for tag in started {
            self.tags.fire(&tag, Edge::Start);
        }
        info!(reports = reports.len(), "Report repository finalized");
        Ok(())
    }

    /// Save every report. Every report is attempted; the first failure is
    /// returned.
    pub fn save_reports(&mut self) -> Result<()> {
        let mut first = None;
        for report in self.reports() {
            if let Some(err) = report.take_error() {
                warn!(report = %report.name(), error = %err, "Report recorded a runtime error");
            }
            if let Err(err) = report.save() {
                warn!(report = %report.name(), error = %err, "Failed to save report");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReportRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportRepository")
            .field("root", &self.root.location())
            .field("pending", &self.pending.len())
            .field("directories", &self.directories.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Clock;
    use crate::tree::CounterBehavior;
    use st_config::{ReportDefinition, TriggerKey};

    fn tree() -> (Rc<Scheduler>, Rc<TreeNode>) {
        let sched = Scheduler::new();
        let root = TreeNode::root("top", Clock::new("core", 1, &sched));
        for core in ["core0", "core1"] {
            let node = root.add_child(TreeNode::container(core)).unwrap();
            node.add_child(TreeNode::counter("retired", "retired", CounterBehavior::Normal))
                .unwrap();
        }
        (sched, root)
    }

    fn definition(text: &str) -> ReportDefinition {
        ReportDefinition::from_yaml_str(text).unwrap()
    }

    #[test]
    fn test_commit_builds_reports_and_skips() {
        let (_sched, root) = tree();
        let mut repo = ReportRepository::new(&root, FormatContext::default()).unwrap();
        let def = definition("name: cores\ncontent:\n  retired: r\n");
        repo.add_descriptor(ReportDescriptor::inline("top.core*", def.clone(), "1", ReportFormat::Text));
        let mut skipped = ReportDescriptor::inline("top.core0", def, "1", ReportFormat::Text);
        skipped.skip = true;
        repo.add_descriptor(skipped);

        let handle = repo.commit().unwrap();
        assert_eq!(repo.pending_count(), 0);
        let dir = repo.directory(handle).unwrap();
        assert_eq!(dir.len(), 1);
        let report = dir.reports()[0].report();
        assert_eq!(report.subreports().len(), 2);
        assert_eq!(report.leaf_count(), 2);
    }

    #[test]
    fn test_pattern_without_match_is_config_error() {
        let (_sched, root) = tree();
        let mut repo = ReportRepository::new(&root, FormatContext::default()).unwrap();
        let def = definition("content:\n  retired: r\n");
        repo.add_descriptor(ReportDescriptor::inline("top.gpu*", def, "1", ReportFormat::Text));
        let err = repo.commit().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_undefined_tag_fails_finalize() {
        let (_sched, root) = tree();
        let mut repo = ReportRepository::new(&root, FormatContext::default()).unwrap();
        let def = definition("content:\n  retired: r\n");
        repo.add_descriptor(
            ReportDescriptor::inline("top.core0", def, "1", ReportFormat::Text)
                .with_trigger(TriggerKey::Start, "t9.start"),
        );
        assert!(repo.finalize().is_err());
    }

    #[test]
    fn test_finalized_repository_rejects_changes() {
        let (sched, root) = tree();
        let mut repo = ReportRepository::new(&root, FormatContext::default()).unwrap();
        let handle = repo.commit().unwrap();
        repo.finalize().unwrap();
        let report = Report::new("late", &sched);
        assert!(repo
            .add_report(handle, report, ReportFormat::Text, "1", &TriggerBlock::new())
            .is_err());
        assert!(repo.commit().is_err());
    }
}
