//! Live statistic streams.
//!
//! A [`ReportStreamNode`] tree mirrors a report: one
//! [`StatisticInstStreamNode`] per flattened statistic, nested by
//! subreport. Only the root accepts listeners. Each report update pushes
//! the current row of values into every listener's queue; consumer threads
//! drain their queue with [`StreamListener::get_buffered_stream_data`].
//! Producers never wait on consumers and queues are unbounded.

use crate::report::Report;
use crate::stat::SnapshotRow;
use st_common::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Rows queued for one consumer.
pub type StreamQueue = Arc<Mutex<VecDeque<Vec<f64>>>>;

/// A panicking consumer must not strand queued rows.
fn lock_queue(queue: &StreamQueue) -> MutexGuard<'_, VecDeque<Vec<f64>>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer handle; `Send` so it can move to a consumer thread.
#[derive(Debug, Clone)]
pub struct StreamListener {
    name: String,
    queue: StreamQueue,
}

impl StreamListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Move every queued row into `out` (appended in arrival order) and
    /// return how many rows were taken.
    pub fn get_buffered_stream_data(&self, out: &mut VecDeque<Vec<f64>>) -> usize {
        let mut taken = std::mem::take(&mut *lock_queue(&self.queue));
        let n = taken.len();
        out.append(&mut taken);
        n
    }

    pub fn pending(&self) -> usize {
        lock_queue(&self.queue).len()
    }
}

/// In-process consumer called synchronously with each row.
pub trait StreamController {
    fn process_stream_row(&mut self, report: &str, row: &[f64]);
}

/// One streamed statistic.
#[derive(Debug, Clone)]
pub struct StatisticInstStreamNode {
    name: String,
    location: String,
    leaf_index: usize,
}

impl StatisticInstStreamNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn leaf_index(&self) -> usize {
        self.leaf_index
    }
}

struct StreamRoot {
    row: SnapshotRow,
    tokens: Vec<Weak<()>>,
    listeners: Vec<StreamListener>,
    controllers: Vec<Box<dyn StreamController>>,
}

/// A report in the stream tree; the top node is the stream root.
pub struct ReportStreamNode {
    name: String,
    stats: Vec<StatisticInstStreamNode>,
    subreports: Vec<ReportStreamNode>,
    root: Option<StreamRoot>,
}

impl ReportStreamNode {
    /// Build the stream tree for `report` and register a snapshot sink on
    /// every statistic.
    pub fn attach(report: &mut Report) -> Self {
        let mut next = 0;
        let mut node = Self::mirror(report, &mut next);
        let row: SnapshotRow = Rc::new(RefCell::new(vec![f64::NAN; next]));
        let mut tokens = Vec::with_capacity(next);
        report.for_each_stat_mut(&mut |idx, si| tokens.push(si.add_snapshot_sink(Rc::clone(&row), idx)));
        debug!(report = %report.name(), leaves = next, "Stream root attached");
        node.root = Some(StreamRoot {
            row,
            tokens,
            listeners: Vec::new(),
            controllers: Vec::new(),
        });
        node
    }

    fn mirror(report: &Report, next: &mut usize) -> Self {
        let stats = report
            .statistics()
            .iter()
            .map(|s| {
                let leaf = StatisticInstStreamNode {
                    name: s.name.clone(),
                    location: s.si.location().to_string(),
                    leaf_index: *next,
                };
                *next += 1;
                leaf
            })
            .collect();
        let subreports = report.subreports().iter().map(|sub| Self::mirror(sub, next)).collect();
        Self {
            name: report.name().to_string(),
            stats,
            subreports,
            root: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn statistics(&self) -> &[StatisticInstStreamNode] {
        &self.stats
    }

    pub fn subreports(&self) -> &[ReportStreamNode] {
        &self.subreports
    }

    /// Leaves below this node, depth first.
    pub fn leaves(&self) -> Vec<&StatisticInstStreamNode> {
        let mut out: Vec<&StatisticInstStreamNode> = self.stats.iter().collect();
        for sub in &self.subreports {
            out.extend(sub.leaves());
        }
        out
    }

    /// Register a consumer queue.
    pub fn add_listener(&mut self, name: impl Into<String>) -> Result<StreamListener> {
        let root = self.root.as_mut().ok_or_else(|| {
            Error::IllegalOperation("stream listeners can only be attached to the root node".into())
        })?;
        let listener = StreamListener {
            name: name.into(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        };
        root.listeners.push(listener.clone());
        Ok(listener)
    }

    pub fn add_controller(&mut self, controller: Box<dyn StreamController>) -> Result<()> {
        let root = self.root.as_mut().ok_or_else(|| {
            Error::IllegalOperation("stream controllers can only be attached to the root node".into())
        })?;
        root.controllers.push(controller);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.root.as_ref().map_or(0, |r| r.listeners.len())
    }

    /// Statistics whose sink is still registered.
    pub fn live_sink_count(&self) -> usize {
        self.root
            .as_ref()
            .map_or(0, |r| r.tokens.iter().filter(|t| t.strong_count() > 0).count())
    }

    /// Push the row last written by the snapshot sinks to every consumer.
    pub fn push_current(&mut self) {
        let name = self.name.clone();
        let Some(root) = self.root.as_mut() else {
            return;
        };
        let row = root.row.borrow().clone();
        for controller in &mut root.controllers {
            controller.process_stream_row(&name, &row);
        }
        for listener in &root.listeners {
            lock_queue(&listener.queue).push_back(row.clone());
        }
        trace!(report = %name, listeners = root.listeners.len(), "Stream row pushed");
    }
}

impl std::fmt::Debug for ReportStreamNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportStreamNode")
            .field("name", &self.name)
            .field("stats", &self.stats.len())
            .field("subreports", &self.subreports.len())
            .field("root", &self.is_root())
            .finish()
    }
}
