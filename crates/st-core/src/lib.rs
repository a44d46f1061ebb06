//! Simulation telemetry core.
//!
//! This library provides the statistics and reporting machinery of a
//! discrete-event simulator:
//! - Scheduler, clocks and the device tree of counters and parameters
//! - Expression engine and windowed statistic instances
//! - Report trees, their population from definitions and output formats
//! - Trigger engine driving report windows and updates
//! - Descriptor-driven report repository
//! - Archive capture, replay and live statistic streams
//! - Occupancy-tracked containers feeding cycle histograms
//!
//! Everything except the stream consumer queues runs on the scheduler's
//! thread.

pub mod archive;
pub mod containers;
pub mod expr;
pub mod format;
pub mod logging;
pub mod report;
pub mod repository;
pub mod sched;
pub mod stat;
pub mod stream;
pub mod tree;
pub mod trigger;

pub use archive::{
    ArchiveController, ArchiveDataSeries, ArchiveReplay, ArchiveTree, ArchiveWriter, DbReplay,
    LiveArchiveController, OfflineArchiveController,
};
pub use containers::{Buffer, CycleHistogramStandalone, Occupancy, Queue};
pub use expr::Expression;
pub use format::{create_formatter, FormatContext, ReportFormatter};
pub use report::{Report, ReportDbIds, Style};
pub use repository::{DirectoryHandle, LiveReport, ReportRepository, ReportStatus};
pub use sched::{Clock, Phase, Scheduler};
pub use stat::{ProvidedMetadata, StatisticInstance};
pub use stream::{ReportStreamNode, StatisticInstStreamNode, StreamController, StreamListener};
pub use tree::{CounterBehavior, TreeNode};
pub use trigger::{TagRegistry, TriggerContext, TriggerExpr, TriggerSpec};

pub use st_common::{Error, Result, SimulationInfo, Tick};
