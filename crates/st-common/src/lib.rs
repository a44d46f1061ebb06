//! Simulation telemetry common types, errors and formatting.
//!
//! This crate provides foundational types shared across the telemetry crates:
//! - The unified error type and result alias
//! - Statistic visibility levels and classes
//! - Simulation identity injected into report writers
//! - Canonical number formatting used by every text formatter

pub mod compare;
pub mod error;
pub mod format;
pub mod siminfo;
pub mod visibility;

pub use compare::CompareOp;
pub use error::{Error, ErrorCategory, Result};
pub use format::{format_number, DEFAULT_DECIMAL_PLACES};
pub use siminfo::SimulationInfo;
pub use visibility::{StatClass, Visibility};

/// Scheduler time unit. One tick is one picosecond.
pub type Tick = u64;

/// Sentinel for an open statistic window.
pub const TICK_MAX: Tick = u64::MAX;

/// Ticks per second of simulated time.
pub const TICKS_PER_SECOND: u64 = 1_000_000_000_000;
