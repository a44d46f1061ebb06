//! Simulation telemetry storage.
//!
//! This crate provides:
//! - Table schemas with typed, optionally multi-dimensional columns
//! - Summary-table synthesis at schema finalization
//! - The database connection interface and per-table record factories
//! - A columnar backend storing fixed-width records as Parquet files
//! - Scoped ownership of backend resources

pub mod columnar;
pub mod conn;
pub mod error;
pub mod handle;
pub mod schema;

pub use columnar::{parquet_compression, ColumnarConnProxy};
pub use conn::{AnySizeFactory, DbConnProxy, FixedSizeFactory, ObjectFactories, ObjectManager};
pub use error::{DbError, DbResult};
pub use handle::ScopedHandle;
pub use schema::{
    default_summary_functions, Column, ColumnDataType, ColumnValue, CompressionLevel, Schema,
    SummaryFunction, Table, DEFAULT_CHUNK_LENGTH, SUMMARY_SUFFIX,
};
