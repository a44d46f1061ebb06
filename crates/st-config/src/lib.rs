//! Report configuration documents.
//!
//! This crate provides:
//! - Typed report definitions (statistics, subreports, autopopulation, styles)
//! - Report descriptors binding a definition to a destination, format and triggers
//! - Trigger-block inspection helpers
//! - Definition file resolution (explicit dir → env → descriptor dir → cwd)
//! - Validation errors for malformed documents

pub mod definition;
pub mod descriptor;
pub mod resolve;
pub mod trigger_block;
pub mod validate;

pub use definition::{
    apply_replacements, AutopopulateDef, ContentEntry, ReportDefinition, SubreportDef,
    VisibilityFilter, VisibilityTerm,
};
pub use descriptor::{load_descriptors, parse_descriptors, ReportDescriptor, ReportFormat};
pub use resolve::DefinitionSearchPath;
pub use trigger_block::{TriggerBlock, TriggerKey};
pub use validate::{ValidationError, ValidationResult};

/// Destination token meaning standard output.
pub const STDOUT_DESTINATION: &str = "1";
