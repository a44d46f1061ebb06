//! Storage schema definitions.
//!
//! A [`Schema`] is an ordered set of [`Table`]s, each an ordered set of
//! [`Column`]s. Tables are built fluently; modifiers apply to the most
//! recently added column:
//!
//! ```
//! use st_telemetry::{ColumnDataType, Schema};
//!
//! let mut schema = Schema::new();
//! schema
//!     .add_table("Updates")
//!     .unwrap()
//!     .add_column("tick", ColumnDataType::UInt64)
//!     .index()
//!     .add_column("report_id", ColumnDataType::Int32)
//!     .index_against("tick")
//!     .add_column("hist", ColumnDataType::Double)
//!     .set_dimensions(&[4, 2])
//!     .no_summary();
//! schema.finalize().unwrap();
//! ```
//!
//! Builder mistakes (duplicate columns, blob defaults, modifiers with no
//! column) are recorded on the table and reported by [`Table::validate`]
//! and [`Schema::finalize`].

use crate::error::{DbError, DbResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Reserved delimiter between a namespace and a table name.
pub const NAMESPACE_DELIMITER: char = '$';

/// Suffix of synthesized summary tables.
pub const SUMMARY_SUFFIX: &str = "_Summary";

/// Default number of records per storage chunk.
pub const DEFAULT_CHUNK_LENGTH: usize = 1000;

/// Column element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnDataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Char,
    String,
    Blob,
    /// Database id of a record in another table.
    ForeignKey,
}

impl ColumnDataType {
    pub const ALL: [ColumnDataType; 14] = [
        ColumnDataType::Int8,
        ColumnDataType::UInt8,
        ColumnDataType::Int16,
        ColumnDataType::UInt16,
        ColumnDataType::Int32,
        ColumnDataType::UInt32,
        ColumnDataType::Int64,
        ColumnDataType::UInt64,
        ColumnDataType::Float,
        ColumnDataType::Double,
        ColumnDataType::Char,
        ColumnDataType::String,
        ColumnDataType::Blob,
        ColumnDataType::ForeignKey,
    ];

    /// Size of one element in bytes; `None` for variable-width types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnDataType::Int8 | ColumnDataType::UInt8 | ColumnDataType::Char => Some(1),
            ColumnDataType::Int16 | ColumnDataType::UInt16 => Some(2),
            ColumnDataType::Int32 | ColumnDataType::UInt32 | ColumnDataType::Float => Some(4),
            ColumnDataType::Int64
            | ColumnDataType::UInt64
            | ColumnDataType::Double
            | ColumnDataType::ForeignKey => Some(8),
            ColumnDataType::String | ColumnDataType::Blob => None,
        }
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Numeric types take part in summaries.
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            ColumnDataType::Char
                | ColumnDataType::String
                | ColumnDataType::Blob
                | ColumnDataType::ForeignKey
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnDataType::Int8 => "int8",
            ColumnDataType::UInt8 => "uint8",
            ColumnDataType::Int16 => "int16",
            ColumnDataType::UInt16 => "uint16",
            ColumnDataType::Int32 => "int32",
            ColumnDataType::UInt32 => "uint32",
            ColumnDataType::Int64 => "int64",
            ColumnDataType::UInt64 => "uint64",
            ColumnDataType::Float => "float",
            ColumnDataType::Double => "double",
            ColumnDataType::Char => "char",
            ColumnDataType::String => "string",
            ColumnDataType::Blob => "blob",
            ColumnDataType::ForeignKey => "fkey",
        }
    }
}

impl std::str::FromStr for ColumnDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColumnDataType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown column data type: {}", s))
    }
}

impl fmt::Display for ColumnDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compression hint for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionLevel {
    None,
    #[default]
    Default,
    BestRatio,
    BestSpeed,
}

impl CompressionLevel {
    /// Deflate level used by the columnar backend.
    pub fn deflate_level(&self) -> u32 {
        match self {
            CompressionLevel::None => 0,
            CompressionLevel::Default => 5,
            CompressionLevel::BestRatio => 9,
            CompressionLevel::BestSpeed => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::Default => "default",
            CompressionLevel::BestRatio => "best_ratio",
            CompressionLevel::BestSpeed => "best_speed",
        }
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CompressionLevel::None),
            "default" => Ok(CompressionLevel::Default),
            "best_ratio" => Ok(CompressionLevel::BestRatio),
            "best_speed" => Ok(CompressionLevel::BestSpeed),
            other => Err(format!("unknown compression level: {}", other)),
        }
    }
}

/// A typed value for one column of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Char(u8),
    Str(String),
    Blob(Vec<u8>),
    ForeignKey(i64),
    /// Row-major elements of a multi-dimensional column.
    Array(Vec<ColumnValue>),
}

impl ColumnValue {
    pub fn data_type(&self) -> Option<ColumnDataType> {
        Some(match self {
            ColumnValue::Int8(_) => ColumnDataType::Int8,
            ColumnValue::UInt8(_) => ColumnDataType::UInt8,
            ColumnValue::Int16(_) => ColumnDataType::Int16,
            ColumnValue::UInt16(_) => ColumnDataType::UInt16,
            ColumnValue::Int32(_) => ColumnDataType::Int32,
            ColumnValue::UInt32(_) => ColumnDataType::UInt32,
            ColumnValue::Int64(_) => ColumnDataType::Int64,
            ColumnValue::UInt64(_) => ColumnDataType::UInt64,
            ColumnValue::Float(_) => ColumnDataType::Float,
            ColumnValue::Double(_) => ColumnDataType::Double,
            ColumnValue::Char(_) => ColumnDataType::Char,
            ColumnValue::Str(_) => ColumnDataType::String,
            ColumnValue::Blob(_) => ColumnDataType::Blob,
            ColumnValue::ForeignKey(_) => ColumnDataType::ForeignKey,
            ColumnValue::Array(items) => return items.first().and_then(ColumnValue::data_type),
        })
    }

    /// Zero of the given type.
    pub fn zero(dtype: ColumnDataType) -> Self {
        match dtype {
            ColumnDataType::Int8 => ColumnValue::Int8(0),
            ColumnDataType::UInt8 => ColumnValue::UInt8(0),
            ColumnDataType::Int16 => ColumnValue::Int16(0),
            ColumnDataType::UInt16 => ColumnValue::UInt16(0),
            ColumnDataType::Int32 => ColumnValue::Int32(0),
            ColumnDataType::UInt32 => ColumnValue::UInt32(0),
            ColumnDataType::Int64 => ColumnValue::Int64(0),
            ColumnDataType::UInt64 => ColumnValue::UInt64(0),
            ColumnDataType::Float => ColumnValue::Float(0.0),
            ColumnDataType::Double => ColumnValue::Double(0.0),
            ColumnDataType::Char => ColumnValue::Char(0),
            ColumnDataType::String => ColumnValue::Str(String::new()),
            ColumnDataType::Blob => ColumnValue::Blob(Vec::new()),
            ColumnDataType::ForeignKey => ColumnValue::ForeignKey(0),
        }
    }

    /// Parse a default-value string for `dtype`.
    pub fn parse(dtype: ColumnDataType, text: &str) -> Result<Self, String> {
        let t = text.trim();
        let bad = |_| format!("'{}' is not a valid {}", text, dtype);
        Ok(match dtype {
            ColumnDataType::Int8 => ColumnValue::Int8(t.parse().map_err(bad)?),
            ColumnDataType::UInt8 => ColumnValue::UInt8(t.parse().map_err(bad)?),
            ColumnDataType::Int16 => ColumnValue::Int16(t.parse().map_err(bad)?),
            ColumnDataType::UInt16 => ColumnValue::UInt16(t.parse().map_err(bad)?),
            ColumnDataType::Int32 => ColumnValue::Int32(t.parse().map_err(bad)?),
            ColumnDataType::UInt32 => ColumnValue::UInt32(t.parse().map_err(bad)?),
            ColumnDataType::Int64 => ColumnValue::Int64(t.parse().map_err(bad)?),
            ColumnDataType::UInt64 => ColumnValue::UInt64(t.parse().map_err(bad)?),
            ColumnDataType::ForeignKey => ColumnValue::ForeignKey(t.parse().map_err(bad)?),
            ColumnDataType::Float => {
                ColumnValue::Float(t.parse().map_err(|_| format!("'{}' is not a valid float", text))?)
            }
            ColumnDataType::Double => ColumnValue::Double(
                t.parse().map_err(|_| format!("'{}' is not a valid double", text))?,
            ),
            ColumnDataType::Char => match t.as_bytes() {
                [c] => ColumnValue::Char(*c),
                _ => return Err(format!("'{}' is not a single character", text)),
            },
            ColumnDataType::String => ColumnValue::Str(text.to_string()),
            ColumnDataType::Blob => return Err("blob columns cannot carry defaults".to_string()),
        })
    }

    /// Append the little-endian encoding of a fixed-width value.
    pub fn write_le(&self, out: &mut Vec<u8>) -> Result<(), String> {
        match self {
            ColumnValue::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::UInt8(v) | ColumnValue::Char(v) => out.push(*v),
            ColumnValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::Int64(v) | ColumnValue::ForeignKey(v) => {
                out.extend_from_slice(&v.to_le_bytes())
            }
            ColumnValue::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            ColumnValue::Array(items) => {
                for item in items {
                    item.write_le(out)?;
                }
            }
            ColumnValue::Str(_) | ColumnValue::Blob(_) => {
                return Err("variable-width values have no fixed encoding".to_string())
            }
        }
        Ok(())
    }

    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            ColumnValue::Int8(v) => *v as f64,
            ColumnValue::UInt8(v) | ColumnValue::Char(v) => *v as f64,
            ColumnValue::Int16(v) => *v as f64,
            ColumnValue::UInt16(v) => *v as f64,
            ColumnValue::Int32(v) => *v as f64,
            ColumnValue::UInt32(v) => *v as f64,
            ColumnValue::Int64(v) | ColumnValue::ForeignKey(v) => *v as f64,
            ColumnValue::UInt64(v) => *v as f64,
            ColumnValue::Float(v) => *v as f64,
            ColumnValue::Double(v) => *v,
            _ => return None,
        })
    }
}

/// Immutable column descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    dtype: ColumnDataType,
    dims: Vec<usize>,
    default_value: Option<String>,
    byte_offset: Option<usize>,
    indexed: bool,
    index_columns: Vec<String>,
    summary: bool,
}

impl Column {
    fn new(name: &str, dtype: ColumnDataType, byte_offset: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            dims: vec![1],
            default_value: None,
            byte_offset,
            indexed: false,
            index_columns: Vec::new(),
            summary: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> ColumnDataType {
        self.dtype
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dims
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    /// Offset into a packed struct record, when declared as a struct field.
    pub fn byte_offset(&self) -> Option<usize> {
        self.byte_offset
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Other columns forming a compound index with this one.
    pub fn index_columns(&self) -> &[String] {
        &self.index_columns
    }

    /// Whether this column contributes to the summary table.
    pub fn summary_enabled(&self) -> bool {
        self.summary && self.dtype.is_numeric() && self.element_count() == 1
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_fixed_size(&self) -> bool {
        self.dtype.is_fixed_size()
    }

    /// Bytes occupied by this column in a packed record.
    pub fn byte_len(&self) -> Option<usize> {
        self.dtype.fixed_size().map(|s| s * self.element_count())
    }

    /// Default value, or zero when none is set.
    pub fn default_or_zero(&self) -> ColumnValue {
        let scalar = self
            .default_value
            .as_deref()
            .and_then(|d| ColumnValue::parse(self.dtype, d).ok())
            .unwrap_or_else(|| ColumnValue::zero(self.dtype));
        if self.element_count() == 1 {
            scalar
        } else {
            ColumnValue::Array(vec![scalar; self.element_count()])
        }
    }
}

/// An ordered set of columns stored as one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    compression: CompressionLevel,
    chunk_length: usize,
    /// (column, other column) pairs resolved at schema finalization.
    pending_indices: Vec<(String, String)>,
    summary_of: Option<String>,
    build_errors: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            compression: CompressionLevel::default(),
            chunk_length: DEFAULT_CHUNK_LENGTH,
            pending_indices: Vec::new(),
            summary_of: None,
            build_errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn compression(&self) -> CompressionLevel {
        self.compression
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    /// Source table when this is a synthesized summary table.
    pub fn summary_of(&self) -> Option<&str> {
        self.summary_of.as_deref()
    }

    // ------------------------------------------------------------------
    // Fluent construction
    // ------------------------------------------------------------------

    /// Append a row-layout column.
    pub fn add_column(&mut self, name: &str, dtype: ColumnDataType) -> &mut Self {
        self.push_column(Column::new(name, dtype, None))
    }

    /// Append a struct field at `offset` bytes into the packed record.
    pub fn add_field(&mut self, name: &str, dtype: ColumnDataType, offset: usize) -> &mut Self {
        if !dtype.is_fixed_size() {
            self.build_errors.push(format!(
                "struct field '{}' must have a fixed-width type, not {}",
                name, dtype
            ));
        }
        self.push_column(Column::new(name, dtype, Some(offset)))
    }

    fn push_column(&mut self, column: Column) -> &mut Self {
        if column.name.is_empty() {
            self.build_errors.push("column names cannot be empty".to_string());
        } else if self.column(&column.name).is_some() {
            self.build_errors
                .push(format!("duplicate column '{}'", column.name));
        }
        self.columns.push(column);
        self
    }

    fn cursor(&mut self, modifier: &str) -> Option<&mut Column> {
        if self.columns.is_empty() {
            self.build_errors
                .push(format!("{}() called before any column was added", modifier));
        }
        self.columns.last_mut()
    }

    /// Index the most recently added column.
    pub fn index(&mut self) -> &mut Self {
        if let Some(col) = self.cursor("index") {
            col.indexed = true;
        }
        self
    }

    /// Index the most recently added column together with `other`.
    ///
    /// `other` may be added later; it is resolved when the schema is finalized.
    pub fn index_against(&mut self, other: &str) -> &mut Self {
        let name = self.cursor("index_against").map(|c| {
            c.indexed = true;
            c.name.clone()
        });
        if let Some(name) = name {
            self.pending_indices.push((name, other.to_string()));
        }
        self
    }

    pub fn set_default_value(&mut self, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        let mut err = None;
        if let Some(col) = self.cursor("set_default_value") {
            if col.dtype == ColumnDataType::Blob {
                err = Some(format!("blob column '{}' cannot carry a default", col.name));
            } else if let Err(e) = ColumnValue::parse(col.dtype, &value) {
                err = Some(format!("default for '{}': {}", col.name, e));
            } else {
                col.default_value = Some(value);
            }
        }
        if let Some(e) = err {
            self.build_errors.push(e);
        }
        self
    }

    pub fn set_dimensions(&mut self, dims: &[usize]) -> &mut Self {
        let mut err = None;
        if let Some(col) = self.cursor("set_dimensions") {
            if dims.is_empty() || dims.contains(&0) {
                err = Some(format!("column '{}' has invalid dimensions {:?}", col.name, dims));
            } else {
                col.dims = dims.to_vec();
            }
        }
        if let Some(e) = err {
            self.build_errors.push(e);
        }
        self
    }

    /// Exclude the most recently added column from summaries.
    pub fn no_summary(&mut self) -> &mut Self {
        if let Some(col) = self.cursor("no_summary") {
            col.summary = false;
        }
        self
    }

    pub fn set_compression(&mut self, level: CompressionLevel) -> &mut Self {
        self.compression = level;
        self
    }

    /// Records per storage chunk.
    pub fn set_chunk_length(&mut self, records: usize) -> &mut Self {
        if records == 0 {
            self.build_errors.push("chunk length must be positive".to_string());
        } else {
            self.chunk_length = records;
        }
        self
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// True when every column is fixed-width.
    pub fn is_fixed_size(&self) -> bool {
        self.columns.iter().all(Column::is_fixed_size)
    }

    /// True when columns carry explicit byte offsets.
    pub fn is_struct_layout(&self) -> bool {
        !self.columns.is_empty() && self.columns.iter().all(|c| c.byte_offset.is_some())
    }

    /// (offset, length) of each column in a packed record, in column order.
    pub fn field_layout(&self) -> Option<Vec<(usize, usize)>> {
        let mut layout = Vec::with_capacity(self.columns.len());
        let mut next = 0;
        for col in &self.columns {
            let len = col.byte_len()?;
            let offset = col.byte_offset.unwrap_or(next);
            layout.push((offset, len));
            next = offset + len;
        }
        Some(layout)
    }

    /// Bytes in one packed record; `None` for variable-width tables.
    pub fn record_bytes(&self) -> Option<usize> {
        let layout = self.field_layout()?;
        if self.is_struct_layout() {
            let last = self
                .columns
                .iter()
                .zip(&layout)
                .max_by_key(|(c, _)| c.byte_offset)
                .map(|(_, (off, len))| off + len);
            Some(last.unwrap_or(0))
        } else {
            Some(layout.iter().map(|(_, len)| len).sum())
        }
    }

    /// Pack typed values into a fixed-size record.
    ///
    /// Missing trailing values take the column default.
    pub fn pack_values(&self, values: &[ColumnValue]) -> DbResult<Vec<u8>> {
        let size = self
            .record_bytes()
            .ok_or_else(|| DbError::Unsupported(format!("table '{}' is not fixed-size", self.name)))?;
        let layout = self.field_layout().unwrap_or_default();
        if values.len() > self.columns.len() {
            return Err(DbError::InvalidValue {
                column: self.name.clone(),
                message: format!(
                    "{} values for {} columns",
                    values.len(),
                    self.columns.len()
                ),
            });
        }
        let mut record = vec![0u8; size];
        for (idx, (col, (offset, len))) in self.columns.iter().zip(layout).enumerate() {
            let value = values.get(idx).cloned().unwrap_or_else(|| col.default_or_zero());
            let mut bytes = Vec::with_capacity(len);
            value.write_le(&mut bytes).map_err(|message| DbError::InvalidValue {
                column: col.name.clone(),
                message,
            })?;
            if bytes.len() != len || value.data_type() != Some(col.dtype) {
                return Err(DbError::InvalidValue {
                    column: col.name.clone(),
                    message: format!("expected {} x{}", col.dtype, col.element_count()),
                });
            }
            record[offset..offset + len].copy_from_slice(&bytes);
        }
        Ok(record)
    }

    /// Check builder errors and layout invariants.
    pub fn validate(&self) -> DbResult<()> {
        if self.name.is_empty() {
            return Err(DbError::schema("table names cannot be empty"));
        }
        if let Some(err) = self.build_errors.first() {
            return Err(DbError::schema(format!("table '{}': {}", self.name, err)));
        }
        let with_offsets = self.columns.iter().filter(|c| c.byte_offset.is_some()).count();
        if with_offsets != 0 && with_offsets != self.columns.len() {
            return Err(DbError::schema(format!(
                "table '{}' mixes struct fields and row columns",
                self.name
            )));
        }
        if self.is_struct_layout() {
            let mut spans: Vec<(usize, usize, &str)> = self
                .columns
                .iter()
                .filter_map(|c| Some((c.byte_offset?, c.byte_len()?, c.name.as_str())))
                .collect();
            spans.sort();
            for pair in spans.windows(2) {
                let (off, len, name) = pair[0];
                if off + len > pair[1].0 {
                    return Err(DbError::schema(format!(
                        "table '{}': field '{}' overlaps '{}'",
                        self.name, name, pair[1].2
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve_indices(&mut self) -> DbResult<()> {
        for (primary, other) in std::mem::take(&mut self.pending_indices) {
            if self.column(&other).is_none() {
                return Err(DbError::UnknownColumn {
                    table: self.name.clone(),
                    column: other,
                });
            }
            let col = self
                .columns
                .iter_mut()
                .find(|c| c.name == primary)
                .ok_or_else(|| DbError::UnknownColumn {
                    table: self.name.clone(),
                    column: primary.clone(),
                })?;
            if !col.index_columns.contains(&other) {
                col.index_columns.push(other);
            }
        }
        Ok(())
    }

    pub(crate) fn set_summary_of(&mut self, source: impl Into<String>) {
        self.summary_of = Some(source.into());
    }

    /// Same name and identical columns.
    fn same_definition(&self, other: &Table) -> bool {
        self.name == other.name && self.columns == other.columns
    }
}

/// Function reducing a column's values to one summary number.
#[derive(Clone)]
pub struct SummaryFunction {
    name: String,
    func: Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>,
}

impl SummaryFunction {
    pub fn new(name: impl Into<String>, func: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, values: &[f64]) -> f64 {
        (self.func)(values)
    }
}

impl fmt::Debug for SummaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryFunction").field("name", &self.name).finish()
    }
}

/// Built-in min/max/avg summaries. NaN values are skipped.
pub fn default_summary_functions() -> Vec<SummaryFunction> {
    fn finite(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
        values.iter().copied().filter(|v| !v.is_nan())
    }
    vec![
        SummaryFunction::new("min", |v| finite(v).fold(f64::NAN, f64::min)),
        SummaryFunction::new("max", |v| finite(v).fold(f64::NAN, f64::max)),
        SummaryFunction::new("avg", |v| {
            let (sum, n) = finite(v).fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        }),
    ]
}

/// An ordered collection of tables.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: Vec<Table>,
    namespace: Option<String>,
    summary_fns: Vec<SummaryFunction>,
    summary_exclusions: BTreeSet<String>,
    finalized: bool,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
            && self.namespace == other.namespace
            && self.summary_exclusions == other.summary_exclusions
            && self.finalized == other.finalized
            && self
                .summary_fns
                .iter()
                .map(SummaryFunction::name)
                .eq(other.summary_fns.iter().map(SummaryFunction::name))
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema with the built-in min/max/avg summaries.
    pub fn with_default_summaries() -> Self {
        Self {
            summary_fns: default_summary_functions(),
            ..Self::default()
        }
    }

    /// Schema rebuilt from storage. Table names are taken as already namespaced.
    pub(crate) fn from_stored_tables(tables: Vec<Table>) -> DbResult<Self> {
        let mut schema = Self {
            tables,
            ..Self::default()
        };
        for table in &mut schema.tables {
            table.validate()?;
            table.resolve_indices()?;
        }
        schema.finalized = true;
        Ok(schema)
    }

    /// Start a new table.
    pub fn add_table(&mut self, name: &str) -> DbResult<&mut Table> {
        check_table_name(name)?;
        if self.table(name).is_some() {
            return Err(DbError::ConflictingTable(name.to_string()));
        }
        self.finalized = false;
        self.tables.push(Table::new(name));
        let last = self.tables.len() - 1;
        Ok(&mut self.tables[last])
    }

    /// Add a complete table. Re-adding an identical table is a no-op.
    pub fn insert_table(&mut self, table: Table) -> DbResult<()> {
        if table.summary_of.is_none() {
            check_table_name(&table.name)?;
        }
        match self.table(&table.name) {
            Some(existing) if existing.same_definition(&table) => Ok(()),
            Some(_) => Err(DbError::ConflictingTable(table.name)),
            None => {
                self.finalized = false;
                self.tables.push(table);
                Ok(())
            }
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Prefix applied to every table name at finalization.
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = Some(namespace.into());
    }

    pub fn add_summary_function(&mut self, func: SummaryFunction) {
        self.summary_fns.retain(|f| f.name != func.name);
        self.summary_fns.push(func);
    }

    pub fn summary_functions(&self) -> &[SummaryFunction] {
        &self.summary_fns
    }

    /// Skip summary synthesis for `table`.
    pub fn exclude_from_summary(&mut self, table: &str) {
        self.summary_exclusions.insert(table.to_string());
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Apply the namespace, resolve pending indices and synthesize summary tables.
    ///
    /// Finalizing an already-finalized schema changes nothing.
    pub fn finalize(&mut self) -> DbResult<()> {
        if self.finalized {
            return Ok(());
        }
        for table in &self.tables {
            table.validate()?;
        }

        if let Some(ns) = self.namespace.take() {
            let prefixed = |name: &str| format!("{}{}{}", ns, NAMESPACE_DELIMITER, name);
            for table in &mut self.tables {
                table.name = prefixed(&table.name);
                if let Some(src) = &table.summary_of {
                    table.summary_of = Some(prefixed(src));
                }
            }
            self.summary_exclusions = self
                .summary_exclusions
                .iter()
                .map(|t| prefixed(t))
                .collect();
        }

        for table in &mut self.tables {
            table.resolve_indices()?;
        }

        if !self.summary_fns.is_empty() {
            let existing: BTreeSet<String> = self.tables.iter().map(|t| t.name.clone()).collect();
            let mut synthesized = Vec::new();
            for table in &self.tables {
                if table.summary_of.is_some() || self.summary_exclusions.contains(&table.name) {
                    continue;
                }
                let summary_name = format!("{}{}", table.name, SUMMARY_SUFFIX);
                if existing.contains(&summary_name) {
                    continue;
                }
                let cols: Vec<&Column> =
                    table.columns.iter().filter(|c| c.summary_enabled()).collect();
                if cols.is_empty() {
                    continue;
                }
                let mut summary = Table::new(summary_name);
                summary.summary_of = Some(table.name.clone());
                summary.compression = table.compression;
                for col in cols {
                    for func in &self.summary_fns {
                        summary
                            .add_column(&format!("{}_{}", col.name, func.name), ColumnDataType::Double)
                            .no_summary();
                    }
                }
                synthesized.push(summary);
            }
            self.tables.extend(synthesized);
        }

        self.finalized = true;
        Ok(())
    }

    /// Merge tables and summary settings from `other`.
    pub fn merge(&mut self, other: &Schema) -> DbResult<()> {
        for table in &other.tables {
            self.insert_table(table.clone())?;
        }
        for func in &other.summary_fns {
            if !self.summary_fns.iter().any(|f| f.name == func.name) {
                self.summary_fns.push(func.clone());
            }
        }
        self.summary_exclusions
            .extend(other.summary_exclusions.iter().cloned());
        Ok(())
    }

    /// Summary row for `source`, in the column order of its summary table.
    pub fn summary_values(
        &self,
        source: &str,
        series: &BTreeMap<String, Vec<f64>>,
    ) -> DbResult<Vec<f64>> {
        self.summary_values_with(source, |column| {
            Ok(series.get(column).cloned().unwrap_or_default())
        })
    }

    /// Like [`Schema::summary_values`], loading one column at a time
    /// through `load`.
    pub fn summary_values_with(
        &self,
        source: &str,
        mut load: impl FnMut(&str) -> DbResult<Vec<f64>>,
    ) -> DbResult<Vec<f64>> {
        let table = self
            .table(source)
            .ok_or_else(|| DbError::UnknownTable(source.to_string()))?;
        let mut row = Vec::new();
        for col in table.columns.iter().filter(|c| c.summary_enabled()) {
            let values = load(&col.name)?;
            for func in &self.summary_fns {
                row.push(func.apply(&values));
            }
        }
        Ok(row)
    }
}

fn check_table_name(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::schema("table names cannot be empty"));
    }
    if name.contains(NAMESPACE_DELIMITER) {
        return Err(DbError::schema(format!(
            "table name '{}' contains the reserved delimiter '{}'",
            name, NAMESPACE_DELIMITER
        )));
    }
    Ok(())
}
