//! Columnar database backend on Arrow/Parquet.
//!
//! A database is a directory of parquet files. Each table is a sequence of
//! chunks of `chunk_length` records, chunk `n` stored as
//! `<table>.<nnnnnn>.parquet`. Records are fixed-width compound records:
//!
//! - Struct-layout tables keep their declared field offsets; the record size
//!   is the last field's offset plus its width.
//! - Row tables pack columns left to right.
//!
//! Column fields carry their element type, dimensions and offset as Arrow
//! field metadata, so reopening a database rebuilds an equivalent schema.
//! Multi-dimensional columns are stored as fixed-size lists over the base
//! type. Full chunks are written once and never touched again; only the
//! last, partial chunk is held in memory and rewritten on flush.

use crate::conn::DbConnProxy;
use crate::error::{DbError, DbResult};
use crate::handle::ScopedHandle;
use crate::schema::{ColumnDataType, ColumnValue, CompressionLevel, Schema, Table};
use arrow::array::{
    Array, ArrayRef, AsArray, FixedSizeListArray, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, RecordBatch, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    Schema as ArrowSchema, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const META_TABLE_INDEX: &str = "simtel.table_index";
const META_CHUNK: &str = "simtel.chunk_length";
const META_COMPRESSION: &str = "simtel.compression";
const META_SUMMARY_OF: &str = "simtel.summary_of";
const META_DTYPE: &str = "simtel.dtype";
const META_DIMS: &str = "simtel.dims";
const META_OFFSET: &str = "simtel.offset";
const META_DEFAULT: &str = "simtel.default";
const META_SUMMARY: &str = "simtel.summary";
const META_INDEXED: &str = "simtel.indexed";
const META_INDEX_COLUMNS: &str = "simtel.index_columns";

static COMPRESSION_WARNED: AtomicBool = AtomicBool::new(false);

/// Parquet codec for a table's compression hint.
///
/// Falls back to no compression, with a single warning, when the deflate
/// level is rejected.
pub fn parquet_compression(level: CompressionLevel) -> Compression {
    if level == CompressionLevel::None {
        return Compression::UNCOMPRESSED;
    }
    match GzipLevel::try_new(level.deflate_level()) {
        Ok(gzip) => Compression::GZIP(gzip),
        Err(e) => {
            if !COMPRESSION_WARNED.swap(true, Ordering::Relaxed) {
                warn!(error = %e, "Deflate compression unavailable, writing uncompressed");
            }
            Compression::UNCOMPRESSED
        }
    }
}

/// Decode one little-endian element of `dtype`.
pub fn decode_scalar(dtype: ColumnDataType, bytes: &[u8]) -> Option<ColumnValue> {
    fn arr<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N)?.try_into().ok()
    }
    Some(match dtype {
        ColumnDataType::Int8 => ColumnValue::Int8(i8::from_le_bytes(arr(bytes)?)),
        ColumnDataType::UInt8 => ColumnValue::UInt8(bytes.first().copied()?),
        ColumnDataType::Char => ColumnValue::Char(bytes.first().copied()?),
        ColumnDataType::Int16 => ColumnValue::Int16(i16::from_le_bytes(arr(bytes)?)),
        ColumnDataType::UInt16 => ColumnValue::UInt16(u16::from_le_bytes(arr(bytes)?)),
        ColumnDataType::Int32 => ColumnValue::Int32(i32::from_le_bytes(arr(bytes)?)),
        ColumnDataType::UInt32 => ColumnValue::UInt32(u32::from_le_bytes(arr(bytes)?)),
        ColumnDataType::Int64 => ColumnValue::Int64(i64::from_le_bytes(arr(bytes)?)),
        ColumnDataType::ForeignKey => ColumnValue::ForeignKey(i64::from_le_bytes(arr(bytes)?)),
        ColumnDataType::UInt64 => ColumnValue::UInt64(u64::from_le_bytes(arr(bytes)?)),
        ColumnDataType::Float => ColumnValue::Float(f32::from_le_bytes(arr(bytes)?)),
        ColumnDataType::Double => ColumnValue::Double(f64::from_le_bytes(arr(bytes)?)),
        ColumnDataType::String | ColumnDataType::Blob => return None,
    })
}

fn arrow_base_type(dtype: ColumnDataType) -> Option<DataType> {
    Some(match dtype {
        ColumnDataType::Int8 => DataType::Int8,
        ColumnDataType::UInt8 | ColumnDataType::Char => DataType::UInt8,
        ColumnDataType::Int16 => DataType::Int16,
        ColumnDataType::UInt16 => DataType::UInt16,
        ColumnDataType::Int32 => DataType::Int32,
        ColumnDataType::UInt32 => DataType::UInt32,
        ColumnDataType::Int64 | ColumnDataType::ForeignKey => DataType::Int64,
        ColumnDataType::UInt64 => DataType::UInt64,
        ColumnDataType::Float => DataType::Float32,
        ColumnDataType::Double => DataType::Float64,
        ColumnDataType::String | ColumnDataType::Blob => return None,
    })
}

fn dtype_from_arrow(dt: &DataType) -> Option<ColumnDataType> {
    Some(match dt {
        DataType::Int8 => ColumnDataType::Int8,
        DataType::UInt8 => ColumnDataType::UInt8,
        DataType::Int16 => ColumnDataType::Int16,
        DataType::UInt16 => ColumnDataType::UInt16,
        DataType::Int32 => ColumnDataType::Int32,
        DataType::UInt32 => ColumnDataType::UInt32,
        DataType::Int64 => ColumnDataType::Int64,
        DataType::UInt64 => ColumnDataType::UInt64,
        DataType::Float32 => ColumnDataType::Float,
        DataType::Float64 => ColumnDataType::Double,
        _ => return None,
    })
}

fn item_field(base: DataType) -> Arc<Field> {
    Arc::new(Field::new("item", base, false))
}

/// Arrow schema for a table, with layout metadata.
fn arrow_schema(table: &Table, table_index: usize) -> DbResult<ArrowSchema> {
    let layout = table
        .field_layout()
        .ok_or_else(|| DbError::Unsupported(format!("table '{}' is not fixed-size", table.name())))?;
    let mut fields = Vec::with_capacity(table.columns().len());
    for (col, (offset, _)) in table.columns().iter().zip(layout) {
        let base = arrow_base_type(col.data_type()).ok_or_else(|| {
            DbError::Unsupported(format!("column '{}' has type {}", col.name(), col.data_type()))
        })?;
        let n = col.element_count();
        let data_type = if n == 1 {
            base
        } else {
            DataType::FixedSizeList(item_field(base), n as i32)
        };

        let mut meta = HashMap::new();
        meta.insert(META_DTYPE.to_string(), col.data_type().as_str().to_string());
        let dims: Vec<String> = col.dimensions().iter().map(|d| d.to_string()).collect();
        meta.insert(META_DIMS.to_string(), dims.join("x"));
        if col.byte_offset().is_some() {
            meta.insert(META_OFFSET.to_string(), offset.to_string());
        }
        if let Some(default) = col.default_value() {
            meta.insert(META_DEFAULT.to_string(), default.to_string());
        }
        if !col.summary_enabled() {
            meta.insert(META_SUMMARY.to_string(), "false".to_string());
        }
        if col.is_indexed() {
            meta.insert(META_INDEXED.to_string(), "true".to_string());
        }
        if !col.index_columns().is_empty() {
            meta.insert(META_INDEX_COLUMNS.to_string(), col.index_columns().join(","));
        }
        fields.push(Field::new(col.name(), data_type, false).with_metadata(meta));
    }

    let mut meta = HashMap::new();
    meta.insert(META_TABLE_INDEX.to_string(), table_index.to_string());
    meta.insert(META_CHUNK.to_string(), table.chunk_length().to_string());
    meta.insert(META_COMPRESSION.to_string(), table.compression().as_str().to_string());
    if let Some(src) = table.summary_of() {
        meta.insert(META_SUMMARY_OF.to_string(), src.to_string());
    }
    Ok(ArrowSchema::new_with_metadata(fields, meta))
}

/// Rebuild a table definition from a stored Arrow schema.
fn table_from_arrow(name: &str, schema: &ArrowSchema) -> DbResult<Table> {
    let mut table = Table::new(name);
    for field in schema.fields() {
        let meta = field.metadata();
        let base = match field.data_type() {
            DataType::FixedSizeList(item, _) => item.data_type().clone(),
            other => other.clone(),
        };
        let dtype = match meta.get(META_DTYPE) {
            Some(text) => text.parse::<ColumnDataType>().map_err(DbError::InvalidSchema)?,
            None => dtype_from_arrow(&base).ok_or_else(|| {
                DbError::Unsupported(format!("field '{}' has type {}", field.name(), base))
            })?,
        };
        match meta.get(META_OFFSET).and_then(|o| o.parse::<usize>().ok()) {
            Some(offset) => table.add_field(field.name(), dtype, offset),
            None => table.add_column(field.name(), dtype),
        };
        if let Some(dims) = meta.get(META_DIMS) {
            let dims: Vec<usize> = dims.split('x').filter_map(|d| d.parse().ok()).collect();
            if dims != [1] {
                table.set_dimensions(&dims);
            }
        } else if let DataType::FixedSizeList(_, n) = field.data_type() {
            table.set_dimensions(&[*n as usize]);
        }
        if let Some(default) = meta.get(META_DEFAULT) {
            table.set_default_value(default);
        }
        if meta.get(META_SUMMARY).map(String::as_str) == Some("false") {
            table.no_summary();
        }
        if meta.get(META_INDEXED).map(String::as_str) == Some("true") {
            table.index();
        }
        if let Some(others) = meta.get(META_INDEX_COLUMNS) {
            for other in others.split(',').filter(|s| !s.is_empty()) {
                table.index_against(other);
            }
        }
    }
    let smeta = schema.metadata();
    if let Some(n) = smeta.get(META_CHUNK).and_then(|n| n.parse().ok()) {
        table.set_chunk_length(n);
    }
    if let Some(level) = smeta.get(META_COMPRESSION).and_then(|c| c.parse().ok()) {
        table.set_compression(level);
    }
    if let Some(src) = smeta.get(META_SUMMARY_OF) {
        table.set_summary_of(src.clone());
    }
    Ok(table)
}

fn gather<T, const N: usize>(
    rows: &[Vec<u8>],
    offset: usize,
    count: usize,
    from: fn([u8; N]) -> T,
) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len() * count);
    for row in rows {
        for k in 0..count {
            let start = offset + k * N;
            let mut buf = [0u8; N];
            buf.copy_from_slice(&row[start..start + N]);
            out.push(from(buf));
        }
    }
    out
}

fn scatter<T: Copy, const N: usize>(
    values: &[T],
    to: fn(T) -> [u8; N],
    rows: &mut [Vec<u8>],
    offset: usize,
    count: usize,
) -> DbResult<()> {
    if values.len() != rows.len() * count {
        return Err(DbError::schema("stored column length does not match row count"));
    }
    for (i, row) in rows.iter_mut().enumerate() {
        for k in 0..count {
            let start = offset + k * N;
            row[start..start + N].copy_from_slice(&to(values[i * count + k]));
        }
    }
    Ok(())
}

/// Arrow array for one column of packed records.
fn column_array(
    dtype: ColumnDataType,
    rows: &[Vec<u8>],
    offset: usize,
    count: usize,
) -> DbResult<ArrayRef> {
    let values: ArrayRef = match dtype {
        ColumnDataType::Int8 => Arc::new(Int8Array::from(gather(rows, offset, count, i8::from_le_bytes))),
        ColumnDataType::UInt8 | ColumnDataType::Char => {
            Arc::new(UInt8Array::from(gather(rows, offset, count, u8::from_le_bytes)))
        }
        ColumnDataType::Int16 => Arc::new(Int16Array::from(gather(rows, offset, count, i16::from_le_bytes))),
        ColumnDataType::UInt16 => {
            Arc::new(UInt16Array::from(gather(rows, offset, count, u16::from_le_bytes)))
        }
        ColumnDataType::Int32 => Arc::new(Int32Array::from(gather(rows, offset, count, i32::from_le_bytes))),
        ColumnDataType::UInt32 => {
            Arc::new(UInt32Array::from(gather(rows, offset, count, u32::from_le_bytes)))
        }
        ColumnDataType::Int64 | ColumnDataType::ForeignKey => {
            Arc::new(Int64Array::from(gather(rows, offset, count, i64::from_le_bytes)))
        }
        ColumnDataType::UInt64 => {
            Arc::new(UInt64Array::from(gather(rows, offset, count, u64::from_le_bytes)))
        }
        ColumnDataType::Float => {
            Arc::new(Float32Array::from(gather(rows, offset, count, f32::from_le_bytes)))
        }
        ColumnDataType::Double => {
            Arc::new(Float64Array::from(gather(rows, offset, count, f64::from_le_bytes)))
        }
        ColumnDataType::String | ColumnDataType::Blob => {
            return Err(DbError::Unsupported(format!("{} columns", dtype)))
        }
    };
    if count == 1 {
        return Ok(values);
    }
    let base = values.data_type().clone();
    Ok(Arc::new(FixedSizeListArray::try_new(
        item_field(base),
        count as i32,
        values,
        None,
    )?))
}

/// Write one stored column back into packed records.
fn scatter_column(
    dtype: ColumnDataType,
    array: &ArrayRef,
    rows: &mut [Vec<u8>],
    offset: usize,
    count: usize,
) -> DbResult<()> {
    let flat: ArrayRef = if count == 1 {
        Arc::clone(array)
    } else {
        let list = array
            .as_fixed_size_list_opt()
            .ok_or_else(|| DbError::schema("expected a fixed-size list column"))?;
        Arc::clone(list.values())
    };
    let mismatch = || DbError::schema(format!("stored column does not hold {}", dtype));
    match dtype {
        ColumnDataType::Int8 => scatter(
            flat.as_primitive_opt::<Int8Type>().ok_or_else(mismatch)?.values(),
            i8::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::UInt8 | ColumnDataType::Char => scatter(
            flat.as_primitive_opt::<UInt8Type>().ok_or_else(mismatch)?.values(),
            u8::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::Int16 => scatter(
            flat.as_primitive_opt::<Int16Type>().ok_or_else(mismatch)?.values(),
            i16::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::UInt16 => scatter(
            flat.as_primitive_opt::<UInt16Type>().ok_or_else(mismatch)?.values(),
            u16::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::Int32 => scatter(
            flat.as_primitive_opt::<Int32Type>().ok_or_else(mismatch)?.values(),
            i32::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::UInt32 => scatter(
            flat.as_primitive_opt::<UInt32Type>().ok_or_else(mismatch)?.values(),
            u32::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::Int64 | ColumnDataType::ForeignKey => scatter(
            flat.as_primitive_opt::<Int64Type>().ok_or_else(mismatch)?.values(),
            i64::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::UInt64 => scatter(
            flat.as_primitive_opt::<UInt64Type>().ok_or_else(mismatch)?.values(),
            u64::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::Float => scatter(
            flat.as_primitive_opt::<Float32Type>().ok_or_else(mismatch)?.values(),
            f32::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::Double => scatter(
            flat.as_primitive_opt::<Float64Type>().ok_or_else(mismatch)?.values(),
            f64::to_le_bytes,
            rows,
            offset,
            count,
        ),
        ColumnDataType::String | ColumnDataType::Blob => {
            Err(DbError::Unsupported(format!("{} columns", dtype)))
        }
    }
}

/// File holding chunk `n` of `table`.
fn chunk_path(dir: &Path, table: &str, n: u64) -> PathBuf {
    dir.join(format!("{}.{:06}.parquet", table, n))
}

/// Table name and chunk number of a chunk file.
fn parse_chunk_file(path: &Path) -> Option<(String, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let (table, n) = stem.rsplit_once('.')?;
    Some((table.to_string(), n.parse().ok()?))
}

/// Stored schema and record count of a chunk file, without reading data.
fn inspect_chunk(path: &Path) -> DbResult<(Arc<ArrowSchema>, u64)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let rows = builder.metadata().file_metadata().num_rows().max(0) as u64;
    Ok((builder.schema().clone(), rows))
}

/// Decode every record of a chunk file.
fn read_chunk(
    path: &Path,
    table: &Table,
    layout: &[(usize, usize)],
    record_bytes: usize,
) -> DbResult<Vec<Vec<u8>>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let mut records = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        let mut rows = vec![vec![0u8; record_bytes]; batch.num_rows()];
        for (i, (col, (offset, _))) in table.columns().iter().zip(layout).enumerate() {
            scatter_column(
                col.data_type(),
                batch.column(i),
                &mut rows,
                *offset,
                col.element_count(),
            )?;
        }
        records.extend(rows);
    }
    Ok(records)
}

fn abandon_writer(writer: ArrowWriter<File>) {
    if let Err(e) = writer.close() {
        warn!(error = %e, "Failed to close parquet writer");
    }
}

/// Records of one table.
///
/// A chunk is sealed into its own parquet file as soon as it fills up, so
/// only the open tail chunk lives in memory. Flush persists the tail under
/// the chunk number it will later be sealed as.
#[derive(Debug)]
struct TableStore {
    table: Table,
    index: usize,
    layout: Vec<(usize, usize)>,
    record_bytes: usize,
    chunk_length: u64,
    sealed: u64,
    tail: Vec<Vec<u8>>,
    tail_dirty: bool,
    /// Last sealed chunk read back.
    cached: RefCell<Option<(u64, Vec<Vec<u8>>)>>,
}

impl TableStore {
    fn new(table: Table, index: usize) -> DbResult<Self> {
        let layout = table
            .field_layout()
            .ok_or_else(|| DbError::Unsupported(format!("table '{}' is not fixed-size", table.name())))?;
        let record_bytes = table.record_bytes().unwrap_or(0);
        let chunk_length = table.chunk_length().max(1) as u64;
        Ok(Self {
            table,
            index,
            layout,
            record_bytes,
            chunk_length,
            sealed: 0,
            tail: Vec::new(),
            tail_dirty: true,
            cached: RefCell::new(None),
        })
    }

    fn record_count(&self) -> u64 {
        self.sealed * self.chunk_length + self.tail.len() as u64
    }

    fn batch(&self, rows: &[Vec<u8>]) -> DbResult<RecordBatch> {
        let schema = Arc::new(arrow_schema(&self.table, self.index)?);
        let mut columns = Vec::with_capacity(self.layout.len());
        for (col, (offset, _)) in self.table.columns().iter().zip(&self.layout) {
            columns.push(column_array(col.data_type(), rows, *offset, col.element_count())?);
        }
        Ok(RecordBatch::try_new(schema, columns)?)
    }

    /// Write `rows` as chunk `n`, replacing any earlier file of that chunk.
    fn write_chunk(&self, dir: &Path, n: u64, rows: &[Vec<u8>]) -> DbResult<()> {
        let batch = self.batch(rows)?;
        let path = chunk_path(dir, self.table.name(), n);
        let tmp = path.with_extension("parquet.tmp");
        let file = File::create(&tmp)?;
        let props = WriterProperties::builder()
            .set_compression(parquet_compression(self.table.compression()))
            .set_max_row_group_size(self.table.chunk_length())
            .build();

        let mut writer = ScopedHandle::new(
            ArrowWriter::try_new(file, batch.schema(), Some(props))?,
            abandon_writer,
        );
        if batch.num_rows() > 0 {
            writer.write(&batch)?;
        }
        writer.into_inner().close()?;
        fs::rename(&tmp, &path)?;
        debug!(table = self.table.name(), chunk = n, records = rows.len(), "Wrote chunk");
        Ok(())
    }

    fn append(&mut self, dir: &Path, record: Vec<u8>) -> DbResult<u64> {
        if record.len() != self.record_bytes {
            return Err(DbError::RecordSize {
                table: self.table.name().to_string(),
                expected: self.record_bytes,
                actual: record.len(),
            });
        }
        self.tail.push(record);
        self.tail_dirty = true;
        if self.tail.len() as u64 >= self.chunk_length {
            if let Err(e) = self.write_chunk(dir, self.sealed, &self.tail) {
                self.tail.pop();
                return Err(e);
            }
            self.sealed += 1;
            self.tail.clear();
            self.tail_dirty = false;
        }
        Ok(self.record_count())
    }

    fn flush_tail(&mut self, dir: &Path) -> DbResult<()> {
        if self.tail_dirty {
            self.write_chunk(dir, self.sealed, &self.tail)?;
            self.tail_dirty = false;
        }
        Ok(())
    }

    /// Copy the bytes at `offset` of record `id` into `dest`.
    ///
    /// Returns false when there is no such record.
    fn copy_field(&self, dir: &Path, id: u64, offset: usize, dest: &mut [u8]) -> DbResult<bool> {
        let Some(i) = id.checked_sub(1).filter(|i| *i < self.record_count()) else {
            return Ok(false);
        };
        let chunk = i / self.chunk_length;
        let within = (i % self.chunk_length) as usize;
        let len = dest.len();
        if chunk == self.sealed {
            dest.copy_from_slice(&self.tail[within][offset..offset + len]);
            return Ok(true);
        }

        let mut cached = self.cached.borrow_mut();
        let rows = match cached.take() {
            Some((n, rows)) if n == chunk => rows,
            _ => read_chunk(
                &chunk_path(dir, self.table.name(), chunk),
                &self.table,
                &self.layout,
                self.record_bytes,
            )?,
        };
        let record = rows.get(within).ok_or_else(|| {
            DbError::schema(format!(
                "chunk {} of table '{}' holds {} records",
                chunk,
                self.table.name(),
                rows.len()
            ))
        })?;
        dest.copy_from_slice(&record[offset..offset + len]);
        *cached = Some((chunk, rows));
        Ok(true)
    }
}

/// Parquet-backed database connection.
#[derive(Debug)]
pub struct ColumnarConnProxy {
    dir: PathBuf,
    tables: BTreeMap<String, TableStore>,
}

impl ColumnarConnProxy {
    /// Connection for the database directory `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tables: BTreeMap::new(),
        }
    }

    fn append(&mut self, table: &str, record: Vec<u8>) -> DbResult<u64> {
        let store = self
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?;
        store.append(&self.dir, record)
    }

    /// Chunk files in `dir`, grouped by table.
    fn chunk_files(dir: &Path) -> DbResult<BTreeMap<String, BTreeMap<u64, PathBuf>>> {
        let mut chunks: BTreeMap<String, BTreeMap<u64, PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let file = entry?.path();
            if file.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            match parse_chunk_file(&file) {
                Some((table, n)) => {
                    chunks.entry(table).or_default().insert(n, file);
                }
                None => debug!(file = %file.display(), "Skipping parquet file outside the chunk layout"),
            }
        }
        Ok(chunks)
    }

    fn open_table(name: &str, files: &BTreeMap<u64, PathBuf>) -> DbResult<TableStore> {
        let first = files
            .get(&0)
            .ok_or_else(|| DbError::schema(format!("table '{}' has no chunk 0", name)))?;
        let (schema, _) = inspect_chunk(first)?;
        let table = table_from_arrow(name, &schema)?;
        table.validate()?;
        let index = schema
            .metadata()
            .get(META_TABLE_INDEX)
            .and_then(|i| i.parse().ok())
            .unwrap_or(usize::MAX);

        let mut store = TableStore::new(table, index)?;
        let last = files.len() as u64 - 1;
        for (expected, (n, file)) in (0u64..).zip(files) {
            if *n != expected {
                return Err(DbError::schema(format!("table '{}' is missing chunk {}", name, expected)));
            }
            let (_, rows) = inspect_chunk(file)?;
            if rows == store.chunk_length {
                store.sealed += 1;
            } else if expected == last && rows < store.chunk_length {
                store.tail = read_chunk(file, &store.table, &store.layout, store.record_bytes)?;
            } else {
                return Err(DbError::schema(format!(
                    "chunk {} of table '{}' holds {} records; expected {}",
                    n, name, rows, store.chunk_length
                )));
            }
        }
        store.tail_dirty = false;
        Ok(store)
    }
}

impl DbConnProxy for ColumnarConnProxy {
    fn backend_name(&self) -> &'static str {
        "columnar"
    }

    fn validate_schema(&self, schema: &Schema) -> DbResult<()> {
        for table in schema.tables() {
            table.validate()?;
            if table.columns().is_empty() {
                return Err(DbError::schema(format!("table '{}' has no columns", table.name())));
            }
            if table.name().contains(['/', '\\']) {
                return Err(DbError::schema(format!(
                    "table '{}' cannot be stored as a file name",
                    table.name()
                )));
            }
            for col in table.columns() {
                if !col.is_fixed_size() {
                    return Err(DbError::Unsupported(format!(
                        "column '{}.{}' has variable-width type {}",
                        table.name(),
                        col.name(),
                        col.data_type()
                    )));
                }
            }
        }
        Ok(())
    }

    fn realize_schema(&mut self, schema: &Schema) -> DbResult<()> {
        self.validate_schema(schema)?;
        fs::create_dir_all(&self.dir)?;
        let stale = Self::chunk_files(&self.dir)?;
        for (index, table) in schema.tables().iter().enumerate() {
            for file in stale.get(table.name()).into_iter().flat_map(BTreeMap::values) {
                fs::remove_file(file)?;
            }
            let store = TableStore::new(table.clone(), index)?;
            self.tables.insert(table.name().to_string(), store);
        }
        self.flush()
    }

    fn connect_to_existing_database(&mut self, path: &Path) -> DbResult<Schema> {
        let mut found = Vec::new();
        for (name, files) in Self::chunk_files(path)? {
            found.push(Self::open_table(&name, &files)?);
        }
        found.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.table.name().cmp(b.table.name())));

        self.dir = path.to_path_buf();
        self.tables.clear();
        let mut tables = Vec::with_capacity(found.len());
        for (index, mut store) in found.into_iter().enumerate() {
            store.index = index;
            tables.push(store.table.clone());
            self.tables.insert(store.table.name().to_string(), store);
        }
        debug!(path = %path.display(), tables = tables.len(), "Opened columnar database");
        Schema::from_stored_tables(tables)
    }

    fn database_path(&self) -> Option<&Path> {
        Some(&self.dir)
    }

    fn has_object(&self, table: &str, id: u64) -> bool {
        id >= 1 && self.record_count(table) >= id
    }

    fn record_count(&self, table: &str) -> u64 {
        self.tables.get(table).map(TableStore::record_count).unwrap_or(0)
    }

    fn read_raw_bytes(&self, table: &str, field: &str, id: u64, dest: &mut [u8]) -> usize {
        let Some(store) = self.tables.get(table) else {
            warn!(table, "read_raw_bytes: unknown table");
            return 0;
        };
        let Some(pos) = store.table.columns().iter().position(|c| c.name() == field) else {
            warn!(table, field, "read_raw_bytes: unknown field");
            return 0;
        };
        let (offset, len) = store.layout[pos];
        if dest.len() != len {
            warn!(table, field, expected = len, requested = dest.len(), "read_raw_bytes: size mismatch");
            return 0;
        }
        match store.copy_field(&self.dir, id, offset, dest) {
            Ok(true) => len,
            Ok(false) => {
                warn!(table, id, "read_raw_bytes: no such record");
                0
            }
            Err(e) => {
                warn!(table, id, error = %e, "read_raw_bytes: chunk unreadable");
                0
            }
        }
    }

    fn create_object(&mut self, table: &str, values: &[ColumnValue]) -> DbResult<u64> {
        let record = self
            .tables
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?
            .table
            .pack_values(values)?;
        self.append(table, record)
    }

    fn create_fixed_size_object(&mut self, table: &str, bytes: &[u8]) -> DbResult<u64> {
        self.append(table, bytes.to_vec())
    }

    fn flush(&mut self) -> DbResult<()> {
        for store in self.tables.values_mut() {
            store.flush_tail(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ObjectManager;
    use tempfile::TempDir;

    #[test]
    fn test_compression_levels() {
        assert_eq!(parquet_compression(CompressionLevel::None), Compression::UNCOMPRESSED);
        assert!(matches!(
            parquet_compression(CompressionLevel::BestRatio),
            Compression::GZIP(_)
        ));
    }

    #[test]
    fn test_string_columns_rejected() {
        let dir = TempDir::new().unwrap();
        let mut schema = Schema::new();
        schema.add_table("T").unwrap().add_column("s", ColumnDataType::String);
        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        assert!(matches!(mgr.create_database(schema), Err(DbError::Unsupported(_))));
    }

    #[test]
    fn test_multi_dim_round_trip_through_reopen() {
        let dir = TempDir::new().unwrap();
        let mut schema = Schema::new();
        schema
            .add_table("H")
            .unwrap()
            .add_column("tick", ColumnDataType::UInt64)
            .index()
            .add_column("bins", ColumnDataType::Int32)
            .set_dimensions(&[2, 2])
            .add_column("tag", ColumnDataType::Char)
            .set_default_value("x")
            .set_chunk_length(2);
        {
            let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
            mgr.create_database(schema).unwrap();
            let f = mgr.factories("H").unwrap();
            let insert = |tick: u64| {
                (f.any_size)(&[
                    ColumnValue::UInt64(tick),
                    ColumnValue::Array((0..4).map(|k| ColumnValue::Int32(tick as i32 * 10 + k)).collect()),
                ])
                .unwrap()
            };
            assert_eq!(insert(1), 1);
            assert_eq!(insert(2), 2);
            assert_eq!(insert(3), 3);
            mgr.close().unwrap();
        }

        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        mgr.connect_to_existing_database(dir.path()).unwrap();
        let table = mgr.table("H").unwrap();
        assert_eq!(table.column("bins").unwrap().dimensions(), &[2, 2]);
        assert_eq!(table.chunk_length(), 2);
        assert!(table.column("tick").unwrap().is_indexed());
        assert_eq!(mgr.record_count("H"), 3);

        let mut bins = [0u8; 16];
        assert_eq!(mgr.read_raw_bytes("H", "bins", 3, &mut bins), 16);
        assert_eq!(i32::from_le_bytes([bins[12], bins[13], bins[14], bins[15]]), 33);
        let mut tag = [0u8; 1];
        assert_eq!(mgr.read_raw_bytes("H", "tag", 2, &mut tag), 1);
        assert_eq!(tag[0], b'x');
        assert_eq!(mgr.read_field_f64("H", "tick", 2), Some(2.0));
    }

    fn counter_schema(chunk: usize) -> Schema {
        let mut schema = Schema::new();
        schema
            .add_table("C")
            .unwrap()
            .add_column("n", ColumnDataType::UInt32)
            .set_chunk_length(chunk);
        schema
    }

    #[test]
    fn test_chunk_file_names() {
        let dir = Path::new("/db");
        assert_eq!(chunk_path(dir, "a.b", 7), PathBuf::from("/db/a.b.000007.parquet"));
        assert_eq!(
            parse_chunk_file(Path::new("/db/a.b.000007.parquet")),
            Some(("a.b".to_string(), 7))
        );
        assert_eq!(parse_chunk_file(Path::new("/db/a.parquet")), None);
    }

    #[test]
    fn test_reopened_tail_keeps_growing() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
            mgr.create_database(counter_schema(3)).unwrap();
            let f = mgr.factories("C").unwrap();
            for n in 1..=4u32 {
                (f.any_size)(&[ColumnValue::UInt32(n)]).unwrap();
            }
            mgr.close().unwrap();
        }

        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        mgr.connect_to_existing_database(dir.path()).unwrap();
        assert_eq!(mgr.record_count("C"), 4);
        let f = mgr.factories("C").unwrap();
        for n in 5..=7u32 {
            assert_eq!((f.any_size)(&[ColumnValue::UInt32(n)]).unwrap(), u64::from(n));
        }
        assert!(dir.path().join("C.000001.parquet").exists());
        assert!(!dir.path().join("C.000002.parquet").exists());
        for id in 1..=7u64 {
            assert_eq!(mgr.read_field_f64("C", "n", id), Some(id as f64));
        }
    }

    #[test]
    fn test_new_database_replaces_old_chunks() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
            mgr.create_database(counter_schema(2)).unwrap();
            let f = mgr.factories("C").unwrap();
            for n in 0..6u32 {
                (f.any_size)(&[ColumnValue::UInt32(n)]).unwrap();
            }
        }
        assert!(dir.path().join("C.000002.parquet").exists());

        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        mgr.create_database(counter_schema(2)).unwrap();
        assert!(!dir.path().join("C.000002.parquet").exists());
        mgr.close().unwrap();

        let mut reader = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        reader.connect_to_existing_database(dir.path()).unwrap();
        assert_eq!(reader.record_count("C"), 0);
    }

    #[test]
    fn test_missing_chunk_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
            mgr.create_database(counter_schema(1)).unwrap();
            let f = mgr.factories("C").unwrap();
            for n in 0..3u32 {
                (f.any_size)(&[ColumnValue::UInt32(n)]).unwrap();
            }
        }
        fs::remove_file(dir.path().join("C.000001.parquet")).unwrap();
        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        assert!(matches!(
            mgr.connect_to_existing_database(dir.path()),
            Err(DbError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_read_raw_bytes_mismatch_returns_zero() {
        let dir = TempDir::new().unwrap();
        let mut schema = Schema::new();
        schema.add_table("T").unwrap().add_column("x", ColumnDataType::Double);
        let mut mgr = ObjectManager::new(Box::new(ColumnarConnProxy::new(dir.path())));
        mgr.create_database(schema).unwrap();
        let f = mgr.factories("T").unwrap();
        let fixed = f.fixed_size.as_ref().unwrap();
        fixed(&7.0f64.to_le_bytes()).unwrap();
        assert!(fixed(&[0u8; 3]).is_err());

        let mut small = [0u8; 4];
        assert_eq!(mgr.read_raw_bytes("T", "x", 1, &mut small), 0);
        let mut buf = [0u8; 8];
        assert_eq!(mgr.read_raw_bytes("T", "nope", 1, &mut buf), 0);
        assert_eq!(mgr.read_raw_bytes("T", "x", 2, &mut buf), 0);
        assert_eq!(mgr.read_raw_bytes("T", "x", 1, &mut buf), 8);
        assert_eq!(f64::from_le_bytes(buf), 7.0);
    }
}
