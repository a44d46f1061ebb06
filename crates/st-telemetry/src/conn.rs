//! Database connection interface and object manager.
//!
//! A [`DbConnProxy`] is a storage backend. The [`ObjectManager`] owns one
//! proxy plus the realized schema, and hands out per-table record
//! factories:
//!
//! - a fixed-size factory taking a packed byte record (fixed-size tables only)
//! - an any-size factory taking typed column values

use crate::error::{DbError, DbResult};
use crate::schema::{ColumnValue, Schema, Table};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Storage backend contract.
pub trait DbConnProxy {
    /// Backend name for diagnostics.
    fn backend_name(&self) -> &'static str;

    /// Reject schemas this backend cannot store.
    fn validate_schema(&self, schema: &Schema) -> DbResult<()>;

    /// Create storage for every table of a finalized schema.
    fn realize_schema(&mut self, schema: &Schema) -> DbResult<()>;

    /// Open existing storage and reconstruct its schema.
    fn connect_to_existing_database(&mut self, path: &Path) -> DbResult<Schema>;

    fn database_path(&self) -> Option<&Path>;

    /// Whether record `id` (1-based) exists in `table`.
    fn has_object(&self, table: &str, id: u64) -> bool;

    fn record_count(&self, table: &str) -> u64;

    /// Copy one field of record `id` into `dest`.
    ///
    /// Returns the bytes copied; 0 if the table, field or id is unknown or
    /// `dest.len()` differs from the field size.
    fn read_raw_bytes(&self, table: &str, field: &str, id: u64, dest: &mut [u8]) -> usize;

    /// Append a record from typed values; returns its id.
    fn create_object(&mut self, table: &str, values: &[ColumnValue]) -> DbResult<u64>;

    /// Append a packed fixed-size record; returns its id.
    fn create_fixed_size_object(&mut self, table: &str, bytes: &[u8]) -> DbResult<u64>;

    /// Persist buffered records.
    fn flush(&mut self) -> DbResult<()>;

    fn close(&mut self) -> DbResult<()> {
        self.flush()
    }
}

/// Factory appending packed records to one table.
pub type FixedSizeFactory = Box<dyn Fn(&[u8]) -> DbResult<u64>>;

/// Factory appending typed records to one table.
pub type AnySizeFactory = Box<dyn Fn(&[ColumnValue]) -> DbResult<u64>>;

/// Record factories for one table.
pub struct ObjectFactories {
    pub table: String,
    /// Present only for fixed-size tables.
    pub fixed_size: Option<FixedSizeFactory>,
    pub any_size: AnySizeFactory,
}

impl std::fmt::Debug for ObjectFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFactories")
            .field("table", &self.table)
            .field("fixed_size", &self.fixed_size.is_some())
            .finish()
    }
}

/// Owner of a database connection and its schema.
pub struct ObjectManager {
    proxy: Rc<RefCell<Box<dyn DbConnProxy>>>,
    schema: Schema,
    connected: bool,
}

impl ObjectManager {
    pub fn new(proxy: Box<dyn DbConnProxy>) -> Self {
        Self {
            proxy: Rc::new(RefCell::new(proxy)),
            schema: Schema::new(),
            connected: false,
        }
    }

    /// Finalize, validate and realize `schema`.
    pub fn create_database(&mut self, mut schema: Schema) -> DbResult<()> {
        schema.finalize()?;
        {
            let mut proxy = self.proxy.borrow_mut();
            proxy.validate_schema(&schema)?;
            proxy.realize_schema(&schema)?;
            debug!(
                backend = proxy.backend_name(),
                tables = schema.tables().len(),
                "Realized database schema"
            );
        }
        self.schema = schema;
        self.connected = true;
        Ok(())
    }

    /// Open an existing database; its schema is reconstructed from storage.
    pub fn connect_to_existing_database(&mut self, path: &Path) -> DbResult<()> {
        let schema = self.proxy.borrow_mut().connect_to_existing_database(path)?;
        self.schema = schema;
        self.connected = true;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn table(&self, name: &str) -> DbResult<&Table> {
        self.schema
            .table(name)
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.proxy.borrow().database_path().map(Path::to_path_buf)
    }

    /// Factories writing into `table`.
    pub fn factories(&self, table: &str) -> DbResult<ObjectFactories> {
        if !self.connected {
            return Err(DbError::NotConnected);
        }
        let def = self.table(table)?;

        let fixed_size: Option<FixedSizeFactory> = if def.is_fixed_size() {
            let proxy = Rc::clone(&self.proxy);
            let name = table.to_string();
            Some(Box::new(move |bytes: &[u8]| {
                proxy.borrow_mut().create_fixed_size_object(&name, bytes)
            }))
        } else {
            None
        };

        let proxy = Rc::clone(&self.proxy);
        let name = table.to_string();
        let any_size: AnySizeFactory = Box::new(move |values: &[ColumnValue]| {
            proxy.borrow_mut().create_object(&name, values)
        });

        Ok(ObjectFactories {
            table: table.to_string(),
            fixed_size,
            any_size,
        })
    }

    pub fn has_object(&self, table: &str, id: u64) -> bool {
        self.proxy.borrow().has_object(table, id)
    }

    pub fn record_count(&self, table: &str) -> u64 {
        self.proxy.borrow().record_count(table)
    }

    pub fn read_raw_bytes(&self, table: &str, field: &str, id: u64, dest: &mut [u8]) -> usize {
        self.proxy.borrow().read_raw_bytes(table, field, id, dest)
    }

    /// Read one field as f64, whatever its numeric type.
    pub fn read_field_f64(&self, table: &str, field: &str, id: u64) -> Option<f64> {
        let column = self.schema.table(table)?.column(field)?;
        let len = column.byte_len()?;
        let mut buf = vec![0u8; len];
        if self.read_raw_bytes(table, field, id, &mut buf) != len {
            return None;
        }
        crate::columnar::decode_scalar(column.data_type(), &buf).and_then(|v| v.as_f64())
    }

    pub fn flush(&self) -> DbResult<()> {
        self.proxy.borrow_mut().flush()
    }

    pub fn close(&mut self) -> DbResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.proxy.borrow_mut().close()
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        if self.connected {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close database on drop");
            }
        }
    }
}
