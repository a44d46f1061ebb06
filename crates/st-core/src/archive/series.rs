//! Per-leaf time series read back from `values.bin`.

use super::VALUE_BYTES;
use memmap2::Mmap;
use st_common::Result;
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::trace;

/// Values of one leaf across every stored row.
///
/// The file is memory-mapped on first access and the extracted values are
/// cached until the owning controller synchronizes.
pub struct ArchiveDataSeries {
    path: PathBuf,
    leaf_index: usize,
    leaf_count: usize,
    source_generation: Rc<Cell<u64>>,
    cache: RefCell<Option<(u64, Rc<Vec<f64>>)>>,
}

impl ArchiveDataSeries {
    pub(crate) fn new(path: PathBuf, leaf_index: usize, leaf_count: usize, source_generation: Rc<Cell<u64>>) -> Self {
        Self {
            path,
            leaf_index,
            leaf_count,
            source_generation,
            cache: RefCell::new(None),
        }
    }

    pub fn leaf_index(&self) -> usize {
        self.leaf_index
    }

    /// Every stored value of this leaf, oldest first.
    pub fn data(&self) -> Result<Rc<Vec<f64>>> {
        let generation = self.source_generation.get();
        if let Some((cached_gen, values)) = self.cache.borrow().as_ref() {
            if *cached_gen == generation {
                return Ok(Rc::clone(values));
            }
        }
        let values = Rc::new(self.read_all()?);
        *self.cache.borrow_mut() = Some((generation, Rc::clone(&values)));
        Ok(values)
    }

    /// Value at `row`, if stored.
    pub fn value_at(&self, row: usize) -> Result<Option<f64>> {
        Ok(self.data()?.get(row).copied())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.data()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop the cached values.
    pub fn invalidate(&self) {
        self.cache.borrow_mut().take();
    }

    fn read_all(&self) -> Result<Vec<f64>> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len() as usize;
        let row_bytes = self.leaf_count * VALUE_BYTES;
        if len == 0 || row_bytes == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: values.bin is only ever appended to; rows already counted
        // by `len` are never rewritten while mapped.
        let map = unsafe { Mmap::map(&file)? };
        let rows = len / row_bytes;
        let mut out = Vec::with_capacity(rows);
        for row in 0..rows {
            let offset = row * row_bytes + self.leaf_index * VALUE_BYTES;
            let mut bytes = [0u8; VALUE_BYTES];
            bytes.copy_from_slice(&map[offset..offset + VALUE_BYTES]);
            out.push(f64::from_le_bytes(bytes));
        }
        trace!(path = %self.path.display(), leaf = self.leaf_index, rows, "Archive series loaded");
        Ok(out)
    }
}

impl std::fmt::Debug for ArchiveDataSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDataSeries")
            .field("path", &self.path)
            .field("leaf_index", &self.leaf_index)
            .field("cached", &self.cache.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::VALUES_FILE;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_rows(path: &std::path::Path, rows: &[[f64; 2]], append: bool) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(path)
            .unwrap();
        for row in rows {
            for v in row {
                f.write_all(&v.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn test_cache_follows_generation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(VALUES_FILE);
        write_rows(&path, &[[1.0, 10.0], [2.0, 20.0]], false);
        let generation = Rc::new(Cell::new(0));
        let series = ArchiveDataSeries::new(path.clone(), 1, 2, Rc::clone(&generation));
        assert_eq!(*series.data().unwrap(), vec![10.0, 20.0]);

        write_rows(&path, &[[3.0, 30.0]], true);
        assert_eq!(series.len().unwrap(), 2, "cached until synchronized");
        generation.set(1);
        assert_eq!(*series.data().unwrap(), vec![10.0, 20.0, 30.0]);
        assert_eq!(series.value_at(2).unwrap(), Some(30.0));
        assert_eq!(series.value_at(3).unwrap(), None);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(VALUES_FILE);
        std::fs::write(&path, b"").unwrap();
        let series = ArchiveDataSeries::new(path, 0, 2, Rc::new(Cell::new(0)));
        assert!(series.is_empty().unwrap());
    }
}
