//! Table primitives.
//!
//! A table block's payload is the name-id prefix (`ncols` interned symbol
//! ids as i64) followed by `ncols` column pointers. The schema accessor
//! hands out an I64 vector view over the prefix without copying. Name
//! lookup is a linear scan; column counts are expected to be small.

use crate::block::{self, data, Header};
use crate::error::{Error, Result};
use crate::mem;
use crate::sym;
use crate::types::{Attrs, TypeTag};
use crate::value::Value;

/// Row count of a column, summing segments for parted columns.
pub(crate) fn col_nrows(col: &Value) -> i64 {
    if col.is_parted() {
        col.parted_nrows()
    } else if col.is_partition_map() {
        col.partition_map_nrows()
    } else {
        col.header().len()
    }
}

impl Value {
    /// New table with no columns.
    pub fn table() -> Result<Value> {
        let p = mem::alloc(2 * 16)?;
        unsafe {
            (*p).tag = TypeTag::Table as i8;
            (*p).set_len(0);
        }
        Ok(Value::from_raw(p))
    }

    /// Build a table from column names and columns.
    pub fn table_from(names: &[&str], cols: Vec<Value>) -> Result<Value> {
        if names.len() != cols.len() {
            return Err(Error::LengthMismatch {
                left: names.len() as i64,
                right: cols.len() as i64,
            });
        }
        let mut t = Value::table()?;
        for (name, col) in names.iter().zip(cols) {
            t.add_col(sym::intern_str(name)?, col)?;
        }
        Ok(t)
    }

    fn expect_table(&self) -> Result<()> {
        if !self.is_table() {
            return Err(Error::Type(format!("tag {} is not a table", self.tag())));
        }
        Ok(())
    }

    pub fn ncols(&self) -> i64 {
        if self.is_table() { self.header().len() } else { 0 }
    }

    /// Row count: the shared length of the columns (parted columns count
    /// across their segments).
    pub fn nrows(&self) -> i64 {
        if !self.is_table() || self.header().len() == 0 {
            return 0;
        }
        col_nrows(&self.col_by_idx(0).expect("column 0"))
    }

    /// Append a column, taking ownership. Non-parted columns must match the
    /// existing row count. The layout is rebuilt so the name-id prefix
    /// stays contiguous.
    pub fn add_col(&mut self, name_id: i64, col: Value) -> Result<()> {
        self.expect_table()?;
        let n = self.header().len() as usize;
        if n > 0 && !col.is_parted() && !col.is_partition_map() {
            let (have, new) = (self.nrows(), col_nrows(&col));
            if have != new {
                return Err(Error::LengthMismatch { left: have, right: new });
            }
        }
        self.make_unique()?;
        let p = mem::alloc((n + 1) * 16)?;
        unsafe {
            (*p).tag = TypeTag::Table as i8;
            (*p).set_len((n + 1) as i64);
            let old = self.raw();
            let old_ids = data(old) as *const i64;
            let old_cols = data(old).add(n * 8) as *const *mut Header;
            let ids = data(p) as *mut i64;
            let cols = data(p).add((n + 1) * 8) as *mut *mut Header;
            for i in 0..n {
                *ids.add(i) = *old_ids.add(i);
                *cols.add(i) = *old_cols.add(i);
            }
            *ids.add(n) = name_id;
            *cols.add(n) = col.into_raw();
            // The new block took over the children; empty the old shell so
            // dropping it does not release them.
            (*old).set_len(0);
        }
        let rebuilt = Value::from_raw(p);
        let _old = std::mem::replace(self, rebuilt);
        Ok(())
    }

    /// Interned name id of column `idx`.
    pub fn col_name(&self, idx: i64) -> Result<i64> {
        self.expect_table()?;
        if idx < 0 || idx >= self.header().len() {
            return Err(Error::Range(format!("column {idx} out of range")));
        }
        Ok(unsafe { *(data(self.raw()) as *const i64).add(idx as usize) })
    }

    /// Column `idx`, retained.
    pub fn col_by_idx(&self, idx: i64) -> Result<Value> {
        self.expect_table()?;
        if idx < 0 || idx >= self.header().len() {
            return Err(Error::Range(format!("column {idx} out of range")));
        }
        let n = self.header().len() as usize;
        unsafe {
            let cols = data(self.raw()).add(n * 8) as *const *mut Header;
            Ok(Value::retaining(*cols.add(idx as usize)))
        }
    }

    /// Linear-scan lookup by interned name id.
    pub fn col_index(&self, name_id: i64) -> Option<i64> {
        if !self.is_table() {
            return None;
        }
        let n = self.header().len();
        let ids = unsafe { data(self.raw()) as *const i64 };
        (0..n).find(|&i| unsafe { *ids.add(i as usize) } == name_id)
    }

    pub fn col_by_name(&self, name_id: i64) -> Option<Value> {
        self.col_index(name_id)
            .and_then(|i| self.col_by_idx(i).ok())
    }

    /// Lookup by string name.
    pub fn col(&self, name: &str) -> Option<Value> {
        sym::find(name.as_bytes()).and_then(|id| self.col_by_name(id))
    }

    /// I64 vector view of the name-id prefix.
    pub fn schema(&self) -> Result<Value> {
        self.expect_table()?;
        let n = self.header().len();
        let p = mem::alloc(0)?;
        unsafe {
            block::retain_raw(self.raw());
            (*p).tag = TypeTag::I64 as i8;
            (*p).attrs = Attrs::SLICE.bits();
            (*p).set_len(n);
            (*p).set_slice_parent(self.raw());
            (*p).set_slice_offset(0);
        }
        Ok(Value::from_raw(p))
    }

    /// Replace a column in place by index, keeping its name.
    pub(crate) fn set_col(&mut self, idx: i64, col: Value) -> Result<()> {
        self.expect_table()?;
        if idx < 0 || idx >= self.header().len() {
            return Err(Error::Range(format!("column {idx} out of range")));
        }
        self.make_unique()?;
        let n = self.header().len() as usize;
        unsafe {
            let cols = data(self.raw()).add(n * 8) as *mut *mut Header;
            let old = *cols.add(idx as usize);
            *cols.add(idx as usize) = col.into_raw();
            block::release_raw(old);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_look_up() -> Result<()> {
        let t = Value::table_from(
            &["id", "v"],
            vec![Value::i64_vec(&[1, 2, 3])?, Value::f64_vec(&[0.5, 1.5, 2.5])?],
        )?;
        assert_eq!(t.ncols(), 2);
        assert_eq!(t.nrows(), 3);
        assert_eq!(t.col("v").unwrap().get_f64(2)?, 2.5);
        assert!(t.col("missing").is_none());
        Ok(())
    }

    #[test]
    fn mismatched_column_lengths_are_rejected() -> Result<()> {
        let mut t = Value::table_from(&["a"], vec![Value::i64_vec(&[1, 2])?])?;
        let err = t.add_col(sym::intern_str("b")?, Value::i64_vec(&[1])?);
        assert!(matches!(err, Err(Error::LengthMismatch { left: 2, right: 1 })));
        Ok(())
    }

    #[test]
    fn schema_views_the_name_prefix() -> Result<()> {
        let t = Value::table_from(
            &["price", "qty"],
            vec![Value::f64_vec(&[1.0])?, Value::i64_vec(&[2])?],
        )?;
        let schema = t.schema()?;
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.get_i64(0)?, sym::intern_str("price")?);
        assert_eq!(schema.get_i64(1)?, sym::intern_str("qty")?);
        Ok(())
    }

    #[test]
    fn tables_release_columns() -> Result<()> {
        let col = Value::i64_vec(&[1])?;
        let rc0 = col.rc();
        let t = Value::table_from(&["x"], vec![col.clone()])?;
        assert_eq!(col.rc(), rc0 + 1);
        drop(t);
        assert_eq!(col.rc(), rc0);
        Ok(())
    }
}
