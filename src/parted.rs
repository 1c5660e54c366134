//! Parted columns and the virtual partition-key map.
//!
//! A parted vector stores one concrete segment vector per partition; reads,
//! filters and reductions iterate the segments, and the logical row count
//! is the sum of segment lengths. The partition-key map column carries
//! `{key_values, row_counts}` and produces per-row keys without per-row
//! storage.

use crate::block::{data, Header};
use crate::error::{Error, Result};
use crate::mem;
use crate::types::{parted_base, TypeTag, MAPCOMMON, PARTED_BASE};
use crate::value::Value;

impl Value {
    /// Build a parted vector from per-partition segments of base type
    /// `base`.
    pub fn parted(base: TypeTag, segments: Vec<Value>) -> Result<Value> {
        for s in &segments {
            if s.tag() != base as i8 {
                return Err(Error::Type(format!(
                    "segment tag {} does not match base {base:?}",
                    s.tag()
                )));
            }
        }
        let p = mem::alloc(segments.len().max(1) * 8)?;
        unsafe {
            (*p).tag = PARTED_BASE + base as i8;
            (*p).set_len(segments.len() as i64);
            let kids = data(p) as *mut *mut Header;
            for (i, s) in segments.into_iter().enumerate() {
                *kids.add(i) = s.into_raw();
            }
        }
        Ok(Value::from_raw(p))
    }

    /// Base element type of a parted vector.
    pub fn parted_base_tag(&self) -> Result<TypeTag> {
        if !self.is_parted() {
            return Err(Error::Type(format!("tag {} is not parted", self.tag())));
        }
        TypeTag::try_from(parted_base(self.tag()))
            .map_err(|_| Error::Corrupt(format!("bad parted tag {}", self.tag())))
    }

    pub fn nsegments(&self) -> i64 {
        if self.is_parted() { self.header().len() } else { 0 }
    }

    /// Segment `i`, retained.
    pub fn segment(&self, i: i64) -> Result<Value> {
        if !self.is_parted() {
            return Err(Error::Type(format!("tag {} is not parted", self.tag())));
        }
        if i < 0 || i >= self.header().len() {
            return Err(Error::Range(format!("segment {i} out of range")));
        }
        unsafe {
            let kids = data(self.raw()) as *const *mut Header;
            Ok(Value::retaining(*kids.add(i as usize)))
        }
    }

    /// Total rows across all segments.
    pub fn parted_nrows(&self) -> i64 {
        let mut total = 0;
        for i in 0..self.nsegments() {
            if let Ok(seg) = self.segment(i) {
                total += seg.header().len();
            }
        }
        total
    }

    /// Resolve a global row index to `(segment index, local row)`.
    pub(crate) fn parted_locate(&self, row: i64) -> Result<(i64, i64)> {
        let mut remaining = row;
        for i in 0..self.nsegments() {
            let n = self.segment(i)?.header().len();
            if remaining < n {
                return Ok((i, remaining));
            }
            remaining -= n;
        }
        Err(Error::Range(format!(
            "row {row} out of bounds for parted length {}",
            self.parted_nrows()
        )))
    }

    // ----- partition-key map -----

    /// Build the virtual partition-key column: `keys[i]` is the key of
    /// partition `i`, `counts[i]` its row count.
    pub fn partition_map(keys: Value, counts: Value) -> Result<Value> {
        if keys.header().len() != counts.header().len() {
            return Err(Error::LengthMismatch {
                left: keys.header().len(),
                right: counts.header().len(),
            });
        }
        let p = mem::alloc(16)?;
        unsafe {
            (*p).tag = MAPCOMMON;
            (*p).set_len(2);
            let kids = data(p) as *mut *mut Header;
            *kids.add(0) = keys.into_raw();
            *kids.add(1) = counts.into_raw();
        }
        Ok(Value::from_raw(p))
    }

    pub fn partition_map_keys(&self) -> Result<Value> {
        self.partition_map_child(0)
    }

    pub fn partition_map_counts(&self) -> Result<Value> {
        self.partition_map_child(1)
    }

    fn partition_map_child(&self, i: usize) -> Result<Value> {
        if !self.is_partition_map() {
            return Err(Error::Type(format!(
                "tag {} is not a partition map",
                self.tag()
            )));
        }
        unsafe {
            let kids = data(self.raw()) as *const *mut Header;
            Ok(Value::retaining(*kids.add(i)))
        }
    }

    pub fn partition_map_nrows(&self) -> i64 {
        let Ok(counts) = self.partition_map_counts() else {
            return 0;
        };
        (0..counts.header().len())
            .map(|i| counts.get_i64(i).unwrap_or(0))
            .sum()
    }

    /// Expand the map into a dense vector, repeating each key by its row
    /// count. Used when an operator needs a concrete column.
    pub fn partition_map_expand(&self) -> Result<Value> {
        let keys = self.partition_map_keys()?;
        let counts = self.partition_map_counts()?;
        let total = self.partition_map_nrows();
        let tag = keys.vec_tag_or_base()?;
        let mut out = if tag == TypeTag::Sym {
            Value::sym_vec(keys.elem_width(), total)?
        } else {
            Value::vec(tag, total)?
        };
        for i in 0..keys.header().len() {
            let k = keys.get_i64(i)?;
            for _ in 0..counts.get_i64(i)? {
                out.push_i64(k)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parted_row_count_is_segment_sum() -> Result<()> {
        let p = Value::parted(
            TypeTag::I64,
            vec![
                Value::i64_vec(&[1, 2, 3])?,
                Value::i64_vec(&[])?,
                Value::i64_vec(&[4, 5])?,
            ],
        )?;
        assert_eq!(p.nsegments(), 3);
        assert_eq!(p.parted_nrows(), 5);
        assert_eq!(p.parted_locate(3)?, (2, 0));
        assert!(p.parted_locate(5).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_segment_type_is_rejected() -> Result<()> {
        let err = Value::parted(TypeTag::I64, vec![Value::f64_vec(&[1.0])?]);
        assert!(matches!(err, Err(Error::Type(_))));
        Ok(())
    }

    #[test]
    fn partition_map_expands_by_counts() -> Result<()> {
        let map = Value::partition_map(
            Value::i64_vec(&[20240101, 20240102])?,
            Value::i64_vec(&[3, 2])?,
        )?;
        assert_eq!(map.partition_map_nrows(), 5);
        let dense = map.partition_map_expand()?;
        assert_eq!(dense.len(), 5);
        assert_eq!(dense.get_i64(0)?, 20240101);
        assert_eq!(dense.get_i64(2)?, 20240101);
        assert_eq!(dense.get_i64(3)?, 20240102);
        Ok(())
    }
}
