//! FILTER: keep the rows where a BOOL predicate is true and not null.
//!
//! The predicate either arrives as a materialized BOOL vector or, when the
//! optimizer fused a comparison into the filter, as a compare-and-select
//! pass that never builds the intermediate vector. Low-selectivity results
//! go through a selection-vector gather; high-selectivity dense vectors
//! copy contiguous runs instead. Parted inputs are filtered segment by
//! segment, keeping their partitioning with updated segment lengths.

use crate::block::{data, Header};
use crate::error::{Error, Result};
use crate::exec::{dense_column, gather, kernels, Executor};
use crate::graph::{OpFlags, OpId};
use crate::types::TypeTag;
use crate::value::Value;

impl Executor<'_> {
    pub(super) fn exec_filter(&mut self, _id: OpId, in0: OpId, in1: OpId) -> Result<Value> {
        let input = self.eval(in0)?;
        let pred_node = self.g.node(in1).clone();
        let selection = if pred_node.flags.contains(OpFlags::FUSED) {
            let a = self.eval(pred_node.inputs[0])?;
            let b = self.eval(pred_node.inputs[1])?;
            kernels::compare_selection(pred_node.opcode, &a, &b)?
        } else {
            let pred = self.eval(in1)?;
            selection_of(&pred)?
        };
        apply_selection(&input, &selection)
    }
}

/// Global row indices where the predicate is true and not null.
pub(crate) fn selection_of(pred: &Value) -> Result<Vec<i64>> {
    let dense = dense_column(pred)?;
    if dense.vec_tag_or_base()? != TypeTag::Bool {
        return Err(Error::Type(format!(
            "filter predicate has tag {}, expected BOOL",
            pred.tag()
        )));
    }
    let n = dense.header().len();
    let mut out = Vec::new();
    for i in 0..n {
        if !dense.is_null_at(i)? && dense.get_i64(i)? != 0 {
            out.push(i);
        }
    }
    Ok(out)
}

/// Apply a selection to a vector or every column of a table.
pub(crate) fn apply_selection(input: &Value, selection: &[i64]) -> Result<Value> {
    if input.is_table() {
        let mut out = Value::table()?;
        for c in 0..input.ncols() {
            let col = input.col_by_idx(c)?;
            out.add_col(input.col_name(c)?, filter_column(&col, selection)?)?;
        }
        return Ok(out);
    }
    filter_column(input, selection)
}

fn filter_column(col: &Value, selection: &[i64]) -> Result<Value> {
    if col.is_parted() {
        // Each segment filters independently; the output keeps the
        // partitioning with updated segment lengths.
        let base = col.parted_base_tag()?;
        let mut segments = Vec::with_capacity(col.nsegments() as usize);
        let mut seg_start = 0i64;
        let mut cursor = 0usize;
        for s in 0..col.nsegments() {
            let seg = col.segment(s)?;
            let seg_len = seg.header().len();
            let mut local = Vec::new();
            while cursor < selection.len() && selection[cursor] < seg_start + seg_len {
                local.push(selection[cursor] - seg_start);
                cursor += 1;
            }
            segments.push(gather(&seg, &local)?);
            seg_start += seg_len;
        }
        return Value::parted(base, segments);
    }
    if col.is_partition_map() {
        let dense = col.partition_map_expand()?;
        return gather(&dense, selection);
    }
    let n = col.header().len();
    // Dense copy beats a gather once most rows survive.
    if selection.len() * 2 >= n as usize && dense_copy_ok(col) {
        return run_copy(col, selection);
    }
    gather(col, selection)
}

fn dense_copy_ok(col: &Value) -> bool {
    !matches!(
        col.vec_tag_or_base(),
        Ok(TypeTag::List) | Ok(TypeTag::Str) | Err(_)
    ) && !col.attrs().contains(crate::types::Attrs::HAS_NULLS)
}

/// High-selectivity path: copy maximal runs of consecutive selected rows
/// with one memcpy each.
fn run_copy(col: &Value, selection: &[i64]) -> Result<Value> {
    let tag = col.vec_tag_or_base()?;
    let out = if tag == TypeTag::Sym {
        Value::sym_vec(col.elem_width(), selection.len() as i64)?
    } else {
        Value::vec(tag, selection.len() as i64)?
    };
    let w = col.elem_width();
    unsafe {
        let (src_base, src_off, _owner): (*mut u8, i64, *mut Header) =
            crate::block::resolve(col.raw());
        let dst = data(out.raw());
        let mut written = 0usize;
        let mut i = 0usize;
        while i < selection.len() {
            let run_start = selection[i];
            let mut run_len = 1usize;
            while i + run_len < selection.len()
                && selection[i + run_len] == run_start + run_len as i64
            {
                run_len += 1;
            }
            std::ptr::copy_nonoverlapping(
                src_base.add(((src_off + run_start) as usize) * w),
                dst.add(written * w),
                run_len * w,
            );
            written += run_len;
            i += run_len;
        }
        (*out.raw()).set_len(selection.len() as i64);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_skips_false_and_null() -> Result<()> {
        let mut pred = Value::bool_vec(&[true, false, true, true])?;
        pred.set_null(2, true)?;
        assert_eq!(selection_of(&pred)?, vec![0, 3]);
        Ok(())
    }

    #[test]
    fn filters_vectors_and_tables() -> Result<()> {
        let t = Value::table_from(
            &["id", "v"],
            vec![
                Value::i64_vec(&[1, 2, 3, 4])?,
                Value::f64_vec(&[0.1, 0.2, 0.3, 0.4])?,
            ],
        )?;
        let out = apply_selection(&t, &[1, 3])?;
        assert_eq!(out.nrows(), 2);
        assert_eq!(out.col("id").unwrap().get_i64(0)?, 2);
        assert_eq!(out.col("v").unwrap().get_f64(1)?, 0.4);
        Ok(())
    }

    #[test]
    fn parted_columns_filter_per_segment() -> Result<()> {
        let p = Value::parted(
            TypeTag::I64,
            vec![Value::i64_vec(&[1, 2, 3])?, Value::i64_vec(&[4, 5])?],
        )?;
        // Keep rows 1, 2 (segment 0) and 4 (segment 1, local row 1).
        let out = filter_column(&p, &[1, 2, 4])?;
        assert!(out.is_parted());
        assert_eq!(out.segment(0)?.header().len(), 2);
        assert_eq!(out.segment(1)?.header().len(), 1);
        assert_eq!(out.segment(1)?.get_i64(0)?, 5);
        Ok(())
    }

    #[test]
    fn run_copy_matches_gather() -> Result<()> {
        let v = Value::i64_vec(&(0..100).collect::<Vec<_>>())?;
        let selection: Vec<i64> = (0..100).filter(|i| i % 10 != 0).collect();
        let fast = filter_column(&v, &selection)?;
        let slow = gather(&v, &selection)?;
        assert_eq!(fast.len(), slow.len());
        for i in 0..fast.len() {
            assert_eq!(fast.get_i64(i)?, slow.get_i64(i)?);
        }
        Ok(())
    }
}
