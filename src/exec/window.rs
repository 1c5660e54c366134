//! WINDOW: partition, order, then per-row analytic functions.
//!
//! Each output column has exactly the input's row count; results land back
//! on original row positions after the per-partition ordering. Framed
//! aggregates honor ROWS frames directly; RANGE frames resolve peers by
//! the first order key (and numeric offsets require a numeric single
//! order key).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::exec::group::{key_at, KeyVal};
use crate::exec::sort::{compare_rows, prefetch_key, KeySpec};
use crate::exec::{dense_column, Executor};
use crate::graph::{ExtData, Frame, OpId};
use crate::sym;
use crate::types::{FrameBound, FrameType, TypeTag, WindowFunc};
use crate::value::Value;

impl Executor<'_> {
    pub(super) fn exec_window(&mut self, id: OpId, in0: OpId) -> Result<Value> {
        let Some(ExtData::Window {
            part,
            order,
            order_desc,
            funcs,
            frame,
        }) = self.g.ext_of(id).cloned()
        else {
            return Err(Error::Corrupt("window node without descriptor".into()));
        };
        let input = self.eval(in0)?;
        if !input.is_table() {
            return Err(Error::Type(format!(
                "window input has tag {}, expected a table",
                input.tag()
            )));
        }
        let n = input.nrows();

        // Partition assignment in first-appearance order.
        let part_cols: Vec<Value> = part
            .iter()
            .map(|&p| Ok(dense_column(&self.eval(p)?)?))
            .collect::<Result<_>>()?;
        let mut partitions: Vec<Vec<i64>> = Vec::new();
        let mut index: HashMap<Vec<KeyVal>, usize> = HashMap::new();
        for row in 0..n {
            let key: Vec<KeyVal> = part_cols
                .iter()
                .map(|c| key_at(c, row))
                .collect::<Result<_>>()?;
            let slot = *index.entry(key).or_insert_with(|| {
                partitions.push(Vec::new());
                partitions.len() - 1
            });
            partitions[slot].push(row);
        }
        if part_cols.is_empty() {
            partitions = vec![(0..n).collect()];
        }

        // Order within partitions. Default null placement: last when
        // ascending, first when descending.
        let mut specs = Vec::with_capacity(order.len());
        for (&o, &d) in order.iter().zip(&order_desc) {
            let col = self.eval(o)?;
            specs.push(KeySpec {
                key: prefetch_key(&col)?,
                desc: d,
                nulls_first: d,
            });
        }
        for p in &mut partitions {
            if !specs.is_empty() {
                p.sort_by(|&a, &b| compare_rows(&specs, a, b));
            }
        }

        // Function inputs as dense columns.
        let mut func_cols: Vec<Option<(Value, bool)>> = Vec::with_capacity(funcs.len());
        for (f, input_id) in &funcs {
            match input_id {
                Some(iid) if f.needs_input() => {
                    let col = dense_column(&self.eval(*iid)?)?;
                    let float = col.vec_tag_or_base()? == TypeTag::F64;
                    func_cols.push(Some((col, float)));
                }
                _ => func_cols.push(None),
            }
        }

        let mut out = Value::table()?;
        for c in 0..input.ncols() {
            let col = input.col_by_idx(c)?;
            out.add_col(input.col_name(c)?, crate::exec::materialize_col(&col)?)?;
        }
        for (i, (f, _)) in funcs.iter().enumerate() {
            let col = compute_function(*f, &partitions, &specs, &func_cols[i], &frame, n)?;
            let name = format!("{}_{}", func_name(*f), i);
            out.add_col(sym::intern_str(&name)?, col)?;
        }
        Ok(out)
    }
}

fn func_name(f: WindowFunc) -> &'static str {
    match f {
        WindowFunc::RowNumber => "row_number",
        WindowFunc::Rank => "rank",
        WindowFunc::DenseRank => "dense_rank",
        WindowFunc::Ntile(_) => "ntile",
        WindowFunc::Lag(_) => "lag",
        WindowFunc::Lead(_) => "lead",
        WindowFunc::FirstValue => "first_value",
        WindowFunc::LastValue => "last_value",
        WindowFunc::NthValue(_) => "nth_value",
        WindowFunc::Sum => "sum",
        WindowFunc::Avg => "avg",
        WindowFunc::Min => "min",
        WindowFunc::Max => "max",
        WindowFunc::Count => "count",
    }
}

/// Per-row result staged before the column is built.
#[derive(Clone, Copy)]
enum Cell {
    Null,
    Int(i64),
    Float(f64),
}

fn build_column(cells: &[Cell], float: bool) -> Result<Value> {
    let mut out = if float {
        Value::vec(TypeTag::F64, cells.len() as i64)?
    } else {
        Value::vec(TypeTag::I64, cells.len() as i64)?
    };
    for c in cells {
        match c {
            Cell::Null => out.push_null()?,
            Cell::Int(v) if float => out.push_f64(*v as f64)?,
            Cell::Int(v) => out.push_i64(*v)?,
            Cell::Float(v) if float => out.push_f64(*v)?,
            Cell::Float(v) => out.push_i64(*v as i64)?,
        }
    }
    Ok(out)
}

fn value_cell(col: &Value, float: bool, row: i64) -> Result<Cell> {
    if col.is_null_at(row)? {
        return Ok(Cell::Null);
    }
    Ok(if float {
        Cell::Float(col.get_f64(row)?)
    } else {
        Cell::Int(col.get_i64(row)?)
    })
}

/// Resolve the ROWS frame `[lo, hi]` (inclusive positions) for `pos` in a
/// partition of `len` rows.
fn rows_frame(frame: &Frame, pos: i64, len: i64) -> (i64, i64) {
    let lo = match frame.start {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::Preceding(k) => (pos - k).max(0),
        FrameBound::CurrentRow => pos,
        FrameBound::Following(k) => (pos + k).min(len - 1),
        FrameBound::UnboundedFollowing => len - 1,
    };
    let hi = match frame.end {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::Preceding(k) => (pos - k).max(0),
        FrameBound::CurrentRow => pos,
        FrameBound::Following(k) => (pos + k).min(len - 1),
        FrameBound::UnboundedFollowing => len - 1,
    };
    (lo, hi.min(len - 1))
}

/// Peer range for RANGE frames: rows whose order keys compare equal.
fn peer_range(rows: &[i64], specs: &[KeySpec], pos: i64) -> (i64, i64) {
    let len = rows.len() as i64;
    let mut lo = pos;
    while lo > 0
        && compare_rows(specs, rows[(lo - 1) as usize], rows[pos as usize])
            == std::cmp::Ordering::Equal
    {
        lo -= 1;
    }
    let mut hi = pos;
    while hi + 1 < len
        && compare_rows(specs, rows[(hi + 1) as usize], rows[pos as usize])
            == std::cmp::Ordering::Equal
    {
        hi += 1;
    }
    (lo, hi)
}

fn range_frame(
    frame: &Frame,
    rows: &[i64],
    specs: &[KeySpec],
    pos: i64,
) -> Result<(i64, i64)> {
    let len = rows.len() as i64;
    let (peer_lo, peer_hi) = peer_range(rows, specs, pos);
    let lo = match frame.start {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::CurrentRow => peer_lo,
        FrameBound::UnboundedFollowing => len - 1,
        FrameBound::Preceding(_) | FrameBound::Following(_) => {
            return Err(Error::NotYetImplemented("RANGE frames with numeric offsets"));
        }
    };
    let hi = match frame.end {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::CurrentRow => peer_hi,
        FrameBound::UnboundedFollowing => len - 1,
        FrameBound::Preceding(_) | FrameBound::Following(_) => {
            return Err(Error::NotYetImplemented("RANGE frames with numeric offsets"));
        }
    };
    Ok((lo, hi))
}

fn compute_function(
    f: WindowFunc,
    partitions: &[Vec<i64>],
    specs: &[KeySpec],
    input: &Option<(Value, bool)>,
    frame: &Frame,
    n: i64,
) -> Result<Value> {
    let mut cells = vec![Cell::Null; n as usize];
    let float = f == WindowFunc::Avg || matches!(input, Some((_, true)));

    for rows in partitions {
        let len = rows.len() as i64;
        match f {
            WindowFunc::RowNumber => {
                for (pos, &row) in rows.iter().enumerate() {
                    cells[row as usize] = Cell::Int(pos as i64 + 1);
                }
            }
            WindowFunc::Rank | WindowFunc::DenseRank => {
                let mut rank = 0i64;
                let mut dense = 0i64;
                for (pos, &row) in rows.iter().enumerate() {
                    let new_peer = pos == 0
                        || compare_rows(specs, rows[pos - 1], row) != std::cmp::Ordering::Equal;
                    if new_peer {
                        rank = pos as i64 + 1;
                        dense += 1;
                    }
                    cells[row as usize] = Cell::Int(if f == WindowFunc::Rank { rank } else { dense });
                }
            }
            WindowFunc::Ntile(buckets) => {
                if buckets <= 0 {
                    return Err(Error::Domain(format!("ntile({buckets})")));
                }
                let q = len / buckets;
                let r = len % buckets;
                let mut pos = 0i64;
                for b in 0..buckets.min(len) {
                    let size = q + if b < r { 1 } else { 0 };
                    for _ in 0..size {
                        cells[rows[pos as usize] as usize] = Cell::Int(b + 1);
                        pos += 1;
                    }
                }
            }
            WindowFunc::Lag(k) | WindowFunc::Lead(k) => {
                let (col, fl) = input.as_ref().expect("offset function input");
                for (pos, &row) in rows.iter().enumerate() {
                    let src = if matches!(f, WindowFunc::Lag(_)) {
                        pos as i64 - k
                    } else {
                        pos as i64 + k
                    };
                    if src >= 0 && src < len {
                        cells[row as usize] = value_cell(col, *fl, rows[src as usize])?;
                    }
                }
            }
            WindowFunc::FirstValue
            | WindowFunc::LastValue
            | WindowFunc::NthValue(_)
            | WindowFunc::Sum
            | WindowFunc::Avg
            | WindowFunc::Min
            | WindowFunc::Max
            | WindowFunc::Count => {
                for pos in 0..len {
                    let (lo, hi) = match frame.ty {
                        FrameType::Rows => rows_frame(frame, pos, len),
                        FrameType::Range => range_frame(frame, rows, specs, pos)?,
                    };
                    cells[rows[pos as usize] as usize] =
                        frame_agg(f, rows, input, lo, hi)?;
                }
            }
        }
    }
    build_column(&cells, float)
}

fn frame_agg(
    f: WindowFunc,
    rows: &[i64],
    input: &Option<(Value, bool)>,
    lo: i64,
    hi: i64,
) -> Result<Cell> {
    if lo > hi {
        return Ok(match f {
            WindowFunc::Count => Cell::Int(0),
            _ => Cell::Null,
        });
    }
    if f == WindowFunc::Count {
        let (col, _) = input.as_ref().expect("count input");
        let mut c = 0i64;
        for p in lo..=hi {
            if !col.is_null_at(rows[p as usize])? {
                c += 1;
            }
        }
        return Ok(Cell::Int(c));
    }
    let (col, float) = input.as_ref().expect("framed function input");
    match f {
        WindowFunc::FirstValue => value_cell(col, *float, rows[lo as usize]),
        WindowFunc::LastValue => value_cell(col, *float, rows[hi as usize]),
        WindowFunc::NthValue(k) => {
            let p = lo + k - 1;
            if k < 1 || p > hi {
                Ok(Cell::Null)
            } else {
                value_cell(col, *float, rows[p as usize])
            }
        }
        _ => {
            let mut sum_i = 0i64;
            let mut sum_f = 0f64;
            let mut min_i = i64::MAX;
            let mut max_i = i64::MIN;
            let mut min_f = f64::INFINITY;
            let mut max_f = f64::NEG_INFINITY;
            let mut cnt = 0i64;
            for p in lo..=hi {
                let row = rows[p as usize];
                if col.is_null_at(row)? {
                    continue;
                }
                cnt += 1;
                if *float {
                    let v = col.get_f64(row)?;
                    sum_f += v;
                    min_f = min_f.min(v);
                    max_f = max_f.max(v);
                } else {
                    let v = col.get_i64(row)?;
                    sum_i = sum_i.wrapping_add(v);
                    min_i = min_i.min(v);
                    max_i = max_i.max(v);
                }
            }
            if cnt == 0 {
                return Ok(Cell::Null);
            }
            Ok(match (f, *float) {
                (WindowFunc::Sum, true) => Cell::Float(sum_f),
                (WindowFunc::Sum, false) => Cell::Int(sum_i),
                (WindowFunc::Avg, true) => Cell::Float(sum_f / cnt as f64),
                (WindowFunc::Avg, false) => Cell::Float(sum_i as f64 / cnt as f64),
                (WindowFunc::Min, true) => Cell::Float(min_f),
                (WindowFunc::Min, false) => Cell::Int(min_i),
                (WindowFunc::Max, true) => Cell::Float(max_f),
                _ => Cell::Int(max_i),
            })
        }
    }
}
