//! WINDOW-JOIN: the time-series as-of join.
//!
//! An equi-join on a symbol key plus an inequality on a time key: for each
//! left row at time `t`, the matching right rows share the symbol and have
//! a time inside `[t + lo, t + hi]`. Without aggregates the latest match
//! wins and the right table's other columns ride along (null when nothing
//! matched); with aggregates each left row gets the aggregate over its
//! match window.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::exec::group::{agg_name, agg_opcode, agg_out_is_float};
use crate::exec::reduce::{finalize, Partial};
use crate::exec::{dense_column, Executor};
use crate::graph::{ExtData, OpId};
use crate::sym;
use crate::types::{AggOp, TypeTag};
use crate::value::Value;

impl Executor<'_> {
    pub(super) fn exec_window_join(&mut self, id: OpId, in0: OpId, in1: OpId) -> Result<Value> {
        let Some(ExtData::AsOf {
            time,
            sym: sym_key,
            lo,
            hi,
            aggs,
        }) = self.g.ext_of(id).cloned()
        else {
            return Err(Error::Corrupt("window-join node without descriptor".into()));
        };
        let left = self.eval(in0)?;
        let right = self.eval(in1)?;
        if !left.is_table() || !right.is_table() {
            return Err(Error::Type("window-join inputs must be tables".into()));
        }
        let time_name = self.name_of(time)?;
        let sym_name = self.name_of(sym_key)?;

        let agg_specs: Vec<(AggOp, i64)> = aggs
            .iter()
            .map(|&(op, a)| Ok((op, self.name_of(a)?)))
            .collect::<Result<_>>()?;
        window_join(&left, &right, time_name, sym_name, lo, hi, &agg_specs)
    }

    fn name_of(&self, id: OpId) -> Result<i64> {
        match self.g.ext_of(id) {
            Some(ExtData::Name(n)) => Ok(*n),
            _ => Err(Error::Rank(
                "window-join keys must name columns (scan or alias)".into(),
            )),
        }
    }
}

fn named_col(t: &Value, name_id: i64) -> Result<Value> {
    let col = t.col_by_name(name_id).ok_or_else(|| {
        Error::Schema(format!(
            "window-join column {} missing",
            sym::str_of(name_id).unwrap_or_default()
        ))
    })?;
    dense_column(&col)
}

#[allow(clippy::too_many_arguments)]
fn window_join(
    left: &Value,
    right: &Value,
    time_name: i64,
    sym_name: i64,
    lo: i64,
    hi: i64,
    aggs: &[(AggOp, i64)],
) -> Result<Value> {
    let lt = named_col(left, time_name)?;
    let ls = named_col(left, sym_name)?;
    let rt = named_col(right, time_name)?;
    let rs = named_col(right, sym_name)?;
    let (ln, rn) = (lt.header().len(), rt.header().len());

    // Right side indexed per symbol, times ascending.
    let mut by_sym: HashMap<i64, Vec<(i64, i64)>> = HashMap::new();
    for row in 0..rn {
        if rs.is_null_at(row)? || rt.is_null_at(row)? {
            continue;
        }
        by_sym
            .entry(rs.get_i64(row)?)
            .or_default()
            .push((rt.get_i64(row)?, row));
    }
    for times in by_sym.values_mut() {
        times.sort_unstable();
    }

    // Match windows per left row.
    let mut matches: Vec<(i64, i64, Option<&Vec<(i64, i64)>>)> = Vec::with_capacity(ln as usize);
    for row in 0..ln {
        if ls.is_null_at(row)? || lt.is_null_at(row)? {
            matches.push((0, 0, None));
            continue;
        }
        let t = lt.get_i64(row)?;
        match by_sym.get(&ls.get_i64(row)?) {
            None => matches.push((0, 0, None)),
            Some(times) => {
                let from = times.partition_point(|&(rt, _)| rt < t + lo);
                let to = times.partition_point(|&(rt, _)| rt <= t + hi);
                matches.push((from as i64, to as i64, Some(times)));
            }
        }
    }

    let mut out = Value::table()?;
    for c in 0..left.ncols() {
        let col = left.col_by_idx(c)?;
        out.add_col(left.col_name(c)?, crate::exec::materialize_col(&col)?)?;
    }

    if aggs.is_empty() {
        // Last-match mode: carry the right table's other columns.
        let last_rows: Vec<Option<i64>> = matches
            .iter()
            .map(|(from, to, times)| match times {
                Some(times) if to > from => Some(times[(*to - 1) as usize].1),
                _ => None,
            })
            .collect();
        for c in 0..right.ncols() {
            let name_id = right.col_name(c)?;
            if name_id == time_name || name_id == sym_name {
                continue;
            }
            let col = dense_column(&right.col_by_idx(c)?)?;
            let mut vals = if col.vec_tag_or_base()? == TypeTag::Sym {
                Value::sym_vec(col.elem_width(), ln)?
            } else {
                Value::vec(col.vec_tag_or_base()?, ln)?
            };
            let float = col.vec_tag_or_base()? == TypeTag::F64;
            for r in &last_rows {
                match r {
                    Some(r) => {
                        if col.is_null_at(*r)? {
                            vals.push_null()?;
                        } else if float {
                            vals.push_f64(col.get_f64(*r)?)?;
                        } else {
                            vals.push_i64(col.get_i64(*r)?)?;
                        }
                    }
                    None => vals.push_null()?,
                }
            }
            out.add_col(name_id, vals)?;
        }
        return Ok(out);
    }

    for &(op, input_name) in aggs {
        let col = named_col(right, input_name)?;
        let float = col.vec_tag_or_base()? == TypeTag::F64;
        let float_out = agg_out_is_float(op, float);
        let mut vals = if float_out {
            Value::vec(TypeTag::F64, ln)?
        } else {
            Value::vec(TypeTag::I64, ln)?
        };
        for (from, to, times) in &matches {
            let mut acc = Partial::new(op == AggOp::CountDistinct);
            if let Some(times) = times {
                for k in *from..*to {
                    let row = times[k as usize].1;
                    if col.is_null_at(row)? {
                        continue;
                    }
                    if float {
                        let v = col.get_f64(row)?;
                        acc.add(row, v as i64, v);
                    } else {
                        let v = col.get_i64(row)?;
                        acc.add(row, v, v as f64);
                    }
                }
            }
            if acc.cnt == 0 && !matches!(op, AggOp::Count | AggOp::CountDistinct | AggOp::Sum) {
                vals.push_null()?;
                continue;
            }
            let atom = finalize(agg_opcode(op), acc, col.vec_tag_or_base()?, float)?;
            if float_out {
                vals.push_f64(atom.as_f64()?)?;
            } else {
                vals.push_i64(atom.as_i64()?)?;
            }
        }
        let name = format!("{}_{}", agg_name(op), sym::str_of(input_name)?);
        out.add_col(sym::intern_str(&name)?, vals)?;
    }
    Ok(out)
}
