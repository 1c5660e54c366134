//! Morsel-driven executor.
//!
//! Evaluation walks the optimized DAG bottom-up with a per-node result
//! cache, so shared subexpressions run once. Element-wise operators slice
//! their inputs into 1024-row morsels and go through the worker pool above
//! the parallel threshold; reductions and hash aggregates build per-worker
//! partial state merged on the dispatching thread. Parted inputs evaluate
//! per segment and keep their partitioning.
//!
//! Per query the state machine is `built → optimized → executing → done |
//! cancelled | failed`: the cancellation flag is cleared when execution
//! starts, checked between nodes and once per task inside the pool, and an
//! error from any kernel short-circuits the remaining work.

pub(crate) mod asof;
pub(crate) mod dates;
pub(crate) mod filter;
pub(crate) mod group;
pub(crate) mod join;
pub(crate) mod kernels;
pub(crate) mod reduce;
pub(crate) mod sort;
pub(crate) mod strings;
pub(crate) mod window;

use crate::error::{Error, Result};
use crate::graph::{ExtData, Graph, OpId, Opcode};
use crate::sym;
use crate::task;
use crate::value::Value;

/// Evaluate the graph rooted at `root` into a concrete value.
pub(crate) fn execute(g: &Graph, root: OpId) -> Result<Value> {
    task::clear_cancel();
    let mut ex = Executor {
        g,
        cache: vec![None; g.len()],
    };
    ex.eval(root)
}

pub(crate) struct Executor<'g> {
    pub(crate) g: &'g Graph,
    cache: Vec<Option<Value>>,
}

impl<'g> Executor<'g> {
    pub(crate) fn eval(&mut self, id: OpId) -> Result<Value> {
        if task::cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(v) = &self.cache[id.idx()] {
            return Ok(v.clone());
        }
        let v = self.eval_uncached(id)?;
        self.cache[id.idx()] = Some(v.clone());
        Ok(v)
    }

    fn eval_uncached(&mut self, id: OpId) -> Result<Value> {
        let node = self.g.node(id).clone();
        let in0 = node.inputs[0];
        let in1 = node.inputs[1];
        match node.opcode {
            Opcode::Scan => {
                let Some(ExtData::Name(name_id)) = self.g.ext_of(id) else {
                    return Err(Error::Corrupt("scan node without a name".into()));
                };
                let table = self
                    .g
                    .table
                    .as_ref()
                    .ok_or_else(|| Error::Rank("scan on an unbound graph".into()))?;
                let col = table
                    .col_by_name(*name_id)
                    .ok_or_else(|| Error::Schema(format!("no column id {name_id}")))?;
                if col.is_partition_map() {
                    col.partition_map_expand()
                } else {
                    Ok(col)
                }
            }
            Opcode::Const => match self.g.ext_of(id) {
                Some(ExtData::Const(v)) => Ok(v.clone()),
                _ => Err(Error::Corrupt("const node without a literal".into())),
            },

            Opcode::Neg
            | Opcode::Abs
            | Opcode::Not
            | Opcode::Sqrt
            | Opcode::Log
            | Opcode::Exp
            | Opcode::Ceil
            | Opcode::Floor => {
                let a = self.eval(in0)?;
                kernels::eval_unary(node.opcode, &a, node.out_type)
            }
            Opcode::IsNull => {
                let a = self.eval(in0)?;
                kernels::eval_is_null(&a)
            }
            Opcode::Cast => {
                let Some(ExtData::Cast(target)) = self.g.ext_of(id) else {
                    return Err(Error::Corrupt("cast node without a target".into()));
                };
                let a = self.eval(in0)?;
                kernels::eval_cast(&a, *target)
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::And
            | Opcode::Or
            | Opcode::Min2
            | Opcode::Max2 => {
                let a = self.eval(in0)?;
                let b = self.eval(in1)?;
                kernels::eval_binary(node.opcode, &a, &b, node.out_type)
            }

            Opcode::If => {
                let Some(ExtData::Ternary(else_id)) = self.g.ext_of(id).cloned() else {
                    return Err(Error::Corrupt("if node without an else operand".into()));
                };
                let c = self.eval(in0)?;
                let t = self.eval(in1)?;
                let e = self.eval(else_id)?;
                kernels::eval_if(&c, &t, &e, node.out_type)
            }

            Opcode::Upper | Opcode::Lower | Opcode::StrLen | Opcode::Trim => {
                let a = self.eval(in0)?;
                strings::eval_unary(node.opcode, &a)
            }
            Opcode::Like | Opcode::ILike => {
                let a = self.eval(in0)?;
                let p = self.eval(in1)?;
                strings::eval_like(&a, &p, node.opcode == Opcode::ILike)
            }
            Opcode::Substr => {
                let Some(ExtData::Ternary(len_id)) = self.g.ext_of(id).cloned() else {
                    return Err(Error::Corrupt("substr node without a length".into()));
                };
                let s = self.eval(in0)?;
                let start = self.eval(in1)?;
                let len = self.eval(len_id)?;
                strings::eval_substr(&s, &start, &len)
            }
            Opcode::Replace => {
                let Some(ExtData::Ternary(to_id)) = self.g.ext_of(id).cloned() else {
                    return Err(Error::Corrupt("replace node without a target".into()));
                };
                let s = self.eval(in0)?;
                let from = self.eval(in1)?;
                let to = self.eval(to_id)?;
                strings::eval_replace(&s, &from, &to)
            }
            Opcode::Concat => {
                let Some(ExtData::Concat(args)) = self.g.ext_of(id).cloned() else {
                    return Err(Error::Corrupt("concat node without operands".into()));
                };
                let vals: Vec<Value> = args
                    .iter()
                    .map(|&a| self.eval(a))
                    .collect::<Result<_>>()?;
                strings::eval_concat(&vals)
            }

            Opcode::Extract | Opcode::DateTrunc => {
                let Some(ExtData::DateField(field)) = self.g.ext_of(id) else {
                    return Err(Error::Corrupt("date node without a field".into()));
                };
                let a = self.eval(in0)?;
                dates::eval(node.opcode, &a, *field)
            }

            Opcode::Sum
            | Opcode::Prod
            | Opcode::Min
            | Opcode::Max
            | Opcode::Count
            | Opcode::Avg
            | Opcode::First
            | Opcode::Last
            | Opcode::CountDistinct
            | Opcode::Stddev
            | Opcode::StddevPop
            | Opcode::Var
            | Opcode::VarPop => {
                let a = self.eval(in0)?;
                reduce::reduce(node.opcode, &a)
            }

            Opcode::Filter => self.exec_filter(id, in0, in1),
            Opcode::Group | Opcode::Distinct => self.exec_group(id),
            Opcode::Sort => self.exec_sort(id, in0),
            Opcode::Join => self.exec_join(id, in0, in1),
            Opcode::Window => self.exec_window(id, in0),
            Opcode::WindowJoin => self.exec_window_join(id, in0, in1),

            Opcode::Project | Opcode::Select => {
                let Some(ExtData::Cols(cols)) = self.g.ext_of(id).cloned() else {
                    return Err(Error::Corrupt("projection without columns".into()));
                };
                let input = self.eval(in0)?;
                self.exec_projection(&input, &cols)
            }

            Opcode::Head | Opcode::Tail => {
                let Some(ExtData::Count(n)) = self.g.ext_of(id) else {
                    return Err(Error::Corrupt("head/tail without a count".into()));
                };
                let input = self.eval(in0)?;
                head_tail(&input, *n, node.opcode == Opcode::Tail)
            }

            Opcode::Alias => {
                if in0 == OpId::NONE {
                    // Bare column reference: resolve like a scan.
                    let Some(ExtData::Name(name_id)) = self.g.ext_of(id) else {
                        return Err(Error::Corrupt("column reference without a name".into()));
                    };
                    let table = self
                        .g
                        .table
                        .as_ref()
                        .ok_or_else(|| Error::Rank("column reference on an unbound graph".into()))?;
                    let col = table
                        .col_by_name(*name_id)
                        .ok_or_else(|| Error::Schema(format!("no column id {name_id}")))?;
                    if col.is_partition_map() {
                        col.partition_map_expand()
                    } else {
                        Ok(col)
                    }
                } else {
                    self.eval(in0)
                }
            }
            Opcode::Materialize => {
                let v = self.eval(in0)?;
                materialize(&v)
            }
        }
    }

    /// Compose a table from evaluated column expressions. Aliased exprs
    /// keep their alias; scans keep the source name; the rest get `x<i>`.
    fn exec_projection(&mut self, _input: &Value, cols: &[OpId]) -> Result<Value> {
        let mut out = Value::table()?;
        for (i, &cid) in cols.iter().enumerate() {
            let name_id = self.column_name(cid, i)?;
            let mut v = self.eval(cid)?;
            if v.attrs().contains(crate::types::Attrs::SLICE) {
                v = v.materialize()?;
            }
            out.add_col(name_id, v)?;
        }
        Ok(out)
    }

    pub(crate) fn column_name(&self, id: OpId, position: usize) -> Result<i64> {
        match self.g.ext_of(id) {
            Some(ExtData::Name(name_id)) => Ok(*name_id),
            _ => {
                let node = self.g.node(id);
                if node.opcode == Opcode::Alias || node.opcode == Opcode::Scan {
                    return Err(Error::Corrupt("name node without a name".into()));
                }
                sym::intern_str(&format!("x{position}"))
            }
        }
    }
}

/// First or last `n` rows as zero-copy slice views.
fn head_tail(input: &Value, n: i64, tail: bool) -> Result<Value> {
    if input.is_atom() {
        return Ok(input.clone());
    }
    if input.is_table() {
        let rows = input.nrows();
        let take = n.min(rows);
        let offset = if tail { rows - take } else { 0 };
        let mut out = Value::table()?;
        for c in 0..input.ncols() {
            let col = input.col_by_idx(c)?;
            let col = if col.is_parted() || col.is_partition_map() {
                dense_column(&col)?
            } else {
                col
            };
            out.add_col(input.col_name(c)?, col.slice(offset, take)?)?;
        }
        return Ok(out);
    }
    let col = if input.is_parted() {
        dense_column(input)?
    } else {
        input.clone()
    };
    let rows = col.header().len();
    let take = n.min(rows);
    let offset = if tail { rows - take } else { 0 };
    col.slice(offset, take)
}

/// Concatenate a parted column (or expand a partition map) into one dense
/// vector.
pub(crate) fn dense_column(col: &Value) -> Result<Value> {
    if col.is_partition_map() {
        return col.partition_map_expand();
    }
    if !col.is_parted() {
        return col.materialize();
    }
    let mut acc: Option<Value> = None;
    for i in 0..col.nsegments() {
        let seg = col.segment(i)?;
        acc = Some(match acc {
            None => seg.materialize()?,
            Some(a) => a.concat(&seg)?,
        });
    }
    match acc {
        Some(v) => Ok(v),
        None => Value::vec(col.parted_base_tag()?, 0),
    }
}

/// Build a fresh dense vector from the rows of `col` listed in `rows`
/// (global row indices). Shared by filter, sort, group, join and window.
pub(crate) fn gather(col: &Value, rows: &[i64]) -> Result<Value> {
    let src = if col.is_parted() || col.is_partition_map() {
        dense_column(col)?
    } else {
        col.clone()
    };
    let tag = src.vec_tag_or_base()?;
    let mut out = if tag == crate::types::TypeTag::Sym {
        Value::sym_vec(src.elem_width(), rows.len() as i64)?
    } else {
        Value::vec(tag, rows.len() as i64)?
    };
    for &r in rows {
        if src.is_null_at(r)? {
            out.push_null()?;
        } else {
            match tag {
                crate::types::TypeTag::F64 => out.push_f64(src.get_f64(r)?)?,
                crate::types::TypeTag::List | crate::types::TypeTag::Str => {
                    out.push_child(src.get_child(r)?)?;
                }
                _ => out.push_i64(src.get_i64(r)?)?,
            }
        }
    }
    Ok(out)
}

/// A column fit for placing into a result table: parted columns and
/// partition maps flatten, slices densify, dense vectors gain a reference.
pub(crate) fn materialize_col(col: &Value) -> Result<Value> {
    if col.is_parted() || col.is_partition_map() {
        dense_column(col)
    } else {
        col.materialize()
    }
}

/// Force lazily-sliced results dense; tables densify every column.
fn materialize(v: &Value) -> Result<Value> {
    if v.is_table() {
        let mut out = Value::table()?;
        for c in 0..v.ncols() {
            let col = v.col_by_idx(c)?;
            let col = if col.is_parted() || col.is_partition_map() {
                dense_column(&col)?
            } else {
                col.materialize()?
            };
            out.add_col(v.col_name(c)?, col)?;
        }
        Ok(out)
    } else if v.is_parted() {
        dense_column(v)
    } else if v.is_atom() {
        Ok(v.clone())
    } else {
        v.materialize()
    }
}
