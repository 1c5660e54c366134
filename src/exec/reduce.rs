//! Reductions: sum, prod, min, max, count, avg, first, last,
//! count-distinct, and the variance family.
//!
//! Inputs above the parallel threshold split into per-task partial
//! accumulators merged on the dispatching thread. Integer sums stay in I64
//! with wraparound; F64 sums use plain accumulation (no compensation).
//! Nulls never enter an accumulator.

use std::cell::UnsafeCell;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::exec::kernels::VecView;
use crate::graph::Opcode;
use crate::task::{self, TASK_GRAIN, div_ceil_i64};
use crate::types::{TypeTag, PARALLEL_THRESHOLD};
use crate::value::Value;

/// One worker's accumulator state, wide enough for every reduction.
/// The hash aggregate reuses it as its per-group state.
#[derive(Clone)]
pub(crate) struct Partial {
    pub(crate) cnt: i64,
    sum_i: i64,
    sum_f: f64,
    sumsq_f: f64,
    prod_i: i64,
    prod_f: f64,
    min_i: i64,
    max_i: i64,
    min_f: f64,
    max_f: f64,
    seen: bool,
    /// `(row, int bits, float value)` of the first/last non-null row.
    first: Option<(i64, i64, f64)>,
    last: Option<(i64, i64, f64)>,
    distinct: Option<HashSet<u64>>,
}

impl Partial {
    pub(crate) fn new(distinct: bool) -> Partial {
        Partial {
            cnt: 0,
            sum_i: 0,
            sum_f: 0.0,
            sumsq_f: 0.0,
            prod_i: 1,
            prod_f: 1.0,
            min_i: i64::MAX,
            max_i: i64::MIN,
            min_f: f64::INFINITY,
            max_f: f64::NEG_INFINITY,
            seen: false,
            first: None,
            last: None,
            distinct: if distinct { Some(HashSet::new()) } else { None },
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, row: i64, vi: i64, vf: f64) {
        self.cnt += 1;
        self.sum_i = self.sum_i.wrapping_add(vi);
        self.sum_f += vf;
        self.sumsq_f += vf * vf;
        self.prod_i = self.prod_i.wrapping_mul(vi);
        self.prod_f *= vf;
        self.min_i = self.min_i.min(vi);
        self.max_i = self.max_i.max(vi);
        self.min_f = self.min_f.min(vf);
        self.max_f = self.max_f.max(vf);
        self.seen = true;
        if self.first.is_none() {
            self.first = Some((row, vi, vf));
        }
        self.last = Some((row, vi, vf));
        if let Some(set) = &mut self.distinct {
            set.insert(vi as u64 ^ vf.to_bits().rotate_left(1));
        }
    }

    pub(crate) fn merge(&mut self, other: Partial) {
        self.cnt += other.cnt;
        self.sum_i = self.sum_i.wrapping_add(other.sum_i);
        self.sum_f += other.sum_f;
        self.sumsq_f += other.sumsq_f;
        self.prod_i = self.prod_i.wrapping_mul(other.prod_i);
        self.prod_f *= other.prod_f;
        self.min_i = self.min_i.min(other.min_i);
        self.max_i = self.max_i.max(other.max_i);
        self.min_f = self.min_f.min(other.min_f);
        self.max_f = self.max_f.max(other.max_f);
        self.seen |= other.seen;
        match (self.first, other.first) {
            (Some((a, ..)), Some(of @ (b, ..))) if b < a => self.first = Some(of),
            (None, Some(of)) => self.first = Some(of),
            _ => {}
        }
        match (self.last, other.last) {
            (Some((a, ..)), Some(ol @ (b, ..))) if b > a => self.last = Some(ol),
            (None, Some(ol)) => self.last = Some(ol),
            _ => {}
        }
        if let (Some(mine), Some(theirs)) = (&mut self.distinct, other.distinct) {
            mine.extend(theirs);
        }
    }
}

struct RedCtx {
    view: VecView,
    /// Global row offset of this segment, so first/last order across
    /// segments is well-defined.
    row_base: i64,
    float: bool,
    distinct: bool,
    partials: Vec<UnsafeCell<Partial>>,
}

unsafe impl Sync for RedCtx {}

fn reduce_range(ctx: &RedCtx, start: i64, end: i64) {
    let slot = (start / TASK_GRAIN) as usize;
    let partial = unsafe { &mut *ctx.partials[slot.min(ctx.partials.len() - 1)].get() };
    if ctx.float {
        for i in start..end {
            if !ctx.view.is_null(i) {
                let v = ctx.view.read_f64(i);
                partial.add(ctx.row_base + i, v as i64, v);
            }
        }
    } else {
        for i in start..end {
            if !ctx.view.is_null(i) {
                let v = ctx.view.read_i64(i);
                partial.add(ctx.row_base + i, v, v as f64);
            }
        }
    }
}

/// Reduce one dense segment into a partial.
fn reduce_segment(
    view: VecView,
    row_base: i64,
    float: bool,
    distinct: bool,
) -> Result<Partial> {
    let n = view.len;
    let n_tasks = if n >= PARALLEL_THRESHOLD {
        (div_ceil_i64(n, TASK_GRAIN) as usize).max(1)
    } else {
        1
    };
    let ctx = RedCtx {
        view,
        row_base,
        float,
        distinct,
        partials: (0..n_tasks)
            .map(|_| UnsafeCell::new(Partial::new(distinct)))
            .collect(),
    };
    if n >= PARALLEL_THRESHOLD {
        task::dispatch_range(&ctx, n, reduce_range)?;
    } else {
        reduce_range(&ctx, 0, n);
    }
    let mut it = ctx.partials.into_iter().map(UnsafeCell::into_inner);
    let mut acc = it.next().expect("at least one partial");
    for p in it {
        acc.merge(p);
    }
    Ok(acc)
}

/// Evaluate a reduction over a vector, slice, or parted column.
pub(crate) fn reduce(op: Opcode, a: &Value) -> Result<Value> {
    if a.is_atom() {
        // A scalar reduces to itself (count: 1).
        return match op {
            Opcode::Count => Value::i64_atom(1),
            Opcode::CountDistinct => Value::i64_atom(1),
            Opcode::Avg => Value::f64_atom(a.as_f64()?),
            _ => Ok(a.clone()),
        };
    }

    let distinct = op == Opcode::CountDistinct;
    let (views, tag) = segment_views(a)?;
    let float = tag == TypeTag::F64;

    let mut acc = Partial::new(distinct);
    let mut row_base = 0i64;
    for view in views {
        let len = view.len;
        acc.merge(reduce_segment(view, row_base, float, distinct)?);
        row_base += len;
    }

    finalize(op, acc, tag, float)
}

fn segment_views(a: &Value) -> Result<(Vec<VecView>, TypeTag)> {
    let tag = a.vec_tag_or_base()?;
    if a.is_parted() {
        let mut views = Vec::with_capacity(a.nsegments() as usize);
        for i in 0..a.nsegments() {
            views.push(VecView::of(&a.segment(i)?)?);
        }
        Ok((views, tag))
    } else {
        Ok((vec![VecView::of(a)?], tag))
    }
}

pub(crate) fn finalize(op: Opcode, acc: Partial, tag: TypeTag, float: bool) -> Result<Value> {
    let empty = !acc.seen;
    match op {
        Opcode::Sum => {
            if float {
                Value::f64_atom(acc.sum_f)
            } else {
                Value::i64_atom(acc.sum_i)
            }
        }
        Opcode::Prod => {
            if float {
                Value::f64_atom(acc.prod_f)
            } else {
                Value::i64_atom(acc.prod_i)
            }
        }
        Opcode::Count => Value::i64_atom(acc.cnt),
        Opcode::CountDistinct => {
            Value::i64_atom(acc.distinct.map_or(0, |s| s.len() as i64))
        }
        Opcode::Avg => {
            if acc.cnt == 0 {
                Value::f64_atom(f64::NAN)
            } else {
                Value::f64_atom(acc.sum_f / acc.cnt as f64)
            }
        }
        Opcode::Min | Opcode::Max => {
            if empty {
                return Err(Error::Domain(format!("{op:?} of an empty vector")));
            }
            if float {
                Value::f64_atom(if op == Opcode::Min { acc.min_f } else { acc.max_f })
            } else {
                let v = if op == Opcode::Min { acc.min_i } else { acc.max_i };
                Value::int_atom_of(int_atom_tag(tag), v)
            }
        }
        Opcode::First | Opcode::Last => {
            let hit = if op == Opcode::First { acc.first } else { acc.last };
            let Some((_, vi, vf)) = hit else {
                return Err(Error::Domain(format!("{op:?} of an empty vector")));
            };
            if float {
                Value::f64_atom(vf)
            } else {
                Value::int_atom_of(int_atom_tag(tag), vi)
            }
        }
        Opcode::Var | Opcode::Stddev | Opcode::VarPop | Opcode::StddevPop => {
            let n = acc.cnt as f64;
            let denom = match op {
                Opcode::Var | Opcode::Stddev => n - 1.0,
                _ => n,
            };
            if denom <= 0.0 {
                return Value::f64_atom(f64::NAN);
            }
            let var = (acc.sumsq_f - acc.sum_f * acc.sum_f / n) / denom;
            let var = var.max(0.0);
            match op {
                Opcode::Stddev | Opcode::StddevPop => Value::f64_atom(var.sqrt()),
                _ => Value::f64_atom(var),
            }
        }
        _ => Err(Error::Type(format!("{op:?} is not a reduction"))),
    }
}

/// Atom tag for integer-class reduction results.
fn int_atom_tag(tag: TypeTag) -> TypeTag {
    match tag {
        TypeTag::Date | TypeTag::Time | TypeTag::Timestamp | TypeTag::Sym => tag,
        _ => TypeTag::I64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_and_counts() -> Result<()> {
        let v = Value::i64_vec(&[1, 2, 3, 4])?;
        assert_eq!(reduce(Opcode::Sum, &v)?.as_i64()?, 10);
        assert_eq!(reduce(Opcode::Count, &v)?.as_i64()?, 4);
        assert_eq!(reduce(Opcode::Prod, &v)?.as_i64()?, 24);
        assert_eq!(reduce(Opcode::Min, &v)?.as_i64()?, 1);
        assert_eq!(reduce(Opcode::Max, &v)?.as_i64()?, 4);
        assert_eq!(reduce(Opcode::Avg, &v)?.as_f64()?, 2.5);
        Ok(())
    }

    #[test]
    fn nulls_stay_out_of_accumulators() -> Result<()> {
        let mut v = Value::i64_vec(&[5, 100, 7])?;
        v.set_null(1, true)?;
        assert_eq!(reduce(Opcode::Sum, &v)?.as_i64()?, 12);
        assert_eq!(reduce(Opcode::Count, &v)?.as_i64()?, 2);
        assert_eq!(reduce(Opcode::Max, &v)?.as_i64()?, 7);
        Ok(())
    }

    #[test]
    fn parallel_sum_matches_serial() -> Result<()> {
        let _pool = crate::task::TEST_POOL_LOCK.lock().unwrap();
        let n = 100_000i64;
        let vals: Vec<i64> = (1..=n).collect();
        let v = Value::i64_vec(&vals)?;
        assert_eq!(reduce(Opcode::Sum, &v)?.as_i64()?, n * (n + 1) / 2);
        Ok(())
    }

    #[test]
    fn first_last_across_parted_segments() -> Result<()> {
        let p = Value::parted(
            TypeTag::I64,
            vec![Value::i64_vec(&[7, 8])?, Value::i64_vec(&[9])?],
        )?;
        assert_eq!(reduce(Opcode::First, &p)?.as_i64()?, 7);
        assert_eq!(reduce(Opcode::Last, &p)?.as_i64()?, 9);
        assert_eq!(reduce(Opcode::Sum, &p)?.as_i64()?, 24);
        Ok(())
    }

    #[test]
    fn count_distinct_and_variance() -> Result<()> {
        let v = Value::i64_vec(&[1, 2, 2, 3, 3, 3])?;
        assert_eq!(reduce(Opcode::CountDistinct, &v)?.as_i64()?, 3);
        let f = Value::f64_vec(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0])?;
        let pop = reduce(Opcode::VarPop, &f)?.as_f64()?;
        assert!((pop - 4.0).abs() < 1e-9);
        let sd = reduce(Opcode::StddevPop, &f)?.as_f64()?;
        assert!((sd - 2.0).abs() < 1e-9);
        Ok(())
    }
}
