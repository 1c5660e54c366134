//! SORT: multi-key stable table sort.
//!
//! Keys are prefetched into typed arrays, a row permutation is sorted, and
//! every column is gathered through it. Large inputs sort contiguous runs
//! on the pool and merge them on the dispatching thread; ties prefer the
//! earlier run, and runs preserve input order internally, so stability
//! survives the parallel path.
//!
//! Null placement follows the per-key flag (the builder's convention:
//! NULLS LAST ascending, NULLS FIRST descending, unless overridden).

use std::cmp::Ordering as Ord2;

use crate::error::{Error, Result};
use crate::exec::{dense_column, gather, Executor};
use crate::graph::{ExtData, OpId};
use crate::task::{self, div_ceil_i64};
use crate::types::{TypeTag, PARALLEL_THRESHOLD};
use crate::value::Value;

/// One prefetched sort key: values (None = null) plus ordering flags.
/// SYM keys resolve to their interned strings so ordering is lexical, not
/// insertion order.
pub(crate) enum SortKey {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
}

pub(crate) struct KeySpec {
    pub key: SortKey,
    pub desc: bool,
    pub nulls_first: bool,
}

impl KeySpec {
    pub(crate) fn compare(&self, a: i64, b: i64) -> Ord2 {
        match &self.key {
            SortKey::Int(v) => {
                cmp_opt(v[a as usize], v[b as usize], self.desc, self.nulls_first, i64::cmp)
            }
            SortKey::Float(v) => cmp_opt(
                v[a as usize],
                v[b as usize],
                self.desc,
                self.nulls_first,
                |x: &f64, y: &f64| x.total_cmp(y),
            ),
            SortKey::Str(v) => cmp_opt(
                v[a as usize].as_deref(),
                v[b as usize].as_deref(),
                self.desc,
                self.nulls_first,
                |x: &&str, y: &&str| x.cmp(y),
            ),
        }
    }
}

/// Compare optional key values. Null placement is resolved before the
/// descending flip, so `nulls_first` means what it says under both
/// directions.
fn cmp_opt<T>(
    a: Option<T>,
    b: Option<T>,
    desc: bool,
    nulls_first: bool,
    cmp: impl Fn(&T, &T) -> Ord2,
) -> Ord2 {
    match (a, b) {
        (None, None) => Ord2::Equal,
        (None, Some(_)) => {
            if nulls_first {
                Ord2::Less
            } else {
                Ord2::Greater
            }
        }
        (Some(_), None) => {
            if nulls_first {
                Ord2::Greater
            } else {
                Ord2::Less
            }
        }
        (Some(x), Some(y)) => {
            let o = cmp(&x, &y);
            if desc { o.reverse() } else { o }
        }
    }
}

pub(crate) fn compare_rows(keys: &[KeySpec], a: i64, b: i64) -> Ord2 {
    for k in keys {
        match k.compare(a, b) {
            Ord2::Equal => continue,
            o => return o,
        }
    }
    Ord2::Equal
}

pub(crate) fn prefetch_key(col: &Value) -> Result<SortKey> {
    let dense = dense_column(col)?;
    let n = dense.header().len();
    Ok(match dense.vec_tag_or_base()? {
        TypeTag::F64 => {
            let mut v = Vec::with_capacity(n as usize);
            for i in 0..n {
                v.push(if dense.is_null_at(i)? {
                    None
                } else {
                    Some(dense.get_f64(i)?)
                });
            }
            SortKey::Float(v)
        }
        TypeTag::Sym => {
            let mut v = Vec::with_capacity(n as usize);
            for i in 0..n {
                v.push(if dense.is_null_at(i)? {
                    None
                } else {
                    Some(crate::sym::str_of(dense.get_i64(i)?)?)
                });
            }
            SortKey::Str(v)
        }
        _ => {
            let mut v = Vec::with_capacity(n as usize);
            for i in 0..n {
                v.push(if dense.is_null_at(i)? {
                    None
                } else {
                    Some(dense.get_i64(i)?)
                });
            }
            SortKey::Int(v)
        }
    })
}

impl Executor<'_> {
    pub(super) fn exec_sort(&mut self, id: OpId, in0: OpId) -> Result<Value> {
        let Some(ExtData::Sort {
            keys,
            desc,
            nulls_first,
        }) = self.g.ext_of(id).cloned()
        else {
            return Err(Error::Corrupt("sort node without key data".into()));
        };
        let input = self.eval(in0)?;
        if !input.is_table() {
            return Err(Error::Type(format!(
                "sort input has tag {}, expected a table",
                input.tag()
            )));
        }
        let mut specs = Vec::with_capacity(keys.len());
        for ((&k, &d), &nf) in keys.iter().zip(&desc).zip(&nulls_first) {
            let col = self.eval(k)?;
            specs.push(KeySpec {
                key: prefetch_key(&col)?,
                desc: d,
                nulls_first: nf,
            });
        }
        let n = input.nrows();
        let perm = sort_permutation(&specs, n)?;

        let mut out = Value::table()?;
        for c in 0..input.ncols() {
            let col = input.col_by_idx(c)?;
            out.add_col(input.col_name(c)?, gather(&col, &perm)?)?;
        }
        Ok(out)
    }
}

/// Stable permutation of `[0, n)` under the key specs.
pub(crate) fn sort_permutation(specs: &[KeySpec], n: i64) -> Result<Vec<i64>> {
    let mut perm: Vec<i64> = (0..n).collect();
    if n < PARALLEL_THRESHOLD {
        perm.sort_by(|&a, &b| compare_rows(specs, a, b));
        return Ok(perm);
    }

    // Parallel runs: sort contiguous chunks on the pool, then merge.
    let runs = (num_cpus::get() as i64).clamp(2, 64);
    let chunk = div_ceil_i64(n, runs);
    struct SortCtx<'a> {
        specs: &'a [KeySpec],
        perm: *mut i64,
        n: i64,
        chunk: i64,
    }
    unsafe impl Sync for SortCtx<'_> {}
    fn sort_run(ctx: &SortCtx<'_>, run: i64, _end: i64) {
        let start = run * ctx.chunk;
        let end = ((run + 1) * ctx.chunk).min(ctx.n);
        if start >= end {
            return;
        }
        let slice =
            unsafe { std::slice::from_raw_parts_mut(ctx.perm.add(start as usize), (end - start) as usize) };
        slice.sort_by(|&a, &b| compare_rows(ctx.specs, a, b));
    }
    let n_runs = div_ceil_i64(n, chunk);
    let ctx = SortCtx {
        specs,
        perm: perm.as_mut_ptr(),
        n,
        chunk,
    };
    task::dispatch_partitions(&ctx, n_runs, sort_run)?;

    // K-way merge; ties pick the earlier run so stability is preserved.
    let mut heads: Vec<(i64, i64)> = (0..n_runs)
        .map(|r| (r * chunk, ((r + 1) * chunk).min(n)))
        .filter(|(s, e)| s < e)
        .collect();
    let mut merged = Vec::with_capacity(n as usize);
    while !heads.is_empty() {
        let mut best = 0usize;
        for cand in 1..heads.len() {
            let (bs, _) = heads[best];
            let (cs, _) = heads[cand];
            if compare_rows(specs, perm[cs as usize], perm[bs as usize]) == Ord2::Less {
                best = cand;
            }
        }
        let (s, e) = &mut heads[best];
        merged.push(perm[*s as usize]);
        *s += 1;
        if *s == *e {
            heads.remove(best);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(vals: &[Option<i64>], desc: bool, nulls_first: bool) -> KeySpec {
        KeySpec {
            key: SortKey::Int(vals.to_vec()),
            desc,
            nulls_first,
        }
    }

    #[test]
    fn single_key_ascending_with_nulls_last() -> Result<()> {
        let s = spec(&[Some(3), None, Some(1), Some(2)], false, false);
        let perm = sort_permutation(&[s], 4)?;
        assert_eq!(perm, vec![2, 3, 0, 1]);
        Ok(())
    }

    #[test]
    fn descending_puts_nulls_first_when_asked() -> Result<()> {
        let s = spec(&[Some(3), None, Some(1)], true, true);
        let perm = sort_permutation(&[s], 3)?;
        assert_eq!(perm, vec![1, 0, 2]);
        Ok(())
    }

    #[test]
    fn equal_keys_preserve_row_order() -> Result<()> {
        let s = spec(&[Some(7), Some(7), Some(7), Some(7)], false, false);
        let perm = sort_permutation(&[s], 4)?;
        assert_eq!(perm, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn secondary_key_breaks_primary_ties() -> Result<()> {
        let k1 = spec(&[Some(1), Some(1), Some(0)], false, false);
        let k2 = spec(&[Some(9), Some(5), Some(7)], false, false);
        let perm = sort_permutation(&[k1, k2], 3)?;
        assert_eq!(perm, vec![2, 1, 0]);
        Ok(())
    }

    #[test]
    fn parallel_sort_is_stable_and_ordered() -> Result<()> {
        let _pool = crate::task::TEST_POOL_LOCK.lock().unwrap();
        let n = PARALLEL_THRESHOLD + 17;
        let vals: Vec<Option<i64>> = (0..n).map(|i| Some(i % 100)).collect();
        let s = spec(&vals, false, false);
        let perm = sort_permutation(&[s], n)?;
        for w in perm.windows(2) {
            let (a, b) = (vals[w[0] as usize].unwrap(), vals[w[1] as usize].unwrap());
            assert!(a < b || (a == b && w[0] < w[1]));
        }
        Ok(())
    }
}
