use anyhow::Result;
use basalt::{AggOp, Graph, TypeTag, Value};

fn sample_table() -> Result<Value> {
    Ok(Value::table_from(
        &["id", "v"],
        vec![
            Value::i64_vec(&[1, 1, 2, 2, 3, 3, 1, 2, 3, 1])?,
            Value::i64_vec(&[10, 20, 30, 40, 50, 60, 70, 80, 90, 100])?,
        ],
    )?)
}

/// Fetch the aggregate value for a given group key from a GROUP result.
/// Output row order is unspecified, so look rows up by key.
fn group_value(out: &Value, key_col: &str, key: i64, agg_col: &str) -> Result<i64> {
    let keys = out.col(key_col).expect("key column");
    let aggs = out.col(agg_col).expect("agg column");
    for i in 0..keys.len() {
        if keys.get_i64(i)? == key {
            return Ok(aggs.get_i64(i)?);
        }
    }
    panic!("group {key} not found");
}

#[test]
fn group_by_id_sums_v() -> Result<()> {
    let t = sample_table()?;
    let mut g = Graph::new(&t)?;
    let id = g.scan("id")?;
    let v = g.scan("v")?;
    let grp = g.group(&[id], &[(AggOp::Sum, v)])?;
    let root = g.optimize(grp)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 3);
    assert_eq!(group_value(&out, "id", 1, "sum_v")?, 200);
    assert_eq!(group_value(&out, "id", 2, "sum_v")?, 150);
    assert_eq!(group_value(&out, "id", 3, "sum_v")?, 200);
    Ok(())
}

#[test]
fn filter_then_count() -> Result<()> {
    let t = sample_table()?;
    let mut g = Graph::new(&t)?;
    let v = g.scan("v")?;
    let fifty = g.const_i64(50)?;
    let pred = g.ge(v, fifty)?;
    let kept = g.filter(v, pred)?;
    let n = g.count(kept)?;
    let root = g.optimize(n)?;
    assert_eq!(g.execute(root)?.as_i64()?, 6);
    Ok(())
}

#[test]
fn sum_of_scaled_floats() -> Result<()> {
    let t = Value::table_from(
        &["v3"],
        vec![Value::f64_vec(&[
            1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5, 9.5, 10.5,
        ])?],
    )?;
    let mut g = Graph::new(&t)?;
    let v3 = g.scan("v3")?;
    let two = g.const_f64(2.0)?;
    let scaled = g.mul(v3, two)?;
    let total = g.sum(scaled)?;
    let root = g.optimize(total)?;
    assert_eq!(g.execute(root)?.as_f64()?, 120.0);
    Ok(())
}

#[test]
fn large_parallel_sum_matches_closed_form() -> Result<()> {
    let vals: Vec<i64> = (1..=100_000).collect();
    let t = Value::table_from(&["val"], vec![Value::i64_vec(&vals)?])?;
    let mut g = Graph::new(&t)?;
    let v = g.scan("val")?;
    let s = g.sum(v)?;
    let root = g.optimize(s)?;
    assert_eq!(g.execute(root)?.as_i64()?, 5_000_050_000);
    Ok(())
}

#[test]
fn results_equal_across_the_parallel_threshold() -> Result<()> {
    for n in [
        basalt::types::PARALLEL_THRESHOLD - 1,
        basalt::types::PARALLEL_THRESHOLD,
        basalt::types::PARALLEL_THRESHOLD + 1,
    ] {
        let vals: Vec<i64> = (0..n).collect();
        let t = Value::table_from(&["x"], vec![Value::i64_vec(&vals)?])?;
        let mut g = Graph::new(&t)?;
        let x = g.scan("x")?;
        let one = g.const_i64(1)?;
        let plus = g.add(x, one)?;
        let s = g.sum(plus)?;
        let root = g.optimize(s)?;
        assert_eq!(g.execute(root)?.as_i64()?, (1..=n).sum::<i64>());
    }
    Ok(())
}

#[test]
fn empty_and_single_row_vectors() -> Result<()> {
    let t = Value::table_from(&["x"], vec![Value::i64_vec(&[])?])?;
    let mut g = Graph::new(&t)?;
    let x = g.scan("x")?;
    let one = g.const_i64(1)?;
    let plus = g.add(x, one)?;
    let root = g.optimize(plus)?;
    let out = g.execute(root)?;
    assert_eq!(out.len(), 0);
    assert_eq!(out.tag(), TypeTag::I64 as i8);

    let t1 = Value::table_from(&["x"], vec![Value::i64_vec(&[41])?])?;
    let mut g1 = Graph::new(&t1)?;
    let x1 = g1.scan("x")?;
    let one1 = g1.const_i64(1)?;
    let plus1 = g1.add(x1, one1)?;
    let out1 = g1.execute(plus1)?;
    assert_eq!(out1.len(), 1);
    assert_eq!(out1.get_i64(0)?, 42);
    Ok(())
}

#[test]
fn optimize_preserves_results() -> Result<()> {
    let t = sample_table()?;

    // Unoptimized.
    let mut g1 = Graph::new(&t)?;
    let v1 = g1.scan("v")?;
    let c1 = g1.const_i64(50)?;
    let p1 = g1.ge(v1, c1)?;
    let f1 = g1.filter(v1, p1)?;
    let s1 = g1.sum(f1)?;
    let plain = g1.execute(s1)?.as_i64()?;

    // Optimized (fusion kicks in for the comparison).
    let mut g2 = Graph::new(&t)?;
    let v2 = g2.scan("v")?;
    let c2 = g2.const_i64(50)?;
    let p2 = g2.ge(v2, c2)?;
    let f2 = g2.filter(v2, p2)?;
    let s2 = g2.sum(f2)?;
    let root = g2.optimize(s2)?;
    let optimized = g2.execute(root)?.as_i64()?;

    assert_eq!(plain, optimized);
    assert_eq!(plain, 50 + 60 + 70 + 80 + 90 + 100);
    Ok(())
}

#[test]
fn constant_folding_is_semantics_preserving() -> Result<()> {
    // (2 + 3) * 4 as a const expression and through the executor.
    let mut g = Graph::unbound();
    let a = g.const_i64(2)?;
    let b = g.const_i64(3)?;
    let sum = g.add(a, b)?;
    let four = g.const_i64(4)?;
    let prod = g.mul(sum, four)?;
    let unfolded = g.execute(prod)?.as_i64()?;
    let root = g.optimize(prod)?;
    let folded = g.execute(root)?.as_i64()?;
    assert_eq!(unfolded, 20);
    assert_eq!(folded, 20);
    Ok(())
}

#[test]
fn group_by_constant_key_keeps_everything_in_one_group() -> Result<()> {
    let t = sample_table()?;
    let mut g = Graph::new(&t)?;
    let k = g.const_i64(7)?;
    let v = g.scan("v")?;
    let grp = g.group(&[k], &[(AggOp::Sum, v), (AggOp::Count, v)])?;
    let root = g.optimize(grp)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 1);
    assert_eq!(out.col("sum_v").unwrap().get_i64(0)?, 550);
    assert_eq!(out.col("count_v").unwrap().get_i64(0)?, 10);
    Ok(())
}

#[test]
fn parallel_group_matches_serial() -> Result<()> {
    let n = basalt::types::PARALLEL_THRESHOLD + 5;
    let ids: Vec<i64> = (0..n).map(|i| i % 7).collect();
    let vals: Vec<i64> = (0..n).collect();
    let expect: Vec<i64> = (0..7)
        .map(|k| (0..n).filter(|i| i % 7 == k).sum())
        .collect();
    let t = Value::table_from(
        &["id", "v"],
        vec![Value::i64_vec(&ids)?, Value::i64_vec(&vals)?],
    )?;
    let mut g = Graph::new(&t)?;
    let id = g.scan("id")?;
    let v = g.scan("v")?;
    let grp = g.group(&[id], &[(AggOp::Sum, v)])?;
    let root = g.optimize(grp)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 7);
    for k in 0..7 {
        assert_eq!(group_value(&out, "id", k, "sum_v")?, expect[k as usize]);
    }
    Ok(())
}

#[test]
fn retain_release_round_trip_leaves_rc_unchanged() -> Result<()> {
    let v = Value::i64_vec(&[1, 2, 3])?;
    let before = v.rc();
    let handle = v.clone();
    drop(handle);
    assert_eq!(v.rc(), before);
    Ok(())
}

#[test]
fn cow_on_shared_vector_yields_distinct_block() -> Result<()> {
    let v = Value::i64_vec(&[1, 2, 3])?;
    let shared = v.clone();
    assert_eq!(v.rc(), 2);
    let mut writable = shared;
    writable.set_i64(0, 99)?;
    // The write went to a fresh block; the original dropped back to rc 1.
    assert_eq!(v.rc(), 1);
    assert_eq!(writable.rc(), 1);
    assert_eq!(v.get_i64(0)?, 1);
    assert_eq!(writable.get_i64(0)?, 99);
    Ok(())
}

#[test]
fn division_always_promotes_to_float() -> Result<()> {
    let t = Value::table_from(&["a"], vec![Value::i64_vec(&[7, 8])?])?;
    let mut g = Graph::new(&t)?;
    let a = g.scan("a")?;
    let two = g.const_i64(2)?;
    let d = g.div(a, two)?;
    let out = g.execute(d)?;
    assert_eq!(out.tag(), TypeTag::F64 as i8);
    assert_eq!(out.get_f64(0)?, 3.5);
    assert_eq!(out.get_f64(1)?, 4.0);
    Ok(())
}

#[test]
fn head_and_tail_are_views() -> Result<()> {
    let t = sample_table()?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let h = g.head(tbl, 3)?;
    let out = g.execute(h)?;
    assert_eq!(out.nrows(), 3);
    assert_eq!(out.col("v").unwrap().get_i64(2)?, 30);

    let mut g2 = Graph::new(&t)?;
    let tbl2 = g2.const_table(t.clone())?;
    let tail = g2.tail(tbl2, 2)?;
    let out2 = g2.execute(tail)?;
    assert_eq!(out2.nrows(), 2);
    assert_eq!(out2.col("v").unwrap().get_i64(1)?, 100);
    Ok(())
}
